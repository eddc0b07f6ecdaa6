//! Transactional rewrite discipline for `channels.json` and every
//! per-device `index.json`.
//!
//! Both documents go through the same entry/mutate/exit dance: read (or
//! default), hand the caller a mutable in-memory object, and on exit —
//! only if the caller asked to commit and something actually changed —
//! serialise with sorted keys, write to `<path>.new`, sign it, then swap
//! both files into place in an order that never leaves an unsigned or
//! half-written pair readable.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TreeError};
use crate::model::{ChannelsDoc, IndexDoc};
use crate::sign::Signer;
use crate::util::generated_at_now;

fn read_existing<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read(path)?;
    let value: serde_json::Value = serde_json::from_slice(&raw)?;
    if !value.is_object() {
        return Err(TreeError::Corrupt {
            path: path.to_path_buf(),
            reason: "top-level JSON value is not an object".into(),
        });
    }
    let doc: T = serde_json::from_value(value)?;
    Ok(Some(doc))
}

/// Byte-stable pretty encoding: sorted keys (via `BTreeMap`/default
/// `serde_json::Map`), two-space indent, `", "`/`": "` separators.
fn encode<T: Serialize>(doc: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(doc)?;
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"  ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    serde::Serialize::serialize(&value, &mut ser).map_err(TreeError::Json)?;
    Ok(buf)
}

/// Writes `<path>.new`, signs it, then performs the crash-safe swap:
/// delete old `.asc`, rename new `.asc` in, delete old body, rename new
/// body in. A crash between any two steps leaves either the pre- or
/// post-image readable, never a mismatched pair silently served.
fn commit_bytes(path: &Path, signer: &dyn Signer, bytes: &[u8]) -> Result<()> {
    let new_path = sibling_new(path);
    std::fs::write(&new_path, bytes)?;
    signer.sign(&new_path)?;

    let asc_path = asc_of(path);
    let new_asc_path = asc_of(&new_path);

    if asc_path.exists() {
        std::fs::remove_file(&asc_path)?;
    }
    std::fs::rename(&new_asc_path, &asc_path)?;

    if path.exists() {
        std::fs::remove_file(path)?;
    }
    std::fs::rename(&new_path, path)?;
    Ok(())
}

fn sibling_new(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".new");
    PathBuf::from(s)
}

fn asc_of(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".asc");
    PathBuf::from(s)
}

/// Scoped transaction over `channels.json`.
pub fn with_channels<F, R>(base: &Path, signer: &dyn Signer, commit: bool, f: F) -> Result<R>
where
    F: FnOnce(&mut ChannelsDoc) -> Result<R>,
{
    let path = base.join("channels.json");
    let existed = path.exists();
    let mut doc: ChannelsDoc = read_existing(&path)?.unwrap_or_default();
    let snapshot = doc.clone();

    let result = f(&mut doc)?;

    if commit && (doc != snapshot || !existed) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = encode(&doc)?;
        commit_bytes(&path, signer, &bytes)?;
    }
    Ok(result)
}

/// Scoped transaction over a device's `index.json`.
pub fn with_index<F, R>(index_path: &Path, signer: &dyn Signer, commit: bool, f: F) -> Result<R>
where
    F: FnOnce(&mut IndexDoc) -> Result<R>,
{
    let existed = index_path.exists();
    let mut doc: IndexDoc = read_existing(index_path)?.unwrap_or_default();
    let snapshot = doc.clone();

    let result = f(&mut doc)?;

    if commit && (doc != snapshot || !existed) {
        doc.global.generated_at = Some(generated_at_now());
        strip_phased_percentage_from_non_latest(&mut doc);

        if let Some(parent) = index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = encode(&doc)?;
        commit_bytes(index_path, signer, &bytes)?;
    }
    Ok(result)
}

/// At most one image may carry `phased-percentage`, and it must be the
/// record with the maximum version. Enforced here rather than at mutation
/// time so every caller of `with_index` gets it for free.
fn strip_phased_percentage_from_non_latest(doc: &mut IndexDoc) {
    let Some(max_version) = doc.images.iter().map(|i| i.version).max() else {
        return;
    };
    for image in doc.images.iter_mut() {
        if image.version != max_version {
            image.phased_percentage = None;
        }
    }
}

#[cfg(test)]
mod default_shapes {
    use super::*;

    #[test]
    fn test_missing_channels_defaults_to_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let doc: ChannelsDoc = read_existing(&dir.path().join("channels.json"))
            .unwrap()
            .unwrap_or_default();
        assert!(doc.is_empty());
    }

    #[test]
    fn test_corrupt_top_level_array_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        std::fs::write(&path, b"[]").unwrap();
        let err = read_existing::<ChannelsDoc>(&path).unwrap_err();
        assert!(matches!(err, TreeError::Corrupt { .. }));
    }
}

#[test]
fn test_with_channels_skips_commit_on_pure_read() {
    use crate::sign::NoopSigner;
    let dir = tempfile::tempdir().unwrap();
    with_channels(dir.path(), &NoopSigner, true, |doc| {
        doc.insert("stable".to_string(), Default::default());
        Ok(())
    })
    .unwrap();
    let path = dir.path().join("channels.json");
    let before = std::fs::read(&path).unwrap();

    with_channels(dir.path(), &NoopSigner, true, |_doc| Ok(())).unwrap();
    let after = std::fs::read(&path).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_with_index_strips_phased_percentage_from_non_latest() {
    use crate::model::{Image, ImageType};
    use crate::sign::NoopSigner;
    use std::collections::BTreeMap;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.json");
    with_index(&path, &NoopSigner, true, |doc| {
        doc.images.push(Image {
            image_type: ImageType::Full,
            version: 10,
            base: None,
            description: "v10".into(),
            descriptions: BTreeMap::new(),
            files: vec![],
            bootme: None,
            minversion: None,
            version_detail: None,
            phased_percentage: Some(50),
        });
        doc.images.push(Image {
            image_type: ImageType::Full,
            version: 11,
            base: None,
            description: "v11".into(),
            descriptions: BTreeMap::new(),
            files: vec![],
            bootme: None,
            minversion: None,
            version_detail: None,
            phased_percentage: None,
        });
        Ok(())
    })
    .unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let parsed: IndexDoc = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed.images[0].phased_percentage, None);
    assert!(parsed.global.generated_at.is_some());
}
