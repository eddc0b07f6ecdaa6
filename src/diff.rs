//! The binary delta engine (§4.4): given two uncompressed tars `S` and
//! `T`, emits a third tar `D` containing a `removed` manifest followed by
//! every entry that is new or changed in `T`, in sorted path order, with
//! hardlink targets hoisted ahead of their links when both changed.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tar::{EntryType, Header};

use crate::error::Result;
use crate::generate::GenContext;
use crate::model::PoolMeta;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Dir,
    File,
}

/// `(mode, devmajor, devminor, typeflag, uid, gid, size, mtime)`, all as
/// strings, matching the fingerprint the original tool hashed tar entries
/// with. Empty for directories.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint(Vec<String>);

impl Fingerprint {
    fn typeflag(&self) -> &str {
        &self.0[3]
    }
}

struct TarImage {
    /// Raw entries in on-disk order: header plus body bytes (empty for
    /// directories, symlinks, and hardlinks, which carry no payload).
    entries: Vec<(Header, Vec<u8>)>,
    index_by_path: BTreeMap<String, usize>,
}

impl TarImage {
    fn load(path: &Path) -> Result<TarImage> {
        let f = std::fs::File::open(path)?;
        let mut archive = tar::Archive::new(f);
        let mut entries = Vec::new();
        let mut index_by_path = BTreeMap::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            let header = entry.header().clone();
            let mut body = Vec::new();
            if header.entry_type().is_file() {
                entry.read_to_end(&mut body)?;
            }
            index_by_path.insert(path, entries.len());
            entries.push((header, body));
        }
        Ok(TarImage { entries, index_by_path })
    }

    fn header(&self, path: &str) -> Option<&Header> {
        self.index_by_path.get(path).map(|&i| &self.entries[i].0)
    }

    fn body(&self, path: &str) -> Option<&[u8]> {
        self.index_by_path.get(path).map(|&i| self.entries[i].1.as_slice())
    }

    fn kind(&self, path: &str) -> Option<Kind> {
        self.header(path).map(|h| if h.entry_type().is_dir() { Kind::Dir } else { Kind::File })
    }

    fn fingerprint(&self, path: &str) -> Option<Fingerprint> {
        let h = self.header(path)?;
        if h.entry_type().is_dir() {
            return Some(Fingerprint(Vec::new()));
        }
        let typeflag = (h.entry_type().as_byte() as char).to_string();
        Some(Fingerprint(vec![
            h.mode().unwrap_or(0).to_string(),
            h.device_major().ok().flatten().unwrap_or(0).to_string(),
            h.device_minor().ok().flatten().unwrap_or(0).to_string(),
            typeflag,
            h.uid().unwrap_or(0).to_string(),
            h.gid().unwrap_or(0).to_string(),
            h.size().unwrap_or(0).to_string(),
            h.mtime().unwrap_or(0).to_string(),
        ]))
    }

    fn linkname(&self, path: &str) -> Option<String> {
        self.header(path)
            .and_then(|h| h.link_name().ok().flatten())
            .map(|l| l.to_string_lossy().into_owned())
    }

    /// Resolves a hardlink's target path, per the rule that a `system/`
    /// prefixed target is absolute within the image and anything else is
    /// relative to the link's own directory.
    fn resolve_link_target(&self, link_path: &str, linkname: &str) -> String {
        if linkname.starts_with("system/") {
            return linkname.to_string();
        }
        let dir = match link_path.rsplit_once('/') {
            Some((d, _)) => d,
            None => "",
        };
        normalize_path(&format!("{dir}/{linkname}"))
    }

    /// Bytes to use when comparing this path's content against the other
    /// image: a hardlink's comparable bytes are its resolved target's
    /// body, not its own (empty) body.
    fn comparable_bytes(&self, path: &str) -> Option<&[u8]> {
        let fp = self.fingerprint(path)?;
        if fp.typeflag() == "1" {
            let linkname = self.linkname(path)?;
            let target = self.resolve_link_target(path, &linkname);
            self.body(&target)
        } else {
            self.body(path)
        }
    }
}

fn normalize_path(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                out.pop();
            }
            p => out.push(p),
        }
    }
    out.join("/")
}

/// Mirrors the source's `compare_files`: two absent streams compare equal.
fn compare_opt_bytes(a: Option<&[u8]>, b: Option<&[u8]>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(_), None) | (None, Some(_)) => false,
        (Some(a), Some(b)) => a == b,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Change {
    Add,
    Del,
    Mod,
}

/// Computes the set of changed paths between `source` and `target`.
fn compare_images(source: &TarImage, target: &TarImage) -> BTreeMap<String, Change> {
    let mut changes = BTreeMap::new();
    let mut all_paths: BTreeSet<&String> = source.index_by_path.keys().collect();
    all_paths.extend(target.index_by_path.keys());

    for path in all_paths {
        let in_source = source.index_by_path.contains_key(path);
        let in_target = target.index_by_path.contains_key(path);
        match (in_source, in_target) {
            (false, true) => {
                changes.insert(path.clone(), Change::Add);
            }
            (true, false) => {
                changes.insert(path.clone(), Change::Del);
            }
            (true, true) => {
                let fs = source.fingerprint(path);
                let ft = target.fingerprint(path);
                if fs != ft {
                    changes.insert(path.clone(), Change::Mod);
                } else if fs.as_ref().map(|f| f.typeflag()) == Some("1") {
                    // Hardlink target propagation: re-emit unconditionally as a
                    // candidate even when the link's own fingerprint is
                    // unchanged, since its target may have moved under it.
                    changes.insert(path.clone(), Change::Mod);
                }
            }
            (false, false) => unreachable!(),
        }
    }

    suppress_false_positives(source, target, &mut changes);
    changes
}

fn suppress_false_positives(source: &TarImage, target: &TarImage, changes: &mut BTreeMap<String, Change>) {
    let candidates: Vec<String> = changes
        .iter()
        .filter(|(_, c)| **c == Change::Mod)
        .map(|(p, _)| p.clone())
        .collect();

    for path in candidates {
        let (Some(fs), Some(ft)) = (source.fingerprint(&path), target.fingerprint(&path)) else {
            continue;
        };
        if fs.0.is_empty() || ft.0.is_empty() {
            continue;
        }

        let switched_hardlink = fs.0[0] == ft.0[0]
            && fs.0[1] == ft.0[1]
            && fs.0[3] != ft.0[3]
            && (fs.0[3] == "1" || ft.0[3] == "1")
            && fs.0[4] == ft.0[4]
            && fs.0[7] == ft.0[7];

        if switched_hardlink {
            if compare_opt_bytes(source.comparable_bytes(&path), target.comparable_bytes(&path)) {
                changes.remove(&path);
            }
            continue;
        }

        let attrs_match_excluding_mtime = fs.0[0..7] == ft.0[0..7];
        if !attrs_match_excluding_mtime {
            continue;
        }

        if fs.typeflag() == "2" && ft.typeflag() == "2" {
            if source.linkname(&path) == target.linkname(&path) {
                changes.remove(&path);
            }
            continue;
        }

        let is_regular = |t: &str| t == "0" || t == "\0";
        if is_regular(fs.typeflag()) && is_regular(ft.typeflag()) {
            if compare_opt_bytes(source.comparable_bytes(&path), target.comparable_bytes(&path)) {
                changes.remove(&path);
            }
        }
    }
}

/// Computes `D = delta(S, T)` and writes it to `dst`.
pub fn generate_delta(source_tar: &Path, target_tar: &Path, dst: &Path) -> Result<()> {
    let source = TarImage::load(source_tar)?;
    let target = TarImage::load(target_tar)?;
    let changes = compare_images(&source, &target);

    let mut removed_sorted: Vec<&String> = changes
        .iter()
        .filter(|(_, c)| matches!(c, Change::Del | Change::Mod))
        .map(|(p, _)| p)
        .collect();
    removed_sorted.sort();

    let f = std::fs::File::create(dst)?;
    let mut builder = tar::Builder::new(f);

    let mut body = removed_sorted
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    let mut header = Header::new_gnu();
    header.set_path("removed")?;
    header.set_size(body.len() as u64);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(0o644);
    header.set_mtime(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    );
    header.set_cksum();
    builder.append(&header, body.as_bytes())?;

    let mut to_emit: Vec<String> = changes
        .iter()
        .filter(|(_, c)| matches!(c, Change::Add | Change::Mod))
        .map(|(p, _)| p.clone())
        .collect();
    to_emit.sort();

    let to_emit_set: BTreeSet<String> = to_emit.iter().cloned().collect();
    let mut written: BTreeSet<String> = BTreeSet::new();

    fn emit_one(
        path: &str,
        target: &TarImage,
        to_emit_set: &BTreeSet<String>,
        written: &mut BTreeSet<String>,
        builder: &mut tar::Builder<std::fs::File>,
    ) -> Result<()> {
        if written.contains(path) {
            return Ok(());
        }
        let Some(header) = target.header(path) else {
            return Ok(());
        };
        if header.entry_type().as_byte() as char == '1' {
            if let Some(linkname) = target.linkname(path) {
                let resolved = target.resolve_link_target(path, &linkname);
                if to_emit_set.contains(&resolved) && !written.contains(&resolved) {
                    emit_one(&resolved, target, to_emit_set, written, builder)?;
                }
            }
        }
        let mut header = header.clone();
        header.set_cksum();
        let body = target.body(path).unwrap_or(&[]);
        builder.append(&header, body)?;
        written.insert(path.to_string());
        Ok(())
    }

    for path in &to_emit {
        emit_one(path, &target, &to_emit_set, &mut written, &mut builder)?;
    }

    builder.finish()?;
    Ok(())
}

fn pool_stem(tar_xz: &Path) -> String {
    tar_xz
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
        .trim_end_matches(".tar.xz")
        .to_string()
}

fn is_already_minimal(stem: &str) -> bool {
    stem.starts_with("version-") || stem.starts_with("keyring-") || stem.starts_with("boot-")
}

fn read_pool_meta_value(tar_xz: &Path) -> Option<Value> {
    let json_path = tar_xz.with_extension("").with_extension("json");
    let raw = std::fs::read(json_path).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// `generate_delta(source.tar.xz, target.tar.xz) -> pool/<targetstem>.delta-<sourcestem>.tar.xz`.
/// Short-circuits to `target` unchanged when both payloads are already
/// minimal (`version-`/`keyring-`/`boot-` stems); otherwise runs the delta
/// engine on uncompressed copies in a scratch directory and records the
/// source/target JSON siblings in the resulting pool metadata.
pub fn pool_delta(ctx: &GenContext, source_tar_xz: &Path, target_tar_xz: &Path) -> Result<PathBuf> {
    let source_stem = pool_stem(source_tar_xz);
    let target_stem = pool_stem(target_tar_xz);

    if is_already_minimal(&source_stem) && is_already_minimal(&target_stem) {
        return Ok(target_tar_xz.to_path_buf());
    }

    let pool_name = format!("{target_stem}.delta-{source_stem}");
    let tar_path = ctx.pool_tar_path(&pool_name);
    let json_path = ctx.pool_json_path(&pool_name);
    if tar_path.exists() {
        return Ok(tar_path);
    }

    let scratch = tempfile::tempdir()?;
    let source_uncompressed = scratch.path().join("source.tar");
    let target_uncompressed = scratch.path().join("target.tar");
    let delta_uncompressed = scratch.path().join("delta.tar");
    ctx.codec.xz_uncompress(source_tar_xz, &source_uncompressed)?;
    ctx.codec.xz_uncompress(target_tar_xz, &target_uncompressed)?;
    generate_delta(&source_uncompressed, &target_uncompressed, &delta_uncompressed)?;

    std::fs::create_dir_all(ctx.pool_dir())?;
    ctx.codec.xz_compress(&delta_uncompressed, &tar_path)?;
    ctx.signer.sign(&tar_path)?;

    let mut extra = BTreeMap::new();
    if let Some(source_meta) = read_pool_meta_value(source_tar_xz) {
        extra.insert("source".to_string(), source_meta);
    }
    if let Some(target_meta) = read_pool_meta_value(target_tar_xz) {
        extra.insert("target".to_string(), target_meta);
    }
    let meta = PoolMeta {
        generator: "delta".to_string(),
        version: None,
        version_detail: None,
        extra,
    };
    let bytes = serde_json::to_vec_pretty(&meta)?;
    std::fs::write(&json_path, &bytes)?;
    ctx.signer.sign(&json_path)?;

    Ok(tar_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tar(path: &Path, entries: &[(&str, EntryType, &[u8], Option<&str>)]) {
        let f = std::fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(f);
        for (name, kind, content, link) in entries {
            let mut header = Header::new_gnu();
            header.set_entry_type(*kind);
            header.set_path(name).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            if let Some(link) = link {
                header.set_link_name(link).unwrap();
            }
            header.set_cksum();
            builder.append(&header, *content).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn test_mtime_only_change_yields_empty_change_set() {
        let dir = tempfile::tempdir().unwrap();
        let s = dir.path().join("s.tar");
        let t = dir.path().join("t.tar");

        let f = std::fs::File::create(&s).unwrap();
        let mut b = tar::Builder::new(f);
        let mut h = Header::new_gnu();
        h.set_path("a").unwrap();
        h.set_size(1);
        h.set_mode(0o644);
        h.set_mtime(0);
        h.set_cksum();
        b.append(&h, b"X" as &[u8]).unwrap();
        b.finish().unwrap();

        let f = std::fs::File::create(&t).unwrap();
        let mut b = tar::Builder::new(f);
        let mut h = Header::new_gnu();
        h.set_path("a").unwrap();
        h.set_size(1);
        h.set_mode(0o644);
        h.set_mtime(100);
        h.set_cksum();
        b.append(&h, b"X" as &[u8]).unwrap();
        b.finish().unwrap();

        let source = TarImage::load(&s).unwrap();
        let target = TarImage::load(&t).unwrap();
        let changes = compare_images(&source, &target);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_delta_of_simple_tar_with_hardlink() {
        let dir = tempfile::tempdir().unwrap();
        let s = dir.path().join("s.tar");
        let t = dir.path().join("t.tar");
        let d = dir.path().join("d.tar");

        write_tar(
            &s,
            &[
                ("a", EntryType::Regular, b"XXXX", None),
                ("b", EntryType::Link, b"", Some("a")),
            ],
        );
        write_tar(
            &t,
            &[
                ("a", EntryType::Regular, b"YYYYY", None),
                ("b", EntryType::Link, b"", Some("a")),
            ],
        );

        generate_delta(&s, &t, &d).unwrap();

        let f = std::fs::File::open(&d).unwrap();
        let mut archive = tar::Archive::new(f);
        let mut entries = archive.entries().unwrap();

        let mut removed_entry = entries.next().unwrap().unwrap();
        assert_eq!(removed_entry.path().unwrap().to_str().unwrap(), "removed");
        let mut removed_body = String::new();
        removed_entry.read_to_string(&mut removed_body).unwrap();
        assert_eq!(removed_body, "a\nb\n");

        let names: Vec<String> = {
            let f = std::fs::File::open(&d).unwrap();
            let mut archive = tar::Archive::new(f);
            archive
                .entries()
                .unwrap()
                .skip(1)
                .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
                .collect()
        };
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
    }

    #[test]
    fn test_compare_opt_bytes_both_none_is_equal() {
        assert!(compare_opt_bytes(None, None));
        assert!(!compare_opt_bytes(Some(b"x"), None));
    }

    #[test]
    fn test_pool_delta_short_circuits_on_minimal_stems() {
        use crate::codec::SubprocessCodec;
        use crate::external::{NoopBootImageTool, NoopCpioTool};
        use crate::sign::NoopSigner;

        let dir = tempfile::tempdir().unwrap();
        let ctx = GenContext {
            base: dir.path(),
            signer: &NoopSigner,
            codec: &SubprocessCodec,
            public_fqdn: String::new(),
            http_port: None,
            https_port: None,
            boot_tool: &NoopBootImageTool,
            cpio_tool: &NoopCpioTool,
        };
        let source = dir.path().join("version-1.tar.xz");
        let target = dir.path().join("version-2.tar.xz");
        std::fs::write(&source, b"").unwrap();
        std::fs::write(&target, b"").unwrap();

        let result = pool_delta(&ctx, &source, &target).unwrap();
        assert_eq!(result, target);
    }

    #[test]
    fn test_pool_stem_strips_tar_xz_suffix() {
        assert_eq!(pool_stem(Path::new("/pool/ubuntu-abcdef.tar.xz")), "ubuntu-abcdef");
        assert_eq!(pool_stem(Path::new("/pool/keyring-123.tar.xz")), "keyring-123");
    }
}
