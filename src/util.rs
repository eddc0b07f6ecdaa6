//! Small helpers shared across the store, generators and delta engine.

use std::fs::Metadata;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

use faster_hex::hex_string;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::error::Result;

/// SHA-256 checksum of a stream, lower-case hex.
pub fn sha256sum<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(hex_string(&hasher.finalize()))
}

/// SHA-256 checksum of a file's current bytes.
pub fn sha256sum_file(path: &Path) -> Result<String> {
    let f = std::fs::File::open(path)?;
    sha256sum(f)
}

/// Renders an on-disk path as the tree-relative URL stored in a `FileRef`
/// (`/channel/device/payload.tar.xz`), falling back to the path's own
/// display form if it isn't actually under `base`.
pub fn tree_relative(base: &Path, path: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(rel) => format!("/{}", rel.display()),
        Err(_) => path.display().to_string(),
    }
}

pub fn mtime(stat: &Metadata) -> Result<u64> {
    Ok(stat
        .modified()?
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs())
}

/// `global.generated_at` stamp: `"Sun Jan 02 15:04:05 UTC 2006"`-shaped,
/// matching the format the on-device client parses when it has no RTC.
pub fn generated_at_now() -> String {
    format_generated_at(OffsetDateTime::now_utc())
}

pub fn format_generated_at(ts: OffsetDateTime) -> String {
    const WDAY: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    const MONTH: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let wday = WDAY[ts.weekday().number_days_from_monday() as usize];
    let month = MONTH[ts.month() as u8 as usize - 1];
    format!(
        "{} {} {:02} {:02}:{:02}:{:02} UTC {:04}",
        wday,
        month,
        ts.day(),
        ts.hour(),
        ts.minute(),
        ts.second(),
        ts.year()
    )
}

/// Splits a comma-joined `tag=value` provenance string into its entries.
pub fn split_version_detail(detail: &str) -> Vec<(String, String)> {
    detail
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Joins a list of `env.version_detail` tags into the comma-joined string
/// persisted on an image.
pub fn join_version_detail(tags: &[String]) -> String {
    tags.join(",")
}

/// Replace (or insert) the `tag=value` entry for `tag` in `detail`, or drop
/// it entirely when `value` is empty. Downstream consumers split on commas,
/// so this never needs the full parsed representation.
pub fn set_version_detail_tag(tags: &mut Vec<String>, tag: &str, value: &str) {
    tags.retain(|entry| !entry.starts_with(&format!("{tag}=")));
    if !value.is_empty() {
        tags.push(format!("{tag}={value}"));
    }
}

#[test]
fn test_generated_at_format() {
    use time::macros::datetime;
    let ts = datetime!(2021-07-14 10:54:24 UTC);
    assert_eq!(format_generated_at(ts), "Wed Jul 14 10:54:24 UTC 2021");
}

#[test]
fn test_version_detail_roundtrip() {
    let joined = join_version_detail(&["ubuntu=20210714".to_string(), "version=42".to_string()]);
    assert_eq!(joined, "ubuntu=20210714,version=42");
    let parsed = split_version_detail(&joined);
    assert_eq!(
        parsed,
        vec![
            ("ubuntu".to_string(), "20210714".to_string()),
            ("version".to_string(), "42".to_string())
        ]
    );
}

#[test]
fn test_set_version_detail_tag_replaces_and_clears() {
    let mut tags = vec!["ubuntu=1".to_string(), "keyring=k".to_string()];
    set_version_detail_tag(&mut tags, "ubuntu", "2");
    assert_eq!(tags, vec!["keyring=k".to_string(), "ubuntu=2".to_string()]);
    set_version_detail_tag(&mut tags, "keyring", "");
    assert_eq!(tags, vec!["ubuntu=2".to_string()]);
}
