//! On-disk catalog shapes.
//!
//! These mirror `channels.json` / `index.json` / pool `.json` sidecars byte
//! for byte, field for field. `BTreeMap` is used everywhere a JSON object
//! has dynamic keys so serialisation sorts them for free, satisfying the
//! byte-stability invariant without a custom formatter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root of `channels.json`: channel name to its record.
pub type ChannelsDoc = BTreeMap<String, Channel>;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Channel {
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DeviceEntry {
    pub index: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyring: Option<KeyringRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyringRef {
    pub path: String,
    pub signature: String,
}

/// Shape of a device's `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct IndexDoc {
    #[serde(default)]
    pub global: GlobalInfo,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct GlobalInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Full,
    Delta,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    #[serde(rename = "type")]
    pub image_type: ImageType,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<i64>,
    pub description: String,
    /// `description_<lang>` translations, merged in/out of the surrounding
    /// object by `#[serde(flatten)]` rather than nested under their own key.
    #[serde(flatten)]
    pub descriptions: BTreeMap<String, String>,
    pub files: Vec<FileRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootme: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minversion: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_detail: Option<String>,
    #[serde(rename = "phased-percentage", skip_serializing_if = "Option::is_none")]
    pub phased_percentage: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    pub order: i64,
    pub path: String,
    pub signature: String,
    pub checksum: String,
    pub size: u64,
}

/// A pool payload's `.json` sidecar: fixed leading fields plus whatever
/// generator-specific provenance the producing generator stashed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolMeta {
    pub generator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_detail: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[test]
fn test_channel_roundtrips_optional_fields() {
    let json = r#"{"devices":{},"hidden":true,"alias":"stable"}"#;
    let chan: Channel = serde_json::from_str(json).unwrap();
    assert_eq!(chan.alias.as_deref(), Some("stable"));
    assert_eq!(chan.hidden, Some(true));
    assert!(chan.redirect.is_none());
    let back = serde_json::to_string(&chan).unwrap();
    let reparsed: Channel = serde_json::from_str(&back).unwrap();
    assert_eq!(chan, reparsed);
}

#[test]
fn test_image_flattens_description_translations() {
    let json = r#"{"type":"full","version":1,"description":"hi","description_fr":"bonjour","files":[]}"#;
    let image: Image = serde_json::from_str(json).unwrap();
    assert_eq!(image.descriptions.get("description_fr").unwrap(), "bonjour");
    let back = serde_json::to_value(&image).unwrap();
    assert_eq!(back["description_fr"], "bonjour");
    assert!(back.get("descriptions").is_none());
}

#[test]
fn test_phased_percentage_omitted_when_absent() {
    let image = Image {
        image_type: ImageType::Full,
        version: 1,
        base: None,
        description: String::new(),
        descriptions: BTreeMap::new(),
        files: vec![],
        bootme: None,
        minversion: None,
        version_detail: None,
        phased_percentage: None,
    };
    let value = serde_json::to_value(&image).unwrap();
    assert!(value.get("phased-percentage").is_none());
}
