//! TOML configuration for the publication driver: where the tree lives,
//! the public-facing service parameters baked into `channel.ini`, and the
//! per-channel/device generator pipelines §4.3 dispatches.

use std::{collections::BTreeMap, fs::File, io::Read, path::Path};

use anyhow::Result;
use log::warn;
use serde::Deserialize;

#[derive(Deserialize, Clone)]
pub struct ServerConfig {
    /// base directory of the published tree (`channels.json`, `pool/`, …)
    pub path: String,
    /// `channel.ini`'s `base:` field
    pub public_fqdn: String,
    #[serde(default)]
    pub http_port: Option<u16>,
    #[serde(default)]
    pub https_port: Option<u16>,
    /// path to an OpenPGP certificate carrying a secret signing key; a
    /// missing value falls back to [`crate::sign::NoopSigner`], which is
    /// only appropriate for tests and local dry runs
    #[serde(default)]
    pub signing_key: Option<String>,
    /// how many full images `expire` keeps by default when a channel's
    /// pipeline config omits its own `keep_full`
    #[serde(default = "default_keep_full")]
    pub default_keep_full: usize,
}

fn default_keep_full() -> usize {
    2
}

#[derive(Deserialize, Clone)]
pub struct GeneratorConfig {
    pub generator: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

/// One `[[channel]]` table: everything `publish` needs to run one
/// publication cycle for a `(channel, device)` pair.
#[derive(Deserialize, Clone)]
pub struct ChannelConfig {
    pub channel: String,
    pub device: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(rename = "type", default = "default_image_type")]
    pub image_type: String,
    pub version: i64,
    #[serde(default)]
    pub base: Option<i64>,
    #[serde(default)]
    pub minversion: Option<i64>,
    #[serde(default)]
    pub bootme: Option<bool>,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "generator", default)]
    pub generators: Vec<GeneratorConfig>,
    #[serde(default)]
    pub keep_full: Option<usize>,
}

fn default_image_type() -> String {
    "full".to_string()
}

#[derive(Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(rename = "channel", default)]
    pub channels: Vec<ChannelConfig>,
}

pub fn parse_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let mut f = File::open(path)?;
    let mut content = String::new();
    content.reserve(1024);
    f.read_to_string(&mut content)?;
    Ok(toml::from_str(&content)?)
}

pub fn lint_config(config: &Config) {
    if config.channels.is_empty() {
        warn!("no [[channel]] pipelines configured; `publish` will do nothing");
    }
    for ch in &config.channels {
        if ch.generators.is_empty() {
            warn!(
                "channel {} device {} has no generators configured",
                ch.channel, ch.device
            );
        }
        if ch.image_type == "delta" && ch.base.is_none() {
            warn!(
                "channel {} device {} is a delta pipeline with no base= set",
                ch.channel, ch.device
            );
        }
    }
    if config.server.signing_key.is_none() {
        warn!("no signing_key configured; falling back to the no-op signer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[server]
path = "/srv/tree"
public_fqdn = "system-image.example.org"

[[channel]]
channel = "stable"
device = "phone"
version = 1
description = "fresh publish"

[[channel.generator]]
generator = "http"
args = { name = "rootfs", url = "https://example.org/rootfs.tar" }
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.path, "/srv/tree");
        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.channels[0].generators.len(), 1);
        assert_eq!(config.channels[0].image_type, "full");
    }
}
