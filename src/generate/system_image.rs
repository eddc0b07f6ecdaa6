//! The `system-image` and `remote-system-image` generators: cross-channel
//! (or cross-server) copy of an already-published full image file, matched
//! by filename prefix rather than regenerated.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TreeError};
use crate::generate::{Env, GenContext};
use crate::model::{ChannelsDoc, Image, ImageType, IndexDoc};

fn prefix_of(path: &str) -> &str {
    let filename = path.rsplit('/').next().unwrap_or(path);
    filename.rsplit_once('-').map(|(p, _)| p).unwrap_or(filename)
}

fn latest_full(index: &IndexDoc) -> Option<&Image> {
    index
        .images
        .iter()
        .filter(|i| i.image_type == ImageType::Full)
        .max_by_key(|i| i.version)
}

pub fn generate_local(ctx: &GenContext, args: &BTreeMap<String, String>, env: &mut Env) -> Result<PathBuf> {
    let src_channel = args
        .get("channel")
        .ok_or_else(|| TreeError::InvalidArgument("system-image requires channel=".into()))?;
    let src_device = args.get("device").unwrap_or(&env.device);
    let name = args
        .get("name")
        .ok_or_else(|| TreeError::InvalidArgument("system-image requires name=".into()))?;

    let index_path = ctx.base.join(src_channel).join(src_device).join("index.json");
    let raw = std::fs::read(&index_path)
        .map_err(|_| TreeError::NotFound(format!("index for {src_channel}/{src_device}")))?;
    let index: IndexDoc = serde_json::from_slice(&raw)?;

    let image = latest_full(&index)
        .ok_or_else(|| TreeError::NotFound(format!("no full image published for {src_channel}/{src_device}")))?;

    let file = image
        .files
        .iter()
        .find(|f| prefix_of(&f.path) == name)
        .ok_or_else(|| TreeError::NotFound(format!("no file matching prefix {name}")))?;

    env.version_detail.push(format!("{name}={}", image.version));
    Ok(ctx.base.join(file.path.trim_start_matches('/')))
}

pub fn generate_remote(ctx: &GenContext, args: &BTreeMap<String, String>, env: &mut Env) -> Result<PathBuf> {
    let server = args
        .get("url")
        .ok_or_else(|| TreeError::InvalidArgument("remote-system-image requires url=".into()))?
        .trim_end_matches('/');
    let src_channel = args
        .get("channel")
        .ok_or_else(|| TreeError::InvalidArgument("remote-system-image requires channel=".into()))?;
    let src_device = args.get("device").unwrap_or(&env.device);
    let name = args
        .get("name")
        .ok_or_else(|| TreeError::InvalidArgument("remote-system-image requires name=".into()))?;

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(20))
        .build()
        .map_err(|e| TreeError::Network(e.to_string()))?;

    let channels: ChannelsDoc = client
        .get(format!("{server}/channels.json"))
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.json())
        .map_err(|e| TreeError::Network(e.to_string()))?;

    let device_entry = channels
        .get(src_channel)
        .and_then(|c| c.devices.get(src_device))
        .ok_or_else(|| TreeError::Network(format!("remote has no device {src_channel}/{src_device}")))?;

    let index: IndexDoc = client
        .get(format!("{server}{}", device_entry.index))
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.json())
        .map_err(|e| TreeError::Network(e.to_string()))?;

    let image = latest_full(&index)
        .ok_or_else(|| TreeError::Network(format!("remote has no full image for {src_channel}/{src_device}")))?;

    let file = image
        .files
        .iter()
        .find(|f| prefix_of(&f.path) == *name)
        .ok_or_else(|| TreeError::Network(format!("remote has no file matching prefix {name}")))?;

    let dest = ctx.base.join(file.path.trim_start_matches('/'));
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !dest.exists() {
        download_to(&client, &format!("{server}{}", file.path), &dest)?;

        // A keyring= option means this image's embedded recovery keyring
        // must be swapped before it's trusted under this server's identity;
        // the repack changes the tar's bytes, so it is signed locally
        // afterwards instead of trusting the source server's signature.
        if let Some(keyring_name) = args.get("keyring") {
            let store = args
                .get("store")
                .map(PathBuf::from)
                .unwrap_or_else(|| ctx.base.join("gpg").join("keyrings"));
            let keyring_tar = store.join(format!("{keyring_name}.tar.xz"));
            let keyring_sig = store.join(format!("{keyring_name}.tar.xz.asc"));
            let device_family = args.get("device_family").unwrap_or(&env.device_name);
            crate::recovery::repack_recovery_keyring(
                ctx.codec,
                ctx.boot_tool,
                ctx.cpio_tool,
                &dest,
                &keyring_tar,
                &keyring_sig,
                device_family,
            )?;
            ctx.signer.sign(&dest)?;
        } else {
            download_to(&client, &format!("{server}{}", file.signature), &crate::sign::sibling_asc(&dest))?;
        }

        let json_src = file.path.replace(".tar.xz", ".json");
        let json_dst = dest.with_extension("json");
        if download_to(&client, &format!("{server}{json_src}"), &json_dst).is_ok() {
            ctx.signer.sign(&json_dst)?;
        }
    }

    env.version_detail.push(format!("{name}={}", image.version));
    Ok(dest)
}

fn download_to(client: &reqwest::blocking::Client, url: &str, dest: &std::path::Path) -> Result<()> {
    let bytes = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.bytes())
        .map_err(|e| TreeError::Network(e.to_string()))?;
    std::fs::write(dest, bytes)?;
    Ok(())
}

#[test]
fn test_prefix_of_splits_on_last_hyphen() {
    assert_eq!(prefix_of("/pool/ubuntu-abcdef.tar.xz"), "ubuntu");
    assert_eq!(prefix_of("/pool/device-raw-1234.tar.xz"), "device-raw");
}
