//! The publication tree: `channels.json` plus per-device `index.json`
//! catalogs, and the higher-level operations layered on top of the
//! transactional store in [`crate::store`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Result, TreeError};
use crate::model::{Channel, ChannelsDoc, DeviceEntry, IndexDoc, KeyringRef};
use crate::sign::Signer;
use crate::store::{with_channels, with_index};

pub struct Tree {
    base: PathBuf,
    signer: Box<dyn Signer>,
}

impl Tree {
    pub fn new(base: impl Into<PathBuf>, signer: Box<dyn Signer>) -> Self {
        Tree {
            base: base.into(),
            signer,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn index_path(&self, channel: &str, device: &str) -> PathBuf {
        self.base.join(channel).join(device).join("index.json")
    }

    fn index_url(channel: &str, device: &str) -> String {
        format!("/{channel}/{device}/index.json")
    }

    fn with_channels<F, R>(&self, commit: bool, f: F) -> Result<R>
    where
        F: FnOnce(&mut ChannelsDoc) -> Result<R>,
    {
        with_channels(&self.base, self.signer.as_ref(), commit, f)
    }

    fn with_index<F, R>(&self, channel: &str, device: &str, commit: bool, f: F) -> Result<R>
    where
        F: FnOnce(&mut IndexDoc) -> Result<R>,
    {
        with_index(&self.index_path(channel, device), self.signer.as_ref(), commit, f)
    }

    // -- Channel lifecycle --------------------------------------------

    pub fn create_channel(&self, name: &str) -> Result<()> {
        self.with_channels(true, |doc| {
            if doc.contains_key(name) {
                return Err(TreeError::Conflict(format!("channel {name} already exists")));
            }
            doc.insert(name.to_string(), Channel::default());
            Ok(())
        })
    }

    pub fn remove_channel(&self, name: &str) -> Result<()> {
        let channel = self.with_channels(true, |doc| {
            let channel = doc
                .remove(name)
                .ok_or_else(|| TreeError::NotFound(format!("channel {name}")))?;
            Ok(channel)
        })?;

        if channel.alias.is_none() && channel.redirect.is_none() {
            let dir = self.base.join(name);
            if dir.is_dir() {
                std::fs::remove_dir_all(dir)?;
            }
        }
        self.cleanup_device_redirects(name, None)?;
        Ok(())
    }

    pub fn rename_channel(&self, old: &str, new: &str) -> Result<()> {
        self.with_channels(true, |doc| {
            if !doc.contains_key(old) {
                return Err(TreeError::NotFound(format!("channel {old}")));
            }
            if doc.contains_key(new) {
                return Err(TreeError::Conflict(format!("channel {new} already exists")));
            }
            Ok(())
        })?;

        let old_dir = self.base.join(old);
        let new_dir = self.base.join(new);
        if old_dir.is_dir() {
            if let Some(parent) = new_dir.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&old_dir, &new_dir)?;
        }

        let old_prefix = format!("/{old}/");
        let new_prefix = format!("/{new}/");

        self.with_channels(true, |doc| {
            let mut channel = doc
                .remove(old)
                .ok_or_else(|| TreeError::NotFound(format!("channel {old}")))?;
            for device in channel.devices.values_mut() {
                device.index = rewrite_prefix(&device.index, &old_prefix, &new_prefix);
            }
            doc.insert(new.to_string(), channel.clone());

            for other in doc.values_mut() {
                if other.redirect.as_deref() == Some(old) {
                    other.redirect = Some(new.to_string());
                }
                for entry in other.devices.values_mut() {
                    if entry.redirect.as_deref() == Some(old) {
                        entry.redirect = Some(new.to_string());
                    }
                }
            }

            let devices: Vec<String> = channel.devices.keys().cloned().collect();
            drop(channel);
            for device in devices {
                let path = self.index_path(new, &device);
                if !path.exists() {
                    continue;
                }
                with_index(&path, self.signer.as_ref(), true, |index| {
                    for image in index.images.iter_mut() {
                        for file in image.files.iter_mut() {
                            file.path = rewrite_prefix(&file.path, &old_prefix, &new_prefix);
                            file.signature = rewrite_prefix(&file.signature, &old_prefix, &new_prefix);
                        }
                    }
                    Ok(())
                })?;
            }
            Ok(())
        })
    }

    pub fn hide_channel(&self, name: &str) -> Result<()> {
        self.set_hidden(name, true)
    }

    pub fn show_channel(&self, name: &str) -> Result<()> {
        self.set_hidden(name, false)
    }

    fn set_hidden(&self, name: &str, hidden: bool) -> Result<()> {
        self.with_channels(true, |doc| {
            let channel = doc
                .get_mut(name)
                .ok_or_else(|| TreeError::NotFound(format!("channel {name}")))?;
            channel.hidden = if hidden { Some(true) } else { None };
            Ok(())
        })
    }

    // -- Device lifecycle -----------------------------------------------

    pub fn create_device(&self, channel: &str, device: &str) -> Result<()> {
        self.with_channels(true, |doc| {
            let chan = doc
                .get_mut(channel)
                .ok_or_else(|| TreeError::NotFound(format!("channel {channel}")))?;
            if chan.devices.contains_key(device) {
                return Err(TreeError::Conflict(format!("device {device} already exists")));
            }
            chan.devices.insert(
                device.to_string(),
                DeviceEntry {
                    index: Self::index_url(channel, device),
                    keyring: None,
                    redirect: None,
                },
            );
            Ok(())
        })
    }

    pub fn remove_device(&self, channel: &str, device: &str) -> Result<()> {
        let entry = self.with_channels(true, |doc| {
            let chan = doc
                .get_mut(channel)
                .ok_or_else(|| TreeError::NotFound(format!("channel {channel}")))?;
            let entry = chan
                .devices
                .remove(device)
                .ok_or_else(|| TreeError::NotFound(format!("device {device}")))?;
            Ok(entry)
        })?;

        if entry.redirect.is_none() {
            let dir = self.base.join(channel).join(device);
            if dir.is_dir() {
                std::fs::remove_dir_all(dir)?;
            }
        }
        self.cleanup_device_redirects(channel, Some(device))?;
        Ok(())
    }

    pub fn set_device_keyring(&self, channel: &str, device: &str, keyring: KeyringRef) -> Result<()> {
        self.with_channels(true, |doc| {
            let chan = doc
                .get_mut(channel)
                .ok_or_else(|| TreeError::NotFound(format!("channel {channel}")))?;
            let entry = chan
                .devices
                .get_mut(device)
                .ok_or_else(|| TreeError::NotFound(format!("device {device}")))?;
            entry.keyring = Some(keyring);
            Ok(())
        })
    }

    // -- Alias / redirect relationships ---------------------------------

    pub fn create_channel_alias(&self, alias: &str, target: &str) -> Result<()> {
        self.with_channels(true, |doc| {
            if !doc.contains_key(target) {
                return Err(TreeError::NotFound(format!("alias target {target}")));
            }
            if doc.contains_key(alias) {
                return Err(TreeError::Conflict(format!("channel {alias} already exists")));
            }
            doc.insert(
                alias.to_string(),
                Channel {
                    devices: Default::default(),
                    hidden: None,
                    alias: Some(target.to_string()),
                    redirect: None,
                },
            );
            Ok(())
        })?;
        self.sync_alias(alias)
    }

    pub fn create_channel_redirect(&self, redirect: &str, target: &str) -> Result<()> {
        self.with_channels(true, |doc| {
            let target_devices = doc
                .get(target)
                .ok_or_else(|| TreeError::NotFound(format!("redirect target {target}")))?
                .devices
                .clone();
            if doc.contains_key(redirect) {
                return Err(TreeError::Conflict(format!("channel {redirect} already exists")));
            }
            doc.insert(
                redirect.to_string(),
                Channel {
                    devices: target_devices,
                    hidden: Some(true),
                    alias: None,
                    redirect: Some(target.to_string()),
                },
            );
            Ok(())
        })
    }

    pub fn create_per_device_channel_redirect(&self, device: &str, channel: &str, target: &str) -> Result<()> {
        self.with_channels(true, |doc| {
            let target_entry = doc
                .get(target)
                .and_then(|c| c.devices.get(device))
                .cloned()
                .ok_or_else(|| TreeError::NotFound(format!("device {device} in {target}")))?;
            let chan = doc
                .get_mut(channel)
                .ok_or_else(|| TreeError::NotFound(format!("channel {channel}")))?;
            chan.devices.insert(
                device.to_string(),
                DeviceEntry {
                    index: target_entry.index,
                    keyring: target_entry.keyring,
                    redirect: Some(target.to_string()),
                },
            );
            Ok(())
        })
    }

    /// Reconciles an alias channel with its target device-for-device.
    pub fn sync_alias(&self, alias: &str) -> Result<()> {
        let (target, alias_devices, target_devices) = self.with_channels(false, |doc| {
            let alias_chan = doc
                .get(alias)
                .ok_or_else(|| TreeError::NotFound(format!("channel {alias}")))?;
            let target = alias_chan
                .alias
                .clone()
                .ok_or_else(|| TreeError::InvalidArgument(format!("{alias} is not an alias channel")))?;
            let target_chan = doc
                .get(&target)
                .ok_or_else(|| TreeError::NotFound(format!("alias target {target}")))?;
            Ok((
                target,
                alias_chan.devices.keys().cloned().collect::<BTreeSet<_>>(),
                target_chan.devices.keys().cloned().collect::<BTreeSet<_>>(),
            ))
        })?;

        for device in alias_devices.difference(&target_devices) {
            self.remove_device(alias, device)?;
        }
        for device in target_devices.difference(&alias_devices) {
            self.create_device(alias, device)?;
        }

        for device in &target_devices {
            self.sync_alias_device(alias, &target, device)?;
        }
        Ok(())
    }

    fn sync_alias_device(&self, alias: &str, target: &str, device: &str) -> Result<()> {
        let target_index = self.with_index(target, device, false, |doc| Ok(doc.clone()))?;

        let ctx = crate::generate::GenContext {
            base: self.base(),
            signer: self.signer.as_ref(),
            codec: &crate::codec::SubprocessCodec,
            public_fqdn: String::new(),
            http_port: None,
            https_port: None,
            boot_tool: &crate::external::NoopBootImageTool,
            cpio_tool: &crate::external::NoopCpioTool,
        };

        self.with_index(alias, device, true, |alias_index| {
            let target_keys: BTreeSet<(i64, i64, &'static str)> = target_index
                .images
                .iter()
                .map(|i| triple(i))
                .collect();
            let alias_keys: BTreeSet<(i64, i64, &'static str)> = alias_index
                .images
                .iter()
                .map(|i| triple(i))
                .collect();

            alias_index
                .images
                .retain(|image| target_keys.contains(&triple(image)));

            for (order, image) in target_index.images.iter().enumerate() {
                let key = triple(image);
                if alias_keys.contains(&key) {
                    continue;
                }
                let mut cloned = image.clone();
                let (detail, tar_path) = crate::generate::version::regenerate_for_alias(
                    &ctx,
                    alias,
                    device,
                    target,
                    &cloned,
                )?;
                cloned.version_detail = detail;

                let stem = format!("version-{}.tar", cloned.version);
                if let Some(file) = cloned.files.iter_mut().find(|f| {
                    Path::new(&f.path)
                        .file_name()
                        .and_then(|s| s.to_str())
                        .is_some_and(|name| name.starts_with(&stem))
                }) {
                    let asc = crate::sign::sibling_asc(&tar_path);
                    file.path = crate::util::tree_relative(self.base(), &tar_path);
                    file.signature = crate::util::tree_relative(self.base(), &asc);
                    file.checksum = crate::util::sha256sum_file(&tar_path)?;
                    file.size = tar_path.metadata()?.len();
                }

                let insert_at = order.min(alias_index.images.len());
                alias_index.images.insert(insert_at, cloned);
            }

            if let Some(max) = target_index.images.iter().map(|i| i.version).max() {
                let phased = target_index
                    .images
                    .iter()
                    .find(|i| i.version == max)
                    .and_then(|i| i.phased_percentage);
                if let Some(latest) = alias_index.images.iter_mut().find(|i| i.version == max) {
                    latest.phased_percentage = phased;
                }
            }
            Ok(())
        })
    }

    pub fn sync_aliases(&self, name: &str) -> Result<()> {
        let aliasing = self.with_channels(false, |doc| {
            Ok(doc
                .iter()
                .filter(|(_, c)| c.alias.as_deref() == Some(name) && c.redirect.is_none())
                .map(|(n, _)| n.clone())
                .collect::<Vec<_>>())
        })?;
        for alias in aliasing {
            self.sync_alias(&alias)?;
        }
        Ok(())
    }

    pub fn sync_redirects(&self, name: &str) -> Result<()> {
        let redirecting = self.with_channels(false, |doc| {
            Ok(doc
                .iter()
                .filter(|(_, c)| c.redirect.as_deref() == Some(name))
                .map(|(n, _)| n.clone())
                .collect::<Vec<_>>())
        })?;
        for redirect in redirecting {
            self.with_channels(true, |doc| {
                let target_devices = doc
                    .get(name)
                    .ok_or_else(|| TreeError::NotFound(format!("redirect target {name}")))?
                    .devices
                    .clone();
                let chan = doc
                    .get_mut(&redirect)
                    .ok_or_else(|| TreeError::NotFound(format!("channel {redirect}")))?;
                chan.devices = target_devices;
                Ok(())
            })?;
        }
        Ok(())
    }

    pub fn cleanup_device_redirects(&self, channel: &str, device: Option<&str>) -> Result<()> {
        self.with_channels(true, |doc| {
            for chan in doc.values_mut() {
                chan.devices.retain(|dev_name, entry| {
                    let matches_channel = entry.redirect.as_deref() == Some(channel);
                    let matches_device = device.map_or(true, |d| d == dev_name);
                    !(matches_channel && matches_device)
                });
            }
            Ok(())
        })
    }

    // -- Orphan reclamation ----------------------------------------------

    pub fn list_missing_files(&self) -> Result<Vec<PathBuf>> {
        let referenced = self.referenced_paths()?;
        Ok(referenced
            .into_iter()
            .filter(|p| !p.exists())
            .collect())
    }

    pub fn list_orphaned_files(&self) -> Result<Vec<PathBuf>> {
        let referenced: BTreeSet<PathBuf> = self
            .referenced_paths()?
            .into_iter()
            .map(|p| p.canonicalize().unwrap_or(p))
            .collect();

        let mut orphans = Vec::new();
        for entry in WalkDir::new(&self.base).min_depth(1) {
            let entry = entry.map_err(|e| TreeError::External(e.to_string()))?;
            let path = entry.path();
            if path.starts_with(self.base.join("gpg")) {
                continue;
            }
            let canon = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
            if entry.file_type().is_dir() {
                if WalkDir::new(path).min_depth(1).into_iter().next().is_none() {
                    orphans.push(path.to_path_buf());
                }
                continue;
            }
            if referenced.contains(&canon) {
                continue;
            }
            if let Some(sibling) = json_sibling_tar(path) {
                if referenced.contains(&sibling) {
                    continue;
                }
            }
            orphans.push(path.to_path_buf());
        }
        Ok(orphans)
    }

    /// Removing a file can leave its parent directory newly empty, which
    /// `list_orphaned_files` would only report on a later scan — loop until
    /// a pass removes nothing, so a single `cleanup_tree()` call reclaims
    /// every orphan, not just the ones empty at the first scan.
    pub fn cleanup_tree(&self) -> Result<()> {
        loop {
            let orphans = self.list_orphaned_files()?;
            if orphans.is_empty() {
                return Ok(());
            }
            for path in orphans {
                if path.is_dir() {
                    let _ = std::fs::remove_dir(&path);
                } else {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }

    fn referenced_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let channels_path = self.base.join("channels.json");
        if channels_path.exists() {
            paths.push(channels_path.clone());
            paths.push(asc(&channels_path));
        }

        let doc = self.with_channels(false, |doc| Ok(doc.clone()))?;
        for channel in doc.values() {
            for entry in channel.devices.values() {
                if entry.redirect.is_some() {
                    continue;
                }
                let index_path = self.base.join(entry.index.trim_start_matches('/'));
                paths.push(index_path.clone());
                paths.push(asc(&index_path));

                if let Some(keyring) = &entry.keyring {
                    paths.push(self.base.join(keyring.path.trim_start_matches('/')));
                    paths.push(self.base.join(keyring.signature.trim_start_matches('/')));
                }

                if let Ok(index) = with_index(&index_path, self.signer.as_ref(), false, |d| Ok(d.clone())) {
                    for image in index.images {
                        for file in image.files {
                            paths.push(self.base.join(file.path.trim_start_matches('/')));
                            paths.push(self.base.join(file.signature.trim_start_matches('/')));
                        }
                    }
                }
            }
        }
        Ok(paths)
    }

    /// Emergency rebuild of `channels.json` from what's on disk: walks
    /// channel/device directories and re-derives keyring references from
    /// `device.tar.xz{,.asc}` presence. Requires the caller to pass back
    /// the literal confirmation string `"yes-regenerate"` as a guard
    /// against accidental use.
    pub fn generate_index(&self, magic: &str) -> Result<()> {
        if magic != "yes-regenerate" {
            return Err(TreeError::InvalidArgument(
                "generate_index requires confirmation".into(),
            ));
        }
        self.with_channels(true, |doc| {
            for entry in std::fs::read_dir(&self.base)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let channel_name = entry.file_name().to_string_lossy().into_owned();
                if channel_name == "pool" || channel_name == "gpg" {
                    continue;
                }
                let channel = doc.entry(channel_name.clone()).or_default();
                for device_entry in std::fs::read_dir(entry.path())? {
                    let device_entry = device_entry?;
                    if !device_entry.file_type()?.is_dir() {
                        continue;
                    }
                    let device_name = device_entry.file_name().to_string_lossy().into_owned();
                    let keyring_path = device_entry.path().join("device.tar.xz");
                    let keyring = if keyring_path.exists() && asc(&keyring_path).exists() {
                        Some(KeyringRef {
                            path: format!("/{channel_name}/{device_name}/device.tar.xz"),
                            signature: format!("/{channel_name}/{device_name}/device.tar.xz.asc"),
                        })
                    } else {
                        None
                    };
                    channel.devices.entry(device_name.clone()).or_insert(DeviceEntry {
                        index: Self::index_url(&channel_name, &device_name),
                        keyring,
                        redirect: None,
                    });
                }
            }
            Ok(())
        })
    }
}

fn triple(image: &crate::model::Image) -> (i64, i64, &'static str) {
    let kind = match image.image_type {
        crate::model::ImageType::Full => "full",
        crate::model::ImageType::Delta => "delta",
    };
    (image.version, image.base.unwrap_or(-1), kind)
}

fn rewrite_prefix(value: &str, old_prefix: &str, new_prefix: &str) -> String {
    if let Some(rest) = value.strip_prefix(old_prefix) {
        format!("{new_prefix}{rest}")
    } else {
        value.to_string()
    }
}

fn asc(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".asc");
    PathBuf::from(s)
}

fn json_sibling_tar(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".json.asc").or_else(|| name.strip_suffix(".json"))?;
    Some(path.with_file_name(format!("{stem}.tar.xz")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::NoopSigner;

    fn tree(dir: &std::path::Path) -> Tree {
        Tree::new(dir.to_path_buf(), Box::new(NoopSigner))
    }

    #[test]
    fn test_create_channel_then_duplicate_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        t.create_channel("stable").unwrap();
        let err = t.create_channel("stable").unwrap_err();
        assert!(matches!(err, TreeError::Conflict(_)));
    }

    #[test]
    fn test_create_device_then_remove_deletes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        t.create_channel("stable").unwrap();
        t.create_device("stable", "phone").unwrap();
        std::fs::create_dir_all(dir.path().join("stable/phone")).unwrap();
        std::fs::write(dir.path().join("stable/phone/index.json"), b"{}").unwrap();
        t.remove_device("stable", "phone").unwrap();
        assert!(!dir.path().join("stable/phone").exists());
    }

    #[test]
    fn test_orphan_gc_removes_stray_file_and_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        t.create_channel("stable").unwrap();
        std::fs::create_dir_all(dir.path().join("rubbish")).unwrap();
        std::fs::write(dir.path().join("stray"), b"x").unwrap();

        let orphans = t.list_orphaned_files().unwrap();
        assert!(orphans.iter().any(|p| p.ends_with("stray")));
        assert!(orphans.iter().any(|p| p.ends_with("rubbish")));

        t.cleanup_tree().unwrap();
        assert!(!dir.path().join("rubbish").exists());
        assert!(!dir.path().join("stray").exists());
    }
}
