//! Per-device image operations (§4.5), layered on a device's `index.json`
//! transaction.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Result, TreeError};
use crate::model::{FileRef, Image, ImageType};
use crate::sign::Signer;
use crate::store::with_index;
use crate::util::{sha256sum_file, tree_relative};

/// A handle onto one `(channel, device)` pair's image index. Borrows
/// nothing from [`crate::tree::Tree`] beyond its base path and signer, so
/// it can be constructed freely from tree operations or the CLI.
pub struct Device<'a> {
    base: &'a Path,
    signer: &'a dyn Signer,
    channel: String,
    device: String,
}

impl<'a> Device<'a> {
    pub fn new(base: &'a Path, signer: &'a dyn Signer, channel: impl Into<String>, device: impl Into<String>) -> Self {
        Device {
            base,
            signer,
            channel: channel.into(),
            device: device.into(),
        }
    }

    fn index_path(&self) -> std::path::PathBuf {
        self.base.join(&self.channel).join(&self.device).join("index.json")
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_image(
        &self,
        image_type: ImageType,
        version: i64,
        description: &str,
        paths: &[std::path::PathBuf],
        base: Option<i64>,
        bootme: Option<bool>,
        minversion: Option<i64>,
        version_detail: Option<String>,
    ) -> Result<()> {
        if paths.is_empty() {
            return Err(TreeError::InvalidArgument("create_image requires a non-empty paths list".into()));
        }
        match image_type {
            ImageType::Delta if base.is_none() => {
                return Err(TreeError::InvalidArgument("delta image requires base".into()));
            }
            ImageType::Full if base.is_some() => {
                return Err(TreeError::InvalidArgument("full image must not specify base".into()));
            }
            _ => {}
        }
        if image_type == ImageType::Delta && minversion.is_some() {
            return Err(TreeError::InvalidArgument("delta image must not specify minversion".into()));
        }

        let mut files = Vec::with_capacity(paths.len());
        for (order, path) in paths.iter().enumerate() {
            let asc = crate::sign::sibling_asc(path);
            if !path.exists() || !asc.exists() {
                return Err(TreeError::NotFound(format!("{} or its signature", path.display())));
            }
            let checksum = sha256sum_file(path)?;
            let size = path.metadata()?.len();
            files.push(FileRef {
                order: order as i64,
                path: tree_relative(self.base, path),
                signature: tree_relative(self.base, &asc),
                checksum,
                size,
            });
        }

        with_index(&self.index_path(), self.signer, true, |index| {
            let conflict = index.images.iter().any(|i| {
                i.image_type == image_type && i.version == version && i.base == base
            });
            if conflict {
                return Err(TreeError::Conflict(format!(
                    "image {:?} version {version} base {base:?} already exists",
                    image_type
                )));
            }
            index.images.push(Image {
                image_type,
                version,
                base,
                description: description.to_string(),
                descriptions: BTreeMap::new(),
                files: files.clone(),
                bootme,
                minversion,
                version_detail: version_detail.clone(),
                phased_percentage: None,
            });
            Ok(())
        })
    }

    pub fn get_image(&self, image_type: ImageType, version: i64, base: Option<i64>) -> Result<Image> {
        with_index(&self.index_path(), self.signer, false, |index| {
            let mut matches = index
                .images
                .iter()
                .filter(|i| i.image_type == image_type && i.version == version && i.base == base);
            let first = matches.next().cloned();
            if matches.next().is_some() {
                return Err(TreeError::Conflict("ambiguous image lookup: multiple matches".into()));
            }
            first.ok_or_else(|| TreeError::NotFound(format!("image {image_type:?} version {version}")))
        })
    }

    pub fn remove_image(&self, image_type: ImageType, version: i64, base: Option<i64>) -> Result<()> {
        with_index(&self.index_path(), self.signer, true, |index| {
            let before = index.images.len();
            index
                .images
                .retain(|i| !(i.image_type == image_type && i.version == version && i.base == base));
            if index.images.len() == before {
                return Err(TreeError::NotFound(format!("image {image_type:?} version {version}")));
            }
            Ok(())
        })
    }

    pub fn set_description(&self, version: i64, description: &str, translations: &BTreeMap<String, String>) -> Result<()> {
        with_index(&self.index_path(), self.signer, true, |index| {
            let image = index
                .images
                .iter_mut()
                .find(|i| i.version == version)
                .ok_or_else(|| TreeError::NotFound(format!("image version {version}")))?;
            image.description = description.to_string();
            for (lang, text) in translations {
                image.descriptions.insert(format!("description_{lang}"), text.clone());
            }
            Ok(())
        })
    }

    /// `p == 100` is stored as absence of the attribute; anything else in
    /// `0..=100` is stored literally. The version must be the maximum in
    /// the index.
    pub fn set_phased_percentage(&self, version: i64, percentage: u32) -> Result<()> {
        if percentage > 100 {
            return Err(TreeError::InvalidArgument("phased-percentage must be 0..=100".into()));
        }
        with_index(&self.index_path(), self.signer, true, |index| {
            let max_version = index.images.iter().map(|i| i.version).max();
            if max_version != Some(version) {
                return Err(TreeError::InvalidArgument(format!(
                    "version {version} is not the latest image"
                )));
            }
            let image = index
                .images
                .iter_mut()
                .find(|i| i.version == version)
                .ok_or_else(|| TreeError::NotFound(format!("image version {version}")))?;
            image.phased_percentage = if percentage == 100 { None } else { Some(percentage as u8) };
            Ok(())
        })
    }

    pub fn get_phased_percentage(&self, version: i64) -> Result<u32> {
        with_index(&self.index_path(), self.signer, false, |index| {
            let image = index
                .images
                .iter()
                .find(|i| i.version == version)
                .ok_or_else(|| TreeError::NotFound(format!("image version {version}")))?;
            Ok(image.phased_percentage.map(u32::from).unwrap_or(100))
        })
    }

    /// Keeps the newest `keep` full images by version, removes older
    /// fulls, and removes any delta whose `version` or `base` fell out.
    pub fn expire_images(&self, keep: usize) -> Result<()> {
        with_index(&self.index_path(), self.signer, true, |index| {
            let mut full_versions: Vec<i64> = index
                .images
                .iter()
                .filter(|i| i.image_type == ImageType::Full)
                .map(|i| i.version)
                .collect();
            full_versions.sort_unstable();
            full_versions.reverse();

            if full_versions.len() <= keep {
                return Ok(());
            }

            let kept: std::collections::BTreeSet<i64> = full_versions.into_iter().take(keep).collect();

            index.images.retain(|image| match image.image_type {
                ImageType::Full => kept.contains(&image.version),
                ImageType::Delta => kept.contains(&image.version) && image.base.map_or(true, |b| kept.contains(&b)),
            });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::NoopSigner;

    fn write_payload(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        NoopSigner.sign(&path).unwrap();
        path
    }

    #[test]
    fn test_create_image_rejects_delta_without_base() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::new(dir.path(), &NoopSigner, "stable", "phone");
        let path = write_payload(dir.path(), "payload.tar.xz");
        let err = device
            .create_image(ImageType::Delta, 2, "d", &[path], None, None, None, None)
            .unwrap_err();
        assert!(matches!(err, TreeError::InvalidArgument(_)));
    }

    #[test]
    fn test_fresh_publish_records_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::new(dir.path(), &NoopSigner, "stable", "phone");
        let a = write_payload(dir.path(), "a.tar.xz");
        let b = write_payload(dir.path(), "b.tar.xz");
        device
            .create_image(ImageType::Full, 1, "fresh", &[a, b], None, None, None, None)
            .unwrap();

        let image = device.get_image(ImageType::Full, 1, None).unwrap();
        assert_eq!(image.files.len(), 2);
        assert_eq!(
            image.files[0].checksum,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_set_phased_percentage_100_clears_attribute() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::new(dir.path(), &NoopSigner, "stable", "phone");
        let a = write_payload(dir.path(), "a.tar.xz");
        device
            .create_image(ImageType::Full, 1, "d", &[a], None, None, None, None)
            .unwrap();
        device.set_phased_percentage(1, 100).unwrap();
        assert_eq!(device.get_phased_percentage(1).unwrap(), 100);
    }

    #[test]
    fn test_expire_images_keeps_newest_and_their_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::new(dir.path(), &NoopSigner, "stable", "phone");
        for v in 1..=4 {
            let f = write_payload(dir.path(), &format!("full-{v}.tar.xz"));
            device
                .create_image(ImageType::Full, v, "d", &[f], None, None, None, None)
                .unwrap();
        }
        for (base, version) in [(1, 2), (1, 3), (2, 3), (1, 4), (2, 4), (3, 4)] {
            let f = write_payload(dir.path(), &format!("delta-{base}-{version}.tar.xz"));
            device
                .create_image(ImageType::Delta, version, "d", &[f], Some(base), None, None, None)
                .unwrap();
        }

        device.expire_images(2).unwrap();

        let index = with_index(&device.index_path(), &NoopSigner, false, |d| Ok(d.clone())).unwrap();
        assert_eq!(index.images.len(), 3);
    }
}
