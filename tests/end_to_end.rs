//! End-to-end scenarios exercising the public `Tree`/`Device` API together,
//! the way a publish run, an alias sync, or a phased rollout actually would.

use imagetree::device::Device;
use imagetree::model::ImageType;
use imagetree::sign::{sibling_asc, NoopSigner};
use imagetree::store::with_channels;
use imagetree::tree::Tree;

fn write_signed(dir: &std::path::Path, name: &str, content: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    NoopSigner.sign(&path).unwrap();
    path
}

#[test]
fn fresh_publish_registers_channel_device_and_image() {
    let dir = tempfile::tempdir().unwrap();
    let tree = Tree::new(dir.path(), Box::new(NoopSigner));

    tree.create_channel("stable").unwrap();
    tree.create_device("stable", "phone").unwrap();

    let device_dir = dir.path().join("stable").join("phone");
    std::fs::create_dir_all(&device_dir).unwrap();
    let a = write_signed(&device_dir, "a.tar.xz", b"");
    let b = write_signed(&device_dir, "b.tar.xz", b"");

    let device = Device::new(dir.path(), &NoopSigner, "stable", "phone");
    device
        .create_image(ImageType::Full, 1, "fresh install", &[a, b], None, None, None, None)
        .unwrap();

    let doc = with_channels(dir.path(), &NoopSigner, false, |doc| Ok(doc.clone())).unwrap();
    let entry = &doc["stable"].devices["phone"];
    assert_eq!(entry.index, "/stable/phone/index.json");

    let image = device.get_image(ImageType::Full, 1, None).unwrap();
    assert_eq!(image.files.len(), 2);
    for file in &image.files {
        assert_eq!(
            file.checksum,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

#[test]
fn alias_sync_clones_image_under_its_own_version_tar() {
    let dir = tempfile::tempdir().unwrap();
    let tree = Tree::new(dir.path(), Box::new(NoopSigner));

    tree.create_channel("stable").unwrap();
    tree.create_device("stable", "phone").unwrap();

    let device_dir = dir.path().join("stable").join("phone");
    std::fs::create_dir_all(&device_dir).unwrap();
    let payload = write_signed(&device_dir, "full.tar.xz", b"");
    // A real publish always appends the `version` generator's output last
    // (src/main.rs's publish_one), so every image carries its own
    // version-stamp tar among its files.
    let version_tar = write_signed(&device_dir, "version-1234.tar.xz", b"");

    let device = Device::new(dir.path(), &NoopSigner, "stable", "phone");
    device
        .create_image(
            ImageType::Full,
            1234,
            "build",
            &[payload, version_tar],
            None,
            None,
            None,
            None,
        )
        .unwrap();
    device.set_phased_percentage(1234, 50).unwrap();

    tree.create_channel_alias("alpha", "stable").unwrap();

    let alpha_device = Device::new(dir.path(), &NoopSigner, "alpha", "phone");
    let aliased = alpha_device.get_image(ImageType::Full, 1234, None).unwrap();
    assert_eq!(aliased.phased_percentage, Some(50));

    let version_file = aliased
        .files
        .iter()
        .find(|f| f.path.contains("version-1234"))
        .expect("alias clone carries its own version tar entry");
    assert_eq!(version_file.path, "/alpha/phone/version-1234.tar.xz");

    let tar_path = dir.path().join("alpha").join("phone").join("version-1234.tar.xz");
    assert!(tar_path.is_file(), "regenerated version tar must exist on disk");
    assert!(sibling_asc(&tar_path).is_file());
}

#[test]
fn phased_percentage_resets_when_a_newer_version_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let device = Device::new(dir.path(), &NoopSigner, "stable", "phone");

    let a = write_signed(dir.path(), "v10.tar.xz", b"");
    device
        .create_image(ImageType::Full, 10, "d", &[a], None, None, None, None)
        .unwrap();
    device.set_phased_percentage(10, 50).unwrap();
    assert_eq!(device.get_phased_percentage(10).unwrap(), 50);

    let b = write_signed(dir.path(), "v11.tar.xz", b"");
    device
        .create_image(ImageType::Full, 11, "d", &[b], None, None, None, None)
        .unwrap();

    assert_eq!(device.get_phased_percentage(10).unwrap(), 100);
    assert_eq!(device.get_phased_percentage(11).unwrap(), 100);
    assert!(device.set_phased_percentage(10, 20).is_err());
}
