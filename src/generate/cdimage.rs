//! The `cdimage-*` generators: scan a directory of per-version cdimage
//! build subdirectories for a rootfs tarball, verify it against
//! `SHA256SUMS`, and either rewrite it (`cdimage-ubuntu`) or re-compress
//! it unchanged (`cdimage-custom`, `cdimage-device-raw`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tar::{Builder, EntryType, Header};

use crate::error::{Result, TreeError};
use crate::generate::{finalize_or_reuse, Env, GenContext};

fn ubuntu_arch(device_name: &str) -> &'static str {
    match device_name {
        "generic_x86" | "generic_i386" => "i386",
        "generic_amd64" | "azure_amd64" | "plano" => "amd64",
        "generic_arm64" | "frieza_arm64" => "arm64",
        _ => "armhf",
    }
}

fn device_raw_arch(device_name: &str) -> &'static str {
    match device_name {
        "generic_x86" | "generic_i386" => "i386",
        "generic_amd64" => "amd64",
        "azure_amd64" => "amd64.azure",
        "plano" => "amd64.plano",
        "raspi2_armhf" => "armhf.raspi2",
        "generic_arm64" => "arm64",
        _ => "armhf",
    }
}

/// Version subdirectories in cdimage publishing order, `pending`/`current`
/// excluded since they're symlinks to a real version, not one themselves.
fn list_versions(cdimage_path: &Path) -> Result<Vec<String>> {
    let mut versions = Vec::new();
    for entry in std::fs::read_dir(cdimage_path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "pending" || name == "current" {
            continue;
        }
        versions.push(name);
    }
    versions.sort();
    Ok(versions)
}

fn rootfs_sha256(version_dir: &Path, filename: &str) -> Result<Option<String>> {
    let sums_path = version_dir.join("SHA256SUMS");
    if !sums_path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&sums_path)?;
    Ok(crate::parser::sha256sums_lookup(&content, filename))
}

struct ScanHit {
    version: String,
    path: PathBuf,
    hash: String,
}

fn scan_for(
    cdimage_path: &Path,
    filename_for: impl Fn(&str) -> String,
    require_marked_good: bool,
) -> Result<Option<ScanHit>> {
    if !cdimage_path.exists() {
        return Err(TreeError::Network(format!(
            "cdimage directory not found: {}",
            cdimage_path.display()
        )));
    }
    for version in list_versions(cdimage_path)? {
        let version_dir = cdimage_path.join(&version);
        let filename = filename_for(&version);
        let candidate = version_dir.join(&filename);
        if !candidate.exists() {
            continue;
        }
        if require_marked_good && !version_dir.join(".marked_good").exists() {
            continue;
        }
        let Some(hash) = rootfs_sha256(&version_dir, &filename)? else {
            continue;
        };
        return Ok(Some(ScanHit {
            version,
            path: candidate,
            hash,
        }));
    }
    Ok(None)
}

pub fn generate_ubuntu(ctx: &GenContext, args: &BTreeMap<String, String>, env: &mut Env) -> Result<PathBuf> {
    let cdimage_path = PathBuf::from(
        args.get("path")
            .ok_or_else(|| TreeError::InvalidArgument("cdimage-ubuntu requires path=".into()))?,
    );
    let series = args
        .get("series")
        .ok_or_else(|| TreeError::InvalidArgument("cdimage-ubuntu requires series=".into()))?;
    let product = args.get("product").map(String::as_str).unwrap_or("touch");
    let good_only = args.get("import").map(String::as_str) == Some("good");
    let arch = ubuntu_arch(&env.device_name);

    let Some(hit) = scan_for(
        &cdimage_path,
        |_| format!("{series}-preinstalled-{product}-{arch}.tar.gz"),
        good_only,
    )?
    else {
        return Err(TreeError::Network("no matching cdimage-ubuntu rootfs found".into()));
    };

    let pool_name = format!("ubuntu-{}", hit.hash);
    env.version_detail.push(format!("ubuntu={}", hit.version));

    finalize_or_reuse(ctx, &pool_name, "cdimage-ubuntu", env, None, BTreeMap::new(), |scratch_tar| {
        rewrite_rootfs_tar(ctx, &hit.path, scratch_tar, product)
    })
}

pub fn generate_custom(ctx: &GenContext, args: &BTreeMap<String, String>, env: &mut Env) -> Result<PathBuf> {
    let cdimage_path = PathBuf::from(
        args.get("path")
            .ok_or_else(|| TreeError::InvalidArgument("cdimage-custom requires path=".into()))?,
    );
    let series = args
        .get("series")
        .ok_or_else(|| TreeError::InvalidArgument("cdimage-custom requires series=".into()))?;
    let product = args.get("product").map(String::as_str).unwrap_or("touch");
    let good_only = args.get("import").map(String::as_str) == Some("good");
    let arch = ubuntu_arch(&env.device_name);

    let Some(hit) = scan_for(
        &cdimage_path,
        |_| format!("{series}-preinstalled-{product}-{arch}.custom.tar.gz"),
        good_only,
    )?
    else {
        return Err(TreeError::Network("no matching cdimage-custom rootfs found".into()));
    };

    let pool_name = format!("custom-{}", hit.hash);
    env.version_detail.push(format!("custom={}", hit.version));
    finalize_or_reuse(ctx, &pool_name, "cdimage-custom", env, None, BTreeMap::new(), |scratch_tar| {
        ctx.codec.gzip_uncompress(&hit.path, scratch_tar)
    })
}

pub fn generate_device_raw(ctx: &GenContext, args: &BTreeMap<String, String>, env: &mut Env) -> Result<PathBuf> {
    let cdimage_path = PathBuf::from(
        args.get("path")
            .ok_or_else(|| TreeError::InvalidArgument("cdimage-device-raw requires path=".into()))?,
    );
    let series = args
        .get("series")
        .ok_or_else(|| TreeError::InvalidArgument("cdimage-device-raw requires series=".into()))?;
    let product = args.get("product").map(String::as_str).unwrap_or("core");
    let good_only = args.get("import").map(String::as_str) == Some("good");
    let arch = device_raw_arch(&env.device_name);

    let Some(hit) = scan_for(
        &cdimage_path,
        |_| format!("{series}-preinstalled-{product}-{arch}.device.tar.gz"),
        good_only,
    )?
    else {
        return Err(TreeError::Network("no matching cdimage-device-raw tarball found".into()));
    };

    let pool_name = format!("device-{}", hit.hash);
    env.version_detail.push(format!("device={}", hit.version));
    finalize_or_reuse(ctx, &pool_name, "cdimage-device-raw", env, None, BTreeMap::new(), |scratch_tar| {
        ctx.codec.gzip_uncompress(&hit.path, scratch_tar)
    })
}

/// Uncompresses a gzip rootfs tarball and rewrites it: drops
/// `SWAP.swap`/`etc/mtab`, prefixes every entry (and hardlink target) with
/// `system/`, and for touch/pd products synthesizes the android mount
/// points, the writable/userdata partition, `/etc/mtab`, and `lib/modules`.
pub fn rewrite_rootfs_tar(ctx: &GenContext, gzip_src: &Path, dst_tar: &Path, product: &str) -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let uncompressed = scratch.path().join("source.tar");
    ctx.codec.gzip_uncompress(gzip_src, &uncompressed)?;

    let source_file = std::fs::File::open(&uncompressed)?;
    let mut archive = tar::Archive::new(source_file);
    let dst_file = std::fs::File::create(dst_tar)?;
    let mut builder = Builder::new(dst_file);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        if path == "SWAP.swap" || path == "etc/mtab" {
            continue;
        }
        let mut header = entry.header().clone();
        let new_path = format!("system/{path}");
        header.set_path(&new_path)?;

        if header.entry_type() == EntryType::Link {
            if let Some(link) = entry.link_name()? {
                let new_link = format!("system/{}", link.to_string_lossy());
                header.set_link_name(&new_link)?;
            }
        }
        header.set_cksum();

        let mut buf = Vec::new();
        std::io::copy(&mut entry, &mut buf)?;
        builder.append(&header, buf.as_slice())?;
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    if matches!(product, "touch" | "pd") {
        append_dir(&mut builder, "system/android", 0o755, now)?;
        for subdir in ["cache", "data", "factory", "firmware", "persist", "system", "odm"] {
            append_symlink(&mut builder, &format!("system/{subdir}"), &format!("/android/{subdir}"), now)?;
        }
        append_symlink(&mut builder, "system/vendor", "/android/system/vendor", now)?;
    }

    if product == "core" {
        append_dir(&mut builder, "system/writable", 0o755, now)?;
    } else {
        append_dir(&mut builder, "system/userdata", 0o755, now)?;
    }

    append_symlink(&mut builder, "system/etc/mtab", "/proc/mounts", now)?;
    append_dir(&mut builder, "system/lib/modules", 0o755, now)?;

    builder.finish()?;
    Ok(())
}

fn append_dir<W: std::io::Write>(builder: &mut Builder<W>, path: &str, mode: u32, mtime: u64) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_path(path)?;
    header.set_size(0);
    header.set_mode(mode);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append(&header, std::io::empty())?;
    Ok(())
}

fn append_symlink<W: std::io::Write>(builder: &mut Builder<W>, path: &str, target: &str, mtime: u64) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Symlink);
    header.set_path(path)?;
    header.set_link_name(target)?;
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append(&header, std::io::empty())?;
    Ok(())
}

#[test]
fn test_ubuntu_arch_table() {
    assert_eq!(ubuntu_arch("generic_i386"), "i386");
    assert_eq!(ubuntu_arch("plano"), "amd64");
    assert_eq!(ubuntu_arch("frieza_arm64"), "arm64");
    assert_eq!(ubuntu_arch("krillin"), "armhf");
}

#[test]
fn test_device_raw_arch_table() {
    assert_eq!(device_raw_arch("azure_amd64"), "amd64.azure");
    assert_eq!(device_raw_arch("raspi2_armhf"), "armhf.raspi2");
    assert_eq!(device_raw_arch("vegetahd"), "armhf");
}
