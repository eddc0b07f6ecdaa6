//! Recovery-keyring repack (§4.3.2): replaces the archive-master keyring
//! embedded in a pool-resident tar's recovery image with a caller-supplied
//! one, in place.

use std::io::Read;
use std::path::Path;

use crate::codec::{guess_compression, Codec, Compression};
use crate::error::{Result, TreeError};
use crate::external::{BootImageTool, CpioTool};

/// Device families whose recovery initrd is preceded by a 512-byte custom
/// header that must be preserved across the repack.
const HEADERED_FAMILIES: &[&str] = &["krillin", "vegetahd", "arale"];

const FORCED_BOOTSIZE: &str = "0x900000";

pub fn repack_recovery_keyring(
    codec: &dyn Codec,
    boot_tool: &dyn BootImageTool,
    cpio_tool: &dyn CpioTool,
    pool_tar: &Path,
    keyring_tar: &Path,
    keyring_sig: &Path,
    device_family: &str,
) -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let uncompressed = scratch.path().join("payload.tar");
    codec.xz_uncompress(pool_tar, &uncompressed)?;

    let recovery_img = extract_entry(&uncompressed, "partitions/recovery.img", scratch.path())?;
    let (_kernel, initrd, cfg) = boot_tool.split(&recovery_img, scratch.path())?;

    let header = if HEADERED_FAMILIES.contains(&device_family) {
        Some(split_off_header(&initrd)?)
    } else {
        None
    };

    let compression = guess_compression(&initrd)?;
    let cpio_path = scratch.path().join("initrd.cpio");
    match compression {
        Some(Compression::Gzip) => codec.gzip_uncompress(&initrd, &cpio_path)?,
        Some(Compression::Xz) => codec.xz_uncompress(&initrd, &cpio_path)?,
        None => {
            std::fs::copy(&initrd, &cpio_path)?;
        }
    }

    let cpio_dir = scratch.path().join("cpio");
    cpio_tool.unpack(&cpio_path, &cpio_dir)?;

    let keyring_dir = find_keyring_dir(&cpio_dir)?;
    std::fs::copy(keyring_tar, keyring_dir.join("archive-master.tar.xz"))?;
    std::fs::copy(keyring_sig, keyring_dir.join("archive-master.tar.xz.asc"))?;

    let repacked_cpio = scratch.path().join("repacked.cpio");
    cpio_tool.pack(&cpio_dir, &repacked_cpio)?;

    let recompressed_initrd = scratch.path().join("initrd.new");
    match compression {
        Some(Compression::Gzip) => codec.gzip_compress(&repacked_cpio, &recompressed_initrd)?,
        Some(Compression::Xz) => codec.xz_compress(&repacked_cpio, &recompressed_initrd)?,
        None => {
            std::fs::copy(&repacked_cpio, &recompressed_initrd)?;
        }
    }

    let final_initrd = if let Some(header_bytes) = header {
        reattach_header(&recompressed_initrd, &header_bytes)?
    } else {
        recompressed_initrd
    };

    force_bootsize(&cfg)?;
    boot_tool.rebuild(&recovery_img, &cfg, &final_initrd)?;

    replace_entry(&uncompressed, "partitions/recovery.img", &recovery_img)?;
    codec.xz_compress(&uncompressed, pool_tar)?;
    Ok(())
}

fn extract_entry(tar_path: &Path, entry_name: &str, scratch: &Path) -> Result<std::path::PathBuf> {
    let f = std::fs::File::open(tar_path)?;
    let mut archive = tar::Archive::new(f);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == entry_name {
            let out = scratch.join("recovery.img");
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            std::fs::write(&out, buf)?;
            return Ok(out);
        }
    }
    Err(TreeError::NotFound(format!("{entry_name} not present in tar")))
}

fn replace_entry(tar_path: &Path, entry_name: &str, new_content_path: &Path) -> Result<()> {
    let scratch_out = tar_path.with_extension("tar.rewrite");
    {
        let src = std::fs::File::open(tar_path)?;
        let mut archive = tar::Archive::new(src);
        let dst = std::fs::File::create(&scratch_out)?;
        let mut builder = tar::Builder::new(dst);
        let replacement = std::fs::read(new_content_path)?;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            if path == entry_name {
                let mut header = entry.header().clone();
                header.set_size(replacement.len() as u64);
                header.set_cksum();
                builder.append(&header, replacement.as_slice())?;
            } else {
                let header = entry.header().clone();
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                builder.append(&header, buf.as_slice())?;
            }
        }
        builder.finish()?;
    }
    std::fs::rename(&scratch_out, tar_path)?;
    Ok(())
}

fn find_keyring_dir(cpio_dir: &Path) -> Result<std::path::PathBuf> {
    for candidate in ["usr/share/system-image", "etc/system-image"] {
        let dir = cpio_dir.join(candidate);
        if dir.join("archive-master.tar.xz").exists() {
            return Ok(dir);
        }
    }
    Err(TreeError::NotFound(
        "archive-master.tar.xz not found under usr/share/system-image or etc/system-image".into(),
    ))
}

fn split_off_header(initrd: &Path) -> Result<Vec<u8>> {
    let mut f = std::fs::File::open(initrd)?;
    let mut header = vec![0u8; 512];
    f.read_exact(&mut header)?;
    let mut rest = Vec::new();
    f.read_to_end(&mut rest)?;
    std::fs::write(initrd, rest)?;
    Ok(header)
}

fn reattach_header(initrd: &Path, header: &[u8]) -> Result<std::path::PathBuf> {
    let body = std::fs::read(initrd)?;
    let out = initrd.with_extension("headered");
    let mut combined = Vec::with_capacity(header.len() + body.len());
    combined.extend_from_slice(header);
    combined.extend_from_slice(&body);
    std::fs::write(&out, combined)?;
    Ok(out)
}

fn force_bootsize(cfg: &Path) -> Result<()> {
    let content = std::fs::read_to_string(cfg).unwrap_or_default();
    let mut lines: Vec<String> = content
        .lines()
        .filter(|l| !l.trim_start().starts_with("bootsize"))
        .map(str::to_string)
        .collect();
    lines.push(format!("bootsize={FORCED_BOOTSIZE}"));
    std::fs::write(cfg, lines.join("\n") + "\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, SubprocessCodec};
    use crate::external::NoopBootImageTool;
    use std::sync::{Arc, Mutex};

    /// Fabricates a cpio layout carrying a preexisting archive-master
    /// keyring, the way a real initrd's cpio would already have one for
    /// `repack_recovery_keyring` to find and replace, and records what it's
    /// asked to pack back up so the test can confirm the swap happened.
    struct FakeCpioTool {
        packed_keyring: Arc<Mutex<Option<Vec<u8>>>>,
    }

    impl CpioTool for FakeCpioTool {
        fn unpack(&self, _archive: &Path, into_dir: &Path) -> Result<()> {
            let keyring_dir = into_dir.join("usr/share/system-image");
            std::fs::create_dir_all(&keyring_dir)?;
            std::fs::write(keyring_dir.join("archive-master.tar.xz"), b"old-keyring")?;
            std::fs::write(keyring_dir.join("archive-master.tar.xz.asc"), b"old-sig")?;
            Ok(())
        }

        fn pack(&self, from_dir: &Path, archive: &Path) -> Result<()> {
            let swapped = std::fs::read(from_dir.join("usr/share/system-image/archive-master.tar.xz"))?;
            *self.packed_keyring.lock().unwrap() = Some(swapped);
            std::fs::write(archive, b"repacked-cpio")?;
            Ok(())
        }
    }

    #[test]
    fn test_repack_recovery_keyring_swaps_archive_master() {
        let dir = tempfile::tempdir().unwrap();

        let scratch_tar = dir.path().join("payload.tar");
        {
            let f = std::fs::File::create(&scratch_tar).unwrap();
            let mut builder = tar::Builder::new(f);
            let mut header = tar::Header::new_gnu();
            header.set_path("partitions/recovery.img").unwrap();
            header.set_size(0);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, std::io::empty()).unwrap();
            builder.finish().unwrap();
        }
        let pool_tar = dir.path().join("pool-entry.tar.xz");
        SubprocessCodec.xz_compress(&scratch_tar, &pool_tar).unwrap();

        let keyring_tar = dir.path().join("new-keyring.tar.xz");
        let keyring_sig = dir.path().join("new-keyring.tar.xz.asc");
        std::fs::write(&keyring_tar, b"new-keyring-bytes").unwrap();
        std::fs::write(&keyring_sig, b"new-sig-bytes").unwrap();

        let packed_keyring = Arc::new(Mutex::new(None));
        let cpio_tool = FakeCpioTool {
            packed_keyring: packed_keyring.clone(),
        };

        repack_recovery_keyring(
            &SubprocessCodec,
            &NoopBootImageTool,
            &cpio_tool,
            &pool_tar,
            &keyring_tar,
            &keyring_sig,
            "generic",
        )
        .unwrap();

        assert_eq!(
            packed_keyring.lock().unwrap().as_deref(),
            Some(b"new-keyring-bytes".as_slice()),
            "repack must swap in the caller-supplied keyring before packing the cpio back up"
        );
        assert!(pool_tar.is_file());
    }
}
