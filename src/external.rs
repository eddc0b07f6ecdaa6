//! Trait boundaries for the subprocess tools the recovery-keyring repack
//! shells out to. Real implementations are out of scope; the core only
//! needs something it can call through.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Splits/rebuilds an Android boot/recovery image.
pub trait BootImageTool: Send + Sync {
    fn split(&self, img: &Path, out_dir: &Path) -> Result<(PathBuf, PathBuf, PathBuf)>;
    fn rebuild(&self, img: &Path, cfg: &Path, initrd: &Path) -> Result<()>;
}

/// Unpacks/repacks a cpio archive under `fakeroot`, preserving ownership
/// bits a normal unprivileged unpack would lose.
pub trait CpioTool: Send + Sync {
    fn unpack(&self, archive: &Path, into_dir: &Path) -> Result<()>;
    fn pack(&self, from_dir: &Path, archive: &Path) -> Result<()>;
}

/// No-op stand-ins for tests: `split` and `unpack` fabricate an empty
/// scratch layout, `rebuild`/`pack` do nothing. Exercises the call
/// sequence in [`crate::recovery`] without a real boot image.
pub struct NoopBootImageTool;

impl BootImageTool for NoopBootImageTool {
    fn split(&self, _img: &Path, out_dir: &Path) -> Result<(PathBuf, PathBuf, PathBuf)> {
        let kernel = out_dir.join("kernel");
        let initrd = out_dir.join("initrd");
        let cfg = out_dir.join("bootimg.cfg");
        std::fs::write(&kernel, b"")?;
        std::fs::write(&initrd, b"")?;
        std::fs::write(&cfg, b"")?;
        Ok((kernel, initrd, cfg))
    }

    fn rebuild(&self, _img: &Path, _cfg: &Path, _initrd: &Path) -> Result<()> {
        Ok(())
    }
}

pub struct NoopCpioTool;

impl CpioTool for NoopCpioTool {
    fn unpack(&self, _archive: &Path, into_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(into_dir)?;
        Ok(())
    }

    fn pack(&self, _from_dir: &Path, archive: &Path) -> Result<()> {
        std::fs::write(archive, b"")?;
        Ok(())
    }
}
