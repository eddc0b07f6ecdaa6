//! Byte-stream compression collaborator.
//!
//! The core never links against liblzma/libz directly; it shells out the
//! same way the teacher's `sign_message` shells out to `gpg`. This keeps the
//! actual compressor swappable (`pxz` vs `xz`, system `gzip`) without the
//! core caring, and lets tests substitute an in-memory fake.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::{Result, TreeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Xz,
}

/// Compresses/uncompresses files and can sniff which of the two a file on
/// disk already is.
pub trait Codec: Send + Sync {
    fn xz_compress(&self, src: &Path, dst: &Path) -> Result<()>;
    fn xz_uncompress(&self, src: &Path, dst: &Path) -> Result<()>;
    fn gzip_compress(&self, src: &Path, dst: &Path) -> Result<()>;
    fn gzip_uncompress(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// Shells out to `pxz`/`xz` and `gzip`, preferring the parallel compressor
/// when present, the way the original tooling did.
pub struct SubprocessCodec;

impl SubprocessCodec {
    fn run(cmd: &mut Command) -> Result<()> {
        let status = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| TreeError::External(format!("spawning {:?}: {e}", cmd.get_program())))?;
        if !status.success() {
            return Err(TreeError::External(format!(
                "{:?} exited with {status}",
                cmd.get_program()
            )));
        }
        Ok(())
    }

    fn xz_binary() -> &'static str {
        if which("pxz") {
            "pxz"
        } else {
            "xz"
        }
    }
}

fn which(bin: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file())
        })
        .unwrap_or(false)
}

impl Codec for SubprocessCodec {
    fn xz_compress(&self, src: &Path, dst: &Path) -> Result<()> {
        Self::run(
            Command::new(Self::xz_binary())
                .arg("-z")
                .arg("-k")
                .arg("-c")
                .arg(src)
                .stdout(Stdio::from(std::fs::File::create(dst)?)),
        )
    }

    fn xz_uncompress(&self, src: &Path, dst: &Path) -> Result<()> {
        Self::run(
            Command::new(Self::xz_binary())
                .arg("-d")
                .arg("-k")
                .arg("-c")
                .arg(src)
                .stdout(Stdio::from(std::fs::File::create(dst)?)),
        )
    }

    fn gzip_compress(&self, src: &Path, dst: &Path) -> Result<()> {
        Self::run(
            Command::new("gzip")
                .arg("-c")
                .arg(src)
                .stdout(Stdio::from(std::fs::File::create(dst)?)),
        )
    }

    fn gzip_uncompress(&self, src: &Path, dst: &Path) -> Result<()> {
        Self::run(
            Command::new("gzip")
                .arg("-d")
                .arg("-c")
                .arg(src)
                .stdout(Stdio::from(std::fs::File::create(dst)?)),
        )
    }
}

/// Sniffs a file's magic bytes to tell gzip from xz from neither.
pub fn guess_compression(path: &Path) -> Result<Option<Compression>> {
    let mut f = std::fs::File::open(path)?;
    let mut magic = [0u8; 6];
    let n = f.read(&mut magic)?;
    if n >= 2 && magic[0] == 0x1f && magic[1] == 0x8b {
        return Ok(Some(Compression::Gzip));
    }
    if n >= 6 && magic == [0xfd, b'7', b'z', b'X', b'Z', 0x00] {
        return Ok(Some(Compression::Xz));
    }
    Ok(None)
}

#[test]
fn test_guess_compression_gzip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f.gz");
    std::fs::write(&path, [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00]).unwrap();
    assert_eq!(guess_compression(&path).unwrap(), Some(Compression::Gzip));
}

#[test]
fn test_guess_compression_none() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f.bin");
    std::fs::write(&path, b"plain text, not compressed").unwrap();
    assert_eq!(guess_compression(&path).unwrap(), None);
}
