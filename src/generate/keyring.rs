//! The `keyring` generator: wraps a named keyring tar+signature pair from
//! the key store into a payload placing them at the path the on-device
//! client expects to find the archive master keyring.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tar::{Builder, Header};

use crate::error::{Result, TreeError};
use crate::generate::{finalize_or_reuse, Env, GenContext};
use crate::util::sha256sum_file;

pub fn generate_keyring(
    ctx: &GenContext,
    args: &BTreeMap<String, String>,
    env: &mut Env,
) -> Result<PathBuf> {
    if env.new_files.is_empty() {
        return Err(TreeError::InvalidArgument("keyring generator is a no-op with no new files".into()));
    }

    let name = args
        .get("name")
        .ok_or_else(|| TreeError::InvalidArgument("keyring generator requires name=".into()))?;
    let store = args
        .get("store")
        .map(PathBuf::from)
        .unwrap_or_else(|| ctx.base.join("gpg").join("keyrings"));

    let tar_src = store.join(format!("{name}.tar.xz"));
    let sig_src = store.join(format!("{name}.tar.xz.asc"));
    if !tar_src.exists() || !sig_src.exists() {
        return Err(TreeError::NotFound(format!("keyring {name} in key store")));
    }

    let tar_hash = sha256sum_file(&tar_src)?;
    let sig_hash = sha256sum_file(&sig_src)?;
    let pool_name = format!(
        "keyring-{}",
        crate::util::sha256sum(format!("{tar_hash}/{sig_hash}").as_bytes())?
    );

    finalize_or_reuse(ctx, &pool_name, "keyring", env, None, BTreeMap::new(), |scratch_tar| {
        let tar_bytes = std::fs::read(&tar_src)?;
        let sig_bytes = std::fs::read(&sig_src)?;
        let f = std::fs::File::create(scratch_tar)?;
        let mut builder = Builder::new(f);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        append(&mut builder, "system/usr/share/system-image/archive-master.tar.xz", &tar_bytes, now)?;
        append(&mut builder, "system/usr/share/system-image/archive-master.tar.xz.asc", &sig_bytes, now)?;
        builder.finish()?;
        Ok(())
    })
}

fn append<W: std::io::Write>(builder: &mut Builder<W>, path: &str, content: &[u8], mtime: u64) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_path(path)?;
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append(&header, content)?;
    Ok(())
}
