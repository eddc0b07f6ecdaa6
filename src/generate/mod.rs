//! The generator pipeline: a closed set of named artifact producers that
//! fill the content-addressed `pool/`, dispatched by [`generate_file`].

pub mod cdimage;
pub mod http;
pub mod keyring;
pub mod system_image;
pub mod version;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::codec::Codec;
use crate::error::{Result, TreeError};
use crate::external::{BootImageTool, CpioTool};
use crate::model::PoolMeta;
use crate::sign::Signer;

/// Shared state threaded through one publication run's generator calls.
#[derive(Debug, Clone, Default)]
pub struct Env {
    pub channel: String,
    pub device: String,
    pub device_name: String,
    pub version: i64,
    pub new_files: Vec<PathBuf>,
    pub version_detail: Vec<String>,
}

/// The collaborators every generator needs: where the tree lives, and the
/// two abstract adapters (signing, compression) it must not hard-wire.
pub struct GenContext<'a> {
    pub base: &'a Path,
    pub signer: &'a dyn Signer,
    pub codec: &'a dyn Codec,
    /// `channel.ini`'s `base`/`http_port`/`https_port` fields; `None` ports
    /// serialise as `"disabled"`.
    pub public_fqdn: String,
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
    /// Collaborators for `remote-system-image`'s recovery-keyring repack
    /// (§4.3.2); unused by every other generator.
    pub boot_tool: &'a dyn BootImageTool,
    pub cpio_tool: &'a dyn CpioTool,
}

impl<'a> GenContext<'a> {
    pub fn pool_dir(&self) -> PathBuf {
        self.base.join("pool")
    }

    pub fn pool_tar_path(&self, name: &str) -> PathBuf {
        self.pool_dir().join(format!("{name}.tar.xz"))
    }

    pub fn pool_json_path(&self, name: &str) -> PathBuf {
        self.pool_dir().join(format!("{name}.json"))
    }
}

/// One `(generator, args)` pipeline step drawn from per-channel config.
#[derive(Debug, Clone)]
pub struct GeneratorSpec {
    pub name: String,
    pub args: BTreeMap<String, String>,
}

/// The fingerprint-first / finalise contract shared by every generator:
/// if the pool entry already exists, replay its stored `version_detail`
/// and return early; otherwise call `build` to produce an uncompressed
/// tar at the scratch path it's given, then xz-compress, sign, and write
/// the signed JSON sidecar with `generator` first and `version_detail`
/// second in key order (conceptually — byte order is actually governed
/// by the store's sorted-key encoder, this just fixes which keys exist).
pub fn finalize_or_reuse<F>(
    ctx: &GenContext,
    pool_name: &str,
    generator_tag: &str,
    env: &mut Env,
    version: Option<i64>,
    extra: BTreeMap<String, Value>,
    build: F,
) -> Result<PathBuf>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let tar_path = ctx.pool_tar_path(pool_name);
    let json_path = ctx.pool_json_path(pool_name);

    if tar_path.exists() {
        if let Ok(raw) = std::fs::read(&json_path) {
            if let Ok(meta) = serde_json::from_slice::<PoolMeta>(&raw) {
                if let Some(detail) = meta.version_detail {
                    if !detail.is_empty() {
                        env.version_detail.push(detail);
                    }
                }
            }
        }
        return Ok(tar_path);
    }

    let scratch = tempfile::tempdir()?;
    let scratch_tar = scratch.path().join("payload.tar");
    build(&scratch_tar)?;

    std::fs::create_dir_all(ctx.pool_dir())?;
    ctx.codec.xz_compress(&scratch_tar, &tar_path)?;
    ctx.signer.sign(&tar_path)?;

    let version_detail = crate::util::join_version_detail(&env.version_detail);
    let meta = PoolMeta {
        generator: generator_tag.to_string(),
        version,
        version_detail: if version_detail.is_empty() {
            None
        } else {
            Some(version_detail)
        },
        extra,
    };
    let bytes = serde_json::to_vec_pretty(&meta)?;
    std::fs::write(&json_path, &bytes)?;
    ctx.signer.sign(&json_path)?;

    env.version_detail.push(format!("{generator_tag}={pool_name}"));
    Ok(tar_path)
}

/// Dispatches a named generator. Fails with `InvalidArgument` for any name
/// outside the closed set. `Network` failures from a generator are caught
/// here and downgraded to "no payload" (`Ok(None)`); every other error
/// propagates.
pub fn generate_file(
    ctx: &GenContext,
    spec: &GeneratorSpec,
    env: &mut Env,
) -> Result<Option<PathBuf>> {
    let outcome = match spec.name.as_str() {
        "version" => version::generate(ctx, &spec.args, env).map(Some),
        "cdimage-ubuntu" => cdimage::generate_ubuntu(ctx, &spec.args, env).map(Some),
        "cdimage-custom" => cdimage::generate_custom(ctx, &spec.args, env).map(Some),
        "cdimage-device-raw" => cdimage::generate_device_raw(ctx, &spec.args, env).map(Some),
        "http" => http::generate_http(ctx, &spec.args, env).map(Some),
        "http-cdimage" => http::generate_http_cdimage(ctx, &spec.args, env).map(Some),
        "keyring" => keyring::generate_keyring(ctx, &spec.args, env).map(Some),
        "system-image" => system_image::generate_local(ctx, &spec.args, env).map(Some),
        "remote-system-image" => system_image::generate_remote(ctx, &spec.args, env).map(Some),
        other => return Err(TreeError::InvalidArgument(format!("invalid generator {other}"))),
    };

    match outcome {
        Ok(path) => Ok(path),
        Err(e) if e.is_network() => Ok(None),
        Err(e) => Err(e),
    }
}
