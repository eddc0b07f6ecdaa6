use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};

use imagetree::codec::SubprocessCodec;
use imagetree::config::{self, ChannelConfig, Config};
use imagetree::device::Device;
use imagetree::external::{NoopBootImageTool, NoopCpioTool};
use imagetree::generate::{self, Env, GenContext, GeneratorSpec};
use imagetree::model::ImageType;
use imagetree::sign::{NoopSigner, OpenPgpSigner, Signer};
use imagetree::tree::Tree;

mod cli;

fn build_signer(config: &Config, signing_key_override: Option<&str>) -> Result<Box<dyn Signer>> {
    match signing_key_override.or(config.server.signing_key.as_deref()) {
        Some(path) => {
            let signer = OpenPgpSigner::load(path)
                .with_context(|| format!("loading signing certificate from {path}"))?;
            Ok(Box::new(signer))
        }
        None => {
            warn!("no signing_key configured; writing unsigned (no-op signature) artifacts");
            Ok(Box::new(NoopSigner))
        }
    }
}

fn image_type_of(ch: &ChannelConfig) -> Result<ImageType> {
    match ch.image_type.as_str() {
        "full" => Ok(ImageType::Full),
        "delta" => Ok(ImageType::Delta),
        other => anyhow::bail!("unknown image type {other} in channel config"),
    }
}

fn publish_one(base: &Path, config: &Config, ch: &ChannelConfig, signing_key_override: Option<&str>) -> Result<()> {
    info!("publishing {}/{} version {}", ch.channel, ch.device, ch.version);

    let signer = build_signer(config, signing_key_override)?;
    let tree = Tree::new(base.to_path_buf(), signer);
    if let Err(e) = tree.create_channel(&ch.channel) {
        if !matches!(e, imagetree::error::TreeError::Conflict(_)) {
            return Err(e.into());
        }
    }
    if let Err(e) = tree.create_device(&ch.channel, &ch.device) {
        if !matches!(e, imagetree::error::TreeError::Conflict(_)) {
            return Err(e.into());
        }
    }

    let signer = build_signer(config, signing_key_override)?;
    let codec = SubprocessCodec;
    // BootImageTool/CpioTool have no real implementation in this crate
    // (bootimg/cpio subprocess behavior is an explicit non-goal); a channel
    // pipeline that uses remote-system-image's keyring= option will see the
    // repack run against these no-ops rather than a real recovery image.
    let ctx = GenContext {
        base,
        signer: signer.as_ref(),
        codec: &codec,
        public_fqdn: config.server.public_fqdn.clone(),
        http_port: config.server.http_port,
        https_port: config.server.https_port,
        boot_tool: &NoopBootImageTool,
        cpio_tool: &NoopCpioTool,
    };

    let mut env = Env {
        channel: ch.channel.clone(),
        device: ch.device.clone(),
        device_name: ch.device_name.clone().unwrap_or_else(|| ch.device.clone()),
        version: ch.version,
        new_files: Vec::new(),
        version_detail: Vec::new(),
    };

    for gen_cfg in &ch.generators {
        let spec = GeneratorSpec {
            name: gen_cfg.generator.clone(),
            args: gen_cfg.args.clone(),
        };
        match generate::generate_file(&ctx, &spec, &mut env)? {
            Some(path) => env.new_files.push(path),
            None => warn!(
                "generator {} produced no payload for {}/{}, skipping",
                spec.name, ch.channel, ch.device
            ),
        }
    }

    if !env.new_files.is_empty() {
        let version_spec = GeneratorSpec {
            name: "version".to_string(),
            args: Default::default(),
        };
        if let Some(path) = generate::generate_file(&ctx, &version_spec, &mut env)? {
            env.new_files.push(path);
        }
    } else {
        info!("no new files produced for {}/{}, skipping image publish", ch.channel, ch.device);
        return Ok(());
    }

    let image_type = image_type_of(ch)?;
    let version_detail = imagetree::util::join_version_detail(&env.version_detail);
    let device = Device::new(base, signer.as_ref(), &ch.channel, &ch.device);
    device.create_image(
        image_type,
        ch.version,
        &ch.description,
        &env.new_files,
        ch.base,
        ch.bootme,
        ch.minversion,
        if version_detail.is_empty() {
            None
        } else {
            Some(version_detail)
        },
    )?;

    info!("published {}/{} version {}", ch.channel, ch.device, ch.version);
    Ok(())
}

fn publish_action(config: &Config, signing_key_override: Option<&str>) -> Result<()> {
    let base = PathBuf::from(&config.server.path);
    for ch in &config.channels {
        if let Err(e) = publish_one(&base, config, ch, signing_key_override) {
            log::error!("publishing {}/{} failed: {e}", ch.channel, ch.device);
        }
    }
    Ok(())
}

fn gc_action(config: &Config, signing_key_override: Option<&str>) -> Result<()> {
    let base = PathBuf::from(&config.server.path);
    let signer = build_signer(config, signing_key_override)?;
    let tree = Tree::new(base, signer);
    let orphans = tree.list_orphaned_files()?;
    info!("{} orphaned files found", orphans.len());
    tree.cleanup_tree()?;
    info!("cleanup complete");
    Ok(())
}

fn expire_action(config: &Config, args: &cli::Expire, signing_key_override: Option<&str>) -> Result<()> {
    let base = PathBuf::from(&config.server.path);
    let signer = build_signer(config, signing_key_override)?;
    let keep = args.keep.unwrap_or(config.server.default_keep_full);
    let device = Device::new(&base, signer.as_ref(), &args.channel, &args.device);
    device.expire_images(keep)?;
    info!("expired images in {}/{}, kept {keep} full images", args.channel, args.device);
    Ok(())
}

fn sync_action(config: &Config, args: &cli::Sync, signing_key_override: Option<&str>) -> Result<()> {
    let base = PathBuf::from(&config.server.path);
    let signer = build_signer(config, signing_key_override)?;
    let tree = Tree::new(base, signer);
    tree.sync_aliases(&args.channel)?;
    tree.sync_redirects(&args.channel)?;
    info!("synced aliases and redirects targeting {}", args.channel);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args: cli::Args = argh::from_env();

    let config = config::parse_config(&args.config)
        .with_context(|| format!("reading config file {}", args.config))?;
    config::lint_config(&config);

    let signing_key_override = args.signing_key.as_deref();
    match &args.command {
        cli::Command::Publish(_) => publish_action(&config, signing_key_override)?,
        cli::Command::Gc(_) => gc_action(&config, signing_key_override)?,
        cli::Command::Expire(expire) => expire_action(&config, expire, signing_key_override)?,
        cli::Command::Sync(sync) => sync_action(&config, sync, signing_key_override)?,
    }

    Ok(())
}
