//! The `version` generator: stamps a per-device version tar carrying the
//! build id, `channel.ini`, and the `config.d/` symlink pair. Lives inside
//! the device directory rather than the shared pool.

use std::collections::BTreeMap;
use std::path::Path;

use tar::{Builder, EntryType, Header};

use crate::error::Result;
use crate::generate::{Env, GenContext};
use crate::model::Image;

pub fn generate(ctx: &GenContext, _args: &BTreeMap<String, String>, env: &mut Env) -> Result<std::path::PathBuf> {
    write_version_tar(ctx, &env.channel, &env.device, env.version, &crate::util::join_version_detail(&env.version_detail), None)
}

/// Writes `<base>/<channel>/<device>/version-<version>.tar.xz{,.asc}` and
/// returns its path, ready to stash on a cloned image record's `FileRef`.
pub fn write_version_tar(
    ctx: &GenContext,
    channel: &str,
    device: &str,
    version: i64,
    version_detail: &str,
    channel_target: Option<&str>,
) -> Result<std::path::PathBuf> {
    let device_dir = ctx.base.join(channel).join(device);
    std::fs::create_dir_all(&device_dir)?;

    let scratch = tempfile::tempdir()?;
    let scratch_tar = scratch.path().join("version.tar");
    {
        let f = std::fs::File::create(&scratch_tar)?;
        let mut builder = Builder::new(f);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        append_file(
            &mut builder,
            "system/etc/ubuntu-build",
            format!("{version}\n").as_bytes(),
            now,
        )?;

        let ini = render_channel_ini(ctx, channel, device, version, version_detail, channel_target);
        append_file(&mut builder, "system/etc/system-image/channel.ini", ini.as_bytes(), now)?;

        append_dir(&mut builder, "system/etc/system-image/config.d/", 0o775, now)?;
        append_symlink(
            &mut builder,
            "system/etc/system-image/config.d/00_default.ini",
            "../client.ini",
            now,
        )?;
        append_symlink(
            &mut builder,
            "system/etc/system-image/config.d/01_channel.ini",
            "../channel.ini",
            now,
        )?;
        builder.finish()?;
    }

    let name = format!("version-{version}");
    let tar_dst = device_dir.join(format!("{name}.tar.xz"));
    ctx.codec.xz_compress(&scratch_tar, &tar_dst)?;
    ctx.signer.sign(&tar_dst)?;

    let meta = crate::model::PoolMeta {
        generator: "version".to_string(),
        version: Some(version),
        version_detail: if version_detail.is_empty() {
            None
        } else {
            Some(version_detail.to_string())
        },
        extra: BTreeMap::new(),
    };
    let json_path = device_dir.join(format!("{name}.json"));
    std::fs::write(&json_path, serde_json::to_vec_pretty(&meta)?)?;
    ctx.signer.sign(&json_path)?;
    Ok(tar_dst)
}

fn render_channel_ini(
    ctx: &GenContext,
    channel: &str,
    device: &str,
    version: i64,
    version_detail: &str,
    channel_target: Option<&str>,
) -> String {
    let port_or_disabled = |p: Option<u16>| p.map(|v| v.to_string()).unwrap_or_else(|| "disabled".to_string());
    let mut out = String::new();
    out.push_str("[service]\n");
    out.push_str(&format!("base: {}\n", ctx.public_fqdn));
    out.push_str(&format!("http_port: {}\n", port_or_disabled(ctx.http_port)));
    out.push_str(&format!("https_port: {}\n", port_or_disabled(ctx.https_port)));
    out.push_str(&format!("channel: {channel}\n"));
    out.push_str(&format!("device: {device}\n"));
    out.push_str(&format!("build_number: {version}\n"));
    if let Some(target) = channel_target {
        out.push_str(&format!("channel_target: {target}\n"));
    }
    if !version_detail.is_empty() {
        out.push_str(&format!("version_detail: {version_detail}\n"));
    }
    out
}

/// Called from alias sync: regenerates the version-stamp tar so it carries
/// the alias channel's name and a `channel_target` pointing at the real
/// source, extracting any prior `version_detail` from the source pool
/// entry's `.json` sibling. Returns the rendered `version_detail` plus the
/// new tar's path, so the caller can splice a replacement `FileRef` into
/// the cloned image record at the same `order` slot the source's version
/// file occupied.
pub fn regenerate_for_alias(
    ctx: &GenContext,
    alias: &str,
    device: &str,
    target: &str,
    image: &Image,
) -> Result<(Option<String>, std::path::PathBuf)> {
    let version_detail = image.version_detail.clone().unwrap_or_default();
    let tar_path = write_version_tar(ctx, alias, device, image.version, &version_detail, Some(target))?;
    let detail = if version_detail.is_empty() {
        None
    } else {
        Some(version_detail)
    };
    Ok((detail, tar_path))
}

fn append_file<W: std::io::Write>(builder: &mut Builder<W>, path: &str, content: &[u8], mtime: u64) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_path(path)?;
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append(&header, content)?;
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
    header.set_mode(0o777);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append(&header, std::io::empty())?;
    Ok(())
}

#[test]
fn test_render_channel_ini_disabled_ports() {
    let ctx = GenContext {
        base: Path::new("/tmp"),
        signer: &crate::sign::NoopSigner,
        codec: &crate::codec::SubprocessCodec,
        public_fqdn: "system-image.example.org".to_string(),
        http_port: None,
        https_port: Some(443),
        boot_tool: &crate::external::NoopBootImageTool,
        cpio_tool: &crate::external::NoopCpioTool,
    };
    let ini = render_channel_ini(&ctx, "stable", "phone", 42, "", None);
    assert!(ini.contains("http_port: disabled"));
    assert!(ini.contains("https_port: 443"));
    assert!(ini.contains("build_number: 42"));
    assert!(!ini.contains("channel_target"));
}
