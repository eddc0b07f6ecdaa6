//! The `http` and `http-cdimage` generators: fetch a payload (or a build
//! id from a monitor URL first) over plain HTTP(S).

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::error::{Result, TreeError};
use crate::generate::cdimage::rewrite_rootfs_tar;
use crate::generate::{finalize_or_reuse, Env, GenContext};
use crate::util::sha256sum;

/// Process-wide cache of monitor URL to fetched version string. The only
/// mutable global state in the pipeline; safe under the single-threaded
/// execution model the publication run assumes.
fn monitor_cache() -> &'static Mutex<BTreeMap<String, String>> {
    static CACHE: OnceLock<Mutex<BTreeMap<String, String>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(BTreeMap::new()))
}

fn fetch_text(url: &str, timeout: Duration) -> Result<String> {
    if let Some(cached) = monitor_cache().lock().unwrap().get(url).cloned() {
        return Ok(cached);
    }
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| TreeError::Network(e.to_string()))?;
    let body = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .map_err(|e| TreeError::Network(e.to_string()))?;
    monitor_cache().lock().unwrap().insert(url.to_string(), body.clone());
    Ok(body)
}

fn fetch_bytes(url: &str, timeout: Duration) -> Result<Vec<u8>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| TreeError::Network(e.to_string()))?;
    let mut resp = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| TreeError::Network(e.to_string()))?;
    let mut buf = Vec::new();
    resp.read_to_end(&mut buf).map_err(|e| TreeError::Network(e.to_string()))?;
    Ok(buf)
}

fn monitor_version(monitor_url: &str) -> Result<String> {
    let body = fetch_text(monitor_url, Duration::from_secs(5))?;
    let mut lines = body.lines();
    let first = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| TreeError::Network("monitor body is empty".into()))?;
    if lines.next().is_some() {
        return Err(TreeError::Network("monitor body has more than one line".into()));
    }
    Ok(first.trim().to_string())
}

fn download_plain(ctx: &GenContext, args: &BTreeMap<String, String>, env: &mut Env, timeout: Duration) -> Result<PathBuf> {
    let name = args
        .get("name")
        .ok_or_else(|| TreeError::InvalidArgument("http generator requires name=".into()))?;
    let url = args
        .get("url")
        .ok_or_else(|| TreeError::InvalidArgument("http generator requires url=".into()))?;

    if let Some(monitor_url) = args.get("monitor") {
        let version = monitor_version(monitor_url)?;
        let pool_name = format!("{name}-{}", sha256sum(format!("{url}:{version}").as_bytes())?);

        let legacy = ctx.pool_tar_path(&format!("{name}-{version}"));
        if legacy.exists() {
            env.version_detail.push(format!("{name}={version}"));
            return Ok(legacy);
        }

        return finalize_or_reuse(ctx, &pool_name, name, env, None, BTreeMap::new(), |scratch| {
            let bytes = fetch_bytes(url, timeout)?;
            std::fs::write(scratch, bytes)?;
            Ok(())
        });
    }

    let bytes = fetch_bytes(url, timeout)?;
    let hash = sha256sum(bytes.as_slice())?;
    let pool_name = format!("{name}-{hash}");
    finalize_or_reuse(ctx, &pool_name, name, env, None, BTreeMap::new(), |scratch| {
        std::fs::write(scratch, &bytes)?;
        Ok(())
    })
}

pub fn generate_http(ctx: &GenContext, args: &BTreeMap<String, String>, env: &mut Env) -> Result<PathBuf> {
    download_plain(ctx, args, env, Duration::from_secs(5))
}

pub fn generate_http_cdimage(ctx: &GenContext, args: &BTreeMap<String, String>, env: &mut Env) -> Result<PathBuf> {
    let name = args
        .get("name")
        .ok_or_else(|| TreeError::InvalidArgument("http-cdimage generator requires name=".into()))?;
    let url = args
        .get("url")
        .ok_or_else(|| TreeError::InvalidArgument("http-cdimage generator requires url=".into()))?;
    let product = args.get("product").map(String::as_str).unwrap_or("touch");

    let bytes = fetch_bytes(url, Duration::from_secs(20))?;
    let hash = sha256sum(bytes.as_slice())?;
    let pool_name = format!("{name}-{hash}");

    finalize_or_reuse(ctx, &pool_name, name, env, None, BTreeMap::new(), |scratch| {
        let download_dir = tempfile::tempdir()?;
        let gzip_path = download_dir.path().join("download.tar.gz");
        std::fs::write(&gzip_path, &bytes)?;
        rewrite_rootfs_tar(ctx, &gzip_path, scratch, product)
    })
}

#[test]
fn test_monitor_version_rejects_multiline_body() {
    let err = (|| -> Result<String> {
        let body = "one\ntwo\n";
        let mut lines = body.lines();
        let first = lines.next().filter(|l| !l.is_empty()).unwrap();
        if lines.next().is_some() {
            return Err(TreeError::Network("monitor body has more than one line".into()));
        }
        Ok(first.to_string())
    })()
    .unwrap_err();
    assert!(err.is_network());
}
