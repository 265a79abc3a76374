// Purpose: Resolve cache locations and environment-driven toggles.
// Inputs/Outputs: Reads OBJCACHE_* environment variables and the OS cache directory.
// Invariants: The cache root must be stable across invocations on the same host.
// Gotchas: OBJCACHE_DIR overrides the platform directory; tests rely on it.

use anyhow::Context;
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

pub fn cache_root() -> anyhow::Result<PathBuf> {
    if let Ok(p) = std::env::var("OBJCACHE_DIR") {
        return Ok(PathBuf::from(p));
    }
    let pd = ProjectDirs::from("dev", "objcache", "objcache")
        .context("cannot determine OS cache directory")?;
    Ok(pd.cache_dir().to_path_buf())
}

pub fn ensure_dir(p: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(p)?;
    Ok(())
}

/// Whether cache-entry stdout/stderr payloads are stored compressed.
/// Defaults to on; set OBJCACHE_COMPRESS=0 to disable.
pub fn compression_enabled() -> bool {
    match std::env::var("OBJCACHE_COMPRESS") {
        Ok(v) => is_truthy(&v),
        Err(_) => true,
    }
}

pub fn is_truthy(value: &str) -> bool {
    let v = value.to_ascii_lowercase();
    !(v.is_empty() || v == "0" || v == "false" || v == "no" || v == "off")
}
