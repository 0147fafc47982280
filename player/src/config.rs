//! Startup configuration loaded from a `config.env` file.
//!
//! The file format is deliberately minimal: `KEY=VALUE` lines, `#` comments
//! and blank lines ignored, surrounding quotes stripped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Everything the process needs to know, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// URL prefix for the billboard API, without a trailing slash.
    pub api_base: String,
    /// Billboard identifier sent as the `id` query parameter.
    pub billboard_id: String,
    /// How long a still image stays on screen, in seconds.
    pub image_seconds: u64,
    /// Voluntary process restart interval in hours; 0 disables.
    pub restart_hours: u64,
    /// Asset cache quota in whole megabytes.
    pub max_cache_mb: u64,
    /// Screen rotation handed to the player (0/90/180/270).
    pub orientation: u32,
    /// Legacy static `Authorization` value; replaces HMAC signing when set.
    pub auth_header: Option<String>,
    /// Directory holding the playlist and cursor files.
    pub state_dir: PathBuf,
    /// Directory holding the downloaded asset pool.
    pub cache_dir: PathBuf,
    /// Path of the player's IPC socket.
    pub player_socket: PathBuf,
    /// Player binary to launch.
    pub mpv_bin: String,
    /// Device heartbeat interval in seconds; 0 disables.
    pub heartbeat_seconds: u64,
}

impl Config {
    /// Load and validate the configuration. Any problem here is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("missing config file: {}", path.display()))?;
        Self::from_env_text(&text)
    }

    fn from_env_text(text: &str) -> Result<Self> {
        let kv = parse_env_file(text);

        let api_base = require(&kv, "API_BASE")?.trim_end_matches('/').to_string();
        let billboard_id = require(&kv, "ID")?;

        let orientation = parse_u32(&kv, "ORIENTATION", 0)?;
        if !matches!(orientation, 0 | 90 | 180 | 270) {
            bail!("ORIENTATION must be one of 0/90/180/270, got {orientation}");
        }

        Ok(Self {
            api_base,
            billboard_id,
            image_seconds: parse_u64(&kv, "IMAGE_SECONDS", 15)?,
            restart_hours: parse_u64(&kv, "RESTART_HOURS", 24)?,
            max_cache_mb: parse_u64(&kv, "MAX_CACHE_MB", 30_000)?,
            orientation,
            auth_header: kv.get("AUTH_HEADER").filter(|v| !v.is_empty()).cloned(),
            state_dir: path_or(&kv, "STATE_DIR", "/data/player/state"),
            cache_dir: path_or(&kv, "CACHE_DIR", "/data/assets"),
            player_socket: path_or(&kv, "PLAYER_SOCKET", "/tmp/billboard-mpv.sock"),
            mpv_bin: kv.get("MPV_BIN").cloned().unwrap_or_else(|| "mpv".into()),
            heartbeat_seconds: parse_u64(&kv, "HEARTBEAT_SECONDS", 10)?,
        })
    }
}

/// Parse `KEY=VALUE` lines; later keys win. Quotes around values are stripped.
fn parse_env_file(text: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let v = v.trim();
        let v = v
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
            .unwrap_or(v);
        env.insert(k.trim().to_string(), v.to_string());
    }
    env
}

fn require(kv: &HashMap<String, String>, key: &str) -> Result<String> {
    match kv.get(key) {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => bail!("{key} missing in config"),
    }
}

fn parse_u64(kv: &HashMap<String, String>, key: &str, default: u64) -> Result<u64> {
    match kv.get(key) {
        Some(v) => v
            .parse::<u64>()
            .with_context(|| format!("invalid {key} value: {v}")),
        None => Ok(default),
    }
}

fn parse_u32(kv: &HashMap<String, String>, key: &str, default: u32) -> Result<u32> {
    match kv.get(key) {
        Some(v) => v
            .parse::<u32>()
            .with_context(|| format!("invalid {key} value: {v}")),
        None => Ok(default),
    }
}

fn path_or(kv: &HashMap<String, String>, key: &str, default: &str) -> PathBuf {
    kv.get(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}
