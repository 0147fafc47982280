//! Player driver: supervises one long-lived mpv process.
//!
//! mpv exposes a line-delimited JSON IPC socket; the driver speaks it with
//! one short-lived connection per command, probes `idle-active` to decide
//! whether the player is still healthy, and respawns it when the socket is
//! stale or dead. IPC sends are best-effort: a failure is surfaced to the
//! caller, and the next health probe reclaims the player.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::cache::extension_from_url;
use crate::config::Config;

const IPC_TIMEOUT: Duration = Duration::from_millis(1500);
const SPAWN_WAIT: Duration = Duration::from_secs(8);
const SPAWN_POLL: Duration = Duration::from_millis(100);
const EOF_POLL: Duration = Duration::from_millis(200);
/// Grace added to a known video duration before the driver gives up.
const VIDEO_GRACE_SECS: f64 = 10.0;
/// Ceiling when mpv never reports a duration.
const VIDEO_FALLBACK_SECS: f64 = 300.0;

const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];
const VIDEO_EXTS: &[&str] = &["mp4", "mkv", "mov", "avi", "webm", "m4v", "ts"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// Classify a URL by the extension in its path. `None` means the asset is
/// not playable and must be skipped.
pub fn media_kind(url: &str) -> Option<MediaKind> {
    let ext = extension_from_url(url)?;
    if IMAGE_EXTS.contains(&ext.as_str()) {
        Some(MediaKind::Image)
    } else if VIDEO_EXTS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

#[derive(Debug, Deserialize)]
struct IpcReply {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    event: Option<String>,
}

pub struct PlayerDriver {
    socket: PathBuf,
    mpv_bin: String,
    orientation: u32,
    image_seconds: u64,
    child: Option<Child>,
}

impl PlayerDriver {
    pub fn new(cfg: &Config) -> Self {
        Self {
            socket: cfg.player_socket.clone(),
            mpv_bin: cfg.mpv_bin.clone(),
            orientation: cfg.orientation,
            image_seconds: cfg.image_seconds,
            child: None,
        }
    }

    /// Show one asset for its full duration. `source` is the local cache
    /// path, or the original URL when the controller falls back to
    /// streaming.
    pub async fn play(&mut self, url: &str, source: &str) -> Result<()> {
        let Some(kind) = media_kind(url) else {
            warn!("skipping {url}: no recognized extension in path");
            return Ok(());
        };

        self.ensure_alive().await?;

        // Images loop forever so mpv does not drop to the idle window while
        // the driver times the slot; videos must reach EOF.
        let loop_mode = match kind {
            MediaKind::Image => "inf",
            MediaKind::Video => "no",
        };
        if let Err(e) = self.command(&[json!("set_property"), json!("loop-file"), json!(loop_mode)]).await
        {
            warn!("could not set loop-file: {e}");
        }

        self.command(&[json!("loadfile"), json!(source), json!("replace")])
            .await
            .with_context(|| format!("loadfile failed for {source}"))?;
        debug!("now showing {url}");

        match kind {
            MediaKind::Image => {
                sleep(Duration::from_secs(self.image_seconds)).await;
                // The next `loadfile … replace` swaps output cleanly; no
                // explicit stop, which would flash the idle window.
            }
            MediaKind::Video => self.wait_for_video_end().await?,
        }
        Ok(())
    }

    /// Health-probe the IPC socket and respawn the player if it is missing,
    /// dead, or stuck. Consecutive calls on a healthy player are no-ops.
    pub async fn ensure_alive(&mut self) -> Result<()> {
        if self.probe().await {
            return Ok(());
        }

        info!("player unresponsive, restarting it");
        self.kill_current().await;
        self.kill_socket_owners().await;
        let _ = std::fs::remove_file(&self.socket);
        self.spawn()?;

        let deadline = Instant::now() + SPAWN_WAIT;
        loop {
            if self.probe().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "player socket {} did not answer within {:?}",
                    self.socket.display(),
                    SPAWN_WAIT
                );
            }
            sleep(SPAWN_POLL).await;
        }
    }

    /// Quit the player and reclaim the socket. Idempotent; safe on every
    /// exit path.
    pub async fn shutdown(&mut self) {
        debug!("shutting down player");
        let _ = self.command(&[json!("quit")]).await;
        self.kill_socket_owners().await;
        if let Some(mut child) = self.child.take() {
            if timeout(Duration::from_secs(2), child.wait()).await.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        let _ = std::fs::remove_file(&self.socket);
    }

    async fn wait_for_video_end(&mut self) -> Result<()> {
        let duration = self.query_duration().await;
        let limit = video_deadline_secs(duration);
        let deadline = Instant::now() + Duration::from_secs_f64(limit);

        loop {
            match self.get_property("eof-reached").await {
                Ok(Some(Value::Bool(true))) => {
                    debug!("video reached EOF");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => bail!("player lost mid-video: {e}"),
            }
            if Instant::now() >= deadline {
                warn!("video exceeded its {limit:.0}s ceiling, stopping it");
                let _ = self.command(&[json!("stop")]).await;
                return Ok(());
            }
            sleep(EOF_POLL).await;
        }
    }

    /// The duration property only materializes once the file is open, so
    /// poll briefly before giving up.
    async fn query_duration(&self) -> Option<f64> {
        for _ in 0..10 {
            match self.get_property("duration").await {
                Ok(Some(value)) => {
                    if let Some(secs) = value.as_f64() {
                        return Some(secs);
                    }
                }
                Ok(None) => {}
                Err(_) => return None,
            }
            sleep(EOF_POLL).await;
        }
        None
    }

    async fn probe(&self) -> bool {
        matches!(self.get_property("idle-active").await, Ok(Some(_)))
    }

    async fn get_property(&self, name: &str) -> Result<Option<Value>> {
        let reply = roundtrip(&self.socket, &[json!("get_property"), json!(name)]).await?;
        Ok(reply.data)
    }

    async fn command(&self, args: &[Value]) -> Result<()> {
        let reply = roundtrip(&self.socket, args).await?;
        match reply.error.as_deref() {
            Some("success") => Ok(()),
            other => bail!("player rejected {:?}: {other:?}", args.first()),
        }
    }

    fn spawn(&mut self) -> Result<()> {
        let mut cmd = Command::new(&self.mpv_bin);
        cmd.arg("--fullscreen")
            .arg("--no-border")
            .arg("--hwdec=auto")
            .arg("--mute=yes")
            .arg("--idle=yes")
            .arg("--force-window=yes")
            .arg("--no-osc")
            .arg("--cursor-autohide=1000")
            .arg("--no-terminal")
            .arg(format!("--video-rotate={}", self.orientation))
            .arg("--image-display-duration=inf")
            .arg(format!("--input-ipc-server={}", self.socket.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to launch {}", self.mpv_bin))?;
        info!("launched player, pid {:?}", child.id());
        self.child = Some(child);
        Ok(())
    }

    async fn kill_current(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// SIGTERM anything still holding our socket, e.g. a player orphaned by
    /// a previous crash of this process.
    async fn kill_socket_owners(&self) {
        let pattern = format!("input-ipc-server={}", self.socket.display());
        let _ = Command::new("pkill").arg("-f").arg(&pattern).status().await;
    }

    #[cfg(test)]
    fn spawned_child(&self) -> bool {
        self.child.is_some()
    }
}

fn video_deadline_secs(duration: Option<f64>) -> f64 {
    match duration {
        Some(d) if d.is_finite() && d >= 0.0 => d + VIDEO_GRACE_SECS,
        _ => VIDEO_FALLBACK_SECS,
    }
}

fn request_line(args: &[Value]) -> Result<String> {
    let mut line = serde_json::to_string(&json!({ "command": args }))?;
    line.push('\n');
    Ok(line)
}

/// One command, one connection: write the request line, then read reply
/// lines until the response arrives, skipping asynchronous event lines.
async fn roundtrip(socket: &Path, args: &[Value]) -> Result<IpcReply> {
    let io = async {
        let mut stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("cannot reach player socket {}", socket.display()))?;
        stream.write_all(request_line(args)?.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                bail!("player closed the IPC connection");
            }
            let Ok(reply) = serde_json::from_str::<IpcReply>(line.trim()) else {
                continue;
            };
            if reply.event.is_some() {
                continue;
            }
            if reply.error.is_some() {
                return Ok(reply);
            }
        }
    };

    match timeout(IPC_TIMEOUT, io).await {
        Ok(result) => result,
        Err(_) => bail!("player IPC timed out"),
    }
}
