//! Playlist controller: the fetch → play → swap loop.
//!
//! One foreground flow walks the main playlist and drives the player; one
//! background task slot prefetches the next batch into the pending list.
//! The swap point at end-of-main is the only synchronization barrier, and
//! every non-fatal error is absorbed here with a bounded backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError, Batch};
use crate::cache::AssetCache;
use crate::config::Config;
use crate::mpv::PlayerDriver;
use crate::playlist::StateDir;

const BOOT_BACKOFF: Duration = Duration::from_secs(5);
const REFETCH_BACKOFF: Duration = Duration::from_secs(2);
const PLAYBACK_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Booting,
    Playing,
    Refetching,
    Swapping,
    Exiting,
}

pub struct Controller {
    api: Arc<ApiClient>,
    cache: Arc<AssetCache>,
    state_dir: StateDir,
    player: PlayerDriver,
    restart_after: Option<Duration>,
    started: Instant,
    /// The single background prefetch slot; at most one in flight.
    prefetch: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn new(
        cfg: &Config,
        api: Arc<ApiClient>,
        cache: Arc<AssetCache>,
        state_dir: StateDir,
        player: PlayerDriver,
    ) -> Self {
        let restart_after =
            (cfg.restart_hours > 0).then(|| Duration::from_secs(cfg.restart_hours * 3600));
        Self {
            api,
            cache,
            state_dir,
            player,
            restart_after,
            started: Instant::now(),
            prefetch: None,
        }
    }

    /// Drive the state machine until the restart interval elapses. Only a
    /// signal or that deadline ends this loop.
    pub async fn run(&mut self) -> Result<()> {
        let mut state = State::Booting;
        loop {
            state = match state {
                State::Booting => self.boot().await,
                State::Playing => self.play_main().await,
                State::Refetching => self.refetch().await,
                State::Swapping => self.swap().await,
                State::Exiting => {
                    info!("restart interval elapsed, exiting for the supervisor");
                    return Ok(());
                }
            };
        }
    }

    /// Stop the player and abandon the prefetch. Runs on every exit path.
    pub async fn shutdown(&mut self) {
        if let Some(task) = self.prefetch.take() {
            task.abort();
        }
        self.player.shutdown().await;
    }

    async fn boot(&mut self) -> State {
        loop {
            let cursor = self.state_dir.read_cursor();
            match self.api.fetch(cursor).await {
                Ok(batch) => match self.commit_main(cursor, &batch) {
                    Ok(()) => {
                        info!("booted with {} URLs at cursor {cursor}", batch.urls.len());
                        self.start_prefetch();
                        return State::Playing;
                    }
                    Err(e) => warn!("could not persist initial batch: {e}"),
                },
                Err(e) => log_fetch_failure("initial fetch", cursor, &e),
            }
            sleep(BOOT_BACKOFF).await;
        }
    }

    async fn play_main(&mut self) -> State {
        // Batch boundary: the supervisor takes over from here.
        if self.restart_due() {
            return State::Exiting;
        }

        let urls = match self.state_dir.read_main() {
            Ok(urls) => urls,
            Err(e) => {
                warn!("could not read main playlist: {e}");
                sleep(REFETCH_BACKOFF).await;
                return State::Playing;
            }
        };
        if urls.is_empty() {
            warn!("main list empty");
            return State::Refetching;
        }

        for url in urls {
            self.play_one(&url).await;
        }
        State::Swapping
    }

    async fn play_one(&mut self, url: &str) {
        let source = match self.cache.get_or_fetch(url).await {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                // Keep the screen alive: hand mpv the original URL to stream.
                warn!("download failed for {url}: {e}; streaming the source directly");
                self.report_event(
                    "billboard_asset.download_failed",
                    serde_json::json!({ "url": url }),
                );
                url.to_string()
            }
        };

        if let Err(e) = self.player.play(url, &source).await {
            warn!("playback failed for {url}: {e}");
            self.report_event(
                "billboard_playback.error",
                serde_json::json!({ "url": url }),
            );
            sleep(PLAYBACK_BACKOFF).await;
        }
    }

    async fn refetch(&mut self) -> State {
        let cursor = self.state_dir.read_cursor();
        match self.api.fetch(cursor).await {
            Ok(batch) => {
                if self.commit_main(cursor, &batch).is_ok() {
                    return State::Playing;
                }
            }
            Err(e) => log_fetch_failure("refetch", cursor, &e),
        }
        sleep(REFETCH_BACKOFF).await;
        State::Refetching
    }

    async fn swap(&mut self) -> State {
        // A prefetch still in flight at the swap point is cancelled rather
        // than joined; the fresh one restarts from the stored cursor.
        if let Some(task) = self.prefetch.take() {
            if !task.is_finished() {
                debug!("cancelling in-flight prefetch at swap");
            }
            task.abort();
        }

        match self.state_dir.swap_pending_into_main() {
            Ok(true) => {
                info!("swapped pending playlist into main");
                self.cache.evict();
            }
            Ok(false) => info!("pending list empty, replaying current main"),
            Err(e) => warn!("swap failed: {e}"),
        }

        self.start_prefetch();
        State::Playing
    }

    fn start_prefetch(&mut self) {
        if let Some(task) = self.prefetch.take() {
            task.abort();
        }
        let api = self.api.clone();
        let state_dir = self.state_dir.clone();
        self.prefetch = Some(tokio::spawn(async move {
            let cursor = state_dir.read_cursor();
            match api.fetch(cursor).await {
                Ok(batch) => {
                    log_wrap(cursor, &batch);
                    if let Err(e) = state_dir.write_pending(&batch.urls) {
                        warn!("could not store pending list: {e}");
                        return;
                    }
                    if let Err(e) = state_dir.write_cursor(batch.next_cursor) {
                        warn!("could not advance cursor: {e}");
                        return;
                    }
                    debug!(
                        "prefetched {} URLs, cursor {cursor} -> {}",
                        batch.urls.len(),
                        batch.next_cursor
                    );
                }
                Err(e) => log_fetch_failure("prefetch", cursor, &e),
            }
        }));
    }

    fn commit_main(&self, cursor: u64, batch: &Batch) -> Result<()> {
        log_wrap(cursor, batch);
        self.state_dir.write_main(&batch.urls)?;
        self.state_dir.write_cursor(batch.next_cursor)?;
        Ok(())
    }

    /// Best-effort device event; never blocks playback.
    fn report_event(&self, event_type: &'static str, data: serde_json::Value) {
        let api = self.api.clone();
        tokio::spawn(async move {
            if let Err(e) = api.log_event(event_type, data).await {
                debug!("device event {event_type} not delivered: {e}");
            }
        });
    }

    fn restart_due(&self) -> bool {
        self.restart_after
            .is_some_and(|after| self.started.elapsed() >= after)
    }
}

/// Protocol errors mean the server answered but gave us nothing to play;
/// they are retried the same way but logged as their own class.
fn log_fetch_failure(what: &str, cursor: u64, e: &ApiError) {
    if e.is_protocol() {
        warn!("{what} at cursor {cursor} returned no usable batch: {e}");
    } else {
        warn!("{what} at cursor {cursor} failed: {e}");
    }
}

fn log_wrap(cursor: u64, batch: &Batch) {
    if batch.wrapped {
        info!(
            "schedule wrapped: cursor {cursor} -> {}, full cycle complete",
            batch.next_cursor
        );
    }
}
