//! On-disk playlist and cursor state.
//!
//! The state directory is the crash-recovery contract with the supervisor:
//! `main.txt` is what is playing, `pending.txt` is the prefetched next list,
//! `index.txt` is the next cursor to fetch. Every mutation is a whole-file
//! write to a sibling followed by a rename, so a reader sees either the old
//! or the new file, never a torn one.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::api::normalize_url;

const MAIN: &str = "main.txt";
const PENDING: &str = "pending.txt";
const INDEX: &str = "index.txt";
// Scratch file for the two-phase cursor update.
const NEXT: &str = "next.txt";

#[derive(Debug, Clone)]
pub struct StateDir {
    dir: PathBuf,
}

impl StateDir {
    pub fn open(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create state directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn main_path(&self) -> PathBuf {
        self.dir.join(MAIN)
    }

    pub fn pending_path(&self) -> PathBuf {
        self.dir.join(PENDING)
    }

    /// URLs currently being played, in order. Absent file reads as empty.
    pub fn read_main(&self) -> Result<Vec<String>> {
        read_list(&self.main_path())
    }

    pub fn read_pending(&self) -> Result<Vec<String>> {
        read_list(&self.pending_path())
    }

    pub fn write_main(&self, urls: &[String]) -> Result<()> {
        write_atomic(&self.main_path(), &render_list(urls))
    }

    pub fn write_pending(&self, urls: &[String]) -> Result<()> {
        write_atomic(&self.pending_path(), &render_list(urls))
    }

    /// The next index yet to be fetched. Missing or unparsable state means
    /// a first run: start from 0.
    pub fn read_cursor(&self) -> u64 {
        std::fs::read_to_string(self.dir.join(INDEX))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Two-phase cursor update: land the value in the scratch file, then
    /// rename it over the index.
    pub fn write_cursor(&self, cursor: u64) -> Result<()> {
        let next = self.dir.join(NEXT);
        std::fs::write(&next, format!("{cursor}\n"))
            .with_context(|| format!("failed to write {}", next.display()))?;
        std::fs::rename(&next, self.dir.join(INDEX)).context("failed to commit cursor")?;
        Ok(())
    }

    /// Promote the pending list to main and truncate pending. Returns false
    /// without touching anything when pending is empty.
    pub fn swap_pending_into_main(&self) -> Result<bool> {
        if self.read_pending()?.is_empty() {
            return Ok(false);
        }
        std::fs::rename(self.pending_path(), self.main_path())
            .context("failed to swap pending playlist into main")?;
        self.write_pending(&[])?;
        debug!("pending playlist swapped into main");
        Ok(true)
    }
}

fn read_list(path: &Path) -> Result<Vec<String>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    Ok(text.lines().filter_map(normalize_url).collect())
}

fn render_list(urls: &[String]) -> String {
    let mut out = String::new();
    for url in urls {
        out.push_str(url);
        out.push('\n');
    }
    out
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".into());
    tmp_name.push_str(".tmp");
    let tmp = path.with_file_name(tmp_name);

    std::fs::write(&tmp, contents)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
