//! Size-capped on-disk asset cache.
//!
//! Every asset URL maps to one file in a flat pool, named by the SHA-256 of
//! the normalized URL plus the extension parsed from the URL path. Downloads
//! land in a `.tmp` sibling and are renamed into place, so a cached file is
//! either absent or complete. Eviction walks the pool oldest-first until the
//! whole-megabyte usage is back under quota.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::api::normalize_url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(20);
const MEGABYTE: u64 = 1024 * 1024;

pub struct AssetCache {
    dir: PathBuf,
    quota_mb: u64,
    http: reqwest::Client,
}

impl AssetCache {
    /// Open the pool at `dir`, creating it if needed and sweeping out any
    /// partial downloads a previous run left behind.
    pub fn new(dir: PathBuf, quota_mb: u64) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache directory {}", dir.display()))?;

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        let cache = Self {
            dir,
            quota_mb,
            http,
        };
        cache.sweep_stale_tmp();
        info!(
            "asset cache at {} ({} MB used / {} MB quota)",
            cache.dir.display(),
            cache.usage_mb(),
            quota_mb
        );
        Ok(cache)
    }

    /// Deterministic local path for `url`. Stable across runs and restarts.
    pub fn path_for(&self, url: &str) -> PathBuf {
        let normalized = normalize_url(url).unwrap_or_else(|| url.to_string());
        let mut name = hex::encode(Sha256::digest(normalized.as_bytes()));
        if let Some(ext) = extension_from_url(&normalized) {
            name.push('.');
            name.push_str(&ext);
        }
        self.dir.join(name)
    }

    /// Return the cached path for `url`, downloading it first on a miss.
    pub async fn get_or_fetch(&self, url: &str) -> Result<PathBuf> {
        let path = self.path_for(url);
        if is_nonempty_file(&path) {
            debug!("cache hit for {url}");
            return Ok(path);
        }

        let tmp = tmp_path(&path);
        match self.download(url, &tmp).await {
            Ok(bytes) => {
                tokio::fs::rename(&tmp, &path)
                    .await
                    .with_context(|| format!("failed to publish {}", path.display()))?;
                debug!("cached {url} ({bytes} bytes)");
                Ok(path)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    async fn download(&self, url: &str, tmp: &Path) -> Result<u64> {
        let response = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("download request failed for {url}"))?
            .error_for_status()
            .with_context(|| format!("download rejected for {url}"))?;

        let mut file = tokio::fs::File::create(tmp)
            .await
            .with_context(|| format!("failed to create {}", tmp.display()))?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("download interrupted for {url}"))?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed writing {}", tmp.display()))?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            bail!("empty response body for {url}");
        }
        Ok(written)
    }

    /// Pool usage in whole megabytes, rounded up.
    pub fn usage_mb(&self) -> u64 {
        ceil_mb(self.scan().iter().map(|f| f.size).sum())
    }

    /// Delete least-recently-modified files until usage fits the quota.
    /// Individual deletion failures are skipped.
    pub fn evict(&self) {
        let mut files = self.scan();
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        if ceil_mb(total) <= self.quota_mb {
            return;
        }

        files.sort_by_key(|f| f.modified);
        for file in files {
            if let Err(e) = std::fs::remove_file(&file.path) {
                warn!("eviction could not delete {}: {e}", file.path.display());
                continue;
            }
            debug!("evicted {}", file.path.display());
            total = total.saturating_sub(file.size);
            if ceil_mb(total) <= self.quota_mb {
                break;
            }
        }
        info!("cache eviction done, {} MB in use", ceil_mb(total));
    }

    fn scan(&self) -> Vec<PoolFile> {
        WalkDir::new(&self.dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                Some(PoolFile {
                    path: e.into_path(),
                    size: meta.len(),
                    modified: meta.modified().ok()?,
                })
            })
            .collect()
    }

    fn sweep_stale_tmp(&self) {
        for file in self.scan() {
            if file.path.extension().is_some_and(|ext| ext == "tmp") {
                debug!("removing stale partial {}", file.path.display());
                let _ = std::fs::remove_file(&file.path);
            }
        }
    }
}

struct PoolFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

fn ceil_mb(bytes: u64) -> u64 {
    bytes.div_ceil(MEGABYTE)
}

fn is_nonempty_file(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".into());
    name.push_str(".tmp");
    path.with_file_name(name)
}

/// Dotted extension of the URL's terminal path segment, query and fragment
/// stripped. Extensions are lowercased and capped at 5 alphanumeric chars.
pub fn extension_from_url(url: &str) -> Option<String> {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        // Not an absolute URL; treat everything before ?/# as the path.
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn cache_in(dir: &Path, quota_mb: u64) -> AssetCache {
        AssetCache::new(dir.to_path_buf(), quota_mb).unwrap()
    }

    /// One-shot HTTP fixture in the spirit of a local test listener: accepts
    /// a single connection and serves a canned response.
    fn serve_once(status: u16, body: &'static [u8]) -> String {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf);
            let reason = if status == 200 { "OK" } else { "Error" };
            let _ = write!(
                stream,
                "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(body);
        });
        format!("http://{addr}")
    }

    #[test]
    fn path_is_deterministic_and_extension_preserving() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), 10);

        let a = cache.path_for("https://x/y/a.png");
        assert_eq!(a, cache.path_for("https://x/y/a.png"));
        assert!(a.to_string_lossy().ends_with(".png"));
        assert_ne!(a, cache.path_for("https://x/y/b.png"));
    }

    #[test]
    fn trailing_junk_does_not_change_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), 10);

        let clean = cache.path_for("https://x/y/a.png");
        assert_eq!(clean, cache.path_for("https://x/y/a.png\r"));
        assert_eq!(clean, cache.path_for("https://x/y/a.png, "));
        assert_eq!(clean, cache.path_for("  https://x/y/a.png,,\r"));
    }

    #[test]
    fn extension_parsing_handles_queries_and_odd_paths() {
        assert_eq!(
            extension_from_url("https://x/y/clip.MP4?token=abc").as_deref(),
            Some("mp4")
        );
        assert_eq!(extension_from_url("https://x/y/clip.mp4#t=1").as_deref(), Some("mp4"));
        assert_eq!(extension_from_url("https://x/stream"), None);
        assert_eq!(extension_from_url("https://x/archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_from_url("https://x/.hidden"), None);
        assert_eq!(extension_from_url("https://x/a.toolong"), None);
    }

    #[tokio::test]
    async fn hit_returns_existing_file_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), 10);

        let path = cache.path_for("https://nowhere.invalid/a.png");
        std::fs::write(&path, b"pixels").unwrap();

        assert_eq!(cache.get_or_fetch("https://nowhere.invalid/a.png").await.unwrap(), path);
    }

    #[tokio::test]
    async fn miss_downloads_then_renames() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), 10);

        let base = serve_once(200, b"image-bytes");
        let url = format!("{base}/a.png");
        let path = cache.get_or_fetch(&url).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"image-bytes");
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn failed_download_leaves_no_partial() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), 10);

        let base = serve_once(500, b"boom");
        let url = format!("{base}/a.png");
        assert!(cache.get_or_fetch(&url).await.is_err());

        let path = cache.path_for(&url);
        assert!(!path.exists());
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn empty_body_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), 10);

        let base = serve_once(200, b"");
        let url = format!("{base}/a.png");
        assert!(cache.get_or_fetch(&url).await.is_err());
        assert!(!cache.path_for(&url).exists());
    }

    fn write_sized(dir: &Path, name: &str, megabytes: usize, age_secs: u64) {
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; megabytes * MEGABYTE as usize]).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn eviction_is_a_noop_under_quota() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), 10);
        write_sized(dir.path(), "a.png", 2, 50);

        cache.evict();
        assert!(dir.path().join("a.png").exists());
    }

    #[test]
    fn eviction_removes_oldest_until_under_quota() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), 3);

        // Five 1 MB files, t1 oldest .. t5 newest.
        for (i, name) in ["t1", "t2", "t3", "t4", "t5"].iter().enumerate() {
            write_sized(dir.path(), &format!("{name}.png"), 1, 500 - i as u64 * 60);
        }
        assert_eq!(cache.usage_mb(), 5);

        cache.evict();

        assert!(!dir.path().join("t1.png").exists());
        assert!(!dir.path().join("t2.png").exists());
        assert!(dir.path().join("t3.png").exists());
        assert!(dir.path().join("t4.png").exists());
        assert!(dir.path().join("t5.png").exists());
        assert!(cache.usage_mb() <= 3);
    }

    #[test]
    fn startup_sweeps_stale_partials() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc.png.tmp"), b"partial").unwrap();
        std::fs::write(dir.path().join("abc.png"), b"whole").unwrap();

        let _cache = cache_in(dir.path(), 10);
        assert!(!dir.path().join("abc.png.tmp").exists());
        assert!(dir.path().join("abc.png").exists());
    }
}
