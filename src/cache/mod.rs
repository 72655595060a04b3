//! Local cache of remote artifacts (test data, sources, built binaries).
//!
//! Each locator maps to one file named by a UUIDv5 of the locator's path.
//! The file's mtime is the remote Last-Modified it was fetched at and is sent
//! back as `If-Modified-Since`; atime is refreshed on every use so that the
//! [`sweeper`] only evicts files nobody has touched for a while.

pub mod sweeper;

use std::fs::{File, FileTimes, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::{StatusCode, Url};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::error::{cache_io, Result, RunnerError};

pub use sweeper::{sweep_dir, CacheSweeper, SweepReport};

/// Mode of files mirrored into the cache by [`ArtifactCache::upload`].
const UPLOAD_MODE: u32 = 0o640;

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub path: PathBuf,
    /// Last path segment of the locator, for messages and file naming.
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
    http: reqwest::Client,
}

impl ArtifactCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_client(dir, reqwest::Client::new())
    }

    pub fn with_client(dir: impl Into<PathBuf>, http: reqwest::Client) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(cache_io(&dir))?;
        Ok(Self { dir, http })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Local identity of `url`. Only the path takes part, so the same object
    /// reached through another host or with a different query string shares
    /// one cache entry.
    pub fn locate(&self, url: &str) -> Result<CachedFile> {
        let parsed = Url::parse(url).map_err(|e| RunnerError::InvalidLocator {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RunnerError::InvalidLocator {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        let key = Uuid::new_v5(&Uuid::NAMESPACE_URL, parsed.path().as_bytes());
        let filename = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("artifact")
            .to_string();
        Ok(CachedFile {
            path: self.dir.join(key.to_string()),
            filename,
        })
    }

    /// Make sure a fresh copy of `url` is on disk and return it.
    ///
    /// An existing copy is revalidated with a conditional GET; a 304 costs no
    /// transfer. A changed object is streamed to a `.partial` file and renamed
    /// into place, so a reader never sees a half-written entry. Failures are
    /// returned as-is, without retry.
    pub async fn ensure_cached(&self, url: &str) -> Result<CachedFile> {
        let cached = self.locate(url)?;
        let local_mtime = tokio::fs::metadata(&cached.path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());

        let mut request = self.http.get(url);
        if let Some(mtime) = local_mtime {
            request = request.header(IF_MODIFIED_SINCE, http_date(mtime));
        }
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED && local_mtime.is_some() {
            tracing::debug!(url, path = %cached.path.display(), "Cache hit");
            touch(&cached.path, None).map_err(cache_io(&cached.path))?;
            return Ok(cached);
        }
        if !status.is_success() {
            return Err(RunnerError::UnexpectedStatus {
                method: "GET",
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let modified = last_modified(response.headers()).unwrap_or_else(SystemTime::now);
        let partial = cached.path.with_extension("partial");
        let written = match self.download(response, &partial).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, &cached.path)
            .await
            .map_err(cache_io(&cached.path))?;
        touch(&cached.path, Some(modified)).map_err(cache_io(&cached.path))?;
        tracing::debug!(url, bytes = written, "Fetched artifact");
        Ok(cached)
    }

    /// Stream a response body into `partial` chunk by chunk.
    async fn download(&self, mut response: reqwest::Response, partial: &Path) -> Result<u64> {
        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(cache_io(partial))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await.map_err(cache_io(partial))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(cache_io(partial))?;
        Ok(written)
    }

    /// Push `local` to `url` and keep a copy in the cache.
    ///
    /// The cached copy is stamped with the server's Last-Modified, so a later
    /// [`ensure_cached`](Self::ensure_cached) is answered with 304.
    pub async fn upload(&self, local: &Path, url: &str) -> Result<CachedFile> {
        let cached = self.locate(url)?;
        let file = tokio::fs::File::open(local).await.map_err(cache_io(local))?;
        let len = file.metadata().await.map_err(cache_io(local))?.len();

        let response = self
            .http
            .put(url)
            .header(CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RunnerError::UnexpectedStatus {
                method: "PUT",
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let modified = last_modified(response.headers()).unwrap_or_else(SystemTime::now);

        let partial = cached.path.with_extension("partial");
        tokio::fs::copy(local, &partial)
            .await
            .map_err(cache_io(&partial))?;
        tokio::fs::set_permissions(&partial, Permissions::from_mode(UPLOAD_MODE))
            .await
            .map_err(cache_io(&partial))?;
        tokio::fs::rename(&partial, &cached.path)
            .await
            .map_err(cache_io(&cached.path))?;
        touch(&cached.path, Some(modified)).map_err(cache_io(&cached.path))?;
        tracing::debug!(url, bytes = len, "Uploaded artifact");
        Ok(cached)
    }
}

/// Refresh atime to now; set mtime only when given.
fn touch(path: &Path, modified: Option<SystemTime>) -> std::io::Result<()> {
    let mut times = FileTimes::new().set_accessed(SystemTime::now());
    if let Some(modified) = modified {
        times = times.set_modified(modified);
    }
    File::open(path)?.set_times(times)
}

fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format(HTTP_DATE).to_string()
}

fn last_modified(headers: &HeaderMap) -> Option<SystemTime> {
    let raw = headers.get(LAST_MODIFIED)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|dt| SystemTime::from(dt.with_timezone(&Utc)))
}
