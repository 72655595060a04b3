//! Shared fixtures for judge-runner integration tests.
//!
//! Provides an in-process object store speaking the subset of HTTP the
//! artifact cache uses, queue fixtures on top of `MemoryStore`, and polling
//! helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path as UrlPath, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use judge_runner::config::RunnerConfig;
use judge_runner::queue::{MemoryStore, QueueClient};

/// Runner configuration with short timeouts, rooted in `root`.
pub fn test_config(id: u64, group: &str, root: &Path) -> RunnerConfig {
    let mut config = RunnerConfig::new(id, group)
        .with_dirs(root.join("work"), root.join("cache"));
    config.poll_timeout_secs = 1;
    config.retry_backoff_ms = 50;
    config.heartbeat_interval_ms = 50;
    config
}

/// Queue client on a fresh in-process store.
pub fn memory_queue(config: &RunnerConfig) -> (MemoryStore, QueueClient) {
    let store = MemoryStore::new();
    let client = QueueClient::new(Arc::new(store.clone()), config);
    (store, client)
}

// =============================================================================
// Mock object store
// =============================================================================

#[derive(Clone)]
struct Object {
    body: Vec<u8>,
    last_modified: SystemTime,
}

#[derive(Default)]
struct StoreState {
    objects: Mutex<HashMap<String, Object>>,
    full_gets: AtomicUsize,
    not_modified: AtomicUsize,
    puts: AtomicUsize,
}

/// HTTP object store honoring `If-Modified-Since` and accepting `PUT`.
pub struct ObjectStore {
    pub base_url: String,
    state: Arc<StoreState>,
    handle: JoinHandle<()>,
}

/// Whole seconds, as HTTP dates carry no more.
fn whole_seconds(time: SystemTime) -> SystemTime {
    let secs = time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn http_date(time: SystemTime) -> HeaderValue {
    let rendered = DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    HeaderValue::from_str(&rendered).unwrap()
}

async fn get_object(
    State(state): State<Arc<StoreState>>,
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let object = state.objects.lock().unwrap().get(&path).cloned();
    let Some(object) = object else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|dt| SystemTime::from(dt.with_timezone(&Utc)));
    if since.is_some_and(|since| object.last_modified <= since) {
        state.not_modified.fetch_add(1, Ordering::SeqCst);
        return StatusCode::NOT_MODIFIED.into_response();
    }

    state.full_gets.fetch_add(1, Ordering::SeqCst);
    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::LAST_MODIFIED, http_date(object.last_modified));
    (StatusCode::OK, response_headers, object.body).into_response()
}

async fn put_object(
    State(state): State<Arc<StoreState>>,
    UrlPath(path): UrlPath<String>,
    body: Bytes,
) -> Response {
    state.puts.fetch_add(1, Ordering::SeqCst);
    let last_modified = whole_seconds(SystemTime::now());
    state.objects.lock().unwrap().insert(
        path,
        Object {
            body: body.to_vec(),
            last_modified,
        },
    );
    let mut headers = HeaderMap::new();
    headers.insert(header::LAST_MODIFIED, http_date(last_modified));
    (StatusCode::CREATED, headers).into_response()
}

impl ObjectStore {
    pub async fn start() -> Self {
        let state = Arc::new(StoreState::default());
        let app = Router::new()
            .route("/{*path}", get(get_object).put(put_object))
            .layer(DefaultBodyLimit::disable())
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Store an object last modified `age` ago.
    pub fn insert_aged(&self, path: &str, body: impl Into<Vec<u8>>, age: Duration) {
        let last_modified = whole_seconds(SystemTime::now() - age);
        self.state.objects.lock().unwrap().insert(
            path.trim_start_matches('/').to_string(),
            Object {
                body: body.into(),
                last_modified,
            },
        );
    }

    pub fn insert(&self, path: &str, body: impl Into<Vec<u8>>) {
        self.insert_aged(path, body, Duration::from_secs(60));
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .objects
            .lock()
            .unwrap()
            .get(path.trim_start_matches('/'))
            .map(|o| o.body.clone())
    }

    pub fn full_gets(&self) -> usize {
        self.state.full_gets.load(Ordering::SeqCst)
    }

    pub fn not_modified(&self) -> usize {
        self.state.not_modified.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.state.puts.load(Ordering::SeqCst)
    }
}

impl Drop for ObjectStore {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// =============================================================================
// Polling helpers
// =============================================================================

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
