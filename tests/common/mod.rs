//! Shared test helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use killfeed::config::{Config, FetchConfig, PipelineConfig, StreamConfig};
use killfeed::dispatcher::Dispatcher;
use killfeed::fetcher::{FetchError, Fetcher, RemoteConnector, RemoteSession};
use killfeed::notify::{Notification, Notifier, NotifyError};
use killfeed::prom_metrics::Metrics;
use killfeed::store::{EventStore, SqliteStore};
use killfeed::StreamWorker;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

/// Skip the current test when no Postgres test database is configured.
#[macro_export]
macro_rules! require_db {
    () => {
        if !common::has_test_db() {
            eprintln!("Skipping: TEST_DATABASE_URL not set");
            return;
        }
    };
}

// ── Store seeding ───────────────────────────────────────────────

pub async fn sqlite_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::in_memory().await.unwrap())
}

pub async fn link_player(store: &SqliteStore, gamertag: &str, identity: &str) {
    sqlx::query("INSERT INTO player_links (gamertag, identity) VALUES (?1, ?2)")
        .bind(gamertag)
        .bind(identity)
        .execute(store.pool())
        .await
        .unwrap();
}

pub async fn join_clan(store: &SqliteStore, identity: &str, clan: &str) {
    sqlx::query("INSERT INTO clan_members (identity, clan_tag) VALUES (?1, ?2)")
        .bind(identity)
        .bind(clan)
        .execute(store.pool())
        .await
        .unwrap();
}

pub async fn add_base(
    store: &SqliteStore,
    owner: &str,
    clan: Option<&str>,
    name: &str,
    x: f64,
    z: f64,
    radius: f64,
) {
    sqlx::query(
        "INSERT INTO bases (owner_id, clan_tag, name, x, z, radius) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(owner)
    .bind(clan)
    .bind(name)
    .bind(x)
    .bind(z)
    .bind(radius)
    .execute(store.pool())
    .await
    .unwrap();
}

pub async fn start_war(store: &SqliteStore, clan1: &str, clan2: &str) {
    sqlx::query("INSERT INTO clan_wars (clan1_tag, clan2_tag, active) VALUES (?1, ?2, 1)")
        .bind(clan1)
        .bind(clan2)
        .execute(store.pool())
        .await
        .unwrap();
}

// ── Scripted remote source ──────────────────────────────────────

#[derive(Default)]
struct RemoteState {
    /// directory -> file name -> content
    dirs: BTreeMap<String, BTreeMap<String, String>>,
    failure: Option<FetchError>,
    connects: u32,
}

/// In-memory file host. Clones share the same state.
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, dir: &str, name: &str, content: &str) {
        let mut s = self.state.lock().unwrap();
        s.dirs
            .entry(dir.to_string())
            .or_default()
            .insert(name.to_string(), content.to_string());
    }

    pub fn append(&self, dir: &str, name: &str, content: &str) {
        let mut s = self.state.lock().unwrap();
        s.dirs
            .entry(dir.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default()
            .push_str(content);
    }

    pub fn remove(&self, dir: &str, name: &str) {
        let mut s = self.state.lock().unwrap();
        if let Some(files) = s.dirs.get_mut(dir) {
            files.remove(name);
        }
    }

    /// Every connection attempt fails with `error` until cleared.
    pub fn fail_with(&self, error: Option<FetchError>) {
        self.state.lock().unwrap().failure = error;
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }
}

struct FakeSession {
    state: Arc<Mutex<RemoteState>>,
}

impl RemoteSession for FakeSession {
    fn list(&mut self, dir: &str) -> Result<Vec<String>, FetchError> {
        let s = self.state.lock().unwrap();
        s.dirs
            .get(dir)
            .map(|files| files.keys().cloned().collect())
            .ok_or_else(|| FetchError::NotFound(dir.to_string()))
    }

    fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, FetchError> {
        let s = self.state.lock().unwrap();
        let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
        s.dirs
            .get(dir)
            .and_then(|files| files.get(name))
            .map(|content| content.clone().into_bytes())
            .ok_or_else(|| FetchError::NotFound(path.to_string()))
    }

    fn close(self: Box<Self>) {}
}

impl RemoteConnector for FakeRemote {
    fn connect(
        &self,
        _stream: &StreamConfig,
        _timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, FetchError> {
        let mut s = self.state.lock().unwrap();
        s.connects += 1;
        if let Some(e) = &s.failure {
            return Err(e.clone());
        }
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
        }))
    }
}

// ── Notifiers ───────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.sent().into_iter().map(|n| n.title).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Rejects every notification as if the webhook answered 500.
#[derive(Default)]
pub struct FailingNotifier {
    attempts: Mutex<u32>,
}

impl FailingNotifier {
    pub fn attempts(&self) -> u32 {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl Notifier for FailingNotifier {
    async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
        *self.attempts.lock().unwrap() += 1;
        Err(NotifyError::Status(500))
    }
}

// ── Pipeline wiring ─────────────────────────────────────────────

pub const LOG_DIR: &str = "profile";
pub const LOG_FILE: &str = "DayZServer_2024_06_01.ADM";

pub fn stream_config(name: &str) -> StreamConfig {
    StreamConfig {
        name: name.to_string(),
        host: "fake.invalid".to_string(),
        port: 21,
        username: "ops".to_string(),
        password_env: "KILLFEED_TEST_PASSWORD".to_string(),
        directories: vec!["missing".to_string(), LOG_DIR.to_string()],
        file_name: None,
        extensions: vec![".ADM".to_string(), ".RPT".to_string()],
        use_tls: false,
        allow_insecure_fallback: false,
        backfill: true,
    }
}

pub fn test_config() -> Config {
    Config {
        pipeline: PipelineConfig {
            interval_secs: 1,
            fetch_timeout_secs: 5,
            commit_timeout_secs: 5,
            dispatch_batch: 500,
            store_retry_attempts: 2,
            store_retry_delay_ms: 1,
        },
        fetch: FetchConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            connect_timeout_secs: 1,
        },
        streams: vec![stream_config("adm")],
        ..Config::default()
    }
}

/// A worker for the first configured stream.
pub fn worker(
    config: Config,
    store: Arc<SqliteStore>,
    remote: &FakeRemote,
    notifier: Arc<dyn Notifier>,
) -> (StreamWorker, Arc<Metrics>) {
    let config = Arc::new(config);
    let store: Arc<dyn EventStore> = store;
    let metrics = Arc::new(Metrics::new());
    let fetcher = Fetcher::new(Arc::new(remote.clone()), config.fetch.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        notifier,
        Arc::clone(&metrics),
        Arc::clone(&config),
    ));
    let worker = StreamWorker::new(
        config.streams[0].clone(),
        config.pipeline.clone(),
        store,
        fetcher,
        dispatcher,
        Arc::clone(&metrics),
    );
    (worker, metrics)
}
