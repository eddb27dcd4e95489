//! # Store: Durable Events, Cursors, and Effects
//!
//! [`EventStore`] is the only storage surface the pipeline sees. Two adapters
//! implement it with identical semantics:
//!
//! - [`PgStore`] over `sqlx::PgPool` (shared with the dashboard and command
//!   processes in production)
//! - [`SqliteStore`] over `sqlx::SqlitePool` (single-file deployments, tests)
//!
//! Placeholder syntax, insert-id retrieval, timestamp encoding and row
//! locking differ per backend and stay inside the adapters.
//!
//! ## Tables
//!
//! - `log_streams`: one cursor per stream (`generation`, `line_offset`)
//! - `stream_events`: classified events, unique on
//!   `(stream_id, generation, line_offset)`, with a `dispatched` flag
//! - `player_links`, `clan_members`, `bases`: read-only to the pipeline
//! - `player_stats`, `achievement_progress`, `activity_log`,
//!   `economy_ledger`, `clan_wars`: effect targets
//!
//! ## Transactions
//!
//! [`EventStore::append_batch`] writes the event rows and the new cursor in
//! one transaction; a duplicate row is skipped, not an error.
//! [`EventStore::apply_effects`] flips the event's `dispatched` flag as its
//! first statement and bails out when the flag was already set, so a given
//! event's durable effects land at most once.

mod postgres;
pub mod schema;
mod sqlite;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

use crate::cursor::{CursorPlan, CursorState};
use crate::events::DomainEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Reason recorded on daily login bonus ledger rows.
pub const DAILY_BONUS_REASON: &str = "daily_bonus";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database busy: {0}")]
    Busy(String),
    #[error("database operation timed out")]
    Timeout,
    #[error("database connection failed: {0}")]
    Connection(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("cannot decode row: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Other(String),
}

impl StoreError {
    /// Worth retrying the same operation after a short delay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Busy(_) | StoreError::Timeout | StoreError::Connection(_)
        )
    }
}

/// SQLSTATE codes (Postgres) and result codes (SQLite) that mean "try again".
const BUSY_CODES: [&str; 6] = ["40001", "40P01", "55P03", "5", "6", "517"];

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation()
                {
                    StoreError::Constraint(db.message().to_string())
                } else if BUSY_CODES.contains(&code.as_str())
                    || db.message().contains("database is locked")
                {
                    StoreError::Busy(db.message().to_string())
                } else {
                    StoreError::Other(db.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => StoreError::Timeout,
            sqlx::Error::Io(e) => StoreError::Connection(e.to_string()),
            sqlx::Error::Tls(e) => StoreError::Connection(e.to_string()),
            sqlx::Error::PoolClosed => StoreError::Connection("pool closed".to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. } => StoreError::Decode(e.to_string()),
            other => StoreError::Other(other.to_string()),
        }
    }
}

// ── Types ───────────────────────────────────────────────────────

/// One cycle's worth of classified lines plus the cursor to persist.
#[derive(Debug, Clone)]
pub struct NewBatch<'a> {
    pub stream_id: i64,
    pub plan: CursorPlan,
    pub remote_path: &'a str,
    /// `(line offset, event)` pairs, offsets within `plan.generation`.
    pub events: &'a [(i64, DomainEvent)],
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppendOutcome {
    pub inserted: u64,
    pub duplicates: u64,
}

/// An event row awaiting (or past) dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub stream_id: i64,
    pub generation: i64,
    pub offset: i64,
    pub event: DomainEvent,
    pub occurred_at: DateTime<Utc>,
}

/// A protected zone registered by the command surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Base {
    pub id: i64,
    pub owner_id: String,
    pub clan_tag: Option<String>,
    pub name: String,
    pub x: f64,
    pub z: f64,
    pub radius: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreakChange {
    Keep,
    Extend,
    Reset,
}

/// Counter increments for one gamertag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatDelta {
    pub gamertag: String,
    pub kills: i64,
    pub deaths: i64,
    pub zombie_kills: i64,
    pub fish_caught: i64,
    pub placements: i64,
    pub streak: StreakChange,
    /// Candidate for `longest_shot`; 0 when the event carries no distance.
    pub shot_distance: f64,
}

impl StatDelta {
    pub fn new(gamertag: &str) -> Self {
        StatDelta {
            gamertag: gamertag.to_string(),
            kills: 0,
            deaths: 0,
            zombie_kills: 0,
            fish_caught: 0,
            placements: 0,
            streak: StreakChange::Keep,
            shot_distance: 0.0,
        }
    }

    pub(crate) fn streak_increment(&self) -> i64 {
        i64::from(self.streak == StreakChange::Extend)
    }

    pub(crate) fn streak_reset(&self) -> bool {
        self.streak == StreakChange::Reset
    }
}

/// Progress increment toward one achievement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressStep {
    pub identity: String,
    pub gamertag: String,
    pub key: String,
    pub name: String,
    pub target: i64,
    pub reward: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub identity: String,
    pub amount: i64,
    pub reason: String,
}

/// A kill between members of two different clans.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarHit {
    pub killer_clan: String,
    pub victim_clan: String,
}

/// Every durable mutation caused by one event, applied atomically.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectPlan {
    pub event_id: i64,
    pub applied_at: DateTime<Utc>,
    pub stats: Vec<StatDelta>,
    pub progress: Vec<ProgressStep>,
    pub ledger: Vec<LedgerEntry>,
    pub daily_bonus: Option<LedgerEntry>,
    pub war: Option<WarHit>,
}

impl EffectPlan {
    pub fn empty(event_id: i64, applied_at: DateTime<Utc>) -> Self {
        EffectPlan {
            event_id,
            applied_at,
            stats: Vec::new(),
            progress: Vec::new(),
            ledger: Vec::new(),
            daily_bonus: None,
            war: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unlock {
    pub identity: String,
    pub gamertag: String,
    pub key: String,
    pub name: String,
    pub reward: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarScore {
    pub id: i64,
    pub clan1_tag: String,
    pub clan2_tag: String,
    pub clan1_score: i64,
    pub clan2_score: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppliedEffects {
    pub unlocked: Vec<Unlock>,
    pub daily_bonus_paid: bool,
    pub war: Option<WarScore>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EffectOutcome {
    Applied(AppliedEffects),
    /// The event was dispatched by an earlier attempt; nothing was written.
    AlreadyApplied,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlayerStats {
    pub gamertag: String,
    pub kills: i64,
    pub deaths: i64,
    pub zombie_kills: i64,
    pub fish_caught: i64,
    pub placements: i64,
    pub killstreak: i64,
    pub best_killstreak: i64,
    pub longest_shot: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AchievementProgress {
    pub identity: String,
    pub key: String,
    pub progress: i64,
    pub unlocked: bool,
    pub unlocked_at: Option<DateTime<Utc>>,
}

// ── Contract ────────────────────────────────────────────────────

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Create missing tables and indexes.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// `SELECT 1` round trip for readiness probes.
    async fn health_check(&self) -> Result<(), StoreError>;

    /// Id of the stream row named `name`, creating it on first use.
    async fn register_stream(&self, name: &str) -> Result<i64, StoreError>;

    /// Stored cursor, or `None` if no batch has ever committed for the stream.
    async fn read_cursor(&self, stream_id: i64) -> Result<Option<CursorState>, StoreError>;

    /// Insert the batch's events and persist `batch.plan` in one transaction.
    ///
    /// Fails with [`StoreError::Constraint`] without writing anything when the
    /// stored cursor no longer matches the plan's starting point.
    async fn append_batch(&self, batch: &NewBatch<'_>) -> Result<AppendOutcome, StoreError>;

    /// Undispatched events of a stream in `(generation, offset)` order.
    async fn pending_events(
        &self,
        stream_id: i64,
        limit: i64,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    async fn load_bases(&self) -> Result<Vec<Base>, StoreError>;

    /// Account identity linked to a gamertag.
    async fn identity_for(&self, gamertag: &str) -> Result<Option<String>, StoreError>;

    async fn clan_of(&self, identity: &str) -> Result<Option<String>, StoreError>;

    /// Coordinates of kill/death events stored at or after `since`, limited
    /// to rows with id up to `up_to_id`.
    async fn recent_combat_positions(
        &self,
        since: DateTime<Utc>,
        up_to_id: i64,
    ) -> Result<Vec<(f64, f64)>, StoreError>;

    /// Apply all durable effects of one event and mark it dispatched.
    async fn apply_effects(&self, plan: &EffectPlan) -> Result<EffectOutcome, StoreError>;

    async fn player_stats(&self, gamertag: &str) -> Result<Option<PlayerStats>, StoreError>;

    async fn achievement_progress(
        &self,
        identity: &str,
        key: &str,
    ) -> Result<Option<AchievementProgress>, StoreError>;

    /// Running sum of the identity's ledger.
    async fn balance(&self, identity: &str) -> Result<i64, StoreError>;

    async fn activity_count(&self, identity: &str) -> Result<i64, StoreError>;

    async fn active_war(
        &self,
        clan_a: &str,
        clan_b: &str,
    ) -> Result<Option<WarScore>, StoreError>;
}

/// Open the backend named by the URL scheme.
///
/// `postgres://` and `postgresql://` select [`PgStore`]; `sqlite:` selects
/// [`SqliteStore`].
pub async fn connect(database_url: &str) -> Result<Arc<dyn EventStore>, StoreError> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        Ok(Arc::new(PgStore::connect(database_url).await?))
    } else if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteStore::connect(database_url).await?))
    } else {
        Err(StoreError::Connection(format!(
            "unsupported database url scheme: {}",
            database_url.split(':').next().unwrap_or_default()
        )))
    }
}

/// Cursor state from a `log_streams` row; `None` until the first commit.
pub(crate) fn cursor_from_row(
    generation: i64,
    offset: i64,
    remote_path: Option<String>,
    last_fetch: Option<DateTime<Utc>>,
) -> Option<CursorState> {
    remote_path.as_ref()?;
    Some(CursorState {
        generation,
        offset,
        remote_path,
        last_fetch,
    })
}
