//! SQLite adapter. Timestamps are stored as Unix milliseconds; the first
//! statement of every write transaction is a write, so the database lock is
//! taken up front and `busy_timeout` handles contention with other processes.

use super::{
    cursor_from_row, schema, AchievementProgress, AppendOutcome, AppliedEffects, Base,
    EffectOutcome, EffectPlan, EventStore, NewBatch, PlayerStats, StoreError, StoredEvent,
    Unlock, WarScore, DAILY_BONUS_REASON,
};
use crate::cursor::CursorState;
use crate::events::DomainEvent;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;

pub struct SqliteStore {
    pool: SqlitePool,
}

fn ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(value: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| StoreError::Decode(format!("timestamp out of range: {}", value)))
}

impl SqliteStore {
    /// Open (creating if needed) a file database, e.g. `sqlite://killfeed.db`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;
        Ok(SqliteStore { pool })
    }

    /// Private in-memory database with the schema applied.
    ///
    /// A single connection that never expires, since each connection to
    /// `:memory:` is a separate database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let store = SqliteStore { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn advance_progress(
        tx: &mut Transaction<'_, Sqlite>,
        plan: &EffectPlan,
        applied: &mut AppliedEffects,
    ) -> Result<(), StoreError> {
        let now = ms(plan.applied_at);
        for step in &plan.progress {
            sqlx::query(
                "INSERT INTO achievement_progress (identity, achievement_key, progress, unlocked, updated_at)
                 VALUES (?1, ?2, 0, 0, ?3)
                 ON CONFLICT (identity, achievement_key) DO NOTHING",
            )
            .bind(&step.identity)
            .bind(&step.key)
            .bind(now)
            .execute(&mut **tx)
            .await?;

            let (progress, unlocked): (i64, bool) = sqlx::query_as(
                "SELECT progress, unlocked FROM achievement_progress
                 WHERE identity = ?1 AND achievement_key = ?2",
            )
            .bind(&step.identity)
            .bind(&step.key)
            .fetch_one(&mut **tx)
            .await?;
            if unlocked {
                continue;
            }

            let next = progress + step.amount.max(0);
            let unlock = next >= step.target;
            sqlx::query(
                "UPDATE achievement_progress
                 SET progress = ?3, unlocked = ?4,
                     unlocked_at = CASE WHEN ?4 THEN ?5 ELSE NULL END, updated_at = ?5
                 WHERE identity = ?1 AND achievement_key = ?2 AND unlocked = 0",
            )
            .bind(&step.identity)
            .bind(&step.key)
            .bind(next)
            .bind(unlock)
            .bind(now)
            .execute(&mut **tx)
            .await?;

            if unlock {
                sqlx::query(
                    "INSERT INTO activity_log (identity, action, details, created_at)
                     VALUES (?1, 'achievement_unlocked', ?2, ?3)",
                )
                .bind(&step.identity)
                .bind(format!("{} ({})", step.name, step.key))
                .bind(now)
                .execute(&mut **tx)
                .await?;
                if step.reward != 0 {
                    insert_ledger(
                        tx,
                        &step.identity,
                        step.reward,
                        &format!("achievement:{}", step.key),
                        now,
                    )
                    .await?;
                }
                applied.unlocked.push(Unlock {
                    identity: step.identity.clone(),
                    gamertag: step.gamertag.clone(),
                    key: step.key.clone(),
                    name: step.name.clone(),
                    reward: step.reward,
                });
            }
        }
        Ok(())
    }
}

async fn insert_ledger(
    tx: &mut Transaction<'_, Sqlite>,
    identity: &str,
    amount: i64,
    reason: &str,
    at_ms: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO economy_ledger (identity, amount, reason, created_at) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(identity)
    .bind(amount)
    .bind(reason)
    .bind(at_ms)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn war_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WarScore, StoreError> {
    Ok(WarScore {
        id: row.try_get("id")?,
        clan1_tag: row.try_get("clan1_tag")?,
        clan2_tag: row.try_get("clan2_tag")?,
        clan1_score: row.try_get("clan1_score")?,
        clan2_score: row.try_get("clan2_score")?,
    })
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(schema::SQLITE).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn register_stream(&self, name: &str) -> Result<i64, StoreError> {
        let result = sqlx::query("INSERT OR IGNORE INTO log_streams (name) VALUES (?1)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 1 {
            return Ok(result.last_insert_rowid());
        }
        let id: i64 = sqlx::query_scalar("SELECT id FROM log_streams WHERE name = ?1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn read_cursor(&self, stream_id: i64) -> Result<Option<CursorState>, StoreError> {
        let row: Option<(i64, i64, Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT generation, line_offset, remote_path, last_fetch FROM log_streams WHERE id = ?1",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some((generation, offset, remote_path, last_fetch)) = row else {
            return Ok(None);
        };
        let last_fetch = last_fetch.map(from_ms).transpose()?;
        Ok(cursor_from_row(generation, offset, remote_path, last_fetch))
    }

    async fn append_batch(&self, batch: &NewBatch<'_>) -> Result<AppendOutcome, StoreError> {
        let plan = &batch.plan;
        let fetched_at = ms(batch.fetched_at);
        let mut tx = self.pool.begin().await?;
        let mut outcome = AppendOutcome::default();

        for (offset, event) in batch.events {
            let pos = event.position();
            let result = sqlx::query(
                "INSERT INTO stream_events
                   (stream_id, generation, line_offset, kind, payload, x, z, occurred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (stream_id, generation, line_offset) DO NOTHING",
            )
            .bind(batch.stream_id)
            .bind(plan.generation)
            .bind(*offset)
            .bind(event.kind().as_str())
            .bind(Json(event))
            .bind(pos.map(|p| p.x))
            .bind(pos.map(|p| p.z))
            .bind(fetched_at)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                outcome.duplicates += 1;
            } else {
                outcome.inserted += 1;
            }
        }

        let advance = if plan.rotated {
            sqlx::query(
                "UPDATE log_streams SET generation = ?2, line_offset = ?3, remote_path = ?4, last_fetch = ?5
                 WHERE id = ?1 AND generation = ?2 - 1",
            )
        } else if plan.initial {
            sqlx::query(
                "UPDATE log_streams SET generation = ?2, line_offset = ?3, remote_path = ?4, last_fetch = ?5
                 WHERE id = ?1 AND remote_path IS NULL",
            )
        } else {
            sqlx::query(
                "UPDATE log_streams SET line_offset = ?3, remote_path = ?4, last_fetch = ?5
                 WHERE id = ?1 AND generation = ?2 AND line_offset = ?6 AND ?6 <= ?3",
            )
        };
        let mut advance = advance
            .bind(batch.stream_id)
            .bind(plan.generation)
            .bind(plan.end)
            .bind(batch.remote_path)
            .bind(fetched_at);
        if !plan.rotated && !plan.initial {
            advance = advance.bind(plan.start);
        }
        let moved = advance.execute(&mut *tx).await?;

        if moved.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::Constraint(format!(
                "cursor for stream {} moved concurrently",
                batch.stream_id
            )));
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn pending_events(
        &self,
        stream_id: i64,
        limit: i64,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let rows: Vec<(i64, i64, i64, i64, Json<DomainEvent>, i64)> = sqlx::query_as(
            "SELECT id, stream_id, generation, line_offset, payload, occurred_at
             FROM stream_events
             WHERE stream_id = ?1 AND dispatched = 0
             ORDER BY generation, line_offset
             LIMIT ?2",
        )
        .bind(stream_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(id, stream_id, generation, offset, Json(event), occurred_at)| {
                Ok(StoredEvent {
                    id,
                    stream_id,
                    generation,
                    offset,
                    event,
                    occurred_at: from_ms(occurred_at)?,
                })
            })
            .collect()
    }

    async fn load_bases(&self) -> Result<Vec<Base>, StoreError> {
        let rows: Vec<(i64, String, Option<String>, String, f64, f64, f64)> = sqlx::query_as(
            "SELECT id, owner_id, clan_tag, name, x, z, radius FROM bases ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, owner_id, clan_tag, name, x, z, radius)| Base {
                id,
                owner_id,
                clan_tag,
                name,
                x,
                z,
                radius,
            })
            .collect())
    }

    async fn identity_for(&self, gamertag: &str) -> Result<Option<String>, StoreError> {
        let identity = sqlx::query_scalar("SELECT identity FROM player_links WHERE gamertag = ?1")
            .bind(gamertag)
            .fetch_optional(&self.pool)
            .await?;
        Ok(identity)
    }

    async fn clan_of(&self, identity: &str) -> Result<Option<String>, StoreError> {
        let clan = sqlx::query_scalar("SELECT clan_tag FROM clan_members WHERE identity = ?1")
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;
        Ok(clan)
    }

    async fn recent_combat_positions(
        &self,
        since: DateTime<Utc>,
        up_to_id: i64,
    ) -> Result<Vec<(f64, f64)>, StoreError> {
        let rows = sqlx::query_as(
            "SELECT x, z FROM stream_events
             WHERE kind IN ('kill', 'death') AND x IS NOT NULL AND z IS NOT NULL
               AND occurred_at >= ?1 AND id <= ?2",
        )
        .bind(ms(since))
        .bind(up_to_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn apply_effects(&self, plan: &EffectPlan) -> Result<EffectOutcome, StoreError> {
        let now = ms(plan.applied_at);
        let mut tx = self.pool.begin().await?;

        let claimed =
            sqlx::query("UPDATE stream_events SET dispatched = 1 WHERE id = ?1 AND dispatched = 0")
                .bind(plan.event_id)
                .execute(&mut *tx)
                .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(EffectOutcome::AlreadyApplied);
        }

        let mut applied = AppliedEffects::default();

        for delta in &plan.stats {
            sqlx::query(
                "INSERT INTO player_stats
                   (gamertag, kills, deaths, zombie_kills, fish_caught, placements,
                    killstreak, best_killstreak, longest_shot, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?9)
                 ON CONFLICT (gamertag) DO UPDATE SET
                   kills = player_stats.kills + excluded.kills,
                   deaths = player_stats.deaths + excluded.deaths,
                   zombie_kills = player_stats.zombie_kills + excluded.zombie_kills,
                   fish_caught = player_stats.fish_caught + excluded.fish_caught,
                   placements = player_stats.placements + excluded.placements,
                   killstreak = CASE WHEN ?10 THEN 0
                                     ELSE player_stats.killstreak + excluded.killstreak END,
                   best_killstreak = MAX(player_stats.best_killstreak,
                                         CASE WHEN ?10 THEN 0
                                              ELSE player_stats.killstreak + excluded.killstreak END),
                   longest_shot = MAX(player_stats.longest_shot, excluded.longest_shot),
                   updated_at = excluded.updated_at",
            )
            .bind(&delta.gamertag)
            .bind(delta.kills)
            .bind(delta.deaths)
            .bind(delta.zombie_kills)
            .bind(delta.fish_caught)
            .bind(delta.placements)
            .bind(delta.streak_increment())
            .bind(delta.shot_distance)
            .bind(now)
            .bind(delta.streak_reset())
            .execute(&mut *tx)
            .await?;
        }

        Self::advance_progress(&mut tx, plan, &mut applied).await?;

        for entry in &plan.ledger {
            insert_ledger(&mut tx, &entry.identity, entry.amount, &entry.reason, now).await?;
        }

        if let Some(bonus) = &plan.daily_bonus {
            let recent: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM economy_ledger
                 WHERE identity = ?1 AND reason = ?2 AND created_at > ?3",
            )
            .bind(&bonus.identity)
            .bind(DAILY_BONUS_REASON)
            .bind(ms(plan.applied_at - Duration::hours(24)))
            .fetch_one(&mut *tx)
            .await?;
            if recent == 0 {
                insert_ledger(&mut tx, &bonus.identity, bonus.amount, DAILY_BONUS_REASON, now)
                    .await?;
                applied.daily_bonus_paid = true;
            }
        }

        if let Some(hit) = &plan.war {
            let row = sqlx::query(
                "UPDATE clan_wars SET
                   clan1_score = clan1_score + CASE WHEN clan1_tag = ?1 THEN 1 ELSE 0 END,
                   clan2_score = clan2_score + CASE WHEN clan2_tag = ?1 THEN 1 ELSE 0 END
                 WHERE id = (
                   SELECT id FROM clan_wars
                   WHERE active AND ((clan1_tag = ?1 AND clan2_tag = ?2)
                                  OR (clan1_tag = ?2 AND clan2_tag = ?1))
                   ORDER BY id DESC LIMIT 1)
                 RETURNING id, clan1_tag, clan2_tag, clan1_score, clan2_score",
            )
            .bind(&hit.killer_clan)
            .bind(&hit.victim_clan)
            .fetch_optional(&mut *tx)
            .await?;
            applied.war = row.as_ref().map(war_from_row).transpose()?;
        }

        tx.commit().await?;
        Ok(EffectOutcome::Applied(applied))
    }

    async fn player_stats(&self, gamertag: &str) -> Result<Option<PlayerStats>, StoreError> {
        let row: Option<(String, i64, i64, i64, i64, i64, i64, i64, f64)> = sqlx::query_as(
            "SELECT gamertag, kills, deaths, zombie_kills, fish_caught, placements,
                    killstreak, best_killstreak, longest_shot
             FROM player_stats WHERE gamertag = ?1",
        )
        .bind(gamertag)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(
            |(gamertag, kills, deaths, zombie_kills, fish_caught, placements, killstreak, best_killstreak, longest_shot)| {
                PlayerStats {
                    gamertag,
                    kills,
                    deaths,
                    zombie_kills,
                    fish_caught,
                    placements,
                    killstreak,
                    best_killstreak,
                    longest_shot,
                }
            },
        ))
    }

    async fn achievement_progress(
        &self,
        identity: &str,
        key: &str,
    ) -> Result<Option<AchievementProgress>, StoreError> {
        let row: Option<(i64, bool, Option<i64>)> = sqlx::query_as(
            "SELECT progress, unlocked, unlocked_at FROM achievement_progress
             WHERE identity = ?1 AND achievement_key = ?2",
        )
        .bind(identity)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        let Some((progress, unlocked, unlocked_at)) = row else {
            return Ok(None);
        };
        Ok(Some(AchievementProgress {
            identity: identity.to_string(),
            key: key.to_string(),
            progress,
            unlocked,
            unlocked_at: unlocked_at.map(from_ms).transpose()?,
        }))
    }

    async fn balance(&self, identity: &str) -> Result<i64, StoreError> {
        let sum: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(amount), 0) FROM economy_ledger WHERE identity = ?1")
                .bind(identity)
                .fetch_one(&self.pool)
                .await?;
        Ok(sum)
    }

    async fn activity_count(&self, identity: &str) -> Result<i64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM activity_log WHERE identity = ?1")
            .bind(identity)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    async fn active_war(
        &self,
        clan_a: &str,
        clan_b: &str,
    ) -> Result<Option<WarScore>, StoreError> {
        let row = sqlx::query(
            "SELECT id, clan1_tag, clan2_tag, clan1_score, clan2_score FROM clan_wars
             WHERE active AND ((clan1_tag = ?1 AND clan2_tag = ?2)
                            OR (clan1_tag = ?2 AND clan2_tag = ?1))
             ORDER BY id DESC LIMIT 1",
        )
        .bind(clan_a)
        .bind(clan_b)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(war_from_row).transpose()
    }
}
