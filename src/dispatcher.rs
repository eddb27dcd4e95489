//! # Dispatcher: Event Effects and Notifications
//!
//! Consumes a stream's undispatched events in `(generation, offset)` order.
//! For each event:
//!
//! 1. Resolve the involved players' account identities and clans (through
//!    [`TtlCache`]s, so the link tables are not hit per event).
//! 2. Build an [`EffectPlan`] with [`plan_effects`]: stat counters, streaks,
//!    achievement progress, economy deltas, daily bonus, clan-war hit.
//! 3. Apply the plan in one store transaction, retrying transient failures.
//!    A persistent failure ends the cycle; the event and everything after it
//!    stay pending for the next cycle.
//! 4. Send notifications (territory, kill feed, war score, unlocks, hot zone).
//!    Delivery is best-effort: failures are logged and counted and never
//!    touch durable state.
//!
//! The territory index is rebuilt from the store at the start of every
//! dispatch cycle.

use crate::cache::TtlCache;
use crate::config::Config;
use crate::events::{planar_distance, DomainEvent, EventKind};
use crate::notify::{
    Notification, Notifier, COLOR_ACHIEVEMENT, COLOR_ALERT, COLOR_HOTZONE, COLOR_KILL,
    COLOR_VIOLATION, COLOR_WAR,
};
use crate::prom_metrics::Metrics;
use crate::store::{
    AppliedEffects, EffectOutcome, EffectPlan, EventStore, LedgerEntry, ProgressStep, StatDelta,
    StoreError, StoredEvent, StreakChange, WarHit, DAILY_BONUS_REASON,
};
use crate::territory::{Actor, ProximityTier, TerritoryIndex};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A player taking part in an event, with whatever account links exist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Party {
    pub gamertag: String,
    pub identity: Option<String>,
    pub clan: Option<String>,
}

impl Party {
    pub fn unlinked(gamertag: &str) -> Self {
        Party {
            gamertag: gamertag.to_string(),
            ..Party::default()
        }
    }

    fn as_actor(&self) -> Actor<'_> {
        Actor {
            identity: self.identity.as_deref(),
            clan: self.clan.as_deref(),
        }
    }
}

/// Durable effects of one stored event.
///
/// `actor` is the credited player (see [`DomainEvent::actor`]); `victim` is
/// only present for PvP kills.
pub fn plan_effects(
    stored: &StoredEvent,
    actor: &Party,
    victim: Option<&Party>,
    config: &Config,
) -> EffectPlan {
    let mut plan = EffectPlan::empty(stored.id, stored.occurred_at);
    let kind = stored.event.kind();

    match &stored.event {
        DomainEvent::Kill {
            killer,
            victim,
            distance,
            ..
        } => {
            let mut k = StatDelta::new(killer);
            k.kills = 1;
            k.streak = StreakChange::Extend;
            k.shot_distance = *distance;
            let mut v = StatDelta::new(victim);
            v.deaths = 1;
            v.streak = StreakChange::Reset;
            plan.stats = vec![k, v];
        }
        DomainEvent::Death { victim, .. } => {
            let mut v = StatDelta::new(victim);
            v.deaths = 1;
            v.streak = StreakChange::Reset;
            plan.stats.push(v);
        }
        DomainEvent::ZombieKill { gamertag } => {
            let mut d = StatDelta::new(gamertag);
            d.zombie_kills = 1;
            plan.stats.push(d);
        }
        DomainEvent::FishCaught { gamertag, .. } => {
            let mut d = StatDelta::new(gamertag);
            d.fish_caught = 1;
            plan.stats.push(d);
        }
        DomainEvent::Placement { gamertag, .. } => {
            let mut d = StatDelta::new(gamertag);
            d.placements = 1;
            plan.stats.push(d);
        }
        DomainEvent::Connection { .. } => {}
    }

    if let Some(identity) = actor.identity.as_deref() {
        plan.progress = config
            .achievements
            .iter()
            .filter(|def| def.event == kind)
            .map(|def| ProgressStep {
                identity: identity.to_string(),
                gamertag: actor.gamertag.clone(),
                key: def.key.clone(),
                name: def.name.clone(),
                target: def.target,
                reward: def.reward,
                amount: 1,
            })
            .collect();

        let delta = config.economy.delta_for(kind);
        if delta != 0 {
            plan.ledger.push(LedgerEntry {
                identity: identity.to_string(),
                amount: delta,
                reason: kind.as_str().to_string(),
            });
        }

        if kind == EventKind::Connection && config.economy.daily_bonus > 0 {
            plan.daily_bonus = Some(LedgerEntry {
                identity: identity.to_string(),
                amount: config.economy.daily_bonus,
                reason: DAILY_BONUS_REASON.to_string(),
            });
        }
    }

    if let Some(victim) = victim {
        if let (Some(a), Some(v)) = (actor.clan.as_deref(), victim.clan.as_deref()) {
            if a != v {
                plan.war = Some(WarHit {
                    killer_clan: a.to_string(),
                    victim_clan: v.to_string(),
                });
            }
        }
    }

    plan
}

/// Per-cycle counts, logged by the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub dispatched: u64,
    pub already_applied: u64,
    pub unlocked: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
}

pub struct Dispatcher {
    store: Arc<dyn EventStore>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<Metrics>,
    config: Arc<Config>,
    identities: TtlCache<String, Option<String>>,
    clans: TtlCache<String, Option<String>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn EventStore>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<Metrics>,
        config: Arc<Config>,
    ) -> Self {
        let capacity = config.cache.capacity;
        let ttl = config.cache.ttl();
        Dispatcher {
            store,
            notifier,
            metrics,
            config,
            identities: TtlCache::new(capacity, ttl),
            clans: TtlCache::new(capacity, ttl),
        }
    }

    /// Run a store operation, retrying transient failures with linear backoff.
    async fn with_retry<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.config.pipeline.store_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.config.pipeline.store_retry_delay() * attempt;
                    warn!(op, attempt, error = %e, "transient store error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn resolve(&self, gamertag: &str) -> Result<Party, StoreError> {
        let key = gamertag.to_string();
        let identity = match self.identities.get(&key) {
            Some(cached) => cached,
            None => {
                let found = self
                    .with_retry("identity_for", || self.store.identity_for(gamertag))
                    .await?;
                self.identities.insert(key, found.clone());
                found
            }
        };

        let clan = match identity.as_deref() {
            None => None,
            Some(id) => match self.clans.get(&id.to_string()) {
                Some(cached) => cached,
                None => {
                    let found = self.with_retry("clan_of", || self.store.clan_of(id)).await?;
                    self.clans.insert(id.to_string(), found.clone());
                    found
                }
            },
        };

        Ok(Party {
            gamertag: gamertag.to_string(),
            identity,
            clan,
        })
    }

    /// Dispatch up to `pipeline.dispatch_batch` pending events of one stream.
    ///
    /// Returns an error only for a durable-effect failure that survived the
    /// retries; the failed event stays pending.
    pub async fn dispatch_pending(
        &self,
        stream: &str,
        stream_id: i64,
    ) -> Result<DispatchReport, StoreError> {
        let bases = self.with_retry("load_bases", || self.store.load_bases()).await?;
        let territory = TerritoryIndex::new(bases, self.config.territory.alert_margin);

        let limit = self.config.pipeline.dispatch_batch;
        let pending = self
            .with_retry("pending_events", || self.store.pending_events(stream_id, limit))
            .await?;

        let mut report = DispatchReport::default();
        for stored in &pending {
            self.dispatch_one(stream, stored, &territory, &mut report)
                .await?;
        }

        if report.unlocked > 0 {
            Metrics::stream(&self.metrics.achievements_unlocked, stream).inc_by(report.unlocked);
        }
        if report.notifications_failed > 0 {
            Metrics::stream(&self.metrics.notifications_failed, stream)
                .inc_by(report.notifications_failed);
        }
        Ok(report)
    }

    async fn dispatch_one(
        &self,
        stream: &str,
        stored: &StoredEvent,
        territory: &TerritoryIndex,
        report: &mut DispatchReport,
    ) -> Result<(), StoreError> {
        let actor = self.resolve(stored.event.actor()).await?;
        let victim = match &stored.event {
            DomainEvent::Kill { victim, .. } => Some(self.resolve(victim).await?),
            _ => None,
        };

        let plan = plan_effects(stored, &actor, victim.as_ref(), &self.config);
        let outcome = self
            .with_retry("apply_effects", || self.store.apply_effects(&plan))
            .await?;

        let effects = match outcome {
            EffectOutcome::Applied(effects) => effects,
            EffectOutcome::AlreadyApplied => {
                debug!(stream, event_id = stored.id, "event already dispatched");
                report.already_applied += 1;
                return Ok(());
            }
        };
        report.dispatched += 1;
        report.unlocked += effects.unlocked.len() as u64;
        if effects.daily_bonus_paid {
            info!(stream, gamertag = %actor.gamertag, "daily bonus paid");
        }

        let mut notifications = self.notifications_for(stored, &actor, territory, &effects);
        if let Some(hot) = self.hot_zone(stored).await {
            notifications.push(hot);
        }

        for n in &notifications {
            match self.notifier.send(n).await {
                Ok(()) => report.notifications_sent += 1,
                Err(e) => {
                    warn!(stream, event_id = stored.id, title = %n.title, error = %e, "notification failed");
                    report.notifications_failed += 1;
                }
            }
        }
        Ok(())
    }

    fn notifications_for(
        &self,
        stored: &StoredEvent,
        actor: &Party,
        territory: &TerritoryIndex,
        effects: &AppliedEffects,
    ) -> Vec<Notification> {
        let event = &stored.event;
        let mut out = Vec::new();

        if let Some(pos) = event.position() {
            if let Some(prox) = territory.classify(pos.x, pos.z, &actor.as_actor()) {
                let recipient = prox
                    .base
                    .clan_tag
                    .clone()
                    .unwrap_or_else(|| prox.base.owner_id.clone());
                let description = format!(
                    "{} ({:.0}m from {})",
                    event.summary(),
                    prox.distance,
                    prox.base.name
                );
                match prox.tier {
                    ProximityTier::Violation => out.push(
                        Notification::new("Base breach", description, COLOR_VIOLATION)
                            .urgent()
                            .to(recipient),
                    ),
                    ProximityTier::Alert => out.push(
                        Notification::new("Activity near base", description, COLOR_ALERT)
                            .to(recipient),
                    ),
                    ProximityTier::Safe => {}
                }
            }
        }

        if self.config.notifications.announce_kills {
            if let DomainEvent::Kill { location, .. } = event {
                let mut description = event.summary();
                if let Some(loc) = location {
                    description = format!("{} at {}", description, loc);
                }
                out.push(Notification::new("Kill", description, COLOR_KILL));
            }
        }

        if let Some(war) = &effects.war {
            out.push(Notification::new(
                "War update",
                format!(
                    "{} {} - {} {}",
                    war.clan1_tag, war.clan1_score, war.clan2_score, war.clan2_tag
                ),
                COLOR_WAR,
            ));
        }

        for unlock in &effects.unlocked {
            out.push(
                Notification::new(
                    "Achievement unlocked",
                    format!(
                        "{} unlocked {} (+{})",
                        unlock.gamertag, unlock.name, unlock.reward
                    ),
                    COLOR_ACHIEVEMENT,
                )
                .to(unlock.identity.clone()),
            );
        }

        out
    }

    /// Broadcast when this event makes its neighbourhood hit the threshold.
    ///
    /// Counts stored kills and deaths up to and including this one, so a
    /// replayed cycle reaches the same answer.
    async fn hot_zone(&self, stored: &StoredEvent) -> Option<Notification> {
        let cfg = &self.config.hotzone;
        if !cfg.enabled || !matches!(stored.event.kind(), EventKind::Kill | EventKind::Death) {
            return None;
        }
        let pos = stored.event.position()?;
        let since = stored.occurred_at - chrono::Duration::minutes(cfg.window_minutes);
        let positions = match self.store.recent_combat_positions(since, stored.id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(event_id = stored.id, error = %e, "hot zone lookup failed");
                return None;
            }
        };
        let count = positions
            .iter()
            .filter(|(x, z)| planar_distance(pos.x, pos.z, *x, *z) <= cfg.radius)
            .count() as i64;
        if count != cfg.threshold {
            return None;
        }
        let place = stored
            .event
            .location()
            .map(str::to_string)
            .unwrap_or_else(|| crate::events::nearest_location(pos.x, pos.z));
        Some(Notification::new(
            "Hot zone",
            format!(
                "{} kills and deaths near {} in the last {} minutes",
                count, place, cfg.window_minutes
            ),
            COLOR_HOTZONE,
        ))
    }
}
