//! # Prometheus Metrics: Pipeline Counters
//!
//! Exposes per-stream ingestion counters in the OpenMetrics text format for
//! scraping by Prometheus, Grafana Agent, or any compatible collector.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `killfeed_lines_read_total` | Counter | `stream` | New complete lines seen |
//! | `killfeed_events_committed_total` | Counter | `stream` | Event rows inserted |
//! | `killfeed_duplicates_skipped_total` | Counter | `stream` | Rows already present |
//! | `killfeed_unmatched_lines_total` | Counter | `stream` | Lines no rule matched |
//! | `killfeed_ignored_lines_total` | Counter | `stream` | Lines matched by an ignore rule |
//! | `killfeed_fetch_failures_total` | Counter | `stream` | Cycles ended by a fetch error |
//! | `killfeed_commit_failures_total` | Counter | `stream` | Batches rolled back |
//! | `killfeed_rotations_total` | Counter | `stream` | Detected log rotations |
//! | `killfeed_notifications_failed_total` | Counter | `stream` | Undelivered notifications |
//! | `killfeed_achievements_unlocked_total` | Counter | `stream` | Achievement unlocks |
//!
//! The `/metrics` endpoint in [`crate::server`] renders the registry on each
//! scrape.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Label set for per-stream counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct StreamLabel {
    pub stream: String,
}

/// Thread-safe metrics registry shared by every stream worker.
pub struct Metrics {
    pub registry: Registry,
    pub lines_read: Family<StreamLabel, Counter>,
    pub events_committed: Family<StreamLabel, Counter>,
    pub duplicates_skipped: Family<StreamLabel, Counter>,
    pub unmatched_lines: Family<StreamLabel, Counter>,
    pub ignored_lines: Family<StreamLabel, Counter>,
    pub fetch_failures: Family<StreamLabel, Counter>,
    pub commit_failures: Family<StreamLabel, Counter>,
    pub rotations: Family<StreamLabel, Counter>,
    pub notifications_failed: Family<StreamLabel, Counter>,
    pub achievements_unlocked: Family<StreamLabel, Counter>,
}

fn counter(registry: &mut Registry, name: &str, help: &str) -> Family<StreamLabel, Counter> {
    let family = Family::<StreamLabel, Counter>::default();
    registry.register(name, help, family.clone());
    family
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let r = &mut registry;

        let lines_read = counter(r, "killfeed_lines_read", "New complete log lines read");
        let events_committed = counter(r, "killfeed_events_committed", "Event rows inserted");
        let duplicates_skipped = counter(
            r,
            "killfeed_duplicates_skipped",
            "Event rows skipped because they were already stored",
        );
        let unmatched_lines = counter(r, "killfeed_unmatched_lines", "Lines no rule matched");
        let ignored_lines = counter(
            r,
            "killfeed_ignored_lines",
            "Lines recognised and deliberately ignored",
        );
        let fetch_failures = counter(r, "killfeed_fetch_failures", "Cycles ended by a fetch error");
        let commit_failures = counter(r, "killfeed_commit_failures", "Batches rolled back");
        let rotations = counter(r, "killfeed_rotations", "Detected log rotations");
        let notifications_failed = counter(
            r,
            "killfeed_notifications_failed",
            "Notifications that could not be delivered",
        );
        let achievements_unlocked =
            counter(r, "killfeed_achievements_unlocked", "Achievement unlocks");

        Self {
            registry,
            lines_read,
            events_committed,
            duplicates_skipped,
            unmatched_lines,
            ignored_lines,
            fetch_failures,
            commit_failures,
            rotations,
            notifications_failed,
            achievements_unlocked,
        }
    }

    /// Counter handle for one stream.
    pub fn stream(family: &Family<StreamLabel, Counter>, stream: &str) -> Counter {
        family
            .get_or_create(&StreamLabel {
                stream: stream.to_string(),
            })
            .clone()
    }

    /// Render all metrics in OpenMetrics text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).expect("encoding metrics should not fail");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
