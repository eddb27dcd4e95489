//! # Worker: Per-Stream Ingestion Loop
//!
//! One [`StreamWorker`] per configured stream, each on its own tokio task.
//! A cycle is strictly sequential:
//!
//! ```text
//! fetch ──> plan cursor ──> classify suffix ──> append batch + cursor ──> dispatch
//! ```
//!
//! - A fetch failure ends the cycle with no state change.
//! - The batch and the new cursor commit together or not at all; a rolled
//!   back batch is re-read next cycle and deduplicated by its offsets.
//! - Dispatch works off the store's undispatched rows, so events committed
//!   by a cycle that crashed before dispatching are picked up later.
//!
//! Fetch and commit each run under a timeout so one stuck stream cannot hold
//! the others. Shutdown is observed between cycles only; a running cycle
//! always finishes its commit-or-discard unit.

use crate::classifier::classify_lines;
use crate::config::{Config, PipelineConfig, StreamConfig};
use crate::cursor::{self, complete_lines};
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::fetcher::{FetchError, Fetcher, RemoteConnector};
use crate::notify::Notifier;
use crate::prom_metrics::Metrics;
use crate::store::{EventStore, NewBatch, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub remote_path: String,
    pub generation: i64,
    pub new_lines: i64,
    pub inserted: u64,
    pub duplicates: u64,
    pub unmatched: u64,
    pub ignored: u64,
    pub rotated: bool,
    pub dispatch: DispatchReport,
}

/// Consecutive failed cycles after which a stream counts as stalled.
pub const STALL_AFTER_FAILURES: u32 = 3;

/// Outcome of the most recent cycles of one stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStatus {
    pub last_ok: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl StreamStatus {
    pub fn stalled(&self) -> bool {
        self.consecutive_failures >= STALL_AFTER_FAILURES
    }
}

/// Per-stream cycle outcomes shared between the workers and `/readyz`.
#[derive(Debug, Default)]
pub struct Liveness {
    streams: Mutex<HashMap<String, StreamStatus>>,
}

impl Liveness {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamStatus>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, stream: &str) {
        self.lock().entry(stream.to_string()).or_default();
    }

    pub fn record_ok(&self, stream: &str, at: DateTime<Utc>) {
        let mut streams = self.lock();
        let status = streams.entry(stream.to_string()).or_default();
        status.last_ok = Some(at);
        status.last_error = None;
        status.consecutive_failures = 0;
    }

    pub fn record_failure(&self, stream: &str, error: &str) {
        let mut streams = self.lock();
        let status = streams.entry(stream.to_string()).or_default();
        status.last_error = Some(error.to_string());
        status.consecutive_failures += 1;
    }

    pub fn snapshot(&self) -> BTreeMap<String, StreamStatus> {
        self.lock()
            .iter()
            .map(|(name, status)| (name.clone(), status.clone()))
            .collect()
    }

    pub fn stalled(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, status)| status.stalled())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

pub struct StreamWorker {
    stream: StreamConfig,
    pipeline: PipelineConfig,
    store: Arc<dyn EventStore>,
    fetcher: Fetcher,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    liveness: Arc<Liveness>,
    stream_id: Option<i64>,
}

impl StreamWorker {
    pub fn new(
        stream: StreamConfig,
        pipeline: PipelineConfig,
        store: Arc<dyn EventStore>,
        fetcher: Fetcher,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        StreamWorker {
            stream,
            pipeline,
            store,
            fetcher,
            dispatcher,
            metrics,
            liveness: Arc::new(Liveness::default()),
            stream_id: None,
        }
    }

    /// Report cycle outcomes into a shared [`Liveness`] instead of a private one.
    pub fn with_liveness(mut self, liveness: Arc<Liveness>) -> Self {
        liveness.register(&self.stream.name);
        self.liveness = liveness;
        self
    }

    pub fn liveness(&self) -> Arc<Liveness> {
        Arc::clone(&self.liveness)
    }

    pub fn name(&self) -> &str {
        &self.stream.name
    }

    async fn stream_id(&mut self) -> Result<i64, StoreError> {
        if let Some(id) = self.stream_id {
            return Ok(id);
        }
        let id = self.store.register_stream(&self.stream.name).await?;
        self.stream_id = Some(id);
        Ok(id)
    }

    /// Run one fetch → commit → dispatch cycle and record its outcome.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        let result = self.cycle().await;
        match &result {
            Ok(_) => self.liveness.record_ok(&self.stream.name, Utc::now()),
            Err(e) => self.liveness.record_failure(&self.stream.name, &e.to_string()),
        }
        result
    }

    async fn cycle(&mut self) -> Result<CycleReport, CycleError> {
        let name = self.stream.name.clone();
        let stream_id = self.stream_id().await?;
        let state = self.store.read_cursor(stream_id).await?;

        let fetched = match timeout(self.pipeline.fetch_timeout(), self.fetcher.fetch(&self.stream))
            .await
        {
            Ok(Ok(log)) => log,
            Ok(Err(e)) => {
                Metrics::stream(&self.metrics.fetch_failures, &name).inc();
                return Err(e.into());
            }
            Err(_) => {
                Metrics::stream(&self.metrics.fetch_failures, &name).inc();
                return Err(FetchError::NetworkTimeout(format!(
                    "fetch exceeded {}s",
                    self.pipeline.fetch_timeout_secs
                ))
                .into());
            }
        };
        let fetched_at = Utc::now();

        let lines = complete_lines(&fetched.text);
        let plan = cursor::plan(
            state.as_ref(),
            &fetched.remote_path,
            lines.len() as i64,
            self.stream.backfill,
        );
        if plan.rotated {
            warn!(
                remote_path = %fetched.remote_path,
                generation = plan.generation,
                lines = plan.end,
                "log rotation detected, reprocessing from line 0"
            );
        } else if plan.initial && plan.start > 0 {
            info!(
                remote_path = %fetched.remote_path,
                skipped = plan.start,
                "first sight of stream, tailing from end"
            );
        }

        let suffix = &lines[plan.start as usize..plan.end as usize];
        let (events, stats) = classify_lines(suffix, plan.start);

        let batch = NewBatch {
            stream_id,
            plan,
            remote_path: &fetched.remote_path,
            events: &events,
            fetched_at,
        };
        let appended = match timeout(self.pipeline.commit_timeout(), self.store.append_batch(&batch))
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                Metrics::stream(&self.metrics.commit_failures, &name).inc();
                return Err(e.into());
            }
            Err(_) => {
                Metrics::stream(&self.metrics.commit_failures, &name).inc();
                return Err(StoreError::Timeout.into());
            }
        };

        let m = &self.metrics;
        Metrics::stream(&m.lines_read, &name).inc_by(plan.new_lines().max(0) as u64);
        Metrics::stream(&m.events_committed, &name).inc_by(appended.inserted);
        Metrics::stream(&m.duplicates_skipped, &name).inc_by(appended.duplicates);
        Metrics::stream(&m.unmatched_lines, &name).inc_by(stats.unmatched);
        Metrics::stream(&m.ignored_lines, &name).inc_by(stats.ignored);
        if plan.rotated {
            Metrics::stream(&m.rotations, &name).inc();
        }

        let dispatch = self.dispatcher.dispatch_pending(&name, stream_id).await?;

        Ok(CycleReport {
            remote_path: fetched.remote_path,
            generation: plan.generation,
            new_lines: plan.new_lines(),
            inserted: appended.inserted,
            duplicates: appended.duplicates,
            unmatched: stats.unmatched,
            ignored: stats.ignored,
            rotated: plan.rotated,
            dispatch,
        })
    }

    /// Cycle on the configured interval until `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.pipeline.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            let span = info_span!("stream_cycle", stream = %self.stream.name);
            match self.run_cycle().instrument(span.clone()).await {
                Ok(report) if report.new_lines > 0 || report.dispatch.dispatched > 0 => {
                    span.in_scope(|| {
                        info!(
                            lines = report.new_lines,
                            inserted = report.inserted,
                            duplicates = report.duplicates,
                            unmatched = report.unmatched,
                            dispatched = report.dispatch.dispatched,
                            "cycle complete"
                        )
                    });
                }
                Ok(_) => span.in_scope(|| debug!("no new lines")),
                Err(CycleError::Fetch(e)) => {
                    span.in_scope(|| warn!(error = %e, kind = e.kind(), "fetch failed, cursor unchanged"))
                }
                Err(CycleError::Store(e)) => {
                    span.in_scope(|| error!(error = %e, transient = e.is_transient(), "store failure"))
                }
            }
        }
        info!(stream = %self.stream.name, "stream worker stopped");
    }
}

/// All stream workers of one process.
pub struct Pipeline {
    workers: Vec<StreamWorker>,
    liveness: Arc<Liveness>,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn EventStore>,
        connector: Arc<dyn RemoteConnector>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let fetcher = Fetcher::new(connector, config.fetch.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            notifier,
            Arc::clone(&metrics),
            Arc::clone(&config),
        ));
        let liveness = Arc::new(Liveness::default());
        let workers = config
            .streams
            .iter()
            .map(|stream| {
                StreamWorker::new(
                    stream.clone(),
                    config.pipeline.clone(),
                    Arc::clone(&store),
                    fetcher.clone(),
                    Arc::clone(&dispatcher),
                    Arc::clone(&metrics),
                )
                .with_liveness(Arc::clone(&liveness))
            })
            .collect();
        Pipeline { workers, liveness }
    }

    pub fn liveness(&self) -> Arc<Liveness> {
        Arc::clone(&self.liveness)
    }

    /// Run every worker until shutdown; returns once all have stopped.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        for worker in self.workers {
            info!(stream = %worker.name(), "starting stream worker");
            tasks.spawn(worker.run(shutdown.clone()));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "stream worker task failed");
            }
        }
    }
}
