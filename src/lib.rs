//! Game server log ingestion: fetch remote logs, classify lines into typed
//! events, store them at most once per line, and apply their effects.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod cursor;
pub mod dispatcher;
pub mod events;
pub mod fetcher;
pub mod notify;
pub mod prom_metrics;
pub mod server;
pub mod store;
pub mod territory;
pub mod worker;

pub use config::Config;
pub use events::{DomainEvent, EventKind};
pub use store::{EventStore, StoreError};
pub use worker::{Pipeline, StreamWorker};
