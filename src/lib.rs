//! The Small POS - offline sale queue and sync engine
//!
//! Sales completed while the terminal cannot reach the backend are stored in
//! a local SQLite-backed queue and reconciled with the server once
//! connectivity returns. The host application talks to a single
//! [`SyncEngine`]:
//!
//! - [`SyncEngine::enqueue`] persists a completed sale as a pending record.
//! - [`SyncEngine::start_monitor`] follows platform network events, probes
//!   the backend and triggers sync passes.
//! - [`SyncEngine::sync_now`] runs a pass on demand.
//! - [`SyncEngine::watch_status`] publishes pending counts and the last
//!   outcome for the UI.

pub mod api;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod queue;
pub mod status;
pub mod storage;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use api::{HttpBackend, SalesBackend};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityState, MonitorHandle, NetworkEvent};
pub use engine::SyncEngine;
pub use error::{ApiError, EngineError, StoreError};
pub use model::{Payment, QueuedSale, SaleDraft, SaleItem, ServerId};
pub use queue::QueueEvent;
pub use status::{SyncStatus, SyncTally};
pub use storage::{KeyringTokenStore, StaticTokenStore, TokenStore};
pub use sync::{RecordOutcome, SyncMode, SyncReport};
