//! The sync engine facade.
//!
//! [`SyncEngine`] wires one instance of each component together and is the
//! only surface the POS UI talks to. It owns the connectivity state (written
//! by the [`ConnectivityMonitor`]) and gates every sync pass on it.

use chrono::{SecondsFormat, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::api::{HttpBackend, SalesBackend};
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState, MonitorHandle, NetworkEvent};
use crate::db::{self, DbState};
use crate::error::{EngineError, StoreError};
use crate::model::{QueuedSale, SaleDraft};
use crate::queue::{QueueEvent, QueueManager};
use crate::status::{StatusProjection, SyncStatus};
use crate::storage::{KeyringTokenStore, TokenStore};
use crate::store::RecordStore;
use crate::sync::{SyncExecutor, SyncReport};

pub struct SyncEngine {
    db: Arc<DbState>,
    queue: Arc<QueueManager>,
    executor: SyncExecutor,
    backend: Arc<dyn SalesBackend>,
    status: StatusProjection,
    tokens: Arc<dyn TokenStore>,
    config: SyncConfig,
    connectivity: watch::Sender<ConnectivityState>,
}

impl SyncEngine {
    /// Assemble an engine over an open database. Starts Offline; call
    /// [`SyncEngine::start_monitor`] to begin tracking connectivity.
    pub fn new(
        db: Arc<DbState>,
        backend: Arc<dyn SalesBackend>,
        tokens: Arc<dyn TokenStore>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let queue = Arc::new(QueueManager::new(RecordStore::new(db.clone())));
        let executor = SyncExecutor::new(queue.clone(), backend.clone(), config.max_retries);
        let (connectivity, _) = watch::channel(ConnectivityState::Offline);

        let engine = Arc::new(Self {
            db,
            queue,
            executor,
            backend,
            status: StatusProjection::new(),
            tokens,
            config,
            connectivity,
        });
        engine.refresh_status();
        engine
    }

    /// Production wiring: SQLite under `data_dir`, layered config, the HTTP
    /// backend and the keyring session token.
    pub fn open(data_dir: &Path) -> Result<Arc<Self>, EngineError> {
        let db = Arc::new(db::init(data_dir)?);
        let config = SyncConfig::load(&db);
        let backend = HttpBackend::new(&config.api_base_url, config.request_timeout())?;
        info!(
            api_base_url = backend.base_url(),
            prefer_batch = config.prefer_batch,
            max_retries = ?config.max_retries,
            "Offline sync engine ready"
        );
        Ok(Self::new(
            db,
            Arc::new(backend),
            Arc::new(KeyringTokenStore::new()),
            config,
        ))
    }

    /// Spawn the connectivity monitor. `initially_online` is the platform's
    /// view at startup; later changes arrive on `events`.
    pub fn start_monitor(
        self: &Arc<Self>,
        initially_online: bool,
        events: mpsc::Receiver<NetworkEvent>,
    ) -> MonitorHandle {
        ConnectivityMonitor::spawn(self.clone(), initially_online, events)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &Arc<dyn SalesBackend> {
        &self.backend
    }

    // -- queue ---------------------------------------------------------------

    /// Store a completed sale for later sync. Visible to `pending_count`
    /// as soon as this returns.
    pub fn enqueue(&self, draft: SaleDraft) -> Result<QueuedSale, StoreError> {
        let record = self.queue.enqueue(draft)?;
        self.refresh_status();
        Ok(record)
    }

    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    /// All stored records in store order, for the pending-sales screen.
    pub fn queued_records(&self) -> Vec<QueuedSale> {
        self.queue.records()
    }

    pub fn remove(&self, local_id: &str) -> Result<bool, StoreError> {
        let removed = self.queue.remove(local_id)?;
        if removed {
            self.refresh_status();
        }
        Ok(removed)
    }

    /// Drop every record, synced or not. Returns how many were removed.
    pub fn clear_all(&self) -> Result<usize, StoreError> {
        let count = self.queue.clear_all()?;
        self.refresh_status();
        Ok(count)
    }

    /// Make quarantined records eligible again. Empty when no retry limit is
    /// configured.
    pub fn retry_quarantined(&self) -> Result<Vec<String>, StoreError> {
        let Some(max) = self.config.max_retries else {
            return Ok(Vec::new());
        };
        let released = self.queue.reset_quarantined(max)?;
        if !released.is_empty() {
            info!(count = released.len(), "Quarantined sales released for retry");
            self.refresh_status();
        }
        Ok(released)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    // -- status --------------------------------------------------------------

    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn connectivity(&self) -> ConnectivityState {
        *self.connectivity.borrow()
    }

    pub fn watch_connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.connectivity.subscribe()
    }

    /// Record a connectivity transition and republish the status.
    pub(crate) fn set_connectivity(&self, state: ConnectivityState) {
        let changed = self.connectivity.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(state = state.as_str(), "Connectivity changed");
            self.refresh_status();
        }
    }

    /// Pending records a pass would actually submit.
    pub(crate) fn eligible_count(&self) -> usize {
        self.queue
            .pending()
            .iter()
            .filter(|r| !r.is_quarantined(self.config.max_retries))
            .count()
    }

    fn refresh_status(&self) {
        self.status.publish(
            &self.queue.records(),
            self.connectivity(),
            self.config.max_retries,
        );
    }

    // -- sync ----------------------------------------------------------------

    /// Run one sync pass now.
    ///
    /// Returns `None` without touching the backend when offline, when a pass
    /// is already running, or when nothing is eligible. Failures never
    /// surface here; they live in record state and the status projection.
    /// Dropping the returned future releases the sync slot.
    pub async fn sync_now(&self) -> Option<SyncReport> {
        if self.connectivity() != ConnectivityState::Online {
            debug!("Sync skipped: offline");
            return None;
        }
        let Some(slot) = self.status.try_begin_sync() else {
            debug!("Sync skipped: a pass is already running");
            return None;
        };
        if self.eligible_count() == 0 {
            return None;
        }
        self.refresh_status();

        let started_at = Utc::now();
        let token = self.tokens.token();
        let token = token.as_ref().map(|t| t.as_str());
        if token.is_none() {
            warn!("No session token available, syncing unauthenticated");
        }

        let report = if self.config.prefer_batch {
            self.executor.batch_sync(token).await
        } else {
            self.executor.individual_sync(token).await
        };

        self.record_attempt(
            &started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            &report,
        );
        slot.finish(report.tally());
        self.refresh_status();
        Some(report)
    }

    fn record_attempt(&self, started_at: &str, report: &SyncReport) {
        let finished_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let result = match self.db.conn.lock() {
            Ok(conn) => db::record_sync_attempt(
                &conn,
                started_at,
                &finished_at,
                report.mode.as_str(),
                report.synced,
                report.failed,
            ),
            Err(_) => Err(StoreError::LockPoisoned),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to record sync attempt");
        }
    }
}
