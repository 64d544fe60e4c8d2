//! Read-only sync status for the UI.
//!
//! The projection owns the "syncing" guard and the outcome of the last pass;
//! everything else is derived from the queue when a snapshot is published.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

use crate::connectivity::ConnectivityState;
use crate::model::QueuedSale;

/// Aggregate outcome of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncTally {
    pub synced: usize,
    pub failed: usize,
}

/// Snapshot published to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending_count: usize,
    pub failed_records: usize,
    pub quarantined_count: usize,
    pub is_syncing: bool,
    pub connectivity: ConnectivityState,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_result: Option<SyncTally>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            pending_count: 0,
            failed_records: 0,
            quarantined_count: 0,
            is_syncing: false,
            connectivity: ConnectivityState::Offline,
            last_sync_time: None,
            last_sync_result: None,
        }
    }
}

#[derive(Default)]
struct LastSync {
    at: Option<DateTime<Utc>>,
    result: Option<SyncTally>,
}

pub struct StatusProjection {
    syncing: AtomicBool,
    last: Mutex<LastSync>,
    tx: watch::Sender<SyncStatus>,
}

impl StatusProjection {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncStatus::default());
        Self {
            syncing: AtomicBool::new(false),
            last: Mutex::new(LastSync::default()),
            tx,
        }
    }

    /// Claim the single sync slot. `None` when a pass is already running.
    ///
    /// The slot is released when the returned guard drops, including when
    /// the pass future is dropped before it completes.
    pub fn try_begin_sync(&self) -> Option<SyncSlot<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SyncSlot { projection: self })
    }

    fn release(&self) {
        self.syncing.store(false, Ordering::SeqCst);
        self.tx.send_if_modified(|current| {
            let was_syncing = current.is_syncing;
            current.is_syncing = false;
            was_syncing
        });
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Last published snapshot.
    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// Recompute the snapshot from `records` and publish it when it changed.
    pub fn publish(
        &self,
        records: &[QueuedSale],
        connectivity: ConnectivityState,
        max_retries: Option<u32>,
    ) -> SyncStatus {
        let status = self.compute(records, connectivity, max_retries);
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        status
    }

    fn compute(
        &self,
        records: &[QueuedSale],
        connectivity: ConnectivityState,
        max_retries: Option<u32>,
    ) -> SyncStatus {
        let pending: Vec<&QueuedSale> = records.iter().filter(|r| !r.synced).collect();
        let (last_sync_time, last_sync_result) = self
            .last
            .lock()
            .map(|l| (l.at, l.result))
            .unwrap_or((None, None));

        SyncStatus {
            pending_count: pending.len(),
            failed_records: pending.iter().filter(|r| r.sync_error.is_some()).count(),
            quarantined_count: pending
                .iter()
                .filter(|r| r.is_quarantined(max_retries))
                .count(),
            is_syncing: self.is_syncing(),
            connectivity,
            last_sync_time,
            last_sync_result,
        }
    }
}

/// The claimed sync slot. Dropping it releases the slot.
pub struct SyncSlot<'a> {
    projection: &'a StatusProjection,
}

impl SyncSlot<'_> {
    /// Remember the pass outcome and release the slot.
    pub fn finish(self, tally: SyncTally) {
        if let Ok(mut last) = self.projection.last.lock() {
            last.at = Some(Utc::now());
            last.result = Some(tally);
        }
    }
}

impl Drop for SyncSlot<'_> {
    fn drop(&mut self) {
        self.projection.release();
    }
}

impl Default for StatusProjection {
    fn default() -> Self {
        Self::new()
    }
}
