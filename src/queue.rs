//! Queue manager: CRUD over the record store plus change notifications.
//!
//! Every mutation is a full read-modify-write of the stored queue and is
//! visible to the caller as soon as the call returns. Observers subscribe to
//! a broadcast channel of [`QueueEvent`]s.

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{QueuedSale, SaleDraft, SyncPatch};
use crate::store::RecordStore;

/// Buffered notifications per subscriber before the oldest are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Queue change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued { local_id: String },
    Updated { local_id: String },
    Removed { local_ids: Vec<String> },
    Cleared,
}

pub struct QueueManager {
    store: RecordStore,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueManager {
    pub fn new(store: RecordStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { store, events }
    }

    /// Subscribe to queue changes.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Persist a completed sale as a pending record and return it.
    ///
    /// The draft is stored as given; callers only enqueue finished sales.
    pub fn enqueue(&self, draft: SaleDraft) -> Result<QueuedSale, StoreError> {
        let record = QueuedSale::from_draft(Uuid::new_v4().to_string(), Utc::now(), draft);
        let created = record.clone();
        self.store.update(move |records| {
            records.push(record);
            (true, ())
        })?;

        info!(
            local_id = %created.local_id,
            items = created.items.len(),
            total = created.items_total(),
            "Sale queued for offline sync"
        );
        self.notify(QueueEvent::Enqueued {
            local_id: created.local_id.clone(),
        });
        Ok(created)
    }

    /// Delete one record. Returns whether it existed.
    pub fn remove(&self, local_id: &str) -> Result<bool, StoreError> {
        let removed = self.store.update(|records| {
            let before = records.len();
            records.retain(|r| r.local_id != local_id);
            let removed = records.len() != before;
            (removed, removed)
        })?;

        if removed {
            info!(local_id, "Queued sale removed");
            self.notify(QueueEvent::Removed {
                local_ids: vec![local_id.to_string()],
            });
        }
        Ok(removed)
    }

    /// Merge `patch` into the matching record. Missing records are a no-op.
    pub fn update_partial(&self, local_id: &str, patch: &SyncPatch) -> Result<bool, StoreError> {
        let found = self.store.update(|records| {
            match records.iter_mut().find(|r| r.local_id == local_id) {
                Some(record) => {
                    patch.apply(record);
                    (true, true)
                }
                None => (false, false),
            }
        })?;

        if found {
            self.notify(QueueEvent::Updated {
                local_id: local_id.to_string(),
            });
        } else {
            debug!(local_id, "update_partial: record no longer queued");
        }
        Ok(found)
    }

    /// Number of records not yet confirmed by the backend.
    pub fn pending_count(&self) -> usize {
        self.store.load().iter().filter(|r| !r.synced).count()
    }

    /// Every record, in store order.
    pub fn records(&self) -> Vec<QueuedSale> {
        self.store.load()
    }

    /// Unsynced records, in store order.
    pub fn pending(&self) -> Vec<QueuedSale> {
        self.store.load().into_iter().filter(|r| !r.synced).collect()
    }

    pub fn get(&self, local_id: &str) -> Option<QueuedSale> {
        self.store.load().into_iter().find(|r| r.local_id == local_id)
    }

    /// Drop every confirmed record. Runs after every sync pass.
    pub fn clear_synced(&self) -> Result<usize, StoreError> {
        let removed_ids = self.store.update(|records| {
            let removed: Vec<String> = records
                .iter()
                .filter(|r| r.synced)
                .map(|r| r.local_id.clone())
                .collect();
            records.retain(|r| !r.synced);
            (!removed.is_empty(), removed)
        })?;

        let count = removed_ids.len();
        if count > 0 {
            debug!(count, "Synced sales removed from offline queue");
            self.notify(QueueEvent::Removed {
                local_ids: removed_ids,
            });
        }
        Ok(count)
    }

    /// Drop every record, synced or not. Operator escape hatch.
    pub fn clear_all(&self) -> Result<usize, StoreError> {
        let dropped = self.store.load();
        let pending = dropped.iter().filter(|r| !r.synced).count();
        self.store.clear()?;
        if pending > 0 {
            warn!(pending, "Offline queue cleared with unsynced sales");
        }
        self.notify(QueueEvent::Cleared);
        Ok(dropped.len())
    }

    /// Reset the retry counter of every quarantined record so the next pass
    /// picks them up again.
    pub fn reset_quarantined(&self, max_retries: u32) -> Result<Vec<String>, StoreError> {
        let released = self.store.update(|records| {
            let mut released = Vec::new();
            for record in records.iter_mut() {
                if record.is_quarantined(Some(max_retries)) {
                    record.retry_count = 0;
                    released.push(record.local_id.clone());
                }
            }
            (!released.is_empty(), released)
        })?;

        for local_id in &released {
            self.notify(QueueEvent::Updated {
                local_id: local_id.clone(),
            });
        }
        Ok(released)
    }

    fn notify(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
