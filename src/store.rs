//! Durable record store for queued sales.
//!
//! The whole queue is one JSON array kept in `local_settings` under a single
//! well-known key. Saving is a single upsert, so a reader never observes a
//! half-written queue.

use serde_json::Value;
use std::sync::{Arc, MutexGuard};
use tracing::{debug, warn};

use crate::db::{self, DbState};
use crate::error::StoreError;
use crate::model::QueuedSale;

/// `local_settings` category holding offline sync state.
pub const STORE_CATEGORY: &str = "offline_sync";
/// Key of the serialized queue.
pub const QUEUE_KEY: &str = "offline_sales_queue";

/// Load/save access to the persisted queue.
pub struct RecordStore {
    db: Arc<DbState>,
}

impl RecordStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Read every persisted record in store order.
    ///
    /// An absent, unreadable or corrupt queue yields an empty list so a
    /// broken store never blocks new sales from being queued.
    pub fn load(&self) -> Vec<QueuedSale> {
        let conn = match self.lock() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "offline queue: load skipped");
                return Vec::new();
            }
        };
        let raw = db::get_setting(&conn, STORE_CATEGORY, QUEUE_KEY);
        drop(conn);

        match raw {
            Some(raw) => decode_queue(&raw),
            None => Vec::new(),
        }
    }

    /// Replace the persisted queue with `records`.
    pub fn save(&self, records: &[QueuedSale]) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(records)?;
        let conn = self.lock()?;
        db::set_setting(&conn, STORE_CATEGORY, QUEUE_KEY, &encoded)?;
        debug!(records = records.len(), "offline queue saved");
        Ok(())
    }

    /// Remove the persisted queue entirely.
    pub fn clear(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        db::delete_setting(&conn, STORE_CATEGORY, QUEUE_KEY)
    }

    /// Run a read-modify-write of the full queue while holding the
    /// connection lock. The closure's return value is passed through;
    /// nothing is written when the closure reports no change.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut Vec<QueuedSale>) -> (bool, T),
    ) -> Result<T, StoreError> {
        let conn = self.lock()?;
        let mut records = db::get_setting(&conn, STORE_CATEGORY, QUEUE_KEY)
            .map(|raw| decode_queue(&raw))
            .unwrap_or_default();

        let (changed, out) = f(&mut records);
        if changed {
            let encoded = serde_json::to_string(&records)?;
            db::set_setting(&conn, STORE_CATEGORY, QUEUE_KEY, &encoded)?;
        }
        Ok(out)
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, StoreError> {
        self.db.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

/// Decode the stored array entry by entry. Entries that no longer decode are
/// dropped and logged; the rest of the queue survives.
fn decode_queue(raw: &str) -> Vec<QueuedSale> {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "offline queue is corrupt, treating as empty");
            return Vec::new();
        }
    };
    let Value::Array(entries) = parsed else {
        warn!("offline queue is not an array, treating as empty");
        return Vec::new();
    };

    let mut records = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<QueuedSale>(entry) {
            Ok(record) if !record.local_id.trim().is_empty() => records.push(record),
            Ok(_) => warn!(index, "offline queue entry without localId dropped"),
            Err(e) => warn!(index, error = %e, "offline queue entry unreadable, dropped"),
        }
    }
    records
}
