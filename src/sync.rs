//! Sync executor: reconciles pending queued sales with the backend.
//!
//! Two entry points. [`SyncExecutor::batch_sync`] submits every pending sale
//! to `/sales/batch-sync` in one request and falls back to per-record sync
//! when the batch endpoint gives no usable answer.
//! [`SyncExecutor::individual_sync`] posts one sale at a time, in store
//! order, creating the customer first when needed. A failing record never
//! blocks the ones behind it. Both paths end by dropping synced records.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{
    BatchSale, BatchSyncRequest, BatchSyncResult, CustomerPayload, SalePayload, SalesBackend,
};
use crate::model::{QueuedSale, ServerId, SyncPatch};
use crate::queue::QueueManager;
use crate::status::SyncTally;

/// How a pass reached the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Batch,
    Individual,
    /// Batch endpoint failed; the same records went through individually.
    BatchFallback,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Individual => "individual",
            Self::BatchFallback => "batch_fallback",
        }
    }
}

/// Per-record result of a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub local_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordOutcome {
    fn synced(local_id: &str, server_id: Option<ServerId>) -> Self {
        Self {
            local_id: local_id.to_string(),
            success: true,
            server_id,
            error: None,
        }
    }

    fn failed(local_id: &str, error: String) -> Self {
        Self {
            local_id: local_id.to_string(),
            success: false,
            server_id: None,
            error: Some(error),
        }
    }
}

/// Result of one sync pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub mode: SyncMode,
    pub synced: usize,
    pub failed: usize,
    pub results: Vec<RecordOutcome>,
    /// Pending records left out because they are quarantined.
    pub quarantined: usize,
}

impl SyncReport {
    fn new(mode: SyncMode, results: Vec<RecordOutcome>, quarantined: usize) -> Self {
        let synced = results.iter().filter(|r| r.success).count();
        Self {
            mode,
            synced,
            failed: results.len() - synced,
            results,
            quarantined,
        }
    }

    pub fn tally(&self) -> SyncTally {
        SyncTally {
            synced: self.synced,
            failed: self.failed,
        }
    }
}

pub struct SyncExecutor {
    queue: Arc<QueueManager>,
    backend: Arc<dyn SalesBackend>,
    max_retries: Option<u32>,
}

impl SyncExecutor {
    pub fn new(
        queue: Arc<QueueManager>,
        backend: Arc<dyn SalesBackend>,
        max_retries: Option<u32>,
    ) -> Self {
        Self {
            queue,
            backend,
            max_retries,
        }
    }

    /// Pending records eligible for this pass, in store order, and how many
    /// quarantined ones were held back.
    fn eligible(&self) -> (Vec<QueuedSale>, usize) {
        let pending = self.queue.pending();
        let total = pending.len();
        let eligible: Vec<QueuedSale> = pending
            .into_iter()
            .filter(|r| !r.is_quarantined(self.max_retries))
            .collect();
        let quarantined = total - eligible.len();
        if quarantined > 0 {
            debug!(quarantined, "Quarantined sales skipped this pass");
        }
        (eligible, quarantined)
    }

    /// Submit all pending sales in one batch request.
    pub async fn batch_sync(&self, token: Option<&str>) -> SyncReport {
        let (pending, quarantined) = self.eligible();
        if pending.is_empty() {
            self.cleanup();
            return SyncReport::new(SyncMode::Batch, Vec::new(), quarantined);
        }

        let request = BatchSyncRequest {
            sales: pending.iter().map(BatchSale::from_record).collect(),
        };

        let report = match self.backend.batch_sync(token, &request).await {
            Ok(response) => {
                let results = self.apply_batch_results(&pending, response.results);
                SyncReport::new(SyncMode::Batch, results, quarantined)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    records = pending.len(),
                    "Batch sync unavailable, falling back to per-record sync"
                );
                let results = self.sync_each(token, &pending).await;
                SyncReport::new(SyncMode::BatchFallback, results, quarantined)
            }
        };

        self.cleanup();
        log_report(&report);
        report
    }

    /// Post pending sales one at a time, oldest first.
    pub async fn individual_sync(&self, token: Option<&str>) -> SyncReport {
        let (pending, quarantined) = self.eligible();
        let results = self.sync_each(token, &pending).await;
        self.cleanup();

        let report = SyncReport::new(SyncMode::Individual, results, quarantined);
        if !pending.is_empty() {
            log_report(&report);
        }
        report
    }

    /// Match batch results to records by offline id and persist outcomes.
    fn apply_batch_results(
        &self,
        pending: &[QueuedSale],
        results: Vec<BatchSyncResult>,
    ) -> Vec<RecordOutcome> {
        let mut by_id: HashMap<String, BatchSyncResult> = HashMap::with_capacity(results.len());
        for result in results {
            // A duplicate entry only replaces an earlier failure.
            let keep_existing = by_id
                .get(&result.offline_id)
                .is_some_and(|existing| existing.success);
            if !keep_existing {
                by_id.insert(result.offline_id.clone(), result);
            }
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for record in pending {
            let outcome = match by_id.remove(&record.local_id) {
                Some(result) if result.success => {
                    RecordOutcome::synced(&record.local_id, result.server_id)
                }
                Some(result) => RecordOutcome::failed(
                    &record.local_id,
                    result
                        .error
                        .filter(|e| !e.trim().is_empty())
                        .unwrap_or_else(|| "Rejected by batch sync".to_string()),
                ),
                None => RecordOutcome::failed(
                    &record.local_id,
                    "No result returned for offline sale".to_string(),
                ),
            };
            self.persist(record, &outcome);
            outcomes.push(outcome);
        }

        for unknown in by_id.keys() {
            warn!(offline_id = %unknown, "Batch sync returned a result for an unknown sale");
        }
        outcomes
    }

    async fn sync_each(&self, token: Option<&str>, records: &[QueuedSale]) -> Vec<RecordOutcome> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let outcome = self.sync_one(token, record).await;
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn sync_one(&self, token: Option<&str>, record: &QueuedSale) -> RecordOutcome {
        let mut customer_id = record.customer_id.clone();
        let mut created_customer = None;

        if record.needs_customer_creation() {
            let customer = CustomerPayload::from_record(record);
            match self.backend.create_customer(token, &customer).await {
                Ok(id) => {
                    info!(
                        local_id = %record.local_id,
                        customer_id = %id,
                        "Customer created for offline sale"
                    );
                    customer_id = Some(id.clone());
                    created_customer = Some(id);
                }
                Err(e) => {
                    warn!(
                        local_id = %record.local_id,
                        error = %e,
                        "Customer creation failed, syncing sale without customer"
                    );
                }
            }
        }

        let payload = SalePayload::from_record(record, customer_id);
        let outcome = match self
            .backend
            .create_sale(token, &record.local_id, &payload)
            .await
        {
            Ok(server_id) => {
                info!(local_id = %record.local_id, server_id = ?server_id, "Offline sale synced");
                RecordOutcome::synced(&record.local_id, server_id)
            }
            Err(e) => {
                warn!(
                    local_id = %record.local_id,
                    retry_count = record.retry_count + 1,
                    error = %e,
                    "Offline sale sync failed"
                );
                RecordOutcome::failed(&record.local_id, e.to_string())
            }
        };

        // Keep a freshly created customer linked when the sale failed so a
        // retry does not create it again.
        let linked_customer = if outcome.success { None } else { created_customer };
        self.persist_with_customer(record, &outcome, linked_customer);
        outcome
    }

    /// Write one outcome back to the queue. Store errors are logged; the
    /// record simply stays as it was and is retried next pass.
    fn persist(&self, record: &QueuedSale, outcome: &RecordOutcome) {
        self.persist_with_customer(record, outcome, None);
    }

    fn persist_with_customer(
        &self,
        record: &QueuedSale,
        outcome: &RecordOutcome,
        customer_id: Option<ServerId>,
    ) {
        let now = Utc::now();
        let mut patch = if outcome.success {
            SyncPatch::confirmed(outcome.server_id.clone(), now)
        } else {
            SyncPatch::failed(record, outcome.error.clone().unwrap_or_default(), now)
        };
        patch.customer_id = customer_id;
        if let Err(e) = self.queue.update_partial(&record.local_id, &patch) {
            warn!(local_id = %record.local_id, error = %e, "Failed to persist sync outcome");
        }
    }

    fn cleanup(&self) {
        if let Err(e) = self.queue.clear_synced() {
            warn!(error = %e, "Failed to remove synced sales from offline queue");
        }
    }
}

fn log_report(report: &SyncReport) {
    info!(
        mode = report.mode.as_str(),
        synced = report.synced,
        failed = report.failed,
        quarantined = report.quarantined,
        "Sync pass complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::BatchSyncResponse;
    use crate::error::ApiError;
    use crate::model::SaleDraft;
    use crate::testing::{cash_sale, test_queue, BatchBehavior, FakeBackend};

    const TOKEN: Option<&str> = Some("tok-1");

    fn executor(queue: &Arc<QueueManager>, backend: &Arc<FakeBackend>) -> SyncExecutor {
        SyncExecutor::new(queue.clone(), backend.clone(), None)
    }

    #[tokio::test]
    async fn test_individual_sync_scenario_single_cash_sale() {
        let queue = test_queue();
        let backend = Arc::new(FakeBackend::new());
        queue.enqueue(cash_sale()).unwrap();
        assert_eq!(queue.pending_count(), 1);

        let report = executor(&queue, &backend).individual_sync(TOKEN).await;

        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.results[0].server_id, Some(ServerId::Number(501)));
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.records().is_empty());
        assert_eq!(backend.tokens_seen(), vec![Some("tok-1".to_string())]);
    }

    #[tokio::test]
    async fn test_sale_accepted_without_id_is_synced() {
        let queue = test_queue();
        let backend = Arc::new(FakeBackend::new());
        backend.omit_sale_ids(true);
        queue.enqueue(cash_sale()).unwrap();

        let report = executor(&queue, &backend).individual_sync(TOKEN).await;

        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.results[0].server_id, None);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(backend.sale_keys().len(), 1);
    }

    #[tokio::test]
    async fn test_individual_sync_preserves_enqueue_order() {
        let queue = test_queue();
        let backend = Arc::new(FakeBackend::new());
        let ids: Vec<String> = (0..3)
            .map(|_| queue.enqueue(cash_sale()).unwrap().local_id)
            .collect();

        executor(&queue, &backend).individual_sync(TOKEN).await;

        assert_eq!(backend.sale_keys(), ids);
    }

    #[tokio::test]
    async fn test_individual_sync_isolates_partial_failure() {
        let queue = test_queue();
        let backend = Arc::new(FakeBackend::new());
        let r1 = queue.enqueue(cash_sale()).unwrap();
        let r2 = queue.enqueue(cash_sale()).unwrap();
        let r3 = queue.enqueue(cash_sale()).unwrap();
        backend.fail_sale(
            &r2.local_id,
            ApiError::Status {
                status: 422,
                detail: "Product 7 no longer exists".into(),
            },
        );

        let report = executor(&queue, &backend).individual_sync(TOKEN).await;

        assert_eq!(report.synced, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(backend.sale_keys(), vec![r1.local_id, r2.local_id.clone(), r3.local_id]);
        assert_eq!(queue.pending_count(), 1);
        let remaining = queue.records();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].local_id, r2.local_id);
        assert_eq!(remaining[0].retry_count, 1);
        assert_eq!(
            remaining[0].sync_error.as_deref(),
            Some("Product 7 no longer exists (HTTP 422)")
        );
    }

    #[tokio::test]
    async fn test_synced_records_never_resent() {
        let queue = test_queue();
        let backend = Arc::new(FakeBackend::new());
        let r1 = queue.enqueue(cash_sale()).unwrap();
        let exec = executor(&queue, &backend);

        exec.individual_sync(TOKEN).await;
        let r2 = queue.enqueue(cash_sale()).unwrap();
        exec.individual_sync(TOKEN).await;
        exec.batch_sync(TOKEN).await;

        assert_eq!(backend.sale_keys(), vec![r1.local_id, r2.local_id]);
        assert!(backend.batch_requests().is_empty(), "nothing pending, no batch call");
    }

    #[tokio::test]
    async fn test_customer_created_before_sale() {
        let queue = test_queue();
        let backend = Arc::new(FakeBackend::new());
        queue
            .enqueue(SaleDraft {
                customer_name: Some("Ana".into()),
                customer_email: Some("ana@example.com".into()),
                ..cash_sale()
            })
            .unwrap();

        executor(&queue, &backend).individual_sync(TOKEN).await;

        let customers = backend.customer_requests();
        assert_eq!(customers.len(), 1);
        assert_eq!(customers[0].name, "Ana");
        let sales = backend.sale_payloads();
        assert_eq!(sales[0].customer_id, Some(ServerId::Number(9001)));
    }

    #[tokio::test]
    async fn test_customer_failure_does_not_block_sale() {
        let queue = test_queue();
        let backend = Arc::new(FakeBackend::new());
        backend.fail_customers(true);
        queue
            .enqueue(SaleDraft {
                customer_phone: Some("555-0101".into()),
                ..cash_sale()
            })
            .unwrap();

        let report = executor(&queue, &backend).individual_sync(TOKEN).await;

        assert_eq!(report.synced, 1);
        assert_eq!(backend.sale_payloads()[0].customer_id, None);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_created_customer_kept_when_sale_fails() {
        let queue = test_queue();
        let backend = Arc::new(FakeBackend::new());
        let record = queue
            .enqueue(SaleDraft {
                customer_name: Some("Ana".into()),
                ..cash_sale()
            })
            .unwrap();
        backend.fail_sale(&record.local_id, ApiError::Timeout { url: "http://pos".into() });
        let exec = executor(&queue, &backend);

        exec.individual_sync(TOKEN).await;
        let stored = queue.get(&record.local_id).unwrap();
        assert_eq!(stored.customer_id, Some(ServerId::Number(9001)));

        backend.clear_sale_failures();
        exec.individual_sync(TOKEN).await;
        assert_eq!(backend.customer_requests().len(), 1, "customer created once");
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_batch_sync_matches_results_by_offline_id() {
        let queue = test_queue();
        let backend = Arc::new(FakeBackend::new());
        let r1 = queue.enqueue(cash_sale()).unwrap();
        let r2 = queue.enqueue(cash_sale()).unwrap();
        let r3 = queue.enqueue(cash_sale()).unwrap();
        // Results deliberately out of input order, r3 missing.
        backend.set_batch(BatchBehavior::Respond(BatchSyncResponse {
            results: vec![
                BatchSyncResult {
                    offline_id: r2.local_id.clone(),
                    success: false,
                    server_id: None,
                    error: Some("Coupon expired".into()),
                },
                BatchSyncResult {
                    offline_id: r1.local_id.clone(),
                    success: true,
                    server_id: Some(ServerId::Number(700)),
                    error: None,
                },
                BatchSyncResult {
                    offline_id: "stranger".into(),
                    success: true,
                    server_id: None,
                    error: None,
                },
            ],
        }));

        let report = executor(&queue, &backend).batch_sync(TOKEN).await;

        assert_eq!(report.mode, SyncMode::Batch);
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 2);
        assert!(backend.sale_keys().is_empty());

        let remaining = queue.records();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].local_id, r2.local_id);
        assert_eq!(remaining[0].sync_error.as_deref(), Some("Coupon expired"));
        assert_eq!(remaining[0].retry_count, 1);
        assert_eq!(remaining[1].local_id, r3.local_id);
        assert_eq!(
            remaining[1].sync_error.as_deref(),
            Some("No result returned for offline sale")
        );
    }

    #[tokio::test]
    async fn test_batch_transport_failure_falls_back_to_individual() {
        let queue = test_queue();
        let backend = Arc::new(FakeBackend::new());
        backend.set_batch(BatchBehavior::Unavailable);
        let r1 = queue.enqueue(cash_sale()).unwrap();
        let r2 = queue.enqueue(cash_sale()).unwrap();
        let r3 = queue.enqueue(cash_sale()).unwrap();
        backend.fail_sale(&r3.local_id, ApiError::Unreachable { url: "http://pos".into() });
        let original_pending = queue.pending_count();

        let report = executor(&queue, &backend).batch_sync(TOKEN).await;

        assert_eq!(report.mode, SyncMode::BatchFallback);
        assert_eq!(report.synced + report.failed, original_pending);
        assert_eq!(backend.batch_requests().len(), 1);
        assert_eq!(backend.batch_requests()[0].sales.len(), 3);
        assert_eq!(
            backend.sale_keys(),
            vec![r1.local_id, r2.local_id, r3.local_id.clone()]
        );
        let remaining = queue.records();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].local_id, r3.local_id);
    }

    #[tokio::test]
    async fn test_batch_with_nothing_pending_makes_no_call() {
        let queue = test_queue();
        let backend = Arc::new(FakeBackend::new());

        let report = executor(&queue, &backend).batch_sync(TOKEN).await;

        assert_eq!(report.synced, 0);
        assert_eq!(report.failed, 0);
        assert!(backend.batch_requests().is_empty());
    }

    #[tokio::test]
    async fn test_quarantined_records_are_held_back() {
        let queue = test_queue();
        let backend = Arc::new(FakeBackend::new());
        let bad = queue.enqueue(cash_sale()).unwrap();
        let good = queue.enqueue(cash_sale()).unwrap();
        backend.fail_sale(
            &bad.local_id,
            ApiError::Status {
                status: 422,
                detail: "invalid".into(),
            },
        );
        let exec = SyncExecutor::new(queue.clone(), backend.clone(), Some(2));

        exec.individual_sync(TOKEN).await;
        exec.individual_sync(TOKEN).await;
        let report = exec.individual_sync(TOKEN).await;

        assert_eq!(report.quarantined, 1);
        assert!(report.results.is_empty());
        assert_eq!(
            backend.sale_keys(),
            vec![bad.local_id.clone(), good.local_id, bad.local_id.clone()]
        );
        assert_eq!(queue.pending_count(), 1, "quarantined sale stays queued");
        assert_eq!(queue.get(&bad.local_id).unwrap().retry_count, 2);
    }
}
