//! Test helpers: an in-memory queue and a scripted sales backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{
    BatchSyncRequest, BatchSyncResponse, BatchSyncResult, CustomerPayload, SalePayload,
    SalesBackend,
};
use crate::db;
use crate::error::ApiError;
use crate::model::{Payment, SaleDraft, SaleItem, ServerId};
use crate::queue::QueueManager;
use crate::store::RecordStore;

pub fn test_queue() -> Arc<QueueManager> {
    let db = Arc::new(db::init_in_memory().expect("in-memory db"));
    Arc::new(QueueManager::new(RecordStore::new(db)))
}

/// Two units of product 7 paid in cash.
pub fn cash_sale() -> SaleDraft {
    SaleDraft {
        items: vec![SaleItem {
            product_id: ServerId::Number(7),
            quantity: 2,
            unit_price: 9.99,
            discount: 0.0,
        }],
        payments: vec![Payment {
            method: "cash".into(),
            amount: 19.98,
        }],
        ..SaleDraft::default()
    }
}

/// How the fake answers `/sales/batch-sync`.
#[derive(Debug, Clone)]
pub enum BatchBehavior {
    /// Accept every sale that is not scripted to fail.
    Process,
    /// Transport failure.
    Unavailable,
    /// Fixed answer.
    Respond(BatchSyncResponse),
}

/// Scripted backend recording every call it receives.
pub struct FakeBackend {
    healthy: AtomicBool,
    health_calls: AtomicUsize,
    customers_fail: AtomicBool,
    omit_sale_ids: AtomicBool,
    next_sale_id: AtomicI64,
    next_customer_id: AtomicI64,
    sale_failures: Mutex<HashMap<String, ApiError>>,
    batch: Mutex<BatchBehavior>,
    sales: Mutex<Vec<(String, SalePayload)>>,
    customers: Mutex<Vec<CustomerPayload>>,
    batches: Mutex<Vec<BatchSyncRequest>>,
    tokens: Mutex<Vec<Option<String>>>,
    sale_delay: Mutex<Option<Duration>>,
    health_delay: Mutex<Option<Duration>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            health_calls: AtomicUsize::new(0),
            customers_fail: AtomicBool::new(false),
            omit_sale_ids: AtomicBool::new(false),
            next_sale_id: AtomicI64::new(501),
            next_customer_id: AtomicI64::new(9001),
            sale_failures: Mutex::new(HashMap::new()),
            batch: Mutex::new(BatchBehavior::Process),
            sales: Mutex::new(Vec::new()),
            customers: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            sale_delay: Mutex::new(None),
            health_delay: Mutex::new(None),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Delay every health check answer.
    pub fn set_health_delay(&self, delay: Duration) {
        *self.health_delay.lock().unwrap() = Some(delay);
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn fail_customers(&self, fail: bool) {
        self.customers_fail.store(fail, Ordering::SeqCst);
    }

    /// Make `POST /sales` (and the batch entry) for `local_id` fail.
    pub fn fail_sale(&self, local_id: &str, error: ApiError) {
        self.sale_failures
            .lock()
            .unwrap()
            .insert(local_id.to_string(), error);
    }

    /// Accept `POST /sales` without returning an id.
    pub fn omit_sale_ids(&self, omit: bool) {
        self.omit_sale_ids.store(omit, Ordering::SeqCst);
    }

    pub fn clear_sale_failures(&self) {
        self.sale_failures.lock().unwrap().clear();
    }

    pub fn set_batch(&self, behavior: BatchBehavior) {
        *self.batch.lock().unwrap() = behavior;
    }

    /// Delay every `POST /sales` answer.
    pub fn set_sale_delay(&self, delay: Duration) {
        *self.sale_delay.lock().unwrap() = Some(delay);
    }

    /// Idempotency keys of every `POST /sales`, in call order.
    pub fn sale_keys(&self) -> Vec<String> {
        self.sales
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn sale_payloads(&self) -> Vec<SalePayload> {
        self.sales
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn customer_requests(&self) -> Vec<CustomerPayload> {
        self.customers.lock().unwrap().clone()
    }

    pub fn batch_requests(&self) -> Vec<BatchSyncRequest> {
        self.batches.lock().unwrap().clone()
    }

    /// Offline ids sent to the backend by any path, in call order.
    pub fn all_submitted_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.sales.iter().map(|s| s.offline_id.clone()))
            .collect();
        ids.extend(self.sale_keys());
        ids
    }

    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }

    fn record_token(&self, token: Option<&str>) {
        self.tokens
            .lock()
            .unwrap()
            .push(token.map(str::to_string));
    }
}

#[async_trait]
impl SalesBackend for FakeBackend {
    async fn create_sale(
        &self,
        token: Option<&str>,
        idempotency_key: &str,
        sale: &SalePayload,
    ) -> Result<Option<ServerId>, ApiError> {
        self.record_token(token);
        self.sales
            .lock()
            .unwrap()
            .push((idempotency_key.to_string(), sale.clone()));

        let delay = *self.sale_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.sale_failures.lock().unwrap().get(idempotency_key) {
            return Err(err.clone());
        }
        if self.omit_sale_ids.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(ServerId::Number(
            self.next_sale_id.fetch_add(1, Ordering::SeqCst),
        )))
    }

    async fn batch_sync(
        &self,
        token: Option<&str>,
        request: &BatchSyncRequest,
    ) -> Result<BatchSyncResponse, ApiError> {
        self.record_token(token);
        self.batches.lock().unwrap().push(request.clone());

        let behavior = self.batch.lock().unwrap().clone();
        match behavior {
            BatchBehavior::Unavailable => Err(ApiError::Status {
                status: 503,
                detail: "Backend server error".into(),
            }),
            BatchBehavior::Respond(response) => Ok(response),
            BatchBehavior::Process => {
                let failures = self.sale_failures.lock().unwrap();
                let results = request
                    .sales
                    .iter()
                    .map(|sale| match failures.get(&sale.offline_id) {
                        Some(err) => BatchSyncResult {
                            offline_id: sale.offline_id.clone(),
                            success: false,
                            server_id: None,
                            error: Some(err.to_string()),
                        },
                        None => BatchSyncResult {
                            offline_id: sale.offline_id.clone(),
                            success: true,
                            server_id: Some(ServerId::Number(
                                self.next_sale_id.fetch_add(1, Ordering::SeqCst),
                            )),
                            error: None,
                        },
                    })
                    .collect();
                Ok(BatchSyncResponse { results })
            }
        }
    }

    async fn create_customer(
        &self,
        token: Option<&str>,
        customer: &CustomerPayload,
    ) -> Result<ServerId, ApiError> {
        self.record_token(token);
        self.customers.lock().unwrap().push(customer.clone());
        if self.customers_fail.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 500,
                detail: "Backend server error".into(),
            });
        }
        Ok(ServerId::Number(
            self.next_customer_id.fetch_add(1, Ordering::SeqCst),
        ))
    }

    async fn health(&self, _timeout: Duration) -> Result<(), ApiError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.health_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ApiError::Unreachable {
                url: "http://fake-backend".into(),
            })
        }
    }
}
