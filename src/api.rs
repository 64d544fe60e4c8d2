//! Sales backend API client.
//!
//! The sync executor talks to the backend through the [`SalesBackend`] trait;
//! [`HttpBackend`] is the reqwest implementation used in production.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::model::{Payment, QueuedSale, SaleItem, ServerId};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// `POST /sales` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SalePayload {
    pub items: Vec<SaleItem>,
    pub payments: Vec<Payment>,
    pub discount: f64,
    pub coupon_code: Option<String>,
    pub customer_id: Option<ServerId>,
    pub notes: String,
}

impl SalePayload {
    /// Build the payload for `record`, using `customer_id` as resolved by the
    /// executor (the record's own id, a freshly created one, or none).
    pub fn from_record(record: &QueuedSale, customer_id: Option<ServerId>) -> Self {
        Self {
            items: record.items.clone(),
            payments: record.payments.clone(),
            discount: record.discount,
            coupon_code: record.coupon_code.clone(),
            customer_id,
            notes: record.annotated_notes(),
        }
    }
}

/// One entry of the `POST /sales/batch-sync` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSale {
    pub offline_id: String,
    pub created_at_local: String,
    #[serde(flatten)]
    pub sale: SalePayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
}

impl BatchSale {
    pub fn from_record(record: &QueuedSale) -> Self {
        Self {
            offline_id: record.local_id.clone(),
            created_at_local: record.created_at_local.to_rfc3339(),
            sale: SalePayload::from_record(record, record.customer_id.clone()),
            customer_name: record.customer_name.clone(),
            customer_phone: record.customer_phone.clone(),
            customer_email: record.customer_email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSyncRequest {
    pub sales: Vec<BatchSale>,
}

/// Per-record answer from the batch endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSyncResult {
    pub offline_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSyncResponse {
    pub results: Vec<BatchSyncResult>,
}

/// `POST /customers` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerPayload {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl CustomerPayload {
    /// Name falls back to phone, then email, since the backend requires one.
    pub fn from_record(record: &QueuedSale) -> Self {
        let name = record
            .customer_name
            .clone()
            .or_else(|| record.customer_phone.clone())
            .or_else(|| record.customer_email.clone())
            .unwrap_or_default();
        Self {
            name,
            phone: record.customer_phone.clone(),
            email: record.customer_email.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// The four backend calls the sync engine depends on.
#[async_trait]
pub trait SalesBackend: Send + Sync {
    /// `POST /sales`. Any 2xx confirms the sale; the server-assigned id is
    /// `None` when the response does not carry one.
    async fn create_sale(
        &self,
        token: Option<&str>,
        idempotency_key: &str,
        sale: &SalePayload,
    ) -> Result<Option<ServerId>, ApiError>;

    /// `POST /sales/batch-sync`.
    ///
    /// `Err` means no usable per-record answer came back.
    async fn batch_sync(
        &self,
        token: Option<&str>,
        request: &BatchSyncRequest,
    ) -> Result<BatchSyncResponse, ApiError>;

    /// `POST /customers`; returns the new customer id.
    async fn create_customer(
        &self,
        token: Option<&str>,
        customer: &CustomerPayload,
    ) -> Result<ServerId, ApiError>;

    /// `GET /health` with the probe timeout. `Ok` on any 2xx.
    async fn health(&self, timeout: Duration) -> Result<(), ApiError>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly error.
fn friendly_error(url: &str, err: &reqwest::Error) -> ApiError {
    if err.is_timeout() {
        return ApiError::Timeout {
            url: url.to_string(),
        };
    }
    if err.is_connect() {
        return ApiError::Unreachable {
            url: url.to_string(),
        };
    }
    ApiError::Network {
        url: url.to_string(),
        message: err.to_string(),
    }
}

/// Fallback wording for an HTTP status without a usable body.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Session expired or token invalid".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Backend endpoint not found".to_string(),
        s if s >= 500 => "Backend server error".to_string(),
        _ => "Unexpected response from backend".to_string(),
    }
}

/// Pull the human-readable `detail` out of an error body.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    let trimmed = body_text.trim();
    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        let message = json
            .get("detail")
            .or_else(|| json.get("error"))
            .or_else(|| json.get("message"))
            .and_then(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty());
        if let Some(message) = message {
            return message;
        }
    }
    if !trimmed.is_empty() && trimmed.len() <= 200 && !trimmed.starts_with('<') {
        return format!("{}: {trimmed}", status_message(status));
    }
    status_message(status)
}

/// Extract a created entity's id from `{id}` or `{data: {id}}`.
fn created_id(body: &Value) -> Option<ServerId> {
    body.get("id")
        .and_then(ServerId::from_json)
        .or_else(|| body.pointer("/data/id").and_then(ServerId::from_json))
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// reqwest-backed [`SalesBackend`].
pub struct HttpBackend {
    base_url: String,
    client: Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(base_url);
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ApiError::Network {
                url: base_url.clone(),
                message: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self, path: &str, token: Option<&str>) -> RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("Content-Type", "application/json");
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Send a request and return the decoded JSON body of a 2xx response.
    async fn send_json(&self, req: RequestBuilder) -> Result<Value, ApiError> {
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                detail: error_detail(status, &body_text),
            });
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| ApiError::InvalidResponse(format!("invalid JSON: {e}")))
    }
}

#[async_trait]
impl SalesBackend for HttpBackend {
    async fn create_sale(
        &self,
        token: Option<&str>,
        idempotency_key: &str,
        sale: &SalePayload,
    ) -> Result<Option<ServerId>, ApiError> {
        let req = self
            .post("/sales", token)
            .header("Idempotency-Key", idempotency_key)
            .json(sale);
        let body = self.send_json(req).await?;
        let server_id = created_id(&body);
        if server_id.is_none() {
            warn!(idempotency_key, "Sale accepted without a server id");
        }
        Ok(server_id)
    }

    async fn batch_sync(
        &self,
        token: Option<&str>,
        request: &BatchSyncRequest,
    ) -> Result<BatchSyncResponse, ApiError> {
        let req = self.post("/sales/batch-sync", token).json(request);
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        // A non-2xx answer still counts when it carries per-record results.
        match serde_json::from_str::<BatchSyncResponse>(&body_text) {
            Ok(parsed) => {
                debug!(
                    status = status.as_u16(),
                    results = parsed.results.len(),
                    "batch sync answered"
                );
                Ok(parsed)
            }
            Err(_) if !status.is_success() => Err(ApiError::Status {
                status: status.as_u16(),
                detail: error_detail(status, &body_text),
            }),
            Err(e) => Err(ApiError::InvalidResponse(format!(
                "batch sync response unreadable: {e}"
            ))),
        }
    }

    async fn create_customer(
        &self,
        token: Option<&str>,
        customer: &CustomerPayload,
    ) -> Result<ServerId, ApiError> {
        let req = self.post("/customers", token).json(customer);
        let body = self.send_json(req).await?;
        created_id(&body)
            .ok_or_else(|| ApiError::InvalidResponse("customer response missing id".to_string()))
    }

    async fn health(&self, timeout: Duration) -> Result<(), ApiError> {
        let url = format!("{}/health", self.base_url);
        let start = Instant::now();
        let resp = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        if status.is_success() {
            debug!(
                latency_ms = start.elapsed().as_millis() as u64,
                "health probe passed"
            );
            Ok(())
        } else {
            info!(status = status.as_u16(), "health probe rejected");
            Err(ApiError::Status {
                status: status.as_u16(),
                detail: status_message(status),
            })
        }
    }
}
