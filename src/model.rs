//! Queued sale records and the drafts they are created from.
//!
//! Records are persisted as camelCase JSON. Every optional field defaults
//! when missing so records written by older builds still load.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An identifier assigned by the backend. Products, customers and sales may
/// use numeric or string ids depending on the deployment, so both are kept
/// in their wire form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerId {
    Number(i64),
    Text(String),
}

impl ServerId {
    /// Read an id from a JSON value, accepting numbers and non-empty strings.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        if let Some(n) = value.as_i64() {
            return Some(Self::Number(n));
        }
        value
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Self::Text(s.to_string()))
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ServerId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// One sold line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleItem {
    pub product_id: ServerId,
    pub quantity: u32,
    pub unit_price: f64,
    #[serde(default)]
    pub discount: f64,
}

/// One tender applied to the sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub method: String,
    pub amount: f64,
}

/// A completed sale handed over by the checkout screen.
///
/// Totals are validated by the caller before enqueue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SaleDraft {
    pub items: Vec<SaleItem>,
    pub payments: Vec<Payment>,
    pub discount: f64,
    pub coupon_code: Option<String>,
    pub notes: Option<String>,
    pub customer_id: Option<ServerId>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
}

/// A sale persisted locally until the backend confirms it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedSale {
    pub local_id: String,
    pub items: Vec<SaleItem>,
    #[serde(default)]
    pub payments: Vec<Payment>,
    #[serde(default)]
    pub discount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coupon_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at_local: DateTime<Utc>,
    #[serde(default)]
    pub synced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedSale {
    /// Build a fresh pending record from a draft.
    pub fn from_draft(
        local_id: String,
        created_at_local: DateTime<Utc>,
        draft: SaleDraft,
    ) -> Self {
        Self {
            local_id,
            items: draft.items,
            payments: draft.payments,
            discount: draft.discount,
            coupon_code: non_blank(draft.coupon_code),
            notes: non_blank(draft.notes),
            customer_id: draft.customer_id,
            customer_name: non_blank(draft.customer_name),
            customer_phone: non_blank(draft.customer_phone),
            customer_email: non_blank(draft.customer_email),
            created_at_local,
            synced: false,
            sync_error: None,
            retry_count: 0,
            server_id: None,
            last_attempt_at: None,
        }
    }

    /// Name, phone or email was captured at checkout.
    pub fn has_customer_identity(&self) -> bool {
        self.customer_name.is_some()
            || self.customer_phone.is_some()
            || self.customer_email.is_some()
    }

    /// A customer must be created server-side before the sale is posted.
    pub fn needs_customer_creation(&self) -> bool {
        self.customer_id.is_none() && self.has_customer_identity()
    }

    /// Pending record held back from automatic sync after too many failures.
    pub fn is_quarantined(&self, max_retries: Option<u32>) -> bool {
        match max_retries {
            Some(max) => !self.synced && self.retry_count >= max,
            None => false,
        }
    }

    /// Notes sent to the backend, stamped with the offline capture time.
    pub fn annotated_notes(&self) -> String {
        let stamp = self
            .created_at_local
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        match self.notes.as_deref() {
            Some(notes) => format!("{notes} [offline sale recorded at {stamp}]"),
            None => format!("Offline sale recorded at {stamp}"),
        }
    }

    /// Sum of line totals after line discounts.
    pub fn items_total(&self) -> f64 {
        self.items
            .iter()
            .map(|i| i.unit_price * f64::from(i.quantity) - i.discount)
            .sum()
    }
}

/// Field-wise update applied to one record. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPatch {
    pub synced: Option<bool>,
    pub sync_error: Option<Option<String>>,
    pub retry_count: Option<u32>,
    pub server_id: Option<Option<ServerId>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Customer created server-side while the sale itself failed.
    pub customer_id: Option<ServerId>,
}

impl SyncPatch {
    /// Backend confirmed the sale.
    pub fn confirmed(server_id: Option<ServerId>, at: DateTime<Utc>) -> Self {
        Self {
            synced: Some(true),
            sync_error: Some(None),
            server_id: Some(server_id),
            last_attempt_at: Some(at),
            ..Self::default()
        }
    }

    /// Attempt failed; `record` is the state the attempt started from.
    pub fn failed(record: &QueuedSale, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            sync_error: Some(Some(error.into())),
            retry_count: Some(record.retry_count.saturating_add(1)),
            last_attempt_at: Some(at),
            ..Self::default()
        }
    }

    pub fn apply(&self, record: &mut QueuedSale) {
        if let Some(synced) = self.synced {
            record.synced = synced;
        }
        if let Some(error) = &self.sync_error {
            record.sync_error = error.clone();
        }
        if let Some(count) = self.retry_count {
            record.retry_count = count;
        }
        if let Some(server_id) = &self.server_id {
            record.server_id = server_id.clone();
        }
        if let Some(at) = self.last_attempt_at {
            record.last_attempt_at = Some(at);
        }
        if let Some(customer_id) = &self.customer_id {
            record.customer_id = Some(customer_id.clone());
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
