//! Sync engine configuration.
//!
//! Layered: built-in defaults, then `POS_SYNC_*` environment variables, then
//! overrides an operator saved in `local_settings` (category
//! `offline_sync`). Later layers win.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::api::normalize_base_url;
use crate::db::{self, DbState};
use crate::store::STORE_CATEGORY;

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_OFFLINE_PROBE_INTERVAL_MS: u64 = 10_000;
const DEFAULT_SETTLE_DELAY_MS: u64 = 2_000;
const DEFAULT_PERIODIC_SYNC_INTERVAL_MS: u64 = 30_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Backend base URL; endpoints are appended (`/sales`, `/health`, ...).
    pub api_base_url: String,
    /// Upper bound for one connectivity probe.
    pub probe_timeout_ms: u64,
    /// Probe cadence while offline.
    pub offline_probe_interval_ms: u64,
    /// Pause between reconnecting and the first sync.
    pub settle_delay_ms: u64,
    /// Background sync cadence while online with pending sales.
    pub periodic_sync_interval_ms: u64,
    /// Timeout for sale, customer and batch requests.
    pub request_timeout_ms: u64,
    /// Try the batch endpoint before per-record sync.
    pub prefer_batch: bool,
    /// Quarantine a record after this many failed attempts. `None` retries
    /// forever.
    pub max_retries: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            offline_probe_interval_ms: DEFAULT_OFFLINE_PROBE_INTERVAL_MS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            periodic_sync_interval_ms: DEFAULT_PERIODIC_SYNC_INTERVAL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            prefer_batch: true,
            max_retries: None,
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with `POS_SYNC_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Full layering: defaults, environment, then stored overrides.
    pub fn load(db: &DbState) -> Self {
        let mut config = Self::from_env();
        config.apply_stored_overrides(db);
        config
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("POS_SYNC_API_URL") {
            self.set("apiBaseUrl", &url);
        }
        if let Some(secs) = var("POS_SYNC_PROBE_TIMEOUT_SECS") {
            self.set_secs("probeTimeoutMs", &secs);
        }
        if let Some(secs) = var("POS_SYNC_OFFLINE_PROBE_INTERVAL_SECS") {
            self.set_secs("offlineProbeIntervalMs", &secs);
        }
        if let Some(secs) = var("POS_SYNC_SETTLE_DELAY_SECS") {
            self.set_secs("settleDelayMs", &secs);
        }
        if let Some(secs) = var("POS_SYNC_INTERVAL_SECS") {
            self.set_secs("periodicSyncIntervalMs", &secs);
        }
        if let Some(secs) = var("POS_SYNC_REQUEST_TIMEOUT_SECS") {
            self.set_secs("requestTimeoutMs", &secs);
        }
        if let Some(flag) = var("POS_SYNC_PREFER_BATCH") {
            self.set("preferBatch", &flag);
        }
        if let Some(max) = var("POS_SYNC_MAX_RETRIES") {
            self.set("maxRetries", &max);
        }
    }

    /// Apply every `local_settings` row in the `offline_sync` category whose
    /// key names a config field. Unknown keys are ignored.
    pub fn apply_stored_overrides(&mut self, db: &DbState) {
        let rows = match db.conn.lock() {
            Ok(conn) => db::get_category(&conn, STORE_CATEGORY),
            Err(_) => {
                warn!("config: database lock poisoned, stored overrides skipped");
                return;
            }
        };
        for (key, value) in rows {
            self.set(&key, &value);
        }
    }

    fn set_secs(&mut self, key: &str, secs: &str) {
        match secs.trim().parse::<u64>() {
            Ok(s) => self.set(key, &(s.saturating_mul(1000)).to_string()),
            Err(_) => warn!(key, value = secs, "config: ignoring non-numeric seconds"),
        }
    }

    /// Set one field from its string form. Invalid values are logged and
    /// leave the field unchanged.
    fn set(&mut self, key: &str, raw: &str) {
        let raw = raw.trim();
        let ok = match key {
            "apiBaseUrl" => {
                if raw.is_empty() {
                    false
                } else {
                    self.api_base_url = normalize_base_url(raw);
                    true
                }
            }
            "probeTimeoutMs" => parse_into(raw, &mut self.probe_timeout_ms),
            "offlineProbeIntervalMs" => parse_into(raw, &mut self.offline_probe_interval_ms),
            "settleDelayMs" => parse_into(raw, &mut self.settle_delay_ms),
            "periodicSyncIntervalMs" => parse_into(raw, &mut self.periodic_sync_interval_ms),
            "requestTimeoutMs" => parse_into(raw, &mut self.request_timeout_ms),
            "preferBatch" => match parse_flag(raw) {
                Some(flag) => {
                    self.prefer_batch = flag;
                    true
                }
                None => false,
            },
            "maxRetries" => {
                let lower = raw.to_ascii_lowercase();
                if lower.is_empty() || lower == "none" || lower == "unlimited" || lower == "0" {
                    self.max_retries = None;
                    true
                } else {
                    match raw.parse::<u32>() {
                        Ok(n) => {
                            self.max_retries = Some(n);
                            true
                        }
                        Err(_) => false,
                    }
                }
            }
            _ => return,
        };
        if !ok {
            warn!(key, value = raw, "config: invalid value ignored");
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn offline_probe_interval(&self) -> Duration {
        Duration::from_millis(self.offline_probe_interval_ms.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn periodic_sync_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_sync_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_into(raw: &str, field: &mut u64) -> bool {
    match raw.parse::<u64>() {
        Ok(v) => {
            *field = v;
            true
        }
        Err(_) => false,
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
