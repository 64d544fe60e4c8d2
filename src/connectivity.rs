//! Connectivity monitor.
//!
//! Platform network events alone are not trusted: a terminal can sit on a
//! captive Wi-Fi with no route to the backend. The monitor treats a platform
//! "online" event as a hint, probes `GET /health`, and only a successful
//! probe moves the engine to [`ConnectivityState::Online`]. While online it
//! schedules one sync after a settle delay and then a periodic sync for as
//! long as sales are pending. A platform "offline" event drops straight to
//! Offline and cancels anything scheduled; a pass already running finishes.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
    /// Platform reported online; waiting on the health probe.
    Reconnecting,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// Network change reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Online,
    Offline,
}

enum ProbeOutcome {
    Healthy,
    Unhealthy,
    /// Platform went offline while the probe was in flight.
    Abandoned,
    Cancelled,
}

/// Handle to a running monitor task.
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the monitor and wait for its task to exit. A sync pass already
    /// running is left to finish on its own.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Connectivity monitor task failed");
        }
    }
}

pub struct ConnectivityMonitor {
    engine: Arc<SyncEngine>,
    events: mpsc::Receiver<NetworkEvent>,
    events_open: bool,
    cancel: CancellationToken,
    next_probe: Option<Instant>,
    settle_at: Option<Instant>,
    next_periodic: Option<Instant>,
}

impl ConnectivityMonitor {
    /// Start monitoring on the current tokio runtime.
    pub fn spawn(
        engine: Arc<SyncEngine>,
        initially_online: bool,
        events: mpsc::Receiver<NetworkEvent>,
    ) -> MonitorHandle {
        let cancel = CancellationToken::new();
        let monitor = Self {
            engine,
            events,
            events_open: true,
            cancel: cancel.clone(),
            next_probe: None,
            settle_at: None,
            next_periodic: None,
        };
        let task = tokio::spawn(monitor.run(initially_online));
        MonitorHandle { cancel, task }
    }

    async fn run(mut self, initially_online: bool) {
        info!(initially_online, "Connectivity monitor started");
        if initially_online {
            self.reconnect().await;
        } else {
            self.go_offline();
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.events.recv(), if self.events_open => match event {
                    Some(NetworkEvent::Online) => self.on_platform_online().await,
                    Some(NetworkEvent::Offline) => {
                        if self.engine.connectivity() != ConnectivityState::Offline {
                            info!("Platform reported offline");
                        }
                        self.go_offline();
                    }
                    None => {
                        debug!("Network event channel closed, relying on probes");
                        self.events_open = false;
                    }
                },
                _ = wait_until(self.next_probe) => {
                    self.next_probe = None;
                    self.offline_probe().await;
                }
                _ = wait_until(self.settle_at) => {
                    self.settle_at = None;
                    self.next_periodic = Some(Instant::now() + self.periodic_interval());
                    self.spawn_sync("reconnected");
                }
                _ = wait_until(self.next_periodic) => {
                    self.next_periodic = Some(Instant::now() + self.periodic_interval());
                    if self.engine.eligible_count() > 0 {
                        self.spawn_sync("periodic");
                    }
                }
            }
        }
        info!("Connectivity monitor stopped");
    }

    async fn on_platform_online(&mut self) {
        match self.engine.connectivity() {
            ConnectivityState::Offline => {
                info!("Platform reported online, probing backend");
                self.reconnect().await;
            }
            state => debug!(state = state.as_str(), "Ignoring repeated online event"),
        }
    }

    async fn reconnect(&mut self) {
        self.engine.set_connectivity(ConnectivityState::Reconnecting);
        self.next_probe = None;
        match self.probe().await {
            ProbeOutcome::Healthy => self.go_online(),
            ProbeOutcome::Unhealthy => {
                info!("Backend unreachable, staying offline");
                self.go_offline();
            }
            ProbeOutcome::Abandoned => self.go_offline(),
            ProbeOutcome::Cancelled => {}
        }
    }

    /// Background check while Offline, in case the platform never reports
    /// the network coming back.
    async fn offline_probe(&mut self) {
        self.engine.set_connectivity(ConnectivityState::Reconnecting);
        match self.probe().await {
            ProbeOutcome::Healthy => {
                info!("Backend reachable again");
                self.go_online();
            }
            ProbeOutcome::Unhealthy | ProbeOutcome::Abandoned => self.go_offline(),
            ProbeOutcome::Cancelled => {}
        }
    }

    async fn probe(&mut self) -> ProbeOutcome {
        let timeout = self.engine.config().probe_timeout();
        let backend = self.engine.backend().clone();
        let check = tokio::time::timeout(timeout, async move { backend.health(timeout).await });
        tokio::pin!(check);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return ProbeOutcome::Cancelled,
                result = &mut check => {
                    return match result {
                        Ok(Ok(())) => ProbeOutcome::Healthy,
                        Ok(Err(e)) => {
                            debug!(error = %e, "Health probe failed");
                            ProbeOutcome::Unhealthy
                        }
                        Err(_) => {
                            debug!(
                                timeout_ms = timeout.as_millis() as u64,
                                "Health probe timed out"
                            );
                            ProbeOutcome::Unhealthy
                        }
                    };
                }
                event = self.events.recv(), if self.events_open => match event {
                    Some(NetworkEvent::Offline) => {
                        info!("Platform went offline during health probe");
                        return ProbeOutcome::Abandoned;
                    }
                    Some(NetworkEvent::Online) => {}
                    None => self.events_open = false,
                },
            }
        }
    }

    fn go_online(&mut self) {
        self.engine.set_connectivity(ConnectivityState::Online);
        self.next_probe = None;
        self.next_periodic = None;
        self.settle_at = Some(Instant::now() + self.engine.config().settle_delay());
    }

    fn go_offline(&mut self) {
        self.engine.set_connectivity(ConnectivityState::Offline);
        self.settle_at = None;
        self.next_periodic = None;
        self.next_probe = Some(Instant::now() + self.engine.config().offline_probe_interval());
    }

    fn periodic_interval(&self) -> Duration {
        self.engine.config().periodic_sync_interval()
    }

    fn spawn_sync(&self, trigger: &'static str) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Some(report) = engine.sync_now().await {
                debug!(
                    trigger,
                    synced = report.synced,
                    failed = report.failed,
                    "Background sync finished"
                );
            }
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
