mod transport;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn};

use crate::drivers::{ConnectorConfig, DriverError};
use crate::model::Connector;
use crate::pipeline::EventSubmitter;
use crate::store::{CredentialError, CredentialStore, Store, StoreError};

quick_error! {
    #[derive(Debug)]
    pub enum SessionError {
        Store(err: StoreError) {
            from()
            display("Session store error: {}", err)
            source(err)
        }
        Credential(err: CredentialError) {
            from()
            display("Session credential error: {}", err)
            source(err)
        }
        Driver(err: DriverError) {
            from()
            display("{}", err)
            source(err)
        }
        Config(error: String) {
            display("Session config invalid: {}", error)
        }
        AuthRejected(error: String) {
            display("Upstream rejected session credentials: {}", error)
        }
        Transport(error: String) {
            display("Session transport error: {}", error)
        }
        Timeout(phase: &'static str) {
            display("Timed out while {}", phase)
        }
        Closed {
            display("Upstream closed the connection")
        }
        Connect(reason: String) {
            display("Session could not be established: {}", reason)
        }
        NotFound(connector_id: String) {
            display("No session for connector {}", connector_id)
        }
    }
}

/// Per-session lifecycle states.
#[derive(Debug, PartialEq, Eq, Serialize, Clone, Copy)]
pub enum SessionState {
    Disabled,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, PartialEq, Serialize, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub since: DateTime<Utc>,
}

impl SessionStatus {
    fn new(state: SessionState, last_error: Option<String>) -> Self {
        Self { state, last_error, since: Utc::now() }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ControlMessage {
    Reconnect,
    Shutdown,
}

/// Initial connect must finish inside this window.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Topic/stream subscription after a successful connect.
pub(crate) const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Keepalive interval both vendors are held to.
pub(crate) const KEEPALIVE: Duration = Duration::from_secs(30);
/// Grace on top of the keepalive before a silent link is recycled.
pub(crate) const IDLE_GRACE: Duration = Duration::from_secs(30);

/// Reconnect backoff series: `5·2^(n−1)` seconds, capped at 60.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = 5u64.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_secs(base.min(60))
}

/// Backoff with up to 10% added jitter.
pub(crate) fn backoff_delay_jittered(attempt: u32) -> Duration {
    let base = backoff_delay(attempt);
    let jitter_ms = (base.as_millis() as u64) / 10;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::Rng::gen_range(&mut rand::thread_rng(), 0..jitter_ms))
}

struct WorkerHandle {
    control: mpsc::UnboundedSender<ControlMessage>,
    status: watch::Receiver<SessionStatus>,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    /// connector id → live worker.
    workers: HashMap<String, WorkerHandle>,
    /// physical session key → owning connector id.
    session_keys: HashMap<String, String>,
}

/// Maintains exactly one live upstream session per enabled connector.
pub struct SessionManager {
    store: Arc<Store>,
    credentials: Arc<CredentialStore>,
    submitter: EventSubmitter,
    registry: Mutex<Registry>,
}

impl SessionManager {
    pub fn new(store: Arc<Store>, credentials: Arc<CredentialStore>, submitter: EventSubmitter) -> Self {
        Self { store, credentials, submitter, registry: Mutex::new(Registry::default()) }
    }

    /// Startup scan: bring up a session for every enabled connector.
    /// Idempotent; connectors with live workers are left alone.
    pub async fn initialize_all(&self) -> Result<(), SessionError> {
        for connector in self.store.list_enabled_connectors()? {
            self.start_session(&connector).await;
        }
        Ok(())
    }

    /// Persist the enable flag, bring the session up, and wait until it
    /// is `Connected` or a first definitive failure is observed.
    pub async fn enable(&self, connector_id: &str) -> Result<SessionStatus, SessionError> {
        self.store.set_connector_events_enabled(connector_id, true)?;
        let connector = self
            .store
            .get_connector(connector_id)?
            .ok_or_else(|| SessionError::NotFound(connector_id.to_string()))?;
        self.start_session(&connector).await;

        let mut status_rx = self
            .status_receiver(connector_id)
            .await
            .ok_or_else(|| SessionError::NotFound(connector_id.to_string()))?;
        loop {
            let status = status_rx.borrow().clone();
            match status.state {
                SessionState::Connected => return Ok(status),
                SessionState::Failed => {
                    return Err(SessionError::Connect(
                        status.last_error.unwrap_or_else(|| "unknown failure".into()),
                    ))
                }
                SessionState::Reconnecting if status.last_error.is_some() => {
                    // First connect attempt failed; the worker keeps
                    // retrying in the background, but the caller gets the
                    // reason now.
                    return Err(SessionError::Connect(
                        status.last_error.unwrap_or_default(),
                    ));
                }
                _ => {}
            }
            if status_rx.changed().await.is_err() {
                return Err(SessionError::Closed);
            }
        }
    }

    /// Persist the disable flag, tear the session down and wait for the
    /// worker to drain.
    pub async fn disable(&self, connector_id: &str) -> Result<(), SessionError> {
        self.store.set_connector_events_enabled(connector_id, false)?;
        let handle = {
            let mut registry = self.registry.lock().await;
            registry.session_keys.retain(|_, owner| owner != connector_id);
            registry.workers.remove(connector_id)
        };
        if let Some(handle) = handle {
            let _ = handle.control.send(ControlMessage::Shutdown);
            let _ = handle.join.await;
            info!(connector = connector_id, "Session torn down");
        }
        Ok(())
    }

    /// Deletion is disable plus forgetting; persistence cascade is the
    /// store's job.
    pub async fn forget(&self, connector_id: &str) -> Result<(), SessionError> {
        self.disable(connector_id).await
    }

    pub async fn reconnect(&self, connector_id: &str) -> Result<(), SessionError> {
        let registry = self.registry.lock().await;
        let handle = registry
            .workers
            .get(connector_id)
            .ok_or_else(|| SessionError::NotFound(connector_id.to_string()))?;
        handle
            .control
            .send(ControlMessage::Reconnect)
            .map_err(|_| SessionError::Closed)?;
        Ok(())
    }

    /// Recycle every live session and start any enabled connector that
    /// lost its worker. Safe to call after config changes.
    pub async fn reconnect_all(&self) -> Result<(), SessionError> {
        {
            let registry = self.registry.lock().await;
            for handle in registry.workers.values() {
                let _ = handle.control.send(ControlMessage::Reconnect);
            }
        }
        self.initialize_all().await
    }

    pub async fn shutdown(&self) {
        let handles: Vec<(String, WorkerHandle)> = {
            let mut registry = self.registry.lock().await;
            registry.session_keys.clear();
            registry.workers.drain().collect()
        };
        for (connector_id, handle) in handles {
            let _ = handle.control.send(ControlMessage::Shutdown);
            if handle.join.await.is_err() {
                warn!(connector = %connector_id, "Session worker aborted during shutdown");
            }
        }
    }

    pub async fn status(&self, connector_id: &str) -> Option<SessionStatus> {
        self.status_receiver(connector_id)
            .await
            .map(|rx| rx.borrow().clone())
    }

    async fn status_receiver(&self, connector_id: &str) -> Option<watch::Receiver<SessionStatus>> {
        let registry = self.registry.lock().await;
        registry.workers.get(connector_id).map(|h| h.status.clone())
    }

    /// A connector with a live worker registers nothing new. A connector
    /// whose physical session key is already owned by another live worker
    /// reuses that worker and re-binds ownership.
    async fn start_session(&self, connector: &Connector) {
        let mut registry = self.registry.lock().await;

        if let Some(handle) = registry.workers.get(&connector.id) {
            if !handle.join.is_finished() {
                return;
            }
            registry.workers.remove(&connector.id);
        }

        let key = session_key(connector);
        if let Some(owner) = registry.session_keys.get(&key).cloned() {
            if owner != connector.id {
                if let Some(handle) = registry.workers.remove(&owner) {
                    if !handle.join.is_finished() {
                        let previous_exists = matches!(
                            self.store.get_connector(&owner),
                            Ok(Some(previous)) if previous.events_enabled
                        );
                        if previous_exists {
                            warn!(
                                session_key = %key,
                                previous = %owner,
                                connector = %connector.id,
                                "Session key already live; re-binding worker to new connector"
                            );
                        }
                        registry.session_keys.insert(key, connector.id.clone());
                        registry.workers.insert(connector.id.clone(), handle);
                        return;
                    }
                }
            }
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) =
            watch::channel(SessionStatus::new(SessionState::Connecting, None));
        let span = info_span!("session", connector = %connector.id, name = %connector.name);
        let ctx = worker::WorkerContext {
            connector_id: connector.id.clone(),
            store: self.store.clone(),
            credentials: self.credentials.clone(),
            submitter: self.submitter.clone(),
            control_rx,
            status_tx,
        };
        let join = tokio::spawn(tracing::Instrument::instrument(worker::run(ctx), span));

        registry.session_keys.insert(key, connector.id.clone());
        registry.workers.insert(
            connector.id.clone(),
            WorkerHandle { control: control_tx, status: status_rx, join },
        );
    }

    /// Registry invariant check used by tests and the status surface.
    pub async fn has_live_session(&self, connector_id: &str) -> bool {
        let registry = self.registry.lock().await;
        registry
            .workers
            .get(connector_id)
            .map(|h| !h.join.is_finished())
            .unwrap_or(false)
    }
}

/// Physical session identity. Hub connectors sharing a cloud account share
/// one broker session; everything else is keyed by connector.
fn session_key(connector: &Connector) -> String {
    if let Ok(ConnectorConfig::Hub(cfg)) = ConnectorConfig::parse(connector) {
        if let Some(account) = cfg.account_id {
            return format!("hub:{}", account);
        }
    }
    format!("connector:{}", connector.id)
}
