use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::drivers::hub::{HubConfig, TokenRefresher};
use crate::drivers::DriverError;
use crate::model::{Connector, ConnectorCategory};

use super::{Store, StoreError};

/// Refresh this far ahead of `token_expires_at`.
const EXPIRY_SKEW_SECS: i64 = 60;

quick_error! {
    #[derive(Debug)]
    pub enum CredentialError {
        Store(err: StoreError) {
            from()
            display("Credential store error: {}", err)
            source(err)
        }
        NotFound(connector_id: String) {
            display("Connector not found: {}", connector_id)
        }
        WrongCategory(connector_id: String) {
            display("Connector {} does not carry rotating credentials", connector_id)
        }
        Config(error: String) {
            display("Connector config unusable: {}", error)
        }
        /// Transient upstream failure; the caller may retry with backoff.
        Transport(error: String) {
            display("Token refresh failed: {}", error)
        }
        /// Terminal until the operator corrects the stored credentials.
        Auth(error: String) {
            display("Token refresh rejected: {}", error)
        }
    }
}

impl CredentialError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CredentialError::Transport(_) | CredentialError::Store(_))
    }
}

/// Owns connector credentials: hands out valid access tokens, serializing
/// refreshes per connector so concurrent callers observe one rotation.
pub struct CredentialStore {
    store: Arc<Store>,
    refresher: Arc<dyn TokenRefresher>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialStore {
    pub fn new(store: Arc<Store>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self { store, refresher, locks: Mutex::new(HashMap::new()) }
    }

    pub fn get_connector(&self, connector_id: &str) -> Result<Connector, CredentialError> {
        self.store
            .get_connector(connector_id)?
            .ok_or_else(|| CredentialError::NotFound(connector_id.to_string()))
    }

    /// Current hub config snapshot, without touching the token.
    pub fn hub_config(&self, connector_id: &str) -> Result<(Connector, HubConfig), CredentialError> {
        let connector = self.get_connector(connector_id)?;
        if connector.category != ConnectorCategory::MqttHub {
            return Err(CredentialError::WrongCategory(connector_id.to_string()));
        }
        let cfg: HubConfig = serde_json::from_value(connector.cfg.clone())
            .map_err(|e| CredentialError::Config(e.to_string()))?;
        Ok((connector, cfg))
    }

    /// An access token valid for at least the expiry skew, refreshing if
    /// needed.
    pub async fn fresh_hub_token(&self, connector_id: &str) -> Result<String, CredentialError> {
        self.token_inner(connector_id, false).await
    }

    /// Unconditional refresh, except that callers racing one in-flight
    /// refresh all receive its result instead of stacking rotations.
    pub async fn force_refresh(&self, connector_id: &str) -> Result<String, CredentialError> {
        self.token_inner(connector_id, true).await
    }

    async fn token_inner(&self, connector_id: &str, force: bool) -> Result<String, CredentialError> {
        // Observed before taking the lock; if the stored token changes
        // while we wait, another caller already rotated it.
        let token_before = self
            .hub_config(connector_id)?
            .1
            .credentials
            .and_then(|c| c.access_token);

        let lock = self.connector_lock(connector_id).await;
        let _guard = lock.lock().await;

        // Re-read under the lock: the snapshot above may be stale.
        let (_, cfg) = self.hub_config(connector_id)?;
        if let Some(credentials) = &cfg.credentials {
            if let (Some(token), Some(expires_at)) =
                (&credentials.access_token, credentials.token_expires_at)
            {
                let still_valid =
                    expires_at - Duration::seconds(EXPIRY_SKEW_SECS) > Utc::now();
                let rotated_while_waiting =
                    force && token_before.as_deref() != Some(token.as_str());
                if (!force && still_valid) || (rotated_while_waiting && still_valid) {
                    return Ok(token.clone());
                }
            }
        }

        let refreshed = match self.refresher.refresh(&cfg).await {
            Ok(refreshed) => refreshed,
            Err(DriverError::Auth(e)) => return Err(CredentialError::Auth(e)),
            Err(DriverError::Config(e)) => return Err(CredentialError::Config(e)),
            Err(e) => return Err(CredentialError::Transport(e.to_string())),
        };

        let mut updated = cfg.clone();
        if let Some(credentials) = updated.credentials.as_mut() {
            credentials.access_token = Some(refreshed.access_token.clone());
            if refreshed.refresh_token.is_some() {
                credentials.refresh_token = refreshed.refresh_token.clone();
            }
            credentials.token_expires_at = Some(refreshed.expires_at);
        }
        if let Some(account_id) = &refreshed.account_id {
            if updated.account_id.as_deref() != Some(account_id.as_str()) {
                info!(connector = connector_id, account = %account_id, "Hub account id discovered");
                updated.account_id = Some(account_id.clone());
            }
        }

        // Persist before handing the token out. A write failure is not
        // fatal: the session keeps working on the in-memory token and the
        // next startup refreshes again.
        if let Err(e) = self.store.update_connector_cfg(connector_id, &updated.to_value()) {
            error!(connector = connector_id, error = %e, "Could not persist rotated token");
        }
        Ok(refreshed.access_token)
    }

    async fn connector_lock(&self, connector_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(connector_id.to_string()).or_default().clone()
    }
}
