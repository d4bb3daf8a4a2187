pub mod client;
mod mapping;
pub mod parser;

pub use client::{HttpTokenRefresher, RefreshedHubCredentials};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::DriverError;

/// Config blob shape for `mqtt-hub` connectors. The `credentials`
/// substructure is owned exclusively by the token refresher.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Broker endpoint, `mqtt://host:port`.
    pub broker_url: String,
    /// Cloud REST endpoint for outbound device commands and token refresh.
    pub api_url: String,
    /// First path segment of the report topic tree.
    #[serde(default = "default_topic_root")]
    pub topic_root: String,
    /// Cloud account id; discovered on first token refresh when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<HubCredentials>,
}

fn default_topic_root() -> String {
    "hub".to_string()
}

impl HubConfig {
    /// Topic pattern the session subscribes to once connected.
    pub fn report_topic_filter(&self) -> Option<String> {
        self.account_id
            .as_ref()
            .map(|account| format!("{}/{}/+/report", self.topic_root, account))
    }

    pub fn to_value(&self) -> serde_json::Value {
        // HubConfig serialization cannot fail: all fields are plain data.
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HubCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Upstream token exchange, abstracted so the credential store can be
/// exercised without a live cloud endpoint.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        cfg: &'a HubConfig,
    ) -> BoxFuture<'a, Result<RefreshedHubCredentials, DriverError>>;
}
