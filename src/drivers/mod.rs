pub mod hub;
pub mod vms;

use serde::{Deserialize, Serialize};

use crate::model::{ActionableState, Connector, ConnectorCategory, StandardizedEvent};

quick_error! {
    #[derive(Debug)]
    pub enum DriverError {
        Config(error: String) {
            display("Connector config invalid: {}", error)
        }
        Transport(error: String) {
            display("Vendor endpoint unreachable: {}", error)
        }
        Auth(error: String) {
            display("Vendor rejected credentials: {}", error)
        }
        Rejected(status: u16, body: String) {
            display("Vendor rejected request ({}): {}", status, body)
        }
        Unsupported(operation: &'static str) {
            display("Operation not supported by this connector category: {}", operation)
        }
    }
}

impl DriverError {
    /// Transient errors are retried by the session manager; terminal ones
    /// park the session until operator intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            DriverError::Transport(_) => true,
            DriverError::Rejected(status, _) => *status >= 500,
            DriverError::Config(_) | DriverError::Auth(_) | DriverError::Unsupported(_) => false,
        }
    }
}

pub fn classify_reqwest(err: reqwest::Error) -> DriverError {
    DriverError::Transport(err.to_string())
}

/// One raw frame from an upstream transport, before vendor parsing.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RawFrame {
    Mqtt { topic: String, payload: Vec<u8> },
    Text(String),
}

/// Typed view over `connectors.cfg`, keyed by the connector's category.
#[derive(Debug, PartialEq, Clone)]
pub enum ConnectorConfig {
    Hub(hub::HubConfig),
    Vms(vms::VmsConfig),
}

impl ConnectorConfig {
    pub fn parse(connector: &Connector) -> Result<ConnectorConfig, DriverError> {
        let parsed = match connector.category {
            ConnectorCategory::MqttHub => ConnectorConfig::Hub(
                serde_json::from_value(connector.cfg.clone())
                    .map_err(|e| DriverError::Config(e.to_string()))?,
            ),
            ConnectorCategory::VideoVms => ConnectorConfig::Vms(
                serde_json::from_value(connector.cfg.clone())
                    .map_err(|e| DriverError::Config(e.to_string()))?,
            ),
        };
        Ok(parsed)
    }
}

/// Pure per-vendor frame parsing. Unknown or malformed frames yield zero
/// events and a structured warning, never an error.
pub fn parse_frame(connector: &Connector, frame: &RawFrame) -> Vec<StandardizedEvent> {
    match (connector.category, frame) {
        (ConnectorCategory::MqttHub, RawFrame::Mqtt { topic, payload }) => {
            hub::parser::parse(connector, topic, payload)
        }
        (ConnectorCategory::VideoVms, RawFrame::Text(text)) => {
            vms::parser::parse(connector, text)
        }
        _ => {
            tracing::warn!(
                connector = %connector.id,
                category = connector.category.as_str(),
                "Frame transport does not match connector category"
            );
            Vec::new()
        }
    }
}

/// Resolved payload for an upstream `createEvent` call.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateEventRequest {
    pub source: String,
    pub caption: String,
    pub description: String,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub camera_refs: Vec<String>,
}

/// Resolved payload for an upstream `createBookmark` call.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookmarkRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start_time_ms: i64,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct ThumbnailParams {
    pub size: Option<u32>,
    pub at_ms: Option<i64>,
}

/// Outbound command clients, dispatched by connector category. Commands
/// take a config snapshot; they never mutate connector state.
#[derive(Clone)]
pub struct Drivers {
    http: reqwest::Client,
}

impl Drivers {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub async fn set_device_state(
        &self,
        connector: &Connector,
        access_token: Option<&str>,
        external_device_id: &str,
        state: ActionableState,
    ) -> Result<(), DriverError> {
        match ConnectorConfig::parse(connector)? {
            ConnectorConfig::Hub(cfg) => {
                let token = access_token
                    .ok_or_else(|| DriverError::Auth("No access token for hub command".into()))?;
                hub::client::set_state(&self.http, &cfg, token, external_device_id, state).await
            }
            ConnectorConfig::Vms(_) => Err(DriverError::Unsupported("setDeviceState")),
        }
    }

    pub async fn create_event(
        &self,
        connector: &Connector,
        request: &CreateEventRequest,
    ) -> Result<(), DriverError> {
        match ConnectorConfig::parse(connector)? {
            ConnectorConfig::Vms(cfg) => vms::client::create_event(&self.http, &cfg, request).await,
            ConnectorConfig::Hub(_) => Err(DriverError::Unsupported("createEvent")),
        }
    }

    pub async fn create_bookmark(
        &self,
        connector: &Connector,
        camera_external_id: &str,
        request: &CreateBookmarkRequest,
    ) -> Result<(), DriverError> {
        match ConnectorConfig::parse(connector)? {
            ConnectorConfig::Vms(cfg) => {
                vms::client::create_bookmark(&self.http, &cfg, camera_external_id, request).await
            }
            ConnectorConfig::Hub(_) => Err(DriverError::Unsupported("createBookmark")),
        }
    }

    pub async fn fetch_thumbnail(
        &self,
        connector: &Connector,
        camera_external_id: &str,
        params: ThumbnailParams,
    ) -> Result<(Vec<u8>, String), DriverError> {
        match ConnectorConfig::parse(connector)? {
            ConnectorConfig::Vms(cfg) => {
                vms::client::fetch_thumbnail(&self.http, &cfg, camera_external_id, params).await
            }
            ConnectorConfig::Hub(_) => Err(DriverError::Unsupported("fetchThumbnail")),
        }
    }
}
