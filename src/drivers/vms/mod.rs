pub mod client;
mod mapping;
pub mod parser;

use serde::{Deserialize, Serialize};

/// Config blob shape for `video-vms` connectors.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VmsConfig {
    /// REST endpoint, `https://host:port`.
    pub base_url: String,
    pub api_token: String,
    /// Event-stream endpoint; derived from `base_url` when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
}

impl VmsConfig {
    /// WebSocket endpoint the session connects to.
    pub fn event_stream_url(&self) -> String {
        if let Some(ws) = &self.ws_url {
            return ws.clone();
        }
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/api/ws/events", ws_base)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_event_stream_url_derivation() {
        let cfg = VmsConfig {
            base_url: "https://vms.example:7001/".into(),
            api_token: "t".into(),
            ws_url: None,
        };
        assert_eq!(cfg.event_stream_url(), "wss://vms.example:7001/api/ws/events");

        let overridden = VmsConfig { ws_url: Some("wss://other/stream".into()), ..cfg };
        assert_eq!(overridden.event_stream_url(), "wss://other/stream");
    }
}
