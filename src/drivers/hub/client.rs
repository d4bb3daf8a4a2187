use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use tracing::debug;

use crate::drivers::{classify_reqwest, DriverError};
use crate::model::ActionableState;

use super::{HubConfig, TokenRefresher};

/// Result of one upstream token exchange.
#[derive(Debug, PartialEq, Clone)]
pub struct RefreshedHubCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Cloud account id reported alongside the token; used to key the
    /// physical MQTT session and the report topic.
    pub account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default, alias = "accountId")]
    home_id: Option<String>,
}

/// Real token exchange against the hub cloud.
pub struct HttpTokenRefresher {
    http: reqwest::Client,
}

impl HttpTokenRefresher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl TokenRefresher for HttpTokenRefresher {
    fn refresh<'a>(
        &'a self,
        cfg: &'a HubConfig,
    ) -> BoxFuture<'a, Result<RefreshedHubCredentials, DriverError>> {
        async move {
            let credentials = cfg
                .credentials
                .as_ref()
                .ok_or_else(|| DriverError::Config("Hub connector has no credentials".into()))?;

            // A stored refresh token continues the grant chain; otherwise
            // fall back to the client-credentials grant.
            let form: Vec<(&str, &str)> = match credentials.refresh_token.as_deref() {
                Some(refresh_token) => vec![
                    ("grant_type", "refresh_token"),
                    ("client_id", credentials.client_id.as_str()),
                    ("refresh_token", refresh_token),
                ],
                None => vec![
                    ("grant_type", "client_credentials"),
                    ("client_id", credentials.client_id.as_str()),
                    ("client_secret", credentials.client_secret.as_str()),
                ],
            };

            let response = self
                .http
                .post(&credentials.token_url)
                .form(&form)
                .send()
                .await
                .map_err(classify_reqwest)?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
                || status == reqwest::StatusCode::BAD_REQUEST
            {
                // An unusable refresh token is terminal until the operator
                // re-enters credentials.
                let body = response.text().await.unwrap_or_default();
                return Err(DriverError::Auth(format!("Token endpoint returned {}: {}", status, body)));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(DriverError::Rejected(status.as_u16(), body));
            }

            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| DriverError::Transport(format!("Token response mangled: {}", e)))?;
            debug!(expires_in = token.expires_in, "Hub token refreshed");

            Ok(RefreshedHubCredentials {
                access_token: token.access_token,
                refresh_token: token.refresh_token,
                expires_at: Utc::now() + Duration::seconds(token.expires_in),
                account_id: token.home_id,
            })
        }
        .boxed()
    }
}

/// Command a device end state through the hub cloud API.
pub async fn set_state(
    http: &reqwest::Client,
    cfg: &HubConfig,
    access_token: &str,
    external_device_id: &str,
    state: ActionableState,
) -> Result<(), DriverError> {
    let url = format!("{}/devices/{}/state", cfg.api_url.trim_end_matches('/'), external_device_id);
    let response = http
        .post(&url)
        .bearer_auth(access_token)
        .json(&serde_json::json!({ "state": state.to_string() }))
        .send()
        .await
        .map_err(classify_reqwest)?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(DriverError::Auth(format!("Hub rejected device command: {}", status)));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(DriverError::Rejected(status.as_u16(), body));
    }
    Ok(())
}
