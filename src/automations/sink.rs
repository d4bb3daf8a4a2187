use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::arming::{ArmRequest, ArmSource, ArmingService};
use crate::drivers::Drivers;
use crate::model::{ConnectorCategory, HttpMethod};
use crate::store::{CredentialStore, OrgGateway};

use super::actions::{ActionError, ResolvedAction};

/// Executes one resolved action against the outside world. Abstracted so
/// engine tests can record actions instead of calling vendors.
pub trait ActionSink: Send + Sync {
    fn execute<'a>(
        &'a self,
        gateway: &'a OrgGateway,
        action: &'a ResolvedAction,
    ) -> BoxFuture<'a, Result<(), ActionError>>;
}

/// Pushover-style push endpoint settings.
#[derive(Debug, PartialEq, serde::Serialize, Deserialize, Clone)]
pub struct PushSettings {
    #[serde(default = "default_push_api_url")]
    pub api_url: String,
    pub token: String,
    /// Delivery group addressed by the `__all__` sentinel.
    pub group_key: String,
}

fn default_push_api_url() -> String {
    "https://api.pushover.net/1/messages.json".to_string()
}

/// Production sink: vendor clients, push endpoint, arming service.
pub struct LiveActionSink {
    drivers: Drivers,
    credentials: Arc<CredentialStore>,
    arming: Arc<ArmingService>,
    push: Option<PushSettings>,
}

impl LiveActionSink {
    pub fn new(
        drivers: Drivers,
        credentials: Arc<CredentialStore>,
        arming: Arc<ArmingService>,
        push: Option<PushSettings>,
    ) -> Self {
        Self { drivers, credentials, arming, push }
    }

    async fn run(&self, gateway: &OrgGateway, action: &ResolvedAction) -> Result<(), ActionError> {
        match action {
            ResolvedAction::Skip { reason } => {
                debug!(%reason, "Action skipped");
                Ok(())
            }
            ResolvedAction::CreateEvent { target_connector_id, request } => {
                let connector = gateway
                    .connector(target_connector_id)
                    .map_err(|e| ActionError::Execute(e.to_string()))?
                    .ok_or_else(|| {
                        ActionError::Execute(format!("Unknown target connector {}", target_connector_id))
                    })?;
                self.drivers
                    .create_event(&connector, request)
                    .await
                    .map_err(|e| ActionError::Execute(e.to_string()))
            }
            ResolvedAction::CreateBookmark { target_connector_id, camera_external_ids, request } => {
                let connector = gateway
                    .connector(target_connector_id)
                    .map_err(|e| ActionError::Execute(e.to_string()))?
                    .ok_or_else(|| {
                        ActionError::Execute(format!("Unknown target connector {}", target_connector_id))
                    })?;
                let mut failures = Vec::new();
                for camera in camera_external_ids {
                    if let Err(e) = self.drivers.create_bookmark(&connector, camera, request).await
                    {
                        warn!(camera = %camera, error = %e, "Bookmark call failed");
                        failures.push(format!("{}: {}", camera, e));
                    }
                }
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(ActionError::Execute(failures.join("; ")))
                }
            }
            ResolvedAction::HttpRequest { url, method, headers, body } => {
                let client = self.drivers.http();
                let mut request = match method {
                    HttpMethod::Get => client.get(url),
                    HttpMethod::Post => client.post(url),
                    HttpMethod::Put => client.put(url),
                    HttpMethod::Patch => client.patch(url),
                    HttpMethod::Delete => client.delete(url),
                };
                for (key, value) in headers {
                    request = request.header(key, value);
                }
                if let Some(body) = body {
                    request = request.body(body.clone());
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| ActionError::Execute(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(ActionError::Execute(format!(
                        "HTTP action returned {}",
                        response.status()
                    )));
                }
                Ok(())
            }
            ResolvedAction::SetDeviceState { device_internal_id, target_state } => {
                let device = gateway
                    .device(device_internal_id)
                    .map_err(|e| ActionError::Execute(e.to_string()))?
                    .ok_or_else(|| {
                        ActionError::Execute(format!("Unknown target device {}", device_internal_id))
                    })?;
                let connector = gateway
                    .connector(&device.connector_id)
                    .map_err(|e| ActionError::Execute(e.to_string()))?
                    .ok_or_else(|| {
                        ActionError::Execute(format!("Unknown connector {}", device.connector_id))
                    })?;
                let token = match connector.category {
                    ConnectorCategory::MqttHub => Some(
                        self.credentials
                            .fresh_hub_token(&connector.id)
                            .await
                            .map_err(|e| ActionError::Execute(e.to_string()))?,
                    ),
                    ConnectorCategory::VideoVms => None,
                };
                self.drivers
                    .set_device_state(&connector, token.as_deref(), &device.external_id, *target_state)
                    .await
                    .map_err(|e| ActionError::Execute(e.to_string()))
            }
            ResolvedAction::PushNotification { title, message, target_user_key, priority } => {
                let Some(push) = &self.push else {
                    return Err(ActionError::Execute(
                        "Push notifications are not configured".into(),
                    ));
                };
                let user = match target_user_key.as_deref() {
                    None | Some("") | Some("__all__") => push.group_key.as_str(),
                    Some(key) => key,
                };
                let mut form = vec![
                    ("token", push.token.clone()),
                    ("user", user.to_string()),
                    ("title", title.clone()),
                    ("message", message.clone()),
                ];
                if let Some(priority) = priority {
                    form.push(("priority", priority.to_string()));
                }
                let response = self
                    .drivers
                    .http()
                    .post(&push.api_url)
                    .form(&form)
                    .send()
                    .await
                    .map_err(|e| ActionError::Execute(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(ActionError::Execute(format!(
                        "Push endpoint returned {}",
                        response.status()
                    )));
                }
                Ok(())
            }
            ResolvedAction::ArmAreas { area_ids, arm_mode } => {
                self.apply_arming(gateway, area_ids, ArmRequest::Arm(*arm_mode))
            }
            ResolvedAction::DisarmAreas { area_ids } => {
                self.apply_arming(gateway, area_ids, ArmRequest::Disarm)
            }
        }
    }

    fn apply_arming(
        &self,
        gateway: &OrgGateway,
        area_ids: &[String],
        request: ArmRequest,
    ) -> Result<(), ActionError> {
        if area_ids.is_empty() {
            debug!("Arming action had no areas in scope");
            return Ok(());
        }
        let outcome = self.arming.apply_to_areas(gateway, area_ids, request, ArmSource::Automation);
        if outcome.failed.is_empty() {
            Ok(())
        } else {
            let detail = outcome
                .failed
                .iter()
                .map(|f| format!("{}: {}", f.area_id, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            Err(ActionError::Execute(detail))
        }
    }
}

impl ActionSink for LiveActionSink {
    fn execute<'a>(
        &'a self,
        gateway: &'a OrgGateway,
        action: &'a ResolvedAction,
    ) -> BoxFuture<'a, Result<(), ActionError>> {
        self.run(gateway, action).boxed()
    }
}
