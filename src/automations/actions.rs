use tracing::warn;

use crate::drivers::{CreateBookmarkRequest, CreateEventRequest};
use crate::model::{
    ActionConfig, ActionableState, ArmedState, CameraAssociation, HttpMethod, StandardizedEvent,
};

use super::tokens::{resolve, TemplateContext};

/// A bookmark longer than this is almost certainly a template mistake.
const DEFAULT_BOOKMARK_DURATION_MS: i64 = 5000;

quick_error! {
    #[derive(Debug)]
    pub enum ActionError {
        Resolve(error: String) {
            display("Action parameters could not be resolved: {}", error)
        }
        Execute(error: String) {
            display("Action failed: {}", error)
        }
        Timeout {
            display("Action timed out")
        }
        Cancelled {
            display("Action cancelled by shutdown")
        }
    }
}

/// Everything an action needs beyond templates, prefetched by the engine
/// through the tenant gateway.
#[derive(Debug, Default, Clone)]
pub struct ActionInputs {
    /// Camera associations of the triggering device.
    pub camera_associations: Vec<CameraAssociation>,
    /// Areas covered by `ALL_AREAS_IN_SCOPE` for this automation.
    pub in_scope_area_ids: Vec<String>,
}

/// An action with all templates substituted, ready to execute. The
/// serialized form is the pre-execute parameter snapshot on the action's
/// audit row.
#[derive(Debug, PartialEq, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolvedAction {
    CreateEvent {
        target_connector_id: String,
        request: CreateEventRequest,
    },
    CreateBookmark {
        target_connector_id: String,
        /// One upstream call is made per camera.
        camera_external_ids: Vec<String>,
        request: CreateBookmarkRequest,
    },
    HttpRequest {
        url: String,
        method: HttpMethod,
        headers: Vec<(String, String)>,
        body: Option<String>,
    },
    SetDeviceState {
        device_internal_id: String,
        target_state: ActionableState,
    },
    PushNotification {
        title: String,
        message: String,
        /// Resolved user key; the sink maps the `__all__` sentinel to the
        /// configured group key.
        target_user_key: Option<String>,
        priority: Option<i8>,
    },
    ArmAreas {
        area_ids: Vec<String>,
        arm_mode: ArmedState,
    },
    DisarmAreas {
        area_ids: Vec<String>,
    },
    /// Nothing to do; recorded as a success with a note.
    Skip { reason: String },
}

/// Substitute templates and attach prefetched context. Pure in its
/// inputs; the trigger event supplies bookmark and event timestamps.
pub fn resolve_action(
    action: &ActionConfig,
    ctx: &TemplateContext,
    inputs: &ActionInputs,
    trigger_event: Option<&StandardizedEvent>,
) -> Result<ResolvedAction, ActionError> {
    let resolved = match action {
        ActionConfig::CreateEvent {
            target_connector_id,
            source_template,
            caption_template,
            description_template,
        } => {
            // Associated cameras enrich the event; their absence does not
            // block it.
            let camera_refs = cameras_on_connector(inputs, target_connector_id);
            ResolvedAction::CreateEvent {
                target_connector_id: target_connector_id.clone(),
                request: CreateEventRequest {
                    source: resolve(source_template, ctx),
                    caption: resolve(caption_template, ctx),
                    description: resolve(description_template, ctx),
                    timestamp_ms: trigger_event
                        .map(|e| e.timestamp.timestamp_millis())
                        .unwrap_or_default(),
                    camera_refs,
                },
            }
        }
        ActionConfig::CreateBookmark {
            target_connector_id,
            name_template,
            description_template,
            duration_ms_template,
            tags_template,
        } => {
            let camera_external_ids = cameras_on_connector(inputs, target_connector_id);
            if camera_external_ids.is_empty() {
                warn!(
                    connector = %target_connector_id,
                    "Bookmark skipped: triggering device has no associated cameras"
                );
                return Ok(ResolvedAction::Skip {
                    reason: "no associated cameras".to_string(),
                });
            }
            let duration_raw = resolve(duration_ms_template, ctx);
            let duration_ms = match duration_raw.trim().parse::<i64>() {
                Ok(parsed) if parsed > 0 => parsed,
                _ => DEFAULT_BOOKMARK_DURATION_MS,
            };
            let tags = tags_template
                .as_deref()
                .map(|t| resolve(t, ctx))
                .map(|csv| {
                    csv.split(',')
                        .map(|tag| tag.trim().to_string())
                        .filter(|tag| !tag.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            ResolvedAction::CreateBookmark {
                target_connector_id: target_connector_id.clone(),
                camera_external_ids,
                request: CreateBookmarkRequest {
                    name: resolve(name_template, ctx),
                    description: description_template.as_deref().map(|t| resolve(t, ctx)),
                    start_time_ms: trigger_event
                        .map(|e| e.timestamp.timestamp_millis())
                        .unwrap_or_default(),
                    duration_ms,
                    tags,
                },
            }
        }
        ActionConfig::SendHttpRequest { url_template, method, headers, body_template } => {
            let url = resolve(url_template, ctx);
            if url.is_empty() {
                return Err(ActionError::Resolve("URL template resolved empty".into()));
            }
            ResolvedAction::HttpRequest {
                url,
                method: *method,
                headers: headers
                    .iter()
                    .map(|h| (resolve(&h.key_template, ctx), resolve(&h.value_template, ctx)))
                    .filter(|(key, _)| !key.is_empty())
                    .collect(),
                body: body_template.as_deref().map(|t| resolve(t, ctx)),
            }
        }
        ActionConfig::SetDeviceState { target_device_internal_id, target_state } => {
            ResolvedAction::SetDeviceState {
                device_internal_id: target_device_internal_id.clone(),
                target_state: *target_state,
            }
        }
        ActionConfig::SendPushNotification {
            title_template,
            message_template,
            target_user_key_template,
            priority,
        } => ResolvedAction::PushNotification {
            title: resolve(title_template, ctx),
            message: resolve(message_template, ctx),
            target_user_key: target_user_key_template.as_deref().map(|t| resolve(t, ctx)),
            priority: *priority,
        },
        ActionConfig::ArmArea { scoping, target_area_ids, arm_mode } => {
            if !matches!(arm_mode, ArmedState::ArmedAway | ArmedState::ArmedStay) {
                return Err(ActionError::Resolve(format!(
                    "armArea cannot target state {}",
                    arm_mode
                )));
            }
            ResolvedAction::ArmAreas {
                area_ids: scoped_areas(*scoping, target_area_ids, inputs),
                arm_mode: *arm_mode,
            }
        }
        ActionConfig::DisarmArea { scoping, target_area_ids } => ResolvedAction::DisarmAreas {
            area_ids: scoped_areas(*scoping, target_area_ids, inputs),
        },
    };
    Ok(resolved)
}

fn cameras_on_connector(inputs: &ActionInputs, connector_id: &str) -> Vec<String> {
    inputs
        .camera_associations
        .iter()
        .filter(|assoc| assoc.camera_connector_id == connector_id)
        .map(|assoc| assoc.camera_external_id.clone())
        .collect()
}

fn scoped_areas(
    scoping: crate::model::ActionScoping,
    target_area_ids: &[String],
    inputs: &ActionInputs,
) -> Vec<String> {
    match scoping {
        crate::model::ActionScoping::SpecificAreas => target_area_ids.to_vec(),
        crate::model::ActionScoping::AllAreasInScope => inputs.in_scope_area_ids.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{
        ActionScoping, ConnectorCategory, DisplayState, EventCategory, EventKind, EventPayload,
    };
    use crate::model::{Connector, Device, DeviceType};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn trigger_event() -> StandardizedEvent {
        StandardizedEvent {
            event_id: Uuid::nil(),
            organization_id: "o1".into(),
            connector_id: "c1".into(),
            device_id: "abc".into(),
            category: EventCategory::StateChange,
            kind: EventKind::StateChanged,
            subtype: None,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap(),
            payload: EventPayload {
                display_state: Some(DisplayState::Open),
                ..Default::default()
            },
            device_info: None,
        }
    }

    fn template_ctx() -> TemplateContext {
        let device = Device {
            id: "d1".into(),
            connector_id: "c1".into(),
            external_id: "abc".into(),
            name: "Front Door".into(),
            device_type: DeviceType::DoorSensor,
            subtype: None,
            vendor: None,
            model: None,
            status: None,
            battery_percentage: None,
            last_seen: None,
            display_state: None,
        };
        let connector = Connector {
            id: "c1".into(),
            organization_id: "o1".into(),
            category: ConnectorCategory::MqttHub,
            name: "Hub".into(),
            cfg: serde_json::json!({}),
            events_enabled: true,
        };
        TemplateContext::new(Some(&trigger_event()), Some(&device), None, None, Some(&connector), None)
    }

    fn associations() -> ActionInputs {
        ActionInputs {
            camera_associations: vec![
                CameraAssociation {
                    device_id: "d1".into(),
                    camera_connector_id: "v1".into(),
                    camera_external_id: "cam-1".into(),
                },
                CameraAssociation {
                    device_id: "d1".into(),
                    camera_connector_id: "v1".into(),
                    camera_external_id: "cam-2".into(),
                },
                CameraAssociation {
                    device_id: "d1".into(),
                    camera_connector_id: "v-other".into(),
                    camera_external_id: "cam-9".into(),
                },
            ],
            in_scope_area_ids: vec!["a1".into(), "a2".into()],
        }
    }

    #[test]
    fn test_bookmark_targets_connector_cameras() {
        let action = ActionConfig::CreateBookmark {
            target_connector_id: "v1".into(),
            name_template: "{{device.name}}".into(),
            description_template: None,
            duration_ms_template: "3000".into(),
            tags_template: Some("door, security".into()),
        };
        let resolved =
            resolve_action(&action, &template_ctx(), &associations(), Some(&trigger_event()))
                .unwrap();
        match resolved {
            ResolvedAction::CreateBookmark { camera_external_ids, request, .. } => {
                insta::assert_yaml_snapshot!(camera_external_ids, @r###"
                ---
                - cam-1
                - cam-2
                "###);
                assert_eq!(request.name, "Front Door");
                assert_eq!(request.duration_ms, 3000);
                assert_eq!(request.start_time_ms, trigger_event().timestamp.timestamp_millis());
                assert_eq!(request.tags, vec!["door", "security"]);
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[test]
    fn test_bookmark_without_cameras_skips() {
        let action = ActionConfig::CreateBookmark {
            target_connector_id: "v-unassociated".into(),
            name_template: "n".into(),
            description_template: None,
            duration_ms_template: "3000".into(),
            tags_template: None,
        };
        let resolved =
            resolve_action(&action, &template_ctx(), &associations(), Some(&trigger_event()))
                .unwrap();
        assert!(matches!(resolved, ResolvedAction::Skip { .. }));
    }

    #[test]
    fn test_bookmark_duration_defaults() {
        for bad in ["", "abc", "-200", "0"] {
            let action = ActionConfig::CreateBookmark {
                target_connector_id: "v1".into(),
                name_template: "n".into(),
                description_template: None,
                duration_ms_template: bad.into(),
                tags_template: None,
            };
            let resolved =
                resolve_action(&action, &template_ctx(), &associations(), Some(&trigger_event()))
                    .unwrap();
            match resolved {
                ResolvedAction::CreateBookmark { request, .. } => {
                    assert_eq!(request.duration_ms, DEFAULT_BOOKMARK_DURATION_MS, "for {:?}", bad);
                }
                other => panic!("unexpected resolution: {:?}", other),
            }
        }
    }

    #[test]
    fn test_create_event_proceeds_without_cameras() {
        let action = ActionConfig::CreateEvent {
            target_connector_id: "v-unassociated".into(),
            source_template: "fusion".into(),
            caption_template: "{{device.name}} {{event.displayState}}".into(),
            description_template: "".into(),
        };
        let resolved =
            resolve_action(&action, &template_ctx(), &associations(), Some(&trigger_event()))
                .unwrap();
        match resolved {
            ResolvedAction::CreateEvent { request, .. } => {
                assert!(request.camera_refs.is_empty());
                assert_eq!(request.caption, "Front Door OPEN");
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[test]
    fn test_scoping_resolution() {
        let action = ActionConfig::ArmArea {
            scoping: ActionScoping::AllAreasInScope,
            target_area_ids: vec![],
            arm_mode: ArmedState::ArmedAway,
        };
        let resolved =
            resolve_action(&action, &template_ctx(), &associations(), None).unwrap();
        assert_eq!(
            resolved,
            ResolvedAction::ArmAreas {
                area_ids: vec!["a1".into(), "a2".into()],
                arm_mode: ArmedState::ArmedAway
            }
        );

        let action = ActionConfig::DisarmArea {
            scoping: ActionScoping::SpecificAreas,
            target_area_ids: vec!["a7".into()],
        };
        let resolved =
            resolve_action(&action, &template_ctx(), &associations(), None).unwrap();
        assert_eq!(resolved, ResolvedAction::DisarmAreas { area_ids: vec!["a7".into()] });
    }

    #[test]
    fn test_arm_mode_validated() {
        let action = ActionConfig::ArmArea {
            scoping: ActionScoping::SpecificAreas,
            target_area_ids: vec!["a1".into()],
            arm_mode: ArmedState::Disarmed,
        };
        assert!(resolve_action(&action, &template_ctx(), &associations(), None).is_err());
    }
}
