use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::model::{
    Connector, EventCategory, EventDeviceInfo, EventKind, EventPayload, PressType,
    StandardizedEvent,
};

use super::mapping;

/// Namespace for deriving stable event ids from frame content, so broker
/// replays after a reconnect map onto the same `event_id`.
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x8e4f_2a61_7d3b_4c95_a1e0_5b6c_9d27_f310);

#[derive(Debug, Deserialize)]
struct HubFrame {
    event: String,
    time: i64,
    #[serde(default)]
    msgid: Option<String>,
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(default)]
    data: HubFrameData,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct HubFrameData {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    battery: Option<u64>,
    #[serde(default)]
    button: Option<u8>,
    #[serde(default)]
    press_type: Option<String>,
}

/// Parse one report frame into canonical events. Deterministic and free
/// of I/O; malformed or unknown frames yield zero events and a warning.
pub fn parse(connector: &Connector, topic: &str, payload: &[u8]) -> Vec<StandardizedEvent> {
    let frame: HubFrame = match serde_json::from_slice(payload) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connector = %connector.id, %topic, error = %e, "Unparseable hub frame");
            return Vec::new();
        }
    };

    let Some(timestamp) = chrono::DateTime::from_timestamp_millis(frame.time) else {
        warn!(connector = %connector.id, time = frame.time, "Hub frame timestamp out of range");
        return Vec::new();
    };

    // "contact.report" -> class "contact", verb "report"
    let (class, verb) = frame.event.split_once('.').unwrap_or((frame.event.as_str(), ""));
    if verb == "access" {
        return parse_access(connector, &frame, class, timestamp);
    }
    if verb != "report" {
        warn!(
            connector = %connector.id,
            event = %frame.event,
            msgid = frame.msgid.as_deref().unwrap_or(""),
            "Unknown hub frame verb"
        );
        return Vec::new();
    }
    let Some(mapping) = mapping::map_report_class(class) else {
        warn!(
            connector = %connector.id,
            event = %frame.event,
            msgid = frame.msgid.as_deref().unwrap_or(""),
            "Unknown hub report class"
        );
        return Vec::new();
    };

    let device_info = EventDeviceInfo { device_type: mapping.device_type.clone(), subtype: None };
    let mut events = Vec::with_capacity(2);

    let primary_payload = EventPayload {
        display_state: frame
            .data
            .state
            .as_deref()
            .and_then(|raw| mapping::map_display_state(class, raw)),
        raw_state_value: frame.data.state.clone(),
        button_number: frame.data.button,
        press_type: frame.data.press_type.as_deref().and_then(parse_press_type),
        original_event_type: Some(frame.event.clone()),
        ..Default::default()
    };
    events.push(standardized(
        connector,
        &frame.device_id,
        mapping.category,
        mapping.kind,
        timestamp,
        primary_payload,
        Some(device_info.clone()),
    ));

    if let Some(raw_battery) = frame.data.battery {
        let battery_payload = EventPayload {
            battery_percentage: Some(mapping::battery_to_percent(raw_battery)),
            original_event_type: Some(frame.event.clone()),
            ..Default::default()
        };
        events.push(standardized(
            connector,
            &frame.device_id,
            EventCategory::Battery,
            EventKind::BatteryLevelChanged,
            timestamp,
            battery_payload,
            Some(device_info),
        ));
    }

    events
}

/// Lock access reports (`lock.access`) carry a grant/deny result in
/// `data.state` and the requesting credential in `data.user`.
fn parse_access(
    connector: &Connector,
    frame: &HubFrame,
    class: &str,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> Vec<StandardizedEvent> {
    if class != "lock" {
        warn!(connector = %connector.id, event = %frame.event, "Access frame from non-lock class");
        return Vec::new();
    }
    let kind = match frame.data.state.as_deref() {
        Some("granted") => EventKind::AccessGranted,
        Some("denied") => EventKind::AccessDenied,
        other => {
            warn!(connector = %connector.id, state = other.unwrap_or(""), "Unknown access result");
            return Vec::new();
        }
    };
    let payload = EventPayload {
        raw_state_value: frame.data.state.clone(),
        original_event_type: Some(frame.event.clone()),
        ..Default::default()
    };
    vec![standardized(
        connector,
        &frame.device_id,
        EventCategory::Access,
        kind,
        timestamp,
        payload,
        Some(EventDeviceInfo {
            device_type: crate::model::DeviceType::Lock,
            subtype: None,
        }),
    )]
}

fn parse_press_type(raw: &str) -> Option<PressType> {
    match raw {
        "Press" => Some(PressType::Press),
        "LongPress" => Some(PressType::LongPress),
        _ => None,
    }
}

fn standardized(
    connector: &Connector,
    device_id: &str,
    category: EventCategory,
    kind: EventKind,
    timestamp: chrono::DateTime<chrono::Utc>,
    payload: EventPayload,
    device_info: Option<EventDeviceInfo>,
) -> StandardizedEvent {
    let id_key = format!(
        "{}/{}/{}/{}",
        connector.id,
        device_id,
        timestamp.timestamp_millis(),
        kind
    );
    StandardizedEvent {
        event_id: Uuid::new_v5(&EVENT_ID_NAMESPACE, id_key.as_bytes()),
        organization_id: connector.organization_id.clone(),
        connector_id: connector.id.clone(),
        device_id: device_id.to_string(),
        category,
        kind,
        subtype: None,
        timestamp,
        payload,
        device_info,
    }
}
