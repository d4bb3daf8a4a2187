use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical, vendor-neutral event record. Every parser output and every
/// persisted event row carries this shape.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StandardizedEvent {
    pub event_id: Uuid,
    pub organization_id: String,
    pub connector_id: String,
    /// The vendor's identifier for the originating device.
    pub device_id: String,
    pub category: EventCategory,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<EventDeviceInfo>,
}

impl StandardizedEvent {
    /// Key used for duplicate suppression inside the pipeline's dedup
    /// window, alongside `event_id` itself.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.connector_id,
            self.device_id,
            self.timestamp.timestamp_millis(),
            self.kind
        )
    }
}

/// Structured payload. All fields are optional; absent fields are omitted
/// from rule facts and resolve to the empty string in templates.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_state: Option<DisplayState>,
    /// The vendor's raw state string, preserved even when it maps to no
    /// canonical display state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_state_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button_number: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub press_type: Option<PressType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percentage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_shot: Option<BestShot>,
    /// The vendor's own event-type string before normalization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_event_type: Option<String>,
}

/// A vendor-supplied thumbnail reference for a detected object.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BestShot {
    pub camera_external_id: String,
    pub object_track_id: String,
}

/// Device type/subtype snapshot taken at parse time, before the device row
/// is resolved.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EventDeviceInfo {
    #[serde(rename = "type")]
    pub device_type: crate::model::DeviceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}

#[derive(
    Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    StateChange,
    Access,
    Analytics,
    Diagnostic,
    Button,
    Battery,
    Status,
}

impl EventCategory {
    /// Human display name used by templates and UI-facing fields.
    pub fn friendly_name(&self) -> &'static str {
        match self {
            EventCategory::StateChange => "State Change",
            EventCategory::Access => "Access",
            EventCategory::Analytics => "Analytics",
            EventCategory::Diagnostic => "Diagnostic",
            EventCategory::Button => "Button",
            EventCategory::Battery => "Battery",
            EventCategory::Status => "Status",
        }
    }
}

#[derive(
    Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    StateChanged,
    AccessGranted,
    AccessDenied,
    ObjectDetected,
    LineCrossed,
    LoiteringDetected,
    ButtonPressed,
    BatteryLevelChanged,
    DeviceOnline,
    DeviceOffline,
    DiagnosticReport,
    ArmedStateChanged,
}

impl EventKind {
    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::StateChanged => EventCategory::StateChange,
            EventKind::AccessGranted | EventKind::AccessDenied => EventCategory::Access,
            EventKind::ObjectDetected | EventKind::LineCrossed | EventKind::LoiteringDetected => {
                EventCategory::Analytics
            }
            EventKind::ButtonPressed => EventCategory::Button,
            EventKind::BatteryLevelChanged => EventCategory::Battery,
            EventKind::DeviceOnline | EventKind::DeviceOffline => EventCategory::Status,
            EventKind::DiagnosticReport => EventCategory::Diagnostic,
            EventKind::ArmedStateChanged => EventCategory::StateChange,
        }
    }

    pub fn friendly_name(&self) -> &'static str {
        match self {
            EventKind::StateChanged => "State Changed",
            EventKind::AccessGranted => "Access Granted",
            EventKind::AccessDenied => "Access Denied",
            EventKind::ObjectDetected => "Object Detected",
            EventKind::LineCrossed => "Line Crossed",
            EventKind::LoiteringDetected => "Loitering Detected",
            EventKind::ButtonPressed => "Button Pressed",
            EventKind::BatteryLevelChanged => "Battery Level Changed",
            EventKind::DeviceOnline => "Device Online",
            EventKind::DeviceOffline => "Device Offline",
            EventKind::DiagnosticReport => "Diagnostic Report",
            EventKind::ArmedStateChanged => "Armed State Changed",
        }
    }
}

/// Closed vocabulary for normalized device states. Parsers never emit
/// strings outside this set; unmapped raw values are preserved only in
/// `payload.raw_state_value`.
#[derive(
    Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DisplayState {
    On,
    Off,
    Open,
    Closed,
    Locked,
    Unlocked,
    MotionDetected,
    NoMotion,
    LeakDetected,
    Dry,
    VibrationDetected,
    NoVibration,
    Triggered,
    Online,
    Offline,
}

#[derive(
    Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy, strum::Display, strum::EnumString,
)]
pub enum PressType {
    Press,
    LongPress,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_enum_wire_spellings() {
        assert_eq!(
            serde_json::to_string(&EventCategory::StateChange).unwrap(),
            "\"STATE_CHANGE\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::BatteryLevelChanged).unwrap(),
            "\"BATTERY_LEVEL_CHANGED\""
        );
        assert_eq!(
            serde_json::to_string(&DisplayState::MotionDetected).unwrap(),
            "\"MOTION_DETECTED\""
        );
        assert_eq!(DisplayState::Open.to_string(), "OPEN");
        assert_eq!("LEAK_DETECTED".parse(), Ok(DisplayState::LeakDetected));
    }

    #[test]
    fn test_kind_categories() {
        assert_eq!(EventKind::StateChanged.category(), EventCategory::StateChange);
        assert_eq!(EventKind::ObjectDetected.category(), EventCategory::Analytics);
        assert_eq!(EventKind::ButtonPressed.category(), EventCategory::Button);
        assert_eq!(EventKind::DeviceOffline.category(), EventCategory::Status);
    }

    #[test]
    fn test_event_round_trips_camel_case() {
        let event = StandardizedEvent {
            event_id: Uuid::nil(),
            organization_id: "org-1".into(),
            connector_id: "conn-1".into(),
            device_id: "abc".into(),
            category: EventCategory::StateChange,
            kind: EventKind::StateChanged,
            subtype: None,
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            payload: EventPayload {
                display_state: Some(DisplayState::Open),
                raw_state_value: Some("open".into()),
                original_event_type: Some("contact.report".into()),
                ..Default::default()
            },
            device_info: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["deviceId"], "abc");
        assert_eq!(json["type"], "STATE_CHANGED");
        assert_eq!(json["payload"]["displayState"], "OPEN");
        let back: StandardizedEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
