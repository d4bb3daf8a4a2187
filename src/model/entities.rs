use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::DisplayState;

/// A configured upstream integration instance. The `cfg` blob is a
/// discriminated union keyed by `category` (see `drivers::ConnectorConfig`).
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    pub id: String,
    pub organization_id: String,
    pub category: ConnectorCategory,
    pub name: String,
    pub cfg: serde_json::Value,
    pub events_enabled: bool,
}

#[derive(Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy)]
pub enum ConnectorCategory {
    #[serde(rename = "mqtt-hub")]
    MqttHub,
    #[serde(rename = "video-vms")]
    VideoVms,
}

impl ConnectorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorCategory::MqttHub => "mqtt-hub",
            ConnectorCategory::VideoVms => "video-vms",
        }
    }

    pub fn parse(raw: &str) -> Option<ConnectorCategory> {
        match raw {
            "mqtt-hub" => Some(ConnectorCategory::MqttHub),
            "video-vms" => Some(ConnectorCategory::VideoVms),
            _ => None,
        }
    }
}

/// A logical endpoint beneath a connector. `(connector_id, external_id)`
/// is unique; the device belongs to the connector's organization.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub connector_id: String,
    pub external_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percentage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Volatile last-known display state; refreshed by the pipeline, not
    /// authoritative in the store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_state: Option<DisplayState>,
}

/// Canonical device classification. Vendors map their raw model/type
/// strings onto this; anything unrecognized is preserved as `Unknown`.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceType {
    Camera,
    DoorSensor,
    MotionSensor,
    Switch,
    Outlet,
    Lock,
    LeakSensor,
    VibrationSensor,
    Button,
    Siren,
    Hub,
    Unknown(String),
}

impl DeviceType {
    pub fn as_str(&self) -> &str {
        match self {
            DeviceType::Camera => "Camera",
            DeviceType::DoorSensor => "DoorSensor",
            DeviceType::MotionSensor => "MotionSensor",
            DeviceType::Switch => "Switch",
            DeviceType::Outlet => "Outlet",
            DeviceType::Lock => "Lock",
            DeviceType::LeakSensor => "LeakSensor",
            DeviceType::VibrationSensor => "VibrationSensor",
            DeviceType::Button => "Button",
            DeviceType::Siren => "Siren",
            DeviceType::Hub => "Hub",
            DeviceType::Unknown(s) => s.as_str(),
        }
    }
}

impl From<String> for DeviceType {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "Camera" => DeviceType::Camera,
            "DoorSensor" => DeviceType::DoorSensor,
            "MotionSensor" => DeviceType::MotionSensor,
            "Switch" => DeviceType::Switch,
            "Outlet" => DeviceType::Outlet,
            "Lock" => DeviceType::Lock,
            "LeakSensor" => DeviceType::LeakSensor,
            "VibrationSensor" => DeviceType::VibrationSensor,
            "Button" => DeviceType::Button,
            "Siren" => DeviceType::Siren,
            "Hub" => DeviceType::Hub,
            _ => DeviceType::Unknown(raw),
        }
    }
}

impl From<DeviceType> for String {
    fn from(t: DeviceType) -> String {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical site. Owns the time zone its areas' schedules are evaluated
/// in, and optionally a default arming schedule.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// IANA zone name, e.g. `America/New_York`.
    pub time_zone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_arming_schedule_id: Option<String>,
}

/// An alarm zone with an armed-state lifecycle. An area without a location
/// is "unassigned" and ignores location-default schedules.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Area {
    pub id: String,
    pub organization_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    pub name: String,
    pub armed_state: ArmedState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_arming_schedule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_armed_state_change_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_scheduled_arm_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_scheduled_disarm_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_arming_skipped_until: Option<DateTime<Utc>>,
}

#[derive(
    Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ArmedState {
    Disarmed,
    ArmedAway,
    ArmedStay,
    Triggered,
}

impl ArmedState {
    pub fn is_armed(&self) -> bool {
        matches!(
            self,
            ArmedState::ArmedAway | ArmedState::ArmedStay | ArmedState::Triggered
        )
    }
}

/// Local-time arm/disarm window. Times are `HH:MM`, interpreted in the
/// owning location's zone on each listed weekday.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ArmingSchedule {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub arm_time_local: String,
    pub disarm_time_local: String,
    pub days_of_week: Vec<DayOfWeek>,
}

#[derive(
    Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy, strum::Display, strum::EnumString,
)]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub fn to_chrono(self) -> Weekday {
        match self {
            DayOfWeek::Mon => Weekday::Mon,
            DayOfWeek::Tue => Weekday::Tue,
            DayOfWeek::Wed => Weekday::Wed,
            DayOfWeek::Thu => Weekday::Thu,
            DayOfWeek::Fri => Weekday::Fri,
            DayOfWeek::Sat => Weekday::Sat,
            DayOfWeek::Sun => Weekday::Sun,
        }
    }
}

/// Association between a non-camera device and the video cameras that give
/// its events visual context.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CameraAssociation {
    pub device_id: String,
    pub camera_connector_id: String,
    pub camera_external_id: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_connector_category_spelling() {
        assert_eq!(
            serde_json::to_string(&ConnectorCategory::MqttHub).unwrap(),
            "\"mqtt-hub\""
        );
        assert_eq!(ConnectorCategory::parse("video-vms"), Some(ConnectorCategory::VideoVms));
        assert_eq!(ConnectorCategory::parse("bogus"), None);
    }

    #[test]
    fn test_device_type_preserves_unknown() {
        let t: DeviceType = "SmokeDetector".to_string().into();
        assert_eq!(t, DeviceType::Unknown("SmokeDetector".into()));
        let s: String = t.into();
        assert_eq!(s, "SmokeDetector");
        let known: DeviceType = "DoorSensor".to_string().into();
        assert_eq!(known, DeviceType::DoorSensor);
    }

    #[test]
    fn test_armed_state_spelling() {
        assert_eq!(ArmedState::ArmedAway.to_string(), "ARMED_AWAY");
        assert_eq!("TRIGGERED".parse(), Ok(ArmedState::Triggered));
        assert!(ArmedState::Triggered.is_armed());
        assert!(!ArmedState::Disarmed.is_armed());
    }
}
