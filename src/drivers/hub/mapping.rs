use crate::model::{DeviceType, DisplayState, EventCategory, EventKind};

/// Canonical classification derived from a hub report class (the part of
/// the `event` field before the dot).
pub struct HubClassMapping {
    pub device_type: DeviceType,
    pub category: EventCategory,
    pub kind: EventKind,
}

/// The hub names report classes after the sensor family. Unlisted classes
/// produce no events.
pub fn map_report_class(class: &str) -> Option<HubClassMapping> {
    let (device_type, category, kind) = match class {
        "contact" => (DeviceType::DoorSensor, EventCategory::StateChange, EventKind::StateChanged),
        "motion" => (DeviceType::MotionSensor, EventCategory::StateChange, EventKind::StateChanged),
        "leak" => (DeviceType::LeakSensor, EventCategory::StateChange, EventKind::StateChanged),
        "vibration" => {
            (DeviceType::VibrationSensor, EventCategory::StateChange, EventKind::StateChanged)
        }
        "switch" => (DeviceType::Switch, EventCategory::StateChange, EventKind::StateChanged),
        "outlet" => (DeviceType::Outlet, EventCategory::StateChange, EventKind::StateChanged),
        "lock" => (DeviceType::Lock, EventCategory::StateChange, EventKind::StateChanged),
        "button" | "fob" => (DeviceType::Button, EventCategory::Button, EventKind::ButtonPressed),
        "hub" => (DeviceType::Hub, EventCategory::Diagnostic, EventKind::DiagnosticReport),
        _ => return None,
    };
    Some(HubClassMapping { device_type, category, kind })
}

/// Raw state string → canonical display state, per report class. The hub
/// is inconsistent about alert wording across sensor families, so the
/// class picks the vocabulary. Unmapped values yield `None` and the raw
/// string survives only in `payload.raw_state_value`.
pub fn map_display_state(class: &str, raw: &str) -> Option<DisplayState> {
    match (class, raw.to_ascii_lowercase().as_str()) {
        ("contact", "open") => Some(DisplayState::Open),
        ("contact", "closed") => Some(DisplayState::Closed),
        ("motion", "alert" | "motion") => Some(DisplayState::MotionDetected),
        ("motion", "normal" | "clear") => Some(DisplayState::NoMotion),
        ("leak", "alert" | "full") => Some(DisplayState::LeakDetected),
        ("leak", "normal" | "dry") => Some(DisplayState::Dry),
        ("vibration", "alert") => Some(DisplayState::VibrationDetected),
        ("vibration", "normal") => Some(DisplayState::NoVibration),
        ("switch" | "outlet", "open" | "on") => Some(DisplayState::On),
        ("switch" | "outlet", "closed" | "off") => Some(DisplayState::Off),
        ("lock", "locked") => Some(DisplayState::Locked),
        ("lock", "unlocked") => Some(DisplayState::Unlocked),
        _ => None,
    }
}

/// The hub reports battery in quarter steps (0..=4); anything larger is
/// assumed to already be a percentage.
pub fn battery_to_percent(raw: u64) -> u8 {
    if raw <= 4 {
        (raw * 25) as u8
    } else {
        raw.min(100) as u8
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_maps_known_classes() {
        let mapping = map_report_class("contact").unwrap();
        assert_eq!(mapping.device_type, DeviceType::DoorSensor);
        assert_eq!(mapping.kind, EventKind::StateChanged);
        assert_eq!(map_report_class("button").unwrap().category, EventCategory::Button);
        assert!(map_report_class("thermostat").is_none());
    }

    #[test]
    fn test_display_state_is_class_scoped() {
        assert_eq!(map_display_state("contact", "open"), Some(DisplayState::Open));
        // "open" means powered for relay-style devices
        assert_eq!(map_display_state("switch", "open"), Some(DisplayState::On));
        assert_eq!(map_display_state("motion", "ALERT"), Some(DisplayState::MotionDetected));
        assert_eq!(map_display_state("contact", "ajar"), None);
    }

    #[test]
    fn test_battery_scale() {
        assert_eq!(battery_to_percent(0), 0);
        assert_eq!(battery_to_percent(2), 50);
        assert_eq!(battery_to_percent(4), 100);
        assert_eq!(battery_to_percent(87), 87);
        assert_eq!(battery_to_percent(250), 100);
    }
}
