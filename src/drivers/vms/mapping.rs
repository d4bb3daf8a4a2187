use crate::model::{DisplayState, EventCategory, EventKind};

pub struct VmsEventMapping {
    pub category: EventCategory,
    pub kind: EventKind,
    pub display_state: Option<DisplayState>,
}

/// VMS event-type string → canonical classification. The stream uses
/// dotted type names; unlisted types produce no events.
pub fn map_event_type(raw: &str) -> Option<VmsEventMapping> {
    let (category, kind, display_state) = match raw {
        "analytics.objectDetected" => (EventCategory::Analytics, EventKind::ObjectDetected, None),
        "analytics.lineCrossed" => (EventCategory::Analytics, EventKind::LineCrossed, None),
        "analytics.loitering" => (EventCategory::Analytics, EventKind::LoiteringDetected, None),
        "motion.start" => (
            EventCategory::StateChange,
            EventKind::StateChanged,
            Some(DisplayState::MotionDetected),
        ),
        "motion.stop" => (
            EventCategory::StateChange,
            EventKind::StateChanged,
            Some(DisplayState::NoMotion),
        ),
        "status.online" => (EventCategory::Status, EventKind::DeviceOnline, Some(DisplayState::Online)),
        "status.offline" => {
            (EventCategory::Status, EventKind::DeviceOffline, Some(DisplayState::Offline))
        }
        _ => return None,
    };
    Some(VmsEventMapping { category, kind, display_state })
}
