use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::model::{
    BestShot, Connector, DeviceType, EventDeviceInfo, EventPayload, StandardizedEvent,
};

use super::mapping;

const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x3c9a_41d7_b852_4f06_9e73_0a1d_64c8_e52b);

/// Envelope for frames on the VMS event stream. Keepalive frames carry
/// `type: "ping"` and no body.
#[derive(Debug, Deserialize)]
struct VmsFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    event: Option<VmsFrameEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmsFrameEvent {
    camera_id: String,
    event_type: String,
    timestamp_ms: i64,
    #[serde(default)]
    detection_type: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    object_track_id: Option<String>,
}

/// Parse one WebSocket text frame into canonical events. Pings are
/// silently ignored; anything else unrecognized warns and yields nothing.
pub fn parse(connector: &Connector, text: &str) -> Vec<StandardizedEvent> {
    let frame: VmsFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connector = %connector.id, error = %e, "Unparseable VMS frame");
            return Vec::new();
        }
    };

    if frame.frame_type == "ping" {
        return Vec::new();
    }
    let Some(event) = frame.event.filter(|_| frame.frame_type == "event") else {
        warn!(connector = %connector.id, frame_type = %frame.frame_type, "Unknown VMS frame shape");
        return Vec::new();
    };

    let Some(mapping) = mapping::map_event_type(&event.event_type) else {
        warn!(connector = %connector.id, event_type = %event.event_type, "Unknown VMS event type");
        return Vec::new();
    };

    let Some(timestamp) = chrono::DateTime::from_timestamp_millis(event.timestamp_ms) else {
        warn!(connector = %connector.id, time = event.timestamp_ms, "VMS frame timestamp out of range");
        return Vec::new();
    };

    let id_key = format!(
        "{}/{}/{}/{}",
        connector.id,
        event.camera_id,
        event.timestamp_ms,
        mapping.kind
    );
    let best_shot = event.object_track_id.as_ref().map(|track| BestShot {
        camera_external_id: event.camera_id.clone(),
        object_track_id: track.clone(),
    });

    vec![StandardizedEvent {
        event_id: Uuid::new_v5(&EVENT_ID_NAMESPACE, id_key.as_bytes()),
        organization_id: connector.organization_id.clone(),
        connector_id: connector.id.clone(),
        device_id: event.camera_id.clone(),
        category: mapping.category,
        kind: mapping.kind,
        subtype: event.detection_type.clone(),
        timestamp,
        payload: EventPayload {
            display_state: mapping.display_state,
            detection_type: event.detection_type,
            confidence: event.confidence,
            best_shot,
            original_event_type: Some(event.event_type),
            ..Default::default()
        },
        device_info: Some(EventDeviceInfo { device_type: DeviceType::Camera, subtype: None }),
    }]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{ConnectorCategory, DisplayState, EventKind};
    use indoc::indoc;

    fn vms_connector() -> Connector {
        Connector {
            id: "v1".into(),
            organization_id: "o1".into(),
            category: ConnectorCategory::VideoVms,
            name: "Site VMS".into(),
            cfg: serde_json::json!({}),
            events_enabled: true,
        }
    }

    #[test]
    fn test_parses_object_detection_with_best_shot() {
        let events = parse(
            &vms_connector(),
            indoc! {r#"
                {"type":"event","event":{
                    "cameraId":"cam-1",
                    "eventType":"analytics.objectDetected",
                    "timestampMs":1700000000000,
                    "detectionType":"person",
                    "confidence":0.92,
                    "objectTrackId":"trk-77"
                }}
            "#},
        );
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.device_id, "cam-1");
        assert_eq!(event.category, crate::model::EventCategory::Analytics);
        assert_eq!(event.kind, EventKind::ObjectDetected);
        assert_eq!(event.subtype.as_deref(), Some("person"));
        assert_eq!(event.payload.detection_type.as_deref(), Some("person"));
        assert_eq!(event.payload.confidence, Some(0.92));
        let best_shot = event.payload.best_shot.as_ref().unwrap();
        assert_eq!(best_shot.camera_external_id, "cam-1");
        assert_eq!(best_shot.object_track_id, "trk-77");
        assert_eq!(
            event.device_info.as_ref().unwrap().device_type,
            crate::model::DeviceType::Camera
        );
    }

    #[test]
    fn test_motion_maps_to_display_state() {
        let events = parse(
            &vms_connector(),
            r#"{"type":"event","event":{"cameraId":"cam-2","eventType":"motion.start","timestampMs":1700000000000}}"#,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::StateChanged);
        assert_eq!(events[0].payload.display_state, Some(DisplayState::MotionDetected));
        assert!(events[0].payload.best_shot.is_none());
    }

    #[test]
    fn test_ping_is_silent() {
        assert!(parse(&vms_connector(), r#"{"type":"ping"}"#).is_empty());
    }

    #[test]
    fn test_unknown_event_type_yields_nothing() {
        let events = parse(
            &vms_connector(),
            r#"{"type":"event","event":{"cameraId":"cam-1","eventType":"ptz.moved","timestampMs":1700000000000}}"#,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_garbage_yields_nothing() {
        assert!(parse(&vms_connector(), "not json").is_empty());
        assert!(parse(&vms_connector(), r#"{"type":"event"}"#).is_empty());
    }
}
