use serde_json::{Map, Value};

use crate::model::{
    Area, ArmingSchedule, Connector, Device, Location, StandardizedEvent,
};

/// Root objects templates may reference with `{{ root.path }}`. Absent
/// roots resolve every path under them to the empty string.
#[derive(Debug, Default, Clone)]
pub struct TemplateContext {
    roots: Map<String, Value>,
}

impl TemplateContext {
    pub fn new(
        event: Option<&StandardizedEvent>,
        device: Option<&Device>,
        area: Option<&Area>,
        location: Option<&Location>,
        connector: Option<&Connector>,
        schedule: Option<&ArmingSchedule>,
    ) -> Self {
        let mut roots = Map::new();
        if let Some(event) = event {
            roots.insert("event".into(), event_value(event));
        }
        if let Some(device) = device {
            roots.insert("device".into(), to_value(device));
        }
        if let Some(area) = area {
            roots.insert("area".into(), to_value(area));
        }
        if let Some(location) = location {
            roots.insert("location".into(), to_value(location));
        }
        if let Some(connector) = connector {
            let mut value = to_value(connector);
            // The raw cfg blob contains credentials; templates never see it.
            if let Some(map) = value.as_object_mut() {
                map.remove("cfg");
            }
            roots.insert("connector".into(), value);
        }
        if let Some(schedule) = schedule {
            roots.insert("schedule".into(), to_value(schedule));
        }
        Self { roots }
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut current: Option<&Value> = None;
        for (index, segment) in path.split('.').enumerate() {
            current = match index {
                0 => self.roots.get(segment),
                _ => current?.get(segment),
            };
        }
        current
    }
}

fn to_value<T: serde::Serialize>(entity: &T) -> Value {
    serde_json::to_value(entity).unwrap_or(Value::Null)
}

/// Event view exposed to templates: payload fields are lifted to the
/// event root, and enum fields exist both as display names and raw ids.
fn event_value(event: &StandardizedEvent) -> Value {
    let mut map = Map::new();
    map.insert("id".into(), event.event_id.to_string().into());
    map.insert("deviceId".into(), event.device_id.clone().into());
    map.insert("connectorId".into(), event.connector_id.clone().into());
    map.insert("timestamp".into(), event.timestamp.to_rfc3339().into());
    map.insert("timestampMs".into(), event.timestamp.timestamp_millis().into());

    map.insert("category".into(), event.category.friendly_name().into());
    map.insert("categoryId".into(), event.category.to_string().into());
    map.insert("type".into(), event.kind.friendly_name().into());
    map.insert("typeId".into(), event.kind.to_string().into());
    if let Some(subtype) = &event.subtype {
        map.insert("subtype".into(), subtype.clone().into());
        map.insert("subtypeId".into(), subtype.clone().into());
    }

    if let Value::Object(payload) = to_value(&event.payload) {
        for (key, value) in payload {
            map.entry(key).or_insert(value);
        }
    }
    Value::Object(map)
}

/// Resolve `{{ path }}` tokens. Missing paths become the empty string;
/// arrays and objects serialize as JSON. Pure in the template and context.
pub fn resolve(template: &str, ctx: &TemplateContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                out.push_str(&render(ctx.lookup(path)));
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated token; emit literally.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn render(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(composite) => composite.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{
        ArmedState, ConnectorCategory, DeviceType, DisplayState, EventCategory, EventKind,
        EventPayload,
    };
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn ctx() -> TemplateContext {
        let event = StandardizedEvent {
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
                raw_state_value: Some("open".into()),
                ..Default::default()
            },
            device_info: None,
        };
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
        let area = Area {
            id: "a1".into(),
            organization_id: "o1".into(),
            location_id: Some("l1".into()),
            name: "Lobby".into(),
            armed_state: ArmedState::ArmedAway,
            override_arming_schedule_id: None,
            last_armed_state_change_reason: None,
            next_scheduled_arm_time: None,
            next_scheduled_disarm_time: None,
            is_arming_skipped_until: None,
        };
        let connector = Connector {
            id: "c1".into(),
            organization_id: "o1".into(),
            category: ConnectorCategory::MqttHub,
            name: "Hub".into(),
            cfg: serde_json::json!({ "credentials": { "accessToken": "secret" } }),
            events_enabled: true,
        };
        TemplateContext::new(Some(&event), Some(&device), Some(&area), None, Some(&connector), None)
    }

    #[test]
    fn test_resolves_paths() {
        let ctx = ctx();
        assert_eq!(resolve("{{device.name}} opened", &ctx), "Front Door opened");
        assert_eq!(resolve("{{ area.name }} / {{ area.armedState }}", &ctx), "Lobby / ARMED_AWAY");
        assert_eq!(resolve("state={{event.displayState}}", &ctx), "state=OPEN");
    }

    #[test]
    fn test_display_names_and_ids() {
        let ctx = ctx();
        assert_eq!(resolve("{{event.category}}", &ctx), "State Change");
        assert_eq!(resolve("{{event.categoryId}}", &ctx), "STATE_CHANGE");
        assert_eq!(resolve("{{event.type}}", &ctx), "State Changed");
        assert_eq!(resolve("{{event.typeId}}", &ctx), "STATE_CHANGED");
    }

    #[test]
    fn test_missing_paths_are_empty() {
        let ctx = ctx();
        assert_eq!(resolve("[{{event.subtype}}]", &ctx), "[]");
        assert_eq!(resolve("[{{location.name}}]", &ctx), "[]");
        assert_eq!(resolve("[{{schedule.name}}]", &ctx), "[]");
        assert_eq!(resolve("[{{device.nope.deeper}}]", &ctx), "[]");
    }

    #[test]
    fn test_credentials_not_reachable() {
        let ctx = ctx();
        assert_eq!(resolve("{{connector.cfg}}", &ctx), "");
        assert_eq!(resolve("{{connector.cfg.credentials.accessToken}}", &ctx), "");
    }

    #[test]
    fn test_literal_text_and_unterminated_tokens() {
        let ctx = ctx();
        assert_eq!(resolve("no tokens here", &ctx), "no tokens here");
        assert_eq!(resolve("dangling {{device.name", &ctx), "dangling {{device.name");
        assert_eq!(resolve("{{}}", &ctx), "");
    }

    #[test]
    fn test_resolution_is_pure() {
        let ctx = ctx();
        let first = resolve("{{device.name}}/{{event.typeId}}", &ctx);
        let second = resolve("{{device.name}}/{{event.typeId}}", &ctx);
        assert_eq!(first, second);
    }
}
