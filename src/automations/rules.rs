use serde_json::{Map, Value};

use crate::model::{Device, RuleNode, RuleOperator, StandardizedEvent};

quick_error! {
    #[derive(Debug)]
    pub enum RuleError {
        ValueShape(operator: &'static str, expected: &'static str) {
            display("Operator {} expects {}", operator, expected)
        }
    }
}

/// Flat facts object built from a triggering event. Keys are dotted
/// (`event.type`, `device.id`, …); absent values are omitted entirely so
/// they never compare equal to anything.
#[derive(Debug, Clone, PartialEq)]
pub struct Facts(Map<String, Value>);

impl Facts {
    pub fn get(&self, fact: &str) -> Option<&Value> {
        self.0.get(fact)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

pub fn build_facts(event: &StandardizedEvent, device: Option<&Device>) -> Facts {
    let mut facts = Map::new();
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            facts.insert(key.to_string(), value);
        }
    };

    put("event.category", Some(event.category.to_string().into()));
    put("event.type", Some(event.kind.to_string().into()));
    put("event.subtype", event.subtype.clone().map(Value::from));
    put(
        "event.displayState",
        event.payload.display_state.map(|s| s.to_string().into()),
    );
    put(
        "event.originalEventType",
        event.payload.original_event_type.clone().map(Value::from),
    );
    put(
        "event.buttonNumber",
        event.payload.button_number.map(|n| Value::from(n as u64)),
    );
    put(
        "event.buttonPressType",
        event.payload.press_type.map(|p| p.to_string().into()),
    );

    if let Some(device) = device {
        put("device.id", Some(device.id.clone().into()));
        put("device.externalId", Some(device.external_id.clone().into()));
        put("device.type", Some(device.device_type.as_str().into()));
        put("device.subtype", device.subtype.clone().map(Value::from));
    } else {
        // The event's own snapshot stands in for an unregistered device.
        if let Some(info) = &event.device_info {
            put("device.externalId", Some(event.device_id.clone().into()));
            put("device.type", Some(info.device_type.as_str().into()));
            put("device.subtype", info.subtype.clone().map(Value::from));
        }
    }

    put("connector.id", Some(event.connector_id.clone().into()));
    Facts(facts)
}

/// Evaluate a rule tree: `all` is conjunction, `any` is disjunction, a
/// leaf compares one fact. Missing facts fail their leaf without error.
pub fn evaluate(node: &RuleNode, facts: &Facts) -> Result<bool, RuleError> {
    match node {
        RuleNode::All { all } => {
            for child in all {
                if !evaluate(child, facts)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        RuleNode::Any { any } => {
            for child in any {
                if evaluate(child, facts)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        RuleNode::Condition { fact, operator, value } => {
            let Some(actual) = facts.get(fact) else {
                return Ok(false);
            };
            compare(*operator, actual, value)
        }
    }
}

fn compare(operator: RuleOperator, actual: &Value, expected: &Value) -> Result<bool, RuleError> {
    match operator {
        RuleOperator::Eq => Ok(loose_eq(actual, expected)),
        RuleOperator::Neq => Ok(!loose_eq(actual, expected)),
        RuleOperator::In => {
            let list = expected
                .as_array()
                .ok_or(RuleError::ValueShape("in", "an array"))?;
            Ok(list.iter().any(|candidate| loose_eq(actual, candidate)))
        }
        RuleOperator::NotIn => {
            let list = expected
                .as_array()
                .ok_or(RuleError::ValueShape("notIn", "an array"))?;
            Ok(!list.iter().any(|candidate| loose_eq(actual, candidate)))
        }
        RuleOperator::Lt | RuleOperator::Lte | RuleOperator::Gt | RuleOperator::Gte => {
            let (Some(left), Some(right)) = (as_number(actual), as_number(expected)) else {
                return Ok(false);
            };
            Ok(match operator {
                RuleOperator::Lt => left < right,
                RuleOperator::Lte => left <= right,
                RuleOperator::Gt => left > right,
                RuleOperator::Gte => left >= right,
                _ => false,
            })
        }
        RuleOperator::StartsWith => {
            let expected = expected
                .as_str()
                .ok_or(RuleError::ValueShape("startsWith", "a string"))?;
            Ok(actual.as_str().map(|s| s.starts_with(expected)).unwrap_or(false))
        }
        RuleOperator::Contains => {
            let expected = expected
                .as_str()
                .ok_or(RuleError::ValueShape("contains", "a string"))?;
            Ok(actual.as_str().map(|s| s.contains(expected)).unwrap_or(false))
        }
    }
}

/// Equality that tolerates number-vs-string spellings coming from config
/// editors (`"3"` vs `3`).
fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (as_number(actual), as_number(expected)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{
        DeviceType, DisplayState, EventCategory, EventKind, EventPayload, PressType,
    };
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_event() -> StandardizedEvent {
        StandardizedEvent {
            event_id: Uuid::nil(),
            organization_id: "o1".into(),
            connector_id: "c1".into(),
            device_id: "abc".into(),
            category: EventCategory::StateChange,
            kind: EventKind::StateChanged,
            subtype: None,
            timestamp: Utc::now(),
            payload: EventPayload {
                display_state: Some(DisplayState::Open),
                button_number: Some(3),
                press_type: Some(PressType::LongPress),
                original_event_type: Some("contact.report".into()),
                ..Default::default()
            },
            device_info: None,
        }
    }

    fn sample_device() -> Device {
        Device {
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
        }
    }

    fn facts() -> Facts {
        build_facts(&sample_event(), Some(&sample_device()))
    }

    fn leaf(fact: &str, operator: RuleOperator, value: Value) -> RuleNode {
        RuleNode::Condition { fact: fact.into(), operator, value }
    }

    #[test]
    fn test_facts_omit_absent_fields() {
        let facts = facts();
        assert_eq!(facts.get("event.type"), Some(&Value::from("STATE_CHANGED")));
        assert_eq!(facts.get("event.displayState"), Some(&Value::from("OPEN")));
        assert_eq!(facts.get("event.subtype"), None);
        assert_eq!(facts.get("device.type"), Some(&Value::from("DoorSensor")));
    }

    #[test]
    fn test_all_any_combination() {
        let tree = RuleNode::All {
            all: vec![
                leaf("event.type", RuleOperator::Eq, "STATE_CHANGED".into()),
                RuleNode::Any {
                    any: vec![
                        leaf("device.type", RuleOperator::Eq, "Lock".into()),
                        leaf("device.type", RuleOperator::Eq, "DoorSensor".into()),
                    ],
                },
            ],
        };
        assert!(evaluate(&tree, &facts()).unwrap());
    }

    #[test]
    fn test_missing_fact_is_false_not_error() {
        let tree = leaf("event.subtype", RuleOperator::Eq, "anything".into());
        assert!(!evaluate(&tree, &facts()).unwrap());
        // ...including for negated comparisons
        let tree = leaf("event.subtype", RuleOperator::Neq, "anything".into());
        assert!(!evaluate(&tree, &facts()).unwrap());
    }

    #[test]
    fn test_membership_and_numbers() {
        let tree = leaf(
            "event.buttonNumber",
            RuleOperator::In,
            serde_json::json!([1, 2, 3]),
        );
        assert!(evaluate(&tree, &facts()).unwrap());

        let tree = leaf("event.buttonNumber", RuleOperator::Gte, serde_json::json!(4));
        assert!(!evaluate(&tree, &facts()).unwrap());

        // Config editors often quote numbers
        let tree = leaf("event.buttonNumber", RuleOperator::Eq, "3".into());
        assert!(evaluate(&tree, &facts()).unwrap());
    }

    #[test]
    fn test_string_operators() {
        let tree = leaf("event.originalEventType", RuleOperator::StartsWith, "contact.".into());
        assert!(evaluate(&tree, &facts()).unwrap());
        let tree = leaf("device.externalId", RuleOperator::Contains, "b".into());
        assert!(evaluate(&tree, &facts()).unwrap());
    }

    #[test]
    fn test_malformed_tree_is_error() {
        let tree = leaf("event.type", RuleOperator::In, "not-an-array".into());
        assert!(evaluate(&tree, &facts()).is_err());
    }

    #[test]
    fn test_empty_groups() {
        assert!(evaluate(&RuleNode::All { all: vec![] }, &facts()).unwrap());
        assert!(!evaluate(&RuleNode::Any { any: vec![] }, &facts()).unwrap());
    }
}
