use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ArmedState, DayOfWeek};

/// A declarative rule owned by an organization: one trigger, an ordered
/// list of actions.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Automation {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_scope_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub config: AutomationConfig,
    /// Gates scheduled triggers to at most one firing per matching window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfig {
    pub trigger: TriggerConfig,
    pub actions: Vec<ActionConfig>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(tag = "kind")]
pub enum TriggerConfig {
    #[serde(rename = "EVENT")]
    Event { conditions: RuleNode },
    #[serde(rename = "SCHEDULED", rename_all = "camelCase")]
    Scheduled {
        /// `HH:MM` local time in `time_zone`.
        time_local: String,
        days_of_week: Vec<DayOfWeek>,
        /// IANA zone the window is evaluated in.
        time_zone: String,
    },
}

/// Boolean expression tree evaluated against the facts built from a
/// triggering event. `all` is conjunction, `any` is disjunction.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum RuleNode {
    All { all: Vec<RuleNode> },
    Any { any: Vec<RuleNode> },
    Condition {
        fact: String,
        operator: RuleOperator,
        value: serde_json::Value,
    },
}

#[derive(Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub enum RuleOperator {
    Eq,
    Neq,
    In,
    NotIn,
    Lt,
    Lte,
    Gt,
    Gte,
    StartsWith,
    Contains,
}

/// One typed action record. Fields ending in `_template` support
/// `{{ path }}` token substitution before execution.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(tag = "type", content = "params")]
pub enum ActionConfig {
    #[serde(rename = "createEvent", rename_all = "camelCase")]
    CreateEvent {
        target_connector_id: String,
        source_template: String,
        caption_template: String,
        description_template: String,
    },
    #[serde(rename = "createBookmark", rename_all = "camelCase")]
    CreateBookmark {
        target_connector_id: String,
        name_template: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description_template: Option<String>,
        duration_ms_template: String,
        /// Comma-separated tag list after substitution.
        #[serde(skip_serializing_if = "Option::is_none")]
        tags_template: Option<String>,
    },
    #[serde(rename = "sendHttpRequest", rename_all = "camelCase")]
    SendHttpRequest {
        url_template: String,
        method: HttpMethod,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        headers: Vec<HeaderTemplate>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body_template: Option<String>,
    },
    #[serde(rename = "setDeviceState", rename_all = "camelCase")]
    SetDeviceState {
        target_device_internal_id: String,
        target_state: ActionableState,
    },
    #[serde(rename = "sendPushNotification", rename_all = "camelCase")]
    SendPushNotification {
        title_template: String,
        message_template: String,
        /// `__all__` addresses the configured group key.
        #[serde(skip_serializing_if = "Option::is_none")]
        target_user_key_template: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        priority: Option<i8>,
    },
    #[serde(rename = "armArea", rename_all = "camelCase")]
    ArmArea {
        scoping: ActionScoping,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        target_area_ids: Vec<String>,
        arm_mode: ArmedState,
    },
    #[serde(rename = "disarmArea", rename_all = "camelCase")]
    DisarmArea {
        scoping: ActionScoping,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        target_area_ids: Vec<String>,
    },
}

impl ActionConfig {
    /// Stable identifier used in execution accounting rows.
    pub fn type_name(&self) -> &'static str {
        match self {
            ActionConfig::CreateEvent { .. } => "createEvent",
            ActionConfig::CreateBookmark { .. } => "createBookmark",
            ActionConfig::SendHttpRequest { .. } => "sendHttpRequest",
            ActionConfig::SetDeviceState { .. } => "setDeviceState",
            ActionConfig::SendPushNotification { .. } => "sendPushNotification",
            ActionConfig::ArmArea { .. } => "armArea",
            ActionConfig::DisarmArea { .. } => "disarmArea",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy)]
pub enum ActionScoping {
    #[serde(rename = "SPECIFIC_AREAS")]
    SpecificAreas,
    #[serde(rename = "ALL_AREAS_IN_SCOPE")]
    AllAreasInScope,
}

/// Commandable end states for `setDeviceState`.
#[derive(
    Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionableState {
    On,
    Off,
    Locked,
    Unlocked,
}

#[derive(Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "PATCH")]
    Patch,
    #[serde(rename = "DELETE")]
    Delete,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HeaderTemplate {
    pub key_template: String,
    pub value_template: String,
}

/// Persisted audit record of one automation run.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AutomationExecution {
    pub id: Uuid,
    pub automation_id: String,
    pub trigger_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_event_id: Option<Uuid>,
    pub trigger_context: serde_json::Value,
    pub execution_status: ExecutionStatus,
    pub total_actions: u32,
    pub successful_actions: u32,
    pub failed_actions: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_duration_ms: Option<i64>,
}

#[derive(Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    PartialFailure,
    Failure,
}

/// Audit record of a single action inside an execution.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ActionExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub action_index: u32,
    pub action_type: String,
    /// Resolved parameter snapshot taken just before execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_params: Option<serde_json::Value>,
    pub status: ActionStatus,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionStatus {
    Running,
    Success,
    Failure,
}
