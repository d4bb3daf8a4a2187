mod automation;
mod entities;
mod event;

pub use automation::{
    ActionConfig, ActionExecution, ActionScoping, ActionStatus, ActionableState, Automation,
    AutomationConfig, AutomationExecution, ExecutionStatus, HeaderTemplate, HttpMethod, RuleNode,
    RuleOperator, TriggerConfig,
};
pub use entities::{
    Area, ArmedState, ArmingSchedule, CameraAssociation, Connector, ConnectorCategory, DayOfWeek,
    Device, DeviceType, Location,
};
pub use event::{
    BestShot, DisplayState, EventCategory, EventDeviceInfo, EventKind, EventPayload, PressType,
    StandardizedEvent,
};
