mod actions;
mod rules;
mod sink;
mod tokens;

pub use actions::{ActionError, ActionInputs, ResolvedAction};
pub use rules::{build_facts, evaluate, Facts, RuleError};
pub use sink::{ActionSink, LiveActionSink, PushSettings};
pub use tokens::{resolve, TemplateContext};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::arming::{schedule as arming_schedule, INTERNAL_CONNECTOR_ID};
use crate::model::{
    ActionExecution, ActionStatus, Area, Automation, AutomationExecution, Device, ExecutionStatus,
    StandardizedEvent, TriggerConfig,
};
use crate::store::{OrgGateway, Store};

/// Default per-action wall-clock limit.
const ACTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Concurrent executions allowed per organization.
pub const DEFAULT_ORG_CONCURRENCY: usize = 16;

/// Per-organization rule evaluation and action execution. Dispatch never
/// blocks the event pipeline; each automation runs as its own task under
/// a per-organization concurrency cap.
pub struct AutomationEngine {
    store: Arc<Store>,
    sink: Arc<dyn ActionSink>,
    cache: Mutex<HashMap<String, Arc<Vec<Automation>>>>,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    per_org_cap: usize,
}

impl AutomationEngine {
    pub fn new(store: Arc<Store>, sink: Arc<dyn ActionSink>, per_org_cap: usize) -> Self {
        Self {
            store,
            sink,
            cache: Mutex::new(HashMap::new()),
            semaphores: Mutex::new(HashMap::new()),
            per_org_cap,
        }
    }

    /// Drop the cached automation list for an organization; called on any
    /// automation mutation.
    pub fn invalidate(&self, organization_id: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(organization_id);
        debug!(organization = organization_id, "Automation cache invalidated");
    }

    fn enabled_automations(&self, organization_id: &str) -> Arc<Vec<Automation>> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(organization_id) {
                return cached.clone();
            }
        }
        let loaded = match self.store.find_enabled_automations(organization_id) {
            Ok(automations) => Arc::new(automations),
            Err(e) => {
                error!(organization = organization_id, error = %e, "Could not load automations");
                Arc::new(Vec::new())
            }
        };
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(organization_id.to_string(), loaded.clone());
        loaded
    }

    fn org_semaphore(&self, organization_id: &str) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock().unwrap_or_else(|e| e.into_inner());
        semaphores
            .entry(organization_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_org_cap)))
            .clone()
    }

    /// Evaluate an incoming event against the organization's automations.
    /// Each matching automation runs concurrently; dispatches beyond the
    /// per-organization cap are rejected with a warning.
    pub async fn dispatch_event(self: Arc<Self>, event: StandardizedEvent) {
        let automations = self.enabled_automations(&event.organization_id);
        if automations.is_empty() {
            return;
        }
        let semaphore = self.org_semaphore(&event.organization_id);

        let mut tasks = JoinSet::new();
        for automation in automations.iter() {
            if !matches!(automation.config.trigger, TriggerConfig::Event { .. }) {
                continue;
            }
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(
                        organization = %event.organization_id,
                        automation = %automation.id,
                        "Execution cap reached; dispatch rejected"
                    );
                    continue;
                }
            };
            let engine = self.clone();
            let automation = automation.clone();
            let event = event.clone();
            tasks.spawn(async move {
                let _permit = permit;
                engine.run_event_automation(automation, event).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Automation task panicked");
            }
        }
    }

    async fn run_event_automation(&self, automation: Automation, event: StandardizedEvent) {
        let gateway = OrgGateway::new(self.store.clone(), automation.organization_id.clone());
        let TriggerConfig::Event { conditions } = &automation.config.trigger else {
            return;
        };

        let device = gateway
            .device_by_external_id(&event.connector_id, &event.device_id)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Device lookup failed while building facts");
                None
            });
        let facts = build_facts(&event, device.as_ref());
        match evaluate(conditions, &facts) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                // Malformed trees skip the automation without an
                // execution record.
                warn!(automation = %automation.id, error = %e, "Rule tree unusable; automation skipped");
                return;
            }
        }

        if let Some(scope) = &automation.location_scope_id {
            let area = resolve_area(&gateway, &event, device.as_ref());
            let in_scope = area
                .as_ref()
                .and_then(|a| a.location_id.as_ref())
                .map(|location| location == scope)
                .unwrap_or(false);
            if !in_scope {
                return;
            }
        }

        self.execute(&gateway, &automation, Some(&event), device, facts.as_value()).await;
    }

    /// Execution accounting shared by event and scheduled triggers: one
    /// `AutomationExecution` row, one `ActionExecution` row per action,
    /// actions in declared order, failures never short-circuiting.
    async fn execute(
        &self,
        gateway: &OrgGateway,
        automation: &Automation,
        trigger_event: Option<&StandardizedEvent>,
        device: Option<Device>,
        trigger_context: serde_json::Value,
    ) {
        let timer = Instant::now();
        let area = trigger_event.and_then(|event| resolve_area(gateway, event, device.as_ref()));
        let location = area
            .as_ref()
            .and_then(|a| a.location_id.as_ref())
            .and_then(|id| gateway.location(id).ok().flatten());
        let connector = trigger_event
            .and_then(|event| gateway.connector(&event.connector_id).ok().flatten());
        let schedule = area
            .as_ref()
            .and_then(|a| a.override_arming_schedule_id.clone())
            .or_else(|| location.as_ref().and_then(|l| l.active_arming_schedule_id.clone()))
            .and_then(|id| gateway.schedule(&id).ok().flatten());

        let template_ctx = TemplateContext::new(
            trigger_event,
            device.as_ref(),
            area.as_ref(),
            location.as_ref(),
            connector.as_ref(),
            schedule.as_ref(),
        );
        let inputs = ActionInputs {
            camera_associations: device
                .as_ref()
                .map(|d| gateway.camera_associations_for_device(&d.id).unwrap_or_default())
                .unwrap_or_default(),
            in_scope_area_ids: match &automation.location_scope_id {
                Some(location_id) => gateway
                    .areas_in_location(location_id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|a| a.id)
                    .collect(),
                None => gateway
                    .areas()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|a| a.id)
                    .collect(),
            },
        };

        let total_actions = automation.config.actions.len() as u32;
        let execution = AutomationExecution {
            id: Uuid::new_v4(),
            automation_id: automation.id.clone(),
            trigger_timestamp: Utc::now(),
            trigger_event_id: trigger_event.map(|e| e.event_id),
            trigger_context,
            execution_status: ExecutionStatus::Running,
            total_actions,
            successful_actions: 0,
            failed_actions: 0,
            execution_duration_ms: None,
        };
        if let Err(e) = gateway.insert_execution(&execution) {
            error!(automation = %automation.id, error = %e, "Execution record could not be created");
            return;
        }
        info!(automation = %automation.id, actions = total_actions, "Automation firing");

        let mut successful: u32 = 0;
        let mut failed: u32 = 0;
        for (index, action) in automation.config.actions.iter().enumerate() {
            let outcome = self
                .run_action(gateway, execution.id, index as u32, action, &template_ctx, &inputs, trigger_event)
                .await;
            match outcome {
                Ok(()) => successful += 1,
                Err(e) => {
                    warn!(
                        automation = %automation.id,
                        action = action.type_name(),
                        index,
                        error = %e,
                        "Action failed; continuing with remaining actions"
                    );
                    failed += 1;
                }
            }
        }

        let status = if failed == 0 {
            ExecutionStatus::Success
        } else if successful == 0 {
            ExecutionStatus::Failure
        } else {
            ExecutionStatus::PartialFailure
        };
        if let Err(e) = gateway.complete_execution(
            execution.id,
            status,
            successful,
            failed,
            timer.elapsed().as_millis() as i64,
        ) {
            error!(execution = %execution.id, error = %e, "Execution record could not be completed");
        }
    }

    async fn run_action(
        &self,
        gateway: &OrgGateway,
        execution_id: Uuid,
        action_index: u32,
        action: &crate::model::ActionConfig,
        template_ctx: &TemplateContext,
        inputs: &ActionInputs,
        trigger_event: Option<&StandardizedEvent>,
    ) -> Result<(), ActionError> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let resolved = actions::resolve_action(action, template_ctx, inputs, trigger_event);

        let record = ActionExecution {
            id: Uuid::new_v4(),
            execution_id,
            action_index,
            action_type: action.type_name().to_string(),
            action_params: resolved
                .as_ref()
                .ok()
                .and_then(|r| serde_json::to_value(r).ok()),
            status: ActionStatus::Running,
            retry_count: 0,
            started_at,
            completed_at: None,
            execution_duration_ms: None,
            error_message: None,
        };
        if let Err(e) = gateway.insert_action_execution(&record) {
            error!(error = %e, "Action record could not be created");
        }

        let result = match resolved {
            Err(e) => Err(e),
            Ok(resolved) => {
                match tokio::time::timeout(ACTION_TIMEOUT, self.sink.execute(gateway, &resolved))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ActionError::Timeout),
                }
            }
        };

        let (status, error_message) = match &result {
            Ok(()) => (ActionStatus::Success, None),
            Err(e) => (ActionStatus::Failure, Some(e.to_string())),
        };
        if let Err(e) = gateway.complete_action_execution(
            record.id,
            status,
            Utc::now(),
            timer.elapsed().as_millis() as i64,
            error_message.as_deref(),
        ) {
            error!(error = %e, "Action record could not be completed");
        }
        result
    }

    /// Evaluate scheduled triggers against `now`, firing each at most
    /// once per matching window. Reads the store directly so rotated
    /// `last_fired_at` marks are always fresh.
    pub async fn tick_scheduled(&self, now: DateTime<Utc>) {
        let organizations = match self.store.list_automation_organizations() {
            Ok(organizations) => organizations,
            Err(e) => {
                error!(error = %e, "Scheduled tick could not enumerate organizations");
                return;
            }
        };
        for organization_id in organizations {
            let gateway = OrgGateway::new(self.store.clone(), organization_id.clone());
            let automations = match gateway.find_enabled_automations() {
                Ok(automations) => automations,
                Err(e) => {
                    error!(organization = %organization_id, error = %e, "Scheduled tick load failed");
                    continue;
                }
            };
            for automation in automations {
                let TriggerConfig::Scheduled { time_local, days_of_week, time_zone } =
                    &automation.config.trigger
                else {
                    continue;
                };
                let Some(time) = arming_schedule::parse_schedule_time(time_local) else {
                    warn!(automation = %automation.id, time = %time_local, "Unparseable trigger time");
                    continue;
                };
                let zone = arming_schedule::resolve_zone(time_zone);
                let Some(window) = arming_schedule::occurrence_before(time, days_of_week, zone, now)
                else {
                    continue;
                };
                let already_fired =
                    automation.last_fired_at.map(|fired| fired >= window).unwrap_or(false);
                if already_fired {
                    continue;
                }
                if let Err(e) = gateway.set_automation_last_fired(&automation.id, now) {
                    error!(automation = %automation.id, error = %e, "last_fired_at update failed");
                    continue;
                }
                self.invalidate(&organization_id);
                let context = serde_json::json!({
                    "kind": "SCHEDULED",
                    "window": window.to_rfc3339(),
                });
                self.execute(&gateway, &automation, None, None, context).await;
            }
        }
    }

    /// Minute daemon for scheduled triggers.
    pub async fn run_scheduled_daemon(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.tick_scheduled(Utc::now()).await;
        }
    }
}

/// The area behind an event: the triggering device's area, or the area
/// itself for synthetic arm-state events.
fn resolve_area(
    gateway: &OrgGateway,
    event: &StandardizedEvent,
    device: Option<&Device>,
) -> Option<Area> {
    if let Some(device) = device {
        return gateway.area_for_device(&device.id).ok().flatten();
    }
    if event.connector_id == INTERNAL_CONNECTOR_ID {
        return gateway.area(&event.device_id).ok().flatten();
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{
        ActionConfig, Area, ArmedState, CameraAssociation, Connector, ConnectorCategory,
        AutomationConfig, DeviceType, RuleNode, RuleOperator,
    };
    use futures::future::BoxFuture;
    use futures::FutureExt;

    /// Sink that records every action it is asked to execute and fails on
    /// demand.
    #[derive(Default)]
    struct RecordingSink {
        recorded: Mutex<Vec<ResolvedAction>>,
        fail_matching: Option<&'static str>,
        delay: Option<Duration>,
    }

    impl RecordingSink {
        fn actions(&self) -> Vec<ResolvedAction> {
            self.recorded.lock().unwrap().clone()
        }
    }

    impl ActionSink for RecordingSink {
        fn execute<'a>(
            &'a self,
            _gateway: &'a OrgGateway,
            action: &'a ResolvedAction,
        ) -> BoxFuture<'a, Result<(), ActionError>> {
            async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.recorded.lock().unwrap().push(action.clone());
                if let Some(marker) = self.fail_matching {
                    if format!("{:?}", action).contains(marker) {
                        return Err(ActionError::Execute("simulated failure".into()));
                    }
                }
                Ok(())
            }
            .boxed()
        }
    }

    fn door_rule() -> RuleNode {
        RuleNode::All {
            all: vec![
                RuleNode::Condition {
                    fact: "event.type".into(),
                    operator: RuleOperator::Eq,
                    value: "STATE_CHANGED".into(),
                },
                RuleNode::Condition {
                    fact: "event.displayState".into(),
                    operator: RuleOperator::Eq,
                    value: "OPEN".into(),
                },
                RuleNode::Condition {
                    fact: "device.type".into(),
                    operator: RuleOperator::Eq,
                    value: "DoorSensor".into(),
                },
            ],
        }
    }

    fn push_action() -> ActionConfig {
        ActionConfig::SendPushNotification {
            title_template: "Door".into(),
            message_template: "{{device.name}} opened".into(),
            target_user_key_template: Some("__all__".into()),
            priority: None,
        }
    }

    fn seeded_store() -> Arc<Store> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .insert_connector(&Connector {
                id: "c1".into(),
                organization_id: "o1".into(),
                category: ConnectorCategory::MqttHub,
                name: "Hub".into(),
                cfg: serde_json::json!({
                    "brokerUrl": "mqtt://hub.example:1883",
                    "apiUrl": "https://api.hub.example"
                }),
                events_enabled: true,
            })
            .unwrap();
        store
            .upsert_device(&crate::model::Device {
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
            })
            .unwrap();
        store
            .insert_area(&Area {
                id: "a1".into(),
                organization_id: "o1".into(),
                location_id: None,
                name: "Entry".into(),
                armed_state: ArmedState::Disarmed,
                override_arming_schedule_id: None,
                last_armed_state_change_reason: None,
                next_scheduled_arm_time: None,
                next_scheduled_disarm_time: None,
                is_arming_skipped_until: None,
            })
            .unwrap();
        store.assign_device_to_area("a1", "d1").unwrap();
        store
    }

    fn automation(id: &str, actions: Vec<ActionConfig>) -> Automation {
        Automation {
            id: id.into(),
            organization_id: "o1".into(),
            name: id.to_uppercase(),
            enabled: true,
            location_scope_id: None,
            tags: vec![],
            config: AutomationConfig {
                trigger: TriggerConfig::Event { conditions: door_rule() },
                actions,
            },
            last_fired_at: None,
        }
    }

    fn door_open_event(store: &Store) -> StandardizedEvent {
        let connector = store.get_connector("c1").unwrap().unwrap();
        let events = crate::drivers::hub::parser::parse(
            &connector,
            "hub/home-1/tok/report",
            br#"{"event":"contact.report","time":1700000000000,"msgid":"m1","deviceId":"abc","data":{"state":"open"}}"#,
        );
        events.into_iter().next().unwrap()
    }

    fn engine_with(store: Arc<Store>, sink: Arc<RecordingSink>) -> Arc<AutomationEngine> {
        Arc::new(AutomationEngine::new(store, sink, DEFAULT_ORG_CONCURRENCY))
    }

    #[tokio::test]
    async fn test_door_event_fires_push() {
        let store = seeded_store();
        store.insert_automation(&automation("m1", vec![push_action()])).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(store.clone(), sink.clone());

        engine.clone().dispatch_event(door_open_event(&store)).await;

        let actions = sink.actions();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ResolvedAction::PushNotification { title, message, target_user_key, .. } => {
                assert_eq!(title, "Door");
                assert_eq!(message, "Front Door opened");
                assert_eq!(target_user_key.as_deref(), Some("__all__"));
            }
            other => panic!("unexpected action: {:?}", other),
        }

        let executions = store.executions_for_automation("m1").unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].execution_status, ExecutionStatus::Success);
        assert_eq!(executions[0].total_actions, 1);
        assert_eq!(executions[0].successful_actions, 1);
        assert_eq!(executions[0].failed_actions, 0);
        assert!(executions[0].execution_duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_non_matching_event_is_silent() {
        let store = seeded_store();
        store.insert_automation(&automation("m1", vec![push_action()])).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(store.clone(), sink.clone());

        let connector = store.get_connector("c1").unwrap().unwrap();
        let closed = crate::drivers::hub::parser::parse(
            &connector,
            "t",
            br#"{"event":"contact.report","time":1700000000000,"deviceId":"abc","data":{"state":"closed"}}"#,
        );
        engine.clone().dispatch_event(closed.into_iter().next().unwrap()).await;

        assert!(sink.actions().is_empty());
        assert!(store.executions_for_automation("m1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_action_failure_does_not_short_circuit() {
        let store = seeded_store();
        let http_action = ActionConfig::SendHttpRequest {
            url_template: "https://hooks.example/failing".into(),
            method: crate::model::HttpMethod::Post,
            headers: vec![],
            body_template: None,
        };
        store
            .insert_automation(&automation("m1", vec![http_action, push_action()]))
            .unwrap();
        let sink = Arc::new(RecordingSink {
            fail_matching: Some("failing"),
            ..Default::default()
        });
        let engine = engine_with(store.clone(), sink.clone());

        engine.clone().dispatch_event(door_open_event(&store)).await;

        // Both actions ran despite the first failing
        assert_eq!(sink.actions().len(), 2);
        let executions = store.executions_for_automation("m1").unwrap();
        assert_eq!(executions[0].execution_status, ExecutionStatus::PartialFailure);
        assert_eq!(executions[0].successful_actions, 1);
        assert_eq!(executions[0].failed_actions, 1);

        let action_rows = store.action_executions_for(executions[0].id).unwrap();
        assert_eq!(action_rows.len(), 2);
        assert_eq!(action_rows[0].status, ActionStatus::Failure);
        assert!(action_rows[0].error_message.is_some());
        assert_eq!(action_rows[1].status, ActionStatus::Success);
    }

    #[tokio::test]
    async fn test_bookmark_resolves_associated_cameras() {
        let store = seeded_store();
        store
            .insert_connector(&Connector {
                id: "v1".into(),
                organization_id: "o1".into(),
                category: ConnectorCategory::VideoVms,
                name: "VMS".into(),
                cfg: serde_json::json!({ "baseUrl": "https://vms.example", "apiToken": "t" }),
                events_enabled: true,
            })
            .unwrap();
        for camera in ["cam-1", "cam-2"] {
            store
                .add_camera_association(&CameraAssociation {
                    device_id: "d1".into(),
                    camera_connector_id: "v1".into(),
                    camera_external_id: camera.into(),
                })
                .unwrap();
        }
        let bookmark = ActionConfig::CreateBookmark {
            target_connector_id: "v1".into(),
            name_template: "{{device.name}}".into(),
            description_template: None,
            duration_ms_template: "3000".into(),
            tags_template: None,
        };
        store.insert_automation(&automation("m1", vec![bookmark])).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(store.clone(), sink.clone());

        let event = door_open_event(&store);
        let expected_start = event.timestamp.timestamp_millis();
        engine.clone().dispatch_event(event).await;

        let actions = sink.actions();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ResolvedAction::CreateBookmark { camera_external_ids, request, .. } => {
                assert_eq!(camera_external_ids, &vec!["cam-1".to_string(), "cam-2".to_string()]);
                assert_eq!(request.name, "Front Door");
                assert_eq!(request.duration_ms, 3000);
                assert_eq!(request.start_time_ms, expected_start);
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_respects_org_cap() {
        let store = seeded_store();
        store.insert_automation(&automation("m1", vec![push_action()])).unwrap();
        store.insert_automation(&automation("m2", vec![push_action()])).unwrap();
        let sink = Arc::new(RecordingSink {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let engine = Arc::new(AutomationEngine::new(store.clone(), sink.clone(), 1));

        engine.clone().dispatch_event(door_open_event(&store)).await;

        // One ran, one was rejected at the cap
        assert_eq!(sink.actions().len(), 1);
        let total: usize = ["m1", "m2"]
            .iter()
            .map(|id| store.executions_for_automation(id).unwrap().len())
            .sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_cache_invalidation_picks_up_new_automations() {
        let store = seeded_store();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(store.clone(), sink.clone());

        engine.clone().dispatch_event(door_open_event(&store)).await;
        assert!(sink.actions().is_empty());

        store.insert_automation(&automation("m1", vec![push_action()])).unwrap();
        // Stale cache: still nothing
        engine.clone().dispatch_event(door_open_event(&store)).await;
        assert!(sink.actions().is_empty());

        engine.invalidate("o1");
        engine.clone().dispatch_event(door_open_event(&store)).await;
        assert_eq!(sink.actions().len(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_trigger_fires_once_per_window() {
        use chrono::TimeZone;
        let store = seeded_store();
        let mut scheduled = automation("s1", vec![push_action()]);
        scheduled.config.trigger = TriggerConfig::Scheduled {
            time_local: "22:00".into(),
            days_of_week: vec![
                crate::model::DayOfWeek::Mon,
                crate::model::DayOfWeek::Tue,
                crate::model::DayOfWeek::Wed,
                crate::model::DayOfWeek::Thu,
                crate::model::DayOfWeek::Fri,
                crate::model::DayOfWeek::Sat,
                crate::model::DayOfWeek::Sun,
            ],
            time_zone: "America/New_York".into(),
        };
        store.insert_automation(&scheduled).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(store.clone(), sink.clone());

        // 02:30Z on the 15th = 22:30 local on the 14th: window passed
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 2, 30, 0).unwrap();
        engine.tick_scheduled(now).await;
        assert_eq!(sink.actions().len(), 1);
        assert_eq!(store.executions_for_automation("s1").unwrap().len(), 1);

        // Same window: no refire
        engine.tick_scheduled(now + chrono::Duration::minutes(1)).await;
        assert_eq!(sink.actions().len(), 1);

        // Next evening's window fires again
        let next_day = Utc.with_ymd_and_hms(2024, 3, 16, 2, 30, 0).unwrap();
        engine.tick_scheduled(next_day).await;
        assert_eq!(sink.actions().len(), 2);
    }
}
