pub mod schedule;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{
    Area, ArmedState, EventCategory, EventKind, EventPayload, StandardizedEvent,
};
use crate::pipeline::EventSubmitter;
use crate::store::{OrgGateway, Store, StoreError};

/// Connector id stamped on synthetic arm-state events. There is no
/// connector row behind it; rules match on `connector.id` all the same.
pub const INTERNAL_CONNECTOR_ID: &str = "internal";

quick_error! {
    #[derive(Debug)]
    pub enum ArmingError {
        Store(err: StoreError) {
            from()
            display("Arming store error: {}", err)
            source(err)
        }
        NotFound(area_id: String) {
            display("Area not found: {}", area_id)
        }
        InvalidTransition(from: ArmedState, requested: &'static str) {
            display("Cannot {} an area in state {}", requested, from)
        }
        InvalidMode(mode: ArmedState) {
            display("{} is not an armable mode", mode)
        }
    }
}

/// Who asked for a transition; fixes the persisted change reason.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ArmSource {
    User,
    Automation,
    Schedule,
}

impl ArmSource {
    fn reason(&self, arming: bool) -> &'static str {
        match (self, arming) {
            (ArmSource::User, _) => "user_action",
            (ArmSource::Automation, true) => "automation_arm",
            (ArmSource::Automation, false) => "automation_disarm",
            (ArmSource::Schedule, _) => "schedule",
        }
    }
}

/// Requested state-machine input.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ArmRequest {
    Arm(ArmedState),
    Disarm,
    Trigger,
}

/// Pure transition function for the per-area state machine. `TRIGGERED`
/// is left only via an explicit disarm.
pub fn next_state(current: ArmedState, request: ArmRequest) -> Result<ArmedState, ArmingError> {
    match request {
        ArmRequest::Arm(mode) => {
            if !matches!(mode, ArmedState::ArmedAway | ArmedState::ArmedStay) {
                return Err(ArmingError::InvalidMode(mode));
            }
            if current == ArmedState::Triggered {
                return Err(ArmingError::InvalidTransition(current, "arm"));
            }
            Ok(mode)
        }
        ArmRequest::Disarm => Ok(ArmedState::Disarmed),
        ArmRequest::Trigger => match current {
            ArmedState::ArmedAway | ArmedState::ArmedStay | ArmedState::Triggered => {
                Ok(ArmedState::Triggered)
            }
            ArmedState::Disarmed => Err(ArmingError::InvalidTransition(current, "trigger")),
        },
    }
}

/// Per-area outcome of a batch operation.
#[derive(Debug, Serialize, Clone, Default)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Serialize, Clone)]
pub struct BatchFailure {
    pub area_id: String,
    pub error: String,
}

impl BatchOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty() && !self.succeeded.is_empty()
    }
}

/// Owns armed-state transitions: validates them, persists them, and
/// publishes them back into the event pipeline.
pub struct ArmingService {
    store: Arc<Store>,
    submitter: EventSubmitter,
}

impl ArmingService {
    pub fn new(store: Arc<Store>, submitter: EventSubmitter) -> Self {
        Self { store, submitter }
    }

    pub fn gateway(&self, organization_id: &str) -> OrgGateway {
        OrgGateway::new(self.store.clone(), organization_id)
    }

    pub fn arm(
        &self,
        gateway: &OrgGateway,
        area_id: &str,
        mode: ArmedState,
        source: ArmSource,
    ) -> Result<Area, ArmingError> {
        self.transition(gateway, area_id, ArmRequest::Arm(mode), source)
    }

    pub fn disarm(
        &self,
        gateway: &OrgGateway,
        area_id: &str,
        source: ArmSource,
    ) -> Result<Area, ArmingError> {
        self.transition(gateway, area_id, ArmRequest::Disarm, source)
    }

    /// An alarm-grade event on an armed area's device trips the area.
    pub fn trigger(&self, gateway: &OrgGateway, area_id: &str) -> Result<Area, ArmingError> {
        self.transition(gateway, area_id, ArmRequest::Trigger, ArmSource::Automation)
    }

    /// Apply one transition: validate, persist (clearing skip/next-time
    /// fields), emit the arm-state event.
    fn transition(
        &self,
        gateway: &OrgGateway,
        area_id: &str,
        request: ArmRequest,
        source: ArmSource,
    ) -> Result<Area, ArmingError> {
        let area = gateway
            .area(area_id)?
            .ok_or_else(|| ArmingError::NotFound(area_id.to_string()))?;
        let new_state = next_state(area.armed_state, request)?;
        let arming = matches!(request, ArmRequest::Arm(_) | ArmRequest::Trigger);
        let reason = source.reason(arming);

        if new_state == area.armed_state {
            return Ok(area);
        }

        gateway.set_area_armed_state(area_id, new_state, reason, None, None, None)?;
        info!(area = area_id, from = %area.armed_state, to = %new_state, %reason, "Area state changed");

        let updated = Area {
            armed_state: new_state,
            last_armed_state_change_reason: Some(reason.to_string()),
            next_scheduled_arm_time: None,
            next_scheduled_disarm_time: None,
            is_arming_skipped_until: None,
            ..area
        };
        self.submitter.submit(vec![armed_state_event(&updated, reason)]);
        Ok(updated)
    }

    /// Arm every area in a location. Transitions apply per area; failures
    /// are collected, never aborting the batch.
    pub fn batch_arm_location(
        &self,
        gateway: &OrgGateway,
        location_id: &str,
        mode: ArmedState,
        source: ArmSource,
    ) -> Result<BatchOutcome, ArmingError> {
        let areas = gateway.areas_in_location(location_id)?;
        Ok(self.apply_batch(gateway, &areas, ArmRequest::Arm(mode), source))
    }

    pub fn batch_disarm_location(
        &self,
        gateway: &OrgGateway,
        location_id: &str,
        source: ArmSource,
    ) -> Result<BatchOutcome, ArmingError> {
        let areas = gateway.areas_in_location(location_id)?;
        Ok(self.apply_batch(gateway, &areas, ArmRequest::Disarm, source))
    }

    /// Batch over explicit area ids, used by automation actions.
    pub fn apply_to_areas(
        &self,
        gateway: &OrgGateway,
        area_ids: &[String],
        request: ArmRequest,
        source: ArmSource,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for area_id in area_ids {
            match self.transition(gateway, area_id, request, source) {
                Ok(_) => outcome.succeeded.push(area_id.clone()),
                Err(e) => {
                    warn!(area = %area_id, error = %e, "Batch transition failed");
                    outcome.failed.push(BatchFailure { area_id: area_id.clone(), error: e.to_string() });
                }
            }
        }
        outcome
    }

    fn apply_batch(
        &self,
        gateway: &OrgGateway,
        areas: &[Area],
        request: ArmRequest,
        source: ArmSource,
    ) -> BatchOutcome {
        let ids: Vec<String> = areas.iter().map(|a| a.id.clone()).collect();
        self.apply_to_areas(gateway, &ids, request, source)
    }
}

fn armed_state_event(area: &Area, reason: &str) -> StandardizedEvent {
    StandardizedEvent {
        event_id: Uuid::new_v4(),
        organization_id: area.organization_id.clone(),
        connector_id: INTERNAL_CONNECTOR_ID.to_string(),
        device_id: area.id.clone(),
        category: EventCategory::StateChange,
        kind: EventKind::ArmedStateChanged,
        subtype: Some(reason.to_string()),
        timestamp: Utc::now(),
        payload: EventPayload {
            raw_state_value: Some(area.armed_state.to_string()),
            original_event_type: Some("area.armedStateChanged".to_string()),
            ..Default::default()
        },
        device_info: None,
    }
}

/// Clamp helper for the skip feature: a skip in the past is spent.
pub fn skip_is_active(area: &Area, now: DateTime<Utc>) -> bool {
    area.is_arming_skipped_until.map(|until| until > now).unwrap_or(false)
}

/// Display states that trip an armed area when reported by one of its
/// devices.
pub fn is_alarm_state(state: crate::model::DisplayState) -> bool {
    use crate::model::DisplayState::*;
    matches!(state, Open | MotionDetected | VibrationDetected | LeakDetected)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pipeline::EventSubmitter;

    fn service_with_areas(states: &[(&str, ArmedState)]) -> (Arc<Store>, ArmingService) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .insert_location(&crate::model::Location {
                id: "l1".into(),
                organization_id: "o1".into(),
                name: "HQ".into(),
                parent_id: None,
                time_zone: "America/New_York".into(),
                active_arming_schedule_id: None,
            })
            .unwrap();
        for (id, state) in states {
            store
                .insert_area(&Area {
                    id: (*id).into(),
                    organization_id: "o1".into(),
                    location_id: Some("l1".into()),
                    name: id.to_uppercase(),
                    armed_state: *state,
                    override_arming_schedule_id: None,
                    last_armed_state_change_reason: None,
                    next_scheduled_arm_time: None,
                    next_scheduled_disarm_time: None,
                    is_arming_skipped_until: None,
                })
                .unwrap();
        }
        let service = ArmingService::new(store.clone(), EventSubmitter::disconnected());
        (store, service)
    }

    #[test]
    fn test_transition_table() {
        use ArmedState::*;
        assert_eq!(next_state(Disarmed, ArmRequest::Arm(ArmedAway)).unwrap(), ArmedAway);
        assert_eq!(next_state(ArmedAway, ArmRequest::Arm(ArmedStay)).unwrap(), ArmedStay);
        assert_eq!(next_state(ArmedStay, ArmRequest::Disarm).unwrap(), Disarmed);
        assert_eq!(next_state(Triggered, ArmRequest::Disarm).unwrap(), Disarmed);
        assert_eq!(next_state(ArmedAway, ArmRequest::Trigger).unwrap(), Triggered);
        assert!(next_state(Triggered, ArmRequest::Arm(ArmedAway)).is_err());
        assert!(next_state(Disarmed, ArmRequest::Trigger).is_err());
        assert!(next_state(Disarmed, ArmRequest::Arm(Triggered)).is_err());
        assert!(next_state(Disarmed, ArmRequest::Arm(Disarmed)).is_err());
    }

    #[test]
    fn test_arm_persists_and_sets_reason() {
        let (store, service) = service_with_areas(&[("a1", ArmedState::Disarmed)]);
        let gateway = service.gateway("o1");
        let area = service.arm(&gateway, "a1", ArmedState::ArmedStay, ArmSource::User).unwrap();
        assert_eq!(area.armed_state, ArmedState::ArmedStay);

        let stored = store.get_area("a1").unwrap().unwrap();
        assert_eq!(stored.armed_state, ArmedState::ArmedStay);
        assert_eq!(stored.last_armed_state_change_reason.as_deref(), Some("user_action"));
    }

    #[test]
    fn test_triggered_only_leaves_via_disarm() {
        let (store, service) = service_with_areas(&[("a1", ArmedState::ArmedAway)]);
        let gateway = service.gateway("o1");
        service.trigger(&gateway, "a1").unwrap();
        assert_eq!(store.get_area("a1").unwrap().unwrap().armed_state, ArmedState::Triggered);

        assert!(service.arm(&gateway, "a1", ArmedState::ArmedAway, ArmSource::Schedule).is_err());
        assert_eq!(store.get_area("a1").unwrap().unwrap().armed_state, ArmedState::Triggered);

        service.disarm(&gateway, "a1", ArmSource::User).unwrap();
        assert_eq!(store.get_area("a1").unwrap().unwrap().armed_state, ArmedState::Disarmed);
    }

    #[test]
    fn test_batch_arm_reports_partial_outcome() {
        let (store, service) = service_with_areas(&[
            ("a1", ArmedState::Disarmed),
            ("a2", ArmedState::Triggered),
            ("a3", ArmedState::Disarmed),
        ]);
        let gateway = service.gateway("o1");
        let outcome = service
            .batch_arm_location(&gateway, "l1", ArmedState::ArmedAway, ArmSource::User)
            .unwrap();

        assert_eq!(outcome.succeeded, vec!["a1", "a3"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].area_id, "a2");
        assert!(outcome.is_partial());

        assert_eq!(store.get_area("a1").unwrap().unwrap().armed_state, ArmedState::ArmedAway);
        assert_eq!(store.get_area("a2").unwrap().unwrap().armed_state, ArmedState::Triggered);
        assert_eq!(store.get_area("a3").unwrap().unwrap().armed_state, ArmedState::ArmedAway);
    }

    #[test]
    fn test_idempotent_arm_skips_event() {
        let (_, service) = service_with_areas(&[("a1", ArmedState::ArmedAway)]);
        let gateway = service.gateway("o1");
        let area = service.arm(&gateway, "a1", ArmedState::ArmedAway, ArmSource::Schedule).unwrap();
        assert_eq!(area.armed_state, ArmedState::ArmedAway);
        // Reason untouched because no transition happened
        assert_eq!(area.last_armed_state_change_reason, None);
    }
}
