use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    ActionExecution, ActionStatus, Area, ArmedState, ArmingSchedule, Automation,
    AutomationExecution, CameraAssociation, Connector, Device, ExecutionStatus, Location,
    StandardizedEvent,
};

use super::{EventQuery, Store, StoreError};

/// Tenant-scoped facade over the store. Reads silently filter by
/// organization; writes targeting another organization's entities are
/// refused with a hard error rather than a partial result.
#[derive(Clone)]
pub struct OrgGateway {
    store: Arc<Store>,
    organization_id: String,
}

impl OrgGateway {
    pub fn new(store: Arc<Store>, organization_id: impl Into<String>) -> Self {
        Self { store, organization_id: organization_id.into() }
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    // ----- connectors & devices -----

    pub fn connector(&self, id: &str) -> Result<Option<Connector>, StoreError> {
        Ok(self
            .store
            .get_connector(id)?
            .filter(|c| c.organization_id == self.organization_id))
    }

    fn owned_connector(&self, id: &str) -> Result<Connector, StoreError> {
        let connector = self
            .store
            .get_connector(id)?
            .ok_or_else(|| StoreError::NotFound("connector", id.to_string()))?;
        if connector.organization_id != self.organization_id {
            return Err(StoreError::CrossTenant("connector", id.to_string()));
        }
        Ok(connector)
    }

    pub fn device_by_external_id(
        &self,
        connector_id: &str,
        external_id: &str,
    ) -> Result<Option<Device>, StoreError> {
        if self.connector(connector_id)?.is_none() {
            return Ok(None);
        }
        self.store.find_device(connector_id, external_id)
    }

    pub fn device(&self, id: &str) -> Result<Option<Device>, StoreError> {
        match self.store.get_device(id)? {
            Some(device) if self.connector(&device.connector_id)?.is_some() => Ok(Some(device)),
            _ => Ok(None),
        }
    }

    pub fn upsert_device(&self, device: &Device) -> Result<Device, StoreError> {
        self.owned_connector(&device.connector_id)?;
        self.store.upsert_device(device)
    }

    pub fn touch_device(
        &self,
        id: &str,
        last_seen: DateTime<Utc>,
        display_state: Option<crate::model::DisplayState>,
        battery_percentage: Option<u8>,
    ) -> Result<(), StoreError> {
        if self.device(id)?.is_none() {
            return Err(StoreError::CrossTenant("device", id.to_string()));
        }
        self.store.touch_device(id, last_seen, display_state, battery_percentage)
    }

    pub fn camera_associations_for_device(
        &self,
        device_id: &str,
    ) -> Result<Vec<CameraAssociation>, StoreError> {
        if self.device(device_id)?.is_none() {
            return Ok(Vec::new());
        }
        self.store.camera_associations_for_device(device_id)
    }

    // ----- events -----

    /// Refuses events stamped with another organization (invariant: a
    /// persisted event's organization matches its connector's owner).
    pub fn insert_event(&self, event: &StandardizedEvent) -> Result<bool, StoreError> {
        if event.organization_id != self.organization_id {
            return Err(StoreError::CrossTenant("event", event.event_id.to_string()));
        }
        self.store.insert_event(event)
    }

    pub fn query_events(&self, filter: &EventQuery) -> Result<Vec<StandardizedEvent>, StoreError> {
        self.store.query_events(&self.organization_id, filter)
    }

    // ----- automations & executions -----

    pub fn find_enabled_automations(&self) -> Result<Vec<Automation>, StoreError> {
        self.store.find_enabled_automations(&self.organization_id)
    }

    fn owned_automation(&self, id: &str) -> Result<Automation, StoreError> {
        let automation = self
            .store
            .get_automation(id)?
            .ok_or_else(|| StoreError::NotFound("automation", id.to_string()))?;
        if automation.organization_id != self.organization_id {
            return Err(StoreError::CrossTenant("automation", id.to_string()));
        }
        Ok(automation)
    }

    pub fn set_automation_last_fired(
        &self,
        id: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.owned_automation(id)?;
        self.store.set_automation_last_fired(id, fired_at)
    }

    pub fn insert_execution(&self, execution: &AutomationExecution) -> Result<(), StoreError> {
        self.owned_automation(&execution.automation_id)?;
        self.store.insert_execution(execution)
    }

    pub fn complete_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        successful_actions: u32,
        failed_actions: u32,
        duration_ms: i64,
    ) -> Result<(), StoreError> {
        self.store.complete_execution(id, status, successful_actions, failed_actions, duration_ms)
    }

    pub fn insert_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError> {
        self.store.insert_action_execution(action)
    }

    pub fn complete_action_execution(
        &self,
        id: Uuid,
        status: ActionStatus,
        completed_at: DateTime<Utc>,
        duration_ms: i64,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        self.store.complete_action_execution(id, status, completed_at, duration_ms, error_message)
    }

    // ----- areas, locations, schedules -----

    pub fn areas(&self) -> Result<Vec<Area>, StoreError> {
        self.store.list_areas(&self.organization_id)
    }

    pub fn area(&self, id: &str) -> Result<Option<Area>, StoreError> {
        Ok(self.store.get_area(id)?.filter(|a| a.organization_id == self.organization_id))
    }

    pub fn areas_in_location(&self, location_id: &str) -> Result<Vec<Area>, StoreError> {
        if self.location(location_id)?.is_none() {
            return Ok(Vec::new());
        }
        self.store.areas_in_location(location_id)
    }

    pub fn area_for_device(&self, device_id: &str) -> Result<Option<Area>, StoreError> {
        Ok(self
            .store
            .area_for_device(device_id)?
            .filter(|a| a.organization_id == self.organization_id))
    }

    pub fn set_area_armed_state(
        &self,
        id: &str,
        state: ArmedState,
        reason: &str,
        next_arm: Option<DateTime<Utc>>,
        next_disarm: Option<DateTime<Utc>>,
        skipped_until: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let area = self
            .store
            .get_area(id)?
            .ok_or_else(|| StoreError::NotFound("area", id.to_string()))?;
        if area.organization_id != self.organization_id {
            return Err(StoreError::CrossTenant("area", id.to_string()));
        }
        self.store
            .update_area_armed_state(id, state, reason, next_arm, next_disarm, skipped_until)
    }

    pub fn update_area_schedule_times(
        &self,
        id: &str,
        next_arm: Option<DateTime<Utc>>,
        next_disarm: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if self.area(id)?.is_none() {
            return Err(StoreError::CrossTenant("area", id.to_string()));
        }
        self.store.update_area_schedule_times(id, next_arm, next_disarm)
    }

    pub fn location(&self, id: &str) -> Result<Option<Location>, StoreError> {
        Ok(self
            .store
            .get_location(id)?
            .filter(|l| l.organization_id == self.organization_id))
    }

    pub fn schedule(&self, id: &str) -> Result<Option<ArmingSchedule>, StoreError> {
        Ok(self
            .store
            .get_schedule(id)?
            .filter(|s| s.organization_id == self.organization_id))
    }
}
