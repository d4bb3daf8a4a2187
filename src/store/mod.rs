mod credentials;
mod gateway;

pub use credentials::{CredentialError, CredentialStore};
pub use gateway::OrgGateway;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::model::{
    ActionExecution, ActionStatus, Area, ArmedState, ArmingSchedule, Automation, AutomationConfig,
    AutomationExecution, CameraAssociation, Connector, ConnectorCategory, Device, DeviceType,
    DisplayState, EventCategory, EventKind, ExecutionStatus, Location, StandardizedEvent,
};

quick_error! {
    #[derive(Debug)]
    pub enum StoreError {
        Sqlite(err: rusqlite::Error) {
            from()
            display("Database error: {}", err)
            source(err)
        }
        Json(err: serde_json::Error) {
            from()
            display("Stored JSON could not be decoded: {}", err)
            source(err)
        }
        Corrupt(what: String) {
            display("Stored row is corrupt: {}", what)
        }
        NotFound(entity: &'static str, id: String) {
            display("{} not found: {}", entity, id)
        }
        CrossTenant(entity: &'static str, id: String) {
            display("Cross-tenant access refused for {} {}", entity, id)
        }
    }
}

/// Single relational store for all entities. SQLite serializes writers;
/// callers hold the connection only for the duration of one statement.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means a panic elsewhere; the connection
        // itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS connectors (
              id TEXT PRIMARY KEY,
              organization_id TEXT NOT NULL,
              category TEXT NOT NULL,
              name TEXT NOT NULL,
              cfg TEXT NOT NULL,
              events_enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS devices (
              id TEXT PRIMARY KEY,
              connector_id TEXT NOT NULL,
              external_id TEXT NOT NULL,
              name TEXT NOT NULL,
              type TEXT NOT NULL,
              subtype TEXT,
              vendor TEXT,
              model TEXT,
              status TEXT,
              battery_percentage INTEGER,
              last_seen_ms INTEGER,
              display_state TEXT,
              UNIQUE(connector_id, external_id)
            );

            CREATE TABLE IF NOT EXISTS locations (
              id TEXT PRIMARY KEY,
              organization_id TEXT NOT NULL,
              name TEXT NOT NULL,
              parent_id TEXT,
              time_zone TEXT NOT NULL,
              active_arming_schedule_id TEXT
            );

            CREATE TABLE IF NOT EXISTS areas (
              id TEXT PRIMARY KEY,
              organization_id TEXT NOT NULL,
              location_id TEXT,
              name TEXT NOT NULL,
              armed_state TEXT NOT NULL,
              override_arming_schedule_id TEXT,
              last_armed_state_change_reason TEXT,
              next_scheduled_arm_time_ms INTEGER,
              next_scheduled_disarm_time_ms INTEGER,
              is_arming_skipped_until_ms INTEGER
            );

            CREATE TABLE IF NOT EXISTS area_devices (
              area_id TEXT NOT NULL,
              device_id TEXT NOT NULL,
              PRIMARY KEY (area_id, device_id)
            );

            CREATE TABLE IF NOT EXISTS camera_associations (
              device_id TEXT NOT NULL,
              camera_connector_id TEXT NOT NULL,
              camera_external_id TEXT NOT NULL,
              PRIMARY KEY (device_id, camera_connector_id, camera_external_id)
            );

            CREATE TABLE IF NOT EXISTS arming_schedules (
              id TEXT PRIMARY KEY,
              organization_id TEXT NOT NULL,
              name TEXT NOT NULL,
              arm_time_local TEXT NOT NULL,
              disarm_time_local TEXT NOT NULL,
              days_of_week TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
              event_id TEXT PRIMARY KEY,
              organization_id TEXT NOT NULL,
              connector_id TEXT NOT NULL,
              device_external_id TEXT NOT NULL,
              category TEXT NOT NULL,
              kind TEXT NOT NULL,
              subtype TEXT,
              timestamp_ms INTEGER NOT NULL,
              payload TEXT NOT NULL,
              device_info TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_events_org_time
              ON events(organization_id, timestamp_ms DESC);

            CREATE TABLE IF NOT EXISTS automations (
              id TEXT PRIMARY KEY,
              organization_id TEXT NOT NULL,
              name TEXT NOT NULL,
              enabled INTEGER NOT NULL DEFAULT 1,
              location_scope_id TEXT,
              tags TEXT NOT NULL DEFAULT '[]',
              config TEXT NOT NULL,
              last_fired_at_ms INTEGER
            );

            CREATE TABLE IF NOT EXISTS automation_executions (
              id TEXT PRIMARY KEY,
              automation_id TEXT NOT NULL,
              trigger_timestamp_ms INTEGER NOT NULL,
              trigger_event_id TEXT,
              trigger_context TEXT NOT NULL,
              execution_status TEXT NOT NULL,
              total_actions INTEGER NOT NULL,
              successful_actions INTEGER NOT NULL DEFAULT 0,
              failed_actions INTEGER NOT NULL DEFAULT 0,
              execution_duration_ms INTEGER
            );

            CREATE TABLE IF NOT EXISTS automation_action_executions (
              id TEXT PRIMARY KEY,
              execution_id TEXT NOT NULL,
              action_index INTEGER NOT NULL,
              action_type TEXT NOT NULL,
              action_params TEXT,
              status TEXT NOT NULL,
              retry_count INTEGER NOT NULL DEFAULT 0,
              started_at_ms INTEGER NOT NULL,
              completed_at_ms INTEGER,
              execution_duration_ms INTEGER,
              error_message TEXT
            );
            "#,
        )?;
        Ok(())
    }

    // ----- connectors -----

    pub fn insert_connector(&self, connector: &Connector) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO connectors(id, organization_id, category, name, cfg, events_enabled)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                connector.id,
                connector.organization_id,
                connector.category.as_str(),
                connector.name,
                serde_json::to_string(&connector.cfg)?,
                connector.events_enabled,
            ],
        )?;
        Ok(())
    }

    pub fn get_connector(&self, id: &str) -> Result<Option<Connector>, StoreError> {
        self.conn()
            .query_row(
                "SELECT id, organization_id, category, name, cfg, events_enabled FROM connectors WHERE id = ?1",
                params![id],
                connector_from_row,
            )
            .optional()?
            .transpose()
    }

    pub fn list_connectors(&self) -> Result<Vec<Connector>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, category, name, cfg, events_enabled FROM connectors ORDER BY id",
        )?;
        let rows = stmt.query_map([], connector_from_row)?;
        collect_rows(rows)
    }

    pub fn list_enabled_connectors(&self) -> Result<Vec<Connector>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, category, name, cfg, events_enabled FROM connectors WHERE events_enabled = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], connector_from_row)?;
        collect_rows(rows)
    }

    pub fn set_connector_events_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE connectors SET events_enabled = ?2 WHERE id = ?1",
            params![id, enabled],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("connector", id.to_string()));
        }
        Ok(())
    }

    /// Token rotation is a single-row update; the caller holds the
    /// per-connector refresh mutex.
    pub fn update_connector_cfg(&self, id: &str, cfg: &serde_json::Value) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE connectors SET cfg = ?2 WHERE id = ?1",
            params![id, serde_json::to_string(cfg)?],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("connector", id.to_string()));
        }
        Ok(())
    }

    /// Deleting a connector cascades to its devices and their memberships.
    pub fn delete_connector(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM area_devices WHERE device_id IN (SELECT id FROM devices WHERE connector_id = ?1)",
            params![id],
        )?;
        conn.execute(
            "DELETE FROM camera_associations WHERE device_id IN (SELECT id FROM devices WHERE connector_id = ?1)",
            params![id],
        )?;
        conn.execute("DELETE FROM devices WHERE connector_id = ?1", params![id])?;
        conn.execute("DELETE FROM connectors WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ----- devices -----

    /// Insert or refresh a device keyed by `(connector_id, external_id)`.
    /// The internal id of an existing row wins over the candidate's.
    pub fn upsert_device(&self, device: &Device) -> Result<Device, StoreError> {
        if let Some(existing) = self.find_device(&device.connector_id, &device.external_id)? {
            self.conn().execute(
                r#"
                UPDATE devices SET name = ?2, type = ?3, subtype = ?4, vendor = ?5, model = ?6, status = ?7
                WHERE id = ?1
                "#,
                params![
                    existing.id,
                    device.name,
                    device.device_type.as_str(),
                    device.subtype,
                    device.vendor,
                    device.model,
                    device.status,
                ],
            )?;
            return Ok(Device { id: existing.id, ..device.clone() });
        }
        self.conn().execute(
            r#"
            INSERT INTO devices(id, connector_id, external_id, name, type, subtype, vendor, model,
                                status, battery_percentage, last_seen_ms, display_state)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                device.id,
                device.connector_id,
                device.external_id,
                device.name,
                device.device_type.as_str(),
                device.subtype,
                device.vendor,
                device.model,
                device.status,
                device.battery_percentage,
                device.last_seen.map(ts_ms),
                device.display_state.map(|s| s.to_string()),
            ],
        )?;
        Ok(device.clone())
    }

    pub fn find_device(
        &self,
        connector_id: &str,
        external_id: &str,
    ) -> Result<Option<Device>, StoreError> {
        self.conn()
            .query_row(
                &format!("{} WHERE connector_id = ?1 AND external_id = ?2", DEVICE_SELECT),
                params![connector_id, external_id],
                device_from_row,
            )
            .optional()?
            .transpose()
    }

    pub fn get_device(&self, id: &str) -> Result<Option<Device>, StoreError> {
        self.conn()
            .query_row(
                &format!("{} WHERE id = ?1", DEVICE_SELECT),
                params![id],
                device_from_row,
            )
            .optional()?
            .transpose()
    }

    pub fn devices_for_connector(&self, connector_id: &str) -> Result<Vec<Device>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("{} WHERE connector_id = ?1 ORDER BY external_id", DEVICE_SELECT))?;
        let rows = stmt.query_map(params![connector_id], device_from_row)?;
        collect_rows(rows)
    }

    /// Last-seen bookkeeping done by the pipeline for every event.
    pub fn touch_device(
        &self,
        id: &str,
        last_seen: DateTime<Utc>,
        display_state: Option<DisplayState>,
        battery_percentage: Option<u8>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            UPDATE devices SET
              last_seen_ms = ?2,
              display_state = COALESCE(?3, display_state),
              battery_percentage = COALESCE(?4, battery_percentage)
            WHERE id = ?1
            "#,
            params![id, ts_ms(last_seen), display_state.map(|s| s.to_string()), battery_percentage],
        )?;
        Ok(())
    }

    // ----- locations, areas, schedules -----

    pub fn insert_location(&self, location: &Location) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO locations(id, organization_id, name, parent_id, time_zone, active_arming_schedule_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                location.id,
                location.organization_id,
                location.name,
                location.parent_id,
                location.time_zone,
                location.active_arming_schedule_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_location(&self, id: &str) -> Result<Option<Location>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, organization_id, name, parent_id, time_zone, active_arming_schedule_id FROM locations WHERE id = ?1",
                params![id],
                location_from_row,
            )
            .optional()?)
    }

    pub fn list_locations(&self, organization_id: &str) -> Result<Vec<Location>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, name, parent_id, time_zone, active_arming_schedule_id FROM locations WHERE organization_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![organization_id], location_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn set_location_default_schedule(
        &self,
        id: &str,
        schedule_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE locations SET active_arming_schedule_id = ?2 WHERE id = ?1",
            params![id, schedule_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("location", id.to_string()));
        }
        Ok(())
    }

    pub fn insert_area(&self, area: &Area) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO areas(id, organization_id, location_id, name, armed_state,
                              override_arming_schedule_id, last_armed_state_change_reason,
                              next_scheduled_arm_time_ms, next_scheduled_disarm_time_ms,
                              is_arming_skipped_until_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                area.id,
                area.organization_id,
                area.location_id,
                area.name,
                area.armed_state.to_string(),
                area.override_arming_schedule_id,
                area.last_armed_state_change_reason,
                area.next_scheduled_arm_time.map(ts_ms),
                area.next_scheduled_disarm_time.map(ts_ms),
                area.is_arming_skipped_until.map(ts_ms),
            ],
        )?;
        Ok(())
    }

    pub fn get_area(&self, id: &str) -> Result<Option<Area>, StoreError> {
        self.conn()
            .query_row(&format!("{} WHERE id = ?1", AREA_SELECT), params![id], area_from_row)
            .optional()?
            .transpose()
    }

    pub fn list_areas(&self, organization_id: &str) -> Result<Vec<Area>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("{} WHERE organization_id = ?1 ORDER BY id", AREA_SELECT))?;
        let rows = stmt.query_map(params![organization_id], area_from_row)?;
        collect_rows(rows)
    }

    /// Every area across all organizations; the arming daemon walks this.
    pub fn list_all_areas(&self) -> Result<Vec<Area>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{} ORDER BY id", AREA_SELECT))?;
        let rows = stmt.query_map([], area_from_row)?;
        collect_rows(rows)
    }

    pub fn areas_in_location(&self, location_id: &str) -> Result<Vec<Area>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("{} WHERE location_id = ?1 ORDER BY id", AREA_SELECT))?;
        let rows = stmt.query_map(params![location_id], area_from_row)?;
        collect_rows(rows)
    }

    /// One-shot armed-state transition write. Any armed-state change
    /// clears the skip/next-time fields unless the caller provides new
    /// values.
    pub fn update_area_armed_state(
        &self,
        id: &str,
        state: ArmedState,
        reason: &str,
        next_arm: Option<DateTime<Utc>>,
        next_disarm: Option<DateTime<Utc>>,
        skipped_until: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            r#"
            UPDATE areas SET
              armed_state = ?2,
              last_armed_state_change_reason = ?3,
              next_scheduled_arm_time_ms = ?4,
              next_scheduled_disarm_time_ms = ?5,
              is_arming_skipped_until_ms = ?6
            WHERE id = ?1
            "#,
            params![
                id,
                state.to_string(),
                reason,
                next_arm.map(ts_ms),
                next_disarm.map(ts_ms),
                skipped_until.map(ts_ms),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("area", id.to_string()));
        }
        Ok(())
    }

    /// Refresh the scheduler's next arm/disarm display fields without
    /// touching the armed state.
    pub fn update_area_schedule_times(
        &self,
        id: &str,
        next_arm: Option<DateTime<Utc>>,
        next_disarm: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE areas SET next_scheduled_arm_time_ms = ?2, next_scheduled_disarm_time_ms = ?3 WHERE id = ?1",
            params![id, next_arm.map(ts_ms), next_disarm.map(ts_ms)],
        )?;
        Ok(())
    }

    pub fn set_area_override_schedule(
        &self,
        id: &str,
        schedule_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE areas SET override_arming_schedule_id = ?2 WHERE id = ?1",
            params![id, schedule_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("area", id.to_string()));
        }
        Ok(())
    }

    /// A device belongs to at most one area within its organization;
    /// assignment moves it.
    pub fn assign_device_to_area(&self, area_id: &str, device_id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute("DELETE FROM area_devices WHERE device_id = ?1", params![device_id])?;
        conn.execute(
            "INSERT INTO area_devices(area_id, device_id) VALUES (?1, ?2)",
            params![area_id, device_id],
        )?;
        Ok(())
    }

    pub fn area_for_device(&self, device_id: &str) -> Result<Option<Area>, StoreError> {
        self.conn()
            .query_row(
                &format!(
                    "{} WHERE id = (SELECT area_id FROM area_devices WHERE device_id = ?1)",
                    AREA_SELECT
                ),
                params![device_id],
                area_from_row,
            )
            .optional()?
            .transpose()
    }

    pub fn insert_schedule(&self, schedule: &ArmingSchedule) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO arming_schedules(id, organization_id, name, arm_time_local, disarm_time_local, days_of_week)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                schedule.id,
                schedule.organization_id,
                schedule.name,
                schedule.arm_time_local,
                schedule.disarm_time_local,
                serde_json::to_string(&schedule.days_of_week)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_schedule(&self, id: &str) -> Result<Option<ArmingSchedule>, StoreError> {
        self.conn()
            .query_row(
                "SELECT id, organization_id, name, arm_time_local, disarm_time_local, days_of_week FROM arming_schedules WHERE id = ?1",
                params![id],
                schedule_from_row,
            )
            .optional()?
            .transpose()
    }

    pub fn add_camera_association(&self, assoc: &CameraAssociation) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT OR IGNORE INTO camera_associations(device_id, camera_connector_id, camera_external_id)
            VALUES (?1, ?2, ?3)
            "#,
            params![assoc.device_id, assoc.camera_connector_id, assoc.camera_external_id],
        )?;
        Ok(())
    }

    pub fn camera_associations_for_device(
        &self,
        device_id: &str,
    ) -> Result<Vec<CameraAssociation>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT device_id, camera_connector_id, camera_external_id FROM camera_associations WHERE device_id = ?1 ORDER BY camera_external_id",
        )?;
        let rows = stmt.query_map(params![device_id], |row| {
            Ok(CameraAssociation {
                device_id: row.get(0)?,
                camera_connector_id: row.get(1)?,
                camera_external_id: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ----- events -----

    /// Idempotent on `event_id`; returns whether a new row was written.
    pub fn insert_event(&self, event: &StandardizedEvent) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            r#"
            INSERT OR IGNORE INTO events(event_id, organization_id, connector_id, device_external_id,
                                         category, kind, subtype, timestamp_ms, payload, device_info)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                event.event_id.to_string(),
                event.organization_id,
                event.connector_id,
                event.device_id,
                event.category.to_string(),
                event.kind.to_string(),
                event.subtype,
                ts_ms(event.timestamp),
                serde_json::to_string(&event.payload)?,
                event.device_info.as_ref().map(serde_json::to_string).transpose()?,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Newest-first page of an organization's events.
    pub fn query_events(
        &self,
        organization_id: &str,
        filter: &EventQuery,
    ) -> Result<Vec<StandardizedEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT event_id, organization_id, connector_id, device_external_id,
                   category, kind, subtype, timestamp_ms, payload, device_info
            FROM events
            WHERE organization_id = ?1
              AND (?2 IS NULL OR device_external_id = ?2)
              AND (?3 IS NULL OR category = ?3)
            ORDER BY timestamp_ms DESC
            LIMIT ?4 OFFSET ?5
            "#,
        )?;
        let rows = stmt.query_map(
            params![
                organization_id,
                filter.device_external_id,
                filter.category.map(|c| c.to_string()),
                filter.limit,
                filter.offset,
            ],
            event_from_row,
        )?;
        collect_rows(rows)
    }

    // ----- automations -----

    pub fn insert_automation(&self, automation: &Automation) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO automations(id, organization_id, name, enabled, location_scope_id, tags, config, last_fired_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                automation.id,
                automation.organization_id,
                automation.name,
                automation.enabled,
                automation.location_scope_id,
                serde_json::to_string(&automation.tags)?,
                serde_json::to_string(&automation.config)?,
                automation.last_fired_at.map(ts_ms),
            ],
        )?;
        Ok(())
    }

    pub fn get_automation(&self, id: &str) -> Result<Option<Automation>, StoreError> {
        self.conn()
            .query_row(
                &format!("{} WHERE id = ?1", AUTOMATION_SELECT),
                params![id],
                automation_from_row,
            )
            .optional()?
            .transpose()
    }

    pub fn find_enabled_automations(
        &self,
        organization_id: &str,
    ) -> Result<Vec<Automation>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE organization_id = ?1 AND enabled = 1 ORDER BY id",
            AUTOMATION_SELECT
        ))?;
        let rows = stmt.query_map(params![organization_id], automation_from_row)?;
        collect_rows(rows)
    }

    /// Organizations with at least one automation; the scheduled-trigger
    /// daemon walks this.
    pub fn list_automation_organizations(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT DISTINCT organization_id FROM automations ORDER BY organization_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn set_automation_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE automations SET enabled = ?2 WHERE id = ?1",
            params![id, enabled],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("automation", id.to_string()));
        }
        Ok(())
    }

    pub fn update_automation_config(
        &self,
        id: &str,
        config: &AutomationConfig,
    ) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE automations SET config = ?2 WHERE id = ?1",
            params![id, serde_json::to_string(config)?],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("automation", id.to_string()));
        }
        Ok(())
    }

    pub fn set_automation_last_fired(
        &self,
        id: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE automations SET last_fired_at_ms = ?2 WHERE id = ?1",
            params![id, ts_ms(fired_at)],
        )?;
        Ok(())
    }

    // ----- executions -----

    pub fn insert_execution(&self, execution: &AutomationExecution) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO automation_executions(id, automation_id, trigger_timestamp_ms, trigger_event_id,
                                              trigger_context, execution_status, total_actions,
                                              successful_actions, failed_actions, execution_duration_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                execution.id.to_string(),
                execution.automation_id,
                ts_ms(execution.trigger_timestamp),
                execution.trigger_event_id.map(|id| id.to_string()),
                serde_json::to_string(&execution.trigger_context)?,
                execution.execution_status.to_string(),
                execution.total_actions,
                execution.successful_actions,
                execution.failed_actions,
                execution.execution_duration_ms,
            ],
        )?;
        Ok(())
    }

    pub fn complete_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        successful_actions: u32,
        failed_actions: u32,
        duration_ms: i64,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            UPDATE automation_executions SET
              execution_status = ?2, successful_actions = ?3, failed_actions = ?4, execution_duration_ms = ?5
            WHERE id = ?1
            "#,
            params![id.to_string(), status.to_string(), successful_actions, failed_actions, duration_ms],
        )?;
        Ok(())
    }

    pub fn get_execution(
        &self,
        id: Uuid,
    ) -> Result<Option<AutomationExecution>, StoreError> {
        self.conn()
            .query_row(
                r#"
                SELECT id, automation_id, trigger_timestamp_ms, trigger_event_id, trigger_context,
                       execution_status, total_actions, successful_actions, failed_actions, execution_duration_ms
                FROM automation_executions WHERE id = ?1
                "#,
                params![id.to_string()],
                execution_from_row,
            )
            .optional()?
            .transpose()
    }

    pub fn executions_for_automation(
        &self,
        automation_id: &str,
    ) -> Result<Vec<AutomationExecution>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, automation_id, trigger_timestamp_ms, trigger_event_id, trigger_context,
                   execution_status, total_actions, successful_actions, failed_actions, execution_duration_ms
            FROM automation_executions WHERE automation_id = ?1 ORDER BY trigger_timestamp_ms DESC
            "#,
        )?;
        let rows = stmt.query_map(params![automation_id], execution_from_row)?;
        collect_rows(rows)
    }

    pub fn insert_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO automation_action_executions(id, execution_id, action_index, action_type,
                                                     action_params, status, retry_count, started_at_ms,
                                                     completed_at_ms, execution_duration_ms, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                action.id.to_string(),
                action.execution_id.to_string(),
                action.action_index,
                action.action_type,
                action.action_params.as_ref().map(serde_json::to_string).transpose()?,
                action.status.to_string(),
                action.retry_count,
                ts_ms(action.started_at),
                action.completed_at.map(ts_ms),
                action.execution_duration_ms,
                action.error_message,
            ],
        )?;
        Ok(())
    }

    pub fn complete_action_execution(
        &self,
        id: Uuid,
        status: ActionStatus,
        completed_at: DateTime<Utc>,
        duration_ms: i64,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            UPDATE automation_action_executions SET
              status = ?2, completed_at_ms = ?3, execution_duration_ms = ?4, error_message = ?5
            WHERE id = ?1
            "#,
            params![id.to_string(), status.to_string(), ts_ms(completed_at), duration_ms, error_message],
        )?;
        Ok(())
    }

    pub fn action_executions_for(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, execution_id, action_index, action_type, action_params, status, retry_count,
                   started_at_ms, completed_at_ms, execution_duration_ms, error_message
            FROM automation_action_executions WHERE execution_id = ?1 ORDER BY action_index
            "#,
        )?;
        let rows = stmt.query_map(params![execution_id.to_string()], action_execution_from_row)?;
        collect_rows(rows)
    }
}

/// Filters for the paginated event listing.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub device_external_id: Option<String>,
    pub category: Option<EventCategory>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self { device_external_id: None, category: None, limit: 50, offset: 0 }
    }
}

// ----- row mapping -----

const DEVICE_SELECT: &str = "SELECT id, connector_id, external_id, name, type, subtype, vendor, model, status, battery_percentage, last_seen_ms, display_state FROM devices";
const AREA_SELECT: &str = "SELECT id, organization_id, location_id, name, armed_state, override_arming_schedule_id, last_armed_state_change_reason, next_scheduled_arm_time_ms, next_scheduled_disarm_time_ms, is_arming_skipped_until_ms FROM areas";
const AUTOMATION_SELECT: &str = "SELECT id, organization_id, name, enabled, location_scope_id, tags, config, last_fired_at_ms FROM automations";

fn ts_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn ts_from_ms(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

fn parse_uuid(raw: String) -> Result<Uuid, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid uuid: {}", raw)))
}

fn collect_rows<T>(
    rows: impl Iterator<Item = Result<Result<T, StoreError>, rusqlite::Error>>,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

fn connector_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Connector, StoreError>> {
    let category_raw: String = row.get(2)?;
    let cfg_raw: String = row.get(4)?;
    Ok((|| {
        Ok(Connector {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            category: ConnectorCategory::parse(&category_raw)
                .ok_or_else(|| StoreError::Corrupt(format!("connector category: {}", category_raw)))?,
            name: row.get(3)?,
            cfg: serde_json::from_str(&cfg_raw)?,
            events_enabled: row.get(5)?,
        })
    })())
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Device, StoreError>> {
    let type_raw: String = row.get(4)?;
    let last_seen_ms: Option<i64> = row.get(10)?;
    let display_raw: Option<String> = row.get(11)?;
    Ok((|| {
        Ok(Device {
            id: row.get(0)?,
            connector_id: row.get(1)?,
            external_id: row.get(2)?,
            name: row.get(3)?,
            device_type: DeviceType::from(type_raw),
            subtype: row.get(5)?,
            vendor: row.get(6)?,
            model: row.get(7)?,
            status: row.get(8)?,
            battery_percentage: row.get(9)?,
            last_seen: last_seen_ms.map(ts_from_ms).transpose()?,
            display_state: display_raw
                .map(|raw| {
                    raw.parse::<DisplayState>()
                        .map_err(|_| StoreError::Corrupt(format!("display state: {}", raw)))
                })
                .transpose()?,
        })
    })())
}

fn location_from_row(row: &Row<'_>) -> rusqlite::Result<Location> {
    Ok(Location {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        name: row.get(2)?,
        parent_id: row.get(3)?,
        time_zone: row.get(4)?,
        active_arming_schedule_id: row.get(5)?,
    })
}

fn area_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Area, StoreError>> {
    let armed_raw: String = row.get(4)?;
    let next_arm_ms: Option<i64> = row.get(7)?;
    let next_disarm_ms: Option<i64> = row.get(8)?;
    let skip_ms: Option<i64> = row.get(9)?;
    Ok((|| {
        Ok(Area {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            location_id: row.get(2)?,
            name: row.get(3)?,
            armed_state: armed_raw
                .parse::<ArmedState>()
                .map_err(|_| StoreError::Corrupt(format!("armed state: {}", armed_raw)))?,
            override_arming_schedule_id: row.get(5)?,
            last_armed_state_change_reason: row.get(6)?,
            next_scheduled_arm_time: next_arm_ms.map(ts_from_ms).transpose()?,
            next_scheduled_disarm_time: next_disarm_ms.map(ts_from_ms).transpose()?,
            is_arming_skipped_until: skip_ms.map(ts_from_ms).transpose()?,
        })
    })())
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<Result<ArmingSchedule, StoreError>> {
    let days_raw: String = row.get(5)?;
    Ok((|| {
        Ok(ArmingSchedule {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            name: row.get(2)?,
            arm_time_local: row.get(3)?,
            disarm_time_local: row.get(4)?,
            days_of_week: serde_json::from_str(&days_raw)?,
        })
    })())
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Result<StandardizedEvent, StoreError>> {
    let event_id_raw: String = row.get(0)?;
    let category_raw: String = row.get(4)?;
    let kind_raw: String = row.get(5)?;
    let timestamp_ms: i64 = row.get(7)?;
    let payload_raw: String = row.get(8)?;
    let device_info_raw: Option<String> = row.get(9)?;
    Ok((|| {
        Ok(StandardizedEvent {
            event_id: parse_uuid(event_id_raw)?,
            organization_id: row.get(1)?,
            connector_id: row.get(2)?,
            device_id: row.get(3)?,
            category: category_raw
                .parse::<EventCategory>()
                .map_err(|_| StoreError::Corrupt(format!("event category: {}", category_raw)))?,
            kind: kind_raw
                .parse::<EventKind>()
                .map_err(|_| StoreError::Corrupt(format!("event kind: {}", kind_raw)))?,
            subtype: row.get(6)?,
            timestamp: ts_from_ms(timestamp_ms)?,
            payload: serde_json::from_str(&payload_raw)?,
            device_info: device_info_raw.map(|raw| serde_json::from_str(&raw)).transpose()?,
        })
    })())
}

fn automation_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Automation, StoreError>> {
    let tags_raw: String = row.get(5)?;
    let config_raw: String = row.get(6)?;
    let fired_ms: Option<i64> = row.get(7)?;
    Ok((|| {
        Ok(Automation {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            name: row.get(2)?,
            enabled: row.get(3)?,
            location_scope_id: row.get(4)?,
            tags: serde_json::from_str(&tags_raw)?,
            config: serde_json::from_str(&config_raw)?,
            last_fired_at: fired_ms.map(ts_from_ms).transpose()?,
        })
    })())
}

fn execution_from_row(
    row: &Row<'_>,
) -> rusqlite::Result<Result<AutomationExecution, StoreError>> {
    let id_raw: String = row.get(0)?;
    let ts: i64 = row.get(2)?;
    let event_id_raw: Option<String> = row.get(3)?;
    let context_raw: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    Ok((|| {
        Ok(AutomationExecution {
            id: parse_uuid(id_raw)?,
            automation_id: row.get(1)?,
            trigger_timestamp: ts_from_ms(ts)?,
            trigger_event_id: event_id_raw.map(parse_uuid).transpose()?,
            trigger_context: serde_json::from_str(&context_raw)?,
            execution_status: parse_execution_status(&status_raw)?,
            total_actions: row.get(6)?,
            successful_actions: row.get(7)?,
            failed_actions: row.get(8)?,
            execution_duration_ms: row.get(9)?,
        })
    })())
}

fn action_execution_from_row(
    row: &Row<'_>,
) -> rusqlite::Result<Result<ActionExecution, StoreError>> {
    let id_raw: String = row.get(0)?;
    let execution_id_raw: String = row.get(1)?;
    let params_raw: Option<String> = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let started_ms: i64 = row.get(7)?;
    let completed_ms: Option<i64> = row.get(8)?;
    Ok((|| {
        Ok(ActionExecution {
            id: parse_uuid(id_raw)?,
            execution_id: parse_uuid(execution_id_raw)?,
            action_index: row.get(2)?,
            action_type: row.get(3)?,
            action_params: params_raw.map(|raw| serde_json::from_str(&raw)).transpose()?,
            status: parse_action_status(&status_raw)?,
            retry_count: row.get(6)?,
            started_at: ts_from_ms(started_ms)?,
            completed_at: completed_ms.map(ts_from_ms).transpose()?,
            execution_duration_ms: row.get(9)?,
            error_message: row.get(10)?,
        })
    })())
}

fn parse_execution_status(raw: &str) -> Result<ExecutionStatus, StoreError> {
    match raw {
        "running" => Ok(ExecutionStatus::Running),
        "success" => Ok(ExecutionStatus::Success),
        "partial_failure" => Ok(ExecutionStatus::PartialFailure),
        "failure" => Ok(ExecutionStatus::Failure),
        _ => Err(StoreError::Corrupt(format!("execution status: {}", raw))),
    }
}

fn parse_action_status(raw: &str) -> Result<ActionStatus, StoreError> {
    match raw {
        "running" => Ok(ActionStatus::Running),
        "success" => Ok(ActionStatus::Success),
        "failure" => Ok(ActionStatus::Failure),
        _ => Err(StoreError::Corrupt(format!("action status: {}", raw))),
    }
}
