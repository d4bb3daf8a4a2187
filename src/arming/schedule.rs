use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, warn};

use crate::model::{Area, ArmedState, ArmingSchedule};
use crate::store::{OrgGateway, Store};

use super::{skip_is_active, ArmSource, ArmingError, ArmingService};

/// How often due areas are re-examined.
const TICK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Arm,
    Disarm,
}

/// An area's schedule after inheritance: its own override, else the
/// location default. Times are interpreted in the location's zone.
#[derive(Debug, Clone)]
pub struct EffectiveSchedule {
    pub schedule: ArmingSchedule,
    pub zone: Tz,
}

pub fn effective_schedule(
    gateway: &OrgGateway,
    area: &Area,
) -> Result<Option<EffectiveSchedule>, ArmingError> {
    let location = match &area.location_id {
        Some(location_id) => gateway.location(location_id)?,
        None => None,
    };
    let schedule_id = area.override_arming_schedule_id.clone().or_else(|| {
        location.as_ref().and_then(|l| l.active_arming_schedule_id.clone())
    });
    let Some(schedule_id) = schedule_id else {
        return Ok(None);
    };
    let Some(schedule) = gateway.schedule(&schedule_id)? else {
        warn!(area = %area.id, schedule = %schedule_id, "Effective schedule points at a missing row");
        return Ok(None);
    };
    let zone = location
        .map(|l| resolve_zone(&l.time_zone))
        .unwrap_or(chrono_tz::UTC);
    Ok(Some(EffectiveSchedule { schedule, zone }))
}

pub fn resolve_zone(raw: &str) -> Tz {
    raw.parse().unwrap_or_else(|_| {
        warn!(zone = raw, "Unknown IANA zone; falling back to UTC");
        chrono_tz::UTC
    })
}

fn parse_local_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M").ok()
}

fn schedule_time(schedule: &ArmingSchedule, kind: TransitionKind) -> Option<NaiveTime> {
    match kind {
        TransitionKind::Arm => parse_local_time(&schedule.arm_time_local),
        TransitionKind::Disarm => parse_local_time(&schedule.disarm_time_local),
    }
}

fn instant_on(date: NaiveDate, time: NaiveTime, zone: Tz) -> Option<DateTime<Utc>> {
    match zone.from_local_datetime(&date.and_time(time)) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        // Fall-back overlap: take the first wall-clock occurrence.
        LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
        // Spring-forward gap: that day simply has no such instant.
        LocalResult::None => None,
    }
}

/// Next occurrence of a local daily time strictly after `after`, in UTC.
/// Shared with the scheduled-automation evaluator.
pub fn occurrence_after(
    time: NaiveTime,
    days: &[crate::model::DayOfWeek],
    zone: Tz,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let local_date = after.with_timezone(&zone).date_naive();
    for offset in 0..=7 {
        let date = local_date + chrono::Duration::days(offset);
        if !day_listed(days, date) {
            continue;
        }
        if let Some(instant) = instant_on(date, time, zone) {
            if instant > after {
                return Some(instant);
            }
        }
    }
    None
}

/// Most recent occurrence of a local daily time at or before `now`.
pub fn occurrence_before(
    time: NaiveTime,
    days: &[crate::model::DayOfWeek],
    zone: Tz,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let local_date = now.with_timezone(&zone).date_naive();
    for offset in 0..=7 {
        let date = local_date - chrono::Duration::days(offset);
        if !day_listed(days, date) {
            continue;
        }
        if let Some(instant) = instant_on(date, time, zone) {
            if instant <= now {
                return Some(instant);
            }
        }
    }
    None
}

/// Next arm/disarm instant strictly after `after`, in UTC.
pub fn next_occurrence(
    effective: &EffectiveSchedule,
    kind: TransitionKind,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let time = schedule_time(&effective.schedule, kind)?;
    occurrence_after(time, &effective.schedule.days_of_week, effective.zone, after)
}

/// Most recent arm/disarm instant at or before `now`, in UTC.
pub fn previous_occurrence(
    effective: &EffectiveSchedule,
    kind: TransitionKind,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let time = schedule_time(&effective.schedule, kind)?;
    occurrence_before(time, &effective.schedule.days_of_week, effective.zone, now)
}

fn day_listed(days: &[crate::model::DayOfWeek], date: NaiveDate) -> bool {
    use chrono::Datelike;
    days.iter().any(|d| d.to_chrono() == date.weekday())
}

/// `HH:MM` as used by schedules and scheduled triggers.
pub fn parse_schedule_time(raw: &str) -> Option<NaiveTime> {
    parse_local_time(raw)
}

/// Periodic daemon: arms/disarms areas whose effective schedule says so,
/// honouring per-area skips, and refreshes the next-instant display
/// fields.
pub struct ArmingScheduler {
    service: Arc<ArmingService>,
    store: Arc<Store>,
}

impl ArmingScheduler {
    pub fn new(service: Arc<ArmingService>, store: Arc<Store>) -> Self {
        Self { service, store }
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick(Utc::now()) {
                error!(error = %e, "Arming scheduler tick failed");
            }
        }
    }

    /// One pass over all areas. Per-area failures are logged and do not
    /// stop the sweep.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<(), ArmingError> {
        for area in self.store.list_all_areas()? {
            if let Err(e) = self.tick_area(&area, now) {
                warn!(area = %area.id, error = %e, "Area schedule evaluation failed");
            }
        }
        Ok(())
    }

    fn tick_area(&self, area: &Area, now: DateTime<Utc>) -> Result<(), ArmingError> {
        let gateway = self.service.gateway(&area.organization_id);
        let Some(effective) = effective_schedule(&gateway, area)? else {
            return Ok(());
        };

        let next_arm = next_occurrence(&effective, TransitionKind::Arm, now);
        let next_disarm = next_occurrence(&effective, TransitionKind::Disarm, now);

        if skip_is_active(area, now) {
            debug!(area = %area.id, "Scheduled arming skipped by request");
            gateway.update_area_schedule_times(&area.id, next_arm, next_disarm)?;
            return Ok(());
        }

        let last_arm = previous_occurrence(&effective, TransitionKind::Arm, now);
        let last_disarm = previous_occurrence(&effective, TransitionKind::Disarm, now);

        match (last_arm, last_disarm) {
            (Some(arm_at), disarm_at) if disarm_at.map(|d| arm_at > d).unwrap_or(true) => {
                if !area.armed_state.is_armed() {
                    self.service.arm(&gateway, &area.id, ArmedState::ArmedAway, ArmSource::Schedule)?;
                }
            }
            (arm_at, Some(disarm_at)) if arm_at.map(|a| disarm_at > a).unwrap_or(true) => {
                if matches!(area.armed_state, ArmedState::ArmedAway | ArmedState::ArmedStay) {
                    self.service.disarm(&gateway, &area.id, ArmSource::Schedule)?;
                }
            }
            _ => {}
        }

        gateway.update_area_schedule_times(&area.id, next_arm, next_disarm)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{DayOfWeek, Location};
    use crate::pipeline::EventSubmitter;
    use chrono::TimeZone;

    fn every_day() -> Vec<DayOfWeek> {
        vec![
            DayOfWeek::Mon,
            DayOfWeek::Tue,
            DayOfWeek::Wed,
            DayOfWeek::Thu,
            DayOfWeek::Fri,
            DayOfWeek::Sat,
            DayOfWeek::Sun,
        ]
    }

    fn schedule(id: &str, arm: &str, disarm: &str, days: Vec<DayOfWeek>) -> ArmingSchedule {
        ArmingSchedule {
            id: id.into(),
            organization_id: "o1".into(),
            name: id.to_uppercase(),
            arm_time_local: arm.into(),
            disarm_time_local: disarm.into(),
            days_of_week: days,
        }
    }

    fn area(id: &str, override_schedule: Option<&str>) -> Area {
        Area {
            id: id.into(),
            organization_id: "o1".into(),
            location_id: Some("l1".into()),
            name: id.to_uppercase(),
            armed_state: ArmedState::Disarmed,
            override_arming_schedule_id: override_schedule.map(String::from),
            last_armed_state_change_reason: None,
            next_scheduled_arm_time: None,
            next_scheduled_disarm_time: None,
            is_arming_skipped_until: None,
        }
    }

    fn seeded() -> (Arc<Store>, Arc<ArmingScheduler>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .insert_location(&Location {
                id: "l1".into(),
                organization_id: "o1".into(),
                name: "HQ".into(),
                parent_id: None,
                time_zone: "America/New_York".into(),
                active_arming_schedule_id: Some("s_loc".into()),
            })
            .unwrap();
        store.insert_schedule(&schedule("s_loc", "22:00", "06:00", every_day())).unwrap();
        store.insert_schedule(&schedule("s_over", "23:30", "05:00", every_day())).unwrap();
        store.insert_area(&area("a1", Some("s_over"))).unwrap();
        store.insert_area(&area("a2", None)).unwrap();
        let service = Arc::new(ArmingService::new(store.clone(), EventSubmitter::disconnected()));
        (store.clone(), Arc::new(ArmingScheduler::new(service, store)))
    }

    #[test]
    fn test_override_beats_location_default() {
        let (store, scheduler) = seeded();
        let gateway = OrgGateway::new(store.clone(), "o1");
        let a1 = store.get_area("a1").unwrap().unwrap();
        let effective = effective_schedule(&gateway, &a1).unwrap().unwrap();
        assert_eq!(effective.schedule.id, "s_over");
        assert_eq!(effective.zone, chrono_tz::America::New_York);

        let a2 = store.get_area("a2").unwrap().unwrap();
        let effective = effective_schedule(&gateway, &a2).unwrap().unwrap();
        assert_eq!(effective.schedule.id, "s_loc");
        drop(scheduler);
    }

    #[test]
    fn test_unassigned_area_keeps_override_only() {
        let (store, _) = seeded();
        let gateway = OrgGateway::new(store.clone(), "o1");
        let unassigned = Area { location_id: None, ..area("a9", None) };
        assert!(effective_schedule(&gateway, &unassigned).unwrap().is_none());

        let with_override = Area { location_id: None, ..area("a9", Some("s_over")) };
        let effective = effective_schedule(&gateway, &with_override).unwrap().unwrap();
        // No location means no zone to inherit
        assert_eq!(effective.zone, chrono_tz::UTC);
    }

    #[test]
    fn test_occurrences_in_location_zone() {
        let effective = EffectiveSchedule {
            schedule: schedule("s", "22:00", "06:00", every_day()),
            zone: chrono_tz::America::New_York,
        };
        // 2024-03-15T01:00Z is 21:00 EDT on the 14th
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 1, 0, 0).unwrap();
        assert_eq!(
            next_occurrence(&effective, TransitionKind::Arm, now).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 15, 2, 0, 0).unwrap()
        );
        assert_eq!(
            previous_occurrence(&effective, TransitionKind::Arm, now).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 14, 2, 0, 0).unwrap()
        );
        assert_eq!(
            next_occurrence(&effective, TransitionKind::Disarm, now).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_scheduled_arming_respects_override() {
        let (store, scheduler) = seeded();

        // 02:00:30Z = 22:00:30 local: the location default arms now, the
        // override not yet.
        scheduler.tick(Utc.with_ymd_and_hms(2024, 3, 15, 2, 0, 30).unwrap()).unwrap();
        assert_eq!(store.get_area("a2").unwrap().unwrap().armed_state, ArmedState::ArmedAway);
        let a1 = store.get_area("a1").unwrap().unwrap();
        assert_eq!(a1.armed_state, ArmedState::Disarmed);

        // 03:30:30Z = 23:30:30 local: the override window opens.
        scheduler.tick(Utc.with_ymd_and_hms(2024, 3, 15, 3, 30, 30).unwrap()).unwrap();
        let a1 = store.get_area("a1").unwrap().unwrap();
        assert_eq!(a1.armed_state, ArmedState::ArmedAway);
        assert_eq!(a1.last_armed_state_change_reason.as_deref(), Some("schedule"));
    }

    #[test]
    fn test_scheduled_disarm() {
        let (store, scheduler) = seeded();
        scheduler.tick(Utc.with_ymd_and_hms(2024, 3, 15, 2, 0, 30).unwrap()).unwrap();
        assert_eq!(store.get_area("a2").unwrap().unwrap().armed_state, ArmedState::ArmedAway);

        // 10:00:30Z = 06:00:30 local: inside the disarm window.
        scheduler.tick(Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 30).unwrap()).unwrap();
        let a2 = store.get_area("a2").unwrap().unwrap();
        assert_eq!(a2.armed_state, ArmedState::Disarmed);
        assert_eq!(a2.last_armed_state_change_reason.as_deref(), Some("schedule"));
    }

    #[test]
    fn test_skip_suppresses_one_cycle() {
        let (store, scheduler) = seeded();
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 2, 0, 30).unwrap();
        store
            .update_area_armed_state(
                "a2",
                ArmedState::Disarmed,
                "user_action",
                None,
                None,
                Some(now + chrono::Duration::hours(1)),
            )
            .unwrap();

        scheduler.tick(now).unwrap();
        let a2 = store.get_area("a2").unwrap().unwrap();
        assert_eq!(a2.armed_state, ArmedState::Disarmed);
        // Display fields still refreshed while skipped
        assert!(a2.next_scheduled_arm_time.is_some());
        assert!(a2.next_scheduled_disarm_time.is_some());

        // Skip expired: the area arms on the next due tick
        scheduler.tick(now + chrono::Duration::hours(2)).unwrap();
        assert_eq!(store.get_area("a2").unwrap().unwrap().armed_state, ArmedState::ArmedAway);
    }

    #[test]
    fn test_triggered_area_never_disarmed_by_schedule() {
        let (store, scheduler) = seeded();
        store
            .update_area_armed_state("a2", ArmedState::Triggered, "automation_arm", None, None, None)
            .unwrap();
        scheduler.tick(Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 30).unwrap()).unwrap();
        assert_eq!(store.get_area("a2").unwrap().unwrap().armed_state, ArmedState::Triggered);
    }
}
