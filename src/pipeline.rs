use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::arming::{is_alarm_state, ArmingService, INTERNAL_CONNECTOR_ID};
use crate::automations::AutomationEngine;
use crate::model::{ArmedState, Device, StandardizedEvent};
use crate::store::{OrgGateway, Store};

/// Inbound queue depth; overflow drops the oldest frames.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
/// Re-deliveries of the same event inside this window are suppressed.
const DEDUP_WINDOW_SECS: i64 = 5;

/// Cheap handle session workers use to push parsed frames into the
/// pipeline. The submit never blocks: the underlying ring drops the
/// oldest entries when the consumer lags.
#[derive(Clone)]
pub struct EventSubmitter {
    tx: broadcast::Sender<Vec<StandardizedEvent>>,
}

impl EventSubmitter {
    /// Create the inbound ring. Built before the pipeline itself so the
    /// arming service can feed its state changes back in.
    pub fn new(queue_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(queue_capacity.max(1));
        Self { tx }
    }

    /// Submit one frame's worth of events, preserving their order.
    pub fn submit(&self, events: Vec<StandardizedEvent>) {
        if events.is_empty() {
            return;
        }
        if self.tx.send(events).is_err() {
            warn!("Event pipeline is not running; frame dropped");
        }
    }

    /// A submitter with no pipeline behind it, for contexts that only
    /// need the interface.
    pub fn disconnected() -> Self {
        Self::new(8)
    }
}

/// Sliding-window duplicate suppression over `event_id` and the
/// `(connector, device, timestamp, type)` idempotency key.
struct DedupWindow {
    seen: HashMap<String, DateTime<Utc>>,
}

impl DedupWindow {
    fn new() -> Self {
        Self { seen: HashMap::new() }
    }

    /// Record the event; returns true when it was already seen inside
    /// the window.
    fn observe(&mut self, event: &StandardizedEvent, now: DateTime<Utc>) -> bool {
        let horizon = now - Duration::seconds(DEDUP_WINDOW_SECS);
        self.seen.retain(|_, at| *at >= horizon);

        let id_key = event.event_id.to_string();
        let idem_key = event.idempotency_key();
        let duplicate = self.seen.contains_key(&id_key) || self.seen.contains_key(&idem_key);
        self.seen.insert(id_key, now);
        self.seen.insert(idem_key, now);
        duplicate
    }
}

/// Receives parsed events, persists them, maintains device state, fans
/// out to tenant subscribers, and dispatches the automation engine.
pub struct EventPipeline {
    store: Arc<Store>,
    engine: Arc<AutomationEngine>,
    arming: Arc<ArmingService>,
    inbound_tx: broadcast::Sender<Vec<StandardizedEvent>>,
    /// Subscribed at construction so frames submitted before the
    /// consumer task first polls are buffered, not lost.
    inbound_rx: Mutex<Option<broadcast::Receiver<Vec<StandardizedEvent>>>>,
    subscribers: Mutex<HashMap<String, broadcast::Sender<StandardizedEvent>>>,
    dropped_frames: AtomicU64,
    dedup: Mutex<DedupWindow>,
}

impl EventPipeline {
    pub fn new(
        store: Arc<Store>,
        engine: Arc<AutomationEngine>,
        arming: Arc<ArmingService>,
        submitter: EventSubmitter,
    ) -> Arc<Self> {
        let inbound_rx = submitter.tx.subscribe();
        Arc::new(Self {
            store,
            engine,
            arming,
            inbound_tx: submitter.tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            subscribers: Mutex::new(HashMap::new()),
            dropped_frames: AtomicU64::new(0),
            dedup: Mutex::new(DedupWindow::new()),
        })
    }

    pub fn submitter(&self) -> EventSubmitter {
        EventSubmitter { tx: self.inbound_tx.clone() }
    }

    /// In-process tenant subscription (UI streams, counters).
    pub fn subscribe(&self, organization_id: &str) -> broadcast::Receiver<StandardizedEvent> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers
            .entry(organization_id.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    /// Frames dropped to backpressure since startup.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Consumer loop; run as one task for the process lifetime.
    pub async fn run(self: Arc<Self>) {
        let taken = self.inbound_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut rx) = taken else {
            error!("Event pipeline consumer is already running");
            return;
        };
        loop {
            match rx.recv().await {
                Ok(batch) => self.process_frame(batch).await,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    self.dropped_frames.fetch_add(count, Ordering::Relaxed);
                    warn!(dropped = count, "Event queue overflowed; oldest frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Process one frame's events in order. Only the first event of a
    /// frame refreshes the device's cached display state.
    pub async fn process_frame(&self, batch: Vec<StandardizedEvent>) {
        let mut first = true;
        for event in batch {
            self.process_event(event, first).await;
            first = false;
        }
    }

    async fn process_event(&self, event: StandardizedEvent, refresh_state_cache: bool) {
        {
            let mut dedup = self.dedup.lock().unwrap_or_else(|e| e.into_inner());
            if dedup.observe(&event, Utc::now()) {
                debug!(event = %event.event_id, "Duplicate event suppressed");
                return;
            }
        }

        let gateway = OrgGateway::new(self.store.clone(), event.organization_id.clone());

        // Persistence is idempotent on event_id; an already-present row
        // means a replay from before the dedup window and stops the
        // fan-out too. A write failure does not block downstream.
        match gateway.insert_event(&event) {
            Ok(true) => {}
            Ok(false) => {
                debug!(event = %event.event_id, "Event already persisted; fan-out suppressed");
                return;
            }
            Err(e) => {
                error!(event = %event.event_id, error = %e, "Event could not be persisted");
            }
        }

        let device = if event.connector_id == INTERNAL_CONNECTOR_ID {
            None
        } else {
            self.update_device(&gateway, &event, refresh_state_cache)
        };

        self.check_area_trigger(&gateway, &event, device.as_ref());

        {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = subscribers.get(&event.organization_id) {
                let _ = tx.send(event.clone());
            }
        }

        // Fire-and-forget; the engine owns its own concurrency.
        tokio::spawn(self.engine.clone().dispatch_event(event));
    }

    /// Last-seen bookkeeping, with auto-registration of devices first
    /// seen through their events.
    fn update_device(
        &self,
        gateway: &OrgGateway,
        event: &StandardizedEvent,
        refresh_state_cache: bool,
    ) -> Option<Device> {
        let existing = match gateway.device_by_external_id(&event.connector_id, &event.device_id) {
            Ok(existing) => existing,
            Err(e) => {
                warn!(error = %e, "Device lookup failed");
                return None;
            }
        };
        let device = match existing {
            Some(device) => device,
            None => {
                let info = event.device_info.as_ref()?;
                let candidate = Device {
                    id: Uuid::new_v4().to_string(),
                    connector_id: event.connector_id.clone(),
                    external_id: event.device_id.clone(),
                    name: event.device_id.clone(),
                    device_type: info.device_type.clone(),
                    subtype: info.subtype.clone(),
                    vendor: None,
                    model: None,
                    status: None,
                    battery_percentage: None,
                    last_seen: None,
                    display_state: None,
                };
                match gateway.upsert_device(&candidate) {
                    Ok(device) => {
                        debug!(device = %device.external_id, "Device auto-registered from event");
                        device
                    }
                    Err(e) => {
                        warn!(error = %e, "Device auto-registration failed");
                        return None;
                    }
                }
            }
        };

        let display_state = if refresh_state_cache { event.payload.display_state } else { None };
        if let Err(e) = gateway.touch_device(
            &device.id,
            event.timestamp,
            display_state,
            event.payload.battery_percentage,
        ) {
            warn!(device = %device.id, error = %e, "Device state update failed");
        }
        Some(device)
    }

    /// An alarm-grade state on a device inside an armed area trips the
    /// area.
    fn check_area_trigger(
        &self,
        gateway: &OrgGateway,
        event: &StandardizedEvent,
        device: Option<&Device>,
    ) {
        let Some(display_state) = event.payload.display_state else {
            return;
        };
        if !is_alarm_state(display_state) {
            return;
        }
        let Some(device) = device else {
            return;
        };
        let area = match gateway.area_for_device(&device.id) {
            Ok(Some(area)) => area,
            _ => return,
        };
        if !matches!(area.armed_state, ArmedState::ArmedAway | ArmedState::ArmedStay) {
            return;
        }
        match self.arming.trigger(gateway, &area.id) {
            Ok(_) => {
                warn!(area = %area.id, device = %device.external_id, state = %display_state, "Armed area triggered");
            }
            Err(e) => {
                error!(area = %area.id, error = %e, "Area trigger transition failed");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::automations::{ActionError, ActionSink, ResolvedAction};
    use crate::model::{
        Area, Connector, ConnectorCategory, DeviceType, DisplayState, EventKind,
    };
    use crate::store::EventQuery;
    use futures::future::BoxFuture;
    use futures::FutureExt;

    struct NullSink;
    impl ActionSink for NullSink {
        fn execute<'a>(
            &'a self,
            _gateway: &'a OrgGateway,
            _action: &'a ResolvedAction,
        ) -> BoxFuture<'a, Result<(), ActionError>> {
            async { Ok(()) }.boxed()
        }
    }

    fn pipeline() -> (Arc<Store>, Arc<EventPipeline>) {
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
        let engine = Arc::new(AutomationEngine::new(
            store.clone(),
            Arc::new(NullSink),
            crate::automations::DEFAULT_ORG_CONCURRENCY,
        ));
        let submitter = EventSubmitter::new(DEFAULT_QUEUE_CAPACITY);
        let arming = Arc::new(ArmingService::new(store.clone(), submitter.clone()));
        let pipeline = EventPipeline::new(store.clone(), engine, arming, submitter);
        (store, pipeline)
    }

    fn door_frame(store: &Store, state: &str, time: i64) -> Vec<StandardizedEvent> {
        let connector = store.get_connector("c1").unwrap().unwrap();
        crate::drivers::hub::parser::parse(
            &connector,
            "hub/home-1/tok/report",
            format!(
                r#"{{"event":"contact.report","time":{},"deviceId":"abc","data":{{"state":"{}","battery":4}}}}"#,
                time, state
            )
            .as_bytes(),
        )
    }

    #[tokio::test]
    async fn test_persists_and_registers_device() {
        let (store, pipeline) = pipeline();
        pipeline.process_frame(door_frame(&store, "open", 1_700_000_000_000)).await;

        let events = store.query_events("o1", &EventQuery::default()).unwrap();
        assert_eq!(events.len(), 2); // state change + battery

        let device = store.find_device("c1", "abc").unwrap().unwrap();
        assert_eq!(device.device_type, DeviceType::DoorSensor);
        assert_eq!(device.display_state, Some(DisplayState::Open));
        assert_eq!(device.battery_percentage, Some(100));
        assert!(device.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_redelivery_is_suppressed() {
        let (store, pipeline) = pipeline();
        let frame = door_frame(&store, "open", 1_700_000_000_000);
        pipeline.process_frame(frame.clone()).await;
        pipeline.process_frame(frame).await;

        let events = store.query_events("o1", &EventQuery::default()).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_first_event_of_frame_wins_state_cache() {
        let (store, pipeline) = pipeline();
        let connector = store.get_connector("c1").unwrap().unwrap();
        // A hand-built frame whose second event carries a different
        // display state; only the first may touch the cache.
        let mut batch = crate::drivers::hub::parser::parse(
            &connector,
            "t",
            br#"{"event":"contact.report","time":1700000000000,"deviceId":"abc","data":{"state":"open"}}"#,
        );
        let mut second = batch[0].clone();
        second.event_id = Uuid::new_v4();
        second.kind = EventKind::StateChanged;
        second.payload.display_state = Some(DisplayState::Closed);
        second.timestamp = second.timestamp + Duration::seconds(1);
        batch.push(second);

        pipeline.process_frame(batch).await;
        let device = store.find_device("c1", "abc").unwrap().unwrap();
        assert_eq!(device.display_state, Some(DisplayState::Open));
    }

    #[tokio::test]
    async fn test_fanout_reaches_org_subscribers_only() {
        let (store, pipeline) = pipeline();
        let mut ours = pipeline.subscribe("o1");
        let mut theirs = pipeline.subscribe("o2");

        pipeline.process_frame(door_frame(&store, "open", 1_700_000_000_000)).await;

        let received = ours.try_recv().unwrap();
        assert_eq!(received.organization_id, "o1");
        assert!(theirs.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_armed_area_trips_on_alarm_state() {
        let (store, pipeline) = pipeline();
        // Register the device, then arm its area
        pipeline.process_frame(door_frame(&store, "closed", 1_700_000_000_000)).await;
        let device = store.find_device("c1", "abc").unwrap().unwrap();
        store
            .insert_area(&Area {
                id: "a1".into(),
                organization_id: "o1".into(),
                location_id: None,
                name: "Entry".into(),
                armed_state: ArmedState::ArmedAway,
                override_arming_schedule_id: None,
                last_armed_state_change_reason: None,
                next_scheduled_arm_time: None,
                next_scheduled_disarm_time: None,
                is_arming_skipped_until: None,
            })
            .unwrap();
        store.assign_device_to_area("a1", &device.id).unwrap();

        pipeline.process_frame(door_frame(&store, "open", 1_700_000_060_000)).await;
        assert_eq!(store.get_area("a1").unwrap().unwrap().armed_state, ArmedState::Triggered);
    }

    #[tokio::test]
    async fn test_submitter_feeds_run_loop() {
        let (store, pipeline) = pipeline();
        let submitter = pipeline.submitter();
        let mut subscriber = pipeline.subscribe("o1");
        let runner = tokio::spawn(pipeline.clone().run());

        submitter.submit(door_frame(&store, "open", 1_700_000_000_000));
        let received =
            tokio::time::timeout(std::time::Duration::from_secs(1), subscriber.recv())
                .await
                .expect("fan-out within a second")
                .unwrap();
        assert_eq!(received.device_id, "abc");
        runner.abort();
    }
}
