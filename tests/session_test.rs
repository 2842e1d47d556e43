//! Session lifecycle tests against a scripted radio adapter.

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use simple_ble_central::bluetooth::ble_constants::{uuid16, DATA_CHARACTERISTIC_UUID, SERVICE_UUID};
use simple_ble_central::bluetooth::{
    CentralSession, CharacteristicDescriptor, ErrorKind, LinkEvent, PeripheralId, Phase,
    RadioAdapter, RadioError, RadioState, ServiceDescriptor, SessionConfig, SessionError,
    SessionEvent, SessionHandle,
};

const WAIT: Duration = Duration::from_secs(5);
const FIRST: &str = "AA:BB:CC:DD:EE:01";

#[derive(Clone)]
struct Script {
    radio_states: Vec<RadioState>,
    advertisements: Vec<&'static str>,
    /// End the scan stream after the advertisements instead of idling.
    scan_ends: bool,
    services: Vec<Uuid>,
    characteristics: Vec<Uuid>,
    connect_fails: bool,
    subscribe_fails: bool,
    hang_discovery: bool,
    discovery_delay: Option<Duration>,
    reconnect_failures: usize,
    value: Vec<u8>,
    read_error: Option<RadioError>,
    write_error: Option<RadioError>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            radio_states: vec![RadioState::PoweredOn],
            advertisements: vec![FIRST],
            scan_ends: false,
            services: vec![SERVICE_UUID],
            characteristics: vec![DATA_CHARACTERISTIC_UUID],
            connect_fails: false,
            subscribe_fails: false,
            hang_discovery: false,
            discovery_delay: None,
            reconnect_failures: 0,
            value: b"hello".to_vec(),
            read_error: None,
            write_error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Calls {
    resets: usize,
    scans_started: usize,
    scans_stopped: usize,
    connects: Vec<PeripheralId>,
    reconnects: usize,
    service_discoveries: usize,
    characteristic_discoveries: usize,
    reads: usize,
    writes: Vec<Vec<u8>>,
    subscribes: usize,
    notification_streams: usize,
    unsubscribes: usize,
}

/// Adapter that replays a [`Script`] and echoes writes back on read.
struct StubRadio {
    script: Script,
    calls: Mutex<Calls>,
    value: Mutex<Vec<u8>>,
    reconnect_failures: Mutex<usize>,
    radio_tx: Mutex<Option<mpsc::UnboundedSender<RadioState>>>,
    link_tx: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl StubRadio {
    fn new(script: Script) -> Self {
        Self {
            reconnect_failures: Mutex::new(script.reconnect_failures),
            value: Mutex::new(script.value.clone()),
            script,
            calls: Mutex::new(Calls::default()),
            radio_tx: Mutex::new(None),
            link_tx: Mutex::new(None),
            notify_tx: Mutex::new(None),
        }
    }

    fn calls(&self) -> Calls {
        self.calls.lock().clone()
    }

    fn push_radio_state(&self, state: RadioState) {
        if let Some(tx) = self.radio_tx.lock().as_ref() {
            tx.send(state).unwrap();
        }
    }

    fn drop_link(&self) {
        if let Some(tx) = self.link_tx.lock().as_ref() {
            tx.send(LinkEvent::Disconnected).unwrap();
        }
    }

    fn push_notification(&self, value: &[u8]) {
        if let Some(tx) = self.notify_tx.lock().as_ref() {
            tx.send(value.to_vec()).unwrap();
        }
    }
}

fn open_ended<T: Send + 'static>(items: Vec<T>) -> BoxStream<'static, T> {
    stream::iter(items).chain(stream::pending()).boxed()
}

fn unbounded_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    UnboundedReceiverStream::new(rx).boxed()
}

impl RadioAdapter for StubRadio {
    fn observe_radio_state(&self) -> BoxStream<'static, RadioState> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.radio_tx.lock() = Some(tx);
        stream::iter(self.script.radio_states.clone())
            .chain(unbounded_stream(rx))
            .boxed()
    }

    fn reset(&self) -> BoxFuture<'static, Result<(), RadioError>> {
        self.calls.lock().resets += 1;
        future::ready(Ok(())).boxed()
    }

    fn start_scan(&self, _service: Uuid) -> BoxStream<'static, PeripheralId> {
        self.calls.lock().scans_started += 1;
        let found: Vec<PeripheralId> = self
            .script
            .advertisements
            .iter()
            .map(|id| PeripheralId::new(*id))
            .collect();
        if self.script.scan_ends {
            stream::iter(found).boxed()
        } else {
            open_ended(found)
        }
    }

    fn stop_scan(&self) {
        self.calls.lock().scans_stopped += 1;
    }

    fn connect(
        &self,
        peripheral: &PeripheralId,
        timeout: Duration,
        _capacity: usize,
    ) -> BoxStream<'static, LinkEvent> {
        self.calls.lock().connects.push(peripheral.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let first = if self.script.connect_fails {
            LinkEvent::Failed(RadioError::Timeout(timeout))
        } else {
            LinkEvent::Connected
        };
        tx.send(first).unwrap();
        *self.link_tx.lock() = Some(tx);
        unbounded_stream(rx)
    }

    fn reconnect(&self, _peripheral: &PeripheralId) -> BoxFuture<'static, Result<(), RadioError>> {
        self.calls.lock().reconnects += 1;
        let mut remaining = self.reconnect_failures.lock();
        if *remaining > 0 {
            *remaining -= 1;
            future::ready(Err(RadioError::NotConnected)).boxed()
        } else {
            future::ready(Ok(())).boxed()
        }
    }

    fn discover_services(
        &self,
        peripheral: &PeripheralId,
        _services: &[Uuid],
    ) -> BoxFuture<'static, Result<Vec<ServiceDescriptor>, RadioError>> {
        self.calls.lock().service_discoveries += 1;
        if self.script.hang_discovery {
            return future::pending().boxed();
        }
        let found = self
            .script
            .services
            .iter()
            .enumerate()
            .map(|(i, uuid)| ServiceDescriptor {
                peripheral: peripheral.clone(),
                id: i as u16,
                uuid: *uuid,
            })
            .collect();
        match self.script.discovery_delay {
            Some(delay) => tokio::time::sleep(delay).map(move |_| Ok(found)).boxed(),
            None => future::ready(Ok(found)).boxed(),
        }
    }

    fn discover_characteristics(
        &self,
        service: &ServiceDescriptor,
        _characteristics: &[Uuid],
    ) -> BoxFuture<'static, Result<Vec<CharacteristicDescriptor>, RadioError>> {
        self.calls.lock().characteristic_discoveries += 1;
        let found = self
            .script
            .characteristics
            .iter()
            .enumerate()
            .map(|(i, uuid)| CharacteristicDescriptor {
                peripheral: service.peripheral.clone(),
                service_id: service.id,
                id: 100 + i as u16,
                uuid: *uuid,
            })
            .collect();
        future::ready(Ok(found)).boxed()
    }

    fn read_characteristic(
        &self,
        _characteristic: &CharacteristicDescriptor,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<Vec<u8>, RadioError>> {
        self.calls.lock().reads += 1;
        let result = match &self.script.read_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.value.lock().clone()),
        };
        future::ready(result).boxed()
    }

    fn write_characteristic(
        &self,
        _characteristic: &CharacteristicDescriptor,
        value: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), RadioError>> {
        self.calls.lock().writes.push(value.clone());
        if let Some(e) = &self.script.write_error {
            return future::ready(Err(e.clone())).boxed();
        }
        *self.value.lock() = value;
        future::ready(Ok(())).boxed()
    }

    fn subscribe(
        &self,
        _characteristic: &CharacteristicDescriptor,
    ) -> BoxFuture<'static, Result<(), RadioError>> {
        self.calls.lock().subscribes += 1;
        if self.script.subscribe_fails {
            future::ready(Err(RadioError::Stack("notify rejected".to_string()))).boxed()
        } else {
            future::ready(Ok(())).boxed()
        }
    }

    fn receive_notifications(
        &self,
        _characteristic: &CharacteristicDescriptor,
        _capacity: usize,
    ) -> BoxStream<'static, Vec<u8>> {
        self.calls.lock().notification_streams += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notify_tx.lock() = Some(tx);
        unbounded_stream(rx)
    }

    fn unsubscribe(&self, _characteristic: &CharacteristicDescriptor) {
        self.calls.lock().unsubscribes += 1;
    }
}

struct Harness {
    radio: Arc<StubRadio>,
    handle: SessionHandle,
    events: mpsc::Receiver<SessionEvent>,
    task: JoinHandle<Phase>,
}

impl Harness {
    fn start(script: Script) -> Self {
        Self::start_with(script, SessionConfig::default())
    }

    fn start_with(script: Script, config: SessionConfig) -> Self {
        let radio = Arc::new(StubRadio::new(script));
        let (event_tx, events) = mpsc::channel(64);
        let (session, handle) = CentralSession::new(radio.clone(), config, event_tx);
        let task = tokio::spawn(session.run());
        Self {
            radio,
            handle,
            events,
            task,
        }
    }

    async fn wait_phase(&self, pred: impl FnMut(&Phase) -> bool) -> Phase {
        tokio::time::timeout(WAIT, self.handle.wait_for_phase(pred))
            .await
            .expect("phase not reached in time")
    }

    async fn wait_event(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            let event = tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("no event in time")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    /// Wait for the session to end and collect the events it left behind.
    async fn finish(mut self) -> (Phase, Vec<SessionEvent>, Calls) {
        let phase = tokio::time::timeout(WAIT, self.task)
            .await
            .expect("session did not finish")
            .expect("session task panicked");
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        (phase, events, self.radio.calls())
    }
}

fn is_status_starting(event: &SessionEvent, prefix: &str) -> bool {
    matches!(event, SessionEvent::StatusChanged(text) if text.starts_with(prefix))
}

fn count_status(events: &[SessionEvent], prefix: &str) -> usize {
    events.iter().filter(|e| is_status_starting(e, prefix)).count()
}

#[tokio::test]
async fn test_happy_path_reaches_ready() {
    let mut harness = Harness::start(Script::default());

    assert_eq!(harness.wait_phase(|p| *p == Phase::Ready).await, Phase::Ready);
    harness
        .wait_event(|e| *e == SessionEvent::CharacteristicReady)
        .await;
    let read = harness
        .wait_event(|e| matches!(e, SessionEvent::ValueRead(_)))
        .await;
    assert_eq!(read, SessionEvent::ValueRead(Ok("hello".to_string())));

    harness.handle.stop().await;
    let (phase, _, calls) = harness.finish().await;

    assert_eq!(phase, Phase::Stopped);
    assert_eq!(calls.scans_started, 1);
    assert_eq!(calls.scans_stopped, 1);
    assert_eq!(calls.connects, vec![PeripheralId::new(FIRST)]);
    assert_eq!(calls.subscribes, 1);
    assert_eq!(calls.notification_streams, 1);
    assert_eq!(calls.reads, 1);
    assert_eq!(calls.unsubscribes, 1);
}

#[tokio::test]
async fn test_status_lines_follow_lifecycle() {
    let mut harness = Harness::start(Script::default());
    harness.wait_phase(|p| *p == Phase::Ready).await;
    harness.handle.stop().await;
    let (_, events, _) = harness.finish().await;

    let statuses: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StatusChanged(text) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(statuses[0], "start scanning");
    assert_eq!(statuses[1], format!("Found peripheral {}. Trying to connect", FIRST));
    assert_eq!(
        statuses[2],
        format!(
            "Discovered service {}. Trying to discover characteristics",
            SERVICE_UUID
        )
    );
    assert_eq!(
        statuses[3],
        format!("Discovered characteristic {}", DATA_CHARACTERISTIC_UUID)
    );

    let ready_at = events
        .iter()
        .position(|e| *e == SessionEvent::CharacteristicReady)
        .unwrap();
    let read_at = events
        .iter()
        .position(|e| matches!(e, SessionEvent::ValueRead(_)))
        .unwrap();
    assert!(ready_at < read_at);
}

#[tokio::test]
async fn test_radio_never_on_means_no_scan() {
    for state in [
        RadioState::PoweredOff,
        RadioState::Unauthorized,
        RadioState::Unsupported,
        RadioState::Unknown,
    ] {
        let harness = Harness::start(Script {
            radio_states: vec![state],
            ..Default::default()
        });
        let (phase, events, calls) = harness.finish().await;

        assert_eq!(phase, Phase::Error(ErrorKind::RadioUnavailable));
        assert_eq!(calls.scans_started, 0);
        assert_eq!(calls.connects.len(), 0);
        assert_eq!(events.len(), 1);
        assert!(is_status_starting(&events[0], "radio unavailable"));
    }
}

#[tokio::test]
async fn test_powered_off_scenario() {
    let harness = Harness::start(Script {
        radio_states: vec![RadioState::PoweredOff],
        ..Default::default()
    });
    let (phase, events, calls) = harness.finish().await;

    assert_eq!(phase, Phase::Error(ErrorKind::RadioUnavailable));
    assert_eq!(calls.scans_started, 0);
    assert_eq!(
        events,
        vec![SessionEvent::StatusChanged(
            "radio unavailable: radio is powered off".to_string()
        )]
    );
}

#[tokio::test]
async fn test_resetting_resets_and_waits() {
    let harness = Harness::start(Script {
        radio_states: vec![RadioState::Resetting, RadioState::PoweredOn],
        ..Default::default()
    });
    harness.wait_phase(|p| *p == Phase::Ready).await;
    harness.handle.stop().await;
    let (_, _, calls) = harness.finish().await;

    assert_eq!(calls.resets, 1);
    assert_eq!(calls.scans_started, 1);
}

#[tokio::test]
async fn test_resetting_alone_never_scans() {
    let harness = Harness::start(Script {
        radio_states: vec![RadioState::Resetting],
        ..Default::default()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.handle.phase(), Phase::AwaitingRadio);

    harness.handle.stop().await;
    let (phase, _, calls) = harness.finish().await;
    assert_eq!(phase, Phase::Stopped);
    assert_eq!(calls.scans_started, 0);
    assert_eq!(calls.resets, 1);
}

#[tokio::test]
async fn test_only_first_peripheral_is_connected() {
    let harness = Harness::start(Script {
        advertisements: vec![FIRST, "AA:BB:CC:DD:EE:02", "AA:BB:CC:DD:EE:03"],
        ..Default::default()
    });
    harness.wait_phase(|p| *p == Phase::Ready).await;
    harness.handle.stop().await;
    let (_, _, calls) = harness.finish().await;

    assert_eq!(calls.connects, vec![PeripheralId::new(FIRST)]);
    assert_eq!(calls.scans_started, 1);
    assert_eq!(calls.scans_stopped, 1);
}

#[tokio::test]
async fn test_missing_service_fails() {
    let harness = Harness::start(Script {
        services: vec![uuid16(0x180f)],
        ..Default::default()
    });
    let (phase, events, calls) = harness.finish().await;

    assert_eq!(phase, Phase::Error(ErrorKind::ServiceNotFound));
    assert_eq!(calls.service_discoveries, 1);
    assert_eq!(calls.characteristic_discoveries, 0);
    assert_eq!(count_status(&events, "service not found"), 1);
    assert!(!events.contains(&SessionEvent::CharacteristicReady));
}

#[tokio::test]
async fn test_missing_characteristic_fails() {
    let harness = Harness::start(Script {
        characteristics: vec![uuid16(0xec0f)],
        ..Default::default()
    });
    let (phase, events, calls) = harness.finish().await;

    assert_eq!(phase, Phase::Error(ErrorKind::CharacteristicNotFound));
    assert_eq!(calls.subscribes, 0);
    assert_eq!(calls.unsubscribes, 0);
    assert_eq!(calls.reads, 0);
    assert_eq!(count_status(&events, "characteristic not found"), 1);
}

#[tokio::test]
async fn test_connect_failure_is_terminal() {
    let harness = Harness::start(Script {
        connect_fails: true,
        ..Default::default()
    });
    let (phase, events, calls) = harness.finish().await;

    assert_eq!(phase, Phase::Error(ErrorKind::ConnectFailed));
    assert_eq!(calls.connects.len(), 1);
    assert_eq!(calls.reconnects, 0);
    assert_eq!(calls.service_discoveries, 0);
    assert_eq!(count_status(&events, "connect failed"), 1);
}

#[tokio::test]
async fn test_subscribe_failure_is_terminal() {
    let harness = Harness::start(Script {
        subscribe_fails: true,
        ..Default::default()
    });
    let (phase, events, calls) = harness.finish().await;

    assert_eq!(phase, Phase::Error(ErrorKind::SubscribeFailed));
    assert_eq!(calls.notification_streams, 0);
    assert_eq!(calls.unsubscribes, 1);
    assert_eq!(count_status(&events, "subscribe failed"), 1);
}

#[tokio::test]
async fn test_discovery_timeout() {
    let harness = Harness::start_with(
        Script {
            hang_discovery: true,
            ..Default::default()
        },
        SessionConfig {
            discovery_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );
    let (phase, events, calls) = harness.finish().await;

    assert_eq!(phase, Phase::Error(ErrorKind::DiscoveryTimedOut));
    assert_eq!(calls.characteristic_discoveries, 0);
    assert_eq!(count_status(&events, "discovery timed out"), 1);
}

#[tokio::test]
async fn test_read_write_before_characteristic_are_noops() {
    let harness = Harness::start_with(
        Script {
            hang_discovery: true,
            ..Default::default()
        },
        SessionConfig {
            discovery_timeout: None,
            ..Default::default()
        },
    );
    harness
        .wait_phase(|p| *p == Phase::DiscoveringService)
        .await;

    harness.handle.request_read().await;
    harness.handle.request_write("ignored").await;
    harness.handle.stop().await;
    let (phase, events, calls) = harness.finish().await;

    assert_eq!(phase, Phase::Stopped);
    assert_eq!(calls.reads, 0);
    assert!(calls.writes.is_empty());
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::ValueRead(_) | SessionEvent::WriteResult(_))));
}

#[tokio::test]
async fn test_write_then_read_echoes() {
    let mut harness = Harness::start(Script::default());
    harness.wait_phase(|p| *p == Phase::Ready).await;
    harness
        .wait_event(|e| matches!(e, SessionEvent::ValueRead(_)))
        .await;

    harness.handle.request_write("héllo wörld").await;
    let written = harness
        .wait_event(|e| matches!(e, SessionEvent::WriteResult(_)))
        .await;
    assert_eq!(written, SessionEvent::WriteResult(Ok(())));

    harness.handle.request_read().await;
    let read = harness
        .wait_event(|e| matches!(e, SessionEvent::ValueRead(_)))
        .await;
    assert_eq!(read, SessionEvent::ValueRead(Ok("héllo wörld".to_string())));

    harness.handle.stop().await;
    let (_, _, calls) = harness.finish().await;
    assert_eq!(calls.writes, vec!["héllo wörld".as_bytes().to_vec()]);
}

#[tokio::test]
async fn test_notifications_are_decoded() {
    let mut harness = Harness::start(Script::default());
    harness.wait_phase(|p| *p == Phase::Ready).await;

    harness.radio.push_notification(b"tick");
    harness.radio.push_notification(&[0xff, 0xfe]);

    let first = harness
        .wait_event(|e| matches!(e, SessionEvent::ValueNotified(_)))
        .await;
    let second = harness
        .wait_event(|e| matches!(e, SessionEvent::ValueNotified(_)))
        .await;
    assert_eq!(first, SessionEvent::ValueNotified(Some("tick".to_string())));
    assert_eq!(second, SessionEvent::ValueNotified(None));
    assert_eq!(harness.handle.phase(), Phase::Ready);

    harness.handle.stop().await;
    harness.finish().await;
}

#[tokio::test]
async fn test_reconnect_cycles_skip_discovery() {
    let mut harness = Harness::start(Script::default());
    harness.wait_phase(|p| *p == Phase::Ready).await;

    for cycle in 1..=3 {
        harness.radio.drop_link();
        harness
            .wait_event(|e| is_status_starting(e, "Reconnected to"))
            .await;
        assert_eq!(harness.handle.phase(), Phase::Ready);
        assert_eq!(harness.radio.calls().reconnects, cycle);
    }

    harness.handle.stop().await;
    let (phase, _, calls) = harness.finish().await;

    assert_eq!(phase, Phase::Stopped);
    assert_eq!(calls.reconnects, 3);
    assert_eq!(calls.connects.len(), 1);
    assert_eq!(calls.service_discoveries, 1);
    assert_eq!(calls.characteristic_discoveries, 1);
}

#[tokio::test]
async fn test_reconnect_retries_until_success() {
    let mut harness = Harness::start_with(
        Script {
            reconnect_failures: 2,
            ..Default::default()
        },
        SessionConfig {
            reconnect_delay: Duration::from_millis(10),
            ..Default::default()
        },
    );
    harness.wait_phase(|p| *p == Phase::Ready).await;

    harness.radio.drop_link();
    harness
        .wait_event(|e| is_status_starting(e, "Reconnected to"))
        .await;

    harness.handle.stop().await;
    let (_, _, calls) = harness.finish().await;
    assert_eq!(calls.reconnects, 3);
    assert_eq!(calls.service_discoveries, 1);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let harness = Harness::start(Script::default());
    harness.wait_phase(|p| *p == Phase::Ready).await;

    let handle = harness.handle.clone();
    handle.stop().await;
    handle.stop().await;
    let (phase, events, _) = harness.finish().await;

    assert_eq!(phase, Phase::Stopped);
    assert_eq!(count_status(&events, "Session stopped"), 1);

    // The session is gone; further commands are dropped quietly.
    handle.stop().await;
    handle.request_read().await;
    assert_eq!(handle.phase(), Phase::Stopped);
}

#[tokio::test]
async fn test_stop_while_scanning_halts_scan() {
    let harness = Harness::start(Script {
        advertisements: vec![],
        ..Default::default()
    });
    harness.wait_phase(|p| *p == Phase::Scanning).await;

    harness.handle.stop().await;
    let (phase, _, calls) = harness.finish().await;

    assert_eq!(phase, Phase::Stopped);
    assert_eq!(calls.scans_started, 1);
    assert_eq!(calls.scans_stopped, 1);
    assert!(calls.connects.is_empty());
}

#[tokio::test]
async fn test_scan_ending_without_match_fails() {
    let harness = Harness::start(Script {
        advertisements: vec![],
        scan_ends: true,
        ..Default::default()
    });
    let (phase, events, calls) = harness.finish().await;

    assert_eq!(phase, Phase::Error(ErrorKind::RadioUnavailable));
    assert_eq!(calls.scans_started, 1);
    assert!(calls.connects.is_empty());
    assert_eq!(
        events,
        vec![
            SessionEvent::StatusChanged("start scanning".to_string()),
            SessionEvent::StatusChanged(
                "radio unavailable: scan ended before a peripheral was found".to_string()
            ),
        ]
    );
}

#[tokio::test]
async fn test_scan_ending_after_match_is_ignored() {
    let harness = Harness::start(Script {
        scan_ends: true,
        ..Default::default()
    });
    assert_eq!(harness.wait_phase(|p| *p == Phase::Ready).await, Phase::Ready);

    harness.handle.stop().await;
    let (phase, _, calls) = harness.finish().await;
    assert_eq!(phase, Phase::Stopped);
    assert_eq!(calls.connects, vec![PeripheralId::new(FIRST)]);
}

#[tokio::test]
async fn test_read_failure_keeps_phase() {
    let mut harness = Harness::start(Script {
        read_error: Some(RadioError::Timeout(Duration::from_secs(5))),
        ..Default::default()
    });
    harness.wait_phase(|p| *p == Phase::Ready).await;

    let expected = SessionEvent::ValueRead(Err(SessionError::new(
        ErrorKind::ReadFailed,
        "operation timed out after 5s",
    )));
    let initial = harness
        .wait_event(|e| matches!(e, SessionEvent::ValueRead(_)))
        .await;
    assert_eq!(initial, expected);

    harness.handle.request_read().await;
    let again = harness
        .wait_event(|e| matches!(e, SessionEvent::ValueRead(_)))
        .await;
    assert_eq!(again, expected);
    assert_eq!(harness.handle.phase(), Phase::Ready);

    harness.handle.stop().await;
    let (phase, _, calls) = harness.finish().await;
    assert_eq!(phase, Phase::Stopped);
    assert_eq!(calls.reads, 2);
}

#[tokio::test]
async fn test_write_failure_keeps_phase() {
    let mut harness = Harness::start(Script {
        write_error: Some(RadioError::NotConnected),
        ..Default::default()
    });
    harness.wait_phase(|p| *p == Phase::Ready).await;

    harness.handle.request_write("ping").await;
    let written = harness
        .wait_event(|e| matches!(e, SessionEvent::WriteResult(_)))
        .await;
    assert_eq!(
        written,
        SessionEvent::WriteResult(Err(SessionError::new(
            ErrorKind::WriteFailed,
            "link is not connected"
        )))
    );
    assert_eq!(harness.handle.phase(), Phase::Ready);

    harness.handle.stop().await;
    let (phase, _, calls) = harness.finish().await;
    assert_eq!(phase, Phase::Stopped);
    assert_eq!(calls.writes, vec![b"ping".to_vec()]);
}

#[tokio::test]
async fn test_undecodable_read_is_lossy() {
    let mut harness = Harness::start(Script {
        value: vec![b'o', b'k', 0xff],
        ..Default::default()
    });
    let read = harness
        .wait_event(|e| matches!(e, SessionEvent::ValueRead(_)))
        .await;
    assert_eq!(read, SessionEvent::ValueRead(Ok("ok\u{fffd}".to_string())));

    harness.handle.stop().await;
    harness.finish().await;
}

#[tokio::test]
async fn test_disconnect_during_setup_fails() {
    let harness = Harness::start_with(
        Script {
            hang_discovery: true,
            ..Default::default()
        },
        SessionConfig {
            discovery_timeout: None,
            ..Default::default()
        },
    );
    harness
        .wait_phase(|p| *p == Phase::DiscoveringService)
        .await;

    harness.radio.drop_link();
    let (phase, events, calls) = harness.finish().await;

    assert_eq!(phase, Phase::Error(ErrorKind::ConnectFailed));
    assert_eq!(calls.reconnects, 0);
    assert_eq!(calls.characteristic_discoveries, 0);
    assert_eq!(count_status(&events, "connect failed: link lost during setup"), 1);
}

#[tokio::test]
async fn test_powered_off_while_ready_fails() {
    let harness = Harness::start(Script::default());
    harness.wait_phase(|p| *p == Phase::Ready).await;

    harness.radio.push_radio_state(RadioState::PoweredOff);
    let (phase, events, calls) = harness.finish().await;

    assert_eq!(phase, Phase::Error(ErrorKind::RadioUnavailable));
    assert_eq!(calls.reconnects, 0);
    assert_eq!(calls.unsubscribes, 1);
    assert_eq!(count_status(&events, "radio unavailable"), 1);
}

#[tokio::test]
async fn test_late_discovery_result_is_dropped() {
    let harness = Harness::start_with(
        Script {
            discovery_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        },
        SessionConfig {
            discovery_timeout: None,
            ..Default::default()
        },
    );
    harness
        .wait_phase(|p| *p == Phase::DiscoveringService)
        .await;

    harness.handle.stop().await;
    let radio = harness.radio.clone();
    let (phase, events, _) = harness.finish().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(phase, Phase::Stopped);
    assert_eq!(radio.calls().service_discoveries, 1);
    assert_eq!(radio.calls().characteristic_discoveries, 0);
    assert_eq!(count_status(&events, "Discovered service"), 0);
}
