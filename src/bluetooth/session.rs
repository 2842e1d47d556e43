// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Central session: drives one scan → connect → discover → subscribe
//! lifecycle against a [`RadioAdapter`].
//!
//! Adapter futures and streams run in forwarding tasks that post their
//! results into a single input channel. Only the session loop mutates
//! session state.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ble_constants::{policy, DATA_CHARACTERISTIC_UUID, SERVICE_UUID};
use super::error::{ErrorKind, RadioError, SessionError};
use super::radio::{
    CharacteristicDescriptor, LinkEvent, LinkState, PeripheralHandle, PeripheralId,
    RadioAdapter, RadioState, ServiceDescriptor,
};

/// Buffered adapter results waiting for the session loop.
const INPUT_BUFFER: usize = 64;

/// Buffered user commands.
const COMMAND_BUFFER: usize = 16;

/// Session policy values.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// `None` waits for discovery indefinitely.
    pub discovery_timeout: Option<Duration>,
    pub connection_buffer: usize,
    pub notification_buffer: usize,
    pub reconnect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            characteristic_uuid: DATA_CHARACTERISTIC_UUID,
            connect_timeout: Duration::from_millis(policy::CONNECT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(policy::READ_TIMEOUT_MS),
            discovery_timeout: Some(Duration::from_millis(policy::DISCOVERY_TIMEOUT_MS)),
            connection_buffer: policy::CONNECTION_BUFFER,
            notification_buffer: policy::NOTIFICATION_BUFFER,
            reconnect_delay: Duration::from_millis(policy::RECONNECT_DELAY_MS),
        }
    }
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingRadio,
    Scanning,
    Connecting,
    DiscoveringService,
    DiscoveringCharacteristic,
    Subscribing,
    Ready,
    Reconnecting,
    Error(ErrorKind),
    Stopped,
}

impl Phase {
    /// No further transitions happen from a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Error(_) | Phase::Stopped)
    }

    /// Phases in which the target characteristic is known.
    pub fn has_characteristic(&self) -> bool {
        matches!(self, Phase::Subscribing | Phase::Ready | Phase::Reconnecting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::AwaitingRadio => "awaiting radio",
            Phase::Scanning => "scanning",
            Phase::Connecting => "connecting",
            Phase::DiscoveringService => "discovering service",
            Phase::DiscoveringCharacteristic => "discovering characteristic",
            Phase::Subscribing => "subscribing",
            Phase::Ready => "ready",
            Phase::Reconnecting => "reconnecting",
            Phase::Error(_) => "error",
            Phase::Stopped => "stopped",
        }
    }
}

/// Commands accepted from the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionCommand {
    Read,
    Write(String),
    Stop,
}

/// Events delivered to the observer, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Human-readable progress or failure.
    StatusChanged(String),
    /// Target characteristic discovered; read/write are now possible.
    CharacteristicReady,
    ValueRead(Result<String, SessionError>),
    /// Pushed value; `None` when the payload is not valid UTF-8.
    ValueNotified(Option<String>),
    WriteResult(Result<(), SessionError>),
}

/// Adapter results marshaled onto the session loop.
#[derive(Debug)]
enum Input {
    Radio(RadioState),
    ResetDone(Result<(), RadioError>),
    Discovered(PeripheralId),
    ScanEnded,
    Link(LinkEvent),
    Services(Result<Vec<ServiceDescriptor>, RadioError>),
    Characteristics(Result<Vec<CharacteristicDescriptor>, RadioError>),
    Subscribed(Result<(), RadioError>),
    Reconnected(Result<(), RadioError>),
    RetryReconnect,
    ReadDone(Result<Vec<u8>, RadioError>),
    WriteDone(Result<(), RadioError>),
    Notified(Vec<u8>),
}

/// Cloneable handle for driving a running [`CentralSession`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    phase: watch::Receiver<Phase>,
}

impl SessionHandle {
    /// Read the characteristic. No-op until it is known.
    pub async fn request_read(&self) {
        self.send(SessionCommand::Read).await;
    }

    /// Write `text` as UTF-8. No-op until the characteristic is known.
    pub async fn request_write(&self, text: impl Into<String>) {
        self.send(SessionCommand::Write(text.into())).await;
    }

    /// Stop the session. Safe to call repeatedly or after it ended.
    pub async fn stop(&self) {
        self.send(SessionCommand::Stop).await;
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver notified on every phase change.
    pub fn phase_changes(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    /// Wait until the phase satisfies `pred`. Returns the last phase if the
    /// session ends first.
    pub async fn wait_for_phase(&self, mut pred: impl FnMut(&Phase) -> bool) -> Phase {
        let mut rx = self.phase.clone();
        let phase = match rx.wait_for(|phase| pred(phase)).await {
            Ok(phase) => *phase,
            Err(_) => self.phase(),
        };
        phase
    }

    async fn send(&self, command: SessionCommand) {
        if self.commands.send(command).await.is_err() {
            debug!("Session already finished, command dropped");
        }
    }
}

/// State machine for a single central-role connection lifecycle.
pub struct CentralSession {
    adapter: Arc<dyn RadioAdapter>,
    config: SessionConfig,
    phase: Phase,
    peripheral: Option<PeripheralHandle>,
    characteristic: Option<CharacteristicDescriptor>,
    /// Characteristic a subscription was requested on; released on teardown.
    subscription: Option<CharacteristicDescriptor>,
    scan_task: Option<AbortHandle>,
    tasks: JoinSet<()>,
    input_tx: mpsc::Sender<Input>,
    input_rx: mpsc::Receiver<Input>,
    command_rx: mpsc::Receiver<SessionCommand>,
    commands_open: bool,
    phase_tx: watch::Sender<Phase>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl CentralSession {
    /// Create a session. Nothing touches the radio until [`run`](Self::run).
    pub fn new(
        adapter: Arc<dyn RadioAdapter>,
        config: SessionConfig,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> (Self, SessionHandle) {
        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (phase_tx, phase_rx) = watch::channel(Phase::AwaitingRadio);

        let session = Self {
            adapter,
            config,
            phase: Phase::AwaitingRadio,
            peripheral: None,
            characteristic: None,
            subscription: None,
            scan_task: None,
            tasks: JoinSet::new(),
            input_tx,
            input_rx,
            command_rx,
            commands_open: true,
            phase_tx,
            event_tx,
        };
        let handle = SessionHandle {
            commands: command_tx,
            phase: phase_rx,
        };
        (session, handle)
    }

    /// Drive the session until it reaches a terminal phase.
    pub async fn run(mut self) -> Phase {
        info!(
            "Central session started (service {}, characteristic {})",
            self.config.service_uuid, self.config.characteristic_uuid
        );

        let radio_states = self.adapter.observe_radio_state();
        self.spawn_stream(radio_states, Input::Radio, None);

        while !self.phase.is_terminal() {
            tokio::select! {
                biased;
                command = self.command_rx.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All session handles dropped");
                        self.commands_open = false;
                    }
                },
                Some(input) = self.input_rx.recv() => self.handle_input(input).await,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Adapter task panicked: {}", e);
                        }
                    }
                }
            }
        }

        self.release();
        info!("Central session finished: {:?}", self.phase);
        self.phase
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Read => self.issue_read(),
            SessionCommand::Write(text) => self.issue_write(text),
            SessionCommand::Stop => {
                if !self.phase.is_terminal() {
                    info!("Stop requested in phase {}", self.phase.as_str());
                    self.set_phase(Phase::Stopped);
                    self.status("Session stopped").await;
                }
            }
        }
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Radio(state) => self.on_radio_state(state).await,
            Input::ResetDone(result) => {
                if let Err(e) = result {
                    warn!("Radio reset failed: {}", e);
                }
            }
            Input::Discovered(id) => self.on_discovered(id).await,
            Input::ScanEnded => {
                if self.phase == Phase::Scanning {
                    self.scan_task = None;
                    self.fail(
                        ErrorKind::RadioUnavailable,
                        "scan ended before a peripheral was found",
                    )
                    .await;
                }
            }
            Input::Link(event) => self.on_link_event(event).await,
            Input::Services(result) => self.on_services(result).await,
            Input::Characteristics(result) => self.on_characteristics(result).await,
            Input::Subscribed(result) => self.on_subscribed(result).await,
            Input::Reconnected(result) => self.on_reconnected(result).await,
            Input::RetryReconnect => {
                if self.phase == Phase::Reconnecting {
                    self.issue_reconnect();
                }
            }
            Input::ReadDone(result) => {
                let value = result
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .map_err(|e| e.into_session(ErrorKind::ReadFailed));
                match &value {
                    Ok(text) => info!("Read value is {:?}", text),
                    Err(e) => warn!("Read error: {}", e),
                }
                self.emit(SessionEvent::ValueRead(value)).await;
            }
            Input::WriteDone(result) => {
                let result = result.map_err(|e| e.into_session(ErrorKind::WriteFailed));
                match &result {
                    Ok(()) => info!("Write succeeded"),
                    Err(e) => warn!("Write failed: {}", e),
                }
                self.emit(SessionEvent::WriteResult(result)).await;
            }
            Input::Notified(bytes) => {
                let value = String::from_utf8(bytes).ok();
                debug!("Notified value is {:?}", value);
                self.emit(SessionEvent::ValueNotified(value)).await;
            }
        }
    }

    async fn on_radio_state(&mut self, state: RadioState) {
        debug!("Radio state: {}", state.as_str());

        match state {
            RadioState::PoweredOn if self.phase == Phase::AwaitingRadio => {
                self.status("start scanning").await;
                self.set_phase(Phase::Scanning);
                let scan = self.adapter.start_scan(self.config.service_uuid);
                self.scan_task =
                    Some(self.spawn_stream(scan, Input::Discovered, Some(Input::ScanEnded)));
            }
            RadioState::Resetting => {
                self.status("Radio is resetting").await;
                let reset = self.adapter.reset();
                self.spawn_future(reset, Input::ResetDone);
            }
            RadioState::PoweredOff | RadioState::Unauthorized | RadioState::Unsupported => {
                self.fail(
                    ErrorKind::RadioUnavailable,
                    format!("radio is {}", state.as_str()),
                )
                .await;
            }
            RadioState::Unknown if self.phase == Phase::AwaitingRadio => {
                self.fail(ErrorKind::RadioUnavailable, "radio state is unknown")
                    .await;
            }
            _ => debug!(
                "Ignoring radio state {} in phase {}",
                state.as_str(),
                self.phase.as_str()
            ),
        }
    }

    async fn on_discovered(&mut self, id: PeripheralId) {
        if self.phase != Phase::Scanning {
            debug!("Ignoring peripheral {} found after scan", id);
            return;
        }

        self.stop_scan();

        let mut handle = PeripheralHandle::new(id.clone());
        handle.link = LinkState::Connecting;
        self.peripheral = Some(handle);

        self.status(format!("Found peripheral {}. Trying to connect", id))
            .await;
        self.set_phase(Phase::Connecting);

        let link = self.adapter.connect(
            &id,
            self.config.connect_timeout,
            self.config.connection_buffer,
        );
        self.spawn_stream(link, Input::Link, None);
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match (event, self.phase) {
            (LinkEvent::Connected, Phase::Connecting) => {
                let Some(id) = self.peripheral_id() else {
                    return;
                };
                info!("Connected to {}", id);
                self.set_link(LinkState::Connected);
                self.set_link(LinkState::Discovering);
                self.set_phase(Phase::DiscoveringService);

                let discovery = self
                    .adapter
                    .discover_services(&id, &[self.config.service_uuid]);
                let discovery = self.with_discovery_timeout(discovery);
                self.spawn_future(discovery, Input::Services);
            }
            (LinkEvent::Failed(e), Phase::Connecting) => {
                self.fail(ErrorKind::ConnectFailed, e.to_string()).await;
            }
            (LinkEvent::Disconnected, Phase::Ready) => {
                let Some(id) = self.peripheral_id() else {
                    return;
                };
                self.set_link(LinkState::Disconnected);
                self.status(format!("Disconnected from {}. Reconnecting", id))
                    .await;
                self.set_phase(Phase::Reconnecting);
                self.issue_reconnect();
            }
            (
                LinkEvent::Disconnected,
                Phase::Connecting
                | Phase::DiscoveringService
                | Phase::DiscoveringCharacteristic
                | Phase::Subscribing,
            ) => {
                self.fail(ErrorKind::ConnectFailed, "link lost during setup")
                    .await;
            }
            (event, phase) => debug!("Ignoring link event {:?} in phase {}", event, phase.as_str()),
        }
    }

    async fn on_services(&mut self, result: Result<Vec<ServiceDescriptor>, RadioError>) {
        if self.phase != Phase::DiscoveringService {
            debug!("Ignoring service discovery result in phase {}", self.phase.as_str());
            return;
        }

        let services = match result {
            Ok(services) => services,
            Err(RadioError::Timeout(limit)) => {
                self.fail(
                    ErrorKind::DiscoveryTimedOut,
                    format!("service discovery did not finish within {:?}", limit),
                )
                .await;
                return;
            }
            Err(e) => {
                self.fail(ErrorKind::ServiceNotFound, e.to_string()).await;
                return;
            }
        };

        let target = self.config.service_uuid;
        let Some(service) = services.into_iter().find(|s| s.uuid == target) else {
            self.fail(
                ErrorKind::ServiceNotFound,
                format!("service {} not found", target),
            )
            .await;
            return;
        };

        self.status(format!(
            "Discovered service {}. Trying to discover characteristics",
            service.uuid
        ))
        .await;
        self.set_phase(Phase::DiscoveringCharacteristic);

        let discovery = self
            .adapter
            .discover_characteristics(&service, &[self.config.characteristic_uuid]);
        let discovery = self.with_discovery_timeout(discovery);
        self.spawn_future(discovery, Input::Characteristics);
    }

    async fn on_characteristics(
        &mut self,
        result: Result<Vec<CharacteristicDescriptor>, RadioError>,
    ) {
        if self.phase != Phase::DiscoveringCharacteristic {
            debug!(
                "Ignoring characteristic discovery result in phase {}",
                self.phase.as_str()
            );
            return;
        }

        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(RadioError::Timeout(limit)) => {
                self.fail(
                    ErrorKind::DiscoveryTimedOut,
                    format!("characteristic discovery did not finish within {:?}", limit),
                )
                .await;
                return;
            }
            Err(e) => {
                self.fail(ErrorKind::CharacteristicNotFound, e.to_string())
                    .await;
                return;
            }
        };

        let target = self.config.characteristic_uuid;
        let Some(characteristic) = characteristics.into_iter().find(|c| c.uuid == target) else {
            self.fail(
                ErrorKind::CharacteristicNotFound,
                format!("characteristic {} not found", target),
            )
            .await;
            return;
        };

        self.status(format!("Discovered characteristic {}", characteristic.uuid))
            .await;
        let subscribe = self.adapter.subscribe(&characteristic);
        self.subscription = Some(characteristic.clone());
        self.characteristic = Some(characteristic);
        self.set_phase(Phase::Subscribing);
        self.emit(SessionEvent::CharacteristicReady).await;

        // Read and subscribe race; their results are independent inputs.
        self.issue_read();
        self.spawn_future(subscribe, Input::Subscribed);
    }

    async fn on_subscribed(&mut self, result: Result<(), RadioError>) {
        if self.phase != Phase::Subscribing {
            debug!("Ignoring subscribe result in phase {}", self.phase.as_str());
            return;
        }

        if let Err(e) = result {
            self.fail(ErrorKind::SubscribeFailed, e.to_string()).await;
            return;
        }
        let Some(characteristic) = self.characteristic.clone() else {
            return;
        };

        self.set_link(LinkState::Ready);
        self.set_phase(Phase::Ready);
        self.status("Notifications enabled").await;

        let notifications = self
            .adapter
            .receive_notifications(&characteristic, self.config.notification_buffer);
        self.spawn_stream(notifications, Input::Notified, None);
    }

    async fn on_reconnected(&mut self, result: Result<(), RadioError>) {
        if self.phase != Phase::Reconnecting {
            debug!("Ignoring reconnect result in phase {}", self.phase.as_str());
            return;
        }

        match result {
            Ok(()) => {
                self.set_link(LinkState::Connected);
                self.set_link(LinkState::Ready);
                self.set_phase(Phase::Ready);
                if let Some(id) = self.peripheral_id() {
                    self.status(format!("Reconnected to {}", id)).await;
                }
            }
            Err(e) => {
                warn!(
                    "Reconnect failed: {}, retrying in {:?}",
                    e, self.config.reconnect_delay
                );
                let delay = self.config.reconnect_delay;
                self.spawn_future(tokio::time::sleep(delay).boxed(), |_| {
                    Input::RetryReconnect
                });
            }
        }
    }

    fn issue_read(&mut self) {
        let Some(characteristic) = &self.characteristic else {
            debug!("Read requested before characteristic is known");
            return;
        };
        let read = self
            .adapter
            .read_characteristic(characteristic, self.config.read_timeout);
        self.spawn_future(read, Input::ReadDone);
    }

    fn issue_write(&mut self, text: String) {
        let Some(characteristic) = &self.characteristic else {
            debug!("Write requested before characteristic is known");
            return;
        };
        debug!("Writing {} bytes", text.len());
        let write = self
            .adapter
            .write_characteristic(characteristic, text.into_bytes());
        self.spawn_future(write, Input::WriteDone);
    }

    fn issue_reconnect(&mut self) {
        let Some(id) = self.peripheral_id() else {
            return;
        };
        info!("Reconnecting to {}", id);
        self.set_link(LinkState::Connecting);
        let reconnect = self.adapter.reconnect(&id);
        self.spawn_future(reconnect, Input::Reconnected);
    }

    fn stop_scan(&mut self) {
        if let Some(scan) = self.scan_task.take() {
            info!("Stopping scan");
            self.adapter.stop_scan();
            scan.abort();
        }
    }

    /// Halt the scan and drop every adapter stream.
    fn release(&mut self) {
        self.stop_scan();
        self.tasks.abort_all();
        if let Some(characteristic) = self.subscription.take() {
            self.adapter.unsubscribe(&characteristic);
        }
        if let Some(peripheral) = self.peripheral.as_mut() {
            peripheral.link = LinkState::Disconnected;
        }
    }

    async fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        let err = SessionError::new(kind, message);
        error!("Session failed in phase {}: {}", self.phase.as_str(), err);
        self.set_phase(Phase::Error(kind));
        self.status(err.to_string()).await;
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        debug!("Phase {} -> {}", self.phase.as_str(), phase.as_str());
        self.phase = phase;
        if !phase.has_characteristic() {
            self.characteristic = None;
        }
        self.phase_tx.send_replace(phase);
    }

    fn set_link(&mut self, link: LinkState) {
        if let Some(peripheral) = self.peripheral.as_mut() {
            if peripheral.link != link {
                debug!("{} link {:?} -> {:?}", peripheral.id, peripheral.link, link);
                peripheral.link = link;
            }
        }
    }

    fn peripheral_id(&self) -> Option<PeripheralId> {
        self.peripheral.as_ref().map(|p| p.id.clone())
    }

    async fn status(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{}", text);
        self.emit(SessionEvent::StatusChanged(text)).await;
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event).await;
    }

    fn with_discovery_timeout<T: Send + 'static>(
        &self,
        discovery: BoxFuture<'static, Result<T, RadioError>>,
    ) -> BoxFuture<'static, Result<T, RadioError>> {
        match self.config.discovery_timeout {
            Some(limit) => async move {
                tokio::time::timeout(limit, discovery)
                    .await
                    .unwrap_or(Err(RadioError::Timeout(limit)))
            }
            .boxed(),
            None => discovery,
        }
    }

    fn spawn_future<T, F>(&mut self, future: BoxFuture<'static, T>, wrap: F) -> AbortHandle
    where
        T: Send + 'static,
        F: FnOnce(T) -> Input + Send + 'static,
    {
        let input_tx = self.input_tx.clone();
        self.tasks.spawn(async move {
            let _ = input_tx.send(wrap(future.await)).await;
        })
    }

    /// Forward every stream item, then `end` once the stream runs dry.
    fn spawn_stream<T, F>(
        &mut self,
        mut stream: BoxStream<'static, T>,
        wrap: F,
        end: Option<Input>,
    ) -> AbortHandle
    where
        T: Send + 'static,
        F: Fn(T) -> Input + Send + 'static,
    {
        let input_tx = self.input_tx.clone();
        self.tasks.spawn(async move {
            while let Some(item) = stream.next().await {
                if input_tx.send(wrap(item)).await.is_err() {
                    return;
                }
            }
            if let Some(end) = end {
                let _ = input_tx.send(end).await;
            }
        })
    }
}
