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

//! BlueZ radio adapter built on `bluer`.

use anyhow::Result;
use bluer::gatt::remote::Characteristic;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport,
};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::RadioError;
use super::radio::{
    CharacteristicDescriptor, LinkEvent, PeripheralId, RadioAdapter, RadioState,
    ServiceDescriptor,
};

/// Buffered radio state changes and scan results.
const STREAM_BUFFER: usize = 16;

/// Pause before re-opening a notification stream that ended.
const NOTIFY_RETRY: Duration = Duration::from_secs(1);

type NotifyStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Radio adapter backed by a local BlueZ controller.
pub struct BluezRadio {
    adapter: Adapter,
    scan: Mutex<Option<AbortHandle>>,
    /// Streams opened by `subscribe`, handed over to `receive_notifications`.
    subscriptions: Arc<Mutex<HashMap<CharacteristicDescriptor, NotifyStream>>>,
}

impl BluezRadio {
    /// Open a BlueZ session and pick the named (or default) adapter.
    pub async fn new(adapter_name: Option<&str>, power_on: bool) -> Result<Self> {
        info!("Initializing BLE central...");

        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        if power_on && !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        Ok(Self {
            adapter,
            scan: Mutex::new(None),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    fn device(&self, peripheral: &PeripheralId) -> Result<Device, RadioError> {
        device(&self.adapter, peripheral)
    }
}

impl RadioAdapter for BluezRadio {
    fn observe_radio_state(&self) -> BoxStream<'static, RadioState> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let adapter = self.adapter.clone();

        tokio::spawn(async move {
            let initial = match adapter.is_powered().await {
                Ok(true) => RadioState::PoweredOn,
                Ok(false) => RadioState::PoweredOff,
                Err(e) => {
                    warn!("Failed to query adapter power: {}", e);
                    RadioState::Unknown
                }
            };
            if tx.send(initial).await.is_err() {
                return;
            }

            let events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to watch adapter events: {}", e);
                    return;
                }
            };
            futures::pin_mut!(events);

            loop {
                let event = tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => event,
                };
                let Some(event) = event else {
                    break;
                };
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    let state = if powered {
                        RadioState::PoweredOn
                    } else {
                        RadioState::PoweredOff
                    };
                    if tx.send(state).await.is_err() {
                        break;
                    }
                }
            }
            debug!("Radio state watch ended");
        });

        ReceiverStream::new(rx).boxed()
    }

    fn reset(&self) -> BoxFuture<'static, Result<(), RadioError>> {
        let adapter = self.adapter.clone();
        async move {
            info!("Power cycling adapter {}", adapter.name());
            adapter.set_powered(false).await?;
            adapter.set_powered(true).await?;
            Ok(())
        }
        .boxed()
    }

    fn start_scan(&self, service: Uuid) -> BoxStream<'static, PeripheralId> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let adapter = self.adapter.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = scan_devices(adapter, service, tx).await {
                error!("Scan failed: {}", e);
            }
        });
        if let Some(previous) = self.scan.lock().replace(task.abort_handle()) {
            previous.abort();
        }

        ReceiverStream::new(rx).boxed()
    }

    fn stop_scan(&self) {
        // Dropping the discovery stream ends the BlueZ discovery session.
        if let Some(scan) = self.scan.lock().take() {
            scan.abort();
            info!("Scan stopped");
        }
    }

    fn connect(
        &self,
        peripheral: &PeripheralId,
        timeout: Duration,
        capacity: usize,
    ) -> BoxStream<'static, LinkEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let device = self.device(peripheral);

        tokio::spawn(async move {
            let device = match device {
                Ok(device) => device,
                Err(e) => {
                    let _ = tx.send(LinkEvent::Failed(e)).await;
                    return;
                }
            };

            // Subscribe before connecting so no link change is missed.
            let events = match device.events().await {
                Ok(events) => events,
                Err(e) => {
                    let _ = tx.send(LinkEvent::Failed(e.into())).await;
                    return;
                }
            };

            info!("Connecting to {}", device.address());
            let attempt = tokio::select! {
                _ = tx.closed() => return,
                attempt = tokio::time::timeout(timeout, device.connect()) => attempt,
            };
            let outcome = match attempt {
                Ok(Ok(())) => LinkEvent::Connected,
                Ok(Err(e)) => LinkEvent::Failed(e.into()),
                Err(_) => LinkEvent::Failed(RadioError::Timeout(timeout)),
            };
            let connected = outcome == LinkEvent::Connected;
            if tx.send(outcome).await.is_err() || !connected {
                return;
            }

            futures::pin_mut!(events);
            loop {
                let event = tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => event,
                };
                let Some(event) = event else {
                    break;
                };
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event {
                    debug!("{} connected: {}", device.address(), connected);
                    let link = if connected {
                        LinkEvent::Connected
                    } else {
                        LinkEvent::Disconnected
                    };
                    if tx.send(link).await.is_err() {
                        break;
                    }
                }
            }
            debug!("Stopped watching {}", device.address());
        });

        ReceiverStream::new(rx).boxed()
    }

    fn reconnect(&self, peripheral: &PeripheralId) -> BoxFuture<'static, Result<(), RadioError>> {
        let device = self.device(peripheral);
        async move {
            let device = device?;
            device.connect().await?;
            Ok(())
        }
        .boxed()
    }

    fn discover_services(
        &self,
        peripheral: &PeripheralId,
        services: &[Uuid],
    ) -> BoxFuture<'static, Result<Vec<ServiceDescriptor>, RadioError>> {
        let device = self.device(peripheral);
        let peripheral = peripheral.clone();
        let wanted: HashSet<Uuid> = services.iter().copied().collect();

        async move {
            let device = device?;
            wait_services_resolved(&device).await?;

            let mut found = Vec::new();
            for service in device.services().await? {
                let uuid = service.uuid().await?;
                debug!("{} offers service {}", peripheral, uuid);
                if wanted.is_empty() || wanted.contains(&uuid) {
                    found.push(ServiceDescriptor {
                        peripheral: peripheral.clone(),
                        id: service.id(),
                        uuid,
                    });
                }
            }
            Ok(found)
        }
        .boxed()
    }

    fn discover_characteristics(
        &self,
        service: &ServiceDescriptor,
        characteristics: &[Uuid],
    ) -> BoxFuture<'static, Result<Vec<CharacteristicDescriptor>, RadioError>> {
        let device = self.device(&service.peripheral);
        let service = service.clone();
        let wanted: HashSet<Uuid> = characteristics.iter().copied().collect();

        async move {
            let remote = device?.service(service.id).await?;

            let mut found = Vec::new();
            for characteristic in remote.characteristics().await? {
                let uuid = characteristic.uuid().await?;
                if wanted.is_empty() || wanted.contains(&uuid) {
                    found.push(CharacteristicDescriptor {
                        peripheral: service.peripheral.clone(),
                        service_id: service.id,
                        id: characteristic.id(),
                        uuid,
                    });
                }
            }
            Ok(found)
        }
        .boxed()
    }

    fn read_characteristic(
        &self,
        characteristic: &CharacteristicDescriptor,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Vec<u8>, RadioError>> {
        let adapter = self.adapter.clone();
        let descriptor = characteristic.clone();

        async move {
            let read = async {
                let remote = remote_characteristic(&adapter, &descriptor).await?;
                Ok::<_, RadioError>(remote.read().await?)
            };
            tokio::time::timeout(timeout, read)
                .await
                .unwrap_or(Err(RadioError::Timeout(timeout)))
        }
        .boxed()
    }

    fn write_characteristic(
        &self,
        characteristic: &CharacteristicDescriptor,
        value: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), RadioError>> {
        let adapter = self.adapter.clone();
        let descriptor = characteristic.clone();

        async move {
            let remote = remote_characteristic(&adapter, &descriptor).await?;
            remote.write(&value).await?;
            Ok(())
        }
        .boxed()
    }

    fn subscribe(
        &self,
        characteristic: &CharacteristicDescriptor,
    ) -> BoxFuture<'static, Result<(), RadioError>> {
        let adapter = self.adapter.clone();
        let descriptor = characteristic.clone();
        let subscriptions = self.subscriptions.clone();

        async move {
            let stream = open_notify(&adapter, &descriptor).await?;
            subscriptions.lock().insert(descriptor, stream);
            Ok(())
        }
        .boxed()
    }

    fn receive_notifications(
        &self,
        characteristic: &CharacteristicDescriptor,
        capacity: usize,
    ) -> BoxStream<'static, Vec<u8>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let adapter = self.adapter.clone();
        let descriptor = characteristic.clone();
        let mut current = self.subscriptions.lock().remove(characteristic);

        tokio::spawn(async move {
            loop {
                let stream = match current.take() {
                    Some(stream) => Some(stream),
                    None => tokio::select! {
                        _ = tx.closed() => break,
                        opened = open_notify(&adapter, &descriptor) => match opened {
                            Ok(stream) => Some(stream),
                            Err(e) => {
                                debug!("Notifications unavailable: {}", e);
                                None
                            }
                        },
                    },
                };

                if let Some(mut stream) = stream {
                    loop {
                        let value = tokio::select! {
                            _ = tx.closed() => return,
                            value = stream.next() => value,
                        };
                        let Some(value) = value else {
                            break;
                        };
                        if tx.send(value).await.is_err() {
                            return;
                        }
                    }
                    // The stream ends when the link drops; re-open after reconnect.
                    debug!("Notification stream for {} ended", descriptor.uuid);
                }

                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(NOTIFY_RETRY) => {}
                }
            }
            debug!("Notifications for {} released", descriptor.uuid);
        });

        ReceiverStream::new(rx).boxed()
    }

    fn unsubscribe(&self, characteristic: &CharacteristicDescriptor) {
        if self.subscriptions.lock().remove(characteristic).is_some() {
            debug!("Dropped unclaimed subscription to {}", characteristic.uuid);
        }
    }
}

fn device(adapter: &Adapter, peripheral: &PeripheralId) -> Result<Device, RadioError> {
    let address: Address = peripheral
        .as_str()
        .parse()
        .map_err(|_| RadioError::UnknownPeripheral(peripheral.to_string()))?;
    Ok(adapter.device(address)?)
}

async fn remote_characteristic(
    adapter: &Adapter,
    descriptor: &CharacteristicDescriptor,
) -> Result<Characteristic, RadioError> {
    let device = device(adapter, &descriptor.peripheral)?;
    let service = device.service(descriptor.service_id).await?;
    Ok(service.characteristic(descriptor.id).await?)
}

async fn open_notify(
    adapter: &Adapter,
    descriptor: &CharacteristicDescriptor,
) -> Result<NotifyStream, RadioError> {
    let remote = remote_characteristic(adapter, descriptor).await?;
    let stream = remote.notify().await?;
    Ok(Box::pin(stream))
}

async fn scan_devices(
    adapter: Adapter,
    service: Uuid,
    tx: mpsc::Sender<PeripheralId>,
) -> Result<(), RadioError> {
    adapter.set_discovery_filter(discovery_filter(service)).await?;

    let discover = adapter.discover_devices().await?;
    futures::pin_mut!(discover);
    info!("Scanning for service {}", service);

    loop {
        let event = tokio::select! {
            _ = tx.closed() => break,
            event = discover.next() => event,
        };
        let Some(event) = event else {
            warn!("Discovery stream ended");
            break;
        };
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        // Devices can vanish between the event and the property read.
        let device = match adapter.device(address) {
            Ok(device) => device,
            Err(e) => {
                debug!("Skipping {}: {}", address, e);
                continue;
            }
        };
        let advertised = match device.uuids().await {
            Ok(uuids) => uuids.unwrap_or_default(),
            Err(e) => {
                debug!("Skipping {}: {}", address, e);
                continue;
            }
        };
        if advertised.contains(&service) {
            debug!("{} advertises {}", address, service);
            if tx.send(PeripheralId::new(address.to_string())).await.is_err() {
                break;
            }
        }
    }

    Ok(())
}

fn discovery_filter(service: Uuid) -> DiscoveryFilter {
    DiscoveryFilter {
        uuids: HashSet::from([service]),
        transport: DiscoveryTransport::Le,
        ..Default::default()
    }
}

async fn wait_services_resolved(device: &Device) -> Result<(), RadioError> {
    let events = device.events().await?;
    if device.is_services_resolved().await? {
        return Ok(());
    }

    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        match event {
            DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true)) => return Ok(()),
            DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => {
                return Err(RadioError::NotConnected)
            }
            _ => {}
        }
    }
    Err(RadioError::NotConnected)
}
