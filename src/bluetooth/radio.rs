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

//! Radio adapter capability consumed by the central session.
//!
//! The adapter wraps the platform BLE stack. Every operation returns a
//! `'static` future or stream so the session can hand it to a forwarding
//! task and keep its own state single-threaded.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::error::RadioError;

/// Power/availability state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
    Resetting,
    Unknown,
}

impl RadioState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RadioState::PoweredOn => "powered on",
            RadioState::PoweredOff => "powered off",
            RadioState::Unauthorized => "unauthorized",
            RadioState::Unsupported => "unsupported",
            RadioState::Resetting => "resetting",
            RadioState::Unknown => "unknown",
        }
    }
}

/// Adapter-specific peripheral identifier (a device address on BlueZ).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection state of the tracked peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Discovering,
    Ready,
}

/// The single peripheral a session works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    pub id: PeripheralId,
    pub link: LinkState,
}

impl PeripheralHandle {
    pub fn new(id: PeripheralId) -> Self {
        Self {
            id,
            link: LinkState::Disconnected,
        }
    }
}

/// A discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub peripheral: PeripheralId,
    /// Adapter-assigned attribute id.
    pub id: u16,
    pub uuid: Uuid,
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicDescriptor {
    pub peripheral: PeripheralId,
    pub service_id: u16,
    /// Adapter-assigned attribute id.
    pub id: u16,
    pub uuid: Uuid,
}

/// Events on an established (or attempted) link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    /// Connection attempt failed or timed out.
    Failed(RadioError),
}

/// Platform BLE stack as seen by a [`CentralSession`](super::CentralSession).
pub trait RadioAdapter: Send + Sync {
    /// Current radio state followed by every change.
    fn observe_radio_state(&self) -> BoxStream<'static, RadioState>;

    /// Ask the stack to reset after it reported [`RadioState::Resetting`].
    fn reset(&self) -> BoxFuture<'static, Result<(), RadioError>>;

    /// Scan for peripherals advertising `service`.
    fn start_scan(&self, service: Uuid) -> BoxStream<'static, PeripheralId>;

    /// Stop the running scan, if any.
    fn stop_scan(&self);

    /// Connect to `peripheral`. The stream carries the outcome of the attempt
    /// and every later connect/disconnect of the link.
    fn connect(
        &self,
        peripheral: &PeripheralId,
        timeout: Duration,
        capacity: usize,
    ) -> BoxStream<'static, LinkEvent>;

    /// Re-establish a dropped link. Discovered attributes stay valid.
    fn reconnect(&self, peripheral: &PeripheralId) -> BoxFuture<'static, Result<(), RadioError>>;

    fn discover_services(
        &self,
        peripheral: &PeripheralId,
        services: &[Uuid],
    ) -> BoxFuture<'static, Result<Vec<ServiceDescriptor>, RadioError>>;

    fn discover_characteristics(
        &self,
        service: &ServiceDescriptor,
        characteristics: &[Uuid],
    ) -> BoxFuture<'static, Result<Vec<CharacteristicDescriptor>, RadioError>>;

    fn read_characteristic(
        &self,
        characteristic: &CharacteristicDescriptor,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Vec<u8>, RadioError>>;

    fn write_characteristic(
        &self,
        characteristic: &CharacteristicDescriptor,
        value: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), RadioError>>;

    /// Enable notifications on the peripheral.
    fn subscribe(
        &self,
        characteristic: &CharacteristicDescriptor,
    ) -> BoxFuture<'static, Result<(), RadioError>>;

    /// Value updates pushed by the peripheral, buffered up to `capacity`.
    fn receive_notifications(
        &self,
        characteristic: &CharacteristicDescriptor,
        capacity: usize,
    ) -> BoxStream<'static, Vec<u8>>;

    /// Drop any subscription still held for `characteristic` once the
    /// session is torn down.
    fn unsubscribe(&self, characteristic: &CharacteristicDescriptor);
}
