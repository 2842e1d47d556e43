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

//! Application state management.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::bluetooth::Phase;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Error => "Error",
        }
    }
}

impl From<Phase> for ConnectionStatus {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::AwaitingRadio | Phase::Stopped => ConnectionStatus::Disconnected,
            Phase::Scanning
            | Phase::Connecting
            | Phase::DiscoveringService
            | Phase::DiscoveringCharacteristic
            | Phase::Subscribing
            | Phase::Reconnecting => ConnectionStatus::Connecting,
            Phase::Ready => ConnectionStatus::Connected,
            Phase::Error(_) => ConnectionStatus::Error,
        }
    }
}

/// Shared view of the session, as shown to the user.
#[derive(Debug)]
pub struct AppState {
    /// Current connection status.
    pub connection_status: RwLock<ConnectionStatus>,

    /// Last status line.
    pub status_text: RwLock<String>,

    /// Whether the characteristic view is available.
    pub characteristic_ready: RwLock<bool>,

    /// Last read value, or the read error.
    pub read_value: RwLock<Option<String>>,

    /// Last notified value. `Some(None)` for an undecodable payload.
    pub notified_value: RwLock<Option<Option<String>>>,

    /// Outcome of the last write.
    pub last_write: RwLock<Option<Result<(), String>>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            connection_status: RwLock::new(ConnectionStatus::Disconnected),
            status_text: RwLock::new(String::new()),
            characteristic_ready: RwLock::new(false),
            read_value: RwLock::new(None),
            notified_value: RwLock::new(None),
            last_write: RwLock::new(None),
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_phase(&self, phase: Phase) {
        *self.connection_status.write() = phase.into();
        if !phase.has_characteristic() {
            *self.characteristic_ready.write() = false;
        }
    }

    pub fn get_status(&self) -> ConnectionStatus {
        *self.connection_status.read()
    }

    pub fn set_status_text(&self, text: String) {
        *self.status_text.write() = text;
    }

    pub fn get_status_text(&self) -> String {
        self.status_text.read().clone()
    }

    pub fn set_characteristic_ready(&self) {
        *self.characteristic_ready.write() = true;
    }

    pub fn is_characteristic_ready(&self) -> bool {
        *self.characteristic_ready.read()
    }

    pub fn set_read_value(&self, value: String) {
        *self.read_value.write() = Some(value);
    }

    pub fn get_read_value(&self) -> Option<String> {
        self.read_value.read().clone()
    }

    pub fn set_notified_value(&self, value: Option<String>) {
        *self.notified_value.write() = Some(value);
    }

    pub fn get_notified_value(&self) -> Option<Option<String>> {
        self.notified_value.read().clone()
    }

    pub fn set_last_write(&self, result: Result<(), String>) {
        *self.last_write.write() = Some(result);
    }

    pub fn get_last_write(&self) -> Option<Result<(), String>> {
        self.last_write.read().clone()
    }
}
