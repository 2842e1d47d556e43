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

//! Error types for the central session and radio adapters.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of session failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Radio is off, unauthorized, unsupported or in an unknown state.
    RadioUnavailable,
    /// Radio is resetting. Transient, handled internally.
    RadioResetting,
    ServiceNotFound,
    CharacteristicNotFound,
    ConnectFailed,
    ReadFailed,
    WriteFailed,
    /// Link dropped while ready. Transient, triggers a reconnect.
    Disconnected,
    SubscribeFailed,
    DiscoveryTimedOut,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RadioUnavailable => "radio unavailable",
            ErrorKind::RadioResetting => "radio resetting",
            ErrorKind::ServiceNotFound => "service not found",
            ErrorKind::CharacteristicNotFound => "characteristic not found",
            ErrorKind::ConnectFailed => "connect failed",
            ErrorKind::ReadFailed => "read failed",
            ErrorKind::WriteFailed => "write failed",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::SubscribeFailed => "subscribe failed",
            ErrorKind::DiscoveryTimedOut => "discovery timed out",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported to the observer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Failure reported by a [`RadioAdapter`](super::RadioAdapter) operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("peripheral not found: {0}")]
    UnknownPeripheral(String),

    #[error("link is not connected")]
    NotConnected,

    #[error("bluetooth stack error: {0}")]
    Stack(String),
}

impl RadioError {
    /// Lift into a session error of the given kind.
    pub fn into_session(self, kind: ErrorKind) -> SessionError {
        SessionError::new(kind, self.to_string())
    }
}

impl From<bluer::Error> for RadioError {
    fn from(err: bluer::Error) -> Self {
        RadioError::Stack(err.to_string())
    }
}
