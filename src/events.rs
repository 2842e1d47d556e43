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

//! Session event processing.

use std::sync::Arc;
use tracing::{info, warn};

use crate::bluetooth::SessionEvent;
use crate::state::AppState;

/// Applies session events to the shared [`AppState`].
pub struct EventProcessor {
    state: Arc<AppState>,
}

impl EventProcessor {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Process a single event.
    pub fn process_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::StatusChanged(text) => {
                self.state.set_status_text(text);
            }
            SessionEvent::CharacteristicReady => {
                info!("Characteristic ready for read/write");
                self.state.set_characteristic_ready();
            }
            SessionEvent::ValueRead(Ok(value)) => {
                info!("Read value is {:?}", value);
                self.state.set_read_value(value);
            }
            SessionEvent::ValueRead(Err(e)) => {
                warn!("read error: {}", e);
                self.state.set_read_value("read error".to_string());
            }
            SessionEvent::ValueNotified(value) => {
                info!("notified value is {:?}", value);
                self.state.set_notified_value(value);
            }
            SessionEvent::WriteResult(Ok(())) => {
                info!("write success");
                self.state.set_last_write(Ok(()));
            }
            SessionEvent::WriteResult(Err(e)) => {
                warn!("write failed: {}", e);
                self.state.set_last_write(Err(e.to_string()));
            }
        }
    }
}
