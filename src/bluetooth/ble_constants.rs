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

//! BLE service and characteristic UUIDs for the demo peripheral.

use uuid::Uuid;

/// Bluetooth Base UUID (`0000xxxx-0000-1000-8000-00805f9b34fb`).
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit assigned number onto the Bluetooth Base UUID.
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Service advertised by the peripheral.
pub const SERVICE_UUID: Uuid = uuid16(0xec00);

/// Data characteristic under [`SERVICE_UUID`].
/// Properties: Read, Write, Notify
pub const DATA_CHARACTERISTIC_UUID: Uuid = uuid16(0xec0e);

/// Session policy defaults.
pub mod policy {
    /// Connection attempt timeout in milliseconds.
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Read timeout in milliseconds.
    pub const READ_TIMEOUT_MS: u64 = 5_000;

    /// Service/characteristic discovery timeout in milliseconds.
    pub const DISCOVERY_TIMEOUT_MS: u64 = 15_000;

    /// Buffered link events per connection.
    pub const CONNECTION_BUFFER: usize = 5;

    /// Buffered notification payloads.
    pub const NOTIFICATION_BUFFER: usize = 10;

    /// Delay between failed reconnect attempts in milliseconds.
    pub const RECONNECT_DELAY_MS: u64 = 1_000;

    /// Buffered observer events.
    pub const EVENT_BUFFER: usize = 32;
}
