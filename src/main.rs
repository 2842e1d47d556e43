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

//! Simple BLE Central terminal application.

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simple_ble_central::bluetooth::{BluezRadio, CentralSession, SessionEvent};
use simple_ble_central::config::Config;
use simple_ble_central::events::EventProcessor;
use simple_ble_central::state::AppState;

/// A line typed by the user.
#[derive(Debug, PartialEq)]
enum UserCommand {
    Read,
    Write(String),
    Status,
    Quit,
}

impl UserCommand {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        match word {
            "read" | "r" => Some(UserCommand::Read),
            "write" | "w" => Some(UserCommand::Write(rest.to_string())),
            "status" | "s" => Some(UserCommand::Status),
            "quit" | "q" | "exit" => Some(UserCommand::Quit),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("simple_ble_central={}", config.logging.level).parse()?),
        )
        .init();

    info!(
        "Starting Simple BLE Central v{}...",
        env!("CARGO_PKG_VERSION")
    );
    info!("Configuration loaded from {}", Config::default_path().display());

    let radio = BluezRadio::new(config.central.adapter.as_deref(), config.central.power_on).await?;
    info!("Radio adapter: {}", radio.adapter_name());

    let state = AppState::new();
    let processor = EventProcessor::new(state.clone());

    let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(config.central.event_buffer);
    let (session, handle) = CentralSession::new(
        Arc::new(radio),
        config.central.session_config(),
        event_tx,
    );
    let mut phase_rx = handle.phase_changes();
    let mut session_task = tokio::spawn(session.run());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Commands: read | write <text> | status | quit");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => processor.process_event(event),
            Ok(()) = phase_rx.changed() => {
                let phase = *phase_rx.borrow_and_update();
                state.set_phase(phase);
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match UserCommand::parse(&line) {
                    Some(UserCommand::Read) => handle.request_read().await,
                    Some(UserCommand::Write(text)) => handle.request_write(text).await,
                    Some(UserCommand::Status) => {
                        info!(
                            "{} | {} | read: {:?} | notified: {:?}",
                            state.get_status().as_str(),
                            state.get_status_text(),
                            state.get_read_value(),
                            state.get_notified_value(),
                        );
                    }
                    Some(UserCommand::Quit) => {
                        info!("Quit requested");
                        handle.stop().await;
                        break;
                    }
                    None if line.trim().is_empty() => {}
                    None => warn!("Unknown command: {}", line.trim()),
                },
                Ok(None) => {
                    info!("Input closed");
                    handle.stop().await;
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    handle.stop().await;
                    break;
                }
            },
            finished = &mut session_task => {
                match finished {
                    Ok(phase) => info!("Session ended: {:?}", phase),
                    Err(e) => error!("Session task failed: {}", e),
                }
                // Drain what the session emitted before it ended.
                while let Ok(event) = event_rx.try_recv() {
                    processor.process_event(event);
                }
                info!("Simple BLE Central stopped");
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                handle.stop().await;
                break;
            }
        }
    }

    match session_task.await {
        Ok(phase) => info!("Session ended: {:?}", phase),
        Err(e) => error!("Session task failed: {}", e),
    }
    info!("Simple BLE Central stopped");
    Ok(())
}
