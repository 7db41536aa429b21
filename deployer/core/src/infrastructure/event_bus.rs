// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// Event Bus - Pub/Sub for Deployer Events
//
// In-memory event streaming using tokio broadcast channels. Carries play
// lifecycle events, raw log chunks and model-changed notifications to
// whatever front end the deployer is embedded in.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::play::{LogStream, PlayMeta, PlayRef};

/// Unified event type for the deployer event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployerEvent {
    PlayStarted {
        meta: PlayMeta,
    },
    PlayEnded {
        meta: PlayMeta,
    },
    LogData {
        play_ref: PlayRef,
        stream: LogStream,
        data: String,
    },
    ModelChanged,
}

impl DeployerEvent {
    fn play_ref(&self) -> Option<&str> {
        match self {
            Self::PlayStarted { meta } | Self::PlayEnded { meta } => Some(&meta.play_ref),
            Self::LogData { play_ref, .. } => Some(play_ref),
            Self::ModelChanged => None,
        }
    }
}

/// Event bus for publishing and subscribing to deployer events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DeployerEvent>>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity.
    /// Capacity bounds how many events buffer before old ones drop.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create an event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: DeployerEvent) {
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all deployer events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe and filter for a single play.
    /// Useful for streaming the log of one run to one client.
    pub fn subscribe_play(&self, play_ref: impl Into<PlayRef>) -> PlayEventReceiver {
        PlayEventReceiver {
            receiver: self.sender.subscribe(),
            play_ref: play_ref.into(),
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Receiver for all deployer events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DeployerEvent>,
}

impl EventReceiver {
    /// Receive the next event (blocks until one is available)
    pub async fn recv(&mut self) -> Result<DeployerEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<DeployerEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver for the events of a single play (filtered)
pub struct PlayEventReceiver {
    receiver: broadcast::Receiver<DeployerEvent>,
    play_ref: PlayRef,
}

impl PlayEventReceiver {
    /// Receive the next event for the subscribed play, skipping others.
    pub async fn recv(&mut self) -> Result<DeployerEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            if event.play_ref() == Some(self.play_ref.as_str()) {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
