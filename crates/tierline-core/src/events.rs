//! Agent lifecycle events for the session/subscription layer.
//!
//! The registry publishes on a tokio broadcast channel. Publishing never
//! blocks and never fails the caller: with no subscribers the event is simply
//! dropped. A subscriber that falls more than `capacity` events behind gets
//! [`EventError::Lagged`] once and is moved to the live tail.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use crate::session::ChannelId;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Why a virtual agent left the CONNECTED state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    /// No keep-alive within the agent's TTL.
    Timeout,
    /// Explicit disconnect or channel close.
    Disconnect,
    /// A new connection for the same host and agent took over.
    Replaced,
}

impl std::fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Disconnect => write!(f, "disconnect"),
            Self::Replaced => write!(f, "replaced"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Connected {
        serial: i64,
        host: String,
        agent: String,
        uri: String,
        channel_id: Option<ChannelId>,
    },
    Expired {
        serial: i64,
        host: String,
        agent: String,
        reason: ExpiryReason,
        /// Agents still online for the host after this expiry.
        online_count: usize,
    },
}

impl AgentEvent {
    #[must_use]
    pub fn serial(&self) -> i64 {
        match self {
            Self::Connected { serial, .. } | Self::Expired { serial, .. } => *serial,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Subscriber lagged behind by {count} events")]
    Lagged { count: u64 },

    #[error("Event bus closed")]
    Closed,

    #[error("No event available")]
    Empty,
}

/// Broadcast hub for [`AgentEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: AgentEvent) -> usize {
        trace!(?event, "publishing agent event");
        self.sender.send(event).unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe(&self) -> AgentEventReceiver {
        AgentEventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

pub struct AgentEventReceiver {
    receiver: broadcast::Receiver<AgentEvent>,
}

impl AgentEventReceiver {
    /// Wait for the next event. On lag the receiver is resubscribed at the
    /// tail and the skipped count is reported.
    pub async fn recv(&mut self) -> Result<AgentEvent, EventError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count })
            }
            Err(broadcast::error::RecvError::Closed) => Err(EventError::Closed),
        }
    }

    /// Non-blocking variant of [`Self::recv`].
    pub fn try_recv(&mut self) -> Result<AgentEvent, EventError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(event),
            Err(broadcast::error::TryRecvError::Lagged(count)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count })
            }
            Err(broadcast::error::TryRecvError::Empty) => Err(EventError::Empty),
            Err(broadcast::error::TryRecvError::Closed) => Err(EventError::Closed),
        }
    }
}
