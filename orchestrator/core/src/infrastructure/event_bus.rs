// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// Event Bus Implementation - Pub/Sub for Fleet Events
//
// In-process event streaming over tokio broadcast channels. Workers and
// queues publish; dashboards, tests and log shippers subscribe.
//
// Events are not persisted: a subscriber only sees what is published while
// it is listening.

use crate::domain::events::{FlowEvent, QueueEvent};
use crate::domain::flow::SessionId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    Flow(FlowEvent),
    Queue(QueueEvent),
}

/// Event bus for publishing and subscribing to fleet events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<FleetEvent>>,
}

impl EventBus {
    /// Create a new event bus buffering up to `capacity` events per
    /// subscriber before the oldest are dropped
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_flow_event(&self, event: FlowEvent) {
        self.publish(FleetEvent::Flow(event));
    }

    pub fn publish_queue_event(&self, event: QueueEvent) {
        self.publish(FleetEvent::Queue(event));
    }

    fn publish(&self, event: FleetEvent) {
        debug!("Publishing event: {:?}", event);
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all fleet events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the flow events of one session
    pub fn subscribe_session(&self, session_id: SessionId) -> SessionEventReceiver {
        SessionEventReceiver {
            receiver: self.sender.subscribe(),
            session_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all fleet events
pub struct EventReceiver {
    receiver: broadcast::Receiver<FleetEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<FleetEvent, EventBusError> {
        self.receiver.recv().await.map_err(recv_error)
    }

    pub fn try_recv(&mut self) -> Result<FleetEvent, EventBusError> {
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

/// Receiver for one session's flow events (filtered)
pub struct SessionEventReceiver {
    receiver: broadcast::Receiver<FleetEvent>,
    session_id: SessionId,
}

impl SessionEventReceiver {
    pub async fn recv(&mut self) -> Result<FlowEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(recv_error)?;
            if let FleetEvent::Flow(flow_event) = event {
                if flow_event.session_id() == &self.session_id {
                    return Ok(flow_event);
                }
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

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_session_filtering() {
        let event_bus = EventBus::new(10);
        let ours = SessionId::new("flows");
        let other = SessionId::new("flows");
        let mut receiver = event_bus.subscribe_session(ours.clone());

        event_bus.publish_flow_event(FlowEvent::FlowTerminated {
            session_id: other,
            terminated_at: Utc::now(),
        });
        event_bus.publish_queue_event(QueueEvent::RecordPoisoned {
            collection: "q".into(),
            key: "k".into(),
            claim_count: 3,
            parked: false,
        });
        event_bus.publish_flow_event(FlowEvent::FlowTerminated {
            session_id: ours.clone(),
            terminated_at: Utc::now(),
        });

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.session_id(), &ours);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish_flow_event(FlowEvent::LeaseSkipped {
            session_id: SessionId::new("flows"),
            skipped_at: Utc::now(),
        });

        assert!(matches!(receiver1.recv().await.unwrap(), FleetEvent::Flow(_)));
        assert!(matches!(receiver2.recv().await.unwrap(), FleetEvent::Flow(_)));
        assert!(matches!(receiver1.try_recv(), Err(EventBusError::Empty)));
    }
}
