//! Link change events.
//!
//! Every linking operation that touches at least one link produces exactly one
//! [`LinkChangeEvent`], delivered synchronously to each registered
//! [`LinkEventSubscriber`] before the operation returns.
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::types::{Link, LinkMatchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkChangeKind {
    Created,
    Updated,
    Removed,
}

/// One link touched by an operation, as it was after the change (or just
/// before removal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkChange {
    pub kind: LinkChangeKind,
    pub link: Link,
}

/// What triggered a linking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkOperation {
    Create,
    Update,
    UpdateLink,
    NotDuplicate,
    MergeGoldenRecords,
}

/// The message an operation was started from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChangeMessage {
    pub message_id: String,
    pub operation: LinkOperation,
    pub resource_type: String,
    pub resource_id: String,
    pub received_at: DateTime<Utc>,
}

impl ResourceChangeMessage {
    pub fn new(operation: LinkOperation, resource_type: &str, resource_id: &str) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            operation,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkChangeEvent {
    pub event_id: String,
    pub message: ResourceChangeMessage,
    pub changes: Vec<LinkChange>,
    pub emitted_at: DateTime<Utc>,
}

impl LinkChangeEvent {
    pub fn new(message: ResourceChangeMessage, changes: Vec<LinkChange>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            message,
            changes,
            emitted_at: Utc::now(),
        }
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.changes.iter().map(|c| &c.link)
    }

    pub fn changes_of(&self, kind: LinkChangeKind) -> impl Iterator<Item = &LinkChange> {
        self.changes.iter().filter(move |c| c.kind == kind)
    }

    /// Links in this event carrying `result`, whatever the change kind.
    pub fn count_result(&self, result: LinkMatchResult) -> usize {
        self.links().filter(|l| l.match_result == result).count()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("subscriber failed: {0}")]
pub struct SubscriberError(pub String);

/// Receives link change events.
pub trait LinkEventSubscriber: Send + Sync {
    fn name(&self) -> &str {
        "subscriber"
    }

    fn on_link_change(&self, event: &LinkChangeEvent) -> Result<(), SubscriberError>;
}

/// Fans events out to subscribers in registration order.
#[derive(Default)]
pub struct LinkEventEmitter {
    subscribers: RwLock<Vec<Arc<dyn LinkEventSubscriber>>>,
}

impl LinkEventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, subscriber: Arc<dyn LinkEventSubscriber>) {
        let mut guard = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!(subscriber = subscriber.name(), "link_subscriber_registered");
        guard.push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Deliver `event` to every subscriber. Failures are logged and do not
    /// stop delivery. Returns the number of successful deliveries.
    pub fn publish(&self, event: &LinkChangeEvent) -> usize {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let mut delivered = 0;
        for subscriber in subscribers {
            match subscriber.on_link_change(event) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    subscriber = subscriber.name(),
                    event_id = %event.event_id,
                    error = %err,
                    "link_event_delivery_failed"
                ),
            }
        }
        debug!(
            event_id = %event.event_id,
            changes = event.changes.len(),
            delivered,
            "link_event_published"
        );
        delivered
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct CollectingSubscriber {
    events: Mutex<Vec<LinkChangeEvent>>,
}

impl CollectingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LinkChangeEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drain the buffer.
    pub fn take(&self) -> Vec<LinkChangeEvent> {
        std::mem::take(
            &mut *self
                .events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LinkEventSubscriber for CollectingSubscriber {
    fn name(&self) -> &str {
        "collecting"
    }

    fn on_link_change(&self, event: &LinkChangeEvent) -> Result<(), SubscriberError> {
        self.events
            .lock()
            .map_err(|_| SubscriberError("poisoned lock".into()))?
            .push(event.clone());
        Ok(())
    }
}

/// Forwards events to a tokio broadcast channel for async consumers.
pub struct BroadcastSubscriber {
    sender: broadcast::Sender<LinkChangeEvent>,
}

impl BroadcastSubscriber {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<LinkChangeEvent>) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkChangeEvent> {
        self.sender.subscribe()
    }
}

impl LinkEventSubscriber for BroadcastSubscriber {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn on_link_change(&self, event: &LinkChangeEvent) -> Result<(), SubscriberError> {
        // No receivers is not a failure; the event is simply unobserved.
        match self.sender.send(event.clone()) {
            Ok(receivers) => trace!(receivers, "link_event_broadcast"),
            Err(_) => trace!("link_event_broadcast_unobserved"),
        }
        Ok(())
    }
}
