//! Retry queue for EMERGENCY-priority messages.
//!
//! A message that cannot go out immediately is parked here and retried at the
//! configured interval until it is delivered or its deadline passes. Expiry
//! is always reported to the sender through its [`AckHandle`] and on the
//! event bus.

use crate::error::{LinkError, LinkResult};
use crate::frame::Envelope;
use std::collections::VecDeque;
use swarmlink_core::{
    event_types, ChannelKind, EventBuilder, EventBus, EventCategory, EventSeverity, Timestamp,
};
use tokio::sync::oneshot;

const SOURCE: &str = "emergency-queue";

/// Successful delivery of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Message identifier
    pub message_id: u64,
    /// Channels the message left on
    pub channels: Vec<ChannelKind>,
    /// Transmission attempts, including the successful one
    pub attempts: u32,
    /// When the message left
    pub delivered_at: Timestamp,
}

/// Outcome of a send, available once the message has left or failed.
#[derive(Debug)]
pub struct AckHandle {
    message_id: u64,
    rx: oneshot::Receiver<LinkResult<Delivery>>,
}

impl AckHandle {
    pub(crate) fn pending(message_id: u64) -> (Self, oneshot::Sender<LinkResult<Delivery>>) {
        let (tx, rx) = oneshot::channel();
        (Self { message_id, rx }, tx)
    }

    pub(crate) fn settled(message_id: u64, outcome: LinkResult<Delivery>) -> Self {
        let (handle, tx) = Self::pending(message_id);
        let _ = tx.send(outcome);
        handle
    }

    /// Identifier assigned to the message.
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Wait for the outcome.
    pub async fn delivered(self) -> LinkResult<Delivery> {
        let message_id = self.message_id;
        self.rx.await.unwrap_or_else(|_| Err(stopped(message_id)))
    }

    /// Outcome if already known. Yields the outcome at most once.
    pub fn try_outcome(&mut self) -> Option<LinkResult<Delivery>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(stopped(self.message_id))),
        }
    }
}

fn stopped(message_id: u64) -> LinkError {
    LinkError::DeliveryFailed {
        message_id,
        reason: "link controller stopped".to_string(),
    }
}

/// A parked message.
#[derive(Debug)]
pub struct QueuedMessage {
    /// The message
    pub envelope: Envelope,
    /// Caller-supplied expiry; `None` retries until delivered
    pub deadline: Option<Timestamp>,
    /// Earliest next attempt
    pub next_attempt: Timestamp,
    /// Attempts so far
    pub attempts: u32,
    ack: oneshot::Sender<LinkResult<Delivery>>,
}

impl QueuedMessage {
    fn is_expired(&self, now: Timestamp) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Report delivery and drop the message.
    pub fn complete(self, channels: Vec<ChannelKind>, now: Timestamp) {
        tracing::info!(
            message_id = self.envelope.message_id,
            attempts = self.attempts,
            "Queued EMERGENCY message delivered"
        );
        let _ = self.ack.send(Ok(Delivery {
            message_id: self.envelope.message_id,
            channels,
            attempts: self.attempts,
            delivered_at: now,
        }));
    }
}

/// Parked EMERGENCY-priority messages.
pub struct EmergencyQueue {
    items: VecDeque<QueuedMessage>,
    events: EventBus,
}

impl EmergencyQueue {
    /// Empty queue publishing on `events`.
    pub fn new(events: EventBus) -> Self {
        Self {
            items: VecDeque::new(),
            events,
        }
    }

    /// Park a message after `attempts` failed tries; it becomes due at `next_attempt`.
    pub fn push(
        &mut self,
        envelope: Envelope,
        deadline: Option<Timestamp>,
        ack: oneshot::Sender<LinkResult<Delivery>>,
        attempts: u32,
        next_attempt: Timestamp,
        reason: &str,
    ) {
        tracing::warn!(
            message_id = envelope.message_id,
            destination = %envelope.destination,
            reason,
            "EMERGENCY message queued for retry"
        );
        self.events.publish(
            EventBuilder::new(event_types::EMERGENCY_QUEUED, SOURCE)
                .severity(EventSeverity::Warning)
                .category(EventCategory::Delivery)
                .subject(envelope.destination.clone())
                .at(envelope.sent_at)
                .message(format!("Message {} queued: {reason}", envelope.message_id))
                .metadata("message_id", envelope.message_id)
                .build(),
        );
        self.items.push_back(QueuedMessage {
            envelope,
            deadline,
            next_attempt,
            attempts,
            ack,
        });
    }

    /// Put back a message whose retry failed.
    pub fn requeue(&mut self, mut message: QueuedMessage, next_attempt: Timestamp) {
        message.next_attempt = next_attempt;
        self.items.push_back(message);
    }

    /// Remove and return the messages due at `now`, oldest first.
    pub fn take_due(&mut self, now: Timestamp) -> Vec<QueuedMessage> {
        let (due, waiting): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|m| m.next_attempt <= now && !m.is_expired(now));
        self.items = waiting;
        due.into()
    }

    /// Fail every message past its deadline; returns how many expired.
    pub fn expire(&mut self, now: Timestamp) -> usize {
        let (expired, live): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|m| m.is_expired(now));
        self.items = live;

        let count = expired.len();
        for message in expired {
            self.fail(message, now, "deadline passed");
        }
        count
    }

    /// Fail every queued message (shutdown).
    pub fn fail_all(&mut self, now: Timestamp, reason: &str) {
        for message in std::mem::take(&mut self.items) {
            self.fail(message, now, reason);
        }
    }

    /// Queued message count.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn fail(&self, message: QueuedMessage, now: Timestamp, reason: &str) {
        let error = LinkError::DeliveryFailed {
            message_id: message.envelope.message_id,
            reason: format!("{reason} after {} attempts", message.attempts),
        };
        tracing::error!(message_id = message.envelope.message_id, error = %error, "EMERGENCY message not delivered");
        self.events.publish(
            EventBuilder::new(event_types::DELIVERY_FAILED, SOURCE)
                .severity(EventSeverity::Error)
                .category(EventCategory::Delivery)
                .subject(message.envelope.destination.clone())
                .at(now)
                .message(error.to_string())
                .metadata("message_id", message.envelope.message_id)
                .metadata("attempts", message.attempts)
                .build(),
        );
        let _ = message.ack.send(Err(error));
    }
}
