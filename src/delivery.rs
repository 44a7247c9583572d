//! At-least-once delivery bookkeeping
//!
//! The tracker holds every submitted message until it is acknowledged, fails permanently,
//! times out or is cancelled. Messages are keyed by correlation id, which increases with
//! submission, so iteration order is submission order and replays after a reconnect keep it.
//!
//! Delivery is at-least-once, not exactly-once: a message whose acknowledgement was lost with
//! the connection is sent again after reconnecting, so the hub may observe it twice. Duplicate
//! or late acknowledgements for an already resolved message are ignored.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::correlation::{deadline_after, Completion, CorrelationId, CorrelationRegistry};
use crate::message::{DeliveryState, OutboundMessage, ServiceResponse};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

#[derive(Debug)]
struct Tracked {
    message: OutboundMessage,
    sent_at: Option<Instant>,
    /// Earlier re-send requested after a transient failure
    retry_at: Option<Instant>,
}

impl Tracked {
    fn resend_at(&self, ack_timeout: Duration) -> Option<Instant> {
        if self.message.state != DeliveryState::Sent {
            return None;
        }
        self.retry_at
            .or_else(|| self.sent_at.map(|sent_at| deadline_after(sent_at, ack_timeout)))
    }
}

/// Outbound messages of one connection and their pending correlations
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    messages: BTreeMap<CorrelationId, Tracked>,
    registry: CorrelationRegistry,
}

impl DeliveryTracker {
    /// An empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `message`, resolving `completion` once the message reaches a terminal
    /// state or `deadline` passes
    pub fn submit(
        &mut self,
        message: OutboundMessage,
        completion: Completion,
        deadline: Instant,
    ) -> Result<()> {
        let id = message.correlation_id;
        self.registry.register(id, completion, deadline)?;
        trace!("Tracking {:?} message {}", message.kind, id);
        self.messages.insert(
            id,
            Tracked {
                message,
                sent_at: None,
                retry_at: None,
            },
        );
        Ok(())
    }

    /// Record that `id` is being handed to the transport and return the message to send.
    /// Handing over a message that was already sent counts as a retry.
    pub fn mark_sent(&mut self, id: CorrelationId, now: Instant) -> Option<&OutboundMessage> {
        let tracked = self.messages.get_mut(&id)?;
        if tracked.message.state == DeliveryState::Sent {
            tracked.message.retry_count += 1;
        }
        tracked.message.state = DeliveryState::Sent;
        tracked.sent_at = Some(now);
        tracked.retry_at = None;
        Some(&tracked.message)
    }

    /// The hub confirmed `id`
    pub fn acknowledge(&mut self, id: CorrelationId, response: Option<ServiceResponse>) -> bool {
        match self.messages.remove(&id) {
            Some(mut tracked) => {
                tracked.message.state = DeliveryState::Acknowledged;
                trace!(
                    "Message {} acknowledged after {} retries",
                    id,
                    tracked.message.retry_count
                );
                self.registry.resolve(id, Ok(response))
            }
            None => {
                debug!("Ignoring late or duplicate acknowledgement for {}", id);
                false
            }
        }
    }

    /// Handle a failure to send `id`. Transient failures leave the message `Sent` and due again
    /// once the policy's delay (or the service's retry-after hint) has passed, or on reconnect;
    /// permanent ones fail it.
    pub fn on_send_error(
        &mut self,
        id: CorrelationId,
        error: Error,
        policy: &RetryPolicy,
        now: Instant,
    ) -> Option<DeliveryState> {
        let tracked = self.messages.get_mut(&id)?;
        let decision = policy.decide(&error.failure_kind(), tracked.message.retry_count);
        if decision.terminal {
            warn!("Message {} failed permanently: {}", id, error);
            self.fail(id, error);
            Some(DeliveryState::Failed)
        } else {
            debug!(
                "Message {} will be re-sent in {:?} after: {}",
                id, decision.retry_after, error
            );
            tracked.retry_at = Some(deadline_after(now, decision.retry_after));
            Some(DeliveryState::Sent)
        }
    }

    /// Resolve `id` with `error`
    pub fn fail(&mut self, id: CorrelationId, error: Error) -> bool {
        match self.messages.remove(&id) {
            Some(mut tracked) => {
                tracked.message.state = DeliveryState::Failed;
                self.registry.resolve(id, Err(error))
            }
            None => false,
        }
    }

    /// Caller cancelled `id`
    pub fn cancel(&mut self, id: CorrelationId) -> bool {
        self.fail(id, Error::Cancelled)
    }

    /// Time out every message whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<CorrelationId> {
        let expired = self.registry.sweep(now);
        for id in &expired {
            self.messages.remove(id);
        }
        expired
    }

    /// Resolve every tracked message with `error`
    pub fn fail_all(&mut self, error: &Error) -> usize {
        self.messages.clear();
        self.registry.drain(error)
    }

    /// Ids of every message still awaiting delivery, in submission order
    pub fn outstanding(&self) -> Vec<CorrelationId> {
        self.messages.keys().copied().collect()
    }

    /// Sent messages that have waited at least `ack_timeout`, or whose retry delay after a
    /// transient failure has passed, in submission order
    pub fn due_for_resend(&self, now: Instant, ack_timeout: Duration) -> Vec<CorrelationId> {
        self.messages
            .iter()
            .filter(|(_, tracked)| tracked.resend_at(ack_timeout).map_or(false, |at| at <= now))
            .map(|(id, _)| *id)
            .collect()
    }

    /// When the earliest sent message becomes due for re-send
    pub fn next_resend_at(&self, ack_timeout: Duration) -> Option<Instant> {
        self.messages
            .values()
            .filter_map(|tracked| tracked.resend_at(ack_timeout))
            .min()
    }

    /// Earliest correlation deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.registry.next_deadline()
    }

    /// Delivery state of a tracked message
    pub fn state(&self, id: CorrelationId) -> Option<DeliveryState> {
        self.messages.get(&id).map(|tracked| tracked.message.state)
    }

    /// Number of tracked messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The correlations backing the tracked messages
    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }
}
