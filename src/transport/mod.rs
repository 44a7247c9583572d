//! Protocol adapters
//!
//! Each adapter translates [`OutboundMessage`]s into protocol framing and protocol traffic back
//! into [`TransportEvent`]s. The connection state machine only sees the [`Transport`] trait.

use async_trait::async_trait;

use crate::correlation::CorrelationId;
use crate::message::{DeliveryTag, Disposition, InboundNotification, OutboundMessage, ServiceResponse};
use crate::{Error, Result};

#[cfg(feature = "amqp-transport")]
pub mod amqp;
#[cfg(feature = "https-transport")]
pub mod https;
#[cfg(feature = "mqtt-transport")]
pub mod mqtt;
#[cfg(any(feature = "mqtt-transport", feature = "https-transport"))]
pub(crate) mod net;

/// Protocol used to reach the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    /// MQTT 3.1.1 over TLS on port 8883
    Mqtt,
    /// HTTPS request/response with cloud to device polling
    Https,
    /// AMQP 1.0 over TLS on port 5671
    Amqp,
}

/// Result of handing a message to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The hub confirmed the message as part of the send
    Acknowledged(Option<ServiceResponse>),
    /// Confirmation arrives later as a [`TransportEvent`]
    AwaitingAck,
}

/// Something the transport observed
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The hub confirmed an earlier send
    Acknowledged {
        /// Id of the confirmed message
        correlation_id: CorrelationId,
        /// Response payload for request/response operations
        response: Option<ServiceResponse>,
    },
    /// The hub answered an earlier send with a failure
    Rejected {
        /// Id of the rejected message
        correlation_id: CorrelationId,
        /// Reported failure
        error: Error,
    },
    /// The hub pushed a message
    Notification(InboundNotification),
    /// The link is gone
    Disconnected(Error),
}

/// Capability set shared by every protocol adapter
///
/// `receive` is polled concurrently with other work and dropped whenever something else is
/// ready first, so implementations must not lose data when its future is dropped.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Protocol implemented by this adapter
    fn protocol(&self) -> TransportProtocol;

    /// Establish the link. Called again after `close` when reconnecting.
    async fn connect(&mut self) -> Result<()>;

    /// Hand a message to the hub
    async fn send(&mut self, message: &OutboundMessage) -> Result<SendOutcome>;

    /// Wait for the next event. An error means the link is unusable.
    async fn receive(&mut self) -> Result<TransportEvent>;

    /// Settle an inbound message
    async fn acknowledge(&mut self, tag: &DeliveryTag, disposition: Disposition) -> Result<()>;

    /// Release the link. Closing a closed transport is a no-op.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    fn protocol(&self) -> TransportProtocol {
        (**self).protocol()
    }

    async fn connect(&mut self) -> Result<()> {
        (**self).connect().await
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<SendOutcome> {
        (**self).send(message).await
    }

    async fn receive(&mut self) -> Result<TransportEvent> {
        (**self).receive().await
    }

    async fn acknowledge(&mut self, tag: &DeliveryTag, disposition: Disposition) -> Result<()> {
        (**self).acknowledge(tag, disposition).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}
