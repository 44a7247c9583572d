//! Transport core for Azure IoT Hub clients
//!
//! One logical connection per client, driven by a background worker that handles connect,
//! reconnect with exponential backoff, at-least-once delivery of outbound messages and correlation
//! of requests with their responses. The wire protocol is pluggable through
//! [`transport::Transport`].
//!
//! ## Feature flags
//!
//! - `mqtt-transport` (default): MQTT 3.1.1 over TLS
//! - `https-transport` (default): HTTPS request/response with cloud to device polling
//! - `amqp-transport`: AMQP 1.0, including the service side file upload notification receiver
//!
//! ```toml
//! azure_iot_transport = { version = "0.8.0", features = ["amqp-transport"] }
//! ```
//!
//! # Examples
//!
//! A simple client
//! ```no_run
//! use azure_iot_transport::{IoTHubClient, Message};
//! use tokio::time;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = IoTHubClient::builder()
//!         .connection_string("HostName=iothubname.azure-devices.net;DeviceId=MyDeviceId;SharedAccessKey=TheAccessKey")?
//!         .build()
//!         .await?;
//!     client.open().await?;
//!
//!     let mut interval = time::interval(time::Duration::from_secs(1));
//!     let mut count: u32 = 0;
//!
//!     loop {
//!         interval.tick().await;
//!
//!         let msg = Message::builder()
//!             .set_body(format!("Message #{}", count).as_bytes().to_vec())
//!             .set_message_id(format!("{}-t", count))
//!             .build();
//!
//!         client.send_message(msg).await?;
//!
//!         count += 1;
//!     }
//! }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, missing_docs)]

#[macro_use]
extern crate log;

/// IoT SDK package version
pub const SDK_VERSION: &str = std::env!("CARGO_PKG_VERSION");

/// The IoT Hub client
pub mod client;
/// Builder for the IoT Hub client
pub mod client_builder;
pub mod connection;
pub mod correlation;
pub mod delivery;
pub mod dtmi;
/// Errors
pub mod error;
/// Message types for communicating with the IoT Hub
pub mod message;
/// Client configuration
pub mod options;
pub mod retry;
pub mod service;
/// Credentials and shared access signatures
pub mod token;
pub mod transport;

pub use client::{DeliveryHandle, IoTHubClient};
pub use client_builder::{IoTHubClientBuilder, IoTHubClientBuilderError};
pub use connection::{ClientEvent, ConnectionState, ConnectionStatusReason};
pub use correlation::{CorrelationId, Delivered};
pub use error::{Error, Result, TransportErrorKind};
pub use message::{
    DeliveryState, DeliveryTag, DirectMethodInvocation, DirectMethodResponse, Disposition,
    FileUploadCompletionNotification, FileUploadSasUriResponse, InboundNotification, Message,
    MessageBuilder, MessageKind, NotificationKind, OutboundMessage, ServiceResponse,
};
pub use options::{ClientOptions, ProxySettings, RetryOptions};
pub use retry::{FailureKind, RetryDecision, RetryPolicy};
pub use service::{FileUploadNotification, FileUploadNotificationReceiver};
pub use token::{
    ConnectionString, DeviceKeyTokenSource, SasTokenSource, ServiceKeyTokenSource, TokenError,
    TokenProvider, TokenSource,
};
pub use transport::{SendOutcome, Transport, TransportEvent, TransportProtocol};
