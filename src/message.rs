use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::correlation::CorrelationId;

/// Message used in body of communication
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Contents of body of the message
    pub body: Vec<u8>,
    pub(crate) properties: HashMap<String, String>,
    pub(crate) system_properties: HashMap<String, String>,
}

impl Message {
    /// Create with contents of body as message bytes
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    /// Get a builder instance for building up a message
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Application properties
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// System properties keyed by wire id, such as `$.mid`
    pub fn system_properties(&self) -> &HashMap<String, String> {
        &self.system_properties
    }

    /// The message id, if one was set
    pub fn message_id(&self) -> Option<&str> {
        self.system_properties.get("$.mid").map(String::as_str)
    }

    /// The content type, if one was set
    pub fn content_type(&self) -> Option<&str> {
        self.system_properties.get("$.ct").map(String::as_str)
    }
}

/// Builder for constructing Message instances
#[derive(Debug, Default)]
pub struct MessageBuilder {
    message: Option<Vec<u8>>,
    properties: HashMap<String, String>,
    system_properties: HashMap<String, String>,
}

impl MessageBuilder {
    /// Set the message body
    pub fn set_body(mut self, body: Vec<u8>) -> Self {
        self.message = Some(body);
        self
    }

    /// Set the identifier for this message
    pub fn set_message_id(self, message_id: String) -> Self {
        self.set_system_property("$.mid", message_id)
    }

    /// Set the content-type for this message, such as `text/plain`.
    /// To allow routing query on the message body, this value should be set to `application/json`
    pub fn set_content_type(self, content_type: String) -> Self {
        self.set_system_property("$.ct", content_type)
    }

    /// Set the content-encoding for this message.
    /// If the content-type is set to `application/json`, allowed values are `UTF-8`, `UTF-16`, `UTF-32`.
    pub fn set_content_encoding(self, content_encoding: String) -> Self {
        self.set_system_property("$.ce", content_encoding)
    }

    /// System properties that are user settable
    /// https://docs.microsoft.com/azure/iot-hub/iot-hub-devguide-messages-construct#system-properties-of-d2c-iot-hub-messages
    fn set_system_property(mut self, property_name: &str, value: String) -> Self {
        self.system_properties
            .insert(property_name.to_owned(), value);
        self
    }

    /// Add a message property
    pub fn add_message_property(mut self, key: String, value: String) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Build into a message instance. A missing body is empty.
    pub fn build(self) -> Message {
        Message {
            body: self.message.unwrap_or_default(),
            properties: self.properties,
            system_properties: self.system_properties,
        }
    }
}

/// What an outbound message asks of the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Device to cloud telemetry
    Telemetry,
    /// Reported property patch; the body is the JSON patch
    TwinPatch,
    /// Request for the full twin document
    TwinGet,
    /// Response to a direct method invocation
    CommandResponse {
        /// Request id of the invocation being answered
        request_id: String,
        /// Status reported back to the invoker
        status: i32,
    },
    /// Request for a blob SAS uri to upload a file to
    FileUploadRequest {
        /// Name of the blob to create
        blob_name: String,
    },
    /// Notification that an upload finished; the body is the JSON notification
    FileUploadComplete,
}

/// Delivery lifecycle of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Accepted from the caller, not yet handed to a transport
    Pending,
    /// Handed to a transport, awaiting confirmation
    Sent,
    /// Confirmed by the hub
    Acknowledged,
    /// Permanently failed
    Failed,
}

impl DeliveryState {
    /// Acknowledged or failed
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Acknowledged | DeliveryState::Failed)
    }
}

/// A message tracked for at-least-once delivery
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Id assigned at submission
    pub correlation_id: CorrelationId,
    /// Operation requested
    pub kind: MessageKind,
    /// Payload and properties
    pub message: Message,
    /// Current delivery state
    pub state: DeliveryState,
    /// When the caller submitted it
    pub submitted_at: Instant,
    /// Number of times it was handed to a transport after the first
    pub retry_count: u32,
}

impl OutboundMessage {
    /// A fresh pending message
    pub fn new(correlation_id: CorrelationId, kind: MessageKind, message: Message) -> Self {
        Self {
            correlation_id,
            kind,
            message,
            state: DeliveryState::Pending,
            submitted_at: Instant::now(),
            retry_count: 0,
        }
    }
}

/// Response payload for request/response operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    /// Status code reported by the hub
    pub status: u16,
    /// Response body
    pub body: Vec<u8>,
    /// Twin version, when the hub reports one
    pub version: Option<u64>,
}

impl ServiceResponse {
    /// A response without a twin version
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            body,
            version: None,
        }
    }

    /// Deserialize the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            crate::Error::transport(crate::error::TransportErrorKind::Protocol, e)
        })
    }
}

/// Protocol specific handle used to settle an inbound message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub(crate) String);

impl DeliveryTag {
    /// Wrap a protocol specific tag
    pub fn new(tag: impl ToString) -> Self {
        Self(tag.to_string())
    }

    /// The raw tag: MQTT packet id, HTTPS etag or AMQP delivery id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// How to settle an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; the hub removes it
    Complete,
    /// Put it back for later redelivery
    Abandon,
    /// Dead-letter it
    Reject,
}

/// Kind of an inbound notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// Cloud to device message
    CloudToDevice,
    /// Desired properties patch
    DesiredPropertyUpdate {
        /// Twin version of the patch
        version: Option<u64>,
    },
    /// Direct method invocation
    DirectMethod {
        /// Method being invoked
        method_name: String,
        /// Request id to answer with
        request_id: String,
    },
    /// Service side notification that a device finished a file upload
    FileUploadNotification,
}

/// Message pushed by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundNotification {
    /// What the payload represents
    pub kind: NotificationKind,
    /// Payload and properties
    pub message: Message,
    /// Handle for settling the message, when the protocol requires it
    pub delivery_tag: Option<DeliveryTag>,
}

impl InboundNotification {
    /// The invocation details, for direct method notifications
    pub fn direct_method(&self) -> Option<DirectMethodInvocation> {
        match &self.kind {
            NotificationKind::DirectMethod {
                method_name,
                request_id,
            } => Some(DirectMethodInvocation {
                method_name: method_name.clone(),
                request_id: request_id.clone(),
                message: self.message.clone(),
            }),
            _ => None,
        }
    }
}

/// Details about a cloud to device direct method invocation call
#[derive(Debug, Clone)]
pub struct DirectMethodInvocation {
    ///
    pub method_name: String,
    ///
    pub message: Message,
    ///
    pub request_id: String,
}

/// Instance to respond to a direct method invocation
#[derive(Debug)]
pub struct DirectMethodResponse {
    pub(crate) status: i32,
    pub(crate) request_id: String,
    pub(crate) body: String,
}

impl DirectMethodResponse {
    /// Make a new direct method response
    pub fn new(request_id: String, status: i32, body: Option<String>) -> Self {
        Self {
            status,
            request_id,
            body: body.unwrap_or_default(),
        }
    }
}

/// Body of a file upload SAS uri request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadSasUriRequest {
    /// Name of the blob to create
    pub blob_name: String,
}

/// Storage details returned for a file upload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadSasUriResponse {
    /// Id to quote in the completion notification
    pub correlation_id: String,
    /// Storage account host
    pub host_name: String,
    /// Storage container
    pub container_name: String,
    /// Blob name
    pub blob_name: String,
    /// SAS query string granting write access
    pub sas_token: String,
}

impl FileUploadSasUriResponse {
    /// Full blob uri including the SAS query
    pub fn blob_uri(&self) -> String {
        format!(
            "https://{}/{}/{}{}",
            self.host_name, self.container_name, self.blob_name, self.sas_token
        )
    }
}

/// Outcome of a file upload reported back to the hub
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadCompletionNotification {
    /// Correlation id from [`FileUploadSasUriResponse`]
    pub correlation_id: String,
    /// Whether the upload succeeded
    pub is_success: bool,
    /// Storage status code
    pub status_code: i32,
    /// Free form description
    pub status_description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_content_type() {
        let builder = Message::builder();
        let msg = builder
            .set_content_type("application/json".to_owned())
            .set_body(vec![])
            .build();

        assert_eq!(msg.content_type(), Some("application/json"));
    }

    #[test]
    fn test_setting_content_encoding() {
        let builder = Message::builder();
        let msg = builder
            .set_content_type("application/json".to_owned())
            .set_content_encoding("UTF-8".to_owned())
            .set_body(vec![])
            .build();

        assert_eq!(msg.system_properties()["$.ce"], "UTF-8");
    }

    #[test]
    fn missing_body_builds_empty() {
        let msg = Message::builder().set_message_id("m1".into()).build();
        assert!(msg.body.is_empty());
        assert_eq!(msg.message_id(), Some("m1"));
    }

    #[test]
    fn sas_uri_response_uses_hub_field_names() {
        let response: FileUploadSasUriResponse = serde_json::from_str(
            r#"{"correlationId":"c1","hostName":"acct.blob.core.windows.net","containerName":"uploads","blobName":"dev/file.txt","sasToken":"?sv=2018&sig=x"}"#,
        )
        .unwrap();
        assert_eq!(
            response.blob_uri(),
            "https://acct.blob.core.windows.net/uploads/dev/file.txt?sv=2018&sig=x"
        );
    }

    #[test]
    fn completion_notification_serializes_camel_case() {
        let body = serde_json::to_value(FileUploadCompletionNotification {
            correlation_id: "c1".into(),
            is_success: true,
            status_code: 200,
            status_description: "ok".into(),
        })
        .unwrap();
        assert_eq!(body["isSuccess"], true);
        assert_eq!(body["statusCode"], 200);
    }
}
