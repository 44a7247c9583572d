//! Service side receiver for file upload notifications
//!
//! The hub emits a notification on `/messages/serviceBound/filenotifications` every time a
//! device completes a file upload. A notification is completed only after it was parsed and
//! handed to the caller, so a crash in between sees it delivered again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::time::{self, Instant};

use crate::error::TransportErrorKind;
use crate::message::{Disposition, InboundNotification, NotificationKind};
use crate::transport::{Transport, TransportEvent};
use crate::{Error, Result};

/// Receive timeout used by [`FileUploadNotificationReceiver::receive`]
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(60_000);

/// A device finished uploading a blob
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadNotification {
    /// Device that uploaded the file
    pub device_id: String,
    /// Full blob uri
    pub blob_uri: String,
    /// Blob name, prefixed with the device id
    pub blob_name: String,
    /// When storage last changed the blob
    pub last_updated_time: DateTime<Utc>,
    /// Size of the blob
    pub blob_size_in_bytes: u64,
    /// When the hub queued the notification
    pub enqueued_time_utc: DateTime<Utc>,
}

/// Receives file upload notifications over a service connection
#[derive(Debug)]
pub struct FileUploadNotificationReceiver<T: Transport> {
    transport: T,
    open: bool,
}

#[cfg(feature = "amqp-transport")]
impl FileUploadNotificationReceiver<crate::transport::amqp::AmqpTransport> {
    /// Receiver for the hub named by a service connection string
    /// (`HostName=...;SharedAccessKeyName=...;SharedAccessKey=...`)
    pub fn from_connection_string(
        connection_string: &str,
        options: crate::ClientOptions,
    ) -> Result<Self> {
        options.validate()?;
        let parsed = crate::token::ConnectionString::parse(connection_string)?;
        let credentials = parsed.service_credentials()?;
        crate::connection::validate_identity(&parsed.host_name, credentials.policy_name())?;
        Ok(Self::new(
            crate::transport::amqp::AmqpTransport::file_notifications(
                parsed.host_name,
                credentials,
                options,
            ),
        ))
    }
}

impl<T: Transport> FileUploadNotificationReceiver<T> {
    /// Wrap a transport bound to the file notification endpoint
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            open: false,
        }
    }

    /// Connect. Opening an open receiver is a no-op.
    pub async fn open(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }
        self.transport.connect().await?;
        self.open = true;
        info!("File upload notification receiver opened");
        Ok(())
    }

    /// Disconnect. Closing a closed receiver is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.transport.close().await
    }

    /// Wait up to a minute for the next notification
    pub async fn receive(&mut self) -> Result<Option<FileUploadNotification>> {
        self.receive_timeout(DEFAULT_RECEIVE_TIMEOUT).await
    }

    /// Wait up to `timeout` for the next notification; `None` when none arrived in time
    pub async fn receive_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<FileUploadNotification>> {
        if !self.open {
            return Err(Error::ConnectionClosed);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let event = match time::timeout_at(deadline, self.transport.receive()).await {
                Err(_) => return Ok(None),
                Ok(Ok(event)) => event,
                Ok(Err(err)) => {
                    self.open = false;
                    return Err(err);
                }
            };
            match event {
                TransportEvent::Notification(notification)
                    if notification.kind == NotificationKind::FileUploadNotification =>
                {
                    return self.accept(notification).await.map(Some);
                }
                TransportEvent::Notification(other) => {
                    debug!("Ignoring {:?} on the file notification link", other.kind)
                }
                TransportEvent::Disconnected(err) => {
                    self.open = false;
                    return Err(err);
                }
                TransportEvent::Acknowledged { .. } | TransportEvent::Rejected { .. } => {}
            }
        }
    }

    async fn accept(
        &mut self,
        notification: InboundNotification,
    ) -> Result<FileUploadNotification> {
        let parsed = serde_json::from_slice::<FileUploadNotification>(&notification.message.body);
        let disposition = if parsed.is_ok() {
            Disposition::Complete
        } else {
            Disposition::Reject
        };
        if let Some(tag) = &notification.delivery_tag {
            self.transport.acknowledge(tag, disposition).await?;
        }
        parsed.map_err(|e| {
            warn!("Rejected malformed file upload notification: {}", e);
            Error::transport(TransportErrorKind::Protocol, e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_uses_hub_field_names() {
        let notification: FileUploadNotification = serde_json::from_str(
            r#"{
                "deviceId": "dev1",
                "blobUri": "https://acct.blob.core.windows.net/uploads/dev1/file.txt",
                "blobName": "dev1/file.txt",
                "lastUpdatedTime": "2026-10-14T08:00:00Z",
                "blobSizeInBytes": 42,
                "enqueuedTimeUtc": "2026-10-14T08:00:01Z"
            }"#,
        )
        .unwrap();
        assert_eq!(notification.device_id, "dev1");
        assert_eq!(notification.blob_size_in_bytes, 42);
    }
}
