use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::connection::{ClientEvent, Command, Connection, ConnectionState};
use crate::correlation::{deadline_after, CorrelationId, Delivered};
use crate::message::{
    DeliveryTag, DirectMethodResponse, Disposition, FileUploadCompletionNotification,
    FileUploadSasUriResponse, Message, MessageKind, OutboundMessage,
};
use crate::options::ClientOptions;
use crate::transport::Transport;
use crate::{Error, Result};

/// Pending outcome of a submitted message
///
/// Resolves exactly once, with [`Delivered`] when the hub confirmed the message or with the
/// error that ended its delivery. Await it from async code or call
/// [`wait_blocking`](DeliveryHandle::wait_blocking) from a plain thread.
#[derive(Debug)]
pub struct DeliveryHandle {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<Result<Delivered>>,
}

impl DeliveryHandle {
    /// Id the message was submitted under
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Block the current thread until the message reaches a terminal state.
    /// Must not be called from within an async runtime.
    pub fn wait_blocking(self) -> Result<Delivered> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(Error::Cancelled))
    }
}

impl Future for DeliveryHandle {
    type Output = Result<Delivered>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(Error::Cancelled)))
    }
}

/// Client for communicating with IoT hub
///
/// Cheap to clone; every clone talks to the same background connection worker. The worker
/// closes the connection and stops once the last clone is dropped.
#[derive(Debug, Clone)]
pub struct IoTHubClient {
    device_id: String,
    next_id: Arc<AtomicU64>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: Arc<Mutex<Option<mpsc::Receiver<ClientEvent>>>>,
    operation_timeout: Duration,
}

impl IoTHubClient {
    /// Create a client driving `transport`. The connection starts `Closed`; call
    /// [`open`](IoTHubClient::open) to connect.
    ///
    /// Must be called from within a tokio runtime, which runs the connection worker.
    ///
    /// # Example
    /// ```no_run
    /// use azure_iot_transport::transport::mqtt::MqttTransport;
    /// use azure_iot_transport::{ClientOptions, DeviceKeyTokenSource, IoTHubClient, Message};
    ///
    /// #[tokio::main]
    /// async fn main() -> azure_iot_transport::Result<()> {
    ///     let iothub_hostname = "iothubname.azure-devices.net";
    ///     let device_id = "MyDeviceId";
    ///     let token_source =
    ///         DeviceKeyTokenSource::new(iothub_hostname, device_id, "TheAccessKey")?;
    ///     let options = ClientOptions::default();
    ///     let transport = MqttTransport::new(
    ///         iothub_hostname,
    ///         device_id,
    ///         token_source.into(),
    ///         options.clone(),
    ///     );
    ///
    ///     let client = IoTHubClient::with_transport(transport, iothub_hostname, device_id, options)?;
    ///     client.open().await?;
    ///     client.send_message(Message::new(b"hello".to_vec())).await?;
    ///     Ok(())
    /// }
    /// ```
    pub fn with_transport<T: Transport>(
        transport: T,
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self> {
        Self::spawn(transport, hostname.into(), device_id.into(), options, false)
    }

    pub(crate) fn spawn<T: Transport>(
        transport: T,
        hostname: String,
        device_id: String,
        options: ClientOptions,
        renewable: bool,
    ) -> Result<Self> {
        options.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(options.event_channel_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let operation_timeout = options.operation_timeout();

        let connection = Connection::new(
            transport,
            hostname,
            device_id.clone(),
            options,
            renewable,
            commands_rx,
            events_tx,
            state_tx,
        );
        tokio::spawn(connection.run());

        Ok(Self {
            device_id,
            next_id: Arc::new(AtomicU64::new(1)),
            commands: commands_tx,
            state: state_rx,
            events: Arc::new(Mutex::new(Some(events_rx))),
            operation_timeout,
        })
    }

    /// The device this client acts as
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn request<R>(&self, command: impl FnOnce(oneshot::Sender<Result<R>>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Connect to the hub. Resolves once the connection is `Open` or has failed permanently;
    /// concurrent calls share the same attempt.
    pub async fn open(&self) -> Result<()> {
        self.request(Command::Open).await
    }

    /// Disconnect, cancelling every outstanding operation. Closing a closed client is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.request(Command::Close).await
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait for the next connection state change
    pub async fn state_changed(&mut self) -> Result<ConnectionState> {
        self.state
            .changed()
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(*self.state.borrow())
    }

    /// Take the stream of connection status changes and hub notifications.
    /// Only the first call across all clones gets the receiver.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }

    /// Submit a message with the default operation timeout
    pub fn submit(&self, kind: MessageKind, message: Message) -> DeliveryHandle {
        self.submit_with_timeout(kind, message, self.operation_timeout)
    }

    /// Submit a message that fails with [`Error::Timeout`] unless it completes within `timeout`.
    /// Returns immediately; the message is delivered in the background.
    pub fn submit_with_timeout(
        &self,
        kind: MessageKind,
        message: Message,
        timeout: Duration,
    ) -> DeliveryHandle {
        let correlation_id = CorrelationId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (completion, receiver) = oneshot::channel();
        let command = Command::Submit {
            message: OutboundMessage::new(correlation_id, kind, message),
            deadline: deadline_after(Instant::now(), timeout),
            completion,
        };
        if let Err(mpsc::error::SendError(Command::Submit { completion, .. })) =
            self.commands.send(command)
        {
            let _ = completion.send(Err(Error::ConnectionClosed));
        }
        DeliveryHandle {
            correlation_id,
            receiver,
        }
    }

    /// Stop delivering a submitted message; its handle resolves with [`Error::Cancelled`]
    pub fn cancel(&self, correlation_id: CorrelationId) {
        let _ = self.commands.send(Command::Cancel(correlation_id));
    }

    /// Send a device to cloud message for this device to the IoT Hub
    ///
    /// # Example
    /// ```no_run
    /// use tokio::time;
    /// use azure_iot_transport::{IoTHubClient, Message};
    ///
    /// async fn telemetry(client: IoTHubClient) -> azure_iot_transport::Result<()> {
    ///     let mut interval = time::interval(time::Duration::from_secs(1));
    ///     let mut count: u32 = 0;
    ///
    ///     loop {
    ///         interval.tick().await;
    ///
    ///         let msg = Message::builder()
    ///             .set_body(format!("Message #{}", count).as_bytes().to_vec())
    ///             .set_message_id(format!("{}-t", count))
    ///             .build();
    ///
    ///         client.send_message(msg).await?;
    ///
    ///         count += 1;
    ///     }
    /// }
    /// ```
    pub async fn send_message(&self, message: Message) -> Result<Delivered> {
        self.submit(MessageKind::Telemetry, message).await
    }

    /// Blocking variant of [`send_message`](IoTHubClient::send_message) for non-async threads
    pub fn send_message_blocking(&self, message: Message) -> Result<Delivered> {
        self.submit(MessageKind::Telemetry, message).wait_blocking()
    }

    /// Send a property update from the device to the cloud
    ///
    /// Property updates sent from the device are used to publish the
    /// device's current values for "properties" in IoTCentral terminology
    /// or Device Twin Attributes in IoTHub terminology. The body of the
    /// message should be JSON encoded with a map of names to values.
    ///
    /// Resolves with the new reported properties version once the hub accepted the patch.
    pub async fn send_property_update(&self, body: &str) -> Result<Option<u64>> {
        let delivered = self
            .submit(
                MessageKind::TwinPatch,
                Message::new(body.as_bytes().to_vec()),
            )
            .await?;
        Ok(delivered.response.and_then(|response| response.version))
    }

    /// Fetch the full twin document
    pub async fn get_twin(&self) -> Result<serde_json::Value> {
        let delivered = self.submit(MessageKind::TwinGet, Message::new(vec![])).await?;
        match delivered.response {
            Some(response) => response.json(),
            None => Err(Error::transport(
                crate::error::TransportErrorKind::Protocol,
                "twin response carried no document",
            )),
        }
    }

    /// Answer a direct method invocation
    pub async fn respond_to_direct_method(
        &self,
        response: DirectMethodResponse,
    ) -> Result<Delivered> {
        let kind = MessageKind::CommandResponse {
            request_id: response.request_id,
            status: response.status,
        };
        self.submit(kind, Message::new(response.body.into_bytes()))
            .await
    }

    /// Ask the hub for a blob SAS uri to upload `blob_name` to
    pub async fn request_file_upload_sas(
        &self,
        blob_name: impl Into<String>,
    ) -> Result<FileUploadSasUriResponse> {
        let kind = MessageKind::FileUploadRequest {
            blob_name: blob_name.into(),
        };
        let delivered = self.submit(kind, Message::new(vec![])).await?;
        match delivered.response {
            Some(response) => response.json(),
            None => Err(Error::transport(
                crate::error::TransportErrorKind::Protocol,
                "file upload response carried no storage details",
            )),
        }
    }

    /// Tell the hub a file upload finished
    pub async fn complete_file_upload(
        &self,
        notification: &FileUploadCompletionNotification,
    ) -> Result<Delivered> {
        let body =
            serde_json::to_vec(notification).map_err(|e| Error::configuration(e.to_string()))?;
        let message = Message::builder()
            .set_body(body)
            .set_content_type("application/json".to_owned())
            .build();
        self.submit(MessageKind::FileUploadComplete, message).await
    }

    /// Settle an inbound message identified by its delivery tag
    pub async fn acknowledge(&self, tag: &DeliveryTag, disposition: Disposition) -> Result<()> {
        let tag = tag.clone();
        self.request(|reply| Command::Acknowledge {
            tag,
            disposition,
            reply,
        })
        .await
    }
}
