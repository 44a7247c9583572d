use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use fe2o3_amqp::connection::{ConnectionHandle, OpenError};
use fe2o3_amqp::link::delivery::Delivery;
use fe2o3_amqp::sasl_profile::SaslProfile;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::messaging::{
    AmqpValue, ApplicationProperties, Body, Data, Message as AmqpMessage, MessageId, Outcome,
    Properties,
};
use fe2o3_amqp::types::primitives::{Binary, Value};
use fe2o3_amqp::{Connection, Receiver, Sender, Session};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{SendOutcome, Transport, TransportEvent, TransportProtocol};
use crate::error::TransportErrorKind;
use crate::message::{
    DeliveryTag, Disposition, InboundNotification, Message, MessageKind, NotificationKind,
    OutboundMessage,
};
use crate::options::ClientOptions;
use crate::token::{ServiceKeyTokenSource, TokenProvider, TokenSource};
use crate::{Error, Result};

const AMQPS_PORT: u16 = 5671;
const FILE_NOTIFICATION_ADDRESS: &str = "/messages/serviceBound/filenotifications";

fn link_error(err: impl fmt::Display) -> Error {
    Error::transport(TransportErrorKind::Reset, err)
}

fn open_error(err: OpenError) -> Error {
    match err {
        OpenError::SaslError { .. } => Error::service(401, "hub refused the SASL credentials"),
        other => link_error(other),
    }
}

fn hub_name(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}

fn body_bytes(body: &Body<Value>) -> Vec<u8> {
    match body {
        Body::Data(batch) => batch
            .iter()
            .flat_map(|data| data.0.iter().copied())
            .collect(),
        Body::Value(AmqpValue(Value::Binary(bytes))) => bytes.to_vec(),
        Body::Value(AmqpValue(Value::String(text))) => text.clone().into_bytes(),
        _ => Vec::new(),
    }
}

fn inbound_message(delivery: &Delivery<Body<Value>>) -> Message {
    let source = delivery.message();
    let mut message = Message::new(body_bytes(&source.body));
    if let Some(properties) = &source.properties {
        if let Some(id) = &properties.message_id {
            let id = match id {
                MessageId::String(id) => id.clone(),
                other => format!("{:?}", other),
            };
            message.system_properties.insert("$.mid".to_owned(), id);
        }
    }
    if let Some(application_properties) = &source.application_properties {
        for (key, value) in application_properties.0.iter() {
            if let Value::String(value) = value {
                message.properties.insert(key.clone(), value.clone());
            }
        }
    }
    message
}

type SettleRequest = (DeliveryTag, Disposition, oneshot::Sender<Result<()>>);

async fn settle(
    receiver: &mut Receiver,
    delivery: Delivery<Body<Value>>,
    disposition: Disposition,
) -> Result<()> {
    match disposition {
        Disposition::Complete => receiver.accept(&delivery).await.map_err(link_error),
        Disposition::Abandon => receiver.release(&delivery).await.map_err(link_error),
        Disposition::Reject => receiver
            .reject(&delivery, None)
            .await
            .map_err(link_error),
    }
}

/// Owns the receiver link so unsettled deliveries survive a dropped `receive` future
async fn read_deliveries(
    mut receiver: Receiver,
    kind: NotificationKind,
    events: mpsc::Sender<TransportEvent>,
    mut settle_requests: mpsc::Receiver<SettleRequest>,
) {
    let mut unsettled: HashMap<DeliveryTag, Delivery<Body<Value>>> = HashMap::new();
    let mut next_tag: u64 = 0;
    loop {
        tokio::select! {
            biased;

            request = settle_requests.recv() => {
                let (tag, disposition, reply) = match request {
                    Some(request) => request,
                    None => break,
                };
                let outcome = match unsettled.remove(&tag) {
                    Some(delivery) => settle(&mut receiver, delivery, disposition).await,
                    None => Err(Error::configuration(format!("unknown delivery tag {}", tag.as_str()))),
                };
                let _ = reply.send(outcome);
            }
            delivery = receiver.recv::<Body<Value>>() => {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        let _ = events.send(TransportEvent::Disconnected(link_error(err))).await;
                        break;
                    }
                };
                next_tag += 1;
                let tag = DeliveryTag::new(next_tag);
                let notification = InboundNotification {
                    kind: kind.clone(),
                    message: inbound_message(&delivery),
                    delivery_tag: Some(tag.clone()),
                };
                trace!("AMQP delivery {} received", tag.as_str());
                unsettled.insert(tag, delivery);
                if events.send(TransportEvent::Notification(notification)).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = receiver.close().await;
}

struct AmqpLink {
    connection: ConnectionHandle<()>,
    session: SessionHandle<()>,
    sender: Option<Sender>,
    events: mpsc::Receiver<TransportEvent>,
    settle_requests: mpsc::Sender<SettleRequest>,
    reader: JoinHandle<()>,
}

/// AMQP 1.0 adapter, usable for a device or for a service side receiver
pub struct AmqpTransport {
    hostname: String,
    username: String,
    token: TokenProvider,
    token_ttl: chrono::Duration,
    send_address: Option<String>,
    receive_address: String,
    notification_kind: NotificationKind,
    link: Option<AmqpLink>,
}

impl fmt::Debug for AmqpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpTransport")
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("receive_address", &self.receive_address)
            .field("connected", &self.link.is_some())
            .finish()
    }
}

impl AmqpTransport {
    /// Device endpoint: telemetry out, cloud to device messages in
    pub fn device(
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        token: TokenProvider,
        options: ClientOptions,
    ) -> Self {
        let hostname = hostname.into();
        let device_id = device_id.into();
        Self {
            username: format!("{}@sas.{}", device_id, hub_name(&hostname)),
            send_address: Some(format!("/devices/{}/messages/events", device_id)),
            receive_address: format!("/devices/{}/messages/deviceBound", device_id),
            notification_kind: NotificationKind::CloudToDevice,
            hostname,
            token,
            token_ttl: chrono::Duration::seconds(options.token_ttl_secs as i64),
            link: None,
        }
    }

    /// Service endpoint receiving file upload notifications
    pub fn file_notifications(
        hostname: impl Into<String>,
        credentials: ServiceKeyTokenSource,
        options: ClientOptions,
    ) -> Self {
        let hostname = hostname.into();
        Self {
            username: format!("{}@sas.root.{}", credentials.policy_name(), hub_name(&hostname)),
            send_address: None,
            receive_address: FILE_NOTIFICATION_ADDRESS.to_owned(),
            notification_kind: NotificationKind::FileUploadNotification,
            hostname,
            token: credentials.into(),
            token_ttl: chrono::Duration::seconds(options.token_ttl_secs as i64),
            link: None,
        }
    }

    fn link(&mut self) -> Result<&mut AmqpLink> {
        self.link
            .as_mut()
            .ok_or_else(|| Error::transport(TransportErrorKind::Reset, "amqp link is not connected"))
    }
}

fn outbound_message(message: &OutboundMessage) -> AmqpMessage<Data> {
    let mut properties = Properties::builder();
    let message_id = message
        .message
        .message_id()
        .map(str::to_owned)
        .unwrap_or_else(|| message.correlation_id.to_string());
    properties = properties.message_id(message_id);
    if let Some(content_type) = message.message.content_type() {
        properties = properties.content_type(content_type.to_owned());
    }

    let mut application_properties = ApplicationProperties::builder();
    for (key, value) in message.message.properties() {
        application_properties = application_properties.insert(key.clone(), value.clone());
    }

    AmqpMessage::builder()
        .properties(properties.build())
        .application_properties(application_properties.build())
        .data(Binary::from(message.message.body.clone()))
        .build()
}

#[async_trait]
impl Transport for AmqpTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Amqp
    }

    async fn connect(&mut self) -> Result<()> {
        self.close().await?;

        let password = self.token.get(&(Utc::now() + self.token_ttl))?;
        let url = format!("amqps://{}:{}", self.hostname, AMQPS_PORT);
        let mut connection = Connection::builder()
            .container_id(self.username.clone())
            .hostname(self.hostname.as_str())
            .sasl_profile(SaslProfile::Plain {
                username: self.username.clone(),
                password,
            })
            .open(url.as_str())
            .await
            .map_err(open_error)?;
        let mut session = Session::begin(&mut connection).await.map_err(link_error)?;

        let sender = match &self.send_address {
            Some(address) => Some(
                Sender::attach(&mut session, "telemetry-sender", address.as_str())
                    .await
                    .map_err(link_error)?,
            ),
            None => None,
        };
        let receiver = Receiver::attach(
            &mut session,
            "notification-receiver",
            self.receive_address.as_str(),
        )
        .await
        .map_err(link_error)?;
        info!("AMQP link to {} established", self.hostname);

        let (events_tx, events_rx) = mpsc::channel(16);
        let (settle_tx, settle_rx) = mpsc::channel(16);
        let reader = tokio::spawn(read_deliveries(
            receiver,
            self.notification_kind.clone(),
            events_tx,
            settle_rx,
        ));

        self.link = Some(AmqpLink {
            connection,
            session,
            sender,
            events: events_rx,
            settle_requests: settle_tx,
            reader,
        });
        Ok(())
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<SendOutcome> {
        if message.kind != MessageKind::Telemetry {
            return Err(Error::unsupported(format!(
                "{:?} is not available over AMQP",
                message.kind
            )));
        }
        let link = self.link()?;
        let sender = link
            .sender
            .as_mut()
            .ok_or_else(|| Error::unsupported("this AMQP endpoint only receives"))?;

        let outcome = sender
            .send(outbound_message(message))
            .await
            .map_err(link_error)?;
        match outcome {
            Outcome::Accepted(_) => Ok(SendOutcome::Acknowledged(None)),
            Outcome::Rejected(rejected) => Err(Error::service(
                400,
                format!("message rejected: {:?}", rejected),
            )),
            Outcome::Released(_) | Outcome::Modified(_) => Err(Error::transport(
                TransportErrorKind::Reset,
                "message released by the hub",
            )),
            #[allow(unreachable_patterns)]
            other => Err(Error::transport(
                TransportErrorKind::Protocol,
                format!("unexpected outcome {:?}", other),
            )),
        }
    }

    async fn receive(&mut self) -> Result<TransportEvent> {
        let link = self.link()?;
        link.events
            .recv()
            .await
            .ok_or_else(|| Error::transport(TransportErrorKind::Reset, "amqp receiver stopped"))
    }

    async fn acknowledge(&mut self, tag: &DeliveryTag, disposition: Disposition) -> Result<()> {
        let link = self.link()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        link.settle_requests
            .send((tag.clone(), disposition, reply_tx))
            .await
            .map_err(|_| Error::transport(TransportErrorKind::Reset, "amqp receiver stopped"))?;
        reply_rx
            .await
            .map_err(|_| Error::transport(TransportErrorKind::Reset, "amqp receiver stopped"))?
    }

    async fn close(&mut self) -> Result<()> {
        let mut link = match self.link.take() {
            Some(link) => link,
            None => return Ok(()),
        };
        trace!("Closing AMQP link to {}", self.hostname);
        drop(link.settle_requests);
        let _ = link.reader.await;
        if let Some(sender) = link.sender.take() {
            let _ = sender.close().await;
        }
        let _ = link.session.end().await;
        let _ = link.connection.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_name_is_first_label() {
        assert_eq!(hub_name("myhub.azure-devices.net"), "myhub");
        assert_eq!(hub_name("localhost"), "localhost");
    }

    #[test]
    fn device_link_addresses() {
        let token = crate::token::SasTokenSource::new("SharedAccessSignature sr=a&sig=b&se=1")
            .unwrap()
            .into();
        let transport = AmqpTransport::device(
            "myhub.azure-devices.net",
            "dev1",
            token,
            ClientOptions::default(),
        );
        assert_eq!(transport.username, "dev1@sas.myhub");
        assert_eq!(
            transport.send_address.as_deref(),
            Some("/devices/dev1/messages/events")
        );
        assert_eq!(transport.receive_address, "/devices/dev1/messages/deviceBound");
    }

    #[test]
    fn file_notification_link_uses_policy_identity() {
        let credentials =
            ServiceKeyTokenSource::new("myhub.azure-devices.net", "iothubowner", "c2VjcmV0")
                .unwrap();
        let transport = AmqpTransport::file_notifications(
            "myhub.azure-devices.net",
            credentials,
            ClientOptions::default(),
        );
        assert_eq!(transport.username, "iothubowner@sas.root.myhub");
        assert_eq!(transport.receive_address, FILE_NOTIFICATION_ADDRESS);
        assert!(transport.send_address.is_none());
    }
}
