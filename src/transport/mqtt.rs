use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::*;
use mqtt::{Encodable, QualityOfService, TopicFilter, TopicName};
use serde::Deserialize;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_native_tls::TlsStream;

use super::{net, SendOutcome, Transport, TransportEvent, TransportProtocol};
use crate::correlation::CorrelationId;
use crate::error::TransportErrorKind;
use crate::message::{
    DeliveryTag, Disposition, InboundNotification, Message, MessageKind, NotificationKind,
    OutboundMessage, ServiceResponse,
};
use crate::options::{ClientOptions, ProxySettings};
use crate::token::{TokenProvider, TokenSource};
use crate::{Error, Result};

const MQTT_PORT: u16 = 8883;
const API_VERSION: &str = "2021-04-12";
const SUBSCRIBE_PACKET_ID: u16 = 10;

// Incoming topic names
const METHOD_POST_TOPIC_FILTER: &str = "$iothub/methods/POST/#";
const METHOD_POST_TOPIC_PREFIX: &str = "$iothub/methods/POST/";
const TWIN_RESPONSE_TOPIC_FILTER: &str = "$iothub/twin/res/#";
const TWIN_RESPONSE_TOPIC_PREFIX: &str = "$iothub/twin/res/";
const TWIN_PATCH_TOPIC_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";
const TWIN_PATCH_TOPIC_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
const TWIN_PATCH_UPDATE_PREFIX: &str = "$iothub/twin/PATCH/properties/reported/";

// Outgoing topic names
fn method_response_topic(status: i32, request_id: &str) -> String {
    format!("$iothub/methods/res/{}/?$rid={}", status, request_id)
}

fn twin_get_topic(request_id: CorrelationId) -> String {
    format!("$iothub/twin/GET/?$rid={}", request_id)
}

fn twin_update_topic(request_id: CorrelationId) -> String {
    format!("{}?$rid={}", TWIN_PATCH_UPDATE_PREFIX, request_id)
}

fn device_bound_messages_topic_filter(device_id: &str) -> String {
    format!("devices/{}/messages/devicebound/#", device_id)
}

fn device_bound_messages_topic_prefix(device_id: &str) -> String {
    format!("devices/{}/messages/devicebound/", device_id)
}

fn cloud_bound_messages_topic(device_id: &str) -> String {
    format!("devices/{}/messages/events/", device_id)
}

fn protocol_error(err: impl std::fmt::Debug) -> Error {
    Error::transport(TransportErrorKind::Protocol, format!("{:?}", err))
}

fn encode<P: Encodable>(packet: &P) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    packet.encode(&mut buf).map_err(protocol_error)?;
    Ok(buf)
}

fn user_name(hostname: &str, device_id: &str, model_id: Option<&str>) -> String {
    let mut user_name = format!("{}/{}/?api-version={}", hostname, device_id, API_VERSION);
    if let Some(model_id) = model_id {
        user_name.push_str("&model-id=");
        user_name.extend(form_urlencoded::byte_serialize(model_id.as_bytes()));
    }
    user_name
}

/// Open the TLS socket and perform the CONNECT/CONNACK exchange
async fn mqtt_connect(
    iot_hub: &str,
    device_id: &str,
    username: String,
    password: String,
    keep_alive: u16,
    proxy: Option<&ProxySettings>,
) -> Result<TlsStream<TcpStream>> {
    let mut socket = net::connect_tls(iot_hub, MQTT_PORT, proxy).await?;

    let mut conn = ConnectPacket::new(device_id);
    conn.set_client_identifier(device_id);
    conn.set_clean_session(false);
    conn.set_keep_alive(keep_alive);
    conn.set_user_name(Some(username));
    conn.set_password(Some(password));

    socket.write_all(&encode(&conn)?).await?;

    let packet = VariablePacket::parse(&mut socket).await;

    trace!("PACKET {:?}", packet);
    match packet {
        Ok(VariablePacket::ConnackPacket(connack)) => match connack.connect_return_code() {
            ConnectReturnCode::ConnectionAccepted => Ok(()),
            ConnectReturnCode::BadUserNameOrPassword | ConnectReturnCode::NotAuthorized => Err(
                Error::service(401, "hub refused the credentials presented on connect"),
            ),
            ConnectReturnCode::ServiceUnavailable => {
                Err(Error::service(503, "hub is unavailable"))
            }
            code => Err(Error::transport(
                TransportErrorKind::Protocol,
                format!("Failed to connect to server, return code {:?}", code),
            )),
        },
        Ok(pck) => Err(Error::transport(
            TransportErrorKind::Protocol,
            format!("Unexpected packet received after connect {:?}", pck),
        )),
        Err(err) => Err(Error::transport(
            TransportErrorKind::Reset,
            format!("Error decoding connack packet {:?}", err),
        )),
    }?;

    Ok(socket)
}

async fn read_packets(
    mut reader: ReadHalf<TlsStream<TcpStream>>,
    packets: mpsc::Sender<Result<VariablePacket>>,
    idle_limit: Duration,
) {
    loop {
        let outcome = match time::timeout(idle_limit, VariablePacket::parse(&mut reader)).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(err)) => Err(Error::transport(
                TransportErrorKind::Reset,
                format!("Error in receiving packet {:?}", err),
            )),
            Err(_) => Err(Error::transport(
                TransportErrorKind::Timeout,
                "no traffic from the hub within twice the keep alive",
            )),
        };
        let failed = outcome.is_err();
        if packets.send(outcome).await.is_err() || failed {
            break;
        }
    }
}

async fn ping(writer: Arc<Mutex<WriteHalf<TlsStream<TcpStream>>>>, interval: Duration) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        trace!("Sending PINGREQ to broker");
        let buf = match encode(&PingreqPacket::new()) {
            Ok(buf) => buf,
            Err(_) => break,
        };
        if writer.lock().await.write_all(&buf).await.is_err() {
            break;
        }
    }
}

#[derive(Debug)]
struct MqttLink {
    writer: Arc<Mutex<WriteHalf<TlsStream<TcpStream>>>>,
    packets: mpsc::Receiver<Result<VariablePacket>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// MQTT 3.1.1 adapter for the IoT Hub device endpoint
///
/// Telemetry and method responses are published with QoS 1 and confirmed by PUBACK; twin
/// operations are confirmed by the matching `$iothub/twin/res` response.
#[derive(Debug)]
pub struct MqttTransport {
    hostname: String,
    device_id: String,
    token: TokenProvider,
    options: ClientOptions,
    d2c_topic: String,
    rx_topic_prefix: String,
    link: Option<MqttLink>,
    next_packet_id: u16,
    in_flight: HashMap<u16, CorrelationId>,
}

impl MqttTransport {
    /// Create an unconnected adapter
    pub fn new(
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        token: TokenProvider,
        options: ClientOptions,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            hostname: hostname.into(),
            d2c_topic: cloud_bound_messages_topic(&device_id),
            rx_topic_prefix: device_bound_messages_topic_prefix(&device_id),
            device_id,
            token,
            options,
            link: None,
            next_packet_id: 0,
            in_flight: HashMap::new(),
        }
    }

    fn allocate_packet_id(&mut self) -> u16 {
        // 0 is not a valid packet identifier
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        if self.next_packet_id == SUBSCRIBE_PACKET_ID {
            self.next_packet_id += 1;
        }
        self.next_packet_id
    }

    async fn write(&self, buf: &[u8]) -> Result<()> {
        let link = self.link.as_ref().ok_or_else(not_connected)?;
        link.writer.lock().await.write_all(buf).await?;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: String,
        qos: QoSWithPacketIdentifier,
        body: &[u8],
    ) -> Result<()> {
        let topic = TopicName::new(topic).map_err(protocol_error)?;
        trace!("Publishing to topic {:?}", topic);
        let packet = PublishPacket::new(topic, qos, body.to_vec());
        self.write(&encode(&packet)?).await
    }

    async fn subscribe(&mut self) -> Result<()> {
        let topics = vec![
            (
                TopicFilter::new(METHOD_POST_TOPIC_FILTER).map_err(protocol_error)?,
                QualityOfService::Level0,
            ),
            (
                TopicFilter::new(device_bound_messages_topic_filter(&self.device_id))
                    .map_err(protocol_error)?,
                QualityOfService::Level1,
            ),
            (
                TopicFilter::new(TWIN_RESPONSE_TOPIC_FILTER).map_err(protocol_error)?,
                QualityOfService::Level0,
            ),
            (
                TopicFilter::new(TWIN_PATCH_TOPIC_FILTER).map_err(protocol_error)?,
                QualityOfService::Level0,
            ),
        ];

        trace!("Subscribing to {:?}", topics);

        let subscribe_packet = SubscribePacket::new(SUBSCRIBE_PACKET_ID, topics);
        self.write(&encode(&subscribe_packet)?).await
    }

    fn translate(&mut self, packet: VariablePacket) -> Option<TransportEvent> {
        match packet {
            VariablePacket::PubackPacket(ack) => {
                let correlation_id = self.in_flight.remove(&ack.packet_identifier())?;
                Some(TransportEvent::Acknowledged {
                    correlation_id,
                    response: None,
                })
            }
            VariablePacket::PublishPacket(ref publ) => {
                let qos = match publ.qos() {
                    QoSWithPacketIdentifier::Level0 => None,
                    QoSWithPacketIdentifier::Level1(pkid)
                    | QoSWithPacketIdentifier::Level2(pkid) => Some(pkid),
                };
                route_publish(
                    &self.rx_topic_prefix,
                    publ.topic_name(),
                    publ.payload_ref()[..].to_vec(),
                    qos,
                )
            }
            VariablePacket::PingrespPacket(..) => {
                trace!("Receiving PINGRESP from broker");
                None
            }
            other => {
                trace!("Ignoring packet {:?}", other);
                None
            }
        }
    }
}

fn not_connected() -> Error {
    Error::transport(TransportErrorKind::Reset, "mqtt link is not connected")
}

fn query_pairs(query: &str) -> HashMap<String, String> {
    let query = query.trim_start_matches('/').trim_start_matches('?');
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// Query string of a desired properties patch
#[derive(Debug, Default, Deserialize)]
struct TwinPatchQuery {
    #[serde(rename = "$version")]
    version: Option<u64>,
}

/// Query string of a `$iothub/twin/res/{status}/` topic
#[derive(Debug, Default, Deserialize)]
struct TwinResponseQuery {
    #[serde(rename = "$rid")]
    rid: Option<String>,
    #[serde(rename = "$version")]
    version: Option<u64>,
    #[serde(rename = "$retry-after")]
    retry_after: Option<u64>,
}

fn parse_query<'de, T: Deserialize<'de> + Default>(topic: &str, query: &'de str) -> T {
    let query = query.trim_start_matches('/').trim_start_matches('?');
    serde_urlencoded::from_str(query).unwrap_or_else(|e| {
        debug!("Unparsable query on {}: {}", topic, e);
        T::default()
    })
}

/// Map an inbound PUBLISH onto a transport event
fn route_publish(
    rx_topic_prefix: &str,
    topic: &str,
    payload: Vec<u8>,
    packet_id: Option<u16>,
) -> Option<TransportEvent> {
    let mut message = Message::new(payload);
    trace!("PUBLISH ({}): {:?}", topic, message);

    if let Some(properties) = topic.strip_prefix(rx_topic_prefix) {
        for (key, value) in query_pairs(properties) {
            if key.starts_with("$.") {
                message.system_properties.insert(key, value);
            } else {
                message.properties.insert(key, value);
            }
        }
        return Some(TransportEvent::Notification(InboundNotification {
            kind: NotificationKind::CloudToDevice,
            message,
            delivery_tag: packet_id.map(DeliveryTag::new),
        }));
    }

    if let Some(query) = topic.strip_prefix(TWIN_PATCH_TOPIC_PREFIX) {
        let TwinPatchQuery { version } = parse_query(topic, query);
        return Some(TransportEvent::Notification(InboundNotification {
            kind: NotificationKind::DesiredPropertyUpdate { version },
            message,
            delivery_tag: None,
        }));
    }

    if let Some(details) = topic.strip_prefix(METHOD_POST_TOPIC_PREFIX) {
        // {method name}/?$rid={request id}
        let (method_name, query) = details.split_once('/')?;
        let request_id = query_pairs(query).remove("$rid")?;
        return Some(TransportEvent::Notification(InboundNotification {
            kind: NotificationKind::DirectMethod {
                method_name: method_name.to_owned(),
                request_id,
            },
            message,
            delivery_tag: None,
        }));
    }

    if let Some(details) = topic.strip_prefix(TWIN_RESPONSE_TOPIC_PREFIX) {
        // {status}/?$rid={request id}[&$version={version}]
        let (status, query) = details.split_once('/')?;
        let status: u16 = status.parse().ok()?;
        let query: TwinResponseQuery = parse_query(topic, query);
        let correlation_id = match query.rid.as_deref().and_then(|rid| rid.parse().ok()) {
            Some(id) => id,
            None => {
                debug!("Twin response without a usable request id: {}", topic);
                return None;
            }
        };
        if (200..300).contains(&status) {
            let mut response = ServiceResponse::new(status, message.body);
            response.version = query.version;
            return Some(TransportEvent::Acknowledged {
                correlation_id,
                response: Some(response),
            });
        }
        let retry_after = query.retry_after.map(Duration::from_secs);
        return Some(TransportEvent::Rejected {
            correlation_id,
            error: Error::Service {
                status,
                message: String::from_utf8_lossy(&message.body).into_owned(),
                retry_after,
            },
        });
    }

    trace!("Ignoring publish on unexpected topic {}", topic);
    None
}

fn build_topic_name(base_topic: &str, message: &Message) -> String {
    let capacity = message.system_properties.len() + message.properties.len();
    let mut props = Vec::with_capacity(capacity);
    props.extend(message.system_properties.iter());
    props.extend(message.properties.iter());
    props.sort();

    // if we reuse the base_topic string as the target for the serializer,
    // we end up with an extra ampersand before the key/value pairs
    let encoded = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(props)
        .finish();
    format!("{}{}", base_topic, encoded)
}

#[async_trait]
impl Transport for MqttTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Mqtt
    }

    async fn connect(&mut self) -> Result<()> {
        self.close().await?;

        let expiry = Utc::now() + chrono::Duration::seconds(self.options.token_ttl_secs as i64);
        trace!("Generating token that will expire at {}", expiry);
        let password = self.token.get(&expiry)?;
        let username = user_name(
            &self.hostname,
            &self.device_id,
            self.options.model_id.as_deref(),
        );

        let keep_alive = self.options.keep_alive_secs.max(1);
        let socket = mqtt_connect(
            &self.hostname,
            &self.device_id,
            username,
            password,
            keep_alive,
            self.options.proxy.as_ref(),
        )
        .await?;
        info!("MQTT link to {} established", self.hostname);

        let (read_socket, write_socket) = tokio::io::split(socket);
        let writer = Arc::new(Mutex::new(write_socket));
        let (packets_tx, packets_rx) = mpsc::channel(32);
        let keep_alive = Duration::from_secs(keep_alive.into());

        let tasks = vec![
            tokio::spawn(read_packets(read_socket, packets_tx, keep_alive * 2)),
            tokio::spawn(ping(writer.clone(), keep_alive)),
        ];
        self.link = Some(MqttLink {
            writer,
            packets: packets_rx,
            tasks,
        });

        self.subscribe().await
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<SendOutcome> {
        let correlation_id = message.correlation_id;
        let (topic, acked_by_puback) = match &message.kind {
            MessageKind::Telemetry => (build_topic_name(&self.d2c_topic, &message.message), true),
            MessageKind::CommandResponse { request_id, status } => {
                (method_response_topic(*status, request_id), true)
            }
            MessageKind::TwinPatch => (twin_update_topic(correlation_id), false),
            MessageKind::TwinGet => (twin_get_topic(correlation_id), false),
            MessageKind::FileUploadRequest { .. } | MessageKind::FileUploadComplete => {
                return Err(Error::unsupported(
                    "file upload is only available over HTTPS",
                ))
            }
        };

        let qos = if acked_by_puback {
            let packet_id = self.allocate_packet_id();
            self.in_flight.retain(|_, id| *id != correlation_id);
            self.in_flight.insert(packet_id, correlation_id);
            QoSWithPacketIdentifier::Level1(packet_id)
        } else {
            QoSWithPacketIdentifier::Level0
        };

        self.publish(topic, qos, &message.message.body).await?;
        Ok(SendOutcome::AwaitingAck)
    }

    async fn receive(&mut self) -> Result<TransportEvent> {
        loop {
            let next = match self.link.as_mut() {
                Some(link) => link.packets.recv().await,
                None => return Err(not_connected()),
            };
            let packet = match next {
                Some(packet) => packet?,
                None => {
                    return Err(Error::transport(
                        TransportErrorKind::Reset,
                        "mqtt reader stopped",
                    ))
                }
            };
            trace!("Received PACKET {:?}", packet);
            if let Some(event) = self.translate(packet) {
                return Ok(event);
            }
        }
    }

    async fn acknowledge(&mut self, tag: &DeliveryTag, disposition: Disposition) -> Result<()> {
        let packet_id: u16 = tag
            .as_str()
            .parse()
            .map_err(|_| Error::configuration("not an mqtt delivery tag"))?;
        match disposition {
            // Without a PUBACK the hub redelivers the message on the next connection
            Disposition::Abandon => Ok(()),
            Disposition::Reject => {
                warn!("MQTT cannot reject messages, completing {} instead", packet_id);
                self.write(&encode(&PubackPacket::new(packet_id))?).await
            }
            Disposition::Complete => self.write(&encode(&PubackPacket::new(packet_id))?).await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.in_flight.clear();
        let link = match self.link.take() {
            Some(link) => link,
            None => return Ok(()),
        };
        trace!("Closing MQTT link to {}", self.hostname);
        let mut writer = link.writer.lock().await;
        // If the connection is already lost there is nothing to tell the broker
        if let Ok(buf) = encode(&DisconnectPacket::new()) {
            let _ = writer.write_all(&buf).await;
        }
        let _ = writer.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_is_appended_to_topic_name() {
        let message = Message::builder()
            .set_body(vec![])
            .set_content_type("application/json".to_owned())
            .build();

        assert_eq!(
            "topic/%24.ct=application%2Fjson",
            build_topic_name("topic/", &message)
        );
    }

    #[test]
    fn message_id_and_app_properties_are_appended() {
        let message = Message::builder()
            .set_body(vec![])
            .set_message_id("id".to_owned())
            .add_message_property("foo".to_owned(), "bar".to_owned())
            .build();

        assert_eq!(
            "topic/%24.mid=id&foo=bar",
            build_topic_name("topic/", &message)
        );
    }

    #[test]
    fn no_properties_keeps_base_topic() {
        assert_eq!("topic/", build_topic_name("topic/", &Message::new(vec![])));
    }

    #[test]
    fn user_name_announces_model_id() {
        assert_eq!(
            user_name("hub.azure-devices.net", "dev1", None),
            "hub.azure-devices.net/dev1/?api-version=2021-04-12"
        );
        assert_eq!(
            user_name(
                "hub.azure-devices.net",
                "dev1",
                Some("dtmi:com:example:Thermostat;1")
            ),
            "hub.azure-devices.net/dev1/?api-version=2021-04-12&model-id=dtmi%3Acom%3Aexample%3AThermostat%3B1"
        );
    }

    #[test]
    fn twin_success_response_acknowledges_request() {
        let event = route_publish(
            "devices/d/messages/devicebound/",
            "$iothub/twin/res/204/?$rid=42&$version=7",
            vec![],
            None,
        );
        match event {
            Some(TransportEvent::Acknowledged {
                correlation_id,
                response: Some(response),
            }) => {
                assert_eq!(correlation_id, CorrelationId::new(42));
                assert_eq!(response.status, 204);
                assert_eq!(response.version, Some(7));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn twin_error_response_rejects_request() {
        let event = route_publish(
            "devices/d/messages/devicebound/",
            "$iothub/twin/res/429/?$rid=5&$retry-after=3",
            b"throttled".to_vec(),
            None,
        );
        match event {
            Some(TransportEvent::Rejected {
                correlation_id,
                error:
                    Error::Service {
                        status,
                        retry_after,
                        ..
                    },
            }) => {
                assert_eq!(correlation_id, CorrelationId::new(5));
                assert_eq!(status, 429);
                assert_eq!(retry_after, Some(Duration::from_secs(3)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn direct_method_invocation_is_parsed() {
        let event = route_publish(
            "devices/d/messages/devicebound/",
            "$iothub/methods/POST/reboot/?$rid=abc",
            b"{}".to_vec(),
            None,
        );
        match event {
            Some(TransportEvent::Notification(notification)) => {
                let invocation = notification.direct_method().unwrap();
                assert_eq!(invocation.method_name, "reboot");
                assert_eq!(invocation.request_id, "abc");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn c2d_message_carries_properties_and_delivery_tag() {
        let event = route_publish(
            "devices/d/messages/devicebound/",
            "devices/d/messages/devicebound/%24.mid=m1&color=blue",
            b"hi".to_vec(),
            Some(17),
        );
        match event {
            Some(TransportEvent::Notification(notification)) => {
                assert_eq!(notification.kind, NotificationKind::CloudToDevice);
                assert_eq!(notification.message.message_id(), Some("m1"));
                assert_eq!(notification.message.properties()["color"], "blue");
                assert_eq!(notification.delivery_tag, Some(DeliveryTag::new(17)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn desired_property_patch_reports_version() {
        let event = route_publish(
            "devices/d/messages/devicebound/",
            "$iothub/twin/PATCH/properties/desired/?$version=12",
            b"{\"targetTemperature\":21}".to_vec(),
            None,
        );
        assert!(matches!(
            event,
            Some(TransportEvent::Notification(InboundNotification {
                kind: NotificationKind::DesiredPropertyUpdate { version: Some(12) },
                ..
            }))
        ));
    }

    #[test]
    fn packet_ids_skip_zero_and_subscribe_id() {
        let mut transport = MqttTransport::new(
            "hub",
            "dev",
            crate::token::SasTokenSource::new("SharedAccessSignature sr=a&sig=b&se=1")
                .unwrap()
                .into(),
            ClientOptions::default(),
        );
        let ids: Vec<u16> = (0..11).map(|_| transport.allocate_packet_id()).collect();
        assert_eq!(ids[0], 1);
        assert!(!ids.contains(&SUBSCRIBE_PACKET_ID));
        transport.next_packet_id = u16::MAX;
        assert_eq!(transport.allocate_packet_id(), 1);
    }
}
