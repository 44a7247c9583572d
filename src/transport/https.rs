use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hyper::client::conn::{self, SendRequest};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Body, Method, Request, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::{net, SendOutcome, Transport, TransportEvent, TransportProtocol};
use crate::error::TransportErrorKind;
use crate::message::{
    DeliveryTag, Disposition, FileUploadSasUriRequest, InboundNotification, Message, MessageKind,
    NotificationKind, OutboundMessage, ServiceResponse,
};
use crate::options::{ClientOptions, ProxySettings};
use crate::token::{TokenProvider, TokenSource};
use crate::{Error, Result};

const HTTPS_PORT: u16 = 443;
const API_VERSION: &str = "2020-09-30";
const APP_PROPERTY_PREFIX: &str = "iothub-app-";

/// Characters escaped in a path segment
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

// System property wire ids and their HTTP header names
const SYSTEM_PROPERTY_HEADERS: &[(&str, &str)] = &[
    ("$.mid", "iothub-messageid"),
    ("$.cid", "iothub-correlationid"),
    ("$.ct", "iothub-contenttype"),
    ("$.ce", "iothub-contentencoding"),
    ("$.to", "iothub-to"),
    ("$.exp", "iothub-expiry"),
];

fn segment(value: &str) -> String {
    utf8_percent_encode(value, SEGMENT).to_string()
}

fn event_path(device_id: &str) -> String {
    format!(
        "/devices/{}/messages/events?api-version={}",
        segment(device_id),
        API_VERSION
    )
}

fn device_bound_path(device_id: &str) -> String {
    format!(
        "/devices/{}/messages/devicebound?api-version={}",
        segment(device_id),
        API_VERSION
    )
}

fn settle_path(device_id: &str, etag: &str, disposition: Disposition) -> (Method, String) {
    let base = format!(
        "/devices/{}/messages/devicebound/{}",
        segment(device_id),
        segment(etag)
    );
    match disposition {
        Disposition::Complete => (
            Method::DELETE,
            format!("{}?api-version={}", base, API_VERSION),
        ),
        Disposition::Reject => (
            Method::DELETE,
            format!("{}?reject&api-version={}", base, API_VERSION),
        ),
        Disposition::Abandon => (
            Method::POST,
            format!("{}/abandon?api-version={}", base, API_VERSION),
        ),
    }
}

fn file_upload_path(device_id: &str) -> String {
    format!("/devices/{}/files?api-version={}", segment(device_id), API_VERSION)
}

fn file_upload_notification_path(device_id: &str) -> String {
    format!(
        "/devices/{}/files/notifications?api-version={}",
        segment(device_id),
        API_VERSION
    )
}

fn hyper_error(err: hyper::Error) -> Error {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_parse() {
        TransportErrorKind::Protocol
    } else {
        TransportErrorKind::Reset
    };
    Error::transport(kind, err)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::configuration(format!("{:?} is not a valid header value", value)))
}

#[derive(Debug)]
struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

/// Turn an unsuccessful response into a service error carrying any `Retry-After` hint
fn status_error(response: &HttpResponse) -> Error {
    let retry_after = response
        .headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .map(Duration::from_secs);
    Error::Service {
        status: response.status.as_u16(),
        message: String::from_utf8_lossy(&response.body).into_owned(),
        retry_after,
    }
}

/// Everything needed to issue authorized requests against the hub
#[derive(Debug, Clone)]
struct Endpoint {
    hostname: String,
    device_id: String,
    token: TokenProvider,
    token_ttl: chrono::Duration,
    proxy: Option<ProxySettings>,
}

impl Endpoint {
    async fn open(&self) -> Result<SendRequest<Body>> {
        let stream = net::connect_tls(&self.hostname, HTTPS_PORT, self.proxy.as_ref()).await?;
        let (sender, connection) = conn::handshake(stream).await.map_err(hyper_error)?;
        let hostname = self.hostname.clone();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("HTTPS connection to {} ended: {}", hostname, err);
            }
        });
        Ok(sender)
    }

    async fn request(
        &self,
        sender: &mut SendRequest<Body>,
        method: Method,
        path: String,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<HttpResponse> {
        let authorization = self.token.get(&(Utc::now() + self.token_ttl))?;

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, header_value(&self.hostname)?)
            .header(header::AUTHORIZATION, header_value(&authorization)?);
        if let Some(request_headers) = builder.headers_mut() {
            request_headers.extend(headers);
        }
        let request = builder
            .body(Body::from(body))
            .map_err(|e| Error::transport(TransportErrorKind::Protocol, e))?;

        trace!("{} {}", request.method(), request.uri());

        futures::future::poll_fn(|cx| sender.poll_ready(cx))
            .await
            .map_err(hyper_error)?;
        let response = sender.send_request(request).await.map_err(hyper_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(hyper_error)?
            .to_vec();

        debug!("Response: {}", status);
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    /// Fetch the next cloud to device message, if any
    async fn poll(&self, sender: &mut SendRequest<Body>) -> Result<Option<InboundNotification>> {
        let response = self
            .request(
                sender,
                Method::GET,
                device_bound_path(&self.device_id),
                HeaderMap::new(),
                Vec::new(),
            )
            .await?;

        match response.status {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => Ok(Some(device_bound_notification(response))),
            _ => Err(status_error(&response)),
        }
    }
}

fn device_bound_notification(response: HttpResponse) -> InboundNotification {
    let mut message = Message::new(response.body);
    for (name, value) in response.headers.iter() {
        let value = match value.to_str() {
            Ok(value) => value.to_owned(),
            Err(_) => continue,
        };
        if let Some(key) = name.as_str().strip_prefix(APP_PROPERTY_PREFIX) {
            message.properties.insert(key.to_owned(), value);
        } else if let Some((id, _)) = SYSTEM_PROPERTY_HEADERS
            .iter()
            .find(|(_, header)| *header == name.as_str())
        {
            message.system_properties.insert((*id).to_owned(), value);
        }
    }
    let delivery_tag = response
        .headers
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|etag| DeliveryTag::new(etag.trim_matches('"')));

    InboundNotification {
        kind: NotificationKind::CloudToDevice,
        message,
        delivery_tag,
    }
}

fn telemetry_headers(message: &Message) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (id, name) in SYSTEM_PROPERTY_HEADERS {
        if let Some(value) = message.system_properties.get(*id) {
            headers.insert(*name, header_value(value)?);
        }
    }
    for (key, value) in &message.properties {
        let name = header::HeaderName::from_bytes(format!("{}{}", APP_PROPERTY_PREFIX, key).as_bytes())
            .map_err(|_| Error::configuration(format!("{:?} is not a valid property name", key)))?;
        headers.insert(name, header_value(value)?);
    }
    Ok(headers)
}

async fn poll_loop(endpoint: Endpoint, interval: Duration, events: mpsc::Sender<TransportEvent>) {
    let mut sender: Option<SendRequest<Body>> = None;
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    let mut drain = false;
    loop {
        if !drain {
            ticker.tick().await;
        }
        drain = false;

        if sender.is_none() {
            match endpoint.open().await {
                Ok(opened) => sender = Some(opened),
                Err(err) => {
                    debug!("Cloud to device poll could not connect: {}", err);
                    continue;
                }
            }
        }
        let result = match sender.as_mut() {
            Some(sender) => endpoint.poll(sender).await,
            None => continue,
        };
        match result {
            Ok(Some(notification)) => {
                if events
                    .send(TransportEvent::Notification(notification))
                    .await
                    .is_err()
                {
                    break;
                }
                drain = true;
            }
            Ok(None) => {}
            Err(err) if err.failure_kind().is_transient() => {
                debug!("Cloud to device poll failed: {}", err);
                sender = None;
            }
            Err(err) => {
                let _ = events.send(TransportEvent::Disconnected(err)).await;
                break;
            }
        }
    }
}

/// HTTPS adapter for the IoT Hub device REST endpoints
///
/// Every send is a request/response exchange, so confirmation arrives with the send itself.
/// Cloud to device messages are polled in the background.
#[derive(Debug)]
pub struct HttpsTransport {
    endpoint: Endpoint,
    poll_interval: Duration,
    sender: Option<SendRequest<Body>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    poller: Option<JoinHandle<()>>,
}

impl HttpsTransport {
    /// Create an unconnected adapter
    pub fn new(
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        token: TokenProvider,
        options: ClientOptions,
    ) -> Self {
        Self {
            endpoint: Endpoint {
                hostname: hostname.into(),
                device_id: device_id.into(),
                token,
                token_ttl: chrono::Duration::seconds(options.token_ttl_secs as i64),
                proxy: options.proxy.clone(),
            },
            poll_interval: Duration::from_millis(options.https_poll_interval_ms),
            sender: None,
            events: None,
            poller: None,
        }
    }

    async fn exchange(
        &mut self,
        method: Method,
        path: String,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<HttpResponse> {
        if self.sender.is_none() {
            self.sender = Some(self.endpoint.open().await?);
        }
        let sender = self.sender.as_mut().ok_or_else(|| {
            Error::transport(TransportErrorKind::Reset, "https link is not connected")
        })?;
        let result = self
            .endpoint
            .request(sender, method, path, headers, body)
            .await;
        if result.is_err() {
            // Reopen on next use
            self.sender = None;
        }
        result
    }
}

#[async_trait]
impl Transport for HttpsTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Https
    }

    async fn connect(&mut self) -> Result<()> {
        self.close().await?;

        let mut sender = self.endpoint.open().await?;
        let (events_tx, events_rx) = mpsc::channel(16);

        // The first poll proves the credentials before the link is reported open
        if let Some(notification) = self.endpoint.poll(&mut sender).await? {
            let _ = events_tx
                .send(TransportEvent::Notification(notification))
                .await;
        }
        info!("HTTPS link to {} established", self.endpoint.hostname);

        self.sender = Some(sender);
        self.events = Some(events_rx);
        self.poller = Some(tokio::spawn(poll_loop(
            self.endpoint.clone(),
            self.poll_interval,
            events_tx,
        )));
        Ok(())
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<SendOutcome> {
        let device_id = self.endpoint.device_id.clone();
        let (path, headers, body) = match &message.kind {
            MessageKind::Telemetry => (
                event_path(&device_id),
                telemetry_headers(&message.message)?,
                message.message.body.clone(),
            ),
            MessageKind::FileUploadRequest { blob_name } => {
                let body = serde_json::to_vec(&FileUploadSasUriRequest {
                    blob_name: blob_name.clone(),
                })
                .map_err(|e| Error::configuration(e.to_string()))?;
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                (file_upload_path(&device_id), headers, body)
            }
            MessageKind::FileUploadComplete => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                (
                    file_upload_notification_path(&device_id),
                    headers,
                    message.message.body.clone(),
                )
            }
            kind => {
                return Err(Error::unsupported(format!(
                    "{:?} is not available over HTTPS",
                    kind
                )))
            }
        };

        let response = self.exchange(Method::POST, path, headers, body).await?;
        if !response.status.is_success() {
            return Err(status_error(&response));
        }
        let outcome = match message.kind {
            MessageKind::FileUploadRequest { .. } => Some(ServiceResponse::new(
                response.status.as_u16(),
                response.body,
            )),
            _ => None,
        };
        Ok(SendOutcome::Acknowledged(outcome))
    }

    async fn receive(&mut self) -> Result<TransportEvent> {
        let events = self.events.as_mut().ok_or_else(|| {
            Error::transport(TransportErrorKind::Reset, "https link is not connected")
        })?;
        events.recv().await.ok_or_else(|| {
            Error::transport(TransportErrorKind::Reset, "cloud to device poller stopped")
        })
    }

    async fn acknowledge(&mut self, tag: &DeliveryTag, disposition: Disposition) -> Result<()> {
        let (method, path) = settle_path(&self.endpoint.device_id, tag.as_str(), disposition);
        let response = self
            .exchange(method, path, HeaderMap::new(), Vec::new())
            .await?;
        if response.status.is_success() {
            Ok(())
        } else {
            Err(status_error(&response))
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.events = None;
        if self.sender.take().is_some() {
            trace!("Closing HTTPS link to {}", self.endpoint.hostname);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_uri_path_names_the_device() {
        assert_eq!(
            event_path("test-device"),
            "/devices/test-device/messages/events?api-version=2020-09-30"
        );
    }

    #[test]
    fn device_id_is_escaped_in_paths() {
        assert_eq!(
            device_bound_path("my device/1"),
            "/devices/my%20device%2F1/messages/devicebound?api-version=2020-09-30"
        );
    }

    #[test]
    fn settling_uses_method_per_disposition() {
        let (method, path) = settle_path("dev", "etag-1", Disposition::Complete);
        assert_eq!(method, Method::DELETE);
        assert_eq!(
            path,
            "/devices/dev/messages/devicebound/etag-1?api-version=2020-09-30"
        );

        let (method, path) = settle_path("dev", "etag-1", Disposition::Reject);
        assert_eq!(method, Method::DELETE);
        assert!(path.ends_with("etag-1?reject&api-version=2020-09-30"));

        let (method, path) = settle_path("dev", "etag-1", Disposition::Abandon);
        assert_eq!(method, Method::POST);
        assert!(path.ends_with("etag-1/abandon?api-version=2020-09-30"));
    }

    #[test]
    fn file_upload_paths() {
        assert_eq!(
            file_upload_path("dev"),
            "/devices/dev/files?api-version=2020-09-30"
        );
        assert_eq!(
            file_upload_notification_path("dev"),
            "/devices/dev/files/notifications?api-version=2020-09-30"
        );
    }

    #[test]
    fn throttling_response_carries_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("7"));
        let error = status_error(&HttpResponse {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers,
            body: b"slow down".to_vec(),
        });
        assert_eq!(
            error.failure_kind(),
            crate::retry::FailureKind::Throttled {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[test]
    fn unauthorized_response_is_terminal() {
        let error = status_error(&HttpResponse {
            status: StatusCode::UNAUTHORIZED,
            headers: HeaderMap::new(),
            body: Vec::new(),
        });
        assert!(!error.failure_kind().is_transient());
    }

    #[test]
    fn telemetry_properties_become_headers() {
        let message = Message::builder()
            .set_message_id("m1".to_owned())
            .set_content_type("application/json".to_owned())
            .add_message_property("floor".to_owned(), "3".to_owned())
            .build();
        let headers = telemetry_headers(&message).unwrap();
        assert_eq!(headers["iothub-messageid"], "m1");
        assert_eq!(headers["iothub-contenttype"], "application/json");
        assert_eq!(headers["iothub-app-floor"], "3");
    }

    #[test]
    fn device_bound_response_becomes_notification() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, HeaderValue::from_static("\"abc-123\""));
        headers.insert("iothub-messageid", HeaderValue::from_static("m9"));
        headers.insert("iothub-app-color", HeaderValue::from_static("red"));
        let notification = device_bound_notification(HttpResponse {
            status: StatusCode::OK,
            headers,
            body: b"hello".to_vec(),
        });
        assert_eq!(notification.kind, NotificationKind::CloudToDevice);
        assert_eq!(notification.delivery_tag, Some(DeliveryTag::new("abc-123")));
        assert_eq!(notification.message.message_id(), Some("m9"));
        assert_eq!(notification.message.properties()["color"], "red");
        assert_eq!(notification.message.body, b"hello".to_vec());
    }
}
