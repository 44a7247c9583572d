#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use azure_iot_transport::{
    ClientEvent, ClientOptions, ConnectionState, CorrelationId, DeliveryTag, Disposition, Error,
    IoTHubClient, MessageKind, OutboundMessage, Result, SendOutcome, Transport, TransportErrorKind,
    TransportEvent, TransportProtocol,
};
use tokio::sync::mpsc;

pub const HOSTNAME: &str = "test-hub.azure-devices.net";
pub const DEVICE_ID: &str = "test-device";

#[derive(Debug, Default)]
struct Script {
    connect_results: VecDeque<Result<()>>,
    send_results: VecDeque<Result<SendOutcome>>,
    connect_delay: Option<Duration>,
    send_delay: Option<Duration>,
    auto_ack: bool,
    connected: bool,
    connect_count: usize,
    close_count: usize,
    sent: Vec<(CorrelationId, MessageKind)>,
    settled: Vec<(DeliveryTag, Disposition)>,
}

/// In-memory transport whose behaviour is scripted by a [`TransportHandle`]
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Test side of a [`ScriptedTransport`]
#[derive(Debug, Clone)]
pub struct TransportHandle {
    script: Arc<Mutex<Script>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

pub fn scripted() -> (ScriptedTransport, TransportHandle) {
    let script = Arc::new(Mutex::new(Script::default()));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ScriptedTransport {
            script: script.clone(),
            events: rx,
        },
        TransportHandle {
            script,
            events: tx,
        },
    )
}

pub fn reset() -> Error {
    Error::Transport {
        kind: TransportErrorKind::Reset,
        message: "connection reset by peer".into(),
    }
}

pub fn service_error(status: u16) -> Error {
    Error::Service {
        status,
        message: format!("status {}", status),
        retry_after: None,
    }
}

impl TransportHandle {
    pub fn push_connect_result(&self, result: Result<()>) {
        self.script.lock().unwrap().connect_results.push_back(result);
    }

    pub fn push_send_result(&self, result: Result<SendOutcome>) {
        self.script.lock().unwrap().send_results.push_back(result);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.script.lock().unwrap().connect_delay = Some(delay);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.script.lock().unwrap().send_delay = Some(delay);
    }

    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.script.lock().unwrap().auto_ack = auto_ack;
    }

    pub fn inject(&self, event: TransportEvent) {
        self.events.send(event).unwrap();
    }

    pub fn ack(&self, correlation_id: CorrelationId) {
        self.inject(TransportEvent::Acknowledged {
            correlation_id,
            response: None,
        });
    }

    pub fn sent_ids(&self) -> Vec<u64> {
        self.script
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|(id, _)| id.value())
            .collect()
    }

    pub fn sent_kinds(&self) -> Vec<MessageKind> {
        self.script
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|(_, kind)| kind.clone())
            .collect()
    }

    pub fn settled(&self) -> Vec<(DeliveryTag, Disposition)> {
        self.script.lock().unwrap().settled.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.script.lock().unwrap().connect_count
    }

    pub fn close_count(&self) -> usize {
        self.script.lock().unwrap().close_count
    }

    pub fn is_connected(&self) -> bool {
        self.script.lock().unwrap().connected
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Mqtt
    }

    async fn connect(&mut self) -> Result<()> {
        let delay = {
            let mut script = self.script.lock().unwrap();
            script.connect_count += 1;
            script.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock().unwrap();
        let result = script.connect_results.pop_front().unwrap_or(Ok(()));
        script.connected = result.is_ok();
        result
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<SendOutcome> {
        let delay = {
            let mut script = self.script.lock().unwrap();
            script
                .sent
                .push((message.correlation_id, message.kind.clone()));
            script.send_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock().unwrap();
        match script.send_results.pop_front() {
            Some(result) => result,
            None if script.auto_ack => Ok(SendOutcome::Acknowledged(None)),
            None => Ok(SendOutcome::AwaitingAck),
        }
    }

    async fn receive(&mut self) -> Result<TransportEvent> {
        match self.events.recv().await {
            Some(event) => Ok(event),
            None => std::future::pending().await,
        }
    }

    async fn acknowledge(&mut self, tag: &DeliveryTag, disposition: Disposition) -> Result<()> {
        self.script
            .lock()
            .unwrap()
            .settled
            .push((tag.clone(), disposition));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        script.close_count += 1;
        script.connected = false;
        Ok(())
    }
}

pub fn client_with(options: ClientOptions) -> (IoTHubClient, TransportHandle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (transport, handle) = scripted();
    let client = IoTHubClient::with_transport(transport, HOSTNAME, DEVICE_ID, options).unwrap();
    (client, handle)
}

pub fn client() -> (IoTHubClient, TransportHandle) {
    client_with(ClientOptions::default())
}

/// Let the worker drain its queues. Time is paused, so this advances only once every task idles.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Connection states reported so far
pub fn drain_states(events: &mut mpsc::Receiver<ClientEvent>) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::ConnectionStatus { state, .. } = event {
            states.push(state);
        }
    }
    states
}
