//! Connection state machine
//!
//! One [`Connection`] worker task owns the transport, the delivery tracker and the correlation
//! registry of a client. Client handles talk to it through [`Command`]s, so every piece of
//! mutable state is touched by a single task.
//!
//! ```text
//! Closed --open--> Opening --connected--> Open
//!                    |                     |
//!                    | transient failure   | link lost / token renewal
//!                    v                     v
//!                  Reconnecting <----------+
//!                    |
//!                    | terminal failure or close()
//!                    v
//!                  Closed
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};

use crate::correlation::{deadline_after, Completion, CorrelationId};
use crate::delivery::DeliveryTracker;
use crate::error::TransportErrorKind;
use crate::message::{DeliveryTag, Disposition, InboundNotification, OutboundMessage};
use crate::options::ClientOptions;
use crate::retry::{FailureKind, RetryPolicy};
use crate::transport::{SendOutcome, Transport, TransportEvent};
use crate::{Error, Result};

/// Share of the token lifetime after which the link is renewed
const TOKEN_RENEWAL_RATIO: f64 = 0.85;

/// Lifecycle state of the logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to be
    Closed,
    /// First connect attempt in progress
    Opening,
    /// Connected; messages flow
    Open,
    /// Connection lost or first attempt failed; waiting for or running a retry
    Reconnecting,
}

/// Why the connection changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatusReason {
    /// Connect succeeded
    Connected,
    /// The link dropped while open
    ConnectionLost,
    /// Retries were exhausted
    RetryExpired,
    /// The hub rejected the credentials
    BadCredential,
    /// Non-retryable protocol or configuration failure
    CommunicationError,
    /// The caller opened the client
    ClientOpen,
    /// The caller closed the client
    ClientClose,
    /// Reconnecting to present a fresh token
    SasTokenRenewal,
}

/// Something the application may want to react to
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The connection changed state
    ConnectionStatus {
        /// New state
        state: ConnectionState,
        /// Cause of the change
        reason: ConnectionStatusReason,
    },
    /// The hub pushed a message
    Notification(InboundNotification),
}

#[derive(Debug)]
pub(crate) enum Command {
    Open(oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
    Submit {
        message: OutboundMessage,
        deadline: Instant,
        completion: Completion,
    },
    Cancel(CorrelationId),
    Acknowledge {
        tag: DeliveryTag,
        disposition: Disposition,
        reply: oneshot::Sender<Result<()>>,
    },
}

type AcknowledgeRequest = (DeliveryTag, Disposition, oneshot::Sender<Result<()>>);

enum Attempt<O> {
    Finished(Result<O>),
    /// `close()` was called, or every handle dropped (`None`), while the transport was busy
    Interrupted(Option<oneshot::Sender<Result<()>>>),
}

/// Worker state that stays reachable while the transport is busy connecting or sending
struct Intake<'a> {
    open: bool,
    tracker: &'a mut DeliveryTracker,
    commands: &'a mut mpsc::UnboundedReceiver<Command>,
    open_waiters: &'a mut Vec<oneshot::Sender<Result<()>>>,
    send_queue: &'a mut VecDeque<CorrelationId>,
    deferred: Vec<AcknowledgeRequest>,
}

impl Intake<'_> {
    /// Drive `operation`, bounded by `limit`, while accepting commands and expiring deadlines.
    /// Settling needs the transport, so those requests are handed back for later.
    async fn serve<O>(
        mut self,
        limit: Duration,
        operation: impl Future<Output = Result<O>>,
    ) -> (Attempt<O>, Vec<AcknowledgeRequest>) {
        let operation = time::timeout(limit, operation);
        tokio::pin!(operation);

        let attempt = loop {
            let deadline = self.tracker.next_deadline();
            tokio::select! {
                result = &mut operation => {
                    break Attempt::Finished(result.map_err(Error::from).and_then(|r| r))
                }
                command = self.commands.recv() => match command {
                    Some(Command::Open(reply)) if self.open => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Open(reply)) => self.open_waiters.push(reply),
                    Some(Command::Submit { message, deadline, completion }) => {
                        let id = message.correlation_id;
                        if self.tracker.submit(message, completion, deadline).is_ok() && self.open {
                            self.send_queue.push_back(id);
                        }
                    }
                    Some(Command::Cancel(id)) => {
                        self.tracker.cancel(id);
                    }
                    Some(Command::Acknowledge { tag, disposition, reply }) => {
                        self.deferred.push((tag, disposition, reply))
                    }
                    Some(Command::Close(reply)) => break Attempt::Interrupted(Some(reply)),
                    None => break Attempt::Interrupted(None),
                },
                _ = time::sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                    for id in self.tracker.expire(Instant::now()) {
                        warn!("Message {} timed out", id);
                    }
                }
            }
        };
        (attempt, self.deferred)
    }
}

/// Reject identities that can never reach a hub
pub(crate) fn validate_identity(hostname: &str, device_id: &str) -> Result<()> {
    if hostname.is_empty() {
        return Err(Error::configuration("hostname must not be empty"));
    }
    if hostname.contains("://") {
        return Err(Error::configuration(
            "hostname must not include a protocol scheme",
        ));
    }
    if hostname.chars().any(char::is_whitespace) {
        return Err(Error::configuration("hostname must not contain whitespace"));
    }
    if device_id.is_empty() {
        return Err(Error::configuration("device id must not be empty"));
    }
    Ok(())
}

fn terminal_reason(err: &Error) -> ConnectionStatusReason {
    match err.failure_kind() {
        FailureKind::Unauthorized => ConnectionStatusReason::BadCredential,
        kind if kind.is_transient() => ConnectionStatusReason::RetryExpired,
        _ => ConnectionStatusReason::CommunicationError,
    }
}

fn is_link_failure(err: &Error) -> bool {
    matches!(
        err.failure_kind(),
        FailureKind::NetworkTimeout | FailureKind::TransportReset
    )
}

fn far_future() -> Instant {
    deadline_after(Instant::now(), Duration::MAX)
}

/// Worker owning one logical connection
pub(crate) struct Connection<T: Transport> {
    hostname: String,
    device_id: String,
    transport: T,
    state: ConnectionState,
    attempt: u32,
    last_error: Option<Error>,
    tracker: DeliveryTracker,
    policy: RetryPolicy,
    options: ClientOptions,
    renewable: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<ClientEvent>,
    status: watch::Sender<ConnectionState>,
    open_waiters: Vec<oneshot::Sender<Result<()>>>,
    /// Ids waiting their turn to be handed to the transport, in order
    send_queue: VecDeque<CorrelationId>,
    reconnect_at: Option<Instant>,
    renew_at: Option<Instant>,
    stopped: bool,
}

impl<T: Transport> Connection<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: T,
        hostname: String,
        device_id: String,
        options: ClientOptions,
        renewable: bool,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::Sender<ClientEvent>,
        status: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            hostname,
            device_id,
            transport,
            state: ConnectionState::Closed,
            attempt: 0,
            last_error: None,
            tracker: DeliveryTracker::new(),
            policy: RetryPolicy::new(&options.retry),
            options,
            renewable,
            commands,
            events,
            status,
            open_waiters: Vec::new(),
            send_queue: VecDeque::new(),
            reconnect_at: None,
            renew_at: None,
            stopped: false,
        }
    }

    /// Serve commands, transport events and timers until every client handle is dropped
    pub(crate) async fn run(mut self) {
        debug!(
            "Connection worker for {}/{} started",
            self.hostname, self.device_id
        );
        while !self.stopped {
            let wake_at = self.next_wake();
            let open = self.state == ConnectionState::Open;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.close_connection().await;
                        self.stopped = true;
                    }
                },
                event = self.transport.receive(), if open => self.handle_event(event).await,
                _ = time::sleep_until(wake_at.unwrap_or_else(far_future)), if wake_at.is_some() => {
                    self.on_timer().await
                }
            }
        }
        debug!(
            "Connection worker for {}/{} stopped",
            self.hostname, self.device_id
        );
    }

    fn next_wake(&self) -> Option<Instant> {
        let mut candidates = vec![self.tracker.next_deadline()];
        match self.state {
            ConnectionState::Open => {
                candidates.push(self.tracker.next_resend_at(self.options.ack_timeout()));
                candidates.push(self.renew_at);
            }
            ConnectionState::Reconnecting => candidates.push(self.reconnect_at),
            _ => {}
        }
        candidates.into_iter().flatten().min()
    }

    fn set_state(&mut self, state: ConnectionState, reason: ConnectionStatusReason) {
        if self.state == state {
            return;
        }
        debug!(
            "Connection {:?} -> {:?} ({:?})",
            self.state, state, reason
        );
        self.state = state;
        // Only fails when no client handle is left to observe it
        let _ = self.status.send(state);
        self.emit(ClientEvent::ConnectionStatus { state, reason });
    }

    fn emit(&self, event: ClientEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event consumer is falling behind, dropping {:?}", event)
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open(reply) => match self.state {
                ConnectionState::Open => {
                    let _ = reply.send(Ok(()));
                }
                ConnectionState::Opening | ConnectionState::Reconnecting => {
                    self.open_waiters.push(reply)
                }
                ConnectionState::Closed => {
                    if let Err(err) = validate_identity(&self.hostname, &self.device_id) {
                        let _ = reply.send(Err(err));
                        return;
                    }
                    self.open_waiters.push(reply);
                    self.attempt = 0;
                    self.set_state(ConnectionState::Opening, ConnectionStatusReason::ClientOpen);
                    self.try_connect(ConnectionStatusReason::Connected).await;
                }
            },
            Command::Close(reply) => {
                self.close_connection().await;
                let _ = reply.send(Ok(()));
            }
            Command::Submit {
                message,
                deadline,
                completion,
            } => {
                if self.state == ConnectionState::Closed {
                    let _ = completion.send(Err(Error::ConnectionClosed));
                    return;
                }
                let id = message.correlation_id;
                if self.tracker.submit(message, completion, deadline).is_err() {
                    return;
                }
                if self.state == ConnectionState::Open {
                    self.enqueue(id);
                    self.flush().await;
                }
            }
            Command::Cancel(id) => {
                if self.tracker.cancel(id) {
                    debug!("Message {} cancelled", id);
                }
            }
            Command::Acknowledge {
                tag,
                disposition,
                reply,
            } => self.acknowledge((tag, disposition, reply)).await,
        }
    }

    async fn acknowledge(&mut self, (tag, disposition, reply): AcknowledgeRequest) {
        let result = if self.state == ConnectionState::Open {
            self.transport.acknowledge(&tag, disposition).await
        } else {
            Err(Error::ConnectionClosed)
        };
        let _ = reply.send(result);
    }

    /// Run `transport.connect()` while still accepting work that does not need the transport
    async fn connect_transport(&mut self) -> (Attempt<()>, Vec<AcknowledgeRequest>) {
        let intake = Intake {
            open: false,
            tracker: &mut self.tracker,
            commands: &mut self.commands,
            open_waiters: &mut self.open_waiters,
            send_queue: &mut self.send_queue,
            deferred: Vec::new(),
        };
        intake
            .serve(self.options.connect_timeout(), self.transport.connect())
            .await
    }

    /// Close on behalf of a `close()` that arrived while the transport was busy
    async fn interrupted(&mut self, reply: Option<oneshot::Sender<Result<()>>>) {
        self.close_connection().await;
        match reply {
            Some(reply) => {
                let _ = reply.send(Ok(()));
            }
            None => self.stopped = true,
        }
    }

    async fn try_connect(&mut self, reason: ConnectionStatusReason) {
        trace!(
            "Connecting to {} (attempt {})",
            self.hostname,
            self.attempt
        );
        let (attempt, deferred) = self.connect_transport().await;
        match attempt {
            Attempt::Finished(Ok(())) => self.on_connected(reason).await,
            Attempt::Finished(Err(err)) => self.on_connect_failed(err).await,
            Attempt::Interrupted(reply) => self.interrupted(reply).await,
        }
        for request in deferred {
            self.acknowledge(request).await;
        }
    }

    async fn on_connected(&mut self, reason: ConnectionStatusReason) {
        info!("Connected to {} as {}", self.hostname, self.device_id);
        self.attempt = 0;
        self.last_error = None;
        self.reconnect_at = None;
        self.renew_at = if self.renewable {
            Some(deadline_after(
                Instant::now(),
                self.options.token_ttl().mul_f64(TOKEN_RENEWAL_RATIO),
            ))
        } else {
            None
        };
        self.set_state(ConnectionState::Open, reason);
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        let outstanding = self.tracker.outstanding();
        if !outstanding.is_empty() {
            debug!("Replaying {} outstanding messages", outstanding.len());
        }
        self.send_queue.clear();
        self.send_queue.extend(outstanding);
        self.flush().await;
    }

    async fn on_connect_failed(&mut self, err: Error) {
        warn!("Connecting to {} failed: {}", self.hostname, err);
        let _ = self.transport.close().await;
        if self.state == ConnectionState::Opening && err.failure_kind().is_transient() {
            self.set_state(
                ConnectionState::Reconnecting,
                ConnectionStatusReason::CommunicationError,
            );
        }
        self.schedule_reconnect(err).await;
    }

    async fn on_link_lost(&mut self, err: Error, reason: ConnectionStatusReason) {
        if self.state != ConnectionState::Open {
            return;
        }
        warn!("Connection to {} lost: {}", self.hostname, err);
        let _ = self.transport.close().await;
        self.renew_at = None;
        self.send_queue.clear();
        self.set_state(ConnectionState::Reconnecting, reason);
        self.schedule_reconnect(err).await;
    }

    async fn schedule_reconnect(&mut self, err: Error) {
        let decision = self.policy.decide(&err.failure_kind(), self.attempt);
        self.last_error = Some(err.clone());
        if decision.terminal {
            let reason = terminal_reason(&err);
            self.fail_connection(err, reason).await;
            return;
        }
        self.attempt += 1;
        debug!(
            "Reconnecting to {} in {:?} (attempt {})",
            self.hostname, decision.retry_after, self.attempt
        );
        self.reconnect_at = Some(deadline_after(Instant::now(), decision.retry_after));
    }

    async fn fail_connection(&mut self, err: Error, reason: ConnectionStatusReason) {
        error!("Connection to {} failed permanently: {}", self.hostname, err);
        self.reconnect_at = None;
        self.renew_at = None;
        self.send_queue.clear();
        let _ = self.transport.close().await;
        self.set_state(ConnectionState::Closed, reason);
        let failed = self.tracker.fail_all(&err);
        if failed > 0 {
            debug!("Failed {} pending operations", failed);
        }
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    async fn close_connection(&mut self) {
        self.reconnect_at = None;
        self.renew_at = None;
        self.send_queue.clear();
        if self.state != ConnectionState::Closed {
            info!("Closing connection to {}", self.hostname);
            if let Err(err) = self.transport.close().await {
                debug!("Error releasing transport: {}", err);
            }
        }
        self.set_state(ConnectionState::Closed, ConnectionStatusReason::ClientClose);
        self.tracker.fail_all(&Error::Cancelled);
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(Error::Cancelled));
        }
    }

    fn enqueue(&mut self, id: CorrelationId) {
        if !self.send_queue.contains(&id) {
            self.send_queue.push_back(id);
        }
    }

    /// Send queued messages in order until the queue drains or the link goes away
    async fn flush(&mut self) {
        while self.state == ConnectionState::Open {
            match self.send_queue.pop_front() {
                Some(id) => self.send_one(id).await,
                None => break,
            }
        }
    }

    /// Hand `id` to the transport. Commands and deadlines keep being served while the send is
    /// pending, and `close()` abandons it.
    async fn send_one(&mut self, id: CorrelationId) {
        let message = match self.tracker.mark_sent(id, Instant::now()) {
            Some(message) => message.clone(),
            None => return,
        };
        let intake = Intake {
            open: true,
            tracker: &mut self.tracker,
            commands: &mut self.commands,
            open_waiters: &mut self.open_waiters,
            send_queue: &mut self.send_queue,
            deferred: Vec::new(),
        };
        let (attempt, deferred) = intake
            .serve(self.options.connect_timeout(), self.transport.send(&message))
            .await;

        match attempt {
            Attempt::Finished(Ok(SendOutcome::Acknowledged(response))) => {
                self.tracker.acknowledge(id, response);
            }
            Attempt::Finished(Ok(SendOutcome::AwaitingAck)) => {
                trace!("Message {} awaiting acknowledgement", id)
            }
            Attempt::Finished(Err(err)) => {
                let link_failure = is_link_failure(&err);
                self.tracker
                    .on_send_error(id, err.clone(), &self.policy, Instant::now());
                if link_failure {
                    self.on_link_lost(err, ConnectionStatusReason::ConnectionLost)
                        .await;
                }
            }
            Attempt::Interrupted(reply) => {
                debug!("Send of {} abandoned by close", id);
                self.interrupted(reply).await;
            }
        }
        for request in deferred {
            self.acknowledge(request).await;
        }
    }

    async fn handle_event(&mut self, event: Result<TransportEvent>) {
        match event {
            Ok(TransportEvent::Acknowledged {
                correlation_id,
                response,
            }) => {
                self.tracker.acknowledge(correlation_id, response);
            }
            Ok(TransportEvent::Rejected {
                correlation_id,
                error,
            }) => {
                self.tracker
                    .on_send_error(correlation_id, error, &self.policy, Instant::now());
            }
            Ok(TransportEvent::Notification(notification)) => {
                trace!("Notification {:?}", notification.kind);
                self.emit(ClientEvent::Notification(notification));
            }
            Ok(TransportEvent::Disconnected(err)) | Err(err) => {
                self.on_link_lost(err, ConnectionStatusReason::ConnectionLost)
                    .await
            }
        }
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        for id in self.tracker.expire(now) {
            warn!("Message {} timed out", id);
        }

        if self.state == ConnectionState::Open {
            let ack_timeout = self.options.ack_timeout();
            for id in self.tracker.due_for_resend(now, ack_timeout) {
                let missing_ack =
                    Error::transport(TransportErrorKind::Timeout, "no acknowledgement received");
                if self.tracker.on_send_error(id, missing_ack, &self.policy, now)
                    == Some(crate::message::DeliveryState::Sent)
                {
                    debug!("Re-sending unacknowledged message {}", id);
                    self.enqueue(id);
                }
            }
            self.flush().await;
        }

        if self.state == ConnectionState::Reconnecting
            && self.reconnect_at.map_or(false, |at| at <= now)
        {
            self.reconnect_at = None;
            self.try_connect(ConnectionStatusReason::Connected).await;
        }

        if self.state == ConnectionState::Open && self.renew_at.map_or(false, |at| at <= now) {
            info!("Renewing SAS token for {}", self.device_id);
            self.renew_at = None;
            let _ = self.transport.close().await;
            self.set_state(
                ConnectionState::Reconnecting,
                ConnectionStatusReason::SasTokenRenewal,
            );
            self.try_connect(ConnectionStatusReason::SasTokenRenewal)
                .await;
        }
    }
}

impl<T: Transport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("hostname", &self.hostname)
            .field("device_id", &self.device_id)
            .field("protocol", &self.transport.protocol())
            .field("state", &self.state)
            .field("attempt", &self.attempt)
            .field("last_error", &self.last_error)
            .field("tracked", &self.tracker.len())
            .finish()
    }
}
