//! Subscription lifecycle: handshake, streaming, reconnect and teardown.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use tailview_api_types::GraphQlRequest;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, interval_at};
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

use super::protocol::{ClientMessage, Dialect, SUBPROTOCOLS, ServerMessage, error_message};
use super::transport::Connector;

const METRIC_RECONNECT_TOTAL: &str = "tailview_reconnect_total";
const METRIC_SUBSCRIPTION_ERRORS_TOTAL: &str = "tailview_subscription_errors_total";

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Observable lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    AwaitingAck,
    Streaming,
    /// Waiting out the reconnect delay after an unexpected close.
    Reconnecting,
    Closed,
}

impl SubscriptionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionState::Connecting => "connecting",
            SubscriptionState::AwaitingAck => "awaiting_ack",
            SubscriptionState::Streaming => "streaming",
            SubscriptionState::Reconnecting => "reconnecting",
            SubscriptionState::Closed => "closed",
        }
    }
}

/// Problems reported to a listener. None of them tear down the subscription
/// except [`SubscriptionError::RetriesExhausted`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("operation error: {0}")]
    Operation(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("gave up after {0} reconnect attempts")]
    RetriesExhausted(u32),
}

impl SubscriptionError {
    fn kind(&self) -> &'static str {
        match self {
            SubscriptionError::Operation(_) => "operation",
            SubscriptionError::Connection(_) => "connection",
            SubscriptionError::Transport(_) => "transport",
            SubscriptionError::RetriesExhausted(_) => "retries_exhausted",
        }
    }
}

/// Receives the `data` member of each streamed result.
pub trait SubscriptionListener: Send + 'static {
    fn on_event(&mut self, data: Value);
    fn on_error(&mut self, error: SubscriptionError);
}

#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub reconnect_delay: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Client-initiated `ping` period for the modern dialect.
    pub keepalive_interval: Option<Duration>,
    /// Name used in logs.
    pub label: String,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: None,
            keepalive_interval: None,
            label: "subscription".to_string(),
        }
    }
}

type SharedListener = Arc<Mutex<Option<Box<dyn SubscriptionListener>>>>;

fn listener_lock<'a>(
    listener: &'a Mutex<Option<Box<dyn SubscriptionListener>>>,
    op: &'static str,
) -> MutexGuard<'a, Option<Box<dyn SubscriptionListener>>> {
    match listener.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                "Recovered from poisoned subscription listener lock"
            );
            poisoned.into_inner()
        }
    }
}

/// Owner of a running subscription. Dropping it unsubscribes.
pub struct SubscriptionHandle {
    stop: watch::Sender<bool>,
    state: watch::Receiver<SubscriptionState>,
    listener: SharedListener,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("state", &self.state())
            .field("stopped", &*self.stop.borrow())
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandle {
    /// Stop the subscription. Idempotent; once it returns the listener is
    /// never called again. The protocol stop and close happen on the
    /// subscription task.
    pub fn unsubscribe(&self) {
        if self.stop.send_replace(true) {
            return;
        }
        listener_lock(&self.listener, "unsubscribe").take();
    }

    /// Unsubscribe and wait until the stop message went out and the channel closed.
    pub async fn shutdown(mut self) {
        self.unsubscribe();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                debug!(error = %err, "Subscription task ended abnormally");
            }
        }
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn state_updates(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Start a subscription task for `request` against `target`.
pub fn subscribe(
    connector: Arc<dyn Connector>,
    target: Url,
    request: GraphQlRequest,
    listener: impl SubscriptionListener,
    options: SubscriptionOptions,
) -> SubscriptionHandle {
    let (stop, stop_rx) = watch::channel(false);
    let (state_tx, state) = watch::channel(SubscriptionState::Connecting);
    let listener: SharedListener = Arc::new(Mutex::new(Some(Box::new(listener))));

    let worker = Worker {
        connector,
        target,
        request,
        options,
        listener: listener.clone(),
        state: state_tx,
        stop: stop_rx,
    };
    let task = tokio::spawn(worker.run());

    SubscriptionHandle {
        stop,
        state,
        listener,
        task: Some(task),
    }
}

enum Outcome {
    Stopped,
    Lost { streamed: bool },
}

struct Worker {
    connector: Arc<dyn Connector>,
    target: Url,
    request: GraphQlRequest,
    options: SubscriptionOptions,
    listener: SharedListener,
    state: watch::Sender<SubscriptionState>,
    stop: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let label = self.options.label.clone();
        let mut failures: u32 = 0;

        loop {
            if self.stopped() {
                break;
            }
            match self.connection().await {
                Outcome::Stopped => break,
                Outcome::Lost { streamed } => {
                    failures = if streamed { 1 } else { failures.saturating_add(1) };
                }
            }

            if let Some(max) = self.options.max_reconnect_attempts {
                if failures > max {
                    warn!(
                        subscription = %label,
                        attempts = max,
                        result = "gave_up",
                        "Subscription reconnect attempts exhausted"
                    );
                    self.report(SubscriptionError::RetriesExhausted(max));
                    break;
                }
            }

            counter!(METRIC_RECONNECT_TOTAL, "subscription" => label.clone()).increment(1);
            self.state.send_replace(SubscriptionState::Reconnecting);
            info!(
                subscription = %label,
                attempt = failures,
                delay_ms = self.options.reconnect_delay.as_millis() as u64,
                "Subscription lost; reconnecting"
            );

            let delay = self.options.reconnect_delay;
            let mut stop = self.stop.clone();
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(SubscriptionState::Closed);
        debug!(subscription = %label, "Subscription closed");
    }

    /// One connection attempt, from connect to close.
    async fn connection(&mut self) -> Outcome {
        self.state.send_replace(SubscriptionState::Connecting);
        let mut stop = self.stop.clone();
        let connected = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => return Outcome::Stopped,
            connected = self.connector.connect(&self.target, &SUBPROTOCOLS) => connected,
        };
        let mut channel = match connected {
            Ok(channel) => channel,
            Err(err) => {
                warn!(subscription = %self.options.label, error = %err, "Subscription connect failed");
                self.report(SubscriptionError::Transport(err.to_string()));
                return Outcome::Lost { streamed: false };
            }
        };

        let dialect = Dialect::from_subprotocol(channel.subprotocol());
        debug!(
            subscription = %self.options.label,
            dialect = dialect.subprotocol(),
            "Subscription connected"
        );
        if let Err(err) = channel.send(ClientMessage::ConnectionInit.encode(dialect)).await {
            self.report(SubscriptionError::Transport(err.to_string()));
            return Outcome::Lost { streamed: false };
        }
        self.state.send_replace(SubscriptionState::AwaitingAck);

        let op_id = Uuid::new_v4().to_string();
        let mut started = false;
        let mut keepalive = self
            .options
            .keepalive_interval
            .filter(|_| dialect == Dialect::Modern)
            .map(|period| interval_at(Instant::now() + period, period));

        loop {
            let frame = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => {
                    if started {
                        let stop = ClientMessage::Stop { id: op_id.clone() };
                        if let Err(err) = channel.send(stop.encode(dialect)).await {
                            debug!(error = %err, "Stop message not delivered");
                        }
                    }
                    channel.close().await;
                    return Outcome::Stopped;
                }
                _ = tick(&mut keepalive) => {
                    if let Err(err) = channel.send(ClientMessage::Ping.encode(dialect)).await {
                        self.report(SubscriptionError::Transport(err.to_string()));
                        return Outcome::Lost { streamed: started };
                    }
                    continue;
                }
                frame = channel.recv() => frame,
            };

            let text = match frame {
                Some(Ok(text)) => text,
                Some(Err(err)) => {
                    warn!(subscription = %self.options.label, error = %err, "Subscription transport failed");
                    self.report(SubscriptionError::Transport(err.to_string()));
                    channel.close().await;
                    return Outcome::Lost { streamed: started };
                }
                None => {
                    info!(subscription = %self.options.label, "Subscription closed by peer");
                    return Outcome::Lost { streamed: started };
                }
            };

            let message = match ServerMessage::parse(&text) {
                Ok(message) => message,
                Err(err) => {
                    debug!(error = %err, "Ignoring undecodable subscription frame");
                    continue;
                }
            };

            match message {
                ServerMessage::ConnectionAck if started => {
                    debug!("Duplicate connection_ack ignored");
                }
                ServerMessage::ConnectionAck => {
                    let start = ClientMessage::Start {
                        id: op_id.clone(),
                        request: self.request.clone(),
                    };
                    if let Err(err) = channel.send(start.encode(dialect)).await {
                        self.report(SubscriptionError::Transport(err.to_string()));
                        return Outcome::Lost { streamed: false };
                    }
                    started = true;
                    self.state.send_replace(SubscriptionState::Streaming);
                }
                ServerMessage::Data { id, payload } => {
                    if id.as_deref().is_some_and(|id| id != op_id) {
                        trace!(id = ?id, "Result for another operation ignored");
                        continue;
                    }
                    self.deliver_result(payload);
                }
                ServerMessage::Error { payload, .. } => {
                    self.report(SubscriptionError::Operation(error_message(&payload)));
                }
                ServerMessage::ConnectionError { payload } => {
                    self.report(SubscriptionError::Connection(error_message(&payload)));
                }
                ServerMessage::Complete { .. } => {
                    info!(subscription = %self.options.label, "Subscription completed by server");
                    channel.close().await;
                    return Outcome::Lost { streamed: started };
                }
                ServerMessage::Ping { payload } => {
                    let pong = ClientMessage::Pong { payload };
                    if let Err(err) = channel.send(pong.encode(dialect)).await {
                        debug!(error = %err, "Pong not delivered");
                    }
                }
                ServerMessage::Pong | ServerMessage::KeepAlive => {}
                ServerMessage::Unknown(kind) => {
                    debug!(kind = %kind, "Ignoring unknown subscription message");
                }
            }
        }
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    fn deliver_result(&self, payload: Value) {
        if let Some(errors) = payload.get("errors").filter(|errors| !errors.is_null()) {
            self.report(SubscriptionError::Operation(error_message(errors)));
        }
        match payload.get("data") {
            Some(data) if !data.is_null() => {
                if self.stopped() {
                    return;
                }
                if let Some(listener) = listener_lock(&self.listener, "on_event").as_mut() {
                    listener.on_event(data.clone());
                }
            }
            _ => trace!("Result without data ignored"),
        }
    }

    fn report(&self, error: SubscriptionError) {
        counter!(
            METRIC_SUBSCRIPTION_ERRORS_TOTAL,
            "subscription" => self.options.label.clone(),
            "kind" => error.kind()
        )
        .increment(1);
        if self.stopped() {
            return;
        }
        if let Some(listener) = listener_lock(&self.listener, "on_error").as_mut() {
            listener.on_error(error);
        }
    }
}

/// Resolves once the handle asked to stop or was dropped. Holds no borrow
/// of the channel after returning.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
