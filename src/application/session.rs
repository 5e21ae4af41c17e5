//! Session runtime.
//!
//! One task owns the [`LiveView`] and the [`EventBatcher`]. Subscription
//! managers, bulk fetches and the optional sort worker run elsewhere and talk
//! to it only through channels, so flushes never overlap. Every restart bumps
//! the generation; inputs tagged with an older generation are dropped.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::application::backend::{Backend, Snapshot, StreamKind, StreamSpec, subscription_options};
use crate::application::error::AppError;
use crate::config::SessionSettings;
use crate::domain::entities::EntityId;
use crate::domain::types::{ConnectionStatus, SortKey, WorkloadKind};
use crate::infra::subscription::{
    SubscriptionError, SubscriptionHandle, SubscriptionListener, SubscriptionOptions,
    SubscriptionState, subscribe,
};
use crate::live::{EventBatcher, LiveEvent, LiveView, Row, ViewFilter};

const METRIC_EVENTS_RECEIVED_TOTAL: &str = "tailview_events_received_total";

/// Requests accepted by a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Tear everything down and start over in another namespace.
    SetNamespace(String),
    SetSort(SortKey),
    /// Re-fetch and resubscribe in the current namespace.
    Refetch,
    /// Final flush, then stop.
    Shutdown,
}

/// What the session last published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewSnapshot {
    pub rows: Vec<Row>,
    pub status: ConnectionStatus,
    /// A bulk fetch for `generation` is in flight.
    pub loading: bool,
    pub generation: u64,
    pub namespace: String,
    pub sort: SortKey,
    /// Visible rows before any row limit.
    pub visible: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub namespace: String,
    pub kinds: Vec<WorkloadKind>,
    pub sort: SortKey,
    pub flush_interval: Duration,
    pub row_limit: Option<usize>,
    pub offload_sort: bool,
    pub subscription: SubscriptionOptions,
}

impl SessionConfig {
    pub fn from_settings(session: &SessionSettings) -> Self {
        Self {
            namespace: session.namespace.clone(),
            kinds: session.kinds.clone(),
            sort: session.sort,
            flush_interval: session.flush_interval,
            row_limit: session.row_limit.map(|limit| limit.get()),
            offload_sort: session.offload_sort,
            subscription: subscription_options(session, "session"),
        }
    }
}

/// Owner of a running session task.
#[derive(Debug)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshots: watch::Receiver<ViewSnapshot>,
    task: JoinHandle<Result<(), AppError>>,
}

impl SessionHandle {
    pub fn set_namespace(&self, namespace: impl Into<String>) {
        self.send(SessionCommand::SetNamespace(namespace.into()));
    }

    pub fn set_sort(&self, key: SortKey) {
        self.send(SessionCommand::SetSort(key));
    }

    pub fn refetch(&self) {
        self.send(SessionCommand::Refetch);
    }

    pub fn snapshots(&self) -> watch::Receiver<ViewSnapshot> {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> ViewSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Ask for a final flush and wait for the session to stop.
    pub async fn shutdown(self) -> Result<(), AppError> {
        self.send(SessionCommand::Shutdown);
        self.task
            .await
            .map_err(|err| AppError::unexpected(format!("session task failed: {err}")))?
    }

    fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            debug!("Session already stopped; command dropped");
        }
    }
}

/// Spawn a session against `backend` on the current runtime.
pub fn spawn(backend: Arc<dyn Backend>, config: SessionConfig) -> SessionHandle {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshots) = watch::channel(ViewSnapshot {
        namespace: config.namespace.clone(),
        sort: config.sort,
        ..ViewSnapshot::default()
    });

    let filter = ViewFilter::new(config.namespace.clone(), config.kinds.clone());
    let view = if config.offload_sort {
        LiveView::offloaded(filter, config.sort)
    } else {
        LiveView::new(filter, config.sort)
    }
    .with_row_limit(config.row_limit);

    let session = Session {
        namespace: config.namespace.clone(),
        backend,
        config,
        view,
        batcher: EventBatcher::new(),
        generation: 0,
        loading: false,
        streams: Vec::new(),
        fetch: None,
        inputs: input_tx,
        snapshots: snapshot_tx,
        last_error: None,
    };
    let task = tokio::spawn(session.run(command_rx, input_rx));

    SessionHandle {
        commands,
        snapshots,
        task,
    }
}

enum Input {
    Loaded {
        generation: u64,
        result: Result<(Snapshot, Vec<StreamSpec>), AppError>,
    },
    Events {
        generation: u64,
        events: Vec<LiveEvent>,
    },
    StreamError {
        generation: u64,
        stream: usize,
        error: SubscriptionError,
    },
    State {
        generation: u64,
        stream: usize,
        state: SubscriptionState,
    },
}

struct ActiveStream {
    label: String,
    handle: SubscriptionHandle,
    state: SubscriptionState,
    /// Reached `Streaming` at least once.
    streamed: bool,
}

struct Session {
    backend: Arc<dyn Backend>,
    config: SessionConfig,
    view: LiveView,
    batcher: EventBatcher,
    generation: u64,
    namespace: String,
    loading: bool,
    streams: Vec<ActiveStream>,
    fetch: Option<JoinHandle<()>>,
    inputs: mpsc::UnboundedSender<Input>,
    snapshots: watch::Sender<ViewSnapshot>,
    last_error: Option<String>,
}

async fn order_changed(updates: &mut Option<watch::Receiver<Arc<[EntityId]>>>) -> bool {
    match updates {
        Some(updates) => updates.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
    ) -> Result<(), AppError> {
        info!(
            namespace = %self.namespace,
            sort = %self.config.sort,
            flush_ms = self.config.flush_interval.as_millis() as u64,
            "Session started"
        );
        let mut ticker = flush_ticker(self.config.flush_interval);
        let mut order_updates = self.view.order_updates();
        self.begin_fetch();
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command, &mut ticker),
                },
                Some(input) = inputs.recv() => self.handle_input(input, &mut ticker),
                _ = ticker.tick() => self.flush(),
                changed = order_changed(&mut order_updates) => {
                    if changed {
                        self.publish();
                    } else {
                        order_updates = None;
                    }
                }
            }
        }

        self.teardown(&mut inputs).await;
        Ok(())
    }

    fn handle_command(&mut self, command: SessionCommand, ticker: &mut Interval) {
        match command {
            SessionCommand::SetNamespace(namespace) => {
                info!(from = %self.namespace, to = %namespace, "Switching namespace");
                self.namespace = namespace;
                self.view.set_filter(ViewFilter::new(
                    self.namespace.clone(),
                    self.config.kinds.clone(),
                ));
                self.restart(ticker);
            }
            SessionCommand::SetSort(key) => {
                self.view.set_sort_key(key);
                self.publish();
            }
            SessionCommand::Refetch => self.restart(ticker),
            SessionCommand::Shutdown => {}
        }
    }

    fn handle_input(&mut self, input: Input, ticker: &mut Interval) {
        match input {
            Input::Loaded { generation, result } if generation == self.generation => {
                self.fetch = None;
                self.loading = false;
                match result {
                    Ok((snapshot, streams)) => {
                        self.last_error = None;
                        self.view.load(snapshot.entities, snapshot.metrics);
                        self.open_streams(streams);
                    }
                    Err(err) => {
                        warn!(
                            error = %err,
                            transport = err.is_transport(),
                            generation,
                            "Bulk fetch failed; view left empty"
                        );
                        self.last_error = Some(err.to_string());
                        self.view.load(Vec::new(), Vec::new());
                    }
                }
                self.publish();
            }
            Input::Events { generation, events } if generation == self.generation => {
                counter!(METRIC_EVENTS_RECEIVED_TOTAL).increment(events.len() as u64);
                self.batcher.extend(events);
            }
            Input::StreamError {
                generation,
                stream,
                error,
            } if generation == self.generation => {
                let label = self
                    .streams
                    .get(stream)
                    .map(|stream| stream.label.as_str())
                    .unwrap_or("unknown");
                warn!(stream = label, error = %error, "Live stream reported an error");
                if matches!(error, SubscriptionError::RetriesExhausted(_)) {
                    self.last_error = Some(format!("{label}: {error}"));
                    self.publish();
                }
            }
            Input::State {
                generation,
                stream,
                state,
            } if generation == self.generation => self.stream_state(stream, state, ticker),
            _ => debug!("Dropping input from a previous generation"),
        }
    }

    fn stream_state(&mut self, stream: usize, state: SubscriptionState, ticker: &mut Interval) {
        let Some(active) = self.streams.get_mut(stream) else {
            return;
        };
        let previous = active.state;
        active.state = state;
        debug!(
            stream = %active.label,
            from = previous.as_str(),
            to = state.as_str(),
            "Live stream state changed"
        );

        // A connection streams once; seeing it stream again means it reconnected
        // and whatever happened during the outage is lost.
        if state == SubscriptionState::Streaming {
            if active.streamed {
                info!(stream = %active.label, "Live stream recovered; refetching");
                self.restart(ticker);
                return;
            }
            active.streamed = true;
        }

        let status = self.status();
        if status != self.snapshots.borrow().status {
            self.publish();
        }
    }

    /// Stop streams, clear the timer, drop pending events and fetch again.
    fn restart(&mut self, ticker: &mut Interval) {
        self.close_streams();
        ticker.reset();
        let discarded = self.batcher.discard();
        if discarded > 0 {
            debug!(discarded, "Discarded pending events");
        }
        self.begin_fetch();
        self.publish();
    }

    fn begin_fetch(&mut self) {
        if let Some(fetch) = self.fetch.take() {
            fetch.abort();
        }
        self.generation += 1;
        self.loading = true;

        let generation = self.generation;
        let backend = self.backend.clone();
        let namespace = self.namespace.clone();
        let inputs = self.inputs.clone();
        self.fetch = Some(tokio::spawn(async move {
            let result = async {
                let snapshot = backend.snapshot(&namespace).await?;
                let streams = backend.streams(&namespace, &snapshot).await?;
                Ok((snapshot, streams))
            }
            .await;
            let _ = inputs.send(Input::Loaded { generation, result });
        }));
        debug!(generation, namespace = %self.namespace, "Bulk fetch started");
    }

    fn open_streams(&mut self, specs: Vec<StreamSpec>) {
        let connector = self.backend.connector();
        for (index, spec) in specs.into_iter().enumerate() {
            let mut options = self.config.subscription.clone();
            options.label = spec.label.clone();
            let listener = ForwardingListener {
                generation: self.generation,
                stream: index,
                kind: spec.kind,
                inputs: self.inputs.clone(),
            };
            let handle = subscribe(connector.clone(), spec.target, spec.request, listener, options);
            self.forward_states(index, &handle);
            self.streams.push(ActiveStream {
                label: spec.label,
                state: handle.state(),
                handle,
                streamed: false,
            });
        }
        info!(
            generation = self.generation,
            streams = self.streams.len(),
            "Live streams opened"
        );
    }

    fn forward_states(&self, stream: usize, handle: &SubscriptionHandle) {
        let mut states = handle.state_updates();
        let inputs = self.inputs.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                if inputs
                    .send(Input::State {
                        generation,
                        stream,
                        state,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    fn close_streams(&mut self) {
        for stream in self.streams.drain(..) {
            stream.handle.unsubscribe();
        }
    }

    fn flush(&mut self) {
        let Some(batch) = self.batcher.take() else {
            return;
        };
        let report = self.view.apply(batch);
        if report.rows_changed > 0 || report.rows_removed > 0 || report.entities_changed > 0 {
            self.publish();
        }
    }

    async fn teardown(&mut self, inputs: &mut mpsc::UnboundedReceiver<Input>) {
        if let Some(fetch) = self.fetch.take() {
            fetch.abort();
        }
        for stream in std::mem::take(&mut self.streams) {
            stream.handle.shutdown().await;
        }

        // Keep whatever arrived before the streams stopped.
        while let Ok(input) = inputs.try_recv() {
            if let Input::Events { generation, events } = input {
                if generation == self.generation {
                    self.batcher.extend(events);
                }
            }
        }
        if let Some(batch) = self.batcher.take() {
            self.view.apply(batch);
        }
        self.loading = false;
        self.publish();
        info!(generation = self.generation, "Session stopped");
    }

    fn status(&self) -> ConnectionStatus {
        if self.streams.is_empty() {
            return if self.loading {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Disconnected
            };
        }
        let states = self.streams.iter().map(|stream| stream.state);
        if states
            .clone()
            .any(|state| state == SubscriptionState::Reconnecting)
        {
            ConnectionStatus::Reconnecting
        } else if states.clone().all(|state| state == SubscriptionState::Streaming) {
            ConnectionStatus::Connected
        } else if states.clone().all(|state| state == SubscriptionState::Closed) {
            ConnectionStatus::Disconnected
        } else {
            ConnectionStatus::Connecting
        }
    }

    fn publish(&mut self) {
        let snapshot = ViewSnapshot {
            rows: self.view.rows(),
            status: self.status(),
            loading: self.loading,
            generation: self.generation,
            namespace: self.namespace.clone(),
            sort: self.view.sort_key(),
            visible: self.view.visible_len(),
            last_error: self.last_error.clone(),
        };
        self.snapshots.send_replace(snapshot);
    }
}

fn flush_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Decodes streamed results and hands them to the session task.
struct ForwardingListener {
    generation: u64,
    stream: usize,
    kind: StreamKind,
    inputs: mpsc::UnboundedSender<Input>,
}

impl SubscriptionListener for ForwardingListener {
    fn on_event(&mut self, data: Value) {
        let events = self.kind.decode(&data);
        if events.is_empty() {
            return;
        }
        let _ = self.inputs.send(Input::Events {
            generation: self.generation,
            events,
        });
    }

    fn on_error(&mut self, error: SubscriptionError) {
        let _ = self.inputs.send(Input::StreamError {
            generation: self.generation,
            stream: self.stream,
            error,
        });
    }
}
