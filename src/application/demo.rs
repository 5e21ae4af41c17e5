//! Synthetic feed for running the live view without a cluster.
//!
//! Deployments own replica sets which own pods; every pod runs a few
//! containers. A server task on the in-memory transport answers the modern
//! dialect handshake and streams `logMetadataWatch` results whose sizes are
//! absolute running totals.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::application::backend::{Backend, Snapshot, StreamKind, StreamSpec};
use crate::application::error::AppError;
use crate::application::fetch;
use crate::config::DemoSettings;
use crate::domain::entities::{Entity, EntityId, LeafId, Metric};
use crate::domain::types::WorkloadKind;
use crate::infra::subscription::memory::{self, MemoryConnector, MemoryServer, ServerConnection};
use crate::infra::subscription::{Connector, Dialect};

const NAMESPACES: [&str; 3] = ["default", "payments", "observability"];
const PODS_PER_DEPLOYMENT: u32 = 4;
const DEMO_TARGET: &str = "memory://demo/graphql";

#[derive(Debug, Clone)]
struct Container {
    leaf: LeafId,
    namespace: String,
    pod: String,
    name: String,
}

#[derive(Debug)]
struct DemoState {
    entities: Vec<Entity>,
    containers: Vec<Container>,
    totals: BTreeMap<LeafId, Metric>,
    rng: StdRng,
}

fn lock_state<'a>(state: &'a Mutex<DemoState>, op: &'static str) -> MutexGuard<'a, DemoState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                "Recovered from poisoned demo state lock"
            );
            poisoned.into_inner()
        }
    }
}

impl DemoState {
    fn generate(settings: &DemoSettings, mut rng: StdRng) -> Self {
        let now = OffsetDateTime::now_utc();
        let mut entities = Vec::new();
        let mut containers = Vec::new();
        let mut totals = BTreeMap::new();

        let pods = settings.pods.get();
        let deployments = pods.div_ceil(PODS_PER_DEPLOYMENT);
        for deployment in 0..deployments {
            let namespace = NAMESPACES[deployment as usize % NAMESPACES.len()].to_string();
            let app = format!("app-{deployment}");
            let deployment_id = EntityId::new(Uuid::new_v4().to_string());
            let replica_set_id = EntityId::new(Uuid::new_v4().to_string());
            let created_at = now - Duration::from_secs(3_600 * u64::from(deployments - deployment));

            entities.push(Entity {
                id: deployment_id.clone(),
                kind: WorkloadKind::Deployment,
                namespace: namespace.clone(),
                name: app.clone(),
                created_at: Some(created_at),
                deleted: false,
                owners: Vec::new(),
                leaves: Vec::new(),
            });
            entities.push(Entity {
                id: replica_set_id.clone(),
                kind: WorkloadKind::ReplicaSet,
                namespace: namespace.clone(),
                name: format!("{app}-{:x}", rng.gen_range(0x1000..0xffffu32)),
                created_at: Some(created_at),
                deleted: false,
                owners: vec![deployment_id],
                leaves: Vec::new(),
            });

            let first = deployment * PODS_PER_DEPLOYMENT;
            for pod in first..(first + PODS_PER_DEPLOYMENT).min(pods) {
                let pod_name = format!("{app}-{pod}");
                let mut leaves = Vec::new();
                for container in 0..settings.containers_per_pod.get() {
                    let leaf = LeafId::new(Uuid::new_v4().simple().to_string());
                    let size = rng.gen_range(1_024..65_536u64);
                    totals.insert(leaf.clone(), Metric::new(size, Some(now)));
                    containers.push(Container {
                        leaf: leaf.clone(),
                        namespace: namespace.clone(),
                        pod: pod_name.clone(),
                        name: format!("c{}", container + 1),
                    });
                    leaves.push(leaf);
                }
                entities.push(Entity {
                    id: EntityId::new(Uuid::new_v4().to_string()),
                    kind: WorkloadKind::Pod,
                    namespace: namespace.clone(),
                    name: pod_name,
                    created_at: Some(created_at + Duration::from_secs(u64::from(pod))),
                    deleted: false,
                    owners: vec![replica_set_id.clone()],
                    leaves,
                });
            }
        }

        Self {
            entities,
            containers,
            totals,
            rng,
        }
    }

    fn snapshot(&self, namespace: &str) -> Snapshot {
        let visible = |entity_namespace: &str| namespace.is_empty() || entity_namespace == namespace;
        Snapshot {
            entities: self
                .entities
                .iter()
                .filter(|entity| visible(&entity.namespace))
                .cloned()
                .collect(),
            metrics: self
                .containers
                .iter()
                .filter(|container| visible(&container.namespace))
                .filter_map(|container| {
                    self.totals
                        .get(&container.leaf)
                        .map(|metric| (container.leaf.clone(), *metric))
                })
                .collect(),
            resource_versions: Vec::new(),
        }
    }

    /// Grow a few random logs in `namespace` and describe them as watch events.
    fn advance(&mut self, namespace: &str) -> Vec<Value> {
        let candidates: Vec<usize> = self
            .containers
            .iter()
            .enumerate()
            .filter(|(_, container)| namespace.is_empty() || container.namespace == namespace)
            .map(|(position, _)| position)
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let now = OffsetDateTime::now_utc();
        let count = self.rng.gen_range(1..=candidates.len().min(3));
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            let position = candidates[self.rng.gen_range(0..candidates.len())];
            let container = self.containers[position].clone();
            let growth = self.rng.gen_range(128..4_096u64);
            let metric = self
                .totals
                .entry(container.leaf.clone())
                .or_default();
            metric.size = metric.size.saturating_add(growth);
            metric.last_modified_at = Some(now);
            events.push(modified_event(&container, *metric));
        }
        events
    }
}

fn modified_event(container: &Container, metric: Metric) -> Value {
    let last_modified_at = metric
        .last_modified_at
        .and_then(|at| at.format(&Rfc3339).ok());
    json!({
        "type": "MODIFIED",
        "object": {
            "id": container.leaf.as_str(),
            "spec": {
                "nodeName": "demo-node",
                "namespace": container.namespace,
                "podName": container.pod,
                "containerName": container.name,
                "containerID": container.leaf.as_str(),
            },
            "fileInfo": {
                "size": metric.size.to_string(),
                "lastModifiedAt": last_modified_at,
            },
        },
    })
}

/// Backend serving synthetic workloads from memory.
pub struct DemoBackend {
    state: Arc<Mutex<DemoState>>,
    connector: MemoryConnector,
    target: Url,
    server: JoinHandle<()>,
}

impl std::fmt::Debug for DemoBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemoBackend")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl DemoBackend {
    /// Generate the topology and start the feed server. Must run inside a
    /// Tokio runtime.
    pub fn start(settings: &DemoSettings) -> Result<Self, AppError> {
        Self::start_with_rng(settings, StdRng::from_entropy())
    }

    /// Deterministic topology and growth for a fixed seed.
    pub fn seeded(settings: &DemoSettings, seed: u64) -> Result<Self, AppError> {
        Self::start_with_rng(settings, StdRng::seed_from_u64(seed))
    }

    fn start_with_rng(settings: &DemoSettings, rng: StdRng) -> Result<Self, AppError> {
        let target = Url::parse(DEMO_TARGET)
            .map_err(|err| AppError::unexpected(format!("invalid demo target: {err}")))?;
        let state = Arc::new(Mutex::new(DemoState::generate(settings, rng)));
        let (connector, server) = memory::pair(Some(Dialect::Modern.subprotocol()));
        let server = tokio::spawn(serve(server, state.clone(), settings.tick));

        {
            let guard = lock_state(&state, "start");
            info!(
                entities = guard.entities.len(),
                containers = guard.containers.len(),
                tick_ms = settings.tick.as_millis() as u64,
                "Demo feed started"
            );
        }

        Ok(Self {
            state,
            connector,
            target,
            server,
        })
    }

    /// Number of connections the feed has accepted.
    pub fn connects(&self) -> usize {
        self.connector.connects()
    }
}

impl Drop for DemoBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

#[async_trait]
impl Backend for DemoBackend {
    async fn snapshot(&self, namespace: &str) -> Result<Snapshot, AppError> {
        Ok(lock_state(&self.state, "snapshot").snapshot(namespace))
    }

    async fn streams(
        &self,
        namespace: &str,
        _snapshot: &Snapshot,
    ) -> Result<Vec<StreamSpec>, AppError> {
        Ok(vec![StreamSpec {
            label: "demo".to_string(),
            target: self.target.clone(),
            request: fetch::log_metadata_watch_request(namespace),
            kind: StreamKind::LogMetadata,
        }])
    }

    fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.connector.clone())
    }
}

async fn serve(mut server: MemoryServer, state: Arc<Mutex<DemoState>>, tick: Duration) {
    while let Some(connection) = server.accept().await {
        tokio::spawn(serve_connection(connection, state.clone(), tick));
    }
}

async fn serve_connection(mut connection: ServerConnection, state: Arc<Mutex<DemoState>>, tick: Duration) {
    // Handshake: connection_init, then one subscribe.
    let mut subscription: Option<(String, String)> = None;
    while subscription.is_none() {
        let Some(frame) = connection.recv_json().await else {
            return;
        };
        match frame.get("type").and_then(Value::as_str) {
            Some("connection_init") => {
                connection.send_json(&json!({ "type": "connection_ack" }));
            }
            Some("subscribe") => {
                let id = frame
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let namespace = frame
                    .pointer("/payload/variables/namespace")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                subscription = Some((id, namespace));
            }
            Some("ping") => {
                connection.send_json(&json!({ "type": "pong" }));
            }
            other => debug!(frame_type = ?other, "Demo feed ignoring frame before subscribe"),
        }
    }
    let Some((id, namespace)) = subscription else {
        return;
    };
    debug!(namespace = %namespace, "Demo subscription started");

    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            frame = connection.recv_json() => match frame {
                None => return,
                Some(frame) => match frame.get("type").and_then(Value::as_str) {
                    Some("complete") => {
                        debug!(namespace = %namespace, "Demo subscription stopped");
                        return;
                    }
                    Some("ping") => {
                        connection.send_json(&json!({ "type": "pong" }));
                    }
                    _ => {}
                },
            },
            _ = ticker.tick() => {
                let events = lock_state(&state, "advance").advance(&namespace);
                for event in events {
                    let frame = json!({
                        "id": id,
                        "type": "next",
                        "payload": { "data": { (fetch::LOG_METADATA_WATCH_FIELD): event } },
                    });
                    if !connection.send_json(&frame) {
                        return;
                    }
                }
            }
        }
    }
}
