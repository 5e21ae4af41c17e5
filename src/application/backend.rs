//! Data sources a session can run against.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use tailview_api_types::GraphQlRequest;
use tokio::sync::{OnceCell, mpsc};
use tracing::{info, instrument, warn};
use url::Url;

use crate::application::error::AppError;
use crate::application::fetch;
use crate::config::{ClusterSettings, SessionSettings, websocket_url};
use crate::domain::entities::{Entity, LeafId, Metric};
use crate::domain::types::WorkloadKind;
use crate::infra::graphql::GraphQlClient;
use crate::infra::subscription::{
    Connector, SubscriptionError, SubscriptionListener, SubscriptionOptions, WsConnector,
    subscribe,
};
use crate::live::LiveEvent;

/// Committed state fetched in bulk before the live streams start.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub entities: Vec<Entity>,
    pub metrics: Vec<(LeafId, Metric)>,
    /// Resume point of each workload watch.
    pub resource_versions: Vec<(WorkloadKind, String)>,
}

impl Snapshot {
    fn resource_version(&self, kind: WorkloadKind) -> Option<&str> {
        self.resource_versions
            .iter()
            .find(|(candidate, _)| *candidate == kind)
            .map(|(_, version)| version.as_str())
    }
}

/// What a stream's results decode into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    LogMetadata,
    Workloads(WorkloadKind),
}

impl StreamKind {
    /// Decode the `data` member of one streamed result.
    pub fn decode(self, data: &Value) -> Vec<LiveEvent> {
        match self {
            StreamKind::LogMetadata => fetch::log_metadata_events(data),
            StreamKind::Workloads(kind) => fetch::workload_events(kind, data),
        }
    }
}

/// One live subscription the session should hold.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub label: String,
    pub target: Url,
    pub request: GraphQlRequest,
    pub kind: StreamKind,
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Fetch everything visible in `namespace` (empty for all).
    async fn snapshot(&self, namespace: &str) -> Result<Snapshot, AppError>;

    /// Streams to open once `snapshot` has been committed.
    async fn streams(&self, namespace: &str, snapshot: &Snapshot)
    -> Result<Vec<StreamSpec>, AppError>;

    fn connector(&self) -> Arc<dyn Connector>;
}

/// Backend talking to a live dashboard and its cluster API.
pub struct ClusterBackend {
    cluster: ClusterSettings,
    /// Listed and watched kinds: the visible ones plus what resolves them to
    /// containers. Visibility itself is the view filter's job.
    kinds: Vec<WorkloadKind>,
    page_limit: std::num::NonZeroU32,
    subscription: SubscriptionOptions,
    dashboard: GraphQlClient,
    connector: Arc<dyn Connector>,
    kube_context: OnceCell<String>,
}

impl ClusterBackend {
    pub fn new(cluster: ClusterSettings, session: &SessionSettings) -> Result<Self, AppError> {
        Self::with_connector(cluster, session, Arc::new(WsConnector))
    }

    pub fn with_connector(
        cluster: ClusterSettings,
        session: &SessionSettings,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, AppError> {
        let dashboard = GraphQlClient::new(cluster.dashboard_graphql_url())?;
        let kube_context = match cluster.kube_context.clone() {
            Some(context) => OnceCell::new_with(Some(context)),
            None => OnceCell::new(),
        };

        Ok(Self {
            subscription: subscription_options(session, "cluster"),
            kinds: WorkloadKind::with_descendants(&session.kinds),
            page_limit: session.page_limit,
            cluster,
            dashboard,
            connector,
            kube_context,
        })
    }

    /// Kinds this backend lists and watches.
    pub fn source_kinds(&self) -> &[WorkloadKind] {
        &self.kinds
    }

    /// Configured kube context, or the dashboard's current one.
    pub async fn kube_context(&self) -> Result<&str, AppError> {
        let context = self
            .kube_context
            .get_or_try_init(|| async {
                let context = fetch::current_kube_context(&self.dashboard)
                    .await?
                    .unwrap_or_default();
                info!(kube_context = %context, "Resolved kube context");
                Ok::<_, AppError>(context)
            })
            .await?;
        Ok(context.as_str())
    }

    fn cluster_api(&self, kube_context: &str) -> Result<GraphQlClient, AppError> {
        Ok(GraphQlClient::new(
            self.cluster.cluster_api_graphql_url(kube_context),
        )?)
    }

    /// Resolve once the dashboard reports the cluster API as ready.
    #[instrument(skip(self))]
    async fn wait_for_cluster_api(&self, kube_context: &str) -> Result<(), AppError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = fetch::cluster_api_ready_request(
            kube_context,
            &self.cluster.cluster_api_namespace,
            &self.cluster.cluster_api_service,
        );
        let mut options = self.subscription.clone();
        options.label = "cluster-api-ready".to_string();

        let handle = subscribe(
            self.connector.clone(),
            websocket_url(&self.cluster.dashboard_graphql_url()),
            request,
            ReadyListener { tx },
            options,
        );
        let outcome = rx.recv().await;
        handle.shutdown().await;

        match outcome {
            Some(Ok(())) => {
                info!("Cluster API is ready");
                Ok(())
            }
            Some(Err(err)) => Err(AppError::unexpected(format!(
                "cluster API readiness wait failed: {err}"
            ))),
            None => Err(AppError::unexpected(
                "cluster API readiness wait ended without an answer",
            )),
        }
    }
}

#[async_trait]
impl Backend for ClusterBackend {
    async fn snapshot(&self, namespace: &str) -> Result<Snapshot, AppError> {
        let kube_context = self.kube_context().await?;

        let listings = try_join_all(self.kinds.iter().map(|&kind| async move {
            let listing = fetch::list_workloads(
                &self.dashboard,
                kind,
                kube_context,
                namespace,
                self.page_limit,
            )
            .await?;
            Ok::<_, AppError>((kind, listing))
        }))
        .await?;

        if self.cluster.wait_for_cluster_api {
            self.wait_for_cluster_api(kube_context).await?;
        }
        let metrics = fetch::list_log_metadata(&self.cluster_api(kube_context)?, namespace).await?;

        let mut snapshot = Snapshot {
            metrics,
            ..Snapshot::default()
        };
        for (kind, listing) in listings {
            if let Some(version) = listing.resource_version {
                snapshot.resource_versions.push((kind, version));
            }
            snapshot.entities.extend(listing.entities);
        }
        Ok(snapshot)
    }

    async fn streams(
        &self,
        namespace: &str,
        snapshot: &Snapshot,
    ) -> Result<Vec<StreamSpec>, AppError> {
        let kube_context = self.kube_context().await?;
        let dashboard_ws = websocket_url(&self.cluster.dashboard_graphql_url());

        let mut streams: Vec<StreamSpec> = self
            .kinds
            .iter()
            .map(|&kind| StreamSpec {
                label: kind.as_str().to_string(),
                target: dashboard_ws.clone(),
                request: fetch::watch_request(
                    kind,
                    kube_context,
                    namespace,
                    snapshot.resource_version(kind),
                ),
                kind: StreamKind::Workloads(kind),
            })
            .collect();

        streams.push(StreamSpec {
            label: "logmetadata".to_string(),
            target: websocket_url(&self.cluster.cluster_api_graphql_url(kube_context)),
            request: fetch::log_metadata_watch_request(namespace),
            kind: StreamKind::LogMetadata,
        });
        Ok(streams)
    }

    fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }
}

/// Subscription options derived from the session settings.
pub fn subscription_options(session: &SessionSettings, label: &str) -> SubscriptionOptions {
    SubscriptionOptions {
        reconnect_delay: session.reconnect_delay,
        max_reconnect_attempts: session.max_reconnect_attempts.map(|value| value.get()),
        keepalive_interval: session.keepalive_interval,
        label: label.to_string(),
    }
}

struct ReadyListener {
    tx: mpsc::UnboundedSender<Result<(), SubscriptionError>>,
}

impl SubscriptionListener for ReadyListener {
    fn on_event(&mut self, data: Value) {
        if data.get("clusterAPIReadyWait").and_then(Value::as_bool) == Some(true) {
            let _ = self.tx.send(Ok(()));
        }
    }

    fn on_error(&mut self, error: SubscriptionError) {
        match error {
            SubscriptionError::RetriesExhausted(_) => {
                let _ = self.tx.send(Err(error));
            }
            other => warn!(error = %other, "Cluster API readiness stream reported an error"),
        }
    }
}
