use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::{Value, json};
use tailview::application::backend::ClusterBackend;
use tailview::application::session::{self, SessionConfig, ViewSnapshot};
use tailview::config::{ClusterSettings, SessionSettings};
use tailview::application::backend::Backend;
use tailview::domain::types::{ConnectionStatus, SortKey, WorkloadKind};
use tailview::infra::subscription::memory::{self, MemoryServer, ServerConnection};
use tailview::live::{LiveView, ViewFilter};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use url::Url;

const WAIT: Duration = Duration::from_secs(10);

fn session_settings() -> SessionSettings {
    SessionSettings {
        namespace: "default".to_string(),
        kinds: vec![WorkloadKind::Pod],
        flush_interval: Duration::from_millis(50),
        reconnect_delay: Duration::from_millis(50),
        max_reconnect_attempts: None,
        keepalive_interval: None,
        page_limit: NonZeroU32::new(100).expect("non-zero"),
        sort: SortKey::Recency,
        offload_sort: false,
        row_limit: None,
    }
}

fn cluster_settings(server: &MockServer) -> ClusterSettings {
    ClusterSettings {
        dashboard_url: Url::parse(&server.base_url()).expect("base url"),
        cluster_api_url: Some(Url::parse(&server.url("/cluster-api/graphql")).expect("url")),
        base_path: "/".to_string(),
        kube_context: Some("dev".to_string()),
        cluster_api_namespace: "kubetail-system".to_string(),
        cluster_api_service: "kubetail-cluster-api".to_string(),
        wait_for_cluster_api: true,
    }
}

/// What one subscribe asked for, and where.
#[derive(Debug)]
struct Subscribed {
    path: String,
    query: String,
    variables: Value,
}

/// Answers the readiness wait, pushes one log-metadata event and keeps
/// every other stream open until the client stops it.
async fn serve(mut server: MemoryServer, seen: mpsc::UnboundedSender<Subscribed>) {
    while let Some(connection) = server.accept().await {
        tokio::spawn(serve_connection(connection, seen.clone()));
    }
}

async fn serve_connection(mut connection: ServerConnection, seen: mpsc::UnboundedSender<Subscribed>) {
    let Some(init) = connection.recv_json().await else {
        return;
    };
    assert_eq!(init["type"], "connection_init");
    connection.send_json(&json!({ "type": "connection_ack" }));
    let Some(subscribe) = connection.recv_json().await else {
        return;
    };
    let id = subscribe["id"].as_str().unwrap_or_default().to_string();
    let query = subscribe["payload"]["query"].as_str().unwrap_or_default().to_string();
    let _ = seen.send(Subscribed {
        path: connection.target.path().to_string(),
        query: query.clone(),
        variables: subscribe["payload"]["variables"].clone(),
    });

    if query.contains("clusterAPIReadyWait") {
        connection.send_json(&json!({
            "id": id, "type": "next", "payload": { "data": { "clusterAPIReadyWait": true } }
        }));
    } else if query.contains("logMetadataWatch") {
        connection.send_json(&json!({
            "id": id, "type": "next", "payload": { "data": { "logMetadataWatch": {
                "type": "MODIFIED",
                "object": {
                    "spec": { "containerID": "containerd://c1" },
                    "fileInfo": { "size": "400", "lastModifiedAt": "2024-05-01T10:05:00Z" }
                }
            }}}
        }));
    }

    while let Some(frame) = connection.recv_json().await {
        if frame["type"] == "complete" {
            return;
        }
    }
}

async fn wait_for(
    snapshots: &mut watch::Receiver<ViewSnapshot>,
    predicate: impl Fn(&ViewSnapshot) -> bool,
) -> ViewSnapshot {
    timeout(WAIT, snapshots.wait_for(|snapshot| predicate(snapshot)))
        .await
        .expect("snapshot in time")
        .expect("session alive")
        .clone()
}

#[tokio::test]
async fn cluster_session_lists_waits_and_streams() {
    let server = MockServer::start();
    let pods = server.mock(|when, then| {
        when.method(POST)
            .path("/graphql")
            .json_body_includes(r#"{"variables":{"kubeContext":"dev","namespace":"default"}}"#);
        then.status(200).json_body(json!({ "data": { "coreV1PodsList": {
            "metadata": { "continue": "", "resourceVersion": "7" },
            "items": [{
                "id": "pod-1",
                "metadata": {
                    "uid": "pod-1",
                    "namespace": "default",
                    "name": "web-0",
                    "creationTimestamp": "2024-05-01T09:00:00Z",
                    "ownerReferences": []
                },
                "status": { "containerStatuses": [{ "containerID": "containerd://c1", "started": true }] }
            }]
        }}}));
    });
    let log_metadata = server.mock(|when, then| {
        when.method(POST).path("/cluster-api/graphql");
        then.status(200).json_body(json!({ "data": { "logMetadataList": { "items": [{
            "id": "m1",
            "spec": { "namespace": "default", "podName": "web-0", "containerName": "web", "containerID": "containerd://c1" },
            "fileInfo": { "size": "100", "lastModifiedAt": "2024-05-01T10:00:00Z" }
        }]}}}));
    });

    let (connector, ws_server) = memory::pair(Some("graphql-transport-ws"));
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    tokio::spawn(serve(ws_server, seen_tx));

    let settings = session_settings();
    let backend = ClusterBackend::with_connector(
        cluster_settings(&server),
        &settings,
        Arc::new(connector),
    )
    .expect("backend");
    let session = session::spawn(Arc::new(backend), SessionConfig::from_settings(&settings));
    let mut snapshots = session.snapshots();

    let loaded = wait_for(&mut snapshots, |s| !s.loading && !s.rows.is_empty()).await;
    assert_eq!(loaded.rows.len(), 1);
    assert_eq!(loaded.rows[0].name, "web-0");
    assert!(loaded.last_error.is_none());

    let streamed = wait_for(&mut snapshots, |s| {
        s.rows.first().is_some_and(|row| row.total_size == 400)
    })
    .await;
    assert_eq!(streamed.generation, 1);
    wait_for(&mut snapshots, |s| s.status == ConnectionStatus::Connected).await;

    let mut subscriptions = Vec::new();
    while subscriptions.len() < 3 {
        let next = timeout(WAIT, seen.recv()).await.expect("subscribe in time");
        subscriptions.push(next.expect("server alive"));
    }
    let ready = &subscriptions[0];
    assert!(ready.query.contains("clusterAPIReadyWait"));
    assert_eq!(ready.path, "/graphql");
    assert_eq!(ready.variables["serviceName"], "kubetail-cluster-api");

    let pod_watch = subscriptions
        .iter()
        .find(|s| s.query.contains("coreV1PodsWatch"))
        .expect("pod watch");
    assert_eq!(pod_watch.path, "/graphql");
    assert_eq!(pod_watch.variables["options"]["resourceVersion"], "7");

    let log_watch = subscriptions
        .iter()
        .find(|s| s.query.contains("logMetadataWatch"))
        .expect("log metadata watch");
    assert_eq!(log_watch.path, "/cluster-api/graphql");

    pods.assert();
    log_metadata.assert();
    session.shutdown().await.expect("clean shutdown");
}

/// Mocks one list query on the dashboard, told apart by its root field.
fn list_mock<'a>(server: &'a MockServer, field: &str, items: Value) -> httpmock::Mock<'a> {
    let field = field.to_string();
    server.mock(move |when, then| {
        when.method(POST).path("/graphql").body_includes(field.as_str());
        then.status(200).json_body(json!({ "data": { (field.as_str()): {
            "metadata": { "continue": "", "resourceVersion": "3" },
            "items": items.clone()
        }}}));
    })
}

#[tokio::test]
async fn deployment_only_view_still_sums_its_pods() {
    let server = MockServer::start();
    let deployments = list_mock(
        &server,
        "appsV1DeploymentsList",
        json!([{ "id": "dep-1", "metadata": {
            "uid": "dep-1", "namespace": "default", "name": "web",
            "creationTimestamp": "2024-05-01T08:00:00Z", "ownerReferences": []
        }}]),
    );
    let replica_sets = list_mock(
        &server,
        "appsV1ReplicaSetsList",
        json!([{ "id": "rs-1", "metadata": {
            "uid": "rs-1", "namespace": "default", "name": "web-5d8",
            "ownerReferences": [{ "uid": "dep-1", "name": "web", "controller": true }]
        }}]),
    );
    let pods = list_mock(
        &server,
        "coreV1PodsList",
        json!([{ "id": "pod-1", "metadata": {
            "uid": "pod-1", "namespace": "default", "name": "web-5d8-x",
            "ownerReferences": [{ "uid": "rs-1", "name": "web-5d8", "controller": true }]
        }, "status": { "containerStatuses": [{ "containerID": "containerd://c1", "started": true }] } }]),
    );
    server.mock(|when, then| {
        when.method(POST).path("/cluster-api/graphql");
        then.status(200).json_body(json!({ "data": { "logMetadataList": { "items": [{
            "id": "m1",
            "spec": { "namespace": "default", "podName": "web-5d8-x", "containerName": "web", "containerID": "containerd://c1" },
            "fileInfo": { "size": "100", "lastModifiedAt": "2024-05-01T10:00:00Z" }
        }]}}}));
    });

    let settings = SessionSettings {
        kinds: vec![WorkloadKind::Deployment],
        ..session_settings()
    };
    let cluster = ClusterSettings {
        wait_for_cluster_api: false,
        ..cluster_settings(&server)
    };
    let (connector, _ws_server) = memory::pair(Some("graphql-transport-ws"));
    let backend = ClusterBackend::with_connector(cluster, &settings, Arc::new(connector))
        .expect("backend");
    assert_eq!(
        backend.source_kinds(),
        [WorkloadKind::Deployment, WorkloadKind::Pod, WorkloadKind::ReplicaSet]
    );

    let snapshot = backend.snapshot("default").await.expect("snapshot");
    let config = SessionConfig::from_settings(&settings);
    assert_eq!(config.kinds, vec![WorkloadKind::Deployment]);
    let mut view = LiveView::new(ViewFilter::new(config.namespace, config.kinds), SortKey::Recency);
    view.load(snapshot.entities, snapshot.metrics);

    let rows: Vec<(String, u64)> = view
        .rows()
        .into_iter()
        .map(|row| (row.name, row.total_size))
        .collect();
    assert_eq!(rows, vec![("web".to_string(), 100)]);
    deployments.assert();
    replica_sets.assert();
    pods.assert();
}

#[tokio::test]
async fn failed_fetch_leaves_no_data_and_reports_the_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/graphql");
        then.status(503).body("unavailable");
    });

    let (connector, _ws_server) = memory::pair(Some("graphql-transport-ws"));
    let settings = session_settings();
    let backend = ClusterBackend::with_connector(
        cluster_settings(&server),
        &settings,
        Arc::new(connector),
    )
    .expect("backend");
    let session = session::spawn(Arc::new(backend), SessionConfig::from_settings(&settings));
    let mut snapshots = session.snapshots();

    let failed = wait_for(&mut snapshots, |s| s.last_error.is_some()).await;
    assert!(failed.rows.is_empty());
    assert!(!failed.loading);
    assert_eq!(failed.status, ConnectionStatus::Disconnected);

    session.shutdown().await.expect("clean shutdown");
}
