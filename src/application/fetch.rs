//! Bulk fetch over GraphQL and the wire-to-domain conversions shared with the
//! live streams.

use std::collections::HashMap;
use std::num::NonZeroU32;

use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tailview_api_types::{
    GraphQlRequest, LogMetadata, LogMetadataList, WatchEvent, WatchEventType, WorkloadList,
    WorkloadObject,
};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, instrument};

use crate::domain::entities::{Entity, EntityId, LeafId, Metric, strip_runtime_prefix};
use crate::domain::types::WorkloadKind;
use crate::infra::error::InfraError;
use crate::infra::graphql::GraphQlClient;
use crate::live::LiveEvent;

const METRIC_BULK_FETCH_PAGES_TOTAL: &str = "tailview_bulk_fetch_pages_total";

const OBJECT_META_FIELDS: &str = "metadata { uid namespace name creationTimestamp deletionTimestamp ownerReferences { uid name controller } }";
const POD_STATUS_FIELDS: &str = "status { containerStatuses { containerID started } }";
const LOG_METADATA_FIELDS: &str = "id spec { nodeName namespace podName containerName containerID } fileInfo { size lastModifiedAt }";

pub const KUBE_CONFIG_GET: &str = "query KubeConfigGet { kubeConfigGet { currentContext } }";

pub const CLUSTER_API_READY_WAIT: &str = "subscription ClusterAPIReadyWait($kubeContext: String!, $namespace: String!, $serviceName: String!) { clusterAPIReadyWait(kubeContext: $kubeContext, namespace: $namespace, serviceName: $serviceName) }";

/// Root field of a cluster API list query.
pub const LOG_METADATA_LIST_FIELD: &str = "logMetadataList";
/// Root field of a cluster API watch subscription.
pub const LOG_METADATA_WATCH_FIELD: &str = "logMetadataWatch";

/// Prefix shared by the list and watch root fields of `kind`.
fn field_prefix(kind: WorkloadKind) -> &'static str {
    match kind {
        WorkloadKind::CronJob => "batchV1CronJobs",
        WorkloadKind::DaemonSet => "appsV1DaemonSets",
        WorkloadKind::Deployment => "appsV1Deployments",
        WorkloadKind::Job => "batchV1Jobs",
        WorkloadKind::Pod => "coreV1Pods",
        WorkloadKind::ReplicaSet => "appsV1ReplicaSets",
        WorkloadKind::StatefulSet => "appsV1StatefulSets",
    }
}

pub fn list_field(kind: WorkloadKind) -> String {
    format!("{}List", field_prefix(kind))
}

pub fn watch_field(kind: WorkloadKind) -> String {
    format!("{}Watch", field_prefix(kind))
}

fn object_fields(kind: WorkloadKind) -> String {
    match kind {
        WorkloadKind::Pod => format!("id {OBJECT_META_FIELDS} {POD_STATUS_FIELDS}"),
        _ => format!("id {OBJECT_META_FIELDS}"),
    }
}

fn operation_name(kind: WorkloadKind) -> String {
    let prefix = field_prefix(kind);
    // Strip the API group: `coreV1Pods` -> `Pods`.
    let start = prefix
        .find(|c: char| c.is_ascii_uppercase() && c != 'V')
        .unwrap_or(0);
    prefix[start..].to_string()
}

pub fn list_query(kind: WorkloadKind) -> String {
    format!(
        "query {name}ListFetch($kubeContext: String, $namespace: String, $options: MetaV1ListOptions) {{ \
         {field}(kubeContext: $kubeContext, namespace: $namespace, options: $options) {{ \
         metadata {{ continue resourceVersion }} items {{ {fields} }} }} }}",
        name = operation_name(kind),
        field = list_field(kind),
        fields = object_fields(kind),
    )
}

pub fn watch_query(kind: WorkloadKind) -> String {
    format!(
        "subscription {name}Watch($kubeContext: String, $namespace: String, $options: MetaV1ListOptions) {{ \
         {field}(kubeContext: $kubeContext, namespace: $namespace, options: $options) {{ \
         type object {{ {fields} }} }} }}",
        name = operation_name(kind),
        field = watch_field(kind),
        fields = object_fields(kind),
    )
}

pub fn log_metadata_list_query() -> String {
    format!(
        "query LogMetadataListFetch($namespace: String) {{ \
         {LOG_METADATA_LIST_FIELD}(namespace: $namespace) {{ items {{ {LOG_METADATA_FIELDS} }} }} }}"
    )
}

pub fn log_metadata_watch_query() -> String {
    format!(
        "subscription LogMetadataListWatch($namespace: String) {{ \
         {LOG_METADATA_WATCH_FIELD}(namespace: $namespace) {{ type object {{ {LOG_METADATA_FIELDS} }} }} }}"
    )
}

fn kube_context_value(kube_context: &str) -> Value {
    if kube_context.is_empty() {
        Value::Null
    } else {
        Value::String(kube_context.to_string())
    }
}

/// Request for one page of `kind`.
pub fn list_request(
    kind: WorkloadKind,
    kube_context: &str,
    namespace: &str,
    page_limit: NonZeroU32,
    continue_token: &str,
) -> GraphQlRequest {
    GraphQlRequest::new(
        list_query(kind),
        json!({
            "kubeContext": kube_context_value(kube_context),
            "namespace": namespace,
            "options": {
                "limit": page_limit.get().to_string(),
                "continue": continue_token,
            },
        }),
    )
}

/// Watch request for `kind`, resuming after `resource_version` when known.
pub fn watch_request(
    kind: WorkloadKind,
    kube_context: &str,
    namespace: &str,
    resource_version: Option<&str>,
) -> GraphQlRequest {
    let options = match resource_version {
        Some(version) => json!({ "resourceVersion": version }),
        None => json!({}),
    };
    GraphQlRequest::new(
        watch_query(kind),
        json!({
            "kubeContext": kube_context_value(kube_context),
            "namespace": namespace,
            "options": options,
        }),
    )
}

pub fn log_metadata_watch_request(namespace: &str) -> GraphQlRequest {
    GraphQlRequest::new(log_metadata_watch_query(), json!({ "namespace": namespace }))
}

pub fn cluster_api_ready_request(kube_context: &str, namespace: &str, service: &str) -> GraphQlRequest {
    GraphQlRequest::new(
        CLUSTER_API_READY_WAIT,
        json!({
            "kubeContext": kube_context,
            "namespace": namespace,
            "serviceName": service,
        }),
    )
}

/// All objects of one kind, accumulated across pages.
#[derive(Debug, Clone, Default)]
pub struct WorkloadListing {
    pub entities: Vec<Entity>,
    /// Version of the last page, used to resume the watch.
    pub resource_version: Option<String>,
    pub pages: usize,
}

fn take_field<T: DeserializeOwned>(mut data: Value, field: &str) -> Result<T, InfraError> {
    let value = data
        .get_mut(field)
        .map(Value::take)
        .ok_or_else(|| InfraError::decode(format!("response is missing `{field}`")))?;
    serde_json::from_value(value)
        .map_err(|err| InfraError::decode(format!("failed to decode `{field}`: {err}")))
}

/// Name of the dashboard's current kube context, if it reports one.
pub async fn current_kube_context(client: &GraphQlClient) -> Result<Option<String>, InfraError> {
    let data: Value = client
        .execute(&GraphQlRequest::new(KUBE_CONFIG_GET, json!({})))
        .await?;
    let context = data
        .pointer("/kubeConfigGet/currentContext")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    Ok(context)
}

/// Fetch every object of `kind`, following continuation tokens until the
/// server returns an empty one. Objects are de-duplicated by uid; a later
/// page replaces an earlier copy.
#[instrument(skip(client), fields(kind = %kind))]
pub async fn list_workloads(
    client: &GraphQlClient,
    kind: WorkloadKind,
    kube_context: &str,
    namespace: &str,
    page_limit: NonZeroU32,
) -> Result<WorkloadListing, InfraError> {
    let field = list_field(kind);
    let mut listing = WorkloadListing::default();
    let mut positions: HashMap<EntityId, usize> = HashMap::new();
    let mut continue_token = String::new();

    loop {
        let request = list_request(kind, kube_context, namespace, page_limit, &continue_token);
        let data: Value = client.execute(&request).await?;
        let page: WorkloadList = take_field(data, &field)?;
        listing.pages += 1;
        counter!(METRIC_BULK_FETCH_PAGES_TOTAL, "kind" => kind.as_str()).increment(1);

        for object in &page.items {
            let Some(entity) = entity_from_object(kind, object) else {
                debug!(kind = %kind, "Skipping listed object without uid");
                continue;
            };
            match positions.get(&entity.id) {
                Some(&position) => listing.entities[position] = entity,
                None => {
                    positions.insert(entity.id.clone(), listing.entities.len());
                    listing.entities.push(entity);
                }
            }
        }

        listing.resource_version = page.metadata.resource_version.or(listing.resource_version);
        match page.metadata.continue_token.filter(|token| !token.is_empty()) {
            Some(token) => continue_token = token,
            None => break,
        }
    }

    info!(
        kind = %kind,
        objects = listing.entities.len(),
        pages = listing.pages,
        "Listed workloads"
    );
    Ok(listing)
}

/// Current log-file metadata of every container in `namespace`.
#[instrument(skip(client))]
pub async fn list_log_metadata(
    client: &GraphQlClient,
    namespace: &str,
) -> Result<Vec<(LeafId, Metric)>, InfraError> {
    let request = GraphQlRequest::new(log_metadata_list_query(), json!({ "namespace": namespace }));
    let data: Value = client.execute(&request).await?;
    let list: LogMetadataList = take_field(data, LOG_METADATA_LIST_FIELD)?;
    counter!(METRIC_BULK_FETCH_PAGES_TOTAL, "kind" => "logmetadata").increment(1);

    let metrics: Vec<(LeafId, Metric)> = list
        .items
        .iter()
        .filter_map(metric_from_log_metadata)
        .collect();
    info!(leaves = metrics.len(), "Listed log metadata");
    Ok(metrics)
}

fn parse_timestamp(value: Option<&str>) -> Option<OffsetDateTime> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    match OffsetDateTime::parse(value, &Rfc3339) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            debug!(value, error = %err, "Ignoring unparsable timestamp");
            None
        }
    }
}

/// Domain entity for a listed or watched object; `None` without a uid.
pub fn entity_from_object(kind: WorkloadKind, object: &WorkloadObject) -> Option<Entity> {
    let meta = &object.metadata;
    let uid = meta.uid.trim();
    if uid.is_empty() {
        return None;
    }

    let owners = meta
        .owner_references
        .iter()
        .map(|owner| owner.uid.trim())
        .filter(|uid| !uid.is_empty())
        .map(EntityId::from)
        .collect();

    let leaves = object
        .status
        .as_ref()
        .map(|status| {
            status
                .container_statuses
                .iter()
                .filter_map(|container| container.container_id.as_deref())
                .map(strip_runtime_prefix)
                .filter(|id| !id.is_empty())
                .map(LeafId::from)
                .collect()
        })
        .unwrap_or_default();

    Some(Entity {
        id: EntityId::from(uid),
        kind,
        namespace: meta.namespace.clone(),
        name: meta.name.clone(),
        created_at: parse_timestamp(meta.creation_timestamp.as_deref()),
        deleted: meta.deletion_timestamp.is_some(),
        owners,
        leaves,
    })
}

/// Leaf id and metric of one log-metadata item; `None` without a container id.
pub fn metric_from_log_metadata(item: &LogMetadata) -> Option<(LeafId, Metric)> {
    let leaf = strip_runtime_prefix(item.spec.container_id.trim());
    if leaf.is_empty() {
        return None;
    }
    let metric = Metric::new(
        item.file_info.size.get(),
        parse_timestamp(item.file_info.last_modified_at.as_deref()),
    );
    Some((LeafId::from(leaf), metric))
}

fn watch_event<T: DeserializeOwned>(data: &Value, field: &str) -> Option<WatchEvent<T>> {
    let value = data.get(field)?;
    match serde_json::from_value(value.clone()) {
        Ok(event) => Some(event),
        Err(err) => {
            debug!(field, error = %err, "Ignoring undecodable watch event");
            None
        }
    }
}

/// Live events carried by one `logMetadataWatch` result.
pub fn log_metadata_events(data: &Value) -> Vec<LiveEvent> {
    let Some(event) = watch_event::<LogMetadata>(data, LOG_METADATA_WATCH_FIELD) else {
        return Vec::new();
    };
    let Some((leaf, metric)) = event.object.as_ref().and_then(metric_from_log_metadata) else {
        debug!("Ignoring log metadata event without container id");
        return Vec::new();
    };

    match event.event_type {
        WatchEventType::Added | WatchEventType::Modified => {
            vec![LiveEvent::MetricUpsert { leaf, metric }]
        }
        WatchEventType::Deleted => vec![LiveEvent::MetricDelete { leaf }],
        WatchEventType::Unknown => Vec::new(),
    }
}

/// Live events carried by one workload watch result of `kind`.
pub fn workload_events(kind: WorkloadKind, data: &Value) -> Vec<LiveEvent> {
    let Some(event) = watch_event::<WorkloadObject>(data, &watch_field(kind)) else {
        return Vec::new();
    };
    let Some(entity) = event
        .object
        .as_ref()
        .and_then(|object| entity_from_object(kind, object))
    else {
        debug!(kind = %kind, "Ignoring workload event without uid");
        return Vec::new();
    };

    match event.event_type {
        WatchEventType::Added | WatchEventType::Modified => vec![LiveEvent::EntityUpsert(entity)],
        WatchEventType::Deleted => vec![LiveEvent::EntityDelete(entity.id)],
        WatchEventType::Unknown => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;
    use time::macros::datetime;
    use url::Url;

    use super::*;

    fn client(server: &MockServer) -> GraphQlClient {
        GraphQlClient::new(Url::parse(&server.url("/graphql")).expect("url")).expect("client")
    }

    fn page_limit() -> NonZeroU32 {
        NonZeroU32::new(100).expect("non-zero")
    }

    #[test]
    fn queries_name_the_kind_specific_fields() {
        let pods = list_query(WorkloadKind::Pod);
        assert!(pods.starts_with("query PodsListFetch("));
        assert!(pods.contains("coreV1PodsList(kubeContext: $kubeContext"));
        assert!(pods.contains("containerStatuses { containerID started }"));

        let jobs = watch_query(WorkloadKind::CronJob);
        assert!(jobs.starts_with("subscription CronJobsWatch("));
        assert!(jobs.contains("batchV1CronJobsWatch("));
        assert!(!jobs.contains("containerStatuses"));
    }

    #[test]
    fn pod_conversion_strips_runtime_prefix_and_reads_owners() {
        let object: WorkloadObject = serde_json::from_value(json!({
            "metadata": {
                "uid": "pod-1",
                "namespace": "default",
                "name": "web-0",
                "creationTimestamp": "2024-05-01T10:00:00Z",
                "ownerReferences": [{ "uid": "rs-1", "name": "web", "controller": true }]
            },
            "status": {
                "containerStatuses": [
                    { "containerID": "containerd://abc", "started": true },
                    { "containerID": null, "started": false }
                ]
            }
        }))
        .expect("object");

        let entity = entity_from_object(WorkloadKind::Pod, &object).expect("entity");
        assert_eq!(entity.id.as_str(), "pod-1");
        assert_eq!(entity.owners, vec![EntityId::from("rs-1")]);
        assert_eq!(entity.leaves, vec![LeafId::from("abc")]);
        assert_eq!(entity.created_at, Some(datetime!(2024-05-01 10:00 UTC)));
        assert!(!entity.deleted);
    }

    #[test]
    fn missing_last_modified_means_no_timestamp() {
        let item: LogMetadata = serde_json::from_value(json!({
            "spec": { "containerID": "c1" },
            "fileInfo": { "size": "2048" }
        }))
        .expect("item");

        let (leaf, metric) = metric_from_log_metadata(&item).expect("metric");
        assert_eq!(leaf.as_str(), "c1");
        assert_eq!(metric, Metric::new(2048, None));
    }

    #[test]
    fn log_metadata_events_follow_the_watch_type() {
        let modified = json!({ "logMetadataWatch": {
            "type": "MODIFIED",
            "object": {
                "spec": { "containerID": "docker://c1" },
                "fileInfo": { "size": 10, "lastModifiedAt": "2024-05-01T10:00:00Z" }
            }
        }});
        assert_eq!(
            log_metadata_events(&modified),
            vec![LiveEvent::MetricUpsert {
                leaf: LeafId::from("c1"),
                metric: Metric::new(10, Some(datetime!(2024-05-01 10:00 UTC))),
            }]
        );

        let deleted = json!({ "logMetadataWatch": {
            "type": "DELETED",
            "object": { "spec": { "containerID": "c1" }, "fileInfo": { "size": "0" } }
        }});
        assert_eq!(
            log_metadata_events(&deleted),
            vec![LiveEvent::MetricDelete {
                leaf: LeafId::from("c1")
            }]
        );

        let garbage = json!({ "logMetadataWatch": { "type": "MODIFIED", "object": { "fileInfo": { "size": "x" } } } });
        assert!(log_metadata_events(&garbage).is_empty());
    }

    #[test]
    fn workload_delete_carries_the_uid() {
        let data = json!({ "appsV1DeploymentsWatch": {
            "type": "DELETED",
            "object": { "metadata": { "uid": "dep-1", "namespace": "ns", "name": "api" } }
        }});
        assert_eq!(
            workload_events(WorkloadKind::Deployment, &data),
            vec![LiveEvent::EntityDelete(EntityId::from("dep-1"))]
        );
    }

    #[tokio::test]
    async fn kube_context_is_read_from_kube_config() -> Result<(), InfraError> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("POST")
                .path("/graphql")
                .json_body_includes(r#"{"query":"query KubeConfigGet { kubeConfigGet { currentContext } }"}"#);
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"data":{"kubeConfigGet":{"currentContext":"kind-dev"}}}"#);
        });

        let context = current_kube_context(&client(&server)).await?;
        mock.assert();
        assert_eq!(context.as_deref(), Some("kind-dev"));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_uids_across_pages_are_merged() -> Result<(), InfraError> {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method("POST")
                .path("/graphql")
                .json_body_includes(r#"{"variables":{"options":{"continue":""}}}"#);
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"data":{"appsV1ReplicaSetsList":{
                    "metadata":{"continue":"next","resourceVersion":"10"},
                    "items":[
                        {"metadata":{"uid":"rs-1","namespace":"ns","name":"old"}},
                        {"metadata":{"uid":"rs-2","namespace":"ns","name":"api"}}
                    ]}}}"#);
        });
        let second = server.mock(|when, then| {
            when.method("POST")
                .path("/graphql")
                .json_body_includes(r#"{"variables":{"options":{"continue":"next"}}}"#);
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"data":{"appsV1ReplicaSetsList":{
                    "metadata":{"continue":"","resourceVersion":"11"},
                    "items":[{"metadata":{"uid":"rs-1","namespace":"ns","name":"new"}}]}}}"#);
        });

        let listing = list_workloads(
            &client(&server),
            WorkloadKind::ReplicaSet,
            "",
            "",
            page_limit(),
        )
        .await?;

        first.assert();
        second.assert();
        assert_eq!(listing.pages, 2);
        assert_eq!(listing.entities.len(), 2);
        let names: Vec<(&str, &str)> = listing
            .entities
            .iter()
            .map(|entity| (entity.id.as_str(), entity.name.as_str()))
            .collect();
        assert!(names.contains(&("rs-1", "new")));
        assert!(names.contains(&("rs-2", "api")));
        assert_eq!(listing.resource_version.as_deref(), Some("11"));
        Ok(())
    }

    #[tokio::test]
    async fn graphql_errors_abort_the_listing() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST").path("/graphql");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"data":null,"errors":[{"message":"forbidden"}]}"#);
        });

        let result = list_workloads(&client(&server), WorkloadKind::Pod, "", "", page_limit()).await;
        assert!(matches!(result, Err(InfraError::GraphQl { .. })));
    }
}
