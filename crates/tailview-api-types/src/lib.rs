//! Wire types consumed by tailview.
//!
//! These mirror the JSON shapes served by the dashboard and cluster-API
//! GraphQL endpoints. Timestamps stay as strings here; parsing into typed
//! values happens at the domain boundary so that a malformed timestamp never
//! rejects an otherwise valid payload.

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// GraphQL request body sent over HTTP and inside subscription start messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Value,
}

impl GraphQlRequest {
    pub fn new(query: impl Into<String>, variables: Value) -> Self {
        Self {
            query: query.into(),
            variables,
        }
    }
}

/// GraphQL response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphQlResponse<T> {
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlError {
    pub message: String,
}

/// Kubernetes list metadata carrying the continuation token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(rename = "continue")]
    pub continue_token: Option<String>,
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OwnerReference {
    pub uid: String,
    pub name: Option<String>,
    pub controller: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectMeta {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub creation_timestamp: Option<String>,
    pub deletion_timestamp: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerStatus {
    #[serde(rename = "containerID")]
    pub container_id: Option<String>,
    pub started: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(deserialize_with = "null_as_default")]
    pub container_statuses: Vec<ContainerStatus>,
}

/// Any workload object returned by the list and watch operations.
///
/// Only pods carry a `status`; controllers are linked through owner references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadObject {
    pub id: Option<String>,
    pub metadata: ObjectMeta,
    pub status: Option<PodStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadList {
    pub metadata: ListMeta,
    #[serde(deserialize_with = "null_as_default")]
    pub items: Vec<WorkloadObject>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogMetadataSpec {
    pub node_name: String,
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    #[serde(rename = "containerID")]
    pub container_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileInfo {
    pub size: FileSize,
    pub last_modified_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogMetadata {
    pub id: Option<String>,
    pub spec: LogMetadataSpec,
    pub file_info: FileInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogMetadataList {
    #[serde(deserialize_with = "null_as_default")]
    pub items: Vec<LogMetadata>,
}

/// Watch event type as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    #[serde(default = "Option::default")]
    pub object: Option<T>,
}

/// File size that may arrive as a JSON number or as a numeral string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FileSize(pub u64);

impl FileSize {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl<'de> Deserialize<'de> for FileSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FileSizeVisitor;

        impl Visitor<'_> for FileSizeVisitor {
            type Value = FileSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or a numeral string")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<FileSize, E> {
                Ok(FileSize(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<FileSize, E> {
                u64::try_from(value)
                    .map(FileSize)
                    .map_err(|_| E::custom(format!("negative size `{value}`")))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<FileSize, E> {
                if value.is_finite() && value >= 0.0 {
                    Ok(FileSize(value.trunc() as u64))
                } else {
                    Err(E::custom(format!("invalid size `{value}`")))
                }
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<FileSize, E> {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Ok(FileSize(0));
                }
                trimmed
                    .parse::<u64>()
                    .map(FileSize)
                    .map_err(|err| E::custom(format!("invalid size `{value}`: {err}")))
            }

            fn visit_unit<E: de::Error>(self) -> Result<FileSize, E> {
                Ok(FileSize(0))
            }
        }

        deserializer.deserialize_any(FileSizeVisitor)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
