//! Domain entities tracked by the live view.

use std::borrow::Borrow;
use std::fmt;

use time::OffsetDateTime;

use super::types::WorkloadKind;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Kubernetes object UID of a parent entity.
    EntityId
);

string_id!(
    /// Identifier metric events apply to (a container id without runtime prefix).
    LeafId
);

impl From<&EntityId> for LeafId {
    fn from(value: &EntityId) -> Self {
        Self(value.0.clone())
    }
}

/// A tracked parent resource such as a pod or a controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
    pub created_at: Option<OffsetDateTime>,
    pub deleted: bool,
    /// UIDs named by the object's owner references.
    pub owners: Vec<EntityId>,
    /// Explicit leaves, e.g. the containers reported in a pod status.
    pub leaves: Vec<LeafId>,
}

/// Latest known log-file metadata for one leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metric {
    /// Absolute file size in bytes.
    pub size: u64,
    pub last_modified_at: Option<OffsetDateTime>,
}

impl Metric {
    pub fn new(size: u64, last_modified_at: Option<OffsetDateTime>) -> Self {
        Self {
            size,
            last_modified_at,
        }
    }

    /// Fold a later observation into this one.
    ///
    /// Size is absolute and always replaced; the timestamp never moves back.
    pub fn merged_with(self, incoming: Metric) -> Metric {
        Metric {
            size: incoming.size,
            last_modified_at: self.last_modified_at.max(incoming.last_modified_at),
        }
    }
}

/// Roll-up of the metrics of every leaf an entity owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub owner_id: EntityId,
    pub total_size: u64,
    /// `None` when no owned leaf has reported a timestamp yet.
    pub last_event: Option<OffsetDateTime>,
}

impl Aggregate {
    pub fn empty(owner_id: EntityId) -> Self {
        Self {
            owner_id,
            total_size: 0,
            last_event: None,
        }
    }
}

/// Strip a container-runtime scheme such as `containerd://` from a container id.
pub fn strip_runtime_prefix(container_id: &str) -> &str {
    match container_id.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() => rest,
        _ => container_id,
    }
}
