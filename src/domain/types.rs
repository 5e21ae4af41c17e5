//! Shared domain enumerations.

use std::fmt;
use std::str::FromStr;

use super::error::DomainError;

/// Workload kinds tracked by the live view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    CronJob,
    DaemonSet,
    Deployment,
    Job,
    Pod,
    ReplicaSet,
    StatefulSet,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 7] = [
        WorkloadKind::CronJob,
        WorkloadKind::DaemonSet,
        WorkloadKind::Deployment,
        WorkloadKind::Job,
        WorkloadKind::Pod,
        WorkloadKind::ReplicaSet,
        WorkloadKind::StatefulSet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::CronJob => "cronjobs",
            WorkloadKind::DaemonSet => "daemonsets",
            WorkloadKind::Deployment => "deployments",
            WorkloadKind::Job => "jobs",
            WorkloadKind::Pod => "pods",
            WorkloadKind::ReplicaSet => "replicasets",
            WorkloadKind::StatefulSet => "statefulsets",
        }
    }

    /// Singular label used in rendered tables.
    pub fn label(self) -> &'static str {
        match self {
            WorkloadKind::CronJob => "CronJob",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::Job => "Job",
            WorkloadKind::Pod => "Pod",
            WorkloadKind::ReplicaSet => "ReplicaSet",
            WorkloadKind::StatefulSet => "StatefulSet",
        }
    }

    /// Kinds that sit between this kind and the containers it owns.
    pub fn descendants(self) -> &'static [WorkloadKind] {
        match self {
            WorkloadKind::CronJob => &[WorkloadKind::Job, WorkloadKind::Pod],
            WorkloadKind::Deployment => &[WorkloadKind::ReplicaSet, WorkloadKind::Pod],
            WorkloadKind::DaemonSet
            | WorkloadKind::Job
            | WorkloadKind::ReplicaSet
            | WorkloadKind::StatefulSet => &[WorkloadKind::Pod],
            WorkloadKind::Pod => &[],
        }
    }

    /// Kinds to list and watch so every kind in `visible` resolves down to
    /// its containers. Empty means every kind.
    pub fn with_descendants(visible: &[WorkloadKind]) -> Vec<WorkloadKind> {
        if visible.is_empty() {
            return WorkloadKind::ALL.to_vec();
        }
        let mut kinds: Vec<WorkloadKind> = visible
            .iter()
            .flat_map(|kind| std::iter::once(*kind).chain(kind.descendants().iter().copied()))
            .collect();
        kinds.sort_unstable();
        kinds.dedup();
        kinds
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        WorkloadKind::ALL
            .into_iter()
            .find(|kind| {
                let plural = kind.as_str();
                normalized == plural || normalized == plural.trim_end_matches('s')
            })
            .ok_or_else(|| DomainError::validation(format!("unknown workload kind `{value}`")))
    }
}

/// Column a user-selected ordering sorts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortField {
    Name,
    Namespace,
    Created,
    Size,
    LastEvent,
}

impl SortField {
    pub fn as_str(self) -> &'static str {
        match self {
            SortField::Name => "name",
            SortField::Namespace => "namespace",
            SortField::Created => "created",
            SortField::Size => "size",
            SortField::LastEvent => "last_event",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Active ordering of the visible rows.
///
/// `Recency` is the live-view default: most recent log write first, then the
/// largest aggregate size, then the entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortKey {
    #[default]
    Recency,
    Field {
        field: SortField,
        direction: SortDirection,
    },
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortKey::Recency => f.write_str("recency"),
            SortKey::Field { field, direction } => {
                let direction = match direction {
                    SortDirection::Asc => "asc",
                    SortDirection::Desc => "desc",
                };
                write!(f, "{}:{direction}", field.as_str())
            }
        }
    }
}

/// Parses `recency`, `<field>` or `<field>:<asc|desc>`.
impl FromStr for SortKey {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        if normalized == "recency" {
            return Ok(SortKey::Recency);
        }

        let (field, direction) = match normalized.split_once(':') {
            Some((field, direction)) => (field.to_string(), Some(direction.to_string())),
            None => (normalized.clone(), None),
        };

        let field = match field.as_str() {
            "name" => SortField::Name,
            "namespace" => SortField::Namespace,
            "created" => SortField::Created,
            "size" => SortField::Size,
            "last_event" | "lastevent" => SortField::LastEvent,
            _ => {
                return Err(DomainError::validation(format!(
                    "unknown sort field `{field}`"
                )));
            }
        };

        let direction = match direction.as_deref() {
            None | Some("asc") => SortDirection::Asc,
            Some("desc") => SortDirection::Desc,
            Some(other) => {
                return Err(DomainError::validation(format!(
                    "unknown sort direction `{other}`"
                )));
            }
        };

        Ok(SortKey::Field { field, direction })
    }
}

/// Connection status shown next to the live table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
        }
    }
}
