//! Sort maintenance offloaded to a background task.
//!
//! The worker owns its own [`OrderMaintainer`]. The session sends commands
//! without waiting and reads whatever order was published last.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::domain::entities::EntityId;
use crate::domain::types::SortKey;

use super::order::{OrderMaintainer, RowKey};

/// Instructions accepted by the sort worker.
#[derive(Debug, Clone)]
pub enum SortCommand {
    Init(Vec<RowKey>),
    Apply {
        changed: Vec<RowKey>,
        removed: Vec<EntityId>,
    },
    SetSortKey(SortKey),
}

/// Handle to a running sort worker. Dropping it stops the task.
#[derive(Debug)]
pub struct SortWorkerHandle {
    commands: mpsc::UnboundedSender<SortCommand>,
    published: watch::Receiver<Arc<[EntityId]>>,
    task: JoinHandle<()>,
}

impl SortWorkerHandle {
    /// Spawn a worker on the current tokio runtime.
    pub fn spawn(key: SortKey) -> Self {
        let (commands, mut inbox) = mpsc::unbounded_channel::<SortCommand>();
        let (publisher, published) = watch::channel::<Arc<[EntityId]>>(Arc::from(Vec::new()));

        let task = tokio::spawn(async move {
            let mut order = OrderMaintainer::new(key);
            while let Some(command) = inbox.recv().await {
                let ids = match command {
                    SortCommand::Init(rows) => order.init(rows),
                    SortCommand::Apply { changed, removed } => order.apply_changes(changed, removed),
                    SortCommand::SetSortKey(key) => order.set_sort_key(key),
                };
                trace!(rows = ids.len(), "Sort worker published order");
                publisher.send_replace(Arc::from(ids));
            }
            debug!("Sort worker stopped");
        });

        Self {
            commands,
            published,
            task,
        }
    }

    pub fn init(&self, rows: Vec<RowKey>) {
        self.send(SortCommand::Init(rows));
    }

    pub fn apply(&self, changed: Vec<RowKey>, removed: Vec<EntityId>) {
        if changed.is_empty() && removed.is_empty() {
            return;
        }
        self.send(SortCommand::Apply { changed, removed });
    }

    pub fn set_sort_key(&self, key: SortKey) {
        self.send(SortCommand::SetSortKey(key));
    }

    /// Most recently published order.
    pub fn latest(&self) -> Arc<[EntityId]> {
        self.published.borrow().clone()
    }

    /// Receiver notified on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Arc<[EntityId]>> {
        self.published.clone()
    }

    fn send(&self, command: SortCommand) {
        if self.commands.send(command).is_err() {
            debug!("Sort worker is gone; command dropped");
        }
    }
}

impl Drop for SortWorkerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, size: u64) -> RowKey {
        RowKey {
            id: EntityId::from(id),
            name: id.to_string(),
            namespace: "default".to_string(),
            created_at: None,
            total_size: size,
            last_event: None,
        }
    }

    #[tokio::test]
    async fn publishes_order_after_each_command() {
        let worker = SortWorkerHandle::spawn(SortKey::Recency);
        let mut published = worker.subscribe();

        worker.init(vec![row("a", 1), row("b", 5)]);
        worker.apply(vec![row("a", 9)], vec![EntityId::from("b")]);

        let order = published
            .wait_for(|ids| ids.len() == 1)
            .await
            .expect("worker running")
            .clone();

        assert_eq!(order.as_ref(), &[EntityId::from("a")]);
        assert_eq!(worker.latest().as_ref(), &[EntityId::from("a")]);
    }
}
