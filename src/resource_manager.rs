// Request channels to connected resources (agents).
//
// Resources connect as ordinary sessions and select their resource
// context; from then on the server can hand them retrieval and search
// requests over a bounded channel. Notifications for agents that are not
// connected go to the change-replay spool instead and are drained when the
// agent comes back.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::notification::{ChangeReplaySpool, Notification, NotificationBus};

/// Work handed to a connected resource.
#[derive(Debug)]
pub enum ResourceRequest {
    /// Fetch the given payload parts for the given items from the backing
    /// store and write them back through the regular item commands.
    FetchItems {
        item_ids: Vec<i64>,
        parts: Vec<String>,
        reply: oneshot::Sender<FetchItemsResult>,
    },
    /// Execute a remote search and report matching item ids.
    Search {
        query: String,
        language: String,
        mime_types: Vec<String>,
        collection_id: i64,
        reply: oneshot::Sender<Result<Vec<i64>, String>>,
    },
}

/// Outcome of a FetchItems request.
#[derive(Debug, Default)]
pub struct FetchItemsResult {
    /// Items the resource could not provide.
    pub failed_items: Vec<i64>,
    /// Diagnostic when the request failed as a whole.
    pub error: Option<String>,
}

const RESOURCE_QUEUE_DEPTH: usize = 32;

pub struct ResourceManager {
    channels: DashMap<i64, mpsc::Sender<ResourceRequest>>,
    spool: ChangeReplaySpool,
}

impl ResourceManager {
    pub fn new(spool_dir: PathBuf) -> Self {
        Self {
            channels: DashMap::new(),
            spool: ChangeReplaySpool::new(spool_dir),
        }
    }

    /// Called when an agent session selects its resource context. Returns
    /// the receiving end the session must drain.
    pub fn register(&self, resource_id: i64) -> mpsc::Receiver<ResourceRequest> {
        let (sender, receiver) = mpsc::channel(RESOURCE_QUEUE_DEPTH);
        info!(resource = resource_id, "resource connected");
        self.channels.insert(resource_id, sender);
        receiver
    }

    pub fn unregister(&self, resource_id: i64) {
        if self.channels.remove(&resource_id).is_some() {
            info!(resource = resource_id, "resource disconnected");
        }
    }

    pub fn is_connected(&self, resource_id: i64) -> bool {
        self.channels.contains_key(&resource_id)
    }

    pub fn sender(&self, resource_id: i64) -> Option<mpsc::Sender<ResourceRequest>> {
        self.channels.get(&resource_id).map(|entry| entry.clone())
    }

    pub fn connected_resources(&self) -> Vec<i64> {
        self.channels.iter().map(|entry| *entry.key()).collect()
    }

    pub fn spool(&self) -> &ChangeReplaySpool {
        &self.spool
    }

    /// Routes a committed batch into the spool for every offline agent
    /// whose resource the batch touches.
    pub fn spool_for_offline_agents(&self, batch: &[Notification]) {
        use std::collections::HashMap;
        let mut per_agent: HashMap<i64, Vec<Notification>> = HashMap::new();
        for notification in batch {
            for resource in [notification.resource, notification.destination_resource] {
                if resource > 0 && !self.is_connected(resource) {
                    let entry = per_agent.entry(resource).or_default();
                    if entry.last() != Some(notification) {
                        entry.push(notification.clone());
                    }
                }
            }
        }
        for (agent_id, notifications) in per_agent {
            if let Err(e) = self.spool.enqueue(agent_id, &notifications) {
                tracing::warn!(agent = agent_id, error = %e, "failed to spool notifications");
            }
        }
    }

    /// Subscribes to the bus and keeps the spool fed; runs until the bus
    /// drops the subscription.
    pub async fn run_spooler(self: Arc<Self>, bus: Arc<NotificationBus>) {
        let (_, mut receiver) = bus.subscribe(b"change-replay-spool".to_vec(), Default::default());
        debug!("change-replay spooler running");
        while let Some(batch) = receiver.recv().await {
            self.spool_for_offline_agents(&batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationCollector;
    use crate::storage::entities::{Collection, PimItem};

    fn sample_batch(resource_id: i64) -> Vec<Notification> {
        let mut collector = NotificationCollector::new(b"s".to_vec());
        let item = PimItem {
            id: 1,
            ..Default::default()
        };
        let mut collection = Collection::new("c", resource_id);
        collection.id = 4;
        collector.item_added(&item, &collection);
        collector.take()
    }

    #[tokio::test]
    async fn offline_agents_get_spooled_connected_ones_do_not() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResourceManager::new(dir.path().join("spool"));

        let _rx = manager.register(7);
        manager.spool_for_offline_agents(&sample_batch(7));
        assert!(manager.spool().pending(7).unwrap().is_empty());

        manager.unregister(7);
        manager.spool_for_offline_agents(&sample_batch(7));
        assert_eq!(manager.spool().pending(7).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn requests_flow_through_registered_channels() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResourceManager::new(dir.path().join("spool"));
        let mut rx = manager.register(3);

        let (reply, reply_rx) = oneshot::channel();
        manager
            .sender(3)
            .unwrap()
            .send(ResourceRequest::FetchItems {
                item_ids: vec![1, 2],
                parts: vec!["PLD:RFC822".into()],
                reply,
            })
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ResourceRequest::FetchItems { item_ids, reply, .. } => {
                assert_eq!(item_ids, vec![1, 2]);
                reply.send(FetchItemsResult::default()).unwrap();
            }
            other => panic!("unexpected request {other:?}"),
        }
        let result = reply_rx.await.unwrap();
        assert!(result.failed_items.is_empty());
        assert!(result.error.is_none());
    }
}
