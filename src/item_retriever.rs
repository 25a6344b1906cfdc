// On-demand payload retrieval from resources.
//
// Given an item scope and a requested part set, works out which payload
// parts are missing or evicted, groups the affected items by their owning
// resource and hands each resource one FetchItems request. The resources
// write the parts back through the regular item commands; the retriever
// only awaits completion. Failures are soft and per-item: the enclosing
// fetch reports them against the item and carries on with the rest.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{Scope, PAYLOAD_PART_PREFIX};
use crate::resource_manager::{ResourceManager, ResourceRequest};
use crate::storage::datastore::DataStore;
use crate::storage::entities::{scope_to_query, Collection, PimItem};
use crate::storage::query_builder::JoinType;

/// The part holding an item's full payload.
pub const FULL_PAYLOAD_PART: &str = "PLD:RFC822";

/// Items (by id) mapped to the requested parts that could not be
/// retrieved.
pub type RetrievalFailures = HashMap<i64, Vec<String>>;

pub struct ItemRetriever<'a> {
    store: &'a DataStore,
    resources: &'a ResourceManager,
    request_timeout: Duration,
    scope: Scope,
    parts: Vec<String>,
    resource_context: Option<i64>,
}

impl<'a> ItemRetriever<'a> {
    pub fn new(
        store: &'a DataStore,
        resources: &'a ResourceManager,
        request_timeout: Duration,
        scope: Scope,
    ) -> Self {
        Self {
            store,
            resources,
            request_timeout,
            scope,
            parts: Vec::new(),
            resource_context: None,
        }
    }

    pub fn set_retrieve_parts(&mut self, parts: Vec<String>) {
        self.parts = parts
            .into_iter()
            .filter(|p| p.starts_with(PAYLOAD_PART_PREFIX))
            .collect();
    }

    pub fn set_retrieve_full_payload(&mut self, full: bool) {
        if full && !self.parts.iter().any(|p| p == FULL_PAYLOAD_PART) {
            self.parts.push(FULL_PAYLOAD_PART.to_string());
        }
    }

    /// Resource context of the calling session, for remote-id scopes.
    pub fn set_resource_context(&mut self, resource_id: Option<i64>) {
        self.resource_context = resource_context_or(resource_id);
    }

    /// Parts of `item` among the requested set that need fetching: no part
    /// row yet, or an evicted row without data.
    fn missing_parts(&self, item: &PimItem) -> Result<Vec<String>> {
        if self.parts.is_empty() {
            return Ok(Vec::new());
        }
        let existing = item.parts(self.store.db())?;
        let mut missing = Vec::new();
        for wanted in &self.parts {
            let present = existing.iter().any(|part| {
                part.name == *wanted && (part.external || part.data.is_some())
            });
            if !present {
                missing.push(wanted.clone());
            }
        }
        Ok(missing)
    }

    /// Resolves the scope, issues the per-resource requests and awaits
    /// them. Returns the per-item soft failures.
    pub async fn exec(&mut self) -> Result<RetrievalFailures> {
        let mut qb = PimItem::select();
        scope_to_query(&self.scope, self.resource_context, &mut qb)?;
        if !matches!(self.scope, Scope::Rid(_)) {
            // resource resolution needs the collection join either way
            let mut join = crate::storage::query_builder::Condition::default();
            join.add_column_condition(
                PimItem::full("collectionId"),
                crate::storage::query_builder::CompareOperator::Equals,
                Collection::full("id"),
            );
            qb.add_join(JoinType::InnerJoin, Collection::TABLE, join);
        }
        qb.add_column(Collection::full("resourceId"));
        let rows = qb.query(self.store.db())?;

        // group items with missing parts by their resource
        let mut per_resource: HashMap<i64, Vec<(i64, Vec<String>)>> = HashMap::new();
        for row in &rows {
            let item = PimItem::from_row(row);
            let resource_id = row[row.len() - 1].as_i64();
            let missing = self.missing_parts(&item)?;
            if !missing.is_empty() {
                per_resource
                    .entry(resource_id)
                    .or_default()
                    .push((item.id, missing));
            }
        }
        if per_resource.is_empty() {
            return Ok(RetrievalFailures::new());
        }

        let mut failures = RetrievalFailures::new();
        for (resource_id, items) in per_resource {
            let item_ids: Vec<i64> = items.iter().map(|(id, _)| *id).collect();
            debug!(
                resource = resource_id,
                items = item_ids.len(),
                "requesting payload retrieval"
            );

            let Some(sender) = self.resources.sender(resource_id) else {
                warn!(resource = resource_id, "resource not connected, cannot retrieve");
                record_failures(&mut failures, &items);
                continue;
            };

            let (reply, reply_rx) = tokio::sync::oneshot::channel();
            let request = ResourceRequest::FetchItems {
                item_ids: item_ids.clone(),
                parts: self.parts.clone(),
                reply,
            };
            if sender.send(request).await.is_err() {
                record_failures(&mut failures, &items);
                continue;
            }

            match timeout(self.request_timeout, reply_rx).await {
                Ok(Ok(result)) => {
                    if let Some(error) = result.error {
                        warn!(resource = resource_id, error, "retrieval failed");
                        record_failures(&mut failures, &items);
                    } else {
                        for failed_id in result.failed_items {
                            if let Some((_, parts)) =
                                items.iter().find(|(id, _)| *id == failed_id)
                            {
                                failures.insert(failed_id, parts.clone());
                            }
                        }
                    }
                }
                Ok(Err(_)) => {
                    // resource dropped the reply channel
                    record_failures(&mut failures, &items);
                }
                Err(_) => {
                    warn!(resource = resource_id, "retrieval request timed out");
                    record_failures(&mut failures, &items);
                }
            }
        }
        Ok(failures)
    }

    /// Like `exec`, but any failed item is an error; used by handlers that
    /// must not proceed with partial payloads (e.g. moves).
    pub async fn exec_strict(&mut self) -> Result<()> {
        let failures = self.exec().await?;
        if failures.is_empty() {
            return Ok(());
        }
        let mut ids: Vec<i64> = failures.keys().copied().collect();
        ids.sort_unstable();
        Err(Error::Retrieval(format!(
            "unable to retrieve payload for items {ids:?}"
        )))
    }
}

fn resource_context_or(resource_id: Option<i64>) -> Option<i64> {
    resource_id.filter(|id| *id > 0)
}

fn record_failures(failures: &mut RetrievalFailures, items: &[(i64, Vec<String>)]) {
    for (id, parts) in items {
        failures.insert(*id, parts.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_manager::FetchItemsResult;
    use crate::storage::db::Database;
    use crate::storage::entities::{MimeType, Part, Resource};
    use crate::storage::part_helper::PartHelper;
    use crate::storage::schema::DbInitializer;

    fn setup() -> (DataStore, ResourceManager, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        DbInitializer::new(&db).run().unwrap();
        let mut resource = Resource {
            name: "imap".into(),
            ..Default::default()
        };
        resource.insert(&db).unwrap();
        let mut collection = Collection::new("inbox", resource.id);
        collection.insert(&db).unwrap();
        let mime = MimeType::retrieve_or_insert(&db, "message/rfc822").unwrap();
        let mut item = PimItem {
            collection_id: collection.id,
            mime_type_id: mime.id,
            ..Default::default()
        };
        item.insert(&db).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let manager = ResourceManager::new(dir.path().join("spool"));
        (DataStore::without_bus(db), manager, resource.id, item.id)
    }

    #[tokio::test]
    async fn nothing_to_do_when_parts_are_cached() {
        let (store, manager, _resource_id, item_id) = setup();
        let dir = tempfile::tempdir().unwrap();
        let helper = PartHelper::new(dir.path().to_path_buf(), 4096);
        let mut part = Part {
            pim_item_id: item_id,
            name: "PLD:RFC822".into(),
            ..Default::default()
        };
        helper.insert(store.db(), &mut part, b"cached payload").unwrap();

        let mut retriever = ItemRetriever::new(
            &store,
            &manager,
            Duration::from_secs(1),
            Scope::Uid(vec![item_id]),
        );
        retriever.set_retrieve_full_payload(true);
        let failures = retriever.exec().await.unwrap();
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn missing_part_is_requested_from_the_resource() {
        let (store, manager, resource_id, item_id) = setup();
        let mut rx = manager.register(resource_id);

        let server = tokio::spawn(async move {
            match rx.recv().await.unwrap() {
                ResourceRequest::FetchItems { item_ids, parts, reply } => {
                    assert_eq!(item_ids, vec![item_id]);
                    assert_eq!(parts, vec!["PLD:RFC822".to_string()]);
                    reply.send(FetchItemsResult::default()).unwrap();
                }
                other => panic!("unexpected request {other:?}"),
            }
        });

        let mut retriever = ItemRetriever::new(
            &store,
            &manager,
            Duration::from_secs(1),
            Scope::Uid(vec![item_id]),
        );
        retriever.set_retrieve_full_payload(true);
        let failures = retriever.exec().await.unwrap();
        assert!(failures.is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn disconnected_resource_is_a_soft_failure() {
        let (store, manager, _resource_id, item_id) = setup();
        let mut retriever = ItemRetriever::new(
            &store,
            &manager,
            Duration::from_millis(50),
            Scope::Uid(vec![item_id]),
        );
        retriever.set_retrieve_full_payload(true);
        let failures = retriever.exec().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[&item_id], vec!["PLD:RFC822".to_string()]);
        assert!(retriever.exec_strict().await.is_err());
    }

    #[tokio::test]
    async fn timeout_is_a_soft_failure() {
        let (store, manager, resource_id, item_id) = setup();
        let mut rx = manager.register(resource_id);
        // keep the request pending; never reply
        let server = tokio::spawn(async move {
            let _request = rx.recv().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut retriever = ItemRetriever::new(
            &store,
            &manager,
            Duration::from_millis(50),
            Scope::Uid(vec![item_id]),
        );
        retriever.set_retrieve_full_payload(true);
        let failures = retriever.exec().await.unwrap();
        assert_eq!(failures.len(), 1);
        server.abort();
    }
}
