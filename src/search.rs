// Persistent-search dispatch.
//
// Search definitions live on virtual collections (query string plus
// language). The manager forwards add/remove/update to every configured
// engine and unites search results across them; re-running a search
// re-links its virtual collection to the fresh result set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::resource_manager::{ResourceManager, ResourceRequest};
use crate::storage::datastore::DataStore;
use crate::storage::entities::Collection;

/// The database column holding a query caps its length; anything longer
/// would be stored truncated and silently never match.
pub const MAX_QUERY_SIZE: usize = 32768;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub id: i64,
    pub query: String,
    pub language: String,
    pub mime_types: Vec<String>,
    /// Restrict the search to these collections; empty means everywhere.
    pub collection_ids: Vec<i64>,
    /// Restrict to one resource; 0 queries all connected resources.
    pub resource: i64,
}

/// One pluggable search backend.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// A persistent search was stored or re-enabled.
    async fn add_search(&self, collection: &Collection) -> Result<()>;

    /// A persistent search went away.
    async fn remove_search(&self, collection_id: i64) -> Result<()>;

    /// Execute the request, returning matching item ids.
    async fn search(&self, request: &SearchRequest) -> Result<HashSet<i64>>;
}

/// Forwards searches to connected resources over their request channels.
pub struct AgentSearchEngine {
    resources: Arc<ResourceManager>,
    request_timeout: Duration,
}

impl AgentSearchEngine {
    pub fn new(resources: Arc<ResourceManager>, request_timeout: Duration) -> Self {
        Self {
            resources,
            request_timeout,
        }
    }

    async fn search_one(&self, resource_id: i64, request: &SearchRequest) -> Result<Vec<i64>> {
        let sender = self
            .resources
            .sender(resource_id)
            .ok_or_else(|| Error::Retrieval(format!("resource {resource_id} not connected")))?;
        let (reply, reply_rx) = oneshot::channel();
        sender
            .send(ResourceRequest::Search {
                query: request.query.clone(),
                language: request.language.clone(),
                mime_types: request.mime_types.clone(),
                collection_id: request.id,
                reply,
            })
            .await
            .map_err(|_| Error::Retrieval(format!("resource {resource_id} went away")))?;
        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(Ok(ids))) => Ok(ids),
            Ok(Ok(Err(message))) => Err(Error::Retrieval(message)),
            Ok(Err(_)) => Err(Error::Retrieval(format!(
                "resource {resource_id} dropped the search"
            ))),
            Err(_) => Err(Error::Retrieval(format!(
                "search on resource {resource_id} timed out"
            ))),
        }
    }
}

#[async_trait]
impl SearchEngine for AgentSearchEngine {
    fn name(&self) -> &'static str {
        "Agent"
    }

    async fn add_search(&self, _collection: &Collection) -> Result<()> {
        // agents evaluate searches on demand, nothing to install
        Ok(())
    }

    async fn remove_search(&self, _collection_id: i64) -> Result<()> {
        Ok(())
    }

    async fn search(&self, request: &SearchRequest) -> Result<HashSet<i64>> {
        let resources = if request.resource > 0 {
            vec![request.resource]
        } else {
            self.resources.connected_resources()
        };
        let mut results = HashSet::new();
        for resource_id in resources {
            match self.search_one(resource_id, request).await {
                Ok(ids) => results.extend(ids),
                Err(e) => warn!(resource = resource_id, error = %e, "search engine failure"),
            }
        }
        Ok(results)
    }
}

pub struct SearchManager {
    engines: Vec<Box<dyn SearchEngine>>,
}

impl SearchManager {
    /// Builds the engine list from configured names. Unknown names are
    /// reported and skipped.
    pub fn new(
        engine_names: &[String],
        resources: Arc<ResourceManager>,
        request_timeout: Duration,
    ) -> Self {
        let mut engines: Vec<Box<dyn SearchEngine>> = Vec::new();
        for name in engine_names {
            match name.as_str() {
                "Agent" => engines.push(Box::new(AgentSearchEngine::new(
                    resources.clone(),
                    request_timeout,
                ))),
                other => warn!(engine = other, "unknown search engine type"),
            }
        }
        Self { engines }
    }

    #[cfg(test)]
    pub fn with_engines(engines: Vec<Box<dyn SearchEngine>>) -> Self {
        Self { engines }
    }

    fn validate(collection: &Collection) -> Result<()> {
        let query = collection.query_string.as_deref().unwrap_or_default();
        let language = collection.query_language.as_deref().unwrap_or_default();
        if query.is_empty() || language.is_empty() {
            return Err(Error::Argument(
                "persistent search needs a query and a language".into(),
            ));
        }
        if query.len() >= MAX_QUERY_SIZE {
            return Err(Error::Argument(format!(
                "query exceeds the {MAX_QUERY_SIZE} character schema limit and would be truncated"
            )));
        }
        Ok(())
    }

    pub async fn add_search(&self, collection: &Collection) -> Result<()> {
        Self::validate(collection)?;
        for engine in &self.engines {
            engine.add_search(collection).await?;
        }
        Ok(())
    }

    pub async fn remove_search(&self, collection_id: i64) -> Result<()> {
        for engine in &self.engines {
            engine.remove_search(collection_id).await?;
        }
        Ok(())
    }

    /// The search definition changed: drop the old engine state and result
    /// set, then re-register. The caller commits the transaction that
    /// carries the unlink notifications.
    pub async fn update_search(&self, collection: &Collection, store: &DataStore) -> Result<()> {
        self.remove_search(collection.id).await?;
        let linked = collection.linked_item_ids(store.db())?;
        for item_id in &linked {
            collection.unlink_item(store.db(), *item_id)?;
        }
        store.notifier(|collector| collector.items_unlinked(linked, collection));
        self.add_search(collection).await
    }

    /// Runs the request on every engine and unites the results.
    pub async fn search(&self, request: &SearchRequest) -> Result<HashSet<i64>> {
        let mut results = HashSet::new();
        for engine in &self.engines {
            match engine.search(request).await {
                Ok(ids) => results.extend(ids),
                Err(e) => warn!(engine = engine.name(), error = %e, "engine search failed"),
            }
        }
        debug!(matches = results.len(), "search complete");
        Ok(results)
    }

    /// Links the result set into the virtual collection, unlinking entries
    /// that dropped out. Notifications go through the store's collector.
    pub fn link_results(
        &self,
        store: &DataStore,
        collection: &Collection,
        results: &HashSet<i64>,
    ) -> Result<()> {
        let current: HashSet<i64> = collection.linked_item_ids(store.db())?.into_iter().collect();
        let added: Vec<i64> = results.difference(&current).copied().collect();
        let removed: Vec<i64> = current.difference(results).copied().collect();
        for item_id in &added {
            collection.link_item(store.db(), *item_id)?;
        }
        for item_id in &removed {
            collection.unlink_item(store.db(), *item_id)?;
        }
        store.notifier(|collector| {
            collector.items_linked(added, collection);
            collector.items_unlinked(removed, collection);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::Database;
    use crate::storage::schema::DbInitializer;
    use parking_lot::Mutex;

    struct FixedEngine {
        ids: Vec<i64>,
        removed: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl SearchEngine for FixedEngine {
        fn name(&self) -> &'static str {
            "Fixed"
        }

        async fn add_search(&self, _collection: &Collection) -> Result<()> {
            Ok(())
        }

        async fn remove_search(&self, collection_id: i64) -> Result<()> {
            self.removed.lock().push(collection_id);
            Ok(())
        }

        async fn search(&self, _request: &SearchRequest) -> Result<HashSet<i64>> {
            Ok(self.ids.iter().copied().collect())
        }
    }

    fn search_collection(query: &str) -> Collection {
        let mut collection = Collection::new("search", 1);
        collection.id = 10;
        collection.is_virtual = true;
        collection.query_string = Some(query.into());
        collection.query_language = Some("SPARQL".into());
        collection
    }

    #[tokio::test]
    async fn results_unite_across_engines() {
        let manager = SearchManager::with_engines(vec![
            Box::new(FixedEngine {
                ids: vec![1, 2],
                removed: Mutex::new(vec![]),
            }),
            Box::new(FixedEngine {
                ids: vec![2, 3],
                removed: Mutex::new(vec![]),
            }),
        ]);
        let request = SearchRequest {
            id: 10,
            query: "tag:urgent".into(),
            language: "SPARQL".into(),
            mime_types: vec![],
            collection_ids: vec![],
            resource: 0,
        };
        let results = manager.search(&request).await.unwrap();
        assert_eq!(results, [1, 2, 3].into_iter().collect());
    }

    #[tokio::test]
    async fn oversized_and_empty_queries_are_rejected() {
        let manager = SearchManager::with_engines(vec![]);
        assert!(manager.add_search(&search_collection("")).await.is_err());
        let huge = "x".repeat(MAX_QUERY_SIZE);
        assert!(manager.add_search(&search_collection(&huge)).await.is_err());
        assert!(manager.add_search(&search_collection("ok")).await.is_ok());
    }

    #[tokio::test]
    async fn link_results_diffs_the_membership() {
        let db = Database::open_in_memory().unwrap();
        DbInitializer::new(&db).run().unwrap();
        let store = DataStore::without_bus(db);

        let mut resource = crate::storage::entities::Resource {
            name: "search".into(),
            is_virtual: true,
            ..Default::default()
        };
        resource.insert(store.db()).unwrap();
        let mut collection = Collection::new("saved-search", resource.id);
        collection.is_virtual = true;
        collection.insert(store.db()).unwrap();

        // seed items so foreign keys hold
        let mime = crate::storage::entities::MimeType::retrieve_or_insert(
            store.db(),
            "message/rfc822",
        )
        .unwrap();
        let mut real_collection = Collection::new("inbox", resource.id);
        real_collection.insert(store.db()).unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut item = crate::storage::entities::PimItem {
                collection_id: real_collection.id,
                mime_type_id: mime.id,
                ..Default::default()
            };
            item.insert(store.db()).unwrap();
            ids.push(item.id);
        }

        let manager = SearchManager::with_engines(vec![]);
        let first: HashSet<i64> = [ids[0], ids[1]].into_iter().collect();
        manager.link_results(&store, &collection, &first).unwrap();
        let mut linked = collection.linked_item_ids(store.db()).unwrap();
        linked.sort_unstable();
        assert_eq!(linked, vec![ids[0], ids[1]]);

        let second: HashSet<i64> = [ids[1], ids[2]].into_iter().collect();
        manager.link_results(&store, &collection, &second).unwrap();
        let mut linked = collection.linked_item_ids(store.db()).unwrap();
        linked.sort_unstable();
        let mut expected = vec![ids[1], ids[2]];
        expected.sort_unstable();
        assert_eq!(linked, expected);
    }
}
