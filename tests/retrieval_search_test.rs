// Retrieval and search flows with a cooperating fake resource on the
// other end of the request channels.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use pimstore::handler::{self, HandlerContext};
use pimstore::protocol::{Response, Scope};
use pimstore::resource_manager::{FetchItemsResult, ResourceRequest};
use pimstore::storage::schema::DbInitializer;
use pimstore::{Collection, Part, PimItem, Resource, ServerContext};

struct Harness {
    context: Arc<ServerContext>,
    store: pimstore::DataStore,
    part_helper: pimstore::PartHelper,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let context = Arc::new(ServerContext::with_paths(
            Default::default(),
            Default::default(),
            dir.path().join("pimstore.db"),
            dir.path().join("file_db_data"),
        ));
        let store = context.open_store(b"test".to_vec())?;
        DbInitializer::new(store.db()).run()?;
        let part_helper = context.part_helper();
        Ok(Self {
            context,
            store,
            part_helper,
            _dir: dir,
        })
    }

    fn ctx(&self) -> HandlerContext<'_> {
        HandlerContext {
            store: &self.store,
            part_helper: &self.part_helper,
            resources: &self.context.resources,
            search: &self.context.search,
            resource_context: None,
            retrieval_timeout: Duration::from_secs(1),
        }
    }

    fn seed(&self) -> Result<(Resource, Collection, i64)> {
        let mut resource = Resource {
            name: "imap".into(),
            ..Default::default()
        };
        resource.insert(self.store.db())?;
        let mut collection = Collection::new("inbox", resource.id);
        collection.insert(self.store.db())?;
        let mime =
            pimstore::MimeType::retrieve_or_insert(self.store.db(), "message/rfc822")?;
        let mut item = PimItem {
            collection_id: collection.id,
            mime_type_id: mime.id,
            datetime: Some(chrono::Utc::now()),
            atime: Some(chrono::Utc::now()),
            ..Default::default()
        };
        item.insert(self.store.db())?;
        Ok((resource, collection, item.id))
    }
}

#[tokio::test]
async fn fetch_triggers_retrieval_and_serves_the_delivered_payload() -> Result<()> {
    let harness = Harness::new()?;
    let (resource, _collection, item_id) = harness.seed()?;

    // fake agent: writes the requested part into the store, then confirms
    let mut rx = harness.context.resources.register(resource.id);
    let agent_store = harness.context.open_store(b"agent".to_vec())?;
    let agent_helper = harness.context.part_helper();
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            match request {
                ResourceRequest::FetchItems { item_ids, reply, .. } => {
                    for id in item_ids {
                        let mut part = Part {
                            pim_item_id: id,
                            name: "PLD:RFC822".into(),
                            ..Default::default()
                        };
                        agent_helper
                            .insert(agent_store.db(), &mut part, b"delivered from backend")
                            .unwrap();
                    }
                    let _ = reply.send(FetchItemsResult::default());
                }
                ResourceRequest::Search { reply, .. } => {
                    let _ = reply.send(Ok(Vec::new()));
                }
            }
        }
    });

    let responses = handler::items::fetch_items(
        &harness.ctx(),
        Scope::Uid(vec![item_id]),
        vec![],
        true,
        false,
    )
    .await?;
    let item = match &responses[0] {
        Response::Item(item) => item,
        other => panic!("expected Item, got {other:?}"),
    };
    assert!(item.missing_parts.is_empty());
    assert_eq!(item.parts.len(), 1);
    assert_eq!(item.parts[0].data, b"delivered from backend");
    Ok(())
}

#[tokio::test]
async fn failed_retrieval_is_reported_per_item_not_as_a_hard_error() -> Result<()> {
    let harness = Harness::new()?;
    let (resource, collection, item_id) = harness.seed()?;

    // second item whose payload the resource will deliver
    let mime = pimstore::MimeType::retrieve_or_insert(harness.store.db(), "message/rfc822")?;
    let mut good_item = PimItem {
        collection_id: collection.id,
        mime_type_id: mime.id,
        ..Default::default()
    };
    good_item.insert(harness.store.db())?;

    let mut rx = harness.context.resources.register(resource.id);
    let agent_store = harness.context.open_store(b"agent".to_vec())?;
    let agent_helper = harness.context.part_helper();
    let failing_id = item_id;
    tokio::spawn(async move {
        while let Some(ResourceRequest::FetchItems { item_ids, reply, .. }) = rx.recv().await {
            let mut failed = Vec::new();
            for id in item_ids {
                if id == failing_id {
                    failed.push(id);
                    continue;
                }
                let mut part = Part {
                    pim_item_id: id,
                    name: "PLD:RFC822".into(),
                    ..Default::default()
                };
                agent_helper
                    .insert(agent_store.db(), &mut part, b"ok")
                    .unwrap();
            }
            let _ = reply.send(FetchItemsResult {
                failed_items: failed,
                error: None,
            });
        }
    });

    let responses = handler::items::fetch_items(
        &harness.ctx(),
        Scope::Uid(vec![item_id, good_item.id]),
        vec![],
        true,
        false,
    )
    .await?;
    // both items stream, one carries its missing parts; the terminal
    // response is still success because one item was served
    assert_eq!(responses.len(), 3);
    let mut missing_seen = false;
    for response in &responses[..2] {
        let item = match response {
            Response::Item(item) => item,
            other => panic!("expected Item, got {other:?}"),
        };
        if item.id == failing_id {
            assert_eq!(item.missing_parts, vec!["PLD:RFC822".to_string()]);
            missing_seen = true;
        } else {
            assert_eq!(item.parts[0].data, b"ok");
        }
    }
    assert!(missing_seen);
    assert!(matches!(responses[2], Response::Done { .. }));
    Ok(())
}

#[tokio::test]
async fn store_search_creates_a_virtual_collection_linked_to_results() -> Result<()> {
    let harness = Harness::new()?;
    let (resource, _collection, item_id) = harness.seed()?;

    // agent answers searches with one known item
    let mut rx = harness.context.resources.register(resource.id);
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            match request {
                ResourceRequest::Search { reply, .. } => {
                    let _ = reply.send(Ok(vec![item_id]));
                }
                ResourceRequest::FetchItems { reply, .. } => {
                    let _ = reply.send(FetchItemsResult::default());
                }
            }
        }
    });

    let responses = handler::search::store_search(
        &harness.ctx(),
        "urgent mail".into(),
        "tag:urgent".into(),
        "SPARQL".into(),
        vec!["message/rfc822".into()],
        vec![],
    )
    .await?;
    let search_collection_id = match responses.as_slice() {
        [Response::Created { id }] => *id,
        other => panic!("expected Created, got {other:?}"),
    };

    let search_collection =
        Collection::retrieve_by_id(harness.store.db(), search_collection_id)?.unwrap();
    assert!(search_collection.is_virtual);
    assert_eq!(search_collection.query_string.as_deref(), Some("tag:urgent"));
    assert_eq!(
        search_collection.linked_item_ids(harness.store.db())?,
        vec![item_id]
    );

    // an updated result set from the resource re-links the membership
    let responses =
        handler::search::search_result(&harness.ctx(), search_collection_id, vec![])?;
    assert!(matches!(responses[0], Response::Done { .. }));
    assert!(search_collection
        .linked_item_ids(harness.store.db())?
        .is_empty());
    Ok(())
}
