// End-to-end tests of the item storage flows, driving the command
// handlers directly against a file-backed database.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use pimstore::handler::{self, HandlerContext};
use pimstore::protocol::{PartData, Response, Scope};
use pimstore::storage::datastore::DataStore;
use pimstore::storage::part_helper::PartHelper;
use pimstore::storage::schema::DbInitializer;
use pimstore::resource_manager::{FetchItemsResult, ResourceRequest};
use pimstore::{Collection, Notification, Part, PimItem, Resource, ServerContext};

struct Harness {
    context: Arc<ServerContext>,
    store: DataStore,
    part_helper: PartHelper,
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
        let store = context.open_store(b"test-session".to_vec())?;
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
            retrieval_timeout: Duration::from_millis(100),
        }
    }

    /// Connects a stand-in agent that acknowledges every request without
    /// actually providing payloads.
    fn connect_fake_resource(&self, resource_id: i64) {
        let mut rx = self.context.resources.register(resource_id);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    ResourceRequest::FetchItems { reply, .. } => {
                        let _ = reply.send(FetchItemsResult::default());
                    }
                    ResourceRequest::Search { reply, .. } => {
                        let _ = reply.send(Ok(Vec::new()));
                    }
                }
            }
        });
    }

    fn seed_resource(&self, name: &str) -> Result<(Resource, Collection)> {
        let mut resource = Resource {
            name: name.into(),
            ..Default::default()
        };
        resource.insert(self.store.db())?;
        let mut collection = Collection::new(format!("{name}-root"), resource.id);
        collection.insert(self.store.db())?;
        Ok((resource, collection))
    }

    fn create_item(&self, collection: &Collection) -> Result<i64> {
        let responses = handler::items::create_item(
            &self.ctx(),
            collection.id,
            "message/rfc822".into(),
            Some("RID-1".into()),
            None,
            None,
            vec![b"\\SEEN".to_vec()],
            vec![],
            vec![],
        )?;
        match responses.as_slice() {
            [Response::Created { id }] => Ok(*id),
            other => panic!("unexpected create response {other:?}"),
        }
    }

    fn payload_part(&self, item_id: i64) -> Result<Part> {
        let item = PimItem::retrieve_by_id(self.store.db(), item_id)?.unwrap();
        Ok(item.part(self.store.db(), "PLD:RFC822")?.unwrap())
    }

    fn modify_payload(&self, item_id: i64, data: Vec<u8>) -> Result<Vec<Response>> {
        let item = PimItem::retrieve_by_id(self.store.db(), item_id)?.unwrap();
        handler::items::modify_item(
            &self.ctx(),
            item_id,
            item.rev,
            None,
            None,
            None,
            None,
            vec![],
            vec![],
            None,
            vec![PartData {
                name: "PLD:RFC822".into(),
                data,
            }],
            false,
        )
    }
}

fn external_path(part: &Part) -> String {
    String::from_utf8(part.data.clone().unwrap()).unwrap()
}

#[tokio::test]
async fn payload_transitions_from_inline_to_external_with_revisions() -> Result<()> {
    let harness = Harness::new()?;
    let (_, collection) = harness.seed_resource("res-a")?;
    let item_id = harness.create_item(&collection)?;

    // 4096 bytes: exactly at the threshold, stays in the row
    harness.modify_payload(item_id, vec![0x41; 4096])?;
    let part = harness.payload_part(item_id)?;
    assert!(!part.external);
    assert_eq!(part.datasize, 4096);
    assert_eq!(part.data.as_ref().unwrap().len(), 4096);
    let payload_dir = harness.part_helper.data_dir();
    assert!(
        !payload_dir.exists()
            || std::fs::read_dir(payload_dir)?.next().is_none(),
        "no file may exist for inline payloads"
    );

    // threshold + 1: moves to a file with revision suffix 1
    harness.modify_payload(item_id, vec![0x41; 4097])?;
    let part = harness.payload_part(item_id)?;
    assert!(part.external);
    assert_eq!(part.datasize, 4097);
    let path = external_path(&part);
    assert!(path.ends_with(&format!("{}_r1", part.id)), "got {path}");
    assert_eq!(std::fs::read(&path)?, vec![0x41; 4097]);

    // overwrite: revision bumps to 2 and the old file is removed
    harness.modify_payload(item_id, vec![0x42; 5000])?;
    let part = harness.payload_part(item_id)?;
    let new_path = external_path(&part);
    assert!(new_path.ends_with(&format!("{}_r2", part.id)), "got {new_path}");
    assert_eq!(std::fs::read(&new_path)?, vec![0x42; 5000]);
    assert!(!Path::new(&path).exists(), "previous revision must be gone");
    Ok(())
}

#[tokio::test]
async fn stale_revision_conflicts_and_leaves_the_row_alone() -> Result<()> {
    let harness = Harness::new()?;
    let (_, collection) = harness.seed_resource("res-a")?;
    let item_id = harness.create_item(&collection)?;

    // session 1 wins the race
    harness.modify_payload(item_id, b"first".to_vec())?;
    let after_first = PimItem::retrieve_by_id(harness.store.db(), item_id)?.unwrap();

    // session 2 still holds the old revision
    let stale = after_first.rev - 1;
    let result = handler::items::modify_item(
        &harness.ctx(),
        item_id,
        stale,
        None,
        None,
        None,
        None,
        vec![],
        vec![],
        None,
        vec![PartData {
            name: "PLD:RFC822".into(),
            data: b"second".to_vec(),
        }],
        false,
    );
    let err = result.unwrap_err();
    let typed = err.downcast_ref::<pimstore::Error>().unwrap();
    assert!(matches!(typed, pimstore::Error::Conflict(_)));

    let unchanged = PimItem::retrieve_by_id(harness.store.db(), item_id)?.unwrap();
    assert_eq!(unchanged.rev, after_first.rev);
    let part = harness.payload_part(item_id)?;
    assert_eq!(part.data.as_deref(), Some(&b"first"[..]));
    Ok(())
}

#[tokio::test]
async fn revision_strictly_increases_on_every_modify() -> Result<()> {
    let harness = Harness::new()?;
    let (_, collection) = harness.seed_resource("res-a")?;
    let item_id = harness.create_item(&collection)?;

    let mut last = PimItem::retrieve_by_id(harness.store.db(), item_id)?.unwrap().rev;
    for round in 0..3 {
        harness.modify_payload(item_id, vec![round as u8; 64])?;
        let rev = PimItem::retrieve_by_id(harness.store.db(), item_id)?.unwrap().rev;
        assert!(rev > last, "revision must strictly increase");
        last = rev;
    }
    Ok(())
}

#[tokio::test]
async fn cross_resource_move_clears_remote_id_after_the_notification() -> Result<()> {
    let harness = Harness::new()?;
    let (source_resource, source_collection) = harness.seed_resource("res-a")?;
    let (_, dest_collection) = harness.seed_resource("res-b")?;
    harness.connect_fake_resource(source_resource.id);
    let item_id = harness.create_item(&source_collection)?;

    let (_, mut rx) = harness
        .context
        .bus
        .subscribe(b"observer".to_vec(), Default::default());

    handler::items::move_items(&harness.ctx(), Scope::Uid(vec![item_id]), dest_collection.id)
        .await?;

    // the emitted notification still carries the old remote id
    let batch: Arc<Vec<Notification>> = rx.recv().await.unwrap();
    let moved = batch
        .iter()
        .find(|n| n.kind == pimstore::NotificationKind::ItemMoved)
        .expect("move notification");
    assert_eq!(moved.remote_id.as_deref(), Some("RID-1"));
    assert_eq!(moved.collection, source_collection.id);
    assert_eq!(moved.destination, dest_collection.id);
    assert_eq!(moved.resource, source_collection.resource_id);
    assert_eq!(moved.destination_resource, dest_collection.resource_id);

    // but the committed row does not
    let item = PimItem::retrieve_by_id(harness.store.db(), item_id)?.unwrap();
    assert_eq!(item.remote_id, None);
    assert_eq!(item.collection_id, dest_collection.id);
    assert!(item.dirty, "a client-initiated move marks the item dirty");
    Ok(())
}

#[tokio::test]
async fn same_resource_move_keeps_remote_id() -> Result<()> {
    let harness = Harness::new()?;
    let (resource, source_collection) = harness.seed_resource("res-a")?;
    harness.connect_fake_resource(resource.id);
    let mut sibling = Collection::new("archive", resource.id);
    sibling.insert(harness.store.db())?;
    let item_id = harness.create_item(&source_collection)?;

    handler::items::move_items(&harness.ctx(), Scope::Uid(vec![item_id]), sibling.id).await?;
    let item = PimItem::retrieve_by_id(harness.store.db(), item_id)?.unwrap();
    assert_eq!(item.remote_id.as_deref(), Some("RID-1"));
    assert_eq!(item.collection_id, sibling.id);
    Ok(())
}

#[tokio::test]
async fn rolled_back_transaction_emits_no_notifications_and_no_rows() -> Result<()> {
    let harness = Harness::new()?;
    let (_, collection) = harness.seed_resource("res-a")?;
    let (_, mut rx) = harness
        .context
        .bus
        .subscribe(b"observer".to_vec(), Default::default());

    // client-scoped transaction wrapping two mutations
    harness.store.begin_transaction()?;
    let responses = handler::collections::create_collection(
        &harness.ctx(),
        collection.id,
        "doomed".into(),
        None,
        vec![],
        false,
        vec![],
        None,
    )?;
    let doomed_collection = match responses.as_slice() {
        [Response::Created { id }] => *id,
        other => panic!("unexpected response {other:?}"),
    };
    let doomed_item = harness.create_item(&collection)?;

    // a failing handler aborts the whole stack
    let duplicate = handler::tags::create_tag(&harness.ctx(), b"dup".to_vec(), "PLAIN".into(), None);
    assert!(duplicate.is_ok());
    let failure = handler::tags::create_tag(&harness.ctx(), b"dup".to_vec(), "PLAIN".into(), None);
    assert!(failure.is_err());

    // neither entity exists, no subscriber saw anything
    assert!(!harness.store.in_transaction());
    assert!(Collection::retrieve_by_id(harness.store.db(), doomed_collection)?.is_none());
    assert!(PimItem::retrieve_by_id(harness.store.db(), doomed_item)?.is_none());
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn create_then_fetch_returns_equal_item() -> Result<()> {
    let harness = Harness::new()?;
    let (_, collection) = harness.seed_resource("res-a")?;

    let payload = b"Subject: hello\r\n\r\nbody".to_vec();
    let responses = handler::items::create_item(
        &harness.ctx(),
        collection.id,
        "message/rfc822".into(),
        Some("RID-9".into()),
        Some("3".into()),
        Some("gid-9".into()),
        vec![b"\\SEEN".to_vec(), b"\\ANSWERED".to_vec()],
        vec![],
        vec![PartData {
            name: "PLD:RFC822".into(),
            data: payload.clone(),
        }],
    )?;
    let item_id = match responses.as_slice() {
        [Response::Created { id }] => *id,
        other => panic!("unexpected response {other:?}"),
    };

    let responses = handler::items::fetch_items(
        &harness.ctx(),
        Scope::Uid(vec![item_id]),
        vec!["PLD:RFC822".into()],
        false,
        true,
    )
    .await?;
    assert_eq!(responses.len(), 2, "one item plus the terminal response");
    let fetched = match &responses[0] {
        Response::Item(item) => item,
        other => panic!("unexpected response {other:?}"),
    };
    assert_eq!(fetched.id, item_id);
    assert_eq!(fetched.mime_type, "message/rfc822");
    assert_eq!(fetched.remote_id.as_deref(), Some("RID-9"));
    assert_eq!(fetched.gid.as_deref(), Some("gid-9"));
    let mut flags = fetched.flags.clone();
    flags.sort();
    assert_eq!(flags, vec![b"\\ANSWERED".to_vec(), b"\\SEEN".to_vec()]);
    assert_eq!(fetched.parts.len(), 1);
    assert_eq!(fetched.parts[0].data, payload);
    assert!(matches!(responses[1], Response::Done { .. }));

    // payload access bumped the access time
    let item = PimItem::retrieve_by_id(harness.store.db(), item_id)?.unwrap();
    assert!(item.atime.is_some());
    Ok(())
}

#[tokio::test]
async fn delete_collection_removes_subtree_items_and_payload_files() -> Result<()> {
    let harness = Harness::new()?;
    let (resource, root) = harness.seed_resource("res-a")?;
    let mut child = Collection::new("child", resource.id);
    child.parent_id = Some(root.id);
    child.insert(harness.store.db())?;

    let item_id = harness.create_item(&child)?;
    harness.modify_payload(item_id, vec![0x41; 8192])?;
    let part = harness.payload_part(item_id)?;
    let path = external_path(&part);
    assert!(Path::new(&path).exists());

    handler::collections::delete_collection(&harness.ctx(), root.id).await?;

    assert!(Collection::retrieve_by_id(harness.store.db(), root.id)?.is_none());
    assert!(Collection::retrieve_by_id(harness.store.db(), child.id)?.is_none());
    assert!(PimItem::retrieve_by_id(harness.store.db(), item_id)?.is_none());
    assert!(!Path::new(&path).exists(), "payload file must be deleted");
    Ok(())
}

#[tokio::test]
async fn copy_items_duplicates_payload_with_fresh_identity() -> Result<()> {
    let harness = Harness::new()?;
    let (_, source) = harness.seed_resource("res-a")?;
    let (_, dest) = harness.seed_resource("res-b")?;
    let item_id = harness.create_item(&source)?;
    harness.modify_payload(item_id, vec![0x43; 6000])?;

    handler::items::copy_items(&harness.ctx(), Scope::Uid(vec![item_id]), dest.id).await?;

    let copies = dest.pim_items(harness.store.db())?;
    assert_eq!(copies.len(), 1);
    let copy = &copies[0];
    assert_ne!(copy.id, item_id);
    assert_eq!(copy.remote_id, None, "copies start without a remote id");
    let copied_part = copy.part(harness.store.db(), "PLD:RFC822")?.unwrap();
    assert_eq!(harness.part_helper.read(&copied_part)?, vec![0x43; 6000]);

    // the original part file is untouched
    let original_part = harness.payload_part(item_id)?;
    assert_ne!(copied_part.id, original_part.id);
    assert_eq!(harness.part_helper.read(&original_part)?, vec![0x43; 6000]);
    Ok(())
}

#[tokio::test]
async fn collection_stats_count_items_and_sizes() -> Result<()> {
    let harness = Harness::new()?;
    let (_, collection) = harness.seed_resource("res-a")?;
    for _ in 0..3 {
        let id = harness.create_item(&collection)?;
        harness.modify_payload(id, vec![0u8; 100])?;
    }
    let responses = handler::collections::collection_stats(&harness.ctx(), collection.id)?;
    match responses.as_slice() {
        [Response::CollectionStats { count, size }, Response::Done { .. }] => {
            assert_eq!(*count, 3);
            assert_eq!(*size, 300);
        }
        other => panic!("unexpected responses {other:?}"),
    }
    Ok(())
}
