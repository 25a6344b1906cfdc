// Per-connection storage context: one driver connection, the notification
// collector and the transaction state. Handlers receive a `DataStore`
// instead of reaching for process-wide singletons, which also lets tests
// run against an in-memory driver.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::db::Database;
use super::entities::{Collection, Flag, MimeType, PimItem, Tag};
use crate::error::{Error, Result};
use crate::notification::{NotificationBus, NotificationCollector};
use crate::protocol::CachePolicy;

pub struct DataStore {
    db: Database,
    bus: Option<Arc<NotificationBus>>,
    collector: Mutex<NotificationCollector>,
    // owned by one session, atomic only so the store can be held across
    // suspension points
    transaction_depth: AtomicU32,
}

impl DataStore {
    pub fn new(db: Database, bus: Arc<NotificationBus>, session_id: Vec<u8>) -> Self {
        Self {
            db,
            bus: Some(bus),
            collector: Mutex::new(NotificationCollector::new(session_id)),
            transaction_depth: AtomicU32::new(0),
        }
    }

    /// A store that buffers notifications but never publishes them; used by
    /// workers that do not own a bus connection and by tests.
    pub fn without_bus(db: Database) -> Self {
        Self {
            db,
            bus: None,
            collector: Mutex::new(NotificationCollector::new(Vec::new())),
            transaction_depth: AtomicU32::new(0),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn set_session_id(&self, session_id: Vec<u8>) {
        self.collector.lock().set_session_id(session_id);
    }

    /// Access to the notification collector for the duration of a call.
    pub fn notifier<R>(&self, f: impl FnOnce(&mut NotificationCollector) -> R) -> R {
        f(&mut self.collector.lock())
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_depth.load(Ordering::Relaxed) > 0
    }

    /// Nested begin only increments the depth; the driver transaction is
    /// opened once at the outermost level.
    pub fn begin_transaction(&self) -> Result<()> {
        let depth = self.transaction_depth.load(Ordering::Relaxed);
        if depth == 0 {
            self.db.begin()?;
        }
        self.transaction_depth.store(depth + 1, Ordering::Relaxed);
        Ok(())
    }

    /// The outermost commit writes the transaction and atomically releases
    /// the buffered notifications.
    pub fn commit_transaction(&self) -> Result<()> {
        let depth = self.transaction_depth.load(Ordering::Relaxed);
        if depth == 0 {
            return Err(Error::Argument("commit outside of a transaction".into()));
        }
        if depth > 1 {
            self.transaction_depth.store(depth - 1, Ordering::Relaxed);
            return Ok(());
        }
        self.db.commit()?;
        self.transaction_depth.store(0, Ordering::Relaxed);
        let batch = self.collector.lock().take();
        if let Some(bus) = &self.bus {
            bus.publish(batch);
        }
        Ok(())
    }

    /// A rollback at any depth aborts the whole stack and discards every
    /// buffered notification.
    pub fn rollback_transaction(&self) -> Result<()> {
        if self.transaction_depth.load(Ordering::Relaxed) == 0 {
            return Ok(());
        }
        self.transaction_depth.store(0, Ordering::Relaxed);
        self.collector.lock().clear();
        self.db.rollback()
    }

    /// Effective cache policy for a collection: the collection's own policy
    /// unless it inherits, else the nearest ancestor with an explicit
    /// policy, else the global default.
    pub fn active_cache_policy(&self, collection: &Collection) -> Result<CachePolicy> {
        let own = collection.cache_policy();
        if !own.inherit {
            return Ok(own);
        }
        let mut current = collection.parent(&self.db)?;
        while let Some(ancestor) = current {
            let policy = ancestor.cache_policy();
            if !policy.inherit {
                return Ok(policy);
            }
            current = ancestor.parent(&self.db)?;
        }
        Ok(CachePolicy {
            inherit: false,
            local_parts: Vec::new(),
            cache_timeout: -1,
            sync_on_demand: false,
        })
    }

    /// Interns mime type and flags, inserts the item row and its relation
    /// rows, and records the item-added notification.
    pub fn append_pim_item(
        &self,
        item: &mut PimItem,
        mime_type: &str,
        collection: &Collection,
        flags: &[Vec<u8>],
        tags: &[i64],
    ) -> Result<i64> {
        let mime = MimeType::retrieve_or_insert(&self.db, mime_type)?;
        item.mime_type_id = mime.id;
        item.collection_id = collection.id;
        item.insert(&self.db)?;
        for flag_name in flags {
            let flag = Flag::retrieve_or_insert(&self.db, &String::from_utf8_lossy(flag_name))?;
            item.add_flag(&self.db, flag.id)?;
        }
        for tag_id in tags {
            if Tag::retrieve_by_id(&self.db, *tag_id)?.is_none() {
                return Err(Error::Argument(format!("unknown tag {tag_id}")));
            }
            item.add_tag(&self.db, *tag_id)?;
        }
        debug!(item = item.id, collection = collection.id, "appended item");
        self.notifier(|collector| collector.item_added(item, collection));
        Ok(item.id)
    }

    /// Replaces the item's flag set, returning whether anything changed.
    pub fn set_item_flags(&self, item: &PimItem, flags: &[Vec<u8>]) -> Result<bool> {
        let current = item.flags(&self.db)?;
        item.clear_flags(&self.db)?;
        let mut changed = current.len() != flags.len();
        for flag_name in flags {
            let name = String::from_utf8_lossy(flag_name);
            let flag = Flag::retrieve_or_insert(&self.db, &name)?;
            item.add_flag(&self.db, flag.id)?;
            if !changed && !current.iter().any(|f| f.name == name) {
                changed = true;
            }
        }
        Ok(changed)
    }

    pub fn add_item_flags(&self, item: &PimItem, flags: &[Vec<u8>]) -> Result<bool> {
        let mut changed = false;
        for flag_name in flags {
            let flag = Flag::retrieve_or_insert(&self.db, &String::from_utf8_lossy(flag_name))?;
            changed |= item.add_flag(&self.db, flag.id)?;
        }
        Ok(changed)
    }

    pub fn remove_item_flags(&self, item: &PimItem, flags: &[Vec<u8>]) -> Result<bool> {
        let mut changed = false;
        for flag_name in flags {
            if let Some(flag) =
                Flag::retrieve_by_name(&self.db, &String::from_utf8_lossy(flag_name))?
            {
                changed |= item.remove_flag(&self.db, flag.id)?;
            }
        }
        Ok(changed)
    }

    pub fn set_item_tags(&self, item: &PimItem, tags: &[i64]) -> Result<bool> {
        let current = item.tags(&self.db)?;
        item.clear_tags(&self.db)?;
        let mut changed = current.len() != tags.len();
        for tag_id in tags {
            if Tag::retrieve_by_id(&self.db, *tag_id)?.is_none() {
                return Err(Error::Argument(format!("unknown tag {tag_id}")));
            }
            item.add_tag(&self.db, *tag_id)?;
            if !changed && !current.iter().any(|t| t.id == *tag_id) {
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Scoped transaction: begun on construction, rolled back on drop unless
/// explicitly committed.
pub struct Transaction<'a> {
    store: &'a DataStore,
    done: bool,
}

impl<'a> Transaction<'a> {
    pub fn begin(store: &'a DataStore) -> Result<Self> {
        store.begin_transaction()?;
        Ok(Self { store, done: false })
    }

    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.store.commit_transaction()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.store.rollback_transaction() {
                tracing::error!(error = %e, "rollback on scope exit failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::Value;
    use crate::storage::entities::Resource;
    use crate::storage::schema::DbInitializer;

    fn store_with_bus() -> (DataStore, tokio::sync::mpsc::Receiver<Arc<Vec<crate::notification::Notification>>>) {
        let db = Database::open_in_memory().unwrap();
        DbInitializer::new(&db).run().unwrap();
        let bus = Arc::new(NotificationBus::new());
        let (_, receiver) = bus.subscribe(b"observer".to_vec(), Default::default());
        (DataStore::new(db, bus, b"test-session".to_vec()), receiver)
    }

    fn seed(store: &DataStore) -> Collection {
        let mut resource = Resource {
            name: "res".into(),
            ..Default::default()
        };
        resource.insert(store.db()).unwrap();
        let mut collection = Collection::new("inbox", resource.id);
        collection.insert(store.db()).unwrap();
        collection
    }

    #[test]
    fn nested_transactions_commit_only_at_outermost_level() {
        let (store, _rx) = store_with_bus();
        store.begin_transaction().unwrap();
        store.begin_transaction().unwrap();
        store
            .db()
            .execute("INSERT INTO ResourceTable (name) VALUES (?1)", &[Value::from("r")])
            .unwrap();
        store.commit_transaction().unwrap();
        assert!(store.in_transaction());
        store.commit_transaction().unwrap();
        assert!(!store.in_transaction());
        assert_eq!(
            store.db().query("SELECT id FROM ResourceTable", &[]).unwrap().len(),
            1
        );
    }

    #[test]
    fn rollback_at_inner_depth_aborts_the_whole_stack() {
        let (store, _rx) = store_with_bus();
        store.begin_transaction().unwrap();
        store.begin_transaction().unwrap();
        store
            .db()
            .execute("INSERT INTO ResourceTable (name) VALUES (?1)", &[Value::from("r")])
            .unwrap();
        store.rollback_transaction().unwrap();
        assert!(!store.in_transaction());
        assert!(store.db().query("SELECT id FROM ResourceTable", &[]).unwrap().is_empty());
        // commit after rollback is an error
        assert!(store.commit_transaction().is_err());
    }

    #[tokio::test]
    async fn notifications_publish_on_commit_and_vanish_on_rollback() {
        let (store, mut rx) = store_with_bus();
        let collection = seed(&store);

        store.begin_transaction().unwrap();
        let mut item = PimItem::default();
        store
            .append_pim_item(&mut item, "message/rfc822", &collection, &[b"\\SEEN".to_vec()], &[])
            .unwrap();
        store.commit_transaction().unwrap();
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);

        store.begin_transaction().unwrap();
        let mut item2 = PimItem::default();
        store
            .append_pim_item(&mut item2, "message/rfc822", &collection, &[], &[])
            .unwrap();
        store.rollback_transaction().unwrap();
        assert!(rx.try_recv().is_err());
        assert!(PimItem::retrieve_by_id(store.db(), item2.id).unwrap().is_none());
    }

    #[test]
    fn transaction_guard_rolls_back_on_drop() {
        let (store, _rx) = store_with_bus();
        {
            let _tx = Transaction::begin(&store).unwrap();
            store
                .db()
                .execute("INSERT INTO ResourceTable (name) VALUES (?1)", &[Value::from("r")])
                .unwrap();
        }
        assert!(store.db().query("SELECT id FROM ResourceTable", &[]).unwrap().is_empty());
    }

    #[test]
    fn cache_policy_inheritance_walks_the_parent_chain() {
        let (store, _rx) = store_with_bus();
        let mut parent = seed(&store);
        parent.cache_policy_inherit = false;
        parent.cache_policy_cache_timeout = 42;
        parent.update(store.db()).unwrap();

        let mut child = Collection::new("sub", parent.resource_id);
        child.parent_id = Some(parent.id);
        child.insert(store.db()).unwrap();

        let policy = store.active_cache_policy(&child).unwrap();
        assert_eq!(policy.cache_timeout, 42);

        // no explicit policy anywhere: the global default keeps everything
        let mut lone = Collection::new("lone", parent.resource_id);
        lone.insert(store.db()).unwrap();
        let policy = store.active_cache_policy(&lone).unwrap();
        assert_eq!(policy.cache_timeout, -1);
    }
}
