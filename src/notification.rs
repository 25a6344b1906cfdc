// Change notifications: collection during a transaction, atomic publication
// on commit, filtered delivery to subscribers and durable spooling for
// offline agents.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::datastream as ds;
use crate::protocol::SubscriptionFilter;
use crate::storage::entities::{Collection, PimItem, Tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NotificationKind {
    ItemAdded = 1,
    ItemChanged = 2,
    ItemMoved = 3,
    ItemRemoved = 4,
    ItemLinked = 5,
    ItemUnlinked = 6,
    CollectionAdded = 7,
    CollectionChanged = 8,
    CollectionRemoved = 9,
    CollectionSubscribed = 10,
    CollectionUnsubscribed = 11,
    TagAdded = 12,
    TagChanged = 13,
    TagRemoved = 14,
}

impl NotificationKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        use NotificationKind::*;
        Some(match raw {
            1 => ItemAdded,
            2 => ItemChanged,
            3 => ItemMoved,
            4 => ItemRemoved,
            5 => ItemLinked,
            6 => ItemUnlinked,
            7 => CollectionAdded,
            8 => CollectionChanged,
            9 => CollectionRemoved,
            10 => CollectionSubscribed,
            11 => CollectionUnsubscribed,
            12 => TagAdded,
            13 => TagChanged,
            14 => TagRemoved,
            _ => return None,
        })
    }
}

/// One change event. Entity ids are carried directly; for item moves the
/// notification still holds the remote id the item had in its source
/// resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    /// Session that caused the change.
    pub session_id: Vec<u8>,
    /// Affected entity ids: item ids, or the collection/tag id itself.
    pub ids: Vec<i64>,
    /// Source (or only) collection.
    pub collection: i64,
    /// Destination collection for moves and links.
    pub destination: i64,
    /// Owning resource of the source collection.
    pub resource: i64,
    /// Owning resource of the destination collection.
    pub destination_resource: i64,
    /// Changed part names for item-changed notifications.
    pub parts: BTreeSet<String>,
    pub remote_id: Option<String>,
}

impl Notification {
    fn new(kind: NotificationKind, session_id: Vec<u8>) -> Self {
        Self {
            kind,
            session_id,
            ids: Vec::new(),
            collection: 0,
            destination: 0,
            resource: 0,
            destination_resource: 0,
            parts: BTreeSet::new(),
            remote_id: None,
        }
    }

    /// True when two notifications describe the same event and may be
    /// merged by unioning their changed-part sets.
    fn coalesces_with(&self, other: &Notification) -> bool {
        self.kind == other.kind
            && self.session_id == other.session_id
            && self.ids == other.ids
            && self.collection == other.collection
            && self.destination == other.destination
            && self.resource == other.resource
            && self.destination_resource == other.destination_resource
            && self.remote_id == other.remote_id
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        ds::put_u8(buf, self.kind as u8);
        ds::put_bytes(buf, &self.session_id);
        ds::put_i64_list(buf, &self.ids);
        ds::put_i64(buf, self.collection);
        ds::put_i64(buf, self.destination);
        ds::put_i64(buf, self.resource);
        ds::put_i64(buf, self.destination_resource);
        let parts: Vec<String> = self.parts.iter().cloned().collect();
        ds::put_string_list(buf, &parts);
        ds::put_opt_string(buf, self.remote_id.as_deref());
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let raw_kind = ds::get_u8(buf)?;
        let kind = NotificationKind::from_u8(raw_kind).ok_or_else(|| {
            crate::error::Error::Protocol(format!("unknown notification kind {raw_kind}"))
        })?;
        Ok(Self {
            kind,
            session_id: ds::get_bytes(buf)?,
            ids: ds::get_i64_list(buf)?,
            collection: ds::get_i64(buf)?,
            destination: ds::get_i64(buf)?,
            resource: ds::get_i64(buf)?,
            destination_resource: ds::get_i64(buf)?,
            parts: ds::get_string_list(buf)?.into_iter().collect(),
            remote_id: ds::get_opt_string(buf)?,
        })
    }
}

pub fn encode_batch(batch: &[Notification]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    ds::put_u32(&mut buf, batch.len() as u32);
    for notification in batch {
        notification.encode(&mut buf);
    }
    buf.to_vec()
}

pub fn decode_batch(payload: &[u8]) -> Result<Vec<Notification>> {
    let mut buf = Bytes::copy_from_slice(payload);
    let count = ds::get_u32(&mut buf)? as usize;
    let mut batch = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        batch.push(Notification::decode(&mut buf)?);
    }
    Ok(batch)
}

/// Buffers notifications while a transaction is open. The data store owns
/// one per connection and publishes or discards the buffer when the
/// outermost transaction ends.
#[derive(Debug, Default)]
pub struct NotificationCollector {
    session_id: Vec<u8>,
    buffer: Vec<Notification>,
}

impl NotificationCollector {
    pub fn new(session_id: Vec<u8>) -> Self {
        Self {
            session_id,
            buffer: Vec::new(),
        }
    }

    pub fn set_session_id(&mut self, session_id: Vec<u8>) {
        self.session_id = session_id;
    }

    fn add(&mut self, notification: Notification) {
        for existing in &mut self.buffer {
            if existing.coalesces_with(&notification) {
                existing.parts.extend(notification.parts);
                return;
            }
        }
        self.buffer.push(notification);
    }

    pub fn item_added(&mut self, item: &PimItem, collection: &Collection) {
        let mut n = Notification::new(NotificationKind::ItemAdded, self.session_id.clone());
        n.ids = vec![item.id];
        n.collection = collection.id;
        n.resource = collection.resource_id;
        n.remote_id = item.remote_id.clone();
        self.add(n);
    }

    pub fn item_changed(
        &mut self,
        item: &PimItem,
        collection: &Collection,
        parts: impl IntoIterator<Item = String>,
    ) {
        let mut n = Notification::new(NotificationKind::ItemChanged, self.session_id.clone());
        n.ids = vec![item.id];
        n.collection = collection.id;
        n.resource = collection.resource_id;
        n.remote_id = item.remote_id.clone();
        n.parts = parts.into_iter().collect();
        self.add(n);
    }

    /// Emitted before the remote id is cleared on cross-resource moves so
    /// the source resource still sees it.
    pub fn item_moved(&mut self, item: &PimItem, source: &Collection, destination: &Collection) {
        let mut n = Notification::new(NotificationKind::ItemMoved, self.session_id.clone());
        n.ids = vec![item.id];
        n.collection = source.id;
        n.destination = destination.id;
        n.resource = source.resource_id;
        n.destination_resource = destination.resource_id;
        n.remote_id = item.remote_id.clone();
        self.add(n);
    }

    pub fn item_removed(&mut self, item: &PimItem, collection: &Collection) {
        let mut n = Notification::new(NotificationKind::ItemRemoved, self.session_id.clone());
        n.ids = vec![item.id];
        n.collection = collection.id;
        n.resource = collection.resource_id;
        n.remote_id = item.remote_id.clone();
        self.add(n);
    }

    pub fn items_linked(&mut self, item_ids: Vec<i64>, collection: &Collection) {
        if item_ids.is_empty() {
            return;
        }
        let mut n = Notification::new(NotificationKind::ItemLinked, self.session_id.clone());
        n.ids = item_ids;
        n.collection = collection.id;
        n.resource = collection.resource_id;
        self.add(n);
    }

    pub fn items_unlinked(&mut self, item_ids: Vec<i64>, collection: &Collection) {
        if item_ids.is_empty() {
            return;
        }
        let mut n = Notification::new(NotificationKind::ItemUnlinked, self.session_id.clone());
        n.ids = item_ids;
        n.collection = collection.id;
        n.resource = collection.resource_id;
        self.add(n);
    }

    pub fn collection_added(&mut self, collection: &Collection) {
        let mut n = Notification::new(NotificationKind::CollectionAdded, self.session_id.clone());
        n.ids = vec![collection.id];
        n.collection = collection.id;
        n.resource = collection.resource_id;
        n.remote_id = collection.remote_id.clone();
        self.add(n);
    }

    pub fn collection_changed(&mut self, collection: &Collection) {
        let mut n = Notification::new(NotificationKind::CollectionChanged, self.session_id.clone());
        n.ids = vec![collection.id];
        n.collection = collection.id;
        n.resource = collection.resource_id;
        n.remote_id = collection.remote_id.clone();
        self.add(n);
    }

    pub fn collection_removed(&mut self, collection: &Collection) {
        let mut n = Notification::new(NotificationKind::CollectionRemoved, self.session_id.clone());
        n.ids = vec![collection.id];
        n.collection = collection.id;
        n.resource = collection.resource_id;
        n.remote_id = collection.remote_id.clone();
        self.add(n);
    }

    pub fn collection_subscription(&mut self, collection: &Collection, subscribed: bool) {
        let kind = if subscribed {
            NotificationKind::CollectionSubscribed
        } else {
            NotificationKind::CollectionUnsubscribed
        };
        let mut n = Notification::new(kind, self.session_id.clone());
        n.ids = vec![collection.id];
        n.collection = collection.id;
        n.resource = collection.resource_id;
        self.add(n);
    }

    pub fn tag_added(&mut self, tag: &Tag) {
        let mut n = Notification::new(NotificationKind::TagAdded, self.session_id.clone());
        n.ids = vec![tag.id];
        self.add(n);
    }

    pub fn tag_changed(&mut self, tag: &Tag) {
        let mut n = Notification::new(NotificationKind::TagChanged, self.session_id.clone());
        n.ids = vec![tag.id];
        self.add(n);
    }

    pub fn tag_removed(&mut self, tag: &Tag) {
        let mut n = Notification::new(NotificationKind::TagRemoved, self.session_id.clone());
        n.ids = vec![tag.id];
        self.add(n);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn take(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.buffer)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

fn matches_filter(filter: &SubscriptionFilter, notification: &Notification) -> bool {
    if !filter.kinds.is_empty() && !filter.kinds.contains(&(notification.kind as u8)) {
        return false;
    }
    if !filter.collections.is_empty()
        && !filter.collections.contains(&notification.collection)
        && !filter.collections.contains(&notification.destination)
    {
        return false;
    }
    if !filter.items.is_empty() && !notification.ids.iter().any(|id| filter.items.contains(id)) {
        return false;
    }
    if !filter.resources.is_empty()
        && !filter.resources.contains(&notification.resource)
        && !filter.resources.contains(&notification.destination_resource)
    {
        return false;
    }
    true
}

struct Subscriber {
    session_id: Vec<u8>,
    filter: SubscriptionFilter,
    sender: mpsc::Sender<Arc<Vec<Notification>>>,
}

/// Fan-out point for committed notification batches. Batches are delivered
/// atomically and in commit order; a subscriber that cannot keep up is
/// dropped rather than reordering or blocking everyone else.
pub struct NotificationBus {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    publish_lock: Mutex<()>,
}

/// Queue depth per subscriber before it is considered stuck.
const SUBSCRIBER_QUEUE_DEPTH: usize = 128;

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            publish_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(
        &self,
        session_id: Vec<u8>,
        filter: SubscriptionFilter,
    ) -> (u64, mpsc::Receiver<Arc<Vec<Notification>>>) {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(
            id,
            Subscriber {
                session_id,
                filter,
                sender,
            },
        );
        (id, receiver)
    }

    pub fn update_filter(&self, id: u64, filter: SubscriptionFilter) {
        if let Some(mut subscriber) = self.subscribers.get_mut(&id) {
            subscriber.filter = filter;
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// Delivers one committed batch to every matching subscriber.
    pub fn publish(&self, batch: Vec<Notification>) {
        if batch.is_empty() {
            return;
        }
        let _guard = self.publish_lock.lock();
        debug!(count = batch.len(), "publishing notification batch");
        let mut stuck = Vec::new();
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            let selected: Vec<Notification> = batch
                .iter()
                .filter(|n| {
                    if subscriber.filter.ignore_own && n.session_id == subscriber.session_id {
                        return false;
                    }
                    matches_filter(&subscriber.filter, n)
                })
                .cloned()
                .collect();
            if selected.is_empty() {
                continue;
            }
            if subscriber.sender.try_send(Arc::new(selected)).is_err() {
                warn!(subscriber = *entry.key(), "dropping stuck notification subscriber");
                stuck.push(*entry.key());
            }
        }
        for id in stuck {
            self.subscribers.remove(&id);
        }
    }
}

/// Durable queue of notifications for agents that were offline when a
/// change was committed. One JSON-lines file per agent, drained in order on
/// reconnect.
pub struct ChangeReplaySpool {
    dir: PathBuf,
}

impl ChangeReplaySpool {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn spool_file(&self, agent_id: i64) -> PathBuf {
        self.dir.join(format!("agent_{agent_id}.spool"))
    }

    pub fn enqueue(&self, agent_id: i64, batch: &[Notification]) -> AnyResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create spool directory {}", self.dir.display()))?;
        let path = self.spool_file(agent_id);
        let mut lines = String::new();
        for notification in batch {
            lines.push_str(&serde_json::to_string(notification)?);
            lines.push('\n');
        }
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open spool file {}", path.display()))?;
        file.write_all(lines.as_bytes())
            .with_context(|| format!("Failed to append to spool file {}", path.display()))?;
        Ok(())
    }

    /// All pending entries for the agent, oldest first.
    pub fn pending(&self, agent_id: i64) -> AnyResult<Vec<Notification>> {
        let path = self.spool_file(agent_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read spool file {}", path.display()))?;
        let mut entries = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(notification) => entries.push(notification),
                Err(e) => warn!(agent_id, error = %e, "skipping corrupt spool entry"),
            }
        }
        Ok(entries)
    }

    /// Removes the first `count` entries after the agent acknowledged them.
    pub fn acknowledge(&self, agent_id: i64, count: usize) -> AnyResult<()> {
        let pending = self.pending(agent_id)?;
        let path = self.spool_file(agent_id);
        if count >= pending.len() {
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove spool file {}", path.display()))?;
            }
            return Ok(());
        }
        let mut lines = String::new();
        for notification in &pending[count..] {
            lines.push_str(&serde_json::to_string(notification)?);
            lines.push('\n');
        }
        std::fs::write(&path, lines)
            .with_context(|| format!("Failed to rewrite spool file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64) -> PimItem {
        PimItem {
            id,
            ..Default::default()
        }
    }

    fn collection(id: i64, resource_id: i64) -> Collection {
        let mut c = Collection::new("c", resource_id);
        c.id = id;
        c
    }

    #[test]
    fn identical_change_notifications_coalesce_and_merge_parts() {
        let mut collector = NotificationCollector::new(b"s1".to_vec());
        let i = item(1);
        let c = collection(2, 3);
        collector.item_changed(&i, &c, ["PLD:RFC822".to_string()]);
        collector.item_changed(&i, &c, ["PLD:HEAD".to_string()]);
        let batch = collector.take();
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch[0].parts,
            ["PLD:HEAD".to_string(), "PLD:RFC822".to_string()]
                .into_iter()
                .collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn different_items_do_not_coalesce() {
        let mut collector = NotificationCollector::new(b"s1".to_vec());
        let c = collection(2, 3);
        collector.item_added(&item(1), &c);
        collector.item_added(&item(2), &c);
        assert_eq!(collector.take().len(), 2);
    }

    #[test]
    fn move_notification_carries_source_remote_id() {
        let mut collector = NotificationCollector::new(b"s1".to_vec());
        let mut i = item(1);
        i.remote_id = Some("RID-original".into());
        let src = collection(2, 3);
        let dst = collection(4, 5);
        collector.item_moved(&i, &src, &dst);
        let batch = collector.take();
        assert_eq!(batch[0].remote_id.as_deref(), Some("RID-original"));
        assert_eq!(batch[0].collection, 2);
        assert_eq!(batch[0].destination, 4);
        assert_eq!(batch[0].resource, 3);
        assert_eq!(batch[0].destination_resource, 5);
    }

    #[test]
    fn notification_wire_roundtrip() {
        let mut collector = NotificationCollector::new(b"s1".to_vec());
        let mut i = item(9);
        i.remote_id = Some("r9".into());
        let c = collection(1, 2);
        collector.item_changed(&i, &c, ["PLD:RFC822".to_string()]);
        collector.collection_added(&c);
        let batch = collector.take();
        let decoded = decode_batch(&encode_batch(&batch)).unwrap();
        assert_eq!(decoded, batch);
    }

    #[tokio::test]
    async fn bus_filters_and_delivers_batches() {
        let bus = NotificationBus::new();
        let (_, mut all) = bus.subscribe(b"listener".to_vec(), SubscriptionFilter::default());
        let (_, mut only_c5) = bus.subscribe(
            b"listener".to_vec(),
            SubscriptionFilter {
                collections: vec![5],
                ..Default::default()
            },
        );
        let (_, mut not_own) = bus.subscribe(
            b"origin".to_vec(),
            SubscriptionFilter {
                ignore_own: true,
                ..Default::default()
            },
        );

        let mut collector = NotificationCollector::new(b"origin".to_vec());
        collector.item_added(&item(1), &collection(5, 1));
        collector.item_added(&item(2), &collection(6, 1));
        bus.publish(collector.take());

        let batch = all.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        let batch = only_c5.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].collection, 5);
        assert!(not_own.try_recv().is_err());
    }

    #[test]
    fn spool_enqueues_drains_and_acknowledges_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let spool = ChangeReplaySpool::new(dir.path().join("spool"));
        let mut collector = NotificationCollector::new(b"s".to_vec());
        collector.item_added(&item(1), &collection(1, 7));
        collector.item_added(&item(2), &collection(1, 7));
        collector.item_added(&item(3), &collection(1, 7));
        let batch = collector.take();
        spool.enqueue(7, &batch).unwrap();

        let pending = spool.pending(7).unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].ids, vec![1]);

        spool.acknowledge(7, 2).unwrap();
        let pending = spool.pending(7).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ids, vec![3]);

        spool.acknowledge(7, 1).unwrap();
        assert!(spool.pending(7).unwrap().is_empty());
    }
}
