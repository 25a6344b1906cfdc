// Item command handlers: fetch, create, modify, delete, move, copy, link.

use anyhow::Result;
use chrono::Utc;

use super::{done, HandlerContext};
use crate::error::Error;
use crate::item_retriever::ItemRetriever;
use crate::protocol::{
    datastream::Timestamp, FetchedItem, PartData, Response, Scope, PAYLOAD_PART_PREFIX,
};
use crate::storage::datastore::Transaction;
use crate::storage::entities::{scope_to_query, Collection, Part, PimItem};
use crate::storage::query_builder::CompareOperator;

/// Part-set labels for non-payload changes in item-changed notifications.
const PART_REMOTE_ID: &str = "REMOTEID";
const PART_REMOTE_REVISION: &str = "REMOTEREVISION";
const PART_GID: &str = "GID";
const PART_FLAGS: &str = "FLAGS";
const PART_TAGS: &str = "TAGS";

fn items_in_scope(ctx: &HandlerContext<'_>, scope: &Scope) -> Result<Vec<PimItem>> {
    let mut qb = PimItem::select();
    scope_to_query(scope, ctx.resource_context_id(), &mut qb)?;
    Ok(qb
        .query(ctx.store.db())?
        .iter()
        .map(PimItem::from_row)
        .collect())
}

/// Streams every matched item, retrieving missing payload parts from the
/// owning resources first. Items whose parts could not be retrieved are
/// reported with their missing-part set; the terminal response fails only
/// when nothing could be served.
pub async fn fetch_items(
    ctx: &HandlerContext<'_>,
    scope: Scope,
    parts: Vec<String>,
    full_payload: bool,
    cache_only: bool,
) -> Result<Vec<Response>> {
    let failures = if cache_only {
        Default::default()
    } else {
        let mut retriever = ItemRetriever::new(
            ctx.store,
            ctx.resources,
            ctx.retrieval_timeout,
            scope.clone(),
        );
        retriever.set_retrieve_parts(parts.clone());
        retriever.set_retrieve_full_payload(full_payload);
        retriever.set_resource_context(ctx.resource_context_id());
        retriever.exec().await?
    };

    let items = items_in_scope(ctx, &scope)?;
    if items.is_empty() {
        return Err(Error::Argument("no items found in scope".into()).into());
    }

    let mut requested = parts;
    if full_payload && !requested.iter().any(|p| p == crate::item_retriever::FULL_PAYLOAD_PART) {
        requested.push(crate::item_retriever::FULL_PAYLOAD_PART.to_string());
    }

    let now = Utc::now();
    let mut responses = Vec::with_capacity(items.len() + 1);
    let mut served = 0usize;
    for item in items {
        let missing = failures.get(&item.id).cloned().unwrap_or_default();

        let mut fetched = FetchedItem {
            id: item.id,
            revision: item.rev,
            collection_id: item.collection_id,
            mime_type: item
                .mime_type(ctx.store.db())?
                .map(|m| m.name)
                .unwrap_or_default(),
            remote_id: item.remote_id.clone(),
            remote_revision: item.remote_revision.clone(),
            gid: item.gid.clone(),
            size: item.size,
            datetime: item.datetime.map(Timestamp::Utc),
            flags: item
                .flags(ctx.store.db())?
                .into_iter()
                .map(|f| f.name.into_bytes())
                .collect(),
            tags: item.tags(ctx.store.db())?.into_iter().map(|t| t.id).collect(),
            parts: Vec::new(),
            missing_parts: missing.clone(),
        };

        let mut payload_read = false;
        for part in item.parts(ctx.store.db())? {
            let wanted = requested.iter().any(|name| *name == part.name)
                || !part.name.starts_with(PAYLOAD_PART_PREFIX);
            if !wanted || missing.iter().any(|m| *m == part.name) {
                continue;
            }
            let data = ctx.part_helper.read(&part)?;
            if part.name.starts_with(PAYLOAD_PART_PREFIX) {
                payload_read = true;
            }
            fetched.parts.push(PartData {
                name: part.name,
                data,
            });
        }

        // payload access refreshes the item's access time
        if payload_read {
            let mut touched = item.clone();
            touched.atime = Some(now);
            touched.update(ctx.store.db())?;
        }

        if missing.is_empty() {
            served += 1;
        }
        responses.push(Response::Item(Box::new(fetched)));
    }

    if served == 0 && !failures.is_empty() {
        return Err(Error::Retrieval("no item could be retrieved".into()).into());
    }
    responses.extend(done("FETCH complete"));
    Ok(responses)
}

pub fn create_item(
    ctx: &HandlerContext<'_>,
    collection_id: i64,
    mime_type: String,
    remote_id: Option<String>,
    remote_revision: Option<String>,
    gid: Option<String>,
    flags: Vec<Vec<u8>>,
    tags: Vec<i64>,
    parts: Vec<PartData>,
) -> Result<Vec<Response>> {
    if mime_type.is_empty() {
        return Err(Error::Argument("item needs a mime type".into()).into());
    }
    let collection = Collection::retrieve_by_id(ctx.store.db(), collection_id)?
        .ok_or_else(|| Error::Argument(format!("unknown collection {collection_id}")))?;
    if collection.is_virtual {
        return Err(Error::Argument("cannot create items in virtual collections".into()).into());
    }

    let transaction = Transaction::begin(ctx.store)?;
    let now = Utc::now();
    let mut item = PimItem {
        remote_id,
        remote_revision,
        gid,
        datetime: Some(now),
        atime: Some(now),
        dirty: ctx.resource_context_id() != Some(collection.resource_id),
        ..Default::default()
    };
    ctx.store
        .append_pim_item(&mut item, &mime_type, &collection, &flags, &tags)?;

    let mut size = 0i64;
    for part_data in parts {
        let mut part = Part {
            pim_item_id: item.id,
            name: part_data.name,
            ..Default::default()
        };
        ctx.part_helper.insert(ctx.store.db(), &mut part, &part_data.data)?;
        if part.is_payload() {
            size += part.datasize;
        }
    }
    if size > 0 {
        item.size = size;
        item.update(ctx.store.db())?;
    }

    transaction.commit()?;
    Ok(vec![Response::Created { id: item.id }])
}

pub fn modify_item(
    ctx: &HandlerContext<'_>,
    item_id: i64,
    revision: i32,
    remote_id: Option<String>,
    remote_revision: Option<String>,
    gid: Option<String>,
    flags_set: Option<Vec<Vec<u8>>>,
    flags_add: Vec<Vec<u8>>,
    flags_remove: Vec<Vec<u8>>,
    tags_set: Option<Vec<i64>>,
    parts: Vec<PartData>,
    clear_dirty: bool,
) -> Result<Vec<Response>> {
    let transaction = Transaction::begin(ctx.store)?;

    let mut item = PimItem::retrieve_by_id(ctx.store.db(), item_id)?
        .ok_or_else(|| Error::Argument(format!("unknown item {item_id}")))?;
    // The client modifies the revision it last saw; anything else raced
    // with a concurrent writer and must not be applied.
    if item.rev != revision {
        return Err(Error::Conflict(format!(
            "item {item_id} was modified elsewhere (expected revision {revision}, have {})",
            item.rev
        ))
        .into());
    }
    let collection = item
        .collection(ctx.store.db())?
        .ok_or_else(|| Error::Argument("item without collection".into()))?;

    let mut changed_parts: Vec<String> = Vec::new();

    if let Some(remote_id) = remote_id {
        if item.remote_id.as_deref() != Some(remote_id.as_str()) {
            item.remote_id = Some(remote_id);
            changed_parts.push(PART_REMOTE_ID.to_string());
        }
    }
    if let Some(remote_revision) = remote_revision {
        if item.remote_revision.as_deref() != Some(remote_revision.as_str()) {
            item.remote_revision = Some(remote_revision);
            changed_parts.push(PART_REMOTE_REVISION.to_string());
        }
    }
    if let Some(gid) = gid {
        if item.gid.as_deref() != Some(gid.as_str()) {
            item.gid = Some(gid);
            changed_parts.push(PART_GID.to_string());
        }
    }

    if let Some(flags) = flags_set {
        if ctx.store.set_item_flags(&item, &flags)? {
            changed_parts.push(PART_FLAGS.to_string());
        }
    }
    if !flags_add.is_empty() && ctx.store.add_item_flags(&item, &flags_add)? {
        if !changed_parts.iter().any(|p| p == PART_FLAGS) {
            changed_parts.push(PART_FLAGS.to_string());
        }
    }
    if !flags_remove.is_empty() && ctx.store.remove_item_flags(&item, &flags_remove)? {
        if !changed_parts.iter().any(|p| p == PART_FLAGS) {
            changed_parts.push(PART_FLAGS.to_string());
        }
    }
    if let Some(tags) = tags_set {
        if ctx.store.set_item_tags(&item, &tags)? {
            changed_parts.push(PART_TAGS.to_string());
        }
    }

    for part_data in parts {
        match item.part(ctx.store.db(), &part_data.name)? {
            Some(mut part) => {
                ctx.part_helper.update(ctx.store.db(), &mut part, &part_data.data)?;
            }
            None => {
                let mut part = Part {
                    pim_item_id: item.id,
                    name: part_data.name.clone(),
                    ..Default::default()
                };
                ctx.part_helper.insert(ctx.store.db(), &mut part, &part_data.data)?;
            }
        }
        changed_parts.push(part_data.name);
    }

    if changed_parts.is_empty() && !clear_dirty {
        // nothing to do; not an error
        drop(transaction);
        return Ok(done("STORE complete"));
    }

    // recompute the payload size from the part rows
    let mut size = 0i64;
    for part in item.parts(ctx.store.db())? {
        if part.is_payload() {
            size += part.datasize;
        }
    }
    item.size = size;

    let from_owning_resource = ctx.resource_context_id() == Some(collection.resource_id);
    if clear_dirty && from_owning_resource {
        item.dirty = false;
    } else if !changed_parts.is_empty() && !from_owning_resource {
        item.dirty = true;
    }

    item.rev += 1;
    item.atime = Some(Utc::now());
    item.update(ctx.store.db())?;

    if !changed_parts.is_empty() {
        ctx.store
            .notifier(|collector| collector.item_changed(&item, &collection, changed_parts));
    }
    transaction.commit()?;
    Ok(done("STORE complete"))
}

pub fn delete_items(ctx: &HandlerContext<'_>, scope: Scope) -> Result<Vec<Response>> {
    let transaction = Transaction::begin(ctx.store)?;
    let items = items_in_scope(ctx, &scope)?;
    if items.is_empty() {
        return Err(Error::Argument("no items found in scope".into()).into());
    }
    for item in items {
        let collection = item
            .collection(ctx.store.db())?
            .ok_or_else(|| Error::Argument("item without collection".into()))?;
        ctx.part_helper.remove_by_item(ctx.store.db(), item.id)?;
        item.clear_flags(ctx.store.db())?;
        item.clear_tags(ctx.store.db())?;
        ctx.store
            .notifier(|collector| collector.item_removed(&item, &collection));
        item.remove(ctx.store.db())?;
    }
    transaction.commit()?;
    Ok(done("REMOVE complete"))
}

/// Moves the matched items into `destination`. Payloads are pre-fetched so
/// a cross-resource move does not lose content the destination resource
/// cannot retrieve anymore.
pub async fn move_items(
    ctx: &HandlerContext<'_>,
    scope: Scope,
    destination: i64,
) -> Result<Vec<Response>> {
    let destination = Collection::retrieve_by_id(ctx.store.db(), destination)?
        .ok_or_else(|| Error::Argument(format!("unknown collection {destination}")))?;
    let dest_resource_id = destination.resource_id;

    // make sure all the items we want to move are in the cache
    let mut retriever = ItemRetriever::new(
        ctx.store,
        ctx.resources,
        ctx.retrieval_timeout,
        scope.clone(),
    );
    retriever.set_retrieve_full_payload(true);
    retriever.set_resource_context(ctx.resource_context_id());
    retriever.exec_strict().await?;

    let transaction = Transaction::begin(ctx.store)?;

    let mut qb = PimItem::select();
    scope_to_query(&scope, ctx.resource_context_id(), &mut qb)?;
    qb.add_value_condition(
        PimItem::full("collectionId"),
        CompareOperator::NotEquals,
        destination.id,
    );
    let items: Vec<PimItem> = qb
        .query(ctx.store.db())?
        .iter()
        .map(PimItem::from_row)
        .collect();
    if items.is_empty() {
        return Err(Error::Argument("no items found".into()).into());
    }

    let mtime = Utc::now();
    for mut item in items {
        debug_assert_ne!(item.collection_id, destination.id);
        let source = item
            .collection(ctx.store.db())?
            .ok_or_else(|| Error::Argument("item without collection".into()))?;

        let is_inter_resource_move = source.resource_id != dest_resource_id;

        item.collection_id = destination.id;
        item.atime = Some(mtime);
        item.datetime = Some(mtime);
        item.rev += 1;
        // if the resource moved the item itself the change happened in the
        // backend already and must not be pushed back
        if ctx.resource_context_id() != Some(dest_resource_id) {
            item.dirty = true;
        }

        ctx.store
            .notifier(|collector| collector.item_moved(&item, &source, &destination));
        // reset the remote id on inter-resource moves, but only after
        // generating the change notification so it still carries the old
        // remote id for the source resource
        if is_inter_resource_move {
            item.remote_id = None;
        }

        item.update(ctx.store.db())?;
    }

    transaction.commit()?;
    Ok(done("MOVE complete"))
}

/// Copies the matched items into `destination`. The copies get a fresh id
/// and an empty remote id and may live in a different resource; payloads
/// are duplicated through the payload store.
pub async fn copy_items(
    ctx: &HandlerContext<'_>,
    scope: Scope,
    destination: i64,
) -> Result<Vec<Response>> {
    let destination = Collection::retrieve_by_id(ctx.store.db(), destination)?
        .ok_or_else(|| Error::Argument(format!("unknown collection {destination}")))?;

    let mut retriever = ItemRetriever::new(
        ctx.store,
        ctx.resources,
        ctx.retrieval_timeout,
        scope.clone(),
    );
    retriever.set_retrieve_full_payload(true);
    retriever.set_resource_context(ctx.resource_context_id());
    retriever.exec_strict().await?;

    let transaction = Transaction::begin(ctx.store)?;
    let items = items_in_scope(ctx, &scope)?;
    if items.is_empty() {
        return Err(Error::Argument("no items found".into()).into());
    }
    for item in items {
        copy_item(ctx, &item, &destination)?;
    }
    transaction.commit()?;
    Ok(done("COPY complete"))
}

/// Copies one item and all its parts into `target`.
pub(crate) fn copy_item(
    ctx: &HandlerContext<'_>,
    item: &PimItem,
    target: &Collection,
) -> Result<i64> {
    let now = Utc::now();
    let mut copy = PimItem {
        gid: item.gid.clone(),
        collection_id: target.id,
        mime_type_id: item.mime_type_id,
        datetime: Some(now),
        atime: Some(now),
        size: item.size,
        dirty: true,
        ..Default::default()
    };
    copy.insert(ctx.store.db())?;

    for flag in item.flags(ctx.store.db())? {
        copy.add_flag(ctx.store.db(), flag.id)?;
    }
    for tag in item.tags(ctx.store.db())? {
        copy.add_tag(ctx.store.db(), tag.id)?;
    }
    for part in item.parts(ctx.store.db())? {
        let data = ctx.part_helper.read(&part)?;
        let mut part_copy = Part {
            pim_item_id: copy.id,
            name: part.name.clone(),
            ..Default::default()
        };
        ctx.part_helper.insert(ctx.store.db(), &mut part_copy, &data)?;
    }

    ctx.store
        .notifier(|collector| collector.item_added(&copy, target));
    Ok(copy.id)
}

pub fn link_items(
    ctx: &HandlerContext<'_>,
    scope: Scope,
    collection_id: i64,
    link: bool,
) -> Result<Vec<Response>> {
    let collection = Collection::retrieve_by_id(ctx.store.db(), collection_id)?
        .ok_or_else(|| Error::Argument(format!("unknown collection {collection_id}")))?;
    if !collection.is_virtual {
        return Err(Error::Argument("can only link items into virtual collections".into()).into());
    }

    let transaction = Transaction::begin(ctx.store)?;
    let items = items_in_scope(ctx, &scope)?;
    if items.is_empty() {
        return Err(Error::Argument("no items found in scope".into()).into());
    }
    let mut changed = Vec::new();
    for item in &items {
        let did = if link {
            collection.link_item(ctx.store.db(), item.id)?
        } else {
            collection.unlink_item(ctx.store.db(), item.id)?
        };
        if did {
            changed.push(item.id);
        }
    }
    ctx.store.notifier(|collector| {
        if link {
            collector.items_linked(changed, &collection);
        } else {
            collector.items_unlinked(changed, &collection);
        }
    });
    transaction.commit()?;
    Ok(done(if link { "LINK complete" } else { "UNLINK complete" }))
}
