// Collection command handlers.

use anyhow::Result;

use super::{done, HandlerContext};
use crate::error::Error;
use crate::protocol::{
    CachePolicy, CollectionSelector, FetchedCollection, Response, Tristate,
};
use crate::storage::datastore::Transaction;
use crate::storage::entities::{Collection, CollectionAttribute, MimeType, PimItem, Resource};
use crate::storage::query_builder::{CompareOperator, QueryBuilder};

fn to_fetched(ctx: &HandlerContext<'_>, collection: &Collection) -> Result<FetchedCollection> {
    let resource = collection
        .resource(ctx.store.db())?
        .map(|r| r.name)
        .unwrap_or_default();
    Ok(FetchedCollection {
        id: collection.id,
        parent_id: collection.parent_id.unwrap_or(0),
        name: collection.name.clone(),
        remote_id: collection.remote_id.clone(),
        remote_revision: collection.remote_revision.clone(),
        resource,
        mime_types: collection
            .mime_types(ctx.store.db())?
            .into_iter()
            .map(|m| m.name)
            .collect(),
        is_virtual: collection.is_virtual,
        enabled: collection.enabled,
        referenced: collection.referenced,
        display_pref: collection.display_pref,
        sync_pref: collection.sync_pref,
        index_pref: collection.index_pref,
        cache_policy: ctx.store.active_cache_policy(collection)?,
        attributes: collection
            .attributes(ctx.store.db())?
            .iter()
            .map(|a| {
                (
                    String::from_utf8_lossy(&a.attribute_type).into_owned(),
                    a.value.clone(),
                )
            })
            .collect(),
    })
}

pub fn fetch_collections(
    ctx: &HandlerContext<'_>,
    selector: CollectionSelector,
) -> Result<Vec<Response>> {
    let collections = match selector {
        CollectionSelector::Ids(ids) => {
            let mut result = Vec::with_capacity(ids.len());
            for id in ids {
                let collection = Collection::retrieve_by_id(ctx.store.db(), id)?
                    .ok_or_else(|| Error::Argument(format!("unknown collection {id}")))?;
                result.push(collection);
            }
            result
        }
        CollectionSelector::Children(0) => Collection::retrieve_children(ctx.store.db(), None)?,
        CollectionSelector::Children(parent) => {
            Collection::retrieve_children(ctx.store.db(), Some(parent))?
        }
        CollectionSelector::Resource(name) => {
            let resource = Resource::retrieve_by_name(ctx.store.db(), &name)?
                .ok_or_else(|| Error::Argument(format!("unknown resource {name}")))?;
            Collection::retrieve_by_resource(ctx.store.db(), resource.id)?
        }
    };

    let mut responses = Vec::with_capacity(collections.len() + 1);
    for collection in &collections {
        responses.push(Response::Collection(Box::new(to_fetched(ctx, collection)?)));
    }
    responses.extend(done("LIST complete"));
    Ok(responses)
}

#[allow(clippy::too_many_arguments)]
pub fn create_collection(
    ctx: &HandlerContext<'_>,
    parent_id: i64,
    name: String,
    remote_id: Option<String>,
    mime_types: Vec<String>,
    is_virtual: bool,
    attributes: Vec<(String, Vec<u8>)>,
    cache_policy: Option<CachePolicy>,
) -> Result<Vec<Response>> {
    if name.is_empty() {
        return Err(Error::Argument("collection needs a name".into()).into());
    }

    let transaction = Transaction::begin(ctx.store)?;

    let (parent, resource_id) = if parent_id > 0 {
        let parent = Collection::retrieve_by_id(ctx.store.db(), parent_id)?
            .ok_or_else(|| Error::Argument(format!("unknown parent collection {parent_id}")))?;
        let resource_id = parent.resource_id;
        (Some(parent), resource_id)
    } else {
        // top-level collections hang off the session's resource context
        let resource = ctx
            .resource_context
            .ok_or_else(|| Error::Argument("top-level collections need a resource context".into()))?;
        (None, resource.id)
    };

    // parent and child share the resource, virtual collections excepted
    if let Some(parent) = &parent {
        if !is_virtual && parent.resource_id != resource_id {
            return Err(Error::Argument("collection would cross resources".into()).into());
        }
    }

    let mut collection = Collection::new(name, resource_id);
    collection.parent_id = parent.as_ref().map(|p| p.id);
    collection.remote_id = remote_id;
    collection.is_virtual = is_virtual;
    if let Some(policy) = &cache_policy {
        collection.set_cache_policy(policy);
    }
    collection.insert(ctx.store.db())?;

    for mime_type in &mime_types {
        let mime = MimeType::retrieve_or_insert(ctx.store.db(), mime_type)?;
        collection.add_mime_type(ctx.store.db(), mime.id)?;
    }
    for (attribute_type, value) in &attributes {
        CollectionAttribute::store(
            ctx.store.db(),
            collection.id,
            attribute_type.as_bytes(),
            value,
        )?;
    }

    ctx.store
        .notifier(|collector| collector.collection_added(&collection));
    transaction.commit()?;
    Ok(vec![Response::Created { id: collection.id }])
}

/// True when `candidate` is `collection` itself or one of its descendants.
fn is_in_subtree(ctx: &HandlerContext<'_>, collection_id: i64, candidate: i64) -> Result<bool> {
    if collection_id == candidate {
        return Ok(true);
    }
    let mut current = Collection::retrieve_by_id(ctx.store.db(), candidate)?;
    while let Some(collection) = current {
        match collection.parent_id {
            Some(parent) if parent == collection_id => return Ok(true),
            Some(parent) => current = Collection::retrieve_by_id(ctx.store.db(), parent)?,
            None => break,
        }
    }
    Ok(false)
}

#[allow(clippy::too_many_arguments)]
pub fn modify_collection(
    ctx: &HandlerContext<'_>,
    collection_id: i64,
    name: Option<String>,
    remote_id: Option<String>,
    remote_revision: Option<String>,
    parent_id: Option<i64>,
    mime_types: Option<Vec<String>>,
    attributes_set: Vec<(String, Vec<u8>)>,
    attributes_remove: Vec<String>,
    cache_policy: Option<CachePolicy>,
    enabled: Option<bool>,
    referenced: Option<bool>,
    display_pref: Option<Tristate>,
    sync_pref: Option<Tristate>,
    index_pref: Option<Tristate>,
) -> Result<Vec<Response>> {
    let transaction = Transaction::begin(ctx.store)?;
    let mut collection = Collection::retrieve_by_id(ctx.store.db(), collection_id)?
        .ok_or_else(|| Error::Argument(format!("unknown collection {collection_id}")))?;

    if let Some(new_parent) = parent_id {
        reparent(ctx, &mut collection, new_parent)?;
    }
    if let Some(name) = name {
        if name.is_empty() {
            return Err(Error::Argument("collection needs a name".into()).into());
        }
        collection.name = name;
    }
    if let Some(remote_id) = remote_id {
        collection.remote_id = Some(remote_id);
    }
    if let Some(remote_revision) = remote_revision {
        collection.remote_revision = Some(remote_revision);
    }
    if let Some(policy) = &cache_policy {
        collection.set_cache_policy(policy);
    }
    if let Some(display_pref) = display_pref {
        collection.display_pref = display_pref;
    }
    if let Some(sync_pref) = sync_pref {
        collection.sync_pref = sync_pref;
    }
    if let Some(index_pref) = index_pref {
        collection.index_pref = index_pref;
    }
    if let Some(referenced) = referenced {
        collection.referenced = referenced;
    }

    let subscription_changed = match enabled {
        Some(enabled) if enabled != collection.enabled => {
            collection.enabled = enabled;
            true
        }
        _ => false,
    };

    if let Some(mime_types) = mime_types {
        collection.clear_mime_types(ctx.store.db())?;
        for mime_type in &mime_types {
            let mime = MimeType::retrieve_or_insert(ctx.store.db(), mime_type)?;
            collection.add_mime_type(ctx.store.db(), mime.id)?;
        }
    }
    for (attribute_type, value) in &attributes_set {
        CollectionAttribute::store(
            ctx.store.db(),
            collection.id,
            attribute_type.as_bytes(),
            value,
        )?;
    }
    for attribute_type in &attributes_remove {
        CollectionAttribute::remove_entry(ctx.store.db(), collection.id, attribute_type.as_bytes())?;
    }

    collection.update(ctx.store.db())?;

    ctx.store.notifier(|collector| {
        if subscription_changed {
            collector.collection_subscription(&collection, collection.enabled);
        }
        collector.collection_changed(&collection);
    });
    transaction.commit()?;
    Ok(done("MODIFY complete"))
}

fn reparent(
    ctx: &HandlerContext<'_>,
    collection: &mut Collection,
    new_parent: i64,
) -> Result<()> {
    if new_parent == collection.parent_id.unwrap_or(0) {
        return Ok(());
    }
    if new_parent == 0 {
        collection.parent_id = None;
        return Ok(());
    }
    let parent = Collection::retrieve_by_id(ctx.store.db(), new_parent)?
        .ok_or_else(|| Error::Argument(format!("unknown collection {new_parent}")))?;
    // cycles are forbidden
    if is_in_subtree(ctx, collection.id, parent.id)? {
        return Err(Error::Argument("cannot move a collection into its own subtree".into()).into());
    }
    if !collection.is_virtual && parent.resource_id != collection.resource_id {
        return Err(Error::Argument("collection would cross resources".into()).into());
    }
    collection.parent_id = Some(parent.id);
    Ok(())
}

pub fn move_collection(
    ctx: &HandlerContext<'_>,
    collection_id: i64,
    destination: i64,
) -> Result<Vec<Response>> {
    let transaction = Transaction::begin(ctx.store)?;
    let mut collection = Collection::retrieve_by_id(ctx.store.db(), collection_id)?
        .ok_or_else(|| Error::Argument(format!("unknown collection {collection_id}")))?;
    reparent(ctx, &mut collection, destination)?;
    collection.update(ctx.store.db())?;
    ctx.store
        .notifier(|collector| collector.collection_changed(&collection));
    transaction.commit()?;
    Ok(done("COLMOVE complete"))
}

/// Deletes the whole subtree depth-first: items with their parts and
/// payload files go before each collection row.
pub async fn delete_collection(
    ctx: &HandlerContext<'_>,
    collection_id: i64,
) -> Result<Vec<Response>> {
    let collection = Collection::retrieve_by_id(ctx.store.db(), collection_id)?
        .ok_or_else(|| Error::Argument(format!("unknown collection {collection_id}")))?;
    // persistent searches unregister from the engines first
    if collection.is_virtual && collection.query_string.is_some() {
        ctx.search.remove_search(collection.id).await?;
    }
    let transaction = Transaction::begin(ctx.store)?;
    delete_recursively(ctx, &collection)?;
    transaction.commit()?;
    Ok(done("DELETE complete"))
}

fn delete_recursively(ctx: &HandlerContext<'_>, collection: &Collection) -> Result<()> {
    for child in Collection::retrieve_children(ctx.store.db(), Some(collection.id))? {
        delete_recursively(ctx, &child)?;
    }
    for item in collection.pim_items(ctx.store.db())? {
        ctx.part_helper.remove_by_item(ctx.store.db(), item.id)?;
        item.clear_flags(ctx.store.db())?;
        item.clear_tags(ctx.store.db())?;
        item.remove(ctx.store.db())?;
    }
    collection.clear_mime_types(ctx.store.db())?;
    ctx.store
        .notifier(|collector| collector.collection_removed(collection));
    collection.remove(ctx.store.db())?;
    Ok(())
}

pub fn copy_collection(
    ctx: &HandlerContext<'_>,
    collection_id: i64,
    destination: i64,
) -> Result<Vec<Response>> {
    let transaction = Transaction::begin(ctx.store)?;
    let source = Collection::retrieve_by_id(ctx.store.db(), collection_id)?
        .ok_or_else(|| Error::Argument(format!("unknown collection {collection_id}")))?;
    let target = Collection::retrieve_by_id(ctx.store.db(), destination)?
        .ok_or_else(|| Error::Argument(format!("unknown collection {destination}")))?;
    if is_in_subtree(ctx, source.id, target.id)? {
        return Err(Error::Argument("cannot copy a collection into its own subtree".into()).into());
    }
    let new_id = copy_recursively(ctx, &source, &target)?;
    transaction.commit()?;
    Ok(vec![Response::Created { id: new_id }])
}

fn copy_recursively(
    ctx: &HandlerContext<'_>,
    source: &Collection,
    target: &Collection,
) -> Result<i64> {
    let mut copy = Collection::new(source.name.clone(), target.resource_id);
    copy.parent_id = Some(target.id);
    copy.enabled = source.enabled;
    copy.set_cache_policy(&source.cache_policy());
    copy.insert(ctx.store.db())?;

    for mime in source.mime_types(ctx.store.db())? {
        copy.add_mime_type(ctx.store.db(), mime.id)?;
    }
    for attribute in source.attributes(ctx.store.db())? {
        CollectionAttribute::store(
            ctx.store.db(),
            copy.id,
            &attribute.attribute_type,
            &attribute.value,
        )?;
    }
    ctx.store
        .notifier(|collector| collector.collection_added(&copy));

    for item in source.pim_items(ctx.store.db())? {
        super::items::copy_item(ctx, &item, &copy)?;
    }
    for child in Collection::retrieve_children(ctx.store.db(), Some(source.id))? {
        copy_recursively(ctx, &child, &copy)?;
    }
    Ok(copy.id)
}

/// Item count and cumulative payload size of one collection.
pub fn collection_stats(ctx: &HandlerContext<'_>, collection_id: i64) -> Result<Vec<Response>> {
    Collection::retrieve_by_id(ctx.store.db(), collection_id)?
        .ok_or_else(|| Error::Argument(format!("unknown collection {collection_id}")))?;
    let mut qb = QueryBuilder::select(PimItem::TABLE);
    qb.add_aggregation(&PimItem::full("id"), "count");
    qb.add_aggregation(&PimItem::full("size"), "sum");
    qb.add_value_condition(
        PimItem::full("collectionId"),
        CompareOperator::Equals,
        collection_id,
    );
    let rows = qb.query(ctx.store.db())?;
    let (count, size) = rows
        .first()
        .map(|row| (row[0].as_i64(), row[1].as_i64()))
        .unwrap_or((0, 0));
    Ok(vec![
        Response::CollectionStats { count, size },
        Response::Done {
            message: "STATUS complete".into(),
        },
    ])
}
