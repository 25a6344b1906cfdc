// Persistent-search handlers.
//
// StoreSearch creates (or redefines) a virtual collection whose membership
// is the search's result set; SearchResult carries result ids reported by
// a resource and re-links the virtual collection accordingly.

use anyhow::Result;

use super::{done, HandlerContext};
use crate::error::Error;
use crate::protocol::Response;
use crate::search::SearchRequest;
use crate::storage::datastore::Transaction;
use crate::storage::entities::{Collection, MimeType, Resource};

/// Resource owning all persistent-search collections.
pub const SEARCH_RESOURCE: &str = "pimstore_search_resource";

fn search_resource(ctx: &HandlerContext<'_>) -> Result<Resource> {
    if let Some(resource) = Resource::retrieve_by_name(ctx.store.db(), SEARCH_RESOURCE)? {
        return Ok(resource);
    }
    let mut resource = Resource {
        name: SEARCH_RESOURCE.to_string(),
        is_virtual: true,
        ..Default::default()
    };
    resource.insert(ctx.store.db())?;
    Ok(resource)
}

pub async fn store_search(
    ctx: &HandlerContext<'_>,
    name: String,
    query: String,
    language: String,
    mime_types: Vec<String>,
    collections: Vec<i64>,
) -> Result<Vec<Response>> {
    if name.is_empty() {
        return Err(Error::Argument("search needs a name".into()).into());
    }

    let transaction = Transaction::begin(ctx.store)?;
    let resource = search_resource(ctx)?;
    let mut collection = Collection::new(name, resource.id);
    collection.is_virtual = true;
    collection.query_string = Some(query.clone());
    collection.query_language = Some(language.clone());
    collection.insert(ctx.store.db())?;
    for mime_type in &mime_types {
        let mime = MimeType::retrieve_or_insert(ctx.store.db(), mime_type)?;
        collection.add_mime_type(ctx.store.db(), mime.id)?;
    }

    ctx.search.add_search(&collection).await?;

    // initial population from all configured engines
    let request = SearchRequest {
        id: collection.id,
        query,
        language,
        mime_types,
        collection_ids: collections,
        resource: 0,
    };
    let results = ctx.search.search(&request).await?;
    ctx.search.link_results(ctx.store, &collection, &results)?;

    ctx.store
        .notifier(|collector| collector.collection_added(&collection));
    transaction.commit()?;
    Ok(vec![Response::Created { id: collection.id }])
}

/// A resource reported (an update to) the result set of a persistent
/// search; re-link the virtual collection to it.
pub fn search_result(
    ctx: &HandlerContext<'_>,
    collection_id: i64,
    result_ids: Vec<i64>,
) -> Result<Vec<Response>> {
    let transaction = Transaction::begin(ctx.store)?;
    let collection = Collection::retrieve_by_id(ctx.store.db(), collection_id)?
        .ok_or_else(|| Error::Argument(format!("unknown collection {collection_id}")))?;
    if !collection.is_virtual {
        return Err(Error::Argument("search results go to virtual collections".into()).into());
    }
    let results = result_ids.into_iter().collect();
    ctx.search.link_results(ctx.store, &collection, &results)?;
    transaction.commit()?;
    Ok(done("SEARCH_RESULT complete"))
}
