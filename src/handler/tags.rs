// Tag command handlers.

use anyhow::Result;

use super::{done, HandlerContext};
use crate::error::Error;
use crate::protocol::Response;
use crate::storage::datastore::Transaction;
use crate::storage::entities::{Tag, TagType};

fn to_response(ctx: &HandlerContext<'_>, tag: &Tag) -> Result<Response> {
    let tag_type = tag
        .tag_type(ctx.store.db())?
        .map(|t| t.name)
        .unwrap_or_default();
    Ok(Response::Tag {
        id: tag.id,
        gid: tag.gid.clone().into_bytes(),
        tag_type,
        remote_id: tag.remote_id.clone(),
    })
}

/// Streams the requested tags (all of them for an empty id list).
pub fn fetch_tags(ctx: &HandlerContext<'_>, ids: Vec<i64>) -> Result<Vec<Response>> {
    let tags = Tag::retrieve_by_ids(ctx.store.db(), &ids)?;
    let mut responses = Vec::with_capacity(tags.len() + 1);
    for tag in &tags {
        responses.push(to_response(ctx, tag)?);
    }
    responses.extend(done("TAGFETCH complete"));
    Ok(responses)
}

pub fn create_tag(
    ctx: &HandlerContext<'_>,
    gid: Vec<u8>,
    tag_type: String,
    remote_id: Option<String>,
) -> Result<Vec<Response>> {
    let gid = String::from_utf8(gid)
        .map_err(|_| Error::Argument("tag gid must be valid UTF-8".into()))?;
    if gid.is_empty() {
        return Err(Error::Argument("tag needs a gid".into()).into());
    }
    let transaction = Transaction::begin(ctx.store)?;
    if Tag::retrieve_by_gid(ctx.store.db(), &gid)?.is_some() {
        return Err(Error::Conflict(format!("tag with gid {gid} already exists")).into());
    }
    let type_entity = TagType::retrieve_or_insert(ctx.store.db(), &tag_type)?;
    let mut tag = Tag {
        gid,
        type_id: type_entity.id,
        remote_id,
        ..Default::default()
    };
    tag.insert(ctx.store.db())?;
    ctx.store.notifier(|collector| collector.tag_added(&tag));
    transaction.commit()?;
    Ok(vec![Response::Created { id: tag.id }])
}

pub fn modify_tag(
    ctx: &HandlerContext<'_>,
    tag_id: i64,
    tag_type: Option<String>,
    remote_id: Option<String>,
) -> Result<Vec<Response>> {
    let transaction = Transaction::begin(ctx.store)?;
    let mut tag = Tag::retrieve_by_id(ctx.store.db(), tag_id)?
        .ok_or_else(|| Error::Argument(format!("unknown tag {tag_id}")))?;
    if let Some(tag_type) = tag_type {
        let type_entity = TagType::retrieve_or_insert(ctx.store.db(), &tag_type)?;
        tag.type_id = type_entity.id;
    }
    if let Some(remote_id) = remote_id {
        tag.remote_id = Some(remote_id);
    }
    tag.update(ctx.store.db())?;
    ctx.store.notifier(|collector| collector.tag_changed(&tag));
    transaction.commit()?;
    Ok(done("TAGSTORE complete"))
}

pub fn delete_tag(ctx: &HandlerContext<'_>, tag_id: i64) -> Result<Vec<Response>> {
    let transaction = Transaction::begin(ctx.store)?;
    let tag = Tag::retrieve_by_id(ctx.store.db(), tag_id)?
        .ok_or_else(|| Error::Argument(format!("unknown tag {tag_id}")))?;
    ctx.store.notifier(|collector| collector.tag_removed(&tag));
    tag.remove(ctx.store.db())?;
    transaction.commit()?;
    Ok(done("TAGREMOVE complete"))
}
