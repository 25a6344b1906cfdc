// Relation command handlers. Relations are typed directed edges between
// two items; ModifyRelation doubles as create-if-missing.

use anyhow::Result;

use super::{done, HandlerContext};
use crate::error::Error;
use crate::protocol::Response;
use crate::storage::datastore::Transaction;
use crate::storage::entities::{PimItem, Relation};

pub fn fetch_relations(
    ctx: &HandlerContext<'_>,
    left: Option<i64>,
    right: Option<i64>,
    relation_type: Option<String>,
) -> Result<Vec<Response>> {
    if left.is_none() && right.is_none() {
        return Err(Error::Argument("relation fetch needs a side to filter on".into()).into());
    }
    let relations = Relation::retrieve(ctx.store.db(), left, right, relation_type.as_deref())?;
    let mut responses = Vec::with_capacity(relations.len() + 1);
    for relation in relations {
        responses.push(Response::Relation {
            left: relation.left_id,
            right: relation.right_id,
            relation_type: relation.rel_type,
            remote_id: relation.remote_id,
        });
    }
    responses.extend(done("RELATIONFETCH complete"));
    Ok(responses)
}

pub fn modify_relation(
    ctx: &HandlerContext<'_>,
    left: i64,
    right: i64,
    relation_type: String,
    remote_id: Option<String>,
) -> Result<Vec<Response>> {
    if relation_type.is_empty() {
        return Err(Error::Argument("relation needs a type".into()).into());
    }
    let transaction = Transaction::begin(ctx.store)?;
    for side in [left, right] {
        if PimItem::retrieve_by_id(ctx.store.db(), side)?.is_none() {
            return Err(Error::Argument(format!("unknown item {side}")).into());
        }
    }
    let existing = Relation::retrieve(ctx.store.db(), Some(left), Some(right), Some(&relation_type))?;
    match existing.into_iter().next() {
        Some(mut relation) => {
            relation.remote_id = remote_id;
            relation.update(ctx.store.db())?;
        }
        None => {
            let mut relation = Relation {
                left_id: left,
                right_id: right,
                rel_type: relation_type,
                remote_id,
                ..Default::default()
            };
            relation.insert(ctx.store.db())?;
        }
    }
    transaction.commit()?;
    Ok(done("RELATIONSTORE complete"))
}

pub fn remove_relations(
    ctx: &HandlerContext<'_>,
    left: i64,
    right: i64,
    relation_type: Option<String>,
) -> Result<Vec<Response>> {
    let transaction = Transaction::begin(ctx.store)?;
    let removed =
        Relation::remove_matching(ctx.store.db(), left, right, relation_type.as_deref())?;
    if removed == 0 {
        return Err(Error::Argument("no matching relations".into()).into());
    }
    transaction.commit()?;
    Ok(done("RELATIONREMOVE complete"))
}
