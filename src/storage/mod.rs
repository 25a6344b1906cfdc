// Relational storage layer: driver, query construction, schema, typed
// entities, the per-connection data store and the payload store.

pub mod datastore;
pub mod db;
pub mod entities;
pub mod part_helper;
pub mod query_builder;
pub mod schema;
