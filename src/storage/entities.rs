// Typed records over the relational layout.
//
// Every entity is a plain value mirroring one table row, with CRUD through
// the query builder and lazy relational accessors that query on first use
// and cache for the lifetime of the value. Ids are database-assigned;
// a freshly constructed entity has id 0 until inserted.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;

use super::db::{Database, Row, Value};
use super::query_builder::{CompareOperator, Condition, JoinType, LogicOperator, QueryBuilder};
use crate::error::{Error, Result};
use crate::protocol::{CachePolicy, Tristate};

fn tristate_from_value(value: &Value) -> Tristate {
    match value.as_i64() {
        0 => Tristate::True,
        1 => Tristate::False,
        _ => Tristate::Undefined,
    }
}

/// Entities interned by unique name: Flag, MimeType, TagType.
macro_rules! interned_entity {
    ($type_name:ident, $table:literal) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $type_name {
            pub id: i64,
            pub name: String,
        }

        impl $type_name {
            pub const TABLE: &'static str = $table;

            pub fn full(column: &str) -> String {
                format!("{}.{}", Self::TABLE, column)
            }

            fn from_row(row: &Row) -> Self {
                Self {
                    id: row[0].as_i64(),
                    name: row[1].as_string(),
                }
            }

            fn select() -> QueryBuilder {
                let mut qb = QueryBuilder::select(Self::TABLE);
                qb.add_columns(["id", "name"]);
                qb
            }

            pub fn retrieve_by_id(db: &Database, id: i64) -> Result<Option<Self>> {
                let mut qb = Self::select();
                qb.add_value_condition("id", CompareOperator::Equals, id);
                Ok(qb.query(db)?.first().map(Self::from_row))
            }

            pub fn retrieve_by_name(db: &Database, name: &str) -> Result<Option<Self>> {
                let mut qb = Self::select();
                qb.add_value_condition("name", CompareOperator::Equals, name);
                Ok(qb.query(db)?.first().map(Self::from_row))
            }

            pub fn retrieve_all(db: &Database) -> Result<Vec<Self>> {
                Ok(Self::select().query(db)?.iter().map(Self::from_row).collect())
            }

            /// Fetches the named row, interning it first if missing.
            pub fn retrieve_or_insert(db: &Database, name: &str) -> Result<Self> {
                if let Some(existing) = Self::retrieve_by_name(db, name)? {
                    return Ok(existing);
                }
                let mut qb = QueryBuilder::insert(Self::TABLE);
                qb.set_column_value("name", name);
                let id = qb.exec_insert(db)?;
                Ok(Self {
                    id,
                    name: name.to_string(),
                })
            }

            pub fn remove(&self, db: &Database) -> Result<()> {
                let mut qb = QueryBuilder::delete(Self::TABLE);
                qb.add_value_condition("id", CompareOperator::Equals, self.id);
                qb.exec(db)?;
                Ok(())
            }
        }
    };
}

interned_entity!(Flag, "FlagTable");
interned_entity!(MimeType, "MimeTypeTable");
interned_entity!(TagType, "TagTypeTable");

/// An external data source owning a subtree of collections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resource {
    pub id: i64,
    pub name: String,
    pub display_name: Option<String>,
    pub capabilities: Option<String>,
    pub is_virtual: bool,
}

impl Resource {
    pub const TABLE: &'static str = "ResourceTable";
    const COLUMNS: [&'static str; 5] = ["id", "name", "displayName", "capabilities", "isVirtual"];

    pub fn full(column: &str) -> String {
        format!("{}.{}", Self::TABLE, column)
    }

    fn from_row(row: &Row) -> Self {
        Self {
            id: row[0].as_i64(),
            name: row[1].as_string(),
            display_name: row[2].as_opt_string(),
            capabilities: row[3].as_opt_string(),
            is_virtual: row[4].as_bool(),
        }
    }

    fn select() -> QueryBuilder {
        let mut qb = QueryBuilder::select(Self::TABLE);
        qb.add_columns(Self::COLUMNS);
        qb
    }

    pub fn retrieve_by_id(db: &Database, id: i64) -> Result<Option<Self>> {
        let mut qb = Self::select();
        qb.add_value_condition("id", CompareOperator::Equals, id);
        Ok(qb.query(db)?.first().map(Self::from_row))
    }

    pub fn retrieve_by_name(db: &Database, name: &str) -> Result<Option<Self>> {
        let mut qb = Self::select();
        qb.add_value_condition("name", CompareOperator::Equals, name);
        Ok(qb.query(db)?.first().map(Self::from_row))
    }

    pub fn retrieve_all(db: &Database) -> Result<Vec<Self>> {
        Ok(Self::select().query(db)?.iter().map(Self::from_row).collect())
    }

    pub fn insert(&mut self, db: &Database) -> Result<i64> {
        let mut qb = QueryBuilder::insert(Self::TABLE);
        qb.set_column_value("name", self.name.clone());
        qb.set_column_value("displayName", Value::from(self.display_name.clone()));
        qb.set_column_value("capabilities", Value::from(self.capabilities.clone()));
        qb.set_column_value("isVirtual", self.is_virtual);
        self.id = qb.exec_insert(db)?;
        Ok(self.id)
    }

    pub fn update(&self, db: &Database) -> Result<()> {
        let mut qb = QueryBuilder::update(Self::TABLE);
        qb.set_column_value("name", self.name.clone());
        qb.set_column_value("displayName", Value::from(self.display_name.clone()));
        qb.set_column_value("capabilities", Value::from(self.capabilities.clone()));
        qb.set_column_value("isVirtual", self.is_virtual);
        qb.add_value_condition("id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    pub fn remove(&self, db: &Database) -> Result<()> {
        let mut qb = QueryBuilder::delete(Self::TABLE);
        qb.add_value_condition("id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    /// Non-virtual collections owned by this resource, root first.
    pub fn collections(&self, db: &Database) -> Result<Vec<Collection>> {
        let mut qb = Collection::select();
        qb.add_value_condition("resourceId", CompareOperator::Equals, self.id);
        qb.add_sort_column("id", super::query_builder::SortOrder::Ascending);
        Ok(qb.query(db)?.iter().map(Collection::from_row).collect())
    }
}

/// A node in a per-resource collection tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    pub id: i64,
    pub remote_id: Option<String>,
    pub remote_revision: Option<String>,
    pub name: String,
    pub parent_id: Option<i64>,
    pub resource_id: i64,
    pub enabled: bool,
    pub referenced: bool,
    pub display_pref: Tristate,
    pub sync_pref: Tristate,
    pub index_pref: Tristate,
    pub cache_policy_inherit: bool,
    pub cache_policy_local_parts: Option<String>,
    pub cache_policy_cache_timeout: i32,
    pub cache_policy_sync_on_demand: bool,
    pub query_string: Option<String>,
    pub query_language: Option<String>,
    pub is_virtual: bool,
    #[doc(hidden)]
    attributes_cache: OnceCell<Vec<CollectionAttribute>>,
}

impl Collection {
    pub const TABLE: &'static str = "CollectionTable";
    const COLUMNS: [&'static str; 18] = [
        "id",
        "remoteId",
        "remoteRevision",
        "name",
        "parentId",
        "resourceId",
        "enabled",
        "referenced",
        "displayPref",
        "syncPref",
        "indexPref",
        "cachePolicyInherit",
        "cachePolicyLocalParts",
        "cachePolicyCacheTimeout",
        "cachePolicySyncOnDemand",
        "queryString",
        "queryLanguage",
        "isVirtual",
    ];

    pub fn full(column: &str) -> String {
        format!("{}.{}", Self::TABLE, column)
    }

    pub fn new(name: impl Into<String>, resource_id: i64) -> Self {
        Self {
            name: name.into(),
            resource_id,
            enabled: true,
            cache_policy_inherit: true,
            cache_policy_cache_timeout: -1,
            ..Default::default()
        }
    }

    fn from_row(row: &Row) -> Self {
        Self {
            id: row[0].as_i64(),
            remote_id: row[1].as_opt_string(),
            remote_revision: row[2].as_opt_string(),
            name: row[3].as_string(),
            parent_id: row[4].as_opt_i64(),
            resource_id: row[5].as_i64(),
            enabled: row[6].as_bool(),
            referenced: row[7].as_bool(),
            display_pref: tristate_from_value(&row[8]),
            sync_pref: tristate_from_value(&row[9]),
            index_pref: tristate_from_value(&row[10]),
            cache_policy_inherit: row[11].as_bool(),
            cache_policy_local_parts: row[12].as_opt_string(),
            cache_policy_cache_timeout: row[13].as_i64() as i32,
            cache_policy_sync_on_demand: row[14].as_bool(),
            query_string: row[15].as_opt_string(),
            query_language: row[16].as_opt_string(),
            is_virtual: row[17].as_bool(),
            attributes_cache: OnceCell::new(),
        }
    }

    fn select() -> QueryBuilder {
        let mut qb = QueryBuilder::select(Self::TABLE);
        qb.add_columns(Self::COLUMNS);
        qb
    }

    pub fn retrieve_by_id(db: &Database, id: i64) -> Result<Option<Self>> {
        let mut qb = Self::select();
        qb.add_value_condition("id", CompareOperator::Equals, id);
        Ok(qb.query(db)?.first().map(Self::from_row))
    }

    pub fn retrieve_all(db: &Database) -> Result<Vec<Self>> {
        Ok(Self::select().query(db)?.iter().map(Self::from_row).collect())
    }

    /// Direct children; `None` lists roots across all resources.
    pub fn retrieve_children(db: &Database, parent_id: Option<i64>) -> Result<Vec<Self>> {
        let mut qb = Self::select();
        match parent_id {
            Some(parent) => qb.add_value_condition("parentId", CompareOperator::Equals, parent),
            None => qb.add_value_condition("parentId", CompareOperator::Is, Value::Null),
        }
        Ok(qb.query(db)?.iter().map(Self::from_row).collect())
    }

    pub fn retrieve_by_resource(db: &Database, resource_id: i64) -> Result<Vec<Self>> {
        let mut qb = Self::select();
        qb.add_value_condition("resourceId", CompareOperator::Equals, resource_id);
        Ok(qb.query(db)?.iter().map(Self::from_row).collect())
    }

    fn bind_columns(&self, qb: &mut QueryBuilder) {
        qb.set_column_value("remoteId", Value::from(self.remote_id.clone()));
        qb.set_column_value("remoteRevision", Value::from(self.remote_revision.clone()));
        qb.set_column_value("name", self.name.clone());
        qb.set_column_value("parentId", Value::from(self.parent_id));
        qb.set_column_value("resourceId", self.resource_id);
        qb.set_column_value("enabled", self.enabled);
        qb.set_column_value("referenced", self.referenced);
        qb.set_column_value("displayPref", self.display_pref as i64);
        qb.set_column_value("syncPref", self.sync_pref as i64);
        qb.set_column_value("indexPref", self.index_pref as i64);
        qb.set_column_value("cachePolicyInherit", self.cache_policy_inherit);
        qb.set_column_value(
            "cachePolicyLocalParts",
            Value::from(self.cache_policy_local_parts.clone()),
        );
        qb.set_column_value("cachePolicyCacheTimeout", self.cache_policy_cache_timeout);
        qb.set_column_value("cachePolicySyncOnDemand", self.cache_policy_sync_on_demand);
        qb.set_column_value("queryString", Value::from(self.query_string.clone()));
        qb.set_column_value("queryLanguage", Value::from(self.query_language.clone()));
        qb.set_column_value("isVirtual", self.is_virtual);
    }

    pub fn insert(&mut self, db: &Database) -> Result<i64> {
        let mut qb = QueryBuilder::insert(Self::TABLE);
        self.bind_columns(&mut qb);
        self.id = qb.exec_insert(db)?;
        Ok(self.id)
    }

    pub fn update(&self, db: &Database) -> Result<()> {
        let mut qb = QueryBuilder::update(Self::TABLE);
        self.bind_columns(&mut qb);
        qb.add_value_condition("id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    pub fn remove(&self, db: &Database) -> Result<()> {
        let mut qb = QueryBuilder::delete(Self::TABLE);
        qb.add_value_condition("id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    pub fn parent(&self, db: &Database) -> Result<Option<Collection>> {
        match self.parent_id {
            Some(parent_id) => Self::retrieve_by_id(db, parent_id),
            None => Ok(None),
        }
    }

    pub fn resource(&self, db: &Database) -> Result<Option<Resource>> {
        Resource::retrieve_by_id(db, self.resource_id)
    }

    pub fn attributes(&self, db: &Database) -> Result<&[CollectionAttribute]> {
        let cached = self.attributes_cache.get_or_try_init(|| {
            CollectionAttribute::retrieve_by_collection(db, self.id)
        })?;
        Ok(cached)
    }

    pub fn pim_items(&self, db: &Database) -> Result<Vec<PimItem>> {
        let mut qb = PimItem::select();
        qb.add_value_condition("collectionId", CompareOperator::Equals, self.id);
        Ok(qb.query(db)?.iter().map(PimItem::from_row).collect())
    }

    pub fn mime_types(&self, db: &Database) -> Result<Vec<MimeType>> {
        let mut qb = QueryBuilder::select("CollectionMimeTypeRelation");
        qb.add_columns([MimeType::full("id"), MimeType::full("name")]);
        qb.add_column_join(
            JoinType::InnerJoin,
            MimeType::TABLE,
            "CollectionMimeTypeRelation.MimeType_id",
            &MimeType::full("id"),
        );
        qb.add_value_condition(
            "CollectionMimeTypeRelation.Collection_id",
            CompareOperator::Equals,
            self.id,
        );
        Ok(qb.query(db)?.iter().map(MimeType::from_row).collect())
    }

    pub fn add_mime_type(&self, db: &Database, mime_type_id: i64) -> Result<()> {
        let mut probe = QueryBuilder::select("CollectionMimeTypeRelation");
        probe.add_column("Collection_id");
        probe.add_value_condition("Collection_id", CompareOperator::Equals, self.id);
        probe.add_value_condition("MimeType_id", CompareOperator::Equals, mime_type_id);
        if !probe.query(db)?.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::insert("CollectionMimeTypeRelation");
        qb.set_identification_column("");
        qb.set_column_value("Collection_id", self.id);
        qb.set_column_value("MimeType_id", mime_type_id);
        qb.exec_insert(db)?;
        Ok(())
    }

    pub fn clear_mime_types(&self, db: &Database) -> Result<()> {
        let mut qb = QueryBuilder::delete("CollectionMimeTypeRelation");
        qb.add_value_condition("Collection_id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    /// Items linked into this (virtual) collection.
    pub fn linked_item_ids(&self, db: &Database) -> Result<Vec<i64>> {
        let mut qb = QueryBuilder::select("CollectionPimItemRelation");
        qb.add_column("PimItem_id");
        qb.add_value_condition("Collection_id", CompareOperator::Equals, self.id);
        Ok(qb.query(db)?.iter().map(|row| row[0].as_i64()).collect())
    }

    pub fn link_item(&self, db: &Database, item_id: i64) -> Result<bool> {
        let mut probe = QueryBuilder::select("CollectionPimItemRelation");
        probe.add_column("PimItem_id");
        probe.add_value_condition("Collection_id", CompareOperator::Equals, self.id);
        probe.add_value_condition("PimItem_id", CompareOperator::Equals, item_id);
        if !probe.query(db)?.is_empty() {
            return Ok(false);
        }
        let mut qb = QueryBuilder::insert("CollectionPimItemRelation");
        qb.set_identification_column("");
        qb.set_column_value("Collection_id", self.id);
        qb.set_column_value("PimItem_id", item_id);
        qb.exec_insert(db)?;
        Ok(true)
    }

    pub fn unlink_item(&self, db: &Database, item_id: i64) -> Result<bool> {
        let mut qb = QueryBuilder::delete("CollectionPimItemRelation");
        qb.add_value_condition("Collection_id", CompareOperator::Equals, self.id);
        qb.add_value_condition("PimItem_id", CompareOperator::Equals, item_id);
        Ok(qb.exec(db)? > 0)
    }

    /// The policy stored on this row; resolution of the inherit flag is the
    /// data store's job.
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            inherit: self.cache_policy_inherit,
            local_parts: self
                .cache_policy_local_parts
                .as_deref()
                .map(|parts| parts.split(' ').filter(|p| !p.is_empty()).map(String::from).collect())
                .unwrap_or_default(),
            cache_timeout: self.cache_policy_cache_timeout,
            sync_on_demand: self.cache_policy_sync_on_demand,
        }
    }

    pub fn set_cache_policy(&mut self, policy: &CachePolicy) {
        self.cache_policy_inherit = policy.inherit;
        self.cache_policy_local_parts = if policy.local_parts.is_empty() {
            None
        } else {
            Some(policy.local_parts.join(" "))
        };
        self.cache_policy_cache_timeout = policy.cache_timeout;
        self.cache_policy_sync_on_demand = policy.sync_on_demand;
    }
}

/// A stored PIM record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PimItem {
    pub id: i64,
    pub rev: i32,
    pub remote_id: Option<String>,
    pub remote_revision: Option<String>,
    pub gid: Option<String>,
    pub collection_id: i64,
    pub mime_type_id: i64,
    pub datetime: Option<DateTime<Utc>>,
    pub atime: Option<DateTime<Utc>>,
    pub size: i64,
    pub dirty: bool,
}

impl PimItem {
    pub const TABLE: &'static str = "PimItemTable";
    const COLUMNS: [&'static str; 11] = [
        "id",
        "rev",
        "remoteId",
        "remoteRevision",
        "gid",
        "collectionId",
        "mimeTypeId",
        "datetime",
        "atime",
        "size",
        "dirty",
    ];

    pub fn full(column: &str) -> String {
        format!("{}.{}", Self::TABLE, column)
    }

    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            id: row[0].as_i64(),
            rev: row[1].as_i64() as i32,
            remote_id: row[2].as_opt_string(),
            remote_revision: row[3].as_opt_string(),
            gid: row[4].as_opt_string(),
            collection_id: row[5].as_i64(),
            mime_type_id: row[6].as_i64(),
            datetime: row[7].as_datetime(),
            atime: row[8].as_datetime(),
            size: row[9].as_i64(),
            dirty: row[10].as_bool(),
        }
    }

    pub(crate) fn select() -> QueryBuilder {
        let mut qb = QueryBuilder::select(Self::TABLE);
        qb.add_columns(Self::COLUMNS.map(|c| Self::full(c)));
        qb
    }

    pub fn retrieve_by_id(db: &Database, id: i64) -> Result<Option<Self>> {
        let mut qb = Self::select();
        qb.add_value_condition(Self::full("id"), CompareOperator::Equals, id);
        Ok(qb.query(db)?.first().map(Self::from_row))
    }

    pub fn retrieve_by_gid(db: &Database, gid: &str) -> Result<Vec<Self>> {
        let mut qb = Self::select();
        qb.add_value_condition(Self::full("gid"), CompareOperator::Equals, gid);
        Ok(qb.query(db)?.iter().map(Self::from_row).collect())
    }

    fn bind_columns(&self, qb: &mut QueryBuilder) {
        qb.set_column_value("rev", self.rev);
        qb.set_column_value("remoteId", Value::from(self.remote_id.clone()));
        qb.set_column_value("remoteRevision", Value::from(self.remote_revision.clone()));
        qb.set_column_value("gid", Value::from(self.gid.clone()));
        qb.set_column_value("collectionId", self.collection_id);
        qb.set_column_value("mimeTypeId", self.mime_type_id);
        qb.set_column_value("datetime", Value::from(self.datetime));
        qb.set_column_value("atime", Value::from(self.atime));
        qb.set_column_value("size", self.size);
        qb.set_column_value("dirty", self.dirty);
    }

    pub fn insert(&mut self, db: &Database) -> Result<i64> {
        let mut qb = QueryBuilder::insert(Self::TABLE);
        self.bind_columns(&mut qb);
        self.id = qb.exec_insert(db)?;
        Ok(self.id)
    }

    /// Writes the row back. The caller is responsible for having bumped
    /// `rev`; every mutation of an item must increase it.
    pub fn update(&self, db: &Database) -> Result<()> {
        let mut qb = QueryBuilder::update(Self::TABLE);
        self.bind_columns(&mut qb);
        qb.add_value_condition("id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    pub fn remove(&self, db: &Database) -> Result<()> {
        let mut qb = QueryBuilder::delete(Self::TABLE);
        qb.add_value_condition("id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    pub fn collection(&self, db: &Database) -> Result<Option<Collection>> {
        Collection::retrieve_by_id(db, self.collection_id)
    }

    pub fn mime_type(&self, db: &Database) -> Result<Option<MimeType>> {
        MimeType::retrieve_by_id(db, self.mime_type_id)
    }

    pub fn flags(&self, db: &Database) -> Result<Vec<Flag>> {
        let mut qb = QueryBuilder::select("PimItemFlagRelation");
        qb.add_columns([Flag::full("id"), Flag::full("name")]);
        qb.add_column_join(
            JoinType::InnerJoin,
            Flag::TABLE,
            "PimItemFlagRelation.Flag_id",
            &Flag::full("id"),
        );
        qb.add_value_condition("PimItemFlagRelation.PimItem_id", CompareOperator::Equals, self.id);
        Ok(qb.query(db)?.iter().map(Flag::from_row).collect())
    }

    pub fn add_flag(&self, db: &Database, flag_id: i64) -> Result<bool> {
        let mut probe = QueryBuilder::select("PimItemFlagRelation");
        probe.add_column("PimItem_id");
        probe.add_value_condition("PimItem_id", CompareOperator::Equals, self.id);
        probe.add_value_condition("Flag_id", CompareOperator::Equals, flag_id);
        if !probe.query(db)?.is_empty() {
            return Ok(false);
        }
        let mut qb = QueryBuilder::insert("PimItemFlagRelation");
        qb.set_identification_column("");
        qb.set_column_value("PimItem_id", self.id);
        qb.set_column_value("Flag_id", flag_id);
        qb.exec_insert(db)?;
        Ok(true)
    }

    pub fn remove_flag(&self, db: &Database, flag_id: i64) -> Result<bool> {
        let mut qb = QueryBuilder::delete("PimItemFlagRelation");
        qb.add_value_condition("PimItem_id", CompareOperator::Equals, self.id);
        qb.add_value_condition("Flag_id", CompareOperator::Equals, flag_id);
        Ok(qb.exec(db)? > 0)
    }

    pub fn clear_flags(&self, db: &Database) -> Result<()> {
        let mut qb = QueryBuilder::delete("PimItemFlagRelation");
        qb.add_value_condition("PimItem_id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    pub fn tags(&self, db: &Database) -> Result<Vec<Tag>> {
        let mut qb = QueryBuilder::select("PimItemTagRelation");
        qb.add_columns([
            Tag::full("id"),
            Tag::full("gid"),
            Tag::full("typeId"),
            Tag::full("remoteId"),
        ]);
        qb.add_column_join(
            JoinType::InnerJoin,
            Tag::TABLE,
            "PimItemTagRelation.Tag_id",
            &Tag::full("id"),
        );
        qb.add_value_condition("PimItemTagRelation.PimItem_id", CompareOperator::Equals, self.id);
        Ok(qb.query(db)?.iter().map(Tag::from_row).collect())
    }

    pub fn add_tag(&self, db: &Database, tag_id: i64) -> Result<bool> {
        let mut probe = QueryBuilder::select("PimItemTagRelation");
        probe.add_column("PimItem_id");
        probe.add_value_condition("PimItem_id", CompareOperator::Equals, self.id);
        probe.add_value_condition("Tag_id", CompareOperator::Equals, tag_id);
        if !probe.query(db)?.is_empty() {
            return Ok(false);
        }
        let mut qb = QueryBuilder::insert("PimItemTagRelation");
        qb.set_identification_column("");
        qb.set_column_value("PimItem_id", self.id);
        qb.set_column_value("Tag_id", tag_id);
        qb.exec_insert(db)?;
        Ok(true)
    }

    pub fn clear_tags(&self, db: &Database) -> Result<()> {
        let mut qb = QueryBuilder::delete("PimItemTagRelation");
        qb.add_value_condition("PimItem_id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    pub fn parts(&self, db: &Database) -> Result<Vec<Part>> {
        let mut qb = Part::select();
        qb.add_value_condition("pimItemId", CompareOperator::Equals, self.id);
        Ok(qb.query(db)?.iter().map(Part::from_row).collect())
    }

    pub fn part(&self, db: &Database, name: &str) -> Result<Option<Part>> {
        let mut qb = Part::select();
        qb.add_value_condition("pimItemId", CompareOperator::Equals, self.id);
        qb.add_value_condition("name", CompareOperator::Equals, name);
        Ok(qb.query(db)?.first().map(Part::from_row))
    }
}

/// A named payload or attribute of an item. When `external` is set, `data`
/// holds the absolute file path (UTF-8) instead of the payload bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    pub id: i64,
    pub pim_item_id: i64,
    pub name: String,
    pub data: Option<Vec<u8>>,
    pub datasize: i64,
    pub version: i32,
    pub external: bool,
}

impl Part {
    pub const TABLE: &'static str = "PartTable";
    const COLUMNS: [&'static str; 7] = [
        "id",
        "pimItemId",
        "name",
        "data",
        "datasize",
        "version",
        "external",
    ];

    pub fn full(column: &str) -> String {
        format!("{}.{}", Self::TABLE, column)
    }

    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            id: row[0].as_i64(),
            pim_item_id: row[1].as_i64(),
            name: row[2].as_string(),
            data: match &row[3] {
                Value::Null => None,
                other => Some(other.as_blob()),
            },
            datasize: row[4].as_i64(),
            version: row[5].as_i64() as i32,
            external: row[6].as_bool(),
        }
    }

    pub(crate) fn select() -> QueryBuilder {
        let mut qb = QueryBuilder::select(Self::TABLE);
        qb.add_columns(Self::COLUMNS.map(|c| Self::full(c)));
        qb
    }

    pub fn retrieve_by_id(db: &Database, id: i64) -> Result<Option<Self>> {
        let mut qb = Self::select();
        qb.add_value_condition(Self::full("id"), CompareOperator::Equals, id);
        Ok(qb.query(db)?.first().map(Self::from_row))
    }

    fn bind_columns(&self, qb: &mut QueryBuilder) {
        qb.set_column_value("pimItemId", self.pim_item_id);
        qb.set_column_value("name", self.name.clone());
        qb.set_column_value("data", Value::from(self.data.clone()));
        qb.set_column_value("datasize", self.datasize);
        qb.set_column_value("version", self.version);
        qb.set_column_value("external", self.external);
    }

    pub fn insert(&mut self, db: &Database) -> Result<i64> {
        let mut qb = QueryBuilder::insert(Self::TABLE);
        self.bind_columns(&mut qb);
        self.id = qb.exec_insert(db)?;
        Ok(self.id)
    }

    pub fn update(&self, db: &Database) -> Result<()> {
        let mut qb = QueryBuilder::update(Self::TABLE);
        self.bind_columns(&mut qb);
        qb.add_value_condition("id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    pub fn remove(&self, db: &Database) -> Result<()> {
        let mut qb = QueryBuilder::delete(Self::TABLE);
        qb.add_value_condition("id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    /// Payload parts are subject to cache eviction; everything else is
    /// treated as an attribute.
    pub fn is_payload(&self) -> bool {
        self.name.starts_with(crate::protocol::PAYLOAD_PART_PREFIX)
    }
}

/// A typed label interned by gid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tag {
    pub id: i64,
    pub gid: String,
    pub type_id: i64,
    pub remote_id: Option<String>,
}

impl Tag {
    pub const TABLE: &'static str = "TagTable";

    pub fn full(column: &str) -> String {
        format!("{}.{}", Self::TABLE, column)
    }

    fn from_row(row: &Row) -> Self {
        Self {
            id: row[0].as_i64(),
            gid: row[1].as_string(),
            type_id: row[2].as_i64(),
            remote_id: row[3].as_opt_string(),
        }
    }

    fn select() -> QueryBuilder {
        let mut qb = QueryBuilder::select(Self::TABLE);
        qb.add_columns(["id", "gid", "typeId", "remoteId"]);
        qb
    }

    pub fn retrieve_by_id(db: &Database, id: i64) -> Result<Option<Self>> {
        let mut qb = Self::select();
        qb.add_value_condition("id", CompareOperator::Equals, id);
        Ok(qb.query(db)?.first().map(Self::from_row))
    }

    pub fn retrieve_by_gid(db: &Database, gid: &str) -> Result<Option<Self>> {
        let mut qb = Self::select();
        qb.add_value_condition("gid", CompareOperator::Equals, gid);
        Ok(qb.query(db)?.first().map(Self::from_row))
    }

    pub fn retrieve_all(db: &Database) -> Result<Vec<Self>> {
        Ok(Self::select().query(db)?.iter().map(Self::from_row).collect())
    }

    pub fn retrieve_by_ids(db: &Database, ids: &[i64]) -> Result<Vec<Self>> {
        if ids.is_empty() {
            return Self::retrieve_all(db);
        }
        let mut qb = Self::select();
        qb.add_value_list_condition(
            "id",
            CompareOperator::In,
            ids.iter().map(|id| Value::from(*id)).collect(),
        );
        Ok(qb.query(db)?.iter().map(Self::from_row).collect())
    }

    pub fn insert(&mut self, db: &Database) -> Result<i64> {
        let mut qb = QueryBuilder::insert(Self::TABLE);
        qb.set_column_value("gid", self.gid.clone());
        qb.set_column_value("typeId", self.type_id);
        qb.set_column_value("remoteId", Value::from(self.remote_id.clone()));
        self.id = qb.exec_insert(db)?;
        Ok(self.id)
    }

    pub fn update(&self, db: &Database) -> Result<()> {
        let mut qb = QueryBuilder::update(Self::TABLE);
        qb.set_column_value("gid", self.gid.clone());
        qb.set_column_value("typeId", self.type_id);
        qb.set_column_value("remoteId", Value::from(self.remote_id.clone()));
        qb.add_value_condition("id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    pub fn remove(&self, db: &Database) -> Result<()> {
        let mut links = QueryBuilder::delete("PimItemTagRelation");
        links.add_value_condition("Tag_id", CompareOperator::Equals, self.id);
        links.exec(db)?;
        let mut qb = QueryBuilder::delete(Self::TABLE);
        qb.add_value_condition("id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    pub fn tag_type(&self, db: &Database) -> Result<Option<TagType>> {
        TagType::retrieve_by_id(db, self.type_id)
    }
}

/// A typed directed edge between two items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relation {
    pub id: i64,
    pub left_id: i64,
    pub right_id: i64,
    pub rel_type: String,
    pub remote_id: Option<String>,
}

impl Relation {
    pub const TABLE: &'static str = "RelationTable";

    fn from_row(row: &Row) -> Self {
        Self {
            id: row[0].as_i64(),
            left_id: row[1].as_i64(),
            right_id: row[2].as_i64(),
            rel_type: row[3].as_string(),
            remote_id: row[4].as_opt_string(),
        }
    }

    fn select() -> QueryBuilder {
        let mut qb = QueryBuilder::select(Self::TABLE);
        qb.add_columns(["id", "leftId", "rightId", "type", "remoteId"]);
        qb
    }

    pub fn retrieve(
        db: &Database,
        left: Option<i64>,
        right: Option<i64>,
        rel_type: Option<&str>,
    ) -> Result<Vec<Self>> {
        let mut qb = Self::select();
        if let Some(left) = left {
            qb.add_value_condition("leftId", CompareOperator::Equals, left);
        }
        if let Some(right) = right {
            qb.add_value_condition("rightId", CompareOperator::Equals, right);
        }
        if let Some(rel_type) = rel_type {
            qb.add_value_condition("type", CompareOperator::Equals, rel_type);
        }
        Ok(qb.query(db)?.iter().map(Self::from_row).collect())
    }

    pub fn insert(&mut self, db: &Database) -> Result<i64> {
        let mut qb = QueryBuilder::insert(Self::TABLE);
        qb.set_column_value("leftId", self.left_id);
        qb.set_column_value("rightId", self.right_id);
        qb.set_column_value("type", self.rel_type.clone());
        qb.set_column_value("remoteId", Value::from(self.remote_id.clone()));
        self.id = qb.exec_insert(db)?;
        Ok(self.id)
    }

    pub fn update(&self, db: &Database) -> Result<()> {
        let mut qb = QueryBuilder::update(Self::TABLE);
        qb.set_column_value("remoteId", Value::from(self.remote_id.clone()));
        qb.add_value_condition("id", CompareOperator::Equals, self.id);
        qb.exec(db)?;
        Ok(())
    }

    pub fn remove_matching(
        db: &Database,
        left: i64,
        right: i64,
        rel_type: Option<&str>,
    ) -> Result<usize> {
        let mut qb = QueryBuilder::delete(Self::TABLE);
        qb.add_value_condition("leftId", CompareOperator::Equals, left);
        qb.add_value_condition("rightId", CompareOperator::Equals, right);
        if let Some(rel_type) = rel_type {
            qb.add_value_condition("type", CompareOperator::Equals, rel_type);
        }
        qb.exec(db)
    }
}

/// Typed key/value attribute attached to a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionAttribute {
    pub id: i64,
    pub collection_id: i64,
    pub attribute_type: Vec<u8>,
    pub value: Vec<u8>,
}

impl CollectionAttribute {
    pub const TABLE: &'static str = "CollectionAttributeTable";

    fn from_row(row: &Row) -> Self {
        Self {
            id: row[0].as_i64(),
            collection_id: row[1].as_i64(),
            attribute_type: row[2].as_blob(),
            value: row[3].as_blob(),
        }
    }

    pub fn retrieve_by_collection(db: &Database, collection_id: i64) -> Result<Vec<Self>> {
        let mut qb = QueryBuilder::select(Self::TABLE);
        qb.add_columns(["id", "collectionId", "type", "value"]);
        qb.add_value_condition("collectionId", CompareOperator::Equals, collection_id);
        Ok(qb.query(db)?.iter().map(Self::from_row).collect())
    }

    /// Inserts or replaces; the (collection, type) pair is unique.
    pub fn store(
        db: &Database,
        collection_id: i64,
        attribute_type: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let mut qb = QueryBuilder::update(Self::TABLE);
        qb.set_column_value("value", value.to_vec());
        qb.add_value_condition("collectionId", CompareOperator::Equals, collection_id);
        qb.add_value_condition("type", CompareOperator::Equals, attribute_type.to_vec());
        if qb.exec(db)? == 0 {
            let mut insert = QueryBuilder::insert(Self::TABLE);
            insert.set_column_value("collectionId", collection_id);
            insert.set_column_value("type", attribute_type.to_vec());
            insert.set_column_value("value", value.to_vec());
            insert.exec_insert(db)?;
        }
        Ok(())
    }

    pub fn remove_entry(db: &Database, collection_id: i64, attribute_type: &[u8]) -> Result<usize> {
        let mut qb = QueryBuilder::delete(Self::TABLE);
        qb.add_value_condition("collectionId", CompareOperator::Equals, collection_id);
        qb.add_value_condition("type", CompareOperator::Equals, attribute_type.to_vec());
        qb.exec(db)
    }
}

/// Resolves a scope against the item table, honoring the caller's resource
/// context for remote-id lookups.
pub fn scope_to_query(
    scope: &crate::protocol::Scope,
    resource_context: Option<i64>,
    qb: &mut QueryBuilder,
) -> Result<()> {
    use crate::protocol::Scope;
    match scope {
        Scope::Uid(ids) => {
            if ids.is_empty() {
                return Err(Error::Argument("empty uid scope".into()));
            }
            qb.add_value_list_condition(
                PimItem::full("id"),
                CompareOperator::In,
                ids.iter().map(|id| Value::from(*id)).collect(),
            );
        }
        Scope::Rid(rids) => {
            if rids.is_empty() {
                return Err(Error::Argument("empty rid scope".into()));
            }
            let resource_id = resource_context.ok_or_else(|| {
                Error::Argument("remote-id scope requires a resource context".into())
            })?;
            qb.add_value_list_condition(
                PimItem::full("remoteId"),
                CompareOperator::In,
                rids.iter().map(|rid| Value::from(rid.as_str())).collect(),
            );
            let mut join = Condition::default();
            join.add_column_condition(
                PimItem::full("collectionId"),
                CompareOperator::Equals,
                Collection::full("id"),
            );
            qb.add_join(JoinType::InnerJoin, Collection::TABLE, join);
            qb.add_value_condition(
                Collection::full("resourceId"),
                CompareOperator::Equals,
                resource_id,
            );
        }
        Scope::Gid(gids) => {
            if gids.is_empty() {
                return Err(Error::Argument("empty gid scope".into()));
            }
            qb.add_value_list_condition(
                PimItem::full("gid"),
                CompareOperator::In,
                gids.iter().map(|gid| Value::from(gid.as_str())).collect(),
            );
        }
        Scope::Interval(begin, end) => {
            if end < begin {
                return Err(Error::Argument("invalid id interval".into()));
            }
            let mut range = Condition::new(LogicOperator::And);
            range.add_value_condition(PimItem::full("id"), CompareOperator::GreaterOrEqual, *begin);
            range.add_value_condition(PimItem::full("id"), CompareOperator::LessOrEqual, *end);
            qb.add_condition(range);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::DbInitializer;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        DbInitializer::new(&db).run().unwrap();
        db
    }

    fn seed_item(db: &Database) -> (Resource, Collection, PimItem) {
        let mut resource = Resource {
            name: "imap-account".into(),
            ..Default::default()
        };
        resource.insert(db).unwrap();
        let mut collection = Collection::new("inbox", resource.id);
        collection.insert(db).unwrap();
        let mime_type = MimeType::retrieve_or_insert(db, "message/rfc822").unwrap();
        let mut item = PimItem {
            collection_id: collection.id,
            mime_type_id: mime_type.id,
            datetime: Some(Utc::now()),
            atime: Some(Utc::now()),
            ..Default::default()
        };
        item.insert(db).unwrap();
        (resource, collection, item)
    }

    #[test]
    fn interning_is_idempotent() {
        let db = test_db();
        let first = Flag::retrieve_or_insert(&db, "\\SEEN").unwrap();
        let second = Flag::retrieve_or_insert(&db, "\\SEEN").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(Flag::retrieve_all(&db).unwrap().len(), 1);
    }

    #[test]
    fn item_crud_and_relations() {
        let db = test_db();
        let (_, collection, item) = seed_item(&db);
        assert!(item.id > 0);
        assert_eq!(item.collection(&db).unwrap().unwrap().id, collection.id);

        let flag = Flag::retrieve_or_insert(&db, "\\SEEN").unwrap();
        assert!(item.add_flag(&db, flag.id).unwrap());
        assert!(!item.add_flag(&db, flag.id).unwrap());
        assert_eq!(item.flags(&db).unwrap().len(), 1);
        assert!(item.remove_flag(&db, flag.id).unwrap());
        assert!(item.flags(&db).unwrap().is_empty());

        let tag_type = TagType::retrieve_or_insert(&db, "PLAIN").unwrap();
        let mut tag = Tag {
            gid: "gid-1".into(),
            type_id: tag_type.id,
            ..Default::default()
        };
        tag.insert(&db).unwrap();
        assert!(item.add_tag(&db, tag.id).unwrap());
        assert_eq!(item.tags(&db).unwrap()[0].gid, "gid-1");
    }

    #[test]
    fn collection_tree_and_attributes() {
        let db = test_db();
        let (resource, parent, _) = seed_item(&db);
        let mut child = Collection::new("archive", resource.id);
        child.parent_id = Some(parent.id);
        child.insert(&db).unwrap();

        let children = Collection::retrieve_children(&db, Some(parent.id)).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "archive");
        assert_eq!(child.parent(&db).unwrap().unwrap().id, parent.id);

        CollectionAttribute::store(&db, parent.id, b"ENTITYDISPLAY", b"Inbox").unwrap();
        CollectionAttribute::store(&db, parent.id, b"ENTITYDISPLAY", b"Posteingang").unwrap();
        let attributes = CollectionAttribute::retrieve_by_collection(&db, parent.id).unwrap();
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes[0].value, b"Posteingang");
    }

    #[test]
    fn cache_policy_roundtrips_through_columns() {
        let db = test_db();
        let (_, mut collection, _) = seed_item(&db);
        let policy = CachePolicy {
            inherit: false,
            local_parts: vec!["PLD:ENVELOPE".into(), "PLD:HEAD".into()],
            cache_timeout: 10,
            sync_on_demand: true,
        };
        collection.set_cache_policy(&policy);
        collection.update(&db).unwrap();
        let reloaded = Collection::retrieve_by_id(&db, collection.id).unwrap().unwrap();
        assert_eq!(reloaded.cache_policy(), policy);
    }

    #[test]
    fn scope_resolution() {
        let db = test_db();
        let (resource, _, item) = seed_item(&db);

        let mut qb = PimItem::select();
        scope_to_query(&crate::protocol::Scope::Uid(vec![item.id]), None, &mut qb).unwrap();
        assert_eq!(qb.query(&db).unwrap().len(), 1);

        let mut item_with_rid = PimItem::retrieve_by_id(&db, item.id).unwrap().unwrap();
        item_with_rid.remote_id = Some("RID-1".into());
        item_with_rid.update(&db).unwrap();

        let mut qb = PimItem::select();
        scope_to_query(
            &crate::protocol::Scope::Rid(vec!["RID-1".into()]),
            Some(resource.id),
            &mut qb,
        )
        .unwrap();
        assert_eq!(qb.query(&db).unwrap().len(), 1);

        let mut qb = PimItem::select();
        assert!(scope_to_query(
            &crate::protocol::Scope::Rid(vec!["RID-1".into()]),
            None,
            &mut qb
        )
        .is_err());

        let mut qb = PimItem::select();
        scope_to_query(&crate::protocol::Scope::Interval(1, 100), None, &mut qb).unwrap();
        assert_eq!(qb.query(&db).unwrap().len(), 1);
    }
}
