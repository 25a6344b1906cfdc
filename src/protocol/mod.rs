// Client protocol: framing, command taxonomy and message bodies.
//
// Every message on the wire is a 4-byte little-endian length followed by a
// 64-bit tag, a command byte and the command payload encoded through the
// shared data stream. The high bit of the command byte marks a response;
// tags are chosen by the client and echoed verbatim in every response to
// that request. Streamed commands emit intermediate responses and conclude
// with a terminal Done or Error response for the same tag.

pub mod datastream;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ErrorCode, Result};
use datastream as ds;
use datastream::Timestamp;

/// Protocol revision spoken by this server. Clients advertising anything
/// else are disconnected after the Hello exchange.
pub const PROTOCOL_VERSION: i32 = 55;

/// Upper bound on a single frame; guards the length prefix.
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

const RESPONSE_BIT: u8 = 0x80;

/// Part names starting with this prefix are payload parts, subject to
/// cache eviction; all other parts are attributes.
pub const PAYLOAD_PART_PREFIX: &str = "PLD:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    Hello = 1,
    Login = 2,
    Logout = 3,
    SelectResource = 4,

    FetchItems = 10,
    CreateItem = 11,
    ModifyItem = 12,
    DeleteItem = 13,
    MoveItems = 14,
    CopyItems = 15,
    LinkItems = 16,
    UnlinkItems = 17,

    FetchCollections = 30,
    CreateCollection = 31,
    ModifyCollection = 32,
    DeleteCollection = 33,
    MoveCollection = 34,
    CopyCollection = 35,
    CollectionStats = 36,

    FetchTags = 50,
    CreateTag = 51,
    ModifyTag = 52,
    DeleteTag = 53,

    FetchRelations = 60,
    ModifyRelation = 61,
    RemoveRelations = 62,

    StoreSearch = 70,
    SearchResult = 71,

    Subscribe = 80,
    Unsubscribe = 81,
    ChangeNotification = 82,

    Begin = 90,
    Commit = 91,
    Rollback = 92,
}

impl CommandKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        use CommandKind::*;
        Some(match raw {
            1 => Hello,
            2 => Login,
            3 => Logout,
            4 => SelectResource,
            10 => FetchItems,
            11 => CreateItem,
            12 => ModifyItem,
            13 => DeleteItem,
            14 => MoveItems,
            15 => CopyItems,
            16 => LinkItems,
            17 => UnlinkItems,
            30 => FetchCollections,
            31 => CreateCollection,
            32 => ModifyCollection,
            33 => DeleteCollection,
            34 => MoveCollection,
            35 => CopyCollection,
            36 => CollectionStats,
            50 => FetchTags,
            51 => CreateTag,
            52 => ModifyTag,
            53 => DeleteTag,
            60 => FetchRelations,
            61 => ModifyRelation,
            62 => RemoveRelations,
            70 => StoreSearch,
            71 => SearchResult,
            80 => Subscribe,
            81 => Unsubscribe,
            82 => ChangeNotification,
            90 => Begin,
            91 => Commit,
            92 => Rollback,
            _ => return None,
        })
    }
}

/// Compact identifier-set selection over items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Database ids.
    Uid(Vec<i64>),
    /// Remote identifiers, resolved in the caller's resource context.
    Rid(Vec<String>),
    /// Global identifiers.
    Gid(Vec<String>),
    /// Contiguous inclusive id interval.
    Interval(i64, i64),
}

impl Scope {
    pub fn is_empty(&self) -> bool {
        match self {
            Scope::Uid(ids) => ids.is_empty(),
            Scope::Rid(rids) => rids.is_empty(),
            Scope::Gid(gids) => gids.is_empty(),
            Scope::Interval(begin, end) => end < begin,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Scope::Uid(ids) => {
                ds::put_u8(buf, 0);
                ds::put_i64_list(buf, ids);
            }
            Scope::Rid(rids) => {
                ds::put_u8(buf, 1);
                ds::put_string_list(buf, rids);
            }
            Scope::Gid(gids) => {
                ds::put_u8(buf, 2);
                ds::put_string_list(buf, gids);
            }
            Scope::Interval(begin, end) => {
                ds::put_u8(buf, 3);
                ds::put_i64(buf, *begin);
                ds::put_i64(buf, *end);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        match ds::get_u8(buf)? {
            0 => Ok(Scope::Uid(ds::get_i64_list(buf)?)),
            1 => Ok(Scope::Rid(ds::get_string_list(buf)?)),
            2 => Ok(Scope::Gid(ds::get_string_list(buf)?)),
            3 => Ok(Scope::Interval(ds::get_i64(buf)?, ds::get_i64(buf)?)),
            other => Err(Error::Protocol(format!("unknown scope selector {other}"))),
        }
    }
}

/// Per-collection caching rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    /// Resolve the effective policy from the parent chain instead.
    pub inherit: bool,
    /// Part names kept locally regardless of expiry; "ALL" disables eviction.
    pub local_parts: Vec<String>,
    /// Minutes until an unused payload part may be evicted; negative keeps
    /// everything forever.
    pub cache_timeout: i32,
    pub sync_on_demand: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            inherit: true,
            local_parts: Vec::new(),
            cache_timeout: -1,
            sync_on_demand: false,
        }
    }
}

impl CachePolicy {
    fn encode(&self, buf: &mut BytesMut) {
        ds::put_bool(buf, self.inherit);
        ds::put_string_list(buf, &self.local_parts);
        ds::put_i32(buf, self.cache_timeout);
        ds::put_bool(buf, self.sync_on_demand);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            inherit: ds::get_bool(buf)?,
            local_parts: ds::get_string_list(buf)?,
            cache_timeout: ds::get_i32(buf)?,
            sync_on_demand: ds::get_bool(buf)?,
        })
    }
}

/// Tri-state collection preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Tristate {
    True = 0,
    False = 1,
    #[default]
    Undefined = 2,
}

impl Tristate {
    pub fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Tristate::True),
            1 => Ok(Tristate::False),
            2 => Ok(Tristate::Undefined),
            other => Err(Error::Protocol(format!("invalid tristate {other}"))),
        }
    }

    /// Resolves Undefined against a fallback, typically the collection's
    /// enabled flag.
    pub fn resolve(self, fallback: bool) -> bool {
        match self {
            Tristate::True => true,
            Tristate::False => false,
            Tristate::Undefined => fallback,
        }
    }
}

/// A named payload carried in item commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartData {
    pub name: String,
    pub data: Vec<u8>,
}

impl PartData {
    fn encode(&self, buf: &mut BytesMut) {
        ds::put_string(buf, &self.name);
        ds::put_bytes(buf, &self.data);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            name: ds::get_string(buf)?,
            data: ds::get_bytes(buf)?,
        })
    }
}

fn put_part_list(buf: &mut BytesMut, parts: &[PartData]) {
    ds::put_u32(buf, parts.len() as u32);
    for part in parts {
        part.encode(buf);
    }
}

fn get_part_list(buf: &mut Bytes) -> Result<Vec<PartData>> {
    let count = ds::get_u32(buf)? as usize;
    let mut parts = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        parts.push(PartData::decode(buf)?);
    }
    Ok(parts)
}

fn put_opt_i64(buf: &mut BytesMut, value: Option<i64>) {
    match value {
        Some(v) => {
            ds::put_bool(buf, true);
            ds::put_i64(buf, v);
        }
        None => ds::put_bool(buf, false),
    }
}

fn get_opt_i64(buf: &mut Bytes) -> Result<Option<i64>> {
    if ds::get_bool(buf)? {
        Ok(Some(ds::get_i64(buf)?))
    } else {
        Ok(None)
    }
}

fn put_opt_string_field(buf: &mut BytesMut, value: &Option<String>) {
    ds::put_opt_string(buf, value.as_deref());
}

/// Which collections a fetch enumerates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionSelector {
    /// Explicit collection ids.
    Ids(Vec<i64>),
    /// Direct children of the given collection, 0 meaning the roots.
    Children(i64),
    /// Every collection of the named resource.
    Resource(String),
}

impl CollectionSelector {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            CollectionSelector::Ids(ids) => {
                ds::put_u8(buf, 0);
                ds::put_i64_list(buf, ids);
            }
            CollectionSelector::Children(parent) => {
                ds::put_u8(buf, 1);
                ds::put_i64(buf, *parent);
            }
            CollectionSelector::Resource(name) => {
                ds::put_u8(buf, 2);
                ds::put_string(buf, name);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        match ds::get_u8(buf)? {
            0 => Ok(CollectionSelector::Ids(ds::get_i64_list(buf)?)),
            1 => Ok(CollectionSelector::Children(ds::get_i64(buf)?)),
            2 => Ok(CollectionSelector::Resource(ds::get_string(buf)?)),
            other => Err(Error::Protocol(format!(
                "unknown collection selector {other}"
            ))),
        }
    }
}

/// Subscription filter for change notifications. Empty sets match all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub kinds: Vec<u8>,
    pub collections: Vec<i64>,
    pub items: Vec<i64>,
    pub resources: Vec<i64>,
    /// Suppress notifications caused by this session itself.
    pub ignore_own: bool,
}

impl SubscriptionFilter {
    fn encode(&self, buf: &mut BytesMut) {
        ds::put_u32(buf, self.kinds.len() as u32);
        for kind in &self.kinds {
            ds::put_u8(buf, *kind);
        }
        ds::put_i64_list(buf, &self.collections);
        ds::put_i64_list(buf, &self.items);
        ds::put_i64_list(buf, &self.resources);
        ds::put_bool(buf, self.ignore_own);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let kind_count = ds::get_u32(buf)? as usize;
        let mut kinds = Vec::with_capacity(kind_count.min(64));
        for _ in 0..kind_count {
            kinds.push(ds::get_u8(buf)?);
        }
        Ok(Self {
            kinds,
            collections: ds::get_i64_list(buf)?,
            items: ds::get_i64_list(buf)?,
            resources: ds::get_i64_list(buf)?,
            ignore_own: ds::get_bool(buf)?,
        })
    }
}

/// Client-to-server commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Hello {
        protocol_version: i32,
    },
    Login {
        session_id: Vec<u8>,
    },
    Logout,
    SelectResource {
        name: String,
    },

    FetchItems {
        scope: Scope,
        parts: Vec<String>,
        full_payload: bool,
        /// Serve from the cache only, never trigger resource retrieval.
        cache_only: bool,
    },
    CreateItem {
        collection_id: i64,
        mime_type: String,
        remote_id: Option<String>,
        remote_revision: Option<String>,
        gid: Option<String>,
        flags: Vec<Vec<u8>>,
        tags: Vec<i64>,
        parts: Vec<PartData>,
    },
    ModifyItem {
        item_id: i64,
        /// Revision the client last saw; must match the stored row.
        revision: i32,
        remote_id: Option<String>,
        remote_revision: Option<String>,
        gid: Option<String>,
        flags_set: Option<Vec<Vec<u8>>>,
        flags_add: Vec<Vec<u8>>,
        flags_remove: Vec<Vec<u8>>,
        tags_set: Option<Vec<i64>>,
        parts: Vec<PartData>,
        /// Resources clear the dirty flag once a change is pushed upstream.
        clear_dirty: bool,
    },
    DeleteItem {
        scope: Scope,
    },
    MoveItems {
        scope: Scope,
        destination: i64,
    },
    CopyItems {
        scope: Scope,
        destination: i64,
    },
    LinkItems {
        scope: Scope,
        collection: i64,
    },
    UnlinkItems {
        scope: Scope,
        collection: i64,
    },

    FetchCollections {
        selector: CollectionSelector,
    },
    CreateCollection {
        parent_id: i64,
        name: String,
        remote_id: Option<String>,
        mime_types: Vec<String>,
        is_virtual: bool,
        attributes: Vec<(String, Vec<u8>)>,
        cache_policy: Option<CachePolicy>,
    },
    ModifyCollection {
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
    },
    DeleteCollection {
        collection_id: i64,
    },
    MoveCollection {
        collection_id: i64,
        destination: i64,
    },
    CopyCollection {
        collection_id: i64,
        destination: i64,
    },
    CollectionStats {
        collection_id: i64,
    },

    FetchTags {
        ids: Vec<i64>,
    },
    CreateTag {
        gid: Vec<u8>,
        tag_type: String,
        remote_id: Option<String>,
    },
    ModifyTag {
        tag_id: i64,
        tag_type: Option<String>,
        remote_id: Option<String>,
    },
    DeleteTag {
        tag_id: i64,
    },

    FetchRelations {
        left: Option<i64>,
        right: Option<i64>,
        relation_type: Option<String>,
    },
    ModifyRelation {
        left: i64,
        right: i64,
        relation_type: String,
        remote_id: Option<String>,
    },
    RemoveRelations {
        left: i64,
        right: i64,
        relation_type: Option<String>,
    },

    StoreSearch {
        name: String,
        query: String,
        language: String,
        mime_types: Vec<String>,
        collections: Vec<i64>,
    },
    SearchResult {
        search_id: i64,
        collection_id: i64,
        result_ids: Vec<i64>,
    },

    Subscribe {
        filter: SubscriptionFilter,
    },
    Unsubscribe,

    Begin,
    Commit,
    Rollback,
}

impl Request {
    pub fn kind(&self) -> CommandKind {
        use CommandKind as K;
        match self {
            Request::Hello { .. } => K::Hello,
            Request::Login { .. } => K::Login,
            Request::Logout => K::Logout,
            Request::SelectResource { .. } => K::SelectResource,
            Request::FetchItems { .. } => K::FetchItems,
            Request::CreateItem { .. } => K::CreateItem,
            Request::ModifyItem { .. } => K::ModifyItem,
            Request::DeleteItem { .. } => K::DeleteItem,
            Request::MoveItems { .. } => K::MoveItems,
            Request::CopyItems { .. } => K::CopyItems,
            Request::LinkItems { .. } => K::LinkItems,
            Request::UnlinkItems { .. } => K::UnlinkItems,
            Request::FetchCollections { .. } => K::FetchCollections,
            Request::CreateCollection { .. } => K::CreateCollection,
            Request::ModifyCollection { .. } => K::ModifyCollection,
            Request::DeleteCollection { .. } => K::DeleteCollection,
            Request::MoveCollection { .. } => K::MoveCollection,
            Request::CopyCollection { .. } => K::CopyCollection,
            Request::CollectionStats { .. } => K::CollectionStats,
            Request::FetchTags { .. } => K::FetchTags,
            Request::CreateTag { .. } => K::CreateTag,
            Request::ModifyTag { .. } => K::ModifyTag,
            Request::DeleteTag { .. } => K::DeleteTag,
            Request::FetchRelations { .. } => K::FetchRelations,
            Request::ModifyRelation { .. } => K::ModifyRelation,
            Request::RemoveRelations { .. } => K::RemoveRelations,
            Request::StoreSearch { .. } => K::StoreSearch,
            Request::SearchResult { .. } => K::SearchResult,
            Request::Subscribe { .. } => K::Subscribe,
            Request::Unsubscribe => K::Unsubscribe,
            Request::Begin => K::Begin,
            Request::Commit => K::Commit,
            Request::Rollback => K::Rollback,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Request::Hello { protocol_version } => ds::put_i32(buf, *protocol_version),
            Request::Login { session_id } => ds::put_bytes(buf, session_id),
            Request::Logout | Request::Unsubscribe => {}
            Request::SelectResource { name } => ds::put_string(buf, name),
            Request::FetchItems {
                scope,
                parts,
                full_payload,
                cache_only,
            } => {
                scope.encode(buf);
                ds::put_string_list(buf, parts);
                ds::put_bool(buf, *full_payload);
                ds::put_bool(buf, *cache_only);
            }
            Request::CreateItem {
                collection_id,
                mime_type,
                remote_id,
                remote_revision,
                gid,
                flags,
                tags,
                parts,
            } => {
                ds::put_i64(buf, *collection_id);
                ds::put_string(buf, mime_type);
                put_opt_string_field(buf, remote_id);
                put_opt_string_field(buf, remote_revision);
                put_opt_string_field(buf, gid);
                ds::put_bytes_list(buf, flags);
                ds::put_i64_list(buf, tags);
                put_part_list(buf, parts);
            }
            Request::ModifyItem {
                item_id,
                revision,
                remote_id,
                remote_revision,
                gid,
                flags_set,
                flags_add,
                flags_remove,
                tags_set,
                parts,
                clear_dirty,
            } => {
                ds::put_i64(buf, *item_id);
                ds::put_i32(buf, *revision);
                put_opt_string_field(buf, remote_id);
                put_opt_string_field(buf, remote_revision);
                put_opt_string_field(buf, gid);
                match flags_set {
                    Some(flags) => {
                        ds::put_bool(buf, true);
                        ds::put_bytes_list(buf, flags);
                    }
                    None => ds::put_bool(buf, false),
                }
                ds::put_bytes_list(buf, flags_add);
                ds::put_bytes_list(buf, flags_remove);
                match tags_set {
                    Some(tags) => {
                        ds::put_bool(buf, true);
                        ds::put_i64_list(buf, tags);
                    }
                    None => ds::put_bool(buf, false),
                }
                put_part_list(buf, parts);
                ds::put_bool(buf, *clear_dirty);
            }
            Request::DeleteItem { scope } => scope.encode(buf),
            Request::MoveItems { scope, destination }
            | Request::CopyItems { scope, destination } => {
                scope.encode(buf);
                ds::put_i64(buf, *destination);
            }
            Request::LinkItems { scope, collection }
            | Request::UnlinkItems { scope, collection } => {
                scope.encode(buf);
                ds::put_i64(buf, *collection);
            }
            Request::FetchCollections { selector } => selector.encode(buf),
            Request::CreateCollection {
                parent_id,
                name,
                remote_id,
                mime_types,
                is_virtual,
                attributes,
                cache_policy,
            } => {
                ds::put_i64(buf, *parent_id);
                ds::put_string(buf, name);
                put_opt_string_field(buf, remote_id);
                ds::put_string_list(buf, mime_types);
                ds::put_bool(buf, *is_virtual);
                ds::put_attribute_map(buf, attributes);
                match cache_policy {
                    Some(policy) => {
                        ds::put_bool(buf, true);
                        policy.encode(buf);
                    }
                    None => ds::put_bool(buf, false),
                }
            }
            Request::ModifyCollection {
                collection_id,
                name,
                remote_id,
                remote_revision,
                parent_id,
                mime_types,
                attributes_set,
                attributes_remove,
                cache_policy,
                enabled,
                referenced,
                display_pref,
                sync_pref,
                index_pref,
            } => {
                ds::put_i64(buf, *collection_id);
                put_opt_string_field(buf, name);
                put_opt_string_field(buf, remote_id);
                put_opt_string_field(buf, remote_revision);
                put_opt_i64(buf, *parent_id);
                match mime_types {
                    Some(types) => {
                        ds::put_bool(buf, true);
                        ds::put_string_list(buf, types);
                    }
                    None => ds::put_bool(buf, false),
                }
                ds::put_attribute_map(
                    buf,
                    &attributes_set
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<Vec<_>>(),
                );
                ds::put_string_list(buf, attributes_remove);
                match cache_policy {
                    Some(policy) => {
                        ds::put_bool(buf, true);
                        policy.encode(buf);
                    }
                    None => ds::put_bool(buf, false),
                }
                put_opt_tristate_bool(buf, *enabled);
                put_opt_tristate_bool(buf, *referenced);
                put_opt_tristate(buf, *display_pref);
                put_opt_tristate(buf, *sync_pref);
                put_opt_tristate(buf, *index_pref);
            }
            Request::DeleteCollection { collection_id }
            | Request::CollectionStats { collection_id } => ds::put_i64(buf, *collection_id),
            Request::MoveCollection {
                collection_id,
                destination,
            }
            | Request::CopyCollection {
                collection_id,
                destination,
            } => {
                ds::put_i64(buf, *collection_id);
                ds::put_i64(buf, *destination);
            }
            Request::FetchTags { ids } => ds::put_i64_list(buf, ids),
            Request::CreateTag {
                gid,
                tag_type,
                remote_id,
            } => {
                ds::put_bytes(buf, gid);
                ds::put_string(buf, tag_type);
                put_opt_string_field(buf, remote_id);
            }
            Request::ModifyTag {
                tag_id,
                tag_type,
                remote_id,
            } => {
                ds::put_i64(buf, *tag_id);
                put_opt_string_field(buf, tag_type);
                put_opt_string_field(buf, remote_id);
            }
            Request::DeleteTag { tag_id } => ds::put_i64(buf, *tag_id),
            Request::FetchRelations {
                left,
                right,
                relation_type,
            } => {
                put_opt_i64(buf, *left);
                put_opt_i64(buf, *right);
                put_opt_string_field(buf, relation_type);
            }
            Request::ModifyRelation {
                left,
                right,
                relation_type,
                remote_id,
            } => {
                ds::put_i64(buf, *left);
                ds::put_i64(buf, *right);
                ds::put_string(buf, relation_type);
                put_opt_string_field(buf, remote_id);
            }
            Request::RemoveRelations {
                left,
                right,
                relation_type,
            } => {
                ds::put_i64(buf, *left);
                ds::put_i64(buf, *right);
                put_opt_string_field(buf, relation_type);
            }
            Request::StoreSearch {
                name,
                query,
                language,
                mime_types,
                collections,
            } => {
                ds::put_string(buf, name);
                ds::put_string(buf, query);
                ds::put_string(buf, language);
                ds::put_string_list(buf, mime_types);
                ds::put_i64_list(buf, collections);
            }
            Request::SearchResult {
                search_id,
                collection_id,
                result_ids,
            } => {
                ds::put_i64(buf, *search_id);
                ds::put_i64(buf, *collection_id);
                ds::put_i64_list(buf, result_ids);
            }
            Request::Subscribe { filter } => filter.encode(buf),
            Request::Begin | Request::Commit | Request::Rollback => {}
        }
    }

    pub fn decode(kind: CommandKind, buf: &mut Bytes) -> Result<Self> {
        use CommandKind as K;
        Ok(match kind {
            K::Hello => Request::Hello {
                protocol_version: ds::get_i32(buf)?,
            },
            K::Login => Request::Login {
                session_id: ds::get_bytes(buf)?,
            },
            K::Logout => Request::Logout,
            K::SelectResource => Request::SelectResource {
                name: ds::get_string(buf)?,
            },
            K::FetchItems => Request::FetchItems {
                scope: Scope::decode(buf)?,
                parts: ds::get_string_list(buf)?,
                full_payload: ds::get_bool(buf)?,
                cache_only: ds::get_bool(buf)?,
            },
            K::CreateItem => Request::CreateItem {
                collection_id: ds::get_i64(buf)?,
                mime_type: ds::get_string(buf)?,
                remote_id: ds::get_opt_string(buf)?,
                remote_revision: ds::get_opt_string(buf)?,
                gid: ds::get_opt_string(buf)?,
                flags: ds::get_bytes_list(buf)?,
                tags: ds::get_i64_list(buf)?,
                parts: get_part_list(buf)?,
            },
            K::ModifyItem => Request::ModifyItem {
                item_id: ds::get_i64(buf)?,
                revision: ds::get_i32(buf)?,
                remote_id: ds::get_opt_string(buf)?,
                remote_revision: ds::get_opt_string(buf)?,
                gid: ds::get_opt_string(buf)?,
                flags_set: if ds::get_bool(buf)? {
                    Some(ds::get_bytes_list(buf)?)
                } else {
                    None
                },
                flags_add: ds::get_bytes_list(buf)?,
                flags_remove: ds::get_bytes_list(buf)?,
                tags_set: if ds::get_bool(buf)? {
                    Some(ds::get_i64_list(buf)?)
                } else {
                    None
                },
                parts: get_part_list(buf)?,
                clear_dirty: ds::get_bool(buf)?,
            },
            K::DeleteItem => Request::DeleteItem {
                scope: Scope::decode(buf)?,
            },
            K::MoveItems => Request::MoveItems {
                scope: Scope::decode(buf)?,
                destination: ds::get_i64(buf)?,
            },
            K::CopyItems => Request::CopyItems {
                scope: Scope::decode(buf)?,
                destination: ds::get_i64(buf)?,
            },
            K::LinkItems => Request::LinkItems {
                scope: Scope::decode(buf)?,
                collection: ds::get_i64(buf)?,
            },
            K::UnlinkItems => Request::UnlinkItems {
                scope: Scope::decode(buf)?,
                collection: ds::get_i64(buf)?,
            },
            K::FetchCollections => Request::FetchCollections {
                selector: CollectionSelector::decode(buf)?,
            },
            K::CreateCollection => Request::CreateCollection {
                parent_id: ds::get_i64(buf)?,
                name: ds::get_string(buf)?,
                remote_id: ds::get_opt_string(buf)?,
                mime_types: ds::get_string_list(buf)?,
                is_virtual: ds::get_bool(buf)?,
                attributes: ds::get_attribute_map(buf)?,
                cache_policy: if ds::get_bool(buf)? {
                    Some(CachePolicy::decode(buf)?)
                } else {
                    None
                },
            },
            K::ModifyCollection => Request::ModifyCollection {
                collection_id: ds::get_i64(buf)?,
                name: ds::get_opt_string(buf)?,
                remote_id: ds::get_opt_string(buf)?,
                remote_revision: ds::get_opt_string(buf)?,
                parent_id: get_opt_i64(buf)?,
                mime_types: if ds::get_bool(buf)? {
                    Some(ds::get_string_list(buf)?)
                } else {
                    None
                },
                attributes_set: ds::get_attribute_map(buf)?,
                attributes_remove: ds::get_string_list(buf)?,
                cache_policy: if ds::get_bool(buf)? {
                    Some(CachePolicy::decode(buf)?)
                } else {
                    None
                },
                enabled: get_opt_tristate_bool(buf)?,
                referenced: get_opt_tristate_bool(buf)?,
                display_pref: get_opt_tristate(buf)?,
                sync_pref: get_opt_tristate(buf)?,
                index_pref: get_opt_tristate(buf)?,
            },
            K::DeleteCollection => Request::DeleteCollection {
                collection_id: ds::get_i64(buf)?,
            },
            K::MoveCollection => Request::MoveCollection {
                collection_id: ds::get_i64(buf)?,
                destination: ds::get_i64(buf)?,
            },
            K::CopyCollection => Request::CopyCollection {
                collection_id: ds::get_i64(buf)?,
                destination: ds::get_i64(buf)?,
            },
            K::CollectionStats => Request::CollectionStats {
                collection_id: ds::get_i64(buf)?,
            },
            K::FetchTags => Request::FetchTags {
                ids: ds::get_i64_list(buf)?,
            },
            K::CreateTag => Request::CreateTag {
                gid: ds::get_bytes(buf)?,
                tag_type: ds::get_string(buf)?,
                remote_id: ds::get_opt_string(buf)?,
            },
            K::ModifyTag => Request::ModifyTag {
                tag_id: ds::get_i64(buf)?,
                tag_type: ds::get_opt_string(buf)?,
                remote_id: ds::get_opt_string(buf)?,
            },
            K::DeleteTag => Request::DeleteTag {
                tag_id: ds::get_i64(buf)?,
            },
            K::FetchRelations => Request::FetchRelations {
                left: get_opt_i64(buf)?,
                right: get_opt_i64(buf)?,
                relation_type: ds::get_opt_string(buf)?,
            },
            K::ModifyRelation => Request::ModifyRelation {
                left: ds::get_i64(buf)?,
                right: ds::get_i64(buf)?,
                relation_type: ds::get_string(buf)?,
                remote_id: ds::get_opt_string(buf)?,
            },
            K::RemoveRelations => Request::RemoveRelations {
                left: ds::get_i64(buf)?,
                right: ds::get_i64(buf)?,
                relation_type: ds::get_opt_string(buf)?,
            },
            K::StoreSearch => Request::StoreSearch {
                name: ds::get_string(buf)?,
                query: ds::get_string(buf)?,
                language: ds::get_string(buf)?,
                mime_types: ds::get_string_list(buf)?,
                collections: ds::get_i64_list(buf)?,
            },
            K::SearchResult => Request::SearchResult {
                search_id: ds::get_i64(buf)?,
                collection_id: ds::get_i64(buf)?,
                result_ids: ds::get_i64_list(buf)?,
            },
            K::Subscribe => Request::Subscribe {
                filter: SubscriptionFilter::decode(buf)?,
            },
            K::Unsubscribe => Request::Unsubscribe,
            K::Begin => Request::Begin,
            K::Commit => Request::Commit,
            K::Rollback => Request::Rollback,
            K::ChangeNotification => {
                return Err(Error::Protocol(
                    "ChangeNotification is server-push only".into(),
                ))
            }
        })
    }
}

fn put_opt_tristate_bool(buf: &mut BytesMut, value: Option<bool>) {
    match value {
        Some(v) => {
            ds::put_bool(buf, true);
            ds::put_bool(buf, v);
        }
        None => ds::put_bool(buf, false),
    }
}

fn get_opt_tristate_bool(buf: &mut Bytes) -> Result<Option<bool>> {
    if ds::get_bool(buf)? {
        Ok(Some(ds::get_bool(buf)?))
    } else {
        Ok(None)
    }
}

fn put_opt_tristate(buf: &mut BytesMut, value: Option<Tristate>) {
    match value {
        Some(v) => {
            ds::put_bool(buf, true);
            ds::put_u8(buf, v as u8);
        }
        None => ds::put_bool(buf, false),
    }
}

fn get_opt_tristate(buf: &mut Bytes) -> Result<Option<Tristate>> {
    if ds::get_bool(buf)? {
        Ok(Some(Tristate::from_u8(ds::get_u8(buf)?)?))
    } else {
        Ok(None)
    }
}

/// One fetched item, streamed ahead of the terminal response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedItem {
    pub id: i64,
    pub revision: i32,
    pub collection_id: i64,
    pub mime_type: String,
    pub remote_id: Option<String>,
    pub remote_revision: Option<String>,
    pub gid: Option<String>,
    pub size: i64,
    pub datetime: Option<Timestamp>,
    pub flags: Vec<Vec<u8>>,
    pub tags: Vec<i64>,
    pub parts: Vec<PartData>,
    /// Requested parts that could not be retrieved from the resource.
    pub missing_parts: Vec<String>,
}

impl FetchedItem {
    fn encode(&self, buf: &mut BytesMut) {
        ds::put_i64(buf, self.id);
        ds::put_i32(buf, self.revision);
        ds::put_i64(buf, self.collection_id);
        ds::put_string(buf, &self.mime_type);
        ds::put_opt_string(buf, self.remote_id.as_deref());
        ds::put_opt_string(buf, self.remote_revision.as_deref());
        ds::put_opt_string(buf, self.gid.as_deref());
        ds::put_i64(buf, self.size);
        match &self.datetime {
            Some(ts) => {
                ds::put_bool(buf, true);
                ds::put_datetime(buf, ts);
            }
            None => ds::put_bool(buf, false),
        }
        ds::put_bytes_list(buf, &self.flags);
        ds::put_i64_list(buf, &self.tags);
        put_part_list(buf, &self.parts);
        ds::put_string_list(buf, &self.missing_parts);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            id: ds::get_i64(buf)?,
            revision: ds::get_i32(buf)?,
            collection_id: ds::get_i64(buf)?,
            mime_type: ds::get_string(buf)?,
            remote_id: ds::get_opt_string(buf)?,
            remote_revision: ds::get_opt_string(buf)?,
            gid: ds::get_opt_string(buf)?,
            size: ds::get_i64(buf)?,
            datetime: if ds::get_bool(buf)? {
                Some(ds::get_datetime(buf)?)
            } else {
                None
            },
            flags: ds::get_bytes_list(buf)?,
            tags: ds::get_i64_list(buf)?,
            parts: get_part_list(buf)?,
            missing_parts: ds::get_string_list(buf)?,
        })
    }
}

/// One fetched collection, streamed ahead of the terminal response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedCollection {
    pub id: i64,
    pub parent_id: i64,
    pub name: String,
    pub remote_id: Option<String>,
    pub remote_revision: Option<String>,
    pub resource: String,
    pub mime_types: Vec<String>,
    pub is_virtual: bool,
    pub enabled: bool,
    pub referenced: bool,
    pub display_pref: Tristate,
    pub sync_pref: Tristate,
    pub index_pref: Tristate,
    pub cache_policy: CachePolicy,
    pub attributes: Vec<(String, Vec<u8>)>,
}

impl FetchedCollection {
    fn encode(&self, buf: &mut BytesMut) {
        ds::put_i64(buf, self.id);
        ds::put_i64(buf, self.parent_id);
        ds::put_string(buf, &self.name);
        ds::put_opt_string(buf, self.remote_id.as_deref());
        ds::put_opt_string(buf, self.remote_revision.as_deref());
        ds::put_string(buf, &self.resource);
        ds::put_string_list(buf, &self.mime_types);
        ds::put_bool(buf, self.is_virtual);
        ds::put_bool(buf, self.enabled);
        ds::put_bool(buf, self.referenced);
        ds::put_u8(buf, self.display_pref as u8);
        ds::put_u8(buf, self.sync_pref as u8);
        ds::put_u8(buf, self.index_pref as u8);
        self.cache_policy.encode(buf);
        ds::put_attribute_map(buf, &self.attributes);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            id: ds::get_i64(buf)?,
            parent_id: ds::get_i64(buf)?,
            name: ds::get_string(buf)?,
            remote_id: ds::get_opt_string(buf)?,
            remote_revision: ds::get_opt_string(buf)?,
            resource: ds::get_string(buf)?,
            mime_types: ds::get_string_list(buf)?,
            is_virtual: ds::get_bool(buf)?,
            enabled: ds::get_bool(buf)?,
            referenced: ds::get_bool(buf)?,
            display_pref: Tristate::from_u8(ds::get_u8(buf)?)?,
            sync_pref: Tristate::from_u8(ds::get_u8(buf)?)?,
            index_pref: Tristate::from_u8(ds::get_u8(buf)?)?,
            cache_policy: CachePolicy::decode(buf)?,
            attributes: ds::get_attribute_map(buf)?,
        })
    }
}

/// Server-to-client messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Hello {
        server_name: String,
        message: String,
        protocol_version: i32,
    },
    /// Terminal success for a request.
    Done {
        message: String,
    },
    /// Terminal failure for a request.
    Error {
        code: ErrorCode,
        message: String,
    },
    /// Entity created; carries the fresh id.
    Created {
        id: i64,
    },
    Item(Box<FetchedItem>),
    Collection(Box<FetchedCollection>),
    CollectionStats {
        count: i64,
        size: i64,
    },
    Tag {
        id: i64,
        gid: Vec<u8>,
        tag_type: String,
        remote_id: Option<String>,
    },
    Relation {
        left: i64,
        right: i64,
        relation_type: String,
        remote_id: Option<String>,
    },
    /// Server-push change notification batch (tag 0).
    ChangeNotification {
        payload: Vec<u8>,
    },
}

const RESP_HELLO: u8 = 1;
const RESP_DONE: u8 = 2;
const RESP_ERROR: u8 = 3;
const RESP_CREATED: u8 = 4;
const RESP_ITEM: u8 = 5;
const RESP_COLLECTION: u8 = 6;
const RESP_COLLECTION_STATS: u8 = 7;
const RESP_TAG: u8 = 8;
const RESP_RELATION: u8 = 9;
const RESP_NOTIFICATION: u8 = 10;

impl Response {
    fn discriminator(&self) -> u8 {
        match self {
            Response::Hello { .. } => RESP_HELLO,
            Response::Done { .. } => RESP_DONE,
            Response::Error { .. } => RESP_ERROR,
            Response::Created { .. } => RESP_CREATED,
            Response::Item(_) => RESP_ITEM,
            Response::Collection(_) => RESP_COLLECTION,
            Response::CollectionStats { .. } => RESP_COLLECTION_STATS,
            Response::Tag { .. } => RESP_TAG,
            Response::Relation { .. } => RESP_RELATION,
            Response::ChangeNotification { .. } => RESP_NOTIFICATION,
        }
    }

    /// Whether this response concludes its request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Response::Done { .. }
                | Response::Error { .. }
                | Response::Created { .. }
                | Response::Hello { .. }
        )
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        ds::put_u8(buf, self.discriminator());
        match self {
            Response::Hello {
                server_name,
                message,
                protocol_version,
            } => {
                ds::put_string(buf, server_name);
                ds::put_string(buf, message);
                ds::put_i32(buf, *protocol_version);
            }
            Response::Done { message } => ds::put_string(buf, message),
            Response::Error { code, message } => {
                ds::put_u8(buf, *code as u8);
                ds::put_string(buf, message);
            }
            Response::Created { id } => ds::put_i64(buf, *id),
            Response::Item(item) => item.encode(buf),
            Response::Collection(collection) => collection.encode(buf),
            Response::CollectionStats { count, size } => {
                ds::put_i64(buf, *count);
                ds::put_i64(buf, *size);
            }
            Response::Tag {
                id,
                gid,
                tag_type,
                remote_id,
            } => {
                ds::put_i64(buf, *id);
                ds::put_bytes(buf, gid);
                ds::put_string(buf, tag_type);
                ds::put_opt_string(buf, remote_id.as_deref());
            }
            Response::Relation {
                left,
                right,
                relation_type,
                remote_id,
            } => {
                ds::put_i64(buf, *left);
                ds::put_i64(buf, *right);
                ds::put_string(buf, relation_type);
                ds::put_opt_string(buf, remote_id.as_deref());
            }
            Response::ChangeNotification { payload } => ds::put_bytes(buf, payload),
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(match ds::get_u8(buf)? {
            RESP_HELLO => Response::Hello {
                server_name: ds::get_string(buf)?,
                message: ds::get_string(buf)?,
                protocol_version: ds::get_i32(buf)?,
            },
            RESP_DONE => Response::Done {
                message: ds::get_string(buf)?,
            },
            RESP_ERROR => {
                let raw = ds::get_u8(buf)?;
                Response::Error {
                    code: ErrorCode::from_u8(raw)
                        .ok_or_else(|| Error::Protocol(format!("unknown error code {raw}")))?,
                    message: ds::get_string(buf)?,
                }
            }
            RESP_CREATED => Response::Created {
                id: ds::get_i64(buf)?,
            },
            RESP_ITEM => Response::Item(Box::new(FetchedItem::decode(buf)?)),
            RESP_COLLECTION => Response::Collection(Box::new(FetchedCollection::decode(buf)?)),
            RESP_COLLECTION_STATS => Response::CollectionStats {
                count: ds::get_i64(buf)?,
                size: ds::get_i64(buf)?,
            },
            RESP_TAG => Response::Tag {
                id: ds::get_i64(buf)?,
                gid: ds::get_bytes(buf)?,
                tag_type: ds::get_string(buf)?,
                remote_id: ds::get_opt_string(buf)?,
            },
            RESP_RELATION => Response::Relation {
                left: ds::get_i64(buf)?,
                right: ds::get_i64(buf)?,
                relation_type: ds::get_string(buf)?,
                remote_id: ds::get_opt_string(buf)?,
            },
            RESP_NOTIFICATION => Response::ChangeNotification {
                payload: ds::get_bytes(buf)?,
            },
            other => return Err(Error::Protocol(format!("unknown response kind {other}"))),
        })
    }
}

/// One framed message in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(CommandKind, Request),
    Response(CommandKind, Response),
}

/// A tagged frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub tag: u64,
    pub message: Message,
}

impl Frame {
    pub fn request(tag: u64, request: Request) -> Self {
        let kind = request.kind();
        Frame {
            tag,
            message: Message::Request(kind, request),
        }
    }

    pub fn response(tag: u64, kind: CommandKind, response: Response) -> Self {
        Frame {
            tag,
            message: Message::Response(kind, response),
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(64);
        match &self.message {
            Message::Request(kind, request) => {
                ds::put_u64(&mut body, self.tag);
                ds::put_u8(&mut body, *kind as u8);
                request.encode(&mut body);
            }
            Message::Response(kind, response) => {
                ds::put_u64(&mut body, self.tag);
                ds::put_u8(&mut body, *kind as u8 | RESPONSE_BIT);
                response.encode(&mut body);
            }
        }
        let mut framed = BytesMut::with_capacity(body.len() + 4);
        ds::put_u32(&mut framed, body.len() as u32);
        framed.extend_from_slice(&body);
        framed
    }

    pub fn decode_body(mut body: Bytes) -> Result<Self> {
        let tag = ds::get_u64(&mut body)?;
        let raw_kind = ds::get_u8(&mut body)?;
        let is_response = raw_kind & RESPONSE_BIT != 0;
        let kind = CommandKind::from_u8(raw_kind & !RESPONSE_BIT)
            .ok_or_else(|| Error::Protocol(format!("unknown command kind {raw_kind:#x}")))?;
        let message = if is_response {
            Message::Response(kind, Response::decode(&mut body)?)
        } else {
            Message::Request(kind, Request::decode(kind, &mut body)?)
        };
        if !body.is_empty() {
            return Err(Error::Protocol(format!(
                "{} trailing bytes after command payload",
                body.len()
            )));
        }
        Ok(Frame { tag, message })
    }
}

/// Reads one frame; returns `None` on clean end-of-stream before the
/// length prefix.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Protocol(format!("read failed: {e}"))),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("oversized frame: {len} bytes")));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::Protocol(format!("truncated frame: {e}")))?;
    Frame::decode_body(Bytes::from(body)).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = frame.encode();
    writer
        .write_all(&encoded)
        .await
        .map_err(|e| Error::Protocol(format!("write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Protocol(format!("flush failed: {e}")))?;
    Ok(())
}
