// Pimstore - a local PIM storage and coordination service
// Root library module

pub mod cache_cleaner;
pub mod config;
pub mod error;
pub mod handler;
pub mod item_retriever;
pub mod notification;
pub mod observability;
pub mod protocol;
pub mod resource_manager;
pub mod search;
pub mod server;
pub mod session;
pub mod storage;

// Re-export key types
pub use config::{Instance, ServerConfig};
pub use error::{Error, ErrorCode, Result};
pub use observability::{init_logging, init_logging_with_level};

pub use notification::{Notification, NotificationBus, NotificationCollector, NotificationKind};
pub use protocol::{
    CachePolicy, CommandKind, Frame, Message, Request, Response, Scope, Tristate,
    PROTOCOL_VERSION,
};
pub use server::{Server, ServerContext, ServiceLock};
pub use session::{serve_connection, Session, SessionState};
pub use storage::datastore::{DataStore, Transaction};
pub use storage::db::{Database, DbType, Value};
pub use storage::entities::{
    Collection, CollectionAttribute, Flag, MimeType, Part, PimItem, Relation, Resource, Tag,
    TagType,
};
pub use storage::part_helper::PartHelper;
pub use storage::query_builder::{CompareOperator, Condition, JoinType, QueryBuilder, SortOrder};
pub use storage::schema::DbInitializer;
