// Command handlers.
//
// Each handler receives the parsed command, the session's storage context
// and the shared server services, and returns the ordered responses for
// its request: zero or more streamed payloads followed by a terminal
// Done/Created, or an error which the session turns into the terminal
// failure response. Mutating handlers run inside a scoped transaction and
// leave nothing behind when they fail.

pub mod collections;
pub mod items;
pub mod relations;
pub mod search;
pub mod tags;

use std::sync::Arc;
use std::time::Duration;

use crate::protocol::Response;
use crate::resource_manager::ResourceManager;
use crate::search::SearchManager;
use crate::storage::datastore::DataStore;
use crate::storage::entities::Resource;
use crate::storage::part_helper::PartHelper;

/// Everything a handler may touch.
pub struct HandlerContext<'a> {
    pub store: &'a DataStore,
    pub part_helper: &'a PartHelper,
    pub resources: &'a Arc<ResourceManager>,
    pub search: &'a Arc<SearchManager>,
    /// Resource the session selected, when it is an agent.
    pub resource_context: Option<&'a Resource>,
    pub retrieval_timeout: Duration,
}

impl HandlerContext<'_> {
    pub fn resource_context_id(&self) -> Option<i64> {
        self.resource_context.map(|r| r.id)
    }
}

pub(crate) fn done(message: impl Into<String>) -> Vec<Response> {
    vec![Response::Done {
        message: message.into(),
    }]
}
