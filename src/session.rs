// Per-connection session: state machine, frame loop and command dispatch.
//
// A session owns its database connection and drives three event sources:
// frames from the client, notification batches from the bus, and (for
// agent sessions) retrieval requests addressed to the selected resource.
// Responses for one request always go out before the terminal response of
// the next; notifications interleave between requests, never inside one.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result as AnyResult;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{error_to_response, Error};
use crate::handler::{self, HandlerContext};
use crate::notification::{encode_batch, Notification};
use crate::protocol::{
    read_frame, write_frame, CommandKind, Frame, Message, Request, Response, Scope,
    PROTOCOL_VERSION,
};
use crate::resource_manager::{FetchItemsResult, ResourceRequest};
use crate::server::ServerContext;
use crate::storage::datastore::DataStore;
use crate::storage::entities::Resource;
use crate::storage::part_helper::PartHelper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NonAuthenticated,
    Authenticated,
    Selected,
    LoggedOut,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::NonAuthenticated => "NonAuthenticated",
            SessionState::Authenticated => "Authenticated",
            SessionState::Selected => "Selected",
            SessionState::LoggedOut => "LoggedOut",
        };
        write!(f, "{name}")
    }
}

/// Server-push frames (notifications, agent requests) carry this tag.
const PUSH_TAG: u64 = 0;

/// Tags for server-initiated requests to agents live above this bound so
/// they never collide with client-chosen tags echoed in responses.
const SERVER_TAG_BASE: u64 = 1 << 63;

enum PendingAgentReply {
    Fetch(oneshot::Sender<FetchItemsResult>),
    Search(oneshot::Sender<Result<Vec<i64>, String>>),
}

/// What the frame handler asks the run loop to do afterwards.
enum SessionEvent {
    Continue,
    Close,
    Subscribed,
    Unsubscribed,
    SelectedResource(i64),
}

enum Input {
    Frame(Option<Frame>),
    Notifications(Arc<Vec<Notification>>),
    AgentRequest(ResourceRequest),
}

pub struct Session {
    context: Arc<ServerContext>,
    store: DataStore,
    part_helper: PartHelper,
    state: SessionState,
    hello_done: bool,
    session_id: Vec<u8>,
    resource_context: Option<Resource>,
    subscriber_id: Option<u64>,
    /// Receiver created by Subscribe, picked up by the run loop.
    pending_receiver: Option<mpsc::Receiver<Arc<Vec<Notification>>>>,
    next_server_tag: u64,
    pending_agent_replies: HashMap<u64, PendingAgentReply>,
}

impl Session {
    pub fn new(context: Arc<ServerContext>) -> AnyResult<Self> {
        let store = context.open_store(Vec::new())?;
        let part_helper = context.part_helper();
        Ok(Self {
            context,
            store,
            part_helper,
            state: SessionState::NonAuthenticated,
            hello_done: false,
            session_id: Vec::new(),
            resource_context: None,
            subscriber_id: None,
            pending_receiver: None,
            next_server_tag: SERVER_TAG_BASE,
            pending_agent_replies: HashMap::new(),
        })
    }

    /// Drives the session until the client disconnects or logs out.
    pub async fn run<S>(mut self, stream: S) -> AnyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut notif_rx: Option<mpsc::Receiver<Arc<Vec<Notification>>>> = None;
        let mut agent_rx: Option<mpsc::Receiver<ResourceRequest>> = None;

        loop {
            let input = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(frame) => Input::Frame(frame),
                        Err(e) => {
                            // corrupt framing: the stream cannot recover
                            warn!(error = %e, "protocol error, closing connection");
                            break;
                        }
                    }
                }
                Some(batch) = recv_opt(&mut notif_rx) => Input::Notifications(batch),
                Some(request) = recv_opt(&mut agent_rx) => Input::AgentRequest(request),
            };

            match input {
                Input::Frame(None) => break,
                Input::Frame(Some(frame)) => {
                    match self.handle_frame(frame, &mut writer).await? {
                        SessionEvent::Continue => {}
                        SessionEvent::Close => break,
                        SessionEvent::Subscribed => {
                            // receiver was parked in the session by the handler
                            notif_rx = self.take_pending_receiver();
                        }
                        SessionEvent::Unsubscribed => {
                            notif_rx = None;
                        }
                        SessionEvent::SelectedResource(resource_id) => {
                            agent_rx = Some(self.context.resources.register(resource_id));
                            self.replay_spooled(resource_id, &mut writer).await?;
                        }
                    }
                }
                Input::Notifications(batch) => {
                    let frame = Frame::response(
                        PUSH_TAG,
                        CommandKind::ChangeNotification,
                        Response::ChangeNotification {
                            payload: encode_batch(&batch),
                        },
                    );
                    write_frame(&mut writer, &frame).await?;
                }
                Input::AgentRequest(request) => {
                    self.forward_agent_request(request, &mut writer).await?;
                }
            }
        }

        self.teardown();
        Ok(())
    }

    /// Client went away or logged out: abort any open transaction, drop the
    /// subscription and free the resource channel.
    fn teardown(&mut self) {
        if self.store.in_transaction() {
            if let Err(e) = self.store.rollback_transaction() {
                warn!(error = %e, "rollback on disconnect failed");
            }
        }
        if let Some(id) = self.subscriber_id.take() {
            self.context.bus.unsubscribe(id);
        }
        if let Some(resource) = &self.resource_context {
            self.context.resources.unregister(resource.id);
        }
        self.pending_agent_replies.clear();
        info!(session = %String::from_utf8_lossy(&self.session_id), "session closed");
    }

    fn handler_context(&self) -> HandlerContext<'_> {
        HandlerContext {
            store: &self.store,
            part_helper: &self.part_helper,
            resources: &self.context.resources,
            search: &self.context.search,
            resource_context: self.resource_context.as_ref(),
            retrieval_timeout: self.context.retrieval_timeout(),
        }
    }

    fn check_state(&self, kind: CommandKind) -> Result<(), Error> {
        use CommandKind as K;
        let allowed = match kind {
            K::Hello => self.state == SessionState::NonAuthenticated && !self.hello_done,
            K::Login => self.state == SessionState::NonAuthenticated && self.hello_done,
            K::Logout => self.state != SessionState::LoggedOut,
            K::SelectResource => {
                matches!(self.state, SessionState::Authenticated | SessionState::Selected)
            }
            _ => matches!(self.state, SessionState::Authenticated | SessionState::Selected),
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::InvalidState {
                command: format!("{kind:?}"),
                state: self.state.to_string(),
            })
        }
    }

    async fn handle_frame<S>(
        &mut self,
        frame: Frame,
        writer: &mut WriteHalf<S>,
    ) -> AnyResult<SessionEvent>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let tag = frame.tag;
        let (kind, request) = match frame.message {
            Message::Request(kind, request) => (kind, request),
            Message::Response(kind, response) => {
                self.handle_agent_response(tag, kind, response);
                return Ok(SessionEvent::Continue);
            }
        };

        if let Err(e) = self.check_state(kind) {
            let close = matches!(kind, CommandKind::Hello | CommandKind::Login);
            self.write_error(writer, tag, kind, &anyhow::Error::new(e)).await?;
            return Ok(if close {
                SessionEvent::Close
            } else {
                SessionEvent::Continue
            });
        }

        match request {
            Request::Hello { protocol_version } => {
                self.hello_done = true;
                if protocol_version != PROTOCOL_VERSION {
                    let error = Error::UnsupportedVersion {
                        client: protocol_version,
                        server: PROTOCOL_VERSION,
                    };
                    self.write_error(writer, tag, kind, &anyhow::Error::new(error))
                        .await?;
                    return Ok(SessionEvent::Close);
                }
                let response = Response::Hello {
                    server_name: "pimstore".into(),
                    message: "Not really IMAP server".into(),
                    protocol_version: PROTOCOL_VERSION,
                };
                write_frame(writer, &Frame::response(tag, kind, response)).await?;
                Ok(SessionEvent::Continue)
            }
            Request::Login { session_id } => {
                if session_id.is_empty() {
                    let error = Error::Argument("missing session identifier".into());
                    self.write_error(writer, tag, kind, &anyhow::Error::new(error))
                        .await?;
                    return Ok(SessionEvent::Close);
                }
                self.session_id = session_id;
                self.store.set_session_id(self.session_id.clone());
                self.state = SessionState::Authenticated;
                debug!(session = %String::from_utf8_lossy(&self.session_id), "logged in");
                self.write_done(writer, tag, kind, "User logged in").await?;
                Ok(SessionEvent::Continue)
            }
            Request::Logout => {
                self.state = SessionState::LoggedOut;
                self.write_done(writer, tag, kind, "Bye").await?;
                Ok(SessionEvent::Close)
            }
            Request::SelectResource { name } => {
                match Resource::retrieve_by_name(self.store.db(), &name) {
                    Ok(Some(resource)) => {
                        let resource_id = resource.id;
                        self.resource_context = Some(resource);
                        self.state = SessionState::Selected;
                        self.write_done(writer, tag, kind, "Resource selected").await?;
                        Ok(SessionEvent::SelectedResource(resource_id))
                    }
                    Ok(None) => {
                        let error = Error::Argument(format!("unknown resource {name}"));
                        self.write_error(writer, tag, kind, &anyhow::Error::new(error))
                            .await?;
                        Ok(SessionEvent::Continue)
                    }
                    Err(e) => {
                        self.write_error(writer, tag, kind, &anyhow::Error::new(e)).await?;
                        Ok(SessionEvent::Continue)
                    }
                }
            }
            Request::Subscribe { filter } => {
                if let Some(id) = self.subscriber_id.take() {
                    self.context.bus.unsubscribe(id);
                }
                let (id, receiver) = self
                    .context
                    .bus
                    .subscribe(self.session_id.clone(), filter);
                self.subscriber_id = Some(id);
                self.pending_receiver = Some(receiver);
                self.write_done(writer, tag, kind, "Subscribed").await?;
                Ok(SessionEvent::Subscribed)
            }
            Request::Unsubscribe => {
                if let Some(id) = self.subscriber_id.take() {
                    self.context.bus.unsubscribe(id);
                }
                self.write_done(writer, tag, kind, "Unsubscribed").await?;
                Ok(SessionEvent::Unsubscribed)
            }
            Request::Begin => {
                match self.store.begin_transaction() {
                    Ok(()) => self.write_done(writer, tag, kind, "Transaction started").await?,
                    Err(e) => {
                        self.write_error(writer, tag, kind, &anyhow::Error::new(e)).await?
                    }
                }
                Ok(SessionEvent::Continue)
            }
            Request::Commit => {
                match self.store.commit_transaction() {
                    Ok(()) => self.write_done(writer, tag, kind, "Transaction committed").await?,
                    Err(e) => {
                        self.write_error(writer, tag, kind, &anyhow::Error::new(e)).await?
                    }
                }
                Ok(SessionEvent::Continue)
            }
            Request::Rollback => {
                match self.store.rollback_transaction() {
                    Ok(()) => {
                        self.write_done(writer, tag, kind, "Transaction rolled back").await?
                    }
                    Err(e) => {
                        self.write_error(writer, tag, kind, &anyhow::Error::new(e)).await?
                    }
                }
                Ok(SessionEvent::Continue)
            }
            Request::SearchResult {
                search_id,
                collection_id,
                result_ids,
            } => {
                // either the reply to a server-issued agent search, or a
                // persistent-search membership update from a resource
                if let Some(PendingAgentReply::Search(reply)) =
                    self.pending_agent_replies.remove(&(search_id as u64))
                {
                    let _ = reply.send(Ok(result_ids));
                    self.write_done(writer, tag, kind, "SEARCH_RESULT complete").await?;
                } else {
                    let ctx = self.handler_context();
                    let result = handler::search::search_result(&ctx, collection_id, result_ids);
                    self.write_results(writer, tag, kind, result).await?;
                }
                Ok(SessionEvent::Continue)
            }
            other => {
                let result = self.execute(other).await;
                self.write_results(writer, tag, kind, result).await?;
                Ok(SessionEvent::Continue)
            }
        }
    }

    /// Dispatches the data-plane commands to their handlers.
    async fn execute(&self, request: Request) -> AnyResult<Vec<Response>> {
        let ctx = self.handler_context();
        match request {
            Request::FetchItems {
                scope,
                parts,
                full_payload,
                cache_only,
            } => handler::items::fetch_items(&ctx, scope, parts, full_payload, cache_only).await,
            Request::CreateItem {
                collection_id,
                mime_type,
                remote_id,
                remote_revision,
                gid,
                flags,
                tags,
                parts,
            } => handler::items::create_item(
                &ctx,
                collection_id,
                mime_type,
                remote_id,
                remote_revision,
                gid,
                flags,
                tags,
                parts,
            ),
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
            } => handler::items::modify_item(
                &ctx,
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
            ),
            Request::DeleteItem { scope } => handler::items::delete_items(&ctx, scope),
            Request::MoveItems { scope, destination } => {
                handler::items::move_items(&ctx, scope, destination).await
            }
            Request::CopyItems { scope, destination } => {
                handler::items::copy_items(&ctx, scope, destination).await
            }
            Request::LinkItems { scope, collection } => {
                handler::items::link_items(&ctx, scope, collection, true)
            }
            Request::UnlinkItems { scope, collection } => {
                handler::items::link_items(&ctx, scope, collection, false)
            }
            Request::FetchCollections { selector } => {
                handler::collections::fetch_collections(&ctx, selector)
            }
            Request::CreateCollection {
                parent_id,
                name,
                remote_id,
                mime_types,
                is_virtual,
                attributes,
                cache_policy,
            } => handler::collections::create_collection(
                &ctx,
                parent_id,
                name,
                remote_id,
                mime_types,
                is_virtual,
                attributes,
                cache_policy,
            ),
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
            } => handler::collections::modify_collection(
                &ctx,
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
            ),
            Request::DeleteCollection { collection_id } => {
                handler::collections::delete_collection(&ctx, collection_id).await
            }
            Request::MoveCollection {
                collection_id,
                destination,
            } => handler::collections::move_collection(&ctx, collection_id, destination),
            Request::CopyCollection {
                collection_id,
                destination,
            } => handler::collections::copy_collection(&ctx, collection_id, destination),
            Request::CollectionStats { collection_id } => {
                handler::collections::collection_stats(&ctx, collection_id)
            }
            Request::FetchTags { ids } => handler::tags::fetch_tags(&ctx, ids),
            Request::CreateTag {
                gid,
                tag_type,
                remote_id,
            } => handler::tags::create_tag(&ctx, gid, tag_type, remote_id),
            Request::ModifyTag {
                tag_id,
                tag_type,
                remote_id,
            } => handler::tags::modify_tag(&ctx, tag_id, tag_type, remote_id),
            Request::DeleteTag { tag_id } => handler::tags::delete_tag(&ctx, tag_id),
            Request::FetchRelations {
                left,
                right,
                relation_type,
            } => handler::relations::fetch_relations(&ctx, left, right, relation_type),
            Request::ModifyRelation {
                left,
                right,
                relation_type,
                remote_id,
            } => handler::relations::modify_relation(&ctx, left, right, relation_type, remote_id),
            Request::RemoveRelations {
                left,
                right,
                relation_type,
            } => handler::relations::remove_relations(&ctx, left, right, relation_type),
            Request::StoreSearch {
                name,
                query,
                language,
                mime_types,
                collections,
            } => {
                handler::search::store_search(&ctx, name, query, language, mime_types, collections)
                    .await
            }
            other => Err(Error::Protocol(format!("unroutable command {:?}", other.kind())).into()),
        }
    }

    /// Writes the handler's responses, rolling the failure into the
    /// terminal error response and aborting the handler's transaction.
    async fn write_results<S>(
        &self,
        writer: &mut WriteHalf<S>,
        tag: u64,
        kind: CommandKind,
        result: AnyResult<Vec<Response>>,
    ) -> AnyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match result {
            Ok(responses) => {
                for response in responses {
                    write_frame(writer, &Frame::response(tag, kind, response)).await?;
                }
            }
            Err(e) => self.write_error(writer, tag, kind, &e).await?,
        }
        Ok(())
    }

    async fn write_done<S>(
        &self,
        writer: &mut WriteHalf<S>,
        tag: u64,
        kind: CommandKind,
        message: &str,
    ) -> AnyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let response = Response::Done {
            message: message.into(),
        };
        write_frame(writer, &Frame::response(tag, kind, response)).await?;
        Ok(())
    }

    async fn write_error<S>(
        &self,
        writer: &mut WriteHalf<S>,
        tag: u64,
        kind: CommandKind,
        error: &anyhow::Error,
    ) -> AnyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // A failed handler's scoped transaction has already rolled back on
        // drop, taking any enclosing client transaction with it.
        let (code, message) = error_to_response(error);
        debug!(?code, message, "request failed");
        let response = Response::Error { code, message };
        write_frame(writer, &Frame::response(tag, kind, response)).await?;
        Ok(())
    }

    /// Ships a retrieval or search request to the connected agent as a
    /// server-tagged frame and parks the reply channel until the agent
    /// answers.
    async fn forward_agent_request<S>(
        &mut self,
        request: ResourceRequest,
        writer: &mut WriteHalf<S>,
    ) -> AnyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let tag = self.next_server_tag;
        self.next_server_tag += 1;
        match request {
            ResourceRequest::FetchItems {
                item_ids,
                parts,
                reply,
            } => {
                self.pending_agent_replies
                    .insert(tag, PendingAgentReply::Fetch(reply));
                let frame = Frame::request(
                    tag,
                    Request::FetchItems {
                        scope: Scope::Uid(item_ids),
                        parts,
                        full_payload: false,
                        cache_only: true,
                    },
                );
                write_frame(writer, &frame).await?;
            }
            ResourceRequest::Search {
                query,
                language,
                mime_types,
                collection_id,
                reply,
            } => {
                self.pending_agent_replies
                    .insert(tag, PendingAgentReply::Search(reply));
                let frame = Frame::request(
                    tag,
                    Request::StoreSearch {
                        name: String::new(),
                        query,
                        language,
                        mime_types,
                        collections: vec![collection_id],
                    },
                );
                write_frame(writer, &frame).await?;
            }
        }
        Ok(())
    }

    /// A response frame from an agent session, completing a server-issued
    /// request.
    fn handle_agent_response(&mut self, tag: u64, _kind: CommandKind, response: Response) {
        match self.pending_agent_replies.remove(&tag) {
            Some(PendingAgentReply::Fetch(reply)) => {
                let result = match response {
                    Response::Error { message, .. } => FetchItemsResult {
                        failed_items: Vec::new(),
                        error: Some(message),
                    },
                    _ => FetchItemsResult::default(),
                };
                let _ = reply.send(result);
            }
            Some(PendingAgentReply::Search(reply)) => {
                if let Response::Error { message, .. } = response {
                    let _ = reply.send(Err(message));
                }
                // success replies arrive as SearchResult requests instead
            }
            None => debug!(tag, "response for unknown server tag"),
        }
    }

    /// Replays spooled notifications to a reconnected agent; entries are
    /// acknowledged (and dropped) once written out.
    async fn replay_spooled<S>(
        &mut self,
        resource_id: i64,
        writer: &mut WriteHalf<S>,
    ) -> AnyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let pending = self.context.resources.spool().pending(resource_id)?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(resource = resource_id, count = pending.len(), "replaying spooled changes");
        let count = pending.len();
        let frame = Frame::response(
            PUSH_TAG,
            CommandKind::ChangeNotification,
            Response::ChangeNotification {
                payload: encode_batch(&pending),
            },
        );
        write_frame(writer, &frame).await?;
        self.context.resources.spool().acknowledge(resource_id, count)?;
        Ok(())
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Accept-side entry point: builds the session and runs it on the stream.
pub async fn serve_connection<S>(context: Arc<ServerContext>, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let session = match Session::new(context) {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "failed to set up session");
            return;
        }
    };
    if let Err(e) = session.run(stream).await {
        warn!(error = %e, "session ended with error");
    }
}

impl Session {
    fn take_pending_receiver(&mut self) -> Option<mpsc::Receiver<Arc<Vec<Notification>>>> {
        self.pending_receiver.take()
    }
}
