// Session state machine and framing tests, talking to a real session over
// an in-memory duplex stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tokio::io::DuplexStream;

use pimstore::protocol::{
    read_frame, write_frame, CollectionSelector, Frame, Message, Request, Response, Scope,
    PROTOCOL_VERSION,
};
use pimstore::storage::schema::DbInitializer;
use pimstore::{
    serve_connection, Collection, ErrorCode, Notification, Resource, ServerContext,
};

struct TestClient {
    stream: DuplexStream,
    next_tag: u64,
}

impl TestClient {
    async fn send(&mut self, request: Request) -> Result<u64> {
        let tag = self.next_tag;
        self.next_tag += 1;
        write_frame(&mut self.stream, &Frame::request(tag, request)).await?;
        Ok(tag)
    }

    async fn recv(&mut self) -> Result<Frame> {
        let frame = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut self.stream))
            .await
            .expect("timed out waiting for a frame")?
            .expect("connection closed unexpectedly");
        Ok(frame)
    }

    async fn recv_response(&mut self) -> Result<(u64, Response)> {
        let frame = self.recv().await?;
        match frame.message {
            Message::Response(_, response) => Ok((frame.tag, response)),
            other => panic!("expected response, got {other:?}"),
        }
    }

    async fn expect_done(&mut self, expected_tag: u64) -> Result<()> {
        let (tag, response) = self.recv_response().await?;
        assert_eq!(tag, expected_tag);
        assert!(
            matches!(response, Response::Done { .. }),
            "expected Done, got {response:?}"
        );
        Ok(())
    }

    async fn login(&mut self) -> Result<()> {
        let tag = self
            .send(Request::Hello {
                protocol_version: PROTOCOL_VERSION,
            })
            .await?;
        let (hello_tag, response) = self.recv_response().await?;
        assert_eq!(hello_tag, tag);
        assert!(matches!(response, Response::Hello { .. }));

        let tag = self
            .send(Request::Login {
                session_id: b"test-client".to_vec(),
            })
            .await?;
        self.expect_done(tag).await?;
        Ok(())
    }
}

struct Setup {
    context: Arc<ServerContext>,
    _dir: TempDir,
}

impl Setup {
    fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let context = Arc::new(ServerContext::with_paths(
            Default::default(),
            Default::default(),
            dir.path().join("pimstore.db"),
            dir.path().join("file_db_data"),
        ));
        let bootstrap = context.open_store(Vec::new())?;
        DbInitializer::new(bootstrap.db()).run()?;
        Ok(Self {
            context,
            _dir: dir,
        })
    }

    fn seed_collection(&self) -> Result<Collection> {
        let store = self.context.open_store(Vec::new())?;
        let mut resource = Resource {
            name: "res".into(),
            ..Default::default()
        };
        resource.insert(store.db())?;
        let mut collection = Collection::new("inbox", resource.id);
        collection.insert(store.db())?;
        Ok(collection)
    }

    fn connect(&self) -> TestClient {
        let (client_end, server_end) = tokio::io::duplex(1 << 20);
        let context = self.context.clone();
        tokio::spawn(async move {
            serve_connection(context, server_end).await;
        });
        TestClient {
            stream: client_end,
            next_tag: 1,
        }
    }
}

#[tokio::test]
async fn commands_before_login_are_rejected() -> Result<()> {
    let setup = Setup::new()?;
    let mut client = setup.connect();

    let tag = client.send(Request::FetchTags { ids: vec![] }).await?;
    let (response_tag, response) = client.recv_response().await?;
    assert_eq!(response_tag, tag);
    match response {
        Response::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidState),
        other => panic!("expected InvalidState, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn protocol_version_mismatch_closes_the_connection() -> Result<()> {
    let setup = Setup::new()?;
    let mut client = setup.connect();

    client
        .send(Request::Hello {
            protocol_version: PROTOCOL_VERSION - 1,
        })
        .await?;
    let (_, response) = client.recv_response().await?;
    match response {
        Response::Error { code, .. } => assert_eq!(code, ErrorCode::UnsupportedVersion),
        other => panic!("expected version error, got {other:?}"),
    }
    // server closed: the next read sees end-of-stream
    let eof = tokio::time::timeout(
        Duration::from_secs(5),
        read_frame(&mut client.stream),
    )
    .await
    .expect("timed out")?;
    assert!(eof.is_none());
    Ok(())
}

#[tokio::test]
async fn full_item_lifecycle_over_the_wire() -> Result<()> {
    let setup = Setup::new()?;
    let collection = setup.seed_collection()?;
    let mut client = setup.connect();
    client.login().await?;

    // create
    let create_tag = client
        .send(Request::CreateItem {
            collection_id: collection.id,
            mime_type: "message/rfc822".into(),
            remote_id: Some("RID".into()),
            remote_revision: None,
            gid: None,
            flags: vec![b"\\SEEN".to_vec()],
            tags: vec![],
            parts: vec![pimstore::protocol::PartData {
                name: "PLD:RFC822".into(),
                data: b"hello".to_vec(),
            }],
        })
        .await?;
    let (tag, response) = client.recv_response().await?;
    assert_eq!(tag, create_tag);
    let item_id = match response {
        Response::Created { id } => id,
        other => panic!("expected Created, got {other:?}"),
    };

    // fetch: streamed item, then the terminal response, in request order
    let fetch_tag = client
        .send(Request::FetchItems {
            scope: Scope::Uid(vec![item_id]),
            parts: vec!["PLD:RFC822".into()],
            full_payload: false,
            cache_only: true,
        })
        .await?;
    let list_tag = client
        .send(Request::FetchCollections {
            selector: CollectionSelector::Ids(vec![collection.id]),
        })
        .await?;

    let (tag, response) = client.recv_response().await?;
    assert_eq!(tag, fetch_tag);
    match response {
        Response::Item(item) => {
            assert_eq!(item.id, item_id);
            assert_eq!(item.parts.len(), 1);
            assert_eq!(item.parts[0].data, b"hello");
        }
        other => panic!("expected Item, got {other:?}"),
    }
    client.expect_done(fetch_tag).await?;

    // the second request's responses strictly follow the first's terminal
    let (tag, response) = client.recv_response().await?;
    assert_eq!(tag, list_tag);
    match response {
        Response::Collection(fetched) => assert_eq!(fetched.id, collection.id),
        other => panic!("expected Collection, got {other:?}"),
    }
    client.expect_done(list_tag).await?;
    Ok(())
}

#[tokio::test]
async fn subscribers_get_change_notification_pushes() -> Result<()> {
    let setup = Setup::new()?;
    let collection = setup.seed_collection()?;
    let mut client = setup.connect();
    client.login().await?;

    let tag = client
        .send(Request::Subscribe {
            filter: Default::default(),
        })
        .await?;
    client.expect_done(tag).await?;

    let create_tag = client
        .send(Request::CreateCollection {
            parent_id: collection.id,
            name: "fresh".into(),
            remote_id: None,
            mime_types: vec![],
            is_virtual: false,
            attributes: vec![],
            cache_policy: None,
        })
        .await?;
    let (tag, response) = client.recv_response().await?;
    assert_eq!(tag, create_tag);
    let fresh_id = match response {
        Response::Created { id } => id,
        other => panic!("expected Created, got {other:?}"),
    };

    // the committed batch is pushed with the reserved tag 0
    let (tag, response) = client.recv_response().await?;
    assert_eq!(tag, 0);
    let batch: Vec<Notification> = match response {
        Response::ChangeNotification { payload } => {
            pimstore::notification::decode_batch(&payload)?
        }
        other => panic!("expected ChangeNotification, got {other:?}"),
    };
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].kind, pimstore::NotificationKind::CollectionAdded);
    assert_eq!(batch[0].ids, vec![fresh_id]);
    assert_eq!(batch[0].session_id, b"test-client".to_vec());
    Ok(())
}

#[tokio::test]
async fn explicit_transactions_span_commands() -> Result<()> {
    let setup = Setup::new()?;
    let collection = setup.seed_collection()?;
    let mut client = setup.connect();
    client.login().await?;

    let tag = client.send(Request::Begin).await?;
    client.expect_done(tag).await?;

    let tag = client
        .send(Request::CreateCollection {
            parent_id: collection.id,
            name: "inside-tx".into(),
            remote_id: None,
            mime_types: vec![],
            is_virtual: false,
            attributes: vec![],
            cache_policy: None,
        })
        .await?;
    let (_, response) = client.recv_response().await?;
    let created = match response {
        Response::Created { id } => id,
        other => panic!("expected Created, got {other:?}"),
    };

    let tag2 = client.send(Request::Rollback).await?;
    client.expect_done(tag2).await?;
    let _ = tag;

    // rolled back: the collection is gone
    let probe = setup.context.open_store(Vec::new())?;
    assert!(Collection::retrieve_by_id(probe.db(), created)?.is_none());
    Ok(())
}
