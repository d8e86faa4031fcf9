use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, future};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use switchboard_connection::{
    AppIndex, Application, Connection, ConnectionEvent, ConnectionState, Error, ErrorCode,
    MethodResult, RemoteError, SessionGrant, SessionHost, Transport,
};
use switchboard_core::FrameCodec;
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(5);

struct TestHost {
    index: AppIndex,
    timeout: Option<Duration>,
}

impl TestHost {
    fn new(apps: Vec<Application>) -> Self {
        Self {
            index: AppIndex::new(apps).unwrap(),
            timeout: None,
        }
    }
}

#[async_trait]
impl SessionHost for TestHost {
    fn handshake_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn resolve_application(&self, name: &str, version: Option<&str>) -> Option<Arc<Application>> {
        self.index.resolve(name, version)
    }

    async fn start_session(
        &self,
        _connection: &Connection,
        _application: &Arc<Application>,
        strategy: &str,
        credentials: &Value,
    ) -> Result<SessionGrant, RemoteError> {
        match strategy {
            "anonymous" => Ok(SessionGrant {
                username: None,
                session_id: "session-anon".into(),
            }),
            "login" if credentials == &json!(["alice", "secret"]) => Ok(SessionGrant {
                username: Some("alice".into()),
                session_id: "session-alice".into(),
            }),
            _ => Err(ErrorCode::AuthFailed.into()),
        }
    }
}

fn calc(invocations: Arc<AtomicUsize>) -> Application {
    Application::builder("calc@1.0.0")
        .method("math", "add", 2, move |_conn, args| {
            let invocations = invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok::<_, RemoteError>(vec![json!(sum)])
            }
        })
        .method("math", "slow", 0, |_conn, _args| future::pending::<MethodResult>())
        .method("math", "fail", 0, |_conn, _args| async move {
            Err::<Vec<Value>, _>(RemoteError::with_message(42, "custom failure"))
        })
        .method("math", "boom", 0, |_conn, _args| async move {
            let values: Vec<Value> = Vec::new();
            if values.is_empty() {
                panic!("handler exploded");
            }
            Ok::<_, RemoteError>(values)
        })
        .interface("chat")
        .build()
        .unwrap()
}

fn attach(host: Arc<TestHost>) -> (Connection, Connection) {
    let (a, b) = Transport::pair();
    let server = Connection::server(b, host);
    let client = Connection::client(a, Arc::new(Application::empty()));
    (client, server)
}

async fn connected(host: TestHost) -> (Connection, Connection) {
    let (client, server) = attach(Arc::new(host));
    timeout(WAIT, client.handshake("calc", None, None))
        .await
        .unwrap()
        .unwrap();
    (client, server)
}

async fn wait_for<F>(events: &mut broadcast::Receiver<ConnectionEvent>, matches: F) -> ConnectionEvent
where
    F: Fn(&ConnectionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

type RawPeer = Framed<DuplexStream, FrameCodec>;

fn raw_pair() -> (Transport, RawPeer) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (Transport::framed(a), Framed::new(b, FrameCodec::new()))
}

async fn recv(peer: &mut RawPeer) -> Value {
    let text = timeout(WAIT, peer.next()).await.unwrap().unwrap().unwrap();
    serde_json::from_str(&text).unwrap()
}

async fn send(peer: &mut RawPeer, value: Value) {
    peer.send(value.to_string()).await.unwrap();
}

#[tokio::test]
async fn client_ids_count_up_from_zero() {
    let (transport, mut peer) = raw_pair();
    let client = Connection::client(transport, Arc::new(Application::empty()));

    let handshake = tokio::spawn({
        let client = client.clone();
        async move { client.handshake("calc", None, None).await }
    });
    assert_eq!(recv(&mut peer).await, json!({"handshake": [0, "calc"]}));
    send(&mut peer, json!({"handshake": [0], "ok": "abc"})).await;
    assert_eq!(handshake.await.unwrap().unwrap(), "abc");
    assert_eq!(client.session_id().as_deref(), Some("abc"));

    client.call_method_detached("math", "add", vec![json!(1), json!(2)]).unwrap();
    client.emit_remote_event("chat", "typing", vec![]).unwrap();
    client.call_method_detached("math", "add", vec![json!(3), json!(4)]).unwrap();

    assert_eq!(recv(&mut peer).await, json!({"call": [1, "math"], "add": [1, 2]}));
    assert_eq!(recv(&mut peer).await, json!({"event": [2, "chat"], "typing": []}));
    assert_eq!(recv(&mut peer).await, json!({"call": [3, "math"], "add": [3, 4]}));
}

#[tokio::test]
async fn server_ids_count_down_and_responses_echo() {
    let (transport, mut peer) = raw_pair();
    let invocations = Arc::new(AtomicUsize::new(0));
    let server = Connection::server(transport, Arc::new(TestHost::new(vec![calc(invocations)])));

    send(&mut peer, json!({"handshake": [0, "calc"]})).await;
    assert_eq!(
        recv(&mut peer).await,
        json!({"handshake": [0], "ok": "session-anon"})
    );

    send(&mut peer, json!({"call": [1, "math"], "add": [2, 3]})).await;
    assert_eq!(recv(&mut peer).await, json!({"callback": [1], "ok": [5]}));

    server.emit_remote_event("chat", "a", vec![]).unwrap();
    server.emit_remote_event("chat", "b", vec![]).unwrap();
    assert_eq!(recv(&mut peer).await, json!({"event": [0, "chat"], "a": []}));
    assert_eq!(recv(&mut peer).await, json!({"event": [-1, "chat"], "b": []}));

    send(&mut peer, json!({"ping": [7]})).await;
    assert_eq!(recv(&mut peer).await, json!({"pong": [7]}));
}

#[tokio::test]
async fn callbacks_match_calls_regardless_of_order() {
    let (transport, mut peer) = raw_pair();
    let client = Connection::client(transport, Arc::new(Application::empty()));

    let handshake = tokio::spawn({
        let client = client.clone();
        async move { client.handshake("calc", None, None).await }
    });
    recv(&mut peer).await;
    send(&mut peer, json!({"handshake": [0], "ok": "s"})).await;
    handshake.await.unwrap().unwrap();

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.call_method("svc", "first", vec![]).await }
    });
    assert_eq!(recv(&mut peer).await, json!({"call": [1, "svc"], "first": []}));
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.call_method("svc", "second", vec![]).await }
    });
    assert_eq!(recv(&mut peer).await, json!({"call": [2, "svc"], "second": []}));

    send(&mut peer, json!({"callback": [2], "ok": ["two"]})).await;
    send(&mut peer, json!({"callback": [1], "error": [14]})).await;

    assert_eq!(second.await.unwrap().unwrap(), vec![json!("two")]);
    let err = first.await.unwrap().unwrap_err();
    assert!(err.as_remote().unwrap().is(ErrorCode::MethodNotFound));

    // A repeated callback for an answered id is dropped without closing.
    let mut events = client.subscribe();
    send(&mut peer, json!({"callback": [1], "ok": []})).await;
    let rejected = wait_for(&mut events, |e| matches!(e, ConnectionEvent::MessageRejected { .. })).await;
    assert!(matches!(rejected, ConnectionEvent::MessageRejected { fatal: false, .. }));
    assert_eq!(client.state(), ConnectionState::HandshakeDone);
}

#[tokio::test]
async fn messages_before_handshake_close_the_connection() {
    let (transport, mut peer) = raw_pair();
    let invocations = Arc::new(AtomicUsize::new(0));
    let server = Connection::server(
        transport,
        Arc::new(TestHost::new(vec![calc(invocations.clone())])),
    );
    let mut events = server.subscribe();

    send(&mut peer, json!({"call": [1, "math"], "add": [1, 2]})).await;

    let rejected = wait_for(&mut events, |e| matches!(e, ConnectionEvent::MessageRejected { .. })).await;
    assert!(matches!(rejected, ConnectionEvent::MessageRejected { fatal: true, .. }));
    timeout(WAIT, server.closed()).await.unwrap();
    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert!(timeout(WAIT, peer.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn calls_after_handshake_are_served() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let (client, server) = connected(TestHost::new(vec![calc(invocations.clone())])).await;

    assert_eq!(server.state(), ConnectionState::HandshakeDone);
    assert_eq!(server.application().unwrap().name(), "calc");

    let sum = client
        .call_method("math", "add", vec![json!(20), json!(22)])
        .await
        .unwrap();
    assert_eq!(sum, vec![json!(42)]);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let err = client.call_method("math", "fail", vec![]).await.unwrap_err();
    let remote = err.as_remote().unwrap();
    assert_eq!(remote.code(), 42);
    assert_eq!(remote.message(), "custom failure");
}

#[tokio::test]
async fn resolution_errors_do_not_invoke_handlers() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let (client, _server) = connected(TestHost::new(vec![calc(invocations.clone())])).await;

    let remote_code = |result: Result<Vec<Value>, Error>| result.unwrap_err().as_remote().unwrap().kind();

    assert_eq!(
        remote_code(client.call_method("nope", "add", vec![json!(1), json!(2)]).await),
        Some(ErrorCode::InterfaceNotFound)
    );
    assert_eq!(
        remote_code(client.call_method("math", "mul", vec![json!(1), json!(2)]).await),
        Some(ErrorCode::MethodNotFound)
    );
    assert_eq!(
        remote_code(client.call_method("math", "add", vec![json!(1)]).await),
        Some(ErrorCode::InvalidSignature)
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn handler_panic_answers_then_escalates() {
    let (client, server) = connected(TestHost::new(vec![calc(Arc::default())])).await;
    let mut events = server.subscribe();

    let err = client.call_method("math", "boom", vec![]).await.unwrap_err();
    assert!(err.as_remote().unwrap().is(ErrorCode::InternalApiError));

    let fault = wait_for(&mut events, |e| matches!(e, ConnectionEvent::HandlerFault { .. })).await;
    let ConnectionEvent::HandlerFault { interface, method } = fault else {
        unreachable!()
    };
    assert_eq!((interface.as_str(), method.as_str()), ("math", "boom"));

    // The serving side shuts down and the panic resumes in `join`.
    timeout(WAIT, client.closed()).await.unwrap();
    let joined = tokio::spawn({
        let server = server.clone();
        async move { server.join().await }
    })
    .await;
    let panic = joined.unwrap_err().into_panic();
    assert_eq!(panic.downcast_ref::<&str>(), Some(&"handler exploded"));
    assert_eq!(server.state(), ConnectionState::Closed);

    // Only the first join re-raises.
    timeout(WAIT, server.join()).await.unwrap();
}

#[tokio::test]
async fn join_returns_after_normal_close() {
    let (client, server) = connected(TestHost::new(vec![calc(Arc::default())])).await;
    client.close();
    timeout(WAIT, server.join()).await.unwrap();
    timeout(WAIT, client.join()).await.unwrap();
}

#[tokio::test]
async fn unhandled_event_is_a_no_op() {
    let (client, server) = connected(TestHost::new(vec![calc(Arc::default())])).await;
    let mut events = server.subscribe();

    client.emit_remote_event("nobody", "listens", vec![json!(1)]).unwrap();
    let event = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Event { .. })).await;
    let ConnectionEvent::Event { interface, event, args } = event else {
        unreachable!()
    };
    assert_eq!((interface.as_str(), event.as_str()), ("nobody", "listens"));
    assert_eq!(args, vec![json!(1)]);

    client.ping().await.unwrap();
    assert_eq!(server.state(), ConnectionState::HandshakeDone);
}

#[tokio::test]
async fn application_event_handler_runs() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let app = Application::builder("calc")
        .event_handler("chat", "typing", move |conn, args| {
            let _ = tx.send((conn.id(), args));
        })
        .build()
        .unwrap();
    let (client, server) = connected(TestHost::new(vec![app])).await;

    client.emit_remote_event("chat", "typing", vec![json!("bob")]).unwrap();
    let (conn_id, args) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(conn_id, server.id());
    assert_eq!(args, vec![json!("bob")]);
}

#[tokio::test]
async fn closing_with_pending_calls_skips_callbacks() {
    let (client, _server) = connected(TestHost::new(vec![calc(Arc::default())])).await;
    let mut events = client.subscribe();

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.call_method("math", "slow", vec![]).await }
    });
    // Let the call reach the peer before closing.
    client.ping().await.unwrap();
    client.close();

    let err = timeout(WAIT, pending).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, Error::Closed));
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Closed)).await;
    assert!(matches!(client.ping().await, Err(Error::Closed)));
}

#[tokio::test]
async fn peer_close_is_observed_by_both_sides() {
    let (client, server) = connected(TestHost::new(vec![calc(Arc::default())])).await;
    server.close();
    timeout(WAIT, client.closed()).await.unwrap();
    timeout(WAIT, server.closed()).await.unwrap();
    assert!(!client.is_open());
}

#[tokio::test]
async fn inspect_builds_proxy() {
    let (client, server) = connected(TestHost::new(vec![calc(Arc::default())])).await;

    let math = client.inspect_interface("math").await.unwrap();
    assert_eq!(
        math.method_names().collect::<Vec<_>>(),
        vec!["add", "boom", "fail", "slow"]
    );
    assert_eq!(
        math.call("add", vec![json!(1), json!(1)]).await.unwrap(),
        vec![json!(2)]
    );
    assert!(matches!(
        math.call("mul", vec![]).await,
        Err(Error::UnknownRemoteMethod { .. })
    ));

    let err = client.inspect_interface("missing").await.unwrap_err();
    assert!(err.as_remote().unwrap().is(ErrorCode::InterfaceNotFound));

    // Remote events reach proxy listeners.
    let chat = client.inspect_interface("chat").await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    chat.on("message", move |args: &[Value]| {
        let _ = tx.send(args.to_vec());
    });
    server.emit_remote_event("chat", "message", vec![json!("hi")]).unwrap();
    assert_eq!(
        timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
        vec![json!("hi")]
    );
}

#[tokio::test]
async fn proxy_emit_notifies_local_and_remote() {
    let (client, server) = connected(TestHost::new(vec![calc(Arc::default())])).await;
    let mut server_events = server.subscribe();

    let chat = client.inspect_interface("chat").await.unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    chat.on("message", {
        let seen = seen.clone();
        move |_: &[Value]| {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    chat.emit("message", vec![json!("hello")]).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    wait_for(&mut server_events, |e| matches!(e, ConnectionEvent::Event { .. })).await;
}

#[tokio::test]
async fn login_handshake_records_user() {
    let host = Arc::new(TestHost::new(vec![calc(Arc::default())]));

    let (client, server) = attach(host.clone());
    let err = client
        .handshake("calc", Some("alice"), Some("wrong"))
        .await
        .unwrap_err();
    assert!(err.as_remote().unwrap().is(ErrorCode::AuthFailed));
    assert_eq!(server.username(), None);
    timeout(WAIT, client.closed()).await.unwrap();
    timeout(WAIT, server.closed()).await.unwrap();

    let (client, server) = attach(host);
    let session = client
        .handshake("calc", Some("alice"), Some("secret"))
        .await
        .unwrap();
    assert_eq!(session, "session-alice");
    assert_eq!(client.username().as_deref(), Some("alice"));
    assert_eq!(server.username().as_deref(), Some("alice"));
}

#[tokio::test]
async fn handshake_version_resolution() {
    let apps = vec![
        Application::builder("calc@1.2.5").build().unwrap(),
        Application::builder("calc@2.0.0").build().unwrap(),
    ];
    let host = Arc::new(TestHost::new(apps));

    let (client, server) = attach(host.clone());
    let err = client.handshake("calc@^3.0.0", None, None).await.unwrap_err();
    assert!(err.as_remote().unwrap().is(ErrorCode::AppNotFound));
    timeout(WAIT, server.closed()).await.unwrap();

    let (client, server) = attach(host);
    // Rejected locally; nothing reaches the server and the connection stays up.
    let err = client.handshake("calc@not a range", None, None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidVersionRange(_)));
    assert!(client.is_open());

    client.handshake("calc@~1.2.0", None, None).await.unwrap();
    let app = server.application().unwrap();
    assert_eq!(app.version().map(ToString::to_string).as_deref(), Some("1.2.5"));
}

#[tokio::test]
async fn handshake_errors_close_the_connection() {
    let host = Arc::new(TestHost::new(vec![calc(Arc::default())]));

    let (transport, mut peer) = raw_pair();
    let server = Connection::server(transport, host.clone());
    send(&mut peer, json!({"handshake": [0, "nope"]})).await;
    assert_eq!(recv(&mut peer).await, json!({"handshake": [0], "error": [10]}));
    timeout(WAIT, server.closed()).await.unwrap();
    assert!(timeout(WAIT, peer.next()).await.unwrap().is_none());

    let (transport, mut peer) = raw_pair();
    let server = Connection::server(transport, host);
    send(&mut peer, json!({"handshake": [0, "calc"], "login": ["alice", "wrong"]})).await;
    assert_eq!(recv(&mut peer).await, json!({"handshake": [0], "error": [11]}));
    timeout(WAIT, server.closed()).await.unwrap();
    assert!(timeout(WAIT, peer.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn repeated_handshake_is_fatal() {
    let (transport, mut peer) = raw_pair();
    let server = Connection::server(transport, Arc::new(TestHost::new(vec![calc(Arc::default())])));
    let mut events = server.subscribe();

    send(&mut peer, json!({"handshake": [0, "calc"]})).await;
    assert_eq!(recv(&mut peer).await, json!({"handshake": [0], "ok": "session-anon"}));

    send(&mut peer, json!({"handshake": [1, "calc"]})).await;
    let rejected = wait_for(&mut events, |e| matches!(e, ConnectionEvent::MessageRejected { .. })).await;
    assert!(matches!(rejected, ConnectionEvent::MessageRejected { fatal: true, .. }));
    timeout(WAIT, server.closed()).await.unwrap();
    assert!(timeout(WAIT, peer.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn client_refuses_handshake_requests() {
    let (transport, mut peer) = raw_pair();
    let client = Connection::client(transport, Arc::new(Application::empty()));

    send(&mut peer, json!({"handshake": [0, "calc"]})).await;
    assert_eq!(
        recv(&mut peer).await,
        json!({"handshake": [0], "error": [15]})
    );
    timeout(WAIT, client.closed()).await.unwrap();
    assert!(timeout(WAIT, peer.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn handshake_timeout_closes() {
    let (transport, _peer) = raw_pair();
    let host = TestHost {
        timeout: Some(Duration::from_millis(50)),
        ..TestHost::new(vec![calc(Arc::default())])
    };
    let server = Connection::server(transport, Arc::new(host));
    let mut events = server.subscribe();

    wait_for(&mut events, |e| matches!(e, ConnectionEvent::HandshakeTimeout)).await;
    timeout(WAIT, server.closed()).await.unwrap();
}

#[tokio::test]
async fn heartbeat_reaches_peer() {
    let (client, server) = connected(TestHost::new(vec![calc(Arc::default())])).await;
    let mut events = server.subscribe();

    client.start_heartbeat(Duration::from_millis(10)).unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Heartbeat)).await;
    client.stop_heartbeat().unwrap();
}

async fn handshaken_client() -> (Connection, RawPeer) {
    let (transport, mut peer) = raw_pair();
    let client = Connection::client(transport, Arc::new(Application::empty()));
    let handshake = tokio::spawn({
        let client = client.clone();
        async move { client.handshake("calc", None, None).await }
    });
    recv(&mut peer).await;
    send(&mut peer, json!({"handshake": [0], "ok": "s"})).await;
    handshake.await.unwrap().unwrap();
    (client, peer)
}

#[tokio::test]
async fn first_heartbeat_is_immediate() {
    let (client, mut peer) = handshaken_client().await;

    client.start_heartbeat(Duration::from_secs(3600)).unwrap();
    assert_eq!(recv(&mut peer).await, json!({}));
}

#[tokio::test]
async fn stopped_heartbeat_sends_nothing() {
    let (client, mut peer) = handshaken_client().await;

    client.start_heartbeat(Duration::from_millis(10)).unwrap();
    assert_eq!(recv(&mut peer).await, json!({}));
    client.stop_heartbeat().unwrap();

    // Commands run in order, so everything after the ping was sent after the stop.
    let ping = tokio::spawn({
        let client = client.clone();
        async move { client.ping().await }
    });
    let id = loop {
        let frame = recv(&mut peer).await;
        if let Some(id) = frame.get("ping").and_then(|header| header[0].as_i64()) {
            break id;
        }
        assert_eq!(frame, json!({}));
    };
    send(&mut peer, json!({"pong": [id]})).await;
    ping.await.unwrap().unwrap();
    assert!(timeout(Duration::from_millis(100), peer.next()).await.is_err());
}

#[tokio::test]
async fn close_stops_heartbeat() {
    let (client, mut peer) = handshaken_client().await;

    client.start_heartbeat(Duration::from_millis(10)).unwrap();
    assert_eq!(recv(&mut peer).await, json!({}));
    client.close();
    timeout(WAIT, client.closed()).await.unwrap();

    // Drain what was written before the close; then the stream ends.
    timeout(WAIT, async {
        while let Some(frame) = peer.next().await {
            assert_eq!(frame.unwrap(), "{}");
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn malformed_frame_fails_connection() {
    let (transport, mut peer) = raw_pair();
    let client = Connection::client(transport, Arc::new(Application::empty()));
    let mut events = client.subscribe();

    peer.send("{not json".to_string()).await.unwrap();
    let error = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;
    let ConnectionEvent::Error(err) = error else {
        unreachable!()
    };
    assert!(matches!(*err, Error::Protocol(_)));
    timeout(WAIT, client.closed()).await.unwrap();
}
