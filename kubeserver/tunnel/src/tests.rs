use super::*;
use super::Stream;
use bytes::Bytes;
use futures::prelude::*;
use std::sync::Arc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    net::TcpListener,
    time,
};
use tokio_tungstenite::{
    tungstenite::{protocol::Role, Message},
    WebSocketStream,
};

const TIMEOUT: time::Duration = time::Duration::from_secs(5);

fn manager(config: Config) -> SessionManager {
    SessionManager::new(
        Arc::new(TokenAuthorizer::new("s3cr3t")),
        config,
        TunnelMetrics::default(),
    )
}

fn filter(rules: &[&str]) -> ConnectFilter {
    rules
        .iter()
        .map(|r| r.parse::<Rule>().expect("rule must parse"))
        .collect()
}

async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (server, agent) = tokio::io::duplex(1 << 20);
    let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
    let agent = WebSocketStream::from_raw_socket(agent, Role::Client, None).await;
    (server, agent)
}

/// Connects an agent to the manager under `key` over an in-memory websocket.
async fn connect_agent(manager: &SessionManager, key: &str, agent: Agent) {
    let (server_ws, agent_ws) = ws_pair().await;
    tokio::spawn({
        let manager = manager.clone();
        let key = key.to_string();
        async move { manager.serve(key, server_ws).await }
    });
    tokio::spawn(async move { agent.serve(agent_ws).await });
    wait_for_session(manager, key).await;
}

async fn wait_for_session(manager: &SessionManager, key: &str) {
    time::timeout(TIMEOUT, async {
        while !manager.has_session(key) {
            time::sleep(time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session must register");
}

/// Serves a single connection that reads a request and answers with a fixed response.
async fn backend(response: &'static [u8]) -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("must bind");
    let addr = listener.local_addr().expect("must have address");
    let task = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.expect("must accept");
        let mut req = vec![0u8; 18];
        conn.read_exact(&mut req).await.expect("must read request");
        conn.write_all(response).await.expect("must write response");
        conn.shutdown().await.expect("must shutdown");
        req
    });
    (addr, task)
}

async fn next_frame<S>(ws: &mut WebSocketStream<S>) -> Frame
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let msg = ws
            .next()
            .await
            .expect("websocket must be open")
            .expect("websocket must be readable");
        if let Message::Binary(bytes) = msg {
            return Frame::decode(bytes).expect("frame must decode");
        }
    }
}

async fn send_frame<S>(ws: &mut WebSocketStream<S>, frame: Frame)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    ws.send(Message::Binary(frame.encode()))
        .await
        .expect("frame must be written");
}

/// Dials through a server session whose agent side is driven by the test, acknowledging the
/// connect.
async fn dial_acked(manager: &SessionManager, agent_ws: &mut WebSocketStream<DuplexStream>) -> Stream {
    let dial = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .dial("foo", Destination::new("tcp", "10.0.0.1:80"))
                .await
        }
    });
    let connect = next_frame(agent_ws).await;
    assert_eq!(connect.kind, Kind::Connect);
    send_frame(agent_ws, Frame::data(connect.id, Bytes::new())).await;
    dial.await
        .expect("dial task must not panic")
        .expect("dial must succeed")
}

async fn serve_raw(manager: &SessionManager) -> (tokio::task::JoinHandle<Result<(), SessionError>>, WebSocketStream<DuplexStream>) {
    let (server_ws, agent_ws) = ws_pair().await;
    let serve = tokio::spawn({
        let manager = manager.clone();
        async move { manager.serve("foo".to_string(), server_ws).await }
    });
    wait_for_session(manager, "foo").await;
    (serve, agent_ws)
}

#[tokio::test]
async fn tcp_through_tunnel() {
    let _trace = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();

    let (addr, backend) = backend(b"HTTP/1.0 200 OK\r\n\r\nhello").await;
    let manager = manager(Config::default());
    let agent = Agent::new(
        "ws://unused",
        "foo",
        Arc::new(LocalConnector::new(filter(&["tcp/*"]))),
    );
    connect_agent(&manager, "foo", agent).await;

    let mut stream = time::timeout(
        TIMEOUT,
        manager.dial("foo", Destination::new("tcp", addr.to_string())),
    )
    .await
    .expect("dial must not time out")
    .expect("dial must succeed");
    assert_eq!(stream.id() % 2, 0, "server allocates even ids");
    assert_eq!(stream.direction(), Direction::Outgoing);

    stream
        .write_all(b"GET / HTTP/1.0\r\n\r\n")
        .await
        .expect("write must succeed");
    let mut rsp = Vec::new();
    time::timeout(TIMEOUT, stream.read_to_end(&mut rsp))
        .await
        .expect("read must not time out")
        .expect("read must succeed");
    assert_eq!(rsp, b"HTTP/1.0 200 OK\r\n\r\nhello");
    assert_eq!(
        backend.await.expect("backend must not panic"),
        b"GET / HTTP/1.0\r\n\r\n"
    );

    // The peer closed the stream, so it may no longer be written.
    let err = stream.write_all(b"more").await.expect_err("write must fail");
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
}

#[tokio::test]
async fn close_emits_single_eof() {
    let manager = manager(Config::default());
    let (server_ws, mut agent_ws) = ws_pair().await;
    tokio::spawn({
        let manager = manager.clone();
        async move { manager.serve("foo".to_string(), server_ws).await }
    });
    wait_for_session(&manager, "foo").await;

    let dial = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .dial("foo", Destination::new("tcp", "10.0.0.1:80"))
                .await
        }
    });

    let connect = next_frame(&mut agent_ws).await;
    assert_eq!(connect.kind, Kind::Connect);
    assert_eq!(connect.text_payload(), Some("tcp/10.0.0.1:80"));
    send_frame(&mut agent_ws, Frame::data(connect.id, Bytes::new())).await;

    let mut stream = dial
        .await
        .expect("dial task must not panic")
        .expect("dial must succeed");
    stream.write_all(b"ping").await.expect("write must succeed");
    stream.close().await.expect("close must succeed");
    stream.close().await.expect("close must be idempotent");

    let data = next_frame(&mut agent_ws).await;
    assert_eq!(data, Frame::data(connect.id, Bytes::from_static(b"ping")));
    let eof = next_frame(&mut agent_ws).await;
    assert_eq!(eof, Frame::eof(connect.id));

    drop(stream);
    assert!(
        time::timeout(time::Duration::from_millis(100), next_frame(&mut agent_ws))
            .await
            .is_err(),
        "no frames may follow the first EOF"
    );
}

#[tokio::test]
async fn unix_socket_restriction() {
    let manager = manager(Config::default());
    let agent = Agent::new(
        "ws://unused",
        "foo",
        Arc::new(LocalConnector::new(filter(&["unix//var/run/docker.sock"]))),
    );
    connect_agent(&manager, "foo", agent).await;

    let err = manager
        .dial("foo", Destination::new("unix", "/etc/passwd"))
        .await
        .expect_err("dial must be rejected");
    assert_eq!(err, DialError::Rejected(NOT_AUTHORIZED.to_string()));
}

#[tokio::test]
async fn backend_failure_rejects_dial() {
    // Bind and drop a listener to find a port that refuses connections.
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind")
        .local_addr()
        .expect("must have address");

    let manager = manager(Config::default());
    let agent = Agent::new(
        "ws://unused",
        "foo",
        Arc::new(LocalConnector::new(filter(&["tcp/*"]))),
    );
    connect_agent(&manager, "foo", agent).await;

    let err = manager
        .dial("foo", Destination::new("tcp", addr.to_string()))
        .await
        .expect_err("dial must fail");
    assert!(matches!(err, DialError::Rejected(_)), "{err:?}");
}

#[tokio::test]
async fn no_session_fails_fast() {
    let manager = manager(Config::default());
    let err = time::timeout(
        time::Duration::from_millis(100),
        manager.dial("missing", Destination::new("tcp", "10.0.0.1:80")),
    )
    .await
    .expect("dial must fail immediately")
    .expect_err("dial must fail");
    assert_eq!(err, DialError::NoSession("missing".to_string()));
    assert_eq!(err.as_label(), "no_session");
}

#[tokio::test]
async fn dial_timeout_aborts_stream() {
    let manager = manager(Config {
        dial_timeout: time::Duration::from_millis(50),
        ..Config::default()
    });
    let (server_ws, mut agent_ws) = ws_pair().await;
    tokio::spawn({
        let manager = manager.clone();
        async move { manager.serve("foo".to_string(), server_ws).await }
    });
    wait_for_session(&manager, "foo").await;

    let dial = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .dial("foo", Destination::new("tcp", "10.0.0.1:80"))
                .await
        }
    });

    let connect = next_frame(&mut agent_ws).await;
    assert_eq!(connect.kind, Kind::Connect);
    let err = dial
        .await
        .expect("dial task must not panic")
        .expect_err("dial must time out");
    assert_eq!(err, DialError::Timeout(time::Duration::from_millis(50)));
    assert_eq!(
        next_frame(&mut agent_ws).await,
        Frame::error(connect.id, "dial timeout")
    );

    // A late acknowledgement for the abandoned stream is discarded without harming the session.
    send_frame(&mut agent_ws, Frame::data(connect.id, Bytes::new())).await;
    time::sleep(time::Duration::from_millis(20)).await;
    assert!(manager.has_session("foo"));
}

#[tokio::test]
async fn one_hop_clients() {
    let (addr, backend) = backend(b"downstream").await;
    let manager = manager(Config::default());
    let agent = Agent::new(
        "ws://unused",
        "edge",
        Arc::new(LocalConnector::new(filter(&["tcp/127.0.0.1:*"]))),
    )
    .with_clients(vec!["c-downstream".to_string()]);
    connect_agent(&manager, "edge", agent).await;
    wait_for_session(&manager, "c-downstream").await;

    let mut stream = manager
        .dialer("c-downstream")
        .dial(Destination::new("tcp", addr.to_string()))
        .await
        .expect("dial must succeed");
    stream
        .write_all(b"GET / HTTP/1.0\r\n\r\n")
        .await
        .expect("write must succeed");
    let mut rsp = Vec::new();
    time::timeout(TIMEOUT, stream.read_to_end(&mut rsp))
        .await
        .expect("read must not time out")
        .expect("read must succeed");
    assert_eq!(rsp, b"downstream");
    backend.await.expect("backend must not panic");
}

#[tokio::test]
async fn session_teardown_fails_streams() {
    let manager = manager(Config::default());
    let (server_ws, mut agent_ws) = ws_pair().await;
    let serve = tokio::spawn({
        let manager = manager.clone();
        async move { manager.serve("foo".to_string(), server_ws).await }
    });
    wait_for_session(&manager, "foo").await;

    let dial = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .dial("foo", Destination::new("tcp", "10.0.0.1:80"))
                .await
        }
    });
    let connect = next_frame(&mut agent_ws).await;
    send_frame(&mut agent_ws, Frame::data(connect.id, Bytes::new())).await;
    let mut stream = dial
        .await
        .expect("dial task must not panic")
        .expect("dial must succeed");

    drop(agent_ws);
    serve
        .await
        .expect("serve task must not panic")
        .expect_err("session must fail");

    let mut buf = [0u8; 8];
    let err = stream.read(&mut buf).await.expect_err("read must fail");
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
    assert!(!manager.has_session("foo"));
    assert!(manager.client_keys().is_empty());
}

#[tokio::test]
async fn protocol_violation_terminates_session() {
    let manager = manager(Config::default());
    let (server_ws, mut agent_ws) = ws_pair().await;
    let serve = tokio::spawn({
        let manager = manager.clone();
        async move { manager.serve("foo".to_string(), server_ws).await }
    });
    wait_for_session(&manager, "foo").await;

    // Even ids belong to the server.
    send_frame(
        &mut agent_ws,
        Frame::connect(2, &Destination::new("tcp", "10.0.0.1:80")),
    )
    .await;
    let err = time::timeout(TIMEOUT, serve)
        .await
        .expect("session must terminate")
        .expect("serve task must not panic")
        .expect_err("session must fail");
    assert!(matches!(err, SessionError::Violation(_)), "{err:?}");

    let manager2 = self::manager(Config::default());
    let (server_ws, mut agent_ws) = ws_pair().await;
    let serve = tokio::spawn({
        let manager = manager2.clone();
        async move { manager.serve("foo".to_string(), server_ws).await }
    });
    wait_for_session(&manager2, "foo").await;
    agent_ws
        .send(Message::Binary(Bytes::from_static(&[0, 2])))
        .await
        .expect("message must be written");
    let err = time::timeout(TIMEOUT, serve)
        .await
        .expect("session must terminate")
        .expect("serve task must not panic")
        .expect_err("session must fail");
    assert!(matches!(err, SessionError::Protocol(_)), "{err:?}");
}

#[tokio::test]
async fn large_writes_are_fragmented() {
    let manager = manager(Config {
        max_payload: 4,
        ..Config::default()
    });
    let (server_ws, mut agent_ws) = ws_pair().await;
    tokio::spawn({
        let manager = manager.clone();
        async move { manager.serve("foo".to_string(), server_ws).await }
    });
    wait_for_session(&manager, "foo").await;

    let dial = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .dial("foo", Destination::new("tcp", "10.0.0.1:80"))
                .await
        }
    });
    let connect = next_frame(&mut agent_ws).await;
    send_frame(&mut agent_ws, Frame::data(connect.id, Bytes::new())).await;
    let mut stream = dial
        .await
        .expect("dial task must not panic")
        .expect("dial must succeed");

    stream
        .write_all(b"0123456789")
        .await
        .expect("write must succeed");
    let mut received = Vec::new();
    for expected in [&b"0123"[..], b"4567", b"89"] {
        let frame = next_frame(&mut agent_ws).await;
        assert_eq!(frame.kind, Kind::Data);
        assert_eq!(&frame.payload[..], expected);
        received.extend_from_slice(&frame.payload);
    }
    assert_eq!(received, b"0123456789");

    // Bytes received before the peer's EOF remain readable.
    send_frame(
        &mut agent_ws,
        Frame::data(connect.id, Bytes::from_static(b"abc")),
    )
    .await;
    send_frame(&mut agent_ws, Frame::eof(connect.id)).await;
    let mut rsp = Vec::new();
    time::timeout(TIMEOUT, stream.read_to_end(&mut rsp))
        .await
        .expect("read must not time out")
        .expect("read must succeed");
    assert_eq!(rsp, b"abc");
}

#[tokio::test]
async fn accept_requires_authorization() {
    let manager = manager(Config::default());
    let req = http::Request::builder()
        .uri("/connect")
        .header(http::header::UPGRADE, "websocket")
        .header(http::header::CONNECTION, "Upgrade")
        .header(http::header::SEC_WEBSOCKET_VERSION, "13")
        .header(http::header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
        .header(TUNNEL_ID_HEADER, "foo")
        .body(())
        .unwrap();
    let rsp = manager.accept(req);
    assert_eq!(rsp.status(), http::StatusCode::UNAUTHORIZED);

    let req = http::Request::builder()
        .uri("/connect")
        .header(http::header::AUTHORIZATION, "Bearer s3cr3t")
        .header(TUNNEL_ID_HEADER, "foo")
        .body(())
        .unwrap();
    let rsp = manager.accept(req);
    assert_eq!(rsp.status(), http::StatusCode::BAD_REQUEST);
}

#[test]
fn token_authorizer() {
    let authz = TokenAuthorizer::new("s3cr3t");
    let parts = |auth: Option<&str>, id: Option<&str>| {
        let mut req = http::Request::builder();
        if let Some(auth) = auth {
            req = req.header(http::header::AUTHORIZATION, auth);
        }
        if let Some(id) = id {
            req = req.header(TUNNEL_ID_HEADER, id);
        }
        req.body(()).unwrap().into_parts().0
    };

    assert_eq!(
        authz.authorize(&parts(Some("Bearer s3cr3t"), Some("c-abc"))),
        Some("c-abc".to_string())
    );
    assert_eq!(authz.authorize(&parts(Some("Bearer s3cr3t"), None)), None);
    assert_eq!(authz.authorize(&parts(Some("Bearer s3cr3t"), Some(" "))), None);
    assert_eq!(authz.authorize(&parts(Some("Bearer wrong"), Some("c-abc"))), None);
    assert_eq!(authz.authorize(&parts(Some("s3cr3t"), Some("c-abc"))), None);
    assert_eq!(authz.authorize(&parts(None, Some("c-abc"))), None);
}

#[tokio::test]
async fn backpressure_is_per_stream() {
    let manager = manager(Config {
        high_water: 4,
        max_buffered: 16,
        backpressure_timeout: time::Duration::from_millis(300),
        ..Config::default()
    });
    let (_serve, mut agent_ws) = serve_raw(&manager).await;

    let mut slow = dial_acked(&manager, &mut agent_ws).await;
    let mut fast = dial_acked(&manager, &mut agent_ws).await;

    // `slow` is never read, so it stays above its high-water mark.
    send_frame(
        &mut agent_ws,
        Frame::data(slow.id(), Bytes::from_static(b"0123456789")),
    )
    .await;
    send_frame(&mut agent_ws, Frame::data(fast.id(), Bytes::from_static(b"hi"))).await;

    let mut buf = [0u8; 2];
    time::timeout(time::Duration::from_millis(100), fast.read_exact(&mut buf))
        .await
        .expect("a full stream must not stall its neighbours")
        .expect("read must succeed");
    assert_eq!(&buf, b"hi");
    assert!(slow.is_pressured());
    assert!(!fast.is_pressured());

    assert_eq!(
        time::timeout(TIMEOUT, next_frame(&mut agent_ws))
            .await
            .expect("full stream must be aborted"),
        Frame::error(slow.id(), "receive buffer overflow")
    );
    let err = slow.read(&mut buf).await.expect_err("read must fail");
    assert_eq!(err.kind(), std::io::ErrorKind::Other);

    // Past the hard limit a stream is aborted without waiting for it to drain.
    let mut flood = dial_acked(&manager, &mut agent_ws).await;
    send_frame(&mut agent_ws, Frame::data(flood.id(), Bytes::from(vec![7u8; 20]))).await;
    assert_eq!(
        time::timeout(time::Duration::from_millis(100), next_frame(&mut agent_ws))
            .await
            .expect("overflowing stream must be aborted at once"),
        Frame::error(flood.id(), "receive buffer overflow")
    );
    assert!(flood.read(&mut buf).await.is_err());

    // The session and the healthy stream survive.
    assert!(manager.has_session("foo"));
    send_frame(&mut agent_ws, Frame::data(fast.id(), Bytes::from_static(b"ok"))).await;
    time::timeout(TIMEOUT, fast.read_exact(&mut buf))
        .await
        .expect("read must not time out")
        .expect("read must succeed");
    assert_eq!(&buf, b"ok");
}

#[tokio::test]
async fn deadlines_fail_io_without_closing() {
    let manager = manager(Config::default());
    let (_serve, mut agent_ws) = serve_raw(&manager).await;
    let mut stream = dial_acked(&manager, &mut agent_ws).await;

    stream.set_read_deadline(Some(time::Instant::now() + time::Duration::from_millis(50)));
    let mut buf = [0u8; 4];
    let err = time::timeout(TIMEOUT, stream.read(&mut buf))
        .await
        .expect("read deadline must fire")
        .expect_err("read must time out");
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

    stream.set_write_deadline(Some(time::Instant::now()));
    let err = stream.write_all(b"late").await.expect_err("write must time out");
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

    // Clearing the deadlines restores I/O in both directions.
    stream.set_deadline(None);
    stream.write_all(b"ping").await.expect("write must succeed");
    assert_eq!(
        next_frame(&mut agent_ws).await,
        Frame::data(stream.id(), Bytes::from_static(b"ping"))
    );
    send_frame(&mut agent_ws, Frame::data(stream.id(), Bytes::from_static(b"pong"))).await;
    time::timeout(TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read must not time out")
        .expect("read must succeed");
    assert_eq!(&buf, b"pong");
}

#[tokio::test(start_paused = true)]
async fn server_drops_silent_agents() {
    let manager = manager(Config::default());
    // The agent side is never polled, so the server's pings go unanswered.
    let (serve, _agent_ws) = serve_raw(&manager).await;

    let err = time::timeout(time::Duration::from_secs(600), serve)
        .await
        .expect("session must be dropped")
        .expect("serve task must not panic")
        .expect_err("session must fail");
    assert!(matches!(err, SessionError::Idle(_)), "{err:?}");
    assert!(!manager.has_session("foo"));
}

#[tokio::test(start_paused = true)]
async fn agent_drops_silent_server() {
    let (_server_ws, agent_ws) = ws_pair().await;
    let agent = Agent::new("ws://unused", "foo", Arc::new(Deny));

    let err = time::timeout(time::Duration::from_secs(600), agent.serve(agent_ws))
        .await
        .expect("agent must notice the silent server")
        .expect_err("session must fail");
    assert!(matches!(err, SessionError::Idle(_)), "{err:?}");
}

#[tokio::test]
async fn clients_are_added_and_removed() {
    let manager = manager(Config::default());
    let (server_ws, agent_ws) = ws_pair().await;
    tokio::spawn({
        let manager = manager.clone();
        async move { manager.serve("edge".to_string(), server_ws).await }
    });
    let (session, run) = Session::new(
        "edge",
        Side::Agent,
        agent_ws,
        Arc::new(Deny),
        Config::default(),
        TunnelMetrics::default(),
    );
    tokio::spawn(run);
    wait_for_session(&manager, "edge").await;

    session.add_client("c-downstream").await.expect("must announce client");
    wait_for_session(&manager, "c-downstream").await;

    session
        .remove_client("c-downstream")
        .await
        .expect("must withdraw client");
    time::timeout(TIMEOUT, async {
        while manager.has_session("c-downstream") {
            time::sleep(time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("client must be removed");
    assert!(manager.has_session("edge"));

    let err = manager
        .dial("c-downstream", Destination::new("tcp", "10.0.0.1:80"))
        .await
        .expect_err("dial must fail");
    assert_eq!(err, DialError::NoSession("c-downstream".to_string()));
}

#[tokio::test]
async fn repeated_connect_id_terminates_session() {
    // Accepted connections wait in the backlog, so dials complete without an accept loop.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("must bind");
    let addr = listener.local_addr().expect("must have address");
    let dst = Destination::new("tcp", addr.to_string());

    let (mut server_ws, agent_ws) = ws_pair().await;
    let agent = Agent::new(
        "ws://unused",
        "foo",
        Arc::new(LocalConnector::new(filter(&["tcp/*"]))),
    );
    let serve = tokio::spawn(async move { agent.serve(agent_ws).await });

    send_frame(&mut server_ws, Frame::connect(2, &dst)).await;
    send_frame(&mut server_ws, Frame::connect(2, &dst)).await;
    let err = time::timeout(TIMEOUT, serve)
        .await
        .expect("session must terminate")
        .expect("serve task must not panic")
        .expect_err("session must fail");
    assert!(matches!(err, SessionError::Violation(_)), "{err:?}");
    drop(listener);
}
