//! Session and session-table behavior over in-memory connections

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

use cg_tunnel::{
    BoxedIo, ConnectRequest, PeerForward, PeerRouteUpdater, RejectConnect, Role, Session,
    SessionConfig, SessionHandler, SessionTable, TunnelError,
};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Agent-side handler: every stream is answered by an echo task
struct Echo;

#[async_trait]
impl SessionHandler for Echo {
    async fn on_connect(&self, _request: ConnectRequest) -> Result<BoxedIo, String> {
        let (near, mut far) = duplex(64 * 1024);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match far.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if far.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(near))
    }
}

/// Refuses with a fixed reason
struct Refuse;

#[async_trait]
impl SessionHandler for Refuse {
    async fn on_connect(&self, request: ConnectRequest) -> Result<BoxedIo, String> {
        Err(format!("connection refused by {}", request.address))
    }
}

/// Never answers
struct Stall;

#[async_trait]
impl SessionHandler for Stall {
    async fn on_connect(&self, _request: ConnectRequest) -> Result<BoxedIo, String> {
        std::future::pending::<()>().await;
        Err("unreachable".to_string())
    }
}

/// Manager-side session connected to an agent-side session using `agent`
fn session_pair(agent: Arc<dyn SessionHandler>) -> (Arc<Session>, Arc<Session>) {
    let (server_io, client_io) = duplex(256 * 1024);
    let server = Session::spawn(
        server_io,
        Role::Server,
        "manager",
        Arc::new(RejectConnect),
        SessionConfig::default(),
    );
    let client = Session::spawn(client_io, Role::Client, "agent", agent, SessionConfig::default());
    (server, client)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_dial_and_echo() {
    let (server, _client) = session_pair(Arc::new(Echo));

    let mut stream = server.dial("10.0.0.5:6443", None, DIAL_TIMEOUT).await.unwrap();
    stream.write_all(b"GET /healthz").await.unwrap();

    let mut buf = [0u8; 12];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"GET /healthz");
    assert_eq!(server.stream_count(), 1);

    drop(stream);
    eventually(|| server.stream_count() == 0).await;
}

#[tokio::test]
async fn test_large_payload_round_trip() {
    let (server, _client) = session_pair(Arc::new(Echo));
    let stream = server.dial("10.0.0.5:6443", None, DIAL_TIMEOUT).await.unwrap();
    let (mut rd, mut wr) = tokio::io::split(stream);

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        wr.write_all(&payload).await.unwrap();
        wr
    });

    let mut received = vec![0u8; expected.len()];
    rd.read_exact(&mut received).await.unwrap();
    assert_eq!(received, expected);
    writer.await.unwrap();
}

/// A stream whose echo is never read must not hold up other streams
#[tokio::test]
async fn test_unread_stream_does_not_stall_session() {
    let (server, _client) = session_pair(Arc::new(Echo));

    let stalled = server.dial("10.0.0.5:6443", None, DIAL_TIMEOUT).await.unwrap();
    let (_unread, mut wr) = tokio::io::split(stalled);
    let writer = tokio::spawn(async move {
        let _ = wr.write_all(&vec![0u8; 1024 * 1024]).await;
        wr
    });
    // let the echo back up into the unread stream
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut other = server
        .dial("10.0.0.5:6443", None, Duration::from_secs(2))
        .await
        .expect("second stream should open while the first is backed up");
    other.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(2), other.read_exact(&mut buf))
        .await
        .expect("echo on the second stream")
        .unwrap();
    assert_eq!(&buf, b"ping");

    assert!(!server.is_closed());
    assert!(!writer.is_finished());
    writer.abort();
}

#[tokio::test]
async fn test_dial_refused() {
    let (server, _client) = session_pair(Arc::new(Refuse));

    let err = server.dial("10.0.0.5:6443", None, DIAL_TIMEOUT).await.unwrap_err();
    match err {
        TunnelError::DialFailed { address, reason } => {
            assert_eq!(address, "10.0.0.5:6443");
            assert!(reason.contains("refused"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_dial_timeout() {
    let (server, _client) = session_pair(Arc::new(Stall));

    let err = server
        .dial("10.0.0.5:6443", None, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::DialTimeout(_)));
}

#[tokio::test]
async fn test_agent_cannot_dial_manager() {
    let (_server, client) = session_pair(Arc::new(Echo));
    let err = client.dial("127.0.0.1:22", None, DIAL_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, TunnelError::DialFailed { .. }));
}

#[tokio::test]
async fn test_remote_close_ends_session_and_streams() {
    let (server, client) = session_pair(Arc::new(Echo));
    let mut stream = server.dial("10.0.0.5:6443", None, DIAL_TIMEOUT).await.unwrap();

    client.close();
    tokio::time::timeout(Duration::from_secs(5), server.closed())
        .await
        .expect("server session should close");

    let mut buf = Vec::new();
    assert_eq!(stream.read_to_end(&mut buf).await.unwrap(), 0);
    assert!(matches!(
        server.dial("10.0.0.5:6443", None, DIAL_TIMEOUT).await,
        Err(TunnelError::SessionClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_silent_remote_times_out() {
    // the far end is never read, so no heartbeat is ever answered
    let (server_io, _silent) = duplex(1024 * 1024);
    let session = Session::spawn(
        server_io,
        Role::Server,
        "silent",
        Arc::new(RejectConnect),
        SessionConfig {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(3),
        },
    );

    tokio::time::timeout(Duration::from_secs(10), session.closed())
        .await
        .expect("session should time out");
}

#[tokio::test]
async fn test_table_prefers_newest_local_session() {
    let table = SessionTable::new();
    let (old_server, _old_client) = session_pair(Arc::new(Refuse));
    let (new_server, _new_client) = session_pair(Arc::new(Echo));

    table.add_local("c-1", Arc::clone(&old_server));
    table.add_local("c-1", Arc::clone(&new_server));
    assert!(table.has_session("c-1"));
    assert!(table
        .dial("c-1", "10.0.0.5:6443", DIAL_TIMEOUT)
        .await
        .is_ok());

    table.remove_local("c-1", &new_server);
    assert!(matches!(
        table.dial("c-1", "10.0.0.5:6443", DIAL_TIMEOUT).await,
        Err(TunnelError::DialFailed { .. })
    ));

    table.remove_local("c-1", &old_server);
    assert!(!table.has_session("c-1"));
    assert!(matches!(
        table.dial("c-1", "10.0.0.5:6443", DIAL_TIMEOUT).await,
        Err(TunnelError::NoSession(_))
    ));
}

#[tokio::test]
async fn test_closed_session_is_not_live() {
    let table = SessionTable::new();
    let (server, _client) = session_pair(Arc::new(Echo));
    table.add_local("c-1", Arc::clone(&server));

    server.close();
    assert!(!table.has_session("c-1"));
    assert!(table.local_keys().is_empty());
}

/// Replica A holds the agent session; replica B linked to A and dials
/// through it.
#[tokio::test]
async fn test_dial_through_peer_link() {
    let table_a = Arc::new(SessionTable::new());
    let table_b = Arc::new(SessionTable::new());

    // B -> A link
    let (a_io, b_io) = duplex(256 * 1024);
    let a_side = Session::spawn(
        a_io,
        Role::Server,
        "peer:b",
        Arc::new(PeerForward::new(Arc::clone(&table_a), DIAL_TIMEOUT)),
        SessionConfig::default(),
    );
    let b_side = Session::spawn(
        b_io,
        Role::Client,
        "peer:a",
        Arc::new(PeerRouteUpdater::new(Arc::clone(&table_b), "a")),
        SessionConfig::default(),
    );
    table_b.set_peer_route("a", Arc::clone(&b_side));
    table_a.add_inbound_peer("b", Arc::clone(&a_side));
    assert!(!table_b.has_session("c-1"));

    // agent registers with A after the link is up
    let (agent_session, agent) = session_pair(Arc::new(Echo));
    table_a.add_local("c-1", Arc::clone(&agent_session));

    eventually(|| table_b.has_session("c-1")).await;

    let mut stream = table_b.dial("c-1", "10.0.0.5:6443", DIAL_TIMEOUT).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    drop(stream);

    // agent goes away; B learns the key is gone
    agent.close();
    tokio::time::timeout(Duration::from_secs(5), agent_session.closed())
        .await
        .unwrap();
    table_a.remove_local("c-1", &agent_session);
    eventually(|| !table_b.has_session("c-1")).await;
}

#[tokio::test]
async fn test_inbound_peer_learns_existing_keys() {
    let table_a = Arc::new(SessionTable::new());
    let table_b = Arc::new(SessionTable::new());

    let (agent_session, _agent) = session_pair(Arc::new(Echo));
    table_a.add_local("c-1", agent_session);

    let (a_io, b_io) = duplex(64 * 1024);
    let a_side = Session::spawn(
        a_io,
        Role::Server,
        "peer:b",
        Arc::new(PeerForward::new(Arc::clone(&table_a), DIAL_TIMEOUT)),
        SessionConfig::default(),
    );
    let b_side = Session::spawn(
        b_io,
        Role::Client,
        "peer:a",
        Arc::new(PeerRouteUpdater::new(Arc::clone(&table_b), "a")),
        SessionConfig::default(),
    );
    table_b.set_peer_route("a", Arc::clone(&b_side));
    table_a.add_inbound_peer("b", a_side);

    eventually(|| table_b.has_session("c-1")).await;
    assert_eq!(table_b.peer_ids(), vec!["a".to_string()]);

    table_b.remove_peer_route("a", &b_side);
    assert!(!table_b.has_session("c-1"));
}
