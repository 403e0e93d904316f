//! Registration endpoint tests: rejections in-process, registration over TCP

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::routing::get;
use axum::Router;
use http::header::{CONNECTION, UPGRADE};
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tower::ServiceExt;

use cg_core::{RegistrationError, StoreError};
use cg_tunnel::{
    Authorizer, DirectConnect, SessionTable, TunnelClient, TunnelServer, PEER_ID_HEADER,
    PEER_TOKEN_HEADER, UPGRADE_PROTOCOL,
};

const REGISTER_PATH: &str = "/tunnels/register";

/// Accepts the key in `x-key`; `fail` rejects, `store-down` fails
#[derive(Default)]
struct HeaderAuthorizer {
    disconnects: AtomicUsize,
}

#[async_trait]
impl Authorizer for HeaderAuthorizer {
    async fn authorize(&self, headers: &HeaderMap) -> Result<String, RegistrationError> {
        match headers.get("x-key").and_then(|v| v.to_str().ok()) {
            None | Some("") => Err(RegistrationError::MissingClusterId),
            Some("store-down") => Err(RegistrationError::Store(StoreError::Unavailable(
                "down".to_string(),
            ))),
            Some(key) => Ok(key.to_string()),
        }
    }

    async fn on_disconnect(&self, _key: &str) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

fn router(server: Arc<TunnelServer>) -> Router {
    Router::new().route(
        REGISTER_PATH,
        get(move |request: Request| {
            let server = Arc::clone(&server);
            async move { server.accept(request).await }
        }),
    )
}

fn tunnel_server(authorizer: Arc<HeaderAuthorizer>) -> Arc<TunnelServer> {
    Arc::new(
        TunnelServer::new(Arc::new(SessionTable::new()), authorizer).with_peer_token("peer-secret"),
    )
}

fn upgrade_request(extra: &[(&str, &str)]) -> Request {
    let mut builder = http::Request::builder()
        .uri(REGISTER_PATH)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, UPGRADE_PROTOCOL);
    for (name, value) in extra {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).unwrap()
}

async fn status_of(server: Arc<TunnelServer>, request: Request) -> StatusCode {
    router(server).oneshot(request).await.unwrap().status()
}

#[tokio::test]
async fn test_missing_upgrade_is_426() {
    let server = tunnel_server(Arc::default());
    let request = http::Request::builder()
        .uri(REGISTER_PATH)
        .header("x-key", "c-1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(status_of(server, request).await, StatusCode::UPGRADE_REQUIRED);
}

#[tokio::test]
async fn test_rejected_registration_is_400() {
    let server = tunnel_server(Arc::default());
    assert_eq!(
        status_of(server, upgrade_request(&[])).await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn test_store_failure_is_500() {
    let server = tunnel_server(Arc::default());
    assert_eq!(
        status_of(server, upgrade_request(&[("x-key", "store-down")])).await,
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[tokio::test]
async fn test_bad_peer_token_is_401() {
    let server = tunnel_server(Arc::default());
    let request = upgrade_request(&[(PEER_TOKEN_HEADER, "wrong"), (PEER_ID_HEADER, "10.0.0.2:8080")]);
    assert_eq!(status_of(server, request).await, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_peer_links_disabled_without_token() {
    let server = Arc::new(TunnelServer::new(
        Arc::new(SessionTable::new()),
        Arc::new(HeaderAuthorizer::default()),
    ));
    let request = upgrade_request(&[(PEER_TOKEN_HEADER, ""), (PEER_ID_HEADER, "10.0.0.2:8080")]);
    assert_eq!(status_of(server, request).await, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_peer_without_id_is_400() {
    let server = tunnel_server(Arc::default());
    let request = upgrade_request(&[(PEER_TOKEN_HEADER, "peer-secret")]);
    assert_eq!(status_of(server, request).await, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_agent_registers_over_tcp_and_serves_dials() {
    // service only the agent can reach
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = backend.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 5];
                if socket.read_exact(&mut buf).await.is_ok() {
                    let _ = socket.write_all(&buf).await;
                }
            });
        }
    });

    let authorizer = Arc::new(HeaderAuthorizer::default());
    let server = tunnel_server(Arc::clone(&authorizer));
    let table = Arc::clone(server.table());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let manager_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(server)).await.unwrap();
    });

    let mut headers = HeaderMap::new();
    headers.insert("x-key", HeaderValue::from_static("c-1"));
    let client = TunnelClient::new(
        format!("http://{}{}", manager_addr, REGISTER_PATH),
        headers,
        None,
    )
    .unwrap();
    let agent = client
        .connect(Arc::new(DirectConnect::new(Duration::from_secs(2))))
        .await
        .unwrap();

    for _ in 0..200 {
        if table.has_session("c-1") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(table.has_session("c-1"));

    let mut stream = table
        .dial("c-1", &backend_addr.to_string(), Duration::from_secs(5))
        .await
        .unwrap();
    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    agent.close();
    for _ in 0..200 {
        if authorizer.disconnects.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!table.has_session("c-1"));
    assert_eq!(authorizer.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_client_reports_refusal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tunnel_server(Arc::default());
    tokio::spawn(async move {
        axum::serve(listener, router(server)).await.unwrap();
    });

    let client = TunnelClient::new(
        format!("http://{}{}", addr, REGISTER_PATH),
        HeaderMap::new(),
        None,
    )
    .unwrap();
    let err = client
        .connect(Arc::new(DirectConnect::new(Duration::from_secs(1))))
        .await
        .unwrap_err();
    assert!(matches!(err, cg_tunnel::TunnelError::Refused { status: 400, .. }));
}
