//! Listener end-to-end tests.
//!
//! Runs the real listener on a loopback port in front of raw-TCP replicas
//! and talks to it over plain sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use tiergrid_core::{Endpoint, PoolPolicy, Protocol, ProtocolRequirement, ReplicaHealth};
use tiergrid_proxy::{serve, PathRouter, RouteRule, TargetPool};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Replica answering every request with a fixed body.
async fn http_replica(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                let forwarded = head.to_ascii_lowercase().contains("x-forwarded-for: 127.0.0.1");
                let body = if forwarded { body.to_string() } else { format!("{body}-unforwarded") };
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

/// Replica that accepts an upgrade and echoes every byte afterwards.
async fn echo_replica() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                read_head(&mut stream).await;
                let switch = "HTTP/1.1 101 Switching Protocols\r\nconnection: upgrade\r\nupgrade: websocket\r\n\r\n";
                if stream.write_all(switch.as_bytes()).await.is_err() {
                    return;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn pool(name: &str, policy: PoolPolicy, replica: Option<SocketAddr>) -> Arc<TargetPool> {
    let pool = TargetPool::new(name, policy);
    if let Some(addr) = replica {
        let id = format!("{name}-0");
        pool.add_replica(&id, Endpoint::new("127.0.0.1", addr.port(), Protocol::Http))
            .unwrap();
        pool.set_health(&id, ReplicaHealth::Healthy);
    }
    Arc::new(pool)
}

async fn start(router: PathRouter) -> (SocketAddr, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    tokio::spawn(serve(listener, Arc::new(router), rx));
    (addr, tx)
}

async fn get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn standard_router(web: Arc<TargetPool>, game: Arc<TargetPool>) -> PathRouter {
    PathRouter::new(
        vec![
            RouteRule::new("/ws/*", ProtocolRequirement::UpgradeRequired, "game", 100).unwrap(),
            RouteRule::new("/api/*", ProtocolRequirement::Any, "web", 200).unwrap(),
        ],
        vec![web, game],
    )
    .unwrap()
}

#[tokio::test]
async fn forwards_plain_request_to_web_pool() {
    let web = pool("web", PoolPolicy::request_response(), Some(http_replica("web-ok").await));
    let game = pool("game", PoolPolicy::streaming(), Some(http_replica("game-ok").await));
    let (addr, _shutdown) = start(standard_router(web, game)).await;

    let response = get(addr, "/api/games").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("web-ok"), "{response}");
    assert!(!response.to_ascii_lowercase().contains("set-cookie"));
}

#[tokio::test]
async fn unmatched_path_is_404() {
    let web = pool("web", PoolPolicy::request_response(), Some(http_replica("web-ok").await));
    let game = pool("game", PoolPolicy::streaming(), None);
    let (addr, _shutdown) = start(standard_router(web, game)).await;

    let response = get(addr, "/index.html").await;
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");
}

#[tokio::test]
async fn pool_without_healthy_replica_is_503() {
    let web = pool("web", PoolPolicy::request_response(), None);
    let game = pool("game", PoolPolicy::streaming(), None);
    let (addr, _shutdown) = start(standard_router(web, game)).await;

    let response = get(addr, "/api/games").await;
    assert!(response.starts_with("HTTP/1.1 503"), "{response}");
}

#[tokio::test]
async fn unreachable_replica_is_502() {
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let web = pool("web", PoolPolicy::request_response(), Some(dead));
    let game = pool("game", PoolPolicy::streaming(), None);
    let (addr, _shutdown) = start(standard_router(web, game)).await;

    let response = get(addr, "/api/games").await;
    assert!(response.starts_with("HTTP/1.1 502"), "{response}");
}

#[tokio::test]
async fn upgrade_is_tunnelled_to_streaming_pool() {
    let web = pool("web", PoolPolicy::request_response(), Some(http_replica("web-ok").await));
    let game = pool("game", PoolPolicy::streaming(), Some(echo_replica().await));
    let (addr, _shutdown) = start(standard_router(web, Arc::clone(&game))).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /ws/lobby HTTP/1.1\r\nhost: localhost\r\nconnection: Upgrade\r\nupgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");
    assert!(
        head.to_ascii_lowercase().contains("set-cookie: tiergrid_affinity="),
        "{head}"
    );

    stream.write_all(b"hello replica").await.unwrap();
    let mut echoed = [0u8; 13];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello replica");
    assert_eq!(game.affinity().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_upgrade_issues_no_affinity() {
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let web = pool("web", PoolPolicy::request_response(), None);
    let game = pool("game", PoolPolicy::streaming(), Some(dead));
    let (addr, _shutdown) = start(standard_router(web, Arc::clone(&game))).await;

    for _ in 0..3 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /ws/lobby HTTP/1.1\r\nhost: localhost\r\nconnection: Upgrade\r\nupgrade: websocket\r\n\r\n",
            )
            .await
            .unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 502"), "{head}");
        assert!(!head.to_ascii_lowercase().contains("set-cookie"), "{head}");
    }
    assert!(game.affinity().unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let web = pool("web", PoolPolicy::request_response(), None);
    let game = pool("game", PoolPolicy::streaming(), None);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(serve(listener, Arc::new(standard_router(web, game)), rx));

    tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}
