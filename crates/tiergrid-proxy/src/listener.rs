//! Public listener: accepts client connections and forwards each request
//! to the replica chosen by the [`PathRouter`].
//!
//! Plain requests are relayed through a fresh upstream HTTP/1 connection.
//! Requests carrying upgrade intent are relayed the same way, and on a
//! `101 Switching Protocols` answer both sides are spliced into a raw
//! byte tunnel that lives until either end closes or stays silent past
//! the pool's idle timeout.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, SET_COOKIE};
use http::{Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tiergrid_core::{Endpoint, StickinessPolicy};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{ForwardError, RouteError};
use crate::router::{InboundRequest, PathRouter};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TUNNEL_BUFFER: usize = 16 * 1024;

/// Accept connections until `shutdown` flips to true or its sender drops.
pub async fn serve(
    listener: TcpListener,
    router: Arc<PathRouter>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let local = listener.local_addr()?;
    info!(%local, "listener accepting connections");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let router = Arc::clone(&router);
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(Arc::clone(&router), peer, req));
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await
                    {
                        debug!(%peer, error = %e, "client connection ended with error");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(%local, "listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle(
    router: Arc<PathRouter>,
    peer: SocketAddr,
    mut req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
    let inbound = InboundRequest::from_http(&req);
    let dispatch = match router.dispatch(&inbound) {
        Ok(dispatch) => dispatch,
        Err(e) => {
            let status = match e {
                RouteError::NoRoute { .. } => StatusCode::NOT_FOUND,
                RouteError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            };
            debug!(path = %inbound.path, %status, reason = %e, "request not routed");
            return Ok(status_response(status, &e.to_string()));
        }
    };

    let replica = &dispatch.selection.replica;
    let policy = dispatch.pool.policy();
    if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
        req.headers_mut().insert("x-forwarded-for", value);
    }

    let forwarded = if inbound.wants_upgrade {
        forward_upgrade(req, &replica.endpoint, policy.idle_timeout).await
    } else {
        forward(req, &replica.endpoint, policy.idle_timeout).await
    };

    let mut response = match forwarded {
        Ok(response) => response,
        Err(e) => {
            warn!(
                pool = %dispatch.pool.name(),
                replica = %replica.id,
                error = %e,
                "forwarding failed"
            );
            return Ok(status_response(StatusCode::BAD_GATEWAY, &e.to_string()));
        }
    };

    // Only a session the replica accepted gets a binding and a cookie.
    let status = response.status();
    if status == StatusCode::SWITCHING_PROTOCOLS || status.is_success() {
        if let (Some(key), Some(sticky)) = (dispatch.commit_affinity(), &policy.stickiness) {
            if let Ok(value) = HeaderValue::from_str(&affinity_cookie(sticky, key)) {
                response.headers_mut().append(SET_COOKIE, value);
            }
        }
    }
    Ok(response)
}

fn affinity_cookie(sticky: &StickinessPolicy, key: &str) -> String {
    format!(
        "{}={key}; Path=/; Max-Age={}; HttpOnly",
        sticky.cookie,
        sticky.duration.as_secs()
    )
}

fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{message}\n")))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

async fn connect(endpoint: &Endpoint) -> Result<TcpStream, ForwardError> {
    let authority = endpoint.authority();
    match timeout(CONNECT_TIMEOUT, TcpStream::connect(&authority)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ForwardError::Connect { authority, source }),
        Err(_) => Err(ForwardError::ConnectTimeout(authority)),
    }
}

/// Relay one request/response exchange. The whole exchange must finish
/// within `idle`.
pub async fn forward(
    req: Request<Incoming>,
    endpoint: &Endpoint,
    idle: Duration,
) -> Result<Response<ProxyBody>, ForwardError> {
    let stream = connect(endpoint).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(ForwardError::Handshake)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "upstream connection ended with error");
        }
    });

    let response = timeout(idle, sender.send_request(req))
        .await
        .map_err(|_| ForwardError::Idle(idle))?
        .map_err(ForwardError::Upstream)?;
    Ok(response.map(|body| body.boxed()))
}

/// Relay an upgrade request. A `101` from the replica turns into a tunnel
/// between the client and the replica; any other answer is relayed as is.
pub async fn forward_upgrade(
    mut req: Request<Incoming>,
    endpoint: &Endpoint,
    idle: Duration,
) -> Result<Response<ProxyBody>, ForwardError> {
    let client_side = hyper::upgrade::on(&mut req);

    let stream = connect(endpoint).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(ForwardError::Handshake)?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "upstream connection ended with error");
        }
    });

    let mut response = timeout(idle, sender.send_request(req))
        .await
        .map_err(|_| ForwardError::Idle(idle))?
        .map_err(ForwardError::Upstream)?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Ok(response.map(|body| body.boxed()));
    }

    let upstream_side = hyper::upgrade::on(&mut response);
    let authority = endpoint.authority();
    tokio::spawn(async move {
        match tokio::try_join!(client_side, upstream_side) {
            Ok((client, upstream)) => {
                match tunnel(TokioIo::new(client), TokioIo::new(upstream), idle).await {
                    Ok((sent, received)) => {
                        debug!(%authority, sent, received, "tunnel closed");
                    }
                    Err(e) => debug!(%authority, error = %e, "tunnel aborted"),
                }
            }
            Err(e) => warn!(%authority, error = %e, "upgrade handoff failed"),
        }
    });

    Ok(response.map(|body| body.boxed()))
}

/// Copy bytes both ways until both directions are closed.
///
/// Returns `(a_to_b, b_to_a)` byte counts. Fails with `TimedOut` when no
/// byte moves in either direction for `idle`.
pub async fn tunnel<A, B>(a: A, b: B, idle: Duration) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut a_buf = vec![0u8; TUNNEL_BUFFER];
    let mut b_buf = vec![0u8; TUNNEL_BUFFER];
    let (mut a_to_b, mut b_to_a) = (0u64, 0u64);
    let (mut a_open, mut b_open) = (true, true);

    while a_open || b_open {
        tokio::select! {
            read = a_read.read(&mut a_buf), if a_open => {
                let n = read?;
                if n == 0 {
                    a_open = false;
                    let _ = b_write.shutdown().await;
                } else {
                    b_write.write_all(&a_buf[..n]).await?;
                    a_to_b += n as u64;
                }
            }
            read = b_read.read(&mut b_buf), if b_open => {
                let n = read?;
                if n == 0 {
                    b_open = false;
                    let _ = a_write.shutdown().await;
                } else {
                    a_write.write_all(&b_buf[..n]).await?;
                    b_to_a += n as u64;
                }
            }
            _ = tokio::time::sleep(idle) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no traffic for {idle:?}"),
                ));
            }
        }
    }
    Ok((a_to_b, b_to_a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn tunnel_copies_both_directions() {
        let (mut client, proxy_a) = tokio::io::duplex(64);
        let (proxy_b, mut upstream) = tokio::io::duplex(64);
        let task = tokio::spawn(tunnel(proxy_a, proxy_b, StdDuration::from_secs(5)));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);
        drop(upstream);
        let (sent, received) = task.await.unwrap().unwrap();
        assert_eq!((sent, received), (4, 5));
    }

    #[tokio::test]
    async fn tunnel_closes_when_idle() {
        let (_client, proxy_a) = tokio::io::duplex(64);
        let (proxy_b, _upstream) = tokio::io::duplex(64);
        let err = tunnel(proxy_a, proxy_b, StdDuration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn traffic_resets_idle_timer() {
        let (mut client, proxy_a) = tokio::io::duplex(64);
        let (proxy_b, mut upstream) = tokio::io::duplex(64);
        let task = tokio::spawn(tunnel(proxy_a, proxy_b, StdDuration::from_millis(200)));

        for _ in 0..5 {
            tokio::time::sleep(StdDuration::from_millis(80)).await;
            client.write_all(b"x").await.unwrap();
            let mut buf = [0u8; 1];
            upstream.read_exact(&mut buf).await.unwrap();
        }
        drop(client);
        drop(upstream);
        let (sent, _) = task.await.unwrap().unwrap();
        assert_eq!(sent, 5);
    }

    #[test]
    fn affinity_cookie_format() {
        let sticky = StickinessPolicy {
            cookie: "TIERGRID_AFFINITY".to_string(),
            duration: StdDuration::from_secs(86_400),
        };
        assert_eq!(
            affinity_cookie(&sticky, "abc"),
            "TIERGRID_AFFINITY=abc; Path=/; Max-Age=86400; HttpOnly"
        );
    }
}
