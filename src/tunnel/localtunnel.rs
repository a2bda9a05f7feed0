//! localtunnel relay transport.
//!
//! The handshake is a plain HTTP request asking the relay for a tunnel. The
//! relay answers with a TCP port and a socket budget; the client then dials
//! that many sockets and the relay writes public HTTP traffic onto them. Each
//! socket is served as an HTTP/1.1 server connection. The relay closes idle
//! sockets, so a closed socket is simply dialed again.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TunnelError;
use crate::relay::{ForwardResponse, InboundRequest};

use super::{SessionLink, TunnelConfig};

/// Pause before redialing a socket the relay closed
const REDIAL_DELAY: Duration = Duration::from_secs(1);

/// Tunnel assignment returned by the relay
#[derive(Debug, Deserialize)]
struct TunnelAssignment {
    id: String,
    port: u16,
    #[serde(default = "default_max_conn")]
    max_conn_count: usize,
    url: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    cached_url: Option<String>,
}

fn default_max_conn() -> usize {
    1
}

#[derive(Debug, Deserialize)]
struct RelayRejection {
    message: Option<String>,
}

/// Ask the relay for a tunnel and start the socket pool. Returns the public URL.
pub(super) async fn connect(
    config: &TunnelConfig,
    link: SessionLink,
) -> Result<String, TunnelError> {
    let relay = Url::parse(&config.relay_host).map_err(|e| {
        TunnelError::unreachable(format!("invalid relay host '{}': {}", config.relay_host, e))
    })?;
    let endpoint = assignment_url(&config.relay_host, config.requested_subdomain.as_deref());
    debug!("Requesting tunnel from {}", endpoint);

    let response = reqwest::Client::new()
        .get(&endpoint)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                TunnelError::timeout(config.handshake_timeout)
            } else {
                TunnelError::unreachable(format!("{}: {}", endpoint, e))
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<RelayRejection>(&body)
            .ok()
            .and_then(|r| r.message)
            .unwrap_or_else(|| format!("relay answered {}", status));
        return Err(TunnelError::rejected(message));
    }

    let assignment: TunnelAssignment = response
        .json()
        .await
        .map_err(|e| TunnelError::rejected(format!("malformed tunnel assignment: {}", e)))?;

    let remote_host = match assignment.ip.clone() {
        Some(ip) => ip,
        None => relay
            .host_str()
            .map(|h| h.to_string())
            .ok_or_else(|| TunnelError::unreachable("relay host has no hostname"))?,
    };
    let remote_addr = format!("{}:{}", remote_host, assignment.port);

    info!(
        "Tunnel {} assigned on {} ({} socket(s))",
        assignment.id, remote_addr, assignment.max_conn_count
    );
    if let Some(cached) = &assignment.cached_url {
        debug!("Cached URL: {}", cached);
    }

    // Dial the first socket up front so a firewalled tunnel port fails the handshake
    let first = TcpStream::connect(&remote_addr).await.map_err(|e| {
        TunnelError::unreachable(format!(
            "connection refused: {} (check your firewall settings): {}",
            remote_addr, e
        ))
    })?;

    let mut first = Some(first);
    for _ in 0..assignment.max_conn_count.max(1) {
        link.spawn(socket_worker(remote_addr.clone(), first.take(), link.clone()));
    }

    Ok(assignment.url)
}

/// `GET {host}/{subdomain}` for a requested subdomain, `GET {host}/?new` to let
/// the relay pick one
fn assignment_url(relay_host: &str, subdomain: Option<&str>) -> String {
    let base = relay_host.trim_end_matches('/');
    match subdomain.filter(|s| !s.is_empty()) {
        Some(subdomain) => format!("{}/{}", base, subdomain),
        None => format!("{}/?new", base),
    }
}

/// Keep one tunnel socket alive, serving whatever the relay sends on it.
///
/// On cancellation the current connection finishes the request it is
/// serving, so a reply already in progress is still written.
async fn socket_worker(remote_addr: String, mut socket: Option<TcpStream>, link: SessionLink) {
    let cancel = link.cancel_token().clone();

    loop {
        let stream = match socket.take() {
            Some(stream) => stream,
            None => {
                let dial = TcpStream::connect(&remote_addr);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = dial => match result {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!("Tunnel socket to {} could not be reopened: {}", remote_addr, e);
                            link.disconnect(format!("relay {} unreachable: {}", remote_addr, e))
                                .await;
                            return;
                        }
                    },
                }
            }
        };
        debug!("Tunnel socket connected to {}", remote_addr);

        let service_link = link.clone();
        let connection = http1::Builder::new().serve_connection(
            TokioIo::new(stream),
            service_fn(move |req| intake(req, service_link.clone())),
        );
        let mut connection = std::pin::pin!(connection);

        tokio::select! {
            _ = cancel.cancelled() => {
                connection.as_mut().graceful_shutdown();
                if let Err(e) = connection.await {
                    debug!("Tunnel socket error while closing: {}", e);
                }
                return;
            }
            result = connection.as_mut() => {
                if let Err(e) = result {
                    debug!("Tunnel socket error: {}", e);
                }
            }
        }

        debug!("Tunnel socket closed by relay, reopening in {:?}", REDIAL_DELAY);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(REDIAL_DELAY) => {}
        }
    }
}

/// Turn a request read off a tunnel socket into an inbound request and wait
/// for its reply
async fn intake(
    req: Request<Incoming>,
    link: SessionLink,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (request, pending) = match InboundRequest::from_http(req).await {
        Ok(parts) => parts,
        Err(e) => {
            let reply = ForwardResponse::error(400, format!("could not read request body: {}", e));
            return Ok(reply.into_http());
        }
    };

    link.deliver(request).await;
    Ok(pending.recv().await.into_http())
}
