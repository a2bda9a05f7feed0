//! Local HTTP endpoint.
//!
//! Accepts plain HTTP/1.1 on the local port and hands every request to the
//! [`RequestRelay`], the same path tunnel requests take.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::relay::{ForwardResponse, InboundRequest, RequestRelay};

pub struct LocalListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl LocalListener {
    /// Bind on all interfaces. Port 0 picks a free port.
    pub async fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Open connections then finish the request they are serving and close;
    /// this returns once all of them are done.
    pub async fn serve(self, relay: RequestRelay, shutdown: CancellationToken) {
        let connections = TaskTracker::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept local connection: {}", e);
                        continue;
                    }
                },
            };
            debug!("Local connection from {}", peer);

            let relay = relay.clone();
            let shutdown = shutdown.clone();
            connections.spawn(async move {
                let connection = http1::Builder::new().serve_connection(
                    TokioIo::new(stream),
                    service_fn(move |req| handle_local(req, relay.clone())),
                );
                let mut connection = std::pin::pin!(connection);

                let result = tokio::select! {
                    _ = shutdown.cancelled() => {
                        connection.as_mut().graceful_shutdown();
                        connection.await
                    }
                    result = connection.as_mut() => result,
                };
                if let Err(e) = result {
                    debug!("Error serving local connection from {}: {}", peer, e);
                }
            });
        }

        connections.close();
        connections.wait().await;
        info!("Local listener on {} stopped", self.addr);
    }
}

async fn handle_local(
    req: Request<Incoming>,
    relay: RequestRelay,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (request, pending) = match InboundRequest::from_http(req).await {
        Ok(parts) => parts,
        Err(e) => {
            return Ok(
                ForwardResponse::error(400, format!("could not read request body: {}", e))
                    .into_http(),
            );
        }
    };

    relay.dispatch(request).await;
    Ok(pending.recv().await.into_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Target;
    use crate::relay::{ForwardConfig, RelayConfig, TargetClient};
    use crate::test_support::{closed_port, spawn_http_server};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start(target: &str) -> (SocketAddr, CancellationToken) {
        let client =
            TargetClient::new(Target::parse(target).unwrap(), &ForwardConfig::default()).unwrap();
        let relay = RequestRelay::new(client, &RelayConfig::default());
        let listener = LocalListener::bind(0).await.unwrap();
        let port = listener.local_addr().port();
        let shutdown = CancellationToken::new();
        tokio::spawn(listener.serve(relay, shutdown.clone()));
        (SocketAddr::from(([127, 0, 0, 1], port)), shutdown)
    }

    async fn raw_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        String::from_utf8_lossy(&raw).to_string()
    }

    #[tokio::test]
    async fn test_local_request_reaches_target() {
        let target = spawn_http_server(|req| async move {
            let body = format!("{} {}", req.method(), req.uri());
            Response::new(Full::new(Bytes::from(body)))
        })
        .await;
        let (addr, shutdown) = start(&format!("http://{}", target)).await;

        let raw = raw_request(
            addr,
            "DELETE /items/7?force=1 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(raw.starts_with("HTTP/1.1 200 OK"), "{}", raw);
        assert!(raw.ends_with("DELETE /items/7?force=1"), "{}", raw);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_target_returns_502() {
        let port = closed_port().await;
        let (addr, shutdown) = start(&format!("http://127.0.0.1:{}", port)).await;

        for _ in 0..2 {
            let raw = raw_request(
                addr,
                "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(raw.starts_with("HTTP/1.1 502 Bad Gateway"), "{}", raw);
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_finishes_request_in_flight() {
        let target = spawn_http_server(|_req| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Response::new(Full::new(Bytes::from("slow answer")))
        })
        .await;
        let client = TargetClient::new(
            Target::parse(&format!("http://{}", target)).unwrap(),
            &ForwardConfig::default(),
        )
        .unwrap();
        let relay = RequestRelay::new(client, &RelayConfig::default());
        let listener = LocalListener::bind(0).await.unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], listener.local_addr().port()));
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(listener.serve(relay.clone(), shutdown.clone()));

        let request = tokio::spawn(raw_request(
            addr,
            "GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n",
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(relay.in_flight(), 1);

        shutdown.cancel();
        relay.shutdown().await;
        serving.await.unwrap();

        let raw = request.await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK"), "{}", raw);
        assert!(raw.ends_with("slow answer"), "{}", raw);
    }
}
