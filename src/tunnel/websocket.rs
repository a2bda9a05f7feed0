//! WebSocket relay transport.
//!
//! One WebSocket carries JSON frames in both directions: the client
//! registers, the relay pushes `tunnel_request` frames and the client answers
//! each with a `tunnel_response` carrying the same request id.

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::TunnelError;
use crate::protocol::{
    decode_body, header_pairs, request_target, IncomingMessage, OutgoingMessage, RequestId,
};
use crate::relay::{headers_from_pairs, ForwardResponse, InboundRequest};

use super::{SessionLink, TunnelConfig};

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Register with the relay and start the frame pumps. Returns the public URL.
pub(super) async fn connect(
    config: &TunnelConfig,
    link: SessionLink,
) -> Result<String, TunnelError> {
    let ws_url = websocket_url(&config.relay_host)?;
    info!("Connecting to {}...", ws_url);

    let (ws_stream, _) = connect_async(ws_url.as_str())
        .await
        .map_err(|e| TunnelError::unreachable(format!("{}: {}", ws_url, e)))?;

    let (mut write, mut read) = ws_stream.split();

    let register =
        OutgoingMessage::register_tunnel(config.local_port, config.requested_subdomain.as_deref());
    let json = register
        .to_json()
        .map_err(|e| TunnelError::rejected(e.to_string()))?;
    write
        .send(Message::Text(json))
        .await
        .map_err(|e| TunnelError::unreachable(e.to_string()))?;
    debug!("Sent register_tunnel for port {}", config.local_port);

    let full_url = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match IncomingMessage::from_json(&text) {
                Ok(IncomingMessage::TunnelRegistered {
                    tunnel_id,
                    subdomain,
                    full_url,
                }) => {
                    info!("Tunnel registered: {} ({})", full_url, subdomain);
                    debug!("Tunnel id: {}", tunnel_id);
                    break full_url;
                }
                Ok(IncomingMessage::Error { code, message }) => {
                    return Err(TunnelError::rejected(format!("{}: {}", code, message)));
                }
                Ok(other) => debug!("Ignoring message before registration: {:?}", other),
                Err(e) => {
                    return Err(TunnelError::rejected(format!("malformed relay message: {}", e)));
                }
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(TunnelError::rejected(
                    "relay closed the connection during registration",
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(TunnelError::unreachable(e.to_string())),
        }
    };

    // All writes funnel through one task that owns the sink
    let (out_tx, out_rx) = mpsc::channel::<Message>(256);
    let cancel = link.cancel_token().clone();

    link.spawn(write_frames(write, out_rx));
    link.spawn(send_heartbeats(
        out_tx.clone(),
        heartbeat_interval(config.idle_timeout),
        cancel,
    ));
    link.spawn(read_frames(read, out_tx, config.idle_timeout, link.clone()));

    Ok(full_url)
}

/// `http(s)://host` becomes `ws(s)://host/tunnel/ws`; ws URLs are used as given
fn websocket_url(relay_host: &str) -> Result<Url, TunnelError> {
    let mut url = Url::parse(relay_host).map_err(|e| {
        TunnelError::unreachable(format!("invalid relay host '{}': {}", relay_host, e))
    })?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TunnelError::unreachable(format!(
                "unsupported relay scheme '{}'",
                other
            )))
        }
    };
    let rewrite_path = matches!(url.scheme(), "http" | "https");

    url.set_scheme(scheme)
        .map_err(|_| TunnelError::unreachable("cannot build WebSocket URL"))?;
    if rewrite_path && (url.path().is_empty() || url.path() == "/") {
        url.set_path("/tunnel/ws");
    }
    Ok(url)
}

/// Ping often enough that a healthy relay answers well within the idle timeout
fn heartbeat_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 3).max(MIN_HEARTBEAT_INTERVAL)
}

/// Write queued frames until every sender is gone, then close the socket.
///
/// Senders are the reader, the heartbeat task and one reply writer per
/// outstanding request, so pending replies are flushed before the close.
async fn write_frames(
    mut write: SplitSink<WsStream, Message>,
    mut out_rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = out_rx.recv().await {
        if let Err(e) = write.send(msg).await {
            debug!("Send error (connection closing): {}", e);
            return;
        }
    }
    let _ = write.send(Message::Close(None)).await;
}

async fn send_heartbeats(
    out_tx: mpsc::Sender<Message>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if out_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                let Ok(json) = OutgoingMessage::heartbeat().to_json() else { continue };
                if out_tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn read_frames(
    mut read: SplitStream<WsStream>,
    out_tx: mpsc::Sender<Message>,
    idle_timeout: Duration,
    link: SessionLink,
) {
    let cancel = link.cancel_token().clone();

    let reason = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = tokio::time::timeout(idle_timeout, read.next()) => match frame {
                Ok(frame) => frame,
                Err(_) => break format!("no traffic from relay for {:?}", idle_timeout),
            },
        };

        match frame {
            Some(Ok(Message::Text(text))) => handle_message(&text, &out_tx, &link).await,
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                let _ = out_tx.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(frame))) => {
                break format!(
                    "relay closed connection: {}",
                    frame.map(|f| f.reason.to_string()).unwrap_or_default()
                );
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("WebSocket read error: {}", e),
            None => break "WebSocket stream ended".to_string(),
        }
    };

    warn!("Tunnel lost: {}", reason);
    link.disconnect(reason).await;
}

async fn handle_message(text: &str, out_tx: &mpsc::Sender<Message>, link: &SessionLink) {
    let msg = match IncomingMessage::from_json(text) {
        Ok(msg) => msg,
        Err(e) => {
            error!("Error handling message: {}", e);
            return;
        }
    };

    match msg {
        IncomingMessage::TunnelRequest {
            request_id,
            method,
            path,
            query_string,
            headers,
            body,
            body_encoding,
            client_ip,
        } => {
            debug!(
                "Relay request {} from {}",
                request_id,
                client_ip.as_deref().unwrap_or("unknown")
            );
            let body = match decode_body(body.as_deref(), body_encoding.as_deref()) {
                Ok(body) => body,
                Err(e) => {
                    warn!("Rejecting relay request {}: undecodable body: {}", request_id, e);
                    let message = format!("could not decode request body: {}", e);
                    write_reply(out_tx, &request_id, ForwardResponse::error(400, message)).await;
                    return;
                }
            };
            let (request, pending) = InboundRequest::new(
                method,
                request_target(&path, &query_string),
                headers_from_pairs(header_pairs(headers)),
                Bytes::from(body),
            );

            // Reply writer first, so the request is answered even if delivery fails
            let out_tx = out_tx.clone();
            link.spawn(async move {
                let response = pending.recv().await;
                write_reply(&out_tx, &request_id, response).await;
            });

            link.deliver(request).await;
        }
        IncomingMessage::TunnelRegistered { full_url, .. } => {
            debug!("Ignoring repeated registration for {}", full_url);
        }
        IncomingMessage::Heartbeat { .. } => {
            debug!("Received heartbeat");
        }
        IncomingMessage::Error { code, message } => {
            error!("Relay error: {} - {}", code, message);
        }
    }
}

/// Queue the `tunnel_response` frame for one request
async fn write_reply(
    out_tx: &mpsc::Sender<Message>,
    request_id: &RequestId,
    response: ForwardResponse,
) {
    let headers = response.header_pairs();
    let body = (!response.body.is_empty()).then(|| response.body.to_vec());
    let msg = OutgoingMessage::tunnel_response(request_id, response.status, headers, body);

    match msg.to_json() {
        Ok(json) => {
            if out_tx.send(Message::Text(json)).await.is_err() {
                debug!("Connection closed before the reply to {} was sent", request_id);
            }
        }
        Err(e) => error!("Failed to encode reply to {}: {}", request_id, e),
    }
}
