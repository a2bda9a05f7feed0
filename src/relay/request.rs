use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use std::str::FromStr;
use tokio::sync::oneshot;

use crate::error::ForwardError;

/// A request that arrived through the tunnel (or the local listener),
/// destined for the target.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: String,
    /// Path including the query string
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    reply: ReplyHandle,
}

impl InboundRequest {
    /// Create a request together with the receiving side of its reply
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> (Self, PendingReply) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            method: method.into(),
            path: path.into(),
            headers,
            body,
            reply: ReplyHandle { tx: Some(tx) },
        };
        (request, PendingReply { rx })
    }

    /// Build from a hyper request, collecting the whole body
    pub async fn from_http<B>(req: http::Request<B>) -> Result<(Self, PendingReply), B::Error>
    where
        B: Body,
    {
        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self::new(parts.method.as_str(), path, parts.headers, body))
    }

    /// Write the single reply for this request
    pub fn respond(self, response: ForwardResponse) {
        self.reply.send(response);
    }
}

/// Sending side of a request's reply. Dropping it unanswered replies with a 500.
#[derive(Debug)]
pub struct ReplyHandle {
    tx: Option<oneshot::Sender<ForwardResponse>>,
}

impl ReplyHandle {
    fn send(mut self, response: ForwardResponse) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(response);
        }
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(ForwardResponse::error(
                500,
                "request dropped before a reply was written",
            ));
        }
    }
}

/// Receiving side of a request's reply
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<ForwardResponse>,
}

impl PendingReply {
    pub async fn recv(self) -> ForwardResponse {
        self.rx
            .await
            .unwrap_or_else(|_| ForwardResponse::error(500, "reply channel closed"))
    }
}

/// Response relayed back to the tunnel caller
#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub type ForwardResult = Result<ForwardResponse, ForwardError>;

impl ForwardResponse {
    /// Plain-text error reply
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self {
            status,
            headers,
            body: Bytes::from(message.into()),
        }
    }

    pub fn from_error(err: &ForwardError) -> Self {
        let reason = match err.status() {
            504 => "Gateway Timeout",
            502 => "Bad Gateway",
            _ => "Internal Server Error",
        };
        Self::error(err.status(), format!("{}: {}", reason, err))
    }

    /// Convert into a hyper response. Content-Length is recomputed from the body.
    pub fn into_http(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut headers = self.headers;
        headers.remove(CONTENT_LENGTH);
        *response.headers_mut() = headers;
        response
    }

    /// Headers as name/value pairs, for the JSON relay protocol
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect()
    }
}

/// Build a header map from name/value pairs, skipping invalid entries
pub fn headers_from_pairs<I>(pairs: I) -> HeaderMap
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (HeaderName::from_str(&name), HeaderValue::from_str(&value))
        {
            headers.append(name, value);
        }
    }
    headers
}
