use reqwest::header::{HeaderMap, HeaderName, CONNECTION, CONTENT_LENGTH, HOST};
use reqwest::{Client, Method};
use std::time::Duration;

use crate::config::Target;
use crate::error::ForwardError;

use super::request::{ForwardResponse, ForwardResult, InboundRequest};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers meaningful only for a single transport leg
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub timeout: Duration,
    /// Accept invalid TLS certificates from an https target
    pub allow_invalid_cert: bool,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            allow_invalid_cert: true,
        }
    }
}

/// Issues requests to the configured target over a shared connection pool
#[derive(Debug, Clone)]
pub struct TargetClient {
    target: Target,
    client: Client,
    timeout: Duration,
}

impl TargetClient {
    pub fn new(target: Target, config: &ForwardConfig) -> reqwest::Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(10)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.allow_invalid_cert)
            .build()?;

        Ok(Self {
            target,
            client,
            timeout: config.timeout,
        })
    }

    /// Forward a request to the target. Single attempt, no retries.
    pub async fn forward(&self, req: &InboundRequest) -> ForwardResult {
        let url = self.target.join(&req.path);
        let method = Method::from_bytes(req.method.as_bytes())
            .map_err(|e| ForwardError::Unknown(format!("invalid method '{}': {}", req.method, e)))?;

        let mut headers = strip_hop_by_hop(&req.headers);
        // Recomputed by the HTTP client for the new leg
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);

        let response = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(req.body.clone())
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status().as_u16();
        let headers = strip_hop_by_hop(response.headers());
        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        Ok(ForwardResponse {
            status,
            headers,
            body,
        })
    }

    fn classify(&self, err: reqwest::Error) -> ForwardError {
        if err.is_timeout() {
            ForwardError::Timeout(self.timeout)
        } else if err.is_connect() {
            ForwardError::TargetUnreachable(error_chain(&err))
        } else {
            ForwardError::Unknown(error_chain(&err))
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy headers, dropping hop-by-hop ones and any listed in `Connection`
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name) && !listed.iter().any(|l| l == name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed_port, spawn_http_server, spawn_silent_server};
    use bytes::Bytes;
    use http::{HeaderValue, Response};
    use http_body_util::Full;
    use std::time::Instant;

    fn client_for(base: &str, timeout: Duration) -> TargetClient {
        let target = Target::parse(base).unwrap();
        TargetClient::new(
            target,
            &ForwardConfig {
                timeout,
                allow_invalid_cert: true,
            },
        )
        .unwrap()
    }

    fn request(method: &str, path: &str, headers: HeaderMap) -> InboundRequest {
        InboundRequest::new(method, path, headers, Bytes::new()).0
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-test", HeaderValue::from_static("1"));
        headers.insert("connection", HeaderValue::from_static("keep-alive, X-Private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-private", HeaderValue::from_static("secret"));

        let stripped = strip_hop_by_hop(&headers);
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped.get("x-test").unwrap(), "1");
    }

    #[tokio::test]
    async fn test_health_scenario_relays_status_and_body() {
        let addr = spawn_http_server(|req| async move {
            assert_eq!(req.uri().path(), "/health");
            Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(r#"{"ok":true}"#)))
                .unwrap()
        })
        .await;

        let client = client_for(&format!("http://{}", addr), DEFAULT_REQUEST_TIMEOUT);
        let result = client
            .forward(&request("GET", "/health", HeaderMap::new()))
            .await;

        let response = tokio_test::assert_ok!(result);
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from(r#"{"ok":true}"#));
        assert_eq!(
            response.headers.get("content-type").unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_headers_pass_through_without_hop_by_hop() {
        let addr = spawn_http_server(|req| async move {
            let seen = |name: &str| {
                req.headers()
                    .get(name)
                    .map(|v| v.to_str().unwrap_or_default().to_string())
                    .unwrap_or_else(|| "-".to_string())
            };
            let body = format!("{}|{}", seen("x-test"), seen("keep-alive"));
            Response::new(Full::new(Bytes::from(body)))
        })
        .await;

        let mut headers = HeaderMap::new();
        headers.insert("X-Test", HeaderValue::from_static("1"));
        headers.insert("Keep-Alive", HeaderValue::from_static("timeout=5"));
        headers.insert("Host", HeaderValue::from_static("abc.loca.lt"));

        let client = client_for(&format!("http://{}", addr), DEFAULT_REQUEST_TIMEOUT);
        let response = client
            .forward(&request("GET", "/echo", headers))
            .await
            .unwrap();

        assert_eq!(response.body, Bytes::from("1|-"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let port = closed_port().await;
        let client = client_for(&format!("http://127.0.0.1:{}", port), DEFAULT_REQUEST_TIMEOUT);

        let result = client.forward(&request("GET", "/", HeaderMap::new())).await;
        let err = tokio_test::assert_err!(result);
        assert!(matches!(err, ForwardError::TargetUnreachable(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_silent_target_times_out_within_window() {
        let addr = spawn_silent_server().await;
        let timeout = Duration::from_millis(300);
        let client = client_for(&format!("http://{}", addr), timeout);

        let start = Instant::now();
        let result = client.forward(&request("GET", "/slow", HeaderMap::new())).await;
        let elapsed = start.elapsed();

        assert_eq!(result.unwrap_err(), ForwardError::Timeout(timeout));
        assert!(elapsed >= timeout, "timed out early: {:?}", elapsed);
        assert!(elapsed < timeout + Duration::from_secs(5), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_invalid_method_is_unknown_failure() {
        let client = client_for("http://127.0.0.1:1", DEFAULT_REQUEST_TIMEOUT);
        let result = client
            .forward(&request("BAD METHOD", "/", HeaderMap::new()))
            .await;
        assert!(matches!(result, Err(ForwardError::Unknown(_))));
    }
}
