use base64::{DecodeError, Engine};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{RequestId, TunnelId};

/// Outgoing message types (Client -> Relay)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage {
    RegisterTunnel {
        local_port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        requested_subdomain: Option<String>,
    },
    TunnelResponse {
        request_id: RequestId,
        status: u16,
        headers: Vec<[String; 2]>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body_encoding: Option<String>,
    },
    Heartbeat {
        timestamp: u64,
    },
}

/// Incoming message types (Relay -> Client)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    TunnelRegistered {
        tunnel_id: TunnelId,
        subdomain: String,
        full_url: String,
    },
    TunnelRequest {
        request_id: RequestId,
        method: String,
        path: String,
        #[serde(default)]
        query_string: String,
        #[serde(default)]
        headers: Vec<Vec<String>>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        body_encoding: Option<String>,
        #[serde(default)]
        client_ip: Option<String>,
    },
    Heartbeat {
        #[allow(dead_code)]
        #[serde(default)]
        timestamp: u64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl OutgoingMessage {
    pub fn register_tunnel(local_port: u16, requested_subdomain: Option<&str>) -> Self {
        OutgoingMessage::RegisterTunnel {
            local_port,
            requested_subdomain: requested_subdomain.map(|s| s.to_string()),
        }
    }

    pub fn tunnel_response(
        request_id: &RequestId,
        status: u16,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    ) -> Self {
        let (body_str, encoding) = encode_body(body);
        OutgoingMessage::TunnelResponse {
            request_id: request_id.clone(),
            status,
            headers: headers.into_iter().map(|(k, v)| [k, v]).collect(),
            body: body_str,
            body_encoding: encoding,
        }
    }

    pub fn heartbeat() -> Self {
        OutgoingMessage::Heartbeat {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl IncomingMessage {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Join a path and a query string into a request target
pub fn request_target(path: &str, query_string: &str) -> String {
    let path = if path.is_empty() { "/" } else { path };
    if query_string.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, query_string)
    }
}

/// Convert `[name, value]` header entries, ignoring malformed ones
pub fn header_pairs(headers: Vec<Vec<String>>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter_map(|h| {
            let mut parts = h.into_iter();
            match (parts.next(), parts.next()) {
                (Some(name), Some(value)) => Some((name, value)),
                _ => None,
            }
        })
        .collect()
}

fn encode_body(body: Option<Vec<u8>>) -> (Option<String>, Option<String>) {
    match body {
        None => (None, None),
        Some(data) if data.is_empty() => (Some(String::new()), None),
        // UTF-8 goes as-is, anything else as base64
        Some(data) => match String::from_utf8(data) {
            Ok(s) => (Some(s), None),
            Err(e) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(e.as_bytes());
                (Some(encoded), Some("base64".to_string()))
            }
        },
    }
}

/// Decode a request body. A missing body is empty; a body that does not
/// match its declared encoding is an error.
pub fn decode_body(body: Option<&str>, encoding: Option<&str>) -> Result<Vec<u8>, DecodeError> {
    let Some(body) = body else {
        return Ok(Vec::new());
    };

    match encoding {
        Some("base64") => base64::engine::general_purpose::STANDARD.decode(body),
        _ => Ok(body.as_bytes().to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_omits_missing_subdomain() {
        let json = OutgoingMessage::register_tunnel(8954, None).to_json().unwrap();
        assert_eq!(json, r#"{"type":"register_tunnel","local_port":8954}"#);

        let json = OutgoingMessage::register_tunnel(8954, Some("loja"))
            .to_json()
            .unwrap();
        assert!(json.contains(r#""requested_subdomain":"loja""#));
    }

    #[test]
    fn test_binary_response_body_is_base64() {
        let msg = OutgoingMessage::tunnel_response(
            &RequestId("r1".to_string()),
            200,
            vec![],
            Some(vec![0xff, 0x00, 0xfe]),
        );
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["body_encoding"], "base64");
        assert_eq!(value["body"], "/wD+");
    }

    #[test]
    fn test_parse_tunnel_request_with_defaults() {
        let msg = IncomingMessage::from_json(
            r#"{"type":"tunnel_request","request_id":"r9","method":"POST","path":"/hook"}"#,
        )
        .unwrap();

        match msg {
            IncomingMessage::TunnelRequest {
                request_id,
                query_string,
                headers,
                body,
                ..
            } => {
                assert_eq!(request_id, RequestId("r9".to_string()));
                assert!(query_string.is_empty());
                assert!(headers.is_empty());
                assert!(body.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_request_target_and_header_pairs() {
        assert_eq!(request_target("/a", "b=1"), "/a?b=1");
        assert_eq!(request_target("", ""), "/");

        let pairs = header_pairs(vec![
            vec!["X-Test".to_string(), "1".to_string()],
            vec!["broken".to_string()],
        ]);
        assert_eq!(pairs, vec![("X-Test".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(Some("/wD+"), Some("base64")).unwrap(), vec![0xff, 0x00, 0xfe]);
        assert_eq!(decode_body(Some("hi"), None).unwrap(), b"hi".to_vec());
        assert!(decode_body(None, Some("base64")).unwrap().is_empty());
        assert!(decode_body(Some("%%%not-base64%%%"), Some("base64")).is_err());
    }
}
