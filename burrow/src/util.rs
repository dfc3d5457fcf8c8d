//! Small helpers around paths, URIs and headers.

use http::header::{AUTHORIZATION, HOST, SEC_WEBSOCKET_PROTOCOL};
use http::{HeaderMap, HeaderValue as HttpHeaderValue};
use url::Url;

use crate::transport::envelope::{HeaderValue, Headers};

/// Headers the WebSocket client sets itself when dialing a target.
const RESERVED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "content-length",
    "transfer-encoding",
];

/// Ensure a path starts with `/`; empty becomes `/`.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Prefix `ws://` when the URI carries no WebSocket scheme.
pub fn with_ws_scheme(uri: &str) -> String {
    if uri.starts_with("ws://") || uri.starts_with("wss://") {
        uri.to_string()
    } else {
        format!("ws://{uri}")
    }
}

/// Append a tunneled request path to the target base address.
pub fn join_target(target: &Url, path: &str) -> Result<Url, url::ParseError> {
    let base = target.as_str().trim_end_matches('/');
    Url::parse(&format!("{}{}", base, normalize_path(path)))
}

/// Request headers as carried by a `connect` envelope, minus `host`.
pub fn tunneled_headers(headers: &HeaderMap) -> Headers {
    let mut tunneled = Headers::new();
    for name in headers.keys() {
        if *name == HOST {
            continue;
        }
        let mut values: Vec<String> = headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();
        let value = match values.len() {
            0 => continue,
            1 => HeaderValue::Single(values.remove(0)),
            _ => HeaderValue::Multiple(values),
        };
        tunneled.insert(name.as_str().to_string(), value);
    }
    tunneled
}

/// Headers from a `connect` envelope that may be replayed on the target dial.
pub fn forwardable_headers(headers: &Headers) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            !RESERVED_HEADERS
                .iter()
                .any(|reserved| name.eq_ignore_ascii_case(reserved))
        })
        .flat_map(|(name, value)| {
            value
                .values()
                .map(move |value| (name.clone(), value.to_string()))
        })
        .collect()
}

/// First subprotocol a client offered, to be selected in the upgrade reply.
pub fn first_subprotocol(headers: &HeaderMap) -> Option<HttpHeaderValue> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .find(|protocol| !protocol.is_empty())
        .and_then(|protocol| HttpHeaderValue::from_str(protocol).ok())
}

/// Exact-match bearer token check. Passes when no token is configured.
pub fn authorize(headers: &HeaderMap, token: Option<&str>) -> bool {
    let Some(token) = token.filter(|token| !token.is_empty()) else {
        return true;
    };
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {token}"))
}

pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("app"), "/app");
        assert_eq!(normalize_path("/app?x=1"), "/app?x=1");
    }

    #[test]
    fn test_with_ws_scheme() {
        assert_eq!(with_ws_scheme("localhost:3001"), "ws://localhost:3001");
        assert_eq!(with_ws_scheme("wss://example.com"), "wss://example.com");
    }

    #[test]
    fn test_join_target() {
        let target = Url::parse("ws://localhost:3001").unwrap();
        assert_eq!(
            join_target(&target, "/chat?room=1").unwrap().as_str(),
            "ws://localhost:3001/chat?room=1"
        );

        let target = Url::parse("ws://localhost:3001/base/").unwrap();
        assert_eq!(
            join_target(&target, "chat").unwrap().as_str(),
            "ws://localhost:3001/base/chat"
        );
    }

    #[test]
    fn test_tunneled_headers_drop_host_and_group_values() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HttpHeaderValue::from_static("public.example.com"));
        headers.insert("origin", HttpHeaderValue::from_static("https://app"));
        headers.append("x-tag", HttpHeaderValue::from_static("a"));
        headers.append("x-tag", HttpHeaderValue::from_static("b"));

        let tunneled = tunneled_headers(&headers);
        assert!(!tunneled.contains_key("host"));
        assert_eq!(
            tunneled.get("origin"),
            Some(&HeaderValue::Single("https://app".to_string()))
        );
        assert_eq!(
            tunneled.get("x-tag"),
            Some(&HeaderValue::Multiple(vec!["a".to_string(), "b".to_string()]))
        );
    }

    #[test]
    fn test_forwardable_headers_strip_reserved() {
        let mut headers = Headers::new();
        for name in ["Host", "sec-websocket-key", "Upgrade", "connection"] {
            headers.insert(name.to_string(), HeaderValue::Single("x".to_string()));
        }
        headers.insert(
            "sec-websocket-protocol".to_string(),
            HeaderValue::Single("chat".to_string()),
        );
        headers.insert(
            "cookie".to_string(),
            HeaderValue::Multiple(vec!["a=1".to_string(), "b=2".to_string()]),
        );

        let forwarded = forwardable_headers(&headers);
        assert_eq!(
            forwarded,
            vec![
                ("cookie".to_string(), "a=1".to_string()),
                ("cookie".to_string(), "b=2".to_string()),
                ("sec-websocket-protocol".to_string(), "chat".to_string()),
            ]
        );
    }

    #[test]
    fn test_first_subprotocol() {
        let mut headers = HeaderMap::new();
        assert!(first_subprotocol(&headers).is_none());

        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HttpHeaderValue::from_static(" chat , superchat"),
        );
        headers.append(SEC_WEBSOCKET_PROTOCOL, HttpHeaderValue::from_static("mqtt"));
        assert_eq!(
            first_subprotocol(&headers),
            Some(HttpHeaderValue::from_static("chat"))
        );
    }

    #[test]
    fn test_authorize() {
        let mut headers = HeaderMap::new();
        assert!(authorize(&headers, None));
        assert!(!authorize(&headers, Some("t1")));

        headers.insert(AUTHORIZATION, HttpHeaderValue::from_static("Bearer t1"));
        assert!(authorize(&headers, Some("t1")));
        assert!(!authorize(&headers, Some("t2")));
        assert!(authorize(&headers, Some("")));
    }
}
