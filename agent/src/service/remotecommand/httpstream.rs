//! Upgrade detection and sub-protocol handshake for streaming requests

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Response, StatusCode},
};

use crate::error::Error;

// Lowercase so they can be used as static header names
pub const HEADER_PROTOCOL_VERSION: &str = "x-stream-protocol-version";
pub const HEADER_ACCEPTED_PROTOCOL_VERSIONS: &str = "x-accepted-stream-protocol-versions";
pub const SPDY_UPGRADE: &str = "SPDY/3.1";

fn connection_has_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("upgrade"))
}

/// `Upgrade: websocket` plus a `Connection` header listing `upgrade`
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    let websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    websocket && connection_has_upgrade(headers)
}

/// `Upgrade: SPDY/3.1` plus a `Connection` header listing `upgrade`
pub fn is_spdy_upgrade(headers: &HeaderMap) -> bool {
    let spdy = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case(SPDY_UPGRADE))
        .unwrap_or(false);
    spdy && connection_has_upgrade(headers)
}

/// Every value of a possibly repeated, comma separated header
pub fn header_values(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// First client protocol the server also supports
pub fn negotiate<'a>(client: &[String], server: &'a [String]) -> Option<&'a str> {
    client
        .iter()
        .find_map(|c| server.iter().find(|s| *s == c))
        .map(String::as_str)
}

/// Render a list the way the negotiation errors print it: `[a b c]`
pub fn bracketed(items: &[String]) -> String {
    format!("[{}]", items.join(" "))
}

/// Pick the sub-protocol for a SPDY upgrade. A client that sends no version
/// header gets the empty protocol; no overlap yields the 403 to send back.
pub fn handshake(headers: &HeaderMap, server: &[String]) -> Result<String, Response<Body>> {
    let client = header_values(headers, HEADER_PROTOCOL_VERSION);
    if client.is_empty() {
        return Ok(String::new());
    }

    match negotiate(&client, server) {
        Some(protocol) => Ok(protocol.to_string()),
        None => {
            let err = Error::ProtocolNegotiation(format!(
                "client supports {}, server accepts {}",
                bracketed(&client),
                bracketed(server)
            ));
            let mut response = plain_error(&err);
            for protocol in server {
                if let Ok(value) = HeaderValue::from_str(protocol) {
                    response
                        .headers_mut()
                        .append(HEADER_ACCEPTED_PROTOCOL_VERSIONS, value);
                }
            }
            Err(response)
        }
    }
}

/// Plain-text error response, the form upgrade clients expect before switching protocols
pub fn plain_error(err: &Error) -> Response<Body> {
    let mut response = Response::new(Body::from(format!("{}\n", err)));
    *response.status_mut() = err.status_code();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// 101 response switching the connection to SPDY/3.1
pub fn spdy_switching_protocols(protocol: &str) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static(SPDY_UPGRADE));
    if !protocol.is_empty() {
        if let Ok(value) = HeaderValue::from_str(protocol) {
            headers.insert(HEADER_PROTOCOL_VERSION, value);
        }
    }
    response
}
