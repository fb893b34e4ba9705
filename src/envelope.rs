//! Envelope parser (spec §4.5).
//!
//! Parses with `serde`/`serde_json` into an owned [`RequestView`], instead
//! of the original's in-place NUL-terminated substring extraction (Design
//! Notes §9: "in-place parsing is a lifetime hazard ... copying is
//! simpler"). `serde`'s derive macros are the pack's standard JSON stack
//! (`iwismer-rusty-timer`'s `rt-protocol` and every one of its services
//! use `serde`/`serde_json`), so this is a direct adoption rather than an
//! invention.

use crate::codec;
use crate::context::RequestView;
use crate::errors::EnvelopeError;
use crate::table::{Table, TablePolicy};
use serde::Deserialize;
use std::collections::HashMap;

const SUPPORTED_VERSION: &str = "2.0";

#[derive(Debug, Deserialize)]
struct EnvelopeWire {
    version: Option<String>,
    #[serde(rename = "rawPath")]
    raw_path: Option<String>,
    #[serde(rename = "rawQueryString")]
    raw_query_string: Option<String>,
    #[serde(rename = "requestContext")]
    request_context: Option<RequestContextWire>,
    headers: Option<HashMap<String, String>>,
    cookies: Option<Vec<String>>,
    body: Option<String>,
    #[serde(rename = "isBase64Encoded")]
    is_base64_encoded: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RequestContextWire {
    http: HttpWire,
}

#[derive(Debug, Deserialize)]
struct HttpWire {
    method: String,
    #[serde(rename = "sourceIp")]
    source_ip: Option<String>,
}

/// Parses one invocation body into a [`RequestView`].
///
/// In **raw mode** this parser is skipped entirely by the caller (spec
/// §4.5): the orchestrator exposes `raw` verbatim instead of calling
/// this function.
pub fn parse(raw: &[u8]) -> Result<RequestView, EnvelopeError> {
    let wire: EnvelopeWire = serde_json::from_slice(raw)?;

    if wire.version.as_deref() != Some(SUPPORTED_VERSION) {
        return Err(EnvelopeError::UnsupportedVersion(wire.version));
    }

    let raw_path = wire.raw_path.ok_or(EnvelopeError::MissingField("rawPath"))?;
    let request_context = wire
        .request_context
        .ok_or(EnvelopeError::MissingField("requestContext.http"))?;

    let mut headers = Table::new(TablePolicy {
        case_insensitive: true,
        capacity: None,
    });
    if let Some(wire_headers) = wire.headers {
        for (key, value) in wire_headers {
            headers.insert(key, value);
        }
    }

    if let Some(cookies) = wire.cookies {
        if !cookies.is_empty() {
            headers.insert("Cookie", cookies.join(", "));
        }
    }

    let body = match wire.body {
        None => Vec::new(),
        Some(text) if wire.is_base64_encoded.unwrap_or(false) => {
            let mut buf = text.into_bytes();
            let len = codec::base64_decode_in_place(&mut buf).map_err(EnvelopeError::BadBase64)?;
            buf.truncate(len);
            buf
        }
        Some(text) => text.into_bytes(),
    };

    Ok(RequestView {
        method: request_context.http.method,
        path: raw_path,
        query: wire.raw_query_string.unwrap_or_default(),
        source_ip: request_context.http.source_ip,
        main_file: String::new(),
        path_info: None,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_cookies_under_cookie_header() {
        let raw = br#"{
            "version": "2.0",
            "rawPath": "/hello",
            "requestContext": { "http": { "method": "GET" } },
            "cookies": ["a=1", "b=2"]
        }"#;
        let view = parse(raw).unwrap();
        assert_eq!(view.headers.get("Cookie"), Some(&"a=1, b=2".to_string()));
    }

    #[test]
    fn decodes_base64_body() {
        let raw = br#"{
            "version": "2.0",
            "rawPath": "/hello",
            "requestContext": { "http": { "method": "POST" } },
            "body": "aGVsbG8=",
            "isBase64Encoded": true
        }"#;
        let view = parse(raw).unwrap();
        assert_eq!(view.body, b"hello");
    }

    #[test]
    fn rejects_missing_version() {
        let raw = br#"{"rawPath": "/x", "requestContext": {"http": {"method": "GET"}}}"#;
        assert!(matches!(
            parse(raw),
            Err(EnvelopeError::UnsupportedVersion(None))
        ));
    }

    #[test]
    fn rejects_wrong_version() {
        let raw = br#"{"version": "1.0", "rawPath": "/x", "requestContext": {"http": {"method": "GET"}}}"#;
        assert!(matches!(parse(raw), Err(EnvelopeError::UnsupportedVersion(_))));
    }
}
