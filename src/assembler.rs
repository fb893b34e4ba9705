//! Response assembler (spec §4.6).
//!
//! Builds the buffered or streamed JSON envelope. The teacher never
//! serializes JSON (it writes raw HTTP bytes), so the shape here is
//! grounded on `serde_json` directly, the pack's standard JSON stack.
//! `serde_json`'s `preserve_order` feature keeps the header/cookie
//! insertion order spec'd in §5 ("Ordering ... Response headers are
//! insertion-ordered").

use crate::codec;
use crate::context::ResponseState;
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// 8 zero bytes separating the streaming prelude from the body (spec
/// §4.6 step 3).
pub const STREAM_SEPARATOR: [u8; 8] = [0; 8];

const SET_COOKIE: &str = "Set-Cookie";

/// Splits `response.headers` into the headers object (everything except
/// `Set-Cookie`) and a `cookies` array (the comma-split, OWS-trimmed
/// values of `Set-Cookie`, empty entries skipped). Spec §4.6.
fn split_cookies(response: &ResponseState) -> (Map<String, Value>, Option<Vec<String>>) {
    let mut headers = Map::new();
    let mut cookies = None;

    for (key, value) in response.headers.iter() {
        if key.eq_ignore_ascii_case(SET_COOKIE) {
            let parsed: Vec<String> = value
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            if !parsed.is_empty() {
                cookies = Some(parsed);
            }
            continue;
        }
        headers.insert(key.to_string(), Value::String(value.clone()));
    }

    (headers, cookies)
}

/// Decides UTF-8-vs-base64 body transport (spec §4.6: "if the response
/// bytes form valid UTF-8, send as-is ... otherwise base64-encode").
fn transport_body(body: &[u8]) -> (String, bool) {
    if codec::validate_utf8(body) {
        (String::from_utf8_lossy(body).into_owned(), false)
    } else {
        let encoded = codec::base64_encode(body);
        (String::from_utf8(encoded).expect("base64 alphabet is ASCII"), true)
    }
}

/// Builds the buffered envelope `{statusCode, headers, cookies?, body,
/// isBase64Encoded}` (spec §4.6 "Buffered").
pub fn assemble_buffered(response: &ResponseState) -> Value {
    let (headers, cookies) = split_cookies(response);
    let (body, is_base64_encoded) = transport_body(&response.body);

    let mut envelope = Map::new();
    envelope.insert("statusCode".to_string(), Value::from(response.status()));
    envelope.insert("headers".to_string(), Value::Object(headers));
    if let Some(cookies) = cookies {
        envelope.insert(
            "cookies".to_string(),
            Value::Array(cookies.into_iter().map(Value::String).collect()),
        );
    }
    envelope.insert("body".to_string(), Value::String(body));
    envelope.insert("isBase64Encoded".to_string(), Value::Bool(is_base64_encoded));

    Value::Object(envelope)
}

/// Raw-mode buffered response (spec §4.6: "empty body -> JSON `null`;
/// non-empty body -> posted as the raw body with
/// `Content-Type: application/json`").
pub enum RawOutcome {
    Null,
    Bytes(Vec<u8>),
}

pub fn assemble_raw(response: &ResponseState) -> RawOutcome {
    if response.body.is_empty() {
        RawOutcome::Null
    } else {
        RawOutcome::Bytes(response.body.clone())
    }
}

/// Builds the streaming prelude: the same envelope shape as buffered,
/// minus `body`/`isBase64Encoded` (spec §4.6 step 2).
pub fn assemble_prelude(response: &ResponseState) -> Vec<u8> {
    let (headers, cookies) = split_cookies(response);

    let mut envelope = Map::new();
    envelope.insert("statusCode".to_string(), Value::from(response.status()));
    envelope.insert("headers".to_string(), Value::Object(headers));
    if let Some(cookies) = cookies {
        envelope.insert(
            "cookies".to_string(),
            Value::Array(cookies.into_iter().map(Value::String).collect()),
        );
    }

    serde_json::to_vec(&Value::Object(envelope)).expect("json envelope is always serializable")
}

/// Builds the request body stream fed to `reqwest::Body::wrap_stream`:
/// prelude bytes, then the 8-NUL separator, then whatever flows through
/// `rx` as scripts flush (spec §4.6 steps 3-4). Pausing/resuming the
/// transfer is just the async channel backing off when empty — no
/// explicit PAUSE/resume state machine is needed the way the original's
/// curl read-callback required one (Design Notes §9).
pub fn streaming_body(
    prelude: Vec<u8>,
    rx: mpsc::Receiver<Bytes>,
) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>> {
    let head = stream::iter(vec![
        Ok(Bytes::from(prelude)),
        Ok(Bytes::copy_from_slice(&STREAM_SEPARATOR)),
    ]);
    let tail = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|b| (Ok(b), rx)) });
    head.chain(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TablePolicy;

    fn response_with(body: &[u8]) -> ResponseState {
        let mut r = ResponseState::default();
        r.push_body(body);
        r
    }

    #[test]
    fn buffered_ascii_body_is_not_base64() {
        let r = response_with(b"hello");
        let env = assemble_buffered(&r);
        assert_eq!(env["isBase64Encoded"], Value::Bool(false));
        assert_eq!(env["body"], Value::String("hello".to_string()));
        assert_eq!(env["statusCode"], Value::from(200u16));
    }

    #[test]
    fn buffered_binary_body_is_base64() {
        let r = response_with(&[0xFF, 0xFE]);
        let env = assemble_buffered(&r);
        assert_eq!(env["isBase64Encoded"], Value::Bool(true));
    }

    #[test]
    fn set_cookie_becomes_cookies_array() {
        let mut r = ResponseState::default();
        r.headers = crate::table::Table::new(TablePolicy::default());
        r.headers.insert("Set-Cookie", "a=1, b=2".to_string());
        let env = assemble_buffered(&r);
        assert_eq!(
            env["cookies"],
            Value::Array(vec![Value::String("a=1".into()), Value::String("b=2".into())])
        );
        assert!(env["headers"].as_object().unwrap().get("Set-Cookie").is_none());
    }

    #[test]
    fn raw_mode_empty_body_is_null() {
        let r = ResponseState::default();
        assert!(matches!(assemble_raw(&r), RawOutcome::Null));
    }
}
