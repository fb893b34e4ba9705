//! Platform-API client (spec §4.4).
//!
//! Built on `reqwest`, already the HTTP client crate used throughout
//! `iwismer-rusty-timer`'s services (`server`, `forwarder`, `receiver`
//! all depend on it) — the teacher itself has no outbound HTTP client
//! dependency since it *is* the server being talked to.
//!
//! Poll cancellation is a [`CancellationToken`] plus an [`AtomicBool`]
//! "in poll" flag, replacing the original's three raw `volatile` globals
//! (Design Notes §9: "re-architect as an atomic trio ... owned by the
//! signal handler and read by the client").

use crate::assembler::{self, RawOutcome};
use crate::context::ResponseState;
use crate::errors::TransportError;
use bytes::Bytes;
use reqwest::Client;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RUNTIME_VERSION: &str = "2018-06-01";

/// One invocation's platform-supplied metadata plus its raw body (spec
/// §4.4 `poll_next`).
#[derive(Debug)]
pub struct PolledInvocation {
    pub request_id: String,
    pub body: Vec<u8>,
    pub trace_id: Option<String>,
    pub deadline_ms: Option<String>,
}

/// Talks to `http://{runtime_api}/2018-06-01/runtime/...`. Single-owner,
/// matching spec §5's "HTTP handles are likewise single-owner".
pub struct PlatformApiClient {
    http: Client,
    base_url: String,
    cancel: CancellationToken,
    in_poll: Arc<AtomicBool>,
}

impl PlatformApiClient {
    pub fn new(http: Client, runtime_api: &str) -> Self {
        Self {
            http,
            base_url: format!("http://{runtime_api}/{RUNTIME_VERSION}/runtime"),
            cancel: CancellationToken::new(),
            in_poll: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A clonable handle the signal handler uses to unblock a pending
    /// poll (spec §4.4 "poll cancellation").
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether a `poll_next` call is currently blocked waiting, for
    /// logging parity with the original's `in_poll` flag.
    pub fn in_poll(&self) -> bool {
        self.in_poll.load(Ordering::SeqCst)
    }

    /// `GET /invocation/next`. Cancellation (spec §4.4, §5) races the
    /// request against the token rather than closing a captured socket —
    /// the async equivalent of "the socket is captured via a
    /// connect-phase callback", since `tokio::select!` itself provides
    /// the unblock-from-elsewhere primitive.
    pub async fn poll_next(&self) -> Result<PolledInvocation, TransportError> {
        self.in_poll.store(true, Ordering::SeqCst);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.do_poll() => result,
        };
        self.in_poll.store(false, Ordering::SeqCst);
        result
    }

    async fn do_poll(&self) -> Result<PolledInvocation, TransportError> {
        let url = format!("{}/invocation/next", self.base_url);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::NonSuccess(status));
        }

        let headers = resp.headers();
        // spec §3: "request_id is nonempty after a successful fetch;
        // otherwise the fetch failed and no response may be posted" —
        // a 2xx poll with no (or empty) request id is itself a failure.
        let request_id = header_str(headers, "Lambda-Runtime-Aws-Request-Id")
            .filter(|id| !id.is_empty())
            .ok_or(TransportError::MissingRequestId)?;
        let trace_id = header_str(headers, "Lambda-Runtime-Trace-Id");
        let deadline_ms = header_str(headers, "Lambda-Runtime-Deadline-Ms");

        let body = resp.bytes().await?.to_vec();

        Ok(PolledInvocation {
            request_id,
            body,
            trace_id,
            deadline_ms,
        })
    }

    /// `POST /invocation/{id}/response` with the buffered JSON envelope,
    /// or (raw mode) the raw body / JSON `null` per spec §4.6.
    pub async fn post_response(
        &self,
        request_id: &str,
        raw_mode: bool,
        response: &ResponseState,
    ) -> Result<(), TransportError> {
        let url = format!("{}/invocation/{request_id}/response", self.base_url);

        let resp = if raw_mode {
            match assembler::assemble_raw(response) {
                RawOutcome::Null => {
                    self.http
                        .post(&url)
                        .header("Content-Type", "application/json")
                        .json(&Value::Null)
                        .send()
                        .await?
                }
                RawOutcome::Bytes(bytes) => {
                    self.http
                        .post(&url)
                        .header("Content-Type", "application/json")
                        .body(bytes)
                        .send()
                        .await?
                }
            }
        } else {
            let envelope = assembler::assemble_buffered(response);
            self.http.post(&url).json(&envelope).send().await?
        };

        check_success(resp)
    }

    /// Streams the response body: prelude, 8-NUL separator, then
    /// whatever `rx` yields as scripts flush (spec §4.6 "Streaming").
    /// `Expect: 100-continue` is never added by `reqwest` for a
    /// streamed body unless explicitly requested, satisfying spec §4.4's
    /// "`Expect:` suppressed on streaming" without extra configuration.
    pub async fn stream_response(
        &self,
        request_id: &str,
        prelude: Vec<u8>,
        rx: mpsc::Receiver<Bytes>,
    ) -> Result<(), TransportError> {
        let url = format!("{}/invocation/{request_id}/response", self.base_url);
        let body = reqwest::Body::wrap_stream(assembler::streaming_body(prelude, rx));

        let resp = self
            .http
            .post(&url)
            .header(
                "Content-Type",
                "application/vnd.awslambda.http-integration-response",
            )
            .header("Lambda-Runtime-Function-Response-Mode", "streaming")
            .body(body)
            .send()
            .await?;

        check_success(resp)
    }

    /// `POST /invocation/{id}/error`, or `/init/error` when no request id
    /// has been established yet (spec §4.4, §7).
    pub async fn post_error(
        &self,
        request_id: Option<&str>,
        message: &str,
    ) -> Result<(), TransportError> {
        let url = match request_id {
            Some(id) => format!("{}/invocation/{id}/error", self.base_url),
            None => format!("{}/init/error", self.base_url),
        };

        let payload = serde_json::json!({
            "errorMessage": message,
            "errorType": Value::Null,
            "stackTrace": Vec::<String>::new(),
        });

        let resp = self.http.post(&url).json(&payload).send().await?;
        check_success(resp)
    }
}

fn header_str(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}

fn check_success(resp: reqwest::Response) -> Result<(), TransportError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(TransportError::NonSuccess(resp.status()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_has_runtime_version_prefix() {
        let client = PlatformApiClient::new(Client::new(), "127.0.0.1:9001");
        assert_eq!(
            client.base_url,
            "http://127.0.0.1:9001/2018-06-01/runtime"
        );
    }

    #[tokio::test]
    async fn cancel_token_aborts_a_pending_poll() {
        let client = PlatformApiClient::new(Client::new(), "169.254.255.255:1");
        let handle = client.cancel_handle();
        handle.cancel();
        let result = client.poll_next().await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }
}
