//! The per-process request context (spec §3).
//!
//! Mirrors the teacher's split between long-lived server state and
//! per-connection scratch state (`server::server_impl::Server` holding
//! config + listener, `http::request::Request` / `http::response::Response`
//! being per-connection) — here collapsed onto a single process rather
//! than per-connection, since at most one invocation is ever in flight
//! (spec §5: "exactly one is in flight at a time").

use crate::config::RuntimeConfig;
use crate::script::state::ScriptState;
use crate::statcache::StatCache;
use crate::table::{Table, TablePolicy};
use reqwest::Client;
use std::time::Duration;

/// Owns everything: config, persistent state, and the current
/// invocation's substructures. Design Notes §9 ("cyclic request context")
/// call for owner-holds-everything with non-owning back-references;
/// script UserData types borrow from this struct for the duration of one
/// chunk call rather than holding their own reference-counted handles.
pub struct RequestContext {
    pub config: RuntimeConfig,
    pub persistent: PersistentState,
    pub inbound: Option<InboundInvocation>,
    pub request: Option<RequestView>,
    pub response: ResponseState,
}

impl RequestContext {
    pub fn new(config: RuntimeConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .tcp_nodelay(true)
            .http1_only()
            .build()?;

        Ok(Self {
            persistent: PersistentState {
                http,
                stat_cache: StatCache::new(config.stat_cache_capacity),
                script_state: ScriptState::Absent,
                requests_served: 0,
                close_flag: false,
            },
            config,
            inbound: None,
            request: None,
            response: ResponseState::default(),
        })
    }

    /// Clears per-invocation substructures at the loop tail (Design Notes
    /// §9: "clear per-request substructures explicitly at the loop tail").
    pub fn reset_for_next_invocation(&mut self) {
        self.inbound = None;
        self.request = None;
        self.response = ResponseState::default();
    }
}

/// HTTP handles, caches, and the interpreter state: survives across
/// invocations (spec §3 "Persistent state").
pub struct PersistentState {
    pub http: Client,
    pub stat_cache: StatCache,
    pub script_state: ScriptState,
    pub requests_served: usize,
    pub close_flag: bool,
}

/// Everything the platform API handed us before parsing (spec §3
/// "Per-invocation inbound").
#[derive(Debug, Default)]
pub struct InboundInvocation {
    /// At most 64 bytes per spec §3; not enforced by the type, validated
    /// at the point headers are parsed.
    pub request_id: String,
    pub content_length_hint: Option<usize>,
    pub raw: Vec<u8>,
    pub parsed: Option<serde_json::Value>,
    pub trace_id: Option<String>,
    pub deadline_ms: Option<String>,
}

/// The request as scripts see it (spec §3 "Per-invocation request view").
#[derive(Debug, Clone)]
pub struct RequestView {
    pub method: String,
    pub path: String,
    pub query: String,
    pub source_ip: Option<String>,
    pub main_file: String,
    pub path_info: Option<String>,
    pub headers: Table<String>,
    pub body: Vec<u8>,
}

impl RequestView {
    pub fn new() -> Self {
        Self {
            method: String::new(),
            path: String::new(),
            query: String::new(),
            source_ip: None,
            main_file: String::new(),
            path_info: None,
            headers: Table::new(TablePolicy {
                case_insensitive: true,
                capacity: None,
            }),
            body: Vec::new(),
        }
    }
}

impl Default for RequestView {
    fn default() -> Self {
        Self::new()
    }
}

/// Flags tracking where a streaming transfer is (spec §3 "streaming
/// state flags: active / paused / EOF / separator-bytes-sent").
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingState {
    pub active: bool,
    pub paused: bool,
    pub eof: bool,
    pub separator_sent: bool,
}

/// The response as the orchestrator and script bridge build it (spec §3
/// "Per-invocation response").
#[derive(Debug, Clone)]
pub struct ResponseState {
    status: u16,
    pub headers: Table<String>,
    pub body: Vec<u8>,
    pub pos: usize,
    pub diagnostic: Option<String>,
    pub prelude: Option<Vec<u8>>,
    pub streaming: StreamingState,
    /// Set on first body write from a `Content-Type` sniff; affects only
    /// capacity pre-sizing (spec §4.12).
    pub likely_utf8: bool,
    /// True once the first flush has sealed the header map (spec §3:
    /// "If streaming is active, response headers become read-only after
    /// the first flush").
    sealed: bool,
}

impl ResponseState {
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Sets the response status, clamping out-of-range values to 500
    /// (spec §3 invariant) and ignoring the write entirely once streaming
    /// has sealed the prelude (spec §4.6: "once streaming starts, status
    /// code changes are ignored").
    pub fn set_status(&mut self, code: i64) {
        if self.sealed {
            return;
        }
        self.status = crate::status::coerce(code);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Seals the header map and freezes the status, called once by the
    /// assembler at the first flush.
    pub fn seal(&mut self) {
        self.sealed = true;
        self.streaming.active = true;
    }

    /// Appends to the body buffer under the amortised growth policy (spec
    /// §3: "growth policy is amortised doubling until 1 MiB, then ×1.5,
    /// never shrinking").
    pub fn push_body(&mut self, bytes: &[u8]) {
        reserve_with_growth_policy(&mut self.body, bytes.len());
        self.body.extend_from_slice(bytes);
    }
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Table::new(TablePolicy::default()),
            body: Vec::new(),
            pos: 0,
            diagnostic: None,
            prelude: None,
            streaming: StreamingState::default(),
            likely_utf8: false,
            sealed: false,
        }
    }
}

const ONE_MIB: usize = 1 << 20;

/// Grows `buf`'s capacity to hold `additional` more bytes, doubling below
/// 1 MiB and growing by ×1.5 above it, never shrinking (spec §3).
fn reserve_with_growth_policy(buf: &mut Vec<u8>, additional: usize) {
    let needed = buf.len() + additional;
    if buf.capacity() >= needed {
        return;
    }

    let mut cap = buf.capacity().max(64);
    while cap < needed {
        cap = if cap < ONE_MIB {
            cap.saturating_mul(2)
        } else {
            cap.saturating_mul(3) / 2
        };
    }
    buf.reserve(cap - buf.len());
}

/// Connect timeout is fixed at 1 second per spec §4.4, not independently
/// configurable; exposed as a constant so call sites don't need to thread
/// `RuntimeConfig` through purely to read this.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_clamps_out_of_range() {
        let mut r = ResponseState::default();
        r.set_status(900);
        assert_eq!(r.status(), 500);
    }

    #[test]
    fn status_frozen_after_seal() {
        let mut r = ResponseState::default();
        r.set_status(201);
        r.seal();
        r.set_status(404);
        assert_eq!(r.status(), 201);
    }

    #[test]
    fn body_growth_never_shrinks_capacity() {
        let mut buf = Vec::new();
        reserve_with_growth_policy(&mut buf, 10);
        let cap_after_first = buf.capacity();
        buf.extend_from_slice(&vec![0u8; 10]);
        reserve_with_growth_policy(&mut buf, 5);
        assert!(buf.capacity() >= cap_after_first);
    }

    #[test]
    fn body_growth_switches_to_1_5x_past_1mib() {
        let mut buf = vec![0u8; ONE_MIB];
        reserve_with_growth_policy(&mut buf, 1);
        assert!(buf.capacity() >= ONE_MIB + 1);
        assert!(buf.capacity() < ONE_MIB * 2);
    }
}
