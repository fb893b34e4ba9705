//! Request orchestrator (spec §4.11).
//!
//! Drives the match -> prepare -> init/pre/main/post -> finalize pipeline.
//! The teacher has nothing resembling this (its equivalent, `Server`'s
//! per-connection loop in `server::server_impl`, only ever calls one
//! `Handler::handle`), so the pipeline shape here is grounded directly on
//! spec §4.11's numbered steps rather than on teacher code; the
//! conventions used to express it (plain async functions returning
//! `Result`, `?`-propagation, no hidden control flow) follow the
//! teacher's general style of explicit, un-macro'd control flow.
//!
//! **Streaming simplification.** The original drives the streamed POST
//! concurrently with script execution via a read callback that pauses
//! mid-transfer. Here, `mlua` chunk execution is synchronous Rust code
//! (not a coroutine yielding back to the runtime), so genuine
//! interleaving would require running the interpreter on a dedicated
//! thread. That is a larger structural change than this pass takes on;
//! instead, chunks run to completion first (every `flush()` still seals
//! headers on first call), and the orchestrator performs the streaming
//! POST once, already knowing the full body and EOF. The wire shape
//! (prelude, 8-NUL separator, channel-fed body) is unchanged; only the
//! timing relative to script execution differs. Noted in DESIGN.md.

use crate::context::RequestContext;
use crate::envelope;
use crate::errors::{EnvelopeError, RouteError};
use crate::http_client::PlatformApiClient;
use crate::route;
use crate::script::bridge;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

pub struct Orchestrator;

/// What the caller should do once [`Orchestrator::run_once`] returns
/// `Ok`: the response is already assembled in `ctx.response` and ready
/// to post, either buffered or streamed.
pub enum Outcome {
    Buffered,
    Streaming { prelude: Vec<u8>, body: Vec<u8> },
}

impl Orchestrator {
    /// Runs one invocation end to end. Envelope failures are handed back
    /// to the caller (which reports them via `post_error`, spec §7);
    /// every other failure (routing, script) is absorbed into
    /// `ctx.response` as a normal buffered error response (spec §4.11:
    /// "that status is turned into a JSON error body ... posted as a
    /// normal buffered response").
    pub async fn run_once(ctx: &mut RequestContext, raw: Vec<u8>) -> Result<Outcome, EnvelopeError> {
        // Step 1: prepare response. Default status 200 is already the
        // `ResponseState` default.

        // Step 2: prepare request.
        let mut request = if ctx.config.raw {
            let mut view = crate::context::RequestView::new();
            view.body = raw;
            view
        } else {
            envelope::parse(&raw)?
        };

        match prepare_route(ctx, &mut request) {
            Ok(()) => {}
            Err(route_err) => {
                let status = route_err_status(route_err);
                write_error_response(ctx, status, &route_err.to_string(), None);
                return Ok(Outcome::Buffered);
            }
        }

        ctx.request = Some(request);

        // Step 3: acquire interpreter state; run `init` at most once.
        if let Err(()) = ensure_initialised(ctx).await {
            return Ok(Outcome::Buffered);
        }

        // Step 4: run pre / main / post.
        if let Err(()) = run_chunk_chain(ctx).await {
            return Ok(Outcome::Buffered);
        }

        // Step 5: release state.
        release_state(ctx);

        // Step 6: finalize.
        if ctx.response.streaming.active {
            let prelude = crate::assembler::assemble_prelude(&ctx.response);
            let body = ctx.response.body.clone();
            Ok(Outcome::Streaming { prelude, body })
        } else {
            Ok(Outcome::Buffered)
        }
    }

    /// Posts whatever [`run_once`] produced.
    pub async fn deliver(
        ctx: &RequestContext,
        client: &PlatformApiClient,
        request_id: &str,
        outcome: Outcome,
    ) -> Result<(), crate::errors::TransportError> {
        match outcome {
            Outcome::Buffered => client.post_response(request_id, ctx.config.raw, &ctx.response).await,
            Outcome::Streaming { prelude, body } => {
                let (tx, rx) = mpsc::channel(1);
                if !body.is_empty() {
                    let _ = tx.send(Bytes::from(body)).await;
                }
                drop(tx);
                client.stream_response(request_id, prelude, rx).await
            }
        }
    }
}

fn prepare_route(
    ctx: &mut RequestContext,
    request: &mut crate::context::RequestView,
) -> Result<(), RouteError> {
    let route = route::match_path(ctx.config.match_regex.as_ref(), &request.path)?;
    let main_file = route::resolve_main_file(&ctx.config.task_root, &ctx.config.main_template, &route)?;

    if !ctx.persistent.stat_cache.is_regular_file(&main_file) {
        return Err(RouteError::NotFound);
    }

    if let Some(template) = &ctx.config.path_info_template {
        request.path_info = Some(route.substitute(template)?);
    }

    request.main_file = main_file;
    Ok(())
}

fn route_err_status(err: RouteError) -> u16 {
    match err {
        RouteError::NoMatch | RouteError::NotFound => 404,
    }
}

async fn ensure_initialised(ctx: &mut RequestContext) -> Result<(), ()> {
    let Some(init_chunk) = ctx.config.init_chunk.clone() else {
        ctx.persistent.script_state.acquire();
        return Ok(());
    };

    let already_initialised = match &ctx.persistent.script_state {
        crate::script::ScriptState::Present(present) => present.is_initialised(),
        crate::script::ScriptState::Absent => false,
    };
    if already_initialised {
        return Ok(());
    }

    let source = match read_chunk(&ctx.config.task_root, &init_chunk).await {
        Ok(source) => source,
        Err(_) => {
            write_error_response(ctx, 500, "init chunk could not be read", None);
            return Err(());
        }
    };

    let present = ctx.persistent.script_state.acquire();
    match bridge::run_init_chunk(present, &source, &init_chunk) {
        Ok(_) => {
            present.mark_initialised();
            Ok(())
        }
        Err(err) => {
            ctx.persistent.script_state.close();
            write_script_error(ctx, &err.message, err.traceback.as_deref());
            Err(())
        }
    }
}

async fn run_chunk_chain(ctx: &mut RequestContext) -> Result<(), ()> {
    let mut complete = false;

    for slot in ["pre", "main", "post"] {
        if slot == "main" && complete {
            continue;
        }

        let path = match slot {
            "pre" => ctx.config.pre_chunk.as_ref().map(|f| format!("{}/{f}", ctx.config.task_root)),
            "post" => ctx.config.post_chunk.as_ref().map(|f| format!("{}/{f}", ctx.config.task_root)),
            "main" => ctx.request.as_ref().map(|r| r.main_file.clone()),
            _ => unreachable!(),
        };

        let Some(path) = path else { continue };

        let source = match tokio::fs::read_to_string(&path).await {
            Ok(source) => source,
            Err(_) if slot != "main" => continue,
            Err(_) => {
                write_error_response(ctx, 404, "Not Found", None);
                return Err(());
            }
        };

        let present = ctx.persistent.script_state.acquire();
        let env = match present.create_invocation_env() {
            Ok(env) => env,
            Err(err) => {
                write_script_error(ctx, &err.message, err.traceback.as_deref());
                return Err(());
            }
        };

        let request = ctx.request.take().unwrap_or_default();
        let response = std::mem::take(&mut ctx.response);

        let result = bridge::run_chunk(present, request, response, &source, &path, env);

        match result {
            Ok(outcome) => {
                ctx.request = Some(outcome.request);
                ctx.response = outcome.response;
                if outcome.close {
                    ctx.persistent.close_flag = true;
                }
                if slot == "pre" && (outcome.complete || outcome.return_value > 0) {
                    complete = true;
                }
                if outcome.return_value > 0 {
                    ctx.response.set_status(outcome.return_value);
                } else if outcome.return_value < 0 {
                    ctx.response.set_status(500);
                }
            }
            Err(err) => {
                ctx.persistent.close_flag = true;
                write_script_error(ctx, &err.message, err.traceback.as_deref());
                ctx.persistent.script_state.close();
                return Err(());
            }
        }
    }

    Ok(())
}

fn release_state(ctx: &mut RequestContext) {
    let max_requests = ctx.config.max_requests_per_state;
    let gc_threshold = ctx.config.gc_threshold;
    let should_close = ctx.persistent.close_flag;

    if let crate::script::ScriptState::Present(present) = &mut ctx.persistent.script_state {
        present.release(gc_threshold);
        if should_close || present.req_count() >= max_requests {
            ctx.persistent.script_state.close();
        }
    }
    ctx.persistent.close_flag = false;
}

async fn read_chunk(task_root: &str, filename: &str) -> std::io::Result<String> {
    tokio::fs::read_to_string(format!("{task_root}/{filename}")).await
}

fn write_error_response(ctx: &mut RequestContext, status: u16, message: &str, diagnostic: Option<&str>) {
    ctx.response.set_status(status as i64);
    let mut error = json!({ "code": status, "message": message });
    if let Some(diagnostic) = diagnostic {
        error["diagnostic"] = json!(diagnostic);
    }
    let body = json!({ "error": error });
    crate::sink::seek_set(&mut ctx.response, 0).ok();
    crate::sink::write(&mut ctx.response, serde_json::to_vec(&body).unwrap_or_default().as_slice());
}

fn write_script_error(ctx: &mut RequestContext, message: &str, traceback: Option<&str>) {
    let diagnostic = if ctx.config.diagnostic { traceback } else { None };
    write_error_response(ctx, 500, message, diagnostic);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogFormat, LogLevel, RuntimeConfig};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(task_root: &TempDir) -> RuntimeConfig {
        RuntimeConfig {
            runtime_api: "127.0.0.1:0".to_string(),
            task_root: task_root.path().to_string_lossy().into_owned(),
            match_regex: None,
            main_template: "main.lua".to_string(),
            path_info_template: None,
            init_chunk: None,
            pre_chunk: None,
            post_chunk: None,
            raw: true,
            gc_threshold: 0,
            max_requests_per_state: usize::MAX,
            diagnostic: true,
            log_level: LogLevel::Info,
            log_format: LogFormat::Text,
            connect_timeout: Duration::from_secs(1),
            stat_cache_capacity: 1024,
        }
    }

    fn write_chunk(dir: &TempDir, name: &str, source: &str) {
        std::fs::write(dir.path().join(name), source).unwrap();
    }

    #[tokio::test]
    async fn run_once_executes_main_chunk_and_buffers_response() {
        let dir = TempDir::new().unwrap();
        write_chunk(&dir, "main.lua", "response.status = 201\nresponse.body:write('hello')\n");

        let mut ctx = RequestContext::new(config(&dir)).unwrap();
        let outcome = Orchestrator::run_once(&mut ctx, b"raw body".to_vec()).await.unwrap();

        assert!(matches!(outcome, Outcome::Buffered));
        assert_eq!(ctx.response.status(), 201);
        assert_eq!(ctx.response.body, b"hello");
    }

    #[tokio::test]
    async fn run_once_reports_404_when_main_file_is_missing() {
        let dir = TempDir::new().unwrap();

        let mut ctx = RequestContext::new(config(&dir)).unwrap();
        let outcome = Orchestrator::run_once(&mut ctx, b"raw body".to_vec()).await.unwrap();

        assert!(matches!(outcome, Outcome::Buffered));
        assert_eq!(ctx.response.status(), 404);
    }

    #[tokio::test]
    async fn run_once_turns_script_error_into_500_with_diagnostic() {
        let dir = TempDir::new().unwrap();
        write_chunk(&dir, "main.lua", "error('boom')\n");

        let mut ctx = RequestContext::new(config(&dir)).unwrap();
        let outcome = Orchestrator::run_once(&mut ctx, b"raw body".to_vec()).await.unwrap();

        assert!(matches!(outcome, Outcome::Buffered));
        assert_eq!(ctx.response.status(), 500);
        let body: serde_json::Value = serde_json::from_slice(&ctx.response.body).unwrap();
        assert!(body["error"]["message"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn pre_chunk_setcomplete_skips_main_chunk() {
        let dir = TempDir::new().unwrap();
        write_chunk(&dir, "pre.lua", "lws.setcomplete()\nresponse.status = 204\n");
        write_chunk(&dir, "main.lua", "response.status = 500\n");

        let mut cfg = config(&dir);
        cfg.pre_chunk = Some("pre.lua".to_string());

        let mut ctx = RequestContext::new(cfg).unwrap();
        let outcome = Orchestrator::run_once(&mut ctx, b"raw body".to_vec()).await.unwrap();

        assert!(matches!(outcome, Outcome::Buffered));
        assert_eq!(ctx.response.status(), 204);
    }

    #[tokio::test]
    async fn init_chunk_runs_once_and_shares_globals_with_main() {
        // A fresh per-invocation env only falls back to globals for reads
        // (spec §4.10 "inherits globals via an index metatable"); it has
        // no `__newindex`, so a bare `x = ...` in `main` rebinds `x` on
        // that throwaway env rather than on the shared globals table.
        // Mutating a *field* of a table object `init` put in globals,
        // however, still writes through to that same shared table.
        let dir = TempDir::new().unwrap();
        write_chunk(&dir, "init.lua", "STATE = { n = 0 }\n");
        write_chunk(&dir, "main.lua", "STATE.n = STATE.n + 1\nresponse.body:write(tostring(STATE.n))\n");

        let mut cfg = config(&dir);
        cfg.init_chunk = Some("init.lua".to_string());

        let mut ctx = RequestContext::new(cfg).unwrap();

        Orchestrator::run_once(&mut ctx, b"raw body".to_vec()).await.unwrap();
        assert_eq!(ctx.response.body, b"1");

        ctx.reset_for_next_invocation();
        Orchestrator::run_once(&mut ctx, b"raw body".to_vec()).await.unwrap();
        assert_eq!(ctx.response.body, b"2");
    }
}
