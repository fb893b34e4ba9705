//! Process entry point: reads the environment, installs the SIGTERM
//! handler, and drives the invocation lifecycle loop (spec §4.14).
//!
//! Kept a thin `main` over `lws_runtime::Orchestrator` rather than folding
//! the loop into the library, matching the teacher's split between
//! `maker_web` (the library, `Server::launch`) and its `examples/*.rs`
//! binaries (a `#[tokio::main] async fn main` that builds and launches
//! one).

use lws_runtime::errors::TransportError;
use lws_runtime::{config::RuntimeConfig, context::RequestContext, logging, orchestrator::Orchestrator};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            // No request id exists yet; nothing to `post_error` against
            // and no HTTP client either (spec §7 "Initialisation").
            eprintln!("lws-runtime: fatal: {err}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(config.log_level, config.log_format);

    let runtime_api = config.runtime_api.clone();
    let mut ctx = match RequestContext::new(config) {
        Ok(ctx) => ctx,
        Err(err) => {
            logging::log(logging::Severity::Emerg, &format!("failed to build http client: {err}"));
            return ExitCode::FAILURE;
        }
    };

    let client = lws_runtime::http_client::PlatformApiClient::new(ctx.persistent.http.clone(), &runtime_api);

    let sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            logging::log(logging::Severity::Emerg, &format!("failed to install SIGTERM handler: {err}"));
            return ExitCode::FAILURE;
        }
    };

    // Design Notes §9: re-architect the original's three `volatile`
    // globals as an atomic flag plus the client's own cancellation
    // token, both written only from this watcher task.
    let keep_running = Arc::new(AtomicBool::new(true));
    spawn_signal_watcher(sigterm, keep_running.clone(), client.cancel_handle());

    run_loop(&mut ctx, &client, &keep_running).await
}

/// Awaits SIGTERM once, then clears `keep_running` and cancels any poll
/// currently in flight. Spawned once at startup so a signal arriving
/// mid-poll unblocks it immediately, matching spec §5's "Cancellation":
/// between invocations the loop simply exits when it next checks the
/// flag; mid-poll the cancellation token aborts the blocked wait.
fn spawn_signal_watcher(
    mut sigterm: tokio::signal::unix::Signal,
    keep_running: Arc<AtomicBool>,
    cancel: tokio_util::sync::CancellationToken,
) {
    tokio::spawn(async move {
        if sigterm.recv().await.is_some() {
            keep_running.store(false, Ordering::SeqCst);
            cancel.cancel();
        }
    });
}

/// Mirrors `poll_next`'s trace/deadline headers into the process
/// environment (spec §4.4 `poll_next` result column, §6 "Set
/// side-effects on inbound headers"): present sets, absent unsets.
fn apply_trace_env(invocation: &lws_runtime::http_client::PolledInvocation) {
    match &invocation.trace_id {
        Some(trace_id) => std::env::set_var("_X_AMZN_TRACE_ID", trace_id),
        None => std::env::remove_var("_X_AMZN_TRACE_ID"),
    }
    match &invocation.deadline_ms {
        Some(deadline_ms) => std::env::set_var("_DEADLINE_MS", deadline_ms),
        None => std::env::remove_var("_DEADLINE_MS"),
    }
}

/// The steady-state loop: poll → parse → dispatch → respond, until
/// SIGTERM or an unrecoverable error (spec §4.14, §7).
async fn run_loop(
    ctx: &mut RequestContext,
    client: &lws_runtime::http_client::PlatformApiClient,
    keep_running: &AtomicBool,
) -> ExitCode {
    while keep_running.load(Ordering::SeqCst) {
        let invocation = match client.poll_next().await {
            Ok(invocation) => invocation,
            Err(TransportError::Cancelled) => {
                logging::log(logging::Severity::Notice, "poll cancelled, shutting down");
                return ExitCode::SUCCESS;
            }
            Err(err) => {
                // No request id to report against (spec §7: "For poll:
                // if we have a request ID we post_error, else exit
                // nonzero" — here we never got one at all).
                logging::log(logging::Severity::Crit, &format!("poll_next failed: {err}"));
                return ExitCode::FAILURE;
            }
        };

        let _guard = logging::enter_invocation(&invocation.request_id);
        apply_trace_env(&invocation);
        ctx.reset_for_next_invocation();

        let outcome = Orchestrator::run_once(ctx, invocation.body).await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                // Envelope error: reported via post_error, invocation
                // abandoned (spec §7 "Envelope").
                logging::log(logging::Severity::Err, &format!("envelope error: {err}"));
                if let Err(post_err) = client.post_error(Some(&invocation.request_id), &err.to_string()).await {
                    logging::log(logging::Severity::Emerg, &format!("post_error also failed: {post_err}"));
                    return ExitCode::FAILURE;
                }
                continue;
            }
        };

        if let Err(err) = Orchestrator::deliver(ctx, client, &invocation.request_id, outcome).await {
            logging::log(
                logging::Severity::Crit,
                &format!("posting response for {} failed: {err}", invocation.request_id),
            );
            if let Err(err) = client.post_error(Some(&invocation.request_id), &err.to_string()).await {
                logging::log(logging::Severity::Emerg, &format!("post_error also failed: {err}"));
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
