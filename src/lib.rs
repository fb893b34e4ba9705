//! lws-runtime - a custom process that polls a serverless platform's
//! invocation endpoint and dispatches each invocation through a chain of
//! Lua script chunks.
//!
//! A single long-lived loop fetches one invocation at a time, parses its
//! JSON envelope, runs it through a persistent [`mlua::Lua`] interpreter
//! state, and posts the result back — either buffered or incrementally
//! streamed.
//!
//! # Pipeline
//!
//! [`http_client`] polls the platform API → [`envelope`] parses the
//! invocation body → [`orchestrator`] matches the path via [`route`] and
//! [`statcache`], acquires interpreter state via [`script`], and runs the
//! chunk chain → [`assembler`] builds the response (direct or via
//! [`sink`]) → [`http_client`] posts it back.

pub mod assembler;
pub mod codec;
pub mod config;
pub mod context;
pub mod envelope;
pub mod errors;
pub mod http_client;
pub mod logging;
pub mod orchestrator;
pub mod route;
pub mod script;
pub mod sink;
pub mod status;
pub mod statcache;
pub mod table;

pub use crate::{
    config::RuntimeConfig,
    context::RequestContext,
    errors::InvocationError,
    orchestrator::Orchestrator,
};
