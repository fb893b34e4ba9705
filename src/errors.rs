//! Error kinds for the runtime.
//!
//! Each stage of the invocation lifecycle gets its own enum, in the
//! teacher's style (`errors::ErrorKind` was one flat enum per crate;
//! here the crate is larger so the same idea is split one enum per
//! concern). All use `thiserror` rather than hand-written `Display`
//! impls, matching the `thiserror` usage already present in the pack
//! (`forwarder`, `receiver` in `iwismer-rusty-timer`).

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("base64 input length is not a multiple of 4")]
    InvalidLength,
    #[error("base64 input contains a non-alphabet byte")]
    InvalidByte,
    #[error("base64 padding is malformed")]
    InvalidPadding,
    #[error("base64 encoded length overflows usize")]
    Overflow,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingRequired(&'static str),
    #[error("environment variable {name} has an invalid value: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("environment variable {name} has a malformed size suffix: {value}")]
    InvalidSize { name: &'static str, value: String },
    #[error("match regex is invalid: {0}")]
    InvalidRegex(#[from] regex::Error),
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invocation body is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported payload version: {0:?}")]
    UnsupportedVersion(Option<String>),
    #[error("invocation body is not valid base64: {0}")]
    BadBase64(#[from] CodecError),
    #[error("required envelope field is missing or the wrong type: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("platform API responded with non-2xx status {0}")]
    NonSuccess(reqwest::StatusCode),
    #[error("poll was cancelled")]
    Cancelled,
    #[error("invocation/next response carried no Lambda-Runtime-Aws-Request-Id header")]
    MissingRequestId,
}

/// Errors surfaced by the routing stage; always map to an HTTP status
/// returned to the caller rather than propagated to the process level.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum RouteError {
    #[error("request path did not match the configured pattern")]
    NoMatch,
    #[error("matched filename is not a regular file")]
    NotFound,
}

/// A chunk raised a Lua error during execution.
#[derive(Debug, Error)]
#[error("script error: {message}")]
pub struct ScriptError {
    pub message: String,
    pub traceback: Option<String>,
}

/// Top-level error for one invocation's pipeline; carries enough
/// information for the orchestrator to decide between an HTTP error
/// response and a `post_error` call.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
