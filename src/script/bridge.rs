//! Script bridge (spec §4.10).
//!
//! Installs the `lws` module table and the `request`/`response` objects
//! into a chunk's environment for the duration of one call. `mlua`'s
//! `Lua::scope` is the idiomatic way to register Rust closures that
//! borrow non-`'static` data for exactly one call — the direct analogue
//! of the original's per-invocation upvalues (Design Notes §9:
//! "abstract as an opaque handle to the interpreter, plus a capability
//! set"). Shared mutable state a closure needs (the response buffer, the
//! complete/close flags) is wrapped in `Rc<RefCell<_>>`/`Rc<Cell<_>>` so
//! multiple scoped closures can each hold a handle to the same cell.

use crate::context::{RequestView, ResponseState};
use crate::errors::ScriptError;
use crate::logging::{self, Severity};
use crate::script::state::PresentState;
use mlua::{Lua, Value as LuaValue};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// What a chunk run through the bridge did, beyond its raw return value.
pub struct ChunkResult {
    pub return_value: i64,
    pub complete: bool,
    pub close: bool,
    pub response: ResponseState,
    pub request: RequestView,
}

/// Runs one chunk with `lws`/`request`/`response` installed into `env`.
///
/// `response.body:flush()` seals the response headers (spec §4.6: once
/// sealed, headers become read-only) but does not itself push bytes
/// anywhere — the orchestrator's one streaming path (spec §4.11 step 6)
/// already has the full, already-sealed body in hand by the time a
/// chunk returns (see orchestrator.rs's "Streaming simplification"
/// note), so there is no live sender for a chunk call to feed.
pub fn run_chunk(
    present: &PresentState,
    request: RequestView,
    response: ResponseState,
    source: &str,
    chunk_name: &str,
    env: mlua::Table,
) -> Result<ChunkResult, ScriptError> {
    let lua = present.lua();
    let complete = Rc::new(Cell::new(false));
    let close = Rc::new(Cell::new(false));
    let request = Rc::new(request);
    let response = Rc::new(RefCell::new(response));

    let value: mlua::Result<LuaValue> = lua.scope(|scope| {
        let lws = lua.create_table()?;

        lws.set(
            "log",
            scope.create_function(|_, (level, message): (Option<String>, String)| {
                logging::log(Severity::parse(level.as_deref()), &message);
                Ok(())
            })?,
        )?;

        {
            let complete = complete.clone();
            lws.set(
                "setcomplete",
                scope.create_function_mut(move |_, ()| {
                    complete.set(true);
                    Ok(())
                })?,
            )?;
        }
        {
            let close = close.clone();
            lws.set(
                "setclose",
                scope.create_function_mut(move |_, ()| {
                    close.set(true);
                    Ok(())
                })?,
            )?;
        }

        lws.set(
            "parseargs",
            scope.create_function(|lua, qs: String| {
                let table = lua.create_table()?;
                for (key, value) in parse_query_string(&qs) {
                    table.set(key, value)?;
                }
                Ok(table)
            })?,
        )?;

        let status_table = lua.create_table()?;
        for entry in crate::status::all() {
            status_table.set(entry.name.key(), entry.code)?;
        }
        lws.set("status", status_table)?;

        env.set("lws", lws)?;

        let request_table = build_request_table(lua, scope, &request)?;
        env.set("request", request_table)?;

        let response_table = build_response_table(lua, scope, &response)?;
        env.set("response", response_table)?;

        let chunk = lua.load(source).set_name(chunk_name).set_environment(env);
        chunk.eval()
    });

    let value = value.map_err(to_script_error)?;
    let return_value = match value {
        LuaValue::Integer(i) => i,
        LuaValue::Number(n) => n as i64,
        _ => 0,
    };

    let request = Rc::try_unwrap(request).unwrap_or_else(|rc| (*rc).clone());
    let response = Rc::try_unwrap(response)
        .map(RefCell::into_inner)
        .unwrap_or_else(|rc| rc.borrow().clone());

    Ok(ChunkResult {
        return_value,
        complete: complete.get(),
        close: close.get(),
        response,
        request,
    })
}

/// Runs the `init` chunk, at most once per interpreter state (spec §4.9,
/// §4.10). `init` has no request/response to operate on yet, so only the
/// `lws` module (`log`/`parseargs`/`status`) is installed, directly into
/// the interpreter's own globals rather than a scoped per-invocation env
/// — the chunk is expected to define globals (functions, shared tables)
/// that later `pre`/`main`/`post` chunks see through their env's
/// `__index` fallback to globals.
pub fn run_init_chunk(present: &PresentState, source: &str, chunk_name: &str) -> Result<i64, ScriptError> {
    let lua = present.lua();

    let value: mlua::Result<LuaValue> = lua.scope(|scope| {
        let lws = lua.create_table()?;

        lws.set(
            "log",
            scope.create_function(|_, (level, message): (Option<String>, String)| {
                logging::log(Severity::parse(level.as_deref()), &message);
                Ok(())
            })?,
        )?;

        lws.set(
            "parseargs",
            scope.create_function(|lua, qs: String| {
                let table = lua.create_table()?;
                for (key, value) in parse_query_string(&qs) {
                    table.set(key, value)?;
                }
                Ok(table)
            })?,
        )?;

        let status_table = lua.create_table()?;
        for entry in crate::status::all() {
            status_table.set(entry.name.key(), entry.code)?;
        }
        lws.set("status", status_table)?;

        lua.globals().set("lws", lws)?;

        lua.load(source).set_name(chunk_name).eval()
    });

    let value = value.map_err(to_script_error)?;
    Ok(match value {
        LuaValue::Integer(i) => i,
        LuaValue::Number(n) => n as i64,
        _ => 0,
    })
}

fn build_request_table<'scope, 'lua>(
    lua: &'lua Lua,
    scope: &mlua::Scope<'lua, 'scope>,
    request: &Rc<RequestView>,
) -> mlua::Result<mlua::Table<'lua>> {
    let table = lua.create_table()?;
    table.set("method", request.method.clone())?;
    table.set("path", request.path.clone())?;
    table.set("ip", request.source_ip.clone().unwrap_or_default())?;
    table.set("path_info", request.path_info.clone().unwrap_or_default())?;

    {
        let request = request.clone();
        table.set(
            "args",
            scope.create_function(move |lua, ()| {
                let table = lua.create_table()?;
                for (key, value) in parse_query_string(&request.query) {
                    table.set(key, value)?;
                }
                Ok(table)
            })?,
        )?;
    }

    let headers_proxy = lua.create_table()?;
    let headers_meta = lua.create_table()?;
    {
        let request = request.clone();
        headers_meta.set(
            "__index",
            scope.create_function(move |lua, (_t, key): (mlua::Table, String)| {
                match request.headers.get(&key) {
                    Some(v) => Ok(LuaValue::String(lua.create_string(v)?)),
                    None => Ok(LuaValue::Nil),
                }
            })?,
        )?;
    }
    headers_meta.set(
        "__newindex",
        scope.create_function(|_, (_t, _key, _value): (mlua::Table, String, LuaValue)| {
            Err::<(), _>(mlua::Error::RuntimeError(
                "request.headers is read-only".to_string(),
            ))
        })?,
    )?;
    headers_proxy.set_metatable(Some(headers_meta));
    table.set("headers", headers_proxy)?;

    let body_table = lua.create_table()?;
    {
        let request = request.clone();
        body_table.set(
            "read",
            scope.create_function(move |lua, _mode: Option<String>| {
                lua.create_string(&request.body)
            })?,
        )?;
    }
    table.set("body", body_table)?;

    Ok(table)
}

fn build_response_table<'scope, 'lua>(
    lua: &'lua Lua,
    scope: &mlua::Scope<'lua, 'scope>,
    response: &Rc<RefCell<ResponseState>>,
) -> mlua::Result<mlua::Table<'lua>> {
    let table = lua.create_table()?;

    let headers_proxy = lua.create_table()?;
    let headers_meta = lua.create_table()?;
    {
        let response = response.clone();
        headers_meta.set(
            "__index",
            scope.create_function(move |lua, (_t, key): (mlua::Table, String)| {
                match response.borrow().headers.get(&key) {
                    Some(v) => Ok(LuaValue::String(lua.create_string(v)?)),
                    None => Ok(LuaValue::Nil),
                }
            })?,
        )?;
    }
    {
        let response = response.clone();
        headers_meta.set(
            "__newindex",
            scope.create_function_mut(move |_, (_t, key, value): (mlua::Table, String, String)| {
                let mut r = response.borrow_mut();
                if !r.is_sealed() {
                    r.headers.insert(key, value);
                }
                Ok(())
            })?,
        )?;
    }
    headers_proxy.set_metatable(Some(headers_meta));
    table.set("headers", headers_proxy)?;

    let body_table = lua.create_table()?;
    {
        let response = response.clone();
        body_table.set(
            "write",
            scope.create_function_mut(move |_, data: mlua::String| {
                crate::sink::write(&mut response.borrow_mut(), data.as_bytes());
                Ok(())
            })?,
        )?;
    }
    {
        let response = response.clone();
        body_table.set(
            "flush",
            scope.create_function_mut(move |_, ()| {
                let mut r = response.borrow_mut();
                if !r.is_sealed() {
                    r.seal();
                }
                Ok(())
            })?,
        )?;
    }
    table.set("body", body_table)?;

    let status_meta = lua.create_table()?;
    {
        let response = response.clone();
        status_meta.set(
            "__index",
            scope.create_function(move |_, (_t, key): (mlua::Table, String)| {
                if key == "status" {
                    Ok(LuaValue::Integer(response.borrow().status() as i64))
                } else {
                    Ok(LuaValue::Nil)
                }
            })?,
        )?;
    }
    {
        let response = response.clone();
        status_meta.set(
            "__newindex",
            scope.create_function_mut(move |_, (_t, key, value): (mlua::Table, String, LuaValue)| {
                if key == "status" {
                    let code = match value {
                        LuaValue::Integer(i) => i,
                        LuaValue::Number(n) => n as i64,
                        _ => return Ok(()),
                    };
                    response.borrow_mut().set_status(code);
                }
                Ok(())
            })?,
        )?;
    }
    table.set_metatable(Some(status_meta));

    Ok(table)
}

/// `lws.parseargs` (spec §4.10): URL-decodes a query string into a
/// mapping. `+` -> space, `%HH` (either hex case), malformed `%`
/// sequences pass through literally, keys without `=` map to `""`,
/// empty keys are skipped. Hand-rolled because `url`/`percent-encoding`
/// enforce strict RFC 3986 decoding and would reject or alter exactly
/// the malformed input spec requires to pass through unchanged.
pub fn parse_query_string(qs: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for pair in qs.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        let key = percent_decode(key);
        if key.is_empty() {
            continue;
        }
        out.push((key, percent_decode(value)));
    }
    out
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() && is_hex(bytes[i + 1]) && is_hex(bytes[i + 2]) => {
                let hi = hex_value(bytes[i + 1]);
                let lo = hex_value(bytes[i + 2]);
                out.push((hi << 4) | lo);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_hex(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => 0,
    }
}

fn to_script_error(err: mlua::Error) -> ScriptError {
    ScriptError {
        message: err.to_string(),
        traceback: Some(format!("{err:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plus_and_percent() {
        let parsed = parse_query_string("a=1+2&b=%41%42");
        assert_eq!(parsed, vec![("a".into(), "1 2".into()), ("b".into(), "AB".into())]);
    }

    #[test]
    fn key_without_equals_maps_to_empty_string() {
        let parsed = parse_query_string("flag");
        assert_eq!(parsed, vec![("flag".into(), "".into())]);
    }

    #[test]
    fn malformed_percent_sequence_passes_through() {
        let parsed = parse_query_string("a=100%+off");
        assert_eq!(parsed, vec![("a".into(), "100% off".into())]);
    }

    #[test]
    fn empty_key_is_skipped() {
        let parsed = parse_query_string("=value&ok=1");
        assert_eq!(parsed, vec![("ok".into(), "1".into())]);
    }
}
