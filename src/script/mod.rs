//! Script state lifecycle and bridge (spec §4.9, §4.10).

pub mod bridge;
pub mod state;

pub use state::ScriptState;
