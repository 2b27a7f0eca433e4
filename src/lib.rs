// Core types are re-exported; events (with EventBus) live here next to the runtime
pub use meshcore;

pub mod types {
    pub mod events;
}

pub mod calls;
pub mod config;
mod keepalive;
pub mod server;

pub use calls::{CallError, CallHandle, CallOptions, CallSnapshot, ToggleOutcome};
pub use config::CallConfig;
pub use server::{CallServer, ServerError, ServerPush};
