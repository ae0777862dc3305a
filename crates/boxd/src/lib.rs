//! boxd — the Box daemon runtime.
//!
//! Lifecycle orchestration only: bind the socket, bootstrap the store and
//! the Location Service queue, run the dispatch loop, the periodic presence
//! refresh, and the admin channel, then shut everything down in reverse
//! order. Protocol logic lives in `box-service`.

pub mod admin;
pub mod logging;
pub mod nat;
pub mod refresh;
pub mod runtime;
pub mod transport;

pub use runtime::Runtime;

/// Human-readable identification string sent in STATUS replies.
pub fn build_id() -> String {
    format!("boxd/{} ({})", env!("CARGO_PKG_VERSION"), std::env::consts::OS)
}
