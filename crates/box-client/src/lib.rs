//! box-client — drives one outbound request to completion.
//!
//! The protocol logic is a sans-IO state machine ([`exchange::Exchange`]):
//! frames in, steps out. A thin async driver owns the socket and the
//! per-attempt timeout, and an endpoint selector decides which servers to
//! try in what order.

pub mod driver;
pub mod endpoints;
pub mod exchange;

pub use driver::run_action;
pub use exchange::{ClientError, Exchange, Outcome, Step, SyncedObject};
