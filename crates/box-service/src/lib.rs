//! box-service — server-side logic above the store.
//!
//! Two actors live here: the Location Service coordinator, sole owner of
//! the `whoswho` queue, and the request dispatcher that turns inbound
//! frames into responses.

pub mod dispatch;
pub mod location;

pub use dispatch::Dispatcher;
pub use location::{LocationService, LocationSummary};
