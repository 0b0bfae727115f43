//! Change envelope decoding and table routing.

pub mod dispatcher;
pub mod envelope;

pub use dispatcher::{Dispatcher, RouteTable, TableHandler};
pub use envelope::{ChangeEnvelope, Operation};
