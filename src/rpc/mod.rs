//! JSON-RPC correlation over the agent subprocess pipe (C5).

pub mod correlator;
pub mod types;

pub use correlator::{Correlator, Inbound, NotificationHandler};
