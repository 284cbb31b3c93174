//! Envelope codec and schema registry (C1).
//!
//! This is the client-facing wire contract: every message on the browser
//! socket is an [`envelope::Envelope`], whose `type` is validated against the
//! closed registry in [`schema`].

pub mod envelope;
pub mod schema;

pub use envelope::{Envelope, EnvelopeError};
