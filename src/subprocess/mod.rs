//! Agent subprocess supervision (C4): discovery, spawn, stdio framing, and
//! graceful termination.

pub mod manager;
pub mod stderr;

pub use manager::{discover_binary, SubprocessHandle, SubprocessLines, TERMINATE_GRACE};
