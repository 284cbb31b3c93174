//! Bearer token service and auth HTTP surface (C2).

pub mod routes;
pub mod token;

pub use token::{Claims, TokenService, Verification};
