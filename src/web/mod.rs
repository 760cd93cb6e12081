//! Web API module for the offset server.

pub mod middleware;
pub mod routes;

pub use routes::*;
