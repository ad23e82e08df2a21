//! HTTP/JSON surface over the polling registry

pub mod handlers;
pub mod models;
pub mod routes;

pub use routes::{router, AppState};
