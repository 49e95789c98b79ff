//! HTTP surface of the Carewise analysis orchestrator.
//!
//! The router exposes the orchestrator facade under `/api/v1` using the
//! shared `{success, data, error, pagination}` envelope. Patient records and
//! analysis modules are reached through the HTTP collaborators in
//! [`infra::collaborators`].

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
pub use routes::create_app;
