//! HTTP API for health, metrics and operator actions.

pub mod handlers;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_router;
