//! Read-only operational HTTP surface

pub mod handlers;
pub mod server;

pub use handlers::{ApiError, AppState, Caller};
pub use server::{build_router, run_server, ServerConfig};
