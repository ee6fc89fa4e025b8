//! HTTP surface for graph inspection and replays

pub mod routes;
pub mod server;

pub use routes::{ApiError, AppState, GraphResponse};
pub use server::{router, ApiServer, ApiServerConfig};
