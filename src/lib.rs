pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod errors;

// Re-exports
pub use api::{create_router, run_server, AppState};
pub use config::Settings;
pub use errors::{ClusterError, ClusterResult};
