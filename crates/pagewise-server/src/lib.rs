pub mod config;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;

pub use config::{AppConfig, LoggingConfig, RateLimitSettings, ServerConfig};
pub use observability::{apply_logging_level, init_tracing};
pub use server::{AppState, PagewiseServer, ServerBuilder, build_app};
