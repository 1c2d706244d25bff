//! facematchd: HTTP daemon for face registration and comparison.

pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;

pub use cleanup::{CleanupDaemon, CleanupHandle};
pub use config::Config;
pub use error::ApiError;
pub use http::{router, AppState};
