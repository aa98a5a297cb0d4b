//! # AstroYou Common
//!
//! Utilities shared by the offline agent crates.
//!
//! ## Features
//!
//! - Logging configuration and subscriber setup
//! - Retry with exponential backoff, optionally gated on the error kind

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_if, RetryConfig};
