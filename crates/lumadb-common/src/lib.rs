//! LumaDB Common - Shared utilities and types
//!
//! This crate provides common functionality used by the data-handle layer:
//! - Error types and handling
//! - Configuration management
//! - Logging setup
//! - Metrics and observability
//! - Common type definitions

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod types;

pub use config::Config;
pub use error::{Error, HandleError, Result};
pub use types::*;
