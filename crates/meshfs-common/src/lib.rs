//! meshfs Common - Shared types and utilities
//!
//! This crate provides the node identifiers, error definitions and
//! configuration types used by the metadata server and its send queue.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
