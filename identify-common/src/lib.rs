//! # Identify Common Library
//!
//! Shared code for the identity reconciliation service:
//! - Error taxonomy (validation, store, invariant failures)
//! - Service configuration loading
//! - Database initialization and the identity record model

pub mod config;
pub mod db;
pub mod error;

pub use config::{MergeStrategy, ServiceConfig};
pub use db::IdentityRecord;
pub use error::{Error, Result};
