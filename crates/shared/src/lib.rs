// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! MaturaMate shared types
//!
//! Subject catalog model and database helpers used by both the billing
//! crate and the API server.

pub mod db;
pub mod subject;

pub use db::{create_pool, run_migrations};
pub use subject::{Subject, SubjectCatalog};
