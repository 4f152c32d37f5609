//! Common test utilities for API integration tests
//!
//! Builds the real router over an in-memory job store and mints tokens
//! for it.

#![allow(unused_imports)]

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;
