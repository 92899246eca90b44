//! Unit tests for the recovery core
//!
//! Each file exercises one component through its public API; cross-component
//! scenarios live in the integration tests.

pub mod fallback_test;
