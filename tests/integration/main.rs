//! Integration tests for the recovery core
//! These tests drive the public API end to end rather than individual units

pub mod test_harness;

pub mod observability_test;
pub mod pac_download_test;
pub mod recovery_flow_test;
