//! Integration tests for the punchclock session core
//! These tests drive the public API end to end: file-backed store, HTTP
//! refresh client, monitor scheduler and observers together.

pub mod test_harness;

pub mod http_refresh_test;
pub mod session_lifecycle_test;
