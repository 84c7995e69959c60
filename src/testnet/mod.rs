//! Fixtures shared by the unit tests
//!
//! Stores are sled temporary databases, so nothing outlives a test.

pub mod test_utils;

pub use test_utils::*;
