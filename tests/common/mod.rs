//! Common test utilities for sharded-counter
//!
//! - `fixtures`: service harnesses over the in-process backends
//! - `test_helpers`: fault-injecting store and cache-flush patterns

#![allow(dead_code)]

pub mod fixtures;
pub mod test_helpers;
