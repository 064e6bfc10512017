//! Test support: scripted doubles for the remote backend and transport.
//!
//! These are real (non-`cfg(test)`) exports so downstream crates can drive
//! the engine in their own tests without a live backend.

pub mod mocks;
