//! Cross-crate integration tests for TrustGate
//!
//! This test suite validates:
//! - Fan-out delivery across many publishers, topics and subscribers
//! - Key rotation and expiry as seen by subscribers
//! - The delivery outcome -> trust score -> admission feedback loop
//! - Restart continuity through the SQLite gateway

pub mod test_utils;

#[cfg(test)]
mod fanout_tests;

#[cfg(test)]
mod key_rotation_tests;

#[cfg(test)]
mod trust_feedback_tests;

#[cfg(test)]
mod persistence_tests;
