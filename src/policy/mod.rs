//! Failure Policies
//!
//! - [`retry`]: per-step retry decisions with capped exponential backoff
//! - [`circuit`]: per-endpoint circuit breakers shared across runs

pub mod circuit;
pub mod retry;

pub use circuit::{Admission, CircuitBreakers, CircuitConfig, CircuitPermit, CircuitStatus};
pub use retry::{RetryDecision, RetryPolicy};
