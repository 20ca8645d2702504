//! The Conflux execution engine.
//!
//! Wraps any [`conflux_providers::ProviderHandler`] with a uniform, safe
//! execution envelope: input validation, timeout enforcement, merged
//! cancellation, bounded exponential-backoff retries, and error
//! normalization. `execute` never fails at the call level — every outcome is
//! an [`conflux_types::ExecutionResult`].

pub mod engine;

pub use engine::execute;
