//! Error types for the conversion state machine

use crate::cloud::CloudError;
use thiserror::Error;

/// Main error type for a conversion run
#[derive(Error, Debug)]
pub enum ConvertError {
    /// User input or instance state violates a sanity rule. No record was mutated.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A side-effect call returned a non-retryable provider error. The step
    /// was not advanced and will re-run on the next invocation.
    #[error("step '{step}' failed: {reason}")]
    StepFailed { step: &'static str, reason: String },

    /// A waiter exceeded its polling budget. Fatal for this invocation,
    /// safely retryable on the next.
    #[error("step '{step}' timed out after {waited_secs}s")]
    WaiterTimeout { step: &'static str, waited_secs: u64 },

    /// The record store is unavailable.
    #[error("record store failure: {0}")]
    Persistence(String),

    /// External state no longer matches the persisted snapshots and cannot
    /// be re-converged by replaying steps.
    #[error("conversion diverged at step '{step}': {detail}. Inspect the persisted job record to reconstruct manually.")]
    Diverged { step: &'static str, detail: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ConvertError>;
