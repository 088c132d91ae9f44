//! Resumable EC2 billing-model conversion state machine
//!
//! Converts a live instance between on-demand and persistent-spot billing
//! (or replaces it with a different instance type / CPU configuration)
//! while preserving every attribute the provider allows: network identity,
//! attached storage, tags, user data, boot configuration, accelerators,
//! target-group memberships and alarms. There is no in-place provider API
//! for this, so the conversion is a long sequence of destructive and
//! constructive control-plane operations driven by a crash-safe,
//! per-instance job record: re-running the tool with the same instance id
//! resumes exactly where the previous run left off.

pub mod cloud;
pub mod error;
pub mod executor;
pub mod preflight;
pub mod progress;
pub mod projector;
pub mod record;
pub mod registry;
pub mod snapshot;
pub mod steps;
pub mod store;

pub use cloud::{CloudApi, CloudError, JOB_TAG_KEY};
pub use error::{ConvertError, Result};
pub use executor::{Executor, RunControls, RunSummary};
pub use progress::{NullReporter, Reporter};
pub use record::{BillingModel, ConversionRequest, ConversionStatus, JobRecord};
pub use store::{EnsureTable, RecordStore};
