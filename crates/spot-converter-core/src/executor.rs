//! State-machine executor
//!
//! Loads the job record, finds the resume point, runs the registry steps
//! sequentially and persists the record after each one. The record only
//! advances when a step's side effect has been acknowledged by the cloud,
//! so interrupting the process at any moment is safe: the next invocation
//! replays the completed steps from the record and resumes at the first
//! unfinished one.

use crate::cloud::CloudApi;
use crate::error::{ConvertError, Result};
use crate::preflight;
use crate::progress::Reporter;
use crate::record::{now_iso8601, ConversionRequest, ConversionStatus, JobRecord};
use crate::registry::{self, PollPolicy, StepDescriptor};
use crate::steps::{self, StepCtx, StepOutcome};
use crate::store::RecordStore;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Per-invocation controls, deliberately not remembered by the record.
#[derive(Debug, Clone, Default)]
pub struct RunControls {
    pub force: bool,
    pub delete_ami: bool,
    pub do_not_pause_on_major_warnings: bool,
    /// Operator escape hatch: rewind the machine to just before this step.
    pub reset_step: Option<String>,
}

/// What a finished (or replayed) run hands back to the caller.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub record: JobRecord,
    /// True when the invocation only replayed a previously successful run.
    pub replayed: bool,
    pub warnings: Vec<String>,
}

/// Fallback cadence for `RetryLater` outcomes of non-waiter steps.
const DEFAULT_POLL: PollPolicy = PollPolicy {
    interval: Duration::from_secs(5),
    timeout: Duration::from_secs(600),
};

/// Sequential, single-flight step runner
pub struct Executor<'a> {
    cloud: &'a dyn CloudApi,
    store: &'a dyn RecordStore,
    reporter: &'a dyn Reporter,
}

impl<'a> Executor<'a> {
    pub fn new(
        cloud: &'a dyn CloudApi,
        store: &'a dyn RecordStore,
        reporter: &'a dyn Reporter,
    ) -> Self {
        Self {
            cloud,
            store,
            reporter,
        }
    }

    /// Run (or resume, or replay) the conversion of `instance_id`.
    pub async fn run(
        &self,
        instance_id: &str,
        request: ConversionRequest,
        controls: RunControls,
    ) -> Result<RunSummary> {
        self.store.ensure_table().await?;

        let loaded = self.store.load(instance_id).await?;
        let fresh_record = loaded.is_none();
        let mut record =
            loaded.unwrap_or_else(|| JobRecord::new(instance_id, request.clone()));

        let mut warnings = Vec::new();
        let effective_request = record.request();
        if !fresh_record {
            if let Some(drift) = request_drift(&effective_request, &request) {
                let message = format!(
                    "Operator inputs changed compared to the recorded job ({drift}); the \
                     recorded inputs win."
                );
                self.reporter.warning(&message);
                warnings.push(message);
            }
        }

        if let Some(step_name) = controls.reset_step.clone() {
            self.apply_reset(&mut record, &step_name, &controls).await?;
        }

        if record.is_success() {
            if controls.delete_ami && record.ami_id.is_some() {
                // Re-open the tail of the machine so `deregister_image`
                // executes against the recorded image.
                record.last_successful_step_name =
                    registry::previous_step("deregister_image").map(str::to_string);
            } else {
                self.replay_all(&record);
                return Ok(RunSummary {
                    record,
                    replayed: true,
                    warnings,
                });
            }
        }

        let steps = registry::steps();
        let resume_idx = resume_index(&record);

        // Sanity rules only make sense while the original instance still
        // exists untouched; resumed runs past the stop barrier skip them.
        let mut stop_failed = false;
        let wait_stop_idx = registry::index_of("wait_stopped_instance").unwrap_or(0);
        if resume_idx <= wait_stop_idx {
            let report = preflight::run(
                self.cloud,
                self.reporter,
                &controls,
                instance_id,
                &effective_request,
            )
            .await?;
            stop_failed = report.stop_failed;
            if record.kms_key_arn.is_none() {
                record.kms_key_arn = report.kms_key_arn;
            }
        }

        for (idx, descriptor) in steps.iter().enumerate() {
            if idx < resume_idx {
                self.reporter.step_replayed(
                    idx + 1,
                    steps.len(),
                    descriptor.description,
                    record.step_result(descriptor.name),
                );
                continue;
            }
            self.execute_step(
                idx,
                steps.len(),
                descriptor,
                &mut record,
                &effective_request,
                &controls,
                &mut warnings,
                fresh_record,
                stop_failed,
            )
            .await?;
        }

        record.conversion_status = Some(ConversionStatus::Success);
        record.end_date = Some(now_iso8601());
        self.save(&record).await?;

        Ok(RunSummary {
            record,
            replayed: false,
            warnings,
        })
    }

    /// Re-emit the cached output of a finished conversion.
    fn replay_all(&self, record: &JobRecord) {
        let steps = registry::steps();
        for (idx, descriptor) in steps.iter().enumerate() {
            self.reporter.step_replayed(
                idx + 1,
                steps.len(),
                descriptor.description,
                record.step_result(descriptor.name),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_step(
        &self,
        idx: usize,
        total: usize,
        descriptor: &StepDescriptor,
        record: &mut JobRecord,
        request: &ConversionRequest,
        controls: &RunControls,
        warnings: &mut Vec<String>,
        fresh_record: bool,
        stop_failed: bool,
    ) -> Result<()> {
        debug!(step = descriptor.name, "executing step");
        self.reporter
            .step_started(idx + 1, total, descriptor.description);
        let started = Instant::now();

        loop {
            let outcome = {
                let mut ctx = StepCtx {
                    cloud: self.cloud,
                    record: &mut *record,
                    request: request.clone(),
                    controls,
                    reporter: self.reporter,
                    warnings: &mut *warnings,
                    fresh_record,
                    stop_failed,
                };
                steps::run_step(descriptor.name, &mut ctx).await
            };

            match outcome {
                Ok(StepOutcome::Success(detail)) => {
                    record.complete_step(descriptor.name, &detail);
                    self.save(record).await?;
                    self.reporter.step_succeeded(&detail);
                    return Ok(());
                }
                Ok(StepOutcome::Skipped(detail)) => {
                    record.complete_step(descriptor.name, &detail);
                    self.save(record).await?;
                    self.reporter.step_skipped(&detail);
                    return Ok(());
                }
                Ok(StepOutcome::RetryLater(reason)) => {
                    let poll = descriptor.poll.unwrap_or(DEFAULT_POLL);
                    if started.elapsed() >= poll.timeout {
                        return Err(ConvertError::WaiterTimeout {
                            step: descriptor.name,
                            waited_secs: started.elapsed().as_secs(),
                        });
                    }
                    self.reporter.note(&reason);
                    tokio::time::sleep(poll.interval).await;
                }
                Err(e) => {
                    // The step did not advance; persist whatever the
                    // handler left (rewinds included) so the next
                    // invocation resumes from a consistent record.
                    if let Err(persist_err) = self.save(record).await {
                        self.reporter
                            .warning(&format!("additionally failed to persist the record: {persist_err}"));
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn apply_reset(
        &self,
        record: &mut JobRecord,
        step_name: &str,
        controls: &RunControls,
    ) -> Result<()> {
        let target_idx = registry::index_of(step_name).ok_or_else(|| {
            ConvertError::InvalidInput(format!(
                "unknown step '{step_name}' for --reset-step; valid names: {:?}",
                registry::steps().iter().map(|s| s.name).collect::<Vec<_>>()
            ))
        })?;

        preflight::major_warning(
            self.reporter,
            controls,
            "You are manipulating the tool state machine. Make sure you know what you are doing!",
        )
        .await;

        let checkpoint_idx = registry::index_of(registry::CHECKPOINT_STEP).unwrap_or(usize::MAX);
        let last_idx = record
            .last_successful_step_name
            .as_deref()
            .and_then(registry::index_of);
        let destroyed = last_idx.map(|idx| idx > checkpoint_idx).unwrap_or(false);
        if destroyed && target_idx <= checkpoint_idx && !controls.force {
            return Err(ConvertError::Precondition(format!(
                "--reset-step {step_name} would cross back over the '{}' point of no return: \
                 the original instance no longer exists and the early steps cannot re-run \
                 against it. Use --force if you really want this.",
                registry::CHECKPOINT_STEP
            )));
        }

        debug!(step = step_name, "resetting state machine");
        if target_idx == 0 {
            // Back to the very beginning: discard the job entirely so the
            // next steps capture fresh state.
            self.store.delete(&record.instance_id).await?;
            let instance_id = record.instance_id.clone();
            *record = JobRecord::new(&instance_id, record.request());
        } else {
            record.last_successful_step_name =
                registry::previous_step(step_name).map(str::to_string);
            if record.is_success() {
                record.conversion_status = Some(ConversionStatus::InProgress);
                record.end_date = None;
            }
        }
        self.save(record).await
    }

    async fn save(&self, record: &JobRecord) -> Result<()> {
        self.store.save(record).await
    }
}

/// First step index that still has to run.
fn resume_index(record: &JobRecord) -> usize {
    record
        .last_successful_step_name
        .as_deref()
        .and_then(registry::index_of)
        .map(|idx| idx + 1)
        .unwrap_or(0)
}

/// Human-readable list of fields differing between the recorded request
/// and the one supplied on this invocation, or `None` when identical.
fn request_drift(recorded: &ConversionRequest, supplied: &ConversionRequest) -> Option<String> {
    if recorded == supplied {
        return None;
    }
    let recorded = serde_json::to_value(recorded).ok()?;
    let supplied = serde_json::to_value(supplied).ok()?;
    let (Some(recorded), Some(supplied)) = (recorded.as_object(), supplied.as_object()) else {
        return None;
    };

    let mut changes = Vec::new();
    for (key, old) in recorded {
        let new = supplied.get(key).cloned().unwrap_or(serde_json::Value::Null);
        if *old != new {
            changes.push(format!("{key}: {old} -> {new}"));
        }
    }
    if changes.is_empty() {
        None
    } else {
        Some(changes.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::BillingModel;

    #[test]
    fn test_resume_index() {
        let mut record = JobRecord::new("i-1", ConversionRequest::default());
        assert_eq!(resume_index(&record), 0);
        record.complete_step("read_state_table", "ok");
        assert_eq!(resume_index(&record), 1);
        record.complete_step("discover_instance_state", "ok");
        assert_eq!(resume_index(&record), 2);
        record.last_successful_step_name = Some("deregister_image".to_string());
        assert_eq!(resume_index(&record), registry::steps().len());
    }

    #[test]
    fn test_request_drift() {
        let recorded = ConversionRequest::default();
        assert!(request_drift(&recorded, &recorded.clone()).is_none());

        let supplied = ConversionRequest {
            target_billing_model: BillingModel::OnDemand,
            target_instance_type: Some("m5.large".to_string()),
            ..Default::default()
        };
        let drift = request_drift(&recorded, &supplied).unwrap();
        assert!(drift.contains("target_billing_model"));
        assert!(drift.contains("target_instance_type"));
        assert!(!drift.contains("max_spot_price"));
    }
}
