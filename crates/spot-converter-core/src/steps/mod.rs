//! Side-effect handlers
//!
//! One handler per registry step. Every handler is idempotent: before
//! issuing an externally-visible side effect it queries the cloud to see
//! whether the effect is already present, so replaying a step after a
//! crash (or an operator `--reset-step`) converges instead of duplicating
//! work. Handlers communicate with the executor through `StepOutcome`;
//! waiter steps return `RetryLater` and are re-polled under the step's
//! poll policy.

mod capture;
mod cutover;

use crate::cloud::CloudApi;
use crate::error::{ConvertError, Result};
use crate::executor::RunControls;
use crate::progress::Reporter;
use crate::record::{ConversionRequest, JobRecord};
use serde_json::Value;

/// Result of one handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step's effect is in place; the executor persists and advances.
    Success(String),
    /// Nothing to do for this job; the executor persists and advances.
    Skipped(String),
    /// The awaited condition is not reached yet; the executor sleeps and
    /// re-invokes without advancing.
    RetryLater(String),
}

/// Everything a handler may read or mutate
pub struct StepCtx<'a> {
    pub cloud: &'a dyn CloudApi,
    pub record: &'a mut JobRecord,
    /// Operator inputs as remembered by the record
    pub request: ConversionRequest,
    pub controls: &'a RunControls,
    pub reporter: &'a dyn Reporter,
    /// Warnings accumulated across the run, re-printed at the end
    pub warnings: &'a mut Vec<String>,
    /// True when this invocation created the record
    pub fresh_record: bool,
    /// Preflight attempted a stop and the provider rejected it
    pub stop_failed: bool,
}

impl StepCtx<'_> {
    /// Surface a warning now and keep it for the end-of-run recap.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.reporter.warning(&message);
        self.warnings.push(message);
    }

    /// The discovery snapshot; a missing one means the record predates the
    /// discover step and the step cannot run.
    pub fn original_snapshot(&self, step: &'static str) -> Result<Value> {
        self.record
            .original_instance_state
            .clone()
            .ok_or(ConvertError::StepFailed {
                step,
                reason: "no instance snapshot in the job record".to_string(),
            })
    }
}

/// Execute the handler registered under `step_name`.
pub async fn run_step(step_name: &'static str, ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    match step_name {
        "read_state_table" => capture::read_state_table(ctx).await,
        "discover_instance_state" => capture::discover_instance_state(ctx).await,
        "wait_stopped_instance" => capture::wait_stopped_instance(ctx).await,
        "tag_resources" => capture::tag_resources(ctx).await,
        "get_volume_details" => capture::get_volume_details(ctx).await,
        "detach_volumes" => capture::detach_volumes(ctx).await,
        "wait_volume_detach" => capture::wait_volume_detach(ctx).await,
        "start_ami_creation" => capture::start_ami_creation(ctx).await,
        "prepare_network_interfaces" => capture::prepare_network_interfaces(ctx).await,
        "wait_ami_ready" => capture::wait_ami_ready(ctx).await,
        "checkpoint_instance_state" => capture::checkpoint_instance_state(ctx).await,
        "terminate_instance" => cutover::terminate_instance(ctx).await,
        "wait_resource_release" => cutover::wait_resource_release(ctx).await,
        "create_new_instance" => cutover::create_new_instance(ctx).await,
        "wait_new_instance_running" => cutover::wait_new_instance_running(ctx).await,
        "reattach_volumes" => cutover::reattach_volumes(ctx).await,
        "configure_network_interfaces" => cutover::configure_network_interfaces(ctx).await,
        "manage_elastic_ip" => cutover::manage_elastic_ip(ctx).await,
        "reboot_if_needed" => cutover::reboot_if_needed(ctx).await,
        "untag_resources" => cutover::untag_resources(ctx).await,
        "deregister_image" => cutover::deregister_image(ctx).await,
        other => Err(ConvertError::StepFailed {
            step: "run_step",
            reason: format!("no handler registered for step '{other}'"),
        }),
    }
}

/// The name under which the backup image of a job is created and
/// re-discovered on retry.
pub fn ami_name(instance_id: &str) -> String {
    format!("ec2-spot-converter-{instance_id}")
}
