//! Preconditions and warnings
//!
//! Validation that runs before the first step of a (new or resumed-early)
//! conversion: stopped-state requirement, billing-model sanity, spot
//! request anomaly detection, KMS key resolution. Major warnings pause the
//! run for ten seconds so the operator can abort.

use crate::cloud::{CloudApi, SpotRequestView};
use crate::error::{ConvertError, Result};
use crate::executor::RunControls;
use crate::progress::Reporter;
use crate::record::{BillingModel, ConversionRequest};
use crate::snapshot;
use std::time::Duration;

/// How long the executor pauses after a major warning.
pub const MAJOR_WARNING_PAUSE: Duration = Duration::from_secs(10);

/// Facts preflight establishes for the step handlers of this invocation.
#[derive(Debug, Default, Clone)]
pub struct PreflightReport {
    /// A stop was attempted and rejected (`IncorrectSpotRequestState`);
    /// the conversion continues on the running instance.
    pub stop_failed: bool,
    /// Resolved ARN of `--volume-kms-key-id`, when supplied.
    pub kms_key_arn: Option<String>,
}

/// Emit a major warning and give the operator time to react.
pub async fn major_warning(reporter: &dyn Reporter, controls: &RunControls, message: &str) {
    reporter.major_warning(message);
    if !controls.do_not_pause_on_major_warnings {
        reporter.note("Pausing 10s... Press Ctrl-C now if you need time to read the warning above.");
        tokio::time::sleep(MAJOR_WARNING_PAUSE).await;
    }
}

/// Refusal message when the conversion would be a no-op, or `None` when it
/// may proceed.
fn billing_sanity(
    instance_id: &str,
    source: BillingModel,
    orphan_spot_request: bool,
    request: &ConversionRequest,
    force: bool,
) -> Option<String> {
    if source != request.target_billing_model || force || request.changes_hardware() {
        return None;
    }
    match source {
        // An orphaned spot request is exactly what a spot->spot replacement fixes.
        BillingModel::Spot if orphan_spot_request => None,
        BillingModel::Spot => Some(format!(
            "Instance {instance_id} is already a spot instance. Use --target-billing-model \
             'on-demand' to convert it, or --force to replace it with a new spot instance."
        )),
        BillingModel::OnDemand => Some(format!(
            "Instance {instance_id} is already an on-demand instance. Use --target-billing-model \
             'spot' to convert it, or --force to replace it with a new on-demand instance."
        )),
    }
}

/// Validate the request against live instance state and perform the one
/// side effect preflight owns: issuing the stop when `--stop-instance`
/// asks for it.
pub async fn run(
    cloud: &dyn CloudApi,
    reporter: &dyn Reporter,
    controls: &RunControls,
    instance_id: &str,
    request: &ConversionRequest,
) -> Result<PreflightReport> {
    let mut report = PreflightReport::default();

    let instance = cloud
        .describe_instance(instance_id)
        .await?
        .ok_or_else(|| ConvertError::Precondition(format!("can't describe instance '{instance_id}'")))?;

    let spot_request_id = snapshot::spot_request_id(&instance).map(str::to_string);
    let source = if spot_request_id.is_some() {
        BillingModel::Spot
    } else {
        BillingModel::OnDemand
    };

    let mut orphan = false;
    let mut spot_request: Option<SpotRequestView> = None;
    if let Some(request_id) = &spot_request_id {
        spot_request = cloud.describe_spot_request(request_id).await?;
        match &spot_request {
            Some(view) if view.request_type != "persistent" => {
                return Err(ConvertError::Precondition(format!(
                    "spot request {request_id} is of type '{}', only 'persistent' spot instances \
                     can be converted",
                    view.request_type
                )));
            }
            Some(view) => orphan = view.state == "cancelled",
            None => orphan = true,
        }
    }

    if request.target_billing_model == BillingModel::Spot {
        if let Some(price) = request.max_spot_price {
            if price <= 0.0 {
                return Err(ConvertError::Precondition(
                    "--max-spot-price set to a value <= 0.0".to_string(),
                ));
            }
        }
    }

    if let Some(refusal) = billing_sanity(instance_id, source, orphan, request, controls.force) {
        return Err(ConvertError::Precondition(refusal));
    }

    if orphan {
        major_warning(
            reporter,
            controls,
            &format!(
                "Spot instance {instance_id} is linked to an invalid spot request \
                 '{}'! This situation is known to make the instance hard to stop. If stopping \
                 fails with IncorrectSpotRequestState, consider converting the running instance \
                 as-is with --do-not-require-stopped-instance (and quiesce the guest filesystems \
                 first).",
                spot_request_id.as_deref().unwrap_or("unknown")
            ),
        )
        .await;
    }

    if request.do_not_require_stopped_instance {
        let message = if request.stop_instance {
            "--do-not-require-stopped-instance is set. As --stop-instance is also set, a stop is \
             attempted; if it fails the conversion continues on the running instance."
        } else {
            "--do-not-require-stopped-instance is set. As --stop-instance is NOT set, the \
             conversion starts directly on the running instance."
        };
        major_warning(reporter, controls, message).await;
    }

    if let Some(key_id) = &request.volume_kms_key_id {
        let arn = cloud.resolve_kms_key_arn(key_id).await.map_err(|e| {
            ConvertError::Precondition(format!(
                "cannot retrieve details of the supplied volume KMS key id '{key_id}': {e}"
            ))
        })?;
        reporter.note(&format!("Valid KMS key id '{key_id}' ({arn})."));
        report.kms_key_arn = Some(arn);
    }

    let state = snapshot::state_name(&instance).to_string();
    if state != "stopped" {
        if request.stop_instance && matches!(state.as_str(), "pending" | "running") {
            reporter.note(&format!("Stopping '{instance_id}'..."));
            match cloud.stop_instance(instance_id).await {
                Ok(()) => {}
                Err(e)
                    if e.is_code("IncorrectSpotRequestState")
                        && request.do_not_require_stopped_instance =>
                {
                    major_warning(
                        reporter,
                        controls,
                        &format!(
                            "Received {e} while attempting to stop the instance. Continuing with \
                             the running instance as --do-not-require-stopped-instance is set."
                        ),
                    )
                    .await;
                    report.stop_failed = true;
                }
                Err(e) => return Err(e.into()),
            }
        } else if !request.stop_instance && !request.do_not_require_stopped_instance {
            return Err(ConvertError::Precondition(format!(
                "instance '{instance_id}' must be in 'stopped' state (current={state})! Use \
                 --stop-instance if you want this tool to stop it."
            )));
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CpuOptionsRequest;
    use crate::projector::CpuOptions;

    fn spot_request() -> ConversionRequest {
        ConversionRequest::default()
    }

    #[test]
    fn test_same_model_refused_without_force() {
        let refusal = billing_sanity("i-1", BillingModel::Spot, false, &spot_request(), false);
        assert!(refusal.unwrap().contains("already a spot instance"));

        let request = ConversionRequest {
            target_billing_model: BillingModel::OnDemand,
            ..Default::default()
        };
        let refusal = billing_sanity("i-1", BillingModel::OnDemand, false, &request, false);
        assert!(refusal.unwrap().contains("already an on-demand instance"));
    }

    #[test]
    fn test_force_or_change_allows_same_model() {
        assert!(billing_sanity("i-1", BillingModel::Spot, false, &spot_request(), true).is_none());

        let new_type = ConversionRequest {
            target_instance_type: Some("m5.large".to_string()),
            ..Default::default()
        };
        assert!(billing_sanity("i-1", BillingModel::Spot, false, &new_type, false).is_none());

        let new_cpu = ConversionRequest {
            cpu_options: CpuOptionsRequest::Explicit(CpuOptions {
                core_count: 2,
                threads_per_core: 1,
            }),
            ..Default::default()
        };
        assert!(billing_sanity("i-1", BillingModel::Spot, false, &new_cpu, false).is_none());
    }

    #[test]
    fn test_orphan_spot_request_allows_replacement() {
        assert!(billing_sanity("i-1", BillingModel::Spot, true, &spot_request(), false).is_none());
    }

    #[test]
    fn test_model_change_always_allowed() {
        let request = ConversionRequest {
            target_billing_model: BillingModel::OnDemand,
            ..Default::default()
        };
        assert!(billing_sanity("i-1", BillingModel::Spot, false, &request, false).is_none());
    }
}
