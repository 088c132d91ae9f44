//! Steps past the checkpoint barrier
//!
//! Everything here operates on destroyed-or-replaced external state and
//! can only move forward; re-convergence on replay relies on the job tag
//! and on provider-side idempotence.

use super::{StepCtx, StepOutcome};
use crate::cloud::{CloudError, Tag, JOB_TAG_KEY};
use crate::error::{ConvertError, Result};
use crate::registry;
use crate::snapshot;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

/// Spot requests transition briefly after a stop; poll before cancelling.
const SPOT_REQUEST_POLL: Duration = Duration::from_secs(10);
const SPOT_REQUEST_POLL_ATTEMPTS: u32 = 30;

/// In-step wait for target registrations to reach an accepted state.
const TARGET_HEALTH_POLL: Duration = Duration::from_secs(10);
const TARGET_HEALTH_TIMEOUT: Duration = Duration::from_secs(1000);

/// States in which a persistent spot request accepts cancellation.
const CANCELLABLE_SPOT_STATES: &[&str] = &["open", "active", "disabled"];

pub async fn terminate_instance(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    const STEP: &str = "terminate_instance";
    let instance_id = ctx.record.instance_id.clone();

    // A persistent spot request would otherwise resurrect the instance.
    if let Some(request_id) = ctx.record.spot_request.as_ref().map(|r| r.request_id.clone()) {
        let mut attempts = 0;
        loop {
            match ctx.cloud.describe_spot_request(&request_id).await? {
                None => break,
                Some(view) if view.state == "cancelled" => break,
                Some(view) if CANCELLABLE_SPOT_STATES.contains(&view.state.as_str()) => {
                    ctx.reporter
                        .note(&format!("Cancelling spot request {request_id}..."));
                    ctx.cloud.cancel_spot_request(&request_id).await?;
                    break;
                }
                Some(view) => {
                    attempts += 1;
                    if attempts > SPOT_REQUEST_POLL_ATTEMPTS {
                        return Err(ConvertError::StepFailed {
                            step: STEP,
                            reason: format!(
                                "spot request {request_id} did not reach a cancellable state \
                                 (current state='{}')",
                                view.state
                            ),
                        });
                    }
                    ctx.reporter.note(&format!(
                        "Waiting for spot request state to be one of {CANCELLABLE_SPOT_STATES:?}... \
                         (current state={})",
                        view.state
                    ));
                    tokio::time::sleep(SPOT_REQUEST_POLL).await;
                }
            }
        }
    }

    match ctx.cloud.terminate_instance(&instance_id).await {
        Ok(()) => {}
        // Step replay long after the fact: the id no longer resolves.
        Err(CloudError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(StepOutcome::Success(format!(
        "Successfully terminated instance {instance_id}."
    )))
}

pub async fn wait_resource_release(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    let instance_id = ctx.record.instance_id.clone();
    let eni_ids: Vec<String> = ctx
        .record
        .original_network_interfaces
        .iter()
        .map(|eni| eni.eni_id.clone())
        .collect();

    if !eni_ids.is_empty() {
        let enis = ctx.cloud.describe_network_interfaces(&eni_ids).await?;
        if let Some(pending) = enis.iter().find(|eni| eni.status != "available") {
            return Ok(StepOutcome::RetryLater(format!(
                "Waiting for detached ENIs to become 'available'... ({} is '{}')",
                pending.eni_id, pending.status
            )));
        }
    }

    if let Some(instance) = ctx.cloud.describe_instance(&instance_id).await? {
        let state = snapshot::state_name(&instance);
        if state != "terminated" {
            return Ok(StepOutcome::RetryLater(format!(
                "Waiting for instance 'terminated' state... (current state={state})"
            )));
        }
    }

    // The root volume always travels via the AMI; when it was marked
    // DeleteOnTermination=false the terminated instance leaves it behind.
    let original = ctx.original_snapshot("wait_resource_release")?;
    let root_device = snapshot::root_device_name(&original).to_string();
    let leaked_root = snapshot::block_device_mappings(&original)
        .into_iter()
        .find(|blk| blk.device_name == root_device && !blk.delete_on_termination);
    if let Some(blk) = leaked_root {
        match ctx.cloud.describe_volumes(&[blk.volume_id.clone()]).await {
            Ok(volumes) => {
                if let Some(volume) = volumes.first() {
                    if volume.state == "in-use" && volume.attachment_on(&instance_id).is_some() {
                        return Ok(StepOutcome::RetryLater(format!(
                            "Waiting for root volume {} to release...",
                            volume.volume_id
                        )));
                    }
                    ctx.warn(format!(
                        "Root volume {} was marked DeleteOnTermination=false; deleting it to \
                         avoid a leak since the root device is re-created from the AMI.",
                        volume.volume_id
                    ));
                    match ctx.cloud.delete_volume(&blk.volume_id).await {
                        Ok(()) | Err(CloudError::NotFound(_)) => {}
                        Err(e) => ctx.reporter.note(&format!(
                            "Failed to delete root volume {}... ignored: {e}",
                            blk.volume_id
                        )),
                    }
                }
            }
            Err(CloudError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(StepOutcome::Success(format!(
        "All resources released: {eni_ids:?}."
    )))
}

pub async fn create_new_instance(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    const STEP: &str = "create_new_instance";
    let instance_id = ctx.record.instance_id.clone();
    let eni_ids: Vec<String> = ctx
        .record
        .original_network_interfaces
        .iter()
        .map(|eni| eni.eni_id.clone())
        .collect();

    // A previous attempt may have launched the replacement without living
    // long enough to persist its id; the job tag stamped at launch time
    // makes that instance recoverable.
    let tagged = ctx
        .cloud
        .find_instances_by_tag(JOB_TAG_KEY, &instance_id)
        .await?;
    let candidates: Vec<String> = tagged
        .iter()
        .filter(|v| {
            snapshot::instance_id(v) != instance_id && snapshot::state_name(v) != "terminated"
        })
        .map(|v| snapshot::instance_id(v).to_string())
        .collect();
    if candidates.len() > 1 {
        return Err(ConvertError::Diverged {
            step: STEP,
            detail: format!("multiple non-terminated instances carry the job tag: {candidates:?}"),
        });
    }
    if let Some(new_id) = candidates.into_iter().next() {
        let enis = ctx.cloud.describe_network_interfaces(&eni_ids).await?;
        let consistent = enis.iter().all(|eni| {
            eni.attachment
                .as_ref()
                .and_then(|a| a.instance_id.as_deref())
                == Some(new_id.as_str())
        });
        if !consistent {
            return Err(ConvertError::Diverged {
                step: STEP,
                detail: format!(
                    "instance {new_id} carries the job tag but does not hold all preserved \
                     network interfaces"
                ),
            });
        }
        ctx.record.launched_instance_id = Some(new_id.clone());
        return Ok(StepOutcome::Success(format!(
            "Recovered new instance '{new_id}' from a previous execution."
        )));
    }

    // No recovery candidate: the preserved ENIs must all be free.
    for eni in ctx.cloud.describe_network_interfaces(&eni_ids).await? {
        match eni.status.as_str() {
            "available" => {}
            "in-use" => {
                let holder = eni
                    .attachment
                    .as_ref()
                    .and_then(|a| a.instance_id.clone())
                    .unwrap_or_else(|| "a non-instance attachment".to_string());
                return Err(ConvertError::Diverged {
                    step: STEP,
                    detail: format!("ENI {} is already attached to {holder}", eni.eni_id),
                });
            }
            status => {
                return Err(ConvertError::StepFailed {
                    step: STEP,
                    reason: format!("ENI {} is in unexpected state '{status}'", eni.eni_id),
                })
            }
        }
    }

    let spec = ctx
        .record
        .launch_spec
        .clone()
        .ok_or(ConvertError::StepFailed {
            step: STEP,
            reason: "no launch specification frozen in the job record".to_string(),
        })?;
    let new_id = ctx
        .cloud
        .run_instance(&spec, &[ctx.record.job_tag()])
        .await?;
    ctx.record.launched_instance_id = Some(new_id.clone());
    Ok(StepOutcome::Success(format!("Created new instance '{new_id}'.")))
}

pub async fn wait_new_instance_running(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    const STEP: &str = "wait_new_instance_running";
    let launched = ctx
        .record
        .launched_instance_id
        .clone()
        .ok_or(ConvertError::StepFailed {
            step: STEP,
            reason: "no launched instance recorded".to_string(),
        })?;

    let Some(instance) = ctx.cloud.describe_instance(&launched).await? else {
        return Ok(StepOutcome::RetryLater(format!(
            "Waiting for instance {launched} to become visible..."
        )));
    };

    match snapshot::state_name(&instance) {
        "running" => {
            ctx.record.new_instance_id = Some(launched.clone());
            Ok(StepOutcome::Success(format!(
                "Instance {launched} is in 'running' state."
            )))
        }
        "terminated" => {
            // Failed launch (bad spot capacity, bad spec...). Rewind so the
            // next run launches again.
            let rewind = registry::previous_step("create_new_instance")
                .expect("create_new_instance is not the first step");
            ctx.record.last_successful_step_name = Some(rewind.to_string());
            ctx.record.launched_instance_id = None;
            Err(ConvertError::StepFailed {
                step: STEP,
                reason: format!(
                    "something bad happened during the launch of {launched}: the instance is now \
                     terminated. Watch the provider console for indications. The state machine \
                     was set back to '{rewind}'; re-run the tool to launch again."
                ),
            })
        }
        state => Ok(StepOutcome::RetryLater(format!(
            "Waiting for instance to come up... (current state={state})"
        ))),
    }
}

pub async fn reattach_volumes(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    const STEP: &str = "reattach_volumes";
    let old_instance_id = ctx.record.instance_id.clone();
    let new_instance_id = ctx
        .record
        .new_instance_id
        .clone()
        .ok_or(ConvertError::StepFailed {
            step: STEP,
            reason: "no replacement instance recorded".to_string(),
        })?;

    let current = ctx
        .cloud
        .describe_instance(&new_instance_id)
        .await?
        .ok_or(ConvertError::Diverged {
            step: STEP,
            detail: format!("replacement instance {new_instance_id} disappeared"),
        })?;
    let current_blks = snapshot::block_device_mappings(&current);

    // The AMI re-created the lifecycle volumes with fresh ids; carry the
    // original volume tags over to them.
    for detail in ctx.record.original_volume_details.clone() {
        if ctx.record.detached_volume_ids.contains(&detail.volume_id) {
            continue;
        }
        let tags: Vec<Tag> = detail
            .tags
            .iter()
            .filter(|t| t.key != JOB_TAG_KEY)
            .cloned()
            .collect();
        if tags.is_empty() {
            continue;
        }
        let Some(attachment) = detail.attachment_on(&old_instance_id) else {
            continue;
        };
        let Some(blk) = current_blks
            .iter()
            .find(|b| b.device_name == attachment.device)
        else {
            continue;
        };
        ctx.reporter.note(&format!(
            "Restoring tags on volume {} ({})...",
            blk.volume_id, blk.device_name
        ));
        ctx.cloud.create_tags(&[blk.volume_id.clone()], &tags).await?;
    }

    let original = ctx.original_snapshot(STEP)?;
    let original_blks = snapshot::block_device_mappings(&original);
    let mut attached = Vec::new();
    for volume_id in ctx.record.detached_volume_ids.clone() {
        if current_blks.iter().any(|b| b.volume_id == volume_id) {
            // Already attached; happens when forcibly replaying the step.
            continue;
        }
        if attached.contains(&volume_id) {
            continue;
        }
        let Some(blk) = original_blks.iter().find(|b| b.volume_id == volume_id) else {
            continue;
        };
        ctx.reporter.note(&format!(
            "Attaching volume {volume_id} to {new_instance_id} with device name {}...",
            blk.device_name
        ));
        ctx.cloud
            .attach_volume(&volume_id, &new_instance_id, &blk.device_name)
            .await?;
        attached.push(volume_id);
    }

    if !attached.is_empty() {
        ctx.record.reboot_recommended = true;
        if !ctx.request.reboot_if_needed {
            ctx.warn(
                "Volumes were attached after boot. The new instance may need a reboot! \
                 (see --reboot-if-needed)",
            );
        }
    }
    Ok(StepOutcome::Success(format!(
        "Successfully reattached volumes {attached:?}."
    )))
}

pub async fn configure_network_interfaces(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    let eni_ids: Vec<String> = ctx
        .record
        .original_network_interfaces
        .iter()
        .map(|eni| eni.eni_id.clone())
        .collect();
    let enis = ctx.cloud.describe_network_interfaces(&eni_ids).await?;

    for detail in ctx.record.original_network_interfaces.clone() {
        if !detail.delete_on_termination {
            continue;
        }
        let Some(eni) = enis.iter().find(|e| e.eni_id == detail.eni_id) else {
            continue;
        };
        if let Some(attachment) = &eni.attachment {
            if !attachment.delete_on_termination {
                ctx.reporter.note(&format!(
                    "Setting 'DeleteOnTermination=true' for interface {}...",
                    eni.eni_id
                ));
                ctx.cloud
                    .set_eni_delete_on_termination(&eni.eni_id, &attachment.attachment_id, true)
                    .await?;
            }
        }
    }
    Ok(StepOutcome::Success(format!(
        "Successfully configured network interfaces {eni_ids:?}."
    )))
}

pub async fn manage_elastic_ip(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    let addresses = ctx.cloud.describe_addresses().await?;
    let mut reassociated = Vec::new();

    for detail in ctx.record.original_addresses.clone() {
        let Some(current) = addresses
            .iter()
            .find(|a| a.allocation_id == detail.allocation_id)
        else {
            ctx.warn(format!(
                "Elastic IP allocation {} ({}) no longer exists; skipping.",
                detail.allocation_id, detail.public_ip
            ));
            continue;
        };
        if current.network_interface_id.as_deref() == Some(detail.eni_id.as_str())
            && current.private_ip.as_deref() == Some(detail.private_ip.as_str())
        {
            // Already re-bound; happens on step replay.
            continue;
        }

        let enis = ctx
            .cloud
            .describe_network_interfaces(std::slice::from_ref(&detail.eni_id))
            .await?;
        let holds_ip = enis
            .first()
            .map(|eni| eni.private_ips.contains(&detail.private_ip))
            .unwrap_or(false);
        if !holds_ip {
            ctx.warn(format!(
                "Private IP {} is no longer present on {}; not re-associating {}.",
                detail.private_ip, detail.eni_id, detail.public_ip
            ));
            continue;
        }

        ctx.cloud
            .associate_address(&detail.allocation_id, &detail.eni_id, &detail.private_ip)
            .await?;
        reassociated.push(detail.public_ip.clone());
    }

    Ok(StepOutcome::Success(format!(
        "Reassociated EIPs {reassociated:?}."
    )))
}

pub async fn reboot_if_needed(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    const STEP: &str = "reboot_if_needed";
    let new_instance_id = ctx
        .record
        .new_instance_id
        .clone()
        .ok_or(ConvertError::StepFailed {
            step: STEP,
            reason: "no replacement instance recorded".to_string(),
        })?;

    if ctx.record.detached_volume_ids.is_empty() {
        return Ok(StepOutcome::Success(format!(
            "No reason to reboot instance '{new_instance_id}'."
        )));
    }
    if !ctx.request.reboot_if_needed {
        return Ok(StepOutcome::Success(format!(
            "A reboot of '{new_instance_id}' is recommended but --reboot-if-needed is not set: \
             doing nothing."
        )));
    }

    ctx.cloud.reboot_instance(&new_instance_id).await?;
    ctx.record.rebooted = true;
    Ok(StepOutcome::Success(format!(
        "Successfully rebooted '{new_instance_id}'."
    )))
}

pub async fn untag_resources(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    const STEP: &str = "untag_resources";
    let old_instance_id = ctx.record.instance_id.clone();
    let new_instance_id = ctx
        .record
        .new_instance_id
        .clone()
        .ok_or(ConvertError::StepFailed {
            step: STEP,
            reason: "no replacement instance recorded".to_string(),
        })?;

    reconcile_target_groups(ctx, &old_instance_id, &new_instance_id).await?;
    reconcile_alarms(ctx, &old_instance_id, &new_instance_id).await?;

    let mut resources = vec![new_instance_id.clone()];
    for eni in &ctx.record.original_network_interfaces {
        resources.push(eni.eni_id.clone());
    }
    resources.extend(ctx.record.detached_volume_ids.iter().cloned());
    if let Some(ami_id) = &ctx.record.ami_id {
        resources.push(ami_id.clone());
    }
    ctx.cloud
        .delete_tags(&resources, &[JOB_TAG_KEY.to_string()])
        .await?;

    ctx.record.final_instance_state = ctx.cloud.describe_instance(&new_instance_id).await?;
    Ok(StepOutcome::Success(format!(
        "Successfully untagged {resources:?}."
    )))
}

/// Move the original instance's target-group registrations over to the
/// replacement and, when asked to, wait for them to reach an accepted
/// health state.
async fn reconcile_target_groups(
    ctx: &mut StepCtx<'_>,
    old_instance_id: &str,
    new_instance_id: &str,
) -> Result<()> {
    const STEP: &str = "untag_resources";
    if ctx.record.original_target_groups.is_empty() {
        return Ok(());
    }

    for registration in ctx.record.original_target_groups.clone() {
        ctx.reporter.note(&format!(
            "Moving registration in {} (port={}) from {old_instance_id} to {new_instance_id}...",
            registration.target_group_arn, registration.port
        ));
        // Both calls tolerate already-converged state on the provider side.
        ctx.cloud
            .deregister_target(
                &registration.target_group_arn,
                old_instance_id,
                registration.port,
            )
            .await?;
        ctx.cloud
            .register_target(
                &registration.target_group_arn,
                new_instance_id,
                registration.port,
            )
            .await?;
    }

    if ctx.request.wait_for_tg_states.is_none() {
        return Ok(());
    }
    let accepted = ctx.request.accepted_tg_states();
    for registration in ctx.record.original_target_groups.clone() {
        let deadline = Instant::now() + TARGET_HEALTH_TIMEOUT;
        loop {
            let state = ctx
                .cloud
                .target_health_of(
                    &registration.target_group_arn,
                    new_instance_id,
                    registration.port,
                )
                .await?
                .unwrap_or_else(|| "unknown".to_string());
            if accepted.iter().any(|s| s == &state) {
                ctx.reporter.note(&format!(
                    "Instance '{new_instance_id}' reached state '{state}' in target group {}.",
                    registration.target_group_arn
                ));
                break;
            }
            if Instant::now() >= deadline {
                return Err(ConvertError::StepFailed {
                    step: STEP,
                    reason: format!(
                        "timeout while waiting for instance '{new_instance_id}' to reach one of \
                         {accepted:?} in target group {} (current state={state})",
                        registration.target_group_arn
                    ),
                });
            }
            ctx.reporter.note(&format!(
                "Waiting for instance state in {} to reach {accepted:?}... (current \
                 state={state}, port={})",
                registration.target_group_arn, registration.port
            ));
            tokio::time::sleep(TARGET_HEALTH_POLL).await;
        }
    }
    Ok(())
}

/// Point CloudWatch alarms that watched the original instance at the
/// replacement.
async fn reconcile_alarms(
    ctx: &mut StepCtx<'_>,
    old_instance_id: &str,
    new_instance_id: &str,
) -> Result<()> {
    let Some(prefixes) = ctx.request.cw_alarm_prefixes.clone() else {
        return Ok(());
    };

    let all_alarms = prefixes.is_empty() || prefixes.iter().any(|p| p == "*");
    let queries: Vec<Option<String>> = if all_alarms {
        vec![None]
    } else {
        prefixes.into_iter().map(Some).collect()
    };

    let mut seen = BTreeSet::new();
    let mut updated = Vec::new();
    for query in queries {
        let alarms = ctx.cloud.list_metric_alarms(query.as_deref()).await?;
        for alarm in alarms {
            let Some(name) = snapshot::str_field(&alarm, "AlarmName").map(str::to_string) else {
                continue;
            };
            if !seen.insert(name.clone()) {
                continue;
            }
            let Some(mut rewritten) = rewrite_alarm_dimensions(&alarm, old_instance_id, new_instance_id)
            else {
                continue;
            };
            ctx.reporter
                .note(&format!("Updating CloudWatch alarm '{name}'..."));
            // Only the settable alarm fields survive the round-trip.
            if let Some(obj) = rewritten.as_object_mut() {
                obj.remove("StateValue");
                obj.remove("StateReason");
                obj.remove("StateUpdatedTimestamp");
                obj.remove("AlarmConfigurationUpdatedTimestamp");
            }
            ctx.cloud.put_metric_alarm(&rewritten).await?;
            updated.push(name);
        }
    }
    ctx.reporter
        .note(&format!("Updated CloudWatch alarms {updated:?}."));
    Ok(())
}

/// Clone the alarm with its `InstanceId` dimension pointed at the new
/// instance, or `None` when the alarm does not reference the old one.
fn rewrite_alarm_dimensions(
    alarm: &Value,
    old_instance_id: &str,
    new_instance_id: &str,
) -> Option<Value> {
    let dimensions = alarm.get("Dimensions")?.as_array()?;
    let references_old = dimensions.iter().any(|d| {
        snapshot::str_field(d, "Name") == Some("InstanceId")
            && snapshot::str_field(d, "Value") == Some(old_instance_id)
    });
    if !references_old {
        return None;
    }

    let mut rewritten = alarm.clone();
    if let Some(dimensions) = rewritten
        .get_mut("Dimensions")
        .and_then(Value::as_array_mut)
    {
        for dimension in dimensions {
            if snapshot::str_field(dimension, "Name") == Some("InstanceId")
                && snapshot::str_field(dimension, "Value") == Some(old_instance_id)
            {
                dimension["Value"] = Value::String(new_instance_id.to_string());
            }
        }
    }
    Some(rewritten)
}

pub async fn deregister_image(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    if !ctx.controls.delete_ami {
        return Ok(StepOutcome::Skipped("Need '--delete-ami' argument.".to_string()));
    }
    let Some(ami_id) = ctx.record.ami_id.clone() else {
        return Ok(StepOutcome::Skipped("No AMI recorded for this job.".to_string()));
    };

    let Some(image) = ctx.cloud.describe_image(&ami_id).await? else {
        ctx.record.ami_id = None;
        return Ok(StepOutcome::Success(format!(
            "AMI '{ami_id}' was already deregistered."
        )));
    };

    ctx.cloud.deregister_image(&ami_id).await?;
    for snapshot_id in image.snapshot_ids {
        ctx.reporter
            .note(&format!("Deleting snapshot '{snapshot_id}'..."));
        ctx.cloud.delete_snapshot(&snapshot_id).await?;
    }
    ctx.record.ami_id = None;
    Ok(StepOutcome::Success(format!(
        "Successfully deregistered AMI '{ami_id}'."
    )))
}
