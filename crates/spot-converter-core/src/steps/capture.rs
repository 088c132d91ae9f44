//! Steps up to the checkpoint barrier
//!
//! Nothing in this half destroys external state: every step here can be
//! re-run or reset without loss.

use super::{ami_name, StepCtx, StepOutcome};
use crate::cloud::CloudError;
use crate::error::{ConvertError, Result};
use crate::projector::{self, AmiBlockDevice, ElasticInferenceSpec, ProjectionInput};
use crate::record::{now_iso8601, AddressDetail, BillingModel, EniDetail, TargetRegistration};
use crate::registry;
use crate::snapshot;
use serde_json::{json, Value};
use std::time::Duration;

/// Volume types without provisioned Iops/Throughput.
const FIXED_PERFORMANCE_VOLUME_TYPES: &[&str] = &["gp2", "st1", "sc1", "standard"];

/// Cadence of the short in-step poll for the image id to appear.
const IMAGE_ID_POLL: Duration = Duration::from_secs(5);
const IMAGE_ID_POLL_ATTEMPTS: u32 = 10;

pub async fn read_state_table(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    let instance_id = &ctx.record.instance_id;
    let detail = if ctx.fresh_record {
        format!("Record '{instance_id}' doesn't exist yet.")
    } else {
        format!("Record '{instance_id}' read successfully.")
    };
    Ok(StepOutcome::Success(detail))
}

pub async fn discover_instance_state(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    const STEP: &str = "discover_instance_state";
    let instance_id = ctx.record.instance_id.clone();

    let mut instance = ctx
        .cloud
        .describe_instance(&instance_id)
        .await?
        .ok_or(ConvertError::StepFailed {
            step: STEP,
            reason: format!("can't describe instance '{instance_id}'"),
        })?;

    if ctx.cloud.termination_protection(&instance_id).await? {
        return Err(ConvertError::StepFailed {
            step: STEP,
            reason: format!(
                "can't convert instance {instance_id}: termination protection is activated. \
                 Disable the attribute on this instance first."
            ),
        });
    }

    let spot_request_id = snapshot::spot_request_id(&instance).map(str::to_string);
    ctx.record.source_billing_model = Some(if spot_request_id.is_some() {
        BillingModel::Spot
    } else {
        BillingModel::OnDemand
    });
    ctx.record.target_billing_model = Some(ctx.request.target_billing_model);

    if let Some(request_id) = &spot_request_id {
        ctx.record.spot_request = ctx.cloud.describe_spot_request(request_id).await?;
    }
    ctx.record.original_user_data = ctx.cloud.describe_instance_user_data(&instance_id).await?;

    // The describe payload does not carry these two attributes; graft them
    // onto the snapshot under their wire keys so later steps read one shape.
    if let Some(behavior) = ctx
        .cloud
        .describe_instance_shutdown_behavior(&instance_id)
        .await?
    {
        instance["InstanceInitiatedShutdownBehavior"] = Value::String(behavior);
    }
    if let Some(credits) = ctx
        .cloud
        .describe_instance_credit_specification(&instance_id)
        .await?
    {
        instance["CreditSpecification"] = json!({ "CpuCredits": credits });
    }

    if let Some(filter) = ctx.request.target_group_arns.clone() {
        ctx.record.original_target_groups =
            discover_target_registrations(ctx, &instance_id, &filter).await?;
    }

    let state = snapshot::state_name(&instance).to_string();
    // The discovery snapshot is captured exactly once and never rewritten.
    if ctx.record.original_instance_state.is_none() {
        ctx.record.original_instance_state = Some(instance);
    }

    Ok(StepOutcome::Success(format!("Instance is in state {state}.")))
}

async fn discover_target_registrations(
    ctx: &mut StepCtx<'_>,
    instance_id: &str,
    filter: &[String],
) -> Result<Vec<TargetRegistration>> {
    let arns = ctx.cloud.instance_target_groups(filter).await?;
    ctx.reporter.note(&format!(
        "{} target groups of type 'instance' will be inspected for possible membership.",
        arns.len()
    ));

    let mut registrations = Vec::new();
    for arn in arns {
        for target in ctx.cloud.describe_target_health(&arn).await? {
            if target.instance_id == instance_id {
                registrations.push(TargetRegistration {
                    target_group_arn: arn.clone(),
                    port: target.port,
                });
            }
        }
    }
    ctx.reporter.note(&format!(
        "Found {} target group registrations to preserve for instance {instance_id}.",
        registrations.len()
    ));
    Ok(registrations)
}

pub async fn wait_stopped_instance(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    const STEP: &str = "wait_stopped_instance";
    let instance_id = ctx.record.instance_id.clone();

    let instance = ctx
        .cloud
        .describe_instance(&instance_id)
        .await?
        .ok_or(ConvertError::StepFailed {
            step: STEP,
            reason: "can't get instance details".to_string(),
        })?;

    let state = snapshot::state_name(&instance);
    match state {
        "stopped" => Ok(StepOutcome::Success("Instance in 'stopped' state.".to_string())),
        "terminated" => Err(ConvertError::Diverged {
            step: STEP,
            detail: "the instance was terminated by something else while waiting for it to stop"
                .to_string(),
        }),
        _ => {
            // Proceed on a running instance only when the operator opted in
            // and no effective stop is underway.
            let stop_underway = ctx.request.stop_instance && !ctx.stop_failed;
            if ctx.request.do_not_require_stopped_instance && !stop_underway {
                Ok(StepOutcome::Success(format!(
                    "Proceeding with instance in '{state}' state \
                     (--do-not-require-stopped-instance)."
                )))
            } else {
                Ok(StepOutcome::RetryLater(format!(
                    "Waiting for instance to stop... (current state={state})"
                )))
            }
        }
    }
}

pub async fn tag_resources(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    let instance = ctx.original_snapshot("tag_resources")?;
    let instance_id = ctx.record.instance_id.clone();

    let mut resources = vec![instance_id];
    for eni in snapshot::network_interfaces(&instance) {
        resources.push(eni.eni_id);
    }
    for blk in snapshot::block_device_mappings(&instance) {
        if !resources.contains(&blk.volume_id) {
            resources.push(blk.volume_id);
        }
    }

    ctx.cloud
        .create_tags(&resources, &[ctx.record.job_tag()])
        .await?;
    Ok(StepOutcome::Success(format!(
        "Successfully tagged {resources:?}."
    )))
}

pub async fn get_volume_details(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    let instance = ctx.original_snapshot("get_volume_details")?;

    let mut volume_ids = Vec::new();
    for blk in snapshot::block_device_mappings(&instance) {
        if !volume_ids.contains(&blk.volume_id) {
            volume_ids.push(blk.volume_id);
        }
    }

    ctx.record.original_volume_details = ctx.cloud.describe_volumes(&volume_ids).await?;
    Ok(StepOutcome::Success(format!(
        "Captured details of volumes {volume_ids:?}."
    )))
}

pub async fn detach_volumes(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    let instance = ctx.original_snapshot("detach_volumes")?;
    let instance_id = ctx.record.instance_id.clone();
    let root_device = snapshot::root_device_name(&instance).to_string();

    let mut detached = Vec::new();
    for blk in snapshot::block_device_mappings(&instance) {
        // The root device always travels via the AMI; volumes sharing the
        // instance lifecycle stay attached and travel the same way.
        if blk.device_name == root_device || blk.delete_on_termination {
            continue;
        }
        if detached.contains(&blk.volume_id) {
            continue;
        }

        let volumes = ctx.cloud.describe_volumes(&[blk.volume_id.clone()]).await?;
        if let Some(volume) = volumes.first() {
            let still_attached = volume.attachment_on(&instance_id).is_some();
            if volume.state == "in-use" && still_attached {
                ctx.reporter.note(&format!(
                    "Detaching volume {}... (state='{}', multi-attach={})",
                    volume.volume_id, volume.state, volume.multi_attach_enabled
                ));
                ctx.cloud
                    .detach_volume(&blk.volume_id, &instance_id, &blk.device_name)
                    .await?;
            } else {
                // Step replay after an interruption: the volume is already
                // on its way out.
                ctx.reporter.note(&format!(
                    "Volume {} is not attached to the instance anymore (state='{}'). Nothing to do.",
                    volume.volume_id, volume.state
                ));
            }
        }
        detached.push(blk.volume_id);
    }

    ctx.record.detached_volume_ids = detached.clone();
    Ok(StepOutcome::Success(format!("Detached volumes {detached:?}.")))
}

pub async fn wait_volume_detach(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    let instance_id = ctx.record.instance_id.clone();
    let volume_ids = ctx.record.detached_volume_ids.clone();
    if volume_ids.is_empty() {
        return Ok(StepOutcome::Success("No detached volume to wait for.".to_string()));
    }

    let volumes = match ctx.cloud.describe_volumes(&volume_ids).await {
        Ok(volumes) => volumes,
        // A volume that disappeared entirely is released by definition.
        Err(CloudError::NotFound(_)) => {
            return Ok(StepOutcome::Success(format!(
                "Detached volumes are gone or released: {volume_ids:?}."
            )))
        }
        Err(e) => return Err(e.into()),
    };

    let mut pending = Vec::new();
    for volume in &volumes {
        if volume.state == "available" {
            continue;
        }
        // A multi-attach volume never reaches 'available' while other
        // instances hold it; it counts as released as soon as this
        // instance left its attachment list.
        if volume.multi_attach_enabled && volume.attachment_on(&instance_id).is_none() {
            ctx.reporter.note(&format!(
                "Multi-attached volume '{}' is released from this instance; not waiting for \
                 'available' state.",
                volume.volume_id
            ));
            continue;
        }
        pending.push(volume.volume_id.clone());
    }

    if pending.is_empty() {
        Ok(StepOutcome::Success(format!(
            "All detached volumes are released: {volume_ids:?}."
        )))
    } else {
        Ok(StepOutcome::RetryLater(format!(
            "Waiting for detached volumes to become 'available'... (pending: {pending:?})"
        )))
    }
}

pub async fn start_ami_creation(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    const STEP: &str = "start_ami_creation";
    let instance = ctx.original_snapshot(STEP)?;
    let instance_id = ctx.record.instance_id.clone();
    let image_name = ami_name(&instance_id);
    let root_device = snapshot::root_device_name(&instance).to_string();

    let mut kept = Vec::new();
    for blk in snapshot::block_device_mappings(&instance) {
        if blk.device_name != root_device && !blk.delete_on_termination {
            continue;
        }
        let detail = ctx
            .record
            .original_volume_details
            .iter()
            .find(|v| v.volume_id == blk.volume_id)
            .ok_or(ConvertError::StepFailed {
                step: STEP,
                reason: format!("no captured details for volume {}", blk.volume_id),
            })?;
        let fixed_performance =
            FIXED_PERFORMANCE_VOLUME_TYPES.contains(&detail.volume_type.as_str());
        kept.push(AmiBlockDevice {
            device_name: blk.device_name,
            delete_on_termination: blk.delete_on_termination,
            volume_size: detail.size_gib,
            volume_type: detail.volume_type.clone(),
            iops: if fixed_performance { None } else { detail.iops },
            throughput: if fixed_performance { None } else { detail.throughput },
            encrypted: None,
            kms_key_arn: None,
        });
    }
    ctx.record.ami_block_devices = kept.clone();

    ctx.reporter
        .note(&format!("AMI block device mapping: {} entries.", kept.len()));
    match ctx.cloud.create_image(&image_name, &instance_id, &kept).await {
        Ok(image_id) => {
            ctx.cloud
                .create_tags(std::slice::from_ref(&image_id), &[ctx.record.job_tag()])
                .await?;
            ctx.record.ami_id = Some(image_id.clone());
            ctx.record.ami_creation_date = Some(now_iso8601());
            Ok(StepOutcome::Success(format!(
                "AMI image {image_name}/{image_id} started."
            )))
        }
        // Step replay after an interruption: the image already exists
        // under the job name and is re-discovered by it.
        Err(e) if e.is_code("InvalidAMIName.Duplicate") => {
            for _ in 0..IMAGE_ID_POLL_ATTEMPTS {
                if let Some(image) = ctx.cloud.find_image_by_name(&image_name).await? {
                    ctx.cloud
                        .create_tags(
                            std::slice::from_ref(&image.image_id),
                            &[ctx.record.job_tag()],
                        )
                        .await?;
                    ctx.record.ami_id = Some(image.image_id.clone());
                    if ctx.record.ami_creation_date.is_none() {
                        ctx.record.ami_creation_date = Some(now_iso8601());
                    }
                    return Ok(StepOutcome::Success(format!(
                        "AMI image {image_name}/{} already under creation; reusing it.",
                        image.image_id
                    )));
                }
                ctx.reporter.note("Waiting for AMI creation to start...");
                tokio::time::sleep(IMAGE_ID_POLL).await;
            }
            Err(ConvertError::StepFailed {
                step: STEP,
                reason: format!("failed to re-discover the image id of '{image_name}'"),
            })
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn prepare_network_interfaces(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    let instance = ctx.original_snapshot("prepare_network_interfaces")?;
    let eni_ids: Vec<String> = snapshot::network_interfaces(&instance)
        .into_iter()
        .map(|eni| eni.eni_id)
        .collect();

    // Termination must preserve the interfaces (and their private IPs), so
    // every attachment drops DeleteOnTermination until the replacement
    // restores the original values.
    for eni in ctx.cloud.describe_network_interfaces(&eni_ids).await? {
        if let Some(attachment) = &eni.attachment {
            if attachment.delete_on_termination {
                ctx.cloud
                    .set_eni_delete_on_termination(&eni.eni_id, &attachment.attachment_id, false)
                    .await?;
            }
        }
    }
    Ok(StepOutcome::Success(format!(
        "Successfully prepared network interfaces {eni_ids:?}."
    )))
}

pub async fn wait_ami_ready(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    const STEP: &str = "wait_ami_ready";
    let ami_id = ctx.record.ami_id.clone().ok_or(ConvertError::StepFailed {
        step: STEP,
        reason: "no AMI recorded for this job".to_string(),
    })?;

    let Some(image) = ctx.cloud.describe_image(&ami_id).await? else {
        return Ok(StepOutcome::RetryLater(format!(
            "Waiting for image {ami_id} to become visible..."
        )));
    };

    match image.state.as_str() {
        "available" => Ok(StepOutcome::Success(format!("AMI {ami_id} is ready."))),
        "failed" => {
            // Rare provider-side failure. Drop the broken image and rewind
            // so the next run recreates it.
            ctx.cloud.deregister_image(&ami_id).await?;
            let rewind = registry::previous_step("start_ami_creation")
                .expect("start_ami_creation is not the first step");
            ctx.record.last_successful_step_name = Some(rewind.to_string());
            ctx.record.ami_id = None;
            Err(ConvertError::StepFailed {
                step: STEP,
                reason: format!(
                    "the creation of AMI {ami_id} failed on the provider side (this can happen \
                     rarely). The state machine was set back to '{rewind}'; re-run the tool to \
                     try again."
                ),
            })
        }
        state => Ok(StepOutcome::RetryLater(format!(
            "Waiting for image {ami_id} to be available... (current state={state})"
        ))),
    }
}

pub async fn checkpoint_instance_state(ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
    const STEP: &str = "checkpoint_instance_state";
    let instance = ctx.original_snapshot(STEP)?;

    let enis = snapshot::network_interfaces(&instance);
    ctx.record.original_network_interfaces = enis
        .iter()
        .map(|eni| EniDetail {
            eni_id: eni.eni_id.clone(),
            device_index: eni.device_index,
            private_ip: eni.private_ip.clone(),
            secondary_private_ips: eni.secondary_private_ips.clone(),
            security_group_ids: eni.security_group_ids.clone(),
            subnet_id: eni.subnet_id.clone(),
            source_dest_check: eni.source_dest_check,
            delete_on_termination: eni.delete_on_termination,
            public_ip: eni.public_ip.clone(),
        })
        .collect();

    let addresses = ctx.cloud.describe_addresses().await?;
    ctx.record.original_addresses = enis
        .iter()
        .filter_map(|eni| {
            let public_ip = eni.public_ip.as_ref()?;
            let address = addresses.iter().find(|a| &a.public_ip == public_ip)?;
            Some(AddressDetail {
                allocation_id: address.allocation_id.clone(),
                association_id: address.association_id.clone(),
                public_ip: public_ip.clone(),
                private_ip: eni.private_ip.clone(),
                eni_id: eni.eni_id.clone(),
            })
        })
        .collect();

    if let Some(associations) = instance
        .get("ElasticGpuAssociations")
        .and_then(Value::as_array)
    {
        let gpu_ids: Vec<String> = associations
            .iter()
            .filter_map(|a| snapshot::str_field(a, "ElasticGpuId"))
            .map(str::to_string)
            .collect();
        ctx.record.elastic_gpus = ctx.cloud.describe_elastic_gpus(&gpu_ids).await?;
    }

    let elastic_inference = resolve_elastic_inference(ctx, &instance).await?;

    let ami_id = ctx.record.ami_id.clone().ok_or(ConvertError::StepFailed {
        step: STEP,
        reason: "no AMI recorded for this job".to_string(),
    })?;

    // The projector runs exactly once; its output is frozen into the
    // record and consumed verbatim by create_new_instance.
    let (launch_spec, warnings) = {
        let record = &*ctx.record;
        let input = ProjectionInput {
            instance: &instance,
            ami_id: &ami_id,
            ami_block_devices: &record.ami_block_devices,
            volume_details: &record.original_volume_details,
            spot_request: record.spot_request.as_ref(),
            elastic_gpus: &record.elastic_gpus,
            elastic_inference: elastic_inference.as_ref(),
            kms_key_arn: record.kms_key_arn.as_deref(),
            user_data: record.original_user_data.as_deref(),
        };
        projector::project(&input, &ctx.request)
    };
    for warning in warnings {
        ctx.warn(warning);
    }
    ctx.record.launch_spec = Some(launch_spec);

    Ok(StepOutcome::Success(
        "Checkpointed instance state; launch specification frozen.".to_string(),
    ))
}

async fn resolve_elastic_inference(
    ctx: &mut StepCtx<'_>,
    instance: &Value,
) -> Result<Option<ElasticInferenceSpec>> {
    let Some(associations) = instance
        .get("ElasticInferenceAcceleratorAssociations")
        .and_then(Value::as_array)
        .filter(|a| !a.is_empty())
    else {
        return Ok(None);
    };

    let arn = associations
        .iter()
        .filter_map(|a| snapshot::str_field(a, "ElasticInferenceAcceleratorArn"))
        .next()
        .unwrap_or_default();
    let accelerator_id = arn.split('/').nth(1).unwrap_or_default();
    let accelerator_type = ctx.cloud.describe_accelerator_type(accelerator_id).await?;
    Ok(Some(ElasticInferenceSpec {
        accelerator_type,
        count: associations.len() as i32,
    }))
}
