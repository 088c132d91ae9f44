//! `CloudApi` implementation over the AWS SDK

use crate::convert;
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types as ec2t;
use serde_json::Value;
use spot_converter_core::cloud::{
    AddressView, CloudApi, CloudError, EniView, ImageView, SpotRequestView, Tag,
    TargetHealthView, VolumeDetail,
};
use spot_converter_core::projector::{AmiBlockDevice, LaunchSpec};
use tracing::debug;

/// AWS implementation of the conversion cloud seam
pub struct AwsCloud {
    ec2: aws_sdk_ec2::Client,
    elbv2: aws_sdk_elasticloadbalancingv2::Client,
    cloudwatch: aws_sdk_cloudwatch::Client,
    kms: aws_sdk_kms::Client,
    elastic_inference: aws_sdk_elasticinference::Client,
    region: String,
}

impl AwsCloud {
    /// Create the client bundle from the ambient credential chain, with
    /// the same retry posture as the original tool (standard mode, five
    /// attempts).
    pub async fn new() -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .retry_config(RetryConfig::standard().with_max_attempts(5))
            .load()
            .await;
        Self::from_config(&config)
    }

    /// Create the client bundle from an already-loaded configuration.
    pub fn from_config(config: &SdkConfig) -> Self {
        Self {
            ec2: aws_sdk_ec2::Client::new(config),
            elbv2: aws_sdk_elasticloadbalancingv2::Client::new(config),
            cloudwatch: aws_sdk_cloudwatch::Client::new(config),
            kms: aws_sdk_kms::Client::new(config),
            elastic_inference: aws_sdk_elasticinference::Client::new(config),
            region: config
                .region()
                .map(|r| r.as_ref().to_string())
                .unwrap_or_default(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

/// Map an SDK failure to the typed error surface of the core.
fn sdk_err<E, R>(context: &str, err: SdkError<E, R>) -> CloudError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    match err.code().map(str::to_string) {
        Some(code) => {
            let message = format!(
                "{context}: {}",
                err.message().unwrap_or("no further detail")
            );
            if code.contains("NotFound") {
                CloudError::NotFound(format!("{code}: {message}"))
            } else {
                CloudError::Api { code, message }
            }
        }
        None => CloudError::Transport(format!("{context}: {err:?}")),
    }
}

fn is_not_found<E, R>(err: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    err.code().map(|c| c.contains("NotFound")).unwrap_or(false)
}

fn build_err(context: &str, err: impl std::fmt::Display) -> CloudError {
    CloudError::Transport(format!("{context}: {err}"))
}

#[async_trait]
impl CloudApi for AwsCloud {
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<Value>, CloudError> {
        let output = match self
            .ec2
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(sdk_err("DescribeInstances", e)),
        };
        let instances: Vec<&ec2t::Instance> = output
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .collect();
        if instances.len() != 1 {
            return Ok(None);
        }
        Ok(Some(convert::instance_to_json(instances[0])))
    }

    async fn describe_instance_user_data(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, CloudError> {
        let output = self
            .ec2
            .describe_instance_attribute()
            .instance_id(instance_id)
            .attribute(ec2t::InstanceAttributeName::UserData)
            .send()
            .await
            .map_err(|e| sdk_err("DescribeInstanceAttribute(userData)", e))?;
        Ok(output
            .user_data()
            .and_then(|u| u.value())
            .map(str::to_string))
    }

    async fn describe_instance_shutdown_behavior(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, CloudError> {
        let result = self
            .ec2
            .describe_instance_attribute()
            .instance_id(instance_id)
            .attribute(ec2t::InstanceAttributeName::InstanceInitiatedShutdownBehavior)
            .send()
            .await;
        match result {
            Ok(output) => Ok(output
                .instance_initiated_shutdown_behavior()
                .and_then(|v| v.value())
                .map(str::to_string)),
            // The attribute is carried only when the lookup is allowed.
            Err(e) if e.code().is_some() => Ok(None),
            Err(e) => Err(sdk_err(
                "DescribeInstanceAttribute(instanceInitiatedShutdownBehavior)",
                e,
            )),
        }
    }

    async fn describe_instance_credit_specification(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, CloudError> {
        let result = self
            .ec2
            .describe_instance_credit_specifications()
            .instance_ids(instance_id)
            .send()
            .await;
        match result {
            Ok(output) => Ok(output
                .instance_credit_specifications()
                .first()
                .and_then(|s| s.cpu_credits())
                .map(str::to_string)),
            // Non-burstable families and denied lookups surface errors.
            Err(e) if e.code().is_some() => Ok(None),
            Err(e) => Err(sdk_err("DescribeInstanceCreditSpecifications", e)),
        }
    }

    async fn termination_protection(&self, instance_id: &str) -> Result<bool, CloudError> {
        let output = self
            .ec2
            .describe_instance_attribute()
            .instance_id(instance_id)
            .attribute(ec2t::InstanceAttributeName::DisableApiTermination)
            .send()
            .await
            .map_err(|e| sdk_err("DescribeInstanceAttribute(disableApiTermination)", e))?;
        Ok(output
            .disable_api_termination()
            .and_then(|v| v.value())
            .unwrap_or(false))
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        debug!(instance_id, "stopping instance");
        self.ec2
            .stop_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| sdk_err("StopInstances", e))?;
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        debug!(instance_id, "terminating instance");
        self.ec2
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| sdk_err("TerminateInstances", e))?;
        Ok(())
    }

    async fn reboot_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.ec2
            .reboot_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| sdk_err("RebootInstances", e))?;
        Ok(())
    }

    async fn run_instance(
        &self,
        spec: &LaunchSpec,
        extra_tags: &[Tag],
    ) -> Result<String, CloudError> {
        let mut request = self
            .ec2
            .run_instances()
            .image_id(&spec.image_id)
            .instance_type(ec2t::InstanceType::from(spec.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .ebs_optimized(spec.ebs_optimized)
            .monitoring(
                ec2t::RunInstancesMonitoringEnabled::builder()
                    .enabled(spec.monitoring_enabled)
                    .build(),
            );

        let mut placement = ec2t::Placement::builder().availability_zone(&spec.availability_zone);
        if let Some(tenancy) = &spec.tenancy {
            placement = placement.tenancy(ec2t::Tenancy::from(tenancy.as_str()));
        }
        if let Some(group) = &spec.placement_group {
            placement = placement.group_name(group);
        }
        request = request.placement(placement.build());

        for blk in &spec.block_device_mappings {
            request = request.block_device_mappings(block_device_mapping(blk));
        }
        for eni in &spec.network_interfaces {
            request = request.network_interfaces(
                ec2t::InstanceNetworkInterfaceSpecification::builder()
                    .device_index(eni.device_index)
                    .network_interface_id(&eni.eni_id)
                    .build(),
            );
        }

        if let Some(key_name) = &spec.key_name {
            request = request.key_name(key_name);
        }
        if let Some(arn) = &spec.iam_instance_profile_arn {
            request = request.iam_instance_profile(
                ec2t::IamInstanceProfileSpecification::builder()
                    .arn(arn)
                    .build(),
            );
        }
        if let Some(options) = &spec.metadata_options {
            let mut builder = ec2t::InstanceMetadataOptionsRequest::builder();
            if let Some(tokens) = &options.http_tokens {
                builder = builder.http_tokens(ec2t::HttpTokensState::from(tokens.as_str()));
            }
            if let Some(limit) = options.http_put_response_hop_limit {
                builder = builder.http_put_response_hop_limit(limit as i32);
            }
            if let Some(endpoint) = &options.http_endpoint {
                builder = builder
                    .http_endpoint(ec2t::InstanceMetadataEndpointState::from(endpoint.as_str()));
            }
            request = request.metadata_options(builder.build());
        }
        if let Some(enabled) = spec.enclave_enabled {
            request = request
                .enclave_options(ec2t::EnclaveOptionsRequest::builder().enabled(enabled).build());
        }
        if let Some(configured) = spec.hibernation_configured {
            request = request.hibernation_options(
                ec2t::HibernationOptionsRequest::builder()
                    .configured(configured)
                    .build(),
            );
        }
        if let Some(user_data) = &spec.user_data {
            request = request.user_data(user_data);
        }
        if let Some(options) = &spec.cpu_options {
            request = request.cpu_options(
                ec2t::CpuOptionsRequest::builder()
                    .core_count(options.core_count as i32)
                    .threads_per_core(options.threads_per_core as i32)
                    .build(),
            );
        }
        if let Some(credits) = &spec.credit_specification {
            request = request.credit_specification(
                ec2t::CreditSpecificationRequest::builder()
                    .cpu_credits(credits)
                    .build(),
            );
        }
        if let Some(behavior) = &spec.shutdown_behavior {
            request = request.instance_initiated_shutdown_behavior(ec2t::ShutdownBehavior::from(
                behavior.as_str(),
            ));
        }
        for arn in &spec.license_arns {
            request = request.license_specifications(
                ec2t::LicenseConfigurationRequest::builder()
                    .license_configuration_arn(arn)
                    .build(),
            );
        }
        for gpu_type in &spec.elastic_gpu_types {
            request = request.elastic_gpu_specification(
                ec2t::ElasticGpuSpecification::builder()
                    .r#type(gpu_type)
                    .build(),
            );
        }
        if let Some(inference) = &spec.elastic_inference {
            request = request.elastic_inference_accelerators(
                ec2t::ElasticInferenceAccelerator::builder()
                    .r#type(&inference.accelerator_type)
                    .count(inference.count)
                    .build(),
            );
        }
        if let Some(capacity) = &spec.capacity_reservation {
            request = request.capacity_reservation_specification(capacity_reservation(capacity));
        }

        let mut tags = Vec::new();
        for tag in spec.tags.iter().chain(extra_tags) {
            tags.push(
                ec2t::Tag::builder()
                    .key(&tag.key)
                    .value(&tag.value)
                    .build(),
            );
        }
        if !tags.is_empty() {
            request = request.tag_specifications(
                ec2t::TagSpecification::builder()
                    .resource_type(ec2t::ResourceType::Instance)
                    .set_tags(Some(tags))
                    .build(),
            );
        }

        if let Some(market) = &spec.market_options {
            let mut spot = ec2t::SpotMarketOptions::builder()
                .spot_instance_type(ec2t::SpotInstanceType::Persistent)
                .instance_interruption_behavior(ec2t::InstanceInterruptionBehavior::Stop);
            if let Some(price) = &market.max_price {
                spot = spot.max_price(price);
            }
            request = request.instance_market_options(
                ec2t::InstanceMarketOptionsRequest::builder()
                    .market_type(ec2t::MarketType::Spot)
                    .spot_options(spot.build())
                    .build(),
            );
        }

        let output = request
            .send()
            .await
            .map_err(|e| sdk_err("RunInstances", e))?;
        output
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .map(str::to_string)
            .ok_or_else(|| CloudError::Transport("RunInstances returned no instance id".to_string()))
    }

    async fn find_instances_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<Value>, CloudError> {
        let output = self
            .ec2
            .describe_instances()
            .filters(
                ec2t::Filter::builder()
                    .name(format!("tag:{key}"))
                    .values(value)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_err("DescribeInstances(tag filter)", e))?;
        Ok(output
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .map(convert::instance_to_json)
            .collect())
    }

    async fn describe_volumes(
        &self,
        volume_ids: &[String],
    ) -> Result<Vec<VolumeDetail>, CloudError> {
        let output = self
            .ec2
            .describe_volumes()
            .set_volume_ids(Some(volume_ids.to_vec()))
            .send()
            .await
            .map_err(|e| sdk_err("DescribeVolumes", e))?;
        Ok(output.volumes().iter().map(convert::volume_to_detail).collect())
    }

    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), CloudError> {
        self.ec2
            .detach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .device(device)
            .send()
            .await
            .map_err(|e| sdk_err("DetachVolume", e))?;
        Ok(())
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), CloudError> {
        self.ec2
            .attach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .device(device)
            .send()
            .await
            .map_err(|e| sdk_err("AttachVolume", e))?;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudError> {
        self.ec2
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(|e| sdk_err("DeleteVolume", e))?;
        Ok(())
    }

    async fn create_image(
        &self,
        name: &str,
        instance_id: &str,
        mappings: &[AmiBlockDevice],
    ) -> Result<String, CloudError> {
        let mut request = self
            .ec2
            .create_image()
            .name(name)
            .instance_id(instance_id)
            .no_reboot(true);
        for blk in mappings {
            request = request.block_device_mappings(block_device_mapping(blk));
        }
        let output = request
            .send()
            .await
            .map_err(|e| sdk_err("CreateImage", e))?;
        output
            .image_id()
            .map(str::to_string)
            .ok_or_else(|| CloudError::Transport("CreateImage returned no image id".to_string()))
    }

    async fn find_image_by_name(&self, name: &str) -> Result<Option<ImageView>, CloudError> {
        let output = self
            .ec2
            .describe_images()
            .filters(ec2t::Filter::builder().name("name").values(name).build())
            .send()
            .await
            .map_err(|e| sdk_err("DescribeImages(name filter)", e))?;
        Ok(output.images().first().map(convert::image_to_view))
    }

    async fn describe_image(&self, image_id: &str) -> Result<Option<ImageView>, CloudError> {
        let output = match self.ec2.describe_images().image_ids(image_id).send().await {
            Ok(output) => output,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(sdk_err("DescribeImages", e)),
        };
        Ok(output.images().first().map(convert::image_to_view))
    }

    async fn deregister_image(&self, image_id: &str) -> Result<(), CloudError> {
        self.ec2
            .deregister_image()
            .image_id(image_id)
            .send()
            .await
            .map_err(|e| sdk_err("DeregisterImage", e))?;
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError> {
        self.ec2
            .delete_snapshot()
            .snapshot_id(snapshot_id)
            .send()
            .await
            .map_err(|e| sdk_err("DeleteSnapshot", e))?;
        Ok(())
    }

    async fn describe_network_interfaces(
        &self,
        eni_ids: &[String],
    ) -> Result<Vec<EniView>, CloudError> {
        let output = self
            .ec2
            .describe_network_interfaces()
            .set_network_interface_ids(Some(eni_ids.to_vec()))
            .send()
            .await
            .map_err(|e| sdk_err("DescribeNetworkInterfaces", e))?;
        Ok(output
            .network_interfaces()
            .iter()
            .map(convert::eni_to_view)
            .collect())
    }

    async fn set_eni_delete_on_termination(
        &self,
        eni_id: &str,
        attachment_id: &str,
        delete_on_termination: bool,
    ) -> Result<(), CloudError> {
        self.ec2
            .modify_network_interface_attribute()
            .network_interface_id(eni_id)
            .attachment(
                ec2t::NetworkInterfaceAttachmentChanges::builder()
                    .attachment_id(attachment_id)
                    .delete_on_termination(delete_on_termination)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_err("ModifyNetworkInterfaceAttribute", e))?;
        Ok(())
    }

    async fn describe_addresses(&self) -> Result<Vec<AddressView>, CloudError> {
        let output = self
            .ec2
            .describe_addresses()
            .send()
            .await
            .map_err(|e| sdk_err("DescribeAddresses", e))?;
        Ok(output.addresses().iter().map(convert::address_to_view).collect())
    }

    async fn associate_address(
        &self,
        allocation_id: &str,
        eni_id: &str,
        private_ip: &str,
    ) -> Result<(), CloudError> {
        self.ec2
            .associate_address()
            .allocation_id(allocation_id)
            .network_interface_id(eni_id)
            .private_ip_address(private_ip)
            .allow_reassociation(true)
            .send()
            .await
            .map_err(|e| sdk_err("AssociateAddress", e))?;
        Ok(())
    }

    async fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &[Tag],
    ) -> Result<(), CloudError> {
        let mut request = self
            .ec2
            .create_tags()
            .set_resources(Some(resource_ids.to_vec()));
        for tag in tags {
            request = request.tags(
                ec2t::Tag::builder()
                    .key(&tag.key)
                    .value(&tag.value)
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|e| sdk_err("CreateTags", e))?;
        Ok(())
    }

    async fn delete_tags(
        &self,
        resource_ids: &[String],
        keys: &[String],
    ) -> Result<(), CloudError> {
        let mut request = self
            .ec2
            .delete_tags()
            .set_resources(Some(resource_ids.to_vec()));
        for key in keys {
            request = request.tags(ec2t::Tag::builder().key(key).build());
        }
        request
            .send()
            .await
            .map_err(|e| sdk_err("DeleteTags", e))?;
        Ok(())
    }

    async fn describe_spot_request(
        &self,
        request_id: &str,
    ) -> Result<Option<SpotRequestView>, CloudError> {
        let output = match self
            .ec2
            .describe_spot_instance_requests()
            .spot_instance_request_ids(request_id)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(sdk_err("DescribeSpotInstanceRequests", e)),
        };
        Ok(output
            .spot_instance_requests()
            .first()
            .map(convert::spot_request_to_view))
    }

    async fn cancel_spot_request(&self, request_id: &str) -> Result<(), CloudError> {
        self.ec2
            .cancel_spot_instance_requests()
            .spot_instance_request_ids(request_id)
            .send()
            .await
            .map_err(|e| sdk_err("CancelSpotInstanceRequests", e))?;
        Ok(())
    }

    async fn instance_target_groups(&self, arns: &[String]) -> Result<Vec<String>, CloudError> {
        let mut request = self.elbv2.describe_target_groups();
        if !arns.is_empty() {
            request = request.set_target_group_arns(Some(arns.to_vec()));
        }
        let mut pages = request.into_paginator().send();
        let mut result = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| sdk_err("DescribeTargetGroups", e))?;
            for tg in page.target_groups() {
                let is_instance = tg.target_type()
                    == Some(&aws_sdk_elasticloadbalancingv2::types::TargetTypeEnum::Instance);
                if is_instance {
                    if let Some(arn) = tg.target_group_arn() {
                        result.push(arn.to_string());
                    }
                }
            }
        }
        Ok(result)
    }

    async fn describe_target_health(
        &self,
        arn: &str,
    ) -> Result<Vec<TargetHealthView>, CloudError> {
        let output = self
            .elbv2
            .describe_target_health()
            .target_group_arn(arn)
            .send()
            .await
            .map_err(|e| sdk_err("DescribeTargetHealth", e))?;
        Ok(output
            .target_health_descriptions()
            .iter()
            .filter_map(|d| {
                let target = d.target()?;
                Some(TargetHealthView {
                    instance_id: target.id()?.to_string(),
                    port: target.port().unwrap_or(0),
                    state: d
                        .target_health()
                        .and_then(|h| h.state())
                        .map(|s| s.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect())
    }

    async fn target_health_of(
        &self,
        arn: &str,
        instance_id: &str,
        port: i32,
    ) -> Result<Option<String>, CloudError> {
        let target = aws_sdk_elasticloadbalancingv2::types::TargetDescription::builder()
            .id(instance_id)
            .port(port)
            .build();
        let output = self
            .elbv2
            .describe_target_health()
            .target_group_arn(arn)
            .targets(target)
            .send()
            .await
            .map_err(|e| sdk_err("DescribeTargetHealth", e))?;
        Ok(output
            .target_health_descriptions()
            .first()
            .and_then(|d| d.target_health())
            .and_then(|h| h.state())
            .map(|s| s.as_str().to_string()))
    }

    async fn register_target(
        &self,
        arn: &str,
        instance_id: &str,
        port: i32,
    ) -> Result<(), CloudError> {
        let target = aws_sdk_elasticloadbalancingv2::types::TargetDescription::builder()
            .id(instance_id)
            .port(port)
            .build();
        self.elbv2
            .register_targets()
            .target_group_arn(arn)
            .targets(target)
            .send()
            .await
            .map_err(|e| sdk_err("RegisterTargets", e))?;
        Ok(())
    }

    async fn deregister_target(
        &self,
        arn: &str,
        instance_id: &str,
        port: i32,
    ) -> Result<(), CloudError> {
        let target = aws_sdk_elasticloadbalancingv2::types::TargetDescription::builder()
            .id(instance_id)
            .port(port)
            .build();
        self.elbv2
            .deregister_targets()
            .target_group_arn(arn)
            .targets(target)
            .send()
            .await
            .map_err(|e| sdk_err("DeregisterTargets", e))?;
        Ok(())
    }

    async fn list_metric_alarms(
        &self,
        name_prefix: Option<&str>,
    ) -> Result<Vec<Value>, CloudError> {
        let mut request = self.cloudwatch.describe_alarms();
        if let Some(prefix) = name_prefix {
            request = request.alarm_name_prefix(prefix);
        }
        let mut pages = request.into_paginator().send();
        let mut result = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| sdk_err("DescribeAlarms", e))?;
            for alarm in page.metric_alarms() {
                result.push(convert::alarm_to_json(alarm));
            }
        }
        Ok(result)
    }

    async fn put_metric_alarm(&self, alarm: &Value) -> Result<(), CloudError> {
        let request = put_metric_alarm_request(&self.cloudwatch, alarm)?;
        request
            .send()
            .await
            .map_err(|e| sdk_err("PutMetricAlarm", e))?;
        Ok(())
    }

    async fn resolve_kms_key_arn(&self, key_id: &str) -> Result<String, CloudError> {
        let output = self
            .kms
            .describe_key()
            .key_id(key_id)
            .send()
            .await
            .map_err(|e| sdk_err("DescribeKey", e))?;
        output
            .key_metadata()
            .and_then(|m| m.arn())
            .map(str::to_string)
            .ok_or_else(|| CloudError::Transport("DescribeKey returned no key ARN".to_string()))
    }

    async fn describe_elastic_gpus(&self, gpu_ids: &[String]) -> Result<Vec<Value>, CloudError> {
        let output = self
            .ec2
            .describe_elastic_gpus()
            .set_elastic_gpu_ids(Some(gpu_ids.to_vec()))
            .send()
            .await
            .map_err(|e| sdk_err("DescribeElasticGpus", e))?;
        Ok(output
            .elastic_gpu_set()
            .iter()
            .map(|gpu| {
                serde_json::json!({
                    "ElasticGpuId": gpu.elastic_gpu_id().unwrap_or_default(),
                    "ElasticGpuType": gpu.elastic_gpu_type().unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn describe_accelerator_type(
        &self,
        accelerator_id: &str,
    ) -> Result<String, CloudError> {
        let output = self
            .elastic_inference
            .describe_accelerators()
            .accelerator_ids(accelerator_id)
            .send()
            .await
            .map_err(|e| sdk_err("DescribeAccelerators", e))?;
        output
            .accelerator_set()
            .first()
            .and_then(|a| a.accelerator_type())
            .map(str::to_string)
            .ok_or_else(|| {
                CloudError::NotFound(format!(
                    "elastic inference accelerator '{accelerator_id}' (missing IAM permissions?)"
                ))
            })
    }
}

/// Shared block-device mapping builder for CreateImage and RunInstances.
fn block_device_mapping(blk: &AmiBlockDevice) -> ec2t::BlockDeviceMapping {
    let mut ebs = ec2t::EbsBlockDevice::builder()
        .delete_on_termination(blk.delete_on_termination)
        .volume_size(blk.volume_size)
        .volume_type(ec2t::VolumeType::from(blk.volume_type.as_str()));
    if let Some(iops) = blk.iops {
        ebs = ebs.iops(iops);
    }
    if let Some(throughput) = blk.throughput {
        ebs = ebs.throughput(throughput);
    }
    if let Some(encrypted) = blk.encrypted {
        ebs = ebs.encrypted(encrypted);
    }
    if let Some(kms_key_arn) = &blk.kms_key_arn {
        ebs = ebs.kms_key_id(kms_key_arn);
    }
    ec2t::BlockDeviceMapping::builder()
        .device_name(&blk.device_name)
        .ebs(ebs.build())
        .build()
}

fn capacity_reservation(capacity: &Value) -> ec2t::CapacityReservationSpecification {
    let mut builder = ec2t::CapacityReservationSpecification::builder();
    if let Some(preference) = capacity
        .get("CapacityReservationPreference")
        .and_then(Value::as_str)
    {
        builder = builder
            .capacity_reservation_preference(ec2t::CapacityReservationPreference::from(preference));
    }
    if let Some(target) = capacity.get("CapacityReservationTarget") {
        let mut t = ec2t::CapacityReservationTarget::builder();
        if let Some(id) = target.get("CapacityReservationId").and_then(Value::as_str) {
            t = t.capacity_reservation_id(id);
        }
        if let Some(arn) = target
            .get("CapacityReservationResourceGroupArn")
            .and_then(Value::as_str)
        {
            t = t.capacity_reservation_resource_group_arn(arn);
        }
        builder = builder.capacity_reservation_target(t.build());
    }
    builder.build()
}

/// Rebuild a PutMetricAlarm call from an alarm in wire shape.
fn put_metric_alarm_request(
    client: &aws_sdk_cloudwatch::Client,
    alarm: &Value,
) -> Result<
    aws_sdk_cloudwatch::operation::put_metric_alarm::builders::PutMetricAlarmFluentBuilder,
    CloudError,
> {
    use aws_sdk_cloudwatch::types as cwt;

    let str_of = |key: &str| alarm.get(key).and_then(Value::as_str);
    let strings_of = |key: &str| -> Option<Vec<String>> {
        alarm.get(key).and_then(Value::as_array).map(|rows| {
            rows.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    };

    let name = str_of("AlarmName").ok_or_else(|| {
        CloudError::Transport("alarm payload without an AlarmName".to_string())
    })?;
    let mut request = client.put_metric_alarm().alarm_name(name);

    if let Some(description) = str_of("AlarmDescription") {
        request = request.alarm_description(description);
    }
    if let Some(enabled) = alarm.get("ActionsEnabled").and_then(Value::as_bool) {
        request = request.actions_enabled(enabled);
    }
    request = request.set_ok_actions(strings_of("OKActions"));
    request = request.set_alarm_actions(strings_of("AlarmActions"));
    request = request.set_insufficient_data_actions(strings_of("InsufficientDataActions"));
    if let Some(metric_name) = str_of("MetricName") {
        request = request.metric_name(metric_name);
    }
    if let Some(namespace) = str_of("Namespace") {
        request = request.namespace(namespace);
    }
    if let Some(statistic) = str_of("Statistic") {
        request = request.statistic(cwt::Statistic::from(statistic));
    }
    if let Some(statistic) = str_of("ExtendedStatistic") {
        request = request.extended_statistic(statistic);
    }
    if let Some(period) = alarm.get("Period").and_then(Value::as_i64) {
        request = request.period(period as i32);
    }
    if let Some(unit) = str_of("Unit") {
        request = request.unit(cwt::StandardUnit::from(unit));
    }
    if let Some(periods) = alarm.get("EvaluationPeriods").and_then(Value::as_i64) {
        request = request.evaluation_periods(periods as i32);
    }
    if let Some(datapoints) = alarm.get("DatapointsToAlarm").and_then(Value::as_i64) {
        request = request.datapoints_to_alarm(datapoints as i32);
    }
    if let Some(threshold) = alarm.get("Threshold").and_then(Value::as_f64) {
        request = request.threshold(threshold);
    }
    if let Some(operator) = str_of("ComparisonOperator") {
        request = request.comparison_operator(cwt::ComparisonOperator::from(operator));
    }
    if let Some(treat) = str_of("TreatMissingData") {
        request = request.treat_missing_data(treat);
    }
    if let Some(percentile) = str_of("EvaluateLowSampleCountPercentile") {
        request = request.evaluate_low_sample_count_percentile(percentile);
    }
    if let Some(metric_id) = str_of("ThresholdMetricId") {
        request = request.threshold_metric_id(metric_id);
    }

    if let Some(dimensions) = alarm.get("Dimensions").and_then(Value::as_array) {
        for dimension in dimensions {
            let name = dimension.get("Name").and_then(Value::as_str).unwrap_or_default();
            let value = dimension.get("Value").and_then(Value::as_str).unwrap_or_default();
            request = request.dimensions(
                cwt::Dimension::builder()
                    .name(name)
                    .value(value)
                    .build(),
            );
        }
    }

    if let Some(metrics) = alarm.get("Metrics").and_then(Value::as_array) {
        for query in metrics {
            request = request.metrics(metric_data_query(query)?);
        }
    }

    Ok(request)
}

fn metric_data_query(
    query: &Value,
) -> Result<aws_sdk_cloudwatch::types::MetricDataQuery, CloudError> {
    use aws_sdk_cloudwatch::types as cwt;

    let mut builder = cwt::MetricDataQuery::builder()
        .id(query.get("Id").and_then(Value::as_str).unwrap_or_default());
    if let Some(expression) = query.get("Expression").and_then(Value::as_str) {
        builder = builder.expression(expression);
    }
    if let Some(label) = query.get("Label").and_then(Value::as_str) {
        builder = builder.label(label);
    }
    if let Some(return_data) = query.get("ReturnData").and_then(Value::as_bool) {
        builder = builder.return_data(return_data);
    }
    if let Some(period) = query.get("Period").and_then(Value::as_i64) {
        builder = builder.period(period as i32);
    }
    if let Some(stat) = query.get("MetricStat") {
        let mut metric = cwt::Metric::builder();
        if let Some(namespace) = stat.pointer("/Metric/Namespace").and_then(Value::as_str) {
            metric = metric.namespace(namespace);
        }
        if let Some(metric_name) = stat.pointer("/Metric/MetricName").and_then(Value::as_str) {
            metric = metric.metric_name(metric_name);
        }
        if let Some(dimensions) = stat.pointer("/Metric/Dimensions").and_then(Value::as_array) {
            for dimension in dimensions {
                metric = metric.dimensions(
                    cwt::Dimension::builder()
                        .name(dimension.get("Name").and_then(Value::as_str).unwrap_or_default())
                        .value(dimension.get("Value").and_then(Value::as_str).unwrap_or_default())
                        .build(),
                );
            }
        }
        let mut metric_stat = cwt::MetricStat::builder().metric(metric.build());
        if let Some(period) = stat.get("Period").and_then(Value::as_i64) {
            metric_stat = metric_stat.period(period as i32);
        }
        if let Some(stat_name) = stat.get("Stat").and_then(Value::as_str) {
            metric_stat = metric_stat.stat(stat_name);
        }
        if let Some(unit) = stat.get("Unit").and_then(Value::as_str) {
            metric_stat = metric_stat.unit(cwt::StandardUnit::from(unit));
        }
        builder = builder.metric_stat(
            metric_stat
                .build()
                .map_err(|e| build_err("metric stat", e))?,
        );
    }
    builder
        .build()
        .map_err(|e| build_err("metric data query", e))
}
