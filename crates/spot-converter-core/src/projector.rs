//! Launch-spec projector
//!
//! Pure function from the captured original-instance snapshot plus the
//! conversion request to the exact launch specification of the
//! replacement. Holds the compatibility matrix of attribute mappings; all
//! provider lookups (KMS key ARN, accelerator types) happen before
//! projection so the function stays deterministic. The output is frozen
//! into the job record at the checkpoint step and never recomputed.

use crate::cloud::{SpotRequestView, Tag, VolumeDetail, JOB_TAG_KEY};
use crate::record::{BillingModel, ConversionRequest, CpuOptionsRequest};
use crate::snapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Instance families whose CPU options cannot be configured.
const FIXED_CPU_FAMILIES: &[&str] = &["t2", "m1", "m2", "m3"];

/// Explicit core/thread configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuOptions {
    #[serde(alias = "CoreCount")]
    pub core_count: i64,
    #[serde(alias = "ThreadsPerCore")]
    pub threads_per_core: i64,
}

/// Block-device entry carried by the backup image and the launch call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmiBlockDevice {
    pub device_name: String,
    pub delete_on_termination: bool,
    pub volume_size: i32,
    pub volume_type: String,
    pub iops: Option<i32>,
    pub throughput: Option<i32>,
    /// Set when the entry was rewritten to request encryption
    pub encrypted: Option<bool>,
    pub kms_key_arn: Option<String>,
}

/// Existing network interface re-bound to the replacement by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EniBinding {
    pub device_index: i32,
    pub eni_id: String,
}

/// Instance metadata service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataOptions {
    pub http_tokens: Option<String>,
    pub http_put_response_hop_limit: Option<i64>,
    pub http_endpoint: Option<String>,
}

/// Persistent-spot market options; absent means on-demand. Interruption
/// behaviour is always `stop` for a persistent request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotMarketOptions {
    pub max_price: Option<String>,
}

/// Elastic inference accelerator request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticInferenceSpec {
    pub accelerator_type: String,
    pub count: i32,
}

/// The exact launch specification of the replacement instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub availability_zone: String,
    pub tenancy: Option<String>,
    pub placement_group: Option<String>,
    pub block_device_mappings: Vec<AmiBlockDevice>,
    pub network_interfaces: Vec<EniBinding>,
    pub ebs_optimized: bool,
    pub monitoring_enabled: bool,
    pub capacity_reservation: Option<Value>,
    pub key_name: Option<String>,
    pub iam_instance_profile_arn: Option<String>,
    pub metadata_options: Option<MetadataOptions>,
    pub enclave_enabled: Option<bool>,
    pub hibernation_configured: Option<bool>,
    /// `stop` or `terminate`; absent when the provider never surfaced it
    #[serde(default)]
    pub shutdown_behavior: Option<String>,
    pub user_data: Option<String>,
    pub cpu_options: Option<CpuOptions>,
    /// Burstable CPU-credit mode (`standard`/`unlimited`)
    #[serde(default)]
    pub credit_specification: Option<String>,
    pub license_arns: Vec<String>,
    pub elastic_gpu_types: Vec<String>,
    pub elastic_inference: Option<ElasticInferenceSpec>,
    pub tags: Vec<Tag>,
    pub market_options: Option<SpotMarketOptions>,
}

/// Everything `project` reads. All fields come from the job record, so the
/// same record always projects the same spec.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionInput<'a> {
    /// Discovery snapshot of the original instance
    pub instance: &'a Value,
    pub ami_id: &'a str,
    pub ami_block_devices: &'a [AmiBlockDevice],
    pub volume_details: &'a [VolumeDetail],
    pub spot_request: Option<&'a SpotRequestView>,
    pub elastic_gpus: &'a [Value],
    pub elastic_inference: Option<&'a ElasticInferenceSpec>,
    pub kms_key_arn: Option<&'a str>,
    pub user_data: Option<&'a str>,
}

/// Project the launch specification of the replacement instance.
///
/// Returns the spec together with the projection warnings to surface to
/// the operator (nothing is logged here).
pub fn project(
    input: &ProjectionInput<'_>,
    request: &ConversionRequest,
) -> (LaunchSpec, Vec<String>) {
    let instance = input.instance;
    let mut warnings = Vec::new();

    let original_type = snapshot::instance_type(instance);
    let instance_type = request
        .target_instance_type
        .clone()
        .unwrap_or_else(|| original_type.to_string());

    let block_device_mappings =
        rewrite_block_devices(input, snapshot::instance_id(instance), &mut warnings);

    let network_interfaces = snapshot::network_interfaces(instance)
        .into_iter()
        .map(|eni| EniBinding {
            device_index: eni.device_index,
            eni_id: eni.eni_id,
        })
        .collect();

    let spec = LaunchSpec {
        image_id: input.ami_id.to_string(),
        instance_type,
        availability_zone: snapshot::availability_zone(instance).to_string(),
        tenancy: snapshot::tenancy(instance).map(str::to_string),
        placement_group: snapshot::placement_group(instance).map(str::to_string),
        block_device_mappings,
        network_interfaces,
        ebs_optimized: instance
            .get("EbsOptimized")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        monitoring_enabled: snapshot::monitoring_enabled(instance),
        capacity_reservation: instance.get("CapacityReservationSpecification").cloned(),
        key_name: snapshot::str_field(instance, "KeyName").map(str::to_string),
        iam_instance_profile_arn: instance
            .pointer("/IamInstanceProfile/Arn")
            .and_then(Value::as_str)
            .map(str::to_string),
        metadata_options: project_metadata_options(instance),
        enclave_enabled: instance.pointer("/EnclaveOptions/Enabled").and_then(Value::as_bool),
        hibernation_configured: project_hibernation(instance, request),
        shutdown_behavior: snapshot::str_field(instance, "InstanceInitiatedShutdownBehavior")
            .map(str::to_string),
        user_data: if request.ignore_userdata {
            None
        } else {
            input.user_data.map(str::to_string)
        },
        cpu_options: project_cpu_options(instance, original_type, request, &mut warnings),
        credit_specification: instance
            .pointer("/CreditSpecification/CpuCredits")
            .and_then(Value::as_str)
            .map(str::to_string),
        license_arns: instance
            .get("Licenses")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|l| snapshot::str_field(l, "LicenseConfigurationArn"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        elastic_gpu_types: input
            .elastic_gpus
            .iter()
            .filter_map(|gpu| snapshot::str_field(gpu, "ElasticGpuType"))
            .map(str::to_string)
            .collect(),
        elastic_inference: input.elastic_inference.cloned(),
        tags: project_tags(instance, &mut warnings),
        market_options: project_market_options(input, request, &mut warnings),
    };

    (spec, warnings)
}

fn rewrite_block_devices(
    input: &ProjectionInput<'_>,
    original_instance_id: &str,
    warnings: &mut Vec<String>,
) -> Vec<AmiBlockDevice> {
    let mut mappings = input.ami_block_devices.to_vec();
    let Some(key_arn) = input.kms_key_arn else {
        return mappings;
    };

    for blk in &mut mappings {
        let detail = input.volume_details.iter().find(|vol| {
            vol.attachment_on(original_instance_id)
                .map(|a| a.device == blk.device_name)
                .unwrap_or(false)
        });
        match detail {
            Some(vol) if vol.encrypted => {
                warnings.push(format!(
                    "Device {} is already encrypted with KMS key '{}'. Keeping it as is.",
                    blk.device_name,
                    vol.kms_key_id.as_deref().unwrap_or("unknown")
                ));
            }
            _ => {
                blk.encrypted = Some(true);
                blk.kms_key_arn = Some(key_arn.to_string());
            }
        }
    }
    mappings
}

fn project_metadata_options(instance: &Value) -> Option<MetadataOptions> {
    instance.get("MetadataOptions").map(|options| MetadataOptions {
        http_tokens: snapshot::str_field(options, "HttpTokens").map(str::to_string),
        http_put_response_hop_limit: options
            .get("HttpPutResponseHopLimit")
            .and_then(Value::as_i64),
        http_endpoint: snapshot::str_field(options, "HttpEndpoint").map(str::to_string),
    })
}

fn project_hibernation(instance: &Value, request: &ConversionRequest) -> Option<bool> {
    if request.ignore_hibernation_options {
        return None;
    }
    instance
        .pointer("/HibernationOptions/Configured")
        .and_then(Value::as_bool)
}

fn project_cpu_options(
    instance: &Value,
    original_type: &str,
    request: &ConversionRequest,
    warnings: &mut Vec<String>,
) -> Option<CpuOptions> {
    if let CpuOptionsRequest::Explicit(options) = &request.cpu_options {
        return Some(*options);
    }
    if matches!(request.cpu_options, CpuOptionsRequest::Ignore) {
        return None;
    }

    let original = instance.get("CpuOptions")?;
    if request.target_instance_type.is_some() {
        warnings.push(
            "--target-instance-type specified: not inheriting CPU options from the original \
             instance; the new type's defaults apply. Specify --cpu-options to set explicit values."
                .to_string(),
        );
        return None;
    }

    // CPU options only transfer on x86_64 families that support them.
    let family = original_type.split('.').next().unwrap_or_default();
    if snapshot::architecture(instance) != "x86_64" || FIXED_CPU_FAMILIES.contains(&family) {
        return None;
    }
    serde_json::from_value(original.clone()).ok()
}

fn project_tags(instance: &Value, warnings: &mut Vec<String>) -> Vec<Tag> {
    snapshot::tags(instance)
        .into_iter()
        .filter(|(key, _)| key != JOB_TAG_KEY)
        .map(|(key, value)| {
            if let Some(rest) = key.strip_prefix("aws:") {
                // The aws: namespace is reserved and cannot be re-created.
                warnings.push(format!(
                    "Renaming reserved tag 'aws:{rest}' to '_aws:{rest}' on the replacement instance."
                ));
                Tag::new(format!("_aws:{rest}"), value)
            } else {
                Tag::new(key, value)
            }
        })
        .collect()
}

fn project_market_options(
    input: &ProjectionInput<'_>,
    request: &ConversionRequest,
    warnings: &mut Vec<String>,
) -> Option<SpotMarketOptions> {
    if request.target_billing_model != BillingModel::Spot {
        return None;
    }

    let mut max_price = None;
    if let Some(price) = input.spot_request.and_then(|r| r.spot_price.as_deref()) {
        if request.target_instance_type.is_some() {
            if request.max_spot_price.is_none() {
                warnings.push(
                    "--target-instance-type specified: not inheriting the original spot price; \
                     the on-demand price cap applies. Specify --max-spot-price to set a precise bid."
                        .to_string(),
                );
            }
        } else {
            max_price = Some(price.to_string());
        }
    }
    if let Some(price) = request.max_spot_price {
        max_price = Some(price.to_string());
    }

    Some(SpotMarketOptions { max_price })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_instance() -> Value {
        json!({
            "InstanceId": "i-original",
            "InstanceType": "c5.xlarge",
            "Architecture": "x86_64",
            "RootDeviceName": "/dev/xvda",
            "EbsOptimized": true,
            "KeyName": "ops-key",
            "State": {"Name": "stopped"},
            "Placement": {"AvailabilityZone": "eu-west-1a", "Tenancy": "default", "GroupName": ""},
            "Monitoring": {"State": "enabled"},
            "IamInstanceProfile": {"Arn": "arn:aws:iam::123456789012:instance-profile/web"},
            "CpuOptions": {"CoreCount": 2, "ThreadsPerCore": 2},
            "MetadataOptions": {"HttpTokens": "required", "HttpPutResponseHopLimit": 2, "HttpEndpoint": "enabled"},
            "EnclaveOptions": {"Enabled": false},
            "HibernationOptions": {"Configured": true},
            "InstanceInitiatedShutdownBehavior": "terminate",
            "CreditSpecification": {"CpuCredits": "unlimited"},
            "CapacityReservationSpecification": {"CapacityReservationPreference": "open"},
            "Tags": [
                {"Key": "Name", "Value": "web-1"},
                {"Key": "aws:autoscaling:groupName", "Value": "asg-web"}
            ],
            "BlockDeviceMappings": [
                {"DeviceName": "/dev/xvda", "Ebs": {"VolumeId": "vol-root", "DeleteOnTermination": true}}
            ],
            "NetworkInterfaces": [{
                "NetworkInterfaceId": "eni-1",
                "SubnetId": "subnet-1",
                "SourceDestCheck": true,
                "PrivateIpAddress": "10.0.0.5",
                "PrivateIpAddresses": [{"PrivateIpAddress": "10.0.0.5", "Primary": true}],
                "Groups": [{"GroupId": "sg-1"}],
                "Attachment": {"AttachmentId": "eni-attach-1", "DeviceIndex": 0, "DeleteOnTermination": true}
            }]
        })
    }

    fn root_mapping() -> Vec<AmiBlockDevice> {
        vec![AmiBlockDevice {
            device_name: "/dev/xvda".to_string(),
            delete_on_termination: true,
            volume_size: 64,
            volume_type: "gp3".to_string(),
            iops: Some(3000),
            throughput: Some(125),
            encrypted: None,
            kms_key_arn: None,
        }]
    }

    fn root_volume(encrypted: bool) -> VolumeDetail {
        VolumeDetail {
            volume_id: "vol-root".to_string(),
            state: "in-use".to_string(),
            size_gib: 64,
            volume_type: "gp3".to_string(),
            iops: Some(3000),
            throughput: Some(125),
            encrypted,
            kms_key_id: encrypted.then(|| "arn:aws:kms:eu-west-1:1:key/old".to_string()),
            multi_attach_enabled: false,
            attachments: vec![crate::cloud::VolumeAttachment {
                instance_id: "i-original".to_string(),
                device: "/dev/xvda".to_string(),
                delete_on_termination: true,
            }],
            tags: vec![],
        }
    }

    fn input<'a>(
        instance: &'a Value,
        mappings: &'a [AmiBlockDevice],
        volumes: &'a [VolumeDetail],
        spot_request: Option<&'a SpotRequestView>,
        kms_key_arn: Option<&'a str>,
    ) -> ProjectionInput<'a> {
        ProjectionInput {
            instance,
            ami_id: "ami-backup",
            ami_block_devices: mappings,
            volume_details: volumes,
            spot_request,
            elastic_gpus: &[],
            elastic_inference: None,
            kms_key_arn,
            user_data: Some("IyEvYmluL2Jhc2g="),
        }
    }

    #[test]
    fn test_projection_is_deterministic() {
        let instance = sample_instance();
        let mappings = root_mapping();
        let volumes = vec![root_volume(false)];
        let request = ConversionRequest::default();
        let projection_input = input(&instance, &mappings, &volumes, None, None);

        let (first, _) = project(&projection_input, &request);
        let (second, _) = project(&projection_input, &request);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_spot_target_carries_market_options_and_original_price() {
        let instance = sample_instance();
        let mappings = root_mapping();
        let volumes = vec![root_volume(false)];
        let spot_request = SpotRequestView {
            request_id: "sir-1".to_string(),
            state: "active".to_string(),
            request_type: "persistent".to_string(),
            spot_price: Some("0.0932".to_string()),
        };
        let request = ConversionRequest::default();

        let (spec, warnings) = project(
            &input(&instance, &mappings, &volumes, Some(&spot_request), None),
            &request,
        );
        assert_eq!(
            spec.market_options,
            Some(SpotMarketOptions {
                max_price: Some("0.0932".to_string())
            })
        );
        assert!(warnings.is_empty());
        // The spec never names the original instance.
        assert!(!serde_json::to_string(&spec).unwrap().contains("i-original"));
    }

    #[test]
    fn test_on_demand_target_clears_market_options() {
        let instance = sample_instance();
        let mappings = root_mapping();
        let volumes = vec![root_volume(false)];
        let request = ConversionRequest {
            target_billing_model: BillingModel::OnDemand,
            ..Default::default()
        };

        let (spec, _) = project(&input(&instance, &mappings, &volumes, None, None), &request);
        assert!(spec.market_options.is_none());
        assert_eq!(spec.instance_type, "c5.xlarge");
        assert_eq!(spec.image_id, "ami-backup");
    }

    #[test]
    fn test_target_type_drops_inherited_cpu_options_and_price() {
        let instance = sample_instance();
        let mappings = root_mapping();
        let volumes = vec![root_volume(false)];
        let spot_request = SpotRequestView {
            request_id: "sir-1".to_string(),
            state: "active".to_string(),
            request_type: "persistent".to_string(),
            spot_price: Some("0.0932".to_string()),
        };
        let request = ConversionRequest {
            target_instance_type: Some("m5.large".to_string()),
            ..Default::default()
        };

        let (spec, warnings) = project(
            &input(&instance, &mappings, &volumes, Some(&spot_request), None),
            &request,
        );
        assert_eq!(spec.instance_type, "m5.large");
        assert!(spec.cpu_options.is_none());
        assert_eq!(spec.market_options, Some(SpotMarketOptions { max_price: None }));
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_explicit_and_ignored_cpu_options() {
        let instance = sample_instance();
        let mappings = root_mapping();
        let volumes = vec![root_volume(false)];

        let explicit = ConversionRequest {
            cpu_options: CpuOptionsRequest::Explicit(CpuOptions {
                core_count: 4,
                threads_per_core: 1,
            }),
            ..Default::default()
        };
        let (spec, _) = project(&input(&instance, &mappings, &volumes, None, None), &explicit);
        assert_eq!(
            spec.cpu_options,
            Some(CpuOptions {
                core_count: 4,
                threads_per_core: 1
            })
        );

        let ignored = ConversionRequest {
            cpu_options: CpuOptionsRequest::Ignore,
            ..Default::default()
        };
        let (spec, _) = project(&input(&instance, &mappings, &volumes, None, None), &ignored);
        assert!(spec.cpu_options.is_none());

        // Inherit path copies the original counts.
        let inherit = ConversionRequest::default();
        let (spec, _) = project(&input(&instance, &mappings, &volumes, None, None), &inherit);
        assert_eq!(
            spec.cpu_options,
            Some(CpuOptions {
                core_count: 2,
                threads_per_core: 2
            })
        );
    }

    #[test]
    fn test_kms_rewrite_skips_encrypted_volumes() {
        let instance = sample_instance();
        let mappings = root_mapping();
        let request = ConversionRequest {
            volume_kms_key_id: Some("alias/ebs-custom".to_string()),
            ..Default::default()
        };
        let key_arn = "arn:aws:kms:eu-west-1:1:key/new";

        let volumes = vec![root_volume(false)];
        let (spec, warnings) = project(
            &input(&instance, &mappings, &volumes, None, Some(key_arn)),
            &request,
        );
        assert_eq!(spec.block_device_mappings[0].encrypted, Some(true));
        assert_eq!(
            spec.block_device_mappings[0].kms_key_arn.as_deref(),
            Some(key_arn)
        );
        assert!(warnings.is_empty());

        let volumes = vec![root_volume(true)];
        let (spec, warnings) = project(
            &input(&instance, &mappings, &volumes, None, Some(key_arn)),
            &request,
        );
        assert!(spec.block_device_mappings[0].encrypted.is_none());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("already encrypted"));
    }

    #[test]
    fn test_reserved_tags_renamed() {
        let instance = sample_instance();
        let mappings = root_mapping();
        let volumes = vec![root_volume(false)];
        let (spec, warnings) = project(
            &input(&instance, &mappings, &volumes, None, None),
            &ConversionRequest::default(),
        );
        assert!(spec
            .tags
            .iter()
            .any(|t| t.key == "_aws:autoscaling:groupName"));
        assert!(warnings.iter().any(|w| w.contains("reserved tag")));
    }

    #[test]
    fn test_shutdown_behavior_and_credit_specification_passthrough() {
        let instance = sample_instance();
        let mappings = root_mapping();
        let volumes = vec![root_volume(false)];
        let (spec, _) = project(
            &input(&instance, &mappings, &volumes, None, None),
            &ConversionRequest::default(),
        );
        assert_eq!(spec.shutdown_behavior.as_deref(), Some("terminate"));
        assert_eq!(spec.credit_specification.as_deref(), Some("unlimited"));

        // A snapshot without the attribute keys carries neither forward.
        let mut bare = sample_instance();
        let map = bare.as_object_mut().unwrap();
        map.remove("InstanceInitiatedShutdownBehavior");
        map.remove("CreditSpecification");
        let (spec, _) = project(
            &input(&bare, &mappings, &volumes, None, None),
            &ConversionRequest::default(),
        );
        assert!(spec.shutdown_behavior.is_none());
        assert!(spec.credit_specification.is_none());
    }

    #[test]
    fn test_hibernation_and_userdata_overrides() {
        let instance = sample_instance();
        let mappings = root_mapping();
        let volumes = vec![root_volume(false)];
        let request = ConversionRequest {
            ignore_userdata: true,
            ignore_hibernation_options: true,
            ..Default::default()
        };
        let (spec, _) = project(&input(&instance, &mappings, &volumes, None, None), &request);
        assert!(spec.user_data.is_none());
        assert!(spec.hibernation_configured.is_none());

        let (spec, _) = project(
            &input(&instance, &mappings, &volumes, None, None),
            &ConversionRequest::default(),
        );
        assert_eq!(spec.user_data.as_deref(), Some("IyEvYmluL2Jhc2g="));
        assert_eq!(spec.hibernation_configured, Some(true));
    }
}
