//! Cloud provider seam
//!
//! The minimum capability surface the conversion steps need. The production
//! implementation lives in `spot-converter-cloud`; tests drive the state
//! machine against an in-memory mock. Implementations must not cache:
//! every call observes fresh provider state. Transient throttling is
//! absorbed inside the implementation; what surfaces here is either data or
//! a typed, non-retryable failure.

use crate::projector::{AmiBlockDevice, LaunchSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Tag key applied to every resource touched by a conversion job. The value
/// is always the original instance id. External automation should leave
/// tagged resources alone for the duration of the job.
pub const JOB_TAG_KEY: &str = "ec2-spot-converter:job-id";

/// Provider error, post-retry
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Provider-reported API error with its machine-readable code
    #[error("{code}: {message}")]
    Api { code: String, message: String },

    #[error("cloud transport error: {0}")]
    Transport(String),
}

impl CloudError {
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    /// True when the provider returned the given error code.
    pub fn is_code(&self, code: &str) -> bool {
        matches!(self, Self::Api { code: c, .. } if c == code)
    }
}

/// Key/value resource tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The job lease tag for the given instance id.
    pub fn job_tag(instance_id: &str) -> Self {
        Self::new(JOB_TAG_KEY, instance_id)
    }
}

/// One attachment of an EBS volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub instance_id: String,
    pub device: String,
    pub delete_on_termination: bool,
}

/// Volume descriptor as captured for the job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDetail {
    pub volume_id: String,
    /// Provider volume state (`in-use`, `available`, ...)
    pub state: String,
    pub size_gib: i32,
    pub volume_type: String,
    pub iops: Option<i32>,
    pub throughput: Option<i32>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub multi_attach_enabled: bool,
    pub attachments: Vec<VolumeAttachment>,
    pub tags: Vec<Tag>,
}

impl VolumeDetail {
    /// Attachment of this volume on the given instance, if any.
    pub fn attachment_on(&self, instance_id: &str) -> Option<&VolumeAttachment> {
        self.attachments.iter().find(|a| a.instance_id == instance_id)
    }
}

/// Current attachment of a network interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EniAttachment {
    pub attachment_id: String,
    pub instance_id: Option<String>,
    pub device_index: i32,
    pub delete_on_termination: bool,
}

/// Network interface as observed by `describe_network_interfaces`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EniView {
    pub eni_id: String,
    /// Provider interface status (`in-use`, `available`, ...)
    pub status: String,
    pub attachment: Option<EniAttachment>,
    /// Private IPv4 addresses, primary first
    pub private_ips: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub subnet_id: String,
    pub source_dest_check: bool,
    /// Public IP of the current association, if any
    pub association_public_ip: Option<String>,
}

/// Elastic IP as observed by `describe_addresses`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressView {
    pub allocation_id: String,
    pub association_id: Option<String>,
    pub public_ip: String,
    pub private_ip: Option<String>,
    pub network_interface_id: Option<String>,
}

/// Spot instance request, reduced to the fields the machine reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotRequestView {
    pub request_id: String,
    pub state: String,
    /// `persistent` or `one-time`
    pub request_type: String,
    pub spot_price: Option<String>,
}

/// Backup image status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageView {
    pub image_id: String,
    /// Provider image state (`pending`, `available`, `failed`, ...)
    pub state: String,
    pub snapshot_ids: Vec<String>,
}

/// One (instance, port, health-state) row of a target group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetHealthView {
    pub instance_id: String,
    pub port: i32,
    pub state: String,
}

/// Cloud capability surface used by the step handlers
#[async_trait]
pub trait CloudApi: Send + Sync {
    // -- instances ---------------------------------------------------------

    /// Full describe-instance payload in provider wire shape, or `None`
    /// when the id does not resolve.
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<Value>, CloudError>;

    /// Base64 user data of the instance, when present.
    async fn describe_instance_user_data(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, CloudError>;

    /// `instanceInitiatedShutdownBehavior` attribute (`stop`/`terminate`),
    /// or `None` when the provider does not surface it.
    async fn describe_instance_shutdown_behavior(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, CloudError>;

    /// CPU-credit mode of a burstable instance (`standard`/`unlimited`),
    /// or `None` for non-burstable families or when the lookup is denied.
    async fn describe_instance_credit_specification(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, CloudError>;

    /// `disableApiTermination` attribute.
    async fn termination_protection(&self, instance_id: &str) -> Result<bool, CloudError>;

    async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError>;
    async fn terminate_instance(&self, instance_id: &str) -> Result<(), CloudError>;
    async fn reboot_instance(&self, instance_id: &str) -> Result<(), CloudError>;

    /// Launch the replacement instance. `extra_tags` are stamped on the
    /// instance at creation time, on top of the spec's tag list.
    async fn run_instance(
        &self,
        spec: &LaunchSpec,
        extra_tags: &[Tag],
    ) -> Result<String, CloudError>;

    /// Non-terminated instances carrying the given tag.
    async fn find_instances_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<Value>, CloudError>;

    // -- volumes -----------------------------------------------------------

    /// Fails with `NotFound` when any of the ids no longer resolves
    /// (provider semantics); callers treat that as "already released"
    /// where absence is meaningful.
    async fn describe_volumes(
        &self,
        volume_ids: &[String],
    ) -> Result<Vec<VolumeDetail>, CloudError>;

    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), CloudError>;

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), CloudError>;

    async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudError>;

    // -- images ------------------------------------------------------------

    /// No-reboot image creation. Fails with provider code
    /// `InvalidAMIName.Duplicate` when the name is already taken.
    async fn create_image(
        &self,
        name: &str,
        instance_id: &str,
        mappings: &[AmiBlockDevice],
    ) -> Result<String, CloudError>;

    async fn find_image_by_name(&self, name: &str) -> Result<Option<ImageView>, CloudError>;
    async fn describe_image(&self, image_id: &str) -> Result<Option<ImageView>, CloudError>;
    async fn deregister_image(&self, image_id: &str) -> Result<(), CloudError>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError>;

    // -- network interfaces and addresses ----------------------------------

    async fn describe_network_interfaces(
        &self,
        eni_ids: &[String],
    ) -> Result<Vec<EniView>, CloudError>;

    async fn set_eni_delete_on_termination(
        &self,
        eni_id: &str,
        attachment_id: &str,
        delete_on_termination: bool,
    ) -> Result<(), CloudError>;

    async fn describe_addresses(&self) -> Result<Vec<AddressView>, CloudError>;

    async fn associate_address(
        &self,
        allocation_id: &str,
        eni_id: &str,
        private_ip: &str,
    ) -> Result<(), CloudError>;

    // -- tags --------------------------------------------------------------

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<(), CloudError>;
    async fn delete_tags(&self, resource_ids: &[String], keys: &[String])
        -> Result<(), CloudError>;

    // -- spot requests -----------------------------------------------------

    async fn describe_spot_request(
        &self,
        request_id: &str,
    ) -> Result<Option<SpotRequestView>, CloudError>;

    async fn cancel_spot_request(&self, request_id: &str) -> Result<(), CloudError>;

    // -- load balancing ----------------------------------------------------

    /// ARNs of instance-type target groups, restricted to `arns` when
    /// non-empty.
    async fn instance_target_groups(&self, arns: &[String]) -> Result<Vec<String>, CloudError>;

    /// All registered targets of a target group with their health states.
    async fn describe_target_health(&self, arn: &str)
        -> Result<Vec<TargetHealthView>, CloudError>;

    /// Health state of one specific (instance, port) registration.
    async fn target_health_of(
        &self,
        arn: &str,
        instance_id: &str,
        port: i32,
    ) -> Result<Option<String>, CloudError>;

    async fn register_target(
        &self,
        arn: &str,
        instance_id: &str,
        port: i32,
    ) -> Result<(), CloudError>;

    async fn deregister_target(
        &self,
        arn: &str,
        instance_id: &str,
        port: i32,
    ) -> Result<(), CloudError>;

    // -- monitoring --------------------------------------------------------

    /// Metric alarms in provider wire shape, optionally restricted by name
    /// prefix.
    async fn list_metric_alarms(
        &self,
        name_prefix: Option<&str>,
    ) -> Result<Vec<Value>, CloudError>;

    /// Re-put an alarm definition previously returned by
    /// `list_metric_alarms` (with mutated dimensions).
    async fn put_metric_alarm(&self, alarm: &Value) -> Result<(), CloudError>;

    // -- misc --------------------------------------------------------------

    /// Resolve a KMS key id/alias/ARN to its key ARN.
    async fn resolve_kms_key_arn(&self, key_id: &str) -> Result<String, CloudError>;

    /// Elastic GPU descriptors in provider wire shape.
    async fn describe_elastic_gpus(&self, gpu_ids: &[String]) -> Result<Vec<Value>, CloudError>;

    /// Type of an elastic inference accelerator (e.g. `eia2.medium`).
    async fn describe_accelerator_type(&self, accelerator_id: &str)
        -> Result<String, CloudError>;
}
