//! Persistent job record
//!
//! The single entity the state machine reads and writes. Provider describe
//! responses are kept as opaque JSON subtrees so they round-trip even as
//! the provider schema evolves; only the fields the executor itself acts
//! on are strongly typed.

use crate::cloud::{SpotRequestView, Tag, VolumeDetail};
use crate::projector::{AmiBlockDevice, CpuOptions, LaunchSpec};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Billing/lifecycle model of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BillingModel {
    Spot,
    OnDemand,
}

impl Default for BillingModel {
    fn default() -> Self {
        Self::Spot
    }
}

impl fmt::Display for BillingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::OnDemand => write!(f, "on-demand"),
        }
    }
}

impl std::str::FromStr for BillingModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spot" => Ok(Self::Spot),
            "on-demand" => Ok(Self::OnDemand),
            other => Err(format!("unknown billing model '{other}'")),
        }
    }
}

/// Terminal status of a conversion; absence means "not started"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversionStatus {
    InProgress,
    Success,
}

/// How CPU options of the replacement are derived
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode", content = "options")]
pub enum CpuOptionsRequest {
    /// Inherit from the original instance when the compatibility rules allow
    Inherit,
    /// Leave CPU options out of the launch spec entirely
    Ignore,
    /// Explicit core/thread counts
    Explicit(CpuOptions),
}

impl Default for CpuOptionsRequest {
    fn default() -> Self {
        Self::Inherit
    }
}

/// Operator inputs remembered across resumes. Frozen into the record when
/// the job is created; later invocations warn when their inputs drift.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionRequest {
    pub target_billing_model: BillingModel,
    pub target_instance_type: Option<String>,
    pub cpu_options: CpuOptionsRequest,
    pub max_spot_price: Option<f64>,
    pub volume_kms_key_id: Option<String>,
    pub ignore_userdata: bool,
    pub ignore_hibernation_options: bool,
    pub stop_instance: bool,
    pub do_not_require_stopped_instance: bool,
    pub reboot_if_needed: bool,
    /// `None` disables the target-group feature; an empty list means every
    /// instance-type target group in the region.
    pub target_group_arns: Option<Vec<String>>,
    /// `None` skips the post-registration health wait; an empty list means
    /// the default accepted set `{unused, healthy}`.
    pub wait_for_tg_states: Option<Vec<String>>,
    /// `None` disables alarm reconciliation; an empty list or `*` means
    /// every alarm in the account.
    pub cw_alarm_prefixes: Option<Vec<String>>,
}

impl ConversionRequest {
    /// Accepted target-group health states for the post-registration wait.
    pub fn accepted_tg_states(&self) -> Vec<String> {
        match &self.wait_for_tg_states {
            Some(states) if !states.is_empty() => states.clone(),
            _ => vec!["unused".to_string(), "healthy".to_string()],
        }
    }

    /// True when the request changes anything besides the billing model.
    pub fn changes_hardware(&self) -> bool {
        self.target_instance_type.is_some()
            || matches!(self.cpu_options, CpuOptionsRequest::Explicit(_))
            || self.volume_kms_key_id.is_some()
    }
}

/// Network interface descriptor captured at checkpoint time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EniDetail {
    pub eni_id: String,
    pub device_index: i32,
    /// Primary private IPv4
    pub private_ip: String,
    pub secondary_private_ips: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub subnet_id: String,
    pub source_dest_check: bool,
    /// `DeleteOnTermination` of the attachment as it was on the original
    /// instance; restored on the replacement in
    /// `configure_network_interfaces`.
    pub delete_on_termination: bool,
    pub public_ip: Option<String>,
}

/// Elastic IP binding captured at checkpoint time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressDetail {
    pub allocation_id: String,
    pub association_id: Option<String>,
    pub public_ip: String,
    pub private_ip: String,
    /// ENI that held the association on the original instance
    pub eni_id: String,
}

/// Target-group membership of the original instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRegistration {
    pub target_group_arn: String,
    pub port: i32,
}

/// The persisted per-job record, keyed by the original instance id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRecord {
    pub instance_id: String,
    /// Opaque job token; equal to `instance_id` and used as the value of
    /// the resource lease tag.
    pub job_id: String,
    pub start_date: Option<String>,
    pub last_update_date: Option<String>,
    pub end_date: Option<String>,
    pub conversion_status: Option<ConversionStatus>,
    /// Name of the most recently completed step; advances monotonically
    /// except through an explicit `--reset-step`.
    pub last_successful_step_name: Option<String>,
    pub step_count: u32,

    pub source_billing_model: Option<BillingModel>,
    pub target_billing_model: Option<BillingModel>,
    pub request: Option<ConversionRequest>,

    /// Full describe-instance payload captured once at discovery and never
    /// rewritten.
    pub original_instance_state: Option<Value>,
    pub original_user_data: Option<String>,
    pub spot_request: Option<SpotRequestView>,
    pub kms_key_arn: Option<String>,

    pub original_volume_details: Vec<VolumeDetail>,
    pub original_network_interfaces: Vec<EniDetail>,
    pub original_addresses: Vec<AddressDetail>,
    pub original_target_groups: Vec<TargetRegistration>,
    pub elastic_gpus: Vec<Value>,

    pub detached_volume_ids: Vec<String>,
    pub ami_id: Option<String>,
    pub ami_creation_date: Option<String>,
    pub ami_block_devices: Vec<AmiBlockDevice>,
    /// Projected launch specification, frozen at the checkpoint step.
    pub launch_spec: Option<LaunchSpec>,

    /// Id returned by the launch call; promoted to `new_instance_id` once
    /// the replacement reaches `running`.
    pub launched_instance_id: Option<String>,
    pub new_instance_id: Option<String>,
    pub reboot_recommended: bool,
    pub rebooted: bool,
    pub final_instance_state: Option<Value>,

    /// Per-step result details, re-printed on replay.
    pub step_results: BTreeMap<String, String>,
}

/// Current UTC time in ISO-8601 with second precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl JobRecord {
    /// Fresh record for a new conversion job.
    pub fn new(instance_id: &str, request: ConversionRequest) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            job_id: instance_id.to_string(),
            start_date: Some(now_iso8601()),
            conversion_status: Some(ConversionStatus::InProgress),
            target_billing_model: Some(request.target_billing_model),
            request: Some(request),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.conversion_status == Some(ConversionStatus::Success)
    }

    /// The lease tag stamped on every resource this job touches.
    pub fn job_tag(&self) -> Tag {
        Tag::job_tag(&self.instance_id)
    }

    /// Mark a step as completed with its result detail.
    pub fn complete_step(&mut self, step_name: &str, detail: &str) {
        self.last_successful_step_name = Some(step_name.to_string());
        self.last_update_date = Some(now_iso8601());
        self.step_count += 1;
        self.step_results
            .insert(step_name.to_string(), detail.to_string());
    }

    /// Cached result detail of a previously completed step.
    pub fn step_result(&self, step_name: &str) -> Option<&str> {
        self.step_results.get(step_name).map(String::as_str)
    }

    /// The request as remembered by the record (always present after
    /// creation; the default stands in for legacy records).
    pub fn request(&self) -> ConversionRequest {
        self.request.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_model_roundtrip() {
        assert_eq!("spot".parse::<BillingModel>().unwrap(), BillingModel::Spot);
        assert_eq!(
            "on-demand".parse::<BillingModel>().unwrap(),
            BillingModel::OnDemand
        );
        assert!("reserved".parse::<BillingModel>().is_err());
        assert_eq!(
            serde_json::to_value(BillingModel::OnDemand).unwrap(),
            serde_json::json!("on-demand")
        );
    }

    #[test]
    fn test_record_roundtrip() {
        let mut record = JobRecord::new(
            "i-0123456789abcdef0",
            ConversionRequest {
                target_billing_model: BillingModel::OnDemand,
                target_instance_type: Some("m5.large".to_string()),
                ..Default::default()
            },
        );
        record.complete_step("read_state_table", "Record read successfully.");
        record.detached_volume_ids = vec!["vol-1".to_string()];

        let json = serde_json::to_string(&record).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.job_id, "i-0123456789abcdef0");
        assert_eq!(
            back.step_result("read_state_table"),
            Some("Record read successfully.")
        );
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        // Records written by newer tool versions must still load.
        let raw = serde_json::json!({
            "instance_id": "i-1",
            "job_id": "i-1",
            "step_count": 3,
            "future_field": {"nested": true}
        });
        let record: JobRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.step_count, 3);
    }

    #[test]
    fn test_accepted_tg_states_default() {
        let mut request = ConversionRequest::default();
        assert_eq!(request.accepted_tg_states(), vec!["unused", "healthy"]);
        request.wait_for_tg_states = Some(vec![]);
        assert_eq!(request.accepted_tg_states(), vec!["unused", "healthy"]);
        request.wait_for_tg_states = Some(vec!["draining".to_string()]);
        assert_eq!(request.accepted_tg_states(), vec!["draining"]);
    }
}
