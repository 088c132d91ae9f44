//! Read-only views over opaque describe-instance payloads
//!
//! The job record stores provider responses verbatim (PascalCase wire
//! keys). These accessors strongly-type just the fields the state machine
//! reads, leaving the rest of the subtree untouched.

use serde_json::Value;

/// Block-device mapping row of a describe-instance payload
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMapping {
    pub device_name: String,
    pub volume_id: String,
    pub delete_on_termination: bool,
}

/// Network-interface row of a describe-instance payload
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEni {
    pub eni_id: String,
    pub attachment_id: Option<String>,
    pub device_index: i32,
    pub delete_on_termination: bool,
    pub private_ip: String,
    pub secondary_private_ips: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub subnet_id: String,
    pub source_dest_check: bool,
    pub public_ip: Option<String>,
}

pub fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

pub fn instance_id(instance: &Value) -> &str {
    str_field(instance, "InstanceId").unwrap_or_default()
}

pub fn instance_type(instance: &Value) -> &str {
    str_field(instance, "InstanceType").unwrap_or_default()
}

pub fn state_name(instance: &Value) -> &str {
    instance
        .pointer("/State/Name")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

pub fn root_device_name(instance: &Value) -> &str {
    str_field(instance, "RootDeviceName").unwrap_or_default()
}

pub fn spot_request_id(instance: &Value) -> Option<&str> {
    str_field(instance, "SpotInstanceRequestId")
}

pub fn availability_zone(instance: &Value) -> &str {
    instance
        .pointer("/Placement/AvailabilityZone")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

pub fn tenancy(instance: &Value) -> Option<&str> {
    instance.pointer("/Placement/Tenancy").and_then(Value::as_str)
}

pub fn placement_group(instance: &Value) -> Option<&str> {
    instance
        .pointer("/Placement/GroupName")
        .and_then(Value::as_str)
        .filter(|g| !g.is_empty())
}

pub fn architecture(instance: &Value) -> &str {
    str_field(instance, "Architecture").unwrap_or_default()
}

pub fn monitoring_enabled(instance: &Value) -> bool {
    matches!(
        instance.pointer("/Monitoring/State").and_then(Value::as_str),
        Some("enabled") | Some("pending")
    )
}

pub fn block_device_mappings(instance: &Value) -> Vec<BlockMapping> {
    instance
        .get("BlockDeviceMappings")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    Some(BlockMapping {
                        device_name: str_field(row, "DeviceName")?.to_string(),
                        volume_id: row
                            .pointer("/Ebs/VolumeId")
                            .and_then(Value::as_str)?
                            .to_string(),
                        delete_on_termination: row
                            .pointer("/Ebs/DeleteOnTermination")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn network_interfaces(instance: &Value) -> Vec<SnapshotEni> {
    instance
        .get("NetworkInterfaces")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(parse_eni).collect())
        .unwrap_or_default()
}

fn parse_eni(row: &Value) -> Option<SnapshotEni> {
    let private_ips = row
        .get("PrivateIpAddresses")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let primary = private_ips
        .iter()
        .find(|ip| ip.get("Primary").and_then(Value::as_bool).unwrap_or(false));
    let secondary_private_ips = private_ips
        .iter()
        .filter(|ip| !ip.get("Primary").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|ip| str_field(ip, "PrivateIpAddress"))
        .map(str::to_string)
        .collect();

    Some(SnapshotEni {
        eni_id: str_field(row, "NetworkInterfaceId")?.to_string(),
        attachment_id: row
            .pointer("/Attachment/AttachmentId")
            .and_then(Value::as_str)
            .map(str::to_string),
        device_index: row
            .pointer("/Attachment/DeviceIndex")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32,
        delete_on_termination: row
            .pointer("/Attachment/DeleteOnTermination")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        private_ip: primary
            .and_then(|ip| str_field(ip, "PrivateIpAddress"))
            .or_else(|| str_field(row, "PrivateIpAddress"))
            .unwrap_or_default()
            .to_string(),
        secondary_private_ips,
        security_group_ids: row
            .get("Groups")
            .and_then(Value::as_array)
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(|g| str_field(g, "GroupId"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        subnet_id: str_field(row, "SubnetId").unwrap_or_default().to_string(),
        source_dest_check: row
            .get("SourceDestCheck")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        public_ip: row
            .pointer("/Association/PublicIp")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Instance tags as key/value pairs.
pub fn tags(instance: &Value) -> Vec<(String, String)> {
    instance
        .get("Tags")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|t| {
                    Some((
                        str_field(t, "Key")?.to_string(),
                        str_field(t, "Value")?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}
