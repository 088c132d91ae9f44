//! SDK <-> wire-shape conversions
//!
//! The job record stores provider payloads in their wire shape (PascalCase
//! keys, as the service APIs document them) so records written by this
//! tool and by its predecessors stay mutually readable. The SDK's typed
//! output structs are converted here; absent fields are omitted rather
//! than serialised as null.

use aws_sdk_cloudwatch::types::MetricAlarm;
use aws_sdk_ec2::primitives::DateTimeFormat;
use aws_sdk_ec2::types::{Address, Image, Instance, NetworkInterface, Volume};
use serde_json::{json, Map, Value};
use spot_converter_core::cloud::{
    AddressView, EniAttachment, EniView, ImageView, SpotRequestView, Tag, VolumeAttachment,
    VolumeDetail,
};

fn put(map: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        map.insert(key.to_string(), value);
    }
}

fn put_str(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    put(map, key, value.map(|v| Value::String(v.to_string())));
}

fn put_bool(map: &mut Map<String, Value>, key: &str, value: Option<bool>) {
    put(map, key, value.map(Value::Bool));
}

fn put_i32(map: &mut Map<String, Value>, key: &str, value: Option<i32>) {
    put(map, key, value.map(|v| json!(v)));
}

fn tags_to_json(tags: &[aws_sdk_ec2::types::Tag]) -> Value {
    Value::Array(
        tags.iter()
            .map(|t| {
                json!({
                    "Key": t.key().unwrap_or_default(),
                    "Value": t.value().unwrap_or_default(),
                })
            })
            .collect(),
    )
}

/// Full describe-instance payload in wire shape.
///
/// `InstanceInitiatedShutdownBehavior` and `CreditSpecification` are not
/// part of the describe payload (they are attribute lookups); the discover
/// step grafts them onto the stored snapshot under these same wire keys.
pub fn instance_to_json(instance: &Instance) -> Value {
    let mut map = Map::new();

    put_str(&mut map, "InstanceId", instance.instance_id());
    put_str(&mut map, "ImageId", instance.image_id());
    put_str(
        &mut map,
        "InstanceType",
        instance.instance_type().map(|t| t.as_str()),
    );
    put_str(&mut map, "KeyName", instance.key_name());
    put_str(&mut map, "RootDeviceName", instance.root_device_name());
    put_str(&mut map, "SpotInstanceRequestId", instance.spot_instance_request_id());
    put_str(
        &mut map,
        "Architecture",
        instance.architecture().map(|a| a.as_str()),
    );
    put_str(
        &mut map,
        "InstanceLifecycle",
        instance.instance_lifecycle().map(|l| l.as_str()),
    );
    put_str(&mut map, "PrivateIpAddress", instance.private_ip_address());
    put_str(&mut map, "PublicIpAddress", instance.public_ip_address());
    put_str(&mut map, "SubnetId", instance.subnet_id());
    put_str(&mut map, "VpcId", instance.vpc_id());
    put_bool(&mut map, "EbsOptimized", instance.ebs_optimized());
    put(
        &mut map,
        "LaunchTime",
        instance
            .launch_time()
            .and_then(|t| t.fmt(DateTimeFormat::DateTime).ok())
            .map(Value::String),
    );

    if let Some(state) = instance.state() {
        put(
            &mut map,
            "State",
            Some(json!({"Name": state.name().map(|n| n.as_str()).unwrap_or_default()})),
        );
    }
    if let Some(placement) = instance.placement() {
        let mut p = Map::new();
        put_str(&mut p, "AvailabilityZone", placement.availability_zone());
        put_str(&mut p, "Tenancy", placement.tenancy().map(|t| t.as_str()));
        put_str(&mut p, "GroupName", placement.group_name());
        map.insert("Placement".to_string(), Value::Object(p));
    }
    if let Some(monitoring) = instance.monitoring() {
        put(
            &mut map,
            "Monitoring",
            Some(json!({"State": monitoring.state().map(|s| s.as_str()).unwrap_or_default()})),
        );
    }
    if let Some(profile) = instance.iam_instance_profile() {
        let mut p = Map::new();
        put_str(&mut p, "Arn", profile.arn());
        put_str(&mut p, "Id", profile.id());
        map.insert("IamInstanceProfile".to_string(), Value::Object(p));
    }
    if let Some(options) = instance.metadata_options() {
        let mut o = Map::new();
        put_str(&mut o, "HttpTokens", options.http_tokens().map(|t| t.as_str()));
        put_i32(&mut o, "HttpPutResponseHopLimit", options.http_put_response_hop_limit());
        put_str(&mut o, "HttpEndpoint", options.http_endpoint().map(|e| e.as_str()));
        map.insert("MetadataOptions".to_string(), Value::Object(o));
    }
    if let Some(options) = instance.enclave_options() {
        let mut o = Map::new();
        put_bool(&mut o, "Enabled", options.enabled());
        map.insert("EnclaveOptions".to_string(), Value::Object(o));
    }
    if let Some(options) = instance.hibernation_options() {
        let mut o = Map::new();
        put_bool(&mut o, "Configured", options.configured());
        map.insert("HibernationOptions".to_string(), Value::Object(o));
    }
    if let Some(options) = instance.cpu_options() {
        let mut o = Map::new();
        put_i32(&mut o, "CoreCount", options.core_count());
        put_i32(&mut o, "ThreadsPerCore", options.threads_per_core());
        map.insert("CpuOptions".to_string(), Value::Object(o));
    }
    if let Some(spec) = instance.capacity_reservation_specification() {
        let mut o = Map::new();
        put_str(
            &mut o,
            "CapacityReservationPreference",
            spec.capacity_reservation_preference().map(|p| p.as_str()),
        );
        if let Some(target) = spec.capacity_reservation_target() {
            let mut t = Map::new();
            put_str(&mut t, "CapacityReservationId", target.capacity_reservation_id());
            put_str(
                &mut t,
                "CapacityReservationResourceGroupArn",
                target.capacity_reservation_resource_group_arn(),
            );
            o.insert("CapacityReservationTarget".to_string(), Value::Object(t));
        }
        map.insert("CapacityReservationSpecification".to_string(), Value::Object(o));
    }

    if !instance.tags().is_empty() {
        map.insert("Tags".to_string(), tags_to_json(instance.tags()));
    }

    let mappings: Vec<Value> = instance
        .block_device_mappings()
        .iter()
        .map(|blk| {
            let mut row = Map::new();
            put_str(&mut row, "DeviceName", blk.device_name());
            if let Some(ebs) = blk.ebs() {
                let mut e = Map::new();
                put_str(&mut e, "VolumeId", ebs.volume_id());
                put_bool(&mut e, "DeleteOnTermination", ebs.delete_on_termination());
                put_str(&mut e, "Status", ebs.status().map(|s| s.as_str()));
                row.insert("Ebs".to_string(), Value::Object(e));
            }
            Value::Object(row)
        })
        .collect();
    map.insert("BlockDeviceMappings".to_string(), Value::Array(mappings));

    let interfaces: Vec<Value> = instance
        .network_interfaces()
        .iter()
        .map(instance_eni_to_json)
        .collect();
    map.insert("NetworkInterfaces".to_string(), Value::Array(interfaces));

    if !instance.elastic_gpu_associations().is_empty() {
        let rows: Vec<Value> = instance
            .elastic_gpu_associations()
            .iter()
            .map(|a| {
                let mut row = Map::new();
                put_str(&mut row, "ElasticGpuId", a.elastic_gpu_id());
                Value::Object(row)
            })
            .collect();
        map.insert("ElasticGpuAssociations".to_string(), Value::Array(rows));
    }
    if !instance.elastic_inference_accelerator_associations().is_empty() {
        let rows: Vec<Value> = instance
            .elastic_inference_accelerator_associations()
            .iter()
            .map(|a| {
                let mut row = Map::new();
                put_str(
                    &mut row,
                    "ElasticInferenceAcceleratorArn",
                    a.elastic_inference_accelerator_arn(),
                );
                Value::Object(row)
            })
            .collect();
        map.insert(
            "ElasticInferenceAcceleratorAssociations".to_string(),
            Value::Array(rows),
        );
    }
    if !instance.licenses().is_empty() {
        let rows: Vec<Value> = instance
            .licenses()
            .iter()
            .map(|l| {
                let mut row = Map::new();
                put_str(&mut row, "LicenseConfigurationArn", l.license_configuration_arn());
                Value::Object(row)
            })
            .collect();
        map.insert("Licenses".to_string(), Value::Array(rows));
    }

    Value::Object(map)
}

fn instance_eni_to_json(eni: &aws_sdk_ec2::types::InstanceNetworkInterface) -> Value {
    let mut row = Map::new();
    put_str(&mut row, "NetworkInterfaceId", eni.network_interface_id());
    put_str(&mut row, "SubnetId", eni.subnet_id());
    put_str(&mut row, "VpcId", eni.vpc_id());
    put_str(&mut row, "PrivateIpAddress", eni.private_ip_address());
    put_bool(&mut row, "SourceDestCheck", eni.source_dest_check());
    put_str(&mut row, "Status", eni.status().map(|s| s.as_str()));

    if let Some(attachment) = eni.attachment() {
        let mut a = Map::new();
        put_str(&mut a, "AttachmentId", attachment.attachment_id());
        put_i32(&mut a, "DeviceIndex", attachment.device_index());
        put_bool(&mut a, "DeleteOnTermination", attachment.delete_on_termination());
        row.insert("Attachment".to_string(), Value::Object(a));
    }
    if let Some(association) = eni.association() {
        let mut a = Map::new();
        put_str(&mut a, "PublicIp", association.public_ip());
        put_str(&mut a, "IpOwnerId", association.ip_owner_id());
        row.insert("Association".to_string(), Value::Object(a));
    }

    let groups: Vec<Value> = eni
        .groups()
        .iter()
        .map(|g| {
            let mut row = Map::new();
            put_str(&mut row, "GroupId", g.group_id());
            put_str(&mut row, "GroupName", g.group_name());
            Value::Object(row)
        })
        .collect();
    row.insert("Groups".to_string(), Value::Array(groups));

    let ips: Vec<Value> = eni
        .private_ip_addresses()
        .iter()
        .map(|ip| {
            let mut row = Map::new();
            put_str(&mut row, "PrivateIpAddress", ip.private_ip_address());
            put_bool(&mut row, "Primary", ip.primary());
            if let Some(association) = ip.association() {
                let mut a = Map::new();
                put_str(&mut a, "PublicIp", association.public_ip());
                row.insert("Association".to_string(), Value::Object(a));
            }
            Value::Object(row)
        })
        .collect();
    row.insert("PrivateIpAddresses".to_string(), Value::Array(ips));

    Value::Object(row)
}

pub fn volume_to_detail(volume: &Volume) -> VolumeDetail {
    VolumeDetail {
        volume_id: volume.volume_id().unwrap_or_default().to_string(),
        state: volume.state().map(|s| s.as_str()).unwrap_or_default().to_string(),
        size_gib: volume.size().unwrap_or_default(),
        volume_type: volume
            .volume_type()
            .map(|t| t.as_str())
            .unwrap_or_default()
            .to_string(),
        iops: volume.iops(),
        throughput: volume.throughput(),
        encrypted: volume.encrypted().unwrap_or(false),
        kms_key_id: volume.kms_key_id().map(str::to_string),
        multi_attach_enabled: volume.multi_attach_enabled().unwrap_or(false),
        attachments: volume
            .attachments()
            .iter()
            .map(|a| VolumeAttachment {
                instance_id: a.instance_id().unwrap_or_default().to_string(),
                device: a.device().unwrap_or_default().to_string(),
                delete_on_termination: a.delete_on_termination().unwrap_or(false),
            })
            .collect(),
        tags: volume
            .tags()
            .iter()
            .map(|t| Tag::new(t.key().unwrap_or_default(), t.value().unwrap_or_default()))
            .collect(),
    }
}

pub fn eni_to_view(eni: &NetworkInterface) -> EniView {
    let mut private_ips = Vec::new();
    // Primary address first, the order the rest of the tool relies on.
    for ip in eni.private_ip_addresses() {
        if ip.primary().unwrap_or(false) {
            if let Some(address) = ip.private_ip_address() {
                private_ips.push(address.to_string());
            }
        }
    }
    for ip in eni.private_ip_addresses() {
        if !ip.primary().unwrap_or(false) {
            if let Some(address) = ip.private_ip_address() {
                private_ips.push(address.to_string());
            }
        }
    }
    if private_ips.is_empty() {
        if let Some(address) = eni.private_ip_address() {
            private_ips.push(address.to_string());
        }
    }

    EniView {
        eni_id: eni.network_interface_id().unwrap_or_default().to_string(),
        status: eni.status().map(|s| s.as_str()).unwrap_or_default().to_string(),
        attachment: eni.attachment().map(|a| EniAttachment {
            attachment_id: a.attachment_id().unwrap_or_default().to_string(),
            instance_id: a.instance_id().map(str::to_string),
            device_index: a.device_index().unwrap_or(0),
            delete_on_termination: a.delete_on_termination().unwrap_or(false),
        }),
        private_ips,
        security_group_ids: eni
            .groups()
            .iter()
            .filter_map(|g| g.group_id())
            .map(str::to_string)
            .collect(),
        subnet_id: eni.subnet_id().unwrap_or_default().to_string(),
        source_dest_check: eni.source_dest_check().unwrap_or(true),
        association_public_ip: eni
            .association()
            .and_then(|a| a.public_ip())
            .map(str::to_string),
    }
}

pub fn address_to_view(address: &Address) -> AddressView {
    AddressView {
        allocation_id: address.allocation_id().unwrap_or_default().to_string(),
        association_id: address.association_id().map(str::to_string),
        public_ip: address.public_ip().unwrap_or_default().to_string(),
        private_ip: address.private_ip_address().map(str::to_string),
        network_interface_id: address.network_interface_id().map(str::to_string),
    }
}

pub fn spot_request_to_view(
    request: &aws_sdk_ec2::types::SpotInstanceRequest,
) -> SpotRequestView {
    SpotRequestView {
        request_id: request
            .spot_instance_request_id()
            .unwrap_or_default()
            .to_string(),
        state: request.state().map(|s| s.as_str()).unwrap_or_default().to_string(),
        request_type: request.r#type().map(|t| t.as_str()).unwrap_or_default().to_string(),
        spot_price: request.spot_price().map(str::to_string),
    }
}

pub fn image_to_view(image: &Image) -> ImageView {
    ImageView {
        image_id: image.image_id().unwrap_or_default().to_string(),
        state: image.state().map(|s| s.as_str()).unwrap_or_default().to_string(),
        snapshot_ids: image
            .block_device_mappings()
            .iter()
            .filter_map(|blk| blk.ebs().and_then(|e| e.snapshot_id()))
            .map(str::to_string)
            .collect(),
    }
}

/// Settable fields of a metric alarm, in wire shape. This is what
/// `put_metric_alarm` accepts back after the dimensions were rewritten.
pub fn alarm_to_json(alarm: &MetricAlarm) -> Value {
    let mut map = Map::new();
    put_str(&mut map, "AlarmName", alarm.alarm_name());
    put_str(&mut map, "AlarmArn", alarm.alarm_arn());
    put_str(&mut map, "AlarmDescription", alarm.alarm_description());
    put_bool(&mut map, "ActionsEnabled", alarm.actions_enabled());
    put(
        &mut map,
        "OKActions",
        Some(Value::Array(
            alarm.ok_actions().iter().map(|a| json!(a)).collect(),
        )),
    );
    put(
        &mut map,
        "AlarmActions",
        Some(Value::Array(
            alarm.alarm_actions().iter().map(|a| json!(a)).collect(),
        )),
    );
    put(
        &mut map,
        "InsufficientDataActions",
        Some(Value::Array(
            alarm
                .insufficient_data_actions()
                .iter()
                .map(|a| json!(a))
                .collect(),
        )),
    );
    put_str(&mut map, "MetricName", alarm.metric_name());
    put_str(&mut map, "Namespace", alarm.namespace());
    put_str(&mut map, "Statistic", alarm.statistic().map(|s| s.as_str()));
    put_str(&mut map, "ExtendedStatistic", alarm.extended_statistic());
    put_i32(&mut map, "Period", alarm.period());
    put_str(&mut map, "Unit", alarm.unit().map(|u| u.as_str()));
    put_i32(&mut map, "EvaluationPeriods", alarm.evaluation_periods());
    put_i32(&mut map, "DatapointsToAlarm", alarm.datapoints_to_alarm());
    put(&mut map, "Threshold", alarm.threshold().map(|t| json!(t)));
    put_str(
        &mut map,
        "ComparisonOperator",
        alarm.comparison_operator().map(|c| c.as_str()),
    );
    put_str(&mut map, "TreatMissingData", alarm.treat_missing_data());
    put_str(
        &mut map,
        "EvaluateLowSampleCountPercentile",
        alarm.evaluate_low_sample_count_percentile(),
    );
    put_str(&mut map, "ThresholdMetricId", alarm.threshold_metric_id());

    let dimensions: Vec<Value> = alarm
        .dimensions()
        .iter()
        .map(|d| json!({"Name": d.name(), "Value": d.value()}))
        .collect();
    map.insert("Dimensions".to_string(), Value::Array(dimensions));

    if !alarm.metrics().is_empty() {
        let metrics: Vec<Value> = alarm.metrics().iter().map(metric_data_query_to_json).collect();
        map.insert("Metrics".to_string(), Value::Array(metrics));
    }

    Value::Object(map)
}

fn metric_data_query_to_json(query: &aws_sdk_cloudwatch::types::MetricDataQuery) -> Value {
    let mut map = Map::new();
    map.insert("Id".to_string(), Value::String(query.id().to_string()));
    put_str(&mut map, "Expression", query.expression());
    put_str(&mut map, "Label", query.label());
    put_bool(&mut map, "ReturnData", query.return_data());
    put_i32(&mut map, "Period", query.period());
    if let Some(stat) = query.metric_stat() {
        let mut s = Map::new();
        s.insert("Period".to_string(), json!(stat.period()));
        s.insert("Stat".to_string(), Value::String(stat.stat().to_string()));
        put_str(&mut s, "Unit", stat.unit().map(|u| u.as_str()));
        let metric = stat.metric();
        let mut m = Map::new();
        put_str(&mut m, "Namespace", metric.namespace());
        put_str(&mut m, "MetricName", metric.metric_name());
        let dimensions: Vec<Value> = metric
            .dimensions()
            .iter()
            .map(|d| json!({"Name": d.name(), "Value": d.value()}))
            .collect();
        m.insert("Dimensions".to_string(), Value::Array(dimensions));
        s.insert("Metric".to_string(), Value::Object(m));
        map.insert("MetricStat".to_string(), Value::Object(s));
    }
    Value::Object(map)
}
