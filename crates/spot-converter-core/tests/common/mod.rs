//! In-memory cloud world and test doubles for the conversion scenarios

use async_trait::async_trait;
use serde_json::{json, Value};
use spot_converter_core::cloud::{
    AddressView, CloudApi, CloudError, EniAttachment, EniView, ImageView, SpotRequestView, Tag,
    TargetHealthView, VolumeAttachment, VolumeDetail,
};
use spot_converter_core::error::{ConvertError, Result as ConvertResult};
use spot_converter_core::projector::LaunchSpec;
use spot_converter_core::record::JobRecord;
use spot_converter_core::store::{memory::MemoryStore, EnsureTable, RecordStore};
use spot_converter_core::Reporter;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct MockMapping {
    pub device: String,
    pub volume_id: String,
    pub delete_on_termination: bool,
}

#[derive(Debug, Clone)]
pub struct MockInstance {
    pub state: String,
    /// (target state, describes remaining before it lands)
    pub transition: Option<(String, u32)>,
    pub instance_type: String,
    pub architecture: String,
    pub root_device: String,
    pub mappings: Vec<MockMapping>,
    pub eni_ids: Vec<String>,
    pub tags: Vec<Tag>,
    pub spot_request_id: Option<String>,
    pub cpu_options: Option<(i64, i64)>,
    pub shutdown_behavior: Option<String>,
    pub cpu_credits: Option<String>,
}

impl Default for MockInstance {
    fn default() -> Self {
        Self {
            state: "running".to_string(),
            transition: None,
            instance_type: "t3.large".to_string(),
            architecture: "x86_64".to_string(),
            root_device: "/dev/xvda".to_string(),
            mappings: Vec::new(),
            eni_ids: Vec::new(),
            tags: vec![Tag::new("Name", "converted-host")],
            spot_request_id: None,
            cpu_options: Some((2, 2)),
            shutdown_behavior: None,
            cpu_credits: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockVolume {
    pub state: String,
    pub size: i32,
    pub volume_type: String,
    pub iops: Option<i32>,
    pub throughput: Option<i32>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub multi_attach: bool,
    pub attachments: Vec<VolumeAttachment>,
    pub tags: Vec<Tag>,
}

impl Default for MockVolume {
    fn default() -> Self {
        Self {
            state: "in-use".to_string(),
            size: 32,
            volume_type: "gp3".to_string(),
            iops: Some(3000),
            throughput: Some(125),
            encrypted: false,
            kms_key_id: None,
            multi_attach: false,
            attachments: Vec::new(),
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockEni {
    pub status: String,
    pub attachment: Option<EniAttachment>,
    pub private_ips: Vec<String>,
    pub subnet_id: String,
    pub groups: Vec<String>,
    pub source_dest_check: bool,
    pub public_ip: Option<String>,
}

impl Default for MockEni {
    fn default() -> Self {
        Self {
            status: "in-use".to_string(),
            attachment: None,
            private_ips: vec!["10.0.0.5".to_string()],
            subnet_id: "subnet-1".to_string(),
            groups: vec!["sg-1".to_string()],
            source_dest_check: true,
            public_ip: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockAddress {
    pub allocation_id: String,
    pub association_id: Option<String>,
    pub public_ip: String,
    pub private_ip: Option<String>,
    pub eni_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MockImage {
    pub name: String,
    pub state: String,
    /// Describes remaining before the image leaves `pending`
    pub ready_countdown: u32,
    /// Terminal state the countdown lands on (`available` or `failed`)
    pub final_state: String,
    pub snapshot_ids: Vec<String>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone)]
pub struct MockSpotRequest {
    pub state: String,
    pub request_type: String,
    pub price: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MockTargetGroup {
    /// (instance id, port) -> health state
    pub targets: BTreeMap<(String, i32), String>,
}

#[derive(Default)]
pub struct World {
    pub instances: BTreeMap<String, MockInstance>,
    pub volumes: BTreeMap<String, MockVolume>,
    pub enis: BTreeMap<String, MockEni>,
    pub addresses: Vec<MockAddress>,
    pub images: BTreeMap<String, MockImage>,
    pub snapshots: BTreeSet<String>,
    pub spot_requests: BTreeMap<String, MockSpotRequest>,
    pub target_groups: BTreeMap<String, MockTargetGroup>,
    pub alarms: BTreeMap<String, Value>,
    pub user_data: BTreeMap<String, String>,
    pub termination_protected: BTreeSet<String>,
    pub kms_keys: BTreeMap<String, String>,
    /// Every launch spec passed to `run_instance`, in order
    pub launched: Vec<LaunchSpec>,
    /// Health state a fresh target-group registration lands in
    pub registration_state: String,
    /// Describes a fresh image needs before leaving `pending`
    pub image_ready_delay: u32,
    next_instance: u32,
    next_volume: u32,
    next_image: u32,
    next_snapshot: u32,
    next_attachment: u32,
    next_association: u32,
}

impl World {
    fn next_id(counter: &mut u32, prefix: &str) -> String {
        *counter += 1;
        format!("{prefix}{counter:04}")
    }

    fn step_transition(&mut self, instance_id: &str) {
        if let Some(instance) = self.instances.get_mut(instance_id) {
            if let Some((target, remaining)) = instance.transition.take() {
                if remaining <= 1 {
                    instance.state = target;
                } else {
                    instance.transition = Some((target, remaining - 1));
                }
            }
        }
    }

    fn render_instance(&self, instance_id: &str) -> Option<Value> {
        let instance = self.instances.get(instance_id)?;

        let mappings: Vec<Value> = instance
            .mappings
            .iter()
            .map(|m| {
                json!({
                    "DeviceName": m.device,
                    "Ebs": {
                        "VolumeId": m.volume_id,
                        "DeleteOnTermination": m.delete_on_termination,
                    }
                })
            })
            .collect();

        let interfaces: Vec<Value> = instance
            .eni_ids
            .iter()
            .enumerate()
            .filter_map(|(index, eni_id)| {
                let eni = self.enis.get(eni_id)?;
                let mut row = json!({
                    "NetworkInterfaceId": eni_id,
                    "SubnetId": eni.subnet_id,
                    "SourceDestCheck": eni.source_dest_check,
                    "Status": eni.status,
                    "PrivateIpAddress": eni.private_ips.first().cloned().unwrap_or_default(),
                    "Groups": eni.groups.iter()
                        .map(|g| json!({"GroupId": g}))
                        .collect::<Vec<_>>(),
                    "PrivateIpAddresses": eni.private_ips.iter().enumerate()
                        .map(|(i, ip)| json!({"PrivateIpAddress": ip, "Primary": i == 0}))
                        .collect::<Vec<_>>(),
                });
                if let Some(attachment) = &eni.attachment {
                    row["Attachment"] = json!({
                        "AttachmentId": attachment.attachment_id,
                        "DeviceIndex": attachment.device_index,
                        "DeleteOnTermination": attachment.delete_on_termination,
                    });
                } else {
                    row["Attachment"] = json!({
                        "AttachmentId": format!("eni-attach-missing-{index}"),
                        "DeviceIndex": index,
                        "DeleteOnTermination": false,
                    });
                }
                if let Some(public_ip) = &eni.public_ip {
                    row["Association"] = json!({"PublicIp": public_ip});
                }
                Some(row)
            })
            .collect();

        let mut rendered = json!({
            "InstanceId": instance_id,
            "InstanceType": instance.instance_type,
            "Architecture": instance.architecture,
            "RootDeviceName": instance.root_device,
            "State": {"Name": instance.state},
            "Placement": {"AvailabilityZone": "eu-west-1a", "Tenancy": "default", "GroupName": ""},
            "Monitoring": {"State": "disabled"},
            "EbsOptimized": false,
            "HibernationOptions": {"Configured": false},
            "BlockDeviceMappings": mappings,
            "NetworkInterfaces": interfaces,
            "Tags": instance.tags.iter()
                .map(|t| json!({"Key": t.key, "Value": t.value}))
                .collect::<Vec<_>>(),
        });
        if let Some((cores, threads)) = instance.cpu_options {
            rendered["CpuOptions"] = json!({"CoreCount": cores, "ThreadsPerCore": threads});
        }
        if let Some(request_id) = &instance.spot_request_id {
            rendered["SpotInstanceRequestId"] = json!(request_id);
        }
        Some(rendered)
    }

    /// Complete a termination: release the preserved interfaces, drop the
    /// lifecycle volumes and disassociate elastic IPs, like EC2 does.
    fn finish_termination(&mut self, instance_id: &str) {
        let Some(instance) = self.instances.get_mut(instance_id) else {
            return;
        };
        instance.state = "terminated".to_string();
        instance.transition = None;
        let mappings = std::mem::take(&mut instance.mappings);
        let eni_ids = instance.eni_ids.clone();

        for mapping in mappings {
            if mapping.delete_on_termination {
                self.volumes.remove(&mapping.volume_id);
            } else if let Some(volume) = self.volumes.get_mut(&mapping.volume_id) {
                volume.attachments.retain(|a| a.instance_id != instance_id);
                if volume.attachments.is_empty() && !volume.multi_attach {
                    volume.state = "available".to_string();
                }
            }
        }
        for eni_id in eni_ids {
            if let Some(eni) = self.enis.get_mut(&eni_id) {
                eni.status = "available".to_string();
                eni.attachment = None;
                eni.public_ip = None;
            }
        }
        for address in &mut self.addresses {
            if address
                .eni_id
                .as_ref()
                .map(|eni_id| {
                    self.enis
                        .get(eni_id)
                        .map(|eni| eni.status == "available")
                        .unwrap_or(false)
                })
                .unwrap_or(false)
            {
                address.association_id = None;
                address.eni_id = None;
                address.private_ip = None;
            }
        }
    }

    fn tag_resource(&mut self, resource_id: &str, tags: &[Tag]) {
        let apply = |existing: &mut Vec<Tag>| {
            for tag in tags {
                if let Some(slot) = existing.iter_mut().find(|t| t.key == tag.key) {
                    slot.value = tag.value.clone();
                } else {
                    existing.push(tag.clone());
                }
            }
        };
        if let Some(instance) = self.instances.get_mut(resource_id) {
            apply(&mut instance.tags);
        } else if let Some(volume) = self.volumes.get_mut(resource_id) {
            apply(&mut volume.tags);
        } else if let Some(image) = self.images.get_mut(resource_id) {
            apply(&mut image.tags);
        }
        // ENIs accept tags too; the scenarios only assert their removal.
    }

    fn untag_resource(&mut self, resource_id: &str, keys: &[String]) {
        let strip = |existing: &mut Vec<Tag>| existing.retain(|t| !keys.contains(&t.key));
        if let Some(instance) = self.instances.get_mut(resource_id) {
            strip(&mut instance.tags);
        } else if let Some(volume) = self.volumes.get_mut(resource_id) {
            strip(&mut volume.tags);
        } else if let Some(image) = self.images.get_mut(resource_id) {
            strip(&mut image.tags);
        }
    }
}

/// In-memory `CloudApi`
pub struct MockCloud {
    pub world: Mutex<World>,
}

impl MockCloud {
    pub fn new(world: World) -> Self {
        Self {
            world: Mutex::new(world),
        }
    }

    pub fn with_world<T>(&self, f: impl FnOnce(&mut World) -> T) -> T {
        f(&mut self.world.lock().unwrap())
    }
}

fn not_found(what: impl Into<String>) -> CloudError {
    CloudError::NotFound(what.into())
}

#[async_trait]
impl CloudApi for MockCloud {
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<Value>, CloudError> {
        let mut world = self.world.lock().unwrap();
        world.step_transition(instance_id);
        Ok(world.render_instance(instance_id))
    }

    async fn describe_instance_user_data(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, CloudError> {
        let world = self.world.lock().unwrap();
        Ok(world.user_data.get(instance_id).cloned())
    }

    async fn describe_instance_shutdown_behavior(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, CloudError> {
        let world = self.world.lock().unwrap();
        Ok(world
            .instances
            .get(instance_id)
            .and_then(|i| i.shutdown_behavior.clone()))
    }

    async fn describe_instance_credit_specification(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, CloudError> {
        let world = self.world.lock().unwrap();
        Ok(world
            .instances
            .get(instance_id)
            .and_then(|i| i.cpu_credits.clone()))
    }

    async fn termination_protection(&self, instance_id: &str) -> Result<bool, CloudError> {
        let world = self.world.lock().unwrap();
        Ok(world.termination_protected.contains(instance_id))
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        let orphaned = world
            .instances
            .get(instance_id)
            .and_then(|i| i.spot_request_id.as_ref())
            .and_then(|id| world.spot_requests.get(id))
            .map(|r| r.state == "cancelled")
            .unwrap_or(false);
        if orphaned {
            return Err(CloudError::api(
                "IncorrectSpotRequestState",
                format!("spot request of {instance_id} is cancelled, the instance cannot stop"),
            ));
        }
        let instance = world
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| not_found(instance_id))?;
        instance.state = "stopping".to_string();
        instance.transition = Some(("stopped".to_string(), 2));
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        if !world.instances.contains_key(instance_id) {
            return Err(not_found(instance_id));
        }
        world.finish_termination(instance_id);
        Ok(())
    }

    async fn reboot_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        let world = self.world.lock().unwrap();
        if world.instances.contains_key(instance_id) {
            Ok(())
        } else {
            Err(not_found(instance_id))
        }
    }

    async fn run_instance(
        &self,
        spec: &LaunchSpec,
        extra_tags: &[Tag],
    ) -> Result<String, CloudError> {
        let mut world = self.world.lock().unwrap();

        for binding in &spec.network_interfaces {
            let eni = world
                .enis
                .get(&binding.eni_id)
                .ok_or_else(|| not_found(&binding.eni_id))?;
            if eni.status != "available" {
                return Err(CloudError::api(
                    "InvalidNetworkInterface.InUse",
                    format!("interface {} is currently in use", binding.eni_id),
                ));
            }
        }
        if !world.images.contains_key(&spec.image_id) {
            return Err(not_found(&spec.image_id));
        }

        let instance_id = World::next_id(&mut world.next_instance, "i-new");
        let mut mappings = Vec::new();
        for blk in &spec.block_device_mappings {
            let volume_id = World::next_id(&mut world.next_volume, "vol-new");
            world.volumes.insert(
                volume_id.clone(),
                MockVolume {
                    state: "in-use".to_string(),
                    size: blk.volume_size,
                    volume_type: blk.volume_type.clone(),
                    iops: blk.iops,
                    throughput: blk.throughput,
                    encrypted: blk.encrypted.unwrap_or(false),
                    kms_key_id: blk.kms_key_arn.clone(),
                    multi_attach: false,
                    attachments: vec![VolumeAttachment {
                        instance_id: instance_id.clone(),
                        device: blk.device_name.clone(),
                        delete_on_termination: blk.delete_on_termination,
                    }],
                    tags: Vec::new(),
                },
            );
            mappings.push(MockMapping {
                device: blk.device_name.clone(),
                volume_id,
                delete_on_termination: blk.delete_on_termination,
            });
        }

        let mut eni_ids = Vec::new();
        for binding in &spec.network_interfaces {
            let attachment_id = World::next_id(&mut world.next_attachment, "eni-attach-");
            let eni = world.enis.get_mut(&binding.eni_id).expect("checked above");
            eni.status = "in-use".to_string();
            // EC2 attaches referenced interfaces with DeleteOnTermination
            // left false; the conversion restores the original value later.
            eni.attachment = Some(EniAttachment {
                attachment_id,
                instance_id: Some(instance_id.clone()),
                device_index: binding.device_index,
                delete_on_termination: false,
            });
            eni_ids.push(binding.eni_id.clone());
        }

        let mut tags: Vec<Tag> = spec.tags.clone();
        for tag in extra_tags {
            tags.push(tag.clone());
        }

        world.instances.insert(
            instance_id.clone(),
            MockInstance {
                state: "pending".to_string(),
                transition: Some(("running".to_string(), 1)),
                instance_type: spec.instance_type.clone(),
                architecture: "x86_64".to_string(),
                root_device: spec
                    .block_device_mappings
                    .first()
                    .map(|b| b.device_name.clone())
                    .unwrap_or_else(|| "/dev/xvda".to_string()),
                mappings,
                eni_ids,
                tags,
                spot_request_id: None,
                cpu_options: spec.cpu_options.map(|c| (c.core_count, c.threads_per_core)),
                shutdown_behavior: spec.shutdown_behavior.clone(),
                cpu_credits: spec.credit_specification.clone(),
            },
        );
        world.launched.push(spec.clone());
        Ok(instance_id)
    }

    async fn find_instances_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<Value>, CloudError> {
        let world = self.world.lock().unwrap();
        let ids: Vec<String> = world
            .instances
            .iter()
            .filter(|(_, instance)| {
                instance
                    .tags
                    .iter()
                    .any(|t| t.key == key && t.value == value)
            })
            .map(|(id, _)| id.clone())
            .collect();
        Ok(ids
            .iter()
            .filter_map(|id| world.render_instance(id))
            .collect())
    }

    async fn describe_volumes(
        &self,
        volume_ids: &[String],
    ) -> Result<Vec<VolumeDetail>, CloudError> {
        let world = self.world.lock().unwrap();
        let mut result = Vec::new();
        for volume_id in volume_ids {
            let volume = world
                .volumes
                .get(volume_id)
                .ok_or_else(|| not_found(volume_id))?;
            result.push(VolumeDetail {
                volume_id: volume_id.clone(),
                state: volume.state.clone(),
                size_gib: volume.size,
                volume_type: volume.volume_type.clone(),
                iops: volume.iops,
                throughput: volume.throughput,
                encrypted: volume.encrypted,
                kms_key_id: volume.kms_key_id.clone(),
                multi_attach_enabled: volume.multi_attach,
                attachments: volume.attachments.clone(),
                tags: volume.tags.clone(),
            });
        }
        Ok(result)
    }

    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        _device: &str,
    ) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        if let Some(instance) = world.instances.get_mut(instance_id) {
            instance.mappings.retain(|m| m.volume_id != volume_id);
        }
        let volume = world
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found(volume_id))?;
        volume.attachments.retain(|a| a.instance_id != instance_id);
        if volume.attachments.is_empty() && !volume.multi_attach {
            volume.state = "available".to_string();
        }
        Ok(())
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        let volume = world
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found(volume_id))?;
        volume.state = "in-use".to_string();
        volume.attachments.push(VolumeAttachment {
            instance_id: instance_id.to_string(),
            device: device.to_string(),
            delete_on_termination: false,
        });
        let instance = world
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| not_found(instance_id))?;
        instance.mappings.push(MockMapping {
            device: device.to_string(),
            volume_id: volume_id.to_string(),
            delete_on_termination: false,
        });
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        world
            .volumes
            .remove(volume_id)
            .map(|_| ())
            .ok_or_else(|| not_found(volume_id))
    }

    async fn create_image(
        &self,
        name: &str,
        instance_id: &str,
        mappings: &[spot_converter_core::projector::AmiBlockDevice],
    ) -> Result<String, CloudError> {
        let mut world = self.world.lock().unwrap();
        if !world.instances.contains_key(instance_id) {
            return Err(not_found(instance_id));
        }
        if world.images.values().any(|image| image.name == name) {
            return Err(CloudError::api(
                "InvalidAMIName.Duplicate",
                format!("AMI name '{name}' is already in use"),
            ));
        }
        let image_id = World::next_id(&mut world.next_image, "ami-");
        let snapshot_ids: Vec<String> = mappings
            .iter()
            .map(|_| World::next_id(&mut world.next_snapshot, "snap-"))
            .collect();
        for snapshot_id in &snapshot_ids {
            world.snapshots.insert(snapshot_id.clone());
        }
        let ready_countdown = world.image_ready_delay;
        world.images.insert(
            image_id.clone(),
            MockImage {
                name: name.to_string(),
                state: "pending".to_string(),
                ready_countdown,
                final_state: "available".to_string(),
                snapshot_ids,
                tags: Vec::new(),
            },
        );
        Ok(image_id)
    }

    async fn find_image_by_name(&self, name: &str) -> Result<Option<ImageView>, CloudError> {
        let world = self.world.lock().unwrap();
        Ok(world.images.iter().find(|(_, image)| image.name == name).map(
            |(image_id, image)| ImageView {
                image_id: image_id.clone(),
                state: image.state.clone(),
                snapshot_ids: image.snapshot_ids.clone(),
            },
        ))
    }

    async fn describe_image(&self, image_id: &str) -> Result<Option<ImageView>, CloudError> {
        let mut world = self.world.lock().unwrap();
        let Some(image) = world.images.get_mut(image_id) else {
            return Ok(None);
        };
        if image.state == "pending" {
            if image.ready_countdown <= 1 {
                image.state = image.final_state.clone();
            } else {
                image.ready_countdown -= 1;
            }
        }
        Ok(Some(ImageView {
            image_id: image_id.to_string(),
            state: image.state.clone(),
            snapshot_ids: image.snapshot_ids.clone(),
        }))
    }

    async fn deregister_image(&self, image_id: &str) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        world
            .images
            .remove(image_id)
            .map(|_| ())
            .ok_or_else(|| not_found(image_id))
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        if world.snapshots.remove(snapshot_id) {
            Ok(())
        } else {
            Err(not_found(snapshot_id))
        }
    }

    async fn describe_network_interfaces(
        &self,
        eni_ids: &[String],
    ) -> Result<Vec<EniView>, CloudError> {
        let world = self.world.lock().unwrap();
        let mut result = Vec::new();
        for eni_id in eni_ids {
            let eni = world.enis.get(eni_id).ok_or_else(|| not_found(eni_id))?;
            result.push(EniView {
                eni_id: eni_id.clone(),
                status: eni.status.clone(),
                attachment: eni.attachment.clone(),
                private_ips: eni.private_ips.clone(),
                security_group_ids: eni.groups.clone(),
                subnet_id: eni.subnet_id.clone(),
                source_dest_check: eni.source_dest_check,
                association_public_ip: eni.public_ip.clone(),
            });
        }
        Ok(result)
    }

    async fn set_eni_delete_on_termination(
        &self,
        eni_id: &str,
        attachment_id: &str,
        delete_on_termination: bool,
    ) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        let eni = world.enis.get_mut(eni_id).ok_or_else(|| not_found(eni_id))?;
        match &mut eni.attachment {
            Some(attachment) if attachment.attachment_id == attachment_id => {
                attachment.delete_on_termination = delete_on_termination;
                Ok(())
            }
            _ => Err(CloudError::api(
                "InvalidAttachmentID.NotFound",
                format!("attachment {attachment_id} not present on {eni_id}"),
            )),
        }
    }

    async fn describe_addresses(&self) -> Result<Vec<AddressView>, CloudError> {
        let world = self.world.lock().unwrap();
        Ok(world
            .addresses
            .iter()
            .map(|address| AddressView {
                allocation_id: address.allocation_id.clone(),
                association_id: address.association_id.clone(),
                public_ip: address.public_ip.clone(),
                private_ip: address.private_ip.clone(),
                network_interface_id: address.eni_id.clone(),
            })
            .collect())
    }

    async fn associate_address(
        &self,
        allocation_id: &str,
        eni_id: &str,
        private_ip: &str,
    ) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        let association_id = World::next_id(&mut world.next_association, "eipassoc-");
        let address = world
            .addresses
            .iter_mut()
            .find(|a| a.allocation_id == allocation_id)
            .ok_or_else(|| not_found(allocation_id))?;
        address.association_id = Some(association_id);
        address.eni_id = Some(eni_id.to_string());
        address.private_ip = Some(private_ip.to_string());
        let public_ip = address.public_ip.clone();
        let eni = world.enis.get_mut(eni_id).ok_or_else(|| not_found(eni_id))?;
        eni.public_ip = Some(public_ip);
        Ok(())
    }

    async fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &[Tag],
    ) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        for resource_id in resource_ids {
            world.tag_resource(resource_id, tags);
        }
        Ok(())
    }

    async fn delete_tags(
        &self,
        resource_ids: &[String],
        keys: &[String],
    ) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        for resource_id in resource_ids {
            world.untag_resource(resource_id, keys);
        }
        Ok(())
    }

    async fn describe_spot_request(
        &self,
        request_id: &str,
    ) -> Result<Option<SpotRequestView>, CloudError> {
        let world = self.world.lock().unwrap();
        Ok(world.spot_requests.get(request_id).map(|request| {
            SpotRequestView {
                request_id: request_id.to_string(),
                state: request.state.clone(),
                request_type: request.request_type.clone(),
                spot_price: request.price.clone(),
            }
        }))
    }

    async fn cancel_spot_request(&self, request_id: &str) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        let request = world
            .spot_requests
            .get_mut(request_id)
            .ok_or_else(|| not_found(request_id))?;
        request.state = "cancelled".to_string();
        Ok(())
    }

    async fn instance_target_groups(&self, arns: &[String]) -> Result<Vec<String>, CloudError> {
        let world = self.world.lock().unwrap();
        Ok(world
            .target_groups
            .keys()
            .filter(|arn| arns.is_empty() || arns.contains(arn))
            .cloned()
            .collect())
    }

    async fn describe_target_health(
        &self,
        arn: &str,
    ) -> Result<Vec<TargetHealthView>, CloudError> {
        let world = self.world.lock().unwrap();
        let group = world
            .target_groups
            .get(arn)
            .ok_or_else(|| not_found(arn))?;
        Ok(group
            .targets
            .iter()
            .map(|((instance_id, port), state)| TargetHealthView {
                instance_id: instance_id.clone(),
                port: *port,
                state: state.clone(),
            })
            .collect())
    }

    async fn target_health_of(
        &self,
        arn: &str,
        instance_id: &str,
        port: i32,
    ) -> Result<Option<String>, CloudError> {
        let world = self.world.lock().unwrap();
        let group = world
            .target_groups
            .get(arn)
            .ok_or_else(|| not_found(arn))?;
        Ok(group
            .targets
            .get(&(instance_id.to_string(), port))
            .cloned())
    }

    async fn register_target(
        &self,
        arn: &str,
        instance_id: &str,
        port: i32,
    ) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        let state = world.registration_state.clone();
        let group = world
            .target_groups
            .get_mut(arn)
            .ok_or_else(|| not_found(arn))?;
        group
            .targets
            .insert((instance_id.to_string(), port), state);
        Ok(())
    }

    async fn deregister_target(
        &self,
        arn: &str,
        instance_id: &str,
        port: i32,
    ) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        let group = world
            .target_groups
            .get_mut(arn)
            .ok_or_else(|| not_found(arn))?;
        group.targets.remove(&(instance_id.to_string(), port));
        Ok(())
    }

    async fn list_metric_alarms(
        &self,
        name_prefix: Option<&str>,
    ) -> Result<Vec<Value>, CloudError> {
        let world = self.world.lock().unwrap();
        Ok(world
            .alarms
            .iter()
            .filter(|(name, _)| {
                name_prefix
                    .map(|prefix| name.starts_with(prefix))
                    .unwrap_or(true)
            })
            .map(|(_, alarm)| alarm.clone())
            .collect())
    }

    async fn put_metric_alarm(&self, alarm: &Value) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        let name = alarm
            .get("AlarmName")
            .and_then(Value::as_str)
            .ok_or_else(|| CloudError::Transport("alarm without AlarmName".to_string()))?;
        world.alarms.insert(name.to_string(), alarm.clone());
        Ok(())
    }

    async fn resolve_kms_key_arn(&self, key_id: &str) -> Result<String, CloudError> {
        let world = self.world.lock().unwrap();
        world
            .kms_keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| not_found(key_id))
    }

    async fn describe_elastic_gpus(&self, _gpu_ids: &[String]) -> Result<Vec<Value>, CloudError> {
        Ok(Vec::new())
    }

    async fn describe_accelerator_type(
        &self,
        accelerator_id: &str,
    ) -> Result<String, CloudError> {
        Err(not_found(accelerator_id))
    }
}

/// Reporter that records everything for assertions
#[derive(Default)]
pub struct CollectingReporter {
    pub lines: Mutex<Vec<(String, String)>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, kind: &str, text: String) {
        self.lines.lock().unwrap().push((kind.to_string(), text));
    }

    pub fn count(&self, kind: &str) -> usize {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == kind)
            .count()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|(_, text)| text.contains(needle))
    }
}

impl Reporter for CollectingReporter {
    fn step_started(&self, index: usize, total: usize, description: &str) {
        self.push("started", format!("[STEP {index}/{total}] {description}"));
    }

    fn step_replayed(&self, index: usize, total: usize, description: &str, detail: Option<&str>) {
        self.push(
            "replayed",
            format!(
                "[STEP {index}/{total}] {description} ({})",
                detail.unwrap_or("")
            ),
        );
    }

    fn step_succeeded(&self, detail: &str) {
        self.push("succeeded", detail.to_string());
    }

    fn step_skipped(&self, detail: &str) {
        self.push("skipped", detail.to_string());
    }

    fn note(&self, message: &str) {
        self.push("note", message.to_string());
    }

    fn warning(&self, message: &str) {
        self.push("warning", message.to_string());
    }

    fn major_warning(&self, message: &str) {
        self.push("major", message.to_string());
    }
}

/// Store that fails the save following a chosen step's completion, then
/// behaves normally. Simulates dying between a side effect and its
/// checkpoint.
pub struct CrashingStore {
    pub inner: MemoryStore,
    crash_after_step: Mutex<Option<String>>,
}

impl CrashingStore {
    pub fn new(inner: MemoryStore, crash_after_step: &str) -> Self {
        Self {
            inner,
            crash_after_step: Mutex::new(Some(crash_after_step.to_string())),
        }
    }
}

#[async_trait]
impl RecordStore for CrashingStore {
    async fn ensure_table(&self) -> ConvertResult<EnsureTable> {
        self.inner.ensure_table().await
    }

    async fn load(&self, instance_id: &str) -> ConvertResult<Option<JobRecord>> {
        self.inner.load(instance_id).await
    }

    async fn save(&self, record: &JobRecord) -> ConvertResult<()> {
        let mut target = self.crash_after_step.lock().unwrap();
        if let Some(step) = target.as_deref() {
            if record.last_successful_step_name.as_deref() == Some(step) {
                target.take();
                return Err(ConvertError::Persistence(
                    "simulated crash before checkpoint save".to_string(),
                ));
            }
        }
        drop(target);
        self.inner.save(record).await
    }

    async fn delete(&self, instance_id: &str) -> ConvertResult<()> {
        self.inner.delete(instance_id).await
    }
}
