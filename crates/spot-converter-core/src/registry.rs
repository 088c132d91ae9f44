//! Step registry
//!
//! The canonical ordered list of conversion steps. The names are part of
//! the external contract: `--reset-step` accepts them, and the persisted
//! `last_successful_step_name` refers to them. Steps at or before
//! `checkpoint_instance_state` are fully reversible; everything after it
//! has destroyed external state that the tool cannot reconstruct.

use std::time::Duration;

/// Polling cadence and budget of a waiter step
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    const fn new(interval_secs: u64, timeout_secs: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

/// One entry of the step list
#[derive(Debug, Clone, Copy)]
pub struct StepDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    /// Present on waiter steps; `RetryLater` outcomes re-poll at this
    /// cadence until the budget runs out.
    pub poll: Option<PollPolicy>,
}

/// The step after which external state has been destroyed. `--reset-step`
/// refuses to cross back over it without `--force`.
pub const CHECKPOINT_STEP: &str = "checkpoint_instance_state";

const INSTANCE_POLL: PollPolicy = PollPolicy::new(15, 600);
const VOLUME_POLL: PollPolicy = PollPolicy::new(5, 300);
const IMAGE_POLL: PollPolicy = PollPolicy::new(30, 1200);
const RELEASE_POLL: PollPolicy = PollPolicy::new(5, 600);

static STEPS: &[StepDescriptor] = &[
    StepDescriptor {
        name: "read_state_table",
        description: "Read conversion state table...",
        poll: None,
    },
    StepDescriptor {
        name: "discover_instance_state",
        description: "Discover instance state...",
        poll: None,
    },
    StepDescriptor {
        name: "wait_stopped_instance",
        description: "Wait for expected instance state...",
        poll: Some(INSTANCE_POLL),
    },
    StepDescriptor {
        name: "tag_resources",
        description: "Tag all resources (instance, ENIs, volumes) with the job id...",
        poll: None,
    },
    StepDescriptor {
        name: "get_volume_details",
        description: "Get volume details...",
        poll: None,
    },
    StepDescriptor {
        name: "detach_volumes",
        description: "Detach instance volumes with DeleteOnTermination=false...",
        poll: None,
    },
    StepDescriptor {
        name: "wait_volume_detach",
        description: "Wait for volume detach status...",
        poll: Some(VOLUME_POLL),
    },
    StepDescriptor {
        name: "start_ami_creation",
        description: "Start AMI creation...",
        poll: None,
    },
    StepDescriptor {
        name: "prepare_network_interfaces",
        description: "Prepare network interfaces for instance disconnection...",
        poll: None,
    },
    StepDescriptor {
        name: "wait_ami_ready",
        description: "Wait for AMI to be ready...",
        poll: Some(IMAGE_POLL),
    },
    StepDescriptor {
        name: "checkpoint_instance_state",
        description: "Checkpoint the instance state...",
        poll: None,
    },
    StepDescriptor {
        name: "terminate_instance",
        description: "Terminate instance...",
        poll: None,
    },
    StepDescriptor {
        name: "wait_resource_release",
        description: "Wait for resource release...",
        poll: Some(RELEASE_POLL),
    },
    StepDescriptor {
        name: "create_new_instance",
        description: "Create new instance...",
        poll: None,
    },
    StepDescriptor {
        name: "wait_new_instance_running",
        description: "Wait for new instance to come up...",
        poll: Some(INSTANCE_POLL),
    },
    StepDescriptor {
        name: "reattach_volumes",
        description: "Reattach volumes...",
        poll: None,
    },
    StepDescriptor {
        name: "configure_network_interfaces",
        description: "Configure network interfaces...",
        poll: None,
    },
    StepDescriptor {
        name: "manage_elastic_ip",
        description: "Manage Elastic IPs...",
        poll: None,
    },
    StepDescriptor {
        name: "reboot_if_needed",
        description: "Reboot new instance (if needed and requested)...",
        poll: None,
    },
    StepDescriptor {
        name: "untag_resources",
        description: "Reconcile memberships and untag resources...",
        poll: None,
    },
    StepDescriptor {
        name: "deregister_image",
        description: "Deregister image...",
        poll: None,
    },
];

/// The full ordered step list.
pub fn steps() -> &'static [StepDescriptor] {
    STEPS
}

/// Position of a step in the list.
pub fn index_of(name: &str) -> Option<usize> {
    STEPS.iter().position(|s| s.name == name)
}

/// Descriptor lookup by name.
pub fn descriptor(name: &str) -> Option<&'static StepDescriptor> {
    STEPS.iter().find(|s| s.name == name)
}

/// Name of the step preceding `name`, or `None` for the first step.
pub fn previous_step(name: &str) -> Option<&'static str> {
    match index_of(name) {
        Some(0) | None => None,
        Some(idx) => Some(STEPS[idx - 1].name),
    }
}

/// True when the step runs after the point of no return.
pub fn is_post_checkpoint(name: &str) -> bool {
    match (index_of(name), index_of(CHECKPOINT_STEP)) {
        (Some(idx), Some(checkpoint)) => idx > checkpoint,
        _ => false,
    }
}
