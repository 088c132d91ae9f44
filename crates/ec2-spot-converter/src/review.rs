//! Side-by-side conversion review
//!
//! Writes the normalised original and final instance snapshots to temp
//! files and opens them in `vim -d`. Purely informational.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use spot_converter_core::JobRecord;
use std::io::Write;
use std::process::Command;

/// Sort the list-valued fields so both sides diff cleanly.
fn normalise(snapshot: &Value) -> Value {
    let mut snapshot = snapshot.clone();
    if let Some(interfaces) = snapshot
        .get_mut("NetworkInterfaces")
        .and_then(Value::as_array_mut)
    {
        interfaces.sort_by_key(|eni| {
            eni.pointer("/Attachment/DeviceIndex")
                .and_then(Value::as_i64)
                .unwrap_or(0)
        });
    }
    if let Some(tags) = snapshot.get_mut("Tags").and_then(Value::as_array_mut) {
        tags.sort_by_key(|t| {
            t.get("Key")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        });
    }
    if let Some(mappings) = snapshot
        .get_mut("BlockDeviceMappings")
        .and_then(Value::as_array_mut)
    {
        mappings.sort_by_key(|blk| {
            blk.get("DeviceName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        });
    }
    snapshot
}

fn write_snapshot(prefix: &str, snapshot: &Value) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".json")
        .tempfile()
        .context("creating review temp file")?;
    let body = serde_json::to_string_pretty(&normalise(snapshot))?;
    file.write_all(body.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Open the original and final instance states side by side in `vim -d`.
pub fn review(record: &JobRecord) -> Result<()> {
    let Some(original) = &record.original_instance_state else {
        bail!("the job record carries no original instance snapshot to review");
    };
    let Some(final_state) = &record.final_instance_state else {
        bail!("the job record carries no final instance snapshot to review");
    };

    let original_file = write_snapshot("original_instance-", original)?;
    let final_file = write_snapshot("new_instance-", final_state)?;

    let status = Command::new("vim")
        .arg("-c")
        .arg(":syntax off")
        .arg("-d")
        .arg(original_file.path())
        .arg(final_file.path())
        .status()
        .context("launching 'vim' (the review feature requires it)")?;
    if !status.success() {
        bail!("vim exited with {status}");
    }
    Ok(())
}
