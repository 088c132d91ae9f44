//! EC2 spot converter command line
//!
//! Converts EC2 instances back and forth between on-demand and persistent
//! spot billing models while preserving network attributes (private IPs,
//! Elastic IPs), storage (volumes) and instance configuration. Also
//! replaces spot instances with new ones to change the instance type or
//! CPU options.

mod report;
mod review;

use anyhow::{bail, Context, Result};
use aws_config::retry::RetryConfig;
use aws_config::BehaviorVersion;
use clap::Parser;
use colored::Colorize;
use report::TerminalReporter;
use spot_converter_cloud::AwsCloud;
use spot_converter_core::record::CpuOptionsRequest;
use spot_converter_core::store::EnsureTable;
use spot_converter_core::{
    BillingModel, ConversionRequest, Executor, RecordStore, RunControls, RunSummary,
};
use spot_converter_store::DynamoStore;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "ec2-spot-converter",
    version,
    about = "Convert EC2 instances between on-demand and spot billing models, or replace an \
             instance with a different instance type, while preserving its attributes."
)]
struct Cli {
    /// The id of the EC2 instance to convert.
    #[arg(short = 'i', long, value_name = "ID")]
    instance_id: Option<String>,

    /// The expected billing model after conversion.
    #[arg(
        short = 'm',
        long,
        value_name = "MODEL",
        value_parser = ["spot", "on-demand"],
        default_value = "spot"
    )]
    target_billing_model: String,

    /// The expected instance type (ex: m5.large) after conversion.
    #[arg(short = 't', long, value_name = "TYPE")]
    target_instance_type: Option<String>,

    /// Instance CPU options as JSON ({"CoreCount":N,"ThreadsPerCore":M});
    /// the special value 'ignore' leaves CPU options out of the new launch
    /// specification.
    #[arg(long, value_name = "JSON")]
    cpu_options: Option<String>,

    /// Maximum hourly price for the spot target. Default: on-demand price.
    #[arg(long, value_name = "FLOAT")]
    max_spot_price: Option<f64>,

    /// KMS key (id, alias or ARN) used to encrypt the volumes carried by
    /// the backup AMI that are not already encrypted.
    #[arg(long, value_name = "KMSID")]
    volume_kms_key_id: Option<String>,

    /// Do not copy user data onto the converted instance.
    #[arg(long)]
    ignore_userdata: bool,

    /// Do not copy hibernation options onto the converted instance.
    #[arg(long)]
    ignore_hibernation_options: bool,

    /// Stop the instance instead of failing because it is running.
    #[arg(short = 's', long)]
    stop_instance: bool,

    /// Reboot the new instance when volumes had to be attached after boot.
    #[arg(long)]
    reboot_if_needed: bool,

    /// Allow conversion while the instance is running (NOT RECOMMENDED).
    #[arg(long)]
    do_not_require_stopped_instance: bool,

    /// Preserve target-group registrations. Without values, every
    /// instance-type target group in the region is inspected.
    #[arg(long, value_name = "ARN", num_args = 0..)]
    check_targetgroups: Option<Vec<String>>,

    /// Wait for target-group registrations to reach the given states at
    /// the end of the conversion. Without values: unused, healthy.
    #[arg(
        long,
        value_name = "STATE",
        num_args = 0..,
        value_parser = ["unused", "unhealthy", "healthy", "initial", "draining"]
    )]
    wait_for_tg_states: Option<Vec<String>>,

    /// Update CloudWatch alarms referencing the converted instance id.
    /// Optional name prefixes narrow the lookup; without values (or with
    /// '*') every alarm in the account is searched.
    #[arg(long, value_name = "PREFIX", num_args = 0..)]
    update_cw_alarms: Option<Vec<String>>,

    /// Delete the backup AMI (and its snapshots) at end of conversion.
    #[arg(long)]
    delete_ami: bool,

    /// DynamoDB table holding conversion states.
    #[arg(long, value_name = "NAME", default_value = "ec2-spot-converter-state-table")]
    dynamodb_tablename: String,

    /// Create the DynamoDB state table and exit.
    #[arg(long)]
    generate_dynamodb_table: bool,

    /// Start a conversion even when the tool suggests it is not needed.
    #[arg(short = 'f', long)]
    force: bool,

    /// Do not pause 10 seconds on major warnings.
    #[arg(long)]
    do_not_pause_on_major_warnings: bool,

    /// (DANGEROUS) Force the state machine back to the given step.
    #[arg(long, value_name = "STEP_NAME")]
    reset_step: Option<String>,

    /// Display the conversion result side by side (requires vim).
    #[arg(short = 'r', long)]
    review_conversion_result: bool,

    /// Turn on debug traces.
    #[arg(short = 'd', long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default_filter = if debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug)
        .init();
}

fn parse_cpu_options(raw: Option<&str>) -> Result<CpuOptionsRequest> {
    match raw {
        None => Ok(CpuOptionsRequest::Inherit),
        Some("ignore") => Ok(CpuOptionsRequest::Ignore),
        Some(json) => {
            let options = serde_json::from_str(json).context(
                "failed to process '--cpu-options': must be JSON like \
                 {\"CoreCount\":2,\"ThreadsPerCore\":1} or the special value 'ignore'",
            )?;
            Ok(CpuOptionsRequest::Explicit(options))
        }
    }
}

fn conversion_request(cli: &Cli) -> Result<ConversionRequest> {
    Ok(ConversionRequest {
        target_billing_model: cli
            .target_billing_model
            .parse::<BillingModel>()
            .map_err(anyhow::Error::msg)?,
        target_instance_type: cli.target_instance_type.clone(),
        cpu_options: parse_cpu_options(cli.cpu_options.as_deref())?,
        max_spot_price: cli.max_spot_price,
        volume_kms_key_id: cli.volume_kms_key_id.clone(),
        ignore_userdata: cli.ignore_userdata,
        ignore_hibernation_options: cli.ignore_hibernation_options,
        stop_instance: cli.stop_instance,
        do_not_require_stopped_instance: cli.do_not_require_stopped_instance,
        reboot_if_needed: cli.reboot_if_needed,
        target_group_arns: cli.check_targetgroups.clone(),
        wait_for_tg_states: cli.wait_for_tg_states.clone(),
        cw_alarm_prefixes: cli.update_cw_alarms.clone(),
    })
}

/// Elapsed wall-clock seconds between the record's start and end dates.
fn elapsed_seconds(summary: &RunSummary) -> Option<i64> {
    let parse = |raw: &str| chrono::DateTime::parse_from_rfc3339(raw).ok();
    let start = summary.record.start_date.as_deref().and_then(parse)?;
    let end = summary.record.end_date.as_deref().and_then(parse)?;
    Some((end - start).num_seconds())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = aws_config::defaults(BehaviorVersion::latest())
        .retry_config(RetryConfig::standard().with_max_attempts(5))
        .load()
        .await;
    if config.region().is_none() {
        bail!(
            "please specify an AWS region (either with the AWS_DEFAULT_REGION environment \
             variable or a CLI profile)"
        );
    }

    let store = DynamoStore::new(&config, &cli.dynamodb_tablename);
    if cli.generate_dynamodb_table {
        match store.ensure_table().await? {
            EnsureTable::Created => {
                println!("Created DynamoDB table '{}'.", store.table_name())
            }
            EnsureTable::AlreadyExists => {
                println!("DynamoDB table '{}' already exists.", store.table_name())
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let instance_id = cli
        .instance_id
        .clone()
        .context("--instance-id is required")?;
    let request = conversion_request(&cli)?;
    let controls = RunControls {
        force: cli.force,
        delete_ami: cli.delete_ami,
        do_not_pause_on_major_warnings: cli.do_not_pause_on_major_warnings,
        reset_step: cli.reset_step.clone(),
    };

    let cloud = AwsCloud::from_config(&config);
    let reporter = TerminalReporter::new();
    let executor = Executor::new(&cloud, &store, &reporter);
    let summary = executor.run(&instance_id, request, controls).await?;

    if let Some(new_instance_id) = &summary.record.new_instance_id {
        let elapsed = elapsed_seconds(&summary)
            .map(|s| format!(", elapsed time: {s}s"))
            .unwrap_or_default();
        println!(
            "{} New instance id: {new_instance_id}{elapsed}",
            "Conversion successful!".green().bold()
        );
    }
    for warning in &summary.warnings {
        eprintln!("{} {warning}", "/!\\ WARNING /!\\".red().bold());
    }

    if cli.review_conversion_result {
        review::review(&summary.record)?;
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", "ERROR:".red().bold());
            ExitCode::FAILURE
        }
    }
}
