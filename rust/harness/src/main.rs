//! HyperPod provisioning CLI
//!
//! Plans a cluster topology, writes its descriptors, creates the cluster and
//! waits for it to come into service.

use std::{path::PathBuf, time::Duration};

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use hyperpod_config::{RunMode, WorkloadManager, parse_yes_no};
use hyperpod_harness::{
    cloud::{AwsCli, CloudControl},
    config::ConfigDocument,
    descriptor::{Descriptors, role_of},
    environment::FALLBACK_REGION,
    pipeline::{OrchestrationPipeline, PipelineOptions, PipelineReport, wait_for_cluster},
    poller::{PollSpec, ThreadSleeper},
    source::{ConfigSource, Prompter, StdinPrompter},
    state::Stage,
};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hyperpod", about = "HyperPod cluster provisioning")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// Declarative config file (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Prompt for missing values, or take file values and defaults only
    #[arg(long, value_enum, default_value_t = RunMode::Interactive)]
    mode: RunMode,

    /// Directory for generated descriptors
    #[arg(short, long, default_value = "generated")]
    output_dir: PathBuf,

    /// Lifecycle scripts to stage (overrides `lifecycle_dir`)
    #[arg(long)]
    lifecycle_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = WorkloadManager::Slurm)]
    workload_manager: WorkloadManager,

    #[command(flatten)]
    poll: PollArgs,
}

#[derive(Args, Clone, Copy)]
struct PollArgs {
    /// Seconds between status checks
    #[arg(long, default_value_t = 30)]
    poll_interval: u64,

    /// Seconds to wait for the cluster before giving up
    #[arg(long, default_value_t = 3600)]
    timeout: u64,

    /// Seconds to wait for a CloudFormation stack
    #[arg(long, default_value_t = 1800)]
    stack_timeout: u64,
}

impl PollArgs {
    fn cluster(self) -> PollSpec {
        PollSpec::cluster(
            Duration::from_secs(self.poll_interval),
            Duration::from_secs(self.timeout),
        )
    }

    fn stack(self) -> PollSpec {
        PollSpec::stack(
            Duration::from_secs(self.poll_interval),
            Duration::from_secs(self.stack_timeout),
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Plan, create and wait for a cluster
    Create {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Plan and write descriptors without touching the cloud
    Plan {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Validate descriptors previously written to a directory
    Check {
        #[arg(default_value = "generated")]
        dir: PathBuf,
    },

    /// Show a cluster's status
    Status {
        cluster: String,
        #[arg(long)]
        region: Option<String>,
    },

    /// Wait for a cluster to come into service
    Wait {
        cluster: String,
        #[arg(long)]
        region: Option<String>,
        #[command(flatten)]
        poll: PollArgs,
    },

    /// Delete a cluster
    Delete {
        cluster: String,
        #[arg(long)]
        region: Option<String>,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber the spinner
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Create { run } => run_pipeline(run, false),
        Commands::Plan { run } => run_pipeline(run, true),

        Commands::Check { dir } => {
            let descriptors = Descriptors::read_from_dir(&dir)?;
            descriptors.validate()?;
            println!("=== {} ===", descriptors.cluster.cluster_name);
            for group in &descriptors.cluster.instance_groups {
                println!(
                    "  {} [{}] {} x{}",
                    group.instance_group_name,
                    role_of(&descriptors, &group.instance_group_name),
                    group.instance_type,
                    group.instance_count
                );
            }
            for partition in &descriptors.provisioning.worker_groups {
                println!(
                    "  partition {} -> {}",
                    partition.partition_name, partition.instance_group_name
                );
            }
            println!("Descriptors are valid.");
            Ok(())
        }

        Commands::Status { cluster, region } => {
            let aws = aws_cli()?;
            let region = region_or_configured(&aws, region);
            println!("{cluster}: {}", aws.cluster_status(&region, &cluster)?);
            Ok(())
        }

        Commands::Wait {
            cluster,
            region,
            poll,
        } => {
            let aws = aws_cli()?;
            let region = region_or_configured(&aws, region);
            let outcome =
                wait_for_cluster(&aws, &region, &cluster, &poll.cluster(), &ThreadSleeper, true);
            if outcome.is_ready() {
                println!("{cluster} is in service.");
                Ok(())
            } else {
                Err(format!("cluster {cluster} {outcome}").into())
            }
        }

        Commands::Delete {
            cluster,
            region,
            yes,
        } => {
            let aws = aws_cli()?;
            let region = region_or_configured(&aws, region);
            if !yes {
                let answer = StdinPrompter.ask(&format!("Delete cluster {cluster}? (yes/no)"), "no")?;
                if parse_yes_no(&answer) != Some(true) {
                    println!("Not deleting {cluster}.");
                    return Ok(());
                }
            }
            aws.delete_cluster(&region, &cluster)?;
            println!("Deletion of {cluster} requested.");
            Ok(())
        }

        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "hyperpod", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn aws_cli() -> Result<AwsCli, Box<dyn std::error::Error>> {
    let aws = AwsCli::default();
    if !aws.is_installed() {
        return Err("aws CLI not found on PATH. Install and configure it first.".into());
    }
    Ok(aws)
}

fn region_or_configured(aws: &AwsCli, region: Option<String>) -> String {
    region
        .or_else(|| aws.configured_region().ok().flatten())
        .unwrap_or_else(|| FALLBACK_REGION.to_string())
}

fn run_pipeline(run: RunArgs, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let document = run.config.as_ref().map(ConfigDocument::load).transpose()?;
    if run.mode.is_automated() && document.is_none() {
        return Err("automated mode needs a --config file".into());
    }

    let aws = aws_cli()?;
    let source = ConfigSource::new(document, run.mode, StdinPrompter);
    let options = PipelineOptions {
        output_dir: run.output_dir,
        lifecycle_dir: run.lifecycle_dir,
        cluster_poll: run.poll.cluster(),
        stack_poll: run.poll.stack(),
        workload_manager: run.workload_manager,
        dry_run,
        show_progress: true,
    };

    let report = OrchestrationPipeline::new(source, &aws, &ThreadSleeper, options).run()?;
    print_report(&report, dry_run);

    if let Some((stage, reason)) = report.state.fatal() {
        return Err(format!("{stage} failed: {reason}").into());
    }
    Ok(())
}

fn print_report(report: &PipelineReport, dry_run: bool) {
    println!();
    println!("=== {} ===", if dry_run { "Plan" } else { "Provisioning" });
    for stage in Stage::ALL {
        println!("{stage}: {}", report.state.outcome(stage));
    }

    if let Some(topology) = &report.topology {
        println!();
        println!("Cluster {}:", topology.cluster_name);
        for group in &topology.groups {
            print!(
                "  {} [{}] {} x{}",
                group.name, group.role, group.instance_type, group.instance_count
            );
            if let Some(binding) = &group.capacity_reservation {
                print!(" (reservation {})", binding.reservation_id);
            }
            println!();
        }
    }
    if let Some(paths) = &report.descriptors {
        println!();
        println!("Cluster descriptor: {}", paths.cluster.display());
        println!("Provisioning descriptor: {}", paths.provisioning.display());
    }
    if let Some(arn) = &report.cluster_arn {
        println!("Cluster ARN: {arn}");
    }
    let recovered = report.state.recovered().count();
    if recovered > 0 {
        println!();
        println!("Continued past {recovered} failed stage(s); review the log above.");
    }
    if let Some(command) = &report.manual_command {
        println!();
        println!("Cluster creation failed. To retry by hand:");
        println!("  {command}");
    }
    if let Some(path) = &report.users_file {
        println!("Shared users: {}", path.display());
    }
}
