use anyhow::Context;
use clap::{Parser, Subcommand};
use cloudhop::{
    DefaultTransports, DiskFormat, FileJobStore, GatewayCloudApi, JobSnapshot, Orchestrator,
    OrchestratorSettings, ProviderKind, SubmitRequest,
    config::MigrationConfig,
    job::{Disposition, JobOptions},
    logger,
    provider::adapter_for,
};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "cloudhop")]
#[command(about = "Move a VM boot disk between clouds")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "Cloudhop.toml")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print job records as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Locate a VM and create a migration job
    Submit {
        /// Source provider (aws, azure, gcp, huawei, openstack)
        source: ProviderKind,
        /// Destination provider
        dest: ProviderKind,
        /// VM name, id, ARN or resource path
        vm: String,
        /// Treat the exported disk as this format
        #[arg(long)]
        force_format: Option<DiskFormat>,
        /// Leave snapshots, images and staging objects in place
        #[arg(long)]
        keep_intermediate: bool,
        /// Drive the job to completion right away
        #[arg(long)]
        run: bool,
    },
    /// Show one job
    Status { job_id: Uuid },
    /// List jobs
    List {
        /// Include completed and abandoned jobs
        #[arg(short, long)]
        all: bool,
    },
    /// Execute a single state transition
    Advance { job_id: Uuid },
    /// Drive a job until it completes or fails
    Run { job_id: Uuid },
    /// Retry a failed job from the state it failed in
    Retry {
        job_id: Uuid,
        /// Keep going after the retried step
        #[arg(long)]
        run: bool,
    },
    /// Clean up everything a job created and stop it
    Abandon { job_id: Uuid },
    /// Stop a job at the next chunk or state boundary and abandon it
    Cancel { job_id: Uuid },
    /// Continue every unfinished job, e.g. after a restart
    ResumeAll,
}

async fn build_orchestrator(config: &MigrationConfig) -> anyhow::Result<Arc<Orchestrator>> {
    let store = FileJobStore::open(&config.state_dir)
        .await
        .with_context(|| format!("opening job store at {}", config.state_dir.display()))?;
    let settings = OrchestratorSettings::from_config(config)?;

    let mut orchestrator = Orchestrator::new(
        Arc::new(store),
        Arc::new(DefaultTransports::new()),
        Arc::new(config.codec.converter()),
        settings,
    );

    for kind in ProviderKind::ALL {
        let Some(provider) = config.provider(kind) else {
            continue;
        };
        let Some(url) = &provider.gateway_url else {
            logger::warn!("providers.{} has no gateway_url, skipping", kind);
            continue;
        };
        let api = GatewayCloudApi::new(kind, url.clone(), provider.credential_ref.clone())?;
        let settings = config.adapter_settings(kind)?;
        orchestrator = orchestrator.with_adapter(adapter_for(kind, Arc::new(api), settings));
        logger::debug!("Registered {} adapter via {}", kind, url);
    }

    Ok(Arc::new(orchestrator))
}

fn print_job(snapshot: &JobSnapshot, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    let job = &snapshot.job;
    println!("Job: {}", job.id);
    println!("VM: {} ({} -> {})", job.vm_identifier, job.source_provider, job.dest_provider);
    println!("State: {}", job.state);
    if job.state.is_transfer() {
        println!(
            "Progress: {:.1}% ({} of {} bytes)",
            snapshot.progress_percent,
            job.resume_offset.unwrap_or(0),
            job.disk.size_bytes
        );
    }
    if let Some(format) = job.disk.format {
        println!("Disk format: {}", format);
    }
    println!("Created: {}", job.timestamps.created.format("%Y-%m-%d %H:%M:%S"));
    println!("Updated: {}", job.timestamps.updated.format("%Y-%m-%d %H:%M:%S"));

    if let Some(error) = &job.last_error {
        println!(
            "Last error: [{}] {} ({})",
            error.kind,
            error.message,
            if error.retryable { "retryable" } else { "permanent" }
        );
    }

    if !job.created_resources.is_empty() {
        println!("Resources:");
        for resource in &job.created_resources {
            let disposition = match &resource.disposition {
                Disposition::Pending => "pending".to_string(),
                Disposition::Deleted => "deleted".to_string(),
                Disposition::Kept => "kept".to_string(),
                Disposition::DeleteFailed { message } => format!("delete failed: {}", message),
            };
            println!("  {:<48} {}", resource.handle.to_string(), disposition);
        }
    }

    for warning in &job.warnings {
        println!("Warning: {}", warning);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "cloudhop=debug");
        }
    }
    logger::init_logger();

    let config = if cli.config.exists() {
        MigrationConfig::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        logger::warn!(
            "Config not found at {}, using defaults",
            cli.config.display()
        );
        MigrationConfig::default()
    };

    let orchestrator = build_orchestrator(&config).await?;

    match cli.command {
        Commands::Submit {
            source,
            dest,
            vm,
            force_format,
            keep_intermediate,
            run,
        } => {
            let id = orchestrator
                .submit(SubmitRequest {
                    source_provider: source,
                    dest_provider: dest,
                    vm_identifier: vm,
                    options: JobOptions {
                        force_format,
                        keep_intermediate_resources: keep_intermediate,
                    },
                })
                .await?;
            println!("Submitted job {}", id);
            if run {
                let snapshot = orchestrator.run(id).await?;
                print_job(&snapshot, cli.json)?;
            }
        }
        Commands::Status { job_id } => {
            let snapshot = orchestrator.get_job(job_id).await?;
            print_job(&snapshot, cli.json)?;
        }
        Commands::List { all } => {
            let jobs = orchestrator.list_jobs(all).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
                return Ok(());
            }
            println!(
                "{:<38} {:<24} {:<10} {:<10} {:<12} {:>7}",
                "JOB", "VM", "SOURCE", "DEST", "STATE", "PROG"
            );
            println!("{}", "=".repeat(106));
            for snapshot in &jobs {
                let job = &snapshot.job;
                println!(
                    "{:<38} {:<24} {:<10} {:<10} {:<12} {:>6.1}%",
                    job.id.to_string(),
                    job.vm_identifier,
                    job.source_provider.to_string(),
                    job.dest_provider.to_string(),
                    job.state.to_string(),
                    snapshot.progress_percent
                );
            }
            if jobs.is_empty() {
                println!("No migration jobs");
            }
        }
        Commands::Advance { job_id } => {
            let snapshot = orchestrator.advance(job_id).await?;
            print_job(&snapshot, cli.json)?;
        }
        Commands::Run { job_id } => {
            let snapshot = orchestrator.run(job_id).await?;
            print_job(&snapshot, cli.json)?;
        }
        Commands::Retry { job_id, run } => {
            let mut snapshot = orchestrator.retry(job_id).await?;
            if run && !snapshot.is_settled() {
                snapshot = orchestrator.run(job_id).await?;
            }
            print_job(&snapshot, cli.json)?;
        }
        Commands::Abandon { job_id } => {
            let snapshot = orchestrator.abandon(job_id).await?;
            print_job(&snapshot, cli.json)?;
        }
        Commands::Cancel { job_id } => {
            let snapshot = orchestrator.cancel(job_id).await?;
            print_job(&snapshot, cli.json)?;
        }
        Commands::ResumeAll => {
            let handles = orchestrator.resume_all().await?;
            if handles.is_empty() {
                println!("No unfinished jobs");
            }
            for (id, handle) in handles {
                match handle.await {
                    Ok(Ok(snapshot)) => println!("{}: {}", id, snapshot.state()),
                    Ok(Err(err)) => println!("{}: {}", id, err),
                    Err(err) => println!("{}: task failed: {}", id, err),
                }
            }
        }
    }

    Ok(())
}
