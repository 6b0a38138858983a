use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crawlops_core::{
    AggregateProgress, BulkExtractionMode, BulkExtractionPreview, BulkExtractionRequest, DataType,
    DataTypeSelection, JobFilter, JobId, JobKind, JobSpec, JobStatus, StepCatalog, StepStatus,
    UserIntent,
};
use crawlops_orchestrator::{
    load_batch_file, load_inventory_file, BatchOutcome, Orchestrator, PollPhase, PollSnapshot,
    StaticInventory,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "crawlops")]
#[command(about = "Operate crawl and extraction jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create crawl, extract or full jobs for every target × year × data type.
    Trigger(TriggerArgs),
    /// Run an address search.
    Search {
        query: String,
        #[arg(long)]
        watch: bool,
    },
    /// Submit a YAML queue of job specs.
    Batch { file: PathBuf },
    /// Follow a job until it settles.
    Watch { id: JobId },
    Cancel { id: JobId },
    Jobs {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        kind: Option<JobKind>,
        #[arg(long)]
        limit: Option<usize>,
    },
    #[command(subcommand)]
    Bulk(BulkCommand),
}

#[derive(Debug, Args)]
struct TriggerArgs {
    #[arg(long = "target", required = true)]
    targets: Vec<String>,
    #[arg(long = "year", required = true)]
    years: Vec<i32>,
    #[arg(long, default_value = "all")]
    data_type: DataTypeSelection,
    #[arg(long, default_value = "crawl")]
    kind: JobKind,
    /// Follow the first created job.
    #[arg(long)]
    watch: bool,
}

#[derive(Debug, Args)]
struct BulkArgs {
    #[arg(long, default_value = "default")]
    mode: BulkExtractionMode,
    #[arg(long = "data-type")]
    data_types: Vec<DataType>,
    #[arg(long = "format")]
    formats: Vec<String>,
    /// Plan against a local inventory file instead of the backend.
    #[arg(long)]
    inventory: Option<PathBuf>,
}

impl BulkArgs {
    fn request(&self) -> BulkExtractionRequest {
        BulkExtractionRequest {
            mode: self.mode,
            data_types: self.data_types.clone(),
            formats: self.formats.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum BulkCommand {
    Preview(BulkArgs),
    Run {
        #[command(flatten)]
        args: BulkArgs,
        /// Number of verified records force_override will overwrite.
        #[arg(long)]
        acknowledge_overrides: Option<usize>,
        /// Enqueue after printing the preview. Without it the run stops at the preview.
        #[arg(long, short = 'y')]
        yes: bool,
        #[arg(long)]
        no_wait: bool,
    },
    Status {
        #[arg(long)]
        follow: bool,
    },
    /// Cancel pending bulk jobs. Running jobs finish.
    Cancel,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crawlops_orchestrator=info,crawlops_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let orch = Orchestrator::from_env().context("building orchestrator from environment")?;

    match cli.command {
        Commands::Trigger(args) => {
            let intent = UserIntent {
                targets: args.targets,
                years: args.years,
                data_type: args.data_type,
                job_kind: args.kind,
            };
            let outcome = orch.expander().submit(&intent).await.into_result()?;
            print_outcome(&outcome);
            if args.watch {
                if let Some(id) = outcome.created.first() {
                    watch_job(&orch, *id).await?;
                }
            }
        }
        Commands::Search { query, watch } => {
            let outcome = orch
                .expander()
                .submit_batch(vec![JobSpec::search(query)])
                .await
                .into_result()?;
            print_outcome(&outcome);
            if watch {
                if let Some(id) = outcome.created.first() {
                    watch_job(&orch, *id).await?;
                }
            }
        }
        Commands::Batch { file } => {
            let batch = load_batch_file(&file)?;
            let outcome = orch.expander().submit_batch(batch.jobs).await.into_result()?;
            print_outcome(&outcome);
        }
        Commands::Watch { id } => watch_job(&orch, id).await?,
        Commands::Cancel { id } => {
            let poller = orch.poller(id);
            let outcome = orch.cancellation().cancel(&poller).await?;
            match outcome.final_status() {
                Some(JobStatus::Cancelled) => println!("job {id} cancelled"),
                Some(status) => println!("job {id} is {status}; the cancel arrived too late"),
                None => println!("cancel sent for job {id}; current state unknown"),
            }
        }
        Commands::Jobs { status, kind, limit } => {
            let mut view = orch.job_list_view(JobFilter { status, kind, limit });
            let rows = view.refresh().await.context("listing jobs")?;
            if rows.is_empty() {
                println!("no jobs");
            }
            for row in rows {
                println!(
                    "{}  {:<8} {:<10} {:>5.1}%  {}",
                    row.id,
                    row.kind.as_str(),
                    row.status.as_str(),
                    row.progress,
                    row.target
                );
            }
        }
        Commands::Bulk(command) => run_bulk(orch, command).await?,
    }

    Ok(())
}

fn print_outcome(outcome: &BatchOutcome) {
    println!("{outcome}");
    for id in &outcome.created {
        println!("  created {id}");
    }
}

fn step_marker(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => " ",
        StepStatus::Running => ">",
        StepStatus::Done => "x",
        StepStatus::Failed => "!",
    }
}

fn render(catalog: &StepCatalog, snapshot: &PollSnapshot) {
    let Some(job) = &snapshot.job else {
        match snapshot.phase {
            PollPhase::Idle | PollPhase::Loading => println!("job {}: loading", snapshot.job_id),
            _ => println!(
                "job {}: {}",
                snapshot.job_id,
                snapshot.last_error.as_deref().unwrap_or("unavailable")
            ),
        }
        return;
    };

    println!(
        "job {} [{} {}] {:.0}% {}",
        job.id,
        job.kind,
        job.status,
        job.progress_percent(),
        job.current_step
    );
    let timeline = catalog.timeline_for(job);
    if !timeline.is_empty() {
        println!("  {}/{} steps done", timeline.completed_count(), timeline.len());
    }
    for step in &timeline.steps {
        let cursor = if timeline.focus() == Some(step.index) { "*" } else { " " };
        if step.detail.is_empty() {
            println!(" {cursor}[{}] {}", step_marker(step.status), step.label);
        } else {
            println!(" {cursor}[{}] {}: {}", step_marker(step.status), step.label, step.detail);
        }
    }
    if let Some(message) = &job.error_message {
        println!("  error: {message}");
    } else if timeline.has_failure() {
        println!("  a pipeline step reported a failure");
    }
    if snapshot.phase == PollPhase::Retrying {
        println!(
            "  (retrying after {} failed fetches)",
            snapshot.consecutive_failures
        );
    }
}

async fn watch_job(orch: &Orchestrator, id: JobId) -> Result<()> {
    let mut next = Some(id);
    while let Some(id) = next.take() {
        let poller = orch.watch(id);
        let mut rx = poller.subscribe();
        loop {
            let snapshot = rx.borrow_and_update().clone();
            render(orch.catalog(), &snapshot);
            if snapshot.is_halted() {
                break;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    poller.stop();
                    return Ok(());
                }
            }
        }

        let snapshot = poller.snapshot();
        match snapshot.phase {
            PollPhase::NotFound => bail!("job {id} not found"),
            PollPhase::Failed => bail!(
                "gave up polling job {id}: {}",
                snapshot.last_error.as_deref().unwrap_or("unknown error")
            ),
            _ => {}
        }
        if let Some(child) = poller.child() {
            println!("following extract job {}", child.job_id());
            next = Some(child.job_id());
        }
    }
    Ok(())
}

fn print_preview(preview: &BulkExtractionPreview) {
    println!("files scanned:        {}", preview.total_files);
    println!("will extract:         {}", preview.will_extract);
    println!("protected (verified): {}", preview.protected_verified);
    if preview.will_override_verified > 0 {
        println!("verified overwritten: {}", preview.will_override_verified);
    }
    for (status, count) in &preview.breakdown_by_status {
        println!("  {status:?}: {count}");
    }
}

fn print_progress(progress: &AggregateProgress) {
    println!(
        "{:.0}% done: {} pending, {} running, {} completed, {} failed, {} cancelled of {}",
        progress.progress_percent(),
        progress.pending,
        progress.running,
        progress.completed,
        progress.failed,
        progress.cancelled,
        progress.total
    );
}

async fn run_bulk(orch: Orchestrator, command: BulkCommand) -> Result<()> {
    let inventory = match &command {
        BulkCommand::Preview(args) | BulkCommand::Run { args, .. } => args.inventory.clone(),
        _ => None,
    };
    let orch = match inventory {
        Some(path) => {
            let files = load_inventory_file(&path)?;
            orch.with_inventory(Arc::new(StaticInventory::new(files)))
        }
        None => orch,
    };
    let bulk = orch.bulk();

    match command {
        BulkCommand::Preview(args) => {
            let preview = bulk.preview(&args.request()).await?;
            print_preview(&preview);
        }
        BulkCommand::Run {
            args,
            acknowledge_overrides,
            yes,
            no_wait,
        } => {
            let request = args.request();
            let preview = bulk.preview(&request).await?;
            print_preview(&preview);
            if !yes {
                println!("nothing enqueued; re-run with --yes to start this extraction");
                return Ok(());
            }
            let ack = bulk.commit(&request, acknowledge_overrides).await?;
            println!("enqueued {} extraction jobs", ack.enqueued);
            if !no_wait {
                let monitor = bulk.monitor_run(&ack);
                let mut rx = monitor.subscribe();
                while rx.changed().await.is_ok() {
                    let state = rx.borrow_and_update().clone();
                    if let Some(progress) = &state.progress {
                        print_progress(progress);
                    }
                    if state.settled {
                        break;
                    }
                }
            }
        }
        BulkCommand::Status { follow } => {
            if follow {
                let monitor = bulk.monitor();
                let mut rx = monitor.subscribe();
                while rx.changed().await.is_ok() {
                    let state = rx.borrow_and_update().clone();
                    match (&state.progress, &state.last_error) {
                        (_, Some(err)) => eprintln!("status unavailable: {err}"),
                        (Some(progress), None) => print_progress(progress),
                        (None, None) => {}
                    }
                    if state.settled {
                        break;
                    }
                }
            } else {
                print_progress(&bulk.status().await?);
            }
        }
        BulkCommand::Cancel => {
            let ack = bulk.cancel_pending().await?;
            println!("cancelled {} pending jobs", ack.cancelled);
        }
    }
    Ok(())
}
