use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use humansize::{format_size, DECIMAL};
use ingest::{
    cache::JobCache,
    config::IngestConfig,
    job::{load_all_jobs, Job, JobState},
    pipeline::Pipeline,
    runner::SystemRunner,
    scan::{self, DiscoveryContext, ScanResult},
};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

/// Media ingestion daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan the library periodically and process new files (default)
    Run,
    /// Process a single file once and exit
    Process {
        file: PathBuf,
        /// Stream copy instead of transcoding
        #[arg(long)]
        fast: bool,
        /// Machine-translate the best subtitle track
        #[arg(long)]
        translate: bool,
    },
    /// List persisted jobs
    Status,
}

/// Input paths currently being processed, with their job ids
type InFlight = Arc<Mutex<HashMap<PathBuf, String>>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; --verbose only changes the default
    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .init();

    let cfg = IngestConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(Arc::new(cfg)).await,
        Command::Process { file, fast, translate } => process_one(Arc::new(cfg), &file, fast, translate).await,
        Command::Status => print_status(&cfg),
    }
}

fn pipeline_for(cfg: &Arc<IngestConfig>) -> Pipeline {
    Pipeline::new(Arc::clone(cfg), Arc::new(SystemRunner::new()))
}

async fn run_daemon(cfg: Arc<IngestConfig>) -> Result<()> {
    info!("Ingest daemon starting");
    info!("Configuration loaded:");
    info!("  Library roots: {:?}", cfg.library_roots);
    info!("  Output dir: {}", cfg.output_dir.display());
    info!("  Codecs: {:?}", cfg.codecs);
    info!("  Scan interval: {}s", cfg.scan_interval_secs);
    info!("  Max concurrent jobs: {}", cfg.max_concurrent_jobs);
    match &cfg.translation {
        Some(t) => info!("  Translation: {:?} {} -> {}", t.provider, t.model(), t.target_language),
        None => info!("  Translation: disabled"),
    }

    for root in &cfg.library_roots {
        if root.exists() {
            info!("Library root exists: {}", root.display());
        } else {
            warn!("Library root does not exist: {}", root.display());
        }
    }

    fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("Failed to create output directory: {}", cfg.output_dir.display()))?;

    let pipeline = pipeline_for(&cfg);
    let cache = Arc::new(JobCache::new(cfg.output_dir.clone(), Duration::from_secs(cfg.cache_ttl_secs)));
    let slots = Arc::new(Semaphore::new(cfg.max_concurrent_jobs.max(1)));
    let in_flight: InFlight = Arc::default();

    loop {
        info!("Starting library scan...");
        match scan_and_dispatch(&cfg, &pipeline, &cache, &slots, &in_flight).await {
            Ok(started) if started > 0 => info!("🚀 Dispatched {} job(s)", started),
            Ok(_) => debug!("Nothing new to process"),
            Err(e) => error!("❌ Scan round failed: {:#}", e),
        }

        info!("Sleeping for {} seconds before next scan", cfg.scan_interval_secs);
        tokio::time::sleep(Duration::from_secs(cfg.scan_interval_secs)).await;
    }
}

/// One discovery round: scan, plan and spawn a task per job
async fn scan_and_dispatch(
    cfg: &Arc<IngestConfig>,
    pipeline: &Pipeline,
    cache: &Arc<JobCache>,
    slots: &Arc<Semaphore>,
    in_flight: &InFlight,
) -> Result<usize> {
    let results = scan::scan_library(cfg).await.context("Failed to scan library")?;

    let mut candidates = Vec::new();
    let mut skipped = 0;
    for result in results {
        match result {
            ScanResult::Candidate(path, size) => candidates.push((path, size)),
            ScanResult::Skipped(path, reason) => {
                skipped += 1;
                debug!("Skipped {}: {}", path.display(), reason);
            }
        }
    }

    let known = cache.get(false).await.context("Failed to load existing jobs")?;

    let mut ctx = DiscoveryContext::from_config(cfg, &known);
    let jobs = {
        let running = in_flight.lock().await;
        candidates.retain(|(path, _)| !running.contains_key(path));
        ctx.active_ids.extend(running.values().cloned());
        scan::plan_jobs(&candidates, &known, &mut ctx)
    };

    info!(
        "Scan summary: {} candidates, {} skipped, {} known jobs, {} to process",
        candidates.len(),
        skipped,
        known.len(),
        jobs.len()
    );

    let started = jobs.len();
    for job in jobs {
        in_flight.lock().await.insert(job.input_path(), job.id.clone());
        tokio::spawn(run_job(
            pipeline.clone(),
            Arc::clone(cache),
            Arc::clone(slots),
            Arc::clone(in_flight),
            job,
        ));
    }
    Ok(started)
}

async fn run_job(pipeline: Pipeline, cache: Arc<JobCache>, slots: Arc<Semaphore>, in_flight: InFlight, mut job: Job) {
    let input = job.input_path();
    match slots.acquire_owned().await {
        Ok(_permit) => {
            info!("Job {}: starting {}", job.id, input.display());
            if let Err(e) = pipeline.run(&mut job).await {
                error!("❌ Job {} failed: {:#}", job.id, e);
            }
        }
        Err(e) => error!("Job {}: no processing slot: {}", job.id, e),
    }

    in_flight.lock().await.remove(&input);
    if let Err(e) = cache.get(true).await {
        warn!("Failed to refresh job cache: {:#}", e);
    }
}

async fn process_one(cfg: Arc<IngestConfig>, file: &Path, fast: bool, translate: bool) -> Result<()> {
    let path = file
        .canonicalize()
        .with_context(|| format!("Input file not found: {}", file.display()))?;
    let size = fs::metadata(&path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();

    fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("Failed to create output directory: {}", cfg.output_dir.display()))?;
    let known = load_all_jobs(&cfg.output_dir).context("Failed to load existing jobs")?;

    let mut ctx = DiscoveryContext::from_config(&cfg, &known);
    let Some(mut job) = scan::plan_jobs(&[(path.clone(), size)], &known, &mut ctx).into_iter().next() else {
        info!("✅ {} is already processed", path.display());
        return Ok(());
    };
    job.fast |= fast;
    job.translate |= translate;

    pipeline_for(&cfg)
        .run(&mut job)
        .await
        .with_context(|| format!("Job {} failed", job.id))?;
    println!("{}", job.dir(&cfg.output_dir).display());
    Ok(())
}

fn print_status(cfg: &IngestConfig) -> Result<()> {
    let mut jobs = load_all_jobs(&cfg.output_dir).context("Failed to load jobs")?;
    jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    if jobs.is_empty() {
        println!("No jobs in {}", cfg.output_dir.display());
        return Ok(());
    }

    println!("{:<12} {:<18} {:>10} {:>10}  {:<24} {}", "ID", "STATE", "SOURCE", "OUTPUT", "CODECS", "FILE");
    for job in &jobs {
        let state = match job.state {
            JobState::Incomplete => "incomplete",
            JobState::StreamsExtracted => "streams_extracted",
            JobState::Complete => "complete",
        };
        let output: u64 = job.codec_sizes.values().sum();
        let output = if output > 0 { format_size(output, DECIMAL) } else { "-".to_string() };
        let flags = match (job.fast, job.translate) {
            (true, true) => " [fast, mt]",
            (true, false) => " [fast]",
            (false, true) => " [mt]",
            (false, false) => "",
        };
        println!(
            "{:<12} {:<18} {:>10} {:>10}  {:<24} {}{}",
            job.id,
            state,
            format_size(job.original_size, DECIMAL),
            output,
            job.encoded_codecs.join(","),
            job.input_file,
            flags
        );
    }

    let complete = jobs.iter().filter(|j| j.state == JobState::Complete).count();
    println!("\n{} job(s), {} complete", jobs.len(), complete);
    Ok(())
}
