use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use easel_contracts::errors::JobError;
use easel_contracts::jobs::action_code::{ActionCode, Mode};
use easel_contracts::jobs::record::{JobRecord, JobStatus};
use easel_contracts::jobs::store::MetadataStore;
use easel_engine::{
    ActionRequest, JobEngine, MidjourneyClient, SubmitRequest, WaitOptions,
    IMAGES_METADATA_FILENAME,
};

#[derive(Debug, Parser)]
#[command(name = "easel", version, about = "Midjourney job lifecycle CLI")]
struct Cli {
    /// Directory holding the metadata files and the event log
    /// (default: $EASEL_DATA_DIR, else ./easel-data).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a generation job.
    Imagine(ImagineArgs),
    /// Run a follow-up action (upscale, variation, pan, ...) on a prior job.
    Action(ActionArgs),
    /// Resolve an identifier (job id, prefix or filename) to its record.
    Resolve(ResolveArgs),
    /// Fetch a job's remote state and merge it into the local record.
    Fetch(FetchArgs),
    /// Print a job's seed, fetching it remotely if it is not stored yet.
    Seed(SeedArgs),
    /// Reconcile local metadata against the remote job listing.
    Sync(SyncArgs),
    /// List the locally known jobs.
    Tasks(TasksArgs),
}

#[derive(Debug, Parser)]
struct ImagineArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    concept: Option<String>,
    /// Variation key, repeatable, order preserved.
    #[arg(long = "variation")]
    variations: Vec<String>,
    /// Global style key, repeatable, order preserved.
    #[arg(long = "style")]
    styles: Vec<String>,
    #[arg(long, default_value = "fast")]
    mode: String,
    #[arg(long)]
    hook_url: Option<String>,
    /// Poll until the job is terminal instead of returning right away.
    #[arg(long)]
    wait: bool,
    #[arg(long, default_value_t = 10)]
    poll_interval: u64,
    #[arg(long, default_value_t = 300)]
    timeout: u64,
}

#[derive(Debug, Parser)]
struct ActionArgs {
    /// Action code, e.g. upsample1, variation3, zoom_out_2, pan_left.
    action_code: Option<String>,
    /// Job id, id prefix or filename; defaults to the last submitted job.
    identifier: Option<String>,
    /// Target the last job seen succeeding instead of the last submitted.
    #[arg(long)]
    last_succeed: bool,
    #[arg(long, default_value = "fast")]
    mode: String,
    #[arg(long)]
    hook_url: Option<String>,
    #[arg(long)]
    wait: bool,
    #[arg(long, default_value_t = 10)]
    poll_interval: u64,
    #[arg(long, default_value_t = 300)]
    timeout: u64,
    /// Print the supported action codes and exit.
    #[arg(long)]
    list: bool,
}

#[derive(Debug, Parser)]
struct ResolveArgs {
    identifier: String,
}

#[derive(Debug, Parser)]
struct FetchArgs {
    identifier: String,
    #[arg(long)]
    wait: bool,
    #[arg(long, default_value_t = 10)]
    poll_interval: u64,
    #[arg(long, default_value_t = 300)]
    timeout: u64,
}

#[derive(Debug, Parser)]
struct SeedArgs {
    identifier: String,
}

#[derive(Debug, Parser)]
struct SyncArgs {
    /// How many recent remote jobs to examine.
    #[arg(long, default_value_t = 50)]
    limit: u32,
}

#[derive(Debug, Parser)]
struct TasksArgs {
    /// Show only the most recent N records.
    #[arg(long)]
    limit: Option<usize>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("easel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir);
    match cli.command {
        Command::Imagine(args) => run_imagine(data_dir, args),
        Command::Action(args) => run_action(data_dir, args),
        Command::Resolve(args) => run_resolve(data_dir, args),
        Command::Fetch(args) => run_fetch(data_dir, args),
        Command::Seed(args) => run_seed(data_dir, args),
        Command::Sync(args) => run_sync(data_dir, args),
        Command::Tasks(args) => run_tasks(data_dir, args),
    }
}

fn resolve_data_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| {
        env::var("EASEL_DATA_DIR")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    })
    .unwrap_or_else(|| PathBuf::from("easel-data"))
}

fn remote_engine(data_dir: PathBuf, command: &str) -> Result<JobEngine> {
    let client = MidjourneyClient::from_env()?;
    JobEngine::new(data_dir, Box::new(client), command)
}

fn run_imagine(data_dir: PathBuf, args: ImagineArgs) -> Result<i32> {
    let mode = Mode::from_str(&args.mode).map_err(anyhow::Error::msg)?;
    let mut engine = remote_engine(data_dir, "imagine")?;

    let outcome = engine.submit(SubmitRequest {
        prompt: args.prompt,
        concept: args.concept,
        variations: args.variations,
        global_styles: args.styles,
        mode,
        hook_url: args.hook_url.clone(),
    })?;
    report_warnings(&mut engine);
    println!("submitted job {}", outcome.job_id);
    if let Some(notify_id) = &outcome.notify_id {
        println!("webhook correlation token: {notify_id}");
    }

    if args.wait && args.hook_url.is_none() {
        let record = wait_and_print(&mut engine, &outcome.job_id, args.poll_interval, args.timeout)?;
        report_warnings(&mut engine);
        if record.status == JobStatus::Failed {
            return Ok(1);
        }
    }
    Ok(0)
}

fn run_action(data_dir: PathBuf, args: ActionArgs) -> Result<i32> {
    if args.list {
        for code in ActionCode::ALL {
            println!("{:<22} {}", code.as_str(), code.describe());
        }
        return Ok(0);
    }
    let Some(raw_code) = args.action_code.as_deref() else {
        bail!("an action code is required (or use --list to see the choices)");
    };
    let code = ActionCode::from_str(raw_code).map_err(anyhow::Error::msg)?;
    let mode = Mode::from_str(&args.mode).map_err(anyhow::Error::msg)?;
    let mut engine = remote_engine(data_dir, "action")?;

    let outcome = engine.submit_action(ActionRequest {
        code,
        identifier: args.identifier,
        use_last_succeed: args.last_succeed,
        mode,
        hook_url: args.hook_url.clone(),
    })?;
    report_warnings(&mut engine);
    println!(
        "action '{}' on {} accepted; new job {}",
        code, outcome.original_job_id, outcome.job_id
    );
    if let Some(notify_id) = &outcome.notify_id {
        println!("webhook correlation token: {notify_id}");
    }

    if args.wait && args.hook_url.is_none() {
        let record = wait_and_print(&mut engine, &outcome.job_id, args.poll_interval, args.timeout)?;
        report_warnings(&mut engine);
        if record.status == JobStatus::Failed {
            return Ok(1);
        }
    }
    Ok(0)
}

fn run_resolve(data_dir: PathBuf, args: ResolveArgs) -> Result<i32> {
    let mut store = MetadataStore::load(data_dir.join(IMAGES_METADATA_FILENAME));
    if let Some(warning) = store.take_load_warning() {
        eprintln!("warning: {warning}");
    }
    let record = store.resolve(&args.identifier).map_err(anyhow::Error::new)?;
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(0)
}

fn run_fetch(data_dir: PathBuf, args: FetchArgs) -> Result<i32> {
    let mut engine = remote_engine(data_dir, "fetch")?;
    let job_id = resolve_to_job_id(&engine, &args.identifier)?;

    let record = if args.wait {
        wait_and_print(&mut engine, &job_id, args.poll_interval, args.timeout)?
    } else {
        let record = engine.fetch_and_record(&job_id)?;
        println!("{}", serde_json::to_string_pretty(&record)?);
        record
    };
    report_warnings(&mut engine);
    Ok(if record.status == JobStatus::Failed { 1 } else { 0 })
}

fn run_seed(data_dir: PathBuf, args: SeedArgs) -> Result<i32> {
    let mut engine = remote_engine(data_dir, "seed")?;
    let outcome = engine.get_seed(&args.identifier)?;
    report_warnings(&mut engine);
    if outcome.fetched_remotely {
        eprintln!("seed for {} fetched from the remote service", outcome.job_id);
    }
    println!("{}", outcome.seed);
    Ok(0)
}

fn run_sync(data_dir: PathBuf, args: SyncArgs) -> Result<i32> {
    let mut engine = remote_engine(data_dir, "sync")?;
    let outcome = engine.reconcile(args.limit)?;
    report_warnings(&mut engine);
    println!(
        "examined {} remote job(s); {} record(s) added or updated",
        outcome.examined, outcome.changed
    );
    Ok(0)
}

fn run_tasks(data_dir: PathBuf, args: TasksArgs) -> Result<i32> {
    let mut store = MetadataStore::load(data_dir.join(IMAGES_METADATA_FILENAME));
    if let Some(warning) = store.take_load_warning() {
        eprintln!("warning: {warning}");
    }
    if store.is_empty() {
        println!("no jobs recorded yet");
        return Ok(0);
    }
    let records: Vec<&JobRecord> = store.records().collect();
    let skip = args
        .limit
        .map(|limit| records.len().saturating_sub(limit))
        .unwrap_or(0);
    for record in &records[skip..] {
        println!("{}", summarize_record(record));
    }
    Ok(0)
}

fn wait_and_print(
    engine: &mut JobEngine,
    job_id: &str,
    poll_interval: u64,
    timeout: u64,
) -> Result<JobRecord> {
    eprintln!("waiting for job {job_id} (interval {poll_interval}s, timeout {timeout}s)...");
    let record = engine.wait(
        job_id,
        WaitOptions {
            interval: Duration::from_secs(poll_interval.max(1)),
            timeout: Duration::from_secs(timeout),
        },
    )?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(record)
}

fn resolve_to_job_id(engine: &JobEngine, identifier: &str) -> Result<String> {
    match engine.resolve(identifier) {
        Ok(record) => Ok(record.job_id.clone()),
        Err(err) => {
            // a full job id can be fetched even before it has a local record
            if looks_like_job_id(identifier)
                && matches!(err.downcast_ref::<JobError>(), Some(JobError::NotFound(_)))
            {
                Ok(identifier.trim().to_string())
            } else {
                Err(err)
            }
        }
    }
}

fn looks_like_job_id(identifier: &str) -> bool {
    let identifier = identifier.trim();
    identifier.len() == 36
        && identifier.matches('-').count() == 4
        && identifier
            .chars()
            .all(|value| value.is_ascii_hexdigit() || value == '-')
}

fn summarize_record(record: &JobRecord) -> String {
    let label = record
        .filename
        .as_deref()
        .or(record.concept.as_deref())
        .unwrap_or("-");
    let prompt = record.prompt.as_deref().unwrap_or("");
    let short_prompt: String = prompt.chars().take(48).collect();
    let ellipsis = if prompt.chars().count() > 48 { "…" } else { "" };
    format!(
        "{}  {:<11} {:<24} {short_prompt}{ellipsis}",
        record.job_id,
        record.status.as_str(),
        label
    )
}

fn report_warnings(engine: &mut JobEngine) {
    for warning in engine.take_warnings() {
        eprintln!("warning: {warning}");
    }
}
