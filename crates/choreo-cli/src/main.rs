//! # choreo-cli
//!
//! Runs a demonstration scenario against simulated chain and query clients.
//! Job graph:
//!
//! ```text
//! members ─► channels ─► videos ┄► comments
//!    └─────────────────────────────▲
//! council ─► proposals (both flows serialize on the `proposals` lock)
//! ```
//!
//! `--fail <job>` makes that job's flows fail, to show skips and exit codes.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use choreo_core::{
    Env, Flow, FlowContext, FlowResult, JobState, Resource, RunReport, RunnerConfig, Scenario,
    ScenarioContext, flow, named_flow, observability,
};
use clap::Parser;
use colored::Colorize;
use tracing::{debug, error, info};

const PROPOSALS: Resource = Resource::from_static("proposals");

/// Choreo - scenario execution engine demo
#[derive(Parser, Debug)]
#[command(name = "choreo", version, about)]
struct Cli {
    /// Path to a YAML runner configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Make the named demo job fail (repeatable)
    #[arg(long = "fail", value_name = "JOB")]
    fail: Vec<String>,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Simulated chain latency in milliseconds
    #[arg(long, default_value_t = 25)]
    latency_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "choreo failed");
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let env = Env::from_process();
    let config = load_config(cli.config.as_ref(), &env)?;
    let filter = if cli.verbose {
        "choreo_core=debug,choreo=debug,info"
    } else {
        config.log_filter.as_str()
    };
    observability::init_tracing(filter);

    let services = DemoServices::new(
        cli.fail.iter().cloned().collect(),
        Duration::from_millis(cli.latency_ms),
    );
    info!(failing = ?cli.fail, "starting demo scenario");

    let report = Scenario::new("content-and-governance")
        .with_env(env)
        .with_config(config)
        .with_services(services)
        .run(declare)
        .await?;

    if cli.json {
        println!("{}", report.to_json().context("failed to serialize report")?);
    } else {
        print_summary(&report);
    }
    Ok(ExitCode::from(report.exit_code()))
}

fn load_config(path: Option<&PathBuf>, env: &Env) -> Result<RunnerConfig> {
    let config = match path {
        Some(path) => RunnerConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => RunnerConfig::default(),
    };
    Ok(config.apply_env(env)?)
}

/// The demo job graph.
async fn declare(ctx: ScenarioContext<DemoServices>) -> Result<()> {
    let members = ctx.job("members", flow(CreateMembers { count: 4 }));
    let channels = ctx
        .job("channels", named_flow("create-channels", create_channels))
        .requires(&members);
    let videos = ctx
        .job(
            "videos",
            [
                named_flow("upload-videos", upload_videos),
                named_flow("check-video-index", check_video_index),
            ],
        )
        .requires(&channels);

    let council = ctx.job("council", named_flow("elect-council", elect_council));
    ctx.job(
        "proposals",
        [
            named_flow("funding-proposal", funding_proposal),
            named_flow("text-proposal", text_proposal),
        ],
    )
    .requires(&council)
    .after(&members);

    ctx.job("comments", named_flow("post-comments", post_comments))
        .requires(&members)
        .after(&videos);

    Ok(())
}

/// Stand-ins for the chain and query-node clients.
struct DemoServices {
    fail: HashSet<String>,
    latency: Duration,
    next_block: AtomicU64,
    /// Entities "indexed" by the fake query node, by kind.
    indexed: Mutex<BTreeMap<&'static str, u64>>,
}

impl DemoServices {
    fn new(fail: HashSet<String>, latency: Duration) -> Self {
        Self {
            fail,
            latency,
            next_block: AtomicU64::new(1),
            indexed: Mutex::new(BTreeMap::new()),
        }
    }

    /// Submit an extrinsic creating `count` entities of `kind`.
    async fn submit(&self, kind: &'static str, count: u64) -> Result<u64> {
        tokio::time::sleep(self.latency).await;
        let block = self.next_block.fetch_add(1, Ordering::SeqCst);
        *self
            .indexed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(kind)
            .or_default() += count;
        debug!(kind, count, block, "extrinsic included");
        Ok(block)
    }

    async fn indexed(&self, kind: &'static str) -> u64 {
        tokio::time::sleep(self.latency / 2).await;
        self.indexed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(kind)
            .copied()
            .unwrap_or(0)
    }

    fn check_not_failing(&self, job: &str) -> FlowResult {
        if self.fail.contains(job) {
            bail!("{job}: failure requested on the command line");
        }
        Ok(())
    }
}

type Ctx = FlowContext<DemoServices>;

struct CreateMembers {
    count: u64,
}

#[async_trait]
impl Flow<DemoServices> for CreateMembers {
    async fn run(&self, ctx: Ctx) -> FlowResult {
        let clients = ctx.services();
        clients.submit("member", self.count).await?;
        clients.check_not_failing(ctx.job_name())?;
        ensure!(
            clients.indexed("member").await >= self.count,
            "members not indexed"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "create-members"
    }
}

async fn create_channels(ctx: Ctx) -> FlowResult {
    let clients = ctx.services();
    let members = clients.indexed("member").await;
    clients.submit("channel", members).await?;
    clients.check_not_failing(ctx.job_name())
}

async fn upload_videos(ctx: Ctx) -> FlowResult {
    let clients = ctx.services();
    let channels = clients.indexed("channel").await;
    clients.submit("video", channels * 2).await?;
    clients.check_not_failing(ctx.job_name())
}

async fn check_video_index(ctx: Ctx) -> FlowResult {
    let clients = ctx.services();
    // Poll until the sibling upload flow shows up in the index.
    for _ in 0..20 {
        if clients.indexed("video").await > 0 {
            return Ok(());
        }
        tokio::time::sleep(clients.latency).await;
    }
    bail!("videos never appeared in the query node")
}

async fn elect_council(ctx: Ctx) -> FlowResult {
    let clients = ctx.services();
    let council_size = ctx
        .env()
        .parse::<u64>("COUNCIL_SIZE")?
        .unwrap_or(3);
    clients.submit("councilor", council_size).await?;
    clients.check_not_failing(ctx.job_name())
}

async fn funding_proposal(ctx: Ctx) -> FlowResult {
    submit_proposal(ctx, "funding").await
}

async fn text_proposal(ctx: Ctx) -> FlowResult {
    submit_proposal(ctx, "text").await
}

/// Proposals share a global counter on chain, so creation is serialized.
async fn submit_proposal(ctx: Ctx, kind: &'static str) -> FlowResult {
    let lease = ctx.lock(PROPOSALS).await;
    let clients = ctx.services();
    let before = clients.indexed("proposal").await;
    clients.submit("proposal", 1).await?;
    let after = clients.indexed("proposal").await;
    lease.release();

    ensure!(after == before + 1, "{kind} proposal raced another proposal");
    clients.check_not_failing(ctx.job_name())
}

async fn post_comments(ctx: Ctx) -> FlowResult {
    let clients = ctx.services();
    let videos = clients.indexed("video").await;
    clients.submit("comment", videos.max(1)).await?;
    clients.check_not_failing(ctx.job_name())
}

fn print_summary(report: &RunReport) {
    println!(
        "{} {} {}",
        "scenario".bold(),
        report.scenario.bold(),
        format!("({})", report.run_id).dimmed()
    );
    for job in &report.jobs {
        let state = format!("{:<10}", job.state);
        let state = match job.state {
            JobState::Succeeded => state.green(),
            JobState::Failed => state.red().bold(),
            JobState::Skipped => state.yellow(),
            _ => state.normal(),
        };
        let elapsed = job
            .duration()
            .map(|d| format!("{}ms", d.as_millis()))
            .unwrap_or_default();
        println!("  {state} {:<12} {}", job.name, elapsed.dimmed());

        for error in &job.errors {
            println!("             {}", error.red());
        }
        if !job.skipped_because.is_empty() {
            println!(
                "             {}",
                format!("requires {}", job.skipped_because.join(", ")).yellow()
            );
        }
    }

    let counts = report.counts();
    let totals = format!(
        "{} jobs: {} succeeded, {} failed, {} skipped in {}ms",
        counts.total,
        counts.succeeded,
        counts.failed,
        counts.skipped,
        report.duration().as_millis()
    );
    if report.is_success() {
        println!("{}", totals.green());
    } else {
        println!("{}", totals.red().bold());
    }
}
