//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use codevec_core::{ProgressReporter, RunOutcome, UnitReport, run_pipeline};
use codevec_shared::{
    Granularity, PipelineConfig, config_file_path, init_config, load_config,
};
use codevec_vocab::{SegmentRegistry, SegmentRole, SegmentStatus, StopOutcome};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// codevec — batch-vectorize source corpora through a shared-vocabulary
/// pipeline.
#[derive(Parser)]
#[command(
    name = "codevec",
    version,
    about = "Batch-process source corpora into code vectors with resumable, bounded-concurrency orchestration.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the batch pipeline over a corpus root.
    Run {
        /// Corpus root directory.
        root: PathBuf,

        /// Concurrency override (defaults to ~60% of detected cores).
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Output root for artifacts (defaults to config).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Unit granularity: flat or grouped.
        #[arg(short, long)]
        mode: Option<String>,

        /// Dataset name override.
        #[arg(long)]
        dataset: Option<String>,
    },

    /// Shared vocabulary server lifecycle.
    Vocab {
        #[command(subcommand)]
        action: VocabAction,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Vocabulary server subcommands.
#[derive(Subcommand)]
pub(crate) enum VocabAction {
    /// Load the reference tables once and publish the shared segment;
    /// stays resident until stopped.
    Start {
        /// Dataset name override.
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Stop a running segment owner.
    Stop {
        /// Dataset name override.
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Report segment status.
    Status {
        /// Dataset name override.
        #[arg(long)]
        dataset: Option<String>,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "codevec=info",
        1 => "codevec=debug",
        _ => "codevec=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            root,
            jobs,
            out,
            mode,
            dataset,
        } => cmd_run(root, jobs, out, mode.as_deref(), dataset.as_deref()).await,
        Command::Vocab { action } => match action {
            VocabAction::Start { dataset } => cmd_vocab_start(dataset.as_deref()).await,
            VocabAction::Stop { dataset } => cmd_vocab_stop(dataset.as_deref()),
            VocabAction::Status { dataset } => cmd_vocab_status(dataset.as_deref()),
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(
    root: PathBuf,
    jobs: Option<usize>,
    out: Option<PathBuf>,
    mode: Option<&str>,
    dataset: Option<&str>,
) -> Result<()> {
    let config = build_pipeline_config(root, jobs, out, mode, dataset)?;

    info!(
        root = %config.root.display(),
        out = %config.output_root.display(),
        dataset = %config.dataset,
        "starting pipeline"
    );

    let reporter = CliProgress::new();
    let outcome = run_pipeline(config, &reporter).await?;

    // Print summary
    println!();
    println!("  Pipeline run complete!");
    println!("  Run ID:   {}", outcome.run_id);
    println!("  Jobs:     {}", outcome.jobs);
    println!("  Units:    {}", outcome.stats.units);
    println!("  Files:    {}", outcome.stats.files);
    println!("  Success:  {}", outcome.stats.done);
    println!("  Skipped:  {}", outcome.stats.skipped);
    println!("  Errors:   {}", outcome.stats.errors);
    println!("  Contexts: {}", outcome.stats.contexts);
    if outcome.degraded {
        println!("  Note:     ran degraded (direct vocabulary reads)");
    }
    println!("  Time:     {:.1}s", outcome.stats.elapsed.as_secs_f64());
    println!();

    Ok(())
}

fn build_pipeline_config(
    root: PathBuf,
    jobs: Option<usize>,
    out: Option<PathBuf>,
    mode: Option<&str>,
    dataset: Option<&str>,
) -> Result<PipelineConfig> {
    let mut app = load_config()?;
    if let Some(dataset) = dataset {
        app.dataset.name = dataset.to_string();
    }

    let mut config = PipelineConfig::from_app(&app, root)?;
    config.jobs = jobs;
    if let Some(out) = out {
        config.output_root = out;
    }
    if let Some(mode) = mode {
        config.granularity = mode
            .parse::<Granularity>()
            .map_err(codevec_shared::CodevecError::config)?;
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// vocab lifecycle
// ---------------------------------------------------------------------------

async fn cmd_vocab_start(dataset: Option<&str>) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let config = build_pipeline_config(cwd, None, None, None, dataset)?;

    for table in config.histograms.all() {
        if !table.is_file() {
            return Err(codevec_shared::CodevecError::config(format!(
                "vocabulary table not found: {}",
                table.display()
            ))
            .into());
        }
    }

    let registry = SegmentRegistry::new(&config.segment_state_dir);
    let handle = registry
        .acquire(
            &config.dataset,
            &config.histograms,
            (
                config.word_vocab_size,
                config.path_vocab_size,
                config.target_vocab_size,
            ),
            config.poll_attempts,
            config.poll_interval,
        )
        .await?;

    match handle.role() {
        SegmentRole::Borrower => {
            println!("Segment {:?} is already running.", config.dataset);
            println!("  Size: {} bytes", handle.descriptor().byte_size);
            println!("  Owner pid: {}", handle.descriptor().pid);
            handle.release();
        }
        SegmentRole::Owner => {
            println!("Shared vocabulary segment published.");
            println!("  Name: {}", handle.name());
            println!("  Size: {} bytes", handle.descriptor().byte_size);
            println!("  Pid:  {}", handle.descriptor().pid);
            println!();
            println!("Serving. Press Ctrl+C to stop...");

            tokio::signal::ctrl_c().await?;
            println!("Stopping segment...");
            handle.stop();
            println!("Segment stopped.");
        }
    }
    Ok(())
}

fn cmd_vocab_stop(dataset: Option<&str>) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let config = build_pipeline_config(cwd, None, None, None, dataset)?;
    let registry = SegmentRegistry::new(&config.segment_state_dir);

    match registry.request_stop(&config.dataset)? {
        StopOutcome::NotRunning => println!("Segment {:?} is not running.", config.dataset),
        StopOutcome::SignalSent(pid) => {
            println!("Sent SIGTERM to segment owner (pid {pid}).");
        }
        StopOutcome::CleanedStale => {
            println!("Owner was gone; stale segment state cleaned up.");
        }
    }
    Ok(())
}

fn cmd_vocab_status(dataset: Option<&str>) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let config = build_pipeline_config(cwd, None, None, None, dataset)?;
    let registry = SegmentRegistry::new(&config.segment_state_dir);

    match registry.status(&config.dataset) {
        SegmentStatus::Ready(desc) => {
            println!("Segment status: RUNNING");
            println!("  Name:      {}", desc.name);
            println!("  Size:      {} bytes", desc.byte_size);
            println!("  Owner pid: {}", desc.pid);
            println!("  Started:   {}", desc.created_at);
            println!(
                "  Borrowers: {}",
                registry.live_borrowers(&config.dataset)
            );
        }
        SegmentStatus::Starting => println!("Segment status: STARTING"),
        SegmentStatus::Stopping => println!("Segment status: STOPPING"),
        SegmentStatus::Stale(desc) => {
            println!("Segment status: STALE (owner pid {} is gone)", desc.pid);
        }
        SegmentStatus::Absent => println!("Segment status: NOT RUNNING"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config file created: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config = load_config()?;
    let path = config_file_path()?;
    println!("# {}", path.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn unit_done(&self, report: &UnitReport, current: usize, total: usize) {
        self.spinner.set_message(format!(
            "[{current}/{total}] {}/{}: {}",
            report.group, report.unit, report.class
        ));
    }

    fn done(&self, _outcome: &RunOutcome) {
        self.spinner.finish_and_clear();
    }
}
