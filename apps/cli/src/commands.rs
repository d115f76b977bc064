//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use aipbinder_core::{MergeResult, Pipeline, RunConfig, Stager};
use aipbinder_discovery::{DiscoveryOptions, discover, normalize_icao};
use aipbinder_shared::{
    AppConfig, EventSink, FetchConfig, PipelineEvent, RetrievalTarget, RunId, init_config,
    load_config, parse_target_list,
};
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// aipbinder: bind an aerodrome's AIP sections into one PDF.
#[derive(Parser)]
#[command(
    name = "aipbinder",
    version,
    about = "Download AIP section PDFs with retries and merge them into a single document.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
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
    /// Discover every AIP section for an aerodrome and merge them.
    Fetch {
        /// ICAO location indicator, e.g. UHHH.
        icao: String,

        /// Output PDF (defaults to <output_dir>/<ICAO>.pdf).
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Merge the documents listed in a file (`<url> & <label>` per line).
    Merge {
        /// Target list file.
        list: PathBuf,

        /// Output PDF.
        #[arg(short, long)]
        out: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Flags shared by every command that runs the pipeline.
#[derive(Args, Debug, Default)]
pub(crate) struct RunArgs {
    /// Attempts per document before giving up.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Delay between attempts, in milliseconds.
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    /// Documents downloaded at once.
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Print the run summary as JSON.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Apply flag overrides on top of the configured fetch policy.
    fn fetch_config(&self, config: &AppConfig) -> FetchConfig {
        let mut fetch = FetchConfig::from(config);
        if let Some(n) = self.max_attempts {
            fetch.max_attempts = n;
        }
        if let Some(ms) = self.retry_delay_ms {
            fetch.retry_delay = Duration::from_millis(ms);
        }
        if let Some(n) = self.concurrency {
            fetch.concurrency = n;
        }
        fetch
    }
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
        0 => "aipbinder=info",
        1 => "aipbinder=debug",
        _ => "aipbinder=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Fetch { icao, out, run } => cmd_fetch(&icao, out, &run).await,
        Command::Merge { list, out, run } => cmd_merge(&list, out, &run).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

async fn cmd_fetch(icao: &str, out: Option<PathBuf>, args: &RunArgs) -> Result<()> {
    let config = load_config()?;
    let icao = normalize_icao(icao)?;
    let opts = DiscoveryOptions::from_config(&config.source)?;

    info!(%icao, "discovering AIP sections");
    let targets = discover(&icao, &opts).await?;

    if targets.is_empty() {
        println!("No AIP sections found for {icao}.");
        return Ok(());
    }

    if !args.json {
        println!("Found {} AIP sections for {icao}:", targets.len());
        for target in &targets {
            println!("  {} ({})", target.label, target.location);
        }
    }

    let out = out.unwrap_or_else(|| {
        PathBuf::from(&config.defaults.output_dir).join(format!("{icao}.pdf"))
    });

    bind(&config, &targets, out, args).await
}

async fn cmd_merge(list: &Path, out: PathBuf, args: &RunArgs) -> Result<()> {
    let config = load_config()?;
    let content = std::fs::read_to_string(list)
        .wrap_err_with(|| format!("cannot read target list {}", list.display()))?;
    let targets = parse_target_list(&content)?;

    info!(list = %list.display(), targets = targets.len(), "merging listed documents");

    bind(&config, &targets, out, args).await
}

/// Run the pipeline over `targets` and report the outcome.
async fn bind(
    config: &AppConfig,
    targets: &[RetrievalTarget],
    out: PathBuf,
    args: &RunArgs,
) -> Result<()> {
    let fetch = args.fetch_config(config);
    let run = RunConfig {
        run_id: RunId::new(),
        output_path: out,
    };
    let pipeline = Pipeline::new(run, &fetch, Stager::new(config.staging_root()))?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            ctrl_c.cancel();
        }
    });

    let reporter = CliProgress::new(targets.len());
    let result = pipeline.run(targets, &reporter, &cancel).await;
    reporter.finish();
    let result = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    if result.total > 0 && result.succeeded_count == 0 {
        return Err(eyre!("none of the {} documents could be merged", result.total));
    }
    Ok(())
}

fn print_summary(result: &MergeResult) {
    println!();
    println!(
        "  Merged {}/{} documents",
        result.succeeded_count, result.total
    );
    if !result.failures.is_empty() {
        println!("  Failed:");
        for failure in &result.failures {
            println!("    - {}: {}", failure.target.label, failure.reason);
        }
    }
    if let Some(path) = &result.output {
        println!("  Output: {}", path.display());
    }
    let elapsed = result.finished_at - result.started_at;
    println!(
        "  Time:   {:.1}s",
        elapsed.num_milliseconds() as f64 / 1000.0
    );
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Renders pipeline events on an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl EventSink for CliProgress {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::RunStarted { total, .. } => {
                self.bar.set_message(format!("Downloading {total} documents"));
            }
            PipelineEvent::AttemptFailed {
                label,
                attempt,
                max_attempts,
                cause,
                ..
            } => {
                self.bar
                    .set_message(format!("{label}: attempt {attempt}/{max_attempts} failed ({cause})"));
            }
            PipelineEvent::TargetFetched { label, .. } => {
                self.bar.set_message(format!("Fetched {label}"));
            }
            PipelineEvent::TargetMerged { label, .. } => {
                self.bar.inc(1);
                self.bar.set_message(format!("Merged {label}"));
            }
            PipelineEvent::TargetFailed { label, .. } => {
                self.bar.inc(1);
                self.bar.println(format!("  skipped: {label}"));
            }
            PipelineEvent::OutputWritten { path } => {
                self.bar.set_message(format!("Wrote {}", path.display()));
            }
            PipelineEvent::RunFinished { .. } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
