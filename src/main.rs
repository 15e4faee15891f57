mod blueprint;
mod cancel;
mod command;
mod config;
mod error;
mod git;
mod patch;
mod prompts;
mod scan;
mod state;
mod transport;
mod workflow;

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cancel::cancel_pair;
use crate::config::{Config, ConfigOverrides, TransportMode};
use crate::error::{Result, ReviewError};
use crate::scan::Manifest;
use crate::transport::api::ApiTransport;
use crate::transport::browser::BrowserTransport;
use crate::transport::Transport;
use crate::workflow::Orchestrator;

/// How long the browser transport waits for UI elements and replies.
const UI_WAIT: Duration = Duration::from_secs(90);

const DEFAULT_CHAT_URL: &str = "https://chat.openai.com/";

#[derive(Parser)]
#[command(
    name = "autoreview",
    version,
    about = "Iterative LLM-driven edit/run/fix review loop for git repositories"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit JSON-line logs instead of human-readable ones
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Args)]
struct RunArgs {
    /// Plain-text instructions file
    instructions: PathBuf,

    /// Local git repository path, or a clone URL
    repo: String,

    /// Shell command to verify each completed iteration (e.g. "cargo test")
    #[arg(long)]
    cmd: Option<String>,

    /// Send "continue" automatically instead of waiting for confirmation
    #[arg(long)]
    auto: bool,

    /// Kill the verification command after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Transport: scripted HTTP API or interactive browser session
    #[arg(long, value_enum)]
    mode: Option<TransportMode>,

    /// Model name for the HTTP transport
    #[arg(long)]
    model: Option<String>,

    /// Per-call transport deadline in seconds
    #[arg(long)]
    api_timeout: Option<u64>,

    /// Number of review iterations (1-3)
    #[arg(long)]
    iterations: Option<u32>,

    /// Prefix for per-iteration branches
    #[arg(long)]
    branch_prefix: Option<String>,

    /// Git remote for pushing iteration branches
    #[arg(long)]
    remote: Option<String>,

    /// Do not push branches at the end of iterations
    #[arg(long)]
    no_push: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Full plan-first workflow: blueprints, plan, iterations, error-fix loop
    Iterate(RunArgs),
    /// Single-pass patch loop over the HTTP API (no blueprints or plan)
    Api(RunArgs),
    /// Print the repository manifest with classification tags
    Scan {
        repo: PathBuf,
        /// Manifest line budget before middle truncation
        #[arg(long, default_value_t = 400)]
        max_lines: usize,
    },
    /// Validate a patch payload ('-' reads stdin)
    Validate {
        payload: Option<String>,
        /// Read the payload from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print the canonical patch envelope schema
    Schema,
    /// Print the package version
    Version,
}

impl RunArgs {
    fn overrides(self) -> (PathBuf, String, ConfigOverrides) {
        let overrides = ConfigOverrides {
            mode: self.mode,
            model: self.model,
            api_timeout_secs: self.api_timeout,
            command: self.cmd,
            command_timeout_secs: self.timeout,
            iterations: self.iterations,
            branch_prefix: self.branch_prefix,
            remote: self.remote,
            no_push: self.no_push,
            auto: self.auto,
        };
        (self.instructions, self.repo, overrides)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if cli.log_json || std::env::var("AUTOREVIEW_LOG_JSON").is_ok() {
        builder.json().init();
    } else {
        builder.init();
    }

    if let Err(e) = run(cli.command).await {
        error!("{e}");
        std::process::exit(e.exit_code());
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Iterate(args) => cmd_iterate(args, false).await,
        Commands::Api(args) => cmd_iterate(args, true).await,
        Commands::Scan { repo, max_lines } => cmd_scan(&repo, max_lines),
        Commands::Validate { payload, file } => cmd_validate(payload, file),
        Commands::Schema => {
            println!("{}", serde_json::to_string_pretty(&patch::validator::envelope_schema())?);
            Ok(())
        }
        Commands::Version => {
            println!("autoreview {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn cmd_iterate(args: RunArgs, single_pass: bool) -> Result<()> {
    let (instructions, repo_arg, overrides) = args.overrides();
    let config = Config::build(instructions, overrides)?;

    // URL repos are cloned into a temp dir that lives until we return.
    let (repo, _clone_guard) = resolve_repo(&repo_arg)?;

    let (cancel_source, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel_source.cancel();
        }
    });

    let transport = build_transport(&config).await?;
    let mut orchestrator = Orchestrator::new(config, &repo, transport, cancel)?;

    if single_pass {
        orchestrator.run_single_pass().await
    } else {
        orchestrator.run().await
    }
}

fn cmd_scan(repo: &PathBuf, max_lines: usize) -> Result<()> {
    let manifest = Manifest::scan(repo, &[])?;
    println!("{}", manifest.render(max_lines));
    println!();
    println!("census: {}", manifest.census().join(", "));
    Ok(())
}

fn cmd_validate(payload: Option<String>, file: Option<PathBuf>) -> Result<()> {
    let raw = match (payload.as_deref(), file) {
        (_, Some(path)) => std::fs::read_to_string(path)?,
        (Some("-"), None) => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
        (Some(text), None) => text.to_string(),
        (None, None) => {
            return Err(ReviewError::Config(
                "provide a JSON payload, '-' for stdin, or --file".into(),
            ))
        }
    };

    match patch::validate(&raw) {
        Ok(parsed) => {
            println!("patch is valid: {} {}", parsed.op_name(), parsed.file());
            Ok(())
        }
        Err(e) => {
            eprintln!("patch is invalid: {e}");
            std::process::exit(2);
        }
    }
}

/// Accept a local repository path or a clone URL; URLs are shallow-cloned
/// into a temp directory removed when the guard drops.
fn resolve_repo(arg: &str) -> Result<(PathBuf, Option<tempfile::TempDir>)> {
    let candidate = PathBuf::from(arg);
    if candidate.join(".git").exists() {
        return Ok((candidate.canonicalize()?, None));
    }

    if git::looks_like_git_url(arg) {
        let dir = tempfile::Builder::new().prefix("autoreview-").tempdir()?;
        git::clone_shallow(arg, dir.path())?;
        return Ok((dir.path().to_path_buf(), Some(dir)));
    }

    Err(ReviewError::Config(format!(
        "not a git repository or clone URL: {arg}"
    )))
}

async fn build_transport(config: &Config) -> Result<Box<dyn Transport>> {
    match config.mode {
        TransportMode::Api => Ok(Box::new(ApiTransport::from_env(
            &config.model,
            config.api_timeout(),
        )?)),
        TransportMode::Browser => {
            let chat_url = std::env::var("AUTOREVIEW_CHAT_URL")
                .ok()
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CHAT_URL.to_string());
            let transport = BrowserTransport::connect(
                &config.webdriver_url,
                &chat_url,
                &config.profile_dir,
                config.headless,
                UI_WAIT,
                config.auto,
            )
            .await?;
            Ok(Box::new(transport))
        }
    }
}
