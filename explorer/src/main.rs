//! Command-line entry point for the screen explorer.
//!
//! `explorer run` drives a device over adb and prints a JSON summary of the
//! session; `explorer steps` shows how a goal prompt is decomposed.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use explorer::core::fingerprint::StateGraph;
use explorer::core::progress::{GoalProgress, extract_steps, next_step_hints};
use explorer::core::types::{ActionKind, ExplorationMode};
use explorer::error::ExploreError;
use explorer::exit_codes;
use explorer::explore::{ExploreOutcome, Explorer};
use explorer::io::config::{DEFAULT_CONFIG_FILE, ExplorerConfig, load_config, write_config};
use explorer::io::device::AdbDriver;
use explorer::io::oracle::CommandOracle;
use explorer::io::vision::CommandVision;
use explorer::logging;
use explorer::oracle_client::{ClientSettings, DecisionOracleClient};
use explorer::session::TracingObserver;

#[derive(Parser)]
#[command(
    name = "explorer",
    version,
    about = "Budgeted, goal-guided exploration of a mobile app's screens"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Target app package to put in the config.
        #[arg(long)]
        app: Option<String>,
    },
    /// Explore the app on the connected device and print a JSON summary.
    Run {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Target app package (overrides `exploration.app_id`).
        #[arg(long)]
        app: Option<String>,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        #[arg(long)]
        max_states: Option<usize>,
        #[arg(long)]
        max_depth: Option<usize>,
        /// Goal prompt, optionally with a `[Title]` and numbered steps.
        #[arg(long)]
        goal: Option<String>,
        /// Stop the session after this many seconds.
        #[arg(long)]
        session_timeout_secs: Option<u64>,
    },
    /// Print the steps and opening hint extracted from a goal prompt.
    Steps {
        goal: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Sequential,
    Reverse,
    OracleGuided,
}

impl From<ModeArg> for ExplorationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Sequential => ExplorationMode::Sequential,
            ModeArg::Reverse => ExplorationMode::Reverse,
            ModeArg::OracleGuided => ExplorationMode::OracleGuided,
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force, config, app } => cmd_init(&config, app, force),
        Command::Run {
            config,
            app,
            mode,
            max_states,
            max_depth,
            goal,
            session_timeout_secs,
        } => {
            let mut cfg = load_config(&config)?;
            let exploration = &mut cfg.exploration;
            if let Some(app) = app {
                exploration.app_id = app;
            }
            if let Some(mode) = mode {
                exploration.mode = mode.into();
            }
            if let Some(max_states) = max_states {
                exploration.max_states = max_states;
            }
            if let Some(max_depth) = max_depth {
                exploration.max_depth = max_depth;
            }
            if goal.is_some() {
                exploration.goal_prompt = goal;
            }
            cmd_run(cfg, session_timeout_secs.map(Duration::from_secs))
        }
        Command::Steps { goal } => {
            cmd_steps(&goal);
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(path: &Path, app: Option<String>, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let mut cfg = ExplorerConfig::default();
    if let Some(app) = app {
        cfg.exploration.app_id = app;
    }
    write_config(path, &cfg)?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

/// Session summary printed on stdout.
#[derive(Debug, Serialize)]
struct RunSummary {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    states: usize,
    clicks: usize,
    revisits: usize,
    graph: StateGraph,
}

fn cmd_run(cfg: ExplorerConfig, session_timeout: Option<Duration>) -> Result<i32> {
    cfg.validate().context("invalid config")?;

    let driver = AdbDriver::new(&cfg.device);
    let mut client = DecisionOracleClient::new(
        CommandOracle::new(&cfg.oracle),
        CommandVision::new(&cfg.vision),
        ClientSettings::from_config(&cfg),
    )?;
    let explorer = Explorer::global();

    if let Some(timeout) = session_timeout {
        let handle = explorer.stop_handle();
        thread::spawn(move || {
            thread::sleep(timeout);
            tracing::warn!(timeout_secs = timeout.as_secs(), "session timeout; stopping");
            handle.stop();
        });
    }

    let result = explorer
        .explore(&driver, cfg.exploration, &mut client, &mut TracingObserver)
        .context("start exploration")?;

    let count = |kind: ActionKind| result.history.iter().filter(|e| e.action == kind).count();
    let summary = RunSummary {
        outcome: result.outcome.as_str(),
        error: match &result.outcome {
            ExploreOutcome::Failed(err) => Some(err.to_string()),
            _ => None,
        },
        states: result.states.len(),
        clicks: count(ActionKind::Click),
        revisits: count(ActionKind::Revisit),
        graph: result.graph.clone(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("serialize summary")?
    );

    Ok(match result.outcome {
        ExploreOutcome::Completed | ExploreOutcome::Exhausted => exit_codes::OK,
        ExploreOutcome::Stopped => exit_codes::STOPPED,
        ExploreOutcome::Failed(ExploreError::ScopeLoss { .. }) => exit_codes::SCOPE_LOST,
        ExploreOutcome::Failed(_) => exit_codes::INVALID,
    })
}

fn cmd_steps(goal: &str) {
    let parsed = extract_steps(goal);
    if let Some(title) = &parsed.title {
        println!("{title}");
    }
    if parsed.steps.is_empty() {
        println!("no numbered steps; the goal is treated as open-ended");
        return;
    }
    for (i, step) in parsed.steps.iter().enumerate() {
        println!("{}. {step}", i + 1);
    }
    for hint in next_step_hints(&GoalProgress::from_history(parsed.steps, &[])) {
        println!("{hint}");
    }
}
