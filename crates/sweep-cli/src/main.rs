use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use sweep_runner::{
    AnsiConsole, Console, PlainConsole, PlanOverrides, PointStatus, SilentConsole, SweepDescription,
    SweepHalt, SweepReport, Truncation,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "sweep=info,sweep_runner=info";

#[derive(Parser)]
#[command(name = "sweep", version = "0.3.0", about = "Adaptive benchmark sweep controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct OverrideArgs {
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Build in release mode regardless of the plan.
    #[arg(long)]
    release: bool,
    /// Use the plan's online config template.
    #[arg(long)]
    online: bool,
    #[arg(long)]
    epsilon: Option<f64>,
    /// Starting allocation for allocation sweeps.
    #[arg(long)]
    start: Option<u32>,
    /// Run duration written into each point's config.
    #[arg(long)]
    duration: Option<u64>,
}

impl From<OverrideArgs> for PlanOverrides {
    fn from(args: OverrideArgs) -> Self {
        PlanOverrides {
            output_dir: args.output_dir,
            release: args.release.then_some(true),
            online: args.online.then_some(true),
            epsilon: args.epsilon,
            start: args.start,
            duration: args.duration,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Run {
        plan: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
        /// Disable coloured progress output.
        #[arg(long)]
        plain: bool,
        #[arg(long)]
        json: bool,
    },
    Describe {
        plan: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[arg(long)]
        json: bool,
    },
    /// Rewrite the truncation function of a source tree.
    Inject {
        #[arg(long)]
        tree: PathBuf,
        /// Packet depth, or `all` for no truncation.
        #[arg(long)]
        depth: Truncation,
        #[arg(long, default_value = "rs")]
        extension: String,
        #[arg(long)]
        json: bool,
    },
    /// List the feature sets (and their hashes) a sweep over these identifiers would build.
    Features {
        identifiers: Vec<String>,
        #[arg(long)]
        fixed: bool,
        #[arg(long)]
        json: bool,
    },
    Ledger {
        output_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            plan,
            overrides,
            plain,
            json,
        } => {
            let console: Arc<dyn Console> = if json {
                Arc::new(SilentConsole)
            } else if plain {
                Arc::new(PlainConsole)
            } else {
                Arc::new(AnsiConsole)
            };
            tracing::info!(plan = %plan.display(), "running sweep plan");
            let report = sweep_runner::run_sweep(&plan, &overrides.into(), console)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "report": serde_json::to_value(&report)?
                })));
            }
            print_report(&report);
        }
        Commands::Describe {
            plan,
            overrides,
            json,
        } => {
            let description = sweep_runner::describe_sweep(&plan, &overrides.into())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": serde_json::to_value(&description)?
                })));
            }
            print_description(&description);
        }
        Commands::Inject {
            tree,
            depth,
            extension,
            json,
        } => {
            let changed = sweep_runner::inject_source(&tree, depth, &extension)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "inject",
                    "depth": depth.to_string(),
                    "changed": changed.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()
                })));
            }
            println!("depth: {}", depth);
            println!("changed: {}", changed.len());
            for path in &changed {
                println!("  {}", path.display());
            }
        }
        Commands::Features {
            identifiers,
            fixed,
            json,
        } => {
            let sets = if fixed {
                sweep_runner::enumerate_fixed(&identifiers)
            } else {
                sweep_runner::enumerate_combinations(&identifiers)?
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "features",
                    "mode": if fixed { "fixed" } else { "combinations" },
                    "sets": serde_json::to_value(&sets)?
                })));
            }
            for set in &sets {
                println!("{}  [{}]", set.hash(), set.comma_joined());
            }
            println!("total: {}", sets.len());
        }
        Commands::Ledger { output_dir, json } => {
            let ledger = sweep_runner::load_ledger(&output_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "ledger",
                    "failures": serde_json::to_value(ledger.entries())?
                })));
            }
            if ledger.is_empty() {
                println!("no failures recorded");
            }
            for entry in ledger.entries() {
                println!("{}", entry);
            }
        }
    }
    Ok(None)
}

fn print_description(description: &SweepDescription) {
    println!("plan_digest: {}", description.plan_digest);
    println!("output_dir: {}", description.output_dir.display());
    println!("outer: {}", description.outer_kind);
    if let Some(step) = description.allocation_step {
        println!("allocation_step: {}", step);
    }
    println!(
        "points: {}",
        description
            .points
            .iter()
            .map(|p| p.label.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("inner_sets: {}", description.inner.len());
    for inner in &description.inner {
        match &inner.features {
            Some(set) => println!("  {}  [{}]", inner.key, set.comma_joined()),
            None => println!("  {}", inner.key),
        }
    }
    println!("total_runs: {}", description.total_runs);
}

fn print_report(report: &SweepReport) {
    println!("output_dir: {}", report.output_dir.display());
    println!("completed: {}", report.count(PointStatus::Completed));
    println!("skipped: {}", report.count(PointStatus::Skipped));
    println!("failed: {}", report.count(PointStatus::Failed));
    match &report.halted {
        Some(SweepHalt::DimensionStop { label, stop_code }) => {
            println!("halted_at: {} ({:?})", label, stop_code)
        }
        Some(SweepHalt::Overload { label, key }) => {
            println!("halted_at: {} / {} (overload)", label, key)
        }
        None => println!("halted_at: none"),
    }
    println!("ledger: {}", report.ledger_path.display());
}

/// One JSON document per invocation on stdout; logs stay on stderr.
fn emit_json(value: &Value) {
    let line = serde_json::to_string(value).unwrap_or_else(|e| {
        json_error("serialization_error", e, Value::Null).to_string()
    });
    println!("{}", line);
}

fn json_error(code: &str, message: impl std::fmt::Display, details: Value) -> Value {
    json!({
        "ok": false,
        "error": { "code": code, "message": message.to_string(), "details": details }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Inject { json, .. }
        | Commands::Features { json, .. }
        | Commands::Ledger { json, .. } => *json,
    }
}
