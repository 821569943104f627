use clap::{command, Parser, Subcommand};
use scenario_stress::config::RunOptions;
use scenario_stress::plan::{RequestPlan, ScriptConfig};
use scenario_stress::{Engine, EngineError, EnvConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Every threshold held.
const EXIT_PASSED: i32 = 0;
/// The run could not start (bad config, setup failure).
const EXIT_FATAL: i32 = 1;
/// The run completed but at least one threshold was crossed.
const EXIT_THRESHOLDS_FAILED: i32 = 99;

#[derive(Parser)]
#[command(name = "scenario-stress")]
#[command(about = "Scenario based HTTP load testing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scenarios and request plan described in a JSON document
    Run {
        config: PathBuf,

        /// Directory for summary artifacts
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,

        /// Also write the full summary as JSON to this path
        #[arg(long)]
        summary_export: Option<PathBuf>,

        #[arg(long, short)]
        verbose: bool,
    },
    /// Print the resolved scenarios, thresholds and requests without running
    Inspect { config: PathBuf },
}

type CliError = Box<dyn std::error::Error>;

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,scenario_stress=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            output_dir,
            summary_export,
            verbose,
        } => {
            init_tracing(verbose);
            run(&config, output_dir, summary_export).await
        }
        Commands::Inspect { config } => {
            init_tracing(false);
            inspect(&config).await.map(|()| EXIT_PASSED)
        }
    };

    match result {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{}", e);
            exit(EXIT_FATAL);
        }
    }
}

async fn load(path: &Path) -> Result<(ScriptConfig, RunOptions, EnvConfig), CliError> {
    let script = ScriptConfig::load(path).await?;
    let options = script.options.resolve()?;
    let env = envy::prefixed("STRESS_").from_env::<EnvConfig>()?;
    Ok((script, options, env))
}

async fn run(
    path: &Path,
    output_dir: PathBuf,
    summary_export: Option<PathBuf>,
) -> Result<i32, CliError> {
    let (script, options, env) = load(path).await?;
    let options = options.with_output_dir(output_dir);

    println!("Starting load test:");
    println!("  Config: {}", path.display());
    for scenario in &options.scenarios {
        println!(
            "  Scenario {}: {} for {:?} (starts at {:?})",
            scenario.name,
            scenario.executor.kind(),
            scenario.executor.duration(),
            scenario.start_time
        );
    }
    println!("  Requests per iteration: {}", script.requests.len());
    println!("  Thresholds: {}", options.thresholds.len());
    println!();

    let client = scenario_stress::ReqwestClient::new(&options.http)?;
    let registry = std::sync::Arc::new(scenario_stress::MetricsRegistry::new());
    let plan = RequestPlan::new(&script, &env, &registry)?;
    let engine = Engine::with_http_client(options, plan, std::sync::Arc::new(client))
        .with_registry(registry);

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let outcome = match engine.run_with_shutdown(shutdown).await {
        Ok(outcome) => outcome,
        Err(e @ (EngineError::Setup(_) | EngineError::SetupTimeout(_))) => {
            eprintln!("Run aborted before any scenario started: {}", e);
            return Ok(EXIT_FATAL);
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(export_path) = summary_export {
        fs::write(&export_path, serde_json::to_string_pretty(&outcome.summary)?)?;
        println!("Summary saved to: {}", export_path.display());
    }

    if outcome.passed() {
        Ok(EXIT_PASSED)
    } else {
        for failed in outcome.summary.failed_thresholds() {
            eprintln!(
                "Threshold crossed: {} {} (observed {:?})",
                failed.selector, failed.expression, failed.observed
            );
        }
        Ok(EXIT_THRESHOLDS_FAILED)
    }
}

async fn inspect(path: &Path) -> Result<(), CliError> {
    let (script, options, env) = load(path).await?;
    println!("{}", serde_json::to_string_pretty(&options.scenarios)?);
    println!();
    for threshold in &options.thresholds {
        let abort = if threshold.abort_on_fail {
            format!(" (abort on fail after {:?})", threshold.delay_abort_eval)
        } else {
            String::new()
        };
        println!("  threshold {}: {}{}", threshold.selector, threshold.source, abort);
    }
    println!();

    let registry = scenario_stress::MetricsRegistry::new();
    let plan = RequestPlan::new(&script, &env, &registry)?;
    for (name, method, url) in plan.describe() {
        println!("  {} {} {}", name, method, url);
    }
    println!(
        "  planned duration: {}",
        humantime::format_duration(options.planned_duration())
    );
    Ok(())
}
