use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use csi_e2e::config::{self, ScenarioSpec, StimulusTiming};
use csi_e2e::metrics;
use csi_e2e::scenario::{ScenarioOptions, Verdict, run_scenario};

#[derive(Parser, Debug)]
#[command(name = "csi-e2e")]
#[command(about = "Service account token scenarios against a mock CSI driver")]
struct Args {
    /// Run only the named scenario (repeatable, default: all)
    #[arg(long = "scenario")]
    scenarios: Vec<String>,

    /// JSON scenario table to run instead of the built-in one
    #[arg(long, env = "SCENARIOS_FILE")]
    scenarios_file: Option<PathBuf>,

    /// Seconds to wait for republish calls before deleting the pod
    #[arg(long, default_value = "5")]
    settle_delay_secs: u64,

    /// Interval between republish calls in milliseconds
    #[arg(long, default_value = "1000")]
    republish_period_ms: u64,

    /// Node ID reported by the driver (defaults to the hostname)
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9092)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Print outcomes as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so --json output stays parseable
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let node_id = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().into_owned(),
    };

    let table = match &args.scenarios_file {
        Some(path) => {
            info!("Loading scenarios from {}", path.display());
            config::load_scenarios(path).await?
        }
        None => config::builtin_scenarios(),
    };
    let selected = select(table, &args.scenarios)?;

    let options = ScenarioOptions::new(node_id).with_timing(StimulusTiming {
        settle_delay: Duration::from_secs(args.settle_delay_secs),
        republish_period: Duration::from_millis(args.republish_period_ms),
    });

    info!("Node ID: {}", options.node_id);
    info!("Settle delay: {:?}", options.timing.settle_delay);
    info!("Republish period: {:?}", options.timing.republish_period);
    info!("Running {} scenario(s)", selected.len());

    let mut outcomes = Vec::with_capacity(selected.len());
    for spec in selected {
        let outcome = run_scenario(&spec.name, spec.config, &options).await?;
        if !args.json {
            match &outcome.verdict {
                Verdict::Pass(summary) => println!(
                    "PASS  {} ({} publish call(s), {:.1}s)",
                    outcome.name, summary.publish_calls, outcome.duration_secs
                ),
                Verdict::Fail(report) => println!("FAIL  {}: {}", outcome.name, report),
            }
        }
        outcomes.push(outcome);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    }

    let failed = outcomes.iter().filter(|o| !o.verdict.is_pass()).count();
    if failed > 0 {
        error!("{} of {} scenario(s) failed", failed, outcomes.len());
        return Err(format!("{} scenario(s) failed", failed).into());
    }

    info!("All {} scenario(s) passed", outcomes.len());
    Ok(())
}

/// Keep only the requested scenarios, in table order.
fn select(table: Vec<ScenarioSpec>, names: &[String]) -> Result<Vec<ScenarioSpec>, String> {
    if names.is_empty() {
        return Ok(table);
    }

    if let Some(unknown) = names
        .iter()
        .find(|name| !table.iter().any(|spec| &spec.name == *name))
    {
        return Err(format!("Unknown scenario '{}'", unknown));
    }

    Ok(table
        .into_iter()
        .filter(|spec| names.contains(&spec.name))
        .collect())
}
