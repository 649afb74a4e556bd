use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use benchtop::config::{BenchtopConfig, LogFormat, LoggingConfig};
use benchtop::plan::TestPlan;

#[derive(Parser)]
#[command(
    name = "benchtop",
    about = "Phase sequencer for hardware test stations",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $BENCHTOP_CONFIG, then /etc/benchtop/benchtop.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test plan
    Run {
        /// Plan file (TOML)
        #[arg(long)]
        plan: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Deadline in milliseconds for phases without their own timeout
        #[arg(long, env = "BENCHTOP_DEFAULT_TIMEOUT_MS")]
        default_timeout_ms: Option<u64>,
    },

    /// Check a test plan without running it
    Validate {
        /// Plan file (TOML)
        #[arg(long)]
        plan: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let resolved = BenchtopConfig::resolve(cli.config.as_deref())?;
    init_tracing(&resolved.config.logging);
    resolved.log();
    let mut config = resolved.config;

    match cli.command {
        Commands::Run {
            plan,
            json,
            default_timeout_ms,
        } => {
            if let Some(ms) = default_timeout_ms {
                config.executor.phase_default_timeout_ms = ms;
            }
            let plan = TestPlan::load(&plan)?;
            tracing::info!(plan = %plan.name, "Running test plan");
            let report = benchtop::run_plan(&plan, &config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render_table());
            }
            if report.is_pass() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Validate { plan } => {
            let plan = TestPlan::load(&plan)?;
            println!("Plan '{}' is valid ({} phases):", plan.name, plan.phases.len());
            for spec in &plan.phases {
                let timeout = spec
                    .timeout()
                    .map(|t| format!("{}ms", t.as_millis()))
                    .unwrap_or_else(|| "default".to_string());
                println!(" - {:<25} {:<12} timeout={}", spec.name, spec.command, timeout);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
