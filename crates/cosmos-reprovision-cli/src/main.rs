//! cosmos-reprovision CLI - re-provision shared database throughput.

use clap::{Args, Parser, Subcommand};
use cosmos_reprovision::{Config, Orchestrator, ReprovisionError, ReprovisionResult};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "cosmos-reprovision")]
#[command(about = "Re-provision the shared throughput of a database by copy-out, recreate and copy-back")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new re-provisioning run
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// Dry run: list containers and show the final throughput without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Exit with code 5 if any document failed to copy
        #[arg(long)]
        fail_on_document_loss: bool,
    },

    /// Resume a previously interrupted run
    Resume {
        /// Overrides the interrupted run was started with
        #[command(flatten)]
        overrides: Overrides,

        /// Exit with code 5 if any document failed to copy
        #[arg(long)]
        fail_on_document_loss: bool,
    },

    /// Test the store endpoint and credentials
    HealthCheck,
}

/// Config overrides shared by `run` and `resume`.
#[derive(Args)]
struct Overrides {
    /// Override the database to re-provision
    #[arg(long)]
    database: Option<String>,

    /// Override the temporary database throughput (RU/s)
    #[arg(long)]
    temp_throughput: Option<u32>,

    /// Override the final throughput per container (RU/s)
    #[arg(long)]
    throughput_per_container: Option<u32>,

    /// Cap concurrent document writes within a page
    #[arg(long)]
    max_concurrent_writes: Option<usize>,
}

impl Overrides {
    fn apply(self, config: &mut Config) -> Result<(), ReprovisionError> {
        if let Some(db) = self.database {
            config.migration.database = db;
        }
        if let Some(ru) = self.temp_throughput {
            config.migration.temp_throughput = ru;
        }
        if let Some(ru) = self.throughput_per_container {
            config.migration.throughput_per_container = ru;
        }
        if let Some(n) = self.max_concurrent_writes {
            config.migration.max_concurrent_writes = Some(n);
        }
        config.validate()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ReprovisionError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            overrides,
            dry_run,
            fail_on_document_loss,
        } => {
            overrides.apply(&mut config)?;

            let mut orchestrator = Orchestrator::from_config(config)?;

            if dry_run {
                let plan = orchestrator.plan().await?;
                if cli.output_json {
                    println!("{}", plan.to_json()?);
                } else {
                    println!("\nDry run completed!");
                    println!("  Database: {}", plan.database);
                    println!("  Containers: {}", plan.containers.len());
                    for container in &plan.containers {
                        println!(
                            "    {} (partition key {})",
                            container.id, container.partition_key_path
                        );
                    }
                    println!("  Copy throughput: {}RUs", plan.temp_throughput);
                    println!(
                        "  Final throughput: {}RUs ({} per container)",
                        plan.final_throughput, plan.throughput_per_container
                    );
                }
                return Ok(());
            }

            if let Some(ref path) = cli.state_file {
                orchestrator = orchestrator.with_state_file(path.clone());
            }

            let result = orchestrator.run().await?;
            print_result(&result, cli.output_json, "Re-provisioning completed!")?;

            if fail_on_document_loss {
                result.ensure_no_document_loss()?;
            }
        }

        Commands::Resume {
            overrides,
            fail_on_document_loss,
        } => {
            let state_file = cli.state_file.ok_or_else(|| {
                ReprovisionError::Config("--state-file is required for resume".to_string())
            })?;
            // The state file is keyed on the effective config, overrides included
            overrides.apply(&mut config)?;

            let orchestrator = Orchestrator::from_config(config)?
                .with_state_file(state_file)
                .resume()?;

            let result = orchestrator.run().await?;
            print_result(&result, cli.output_json, "Re-provisioning resumed and completed!")?;

            if fail_on_document_loss {
                result.ensure_no_document_loss()?;
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::from_config(config.clone())?;
            orchestrator.health_check().await?;

            if cli.output_json {
                let report = serde_json::json!({
                    "healthy": true,
                    "endpoint": config.store.endpoint,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Health Check Results:");
                println!("  Store ({}): OK", config.store.endpoint);
            }
        }
    }

    Ok(())
}

fn print_result(
    result: &ReprovisionResult,
    output_json: bool,
    headline: &str,
) -> Result<(), ReprovisionError> {
    if output_json {
        println!("{}", result.to_json()?);
        return Ok(());
    }

    println!("\n{}", headline);
    println!("  Run ID: {}", result.run_id);
    println!("  Database: {}", result.database);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!("  Containers: {}", result.containers.len());
    if let Some(ru) = result.final_throughput {
        println!("  Final throughput: {}RUs", ru);
    }
    println!(
        "  Documents: {} submitted, {} failed",
        result.documents_submitted, result.documents_failed
    );
    for failed in &result.failed_documents {
        println!(
            "    {} {}: {}",
            failed.container,
            failed.document_id.as_deref().unwrap_or("<no id>"),
            failed.reason
        );
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
