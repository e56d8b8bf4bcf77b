//! plcsim - Vacuum plant simulator
//!
//! Simulates valves, vacuum pumps and a barometer, cascades commands along
//! device relations and runs evacuate/intake sequences.

use clap::{Parser, Subcommand};
use colored::Colorize;
use plcsim_core::DeviceStatus;
use plcsim_server::{Config, SequenceKind, SequenceOutcome, Simulator};
use plcsim_space::Variant;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "plcsim")]
#[command(about = "Vacuum plant simulator with cascading device control")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "PLCSIM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulator until Ctrl-C
    Run,

    /// List devices with their status
    Devices,

    /// Start a device
    Start {
        /// Browse name or node id
        device: String,

        /// Gas flow (valve), frequency (pump) or series id (barometer)
        param: Option<String>,
    },

    /// Stop a device
    Stop {
        /// Browse name or node id
        device: String,
    },

    /// Pump down until the pressure is below the threshold
    Evacuate {
        #[arg(long, default_value_t = 0.01)]
        threshold: f64,
    },

    /// Let gas in until the pressure is above the threshold
    Intake {
        #[arg(long, default_value_t = 90_000.0)]
        threshold: f64,
    },

    /// Manage device relations
    Relations {
        #[command(subcommand)]
        command: RelationCommands,
    },
}

#[derive(Subcommand)]
enum RelationCommands {
    /// List relations
    List,

    /// Add a parent -> child relation
    Add {
        /// Parent browse name or node id
        parent: String,
        /// Child browse name or node id
        child: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let simulator = Simulator::start(config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            print_devices(&simulator)?;
            println!("{}", "Simulator running, press Ctrl-C to stop".dimmed());
            tokio::signal::ctrl_c().await?;
            tracing::info!("Received shutdown signal");
        }
        Commands::Devices => print_devices(&simulator)?,
        Commands::Start { device, param } => {
            let param = param
                .as_deref()
                .map(Variant::parse_lossy)
                .unwrap_or_else(|| default_param(&simulator, &device));
            let outcome = simulator.control().start_device(&device, &param)?;
            print_outcome(outcome.applied, &outcome.message);
            settle(&simulator).await;
            print_status(&simulator, &device)?;
        }
        Commands::Stop { device } => {
            let outcome = simulator.control().stop_device(&device)?;
            print_outcome(outcome.applied, &outcome.message);
            settle(&simulator).await;
            print_status(&simulator, &device)?;
        }
        Commands::Evacuate { threshold } => {
            run_sequence(&simulator, SequenceKind::Evacuate, threshold).await?
        }
        Commands::Intake { threshold } => {
            run_sequence(&simulator, SequenceKind::Intake, threshold).await?
        }
        Commands::Relations { command } => match command {
            RelationCommands::List => {
                let document = simulator.control().relations();
                if document.relations.is_empty() {
                    println!("{}", "(no relations)".dimmed());
                }
                for record in document.relations {
                    println!(
                        "{} {}",
                        record.browse_name.bold(),
                        record.node_id.to_string().dimmed()
                    );
                    for child in record.children {
                        println!(
                            "  └─ {} {}",
                            child.browse_name,
                            child.node_id.to_string().dimmed()
                        );
                    }
                }
            }
            RelationCommands::Add { parent, child } => {
                if simulator.control().add_relation(&parent, &child)? {
                    println!("{} {} -> {}", "Added".green(), parent, child);
                } else {
                    println!("{} {} -> {} already exists", "Unchanged".yellow(), parent, child);
                }
            }
        },
    }

    simulator.shutdown().await;
    Ok(())
}

/// Loads configuration, preferring an explicit `--config` file.
fn load_config(path: Option<&PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env_overrides();
            config.validate()?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => match Config::load() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Invalid configuration ({}), using defaults", e);
                Config::default()
            }
        },
    };
    Ok(config)
}

/// Start parameter used when none is given on the command line.
fn default_param(simulator: &Simulator, device: &str) -> Variant {
    let dispatcher = &simulator.config().dispatcher;
    match simulator.control().resolve_device(device).map(|d| d.kind) {
        Ok(plcsim_core::DeviceKind::Barometer) => {
            Variant::String(dispatcher.barometer_series.clone())
        }
        Ok(plcsim_core::DeviceKind::VacuumPump) => Variant::Float(dispatcher.pump_speed),
        _ => Variant::Float(dispatcher.valve_flow),
    }
}

/// Waits long enough for a valve transition to settle.
async fn settle(simulator: &Simulator) {
    let settle = simulator.controller().config().settle_time();
    tokio::time::sleep(settle + simulator.config().plant.tick()).await;
}

async fn run_sequence(
    simulator: &Simulator,
    kind: SequenceKind,
    threshold: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{} {} (threshold {})", "Running".cyan(), kind, threshold);
    match simulator.sequencer().run(kind, threshold).await? {
        SequenceOutcome::Completed(report) => {
            println!(
                "{} {} reached {} after {} samples ({}s)",
                "Completed".green(),
                report.kind,
                report.final_reading,
                report.samples,
                report.elapsed().num_seconds()
            );
        }
        SequenceOutcome::AlreadyRunning => {
            println!("{} a sequence is already running", "Not started:".yellow());
        }
        SequenceOutcome::AlreadySatisfied { reading } => {
            println!(
                "{} reading {} already satisfies the threshold",
                "Not needed:".yellow(),
                reading
            );
        }
    }
    Ok(())
}

fn print_outcome(applied: bool, message: &str) {
    if applied {
        println!("{} {}", "OK".green(), message);
    } else {
        println!("{} {}", "--".yellow(), message);
    }
}

fn print_status(simulator: &Simulator, device: &str) -> Result<(), Box<dyn std::error::Error>> {
    let status = simulator.control().device_status(device)?;
    println!("{} is {}", device.bold(), colorize(status));
    Ok(())
}

fn print_devices(simulator: &Simulator) -> Result<(), Box<dyn std::error::Error>> {
    for summary in simulator.control().list_devices()? {
        let value = summary
            .value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<14} {:<12} {:<8} {:>12}  {}",
            summary.device.browse_name.bold(),
            summary.device.kind.to_string(),
            colorize(summary.status),
            value,
            summary.device.id.to_string().dimmed()
        );
    }
    Ok(())
}

fn colorize(status: DeviceStatus) -> colored::ColoredString {
    match status {
        DeviceStatus::Open => status.to_string().green(),
        DeviceStatus::Closed => status.to_string().red(),
        DeviceStatus::Opening | DeviceStatus::Closing => status.to_string().yellow(),
    }
}
