mod config;
mod error;
mod layout;
mod scenarios;
mod sim;

use clap::{Parser, Subcommand};
use config::SimConfig;
use error::CliError;
use layout::RegionLayout;
use scenarios::Scenario;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "esn")]
#[command(about = "ESN async page fault simulator")]
struct Cli {
    /// JSON simulation config; flags and ESN_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a multi-vcpu expropriation workload and print a JSON report
    Run {
        /// Number of vcpus
        #[arg(long)]
        vcpus: Option<u32>,

        /// Expropriations taken by each vcpu
        #[arg(long)]
        faults: Option<u32>,

        /// Notification region size in bytes
        #[arg(long)]
        region_bytes: Option<usize>,

        /// log2 of the number of waiter buckets
        #[arg(long)]
        bucket_bits: Option<u32>,

        /// Page-in latency in milliseconds
        #[arg(long)]
        latency_ms: Option<u64>,
    },
    /// Replay a reference interleaving (all of them if none is given)
    Scenario {
        #[arg(value_enum)]
        name: Option<Scenario>,
    },
    /// Print the notification region geometry for a size
    Layout {
        /// Region size in bytes
        #[arg(long, default_value_t = esn_core::PAGE_SIZE)]
        bytes: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            vcpus,
            faults,
            region_bytes,
            bucket_bits,
            latency_ms,
        } => {
            let mut config = match &cli.config {
                Some(path) => SimConfig::load(path)?,
                None => SimConfig::default(),
            };
            if let Some(v) = vcpus {
                config.vcpus = v;
            }
            if let Some(v) = faults {
                config.faults_per_vcpu = v;
            }
            if let Some(v) = region_bytes {
                config.region_bytes = v;
            }
            if let Some(v) = bucket_bits {
                config.bucket_bits = v;
            }
            if let Some(v) = latency_ms {
                config.latency_ms = v;
            }
            config.apply_env()?;
            config.validate()?;

            let report = sim::simulate(config).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Scenario { name } => {
            let selected = match name {
                Some(s) => vec![s],
                None => Scenario::ALL.to_vec(),
            };
            let reports = tokio::task::spawn_blocking(move || {
                selected
                    .into_iter()
                    .map(scenarios::run)
                    .collect::<Result<Vec<_>, CliError>>()
            })
            .await??;
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Commands::Layout { bytes } => {
            let layout = RegionLayout::for_size(bytes)?;
            println!("{}", serde_json::to_string_pretty(&layout)?);
        }
    }

    Ok(())
}
