use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use edc_core::StrategyType;
use edc_sim::{example_config, MetricsSummary, SimulationConfig, SimulationRunner};

#[derive(Parser)]
#[command(name = "edc-sim")]
#[command(about = "Discrete-event simulator for edge data center resource scheduling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,

        /// Output directory for results
        #[arg(short, long, default_value = "results")]
        output: PathBuf,

        /// Run only this dispatching strategy (emptiest, fullest)
        #[arg(short, long)]
        strategy: Option<String>,

        /// Output format (json, csv, both)
        #[arg(short, long, default_value = "both")]
        format: String,
    },
    /// Generate an example configuration
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "edc-sim.yaml")]
        output: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.verbose)?;

    match cli.command {
        Commands::Run {
            config,
            output,
            strategy,
            format,
        } => run_simulation(config, output, strategy, format),
        Commands::Generate { output } => generate_example(output),
        Commands::Validate { config } => validate_config(config),
    }
}

fn init_tracing(log_level: &str, verbose: bool) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        match log_level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "info" => tracing::Level::INFO,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("edc_sim={}", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow::anyhow!("Path is not valid UTF-8: {:?}", path))
}

fn run_simulation(
    config_path: PathBuf,
    output_dir: PathBuf,
    strategy: Option<String>,
    format: String,
) -> Result<()> {
    if !matches!(format.as_str(), "json" | "csv" | "both") {
        error!("Unknown format: {}. Use 'json', 'csv', or 'both'", format);
        return Err(anyhow::anyhow!("Unknown format: {}", format));
    }

    info!("Loading configuration from {:?}", config_path);
    let config = SimulationConfig::from_yaml_file(path_str(&config_path)?)?;

    info!("Creating simulation runner");
    let runner = SimulationRunner::new(config.clone())?;

    std::fs::create_dir_all(&output_dir)?;
    config.to_yaml_file(path_str(&output_dir.join("config.yaml"))?)?;

    let results = if let Some(name) = strategy {
        let strategy: StrategyType = name.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        info!("Running simulation with strategy: {}", strategy);
        let mut results = BTreeMap::new();
        results.insert(strategy.to_string(), runner.run_single_strategy(strategy)?);
        results
    } else {
        info!("Running simulation with all configured strategies");
        runner.run_all_strategies()?
    };

    for (strategy_name, summary) in &results {
        info!("Exporting results for strategy: {}", strategy_name);
        let strategy_dir = output_dir.join(strategy_name);
        std::fs::create_dir_all(&strategy_dir)?;
        export_summary(summary, &strategy_dir, &format)?;
    }

    if results.len() > 1 {
        info!("Generating strategy comparison");
        let comparison = edc_sim::analysis::compare_strategies(&results);
        std::fs::write(output_dir.join("comparison.csv"), comparison.to_csv())?;
    }

    info!("Simulation completed successfully. Results saved to {:?}", output_dir);
    Ok(())
}

fn export_summary(summary: &MetricsSummary, dir: &Path, format: &str) -> Result<()> {
    if matches!(format, "json" | "both") {
        std::fs::write(dir.join("metrics.json"), summary.to_json()?)?;
    }
    if matches!(format, "csv" | "both") {
        std::fs::write(dir.join("metrics.csv"), summary.to_csv()?)?;
    }
    Ok(())
}

fn generate_example(output_path: PathBuf) -> Result<()> {
    info!("Generating example configuration");
    example_config().to_yaml_file(path_str(&output_path)?)?;
    info!("Example configuration saved to {:?}", output_path);
    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {:?}", config_path);

    let config = SimulationConfig::from_yaml_file(path_str(&config_path)?)?;
    config.validate()?;

    info!("Configuration is valid!");
    info!("  - Duration: {} seconds", config.duration_s);
    info!("  - Racks: {}", config.edc.racks.len());
    info!("  - Total PUs: {}", config.edc.total_pus());
    info!("  - Services: {}", config.workload.services.len());
    info!("  - Strategies: {:?}", config.strategies);

    Ok(())
}
