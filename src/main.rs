use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use tandem::config::SimConfig;
use tandem::orchestration::PoolOrchestrator;
use tandem::state::JsonStore;
use tandem::{tlog, tlog_error, Error, Result};

/// Tandem - pair-programming delivery simulator with cross-team coordination
#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    TANDEM_DEBUG=1      Enable debug logging (alternative to --debug)\n    TANDEM_LOG=LEVEL    Log level: error, warn, info, debug, trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.tandem/tandem.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a simulation
    Run {
        /// Config file (default: ~/.tandem/tandem.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the number of cycles
        #[arg(long)]
        cycles: Option<u32>,

        /// Override the random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Persist boards, loans and the audit trail under this directory
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },

    /// Check a config file without running it
    Validate {
        /// Config file (default: ~/.tandem/tandem.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Write a sample config to ~/.tandem/tandem.toml
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    tandem::log::init(cli.debug);

    let result = match cli.command {
        Command::Run {
            config,
            cycles,
            seed,
            json,
            state_dir,
        } => run_simulation(config, cycles, seed, json, state_dir),
        Command::Validate { config } => run_validate(config),
        Command::Init { force } => run_init(force),
    };

    if let Err(e) = result {
        tlog_error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn config_path(path: Option<PathBuf>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path),
        None => SimConfig::default_path(),
    }
}

fn load_config(path: &Path) -> Result<SimConfig> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "{} not found (run `tandem init` to create one)",
            path.display()
        )));
    }
    SimConfig::load(path)
}

fn run_simulation(
    config: Option<PathBuf>,
    cycles: Option<u32>,
    seed: Option<u64>,
    json: bool,
    state_dir: Option<PathBuf>,
) -> Result<()> {
    let path = config_path(config)?;
    let mut config = load_config(&path)?;
    if let Some(cycles) = cycles {
        config.simulation.cycles = cycles;
    }
    if let Some(seed) = seed {
        config.simulation.seed = Some(seed);
    }
    tlog!("Run command: config={} cycles={}", path.display(), config.simulation.cycles);

    let mut orchestrator = PoolOrchestrator::new(&config)?;
    if let Some(dir) = state_dir {
        orchestrator = orchestrator.with_store(Arc::new(JsonStore::open(&dir)?));
    }

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(orchestrator.run())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

fn run_validate(config: Option<PathBuf>) -> Result<()> {
    let path = config_path(config)?;
    let config = load_config(&path)?;
    let workers: usize = config.teams.iter().map(|t| t.workers.len()).sum();
    println!(
        "{}: ok ({} teams, {} workers, {} cycles)",
        path.display(),
        config.teams.len(),
        workers,
        config.simulation.cycles
    );
    Ok(())
}

fn run_init(force: bool) -> Result<()> {
    let path = SimConfig::default_path()?;
    if path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    SimConfig::sample().save(&path)?;
    println!("Wrote sample config to {}", path.display());
    Ok(())
}
