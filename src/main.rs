use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use knotwork_core::config::EngineConfig;
use knotwork_engine::GraphDefinition;

#[derive(Parser)]
#[command(name = "knotwork", version, about = "Graph workflow engine")]
struct Cli {
    /// Path to engine config file
    #[arg(short, long, default_value = "knotwork.toml", env = "KNOTWORK_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph definition file and print its successor table
    Validate {
        /// Graph definition (TOML)
        file: PathBuf,
    },
    /// Show the effective engine configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("knotwork=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "knotwork", &mut std::io::stdout());
        }
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { file } => {
            let config = load_config(&cli.config)?;
            validate(file, &config)?;
        }
    }

    Ok(())
}

/// Engine config from `path`, or defaults when the file does not exist.
fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading engine config");
        Ok(EngineConfig::load(path)?)
    } else {
        Ok(EngineConfig::default())
    }
}

fn validate(file: &Path, config: &EngineConfig) -> anyhow::Result<()> {
    let definition = GraphDefinition::load(file)?;
    let report = definition.validate();

    for warning in &report.warnings {
        warn!("{}", warning);
        println!("warning: {}", warning);
    }
    if !report.is_ok() {
        for error in &report.errors {
            println!("error: {}", error);
        }
        anyhow::bail!(
            "{} is invalid ({} errors)",
            file.display(),
            report.errors.len()
        );
    }

    println!(
        "{}: {} nodes, {} edges, start '{}'",
        definition.display_name(),
        definition.nodes.len(),
        definition.edges.len(),
        definition.start
    );
    for node in &definition.nodes {
        let attempts = node
            .retry
            .as_ref()
            .map_or(config.retry.max_attempts, |r| r.max_attempts);
        println!(
            "  {} [{}, {:?}, {} attempt(s)]",
            node.name, node.kind, node.batch, attempts
        );
        for edge in definition.edges.iter().filter(|e| e.from == node.name) {
            println!("    --{}--> {}", edge.action, edge.to);
        }
    }
    Ok(())
}
