// CLI module - command-line argument parsing and handlers
//
// The binary takes a YAML config file and an optional listen override.
// The `config` subcommand inspects configuration without starting the
// proxy: --show prints the effective config, --check validates it,
// --path echoes the file path.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::{Config, VERSION};

/// llmsnap - model-swapping proxy for local inference servers
#[derive(Parser)]
#[command(name = "llmsnap")]
#[command(version = VERSION)]
#[command(about = "OpenAI-compatible proxy that swaps local inference servers on demand", long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Override the listen address from the config file
    #[arg(long)]
    pub listen: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Validate the configuration and exit
        #[arg(long)]
        check: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle CLI subcommands. Returns true if one was handled (exit after).
pub fn handle_command(cli: &Cli) -> Result<bool> {
    match &cli.command {
        Some(Commands::Config { show, check, path }) => {
            if *path {
                println!("{}", cli.config.display());
            } else if *show {
                let config = Config::load(&cli.config)?;
                println!("{config:#?}");
            } else if *check {
                Config::load(&cli.config)?;
                println!("{} is valid", cli.config.display());
            } else {
                println!("Usage: llmsnap config [--show|--check|--path]");
            }
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let cli = Cli::parse_from(["llmsnap"]);
        assert_eq!(cli.config, PathBuf::from("config.yaml"));
        assert!(cli.listen.is_none());
        assert!(cli.command.is_none());
    }

    #[test]
    fn parses_overrides_and_subcommand() {
        let cli = Cli::parse_from([
            "llmsnap",
            "--config",
            "/etc/llmsnap.yaml",
            "--listen",
            "0.0.0.0:9000",
            "config",
            "--check",
        ]);
        assert_eq!(cli.config, PathBuf::from("/etc/llmsnap.yaml"));
        assert_eq!(cli.listen.as_deref(), Some("0.0.0.0:9000"));
        assert!(matches!(
            cli.command,
            Some(Commands::Config { check: true, .. })
        ));
    }
}
