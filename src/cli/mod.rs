//! Command Line Interface module
//!
//! Implements the CLI commands and argument parsing for agentsh.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "agentsh")]
#[command(about = "Remote terminal client for build agents")]
#[command(
    long_about = "Open an interactive shell on a build agent, or run a single command there and print its output"
)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(long, default_value = "agentsh.toml")]
    pub config_file: String,

    /// Build server base URL (overrides the configuration file)
    #[arg(long)]
    pub url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Open an interactive shell on an agent
    Shell {
        /// Agent name
        agent: String,

        /// Terminal columns (defaults to the local terminal width)
        #[arg(long)]
        cols: Option<u16>,

        /// Terminal rows (defaults to the local terminal height)
        #[arg(long)]
        rows: Option<u16>,
    },

    /// Run one command on an agent and print its output
    Exec {
        /// Agent name
        agent: String,

        /// Seconds to wait for the command to finish
        #[arg(long)]
        timeout: Option<u64>,

        /// Command line to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show the default configuration
    Reset,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Adjust log level based on verbose flag
    pub fn effective_log_level(&self, configured: &str) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            self.log_level
                .clone()
                .unwrap_or_else(|| configured.to_string())
        }
    }
}
