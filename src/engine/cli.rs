//! Polystore CLI Module
//! Command-line interface for project setup and audit inspection

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "polystore")]
#[command(author = "Polystore Team")]
#[command(version)]
#[command(about = "Unified data access with a tamper-evident audit chain", long_about = None)]
pub struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true)]
    pub project: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default polystore.config.json
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Check the audit hash chain of one tenant
    VerifyChain {
        /// Tenant id; omit for records written without a tenant
        #[arg(short, long)]
        tenant: Option<String>,
    },

    /// Print the audit history of one entity
    History {
        #[arg(short, long)]
        tenant: Option<String>,

        /// Model name
        #[arg(short, long)]
        model: String,

        /// Entity id
        #[arg(short, long)]
        entity: String,
    },

    /// List models declared in the config
    Models,

    /// Generate a base64 field encryption key
    Keygen,
}

impl Cli {
    pub fn get_project_dir(&self) -> PathBuf {
        self.project
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}
