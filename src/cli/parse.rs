//! CLI parse: clap types for docforge. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// docforge - turn source documents into one compiled LaTeX document
#[derive(Parser)]
#[command(name = "docforge")]
#[command(about = "Generate and compile LaTeX documents from source documents with an LLM pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".", global = true)]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false", global = true)]
    pub verbose: bool,

    /// Disable logging entirely
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, file+stderr)
    #[arg(long, global = true)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full pipeline over a set of source documents
    Generate {
        /// Template id
        #[arg(long, default_value = "default")]
        template: String,

        /// Source documents (plain text, Markdown or LaTeX)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Write the final document here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Print pipeline events as JSON lines on stdout
        #[arg(long)]
        json_events: bool,
    },
    /// Compile an existing document, repairing it automatically on failure
    Compile {
        /// LaTeX document to compile
        file: PathBuf,

        /// Template whose support directories are made available to the compiler
        #[arg(long, default_value = "default")]
        template: String,

        /// Compile once without automated repair
        #[arg(long)]
        no_fix: bool,

        /// Override the fix-loop retry limit
        #[arg(long)]
        max_retries: Option<usize>,
    },
    /// List available templates
    Templates {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
}
