//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Playing rounds of the riddle game in the terminal
//! - Generating a single riddle
//! - Inspecting the effective configuration

pub mod commands;
pub mod display;
pub mod handlers;
pub mod options;

pub use handlers::{handle_config, handle_play, handle_riddle, init_logging};

use clap::Parser;
use std::path::PathBuf;

use crate::cli::commands::Commands;
use crate::cli::options::LoggingArgs;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}
