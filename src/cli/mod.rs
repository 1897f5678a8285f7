//! Command-line interface for tunedex.
//!
//! This module provides CLI commands for scanning the library, listing
//! albums and watching library folders for changes.

mod commands;

pub use commands::{Cli, Commands, run_command};
