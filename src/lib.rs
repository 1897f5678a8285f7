//! Tunedex - an in-memory media library index.
//!
//! Tracks which audio files exist under a set of library folders, keeps
//! their metadata in sync with the disk (scans, file watching, removable
//! volumes), groups songs into albums, and persists the whole index between
//! runs. The `tunedex` binary drives it from the command line.

pub mod cli;
pub mod config;
pub mod error;
pub mod library;
pub mod metadata;
#[cfg(test)]
pub mod test_utils;
