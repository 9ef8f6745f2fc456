//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cloudpull_core::config::{DEFAULT_WALKER_WORKERS, DEFAULT_WORKERS};

/// Resumable one-way Google Drive folder synchronizer.
///
/// CloudPull walks a remote folder tree, downloads its files concurrently
/// with byte-range resume and checksum verification, and persists enough
/// state that an interrupted sync picks up where it left off.
#[derive(Parser, Debug)]
#[command(name = "cloudpull")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Directory holding the state database
    #[arg(long, default_value = ".cloudpull", global = true)]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a new sync of a remote folder into a local destination
    Sync {
        /// Remote id of the folder to sync
        folder_id: String,

        /// Local destination directory
        dest: PathBuf,

        /// Concurrent download workers (1-100)
        #[arg(short = 'c', long, default_value_t = DEFAULT_WORKERS as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
        workers: u8,

        /// Concurrent folder listers (1-100)
        #[arg(long, default_value_t = DEFAULT_WALKER_WORKERS as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
        walker_workers: u8,

        /// Global bandwidth cap in bytes/sec (0 = unlimited)
        #[arg(short = 'b', long, default_value_t = 0)]
        bandwidth_limit: u64,

        /// Follow shortcuts to folders and files
        #[arg(long)]
        follow_shortcuts: bool,

        /// Maximum folder depth below the root (-1 = unlimited)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        max_depth: i64,

        /// Glob patterns to exclude (repeatable)
        #[arg(long = "exclude")]
        exclude_patterns: Vec<String>,

        /// Glob patterns to include (repeatable; empty = everything)
        #[arg(long = "include")]
        include_patterns: Vec<String>,

        /// Enumerate the tree without downloading anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume an interrupted session
    Resume {
        /// Session id to resume
        session_id: i64,
    },

    /// List sessions and their status
    Sessions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_sync_defaults() {
        let args = Args::try_parse_from(["cloudpull", "sync", "root123", "/tmp/dest"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        let Command::Sync {
            folder_id,
            dest,
            workers,
            walker_workers,
            dry_run,
            max_depth,
            ..
        } = args.command
        else {
            panic!("expected sync command");
        };
        assert_eq!(folder_id, "root123");
        assert_eq!(dest, PathBuf::from("/tmp/dest"));
        assert_eq!(workers, 3);
        assert_eq!(walker_workers, 5);
        assert_eq!(max_depth, -1);
        assert!(!dry_run);
    }

    #[test]
    fn test_cli_resume_takes_session_id() {
        let args = Args::try_parse_from(["cloudpull", "resume", "7"]).unwrap();
        let Command::Resume { session_id } = args.command else {
            panic!("expected resume command");
        };
        assert_eq!(session_id, 7);
    }

    #[test]
    fn test_cli_workers_range_enforced() {
        let result =
            Args::try_parse_from(["cloudpull", "sync", "r", "/d", "--workers", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_repeatable_patterns() {
        let args = Args::try_parse_from([
            "cloudpull",
            "sync",
            "r",
            "/d",
            "--exclude",
            "**/*.tmp",
            "--exclude",
            "**/.git/**",
        ])
        .unwrap();
        let Command::Sync {
            exclude_patterns, ..
        } = args.command
        else {
            panic!("expected sync command");
        };
        assert_eq!(exclude_patterns.len(), 2);
    }
}
