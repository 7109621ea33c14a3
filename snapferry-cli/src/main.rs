//! Snapferry CLI - resumable, verified transfer of device backup snapshots.

mod commands;
mod error;
mod runner;

use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser, Subcommand};
use console::style;

use commands::common::AccessArgs;
use commands::download::DownloadArgs;
use commands::plan::PlanArgs;
use error::CliError;
use runner::CliRunner;

#[derive(Parser)]
#[command(name = "snapferry")]
#[command(version = snapferry::VERSION)]
#[command(about = "Resumable, checksum-verified transfer of device backup snapshots", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.config/snapferry/config.ini)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List backups visible to the session
    List {
        #[command(flatten)]
        access: AccessArgs,
    },

    /// Show the transfer plan for a backup without downloading
    Plan {
        #[command(flatten)]
        access: AccessArgs,

        /// Backup id as shown by `list`
        backup_id: String,

        /// Destination root (defaults to [storage] download_dir)
        #[arg(long, value_name = "DIR")]
        dest: Option<PathBuf>,

        /// Output directory of an earlier run whose manifest digests must match
        #[arg(long, value_name = "DIR")]
        manifest: Option<PathBuf>,
    },

    /// Download a backup, resuming from verified chunks
    Download {
        #[command(flatten)]
        access: AccessArgs,

        /// Backup id as shown by `list`
        backup_id: String,

        /// Destination root (defaults to [storage] download_dir)
        #[arg(long, value_name = "DIR")]
        dest: Option<PathBuf>,

        /// Chunks fetched in parallel (overrides [download] concurrency)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Output directory of an earlier run whose manifest digests must match
        #[arg(long, value_name = "DIR")]
        manifest: Option<PathBuf>,
    },

    /// Show resume state recorded for a backup
    Status {
        /// Backup id
        backup_id: String,

        /// Forget the recorded state so the next download starts over
        #[arg(long)]
        reset: bool,
    },

    /// Re-hash a finished output directory against its manifest
    Verify {
        /// Output directory containing manifest.json
        output_dir: PathBuf,
    },
}

fn run(cli: Cli) -> Result<(), CliError> {
    if let Commands::Verify { output_dir } = &cli.command {
        return commands::verify::run(output_dir);
    }

    let mut runner = CliRunner::new(cli.config.as_deref(), cli.verbose)?;
    match cli.command {
        Commands::List { access } => commands::list::run(&runner, access),
        Commands::Plan {
            access,
            backup_id,
            dest,
            manifest,
        } => commands::plan::run(
            &runner,
            PlanArgs {
                access,
                backup_id,
                dest,
                manifest,
            },
        ),
        Commands::Download {
            access,
            backup_id,
            dest,
            concurrency,
            manifest,
        } => commands::download::run(
            &mut runner,
            DownloadArgs {
                access,
                backup_id,
                dest,
                concurrency,
                manifest,
            },
        ),
        Commands::Status { backup_id, reset } => {
            commands::status::run(&runner, &backup_id, reset)
        }
        Commands::Verify { .. } => Ok(()),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        process::exit(e.exit_code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_download_args_parse() {
        let cli = Cli::try_parse_from([
            "snapferry",
            "-vv",
            "download",
            "--session",
            "s.json",
            "--catalog",
            "c.json",
            "--concurrency",
            "8",
            "phone-1",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Download {
                access,
                backup_id,
                concurrency,
                ..
            } => {
                assert_eq!(backup_id, "phone-1");
                assert_eq!(concurrency, Some(8));
                assert!(!access.allow_privileged);
            }
            _ => panic!("Expected download command"),
        }
    }

    #[test]
    fn test_list_requires_session() {
        assert!(Cli::try_parse_from(["snapferry", "list", "--catalog", "c.json"]).is_err());
    }
}
