//! Common types and utilities shared across CLI commands.

use std::path::PathBuf;

use clap::Args;
use console::style;
use snapferry::report::{FinalStatus, Report};
use snapferry::transfer::{ExpectedDigests, Manifest};

use crate::error::CliError;

/// Session and source selection shared by `list`, `plan` and `download`.
#[derive(Debug, Clone, Args)]
pub struct AccessArgs {
    /// Session file produced by the sign-in helper (JSON)
    #[arg(long, value_name = "FILE")]
    pub session: PathBuf,

    /// Backup catalog (JSON) describing locally available artifacts
    #[arg(long, value_name = "FILE")]
    pub catalog: PathBuf,

    /// Opt in to privileged backup listings for this session
    #[arg(long)]
    pub allow_privileged: bool,
}

/// Format a byte count with binary units.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Expected digests from an earlier output directory's manifest.
pub fn expected_digests(manifest_dir: Option<&PathBuf>) -> Result<ExpectedDigests, CliError> {
    match manifest_dir {
        Some(dir) => {
            let manifest = Manifest::load(dir)?;
            Ok(ExpectedDigests::from_manifest(&manifest))
        }
        None => Ok(ExpectedDigests::default()),
    }
}

/// Print a completion report.
pub fn print_report(report: &Report, report_path: Option<&PathBuf>) {
    let status = match report.final_status {
        FinalStatus::Completed => style(report.final_status.to_string()).green().bold(),
        FinalStatus::Cancelled => style(report.final_status.to_string()).yellow().bold(),
        _ => style(report.final_status.to_string()).red().bold(),
    };

    println!();
    println!("Transfer Report");
    println!("───────────────");
    println!("  Backup:   {}", report.backup_id);
    println!("  Status:   {}", status);
    println!(
        "  Chunks:   {} ok, {} failed ({} fetched, {} resumed)",
        report.files_ok, report.files_failed, report.chunks_fetched, report.chunks_skipped
    );
    println!(
        "  Data:     {} fetched of {}",
        format_size(report.bytes_fetched),
        format_size(report.total_bytes)
    );
    println!("  Retries:  {}", report.retries);
    let elapsed = report.ended_at - report.started_at;
    println!("  Elapsed:  {:.1}s", elapsed.num_milliseconds() as f64 / 1000.0);
    if let Some(digest) = &report.artifact_digest {
        println!("  SHA-256:  {}", digest);
    }
    if let Some(path) = &report.output_path {
        println!("  Output:   {}", path.display());
    }
    if let Some(path) = report_path {
        println!("  Report:   {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1024), "1.0 KiB");
        assert_eq!(format_size(16 * 1024 * 1024), "16.0 MiB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_no_manifest_means_no_expectations() {
        let expected = expected_digests(None).unwrap();
        assert!(expected.chunks.is_empty());
        assert!(expected.artifact.is_none());
    }
}
