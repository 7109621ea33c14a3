//! `verify` command - re-hash a finished output directory.

use std::path::Path;

use console::style;
use snapferry::transfer::verify_output;

use crate::error::CliError;

/// Run the verify command.
pub fn run(output_dir: &Path) -> Result<(), CliError> {
    let summary = verify_output(output_dir)?;

    println!("Backup:   {}", summary.backup_id);
    println!("Artifact: {}", summary.artifact_path.display());
    if !summary.artifact_present {
        println!("{}", style("Artifact is missing").red().bold());
        return Err(CliError::VerificationFailed { failed_chunks: 0 });
    }
    println!("  Chunks ok:     {}", summary.chunks_ok);
    println!("  Chunks failed: {}", summary.failed_chunks.len());
    for index in &summary.failed_chunks {
        println!("    chunk {}", index);
    }

    if summary.is_ok() {
        println!("{}", style("Verified").green().bold());
        Ok(())
    } else {
        println!("{}", style("Verification failed").red().bold());
        Err(CliError::VerificationFailed {
            failed_chunks: summary.failed_chunks.len(),
        })
    }
}
