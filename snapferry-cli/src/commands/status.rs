//! `status` command - show resume state recorded for a backup.

use snapferry::transfer::IntegrityLog;

use crate::error::CliError;
use crate::runner::CliRunner;

/// Run the status command.
pub fn run(runner: &CliRunner, backup_id: &str, reset: bool) -> Result<(), CliError> {
    let log = IntegrityLog::open(&runner.config().storage.log_dir)?;

    if reset {
        log.clear(backup_id)?;
        println!("Cleared resume state for {}", backup_id);
        return Ok(());
    }

    let summary = log.summary(backup_id)?;
    println!("Backup:   {}", backup_id);
    println!("Log file: {}", log.path_for(backup_id).display());
    if summary.total() == 0 {
        println!("No chunks recorded.");
        return Ok(());
    }
    println!("  Verified: {}", summary.verified);
    println!("  Failed:   {}", summary.failed);
    println!("  Pending:  {}", summary.pending);
    Ok(())
}
