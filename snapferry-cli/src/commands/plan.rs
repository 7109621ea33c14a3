//! `plan` command - show what a download would do without fetching.

use std::path::PathBuf;

use snapferry::transfer::required_space;

use super::common::{expected_digests, format_size, AccessArgs};
use crate::error::CliError;
use crate::runner::{destination, runtime, CliRunner};

/// Arguments for the plan command.
pub struct PlanArgs {
    pub access: AccessArgs,
    pub backup_id: String,
    pub dest: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
}

/// Run the plan command.
pub fn run(runner: &CliRunner, args: PlanArgs) -> Result<(), CliError> {
    runner.log_startup("plan");
    let session = runner.open_session(&args.access)?;
    let service = runner.create_service(&args.access)?;
    let expected = expected_digests(args.manifest.as_ref())?;
    let dest = destination(args.dest.as_ref(), runner.config());

    let plan = runtime()?.block_on(service.plan(
        &session,
        &args.backup_id,
        Some(&dest),
        expected,
    ))?;
    let resume = service.log().load_state(&plan.backup_id)?;
    let margin = service.config().planner.safety_margin_bytes;

    println!("Backup:     {} ({})", plan.backup_id, plan.device_name);
    println!("Created:    {}", plan.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Output:     {}", plan.output_dir.display());
    if let Some(source) = &plan.source_name {
        println!("Source:     {}", source);
    }
    println!("Size:       {}", format_size(plan.total_bytes));
    println!(
        "Chunks:     {} x {}",
        plan.chunk_count(),
        format_size(plan.chunk_size)
    );
    println!(
        "Requires:   {} free (including headroom)",
        format_size(required_space(plan.total_bytes, margin))
    );
    if plan.artifact_digest.is_some() {
        println!("Expected:   artifact digest known");
    }
    let resumable = resume
        .values()
        .filter(|record| record.output_dir.as_deref() == Some(plan.output_dir.as_path()))
        .count();
    if resumable > 0 {
        println!("Resume log: {} chunk record(s) from earlier runs", resumable);
    }
    Ok(())
}
