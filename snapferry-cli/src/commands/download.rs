//! `download` command - transfer a backup with resume and verification.

use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use snapferry::transfer::{progress_channel, ProgressEvent, DEFAULT_PROGRESS_CAPACITY};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::common::{expected_digests, print_report, AccessArgs};
use crate::error::CliError;
use crate::runner::{destination, runtime, CliRunner};

/// Arguments for the download command.
pub struct DownloadArgs {
    pub access: AccessArgs,
    pub backup_id: String,
    pub dest: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub manifest: Option<PathBuf>,
}

/// Run the download command.
pub fn run(runner: &mut CliRunner, args: DownloadArgs) -> Result<(), CliError> {
    if let Some(concurrency) = args.concurrency {
        runner.config_mut().download.concurrency = concurrency;
        runner.config().validate()?;
    }
    runner.log_startup("download");

    let session = runner.open_session(&args.access)?;
    let service = runner.create_service(&args.access)?;
    let expected = expected_digests(args.manifest.as_ref())?;
    let dest = destination(args.dest.as_ref(), runner.config());

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Received interrupt, stopping after in-flight chunks...");
        handler_token.cancel();
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    let rt = runtime()?;
    let outcome = rt.block_on(async {
        let plan = service
            .plan(&session, &args.backup_id, Some(&dest), expected)
            .await?;

        let (tx, rx) = progress_channel(DEFAULT_PROGRESS_CAPACITY);
        let bar = progress_bar(plan.total_bytes);
        let renderer = tokio::spawn(render_progress(rx, bar));

        let outcome = service.execute(&session, &plan, cancel, Some(tx)).await;
        let _ = renderer.await;
        outcome
    })?;

    print_report(&outcome.report, outcome.report_path.as_ref());
    if outcome.report.final_status.is_success() {
        Ok(())
    } else {
        Err(CliError::Incomplete(outcome.report.final_status))
    }
}

fn progress_bar(total_bytes: u64) -> ProgressBar {
    let bar = ProgressBar::new(total_bytes);
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
    )
    .map(|style| style.progress_chars("=> "))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar
}

/// Drain progress events until the engine drops its sender.
async fn render_progress(mut rx: mpsc::Receiver<ProgressEvent>, bar: ProgressBar) {
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::Started {
                total_chunks,
                to_fetch,
                total_bytes,
                ..
            } => {
                bar.set_length(total_bytes);
                bar.set_message(format!("{}/{} chunks to fetch", to_fetch, total_chunks));
            }
            ProgressEvent::ChunkSkipped { bytes, .. } => bar.inc(bytes),
            ProgressEvent::ChunkStarted { .. } => {}
            ProgressEvent::ChunkVerified { bytes, .. } => bar.inc(bytes),
            ProgressEvent::ChunkFailed {
                index,
                attempt,
                error,
                terminal,
            } => {
                if terminal {
                    bar.println(format!(
                        "chunk {} failed after {} attempt(s): {}",
                        index, attempt, error
                    ));
                }
            }
            ProgressEvent::Finished {
                chunks_ok,
                chunks_failed,
            } => {
                bar.set_message(format!("{} ok, {} failed", chunks_ok, chunks_failed));
            }
        }
    }
    bar.finish();
}
