//! `list` command - show backups visible to the session.

use snapferry::index::{ListOutcome, Listing};
use snapferry::source::Origin;

use super::common::{format_size, AccessArgs};
use crate::error::CliError;
use crate::runner::{runtime, CliRunner};

/// Run the list command.
pub fn run(runner: &CliRunner, access: AccessArgs) -> Result<(), CliError> {
    runner.log_startup("list");
    let session = runner.open_session(&access)?;
    let service = runner.create_service(&access)?;

    let listing = runtime()?.block_on(service.list_backups(&session))?;
    print_listing(&listing);
    Ok(())
}

fn print_listing(listing: &Listing) {
    match listing.outcome() {
        ListOutcome::Found(count) => {
            println!("{} backup(s):", count);
            println!();
            println!(
                "  {:<24} {:<20} {:<8} {:<20} {:>10}  {}",
                "ID", "DEVICE", "OS", "CREATED (UTC)", "SIZE", "ORIGIN"
            );
            for backup in &listing.backups {
                let origin = match backup.origin() {
                    Origin::Local => "local".to_string(),
                    Origin::RemotePrivileged => "privileged (list only)".to_string(),
                };
                println!(
                    "  {:<24} {:<20} {:<8} {:<20} {:>10}  {}",
                    backup.id(),
                    backup.device_name(),
                    backup.device_os_version(),
                    backup.created_at().format("%Y-%m-%d %H:%M:%S"),
                    format_size(backup.approx_size_bytes()),
                    origin
                );
            }
        }
        ListOutcome::Empty => println!("No backups found."),
        ListOutcome::Denied(reason) => {
            println!(
                "{} Privileged backup listing was denied ({}).",
                console::style("Access denied:").red().bold(),
                reason
            );
            println!("  {}", reason.guidance());
            println!("  This is not the same as having no backups.");
        }
        ListOutcome::Unavailable => {
            println!(
                "{} no source could be listed.",
                console::style("Unavailable:").red().bold()
            );
        }
    }

    if !listing.backups.is_empty() {
        for denial in &listing.denials {
            println!();
            println!(
                "Note: {} was not listed ({}). {}",
                denial.source_name,
                denial.reason,
                denial.reason.guidance()
            );
        }
    }
    for failure in &listing.failures {
        println!(
            "Warning: source {} failed: {}",
            failure.source_name, failure.error
        );
    }
}
