//! Snapferry - resumable, verified transfer of device backup snapshots.
//!
//! The library holds the transfer and verification core:
//!
//! - [`session`]: session validity and the privileged-access policy gate
//! - [`source`]: the `RemoteSource` capability and backup descriptors
//! - [`index`]: merging source listings without conflating denial with emptiness
//! - [`transfer`]: planning, the integrity log, checksums and the download engine
//! - [`report`]: the completion report handed to renderers
//! - [`service`]: the orchestration that wires the components together
//!
//! Argument parsing, progress rendering and credential prompts live in the
//! `snapferry-cli` binary.

pub mod config;
pub mod index;
pub mod logging;
pub mod report;
pub mod service;
pub mod session;
pub mod source;
pub mod transfer;

/// Library version, recorded in manifests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
