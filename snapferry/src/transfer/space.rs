//! Free space at a destination.

use std::io;
use std::path::{Path, PathBuf};

/// Space constraints at a destination root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Bytes available to this process at the destination.
    pub available_bytes: u64,
}

impl Quota {
    /// A quota with a known amount of free space.
    pub fn new(available_bytes: u64) -> Self {
        Self { available_bytes }
    }

    /// Measure the free space at `path`.
    ///
    /// The destination may not exist yet; the nearest existing ancestor is
    /// measured instead.
    pub fn probe(path: &Path) -> io::Result<Self> {
        let existing = nearest_existing(path)?;
        available_bytes(&existing).map(Self::new)
    }
}

fn nearest_existing(path: &Path) -> io::Result<PathBuf> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if candidate.exists() {
            return Ok(candidate.to_path_buf());
        }
        current = candidate.parent();
    }
    // Relative path whose ancestors do not exist: measure the working directory.
    std::env::current_dir()
}

#[cfg(unix)]
fn available_bytes(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated string and stat is a valid
    // out-pointer for the duration of the call.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

#[cfg(not(unix))]
fn available_bytes(_path: &Path) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "free space probing is only supported on unix",
    ))
}
