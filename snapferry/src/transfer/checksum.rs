//! SHA-256 digests for chunk and artifact verification.
//!
//! Every chunk is digested as it arrives from the remote source, and the
//! reassembled artifact is digested separately once all chunks are verified.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// Name of the digest algorithm, recorded in manifests.
pub const DIGEST_ALGORITHM: &str = "sha256";

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// A 256-bit content digest.
///
/// Serialized as lowercase hex so log files and manifests stay readable
/// and can be checked with standard tools.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex representation.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

/// Error parsing a hex digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sha256 digest {0:?}: expected 64 hex characters")]
pub struct ParseDigestError(String);

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseDigestError(s.to_string()));
        }

        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| ParseDigestError(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Computes and compares content digests.
///
/// Stateless; the algorithm is fixed to SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumVerifier;

impl ChecksumVerifier {
    /// Create a new verifier.
    pub fn new() -> Self {
        Self
    }

    /// Digest a byte slice.
    pub fn digest(&self, bytes: &[u8]) -> Digest {
        Digest(Sha256::digest(bytes).into())
    }

    /// Compare an actual digest against the expected one.
    pub fn verify(&self, actual: &Digest, expected: &Digest) -> bool {
        actual == expected
    }

    /// Digest a whole file.
    pub fn digest_file(&self, path: &Path) -> io::Result<Digest> {
        let file = File::open(path)?;
        hash_reader(file, u64::MAX)
    }

    /// Digest the byte range `[start, end)` of a file.
    ///
    /// Fails with `UnexpectedEof` if the file is shorter than `end`.
    pub fn digest_file_range(&self, path: &Path, start: u64, end: u64) -> io::Result<Digest> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start))?;
        let len = end.saturating_sub(start);
        let (digest, read) = hash_reader_counted(file, len)?;
        if read != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "{} ended after {} of {} bytes in range {}..{}",
                    path.display(),
                    read,
                    len,
                    start,
                    end
                ),
            ));
        }
        Ok(digest)
    }
}

fn hash_reader<R: Read>(reader: R, limit: u64) -> io::Result<Digest> {
    hash_reader_counted(reader, limit).map(|(digest, _)| digest)
}

fn hash_reader_counted<R: Read>(reader: R, limit: u64) -> io::Result<(Digest, u64)> {
    let mut reader = reader.take(limit);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok((Digest(hasher.finalize().into()), total))
}
