//! Content fingerprints for dataset files.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Read granularity; memory use stays bounded by this regardless of file size.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Lowercase hex SHA-256 of the file's full contents, streamed in `CHUNK_SIZE` chunks.
pub fn fingerprint(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    fingerprint_reader(file)
}

pub fn fingerprint_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// First eight characters of a digest, as shown in tick summaries.
pub fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
