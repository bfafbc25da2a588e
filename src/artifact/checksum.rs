/*!
 * Streaming checksum calculation for build artifacts
 */

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Block size used when hashing
pub const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Calculate the lower-case hex SHA-256 digest of everything `reader` yields
pub fn checksum_reader<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BLOCK_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Calculate checksum of a file
pub fn calculate_checksum(path: &Path) -> Result<String> {
    checksum_reader(File::open(path)?)
}
