// SPDX-License-Identifier: Apache-2.0

//! Content fingerprinting for rotation detection.
//!
//! A file is identified by a CRC-32 over its first 256 bytes. The checksum is
//! cheap to recompute and distinguishes "same file, more data appended" from
//! "same name, different file" after a rotation or truncation.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::warn;

/// Number of leading bytes covered by the checksum.
pub const CHECKSUM_BYTES: usize = 256;

/// Compute the CRC-32 (IEEE) of the first [`CHECKSUM_BYTES`] bytes of the
/// file. Shorter files are checksummed over whatever exists, with a warning,
/// since a fingerprint over very few bytes is a weak identity.
pub fn head_checksum(path: impl AsRef<Path>) -> io::Result<u32> {
    let mut file = File::open(path.as_ref())?;

    let mut buf = [0u8; CHECKSUM_BYTES];
    let mut filled = 0;
    while filled < CHECKSUM_BYTES {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    if filled < CHECKSUM_BYTES {
        warn!(
            path = %path.as_ref().display(),
            bytes = filled,
            "Read fewer than {} bytes for checksum",
            CHECKSUM_BYTES
        );
    }

    Ok(crc32fast::hash(&buf[..filled]))
}
