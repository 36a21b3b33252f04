//! Run-length encoders backing the chunk index and per-chunk sample layout.
//!
//! All three encoders serialize to compact little-endian blobs headed by
//! [crate::FORMAT_VERSION].

use std::io;

pub mod byte_positions;
pub mod chunk_id;
pub mod shape;

pub(crate) fn check_version(version: u8) -> io::Result<()> {
    if version != crate::FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Unknown encoder format version {}", version),
        ));
    }
    Ok(())
}
