//! Byte-exact copy from the pipe into a destination sink

use super::UploadError;
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};

/// Result of a completed copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub bytes: u64,
    /// Hex SHA-256 of the copied bytes
    pub sha256: String,
}

/// Copy exactly `n` bytes from `src` into `dst`.
///
/// The declared size is a hard contract: reaching EOF before `n` bytes is a
/// [`UploadError::ShortTransfer`]. Bytes beyond `n` are never read.
pub fn copy_exactly<W, R>(
    dst: &mut W,
    src: &mut R,
    n: u64,
    buffer_size: usize,
) -> Result<CopyOutcome, UploadError>
where
    W: Write + ?Sized,
    R: Read + ?Sized,
{
    let chunk = usize::try_from(n)
        .unwrap_or(usize::MAX)
        .min(buffer_size)
        .max(1);
    let mut buffer = vec![0u8; chunk];
    let mut hasher = Sha256::new();
    let mut copied: u64 = 0;

    while copied < n {
        let want = (n - copied).min(buffer.len() as u64) as usize;
        let read = match src.read(&mut buffer[..want]) {
            Ok(0) => {
                return Err(UploadError::ShortTransfer {
                    expected: n,
                    copied,
                })
            }
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        dst.write_all(&buffer[..read])?;
        hasher.update(&buffer[..read]);
        copied += read as u64;
    }

    Ok(CopyOutcome {
        bytes: copied,
        sha256: hex::encode(hasher.finalize()),
    })
}
