//! Destination storage
//!
//! The upload worker only needs two capabilities from a backend: create a
//! sink for an identity that must not exist yet, and discard an identity it
//! created when the upload fails.

use crate::upload::{ObjectIdentity, UploadError};
use std::io::Write;

pub mod fs;
pub mod memory;

pub use fs::FsDestination;
pub use memory::MemoryDestination;

/// Backend that materializes uploaded objects
pub trait Destination: Send + Sync + 'static {
    type Sink: Sink;

    /// Create a fresh sink for `identity`.
    ///
    /// Must fail with [`UploadError::AlreadyExists`] if the identity is
    /// already present, and must never overwrite it.
    fn create_exclusive(
        &self,
        identity: &ObjectIdentity,
        size: u64,
    ) -> Result<Self::Sink, UploadError>;

    /// Remove an object this destination created. Missing objects are not an error.
    fn discard(&self, identity: &ObjectIdentity) -> Result<(), UploadError>;
}

/// Writable object under construction
pub trait Sink: Write + Send {
    /// Flush and make the content durable
    fn finalize(self) -> Result<(), UploadError>;
}
