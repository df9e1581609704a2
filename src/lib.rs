//! putbridge
//!
//! A blocking write handle over an asynchronous upload worker.
//!
//! # Features
//!
//! - **Rendezvous handoff**: every `write` blocks until the worker has read
//!   the bytes, so the caller can never run ahead of the destination
//! - **Blocking close**: `close` returns only after the worker has finalized
//!   or failed the destination, carrying the worker's error
//! - **Exclusive create**: an existing object is reported, never overwritten
//! - **Exact size**: the declared size is a hard contract
//!
//! # Example
//!
//! ```no_run
//! use putbridge::storage::FsDestination;
//! use putbridge::upload::{TransferOptions, Uploader};
//! use std::io::Write;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let uploader = Uploader::new(
//!     Arc::new(FsDestination::new("./data")),
//!     TransferOptions::default(),
//! );
//!
//! let mut handle = uploader.put("b", "o.txt", 5)?;
//! handle.write_all(b"hello")?;
//! handle.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod handoff;
pub mod logging;
pub mod storage;
pub mod upload;

#[cfg(feature = "metrics")]
pub mod metrics;

// Re-export commonly used types
pub use config::Config;
pub use upload::{begin_upload, BlockingWriteCloser, UploadError, UploadRequest, Uploader};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
