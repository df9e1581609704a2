//! Blocking write handle
//!
//! [`BlockingWriteCloser`] wraps the producer end of a handoff pipe. Writes
//! go straight to the pipe. [`close`](BlockingWriteCloser::close) closes the
//! pipe and then suspends the calling thread until the consumer calls
//! [`Releaser::release`] exactly once.
//!
//! The completion latch is a `tokio::sync::oneshot` channel: it can be
//! resolved once and awaited once. Resolving it a second time is a
//! programming error. [`Releaser::release`] panics with a [`DoubleRelease`]
//! payload, and the upload worker turns that payload into a process abort.

use super::UploadError;
use crate::handoff::PipeWriter;
use parking_lot::Mutex;
use std::any::Any;
use std::io::{self, Write};
use tokio::sync::oneshot;

type Outcome = Result<(), UploadError>;

/// Write handle that blocks on close until the consumer releases it
#[derive(Debug)]
pub struct BlockingWriteCloser {
    writer: Option<PipeWriter>,
    done: Option<oneshot::Receiver<Outcome>>,
}

/// Consumer side of the completion latch
///
/// Must be released exactly once. A second [`release`](Releaser::release)
/// is an unwinding panic on the calling thread, carrying [`DoubleRelease`].
#[derive(Debug)]
pub struct Releaser {
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl BlockingWriteCloser {
    /// Wrap a pipe writer. The returned [`Releaser`] belongs to the consumer.
    pub fn new(writer: PipeWriter) -> (Self, Releaser) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                writer: Some(writer),
                done: Some(rx),
            },
            Releaser {
                tx: Mutex::new(Some(tx)),
            },
        )
    }

    /// Close the pipe and wait for the consumer's release.
    ///
    /// Returns the consumer's error if it reported one, otherwise the error
    /// from closing the pipe, otherwise `Ok(())`.
    ///
    /// # Panics
    ///
    /// Blocks the current thread, so it panics if called from within an
    /// asynchronous execution context. Use `tokio::task::spawn_blocking`
    /// there.
    pub fn close(mut self) -> Result<(), UploadError> {
        let closed = match self.writer.take() {
            Some(writer) => writer.close(),
            None => Ok(()),
        };

        match (self.wait(), closed) {
            (Err(released), _) => Err(released),
            (Ok(()), Err(e)) => Err(e.into()),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Close the pipe with `err` and wait for the consumer's release.
    ///
    /// Always yields an error: the consumer's if it failed (it normally will,
    /// having read `err`), otherwise `err` itself.
    pub fn abort(mut self, err: io::Error) -> UploadError {
        if let Some(writer) = self.writer.take() {
            writer.close_with_error(io::Error::new(err.kind(), err.to_string()));
        }

        match self.wait() {
            Err(released) => released,
            Ok(()) => UploadError::IoError(err),
        }
    }

    fn wait(&mut self) -> Outcome {
        let Some(done) = self.done.take() else {
            return Err(UploadError::WorkerLost);
        };
        // A dropped sender means the consumer died before releasing.
        done.blocking_recv().unwrap_or(Err(UploadError::WorkerLost))
    }
}

impl Write for BlockingWriteCloser {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write on closed handle",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BlockingWriteCloser {
    fn drop(&mut self) {
        // Dropped without close: make the consumer fail instead of seeing EOF.
        if let Some(writer) = self.writer.take() {
            writer.close_with_error(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "write handle dropped before close",
            ));
        }
    }
}

impl Releaser {
    /// Resolve the latch, unblocking any thread waiting in `close`.
    ///
    /// # Panics
    ///
    /// Panics with a [`DoubleRelease`] payload if called more than once.
    pub fn release(&self, outcome: Result<(), UploadError>) {
        let Some(tx) = self.tx.lock().take() else {
            tracing::error!("{}", DoubleRelease::MESSAGE);
            std::panic::panic_any(DoubleRelease);
        };
        // The handle may already be gone, in which case nobody is waiting.
        let _ = tx.send(outcome);
    }
}

/// Panic payload of a second [`Releaser::release`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleRelease;

impl DoubleRelease {
    pub const MESSAGE: &'static str = "BlockingWriteCloser released more than once";

    /// Whether a caught panic payload came from a double release
    pub fn matches(payload: &(dyn Any + Send)) -> bool {
        payload.is::<DoubleRelease>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::pipe;
    use std::io::Read;
    use std::panic::{self, AssertUnwindSafe};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_close_returns_release_outcome() {
        let (_reader, writer) = pipe();
        let (handle, releaser) = BlockingWriteCloser::new(writer);

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            releaser.release(Ok(()));
        });

        handle.close().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_close_prefers_released_error() {
        let (_reader, writer) = pipe();
        let (handle, releaser) = BlockingWriteCloser::new(writer);
        releaser.release(Err(UploadError::ShortTransfer {
            expected: 5,
            copied: 2,
        }));

        let err = handle.close().unwrap_err();
        assert!(matches!(
            err,
            UploadError::ShortTransfer {
                expected: 5,
                copied: 2
            }
        ));
    }

    #[test]
    fn test_close_waits_for_release() {
        let (_reader, writer) = pipe();
        let (handle, releaser) = BlockingWriteCloser::new(writer);

        let closer = thread::spawn(move || handle.close());
        thread::sleep(Duration::from_millis(50));
        assert!(!closer.is_finished(), "close returned before release");

        releaser.release(Ok(()));
        closer.join().unwrap().unwrap();
    }

    #[test]
    fn test_dropped_releaser_reports_worker_lost() {
        let (_reader, writer) = pipe();
        let (handle, releaser) = BlockingWriteCloser::new(writer);
        drop(releaser);

        assert!(matches!(handle.close(), Err(UploadError::WorkerLost)));
    }

    #[test]
    fn test_double_release_panics_with_payload() {
        let (_reader, writer) = pipe();
        let (_handle, releaser) = BlockingWriteCloser::new(writer);
        releaser.release(Ok(()));

        let payload = panic::catch_unwind(AssertUnwindSafe(|| releaser.release(Ok(()))))
            .unwrap_err();
        assert!(DoubleRelease::matches(payload.as_ref()));
    }

    #[test]
    fn test_other_panics_are_not_double_release() {
        let payload = panic::catch_unwind(|| -> u8 { panic!("backend exploded") }).unwrap_err();
        assert!(!DoubleRelease::matches(payload.as_ref()));
    }

    #[test]
    fn test_release_after_handle_dropped() {
        let (_reader, writer) = pipe();
        let (handle, releaser) = BlockingWriteCloser::new(writer);
        drop(handle);
        // Nobody is waiting; the outcome is dropped without a panic.
        releaser.release(Ok(()));
    }

    #[test]
    fn test_drop_without_close_aborts_reader() {
        let (mut reader, writer) = pipe();
        let (handle, _releaser) = BlockingWriteCloser::new(writer);
        drop(handle);

        let err = reader.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn test_abort_returns_consumer_error() {
        let (mut reader, writer) = pipe();
        let (handle, releaser) = BlockingWriteCloser::new(writer);

        let consumer = thread::spawn(move || {
            let err = reader.read(&mut [0u8; 4]).unwrap_err();
            releaser.release(Err(err.into()));
        });

        let err = handle.abort(io::Error::new(io::ErrorKind::TimedOut, "source stalled"));
        consumer.join().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
