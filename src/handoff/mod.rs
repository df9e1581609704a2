//! Handoff channel
//!
//! An unbuffered, rendezvous-style byte pipe with two unidirectional ends.
//!
//! A [`PipeWriter::write`] call does not return until [`PipeReader::read`]
//! calls on the other end have consumed every byte handed to it, or until
//! the reader end is closed. This gives the producer natural backpressure:
//! it can never get further ahead of the consumer than one in-flight slice.
//!
//! Either end may be closed with an error. The first close on each end wins
//! and becomes visible to every later operation on the opposite end:
//!
//! | Closed end | Close error | Opposite end observes          |
//! |------------|-------------|--------------------------------|
//! | writer     | `None`      | reader gets EOF (`Ok(0)`)      |
//! | writer     | `Some(e)`   | reader gets `e`                |
//! | reader     | `None`      | writer gets `BrokenPipe`       |
//! | reader     | `Some(e)`   | writer gets `e`                |
//!
//! Operating on an end after closing it yourself yields `BrokenPipe`.
//!
//! # Example
//!
//! ```
//! use putbridge::handoff::pipe;
//! use std::io::{Read, Write};
//!
//! let (mut reader, mut writer) = pipe();
//! let consumer = std::thread::spawn(move || {
//!     let mut out = Vec::new();
//!     reader.read_to_end(&mut out).unwrap();
//!     out
//! });
//!
//! writer.write_all(b"hello").unwrap();
//! writer.close().unwrap();
//! assert_eq!(consumer.join().unwrap(), b"hello");
//! ```

use parking_lot::{Condvar, Mutex};
use std::error::Error as StdError;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Error stored by a close, shared with every later operation on the far end
#[derive(Debug, Clone)]
struct SharedError(Arc<io::Error>);

impl SharedError {
    fn to_io(&self) -> io::Error {
        io::Error::new(self.0.kind(), self.clone())
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for SharedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.0.as_ref())
    }
}

/// How one end of the pipe was closed
#[derive(Debug, Clone)]
enum Closed {
    Clean,
    WithError(SharedError),
}

#[derive(Debug, Default)]
struct State {
    /// Bytes of the in-flight write, if any
    slot: Vec<u8>,
    /// How much of `slot` the reader has consumed
    consumed: usize,
    reader_closed: Option<Closed>,
    writer_closed: Option<Closed>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    /// Signalled when the slot is filled or the writer closes
    readable: Condvar,
    /// Signalled when the slot is drained or the reader closes
    drained: Condvar,
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "read/write on closed pipe")
}

/// Create a connected reader/writer pair
pub fn pipe() -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared::default());
    (
        PipeReader {
            shared: Arc::clone(&shared),
        },
        PipeWriter { shared },
    )
}

/// Consumer end of the handoff channel
#[derive(Debug)]
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Close the reader end. Later writes fail with `BrokenPipe`.
    pub fn close(&self) {
        self.close_with(None);
    }

    /// Close the reader end so later writes fail with `err`.
    ///
    /// Only the first close is recorded; later calls are no-ops.
    pub fn close_with_error(&self, err: io::Error) {
        self.close_with(Some(err));
    }

    fn close_with(&self, err: Option<io::Error>) {
        let mut state = self.shared.state.lock();
        if state.reader_closed.is_none() {
            state.reader_closed = Some(match err {
                Some(e) => Closed::WithError(SharedError(Arc::new(e))),
                None => Closed::Clean,
            });
        }
        drop(state);
        self.shared.drained.notify_all();
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        loop {
            if state.reader_closed.is_some() {
                return Err(closed_pipe());
            }

            let pending = state.slot.len() - state.consumed;
            if pending > 0 {
                if buf.is_empty() {
                    return Ok(0);
                }
                let n = pending.min(buf.len());
                let start = state.consumed;
                buf[..n].copy_from_slice(&state.slot[start..start + n]);
                state.consumed += n;
                if state.consumed == state.slot.len() {
                    drop(state);
                    self.shared.drained.notify_all();
                }
                return Ok(n);
            }

            if let Some(closed) = &state.writer_closed {
                return match closed {
                    Closed::Clean => Ok(0),
                    Closed::WithError(e) => Err(e.to_io()),
                };
            }
            self.shared.readable.wait(&mut state);
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Producer end of the handoff channel
#[derive(Debug)]
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Close the writer end. The reader sees EOF once the slot is drained.
    pub fn close(&self) -> io::Result<()> {
        self.close_with(None);
        Ok(())
    }

    /// Close the writer end so the reader fails with `err`.
    ///
    /// Only the first close is recorded; later calls are no-ops.
    pub fn close_with_error(&self, err: io::Error) {
        self.close_with(Some(err));
    }

    fn close_with(&self, err: Option<io::Error>) {
        let mut state = self.shared.state.lock();
        if state.writer_closed.is_none() {
            state.writer_closed = Some(match err {
                Some(e) => Closed::WithError(SharedError(Arc::new(e))),
                None => Closed::Clean,
            });
        }
        drop(state);
        self.shared.readable.notify_all();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        if state.writer_closed.is_some() {
            return Err(closed_pipe());
        }
        match &state.reader_closed {
            Some(Closed::Clean) => return Err(closed_pipe()),
            Some(Closed::WithError(e)) => return Err(e.to_io()),
            None => {}
        }
        if buf.is_empty() {
            return Ok(0);
        }

        state.slot.clear();
        state.slot.extend_from_slice(buf);
        state.consumed = 0;
        self.shared.readable.notify_all();

        while state.consumed < state.slot.len() && state.reader_closed.is_none() {
            self.shared.drained.wait(&mut state);
        }

        let consumed = state.consumed;
        state.slot.clear();
        state.consumed = 0;

        // A partial handoff is reported as a short write; the next call
        // surfaces the reader's error.
        if consumed > 0 {
            return Ok(consumed);
        }
        match &state.reader_closed {
            Some(Closed::WithError(e)) => Err(e.to_io()),
            _ => Err(closed_pipe()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close_with(None);
    }
}
