//! Caller-supplied input and output streams for an execution.

use std::fmt;
use std::io::{self, Write};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

/// Where a script reads standard input from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InputSource {
    #[default]
    Null,
    Inherit,
    Bytes(Vec<u8>),
}

impl InputSource {
    pub(crate) fn child_stdio(&self) -> Stdio {
        match self {
            Self::Null => Stdio::null(),
            Self::Inherit => Stdio::inherit(),
            Self::Bytes(_) => Stdio::piped(),
        }
    }
}

/// Which standard stream a child's output slot refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Stdout,
    Stderr,
}

/// Where a script's output goes.
pub enum OutputSink {
    /// The current process's stdout.
    Stdout,
    /// The current process's stderr.
    Stderr,
    Null,
    Writer(Box<dyn Write + Send>),
}

impl OutputSink {
    pub fn writer(w: impl Write + Send + 'static) -> Self {
        Self::Writer(Box::new(w))
    }

    /// A sink writing into a fresh shared buffer, plus a handle to read it.
    pub fn buffer() -> (Self, SharedBuffer) {
        let buf = SharedBuffer::new();
        (Self::writer(buf.clone()), buf)
    }

    /// Stdio for a child writing into this sink from `slot`. A sink naming the
    /// same stream as the slot is inherited directly, everything else is piped
    /// and pumped by the caller.
    pub(crate) fn child_stdio(&self, slot: Slot) -> Stdio {
        match (self, slot) {
            (Self::Stdout, Slot::Stdout) | (Self::Stderr, Slot::Stderr) => Stdio::inherit(),
            (Self::Null, _) => Stdio::null(),
            _ => Stdio::piped(),
        }
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stdout => io::stdout().write(buf),
            Self::Stderr => io::stderr().write(buf),
            Self::Null => Ok(buf.len()),
            Self::Writer(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout => io::stdout().flush(),
            Self::Stderr => io::stderr().flush(),
            Self::Null => Ok(()),
            Self::Writer(w) => w.flush(),
        }
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("Stdout"),
            Self::Stderr => f.write_str("Stderr"),
            Self::Null => f.write_str("Null"),
            Self::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// A cloneable in-memory byte buffer; all clones append to the same bytes.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The three standard streams of one execution.
#[derive(Debug)]
pub struct IoStreams {
    pub stdin: InputSource,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl Default for IoStreams {
    fn default() -> Self {
        Self {
            stdin: InputSource::Inherit,
            stdout: OutputSink::Stdout,
            stderr: OutputSink::Stderr,
        }
    }
}

impl IoStreams {
    /// Streams that read nothing and discard all output.
    pub fn null() -> Self {
        Self {
            stdin: InputSource::Null,
            stdout: OutputSink::Null,
            stderr: OutputSink::Null,
        }
    }

    /// Streams that record stdout and stderr into buffers.
    pub fn buffered() -> (Self, SharedBuffer, SharedBuffer) {
        let (stdout, out) = OutputSink::buffer();
        let (stderr, err) = OutputSink::buffer();
        (
            Self {
                stdin: InputSource::Null,
                stdout,
                stderr,
            },
            out,
            err,
        )
    }
}
