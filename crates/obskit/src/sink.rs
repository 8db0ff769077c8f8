//! Log output sinks.
//!
//! A [`SinkSet`] fans every formatted entry out to all configured outputs and
//! plugs into `tracing-subscriber` as its `MakeWriter`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing_subscriber::fmt::MakeWriter;

use crate::config::LogOutput;
use crate::error::ObservabilityError;

#[derive(Default)]
struct MemoryBuffer {
    bytes: Vec<u8>,
    flushes: usize,
}

/// In-memory log destination.
///
/// Clones share the same buffer, so a test can keep one handle and pass
/// another into [`LogConfig::memory`](crate::config::LogConfig::memory).
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryBuffer>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded as UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock().bytes).into_owned()
    }

    /// Written entries, one per line.
    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }

    /// Number of times the sink has been flushed.
    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    pub fn is_empty(&self) -> bool {
        self.lock().bytes.is_empty()
    }

    pub(crate) fn same_buffer(&self, other: &MemorySink) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn write_entry(&self, buf: &[u8]) {
        self.lock().bytes.extend_from_slice(buf);
    }

    fn flush(&self) {
        self.lock().flushes += 1;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MemorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buffer = self.lock();
        f.debug_struct("MemorySink")
            .field("bytes", &buffer.bytes.len())
            .field("flushes", &buffer.flushes)
            .finish()
    }
}

enum Sink {
    Stdout,
    Stderr,
    File(Mutex<File>),
    Memory(MemorySink),
}

impl Sink {
    fn open(output: &LogOutput) -> Result<Self, ObservabilityError> {
        Ok(match output {
            LogOutput::Stdout => Self::Stdout,
            LogOutput::Stderr => Self::Stderr,
            LogOutput::Memory(sink) => Self::Memory(sink.clone()),
            LogOutput::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| ObservabilityError::LogOutput {
                        path: path.clone(),
                        source,
                    })?;
                Self::File(Mutex::new(file))
            }
        })
    }

    fn write_entry(&self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Stdout => io::stdout().lock().write_all(buf),
            Self::Stderr => io::stderr().lock().write_all(buf),
            Self::File(file) => file
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(buf),
            Self::Memory(sink) => {
                sink.write_entry(buf);
                Ok(())
            }
        }
    }

    fn sync(&self) -> io::Result<()> {
        match self {
            Self::Stdout => io::stdout().flush(),
            Self::Stderr => io::stderr().flush(),
            Self::File(file) => {
                let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
                file.flush()?;
                file.sync_data()
            }
            Self::Memory(sink) => {
                sink.flush();
                Ok(())
            }
        }
    }

    fn is_terminal_stream(&self) -> bool {
        matches!(self, Self::Stdout | Self::Stderr)
    }
}

/// The set of outputs a logger writes to.
#[derive(Clone)]
pub(crate) struct SinkSet {
    sinks: Arc<[Sink]>,
}

impl SinkSet {
    /// Open every output. Fails on the first file that cannot be opened.
    pub(crate) fn open(outputs: &[LogOutput]) -> Result<Self, ObservabilityError> {
        let sinks = outputs
            .iter()
            .map(Sink::open)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            sinks: sinks.into(),
        })
    }

    /// Flush every sink. All sinks are attempted; the last failure is returned.
    pub(crate) fn sync(&self) -> io::Result<()> {
        let mut result = Ok(());
        for sink in self.sinks.iter() {
            if let Err(e) = sink.sync() {
                result = Err(e);
            }
        }
        result
    }

    /// `true` when every output is a standard stream.
    pub(crate) fn streams_only(&self) -> bool {
        self.sinks.iter().all(Sink::is_terminal_stream)
    }
}

/// Per-entry writer handed out to the fmt layer.
pub(crate) struct SinkWriter<'a> {
    sinks: &'a [Sink],
}

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A broken sink must not starve the others.
        let mut result = Ok(buf.len());
        for sink in self.sinks {
            if let Err(e) = sink.write_entry(buf) {
                result = Err(e);
            }
        }
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SinkSet {
    type Writer = SinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            sinks: &self.sinks,
        }
    }
}
