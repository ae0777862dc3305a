//! Reloadable tracing setup.
//!
//! The daemon must be able to change its log level and sink at runtime
//! (`box admin log-target`, `reload-config`) without restarting. The level
//! goes through a reloadable env filter; the sink is a swappable writer
//! handed to the fmt layer once at startup.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, RwLock};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

use box_core::config::{LogLevel, LogTarget};

/// Handle for runtime log reconfiguration.
#[derive(Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    writer: SwapWriter,
}

impl LogHandle {
    pub fn set_level(&self, level: LogLevel) {
        if let Err(e) = self.filter.reload(EnvFilter::new(level.directive())) {
            tracing::warn!(error = %e, "log level reload failed");
        }
    }

    /// Point the sink somewhere else. Fails if a log file cannot be opened;
    /// the previous sink stays active in that case.
    pub fn set_target(&self, target: LogTarget) -> io::Result<()> {
        self.writer.set(target)
    }

    pub fn current_target(&self) -> LogTarget {
        self.writer.current()
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured
/// level, matching the usual daemon debugging workflow.
pub fn init(level: LogLevel, target: LogTarget) -> io::Result<LogHandle> {
    let writer = SwapWriter::new(target)?;

    let filter = std::env::var("RUST_LOG")
        .ok()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(level.directive()));
    let (filter, handle) = reload::Layer::new(filter);

    // A second init in the same process (tests, embedding) keeps the first
    // subscriber; the writer handle still works either way.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(writer.clone()))
        .try_init();

    Ok(LogHandle {
        filter: handle,
        writer,
    })
}

// ── Swappable writer ──────────────────────────────────────────────────────────

enum Sink {
    Stderr,
    Stdout,
    File(LogTarget, Arc<Mutex<std::fs::File>>),
}

/// A `MakeWriter` whose destination can be replaced at runtime.
#[derive(Clone)]
pub struct SwapWriter {
    sink: Arc<RwLock<Sink>>,
}

impl SwapWriter {
    fn new(target: LogTarget) -> io::Result<Self> {
        let writer = Self {
            sink: Arc::new(RwLock::new(Sink::Stderr)),
        };
        writer.set(target)?;
        Ok(writer)
    }

    fn set(&self, target: LogTarget) -> io::Result<()> {
        let sink = match &target {
            LogTarget::Stderr => Sink::Stderr,
            LogTarget::Stdout => Sink::Stdout,
            LogTarget::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Sink::File(target.clone(), Arc::new(Mutex::new(file)))
            }
        };
        if let Ok(mut guard) = self.sink.write() {
            *guard = sink;
        }
        Ok(())
    }

    fn current(&self) -> LogTarget {
        match self.sink.read() {
            Ok(guard) => match &*guard {
                Sink::Stderr => LogTarget::Stderr,
                Sink::Stdout => LogTarget::Stdout,
                Sink::File(target, _) => target.clone(),
            },
            Err(_) => LogTarget::Stderr,
        }
    }
}

pub enum SinkWriter {
    Stderr(io::Stderr),
    Stdout(io::Stdout),
    File(Arc<Mutex<std::fs::File>>),
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkWriter::Stderr(w) => w.write(buf),
            SinkWriter::Stdout(w) => w.write(buf),
            SinkWriter::File(file) => match file.lock() {
                Ok(mut guard) => guard.write(buf),
                Err(_) => Ok(buf.len()),
            },
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkWriter::Stderr(w) => w.flush(),
            SinkWriter::Stdout(w) => w.flush(),
            SinkWriter::File(file) => match file.lock() {
                Ok(mut guard) => guard.flush(),
                Err(_) => Ok(()),
            },
        }
    }
}

impl<'a> MakeWriter<'a> for SwapWriter {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        match self.sink.read() {
            Ok(guard) => match &*guard {
                Sink::Stderr => SinkWriter::Stderr(io::stderr()),
                Sink::Stdout => SinkWriter::Stdout(io::stdout()),
                Sink::File(_, file) => SinkWriter::File(file.clone()),
            },
            Err(_) => SinkWriter::Stderr(io::stderr()),
        }
    }
}
