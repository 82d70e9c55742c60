//! Routes the core's `log` records to a host-supplied sink.
//!
//! Hosts that already run a `log` backend need nothing from here; the CLI,
//! for one, bridges records into `tracing`. Firmware shells and test
//! harnesses without a backend implement [`Logger`], or use
//! [`ConsoleLogger`], and call [`install`] once at start-up.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use huk_identity_core::logger::{self, ConsoleLogger, LogLevel};
//!
//! logger::install(Arc::new(ConsoleLogger::new(std::io::stderr())), LogLevel::Info)
//!     .expect("first backend");
//! assert!(logger::install(Arc::new(ConsoleLogger::new(std::io::sink())), LogLevel::Info).is_err());
//! ```

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use strum::Display;

use crate::error::{IdentityError, IdentityResult};

/// Records below `Info` are only forwarded from targets under this prefix.
const CORE_TARGET_PREFIX: &str = "huk_identity";

/// Severity of a record, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    /// Step-by-step detail.
    Trace,
    /// Diagnostics.
    Debug,
    /// Progress of provisioning and key generation.
    Info,
    /// Recoverable problems.
    Warn,
    /// Failed operations.
    Error,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Self::Error,
            log::Level::Warn => Self::Warn,
            log::Level::Info => Self::Info,
            log::Level::Debug => Self::Debug,
            log::Level::Trace => Self::Trace,
        }
    }
}

impl LogLevel {
    const fn filter(self) -> log::LevelFilter {
        match self {
            Self::Trace => log::LevelFilter::Trace,
            Self::Debug => log::LevelFilter::Debug,
            Self::Info => log::LevelFilter::Info,
            Self::Warn => log::LevelFilter::Warn,
            Self::Error => log::LevelFilter::Error,
        }
    }
}

/// Receives the records the core emits.
pub trait Logger: Send + Sync {
    /// Handles one record. `target` is the emitting module path.
    fn log(&self, level: LogLevel, target: &str, message: &str);
}

/// Writes one `<level> <target>: <message>` line per record.
///
/// Suits a UART console or a log file. Write errors are dropped.
#[derive(Debug)]
pub struct ConsoleLogger<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> ConsoleLogger<W> {
    /// Wraps `out`.
    #[must_use]
    pub const fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Returns the writer.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> Logger for ConsoleLogger<W> {
    fn log(&self, level: LogLevel, target: &str, message: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(out, "{level:<5} {target}: {message}");
    }
}

struct Bridge {
    sink: Arc<dyn Logger>,
    min_level: LogLevel,
}

impl Bridge {
    fn accepts(&self, level: log::Level, target: &str) -> bool {
        let level = LogLevel::from(level);
        level >= self.min_level
            && (level >= LogLevel::Info || target.starts_with(CORE_TARGET_PREFIX))
    }
}

impl log::Log for Bridge {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.accepts(metadata.level(), metadata.target())
    }

    fn log(&self, record: &log::Record) {
        if self.accepts(record.level(), record.target()) {
            self.sink.log(
                record.level().into(),
                record.target(),
                &record.args().to_string(),
            );
        }
    }

    fn flush(&self) {}
}

/// Installs `sink` as the process-wide `log` backend.
///
/// Records below `min_level` are discarded. Debug and trace records from
/// other crates are always discarded.
///
/// # Errors
///
/// Returns `InvalidInput` if a `log` backend is already installed.
pub fn install(sink: Arc<dyn Logger>, min_level: LogLevel) -> IdentityResult<()> {
    log::set_boxed_logger(Box::new(Bridge { sink, min_level }))
        .map_err(|_| IdentityError::invalid_input("a log backend is already installed"))?;
    log::set_max_level(min_level.filter());
    Ok(())
}
