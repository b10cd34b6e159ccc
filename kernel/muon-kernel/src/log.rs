//! Kernel logger: sinks behind the `muon-core` log macros.
//!
//! Two phases. Before the heap exists, [`init_early_serial`] registers
//! lock-free functions that write straight to COM1. Once allocation works,
//! [`init_logger`] swaps in the [`Logger`], which fans out to a growable
//! set of [`LogSink`]s (serial now; the console layer adds its own later
//! via [`add_sink`]).

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use muon_core::log::LogLevel;
use muon_core::sync::SpinLock;
use muon_core::time;

/// An output sink for kernel log records.
pub trait LogSink: Send + Sync {
    /// Writes a text fragment.
    fn write_str(&self, s: &str);
    /// Most verbose level this sink wants.
    fn max_level(&self) -> LogLevel;
    /// Name for diagnostics and replacement.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Serial sink (x86_64 only; other targets start with no sinks)
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
mod serial {
    use muon_drivers::uart16550::{COM1, Uart16550};

    use super::{LogLevel, LogSink, fmt};
    use core::fmt::Write as _;

    /// A [`LogSink`] writing to the 16550 UART.
    pub struct SerialSink {
        uart: Uart16550,
        max_level: LogLevel,
    }

    impl SerialSink {
        /// A sink over COM1.
        pub fn com1(max_level: LogLevel) -> Self {
            Self {
                uart: Uart16550::new(COM1),
                max_level,
            }
        }
    }

    impl LogSink for SerialSink {
        fn write_str(&self, s: &str) {
            for byte in s.bytes() {
                if byte == b'\n' {
                    self.uart.write_byte(b'\r');
                }
                self.uart.write_byte(byte);
            }
        }

        fn max_level(&self) -> LogLevel {
            self.max_level
        }

        fn name(&self) -> &str {
            "serial"
        }
    }

    /// `fmt::Write` over a stack-constructed UART; used pre-heap and from
    /// the panic path where no locks may be taken.
    pub struct SerialWriter(pub Uart16550);

    impl fmt::Write for SerialWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for byte in s.bytes() {
                if byte == b'\n' {
                    self.0.write_byte(b'\r');
                }
                self.0.write_byte(byte);
            }
            Ok(())
        }
    }

    pub(super) fn early_print(args: fmt::Arguments<'_>) {
        let mut w = SerialWriter(Uart16550::new(COM1));
        let _ = w.write_fmt(args);
    }

    pub(super) fn early_log(level: LogLevel, args: fmt::Arguments<'_>) {
        let mut w = SerialWriter(Uart16550::new(COM1));
        let _ = super::write_record(&mut w, level, args);
    }
}

#[cfg(target_arch = "x86_64")]
pub use serial::{SerialSink, SerialWriter};

/// Formats one `[  sec.mmm] LEVEL message` record.
fn write_record(
    w: &mut impl fmt::Write,
    level: LogLevel,
    args: fmt::Arguments<'_>,
) -> fmt::Result {
    let ms = time::uptime_ms();
    write!(
        w,
        "[{:>5}.{:03}] {} {}\n",
        ms / 1000,
        ms % 1000,
        level.name(),
        args
    )
}

// ---------------------------------------------------------------------------
// Full logger
// ---------------------------------------------------------------------------

struct LoggerInner {
    sinks: Vec<Box<dyn LogSink>>,
}

/// Fan-out logger holding the registered sinks.
pub struct Logger {
    inner: SpinLock<Option<LoggerInner>>,
}

impl Logger {
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    fn init(&self, sinks: Vec<Box<dyn LogSink>>) {
        *self.inner.lock() = Some(LoggerInner { sinks });
    }

    fn add_sink(&self, sink: Box<dyn LogSink>) {
        if let Some(inner) = self.inner.lock().as_mut() {
            inner.sinks.push(sink);
        }
    }

    fn write_raw(&self, args: fmt::Arguments<'_>) {
        if let Some(inner) = self.inner.lock().as_ref() {
            for sink in &inner.sinks {
                let mut w = SinkWriter(sink.as_ref());
                let _ = w.write_fmt(args);
            }
        }
    }

    fn write_leveled(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if let Some(inner) = self.inner.lock().as_ref() {
            for sink in &inner.sinks {
                if level <= sink.max_level() {
                    let mut w = SinkWriter(sink.as_ref());
                    let _ = write_record(&mut w, level, args);
                }
            }
        }
    }
}

struct SinkWriter<'a>(&'a dyn LogSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// The global logger.
pub static LOGGER: Logger = Logger::new();

fn logger_print(args: fmt::Arguments<'_>) {
    LOGGER.write_raw(args);
}

fn logger_log(level: LogLevel, args: fmt::Arguments<'_>) {
    LOGGER.write_leveled(level, args);
}

/// Registers the lock-free early serial output (pre-heap).
pub fn init_early_serial() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: The early functions construct the UART on the stack and take
    // no locks, so they are callable from any context.
    unsafe {
        let uart = muon_drivers::uart16550::Uart16550::new(muon_drivers::uart16550::COM1);
        uart.init();
        muon_core::log::set_print_fn(serial::early_print);
        muon_core::log::set_log_fn(serial::early_log);
    }
}

/// Switches to the full logger with the serial sink registered (post-heap).
pub fn init_logger() {
    let mut sinks: Vec<Box<dyn LogSink>> = Vec::with_capacity(2);
    #[cfg(target_arch = "x86_64")]
    sinks.push(Box::new(SerialSink::com1(LogLevel::Trace)));
    LOGGER.init(sinks);

    // SAFETY: The logger functions only take the logger's own lock and are
    // callable from any context that may log.
    unsafe {
        muon_core::log::set_print_fn(logger_print);
        muon_core::log::set_log_fn(logger_log);
    }
}

/// Registers an extra sink (framebuffer console, etc.).
pub fn add_sink(sink: Box<dyn LogSink>) {
    LOGGER.add_sink(sink);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::sync::{Arc, Mutex};

    struct CaptureSink {
        buf: Arc<Mutex<String>>,
        max: LogLevel,
    }

    impl LogSink for CaptureSink {
        fn write_str(&self, s: &str) {
            self.buf.lock().unwrap().push_str(s);
        }
        fn max_level(&self) -> LogLevel {
            self.max
        }
        fn name(&self) -> &str {
            "capture"
        }
    }

    #[test]
    fn leveled_records_are_filtered_and_formatted() {
        let logger = Logger::new();
        let buf = Arc::new(Mutex::new(String::new()));
        logger.init(vec![Box::new(CaptureSink {
            buf: buf.clone(),
            max: LogLevel::Info,
        })]);

        logger.write_leveled(LogLevel::Info, format_args!("hello {}", 1));
        logger.write_leveled(LogLevel::Debug, format_args!("dropped"));
        logger.write_raw(format_args!("raw text"));

        let text = buf.lock().unwrap().clone();
        assert!(text.contains("INFO  hello 1"), "{text:?}");
        assert!(!text.contains("dropped"));
        assert!(text.contains("raw text"));
        // Timestamped record shape: "[    0.000] ..." at minimum.
        assert!(text.contains('[') && text.contains(']'));
    }

    #[test]
    fn uninitialised_logger_discards_quietly() {
        let logger = Logger::new();
        logger.write_raw(format_args!("nowhere"));
        logger.write_leveled(LogLevel::Error, format_args!("nowhere"));
    }

    #[test]
    fn added_sinks_receive_subsequent_records() {
        let logger = Logger::new();
        logger.init(Vec::new());

        let buf = Arc::new(Mutex::new(String::new()));
        logger.add_sink(Box::new(CaptureSink {
            buf: buf.clone(),
            max: LogLevel::Trace,
        }));
        logger.write_leveled(LogLevel::Trace, format_args!("late sink"));
        assert!(buf.lock().unwrap().contains("late sink"));
    }
}
