//! Logging for the IA-32 interpreter core.
//!
//! Handlers report through a single lazily-evaluated entry point; a
//! disabled category costs one atomic load per call site.
//!
//! # Architecture
//!
//! - **LogConfig**: process-wide configuration held in atomics
//! - **LogLevel**: Off < Error < Warn < Info < Debug < Trace
//! - **LogCategory**: CPU, Memory, Io, Fpu, Faults, Stubs
//! - **log()**: rate-limited output to stderr or a background file writer
//!
//! # Usage
//!
//! ```rust
//! use ia32_core::logging::{log, LogCategory, LogLevel};
//!
//! log(LogCategory::Faults, LogLevel::Debug, || {
//!     format!("#GP(0) at {:04X}:{:08X}", 0x0008, 0x1234)
//! });
//! ```

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

const CATEGORY_COUNT: usize = 6;

/// Log level for controlling verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Parse log level from string (case-insensitive, names or digits)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn from_u8(val: u8) -> Self {
        match val {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Off,
        }
    }
}

/// Subsystem a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Instruction trace
    CPU,
    /// Segment and limit checks on memory operands
    Memory,
    /// Port reads and writes
    Io,
    /// x87 exception bookkeeping
    Fpu,
    /// Architectural faults raised by handlers
    Faults,
    /// Paths that are not implemented, and tolerated quirks
    Stubs,
}

impl LogCategory {
    pub const ALL: [LogCategory; CATEGORY_COUNT] = [
        LogCategory::CPU,
        LogCategory::Memory,
        LogCategory::Io,
        LogCategory::Fpu,
        LogCategory::Faults,
        LogCategory::Stubs,
    ];

    fn index(self) -> usize {
        match self {
            LogCategory::CPU => 0,
            LogCategory::Memory => 1,
            LogCategory::Io => 2,
            LogCategory::Fpu => 3,
            LogCategory::Faults => 4,
            LogCategory::Stubs => 5,
        }
    }

    /// Parse a category name as accepted on a command line or in a config file
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cpu" => Some(LogCategory::CPU),
            "memory" | "mem" => Some(LogCategory::Memory),
            "io" | "port" => Some(LogCategory::Io),
            "fpu" | "x87" => Some(LogCategory::Fpu),
            "faults" | "fault" => Some(LogCategory::Faults),
            "stubs" | "stub" => Some(LogCategory::Stubs),
            _ => None,
        }
    }
}

/// Sliding one-second window per category.
struct RateLimiter {
    max_per_second: AtomicUsize,
    window: Duration,
    /// (recent timestamps, dropped since last report, last report time)
    state: Mutex<[(VecDeque<Instant>, usize, Option<Instant>); CATEGORY_COUNT]>,
}

impl RateLimiter {
    fn new(max_per_second: usize) -> Self {
        Self {
            max_per_second: AtomicUsize::new(max_per_second),
            window: Duration::from_secs(1),
            state: Mutex::new(std::array::from_fn(|_| (VecDeque::new(), 0, None))),
        }
    }

    /// Returns (allowed, dropped count to report)
    fn should_allow(&self, category: LogCategory) -> (bool, Option<usize>) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let (recent, dropped, last_report) = &mut state[category.index()];

        while let Some(&front) = recent.front() {
            if now.duration_since(front) > self.window {
                recent.pop_front();
            } else {
                break;
            }
        }

        if recent.len() < self.max_per_second.load(Ordering::Relaxed) {
            recent.push_back(now);
            if *dropped > 0 {
                let count = std::mem::take(dropped);
                *last_report = Some(now);
                return (true, Some(count));
            }
            return (true, None);
        }

        *dropped += 1;
        let due = last_report.map_or(true, |last| now.duration_since(last) >= self.window);
        if due {
            *last_report = Some(now);
            (false, Some(std::mem::take(dropped)))
        } else {
            (false, None)
        }
    }
}

/// Global logging configuration
pub struct LogConfig {
    global_level: AtomicU8,
    levels: [AtomicU8; CATEGORY_COUNT],
    log_sender: Mutex<Option<Sender<String>>>,
    file_logging_enabled: AtomicBool,
    rate_limiter: RateLimiter,
}

impl LogConfig {
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            levels: std::array::from_fn(|_| AtomicU8::new(LogLevel::Off as u8)),
            log_sender: Mutex::new(None),
            file_logging_enabled: AtomicBool::new(false),
            rate_limiter: RateLimiter::new(60),
        }
    }

    /// Get the global singleton instance
    pub fn global() -> &'static Self {
        use std::sync::OnceLock;
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.levels[category.index()].store(level as u8, Ordering::Relaxed);
    }

    pub fn get_level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.levels[category.index()].load(Ordering::Relaxed))
    }

    /// A category level other than Off wins; otherwise the global level decides.
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        if level == LogLevel::Off {
            return false;
        }
        match self.get_level(category) {
            LogLevel::Off => level <= self.get_global_level(),
            category_level => level <= category_level,
        }
    }

    /// Apply a filter such as `"warn,cpu=trace,faults=debug"`.
    ///
    /// A bare level sets the global level. Unknown entries are returned as the error.
    pub fn apply_filter(&self, filter: &str) -> Result<(), String> {
        for entry in filter.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once('=') {
                Some((cat, lvl)) => {
                    let category = LogCategory::from_str(cat.trim())
                        .ok_or_else(|| format!("unknown log category '{}'", cat))?;
                    let level = LogLevel::from_str(lvl.trim())
                        .ok_or_else(|| format!("unknown log level '{}'", lvl))?;
                    self.set_level(category, level);
                }
                None => {
                    let level = LogLevel::from_str(entry)
                        .ok_or_else(|| format!("unknown log level '{}'", entry))?;
                    self.set_global_level(level);
                }
            }
        }
        Ok(())
    }

    /// Reset all logging to Off
    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for category in LogCategory::ALL {
            self.set_level(category, LogLevel::Off);
        }
    }

    pub fn set_rate_limit(&self, max_logs_per_second: usize) {
        self.rate_limiter
            .max_per_second
            .store(max_logs_per_second, Ordering::Relaxed);
    }

    pub fn get_rate_limit(&self) -> usize {
        self.rate_limiter.max_per_second.load(Ordering::Relaxed)
    }

    /// Send output to `path` through a background writer thread.
    pub fn set_log_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = channel::<String>();

        thread::Builder::new()
            .name("ia32-log-writer".to_string())
            .spawn(move || {
                let mut file = file;
                while let Ok(message) = receiver.recv() {
                    let _ = writeln!(file, "{}", message);
                    let _ = file.flush();
                }
            })?;

        *self.log_sender.lock().unwrap() = Some(sender);
        self.file_logging_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop writing to the log file; the writer thread exits when the sender drops.
    pub fn clear_log_file(&self) {
        *self.log_sender.lock().unwrap() = None;
        self.file_logging_enabled.store(false, Ordering::Relaxed);
    }

    fn write_message(&self, message: &str) {
        if self.file_logging_enabled.load(Ordering::Relaxed) {
            let log_sender = self.log_sender.lock().unwrap();
            match log_sender.as_ref() {
                Some(sender) if sender.send(message.to_string()).is_ok() => {}
                _ => eprintln!("{}", message),
            }
        } else {
            eprintln!("{}", message);
        }
    }
}

/// Log a message with the specified category and level.
///
/// `message_fn` only runs when the category is enabled and the rate limiter
/// lets the message through.
pub fn log<F>(category: LogCategory, level: LogLevel, message_fn: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if !config.should_log(category, level) {
        return;
    }
    let (allowed, dropped) = config.rate_limiter.should_allow(category);
    if let Some(count) = dropped.filter(|&c| c > 0) {
        config.write_message(&format!(
            "[{:?}] rate limit exceeded, {} message(s) dropped",
            category, count
        ));
    }
    if allowed {
        config.write_message(&format!("[{:?}] {}", category, message_fn()));
    }
}
