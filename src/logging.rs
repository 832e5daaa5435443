//! Name-keyed loggers with a bracketed, optionally colorized line format:
//!
//! `[name][LEVEL][YYYY-mm-dd HH:MM:SS][file:line] message`
//!
//! Each name maps to exactly one logger for the life of the process. The
//! `log` facade is backed by a dispatcher that routes each record to the
//! logger named by its target (or the target's first `::` segment), so
//! `log::warn!(target: "scheduler", ...)` reaches the `scheduler` logger and
//! everything else lands on the default one.
//!
//! Levels print with the names operators already grep for: `WARNING`
//! rather than `WARN`. `log` has no level above `ERROR`, so `CRITICAL` in
//! settings is read as `ERROR`.

use crate::settings::LogSettings;
use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::collections::HashMap;
use std::io::{self, IsTerminal, Write};
use std::sync::{Mutex, OnceLock};

pub const DEFAULT_LOGGER: &str = "kvcached";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const COLOR_RESET: &str = "\x1b[0m";

static REGISTRY: OnceLock<Mutex<HashMap<String, &'static NamedLogger>>> = OnceLock::new();
static DISPATCH: Dispatch = Dispatch;

#[derive(Debug)]
pub struct NamedLogger {
    name: String,
    level: LevelFilter,
    colorize: bool,
}

impl NamedLogger {
    fn new(name: &str, settings: &LogSettings) -> Self {
        Self {
            name: name.to_string(),
            level: settings.level,
            colorize: settings.use_color && io::stderr().is_terminal(),
        }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    fn render(&self, record: &Record) -> String {
        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let line = format_line(
            &self.name,
            record.level(),
            &timestamp,
            record.file().unwrap_or("<unknown>"),
            record.line().unwrap_or(0),
            &record.args().to_string(),
        );
        if self.colorize {
            colorize(&line, level_color(record.level()))
        } else {
            line
        }
    }
}

impl Log for NamedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.render(record);
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{line}");
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

fn registry() -> std::sync::MutexGuard<'static, HashMap<String, &'static NamedLogger>> {
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Returns the logger registered under `name`, creating it on first use.
///
/// Settings only matter for the call that creates the logger; later calls
/// for the same name get the existing instance unchanged.
pub fn get_logger(name: &str, settings: &LogSettings) -> &'static NamedLogger {
    let mut loggers = registry();
    if let Some(existing) = loggers.get(name) {
        return *existing;
    }
    let logger: &'static NamedLogger = Box::leak(Box::new(NamedLogger::new(name, settings)));
    loggers.insert(name.to_string(), logger);
    logger
}

/// Picks the registered logger for a record target: the full target, then
/// its crate-level prefix, then the default logger. `None` only before
/// `init` has registered the default.
fn route(target: &str) -> Option<&'static NamedLogger> {
    let loggers = registry();
    let head = target.split("::").next().unwrap_or(target);
    loggers
        .get(target)
        .or_else(|| loggers.get(head))
        .or_else(|| loggers.get(DEFAULT_LOGGER))
        .copied()
}

/// The `log` backend. Each named logger applies its own level.
struct Dispatch;

impl Log for Dispatch {
    fn enabled(&self, metadata: &Metadata) -> bool {
        route(metadata.target()).is_some_and(|logger| logger.enabled(metadata))
    }

    fn log(&self, record: &Record) {
        if let Some(logger) = route(record.target()) {
            logger.log(record);
        }
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

/// Registers the default logger and installs the dispatcher as the `log`
/// backend. Safe to call repeatedly.
pub fn init(settings: &LogSettings) -> &'static NamedLogger {
    let logger = get_logger(DEFAULT_LOGGER, settings);
    if log::set_logger(&DISPATCH).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
    logger
}

pub fn format_line(
    name: &str,
    level: Level,
    timestamp: &str,
    file: &str,
    line: u32,
    message: &str,
) -> String {
    let file = file.rsplit('/').next().unwrap_or(file);
    let level = level_name(level);
    format!("[{name}][{level}][{timestamp}][{file}:{line}] {message}")
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARNING",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Colors the bracketed prefix (through the first `] `) and resets before
/// the message. Lines without a prefix are colored whole.
pub fn colorize(line: &str, color: &str) -> String {
    match line.find("] ") {
        Some(idx) => {
            let (prefix, rest) = line.split_at(idx + 2);
            format!("{color}{prefix}{COLOR_RESET}{rest}")
        }
        None => format!("{color}{line}{COLOR_RESET}"),
    }
}

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[31m",
        Level::Warn => "\x1b[33m",
        Level::Info => "\x1b[32m",
        Level::Debug => "\x1b[36m",
        Level::Trace => "\x1b[35m",
    }
}
