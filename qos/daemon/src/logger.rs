//! Per-run log capture
//!
//! A [`ScrapeLogger`] renders logfmt lines into a private buffer for the
//! history trace and forwards every line to the process logger at debug
//! level.

use chrono::{SecondsFormat, Utc};
use log::Level;
use parking_lot::Mutex;
use std::fmt::{Display, Write};

/// Log target used when forwarding run output
pub const LOG_TARGET: &str = "blackbox_qos::probe";

/// Logger bound to one module and target
pub struct ScrapeLogger {
    module: String,
    target: String,
    buffer: Mutex<String>,
}

impl ScrapeLogger {
    pub fn new(module: &str, target: &str) -> Self {
        Self {
            module: module.to_string(),
            target: target.to_string(),
            buffer: Mutex::new(String::new()),
        }
    }

    pub fn debug(&self, msg: &str, fields: &[(&str, &dyn Display)]) {
        self.log(Level::Debug, msg, fields);
    }

    pub fn info(&self, msg: &str, fields: &[(&str, &dyn Display)]) {
        self.log(Level::Info, msg, fields);
    }

    pub fn warn(&self, msg: &str, fields: &[(&str, &dyn Display)]) {
        self.log(Level::Warn, msg, fields);
    }

    pub fn error(&self, msg: &str, fields: &[(&str, &dyn Display)]) {
        self.log(Level::Error, msg, fields);
    }

    /// Record one line
    pub fn log(&self, level: Level, msg: &str, fields: &[(&str, &dyn Display)]) {
        let mut line = String::new();
        let _ = write!(
            line,
            "level={} module={} target={} msg={}",
            level.as_str().to_lowercase(),
            logfmt_value(&self.module),
            logfmt_value(&self.target),
            logfmt_value(msg)
        );
        for (key, value) in fields {
            let _ = write!(line, " {}={}", key, logfmt_value(&value.to_string()));
        }

        log::debug!(target: LOG_TARGET, "{}", line);

        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut buffer = self.buffer.lock();
        let _ = writeln!(buffer, "ts={} {}", ts, line);
    }

    /// Captured lines so far
    pub fn contents(&self) -> String {
        self.buffer.lock().clone()
    }
}

fn logfmt_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '=' || c == '\\' || c.is_control());
    if needs_quotes {
        format!("{:?}", value)
    } else {
        value.to_string()
    }
}
