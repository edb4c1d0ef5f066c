//! Console imports
//!
//! Module console output is recorded per boundary and forwarded to `tracing`.

use super::linker::u32_args;
use super::ImportLinker;
use crate::abi::{imports, HOST_MODULE_NAME};
use crate::boundary::Boundary;
use crate::error::BoundaryResult;
use parking_lot::RwLock;

/// Log levels (matching standard levels)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl From<u8> for LogLevel {
    fn from(v: u8) -> Self {
        match v {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Console line written by the module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: String) -> Self {
        Self { level, message }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ConsoleBuffer {
    entries: RwLock<Vec<LogEntry>>,
}

impl ConsoleBuffer {
    fn push(&self, entry: LogEntry) {
        match entry.level {
            LogLevel::Trace => tracing::trace!(target: "wasm_boundary::console", "{}", entry.message),
            LogLevel::Debug => tracing::debug!(target: "wasm_boundary::console", "{}", entry.message),
            LogLevel::Info => tracing::info!(target: "wasm_boundary::console", "{}", entry.message),
            LogLevel::Warn => tracing::warn!(target: "wasm_boundary::console", "{}", entry.message),
            LogLevel::Error => tracing::error!(target: "wasm_boundary::console", "{}", entry.message),
        }
        self.entries.write().push(entry);
    }
}

impl Boundary {
    /// Record a console line as if the module had logged it
    pub fn console_log(&self, level: LogLevel, message: impl Into<String>) {
        self.inner.console.push(LogEntry::new(level, message.into()));
    }

    pub fn console_entries(&self) -> Vec<LogEntry> {
        self.inner.console.entries.read().clone()
    }

    /// Remove and return everything logged so far
    pub fn drain_console(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.inner.console.entries.write())
    }
}

pub(super) fn register_console_imports(linker: &mut ImportLinker) -> BoundaryResult<()> {
    linker.func_wrap(HOST_MODULE_NAME, imports::CONSOLE_LOG, |cx, args| {
        let [level, ptr, len] = u32_args(imports::CONSOLE_LOG, args)?;
        let message = cx.decode_string(ptr, len)?;
        cx.console_log(LogLevel::from(level.min(u8::MAX as u32) as u8), message);
        Ok(Vec::new())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::CONSOLE_ERROR, |cx, args| {
        let [ptr, len] = u32_args(imports::CONSOLE_ERROR, args)?;
        let message = cx.decode_cached(ptr, len)?;
        if ptr != 0 {
            cx.free(ptr, len, 1)?;
        }
        cx.console_log(LogLevel::Error, message);
        Ok(Vec::new())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::CONSOLE_WARN, |cx, args| {
        let [handle] = u32_args(imports::CONSOLE_WARN, args)?;
        let value = cx.get_ref(handle)?;
        let message = match value.as_str() {
            Some(s) => s.to_string(),
            None => value.debug_string(),
        };
        cx.console_log(LogLevel::Warn, message);
        Ok(Vec::new())
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_u8() {
        assert_eq!(LogLevel::from(0), LogLevel::Trace);
        assert_eq!(LogLevel::from(3), LogLevel::Warn);
        assert_eq!(LogLevel::from(200), LogLevel::Error);
        assert_eq!(LogLevel::Info.as_str(), "INFO");
    }
}
