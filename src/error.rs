// ─────────────────────────────────────────────────────────────────────────────
//  uartmon :: error
// ─────────────────────────────────────────────────────────────────────────────

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Cannot open {path}: {source}")]
    OpenFailed { path: String, source: std::io::Error },

    #[error("Cannot configure {path}: {source}")]
    ConfigureFailed { path: String, source: std::io::Error },

    #[error("Cannot register {path} with the event loop: {source}")]
    RegisterFailed { path: String, source: std::io::Error },

    #[error("Another uartmon instance is running (pid {0})\n  Hint: stop it with `uartmon yield` per port or send it SIGTERM")]
    AlreadyRunning(i32),

    #[error("Cannot create session directory under {path}: {source}")]
    SessionCreateFailed { path: String, source: std::io::Error },

    #[error("Cannot open log file {path}: {source}")]
    LogOpenFailed { path: String, source: std::io::Error },

    #[error("Port {0} is already monitored")]
    Duplicate(String),

    #[error("Port {0} is excluded by --only")]
    FilterExcluded(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Port table is full ({0} ports)")]
    TableFull(usize),

    #[error("Not identifiable as a USB serial device: {0}")]
    NotIdentified(String),

    #[error("Control socket error: {0}")]
    Control(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
