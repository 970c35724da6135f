// ─────────────────────────────────────────────────────────────────────────────
//  uartmon :: control  —  unix-socket administration protocol
// ─────────────────────────────────────────────────────────────────────────────
//
//  Newline-terminated ASCII, one request per connection:
//
//    STATUS          → status document (JSON)
//    YIELD <dev>     → OK yielded <dev>
//    RECLAIM <dev>   → OK reclaimed <dev>
//    QUIT            → OK shutting down
//
//  Failures answer `ERROR <cause>`. The daemon accepts, serves and closes;
//  there are no persistent connections.
// ─────────────────────────────────────────────────────────────────────────────

use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MonitorError, Result};

pub const SOCKET_NAME: &str = "uart-monitor.sock";

/// Largest request/response we are willing to buffer.
pub const MSG_BUF: usize = 4096;

const CLIENT_IO_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Status,
    Yield(String),
    Reclaim(String),
    Quit,
}

impl Request {
    /// Parse one request line. The error carries the offending line for
    /// the `ERROR unknown command` response.
    pub fn parse(line: &str) -> std::result::Result<Request, String> {
        let line = line.trim();
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("STATUS"), None, _) => Ok(Request::Status),
            (Some("QUIT"), None, _) => Ok(Request::Quit),
            (Some("YIELD"), Some(dev), None) => Ok(Request::Yield(dev.to_string())),
            (Some("RECLAIM"), Some(dev), None) => Ok(Request::Reclaim(dev.to_string())),
            _ => Err(line.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Listener (daemon side)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ControlListener {
    listener: UnixListener,
    path:     PathBuf,
}

impl ControlListener {
    /// Bind `<base>/uart-monitor.sock`, replacing any stale socket file.
    pub fn bind(base: &Path) -> Result<ControlListener> {
        let path = base.join(SOCKET_NAME);
        fs::remove_file(&path).ok();

        let listener = UnixListener::bind(&path)
            .map_err(|e| MonitorError::Control(format!("bind {}: {e}", path.display())))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| MonitorError::Control(format!("set nonblocking: {e}")))?;

        Ok(ControlListener { path, listener })
    }

    /// Accept one pending client, `None` when there is none. The returned
    /// stream carries short I/O timeouts so a stalled client cannot wedge
    /// the event loop.
    pub fn accept(&self) -> io::Result<Option<UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                stream.set_read_timeout(Some(CLIENT_IO_TIMEOUT))?;
                stream.set_write_timeout(Some(CLIENT_IO_TIMEOUT))?;
                Ok(Some(stream))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for ControlListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        fs::remove_file(&self.path).ok();
    }
}

/// Read the request line from a freshly accepted client.
pub fn read_request(stream: &mut UnixStream) -> io::Result<String> {
    let mut buf = [0u8; MSG_BUF];
    let n = stream.read(&mut buf)?;
    let text = String::from_utf8_lossy(&buf[..n]);
    Ok(text.lines().next().unwrap_or("").to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
//  Client helper (CLI side)
// ─────────────────────────────────────────────────────────────────────────────

/// One-shot request against a running daemon; returns the raw response.
pub fn send_command(base: &Path, line: &str) -> Result<String> {
    let path = base.join(SOCKET_NAME);
    let mut stream = UnixStream::connect(&path).map_err(|e| {
        MonitorError::Control(format!(
            "cannot reach daemon at {} ({e})\n  Hint: is `uartmon monitor` running?",
            path.display()
        ))
    })?;
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .map_err(|e| MonitorError::Control(e.to_string()))?;

    stream
        .write_all(format!("{line}\n").as_bytes())
        .map_err(|e| MonitorError::Control(format!("send: {e}")))?;
    stream
        .shutdown(std::net::Shutdown::Write)
        .map_err(|e| MonitorError::Control(format!("shutdown: {e}")))?;

    let mut response = String::new();
    stream
        .take(MSG_BUF as u64)
        .read_to_string(&mut response)
        .map_err(|e| MonitorError::Control(format!("receive: {e}")))?;
    Ok(response)
}

// ─────────────────────────────────────────────────────────────────────────────
