// ─────────────────────────────────────────────────────────────────────────────
//  uartmon :: logfile  —  timestamped per-port log with partial-line buffering
// ─────────────────────────────────────────────────────────────────────────────
//
//  The writer is a two-state machine: the line buffer is either empty (no
//  prefix written yet) or non-empty (its `[timestamp] ` prefix is already in
//  the file, awaiting the rest of the line). `\r\n`, `\n` and bare `\r` all
//  collapse to a single line boundary; a `\r` at the end of one chunk and
//  its `\n` at the start of the next still count as one.
// ─────────────────────────────────────────────────────────────────────────────

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{MonitorError, Result};
use crate::util::timestamp_millis;

/// Partial-line buffer capacity. A line reaching `LINE_BUF - 1` bytes is
/// force-broken.
pub const LINE_BUF: usize = 2048;

/// Idle time after which a partial line is flushed by the periodic tick.
pub const STALE_FLUSH: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct LogFile {
    file:          Option<File>,
    path:          PathBuf,
    bytes_written: u64,
    line:          Vec<u8>,
    pending_cr:    bool,
    last_byte:     Instant,
}

impl LogFile {
    /// Open `<path>` for appending. A non-empty `header` produces the
    /// session banner before any data.
    pub fn open(path: &Path, header: &str) -> Result<LogFile> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| MonitorError::LogOpenFailed {
                path: path.display().to_string(),
                source,
            })?;

        let mut log = LogFile {
            file: Some(file),
            path: path.to_path_buf(),
            bytes_written: 0,
            line: Vec::with_capacity(LINE_BUF),
            pending_cr: false,
            last_byte: Instant::now(),
        };

        if !header.is_empty() {
            let banner = format!(
                "=== UART Monitor Session ===\n{header}Started: {}\n===\n\n",
                timestamp_millis()
            );
            log.emit(banner.as_bytes())
                .map_err(|source| MonitorError::LogOpenFailed {
                    path: path.display().to_string(),
                    source,
                })?;
        }

        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Ingest raw device bytes.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        for &b in data {
            if self.pending_cr {
                self.pending_cr = false;
                if b == b'\n' {
                    // Second half of a \r\n pair, already handled.
                    continue;
                }
            }
            match b {
                b'\r' => {
                    self.end_line()?;
                    self.pending_cr = true;
                }
                b'\n' => self.end_line()?,
                _ => {
                    if self.line.is_empty() {
                        let prefix = format!("[{}] ", timestamp_millis());
                        self.emit(prefix.as_bytes())?;
                    }
                    self.line.push(b);
                    if self.line.len() >= LINE_BUF - 1 {
                        // Forced break; the next byte starts a fresh
                        // timestamped line.
                        self.end_line()?;
                    }
                }
            }
        }
        self.last_byte = Instant::now();
        Ok(())
    }

    /// Terminate any partial line now.
    pub fn flush(&mut self) -> io::Result<()> {
        if !self.line.is_empty() {
            self.end_line()?;
        }
        if let Some(f) = self.file.as_mut() {
            f.flush()?;
        }
        Ok(())
    }

    /// Periodic tick: terminate a partial line whose last byte is older
    /// than [`STALE_FLUSH`]. Its timestamp prefix was written when the
    /// first byte arrived. Returns whether a flush happened.
    pub fn flush_stale(&mut self) -> io::Result<bool> {
        if self.line.is_empty() || self.last_byte.elapsed() <= STALE_FLUSH {
            return Ok(false);
        }
        self.end_line()?;
        if let Some(f) = self.file.as_mut() {
            f.flush()?;
        }
        Ok(true)
    }

    /// State-transition marker, on its own line surrounded by blanks.
    pub fn marker(&mut self, msg: &str) -> io::Result<()> {
        if !self.line.is_empty() {
            // The marker's leading newline terminates the partial line.
            let pending = std::mem::take(&mut self.line);
            self.emit(&pending)?;
        }
        let text = format!("\n--- {msg} [{}] ---\n\n", timestamp_millis());
        self.emit(text.as_bytes())?;
        if let Some(f) = self.file.as_mut() {
            f.flush()?;
        }
        Ok(())
    }

    /// Flush and close. Safe to call more than once.
    pub fn close(&mut self) {
        if self.file.is_some() {
            let _ = self.flush();
        }
        self.file = None;
    }

    // ── internals ─────────────────────────────────────────────────────────

    /// Write the buffered line content plus `\n` and reset the buffer.
    fn end_line(&mut self) -> io::Result<()> {
        let mut pending = std::mem::take(&mut self.line);
        pending.push(b'\n');
        self.emit(&pending)
    }

    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        let f = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        f.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    #[cfg(test)]
    fn backdate(&mut self, by: Duration) {
        self.last_byte -= by;
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        self.close();
    }
}

// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn open_plain(dir: &tempfile::TempDir) -> LogFile {
        LogFile::open(&dir.path().join("PORT.log"), "").unwrap()
    }

    fn contents(log: &LogFile) -> String {
        fs::read_to_string(log.path()).unwrap()
    }

    /// `[YYYY-MM-DD HH:MM:SS.mmm] payload` → `payload`, verifying the
    /// prefix shape on the way.
    fn strip_ts(line: &str) -> &str {
        assert_eq!(line.as_bytes()[0], b'[', "missing prefix in {line:?}");
        assert_eq!(&line[24..26], "] ", "malformed prefix in {line:?}");
        &line[26..]
    }

    #[test]
    fn every_line_is_timestamped() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_plain(&dir);
        log.write(b"Hello world\nSecond line\n").unwrap();

        let text = contents(&log);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(strip_ts(lines[0]), "Hello world");
        assert_eq!(strip_ts(lines[1]), "Second line");
        assert_eq!(log.bytes_written(), text.len() as u64);
    }

    #[test]
    fn crlf_and_bare_cr_both_delimit() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_plain(&dir);
        log.write(b"A\r\nB\r\n").unwrap();
        log.write(b"C\rD\n").unwrap();

        let text = contents(&log);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(strip_ts(lines[0]), "A");
        assert_eq!(strip_ts(lines[1]), "B");
        assert_eq!(strip_ts(lines[2]), "C");
        assert_eq!(strip_ts(lines[3]), "D");
    }

    #[test]
    fn cr_lf_split_across_chunks_is_one_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_plain(&dir);
        log.write(b"A\r").unwrap();
        log.write(b"\nB\n").unwrap();

        let text = contents(&log);
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn partial_line_stays_buffered_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_plain(&dir);
        log.write(b"A").unwrap();

        // Prefix is on disk, payload is not, and there is no newline.
        let text = contents(&log);
        assert!(!text.contains('\n'));
        assert!(text.starts_with('['));

        log.flush().unwrap();
        let text = contents(&log);
        assert_eq!(strip_ts(text.lines().next().unwrap()), "A");
    }

    #[test]
    fn stale_partial_line_is_flushed_by_tick() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_plain(&dir);
        log.write(b"straggler").unwrap();

        assert!(!log.flush_stale().unwrap(), "fresh line must not flush");
        log.backdate(Duration::from_millis(250));
        assert!(log.flush_stale().unwrap());
        assert!(contents(&log).ends_with("straggler\n"));
    }

    #[test]
    fn oversized_line_is_force_broken() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_plain(&dir);
        log.write(&vec![b'x'; LINE_BUF + 10]).unwrap();
        log.flush().unwrap();

        let text = contents(&log);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(strip_ts(lines[0]).len(), LINE_BUF - 1);
        assert_eq!(strip_ts(lines[1]).len(), 11);
    }

    #[test]
    fn marker_lands_between_data_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_plain(&dir);
        log.write(b"before\n").unwrap();
        log.marker("PORT YIELDED").unwrap();
        log.write(b"after\n").unwrap();

        let text = contents(&log);
        let marker_line = text
            .lines()
            .find(|l| l.starts_with("--- PORT YIELDED ["))
            .expect("marker line missing");
        assert!(marker_line.ends_with("] ---"));

        let before = text.find("before").unwrap();
        let mark = text.find("--- PORT YIELDED").unwrap();
        let after = text.find("after").unwrap();
        assert!(before < mark && mark < after);
    }

    #[test]
    fn empty_input_lines_carry_no_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_plain(&dir);
        log.write(b"\n\n").unwrap();
        assert_eq!(contents(&log), "\n\n");
    }

    #[test]
    fn banner_format() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::open(
            &dir.path().join("B.log"),
            "Device:    /dev/ttyUSB0\n",
        )
        .unwrap();

        let text = contents(&log);
        assert!(text.starts_with("=== UART Monitor Session ===\n"));
        assert!(text.contains("Device:    /dev/ttyUSB0\nStarted: "));
        assert!(text.ends_with("===\n\n"));
    }

    #[test]
    fn close_is_idempotent_and_terminates_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_plain(&dir);
        log.write(b"tail").unwrap();
        log.close();
        log.close();
        assert!(!log.is_open());
        assert!(contents(&log).ends_with("tail\n"));
    }
}
