// ─────────────────────────────────────────────────────────────────────────────
//  uartmon :: daemon  —  the event core
// ─────────────────────────────────────────────────────────────────────────────
//
//  One thread, one epoll. Serial bytes, hot-plug notifications, control
//  clients and signals all arrive as readiness events tagged with their
//  source; ports live in a dense table whose slot index is carried inside
//  the serial/PTY tags. Removing a port compacts the table and rewrites
//  the tags of every shifted entry, so a tag is valid exactly as long as
//  the current readiness batch — which is why a removal ends the batch.
// ─────────────────────────────────────────────────────────────────────────────

use std::fs;
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::unistd::Pid;
use serde::Serialize;

use crate::boards::BoardOverrides;
use crate::control::{read_request, ControlListener, Request};
use crate::error::{MonitorError, Result};
use crate::hotplug::{HotplugAction, HotplugSource};
use crate::identify::{self, IdentifiedPort};
use crate::logfile::LogFile;
use crate::serial::SerialHandle;
use crate::session::{create_session, prune_sessions, MAX_SESSIONS};
use crate::util::{ensure_dir, symlink_atomic};

pub const MAX_PORTS: usize = 64;
const MAX_EVENTS: usize = MAX_PORTS + 16;
const READ_BUF: usize = 4096;

/// Readiness wait ceiling; also drives the stale-line flush.
const EPOLL_TICK_MS: u16 = 500;

/// Grace period after a hot-plug ADD before sysfs is read.
const SETTLE: Duration = Duration::from_millis(200);

const PID_FILE: &str = "uart-monitor.pid";
const STATUS_FILE: &str = "status.json";
const PTY_DIR: &str = "pty";

pub const DEFAULT_BASE: &str = "/tmp/uart-monitor";
pub const DEFAULT_BAUD: u32 = 115200;

// ─────────────────────────────────────────────────────────────────────────────
//  Event source tags
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of an epoll producer, packed into the event's u64 data:
/// kind in the high half, port slot index in the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Signal,
    Hotplug,
    Control,
    Serial(usize),
    Pty(usize),
}

impl Source {
    fn tag(self) -> u64 {
        match self {
            Source::Signal => 0 << 32,
            Source::Hotplug => 1 << 32,
            Source::Control => 2 << 32,
            Source::Serial(i) => (3 << 32) | i as u64,
            Source::Pty(i) => (4 << 32) | i as u64,
        }
    }

    fn from_tag(tag: u64) -> Option<Source> {
        let idx = (tag & 0xffff_ffff) as usize;
        match tag >> 32 {
            0 => Some(Source::Signal),
            1 => Some(Source::Hotplug),
            2 => Some(Source::Control),
            3 => Some(Source::Serial(idx)),
            4 => Some(Source::Pty(idx)),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Configuration and port state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Base directory for the pid file, control socket, status and sessions.
    pub base:    PathBuf,
    pub baud:    u32,
    /// Comma-separated device list; empty means all.
    pub filter:  Option<String>,
    /// Hold the device exclusively and expose a PTY per port.
    pub proxy:   bool,
    /// Send sd_notify READY/STOPPING datagrams.
    pub systemd: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            base: PathBuf::from(DEFAULT_BASE),
            baud: DEFAULT_BAUD,
            filter: None,
            proxy: false,
            systemd: false,
        }
    }
}

/// Does `dev_path` pass the `--only` filter? Tokens are trimmed of leading
/// spaces and match either the full path or the trailing tty name.
pub fn filter_match(filter: Option<&str>, dev_path: &str) -> bool {
    let Some(filter) = filter else { return true };
    if filter.trim().is_empty() {
        return true;
    }
    let tty = dev_path.rsplit('/').next().unwrap_or(dev_path);
    filter
        .split(',')
        .map(str::trim_start)
        .any(|t| t == dev_path || t == tty)
}

/// One entry in the port table.
#[derive(Debug)]
struct MonitoredPort {
    info:       IdentifiedPort,
    serial:     SerialHandle,
    log:        LogFile,
    yielded:    bool,
    bytes_read: u64,
    pty_link:   Option<PathBuf>,
}

enum ReadOutcome {
    Idle,
    Progress,
    Dead(String),
}

enum ReclaimOutcome {
    Reclaimed,
    AlreadyMonitoring,
}

// ─────────────────────────────────────────────────────────────────────────────
//  Pid-file lock
// ─────────────────────────────────────────────────────────────────────────────

/// Single-instance guard. A pid file whose process no longer exists is
/// reclaimed; liveness is probed with signal 0.
#[derive(Debug)]
struct PidLock {
    path: PathBuf,
}

impl PidLock {
    fn acquire(base: &Path) -> Result<PidLock> {
        let path = base.join(PID_FILE);

        if let Ok(text) = fs::read_to_string(&path) {
            if let Ok(pid) = text.trim().parse::<i32>() {
                if pid_alive(pid) {
                    return Err(MonitorError::AlreadyRunning(pid));
                }
                info!("removing stale pid file (pid {pid} is gone)");
            }
            fs::remove_file(&path)?;
        }

        fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(PidLock { path })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        fs::remove_file(&self.path).ok();
    }
}

fn pid_alive(pid: i32) -> bool {
    // ESRCH is the only proof of death; EPERM means alive but foreign.
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

// ─────────────────────────────────────────────────────────────────────────────
//  Daemon
// ─────────────────────────────────────────────────────────────────────────────

pub struct Daemon {
    cfg:       MonitorConfig,
    epoll:     Epoll,
    signals:   SignalFd,
    hotplug:   HotplugSource,
    control:   ControlListener,
    session:   PathBuf,
    ports:     Vec<MonitoredPort>,
    overrides: BoardOverrides,
    running:   bool,
    _pid_lock: PidLock,
}

impl Daemon {
    /// Build the whole core: lock, session, event sources, initial scan,
    /// first status snapshot.
    pub fn new(cfg: MonitorConfig) -> Result<Daemon> {
        ensure_dir(&cfg.base).map_err(|source| MonitorError::SessionCreateFailed {
            path: cfg.base.display().to_string(),
            source,
        })?;
        let pid_lock = PidLock::acquire(&cfg.base)?;

        let session = create_session(&cfg.base)?;
        let pruned = prune_sessions(&cfg.base, MAX_SESSIONS);
        if pruned > 0 {
            info!("pruned {pruned} old session(s)");
        }

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| MonitorError::Io(e.into()))?;

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGHUP);
        mask.thread_block().map_err(|e| MonitorError::Io(e.into()))?;
        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| MonitorError::Io(e.into()))?;

        let hotplug = HotplugSource::new()?;
        let control = ControlListener::bind(&cfg.base)?;

        for (fd, source, what) in [
            (signals.as_fd(), Source::Signal, "signalfd"),
            (hotplug.as_fd(), Source::Hotplug, "hotplug"),
            (control.as_fd(), Source::Control, "control"),
        ] {
            epoll
                .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, source.tag()))
                .map_err(|e| MonitorError::RegisterFailed {
                    path: what.to_string(),
                    source: e.into(),
                })?;
        }

        let overrides = BoardOverrides::load_default();
        if !overrides.is_empty() {
            info!("loaded {} board override(s)", overrides.len());
        }

        let mut daemon = Daemon {
            cfg,
            epoll,
            signals,
            hotplug,
            control,
            session,
            ports: Vec::new(),
            overrides,
            running: false,
            _pid_lock: pid_lock,
        };

        for port in identify::scan(&daemon.overrides) {
            let dev = port.dev_path.clone();
            match daemon.add_port(port) {
                Ok(_) => {}
                Err(MonitorError::FilterExcluded(_)) => debug!("{dev}: filtered"),
                Err(e) => warn!("{dev}: skipped ({e})"),
            }
        }

        daemon.write_status();
        Ok(daemon)
    }

    pub fn session(&self) -> &Path {
        &self.session
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// The main loop: wait, dispatch, tick.
    pub fn run(&mut self) -> Result<()> {
        self.running = true;
        info!(
            "monitoring {} port(s), session {}",
            self.ports.len(),
            self.session.display()
        );
        notify_service_manager(self.cfg.systemd, "READY=1");

        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        while self.running {
            let n = match self.epoll.wait(&mut events, EpollTimeout::from(EPOLL_TICK_MS)) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("epoll wait failed: {e}");
                    break;
                }
            };

            for ev in &events[..n] {
                let source = match Source::from_tag(ev.data()) {
                    Some(s) => s,
                    None => continue,
                };
                let removed = match source {
                    Source::Signal => {
                        self.handle_signal();
                        false
                    }
                    Source::Hotplug => self.handle_hotplug(),
                    Source::Control => {
                        self.handle_control();
                        false
                    }
                    Source::Serial(idx) => self.pump_serial(idx),
                    Source::Pty(idx) => {
                        self.pump_pty(idx);
                        false
                    }
                };
                if removed {
                    // The compaction invalidated the slot indices of the
                    // remaining events in this batch.
                    break;
                }
            }

            self.flush_stale_lines();
        }

        self.shutdown();
        Ok(())
    }

    // ── port lifecycle ────────────────────────────────────────────────────

    /// Start monitoring an identified port: open the device, open its log
    /// with a banner, register with epoll. Returns the slot index.
    fn add_port(&mut self, info: IdentifiedPort) -> Result<usize> {
        if self.ports.len() >= MAX_PORTS {
            return Err(MonitorError::TableFull(MAX_PORTS));
        }
        if !filter_match(self.cfg.filter.as_deref(), &info.dev_path) {
            return Err(MonitorError::FilterExcluded(info.dev_path));
        }
        if self.ports.iter().any(|p| p.info.dev_path == info.dev_path) {
            return Err(MonitorError::Duplicate(info.dev_path));
        }

        let serial = self.open_handle(&info.dev_path)?;

        let header = banner_header(&info, self.cfg.baud);
        let log_path = self.session.join(format!("{}.log", info.label));
        let mut log = match LogFile::open(&log_path, &header) {
            Ok(log) => log,
            Err(e) => {
                let mut serial = serial;
                serial.close();
                return Err(e);
            }
        };

        let idx = self.ports.len();
        let file = serial.file().expect("fresh handle is open");
        if let Err(e) = self
            .epoll
            .add(file, EpollEvent::new(EpollFlags::EPOLLIN, Source::Serial(idx).tag()))
        {
            log.close();
            let mut serial = serial;
            serial.close();
            return Err(MonitorError::RegisterFailed {
                path: info.dev_path,
                source: e.into(),
            });
        }

        let pty_link = self.publish_pty(&serial, &info.label, idx);

        info!(
            "monitoring {} as {} ({})",
            info.dev_path, info.label, info.function
        );
        self.ports.push(MonitoredPort {
            info,
            serial,
            log,
            yielded: false,
            bytes_read: 0,
            pty_link,
        });
        Ok(idx)
    }

    fn open_handle(&self, dev_path: &str) -> Result<SerialHandle> {
        if self.cfg.proxy {
            SerialHandle::open_proxy(dev_path, self.cfg.baud)
        } else {
            SerialHandle::open_readonly(dev_path, self.cfg.baud)
        }
    }

    /// Register the PTY master (client → device plane) and publish the
    /// slave path under `<base>/pty/<label>`.
    fn publish_pty(&self, serial: &SerialHandle, label: &str, idx: usize) -> Option<PathBuf> {
        let master = serial.pty_master()?;
        let slave_path = serial.pty_slave_path()?;

        if let Err(e) = self
            .epoll
            .add(master, EpollEvent::new(EpollFlags::EPOLLIN, Source::Pty(idx).tag()))
        {
            warn!("{label}: cannot register PTY master ({e}); proxy is log-only");
            return None;
        }

        let dir = self.cfg.base.join(PTY_DIR);
        if let Err(e) = ensure_dir(&dir) {
            warn!("{label}: cannot create {} ({e})", dir.display());
            return None;
        }
        let link = dir.join(label);
        match symlink_atomic(slave_path, &link) {
            Ok(()) => {
                info!("{label}: proxy PTY at {}", link.display());
                Some(link)
            }
            Err(e) => {
                warn!("{label}: cannot publish PTY link ({e})");
                None
            }
        }
    }

    /// Drop a port and compact the table. Every shifted entry gets its
    /// epoll tag rewritten to its new slot index.
    fn remove_port(&mut self, idx: usize) {
        let mut port = self.ports.remove(idx);

        if !port.yielded {
            if let Some(f) = port.serial.file() {
                self.epoll.delete(f).ok();
            }
        }
        if let Some(m) = port.serial.pty_master() {
            self.epoll.delete(m).ok();
        }
        port.log.marker("PORT DISCONNECTED").ok();
        port.log.close();
        port.serial.close();
        if let Some(link) = port.pty_link.take() {
            fs::remove_file(link).ok();
        }
        info!(
            "{} removed ({} bytes logged)",
            port.info.dev_path, port.bytes_read
        );

        for i in idx..self.ports.len() {
            let p = &self.ports[i];
            if !p.yielded {
                if let Some(f) = p.serial.file() {
                    let mut ev = EpollEvent::new(EpollFlags::EPOLLIN, Source::Serial(i).tag());
                    if let Err(e) = self.epoll.modify(f, &mut ev) {
                        warn!("{}: tag rewrite failed ({e})", p.info.dev_path);
                    }
                }
            }
            if let Some(m) = p.serial.pty_master() {
                let mut ev = EpollEvent::new(EpollFlags::EPOLLIN, Source::Pty(i).tag());
                if let Err(e) = self.epoll.modify(m, &mut ev) {
                    warn!("{}: PTY tag rewrite failed ({e})", p.info.dev_path);
                }
            }
        }
    }

    /// Release the device so another tool can open it. The log stays open.
    /// Returns true if the port was already yielded.
    fn yield_port(&mut self, idx: usize) -> bool {
        if self.ports[idx].yielded {
            return true;
        }
        let port = &mut self.ports[idx];
        if let Some(f) = port.serial.file() {
            self.epoll.delete(f).ok();
        }
        if let Some(m) = port.serial.pty_master() {
            self.epoll.delete(m).ok();
        }
        port.serial.close();
        if let Some(link) = port.pty_link.take() {
            fs::remove_file(link).ok();
        }
        port.yielded = true;
        port.log.marker("PORT YIELDED").ok();
        info!("{} yielded", port.info.dev_path);
        self.write_status();
        false
    }

    /// Re-open a yielded device and resume monitoring under the same slot.
    fn reclaim_port(&mut self, idx: usize) -> Result<ReclaimOutcome> {
        if !self.ports[idx].yielded {
            return Ok(ReclaimOutcome::AlreadyMonitoring);
        }

        let serial = self.open_handle(&self.ports[idx].info.dev_path)?;
        let file = serial.file().expect("fresh handle is open");
        if let Err(e) = self
            .epoll
            .add(file, EpollEvent::new(EpollFlags::EPOLLIN, Source::Serial(idx).tag()))
        {
            let mut serial = serial;
            serial.close();
            return Err(MonitorError::RegisterFailed {
                path: self.ports[idx].info.dev_path.clone(),
                source: e.into(),
            });
        }
        let label = self.ports[idx].info.label.clone();
        let pty_link = self.publish_pty(&serial, &label, idx);

        let port = &mut self.ports[idx];
        port.serial = serial;
        port.pty_link = pty_link;
        port.yielded = false;
        port.log.marker("PORT RECLAIMED").ok();
        info!("{} reclaimed", port.info.dev_path);
        self.write_status();
        Ok(ReclaimOutcome::Reclaimed)
    }

    fn find_port(&self, dev: &str) -> Option<usize> {
        self.ports
            .iter()
            .position(|p| p.info.dev_path == dev || p.info.tty_name == dev)
    }

    // ── event handlers ────────────────────────────────────────────────────

    fn handle_signal(&mut self) {
        let info = match self.signals.read_signal() {
            Ok(Some(si)) => si,
            Ok(None) => return,
            Err(e) => {
                warn!("signalfd read failed: {e}");
                return;
            }
        };
        match info.ssi_signo as i32 {
            libc::SIGTERM | libc::SIGINT => {
                info!("shutdown signal received");
                self.running = false;
            }
            libc::SIGHUP => {
                info!("SIGHUP: reloading overrides and rescanning");
                self.rescan();
            }
            other => debug!("ignoring signal {other}"),
        }
    }

    /// SIGHUP: absorb ports that appeared while we were not looking.
    /// `add_port` is idempotent per device path, so existing ports are
    /// reported as duplicates and skipped.
    fn rescan(&mut self) {
        self.overrides = BoardOverrides::load_default();
        for port in identify::scan(&self.overrides) {
            let dev = port.dev_path.clone();
            match self.add_port(port) {
                Ok(_) => {}
                Err(MonitorError::Duplicate(_)) | Err(MonitorError::FilterExcluded(_)) => {}
                Err(e) => warn!("{dev}: skipped ({e})"),
            }
        }
        self.write_status();
    }

    /// Returns true when a port was removed (the batch must end).
    fn handle_hotplug(&mut self) -> bool {
        let event = match self.hotplug.read() {
            Ok(Some(ev)) => ev,
            Ok(None) => return false,
            Err(e) => {
                warn!("hotplug read failed: {e}");
                return false;
            }
        };

        match event.action {
            HotplugAction::Add => {
                // Give the kernel time to finish populating sysfs.
                thread::sleep(SETTLE);
                match identify::identify(&event.devpath, &self.overrides) {
                    Ok(info) => {
                        let dev = info.dev_path.clone();
                        match self.add_port(info) {
                            Ok(_) => {}
                            Err(MonitorError::Duplicate(_))
                            | Err(MonitorError::FilterExcluded(_)) => {}
                            Err(e) => warn!("{dev}: hot-plug add failed ({e})"),
                        }
                    }
                    Err(e) => warn!("{}: {e}", event.devpath),
                }
                self.write_status();
                false
            }
            HotplugAction::Remove => match self.find_port(&event.devpath) {
                Some(idx) => {
                    self.remove_port(idx);
                    self.write_status();
                    true
                }
                None => false,
            },
        }
    }

    fn handle_control(&mut self) {
        let mut stream = match self.control.accept() {
            Ok(Some(s)) => s,
            Ok(None) => return,
            Err(e) => {
                warn!("control accept failed: {e}");
                return;
            }
        };
        let line = match read_request(&mut stream) {
            Ok(l) => l,
            Err(e) => {
                warn!("control read failed: {e}");
                return;
            }
        };
        let response = self.dispatch(&line);
        if let Err(e) = stream.write_all(response.as_bytes()) {
            warn!("control reply failed: {e}");
        }
    }

    fn dispatch(&mut self, line: &str) -> String {
        match Request::parse(line) {
            Ok(Request::Status) => match self.status_json() {
                Ok(json) => format!("{json}\n"),
                Err(_) => "ERROR cannot read status\n".to_string(),
            },
            Ok(Request::Yield(dev)) => match self.find_port(&dev) {
                Some(idx) => {
                    if self.yield_port(idx) {
                        format!("OK already yielded {dev}\n")
                    } else {
                        format!("OK yielded {dev}\n")
                    }
                }
                None => format!("ERROR port not found: {dev}\n"),
            },
            Ok(Request::Reclaim(dev)) => match self.find_port(&dev) {
                Some(idx) => match self.reclaim_port(idx) {
                    Ok(ReclaimOutcome::Reclaimed) => format!("OK reclaimed {dev}\n"),
                    Ok(ReclaimOutcome::AlreadyMonitoring) => {
                        format!("OK already monitoring {dev}\n")
                    }
                    Err(MonitorError::RegisterFailed { .. }) => {
                        format!("ERROR epoll add failed for {dev}\n")
                    }
                    Err(_) => format!("ERROR cannot reopen {dev}\n"),
                },
                None => format!("ERROR port not found: {dev}\n"),
            },
            Ok(Request::Quit) => {
                self.running = false;
                "OK shutting down\n".to_string()
            }
            Err(line) => format!("ERROR unknown command: {line}\n"),
        }
    }

    /// One non-blocking read from a serial port. Returns true when the
    /// port died and was removed.
    fn pump_serial(&mut self, idx: usize) -> bool {
        let mut buf = [0u8; READ_BUF];
        let outcome = match self.ports.get_mut(idx) {
            None => return false, // stale tag after a compaction
            Some(port) if port.yielded => ReadOutcome::Idle,
            Some(port) => match port.serial.read(&mut buf) {
                Ok(0) => ReadOutcome::Dead("EOF".to_string()),
                Ok(n) => {
                    if let Err(e) = port.log.write(&buf[..n]) {
                        warn!("{}: log write failed: {e}", port.info.dev_path);
                    }
                    port.bytes_read += n as u64;
                    port.serial.echo_pty(&buf[..n]);
                    ReadOutcome::Progress
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    ReadOutcome::Idle
                }
                Err(e) => ReadOutcome::Dead(e.to_string()),
            },
        };

        match outcome {
            ReadOutcome::Dead(reason) => {
                warn!(
                    "{}: {reason}, removing port",
                    self.ports[idx].info.dev_path
                );
                self.remove_port(idx);
                self.write_status();
                true
            }
            ReadOutcome::Progress | ReadOutcome::Idle => false,
        }
    }

    /// Client wrote into the proxy PTY: forward to the real device.
    fn pump_pty(&mut self, idx: usize) {
        let mut buf = [0u8; READ_BUF];
        let port = match self.ports.get_mut(idx) {
            Some(p) => p,
            None => return,
        };
        match port.serial.read_pty(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if port.yielded {
                    return; // device is released; drop client bytes
                }
                if let Err(e) = port.serial.write(&buf[..n]) {
                    warn!("{}: proxy write failed: {e}", port.info.dev_path);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => debug!("{}: PTY read: {e}", port.info.dev_path),
        }
    }

    fn flush_stale_lines(&mut self) {
        for port in &mut self.ports {
            if let Err(e) = port.log.flush_stale() {
                warn!("{}: stale flush failed: {e}", port.info.dev_path);
            }
        }
    }

    // ── status snapshot ───────────────────────────────────────────────────

    fn status_json(&self) -> serde_json::Result<String> {
        let session = self
            .session
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let doc = StatusDoc {
            pid: std::process::id(),
            session,
            port_count: self.ports.len(),
            ports: self
                .ports
                .iter()
                .map(|p| PortStatus {
                    device: &p.info.dev_path,
                    label: &p.info.label,
                    board: p.info.board().unwrap_or("unknown"),
                    function: p.info.function,
                    vid: format!("{:04x}", p.info.vid),
                    pid: format!("{:04x}", p.info.pid),
                    status: if p.yielded { "yielded" } else { "monitoring" },
                    log_file: p.log.path().display().to_string(),
                    bytes_logged: p.bytes_read,
                })
                .collect(),
        };
        serde_json::to_string_pretty(&doc)
    }

    /// Atomically replace `<base>/status.json`.
    fn write_status(&self) {
        let json = match self.status_json() {
            Ok(j) => j,
            Err(e) => {
                warn!("status serialization failed: {e}");
                return;
            }
        };
        let path = self.cfg.base.join(STATUS_FILE);
        let tmp = path.with_extension("json.tmp");
        let res = fs::write(&tmp, format!("{json}\n")).and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = res {
            warn!("cannot write {}: {e}", path.display());
        }
    }

    // ── shutdown ──────────────────────────────────────────────────────────

    fn shutdown(&mut self) {
        info!("shutting down");
        notify_service_manager(self.cfg.systemd, "STOPPING=1");

        for port in &mut self.ports {
            port.log.marker("MONITOR STOPPED").ok();
            port.log.close();
            port.serial.close();
            if let Some(link) = port.pty_link.take() {
                fs::remove_file(link).ok();
            }
        }
        self.ports.clear();
        fs::remove_file(self.cfg.base.join(STATUS_FILE)).ok();
        // Pid file and control socket are removed by their Drop impls.
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Status document  (field order fixes the JSON key order)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct StatusDoc<'a> {
    pid:        u32,
    session:    String,
    port_count: usize,
    ports:      Vec<PortStatus<'a>>,
}

#[derive(Serialize)]
struct PortStatus<'a> {
    device:       &'a str,
    label:        &'a str,
    board:        &'a str,
    function:     &'a str,
    vid:          String,
    pid:          String,
    status:       &'static str,
    log_file:     String,
    bytes_logged: u64,
}

fn banner_header(info: &IdentifiedPort, baud: u32) -> String {
    let device_name = info.known.map(|k| k.name).unwrap_or(info.product.as_str());
    format!(
        "Device:    {} ({device_name})\nBoard:     {}\nInterface: {}\nFunction:  {}\nBaud:      {baud}\n",
        info.dev_path,
        info.board().unwrap_or("unknown"),
        info.interface,
        info.function,
    )
}

/// sd_notify: best effort READY/STOPPING datagram to `NOTIFY_SOCKET`,
/// honouring abstract (`@`) addresses.
fn notify_service_manager(enabled: bool, state: &str) {
    if !enabled {
        return;
    }
    let Ok(addr) = std::env::var("NOTIFY_SOCKET") else {
        return;
    };
    let sock = match UnixDatagram::unbound() {
        Ok(s) => s,
        Err(e) => {
            warn!("sd_notify socket: {e}");
            return;
        }
    };
    let res = if let Some(name) = addr.strip_prefix('@') {
        use std::os::linux::net::SocketAddrExt;
        match std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes()) {
            Ok(sa) => sock.send_to_addr(state.as_bytes(), &sa),
            Err(e) => Err(e),
        }
    } else {
        sock.send_to(state.as_bytes(), &addr)
    };
    match res {
        Ok(_) => debug!("sd_notify: {state}"),
        Err(e) => warn!("sd_notify {state}: {e}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
