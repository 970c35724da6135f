// ─────────────────────────────────────────────────────────────────────────────
//  uartmon :: serial  —  tty open/configure, raw 8N1, optional PTY proxy
// ─────────────────────────────────────────────────────────────────────────────

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{MonitorError, Result};

mod raw {
    use nix::ioctl_none_bad;

    // Advisory exclusive access, see tty_ioctl(4).
    ioctl_none_bad!(tiocexcl, libc::TIOCEXCL);
}

/// An open serial device. In proxy mode it additionally owns the master
/// side of a PTY pair whose slave path is published to clients.
#[derive(Debug, Default)]
pub struct SerialHandle {
    file:           Option<File>,
    pty_master:     Option<File>,
    /// Keeps the pair alive: with no slave fd open anywhere the master
    /// reports HUP forever, which would spin the event loop.
    pty_slave:      Option<File>,
    pty_slave_path: Option<PathBuf>,
    path:           String,
    baud:           u32,
}

impl SerialHandle {
    /// Open for passive monitoring: read-only, no controlling terminal,
    /// non-blocking, raw 8N1 at `baud`.
    pub fn open_readonly(path: &str, baud: u32) -> Result<SerialHandle> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| MonitorError::OpenFailed { path: path.into(), source })?;

        configure_raw(file.as_raw_fd(), baud)
            .map_err(|source| MonitorError::ConfigureFailed { path: path.into(), source })?;

        Ok(SerialHandle {
            file: Some(file),
            path: path.to_string(),
            baud,
            ..SerialHandle::default()
        })
    }

    /// Open for proxying: read-write on the real device, advisory exclusive
    /// access, plus a PTY pair for clients. The slave side is configured to
    /// match and its path retained.
    pub fn open_proxy(path: &str, baud: u32) -> Result<SerialHandle> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| MonitorError::OpenFailed { path: path.into(), source })?;

        configure_raw(file.as_raw_fd(), baud)
            .map_err(|source| MonitorError::ConfigureFailed { path: path.into(), source })?;

        // Exclusivity failing is not fatal; CAP_SYS_ADMIN bypasses it anyway.
        if let Err(e) = unsafe { raw::tiocexcl(file.as_raw_fd()) } {
            warn!("{path}: TIOCEXCL failed ({e}), continuing without exclusivity");
        }

        let pty = nix::pty::openpty(None, None)
            .map_err(|e| MonitorError::ConfigureFailed {
                path: path.into(),
                source: io::Error::from(e),
            })?;
        let master = File::from(pty.master);
        let slave = File::from(pty.slave);

        // Best effort: clients may reconfigure the slave as they please.
        let _ = configure_raw(slave.as_raw_fd(), baud);
        let slave_path = tty_path(slave.as_raw_fd())
            .map_err(|source| MonitorError::ConfigureFailed { path: path.into(), source })?;
        set_nonblocking(master.as_raw_fd())
            .map_err(|source| MonitorError::ConfigureFailed { path: path.into(), source })?;

        Ok(SerialHandle {
            file: Some(file),
            pty_master: Some(master),
            pty_slave: Some(slave),
            pty_slave_path: Some(slave_path),
            path: path.to_string(),
            baud,
        })
    }

    /// Close everything. Safe to call more than once.
    pub fn close(&mut self) {
        self.pty_master = None;
        self.pty_slave = None;
        self.pty_slave_path = None;
        self.file = None;
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    pub fn pty_master(&self) -> Option<&File> {
        self.pty_master.as_ref()
    }

    pub fn pty_slave_path(&self) -> Option<&Path> {
        self.pty_slave_path.as_deref()
    }

    /// One non-blocking read from the real device.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => f.read(buf),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// One non-blocking read from the PTY master (client → device data).
    pub fn read_pty(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.pty_master.as_mut() {
            Some(f) => f.read(buf),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Write client data out the real device.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => f.write(buf),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Echo device data to the PTY master. A full PTY buffer drops the
    /// chunk rather than stalling the monitor.
    pub fn echo_pty(&mut self, buf: &[u8]) {
        if let Some(f) = self.pty_master.as_mut() {
            match f.write(buf) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => warn!("{}: PTY echo failed: {e}", self.path),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  termios
// ─────────────────────────────────────────────────────────────────────────────

/// Raw 8N1: zeroed termios, so all input/output/local processing is off,
/// then receiver enable, modem lines ignored, VMIN/VTIME zero.
fn configure_raw(fd: libc::c_int, baud: u32) -> io::Result<()> {
    let speed = baud_flag(baud);

    let mut tio: libc::termios = unsafe { mem::zeroed() };
    tio.c_cflag = speed | libc::CS8 | libc::CREAD | libc::CLOCAL;
    tio.c_cc[libc::VMIN] = 0;
    tio.c_cc[libc::VTIME] = 0;

    unsafe {
        libc::cfsetispeed(&mut tio, speed);
        libc::cfsetospeed(&mut tio, speed);
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Numeric baud → termios speed constant. Unrecognised rates fall back to
/// 115200, the console default for every board in the catalog.
pub fn baud_flag(baud: u32) -> libc::speed_t {
    match baud {
        1200    => libc::B1200,
        2400    => libc::B2400,
        4800    => libc::B4800,
        9600    => libc::B9600,
        19200   => libc::B19200,
        38400   => libc::B38400,
        57600   => libc::B57600,
        115200  => libc::B115200,
        230400  => libc::B230400,
        460800  => libc::B460800,
        921600  => libc::B921600,
        1500000 => libc::B1500000,
        _       => libc::B115200,
    }
}

fn set_nonblocking(fd: libc::c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn tty_path(fd: libc::c_int) -> io::Result<PathBuf> {
    let mut buf = [0 as libc::c_char; 128];
    let rc = unsafe { libc::ttyname_r(fd, buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
    Ok(PathBuf::from(std::ffi::OsStr::from_bytes(cstr.to_bytes())))
}

// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    /// A PTY pair stands in for a real USB tty in these tests.
    fn fake_device() -> (File, PathBuf) {
        let pty = nix::pty::openpty(None, None).unwrap();
        let master = File::from(pty.master);
        let slave = File::from(pty.slave);
        let path = tty_path(slave.as_raw_fd()).unwrap();
        // Leak the slave holder so the path stays valid for the test body.
        std::mem::forget(slave);
        (master, path)
    }

    #[test]
    fn baud_map_known_and_fallback() {
        assert_eq!(baud_flag(9600), libc::B9600);
        assert_eq!(baud_flag(921600), libc::B921600);
        assert_eq!(baud_flag(31337), libc::B115200);
    }

    #[test]
    fn open_readonly_reads_device_bytes() {
        let (mut feeder, path) = fake_device();
        let mut handle = SerialHandle::open_readonly(path.to_str().unwrap(), 115200).unwrap();
        assert!(handle.is_open());

        feeder.write_all(b"boot ok\n").unwrap();
        let mut buf = [0u8; 64];
        let n = handle.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"boot ok\n");
    }

    #[test]
    fn open_missing_device_fails() {
        let err = SerialHandle::open_readonly("/dev/ttyUSB-none", 115200).unwrap_err();
        assert!(matches!(err, MonitorError::OpenFailed { .. }));
    }

    #[test]
    fn close_is_idempotent() {
        let (_feeder, path) = fake_device();
        let mut handle = SerialHandle::open_readonly(path.to_str().unwrap(), 115200).unwrap();
        handle.close();
        handle.close();
        assert!(!handle.is_open());
        assert!(handle.read(&mut [0u8; 8]).is_err());
    }

    #[test]
    fn proxy_exposes_a_slave_path_and_forwards() {
        let (mut feeder, path) = fake_device();
        let mut handle = SerialHandle::open_proxy(path.to_str().unwrap(), 115200).unwrap();
        let slave = handle.pty_slave_path().unwrap().to_path_buf();
        assert!(slave.exists());

        // Device → PTY echo.
        feeder.write_all(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = handle.read(&mut buf).unwrap();
        handle.echo_pty(&buf[..n]);

        // Client side of the proxy sees the bytes.
        let mut client = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(&slave)
            .unwrap();
        let m = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..m], b"hello");

        // Client → device direction.
        client.write_all(b"reset\n").unwrap();
        let k = handle.read_pty(&mut buf).unwrap();
        handle.write(&buf[..k]).unwrap();
        let mut out = [0u8; 16];
        let j = feeder.read(&mut out).unwrap();
        assert_eq!(&out[..j], b"reset\n");
    }
}
