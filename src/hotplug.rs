// ─────────────────────────────────────────────────────────────────────────────
//  uartmon :: hotplug  —  tty add/remove events, netlink uevents or /dev watch
// ─────────────────────────────────────────────────────────────────────────────
//
//  The primary backend is a datagram socket on the kernel uevent multicast
//  group; each datagram is a NUL-separated list of KEY=VALUE strings. When
//  that socket cannot be created (containers, seccomp) an inotify watch on
//  /dev yields the same event shape.
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;

use log::warn;
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use nix::sys::socket::{
    bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};

use crate::error::{MonitorError, Result};
use crate::identify::TTY_PREFIXES;

/// Kernel uevent multicast group.
const UEVENT_GROUP_KERNEL: u32 = 1;

const RECV_BUF: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub action:   HotplugAction,
    pub devname:  String,
    pub devpath:  String,
}

impl HotplugEvent {
    fn new(action: HotplugAction, devname: &str) -> HotplugEvent {
        HotplugEvent {
            action,
            devname: devname.to_string(),
            devpath: format!("/dev/{devname}"),
        }
    }
}

#[derive(Debug)]
enum Backend {
    Netlink(OwnedFd),
    DevWatch(Inotify),
}

#[derive(Debug)]
pub struct HotplugSource {
    backend: Backend,
    queue:   VecDeque<HotplugEvent>,
}

impl HotplugSource {
    /// Netlink uevent socket, or the /dev watch if netlink is unavailable.
    pub fn new() -> Result<HotplugSource> {
        match Self::netlink() {
            Ok(src) => Ok(src),
            Err(e) => {
                warn!("netlink uevent socket unavailable ({e}); watching /dev instead");
                Self::devwatch(Path::new("/dev"))
            }
        }
    }

    pub fn netlink() -> Result<HotplugSource> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(|e| MonitorError::Io(e.into()))?;

        // pid 0: the kernel picks the port id.
        let addr = NetlinkAddr::new(0, UEVENT_GROUP_KERNEL);
        bind(fd.as_raw_fd(), &addr).map_err(|e| MonitorError::Io(e.into()))?;

        Ok(HotplugSource {
            backend: Backend::Netlink(fd),
            queue: VecDeque::new(),
        })
    }

    pub fn devwatch(dir: &Path) -> Result<HotplugSource> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|e| MonitorError::Io(e.into()))?;
        inotify
            .add_watch(dir, AddWatchFlags::IN_CREATE | AddWatchFlags::IN_DELETE)
            .map_err(|e| MonitorError::Io(e.into()))?;

        Ok(HotplugSource {
            backend: Backend::DevWatch(inotify),
            queue: VecDeque::new(),
        })
    }

    pub fn is_netlink(&self) -> bool {
        matches!(self.backend, Backend::Netlink(_))
    }

    /// Drain one event. `None` means the traffic did not concern a USB tty
    /// (or there was nothing to read); the caller re-arms readiness.
    pub fn read(&mut self) -> Result<Option<HotplugEvent>> {
        if let Some(ev) = self.queue.pop_front() {
            return Ok(Some(ev));
        }

        match &self.backend {
            Backend::Netlink(fd) => {
                let mut buf = [0u8; RECV_BUF];
                match recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                    Ok(0) => Ok(None),
                    Ok(n) => Ok(parse_uevent(&buf[..n])),
                    Err(Errno::EAGAIN) => Ok(None),
                    Err(e) => Err(MonitorError::Io(e.into())),
                }
            }
            Backend::DevWatch(inotify) => {
                let events = match inotify.read_events() {
                    Ok(ev) => ev,
                    Err(Errno::EAGAIN) => return Ok(None),
                    Err(e) => return Err(MonitorError::Io(e.into())),
                };
                for ev in events {
                    let name = match ev.name.as_ref().and_then(|n| n.to_str()) {
                        Some(n) => n,
                        None => continue,
                    };
                    if !is_usb_tty(name) {
                        continue;
                    }
                    let action = if ev.mask.contains(AddWatchFlags::IN_CREATE) {
                        HotplugAction::Add
                    } else if ev.mask.contains(AddWatchFlags::IN_DELETE) {
                        HotplugAction::Remove
                    } else {
                        continue;
                    };
                    self.queue.push_back(HotplugEvent::new(action, name));
                }
                Ok(self.queue.pop_front())
            }
        }
    }
}

impl AsFd for HotplugSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match &self.backend {
            Backend::Netlink(fd) => fd.as_fd(),
            Backend::DevWatch(inotify) => inotify.as_fd(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  uevent parsing
// ─────────────────────────────────────────────────────────────────────────────

/// `ACTION=add SUBSYSTEM=tty DEVNAME=ttyUSB0 …` (NUL separated) → event.
fn parse_uevent(datagram: &[u8]) -> Option<HotplugEvent> {
    let mut action = None;
    let mut subsystem = None;
    let mut devname = None;

    for token in datagram.split(|&b| b == 0) {
        let token = std::str::from_utf8(token).ok()?;
        if let Some(v) = token.strip_prefix("ACTION=") {
            action = Some(v);
        } else if let Some(v) = token.strip_prefix("SUBSYSTEM=") {
            subsystem = Some(v);
        } else if let Some(v) = token.strip_prefix("DEVNAME=") {
            devname = Some(v);
        }
    }

    if subsystem != Some("tty") {
        return None;
    }
    let devname = devname.filter(|n| is_usb_tty(n))?;
    let action = match action? {
        "add" => HotplugAction::Add,
        "remove" => HotplugAction::Remove,
        _ => return None,
    };

    Some(HotplugEvent::new(action, devname))
}

fn is_usb_tty(name: &str) -> bool {
    TTY_PREFIXES.iter().any(|p| name.starts_with(p))
}

// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn datagram(pairs: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"add@/devices/x\0"); // routing header, no '='
        for p in pairs {
            buf.extend_from_slice(p.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn uevent_add_tty_is_reported() {
        let buf = datagram(&["ACTION=add", "SUBSYSTEM=tty", "DEVNAME=ttyUSB0"]);
        let ev = parse_uevent(&buf).unwrap();
        assert_eq!(ev.action, HotplugAction::Add);
        assert_eq!(ev.devname, "ttyUSB0");
        assert_eq!(ev.devpath, "/dev/ttyUSB0");
    }

    #[test]
    fn uevent_remove_acm_is_reported() {
        let buf = datagram(&["ACTION=remove", "SUBSYSTEM=tty", "DEVNAME=ttyACM3"]);
        let ev = parse_uevent(&buf).unwrap();
        assert_eq!(ev.action, HotplugAction::Remove);
        assert_eq!(ev.devname, "ttyACM3");
    }

    #[test]
    fn uevent_filters_foreign_traffic() {
        // Wrong subsystem.
        assert_eq!(
            parse_uevent(&datagram(&["ACTION=add", "SUBSYSTEM=usb", "DEVNAME=ttyUSB0"])),
            None
        );
        // Uninteresting tty.
        assert_eq!(
            parse_uevent(&datagram(&["ACTION=add", "SUBSYSTEM=tty", "DEVNAME=ttyS0"])),
            None
        );
        // Action we do not track.
        assert_eq!(
            parse_uevent(&datagram(&["ACTION=change", "SUBSYSTEM=tty", "DEVNAME=ttyUSB0"])),
            None
        );
        // Empty datagram.
        assert_eq!(parse_uevent(b"\0"), None);
    }

    #[test]
    fn devwatch_reports_create_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = HotplugSource::devwatch(dir.path()).unwrap();

        assert!(src.read().unwrap().is_none(), "idle watch yields nothing");

        fs::write(dir.path().join("ttyUSB7"), "").unwrap();
        fs::write(dir.path().join("unrelated"), "").unwrap();
        let ev = src.read().unwrap().unwrap();
        assert_eq!(ev.action, HotplugAction::Add);
        assert_eq!(ev.devname, "ttyUSB7");
        assert!(src.read().unwrap().is_none(), "non-tty create is filtered");

        fs::remove_file(dir.path().join("ttyUSB7")).unwrap();
        let ev = src.read().unwrap().unwrap();
        assert_eq!(ev.action, HotplugAction::Remove);
    }
}
