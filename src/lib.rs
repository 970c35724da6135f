// ─────────────────────────────────────────────────────────────────────────────
//  uartmon  —  public library API
// ─────────────────────────────────────────────────────────────────────────────
//
//  A passive UART monitor for Linux hosts: identifies USB serial boards
//  via sysfs, logs their output to timestamped session files, and keeps
//  doing so across hot-plug, yield/reclaim and SIGHUP. The `daemon`
//  module is the single-threaded epoll core; everything else is a leaf
//  it composes.
// ─────────────────────────────────────────────────────────────────────────────

pub mod boards;
pub mod control;
pub mod daemon;
pub mod error;
pub mod hotplug;
pub mod identify;
pub mod logfile;
pub mod serial;
pub mod session;
pub mod util;

pub use boards::{BoardOverrides, KnownDevice};
pub use control::{send_command, Request};
pub use daemon::{Daemon, MonitorConfig, DEFAULT_BASE, DEFAULT_BAUD, MAX_PORTS};
pub use error::{MonitorError, Result};
pub use identify::{group_ports, identify, scan, DeviceGroup, IdentifiedPort};
pub use logfile::{LogFile, LINE_BUF};
pub use serial::SerialHandle;
