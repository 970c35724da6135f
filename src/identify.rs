// ─────────────────────────────────────────────────────────────────────────────
//  uartmon :: identify  —  map tty device nodes to physical boards via sysfs
// ─────────────────────────────────────────────────────────────────────────────
//
//  A USB tty is identified by walking the sysfs device tree upward from
//  /sys/class/tty/<name>/device until the USB device directory (the one
//  holding idVendor / idProduct) is found. On the way up the interface
//  directory contributes bInterfaceNumber, which distinguishes the ports
//  of multi-UART bridges like the CP2108 or FT4232H.
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::boards::{port_function, BoardOverrides, KnownDevice};
use crate::error::{MonitorError, Result};
use crate::util::{read_sysfs_attr, read_sysfs_hex};

/// Levels to ascend from the tty device node before giving up.
const MAX_SYSFS_DEPTH: usize = 12;

/// Longest label we will use as a log filename stem.
const LABEL_MAX: usize = 48;

/// Device node prefixes that can carry a USB UART.
pub const TTY_PREFIXES: &[&str] = &["ttyUSB", "ttyACM", "ttyUART"];

/// Everything we know about one tty after identification. Immutable once
/// built; the daemon composes it into its port table.
#[derive(Debug, Clone)]
pub struct IdentifiedPort {
    pub dev_path:     String,
    pub tty_name:     String,
    pub vid:          u16,
    pub pid:          u16,
    pub interface:    u8,
    pub serial:       Option<String>,
    pub manufacturer: String,
    pub product:      String,
    /// USB topology path on its bus, e.g. `1-6.2`.
    pub usb_path:     String,
    pub known:        Option<&'static KnownDevice>,
    pub function:     &'static str,
    pub board_override: Option<String>,
    /// Filesystem-safe log filename stem.
    pub label:        String,
}

impl IdentifiedPort {
    /// Board name shown in reports and status: the user override wins, then
    /// the catalog's first candidate.
    pub fn board(&self) -> Option<&str> {
        self.board_override
            .as_deref()
            .or_else(|| self.known.and_then(|k| k.boards.first().copied()))
    }

    /// Grouping key: ports of one physical device share it.
    pub fn group_key(&self) -> String {
        format!(
            "{:04x}:{:04x}:{}:{}",
            self.vid,
            self.pid,
            self.serial.as_deref().unwrap_or(""),
            self.usb_path
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Identification
// ─────────────────────────────────────────────────────────────────────────────

/// Identify a single device node, e.g. `/dev/ttyUSB0`.
pub fn identify(dev_path: &str, overrides: &BoardOverrides) -> Result<IdentifiedPort> {
    let tty_name = dev_path.rsplit('/').next().unwrap_or(dev_path).to_string();
    let device_link = format!("/sys/class/tty/{tty_name}/device");
    let start = fs::canonicalize(&device_link)
        .map_err(|_| MonitorError::NotIdentified(dev_path.to_string()))?;

    let probe = probe_usb(&start)
        .ok_or_else(|| MonitorError::NotIdentified(dev_path.to_string()))?;

    Ok(build_port(dev_path, &tty_name, probe, overrides))
}

/// Scan `/dev` for USB ttys and identify each. Devices that fail to
/// identify are skipped.
pub fn scan(overrides: &BoardOverrides) -> Vec<IdentifiedPort> {
    let mut ports = Vec::new();

    for prefix in TTY_PREFIXES {
        let pattern = format!("/dev/{prefix}*");
        let paths = match glob::glob(&pattern) {
            Ok(p) => p,
            Err(_) => continue,
        };
        for path in paths.flatten() {
            let dev_path = path.to_string_lossy().to_string();
            if let Ok(port) = identify(&dev_path, overrides) {
                ports.push(port);
            }
        }
    }

    ports.sort_by(|a, b| a.dev_path.cmp(&b.dev_path));
    ports
}

/// Raw attributes gathered from the sysfs walk.
#[derive(Debug)]
struct UsbProbe {
    vid:          u16,
    pid:          u16,
    interface:    u8,
    serial:       Option<String>,
    manufacturer: String,
    product:      String,
    usb_path:     String,
}

/// Ascend from `start` looking for `bInterfaceNumber` (first hit wins) and
/// the directory holding `idVendor`, which is the USB device itself.
fn probe_usb(start: &Path) -> Option<UsbProbe> {
    let mut dir = start;
    let mut interface: Option<u8> = None;

    for _ in 0..MAX_SYSFS_DEPTH {
        if interface.is_none() {
            // bInterfaceNumber is a two-digit hex string, e.g. "02".
            interface = read_sysfs_attr(dir, "bInterfaceNumber")
                .and_then(|s| u8::from_str_radix(s.trim(), 16).ok());
        }

        if let Some(vid) = read_sysfs_hex(dir, "idVendor") {
            let pid = read_sysfs_hex(dir, "idProduct")?;
            return Some(UsbProbe {
                vid,
                pid,
                interface: interface.unwrap_or(0),
                serial: read_sysfs_attr(dir, "serial"),
                manufacturer: read_sysfs_attr(dir, "manufacturer")
                    .unwrap_or_else(|| "Unknown".to_string()),
                product: read_sysfs_attr(dir, "product")
                    .unwrap_or_else(|| "Unknown".to_string()),
                usb_path: usb_topology_path(dir)?,
            });
        }

        dir = dir.parent()?;
    }

    None
}

/// The topology path of a USB device is the name of its sysfs directory,
/// e.g. `…/usb1/1-6/1-6.2` → `1-6.2`. Require a `/usb<bus>/` ancestor so a
/// platform UART that happens to carry the attributes is not misread.
fn usb_topology_path(dir: &Path) -> Option<String> {
    let full = dir.to_string_lossy();
    for (anchor, _) in full.match_indices("/usb") {
        let after = &full[anchor + 4..];
        let bus_digits = after.chars().take_while(|c| c.is_ascii_digit()).count();
        if bus_digits > 0 && after[bus_digits..].starts_with('/') {
            return Some(dir.file_name()?.to_string_lossy().to_string());
        }
    }
    None
}

fn build_port(
    dev_path: &str,
    tty_name: &str,
    probe: UsbProbe,
    overrides: &BoardOverrides,
) -> IdentifiedPort {
    let known = KnownDevice::find(probe.vid, probe.pid);
    let function = known
        .and_then(|k| port_function(k.name, probe.interface))
        .unwrap_or("Main UART");
    let board_override = probe
        .serial
        .as_deref()
        .and_then(|s| overrides.board_for(s))
        .map(str::to_string);
    let label = synthesize_label(
        board_override.as_deref(),
        known,
        probe.interface,
        tty_name,
    );

    IdentifiedPort {
        dev_path: dev_path.to_string(),
        tty_name: tty_name.to_string(),
        vid: probe.vid,
        pid: probe.pid,
        interface: probe.interface,
        serial: probe.serial,
        manufacturer: probe.manufacturer,
        product: probe.product,
        usb_path: probe.usb_path,
        known,
        function,
        board_override,
        label,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Label synthesis
// ─────────────────────────────────────────────────────────────────────────────

/// Derive the log filename stem. Priority: user override, catalog board,
/// bare tty name.
pub fn synthesize_label(
    board_override: Option<&str>,
    known: Option<&KnownDevice>,
    interface: u8,
    tty_name: &str,
) -> String {
    let label = if let Some(board) = board_override {
        format!("{}_UART{}", upper_underscore(board), interface)
    } else if let Some(board) = known.and_then(|k| k.boards.first()) {
        let known = known.unwrap();
        if known.port_count > 1 {
            format!("{}_UART{}", upper_underscore(board), interface)
        } else {
            format!("{}_UART", upper_underscore(board))
        }
    } else {
        tty_name.to_string()
    };

    truncate(label, LABEL_MAX)
}

/// Spaces become underscores, lowercase ASCII is raised, everything else is
/// kept verbatim.
fn upper_underscore(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            ' ' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        s.truncate(max);
    }
    s
}

// ─────────────────────────────────────────────────────────────────────────────
//  Grouping  (identification report only)
// ─────────────────────────────────────────────────────────────────────────────

/// Ports of one physical USB device, sorted by interface index.
#[derive(Debug)]
pub struct DeviceGroup {
    pub key:   String,
    pub ports: Vec<IdentifiedPort>,
}

/// Group identified ports by `(vid, pid, serial, usb_path)`, groups ordered
/// by key, ports within a group by interface index.
pub fn group_ports(ports: &[IdentifiedPort]) -> Vec<DeviceGroup> {
    let mut by_key: BTreeMap<String, Vec<IdentifiedPort>> = BTreeMap::new();
    for p in ports {
        by_key.entry(p.group_key()).or_default().push(p.clone());
    }

    by_key
        .into_iter()
        .map(|(key, mut ports)| {
            ports.sort_by_key(|p| p.interface);
            DeviceGroup { key, ports }
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn fake_port(vid: u16, pid: u16, serial: &str, usb_path: &str, interface: u8) -> IdentifiedPort {
        let known = KnownDevice::find(vid, pid);
        IdentifiedPort {
            dev_path: format!("/dev/ttyUSB{interface}"),
            tty_name: format!("ttyUSB{interface}"),
            vid,
            pid,
            interface,
            serial: Some(serial.to_string()),
            manufacturer: "Unknown".into(),
            product: "Unknown".into(),
            usb_path: usb_path.to_string(),
            known,
            function: "Main UART",
            board_override: None,
            label: String::new(),
        }
    }

    #[test]
    fn label_with_override() {
        let known = KnownDevice::find(0x10c4, 0xea71);
        assert_eq!(
            synthesize_label(Some("ZynqMP ZCU102"), known, 0, "ttyUSB0"),
            "ZYNQMP_ZCU102_UART0"
        );
    }

    #[test]
    fn label_from_catalog_multi_port() {
        let known = KnownDevice::find(0x10c4, 0xea71);
        assert_eq!(
            synthesize_label(None, known, 1, "ttyUSB1"),
            "POLARFIRE_SOC_UART1"
        );
    }

    #[test]
    fn label_from_catalog_single_port() {
        let known = KnownDevice::find(0x10c4, 0xea60);
        assert_eq!(
            synthesize_label(None, known, 0, "ttyUSB0"),
            "ESP32_DEVKIT_UART"
        );
    }

    #[test]
    fn label_falls_back_to_tty_name() {
        assert_eq!(synthesize_label(None, None, 0, "ttyUSB99"), "ttyUSB99");
    }

    #[test]
    fn label_is_truncated() {
        let long = "x".repeat(80);
        let label = synthesize_label(Some(&long), None, 0, "ttyUSB0");
        assert_eq!(label.len(), 48);
        assert!(label.starts_with("XXXX"));
    }

    #[test]
    fn grouping_splits_by_device() {
        let ports = vec![
            fake_port(0x10c4, 0xea71, "ABC123", "1-6", 1),
            fake_port(0x10c4, 0xea71, "ABC123", "1-6", 0),
            fake_port(0x0403, 0x6001, "XYZ789", "1-4", 0),
        ];
        let groups = group_ports(&ports);
        assert_eq!(groups.len(), 2);
        let mut sizes: Vec<usize> = groups.iter().map(|g| g.ports.len()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);
        // Within the CP210x group, interfaces are sorted ascending.
        let quad = groups.iter().find(|g| g.ports.len() == 2).unwrap();
        assert_eq!(quad.ports[0].interface, 0);
        assert_eq!(quad.ports[1].interface, 1);
    }

    #[test]
    fn probe_walks_fake_sysfs_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let usb_dev = tmp.path().join("devices/pci0000:00/usb1/1-6/1-6.2");
        let iface = usb_dev.join("1-6.2:1.2");
        let start = iface.join("ttyUSB0");
        fs::create_dir_all(&start).unwrap();

        fs::write(usb_dev.join("idVendor"), "10c4\n").unwrap();
        fs::write(usb_dev.join("idProduct"), "ea71\n").unwrap();
        fs::write(usb_dev.join("serial"), "04A1B2C3\n").unwrap();
        fs::write(usb_dev.join("manufacturer"), "Silicon Labs\n").unwrap();
        fs::write(usb_dev.join("product"), "CP2108 Quad UART\n").unwrap();
        fs::write(iface.join("bInterfaceNumber"), "02\n").unwrap();

        let probe = probe_usb(&start).unwrap();
        assert_eq!(probe.vid, 0x10c4);
        assert_eq!(probe.pid, 0xea71);
        assert_eq!(probe.interface, 2);
        assert_eq!(probe.serial.as_deref(), Some("04A1B2C3"));
        assert_eq!(probe.manufacturer, "Silicon Labs");
        assert_eq!(probe.usb_path, "1-6.2");
    }

    #[test]
    fn probe_reports_full_hub_topology() {
        // A device behind a hub: …/usb3/3-2/3-2.4.1 → "3-2.4.1".
        let tmp = tempfile::tempdir().unwrap();
        let usb_dev = tmp.path().join("devices/usb3/3-2/3-2.4.1");
        fs::create_dir_all(&usb_dev).unwrap();
        fs::write(usb_dev.join("idVendor"), "0403\n").unwrap();
        fs::write(usb_dev.join("idProduct"), "6001\n").unwrap();

        let probe = probe_usb(&usb_dev).unwrap();
        assert_eq!(probe.usb_path, "3-2.4.1");
    }

    #[test]
    fn probe_requires_usb_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let dev = tmp.path().join("devices/platform/serial8250");
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("idVendor"), "10c4\n").unwrap();
        fs::write(dev.join("idProduct"), "ea60\n").unwrap();
        assert!(probe_usb(&dev).is_none());
    }

    #[test]
    fn probe_defaults_strings() {
        let tmp = tempfile::tempdir().unwrap();
        let usb_dev = tmp.path().join("usb2/2-1");
        fs::create_dir_all(&usb_dev).unwrap();
        fs::write(usb_dev.join("idVendor"), "dead\n").unwrap();
        fs::write(usb_dev.join("idProduct"), "beef\n").unwrap();

        let probe = probe_usb(&usb_dev).unwrap();
        assert_eq!(probe.manufacturer, "Unknown");
        assert_eq!(probe.product, "Unknown");
        assert_eq!(probe.serial, None);
        assert_eq!(probe.interface, 0);
    }
}
