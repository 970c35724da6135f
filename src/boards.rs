// ─────────────────────────────────────────────────────────────────────────────
//  uartmon :: boards  —  known USB-UART bridges and board overrides
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// A USB-UART bridge chip we recognise by VID:PID.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownDevice {
    pub vid:        u16,
    pub pid:        u16,
    pub name:       &'static str,
    /// How many UART interfaces the chip exposes.
    pub port_count: u8,
    /// Boards commonly wired to this bridge, most likely first.
    pub boards:     &'static [&'static str],
}

impl KnownDevice {
    /// Find a catalog entry by VID:PID. Exactly one entry exists per pair.
    pub fn find(vid: u16, pid: u16) -> Option<&'static KnownDevice> {
        KNOWN_DEVICES.iter().find(|d| d.vid == vid && d.pid == pid)
    }
}

/// Per-interface function label for a known multi-port bridge.
/// Looked up by `(device name, interface index)`.
pub fn port_function(name: &str, interface: u8) -> Option<&'static str> {
    PORT_FUNCTIONS
        .iter()
        .find(|(n, i, _)| *n == name && *i == interface)
        .map(|(_, _, f)| *f)
}

// ─────────────────────────────────────────────────────────────────────────────
//  Static device table
// ─────────────────────────────────────────────────────────────────────────────

static KNOWN_DEVICES: &[KnownDevice] = &[
    // ── Silicon Labs CP210x family ────────────────────────────────────────
    KnownDevice {
        vid: 0x10c4, pid: 0xea60, name: "Silicon Labs CP2102",
        port_count: 1,
        boards: &["ESP32 DevKit"],
    },
    KnownDevice {
        vid: 0x10c4, pid: 0xea70, name: "Silicon Labs CP2105",
        port_count: 2,
        boards: &["BeagleV-Fire"],
    },
    KnownDevice {
        vid: 0x10c4, pid: 0xea71, name: "Silicon Labs CP210x",
        port_count: 4,
        boards: &["PolarFire SoC", "ZynqMP ZCU102"],
    },
    // ── FTDI ──────────────────────────────────────────────────────────────
    KnownDevice {
        vid: 0x0403, pid: 0x6001, name: "FTDI FT232R",
        port_count: 1,
        boards: &[],
    },
    KnownDevice {
        vid: 0x0403, pid: 0x6010, name: "FTDI FT2232H",
        port_count: 2,
        boards: &["ZynqMP ZCU102"],
    },
    KnownDevice {
        vid: 0x0403, pid: 0x6011, name: "FTDI FT4232H",
        port_count: 4,
        boards: &["VersalNet VN-X"],
    },
    KnownDevice {
        vid: 0x0403, pid: 0x6014, name: "FTDI FT232H",
        port_count: 1,
        boards: &[],
    },
    // ── Single-port clones ────────────────────────────────────────────────
    KnownDevice {
        vid: 0x067b, pid: 0x2303, name: "Prolific PL2303",
        port_count: 1,
        boards: &[],
    },
    KnownDevice {
        vid: 0x1a86, pid: 0x7523, name: "QinHeng CH340",
        port_count: 1,
        boards: &[],
    },
    // ── Debug probes with a CDC UART ──────────────────────────────────────
    KnownDevice {
        vid: 0x0d28, pid: 0x0204, name: "ARM DAPLink",
        port_count: 1,
        boards: &["Microbit"],
    },
    KnownDevice {
        vid: 0x1366, pid: 0x0105, name: "SEGGER J-Link",
        port_count: 1,
        boards: &[],
    },
];

/// `(device name, interface index) → function`. Multi-port bridges expose
/// one tty per interface; boards route consoles to fixed interfaces.
static PORT_FUNCTIONS: &[(&str, u8, &str)] = &[
    ("Silicon Labs CP210x", 0, "UART0"),
    ("Silicon Labs CP210x", 1, "UART1"),
    ("Silicon Labs CP210x", 2, "UART2"),
    ("Silicon Labs CP210x", 3, "UART3"),
    ("Silicon Labs CP2105", 0, "UART0"),
    ("Silicon Labs CP2105", 1, "UART1"),
    ("FTDI FT2232H",        0, "JTAG"),
    ("FTDI FT2232H",        1, "UART"),
    ("FTDI FT4232H",        0, "UART0"),
    ("FTDI FT4232H",        1, "UART1"),
    ("FTDI FT4232H",        2, "UART2"),
    ("FTDI FT4232H",        3, "UART3"),
];

// ─────────────────────────────────────────────────────────────────────────────
//  Board override file  (~/.boards)
// ─────────────────────────────────────────────────────────────────────────────

/// User-assigned board names, keyed by USB serial string.
///
/// File grammar, line oriented:
///
/// ```text
/// # === PolarFire SoC ===
/// # USB: 1-6.2  S/N: 04A1B2C3
/// ```
///
/// A `# === <board> ===` heading sets the current board; any later line
/// containing both `# USB:` and `S/N:` binds the serial token after `S/N:`
/// to it. Lines with an empty board or a missing serial are dropped.
#[derive(Debug, Default, Clone)]
pub struct BoardOverrides {
    map: HashMap<String, String>,
}

impl BoardOverrides {
    /// Load from the default location, `$HOME/.boards`. Missing file is an
    /// empty override set.
    pub fn load_default() -> Self {
        match std::env::var("HOME") {
            Ok(home) => Self::load(Path::new(&home).join(".boards")),
            Err(_) => Self::default(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut map = HashMap::new();
        let mut board = String::new();

        for line in text.lines() {
            let trimmed = line.trim();

            if let Some(b) = parse_heading(trimmed) {
                board = b.to_string();
                continue;
            }

            if trimmed.contains("# USB:") && trimmed.contains("S/N:") {
                if board.is_empty() {
                    continue;
                }
                let serial = trimmed
                    .split("S/N:")
                    .nth(1)
                    .and_then(|rest| rest.split_whitespace().next());
                if let Some(serial) = serial {
                    map.insert(serial.to_string(), board.clone());
                }
            }
        }

        Self { map }
    }

    /// Board name assigned to a USB serial string, if any.
    pub fn board_for(&self, serial: &str) -> Option<&str> {
        self.map.get(serial).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// `# === <board> ===` → `<board>`.
fn parse_heading(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("# ===")?;
    let board = rest.strip_suffix("===")?.trim();
    if board.is_empty() {
        None
    } else {
        Some(board)
    }
}

// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn catalog_lookup_cp2108() {
        let dev = KnownDevice::find(0x10c4, 0xea71).unwrap();
        assert_eq!(dev.name, "Silicon Labs CP210x");
        assert_eq!(dev.port_count, 4);
        assert_eq!(port_function(dev.name, 2), Some("UART2"));
    }

    #[test]
    fn catalog_miss_is_none() {
        assert!(KnownDevice::find(0xdead, 0xbeef).is_none());
        assert_eq!(port_function("Silicon Labs CP210x", 9), None);
    }

    #[test]
    fn override_file_round_trip() {
        let text = "\
# uartmon board overrides
# === PolarFire SoC ===
# USB: 1-6.2  S/N: 04A1B2C3
# === ZynqMP ZCU102 ===
# USB: 1-4  S/N: FT99XYZ
";
        let ov = BoardOverrides::parse(text);
        assert_eq!(ov.len(), 2);
        assert_eq!(ov.board_for("04A1B2C3"), Some("PolarFire SoC"));
        assert_eq!(ov.board_for("FT99XYZ"), Some("ZynqMP ZCU102"));
        assert_eq!(ov.board_for("nope"), None);
    }

    #[test]
    fn override_lines_without_board_or_serial_are_dropped() {
        // Serial line before any heading, and a heading with an empty board.
        let text = "\
# USB: 1-1  S/N: EARLY
# ===  ===
# USB: 1-2  S/N: NOBOARD
";
        let ov = BoardOverrides::parse(text);
        assert!(ov.is_empty());
    }

    #[test]
    fn override_serial_is_whitespace_delimited() {
        let ov = BoardOverrides::parse("# === X ===\n# USB: 1-3 S/N: ABC123 trailing\n");
        assert_eq!(ov.board_for("ABC123"), Some("X"));
    }
}
