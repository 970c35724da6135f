// ─────────────────────────────────────────────────────────────────────────────
//  uartmon  —  UART monitor daemon and its administrative CLI
//
//  Watches USB serial boards passively and writes their output to
//  timestamped log files, so flashers, terminals and scripts can open the
//  port without losing history.
//
//  USAGE
//  ─────
//    uartmon identify [-v] [--save]
//    uartmon monitor  [-f] [--systemd] [-b 115200] [--only ttyUSB0,ttyUSB2] [--proxy]
//    uartmon status [--json]
//    uartmon yield   /dev/ttyUSB0
//    uartmon reclaim /dev/ttyUSB0
//    uartmon tail    ZYNQMP_ZCU102_UART0
// ─────────────────────────────────────────────────────────────────────────────

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode, WriteLogger};

use uartmon::daemon::{Daemon, MonitorConfig, DEFAULT_BASE, DEFAULT_BAUD};
use uartmon::identify::{group_ports, scan, DeviceGroup};
use uartmon::{control, util, BoardOverrides};

// ─────────────────────────────────────────────────────────────────────────────
//  CLI definition (clap derive)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "uartmon",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Passive UART monitor — per-board serial logs with hot-plug tracking",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Base directory for sessions, control socket and status
    #[arg(long, global = true, default_value = DEFAULT_BASE)]
    base_dir: PathBuf,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Cmd {
    /// Identify connected USB serial boards
    Identify(IdentifyArgs),
    /// Run the monitor daemon
    Monitor(MonitorArgs),
    /// Show what the running daemon is monitoring
    Status {
        /// Print the raw status document
        #[arg(long)]
        json: bool,
    },
    /// Release a port's descriptor so another tool can open it
    Yield {
        /// Device path or tty name, e.g. /dev/ttyUSB0
        dev: String,
    },
    /// Re-acquire a yielded port
    Reclaim {
        /// Device path or tty name
        dev: String,
    },
    /// Print a port's log and follow appends
    Tail {
        /// Device path, tty name or label
        port: String,
    },
}

#[derive(Args)]
struct IdentifyArgs {
    /// Also print manufacturer, serial and sysfs topology
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Write the groups to ~/.boards for later renaming
    #[arg(long)]
    save: bool,
}

#[derive(Args)]
struct MonitorArgs {
    /// Stay in the foreground (log to the terminal)
    #[arg(long, short = 'f')]
    foreground: bool,

    /// Run under a service manager: foreground plus sd_notify
    #[arg(long)]
    systemd: bool,

    /// Baud rate applied to every port
    #[arg(long, short = 'b', default_value_t = DEFAULT_BAUD)]
    baud: u32,

    /// Comma-separated devices to monitor (paths or tty names); default all
    #[arg(long)]
    only: Option<String>,

    /// Hold devices exclusively and expose a proxy PTY per port
    #[arg(long)]
    proxy: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
//  Entry point
// ─────────────────────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let result = match cli.command {
        Cmd::Identify(args) => cmd_identify(args),
        Cmd::Monitor(args)  => cmd_monitor(args, cli.base_dir),
        Cmd::Status { json } => cmd_status(&cli.base_dir, json),
        Cmd::Yield { dev }   => cmd_admin(&cli.base_dir, &format!("YIELD {dev}")),
        Cmd::Reclaim { dev } => cmd_admin(&cli.base_dir, &format!("RECLAIM {dev}")),
        Cmd::Tail { port }   => cmd_tail(&cli.base_dir, &port),
    };

    if let Err(e) = result {
        eprintln!("{} {e:#}", "✗".red().bold());
        std::process::exit(1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  identify
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_identify(args: IdentifyArgs) -> anyhow::Result<()> {
    let overrides = BoardOverrides::load_default();
    let ports = scan(&overrides);

    if ports.is_empty() {
        println!("{} No USB serial devices found", "!".yellow());
        return Ok(());
    }

    let groups = group_ports(&ports);
    println!(
        "{} {} device(s), {} port(s)",
        "→".cyan(),
        groups.len(),
        ports.len()
    );

    for group in &groups {
        let first = &group.ports[0];
        println!();
        println!(
            "{}  {}  {}",
            first.product.bold(),
            format!("[{:04x}:{:04x}]", first.vid, first.pid).dimmed(),
            format!(
                "S/N {}  USB {}",
                first.serial.as_deref().unwrap_or("—"),
                first.usb_path
            )
            .dimmed(),
        );
        println!("{}", "─".repeat(72).dimmed());

        for p in &group.ports {
            let board = p.board().unwrap_or("—");
            println!(
                "  {:<12} {:<10} {:<32} {}",
                p.tty_name,
                p.function,
                p.label.bold(),
                board.dimmed()
            );
            if args.verbose {
                println!(
                    "  {:<12} {}",
                    "",
                    format!(
                        "{}  mfr: {}  if: {}",
                        p.dev_path, p.manufacturer, p.interface
                    )
                    .dimmed()
                );
            }
        }
    }

    if args.save {
        let path = write_overrides_file(&groups)?;
        println!();
        println!(
            "{} wrote {} — edit the === headings to assign board names",
            "✓".green().bold(),
            path.display()
        );
    }

    Ok(())
}

/// Persist one heading per device group in the grammar `BoardOverrides`
/// reads back. An existing override becomes the heading, so a saved file
/// round-trips.
fn write_overrides_file(groups: &[DeviceGroup]) -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set")?;
    let path = PathBuf::from(home).join(".boards");

    let mut out = String::from(
        "# uartmon board assignments\n\
         # Rename the === headings, then restart the daemon or send it SIGHUP.\n",
    );
    for group in groups {
        let first = &group.ports[0];
        let Some(serial) = first.serial.as_deref() else {
            continue;
        };
        let board = first.board().unwrap_or(first.product.as_str());
        out.push_str(&format!(
            "\n# === {board} ===\n# USB: {}  S/N: {serial}\n",
            first.usb_path
        ));
    }

    fs::write(&path, out).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

// ─────────────────────────────────────────────────────────────────────────────
//  monitor
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_monitor(args: MonitorArgs, base: PathBuf) -> anyhow::Result<()> {
    let detach = !args.foreground && !args.systemd;

    if detach {
        // The log file must exist before stdio goes away.
        util::ensure_dir(&base).with_context(|| format!("creating {}", base.display()))?;
        let logfile = File::create(base.join("daemon.log"))
            .with_context(|| format!("creating {}/daemon.log", base.display()))?;
        nix::unistd::daemon(true, false).context("daemonize")?;
        WriteLogger::init(LevelFilter::Info, Config::default(), logfile)?;
    } else {
        TermLogger::init(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        )?;
    }

    let cfg = MonitorConfig {
        base,
        baud: args.baud,
        filter: args.only,
        proxy: args.proxy,
        systemd: args.systemd,
    };

    let mut daemon = Daemon::new(cfg)?;
    daemon.run()?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
//  status / yield / reclaim
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_status(base: &Path, json: bool) -> anyhow::Result<()> {
    let response = control::send_command(base, "STATUS")?;
    if response.starts_with("ERROR") {
        return Err(anyhow!("{}", response.trim()));
    }
    if json {
        print!("{response}");
        return Ok(());
    }

    let doc: serde_json::Value =
        serde_json::from_str(response.trim()).context("malformed status document")?;
    println!(
        "{} pid {}  session {}",
        "uartmon".bold(),
        doc["pid"],
        doc["session"].as_str().unwrap_or("?")
    );
    println!(
        "{:<14} {:<28} {:<18} {:<9} {:<11} {:>10}",
        "DEVICE", "LABEL", "BOARD", "FUNCTION", "STATUS", "BYTES"
    );
    println!("{}", "─".repeat(95).dimmed());

    for p in doc["ports"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let status = p["status"].as_str().unwrap_or("?");
        let status_col = match status {
            "monitoring" => status.green(),
            _ => status.yellow(),
        };
        println!(
            "{:<14} {:<28} {:<18} {:<9} {:<11} {:>10}",
            p["device"].as_str().unwrap_or("?"),
            p["label"].as_str().unwrap_or("?").bold(),
            p["board"].as_str().unwrap_or("—"),
            p["function"].as_str().unwrap_or("—"),
            status_col,
            p["bytes_logged"].as_u64().unwrap_or(0),
        );
    }
    Ok(())
}

fn cmd_admin(base: &Path, command: &str) -> anyhow::Result<()> {
    let response = control::send_command(base, command)?;
    let response = response.trim();
    if let Some(cause) = response.strip_prefix("ERROR ") {
        return Err(anyhow!("{cause}"));
    }
    println!("{} {response}", "✓".green().bold());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
//  tail
// ─────────────────────────────────────────────────────────────────────────────

const TAIL_BACKLOG: u64 = 4096;

fn cmd_tail(base: &Path, port: &str) -> anyhow::Result<()> {
    let path = resolve_log_file(base, port)?;
    println!("{} {}", "→".cyan(), path.display());

    let mut file =
        File::open(&path).with_context(|| format!("opening {}", path.display()))?;

    // Start near the end so a long-lived log does not dump its history.
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(TAIL_BACKLOG)))?;

    loop {
        let mut chunk = Vec::new();
        let n = file.read_to_end(&mut chunk)?;
        if n > 0 {
            // Raw bytes: the log may carry whatever the UART emitted.
            io::stdout().write_all(&chunk)?;
            io::stdout().flush()?;
        } else {
            thread::sleep(Duration::from_millis(200));
        }
    }
}

/// `<dev|tty|label>` → log file path, via the daemon's status document,
/// falling back to `<base>/latest/<label>.log` when no daemon is running.
fn resolve_log_file(base: &Path, port: &str) -> anyhow::Result<PathBuf> {
    if let Ok(response) = control::send_command(base, "STATUS") {
        if let Ok(doc) = serde_json::from_str::<serde_json::Value>(response.trim()) {
            if let Some(ports) = doc["ports"].as_array() {
                for p in ports {
                    let device = p["device"].as_str().unwrap_or("");
                    let label = p["label"].as_str().unwrap_or("");
                    let tty = device.rsplit('/').next().unwrap_or("");
                    if port == device || port == label || port == tty {
                        return Ok(PathBuf::from(p["log_file"].as_str().unwrap_or("")));
                    }
                }
            }
        }
    }

    let fallback = base.join("latest").join(format!("{port}.log"));
    if fallback.exists() {
        return Ok(fallback);
    }
    Err(uartmon::MonitorError::PortNotFound(port.to_string()).into())
}
