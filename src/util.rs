// ─────────────────────────────────────────────────────────────────────────────
//  uartmon :: util  —  sysfs reads, timestamps, symlinks, directories
// ─────────────────────────────────────────────────────────────────────────────

use std::fs;
use std::io;
use std::os::unix::fs::{symlink, DirBuilderExt};
use std::path::Path;

use chrono::Local;

/// Read a sysfs attribute file and return its contents with trailing
/// whitespace removed. `None` if the file is absent or unreadable.
pub fn read_sysfs_attr(dir: &Path, attr: &str) -> Option<String> {
    let s = fs::read_to_string(dir.join(attr)).ok()?;
    Some(s.trim_end().to_string())
}

/// Read a sysfs attribute holding a hex number (e.g. `idVendor` = "10c4\n").
pub fn read_sysfs_hex(dir: &Path, attr: &str) -> Option<u16> {
    let s = read_sysfs_attr(dir, attr)?;
    u16::from_str_radix(s.trim(), 16).ok()
}

/// Wall-clock timestamp with millisecond precision, `2026-08-01 14:03:22.417`.
pub fn timestamp_millis() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Compact wall-clock stamp used in session directory names, `20260801-140322`.
pub fn timestamp_compact() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Replace `link` with a symlink to `target` atomically: create a temporary
/// sibling link, then rename it over the destination.
pub fn symlink_atomic(target: &Path, link: &Path) -> io::Result<()> {
    let tmp = link.with_extension("tmp");
    fs::remove_file(&tmp).ok();
    symlink(target, &tmp)?;
    fs::rename(&tmp, link)
}

/// `mkdir -p` with mode 0755.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
}

// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sysfs_attr_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("idVendor"), "10c4\n").unwrap();
        assert_eq!(
            read_sysfs_attr(dir.path(), "idVendor").as_deref(),
            Some("10c4")
        );
        assert_eq!(read_sysfs_hex(dir.path(), "idVendor"), Some(0x10c4));
        assert_eq!(read_sysfs_attr(dir.path(), "missing"), None);
    }

    #[test]
    fn symlink_replace_is_atomic_over_existing() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("latest");
        symlink_atomic(Path::new("session-a"), &link).unwrap();
        symlink_atomic(Path::new("session-b"), &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("session-b"));
    }

    #[test]
    fn ensure_dir_is_recursive_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b/c");
        ensure_dir(&deep).unwrap();
        ensure_dir(&deep).unwrap();
        assert!(deep.is_dir());
    }
}
