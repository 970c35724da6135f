// ─────────────────────────────────────────────────────────────────────────────
//  uartmon :: session  —  per-run log directory, `latest` symlink, pruning
// ─────────────────────────────────────────────────────────────────────────────

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{MonitorError, Result};
use crate::util::{ensure_dir, symlink_atomic, timestamp_compact};

/// Sessions kept by the startup prune.
pub const MAX_SESSIONS: usize = 10;

/// Directory entries examined per prune pass.
const PRUNE_SCAN_CAP: usize = 256;

const SESSION_PREFIX: &str = "session-";

/// Create `<base>/session-<YYYYMMDD-HHMMSS>` and point `<base>/latest` at
/// it. The symlink target is the bare session name so the link survives a
/// relocated base directory.
pub fn create_session(base: &Path) -> Result<PathBuf> {
    let name = format!("{SESSION_PREFIX}{}", timestamp_compact());
    let session = base.join(&name);

    ensure_dir(&session).map_err(|source| MonitorError::SessionCreateFailed {
        path: session.display().to_string(),
        source,
    })?;

    symlink_atomic(Path::new(&name), &base.join("latest")).map_err(|source| {
        MonitorError::SessionCreateFailed {
            path: base.join("latest").display().to_string(),
            source,
        }
    })?;

    Ok(session)
}

/// Delete the oldest sessions beyond `keep`. Session names sort
/// lexicographically in chronological order, so no timestamps are parsed.
/// Dot-prefixed files inside a session are left alone (and keep the
/// directory itself alive).
pub fn prune_sessions(base: &Path, keep: usize) -> usize {
    let entries = match fs::read_dir(base) {
        Ok(e) => e,
        Err(_) => return 0,
    };

    let mut sessions: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with(SESSION_PREFIX)
        })
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .take(PRUNE_SCAN_CAP)
        .collect();

    sessions.sort();

    let excess = sessions.len().saturating_sub(keep);
    for dir in &sessions[..excess] {
        remove_session(dir);
    }
    excess
}

fn remove_session(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!("prune: cannot remove {}: {e}", entry.path().display());
            }
        }
    }
    match fs::remove_dir(dir) {
        Ok(()) => debug!("pruned {}", dir.display()),
        Err(e) => warn!("prune: cannot remove {}: {e}", dir.display()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn session_is_created_and_latest_points_at_it() {
        let base = tempfile::tempdir().unwrap();
        let session = create_session(base.path()).unwrap();
        assert!(session.is_dir());

        let latest = fs::read_link(base.path().join("latest")).unwrap();
        assert_eq!(base.path().join(latest), session);
    }

    #[test]
    fn prune_removes_oldest_beyond_retention() {
        let base = tempfile::tempdir().unwrap();
        for i in 0..5 {
            let dir = base.path().join(format!("session-20991231-00000{i}"));
            fs::create_dir(&dir).unwrap();
            fs::write(dir.join("PORT.log"), "x").unwrap();
        }

        let removed = prune_sessions(base.path(), 3);
        assert_eq!(removed, 2);

        let mut left: Vec<String> = fs::read_dir(base.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec![
                "session-20991231-000002",
                "session-20991231-000003",
                "session-20991231-000004",
            ]
        );
    }

    #[test]
    fn prune_under_retention_is_a_no_op() {
        let base = tempfile::tempdir().unwrap();
        fs::create_dir(base.path().join("session-20991231-000000")).unwrap();
        assert_eq!(prune_sessions(base.path(), 3), 0);
        assert!(base.path().join("session-20991231-000000").is_dir());
    }

    #[test]
    fn prune_ignores_non_session_entries_and_dot_files() {
        let base = tempfile::tempdir().unwrap();
        fs::write(base.path().join("status.json"), "{}").unwrap();
        for i in 0..3 {
            fs::create_dir(base.path().join(format!("session-0{i}"))).unwrap();
        }
        // A dot-file keeps its session directory from being fully removed.
        fs::write(base.path().join("session-00/.keep"), "").unwrap();

        prune_sessions(base.path(), 1);
        assert!(base.path().join("status.json").exists());
        assert!(base.path().join("session-00/.keep").exists());
        assert!(!base.path().join("session-01").exists());
        assert!(base.path().join("session-02").is_dir());
    }
}
