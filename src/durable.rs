// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Crash-safe whole-file replacement.
//!
//! Writers never modify a state file in place. Contents go to a temporary
//! file in the destination directory, are synced, then renamed over the
//! target. A crash at any point leaves either the old or the new file.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

/// Atomically replaces `path` with `contents`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    sync_dir(dir);
    Ok(())
}

/// Best-effort fsync of a directory so a rename survives power loss.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
