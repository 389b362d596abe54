//! On-disk snapshot of the task store.
//!
//! The whole state is one JSON document, rewritten on every mutation via
//! a temporary file and a rename.

use crate::models::{CaseHistoryRecord, TaskRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Pending tasks and history of one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    #[serde(default)]
    pub pending: BTreeMap<String, TaskRecord>,
    #[serde(default)]
    pub history: Vec<CaseHistoryRecord>,
}

/// The snapshot file schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskState {
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub users: BTreeMap<String, UserState>,
}

/// Read the snapshot at `path`.
///
/// A missing or blank file yields an empty state.
pub fn load(path: &Path) -> Result<BTreeMap<String, UserState>> {
    if !path.exists() {
        debug!("No state file at {}, starting empty", path.display());
        return Ok(BTreeMap::new());
    }

    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file: {}", path.display()))?;
    if data.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let snapshot: DiskState = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

    Ok(snapshot.users)
}

/// Serialize `users` and atomically replace the file at `path`.
pub fn persist(path: &Path, users: &BTreeMap<String, UserState>) -> Result<()> {
    let snapshot = DiskStateRef {
        updated_at: Utc::now(),
        users,
    };
    let data = serde_json::to_vec_pretty(&snapshot).context("Failed to serialize state")?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
    }

    let tmp = tmp_path(path);
    fs::write(&tmp, &data)
        .with_context(|| format!("Failed to write temp state file: {}", tmp.display()))?;

    install(&tmp, path, |from, to| fs::rename(from, to))
}

/// Move `tmp` over `path`, removing `path` first when the rename fails.
fn install<F>(tmp: &Path, path: &Path, mut rename: F) -> Result<()>
where
    F: FnMut(&Path, &Path) -> std::io::Result<()>,
{
    if let Err(rename_err) = rename(tmp, path) {
        // Some platforms refuse to rename over an existing file.
        warn!(
            "Rename over {} failed ({}), retrying after removal",
            path.display(),
            rename_err
        );
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove old state file: {}", path.display())
                })
            }
        }
        rename(tmp, path)
            .with_context(|| format!("Failed to rename state file into {}", path.display()))?;
    }

    Ok(())
}

/// Borrowing twin of [`DiskState`] so persisting never clones the state.
#[derive(Serialize)]
struct DiskStateRef<'a> {
    updated_at: DateTime<Utc>,
    users: &'a BTreeMap<String, UserState>,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
