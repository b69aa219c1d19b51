//! Dirty Tracker: per-partition clean/dirty flag with snapshot-based
//! auto-detect, persisted as two JSON documents under `extract/`.

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	time::SystemTime,
};

use serde::{Deserialize, Serialize};

use crate::{error::Result, project::Project};

pub type DirtyState = HashMap<String, bool>;

/// Cheap triple `(file_count, total_size, newest_mtime)`, intentionally
/// weaker than content hashing — see the trade-off rationale in
/// `DESIGN.md`/`SPEC_FULL.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnapshot {
	pub file_count: u64,
	pub total_size: u64,
	pub newest_mtime_unix: i64,
}

pub type SnapshotMap = HashMap<String, SourceSnapshot>;

fn dirty_path(project: &Project) -> PathBuf {
	project.extract_dir().join("dirty.json")
}

fn snapshot_path(project: &Project) -> PathBuf {
	project.extract_dir().join("source_snapshot.json")
}

fn load_json<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> T {
	std::fs::read_to_string(path).ok().and_then(|raw| serde_json::from_str(&raw).ok()).unwrap_or_default()
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	std::fs::write(path, serde_json::to_string_pretty(value)?)?;
	Ok(())
}

pub fn load_dirty(project: &Project) -> DirtyState {
	load_json(&dirty_path(project))
}

pub fn save_dirty(project: &Project, flags: &DirtyState) -> Result<()> {
	save_json(&dirty_path(project), flags)
}

/// Sets the dirty flag for `name`.
pub fn set(project: &Project, name: &str, dirty: bool) -> Result<()> {
	let mut flags = load_dirty(project);
	flags.insert(name.to_owned(), dirty);
	save_dirty(project, &flags)
}

/// Returns true if dirty or unknown (safe default — over-rebuild, not
/// under-rebuild).
#[must_use]
pub fn is_dirty(project: &Project, name: &str) -> bool {
	load_dirty(project).get(name).copied().unwrap_or(true)
}

pub fn mark_all_clean(project: &Project, names: &[String]) -> Result<()> {
	let mut flags = load_dirty(project);
	for name in names {
		flags.insert(name.clone(), false);
	}
	save_dirty(project, &flags)
}

pub fn mark_all_dirty(project: &Project) -> Result<()> {
	let mut flags = load_dirty(project);
	for v in flags.values_mut() {
		*v = true;
	}
	save_dirty(project, &flags)
}

/// Computes the current snapshot triple for a directory tree.
pub fn snapshot(tree: &Path) -> Result<SourceSnapshot> {
	let mut file_count = 0_u64;
	let mut total_size = 0_u64;
	let mut newest_mtime_unix = i64::MIN;

	let mut stack = vec![tree.to_owned()];
	while let Some(dir) = stack.pop() {
		let Ok(entries) = std::fs::read_dir(&dir) else { continue };
		for entry in entries.flatten() {
			let path = entry.path();
			let Ok(meta) = entry.metadata() else { continue };
			if meta.is_dir() {
				stack.push(path);
				continue;
			}
			file_count += 1;
			total_size += meta.len();
			if let Ok(modified) = meta.modified() {
				let unix = modified
					.duration_since(SystemTime::UNIX_EPOCH)
					.map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
					.unwrap_or(0);
				newest_mtime_unix = newest_mtime_unix.max(unix);
			}
		}
	}

	if newest_mtime_unix == i64::MIN {
		newest_mtime_unix = 0;
	}
	Ok(SourceSnapshot { file_count, total_size, newest_mtime_unix })
}

fn load_snapshots(project: &Project) -> SnapshotMap {
	load_json(&snapshot_path(project))
}

fn save_snapshots(project: &Project, snapshots: &SnapshotMap) -> Result<()> {
	save_json(&snapshot_path(project), snapshots)
}

/// Saves `snapshot` for `name`, used right after extract marks a partition clean.
pub fn save_snapshot_for(project: &Project, name: &str, snap: SourceSnapshot) -> Result<()> {
	let mut snapshots = load_snapshots(project);
	snapshots.insert(name.to_owned(), snap);
	save_snapshots(project, &snapshots)
}

/// Recomputes the snapshot for `tree`, compares it to the saved one for
/// `name`: if different, persists the new snapshot and marks dirty, and
/// returns `true`; if identical, the existing dirty flag is preserved
/// (never flips a user-marked-dirty partition to clean from a matching
/// snapshot alone) and the current flag is returned.
pub fn auto_detect(project: &Project, name: &str, tree: &Path) -> Result<bool> {
	let current = snapshot(tree)?;
	let mut snapshots = load_snapshots(project);
	let changed = snapshots.get(name) != Some(&current);

	if changed {
		snapshots.insert(name.to_owned(), current);
		save_snapshots(project, &snapshots)?;
		set(project, name, true)?;
		Ok(true)
	} else {
		Ok(is_dirty(project, name))
	}
}
