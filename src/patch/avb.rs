//! AVB Patcher: locates verified-boot metadata images and regenerates them
//! with verification disabled (§4.j).

use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
};

use tracing::{instrument, warn};

use crate::{
	error::Result,
	project::SlotMode,
	registry::tool_registry,
	util::{zero_pad_to, CancelToken},
};

/// The four-byte tag an internally constructed fallback blob begins with.
pub const AVB0_TAG: &[u8; 4] = b"AVB0";

#[derive(Default)]
struct SlotGroup {
	base: Option<PathBuf>,
	a: Option<PathBuf>,
	b: Option<PathBuf>,
}

/// Splits a vbmeta-family filename stem into `(group_base, slot)`.
fn split_slot(stem: &str) -> (String, Option<char>) {
	if let Some(prefix) = stem.strip_suffix("_a") {
		(prefix.to_owned(), Some('a'))
	} else if let Some(prefix) = stem.strip_suffix("_b") {
		(prefix.to_owned(), Some('b'))
	} else {
		(stem.to_owned(), None)
	}
}

fn is_vbmeta_name(stem: &str) -> bool {
	stem == "vbmeta" || stem.starts_with("vbmeta_")
}

/// Scans `dir` for `vbmeta*.img` files and selects the target set according
/// to `slot_mode`, per the grouping rules in §4.j.
#[must_use]
pub fn scan_targets(dir: &Path, slot_mode: SlotMode) -> Vec<PathBuf> {
	let mut groups: BTreeMap<String, SlotGroup> = BTreeMap::new();

	let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
	for entry in entries.flatten() {
		let path = entry.path();
		if path.extension().and_then(|e| e.to_str()) != Some("img") {
			continue;
		}
		let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
		if !is_vbmeta_name(stem) {
			continue;
		}
		let (base, slot) = split_slot(stem);
		let group = groups.entry(base).or_default();
		match slot {
			Some('a') => group.a = Some(path),
			Some('b') => group.b = Some(path),
			_ => group.base = Some(path),
		}
	}

	let mut targets = Vec::new();
	for group in groups.into_values() {
		match slot_mode {
			SlotMode::A => {
				if let Some(a) = group.a {
					targets.push(a);
				} else if let Some(base) = group.base {
					targets.push(base);
				}
			},
			SlotMode::B => {
				if let Some(b) = group.b {
					targets.push(b);
				} else if let Some(base) = group.base {
					targets.push(base);
				}
			},
			SlotMode::Auto => {
				if let Some(a) = group.a {
					targets.push(a);
				} else if let Some(b) = group.b {
					targets.push(b);
				} else if let Some(base) = group.base {
					targets.push(base);
				}
			},
			SlotMode::Both => {
				if group.a.is_some() || group.b.is_some() {
					if let Some(a) = group.a {
						targets.push(a);
					}
					if let Some(b) = group.b {
						targets.push(b);
					}
				} else if let Some(base) = group.base {
					targets.push(base);
				}
			},
		}
	}
	targets.sort();
	targets
}

/// Builds the internally constructed minimal fallback blob, zero-padded to
/// `size`, used when the signing tool fails or is unavailable.
fn fallback_blob(size: u64) -> Vec<u8> {
	let mut blob = AVB0_TAG.to_vec();
	blob.resize(usize::try_from(size).unwrap_or(usize::MAX).max(blob.len()), 0);
	blob
}

/// Disables verification on every scanned target. The final output file is
/// always zero-padded to the original size, regardless of which path
/// produced it.
#[instrument(skip(cancel))]
pub fn disable_avb(dir: &Path, slot_mode: SlotMode, cancel: &CancelToken) -> Result<Vec<PathBuf>> {
	let targets = scan_targets(dir, slot_mode);
	let mut patched = Vec::with_capacity(targets.len());

	for target in targets {
		cancel.check()?;
		let original_size = std::fs::metadata(&target)?.len();

		let succeeded = tool_registry().get_path("avbtool").is_some_and(|tool| {
			std::process::Command::new(&tool)
				.args(["make_vbmeta_image", "--flags", "3", "--output"])
				.arg(&target)
				.status()
				.is_ok_and(|status| status.success())
		}) && target.is_file();

		if !succeeded {
			warn!(target = %target.display(), "avbtool unavailable or failed, writing AVB0 fallback blob");
			std::fs::write(&target, fallback_blob(original_size))?;
		}

		zero_pad_to(&target, original_size)?;
		patched.push(target);
	}

	Ok(patched)
}
