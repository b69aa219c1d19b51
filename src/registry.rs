//! Tool Registry: symbolic name → absolute executable path resolution.
//!
//! Search priority, highest to lowest: workspace-local `tools/` directory,
//! repository-bundled tools directory, the operating system `PATH`. Detection
//! is lazy and one-shot per name; re-detection is an explicit operation.

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::{Mutex, OnceLock},
};

/// The full set of symbolic tool names this crate ever resolves.
pub const KNOWN_TOOLS: &[&str] = &[
	"simg2img",
	"img2simg",
	"lpmake",
	"lpunpack",
	"avbtool",
	"magiskboot",
	"make_ext4fs",
	"mkfs_erofs",
	"extract_erofs",
	"img_unpack",
	"rkImageMaker",
	"afptool",
	"aapt2",
	"adb",
];

pub struct ToolRegistry {
	workspace_local: Option<PathBuf>,
	bundled: Option<PathBuf>,
	cache: Mutex<HashMap<String, Option<PathBuf>>>,
}

impl ToolRegistry {
	#[must_use]
	pub fn new(workspace_local: Option<PathBuf>, bundled: Option<PathBuf>) -> Self {
		Self { workspace_local, bundled, cache: Mutex::new(HashMap::new()) }
	}

	fn search(&self, name: &str) -> Option<PathBuf> {
		for dir in [self.workspace_local.as_deref(), self.bundled.as_deref()].into_iter().flatten() {
			let candidate = dir.join(name);
			if candidate.is_file() {
				return Some(candidate);
			}
		}
		which_on_path(name)
	}

	/// Resolves `name`, caching the result after the first lookup.
	pub fn get_path(&self, name: &str) -> Option<PathBuf> {
		let mut cache = self.cache.lock().expect("tool registry cache poisoned");
		if let Some(cached) = cache.get(name) {
			return cached.clone();
		}
		let found = self.search(name);
		cache.insert(name.to_owned(), found.clone());
		found
	}

	#[must_use]
	pub fn is_available(&self, name: &str) -> bool {
		self.get_path(name).is_some()
	}

	/// Forces `name` to be looked up again, discarding any cached result.
	pub fn redetect(&self, name: &str) -> Option<PathBuf> {
		let found = self.search(name);
		self.cache.lock().expect("tool registry cache poisoned").insert(name.to_owned(), found.clone());
		found
	}

	pub fn redetect_all(&self) {
		for name in KNOWN_TOOLS {
			self.redetect(name);
		}
	}
}

fn which_on_path(name: &str) -> Option<PathBuf> {
	let path_var = std::env::var_os("PATH")?;
	std::env::split_paths(&path_var).map(|dir| dir.join(name)).find(|candidate| candidate.is_file())
}

static REGISTRY: OnceLock<ToolRegistry> = OnceLock::new();

/// The process-wide lazily initialised registry. `RK_KITCHEN_TOOLS` names a
/// workspace-local directory; `RK_KITCHEN_BUNDLED_TOOLS` names a
/// repository-bundled fallback directory.
pub fn tool_registry() -> &'static ToolRegistry {
	REGISTRY.get_or_init(|| {
		ToolRegistry::new(
			std::env::var_os("RK_KITCHEN_TOOLS").map(PathBuf::from),
			std::env::var_os("RK_KITCHEN_BUNDLED_TOOLS").map(PathBuf::from),
		)
	})
}

/// Resolves `name` via the process-wide registry, failing with a typed error
/// rather than an `Option` where the caller has no sensible fallback.
pub fn require_tool(name: &str) -> crate::error::Result<PathBuf> {
	tool_registry().get_path(name).ok_or_else(|| crate::error::ErrKind::ToolMissing(name.to_owned()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_workspace_local_wins_over_bundled() {
		let ws = tempfile::tempdir().unwrap();
		let bundled = tempfile::tempdir().unwrap();
		std::fs::write(ws.path().join("simg2img"), b"#!/bin/sh\n").unwrap();
		std::fs::write(bundled.path().join("simg2img"), b"#!/bin/sh\n").unwrap();

		let reg = ToolRegistry::new(Some(ws.path().to_path_buf()), Some(bundled.path().to_path_buf()));
		assert_eq!(reg.get_path("simg2img").unwrap(), ws.path().join("simg2img"));
	}

	#[test]
	fn test_missing_tool_is_none() {
		let reg = ToolRegistry::new(None, None);
		assert!(!reg.is_available("definitely-not-a-real-tool-xyz"));
	}

	#[test]
	fn test_redetect_picks_up_newly_created_tool() {
		let ws = tempfile::tempdir().unwrap();
		let reg = ToolRegistry::new(Some(ws.path().to_path_buf()), None);
		assert!(!reg.is_available("mytool"));

		std::fs::write(ws.path().join("mytool"), b"#!/bin/sh\n").unwrap();
		assert!(reg.redetect("mytool").is_some());
	}
}
