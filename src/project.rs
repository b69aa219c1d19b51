//! Project Store: the on-disk project layout plus the typed `ProjectConfig`
//! record, persisted atomically as a single JSON document.

use std::{
	path::{Path, PathBuf},
	sync::atomic::{AtomicBool, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::{detect::Route, error::Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuperResizeMode {
	#[default]
	Auto,
	Keep,
	Shrink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotMode {
	#[default]
	Auto,
	A,
	B,
	Both,
}

/// Typed, explicit-field on-disk project state (§3, §4.l). No free-form
/// key-value bag in the hot path.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
	pub imported: bool,
	pub extracted: bool,
	pub patched: bool,
	pub built: bool,

	pub input_file: Option<PathBuf>,
	pub rom_type: Option<String>,
	pub input_type: Option<Route>,

	pub output_sparse: bool,
	pub super_resize_mode: SuperResizeMode,
	pub slot_mode: SlotMode,
	pub debloated_apps: Vec<String>,
}

/// A named workspace rooted at a directory, owning the eight fixed
/// subdirectories the filesystem layout names.
pub struct Project {
	pub root: PathBuf,
	busy: AtomicBool,
}

impl Project {
	/// Opens (creating if absent) the project rooted at `root`, ensuring
	/// every fixed subdirectory exists.
	pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
		let root = root.into();
		let project = Self { root, busy: AtomicBool::new(false) };
		for dir in [
			project.in_dir(),
			project.out_source_dir(),
			project.out_image_super_dir(),
			project.out_image_update_dir(),
			project.extract_dir(),
			project.temp_dir(),
			project.logs_dir(),
			project.config_dir(),
		] {
			std::fs::create_dir_all(dir)?;
		}
		Ok(project)
	}

	#[must_use]
	pub fn in_dir(&self) -> PathBuf {
		self.root.join("in")
	}

	#[must_use]
	pub fn out_dir(&self) -> PathBuf {
		self.root.join("out")
	}

	#[must_use]
	pub fn out_source_dir(&self) -> PathBuf {
		self.out_dir().join("Source")
	}

	#[must_use]
	pub fn out_image_dir(&self) -> PathBuf {
		self.out_dir().join("Image")
	}

	#[must_use]
	pub fn out_image_super_dir(&self) -> PathBuf {
		self.out_image_dir().join("super")
	}

	#[must_use]
	pub fn out_image_update_dir(&self) -> PathBuf {
		self.out_image_dir().join("update")
	}

	#[must_use]
	pub fn extract_dir(&self) -> PathBuf {
		self.root.join("extract")
	}

	#[must_use]
	pub fn partition_metadata_dir(&self) -> PathBuf {
		self.extract_dir().join("partition_metadata")
	}

	#[must_use]
	pub fn temp_dir(&self) -> PathBuf {
		self.root.join("temp")
	}

	#[must_use]
	pub fn logs_dir(&self) -> PathBuf {
		self.root.join("logs")
	}

	#[must_use]
	pub fn config_dir(&self) -> PathBuf {
		self.root.join("config")
	}

	#[must_use]
	pub fn config_path(&self) -> PathBuf {
		self.config_dir().join("project.json")
	}

	/// Loads `ProjectConfig`, defaulting if the file does not yet exist.
	pub fn load_config(&self) -> Result<ProjectConfig> {
		let path = self.config_path();
		if !path.is_file() {
			return Ok(ProjectConfig::default());
		}
		let raw = std::fs::read_to_string(path)?;
		Ok(serde_json::from_str(&raw)?)
	}

	/// Persists `config`, atomic at the file level (write-temp-then-rename).
	pub fn save_config(&self, config: &ProjectConfig) -> Result<()> {
		let path = self.config_path();
		let tmp = path.with_extension("json.tmp");
		let serialized = serde_json::to_string_pretty(config)?;
		std::fs::write(&tmp, serialized)?;
		std::fs::rename(&tmp, &path)?;
		Ok(())
	}

	/// Loads, mutates via `f`, then atomically persists the config.
	pub fn update_config(&self, f: impl FnOnce(&mut ProjectConfig)) -> Result<ProjectConfig> {
		let mut config = self.load_config()?;
		f(&mut config);
		self.save_config(&config)?;
		Ok(config)
	}

	/// Relativizes `path` against the project root, for portable
	/// PartitionMetadata references.
	#[must_use]
	pub fn relativize(&self, path: &Path) -> PathBuf {
		path.strip_prefix(&self.root).map(Path::to_path_buf).unwrap_or_else(|_| path.to_owned())
	}

	/// Resolves a project-relative path back to an absolute one.
	#[must_use]
	pub fn resolve(&self, relative: &Path) -> PathBuf {
		if relative.is_absolute() {
			relative.to_owned()
		} else {
			self.root.join(relative)
		}
	}

	/// Refuses a second concurrent pipeline run against this project.
	pub fn try_acquire_busy(&self) -> Result<()> {
		if self.busy.swap(true, Ordering::SeqCst) {
			Err(crate::error::ErrKind::Busy)
		} else {
			Ok(())
		}
	}

	pub fn release_busy(&self) {
		self.busy.store(false, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_open_creates_fixed_layout() {
		let dir = tempfile::tempdir().unwrap();
		let project = Project::open(dir.path()).unwrap();
		assert!(project.in_dir().is_dir());
		assert!(project.out_image_super_dir().is_dir());
		assert!(project.config_dir().is_dir());
	}

	#[test]
	fn test_config_roundtrip_is_atomic() {
		let dir = tempfile::tempdir().unwrap();
		let project = Project::open(dir.path()).unwrap();
		project
			.update_config(|c| {
				c.imported = true;
				c.input_type = Some(Route::Partition);
			})
			.unwrap();

		let loaded = project.load_config().unwrap();
		assert!(loaded.imported);
		assert_eq!(loaded.input_type, Some(Route::Partition));
		assert!(!project.config_path().with_extension("json.tmp").exists());
	}

	#[test]
	fn test_busy_flag_rejects_second_caller() {
		let dir = tempfile::tempdir().unwrap();
		let project = Project::open(dir.path()).unwrap();
		project.try_acquire_busy().unwrap();
		assert!(matches!(project.try_acquire_busy(), Err(crate::error::ErrKind::Busy)));
		project.release_busy();
		assert!(project.try_acquire_busy().is_ok());
	}

	#[test]
	fn test_relativize_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let project = Project::open(dir.path()).unwrap();
		let abs = project.in_dir().join("update.img");
		let rel = project.relativize(&abs);
		assert!(rel.is_relative());
		assert_eq!(project.resolve(&rel), abs);
	}
}
