//! Partition Engine: single-partition extract/repack, holding per-partition
//! metadata (§4.e).

use std::{
	path::{Path, PathBuf},
	time::Instant,
};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
	codec::{filesystem, sparse},
	detect::{self, FsKind},
	dirty,
	error::{ErrKind, Result},
	project::{Project, ProjectConfig},
	util::CancelToken,
};

/// One record per partition extracted from a container (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMetadata {
	pub name: String,
	/// Relative-to-project path of the original bytes, for portability.
	pub original_image: PathBuf,
	pub original_is_sparse: bool,
	pub fs_kind: FsKind,
	/// Relative-to-project path of the extracted tree root.
	pub extracted_tree: PathBuf,
	pub original_size: u64,
}

fn metadata_path(project: &Project, name: &str) -> PathBuf {
	project.partition_metadata_dir().join(format!("{name}.json"))
}

pub fn load_metadata(project: &Project, name: &str) -> Result<PartitionMetadata> {
	let raw = std::fs::read_to_string(metadata_path(project, name))?;
	Ok(serde_json::from_str(&raw)?)
}

fn save_metadata(project: &Project, meta: &PartitionMetadata) -> Result<()> {
	std::fs::create_dir_all(project.partition_metadata_dir())?;
	std::fs::write(metadata_path(project, &meta.name), serde_json::to_string_pretty(meta)?)?;
	Ok(())
}

/// Lists known partition names in deterministic alphabetic order.
pub fn partition_index(project: &Project) -> Result<Vec<String>> {
	let dir = project.partition_metadata_dir();
	if !dir.is_dir() {
		return Ok(Vec::new());
	}
	let mut names: Vec<String> = std::fs::read_dir(dir)?
		.flatten()
		.filter_map(|e| e.path().file_stem().and_then(|s| s.to_str()).map(str::to_owned))
		.collect();
	names.sort();
	Ok(names)
}

/// Extracts `input_image` (named `name`) into `out/Source/<name>/`, writing
/// PartitionMetadata and an initial clean snapshot.
#[instrument(skip(project, cancel), fields(partition = %name))]
pub fn extract(project: &Project, name: &str, input_image: &Path, cancel: &CancelToken) -> Result<PartitionMetadata> {
	cancel.check()?;
	if !input_image.is_file() {
		return Err(ErrKind::InputNotFound(input_image.to_owned()));
	}

	let original_size = std::fs::metadata(input_image)?.len();
	let kind = detect::detect(input_image);
	let original_is_sparse = kind == detect::DetectedKind::SparsePartition;

	let raw_path = if original_is_sparse {
		info!("partition is sparse, transcoding to raw before inspection");
		let raw_path = project.temp_dir().join(format!("{name}.raw.img"));
		sparse::to_raw(input_image, &raw_path)?;
		raw_path
	} else {
		input_image.to_owned()
	};

	cancel.check()?;

	let fs_kind = detect::detect_fs_kind(&raw_path);
	let tree = project.out_source_dir().join(name);

	match fs_kind {
		FsKind::Ext4 => {
			filesystem::extract_ext4(&raw_path, &tree)?;
		},
		FsKind::Erofs => {
			filesystem::extract_erofs(&raw_path, &tree)?;
		},
		FsKind::Unknown => {
			// Still produce a tree directory so downstream snapshotting has
			// something to walk; build will refuse it via UnsupportedFormat.
			std::fs::create_dir_all(&tree)?;
		},
	}

	let meta = PartitionMetadata {
		name: name.to_owned(),
		original_image: project.relativize(input_image),
		original_is_sparse,
		fs_kind,
		extracted_tree: project.relativize(&tree),
		original_size,
	};
	save_metadata(project, &meta)?;

	let snap = dirty::snapshot(&tree)?;
	dirty::save_snapshot_for(project, name, snap)?;
	dirty::set(project, name, false)?;

	Ok(meta)
}

fn patched_output_path(project: &Project, name: &str, output_sparse: bool) -> PathBuf {
	let suffix = if output_sparse { "_patched.img" } else { "_patched.raw.img" };
	project.out_image_dir().join(format!("{name}{suffix}"))
}

/// Repacks `name`: copy-through if clean, otherwise rebuild via the matching
/// Filesystem Codec and honour `output_sparse` via the Sparse Codec.
#[instrument(skip(project, cancel, config), fields(partition = %name))]
pub fn repack(project: &Project, name: &str, config: &ProjectConfig, cancel: &CancelToken) -> Result<(PathBuf, String)> {
	cancel.check()?;
	let meta = load_metadata(project, name)?;
	let tree = project.resolve(&meta.extracted_tree);
	let dirty = dirty::auto_detect(project, name, &tree)?;

	let output_path = patched_output_path(project, name, config.output_sparse);

	if !dirty {
		let original_abs = project.resolve(&meta.original_image);
		if !original_abs.is_file() {
			return Err(ErrKind::InputNotFound(original_abs));
		}
		let message = crate::copy_through::run(&original_abs, &output_path, meta.original_is_sparse, config.output_sparse)?;
		return Ok((output_path, message));
	}

	cancel.check()?;

	if filesystem::is_placeholder_tree(&tree) {
		return Err(ErrKind::UnsupportedFormat(format!("{:?} (placeholder tree)", meta.fs_kind)));
	}

	let raw_path = if config.output_sparse {
		project.temp_dir().join(format!("{name}_rebuilt.raw.img"))
	} else {
		output_path.clone()
	};

	match meta.fs_kind {
		FsKind::Ext4 => {
			filesystem::build_ext4(&tree, &raw_path, &filesystem::Ext4BuildOptions::default())?;
		},
		FsKind::Erofs => {
			filesystem::build_erofs(&tree, &raw_path, &filesystem::ErofsBuildOptions::default())?;
		},
		FsKind::Unknown => {
			return Err(ErrKind::UnsupportedFormat("unknown".to_owned()));
		},
	}

	if config.output_sparse {
		sparse::to_sparse(&raw_path, &output_path)?;
	}

	Ok((output_path, format!("rebuilt {name} from {:?} tree", meta.fs_kind)))
}

/// Brings the raw image at `image_path` up to date with `name`'s extracted
/// tree: rebuilds it in place if dirty, leaves it untouched (reported as
/// copy-through) otherwise. Used by the Super Engine, whose `lpmake
/// --image` arguments read directly from the same path `unpack()` wrote —
/// a straight `copy_through::run(original, image_path, ..)` would be a
/// same-path copy, so the clean branch is a no-op rather than a copy.
#[instrument(skip(project, cancel), fields(partition = %name))]
pub fn sync_raw_image(project: &Project, name: &str, image_path: &Path, cancel: &CancelToken) -> Result<String> {
	cancel.check()?;
	let meta = load_metadata(project, name)?;
	let tree = project.resolve(&meta.extracted_tree);
	let dirty = dirty::auto_detect(project, name, &tree)?;

	if !dirty {
		if !image_path.is_file() {
			return Err(ErrKind::InputNotFound(image_path.to_owned()));
		}
		return Ok(format!("{}: {name} unchanged since extract", crate::copy_through::MARKER_PHRASE));
	}

	if filesystem::is_placeholder_tree(&tree) {
		return Err(ErrKind::UnsupportedFormat(format!("{:?} (placeholder tree)", meta.fs_kind)));
	}

	match meta.fs_kind {
		FsKind::Ext4 => {
			filesystem::build_ext4(&tree, image_path, &filesystem::Ext4BuildOptions::default())?;
		},
		FsKind::Erofs => {
			filesystem::build_erofs(&tree, image_path, &filesystem::ErofsBuildOptions::default())?;
		},
		FsKind::Unknown => {
			return Err(ErrKind::UnsupportedFormat("unknown".to_owned()));
		},
	}

	Ok(format!("rebuilt {name} from {:?} tree", meta.fs_kind))
}

/// Outcome of repacking one partition within a `repack_all` batch.
pub struct RepackOutcome {
	pub name: String,
	pub result: Result<(PathBuf, String)>,
}

/// Iterates the partition index in alphabetic order; a failure of one
/// partition does not abort the batch.
pub fn repack_all(project: &Project, config: &ProjectConfig, cancel: &CancelToken) -> Result<Vec<RepackOutcome>> {
	let names = partition_index(project)?;
	let mut outcomes = Vec::with_capacity(names.len());
	for name in names {
		cancel.check()?;
		let result = repack(project, &name, config, cancel);
		outcomes.push(RepackOutcome { name, result });
	}
	Ok(outcomes)
}
