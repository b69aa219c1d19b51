//! Super Engine: dynamic-partition image unpack/repack, holding super
//! metadata (§4.f).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
	cmd, dirty,
	error::{ErrKind, Result},
	project::{Project, ProjectConfig, SuperResizeMode},
	registry::require_tool,
	util::CancelToken,
};

/// One logical partition's descriptor inside a dynamic-partition image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperPartitionDescriptor {
	pub name: String,
	pub size: u64,
	pub group: String,
	pub read_only: bool,
}

/// Ordered sequence of partition descriptors plus the original super image
/// path (relative-to-project, matching `PartitionMetadata`'s convention).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperMetadata {
	pub partitions: Vec<SuperPartitionDescriptor>,
	pub original_image: PathBuf,
}

fn metadata_path(project: &Project) -> PathBuf {
	project.extract_dir().join("super_metadata.json")
}

pub fn load_metadata(project: &Project) -> Result<SuperMetadata> {
	let raw = std::fs::read_to_string(metadata_path(project))?;
	Ok(serde_json::from_str(&raw)?)
}

fn save_metadata(project: &Project, meta: &SuperMetadata) -> Result<()> {
	std::fs::write(metadata_path(project), serde_json::to_string_pretty(meta)?)?;
	Ok(())
}

#[must_use]
pub fn has_super_metadata(project: &Project) -> bool {
	for candidate in [
		project.out_image_super_dir().join("super_metadata.json"),
		project.extract_dir().join("super_metadata.json"),
		project.out_image_update_dir().join("metadata").join("super_metadata.json"),
	] {
		if candidate.is_file() {
			return true;
		}
	}
	false
}

/// Unpacks `super_image` via `lpunpack`, deriving per-partition descriptors
/// from the tool's listing output and extracting each into a Partition
/// Engine extract call performed by the caller (Pipeline Coordinator).
#[instrument(skip(project, cancel))]
pub fn unpack(project: &Project, super_image: &std::path::Path, cancel: &CancelToken) -> Result<SuperMetadata> {
	cancel.check()?;
	if !super_image.is_file() {
		return Err(ErrKind::InputNotFound(super_image.to_owned()));
	}

	let tool = require_tool("lpunpack")?;
	let out_dir = project.out_image_super_dir();
	std::fs::create_dir_all(&out_dir)?;

	cmd!(
		tool.to_string_lossy().as_ref(),
		super_image.to_string_lossy().as_ref(),
		out_dir.to_string_lossy().as_ref()
	)?;
	cancel.check()?;

	let mut partitions = Vec::new();
	for entry in std::fs::read_dir(&out_dir)?.flatten() {
		let path = entry.path();
		if path.extension().and_then(|e| e.to_str()) != Some("img") {
			continue;
		}
		let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_owned();
		let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
		partitions.push(SuperPartitionDescriptor { name, size, group: "default".to_owned(), read_only: false });
	}
	partitions.sort_by(|a, b| a.name.cmp(&b.name));

	if partitions.is_empty() {
		return Err(ErrKind::NoOutput(out_dir));
	}

	let meta = SuperMetadata { partitions, original_image: project.relativize(super_image) };
	save_metadata(project, &meta)?;
	Ok(meta)
}

/// Repacks the super image via `lpmake`, honouring `resize_mode`. If every
/// contained partition is clean and the original super image is still
/// present, the rebuild is skipped in favour of copying (or
/// sparse-transcoding) the original bytes.
#[instrument(skip(project, config, cancel))]
pub fn repack(project: &Project, config: &ProjectConfig, cancel: &CancelToken) -> Result<(PathBuf, String)> {
	cancel.check()?;
	let meta = load_metadata(project)?;
	let output_path = project.out_image_dir().join(if config.output_sparse { "super.img" } else { "super.raw.img" });

	let all_clean = meta.partitions.iter().all(|p| !dirty::is_dirty(project, &p.name));
	let original_abs = project.resolve(&meta.original_image);

	if all_clean && original_abs.is_file() {
		let message = crate::copy_through::run(&original_abs, &output_path, true, config.output_sparse)?;
		return Ok((output_path, message));
	}

	cancel.check()?;
	let tool = require_tool("lpmake")?;

	let sizes = resolve_sizes(project, &meta, config.super_resize_mode);

	let mut args: Vec<String> = vec!["--output".to_owned(), output_path.to_string_lossy().into_owned()];
	for (desc, size) in meta.partitions.iter().zip(sizes.iter()) {
		let image_path = project.out_image_super_dir().join(format!("{}.img", desc.name));
		args.push("--partition".to_owned());
		args.push(format!("{}:{}:{size}:{}", desc.name, if desc.read_only { "readonly" } else { "none" }, desc.group));
		args.push("--image".to_owned());
		args.push(format!("{}={}", desc.name, image_path.display()));
	}

	let tool_str = tool.to_string_lossy().into_owned();
	let output = std::process::Command::new(&tool_str)
		.args(&args)
		.output()
		.map_err(|_| ErrKind::ToolMissing(tool_str.clone()))?;
	if !output.status.success() {
		return Err(ErrKind::ToolFailed {
			name: tool_str,
			exit_code: output.status.code().unwrap_or(-1),
			stderr_snippet: crate::error::truncate_stderr(&String::from_utf8_lossy(&output.stderr)),
		});
	}
	if !output_path.is_file() {
		return Err(ErrKind::NoOutput(output_path));
	}

	info!("super image rebuilt with resize_mode={:?}", config.super_resize_mode);
	Ok((output_path, "rebuilt super image".to_owned()))
}

fn resolve_sizes(project: &Project, meta: &SuperMetadata, mode: SuperResizeMode) -> Vec<u64> {
	meta.partitions
		.iter()
		.map(|desc| match mode {
			SuperResizeMode::Keep => desc.size,
			SuperResizeMode::Shrink => actual_size(project, &desc.name).unwrap_or(desc.size),
			SuperResizeMode::Auto => {
				let actual = actual_size(project, &desc.name).unwrap_or(desc.size);
				if actual > desc.size {
					// Bounded growth policy: round up to the next 16MiB boundary.
					const GRANULARITY: u64 = 16 * 1024 * 1024;
					actual.div_ceil(GRANULARITY) * GRANULARITY
				} else {
					desc.size
				}
			},
		})
		.collect()
}

fn actual_size(project: &Project, partition_name: &str) -> Option<u64> {
	let image = project.out_image_super_dir().join(format!("{partition_name}.img"));
	std::fs::metadata(image).ok().map(|m| m.len())
}
