//! Filesystem Codec Driver: ext4/erofs extract + build via external tools.
//!
//! Build operations follow the teacher's `MkfsErofsOptions::build_args`
//! pattern — a typed option struct with a `build_args()` builder rather than
//! ad-hoc string concatenation.

use std::path::{Path, PathBuf};

use crate::{
	cmd,
	error::{ErrKind, Result},
	registry::require_tool,
};

const PLACEHOLDER_NAME: &str = "EXTRACT_UNAVAILABLE.txt";

/// Options accepted by `build_erofs`, mirroring `mkfs.erofs`'s flag surface
/// the same way the teacher's `MkfsErofsOptions` does.
#[derive(Debug, Clone)]
pub struct ErofsBuildOptions {
	pub compression: Option<String>,
	pub size_hint_bytes: Option<u64>,
}

impl Default for ErofsBuildOptions {
	fn default() -> Self {
		Self { compression: Some("lz4hc,level=9".to_owned()), size_hint_bytes: None }
	}
}

impl ErofsBuildOptions {
	fn build_args(&self, target: &Path, source: &Path) -> Vec<String> {
		let mut args = Vec::new();
		if let Some(ref compression) = self.compression {
			args.push(format!("-z{compression}"));
		}
		args.push(target.to_string_lossy().into_owned());
		args.push(source.to_string_lossy().into_owned());
		args
	}
}

/// Options accepted by `build_ext4`.
#[derive(Debug, Clone, Default)]
pub struct Ext4BuildOptions {
	pub size_hint_bytes: Option<u64>,
}

/// Unpacks an ext4 image's tree into `dest_dir`. Where `extract_ext4` is not
/// available on the host, writes a distinctively named placeholder file
/// instead of fabricating a tree; callers must treat this as "extracted but
/// not readable".
pub fn extract_ext4(image: &Path, dest_dir: &Path) -> Result<PathBuf> {
	std::fs::create_dir_all(dest_dir)?;
	match require_tool("extract_ext4") {
		Ok(tool) => {
			cmd!(
				tool.to_string_lossy().as_ref(),
				image.to_string_lossy().as_ref(),
				dest_dir.to_string_lossy().as_ref()
			)?;
			Ok(dest_dir.to_owned())
		},
		Err(ErrKind::ToolMissing(name)) => {
			let placeholder = dest_dir.join(PLACEHOLDER_NAME);
			std::fs::write(
				&placeholder,
				format!(
					"extract_ext4 tool `{name}` not found; this tree is a placeholder, not the \
					 real partition contents.\n"
				),
			)?;
			Ok(dest_dir.to_owned())
		},
		Err(other) => Err(other),
	}
}

/// Unpacks an erofs image's tree into `dest_dir` via `extract_erofs`. Same
/// placeholder-on-missing-tool policy as `extract_ext4`.
pub fn extract_erofs(image: &Path, dest_dir: &Path) -> Result<PathBuf> {
	std::fs::create_dir_all(dest_dir)?;
	match require_tool("extract_erofs") {
		Ok(tool) => {
			cmd!(
				tool.to_string_lossy().as_ref(),
				"-i",
				image.to_string_lossy().as_ref(),
				dest_dir.to_string_lossy().as_ref()
			)?;
			Ok(dest_dir.to_owned())
		},
		Err(ErrKind::ToolMissing(name)) => {
			let placeholder = dest_dir.join(PLACEHOLDER_NAME);
			std::fs::write(
				&placeholder,
				format!(
					"extract_erofs tool `{name}` not found; this tree is a placeholder, not the \
					 real partition contents.\n"
				),
			)?;
			Ok(dest_dir.to_owned())
		},
		Err(other) => Err(other),
	}
}

/// Whether `dest_dir` holds only the placeholder written by a missing
/// extractor, in which case it cannot be used as a build source.
#[must_use]
pub fn is_placeholder_tree(dir: &Path) -> bool {
	dir.join(PLACEHOLDER_NAME).is_file()
}

/// Builds a raw ext4 image from `source_tree` at `out_path` via `make_ext4fs`.
pub fn build_ext4(source_tree: &Path, out_path: &Path, options: &Ext4BuildOptions) -> Result<PathBuf> {
	if is_placeholder_tree(source_tree) {
		return Err(ErrKind::UnsupportedFormat("ext4 (placeholder tree, no real contents)".to_owned()));
	}
	let tool = require_tool("make_ext4fs")?;
	let mut args: Vec<String> = Vec::new();
	if let Some(size) = options.size_hint_bytes {
		args.push("-l".to_owned());
		args.push(size.to_string());
	}
	args.push(out_path.to_string_lossy().into_owned());
	args.push(source_tree.to_string_lossy().into_owned());

	let tool_str = tool.to_string_lossy().into_owned();
	run_with_args(&tool_str, &args)?;

	if !out_path.is_file() {
		return Err(ErrKind::NoOutput(out_path.to_owned()));
	}
	Ok(out_path.to_owned())
}

/// Builds a raw erofs image from `source_tree` at `out_path` via `mkfs_erofs`.
pub fn build_erofs(source_tree: &Path, out_path: &Path, options: &ErofsBuildOptions) -> Result<PathBuf> {
	if is_placeholder_tree(source_tree) {
		return Err(ErrKind::UnsupportedFormat("erofs (placeholder tree, no real contents)".to_owned()));
	}
	let tool = require_tool("mkfs_erofs")?;
	let args = options.build_args(out_path, source_tree);
	let tool_str = tool.to_string_lossy().into_owned();
	run_with_args(&tool_str, &args)?;

	if !out_path.is_file() {
		return Err(ErrKind::NoOutput(out_path.to_owned()));
	}
	Ok(out_path.to_owned())
}

fn run_with_args(tool: &str, args: &[String]) -> Result<Vec<u8>> {
	let output = std::process::Command::new(tool).args(args).output().map_err(|_| ErrKind::ToolMissing(tool.to_owned()))?;
	if output.status.success() {
		Ok(output.stdout)
	} else {
		Err(ErrKind::ToolFailed {
			name: tool.to_owned(),
			exit_code: output.status.code().unwrap_or(-1),
			stderr_snippet: crate::error::truncate_stderr(&String::from_utf8_lossy(&output.stderr)),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_extract_ext4_writes_placeholder_when_tool_missing() {
		std::env::remove_var("RK_KITCHEN_TOOLS");
		std::env::set_var("PATH", "/nonexistent");
		crate::registry::tool_registry().redetect("extract_ext4");

		let dir = tempfile::tempdir().unwrap();
		let image = dir.path().join("system.img");
		std::fs::write(&image, b"fake").unwrap();
		let dest = dir.path().join("tree");

		extract_ext4(&image, &dest).unwrap();
		assert!(is_placeholder_tree(&dest));
	}

	#[test]
	fn test_build_ext4_refuses_placeholder_tree() {
		let dir = tempfile::tempdir().unwrap();
		let tree = dir.path().join("tree");
		std::fs::create_dir_all(&tree).unwrap();
		std::fs::write(tree.join(PLACEHOLDER_NAME), "x").unwrap();

		let err = build_ext4(&tree, &dir.path().join("out.img"), &Ext4BuildOptions::default()).unwrap_err();
		assert!(matches!(err, ErrKind::UnsupportedFormat(_)));
	}

	#[test]
	fn test_erofs_build_args_shape() {
		let opts = ErofsBuildOptions { compression: Some("lz4".to_owned()), size_hint_bytes: None };
		let args = opts.build_args(Path::new("/out.img"), Path::new("/tree"));
		assert_eq!(args, vec!["-zlz4".to_owned(), "/out.img".to_owned(), "/tree".to_owned()]);
	}
}
