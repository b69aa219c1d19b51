//! Sparse Codec Driver: sparse↔raw transcoding via external tools.
//!
//! No parsing of the sparse format is performed in-process; this is a thin,
//! typed wrapper around `simg2img`/`img2simg`, grounded on the same
//! "build typed args, shell out, check the output file" shape the teacher's
//! erofs builder uses.

use std::path::Path;

use crate::{
	cmd,
	error::{ErrKind, Result},
	registry::require_tool,
};

/// Converts a sparse image to raw bytes.
pub fn to_raw(sparse_in: &Path, raw_out: &Path) -> Result<()> {
	let tool = require_tool("simg2img")?;
	cmd!(tool.to_string_lossy().as_ref(), sparse_in.to_string_lossy().as_ref(), raw_out.to_string_lossy().as_ref())?;
	if !raw_out.is_file() {
		return Err(ErrKind::NoOutput(raw_out.to_owned()));
	}
	Ok(())
}

/// Converts a raw image to the Android sparse format.
pub fn to_sparse(raw_in: &Path, sparse_out: &Path) -> Result<()> {
	let tool = require_tool("img2simg")?;
	cmd!(
		tool.to_string_lossy().as_ref(),
		raw_in.to_string_lossy().as_ref(),
		sparse_out.to_string_lossy().as_ref()
	)?;
	if !sparse_out.is_file() {
		return Err(ErrKind::NoOutput(sparse_out.to_owned()));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fake_tool_dir(script: &str, name: &str) -> tempfile::TempDir {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join(name);
		std::fs::write(&path, script).unwrap();
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt as _;
			std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
		}
		dir
	}

	#[test]
	fn test_to_raw_missing_tool_errs() {
		std::env::remove_var("RK_KITCHEN_TOOLS");
		std::env::set_var("PATH", "/nonexistent");
		let dir = tempfile::tempdir().unwrap();
		let err = to_raw(&dir.path().join("in.img"), &dir.path().join("out.img")).unwrap_err();
		assert!(matches!(err, ErrKind::ToolMissing(_)));
	}

	#[test]
	fn test_to_raw_writes_output_via_fake_tool() {
		let tools = fake_tool_dir("#!/bin/sh\ncp \"$1\" \"$2\"\n", "simg2img");
		std::env::set_var("RK_KITCHEN_TOOLS", tools.path());
		crate::registry::tool_registry().redetect("simg2img");

		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("in.img");
		let dst = dir.path().join("out.img");
		std::fs::write(&src, b"hello").unwrap();

		to_raw(&src, &dst).unwrap();
		assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
		std::env::remove_var("RK_KITCHEN_TOOLS");
	}
}
