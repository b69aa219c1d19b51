//! Typed error kinds shared by every engine, plus the `TaskResult` envelope
//! returned by pipeline steps and engine operations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Distinct, caller-selectable error kinds.
///
/// Codec-level errors surface unchanged; engine-level code may translate a
/// [`ErrKind::ToolMissing`] into [`ErrKind::UnsupportedFormat`] where the
/// operation has a safer fallback (raw-when-sparse-requested copy-through).
#[derive(Debug, thiserror::Error)]
pub enum ErrKind {
	#[error("required tool `{0}` could not be located")]
	ToolMissing(String),

	#[error("`{name}` exited with code {exit_code}: {stderr_snippet}")]
	ToolFailed { name: String, exit_code: i32, stderr_snippet: String },

	#[error("tool reported success but produced no artifact at {0}")]
	NoOutput(PathBuf),

	#[error("input not found: {0}")]
	InputNotFound(PathBuf),

	#[error("no engine handles detected format `{0}`")]
	UnsupportedFormat(String),

	#[error("unrecognised patch toggle `{0}`")]
	UnknownPatchToggle(String),

	#[error("disk error (code {code}): the underlying storage reported a fault, not a software bug")]
	DiskIoCorrupt { code: i32 },

	#[error("a pipeline run is already in progress for this project")]
	Busy,

	#[error("operation cancelled")]
	Cancelled,

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ErrKind>;

/// Truncates tool stderr to roughly 200 bytes, as the error-handling design requires.
pub fn truncate_stderr(stderr: &str) -> String {
	const LIMIT: usize = 200;
	if stderr.len() <= LIMIT {
		stderr.trim().to_owned()
	} else {
		let mut end = LIMIT;
		while !stderr.is_char_boundary(end) {
			end -= 1;
		}
		format!("{}…", stderr[..end].trim())
	}
}

/// Inspects a raw OS error code for the disk-corrupt translation (§7, property 10).
///
/// Code 1392 is the canonical value carried over from the original toolchain's
/// "file or directory is corrupted" condition; `EIO`/`EROFS` are the Linux
/// analogues surfaced by the real Rockchip toolchain.
#[must_use]
pub fn classify_io_error(err: &std::io::Error) -> Option<ErrKind> {
	let code = err.raw_os_error()?;
	if code == 1392 || code == libc::EIO || code == libc::EROFS {
		Some(ErrKind::DiskIoCorrupt { code })
	} else {
		None
	}
}

/// The single return shape of every pipeline step and engine operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResult {
	Success { message: Option<String>, artifacts: Vec<PathBuf>, elapsed_ms: u64 },
	Error { message: String, elapsed_ms: u64 },
	Cancelled { elapsed_ms: u64 },
}

impl TaskResult {
	#[must_use]
	pub fn success(message: impl Into<String>, artifacts: Vec<PathBuf>, elapsed_ms: u64) -> Self {
		Self::Success { message: Some(message.into()), artifacts, elapsed_ms }
	}

	#[must_use]
	pub fn success_silent(artifacts: Vec<PathBuf>, elapsed_ms: u64) -> Self {
		Self::Success { message: None, artifacts, elapsed_ms }
	}

	#[must_use]
	pub fn error(message: impl Into<String>, elapsed_ms: u64) -> Self {
		Self::Error { message: message.into(), elapsed_ms }
	}

	#[must_use]
	pub fn cancelled(elapsed_ms: u64) -> Self {
		Self::Cancelled { elapsed_ms }
	}

	#[must_use]
	pub const fn ok(&self) -> bool {
		matches!(self, Self::Success { .. })
	}

	#[must_use]
	pub fn message(&self) -> Option<&str> {
		match self {
			Self::Success { message, .. } => message.as_deref(),
			Self::Error { message, .. } => Some(message),
			Self::Cancelled { .. } => None,
		}
	}

	#[must_use]
	pub fn from_err(err: &ErrKind, elapsed_ms: u64) -> Self {
		if matches!(err, ErrKind::Cancelled) {
			Self::cancelled(elapsed_ms)
		} else {
			Self::error(err.to_string(), elapsed_ms)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_truncate_stderr_short_untouched() {
		assert_eq!(truncate_stderr("boom"), "boom");
	}

	#[test]
	fn test_truncate_stderr_long_is_capped() {
		let long = "x".repeat(500);
		let out = truncate_stderr(&long);
		assert!(out.len() < 210);
		assert!(out.ends_with('…'));
	}

	#[test]
	fn test_classify_io_error_1392() {
		let err = std::io::Error::from_raw_os_error(1392);
		assert!(matches!(classify_io_error(&err), Some(ErrKind::DiskIoCorrupt { code: 1392 })));
	}

	#[test]
	fn test_classify_io_error_other_is_none() {
		let err = std::io::Error::from_raw_os_error(2);
		assert!(classify_io_error(&err).is_none());
	}
}
