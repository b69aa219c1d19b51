//! Format Detector: magic-byte + filename classification of image files.
//!
//! Detection never loads more than sixteen bytes plus the two small magic
//! probes (`is_ext4`, `is_erofs`); it is safe to call on files larger than
//! available RAM.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::util::read_at;

const ROCKCHIP_MAGICS: [&[u8; 4]; 3] = [b"RKFW", b"RKAF", b"RKIM"];
const SPARSE_MAGIC: [u8; 4] = [0x3A, 0xFF, 0x26, 0xED];
const EXT4_MAGIC_OFFSET: u64 = 0x438;
const EXT4_MAGIC: [u8; 2] = [0x53, 0xEF];
const EROFS_MAGIC_OFFSET: u64 = 1024;
const EROFS_MAGIC: [u8; 4] = [0xE2, 0xE1, 0xF5, 0xE0];

/// Classification tag produced by [`detect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedKind {
	FirmwareWrapper,
	Super,
	SparsePartition,
	RawPartition,
	Unknown,
}

/// Filesystem kind detected inside a raw partition image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsKind {
	Ext4,
	Erofs,
	Unknown,
}

/// Pipeline route tag. A tagged variant over the three container shapes,
/// matched exhaustively by the Pipeline Coordinator rather than dispatched by
/// string (the source's `"rockchip_update"` / `"android_super"` /
/// `"partition_image"` tags, re-architected per the redesign notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
	FirmwareWrapper,
	Super,
	Partition,
}

impl From<DetectedKind> for Route {
	fn from(kind: DetectedKind) -> Self {
		match kind {
			DetectedKind::FirmwareWrapper => Self::FirmwareWrapper,
			DetectedKind::Super => Self::Super,
			// Sparse, raw, and unrecognised inputs are all decomposed as a
			// single partition image; unknown is routed here too since the
			// source's default policy treats unknown as partition_image.
			DetectedKind::SparsePartition | DetectedKind::RawPartition | DetectedKind::Unknown => {
				Self::Partition
			},
		}
	}
}

/// Classifies `path`, first matches wins: magic bytes, then filename.
pub fn detect(path: &Path) -> DetectedKind {
	let header = read_at(path, 0, 16).unwrap_or_default();

	if header.len() >= 4 && ROCKCHIP_MAGICS.iter().any(|magic| &header[..4] == magic.as_slice()) {
		return DetectedKind::FirmwareWrapper;
	}
	if header.len() >= 4 && header[..4] == SPARSE_MAGIC {
		return DetectedKind::SparsePartition;
	}

	let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_lowercase();

	if name.contains("release_update") || (name.contains("update") && name.ends_with(".img")) {
		return DetectedKind::FirmwareWrapper;
	}
	if name.contains("super") && name.ends_with(".img") {
		return DetectedKind::Super;
	}
	if name.ends_with(".img") {
		return DetectedKind::RawPartition;
	}
	DetectedKind::Unknown
}

/// Reads two bytes at offset 0x438 and compares to the ext4 superblock magic.
#[must_use]
pub fn is_ext4(path: &Path) -> bool {
	read_at(path, EXT4_MAGIC_OFFSET, 2).map(|b| b == EXT4_MAGIC).unwrap_or(false)
}

/// Reads four bytes at offset 1024 and compares to the little-endian erofs magic.
#[must_use]
pub fn is_erofs(path: &Path) -> bool {
	read_at(path, EROFS_MAGIC_OFFSET, 4).map(|b| b == EROFS_MAGIC).unwrap_or(false)
}

/// Detects the filesystem kind of a raw (non-sparse) partition image.
#[must_use]
pub fn detect_fs_kind(path: &Path) -> FsKind {
	if is_ext4(path) {
		FsKind::Ext4
	} else if is_erofs(path) {
		FsKind::Erofs
	} else {
		FsKind::Unknown
	}
}

/// Diagnostic summary bundling the facts an operator would want before
/// ingesting a file; used by the `import` CLI subcommand to describe what it
/// is about to do.
#[derive(Debug, Clone, Serialize)]
pub struct RomInfo {
	pub path: std::path::PathBuf,
	pub size: u64,
	pub kind: DetectedKind,
	pub is_sparse: bool,
	pub is_rockchip_wrapper: bool,
}

pub fn rom_info(path: &Path) -> std::io::Result<RomInfo> {
	let size = std::fs::metadata(path)?.len();
	let header = read_at(path, 0, 4).unwrap_or_default();
	let is_sparse = header == SPARSE_MAGIC;
	let is_rockchip_wrapper =
		header.len() == 4 && ROCKCHIP_MAGICS.iter().any(|magic| header == magic.as_slice());
	Ok(RomInfo { path: path.to_owned(), size, kind: detect(path), is_sparse, is_rockchip_wrapper })
}

/// Searches `folder` for a ROM file in priority order, the supplemental
/// convenience the source exposes for callers that only have a directory.
#[must_use]
pub fn find_rom_in_dir(folder: &Path) -> Option<(std::path::PathBuf, DetectedKind)> {
	if !folder.is_dir() {
		return None;
	}
	for candidate in ["update.img", "release_update.img", "super.img"] {
		let p = folder.join(candidate);
		if p.is_file() {
			let kind = detect(&p);
			return Some((p, kind));
		}
	}

	let mut fallback = None;
	let entries = std::fs::read_dir(folder).ok()?;
	for entry in entries.flatten() {
		let p = entry.path();
		if p.extension().and_then(|e| e.to_str()) != Some("img") {
			continue;
		}
		let kind = detect(&p);
		if kind == DetectedKind::FirmwareWrapper {
			return Some((p, kind));
		}
		if kind != DetectedKind::Unknown && fallback.is_none() {
			fallback = Some((p, kind));
		}
	}
	fallback
}
