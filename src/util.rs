//! Small shared helpers: the external-tool invocation macro, cancellation
//! plumbing, and the chunked-copy / zero-pad primitives the engines build on.

use std::{
	fs::{File, OpenOptions},
	io::{Read, Seek, SeekFrom, Write},
	path::Path,
	sync::atomic::{AtomicBool, Ordering},
	sync::Arc,
	time::Duration,
};

use crate::error::{ErrKind, Result};

/// Runs an external tool, returning `Ok(stdout)` on a zero exit status and a
/// [`crate::error::ErrKind::ToolFailed`] (stderr truncated) otherwise.
///
/// Mirrors the teacher's `run!` macro, generalized to a typed error instead
/// of an opaque report, since engine code needs to match on the failure kind.
#[macro_export]
macro_rules! cmd {
	($name:expr $(, $arg:expr)* $(,)?) => {{
		let name: ::std::string::String = ::std::string::ToString::to_string(&$name);
		match ::std::process::Command::new(&name) $(.arg($arg))* .output() {
			Ok(out) if out.status.success() => Ok(out.stdout),
			Ok(out) => Err($crate::error::ErrKind::ToolFailed {
				name: name.to_string(),
				exit_code: out.status.code().unwrap_or(-1),
				stderr_snippet: $crate::error::truncate_stderr(&String::from_utf8_lossy(&out.stderr)),
			}),
			Err(_) => Err($crate::error::ErrKind::ToolMissing(name.to_string())),
		}
	}};
}

/// A cooperative cancellation flag threaded through long operations.
///
/// Checked between I/O chunks, at the top of per-partition loop iterations,
/// and immediately after each external-tool process exits.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}

	/// Returns `Err(ErrKind::Cancelled)` if the token has been tripped.
	pub fn check(&self) -> Result<()> {
		if self.is_cancelled() {
			Err(ErrKind::Cancelled)
		} else {
			Ok(())
		}
	}
}

/// Default timeout for codec-level tool invocations (§5).
pub const CODEC_TIMEOUT: Duration = Duration::from_secs(600);
/// Default timeout for firmware-wrapper repack, which handles much larger payloads.
pub const FIRMWARE_TIMEOUT: Duration = Duration::from_secs(1800);

const IMPORT_CHUNK: usize = 10 * 1024 * 1024;

/// Copies `src` to `dest` in 10MB chunks, logging progress at 20% increments
/// and checking `cancel` between chunks. On cancellation the partial
/// destination file is removed and [`ErrKind::Cancelled`] is returned.
pub fn chunked_copy_with_cancel(src: &Path, dest: &Path, cancel: &CancelToken) -> Result<()> {
	let mut reader = File::open(src)?;
	let file_size = reader.metadata()?.len();
	let mut writer = File::create(dest)?;

	let mut buf = vec![0_u8; IMPORT_CHUNK];
	let mut copied: u64 = 0;
	let mut last_logged_bucket = -1_i64;

	loop {
		if cancel.is_cancelled() {
			drop(writer);
			let _ = std::fs::remove_file(dest);
			return Err(ErrKind::Cancelled);
		}

		let n = reader.read(&mut buf)?;
		if n == 0 {
			break;
		}
		writer.write_all(&buf[..n])?;
		copied += n as u64;

		if file_size > 0 {
			#[allow(clippy::cast_possible_wrap, clippy::arithmetic_side_effects)]
			let pct = (copied * 100 / file_size) as i64;
			let bucket = pct / 20;
			if bucket != last_logged_bucket {
				tracing::info!(progress = pct, "import progress");
				last_logged_bucket = bucket;
			}
		}
	}

	Ok(())
}

/// Grows or truncates `path` until it is exactly `target_len` long, padding
/// with zero bytes. Used by the AVB Patcher, which must preserve the
/// original partition extent exactly.
pub fn zero_pad_to(path: &Path, target_len: u64) -> Result<()> {
	let file = OpenOptions::new().write(true).open(path)?;
	file.set_len(target_len)?;
	Ok(())
}

/// Seeks to `offset` and reads up to `len` bytes, used by the Format
/// Detector's small magic-byte probes.
pub fn read_at(path: &Path, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
	let mut file = File::open(path)?;
	file.seek(SeekFrom::Start(offset))?;
	let mut buf = vec![0_u8; len];
	let read = file.read(&mut buf)?;
	buf.truncate(read);
	Ok(buf)
}

#[must_use]
pub fn human_size(bytes: u64) -> String {
	bytesize::ByteSize(bytes).to_string_as(true)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write as _;

	#[test]
	fn test_chunked_copy_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("src.bin");
		let dest = dir.path().join("dest.bin");
		std::fs::write(&src, vec![7_u8; 1024]).unwrap();

		let cancel = CancelToken::new();
		chunked_copy_with_cancel(&src, &dest, &cancel).unwrap();

		assert_eq!(std::fs::read(&dest).unwrap(), vec![7_u8; 1024]);
	}

	#[test]
	fn test_chunked_copy_cancel_removes_partial() {
		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("src.bin");
		let dest = dir.path().join("dest.bin");
		std::fs::write(&src, vec![0_u8; 1024]).unwrap();

		let cancel = CancelToken::new();
		cancel.cancel();

		let err = chunked_copy_with_cancel(&src, &dest, &cancel).unwrap_err();
		assert!(matches!(err, ErrKind::Cancelled));
		assert!(!dest.exists());
	}

	#[test]
	fn test_zero_pad_grows_file() {
		let dir = tempfile::tempdir().unwrap();
		let f = dir.path().join("f.bin");
		{
			let mut file = File::create(&f).unwrap();
			file.write_all(&[1, 2, 3]).unwrap();
		}
		zero_pad_to(&f, 10).unwrap();
		let data = std::fs::read(&f).unwrap();
		assert_eq!(data.len(), 10);
		assert_eq!(&data[..3], &[1, 2, 3]);
		assert!(data[3..].iter().all(|&b| b == 0));
	}

	#[test]
	fn test_read_at_offset() {
		let dir = tempfile::tempdir().unwrap();
		let f = dir.path().join("f.bin");
		std::fs::write(&f, b"0123456789").unwrap();
		assert_eq!(read_at(&f, 4, 3).unwrap(), b"456");
	}
}
