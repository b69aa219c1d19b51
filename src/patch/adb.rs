//! ADB helpers supplementing the Boot Ramdisk Patcher's Assisted mode:
//! device discovery and the pull side of the push/patch/pull handshake.
//! The device-side protocol itself (the patching app) is out of scope —
//! only the interface to it is implemented here.

use std::path::{Path, PathBuf};

use crate::{error::ErrKind, registry::require_tool};

fn run_adb(serial: Option<&str>, args: &[&str]) -> crate::error::Result<std::process::Output> {
	let tool = require_tool("adb")?;
	let mut full_args: Vec<&str> = Vec::new();
	if let Some(serial) = serial {
		full_args.push("-s");
		full_args.push(serial);
	}
	full_args.extend_from_slice(args);

	std::process::Command::new(&tool).args(&full_args).output().map_err(|_| ErrKind::ToolMissing("adb".to_owned()))
}

/// Lists connected device serials, used to decide whether the Assisted
/// escape hatch is even reachable before attempting a push.
pub fn list_devices() -> crate::error::Result<Vec<String>> {
	let output = run_adb(None, &["devices"])?;
	if !output.status.success() {
		return Ok(Vec::new());
	}
	let stdout = String::from_utf8_lossy(&output.stdout);
	Ok(stdout
		.lines()
		.skip(1)
		.filter_map(|line| line.split('\t').next())
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(str::to_owned)
		.collect())
}

/// Finds a `magisk_patched*.img` file under the device's Download folder.
pub fn find_patched_image(serial: Option<&str>) -> crate::error::Result<String> {
	let output = run_adb(serial, &["shell", "ls", "/sdcard/Download/magisk_patched*.img"])?;
	let stdout = String::from_utf8_lossy(&output.stdout);
	let first = stdout.lines().next().map(str::trim).filter(|s| !s.is_empty());
	match first {
		Some(path) if output.status.success() => Ok(path.to_owned()),
		_ => Err(ErrKind::NoOutput(PathBuf::from("/sdcard/Download/magisk_patched*.img"))),
	}
}

pub fn pull(serial: Option<&str>, device_path: &str, dest: &Path) -> crate::error::Result<()> {
	let tool = require_tool("adb")?;
	let mut args: Vec<String> = Vec::new();
	if let Some(serial) = serial {
		args.push("-s".to_owned());
		args.push(serial.to_owned());
	}
	args.push("pull".to_owned());
	args.push(device_path.to_owned());
	args.push(dest.to_string_lossy().into_owned());

	let output = std::process::Command::new(&tool).args(&args).output().map_err(|_| ErrKind::ToolMissing("adb".to_owned()))?;
	if output.status.success() {
		Ok(())
	} else {
		Err(ErrKind::ToolFailed {
			name: "adb".to_owned(),
			exit_code: output.status.code().unwrap_or(-1),
			stderr_snippet: crate::error::truncate_stderr(&String::from_utf8_lossy(&output.stderr)),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_list_devices_without_adb_errs() {
		std::env::remove_var("RK_KITCHEN_TOOLS");
		std::env::set_var("PATH", "/nonexistent");
		crate::registry::tool_registry().redetect("adb");
		assert!(list_devices().is_err());
	}
}
