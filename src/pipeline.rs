//! Pipeline Coordinator: the four-step state machine — Import → Extract →
//! Patch → Build (§4.m).

use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
	time::Instant,
};

use tracing::{info, instrument, warn};

use crate::{
	detect::{self, Route},
	engine::{firmware, partition, super_engine},
	error::{ErrKind, Result, TaskResult},
	patch::{avb, boot::BootPatchOptions},
	project::Project,
	util::{chunked_copy_with_cancel, CancelToken},
};

const SUPPORTED_PATCHES: &[&str] = &["disable_avb", "magisk", "debloat", "disable_dm_verity"];

fn elapsed_ms(start: Instant) -> u64 {
	u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn write_marker(path: &Path, contents: &str) -> Result<()> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	std::fs::write(path, contents)?;
	Ok(())
}

/// `import`: format-detect, classify into a route, chunked copy into `in/`
/// with progress logging and cancellation checks, then persist state.
#[instrument(skip(project, cancel))]
pub fn import(project: &Project, source_file: &Path, cancel: &CancelToken) -> TaskResult {
	let start = Instant::now();
	match import_inner(project, source_file, cancel) {
		Ok(dest) => TaskResult::success("import succeeded", vec![dest], elapsed_ms(start)),
		Err(err) => TaskResult::from_err(&err, elapsed_ms(start)),
	}
}

fn import_inner(project: &Project, source_file: &Path, cancel: &CancelToken) -> Result<PathBuf> {
	cancel.check()?;
	if !source_file.is_file() {
		return Err(ErrKind::InputNotFound(source_file.to_owned()));
	}

	let kind = detect::detect(source_file);
	let route = Route::from(kind);
	info!(?kind, ?route, "classified input");

	let file_name = source_file.file_name().ok_or_else(|| ErrKind::InputNotFound(source_file.to_owned()))?;
	let dest = project.in_dir().join(file_name);

	chunked_copy_with_cancel(source_file, &dest, cancel)?;

	project.update_config(|c| {
		c.imported = true;
		c.input_file = Some(project.relativize(&dest));
		c.rom_type = Some(format!("{kind:?}"));
		c.input_type = Some(route);
	})?;

	Ok(dest)
}

/// `extract`: dispatch to Firmware / Super / Partition Engine by route.
#[instrument(skip(project, cancel))]
pub fn extract(project: &Project, cancel: &CancelToken) -> TaskResult {
	let start = Instant::now();
	match extract_inner(project, cancel) {
		Ok(artifacts) => {
			let _ = write_marker(&project.extract_dir().join("EXTRACTED_OK.txt"), "extracted\n");
			// A fresh extract invalidates any patch/build done against the
			// previous tree (§4.m); re-running patch/build must start over.
			let _ = project.update_config(|c| {
				c.extracted = true;
				c.patched = false;
				c.built = false;
			});
			TaskResult::success("extract succeeded", artifacts, elapsed_ms(start))
		},
		Err(err) => TaskResult::from_err(&err, elapsed_ms(start)),
	}
}

fn extract_inner(project: &Project, cancel: &CancelToken) -> Result<Vec<PathBuf>> {
	cancel.check()?;
	let mut config = project.load_config()?;

	let input_file = config
		.input_file
		.as_deref()
		.map(|p| project.resolve(p))
		.ok_or_else(|| ErrKind::InputNotFound(project.in_dir()))?;
	if !input_file.is_file() {
		return Err(ErrKind::InputNotFound(input_file));
	}

	// Never guess silently: if input_type is missing, re-detect and persist
	// the result before routing.
	let route = match config.input_type {
		Some(route) => route,
		None => {
			warn!("input_type unknown, re-detecting before routing");
			let route = Route::from(detect::detect(&input_file));
			config.input_type = Some(route);
			project.save_config(&config)?;
			route
		},
	};

	match route {
		Route::FirmwareWrapper => {
			let dir = firmware::unpack(project, &input_file, cancel)?;
			Ok(vec![dir])
		},
		Route::Super => {
			let meta = super_engine::unpack(project, &input_file, cancel)?;
			// Each contained partition is extracted in turn; partition::extract
			// records its own clean snapshot, so super adds no dirty bookkeeping
			// of its own here.
			for desc in &meta.partitions {
				cancel.check()?;
				let image = project.out_image_super_dir().join(format!("{}.img", desc.name));
				partition::extract(project, &desc.name, &image, cancel)?;
			}
			Ok(vec![project.out_image_super_dir()])
		},
		Route::Partition => {
			let name = input_file.file_stem().and_then(|s| s.to_str()).unwrap_or("partition").to_owned();
			let meta = partition::extract(project, &name, &input_file, cancel)?;
			Ok(vec![project.resolve(&meta.extracted_tree)])
		},
	}
}

/// `patch`: applies the patch toggle map. Unknown keys fail the whole step
/// before any sub-patcher runs.
#[instrument(skip(project, cancel))]
pub fn patch(project: &Project, patches: &BTreeMap<String, bool>, cancel: &CancelToken) -> TaskResult {
	let start = Instant::now();
	match patch_inner(project, patches, cancel) {
		Ok(artifacts) => {
			let _ = write_marker(&project.extract_dir().join("PATCHED_OK.txt"), "patched\n");
			let _ = project.update_config(|c| c.patched = true);
			TaskResult::success("patches applied", artifacts, elapsed_ms(start))
		},
		Err(err) => TaskResult::from_err(&err, elapsed_ms(start)),
	}
}

fn patch_inner(project: &Project, patches: &BTreeMap<String, bool>, cancel: &CancelToken) -> Result<Vec<PathBuf>> {
	cancel.check()?;

	for key in patches.keys() {
		if !SUPPORTED_PATCHES.contains(&key.as_str()) {
			return Err(ErrKind::UnknownPatchToggle(key.clone()));
		}
	}

	let config = project.load_config()?;
	let mut artifacts = Vec::new();

	if patches.get("disable_avb").copied().unwrap_or(false) {
		cancel.check()?;
		let scan_dir = vbmeta_scan_dir(project, &config);
		artifacts.extend(avb::disable_avb(&scan_dir, config.slot_mode, cancel)?);
	}

	if patches.get("magisk").copied().unwrap_or(false) {
		cancel.check()?;
		let boot_dir = vbmeta_scan_dir(project, &config);
		let boot_image = boot_dir.join("boot.img");
		if boot_image.is_file() {
			let output_dir = project.out_image_dir().join("magisk_patched");
			let output_path = output_dir.join("boot_magisk.img");
			let patched = crate::patch::boot::patch_boot(
				&boot_image,
				&output_path,
				&output_dir,
				&project.temp_dir(),
				BootPatchOptions::default(),
				cancel,
			)?;
			artifacts.push(patched);
		} else {
			return Err(ErrKind::InputNotFound(boot_image));
		}
	}

	// debloat is handled externally (APK metadata scanning / debloater flow
	// are out of scope); disable_dm_verity is a recognised but reserved key.

	Ok(artifacts)
}

fn vbmeta_scan_dir(project: &Project, config: &crate::project::ProjectConfig) -> PathBuf {
	match config.input_type {
		Some(Route::FirmwareWrapper) => project.extract_dir().join("partitions"),
		Some(Route::Super) => project.out_image_super_dir(),
		_ => project.in_dir(),
	}
}

/// `build`: repacks super first if it was extracted, then routes to the
/// original container's repack. Validates at least one `.img` artifact.
#[instrument(skip(project, cancel))]
pub fn build(project: &Project, selected_partition: Option<&str>, cancel: &CancelToken) -> TaskResult {
	let start = Instant::now();
	match build_inner(project, selected_partition, cancel) {
		Ok(artifacts) => {
			let _ = write_marker(&project.out_dir().join("BUILD_OK.txt"), "built\n");
			let _ = project.update_config(|c| c.built = true);
			TaskResult::success("build succeeded", artifacts, elapsed_ms(start))
		},
		Err(err) => TaskResult::from_err(&err, elapsed_ms(start)),
	}
}

fn build_inner(project: &Project, selected_partition: Option<&str>, cancel: &CancelToken) -> Result<Vec<PathBuf>> {
	cancel.check()?;
	let config = project.load_config()?;
	let mut artifacts = Vec::new();

	if super_engine::has_super_metadata(project) {
		let super_meta = super_engine::load_metadata(project)?;
		for desc in &super_meta.partitions {
			cancel.check()?;
			let image_path = project.out_image_super_dir().join(format!("{}.img", desc.name));
			match partition::sync_raw_image(project, &desc.name, &image_path, cancel) {
				Ok(outcome) => info!(partition = %desc.name, outcome, "partition ready for super rebuild"),
				Err(err) => warn!(partition = %desc.name, error = %err, "partition repack failed before super rebuild"),
			}
		}

		info!("super metadata present, rebuilding super before the outer container");
		let (super_path, _message) = super_engine::repack(project, &config, cancel)?;
		artifacts.push(super_path);
	}

	cancel.check()?;

	match config.input_type {
		Some(Route::FirmwareWrapper) => {
			let path = firmware::repack(project, "update_patched.img", cancel)?;
			artifacts.push(path);
		},
		Some(Route::Super) => {
			// Super was already rebuilt above; nothing further to do unless
			// it was somehow skipped.
			if artifacts.is_empty() {
				let (path, _) = super_engine::repack(project, &config, cancel)?;
				artifacts.push(path);
			}
		},
		Some(Route::Partition) => {
			if let Some(name) = selected_partition {
				let (path, _) = partition::repack(project, name, &config, cancel)?;
				artifacts.push(path);
			} else {
				let outcomes = partition::repack_all(project, &config, cancel)?;
				if outcomes.is_empty() {
					return Err(ErrKind::InputNotFound(project.partition_metadata_dir()));
				}
				for outcome in outcomes {
					match outcome.result {
						Ok((path, _)) => artifacts.push(path),
						Err(err) => warn!(partition = %outcome.name, error = %err, "partition repack failed"),
					}
				}
			}
		},
		None => return Err(ErrKind::UnsupportedFormat("unknown (never extracted)".to_owned())),
	}

	let has_output = glob::glob(&format!("{}/**/*.img", project.out_image_dir().display()))
		.map(|mut it| it.next().is_some())
		.unwrap_or(false);
	if !has_output {
		return Err(ErrKind::NoOutput(project.out_image_dir()));
	}

	Ok(artifacts)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_patch_rejects_unknown_toggle() {
		let dir = tempfile::tempdir().unwrap();
		let project = Project::open(dir.path()).unwrap();

		let mut toggles = BTreeMap::new();
		toggles.insert("disable_avb".to_owned(), true);
		toggles.insert("super_magical_hack".to_owned(), true);

		let result = patch(&project, &toggles, &CancelToken::new());
		match result {
			TaskResult::Error { message, .. } => assert!(message.contains("super_magical_hack")),
			other => panic!("expected Error, got {other:?}"),
		}
		assert!(!project.load_config().unwrap().patched);
	}

	#[test]
	fn test_import_cancel_leaves_imported_false() {
		let dir = tempfile::tempdir().unwrap();
		let project = Project::open(dir.path()).unwrap();
		let src = dir.path().join("update.img");
		std::fs::write(&src, vec![0_u8; 1024]).unwrap();

		let cancel = CancelToken::new();
		cancel.cancel();
		let result = import(&project, &src, &cancel);
		assert!(matches!(result, TaskResult::Cancelled { .. }));
		assert!(!project.load_config().unwrap().imported);
		assert!(!project.in_dir().join("update.img").exists());
	}

	#[test]
	fn test_import_then_extract_partition_route() {
		let dir = tempfile::tempdir().unwrap();
		let project = Project::open(dir.path()).unwrap();
		let src = dir.path().join("system.img");
		std::fs::write(&src, vec![0_u8; 4096]).unwrap();

		let result = import(&project, &src, &CancelToken::new());
		assert!(result.ok());

		let result = extract(&project, &CancelToken::new());
		assert!(result.ok(), "{result:?}");
		assert!(project.extract_dir().join("EXTRACTED_OK.txt").is_file());
	}
}
