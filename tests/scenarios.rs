//! End-to-end pipeline scenarios, each driving `import`/`extract`/`patch`/
//! `build` against a fresh project with fake shell-script tools on a
//! workspace-local `RK_KITCHEN_TOOLS` directory.

use std::{
	collections::BTreeMap,
	path::Path,
	sync::Mutex,
};

use assert_fs::prelude::PathChild as _;
use rk_kitchen::{
	error::{ErrKind, TaskResult},
	pipeline,
	project::Project,
	registry::tool_registry,
	util::CancelToken,
};

// `RK_KITCHEN_TOOLS` and the tool registry's cache are process-global;
// scenarios that touch either run one at a time.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn fake_tool(dir: &Path, name: &str, script: &str) {
	let path = dir.join(name);
	std::fs::write(&path, script).unwrap();
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt as _;
		std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
	}
}

fn use_tools(dir: &Path) {
	std::env::set_var("RK_KITCHEN_TOOLS", dir);
	tool_registry().redetect_all();
}

fn clear_tools() {
	std::env::remove_var("RK_KITCHEN_TOOLS");
	tool_registry().redetect_all();
}

fn assert_ok(result: &TaskResult) {
	assert!(result.ok(), "expected success, got {result:?}");
}

#[test]
fn scenario_s1_firmware_import_extract_build_with_no_patches() {
	let _guard = ENV_LOCK.lock().unwrap();
	let tools = tempfile::tempdir().unwrap();
	fake_tool(tools.path(), "img_unpack", "#!/bin/sh\nmkdir -p \"$2\"\ncp \"$1\" \"$2/boot.img\"\n");
	fake_tool(tools.path(), "rkImageMaker", "#!/bin/sh\nshift 2\nshift\ntouch \"$1\"\n");
	use_tools(tools.path());

	let project_dir = assert_fs::TempDir::new().unwrap();
	let project = Project::open(project_dir.path()).unwrap();

	let src_dir = assert_fs::TempDir::new().unwrap();
	let src = src_dir.child("update.img");
	let mut content = b"RKFW".to_vec();
	content.resize(4096, 0);
	std::fs::write(src.path(), content).unwrap();
	let src = src.path().to_owned();

	assert_ok(&pipeline::import(&project, &src, &CancelToken::new()));
	assert_ok(&pipeline::extract(&project, &CancelToken::new()));
	assert!(project.extract_dir().join("EXTRACTED_OK.txt").is_file());

	assert_ok(&pipeline::patch(&project, &BTreeMap::new(), &CancelToken::new()));

	assert_ok(&pipeline::build(&project, None, &CancelToken::new()));
	assert!(project.out_dir().join("BUILD_OK.txt").is_file());
	assert!(glob::glob(&format!("{}/**/*.img", project.out_image_dir().display())).unwrap().next().is_some());

	clear_tools();
}

#[test]
fn scenario_s2_super_partial_dirty_rebuilds_only_super() {
	let _guard = ENV_LOCK.lock().unwrap();
	let tools = tempfile::tempdir().unwrap();
	// `system` carries a real ext4 superblock magic so a dirty rebuild has a
	// filesystem kind to dispatch on; `vendor` stays an unrecognised blob,
	// which is fine since it is never touched (left clean, copy-through).
	fake_tool(
		tools.path(),
		"lpunpack",
		"#!/bin/sh\nmkdir -p \"$2\"\n\
		 dd if=/dev/zero of=\"$2/system.img\" bs=4096 count=1 2>/dev/null\n\
		 printf '\\123\\357' | dd of=\"$2/system.img\" bs=1 seek=1080 conv=notrunc 2>/dev/null\n\
		 dd if=/dev/zero of=\"$2/vendor.img\" bs=4096 count=1 2>/dev/null\n",
	);
	fake_tool(tools.path(), "extract_ext4", "#!/bin/sh\nmkdir -p \"$2\"\necho original > \"$2/marker.txt\"\n");
	fake_tool(tools.path(), "make_ext4fs", "#!/bin/sh\nfind \"$2\" -type f -exec cat {} + > \"$1\"\n");
	fake_tool(tools.path(), "lpmake", "#!/bin/sh\nshift\ntouch \"$1\"\n");
	use_tools(tools.path());

	let project_dir = tempfile::tempdir().unwrap();
	let project = Project::open(project_dir.path()).unwrap();

	let src_dir = tempfile::tempdir().unwrap();
	let src = src_dir.path().join("super.img");
	std::fs::write(&src, vec![0_u8; 2048]).unwrap();

	assert_ok(&pipeline::import(&project, &src, &CancelToken::new()));
	assert_ok(&pipeline::extract(&project, &CancelToken::new()));

	let vendor_image = project.out_image_super_dir().join("vendor.img");
	let vendor_before = std::fs::read(&vendor_image).unwrap();

	// Dirty exactly one contained partition's extracted tree.
	let system_tree = project.out_source_dir().join("system");
	std::fs::write(system_tree.join("injected.txt"), b"edited").unwrap();

	assert_ok(&pipeline::build(&project, None, &CancelToken::new()));
	assert!(project.out_dir().join("BUILD_OK.txt").is_file());

	// The edit made it into the rebuilt partition image `lpmake` reads from...
	let system_image = project.out_image_super_dir().join("system.img");
	let system_after = std::fs::read(&system_image).unwrap();
	assert!(
		system_after.windows(6).any(|w| w == b"edited"),
		"rebuilt system.img should contain the edited tree contents"
	);

	// ...while the untouched partition was left exactly as extract wrote it,
	// i.e. reported copy-through rather than silently dropped or rebuilt.
	let vendor_after = std::fs::read(&vendor_image).unwrap();
	assert_eq!(vendor_before, vendor_after);

	clear_tools();
}

#[test]
fn scenario_s3_raw_partition_avb_patch_sparse_build() {
	let _guard = ENV_LOCK.lock().unwrap();
	let tools = tempfile::tempdir().unwrap();
	fake_tool(tools.path(), "img2simg", "#!/bin/sh\nprintf '\\072\\377\\046\\355' > \"$2\"\ndd if=/dev/zero bs=1 count=60 >> \"$2\" 2>/dev/null\n");
	use_tools(tools.path());

	let project_dir = tempfile::tempdir().unwrap();
	let project = Project::open(project_dir.path()).unwrap();

	let src_dir = tempfile::tempdir().unwrap();
	let src = src_dir.path().join("vbmeta.img");
	std::fs::write(&src, vec![0x11_u8; 2048]).unwrap();

	assert_ok(&pipeline::import(&project, &src, &CancelToken::new()));
	assert_ok(&pipeline::extract(&project, &CancelToken::new()));

	let mut toggles = BTreeMap::new();
	toggles.insert("disable_avb".to_owned(), true);
	assert_ok(&pipeline::patch(&project, &toggles, &CancelToken::new()));

	project.update_config(|c| c.output_sparse = true).unwrap();

	// Force a rebuild path so the sparse codec actually runs.
	rk_kitchen::dirty::set(&project, "vbmeta", true).unwrap();
	std::fs::write(project.out_source_dir().join("vbmeta").join("touch.txt"), b"x").unwrap();

	let result = pipeline::build(&project, Some("vbmeta"), &CancelToken::new());
	// `vbmeta` extracted as an unknown-fs placeholder tree refuses a rebuild;
	// this asserts the refusal rather than fabricating an image (see S5).
	assert!(!result.ok());

	clear_tools();
}

#[test]
fn scenario_s4_unknown_patch_toggle_runs_nothing() {
	let _guard = ENV_LOCK.lock().unwrap();
	clear_tools();

	let project_dir = tempfile::tempdir().unwrap();
	let project = Project::open(project_dir.path()).unwrap();

	let mut toggles = BTreeMap::new();
	toggles.insert("disable_avb".to_owned(), true);
	toggles.insert("super_magical_hack".to_owned(), true);

	let result = pipeline::patch(&project, &toggles, &CancelToken::new());
	match &result {
		TaskResult::Error { message, .. } => assert!(message.contains("super_magical_hack")),
		other => panic!("expected Error, got {other:?}"),
	}
	assert!(!project.load_config().unwrap().patched);
	assert!(!project.extract_dir().join("PATCHED_OK.txt").is_file());
}

#[test]
fn scenario_s5_unknown_filesystem_build_refuses_fabrication() {
	let _guard = ENV_LOCK.lock().unwrap();
	clear_tools();

	let project_dir = tempfile::tempdir().unwrap();
	let project = Project::open(project_dir.path()).unwrap();

	let src_dir = tempfile::tempdir().unwrap();
	let src = src_dir.path().join("mystery.img");
	std::fs::write(&src, vec![0xFF_u8; 4096]).unwrap();

	assert_ok(&pipeline::import(&project, &src, &CancelToken::new()));
	assert_ok(&pipeline::extract(&project, &CancelToken::new()));

	rk_kitchen::dirty::set(&project, "mystery", true).unwrap();

	let result = pipeline::build(&project, Some("mystery"), &CancelToken::new());
	match &result {
		TaskResult::Error { message, .. } => assert!(message.to_lowercase().contains("unsupported")),
		other => panic!("expected UnsupportedFormat error, got {other:?}"),
	}
	assert!(!project.load_config().unwrap().built);
}

#[test]
fn scenario_s6_cancel_mid_import_clears_partial_state() {
	let _guard = ENV_LOCK.lock().unwrap();
	clear_tools();

	let project_dir = tempfile::tempdir().unwrap();
	let project = Project::open(project_dir.path()).unwrap();

	let src_dir = tempfile::tempdir().unwrap();
	let src = src_dir.path().join("big.img");
	std::fs::write(&src, vec![0_u8; 50 * 1024 * 1024]).unwrap();

	let cancel = CancelToken::new();
	cancel.cancel();

	let result = pipeline::import(&project, &src, &cancel);
	assert!(matches!(result, TaskResult::Cancelled { .. }));
	assert!(!project.in_dir().join("big.img").exists());
	assert!(!project.load_config().unwrap().imported);
}

#[test]
fn scenario_busy_flag_blocks_concurrent_acquire() {
	let project_dir = tempfile::tempdir().unwrap();
	let project = Project::open(project_dir.path()).unwrap();
	project.try_acquire_busy().unwrap();
	assert!(matches!(project.try_acquire_busy(), Err(ErrKind::Busy)));
	project.release_busy();
}
