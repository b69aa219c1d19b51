#![warn(clippy::complexity)]
#![warn(clippy::correctness)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![warn(clippy::perf)]
#![warn(clippy::style)]
#![warn(clippy::suspicious)]
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_inline_in_public_items)]

use std::{collections::BTreeMap, path::PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{self, WrapErr};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use rk_kitchen::{error::TaskResult, pipeline, project::Project, util::CancelToken};

/// Decomposes, patches, and rebuilds Rockchip-family Android firmware images.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct KitchenCli {
	/// Project directory; created on first use.
	#[arg(short, long, global = true, default_value = "./project")]
	project: PathBuf,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Copies a ROM file into the project and classifies it.
	Import {
		/// Firmware wrapper, super image, or raw partition image.
		file: PathBuf,
	},
	/// Decomposes the imported file into its component partitions.
	Extract,
	/// Applies the selected patches to already-extracted content.
	Patch {
		#[arg(long)]
		disable_avb: bool,
		#[arg(long)]
		magisk: bool,
		#[arg(long)]
		debloat: bool,
		#[arg(long)]
		disable_dm_verity: bool,
	},
	/// Rebuilds the patched partitions back into their original container.
	Build {
		/// Rebuild only this partition instead of the whole project.
		#[arg(long)]
		partition: Option<String>,
	},
	/// Runs import, extract, patch, and build in sequence.
	Run {
		file: PathBuf,
		#[arg(long)]
		disable_avb: bool,
		#[arg(long)]
		magisk: bool,
		#[arg(long)]
		debloat: bool,
		#[arg(long)]
		disable_dm_verity: bool,
	},
}

fn report(step: &str, result: &TaskResult) -> eyre::Result<()> {
	match result {
		TaskResult::Success { message, artifacts, elapsed_ms } => {
			info!(step, elapsed_ms, artifacts = ?artifacts, "{}", message.as_deref().unwrap_or("ok"));
			Ok(())
		},
		TaskResult::Cancelled { elapsed_ms } => Err(eyre::eyre!("{step} cancelled after {elapsed_ms}ms")),
		TaskResult::Error { message, elapsed_ms } => Err(eyre::eyre!("{step} failed after {elapsed_ms}ms: {message}")),
	}
}

fn patch_toggles(disable_avb: bool, magisk: bool, debloat: bool, disable_dm_verity: bool) -> BTreeMap<String, bool> {
	let mut toggles = BTreeMap::new();
	toggles.insert("disable_avb".to_owned(), disable_avb);
	toggles.insert("magisk".to_owned(), magisk);
	toggles.insert("debloat".to_owned(), debloat);
	toggles.insert("disable_dm_verity".to_owned(), disable_dm_verity);
	toggles
}

fn main() -> eyre::Result<()> {
	color_eyre::install()?;

	// default to info level logging, override with RK_KITCHEN_LOG env var
	let filter = EnvFilter::try_from_env("RK_KITCHEN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
	let fmtlyr = fmt::layer().pretty().with_filter(filter);
	let subscriber = Registry::default().with(tracing_error::ErrorLayer::default()).with(fmtlyr);
	tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

	let cli = KitchenCli::parse();
	let cancel = CancelToken::new();

	let project = Project::open(&cli.project).wrap_err("opening project")?;
	project.try_acquire_busy().wrap_err("project busy, is another run already in progress?")?;
	let outcome = run_command(&project, cli.command, &cancel);
	project.release_busy();
	outcome
}

fn run_command(project: &Project, command: Command, cancel: &CancelToken) -> eyre::Result<()> {
	match command {
		Command::Import { file } => report("import", &pipeline::import(project, &file, cancel)),
		Command::Extract => report("extract", &pipeline::extract(project, cancel)),
		Command::Patch { disable_avb, magisk, debloat, disable_dm_verity } => {
			let toggles = patch_toggles(disable_avb, magisk, debloat, disable_dm_verity);
			report("patch", &pipeline::patch(project, &toggles, cancel))
		},
		Command::Build { partition } => report("build", &pipeline::build(project, partition.as_deref(), cancel)),
		Command::Run { file, disable_avb, magisk, debloat, disable_dm_verity } => {
			report("import", &pipeline::import(project, &file, cancel))?;
			report("extract", &pipeline::extract(project, cancel))?;
			let toggles = patch_toggles(disable_avb, magisk, debloat, disable_dm_verity);
			report("patch", &pipeline::patch(project, &toggles, cancel))?;
			report("build", &pipeline::build(project, None, cancel))
		},
	}
}
