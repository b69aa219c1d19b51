//! Copy-Through Optimizer: short-circuits filesystem rebuild for clean
//! partitions, per the decision table in `SPEC_FULL.md` §4.i.

use std::path::Path;

use tracing::info;

use crate::{codec::sparse, error::Result};

/// The literal phrase the build message must contain so upstream assertions
/// and the operator log can distinguish a copy-through from a rebuild.
pub const MARKER_PHRASE: &str = "copy-through";

/// Performs the clean-partition fast path. Returns a human-readable message
/// containing [`MARKER_PHRASE`] on success.
pub fn run(original: &Path, output: &Path, original_is_sparse: bool, output_sparse: bool) -> Result<String> {
	if let Some(parent) = output.parent() {
		std::fs::create_dir_all(parent)?;
	}

	match (original_is_sparse, output_sparse) {
		(true, true) | (false, false) => {
			std::fs::copy(original, output)?;
			Ok(format!("{MARKER_PHRASE}: direct byte copy of {}", original.display()))
		},
		(true, false) => {
			// raw-when-raw-requested: never fabricate, fail if the tool is missing.
			sparse::to_raw(original, output)?;
			Ok(format!("{MARKER_PHRASE}: sparse-to-raw transcode of {}", original.display()))
		},
		(false, true) => {
			// raw-when-sparse-requested is a safe downgrade: fall back to raw
			// output and annotate the message rather than failing.
			match sparse::to_sparse(original, output) {
				Ok(()) => Ok(format!("{MARKER_PHRASE}: raw-to-sparse transcode of {}", original.display())),
				Err(_) => {
					info!("img2simg unavailable, falling back to raw copy-through output");
					std::fs::copy(original, output)?;
					Ok(format!(
						"{MARKER_PHRASE}: sparse tool unavailable, downgraded to raw output for {}",
						original.display()
					))
				},
			}
		},
	}
}
