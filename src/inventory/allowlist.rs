//! Optional partition eligibility filter.
//!
//! One partition identifier per line; blank lines and `#` comments are
//! ignored. A missing file means no filtering: every discovered
//! partition is eligible. Loaded once at startup and immutable for the
//! run.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

/// Load the allowlist at `path`, if present.
pub fn load(path: &Path) -> Option<BTreeSet<String>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no allowlist; all partitions eligible");
            return None;
        }
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "allowlist unreadable; treating as absent"
            );
            return None;
        }
    };

    let allowed: BTreeSet<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();

    debug!(path = %path.display(), entries = allowed.len(), "allowlist loaded");
    Some(allowed)
}
