//! `nvidia-smi -L` scraping.
//!
//! Parses the human-readable device listing, keeping lines tagged with
//! the partition keyword and extracting the identifier from the UUID
//! field:
//!
//! ```text
//! GPU 0: NVIDIA A100-SXM4-40GB (UUID: GPU-5c5dfa6c-...)
//!   MIG 1g.5gb      Device  0: (UUID: MIG-8ba5bb9d-...)
//! ```
//!
//! A failing or missing command is reported as zero partitions, never as
//! an error: the allocator treats an absent accelerator like an
//! exhausted one.

use std::collections::BTreeSet;
use std::process::Command;

use tracing::{debug, warn};

use crate::config::InventoryConfig;
use crate::inventory::Inventory;

/// Inventory backed by an external listing command.
#[derive(Debug, Clone)]
pub struct SmiInventory {
    /// Program to run (default `nvidia-smi`).
    command: String,

    /// Arguments passed to it (default `-L`).
    args: Vec<String>,

    /// Keyword tagging partition lines (default `MIG`).
    keyword: String,
}

impl SmiInventory {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        keyword: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            keyword: keyword.into(),
        }
    }

    pub fn from_config(config: &InventoryConfig) -> Self {
        Self::new(&config.command, config.args.clone(), &config.keyword)
    }
}

impl Inventory for SmiInventory {
    fn list_partitions(&self) -> BTreeSet<String> {
        let output = match Command::new(&self.command).args(&self.args).output() {
            Ok(output) => output,
            Err(err) => {
                warn!(
                    command = %self.command,
                    error = %err,
                    "inventory command failed to run; treating as zero partitions"
                );
                return BTreeSet::new();
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                command = %self.command,
                status = %output.status,
                stderr = %stderr.trim(),
                "inventory command exited nonzero; treating as zero partitions"
            );
            return BTreeSet::new();
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let partitions = parse_partition_listing(&stdout, &self.keyword);
        debug!(count = partitions.len(), "partitions discovered");
        partitions
    }
}

/// Extract partition identifiers from the listing text.
///
/// A partition line starts with the keyword and carries the identifier
/// in a `(UUID: <id>)` field. Lines that don't match are skipped.
pub fn parse_partition_listing(raw: &str, keyword: &str) -> BTreeSet<String> {
    let mut partitions = BTreeSet::new();
    for raw_line in raw.lines() {
        let fields: Vec<&str> = raw_line.split_whitespace().collect();
        if fields.first() != Some(&keyword) {
            continue;
        }

        let Some(tag_idx) = fields.iter().position(|field| *field == "(UUID:") else {
            debug!(line = raw_line.trim(), "partition line without UUID field skipped");
            continue;
        };
        let Some(id) = fields.get(tag_idx + 1) else {
            debug!(line = raw_line.trim(), "partition line with empty UUID field skipped");
            continue;
        };

        let id = id.trim_end_matches(')');
        if !id.is_empty() {
            partitions.insert(id.to_string());
        }
    }
    partitions
}
