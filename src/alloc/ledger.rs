//! Durable claim storage.
//!
//! One claim per line, `owner-pid partition-id`, whitespace separated;
//! the final line may omit its trailing newline. The file is read and
//! rewritten in full under the gate on every allocation cycle. Malformed
//! lines are dropped on load rather than failing the cycle, so damaged
//! state degrades by losing stale entries instead of blocking
//! allocation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A recorded owner → partition pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Pid of the logical client holding the partition.
    pub owner: u32,

    /// Identifier of the claimed partition.
    pub partition: String,
}

impl Claim {
    pub fn new(owner: u32, partition: impl Into<String>) -> Self {
        Self {
            owner,
            partition: partition.into(),
        }
    }
}

/// Handle on the flat-file claim store.
///
/// The ledger is an explicit injected resource, not a singleton; all
/// access must happen with the gate held.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all well-formed claims. A missing file is an empty ledger;
    /// the file is created lazily by the first [`store`](Self::store).
    pub fn load(&self) -> Result<Vec<Claim>, LedgerError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(LedgerError::Io {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };

        let mut claims = Vec::new();
        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 2 {
                debug!(
                    line = idx + 1,
                    fields = fields.len(),
                    "dropping malformed ledger line"
                );
                continue;
            }

            let owner = match fields[0].parse::<u32>() {
                Ok(pid) => pid,
                Err(_) => {
                    debug!(
                        line = idx + 1,
                        value = fields[0],
                        "dropping ledger line with non-numeric owner pid"
                    );
                    continue;
                }
            };

            claims.push(Claim::new(owner, fields[1]));
        }

        Ok(claims)
    }

    /// Rewrite the ledger so it contains exactly `claims`.
    ///
    /// Writes to a sibling temp file and renames over the ledger, so a
    /// crash mid-write never leaves a half-written file behind. Writes
    /// are serialized by the gate, so the fixed temp name cannot race.
    pub fn store(&self, claims: &[Claim]) -> Result<(), LedgerError> {
        let mut text = String::new();
        for claim in claims {
            text.push_str(&claim.owner.to_string());
            text.push(' ');
            text.push_str(&claim.partition);
            text.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text).map_err(|err| LedgerError::Io {
            path: tmp.clone(),
            source: err,
        })?;
        fs::rename(&tmp, &self.path).map_err(|err| LedgerError::Io {
            path: self.path.clone(),
            source: err,
        })?;

        debug!(path = %self.path.display(), claims = claims.len(), "ledger rewritten");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty_ledger() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::new(tmp.path().join("leases"));
        assert!(ledger.load().unwrap().is_empty());
    }

    #[test]
    fn test_store_then_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::new(tmp.path().join("leases"));

        let claims = vec![
            Claim::new(1000, "MIG-aaaa"),
            Claim::new(2000, "MIG-bbbb"),
        ];
        ledger.store(&claims).unwrap();

        assert_eq!(ledger.load().unwrap(), claims);
    }

    #[test]
    fn test_final_line_without_newline_is_loaded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("leases");
        fs::write(&path, "1000 MIG-aaaa\n2000 MIG-bbbb").unwrap();

        let ledger = Ledger::new(&path);
        assert_eq!(ledger.load().unwrap().len(), 2);
    }

    #[test]
    fn test_malformed_lines_are_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("leases");
        fs::write(
            &path,
            "1000 MIG-aaaa\nonly-one-field\n2000 MIG-bbbb extra-field\nnot-a-pid MIG-cccc\n\n3000 MIG-dddd\n",
        )
        .unwrap();

        let ledger = Ledger::new(&path);
        let claims = ledger.load().unwrap();
        assert_eq!(
            claims,
            vec![Claim::new(1000, "MIG-aaaa"), Claim::new(3000, "MIG-dddd")]
        );
    }

    #[test]
    fn test_store_replaces_previous_contents() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::new(tmp.path().join("leases"));

        ledger.store(&[Claim::new(1, "MIG-aaaa")]).unwrap();
        ledger.store(&[Claim::new(2, "MIG-bbbb")]).unwrap();

        assert_eq!(ledger.load().unwrap(), vec![Claim::new(2, "MIG-bbbb")]);
    }

    #[test]
    fn test_store_empty_clears_ledger() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::new(tmp.path().join("leases"));

        ledger.store(&[Claim::new(1, "MIG-aaaa")]).unwrap();
        ledger.store(&[]).unwrap();

        assert!(ledger.load().unwrap().is_empty());
        assert!(ledger.path().exists());
    }
}
