//! Allocation orchestration: gate, reconcile, select, persist.
//!
//! Each invocation runs one cycle entirely inside the gate's critical
//! section: load the ledger, short-circuit on an existing claim for the
//! same owner, drop claims whose owners have exited, pick an unclaimed
//! partition uniformly at random, and rewrite the ledger. An exhausted
//! free set is a normal outcome, not an error: contention is the
//! expected steady state on a busy host.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, info};

use crate::alloc::gate::{Gate, GateError};
use crate::alloc::ledger::{Claim, Ledger, LedgerError};
use crate::inventory::Inventory;
use crate::liveness::{Liveness, OracleError};

#[derive(Error, Debug)]
pub enum AllocError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Oracle(#[from] OracleError),
}

/// Claim state of a single partition, as reported by [`Allocator::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimState {
    /// No live claim.
    Free,
    /// Claimed by a running process.
    Claimed { owner: u32 },
    /// Claimed, but the owner is no longer alive; the next allocation
    /// cycle will reclaim it.
    Orphaned { owner: u32 },
}

/// One row of the status report.
#[derive(Debug, Clone)]
pub struct PartitionStatus {
    pub partition: String,
    pub state: ClaimState,
    /// False for ledger entries whose partition the inventory no longer
    /// lists (e.g. after a MIG reconfiguration).
    pub in_inventory: bool,
}

/// The allocator, generic over its collaborators so tests can substitute
/// in-memory fakes for the gate, the process table, and `nvidia-smi`.
pub struct Allocator<G, L, I> {
    ledger: Ledger,
    gate: G,
    liveness: L,
    inventory: I,
    timeout: Duration,
    retry_interval: Duration,
}

impl<G: Gate, L: Liveness, I: Inventory> Allocator<G, L, I> {
    pub fn new(
        ledger: Ledger,
        gate: G,
        liveness: L,
        inventory: I,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            gate,
            liveness,
            inventory,
            timeout,
            retry_interval,
        }
    }

    /// Run one allocation cycle for `owner`.
    ///
    /// Returns the partition already claimed by `owner` if one exists
    /// (idempotent re-ask), a freshly claimed partition otherwise, or
    /// `None` when every eligible partition is held by a live owner.
    pub fn acquire(&self, owner: u32) -> Result<Option<String>, AllocError> {
        let outcome = self
            .gate
            .locked(self.timeout, self.retry_interval, || {
                self.acquire_locked(owner)
            })?;
        outcome
    }

    fn acquire_locked(&self, owner: u32) -> Result<Option<String>, AllocError> {
        let claims = self.ledger.load()?;

        // An existing claim wins before any probing or mutation, so a
        // re-ask by the same owner never reshuffles the ledger.
        if let Some(existing) = claims.iter().find(|claim| claim.owner == owner) {
            debug!(owner, partition = %existing.partition, "existing claim reused");
            return Ok(Some(existing.partition.clone()));
        }

        let mut retained = self.reconcile(claims)?;

        let eligible = self.inventory.list_partitions();
        let claimed: BTreeSet<&str> = retained
            .iter()
            .map(|claim| claim.partition.as_str())
            .collect();
        let free: Vec<&String> = eligible
            .iter()
            .filter(|partition| !claimed.contains(partition.as_str()))
            .collect();

        debug!(
            owner,
            eligible = eligible.len(),
            claimed = retained.len(),
            free = free.len(),
            "computed free set"
        );

        // Uniform random rather than first-fit: racing invocations that
        // listed the inventory before this ledger update would otherwise
        // pile onto the same lowest index.
        let chosen = free
            .choose(&mut rand::thread_rng())
            .map(|partition| (*partition).clone());

        match &chosen {
            Some(partition) => {
                retained.push(Claim::new(owner, partition.clone()));
                info!(owner, partition = %partition, "partition claimed");
            }
            None => {
                info!(owner, eligible = eligible.len(), "no free partition");
            }
        }

        // Reconciliation bookkeeping persists even when nothing was
        // handed out.
        self.ledger.store(&retained)?;
        Ok(chosen)
    }

    /// Drop `owner`'s claim, if any. Returns whether a claim was
    /// released. The rest of the ledger is reconciled in the same pass.
    pub fn release(&self, owner: u32) -> Result<bool, AllocError> {
        let outcome = self
            .gate
            .locked(self.timeout, self.retry_interval, || {
                let claims = self.ledger.load()?;
                let had_claim = claims.iter().any(|claim| claim.owner == owner);

                let remaining: Vec<Claim> = claims
                    .into_iter()
                    .filter(|claim| claim.owner != owner)
                    .collect();
                let retained = self.reconcile(remaining)?;
                self.ledger.store(&retained)?;

                if had_claim {
                    info!(owner, "claim released");
                }
                Ok(had_claim)
            })?;
        outcome
    }

    /// Report every eligible partition with its claim state, plus ledger
    /// entries whose partition the inventory no longer lists. Read-only:
    /// the ledger is not rewritten.
    pub fn status(&self) -> Result<Vec<PartitionStatus>, AllocError> {
        let outcome = self
            .gate
            .locked(self.timeout, self.retry_interval, || {
                let claims = self.ledger.load()?;
                let eligible = self.inventory.list_partitions();

                let mut report = Vec::with_capacity(eligible.len());
                for partition in &eligible {
                    let state = match claims.iter().find(|c| c.partition == *partition) {
                        Some(claim) if self.liveness.is_alive(claim.owner)? => {
                            ClaimState::Claimed { owner: claim.owner }
                        }
                        Some(claim) => ClaimState::Orphaned { owner: claim.owner },
                        None => ClaimState::Free,
                    };
                    report.push(PartitionStatus {
                        partition: partition.clone(),
                        state,
                        in_inventory: true,
                    });
                }

                for claim in &claims {
                    if eligible.contains(&claim.partition) {
                        continue;
                    }
                    let state = if self.liveness.is_alive(claim.owner)? {
                        ClaimState::Claimed { owner: claim.owner }
                    } else {
                        ClaimState::Orphaned { owner: claim.owner }
                    };
                    report.push(PartitionStatus {
                        partition: claim.partition.clone(),
                        state,
                        in_inventory: false,
                    });
                }

                Ok(report)
            })?;
        outcome
    }

    /// Keep only claims whose owner is still alive.
    fn reconcile(&self, claims: Vec<Claim>) -> Result<Vec<Claim>, AllocError> {
        let mut retained = Vec::with_capacity(claims.len());
        for claim in claims {
            if self.liveness.is_alive(claim.owner)? {
                retained.push(claim);
            } else {
                info!(
                    owner = claim.owner,
                    partition = %claim.partition,
                    "reclaimed partition from exited owner"
                );
            }
        }
        Ok(retained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::gate::MemGate;
    use crate::inventory::StaticInventory;
    use crate::liveness::StaticLiveness;
    use tempfile::TempDir;

    const POLL: Duration = Duration::from_millis(5);

    fn allocator(
        tmp: &TempDir,
        live: &[u32],
        partitions: &[&str],
    ) -> Allocator<MemGate, StaticLiveness, StaticInventory> {
        Allocator::new(
            Ledger::new(tmp.path().join("leases")),
            MemGate::new(),
            StaticLiveness::new(live.iter().copied()),
            StaticInventory::new(partitions.iter().copied()),
            Duration::from_secs(1),
            POLL,
        )
    }

    #[test]
    fn test_acquire_claims_an_eligible_partition() {
        let tmp = TempDir::new().unwrap();
        let alloc = allocator(&tmp, &[1000], &["g1", "g2"]);

        let chosen = alloc.acquire(1000).unwrap().unwrap();
        assert!(chosen == "g1" || chosen == "g2");

        let claims = Ledger::new(tmp.path().join("leases")).load().unwrap();
        assert_eq!(claims, vec![Claim::new(1000, chosen)]);
    }

    #[test]
    fn test_reask_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let alloc = allocator(&tmp, &[1000], &["g1", "g2"]);

        let first = alloc.acquire(1000).unwrap().unwrap();
        let second = alloc.acquire(1000).unwrap().unwrap();
        assert_eq!(first, second);

        let claims = Ledger::new(tmp.path().join("leases")).load().unwrap();
        assert_eq!(claims.len(), 1);
    }

    #[test]
    fn test_dead_owner_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::new(tmp.path().join("leases"));
        ledger.store(&[Claim::new(9999, "g1")]).unwrap();

        // 9999 is not in the live set.
        let alloc = allocator(&tmp, &[1000], &["g1"]);
        let chosen = alloc.acquire(1000).unwrap().unwrap();
        assert_eq!(chosen, "g1");

        let claims = ledger.load().unwrap();
        assert_eq!(claims, vec![Claim::new(1000, "g1")]);
    }

    #[test]
    fn test_exhaustion_returns_none_and_keeps_claims() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::new(tmp.path().join("leases"));
        ledger
            .store(&[Claim::new(1000, "g1"), Claim::new(2000, "g2")])
            .unwrap();

        let alloc = allocator(&tmp, &[1000, 2000, 3000], &["g1", "g2"]);
        assert_eq!(alloc.acquire(3000).unwrap(), None);

        let claims = ledger.load().unwrap();
        assert_eq!(claims.len(), 2);
    }

    #[test]
    fn test_zero_eligible_partitions_is_not_an_error() {
        let tmp = TempDir::new().unwrap();
        let alloc = allocator(&tmp, &[1000], &[]);
        assert_eq!(alloc.acquire(1000).unwrap(), None);
    }

    #[test]
    fn test_oracle_failure_aborts_the_cycle() {
        struct FailingOracle;
        impl Liveness for FailingOracle {
            fn is_alive(&self, pid: u32) -> Result<bool, OracleError> {
                Err(OracleError::Probe { pid, errno: libc::EPERM })
            }
        }

        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::new(tmp.path().join("leases"));
        ledger.store(&[Claim::new(9999, "g1")]).unwrap();

        let alloc = Allocator::new(
            ledger.clone(),
            MemGate::new(),
            FailingOracle,
            StaticInventory::new(["g1"]),
            Duration::from_secs(1),
            POLL,
        );

        let err = alloc.acquire(1000).unwrap_err();
        assert!(matches!(err, AllocError::Oracle(_)));
        // The ledger must be untouched after the aborted cycle.
        assert_eq!(ledger.load().unwrap(), vec![Claim::new(9999, "g1")]);
    }

    #[test]
    fn test_release_frees_the_partition() {
        let tmp = TempDir::new().unwrap();
        let alloc = allocator(&tmp, &[1000, 2000], &["g1"]);

        let chosen = alloc.acquire(1000).unwrap().unwrap();
        assert_eq!(alloc.acquire(2000).unwrap(), None);

        assert!(alloc.release(1000).unwrap());
        assert_eq!(alloc.acquire(2000).unwrap(), Some(chosen));
    }

    #[test]
    fn test_release_without_claim_reports_false() {
        let tmp = TempDir::new().unwrap();
        let alloc = allocator(&tmp, &[1000], &["g1"]);
        assert!(!alloc.release(1000).unwrap());
    }

    #[test]
    fn test_status_reports_claim_states() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::new(tmp.path().join("leases"));
        ledger
            .store(&[
                Claim::new(1000, "g1"),
                Claim::new(9999, "g2"),
                Claim::new(1000, "gone"),
            ])
            .unwrap();

        let alloc = allocator(&tmp, &[1000], &["g1", "g2", "g3"]);
        let report = alloc.status().unwrap();

        let find = |id: &str| report.iter().find(|s| s.partition == id).unwrap();
        assert_eq!(find("g1").state, ClaimState::Claimed { owner: 1000 });
        assert_eq!(find("g2").state, ClaimState::Orphaned { owner: 9999 });
        assert_eq!(find("g3").state, ClaimState::Free);
        assert!(!find("gone").in_inventory);

        // Status never rewrites the ledger.
        assert_eq!(ledger.load().unwrap().len(), 3);
    }
}
