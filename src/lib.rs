//! gpu-lease: advisory exclusive-use leases for shared GPU partitions.
//!
//! Hands out MIG partition identifiers to competing processes on a single
//! host. Each invocation discovers the available partitions (via
//! `nvidia-smi`), reclaims claims whose owning process has exited, and
//! picks an unclaimed partition at random, with every read-modify-write
//! of the durable claim ledger serialized by a cross-process lock file.
//!
//! No driver-level exclusivity is involved: allocation is advisory and
//! only holds among clients that all go through the same allocator,
//! ledger, and lock paths.

pub mod alloc;
pub mod config;
pub mod inventory;
pub mod liveness;
