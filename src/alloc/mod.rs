//! Claim allocation.
//!
//! This module contains the durable state and the allocation algorithm:
//! - [`gate`]: cross-process lock serializing ledger access
//! - [`ledger`]: flat-file claim store (`owner-pid partition-id` lines)
//! - [`allocator`]: reconcile, select, persist orchestration

pub mod allocator;
pub mod gate;
pub mod ledger;
