//! gpu-lease: advisory exclusive-use leases for shared GPU partitions.
//!
//! Short-lived helper invoked once per allocation: discovers MIG
//! partitions, reconciles the claim ledger against the process table,
//! and prints the chosen partition identifier (or nothing when every
//! partition is taken).

use std::os::unix::process::CommandExt;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, warn};

use gpu_lease::alloc::allocator::{Allocator, ClaimState};
use gpu_lease::alloc::gate::{FileGate, Gate};
use gpu_lease::alloc::ledger::Ledger;
use gpu_lease::config::{Cli, Command, Config};
use gpu_lease::inventory::{allowlist, smi::SmiInventory, Allowlisted, Inventory};
use gpu_lease::liveness::{parent_pid, KillProbe, Liveness};

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging. Stdout carries only the chosen
    // partition identifier, so all diagnostics go to stderr.
    let filter = if cli.verbose {
        "gpu_lease=debug"
    } else {
        "gpu_lease=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    debug!("gpu-lease v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(prefix) = cli.prefix {
        config.paths.prefix = prefix;
    }

    std::fs::create_dir_all(&config.paths.prefix).with_context(|| {
        format!(
            "failed to create state directory {}",
            config.paths.prefix.display()
        )
    })?;

    debug!(
        ledger = %config.ledger_path().display(),
        lock = %config.lock_path().display(),
        "state paths"
    );

    let owner = cli.owner.unwrap_or_else(parent_pid);

    let eligible = allowlist::load(&config.allowlist_path());
    let inventory = Allowlisted::new(SmiInventory::from_config(&config.inventory), eligible);
    let allocator = Allocator::new(
        Ledger::new(config.ledger_path()),
        FileGate::new(config.lock_path()),
        KillProbe,
        inventory,
        config.lock.timeout(),
        config.lock.retry_interval(),
    );

    match cli.command {
        Command::Acquire => {
            if let Some(partition) = allocator.acquire(owner)? {
                println!("{partition}");
            }
        }
        Command::Release => {
            let released = allocator.release(owner)?;
            debug!(owner, released, "release finished");
        }
        Command::Status => {
            for entry in allocator.status()? {
                let state = match entry.state {
                    ClaimState::Free => "free".to_string(),
                    ClaimState::Claimed { owner } => format!("pid {owner}"),
                    ClaimState::Orphaned { owner } => format!("pid {owner} (exited)"),
                };
                let note = if entry.in_inventory {
                    ""
                } else {
                    "  [not in inventory]"
                };
                println!("{:<44} {}{}", entry.partition, state, note);
            }
        }
        Command::Run { command } => run_workload(&allocator, &config, &command)?,
    }

    Ok(())
}

/// The wrapping launcher: claim a partition on behalf of this process,
/// export it, and exec the workload in place. The workload inherits
/// this pid, so the claim stays owned for the workload's lifetime.
fn run_workload<G: Gate, L: Liveness, I: Inventory>(
    allocator: &Allocator<G, L, I>,
    config: &Config,
    command: &[String],
) -> anyhow::Result<()> {
    let owner = std::process::id();
    let partition = allocator.acquire(owner)?;

    let (program, args) = command
        .split_first()
        .context("run requires a command to exec")?;

    let mut workload = std::process::Command::new(program);
    workload.args(args);
    match &partition {
        Some(id) => {
            info!(partition = %id, env_var = %config.inventory.env_var, "pinning workload");
            workload.env(&config.inventory.env_var, id);
        }
        None => {
            // Oversubscription fallback: the workload shares whatever
            // the driver gives it.
            warn!("no free partition; running workload unpinned");
        }
    }

    // exec only returns on failure.
    let err = workload.exec();
    Err(err).with_context(|| format!("failed to exec {program}"))
}
