//! fleetvm CLI entry point.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

/// fleetvm - VM lifecycle and snapshot management
#[derive(Parser, Debug)]
#[command(name = "fleetvm")]
#[command(about = "Manage VM snapshots offline")]
#[command(
    long_about = "fleetvm manages VM records and their snapshot trees.\n\n\
Snapshots can only be taken, restored or deleted while the VM is off.\n\
Restoring first saves the current state as a snapshot unless --destructive is given.\n\n\
Quick start:\n  \
fleetvm create primary --disk ./primary.img -- qemu-system-x86_64 -nographic\n  \
fleetvm snapshot primary --name pre-upgrade\n  \
fleetvm list primary"
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a VM record without starting it
    Create(cli::vm::CreateCmd),

    /// Show a VM's record and snapshot summary
    Info(cli::vm::InfoCmd),

    /// Take a snapshot of a stopped VM
    Snapshot(cli::snapshot::SnapshotCmd),

    /// Restore a stopped VM to a snapshot
    Restore(cli::snapshot::RestoreCmd),

    /// Rename a snapshot
    RenameSnapshot(cli::snapshot::RenameSnapshotCmd),

    /// Replace a snapshot's comment
    Comment(cli::snapshot::CommentCmd),

    /// Delete a snapshot
    #[command(alias = "rm-snapshot")]
    DeleteSnapshot(cli::snapshot::DeleteSnapshotCmd),

    /// Show a VM's snapshot tree
    #[command(alias = "ls")]
    List(cli::snapshot::ListCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();

    tracing::debug!(version = fleetvm::VERSION, "starting fleetvm");

    let result = match cli.command {
        Commands::Create(cmd) => cmd.run(),
        Commands::Info(cmd) => cmd.run(),
        Commands::Snapshot(cmd) => cmd.run(),
        Commands::Restore(cmd) => cmd.run(),
        Commands::RenameSnapshot(cmd) => cmd.run(),
        Commands::Comment(cmd) => cmd.run(),
        Commands::DeleteSnapshot(cmd) => cmd.run(),
        Commands::List(cmd) => cmd.run(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, kind = ?e.kind(), "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleetvm=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
