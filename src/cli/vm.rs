//! VM record commands: create and info.

use super::{format_size, to_bytes, OpenVm, GIB, MIB};
use clap::Args;
use fleetvm::vm::{DEFAULT_DISK_SPACE, DEFAULT_NUM_CORES};
use fleetvm::{util, Error, FleetConfig, VmRecord, VmSpecs};
use std::path::PathBuf;

// ============================================================================
// Create Command
// ============================================================================

/// Create a VM record without starting it.
#[derive(Args, Debug)]
pub struct CreateCmd {
    /// VM name
    pub name: String,

    /// Disk image the VM boots from
    #[arg(long)]
    pub disk: PathBuf,

    /// Number of vCPUs
    #[arg(long, default_value_t = DEFAULT_NUM_CORES)]
    pub cpus: u32,

    /// Memory in MiB
    #[arg(long, default_value = "1024")]
    pub mem: u64,

    /// Disk size in GiB (defaults to the image size)
    #[arg(long)]
    pub disk_size: Option<u64>,

    /// Command launching the VM process
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

impl CreateCmd {
    pub fn run(self) -> fleetvm::Result<()> {
        util::check_name(&self.name).map_err(|reason| {
            Error::InvalidSpecs(format!("invalid vm name {:?}: {}", self.name, reason))
        })?;

        let config = FleetConfig::from_env();
        let record_path = config.record_path(&self.name);
        if record_path.exists() {
            return Err(Error::VmExists { name: self.name });
        }

        let disk_space = match self.disk_size {
            Some(gib) => to_bytes(gib, GIB, "disk-size")?,
            None => std::fs::metadata(&self.disk)
                .map(|m| m.len())
                .ok()
                .filter(|len| *len > 0)
                .unwrap_or(DEFAULT_DISK_SPACE),
        };
        let specs = VmSpecs {
            num_cores: self.cpus,
            mem_size: to_bytes(self.mem, MIB, "mem")?,
            disk_space,
            ..VmSpecs::default()
        };
        specs.validate()?;

        let mut record = VmRecord::new(&self.name, specs, &self.disk);
        record.command = self.command;
        record.save(&record_path)?;

        println!("Created VM: {}", self.name);
        Ok(())
    }
}

// ============================================================================
// Info Command
// ============================================================================

/// Show a VM's record and snapshot summary.
#[derive(Args, Debug)]
pub struct InfoCmd {
    /// VM name
    pub name: String,
}

impl InfoCmd {
    pub fn run(self) -> fleetvm::Result<()> {
        let open = OpenVm::open(&self.name)?;
        let vm = &open.vm;
        let specs = vm.specs();

        println!("Name:       {}", vm.name());
        println!("State:      {}", vm.current_state());
        println!("Backend:    {}", vm.backend_name());
        println!("CPUs:       {}", specs.num_cores);
        println!("Memory:     {}", format_size(specs.mem_size));
        println!("Disk:       {}", format_size(specs.disk_space));
        println!("Image:      {}", open.record.disk_image.display());
        if !open.record.command.is_empty() {
            println!("Command:    {}", open.record.command.join(" "));
        }
        for (target, mount) in &specs.mounts {
            println!("Mount:      {} -> {}", mount.source_path.display(), target);
        }
        println!(
            "Snapshots:  {} ({} taken in total)",
            vm.num_snapshots(),
            vm.snapshot_count()
        );
        if let Some(head) = vm.head_snapshot() {
            println!("Head:       {}", head.name);
        }
        Ok(())
    }
}
