// src/utils/system.rs: System functions

use std::time::Duration;

use anyhow::{anyhow, Result};
use log::debug;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio::time::sleep;

use crate::cli::Arguments;
use crate::config::plan::ResourceCeiling;

const BYTES_PER_GIB: u64 = 1_073_741_824;

/// Determines number of cores that can be used for tool invocations
///
/// # Returns
///
/// Result<(usize, f32)> physical cores, current cpu usage
pub async fn detect_cores_and_load() -> Result<(usize, f32)> {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    // Usage is a delta between two refreshes at least MINIMUM_CPU_UPDATE_INTERVAL apart.
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(MINIMUM_CPU_UPDATE_INTERVAL.max(Duration::from_millis(100))).await;
    system.refresh_cpu_usage();
    let cpu_load = system.global_cpu_usage();
    Ok((physical_cores, cpu_load))
}

/// Finds the amount of total and available RAM, keyed to OS
///
/// # Returns
///
/// Result<(u64, u64)> total ram, available ram in bytes
pub fn detect_ram() -> Result<(u64, u64)> {
    let (total_ram, available_ram) = if cfg!(target_os = "macos") {
        let refresh_kind = RefreshKind::nothing().with_memory(Default::default());
        let mut system = System::new_with_specifics(refresh_kind);
        system.refresh_memory_specifics(MemoryRefreshKind::everything());
        let total = system.total_memory();
        let used = system.used_memory();
        (total, total.saturating_sub(used))
    } else {
        let mut system = System::new_all();
        system.refresh_memory();
        (system.total_memory(), system.available_memory())
    };

    if total_ram == 0 || available_ram == 0 {
        return Err(anyhow!("Failed to detect valid RAM values"));
    }

    Ok((total_ram, available_ram))
}

/// Resource ceiling for the run: detected cores and RAM, capped by `--max-cpus` and
/// `--max-memory-gb`. A user cap above the machine's capacity is honoured as given.
pub async fn detect_ceiling(args: &Arguments) -> Result<ResourceCeiling> {
    let (cores, cpu_load) = detect_cores_and_load().await?;
    let (total_ram, available_ram) = detect_ram()?;
    debug!(
        "Detected {} physical cores; CPU load {:.1}%; {} GiB RAM ({} GiB available)",
        cores,
        cpu_load,
        total_ram / BYTES_PER_GIB,
        available_ram / BYTES_PER_GIB
    );
    Ok(ResourceCeiling {
        max_cpus: args.max_cpus.unwrap_or(cores).max(1),
        max_memory_gb: args.max_memory_gb.unwrap_or(total_ram / BYTES_PER_GIB).max(1),
    })
}
