//! Boot handoff
//!
//! The boot loader is an external collaborator; it hands the kernel a
//! physical memory map, the kernel image extent, an opaque ACPI handoff
//! and a command line. Managed RAM is the span the buddy allocator
//! takes over, clamped to what the kernel linear window can map.

use log::LevelFilter;

use crate::mm::{VMA_IO, VMA_KERNEL};

/// One region of the physical memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub size: u64,
    pub usable: bool,
}

/// Opaque ACPI configuration handoff; table walking happens elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct AcpiConfig {
    pub rsdp_address: u64,
}

/// Boot-time framebuffer description, when the loader set a mode.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub address: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bits_per_pixel: u32,
}

/// Everything the boot loader passes in.
pub struct BootInfo<'a> {
    pub memory_map: &'a [MemoryRegion],
    pub kernel_start: u64,
    pub kernel_end: u64,
    pub framebuffer: Option<FramebufferInfo>,
    pub acpi: Option<AcpiConfig>,
    pub command_line: &'a str,
}

impl BootInfo<'_> {
    /// Bytes of RAM the buddy allocator manages: up to the highest
    /// usable address, clamped to the kernel linear window.
    pub fn managed_ram_bytes(&self) -> usize {
        let window = (VMA_IO - VMA_KERNEL) as u64;
        let top = self
            .memory_map
            .iter()
            .filter(|region| region.usable)
            .map(|region| region.start + region.size)
            .max()
            .unwrap_or(0);
        top.min(window) as usize
    }

    /// Regions inside managed RAM that must never be handed out: holes
    /// in the memory map plus the kernel image itself.
    pub fn reserved_regions(&self) -> alloc::vec::Vec<MemoryRegion> {
        let mut reserved: alloc::vec::Vec<MemoryRegion> = self
            .memory_map
            .iter()
            .filter(|region| !region.usable)
            .copied()
            .collect();
        if self.kernel_end > self.kernel_start {
            reserved.push(MemoryRegion {
                start: self.kernel_start,
                size: self.kernel_end - self.kernel_start,
                usable: false,
            });
        }
        reserved
    }
}

/// Kernel options parsed from the boot command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub log_level: LevelFilter,
    pub no_pci: bool,
    pub ahci_poll_delay_ms: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            no_pci: false,
            ahci_poll_delay_ms: 0,
        }
    }
}

impl KernelConfig {
    pub fn parse(command_line: &str) -> KernelConfig {
        let mut config = KernelConfig::default();
        for token in command_line.split_whitespace() {
            if let Some(level) = token.strip_prefix("loglevel=") {
                config.log_level = match level {
                    "error" => LevelFilter::Error,
                    "warn" => LevelFilter::Warn,
                    "info" => LevelFilter::Info,
                    "debug" => LevelFilter::Debug,
                    "trace" => LevelFilter::Trace,
                    _ => config.log_level,
                };
            } else if token == "nopci" {
                config.no_pci = true;
            } else if let Some(delay) = token.strip_prefix("ahci.polldelay=") {
                if let Ok(value) = delay.parse() {
                    config.ahci_poll_delay_ms = value;
                }
            }
        }
        config
    }
}
