//! Accelerator device abstraction
//!
//! The controller talks to the accelerator only through [`AcceleratorDevice`]:
//! allocate shared regions, map/unmap them for the host, submit a task and
//! block until it completes. Device discovery, kernel binaries and the
//! kernel's own logic live behind the trait.

use crate::error::Result;
use crate::region::{MapMode, MappedRegion};
use serde::Serialize;
use std::fmt;

/// Handle to a device-shared memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle {
    id: u64,
    size: usize,
}

impl RegionHandle {
    /// Create a handle; used by backends when allocating
    #[must_use]
    pub const fn new(id: u64, size: usize) -> Self {
        Self { id, size }
    }

    /// Backend-assigned region identifier
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Region capacity in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Display for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}

/// Handle to a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u64);

/// Kernel arguments for one pass
///
/// Both regions are passed in buffer-index order; `active_index` selects the
/// one holding this pass's units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskArgs {
    /// Both transfer regions, indexed 0/1
    pub regions: [RegionHandle; 2],
    /// Index of the region submitted this pass
    pub active_index: usize,
    /// Valid units in the active region
    pub unit_count: usize,
}

impl TaskArgs {
    /// Region submitted this pass
    #[inline]
    pub fn source(&self) -> RegionHandle {
        self.regions[self.active_index]
    }

    /// The other region
    #[inline]
    pub fn peer(&self) -> RegionHandle {
        self.regions[1 - self.active_index]
    }
}

/// Accelerator description
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Device name (e.g., "xilinx_u200")
    pub name: String,
    /// Vendor name
    pub vendor: String,
    /// Shared memory available for regions, in bytes
    pub memory_bytes: usize,
    /// Kernel entry points the loaded program exposes
    pub kernels: Vec<String>,
}

impl DeviceInfo {
    /// Check if the loaded program exposes `kernel`
    #[must_use]
    pub fn has_kernel(&self, kernel: &str) -> bool {
        self.kernels.iter().any(|k| k == kernel)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {} MB shared)",
            self.name,
            self.vendor,
            self.memory_bytes / (1024 * 1024)
        )
    }
}

/// Command channel to an accelerator
///
/// All methods take `&mut self`: a session has exactly one owner issuing
/// commands serially, and at most one task outstanding.
pub trait AcceleratorDevice: Send {
    /// Device description
    fn info(&self) -> &DeviceInfo;

    /// Allocate a region of device-shared memory
    fn allocate_shared_region(&mut self, size: usize) -> Result<RegionHandle>;

    /// Map a region for host access
    ///
    /// Blocks until any outstanding device work on the region has finished.
    fn map_for_host(&mut self, region: RegionHandle, mode: MapMode) -> Result<MappedRegion>;

    /// Return a mapped region to the device
    ///
    /// Host writes made through a writable mapping become visible to the
    /// device. The caller drops `mapping` only after this succeeds; on
    /// failure the region is still host-mapped and the unmap may be retried.
    fn unmap_from_host(&mut self, mapping: &mut MappedRegion) -> Result<()>;

    /// Launch `kernel` with `args`
    fn submit_task(&mut self, kernel: &str, args: TaskArgs) -> Result<TaskHandle>;

    /// Block until the outstanding task completes
    fn wait_for_completion(&mut self) -> Result<()>;

    /// Free a region; it must not be host-mapped
    fn release_region(&mut self, region: RegionHandle) -> Result<()>;
}

impl<D: AcceleratorDevice + ?Sized> AcceleratorDevice for Box<D> {
    fn info(&self) -> &DeviceInfo {
        (**self).info()
    }

    fn allocate_shared_region(&mut self, size: usize) -> Result<RegionHandle> {
        (**self).allocate_shared_region(size)
    }

    fn map_for_host(&mut self, region: RegionHandle, mode: MapMode) -> Result<MappedRegion> {
        (**self).map_for_host(region, mode)
    }

    fn unmap_from_host(&mut self, mapping: &mut MappedRegion) -> Result<()> {
        (**self).unmap_from_host(mapping)
    }

    fn submit_task(&mut self, kernel: &str, args: TaskArgs) -> Result<TaskHandle> {
        (**self).submit_task(kernel, args)
    }

    fn wait_for_completion(&mut self) -> Result<()> {
        (**self).wait_for_completion()
    }

    fn release_region(&mut self, region: RegionHandle) -> Result<()> {
        (**self).release_region(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_args_roles() {
        let r0 = RegionHandle::new(10, 64);
        let r1 = RegionHandle::new(11, 64);
        let args = TaskArgs {
            regions: [r0, r1],
            active_index: 1,
            unit_count: 3,
        };
        assert_eq!(args.source(), r1);
        assert_eq!(args.peer(), r0);
    }

    #[test]
    fn test_device_info_display() {
        let info = DeviceInfo {
            name: "xilinx_u200".to_string(),
            vendor: "Xilinx".to_string(),
            memory_bytes: 64 * 1024 * 1024,
            kernels: vec!["device_kernel".to_string()],
        };
        assert_eq!(info.to_string(), "xilinx_u200 (Xilinx, 64 MB shared)");
        assert!(info.has_kernel("device_kernel"));
        assert!(!info.has_kernel("other"));
    }
}
