//! Software accelerator for testing
//!
//! Regions live in host memory. A map copies the region out to the host and
//! a writable unmap copies it back, which gives the same visible semantics as
//! a discrete device. Submitted tasks run the BLAKE3 unit kernel on a worker
//! thread; `wait_for_completion` joins it.
//!
//! The backend enforces the device contract (one outstanding task, no double
//! map, no submitting a host-mapped region) and records every command in a
//! journal so tests can check ordering.

use crate::config::DEFAULT_KERNEL;
use crate::device::{AcceleratorDevice, DeviceInfo, RegionHandle, TaskArgs, TaskHandle};
use crate::error::{DeviceOp, Error, Result};
use crate::layout::UnitLayout;
use crate::region::{MapMode, MappedRegion};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::trace;

/// Device command recorded by [`SimDevice`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// Region allocated
    Allocate(RegionHandle),
    /// Region mapped for the host
    Map(RegionHandle, MapMode),
    /// Region unmapped from the host
    Unmap(RegionHandle),
    /// Task launched over `source` with `units` units
    Submit {
        /// Task handle
        task: TaskHandle,
        /// Region the kernel processes
        source: RegionHandle,
        /// Units in the region
        units: usize,
    },
    /// Task finished
    Complete(TaskHandle),
    /// Region freed
    Release(RegionHandle),
}

#[derive(Debug)]
struct SimRegion {
    handle: RegionHandle,
    memory: Arc<Mutex<Vec<u8>>>,
    mapped: Option<MapMode>,
}

#[derive(Debug)]
struct Outstanding {
    task: TaskHandle,
    region: u64,
    worker: JoinHandle<Result<()>>,
}

/// In-process accelerator running the unit-hashing kernel on the CPU
#[derive(Debug)]
pub struct SimDevice {
    info: DeviceInfo,
    layout: UnitLayout,
    regions: HashMap<u64, SimRegion>,
    next_region: u64,
    next_task: u64,
    allocated: usize,
    outstanding: Option<Outstanding>,
    faults: Vec<(DeviceOp, usize)>,
    kernel_delay: Duration,
    journal: Vec<SimEvent>,
}

impl SimDevice {
    /// Create a simulated device whose kernel reads units laid out by `layout`
    #[must_use]
    pub fn new(layout: UnitLayout) -> Self {
        Self {
            info: DeviceInfo {
                name: "sim-accelerator".to_string(),
                vendor: "duplex".to_string(),
                memory_bytes: 256 * 1024 * 1024,
                kernels: vec![DEFAULT_KERNEL.to_string()],
            },
            layout,
            regions: HashMap::new(),
            next_region: 1,
            next_task: 1,
            allocated: 0,
            outstanding: None,
            faults: Vec::new(),
            kernel_delay: Duration::ZERO,
            journal: Vec::new(),
        }
    }

    /// Limit shared memory to `bytes`
    #[must_use]
    pub fn with_memory(mut self, bytes: usize) -> Self {
        self.info.memory_bytes = bytes;
        self
    }

    /// Make every kernel run take at least `delay`
    #[must_use]
    pub fn with_kernel_delay(mut self, delay: Duration) -> Self {
        self.kernel_delay = delay;
        self
    }

    /// Expose an additional kernel entry point (same unit kernel)
    #[must_use]
    pub fn with_kernel_name(mut self, kernel: impl Into<String>) -> Self {
        self.info.kernels.push(kernel.into());
        self
    }

    /// Fail the next `op` command
    pub fn fail_next(&mut self, op: DeviceOp) {
        self.fail_nth(op, 0);
    }

    /// Fail the `op` command after letting `skip` of them succeed
    pub fn fail_nth(&mut self, op: DeviceOp, skip: usize) {
        self.faults.push((op, skip));
    }

    /// Commands issued so far
    pub fn journal(&self) -> &[SimEvent] {
        &self.journal
    }

    /// Regions currently mapped on the host
    pub fn mapped_regions(&self) -> Vec<RegionHandle> {
        let mut mapped: Vec<_> = self
            .regions
            .values()
            .filter(|r| r.mapped.is_some())
            .map(|r| r.handle)
            .collect();
        mapped.sort_by_key(|r| r.id());
        mapped
    }

    /// Live regions
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Bytes of shared memory in use
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    /// Whether a task is still outstanding
    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Device-side copy of a region's contents
    pub fn peek(&self, region: RegionHandle) -> Option<Vec<u8>> {
        self.regions
            .get(&region.id())
            .map(|r| r.memory.lock().clone())
    }

    fn inject(&mut self, op: DeviceOp) -> Result<()> {
        let mut fired = false;
        self.faults.retain_mut(|(fault, remaining)| {
            if *fault != op {
                return true;
            }
            if *remaining == 0 && !fired {
                fired = true;
                return false;
            }
            *remaining = remaining.saturating_sub(1);
            true
        });
        if fired {
            return Err(Error::device(op, "injected fault"));
        }
        Ok(())
    }

    fn region_mut(&mut self, op: DeviceOp, region: RegionHandle) -> Result<&mut SimRegion> {
        self.regions
            .get_mut(&region.id())
            .ok_or_else(|| Error::device(op, format!("unknown region {region}")))
    }

    fn join_outstanding(&mut self) -> Result<()> {
        let Some(outstanding) = self.outstanding.take() else {
            return Ok(());
        };
        let result = outstanding
            .worker
            .join()
            .map_err(|_| Error::device(DeviceOp::Wait, "kernel worker panicked"))?;
        self.journal.push(SimEvent::Complete(outstanding.task));
        trace!(task = outstanding.task.0, "sim task complete");
        result
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new(crate::PipelineConfig::default().layout())
    }
}

impl AcceleratorDevice for SimDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate_shared_region(&mut self, size: usize) -> Result<RegionHandle> {
        self.inject(DeviceOp::Allocate)
            .map_err(|err| Error::alloc_failed(size, err.to_string()))?;
        if size == 0 {
            return Err(Error::alloc_failed(0, "zero-sized region"));
        }
        let available = self.info.memory_bytes.saturating_sub(self.allocated);
        if size > available {
            return Err(Error::alloc_failed(
                size,
                format!("only {available} bytes of shared memory left"),
            ));
        }

        let handle = RegionHandle::new(self.next_region, size);
        self.next_region += 1;
        self.allocated += size;
        self.regions.insert(
            handle.id(),
            SimRegion {
                handle,
                memory: Arc::new(Mutex::new(vec![0u8; size])),
                mapped: None,
            },
        );
        self.journal.push(SimEvent::Allocate(handle));
        Ok(handle)
    }

    fn map_for_host(&mut self, region: RegionHandle, mode: MapMode) -> Result<MappedRegion> {
        self.inject(DeviceOp::Map)?;
        let entry = self.region_mut(DeviceOp::Map, region)?;
        if let Some(existing) = entry.mapped {
            return Err(Error::device(
                DeviceOp::Map,
                format!("region {region} already mapped {existing}"),
            ));
        }

        // Blocks while a kernel holds the region
        let data = if mode.host_can_read() {
            BytesMut::from(&entry.memory.lock()[..])
        } else {
            BytesMut::zeroed(entry.handle.size())
        };
        entry.mapped = Some(mode);
        self.journal.push(SimEvent::Map(region, mode));
        trace!(%region, %mode, "sim map");
        Ok(MappedRegion::new(region, mode, data))
    }

    fn unmap_from_host(&mut self, mapping: &mut MappedRegion) -> Result<()> {
        self.inject(DeviceOp::Unmap)?;
        let (region, mode) = (mapping.region(), mapping.mode());
        let entry = self.region_mut(DeviceOp::Unmap, region)?;
        match entry.mapped {
            Some(mapped) if mapped == mode => {}
            Some(mapped) => {
                return Err(Error::device(
                    DeviceOp::Unmap,
                    format!("region {region} mapped {mapped}, unmapped as {mode}"),
                ))
            }
            None => {
                return Err(Error::device(
                    DeviceOp::Unmap,
                    format!("region {region} is not mapped"),
                ))
            }
        }

        if mapping.len() != entry.handle.size() {
            return Err(Error::device(
                DeviceOp::Unmap,
                format!(
                    "mapping of {} bytes does not match region {region} of {} bytes",
                    mapping.len(),
                    entry.handle.size()
                ),
            ));
        }

        if mode.host_can_write() {
            entry.memory.lock().copy_from_slice(mapping.as_slice());
        }
        entry.mapped = None;
        self.journal.push(SimEvent::Unmap(region));
        trace!(%region, "sim unmap");
        Ok(())
    }

    fn submit_task(&mut self, kernel: &str, args: TaskArgs) -> Result<TaskHandle> {
        self.inject(DeviceOp::Submit)?;
        if !self.info.has_kernel(kernel) {
            return Err(Error::device(
                DeviceOp::Submit,
                format!("no kernel named {kernel}"),
            ));
        }
        if let Some(outstanding) = &self.outstanding {
            return Err(Error::device(
                DeviceOp::Submit,
                format!("task {} still outstanding", outstanding.task.0),
            ));
        }
        if args.active_index > 1 {
            return Err(Error::device(
                DeviceOp::Submit,
                format!("active index {} out of range", args.active_index),
            ));
        }

        let source = args.source();
        let layout = self.layout;
        let delay = self.kernel_delay;
        let entry = self.region_mut(DeviceOp::Submit, source)?;
        if let Some(mode) = entry.mapped {
            return Err(Error::device(
                DeviceOp::Submit,
                format!("region {source} is still mapped {mode} on the host"),
            ));
        }
        let capacity = layout.max_units(entry.handle.size());
        if args.unit_count > capacity {
            return Err(Error::device(
                DeviceOp::Submit,
                format!("{} units exceed region capacity {capacity}", args.unit_count),
            ));
        }

        let memory = Arc::clone(&entry.memory);
        let units = args.unit_count;
        let worker = std::thread::spawn(move || hash_units(&memory, layout, units, delay));

        let task = TaskHandle(self.next_task);
        self.next_task += 1;
        self.outstanding = Some(Outstanding {
            task,
            region: source.id(),
            worker,
        });
        self.journal.push(SimEvent::Submit {
            task,
            source,
            units,
        });
        trace!(task = task.0, %source, units, "sim submit");
        Ok(task)
    }

    fn wait_for_completion(&mut self) -> Result<()> {
        self.inject(DeviceOp::Wait)?;
        self.join_outstanding()
    }

    fn release_region(&mut self, region: RegionHandle) -> Result<()> {
        self.inject(DeviceOp::Release)?;
        if self
            .outstanding
            .as_ref()
            .is_some_and(|o| o.region == region.id())
        {
            self.join_outstanding()?;
        }
        let entry = self.region_mut(DeviceOp::Release, region)?;
        if entry.mapped.is_some() {
            return Err(Error::device(
                DeviceOp::Release,
                format!("region {region} is still mapped"),
            ));
        }
        let size = entry.handle.size();
        self.regions.remove(&region.id());
        self.allocated -= size;
        self.journal.push(SimEvent::Release(region));
        Ok(())
    }
}

/// The unit kernel: BLAKE3 over each slot's payload, digest written in place
fn hash_units(
    memory: &Mutex<Vec<u8>>,
    layout: UnitLayout,
    units: usize,
    delay: Duration,
) -> Result<()> {
    let mut region = memory.lock();
    for index in 0..units {
        let digest = *blake3::hash(
            layout
                .payload(&region[..], index)
                .map_err(|err| Error::device(DeviceOp::Wait, format!("kernel: {err}")))?,
        )
        .as_bytes();
        layout
            .set_digest(&mut region[..], index, &digest)
            .map_err(|err| Error::device(DeviceOp::Wait, format!("kernel: {err}")))?;
    }
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> SimDevice {
        SimDevice::new(UnitLayout::new(16))
    }

    #[test]
    fn test_allocate_and_release() {
        let mut dev = device();
        let region = dev.allocate_shared_region(1024).unwrap();
        assert_eq!(dev.allocated_bytes(), 1024);
        assert_eq!(dev.region_count(), 1);

        dev.release_region(region).unwrap();
        assert_eq!(dev.allocated_bytes(), 0);
        assert_eq!(dev.region_count(), 0);
    }

    #[test]
    fn test_allocation_limited_by_memory() {
        let mut dev = device().with_memory(1000);
        dev.allocate_shared_region(600).unwrap();
        let err = dev.allocate_shared_region(600).unwrap_err();
        assert!(matches!(err, Error::Allocation { requested_bytes: 600, .. }));
    }

    #[test]
    fn test_zero_allocation() {
        assert!(device().allocate_shared_region(0).is_err());
    }

    #[test]
    fn test_write_mapping_reaches_device() {
        let mut dev = device();
        let region = dev.allocate_shared_region(8).unwrap();
        let mut view = dev.map_for_host(region, MapMode::WriteOnly).unwrap();
        view.as_mut_slice().unwrap().copy_from_slice(b"12345678");
        dev.unmap_from_host(&mut view).unwrap();

        assert_eq!(dev.peek(region).unwrap(), b"12345678");
    }

    #[test]
    fn test_double_map_rejected() {
        let mut dev = device();
        let region = dev.allocate_shared_region(8).unwrap();
        let _view = dev.map_for_host(region, MapMode::ReadWrite).unwrap();
        let err = dev.map_for_host(region, MapMode::ReadOnly).unwrap_err();
        assert!(matches!(err, Error::Device { op: DeviceOp::Map, .. }));
    }

    #[test]
    fn test_submit_mapped_region_rejected() {
        let mut dev = device();
        let r0 = dev.allocate_shared_region(64).unwrap();
        let r1 = dev.allocate_shared_region(64).unwrap();
        let _view = dev.map_for_host(r0, MapMode::WriteOnly).unwrap();

        let args = TaskArgs {
            regions: [r0, r1],
            active_index: 0,
            unit_count: 1,
        };
        assert!(dev.submit_task(DEFAULT_KERNEL, args).is_err());
    }

    #[test]
    fn test_kernel_hashes_units_in_place() {
        let layout = UnitLayout::new(16);
        let mut dev = SimDevice::new(layout);
        let r0 = dev.allocate_shared_region(layout.slot_size() * 2).unwrap();
        let r1 = dev.allocate_shared_region(layout.slot_size() * 2).unwrap();

        let mut view = dev.map_for_host(r0, MapMode::WriteOnly).unwrap();
        layout.write_unit(view.as_mut_slice().unwrap(), 0, b"alpha").unwrap();
        layout.write_unit(view.as_mut_slice().unwrap(), 1, b"beta").unwrap();
        dev.unmap_from_host(&mut view).unwrap();

        let args = TaskArgs {
            regions: [r0, r1],
            active_index: 0,
            unit_count: 2,
        };
        dev.submit_task(DEFAULT_KERNEL, args).unwrap();
        assert!(dev.has_outstanding());
        dev.wait_for_completion().unwrap();
        assert!(!dev.has_outstanding());

        let memory = dev.peek(r0).unwrap();
        assert_eq!(
            layout.digest(&memory, 0).unwrap(),
            *blake3::hash(b"alpha").as_bytes()
        );
        assert_eq!(
            layout.digest(&memory, 1).unwrap(),
            *blake3::hash(b"beta").as_bytes()
        );
    }

    #[test]
    fn test_second_submit_while_outstanding_rejected() {
        let mut dev = device().with_kernel_delay(Duration::from_millis(20));
        let r0 = dev.allocate_shared_region(64).unwrap();
        let r1 = dev.allocate_shared_region(64).unwrap();
        let args = TaskArgs {
            regions: [r0, r1],
            active_index: 0,
            unit_count: 0,
        };
        dev.submit_task(DEFAULT_KERNEL, args).unwrap();

        let second = TaskArgs {
            active_index: 1,
            ..args
        };
        assert!(dev.submit_task(DEFAULT_KERNEL, second).is_err());
        dev.wait_for_completion().unwrap();
        dev.submit_task(DEFAULT_KERNEL, second).unwrap();
        dev.wait_for_completion().unwrap();
    }

    #[test]
    fn test_unknown_kernel_rejected() {
        let mut dev = device();
        let r0 = dev.allocate_shared_region(64).unwrap();
        let args = TaskArgs {
            regions: [r0, r0],
            active_index: 0,
            unit_count: 0,
        };
        assert!(dev.submit_task("missing_kernel", args).is_err());
    }

    #[test]
    fn test_fault_injection_is_one_shot() {
        let mut dev = device();
        dev.fail_next(DeviceOp::Allocate);
        assert!(dev.allocate_shared_region(16).is_err());
        assert!(dev.allocate_shared_region(16).is_ok());
    }

    #[test]
    fn test_fail_nth_skips_earlier_calls() {
        let mut dev = device();
        dev.fail_nth(DeviceOp::Allocate, 2);
        assert!(dev.allocate_shared_region(16).is_ok());
        assert!(dev.allocate_shared_region(16).is_ok());
        assert!(dev.allocate_shared_region(16).is_err());
        assert!(dev.allocate_shared_region(16).is_ok());
    }

    #[test]
    fn test_failed_unmap_keeps_region_mapped() {
        let mut dev = device();
        let region = dev.allocate_shared_region(8).unwrap();
        let mut view = dev.map_for_host(region, MapMode::WriteOnly).unwrap();
        view.as_mut_slice().unwrap().copy_from_slice(b"abcdefgh");

        dev.fail_next(DeviceOp::Unmap);
        assert!(dev.unmap_from_host(&mut view).is_err());
        assert_eq!(dev.mapped_regions(), vec![region]);

        dev.unmap_from_host(&mut view).unwrap();
        assert!(dev.mapped_regions().is_empty());
        assert_eq!(dev.peek(region).unwrap(), b"abcdefgh");
    }

    #[test]
    fn test_unmap_length_mismatch_rejected() {
        let mut dev = device();
        let region = dev.allocate_shared_region(8).unwrap();
        let _view = dev.map_for_host(region, MapMode::ReadWrite).unwrap();

        let mut forged = MappedRegion::new(region, MapMode::ReadWrite, BytesMut::zeroed(4));
        let err = dev.unmap_from_host(&mut forged).unwrap_err();
        assert!(matches!(err, Error::Device { op: DeviceOp::Unmap, .. }));
        assert_eq!(dev.mapped_regions(), vec![region]);
    }

    #[test]
    fn test_release_uses_allocated_size() {
        let mut dev = device();
        let region = dev.allocate_shared_region(64).unwrap();
        dev.allocate_shared_region(32).unwrap();

        let forged = RegionHandle::new(region.id(), 4096);
        dev.release_region(forged).unwrap();
        assert_eq!(dev.allocated_bytes(), 32);
        assert_eq!(dev.region_count(), 1);
    }

    #[test]
    fn test_journal_records_commands() {
        let mut dev = device();
        let region = dev.allocate_shared_region(16).unwrap();
        let mut view = dev.map_for_host(region, MapMode::ReadOnly).unwrap();
        dev.unmap_from_host(&mut view).unwrap();

        assert_eq!(
            dev.journal(),
            &[
                SimEvent::Allocate(region),
                SimEvent::Map(region, MapMode::ReadOnly),
                SimEvent::Unmap(region),
            ]
        );
        assert!(dev.mapped_regions().is_empty());
    }
}
