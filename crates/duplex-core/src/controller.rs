//! Double-buffered pipeline controller
//!
//! Two transfer buffers alternate roles. On every [`run`] the active buffer
//! is unmapped and submitted, the other buffer (the previous pass's
//! destination) is mapped back for the host, and the roles swap:
//!
//! ```text
//! run #1:  buf0 ──submit──▶ device        buf1 ──map──▶ host (no result yet)
//! run #2:  buf1 ──submit──▶ device        buf0 ──map──▶ host (result of #1)
//! run #3:  buf0 ──submit──▶ device        buf1 ──map──▶ host (result of #2)
//! drain:   buf0 ◀──map (read-only)        buf1 ──unmap──▶ (consumed)
//! ```
//!
//! The region handed back by `run` is also the next one submitted: the
//! caller reads the result out of it, then writes the next batch in place.
//! The result of the final submission needs [`read_last_result`] followed by
//! [`unmap_last_result`].
//!
//! [`run`]: PipelineController::run
//! [`read_last_result`]: PipelineController::read_last_result
//! [`unmap_last_result`]: PipelineController::unmap_last_result

use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::buffer::{BufferState, TransferBuffer};
use crate::config::PipelineConfig;
use crate::device::{AcceleratorDevice, RegionHandle, TaskArgs};
use crate::error::{Error, Result, WithDevice};
use crate::layout::{Digest, UnitLayout};
use crate::region::{MapMode, MappedRegion};
use crate::stats::{PipelineStats, SharedStats};
use std::sync::Arc;

/// Lifecycle phase of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting `run` calls
    Running,
    /// Final result mapped by `read_last_result`
    Drained,
    /// Final result unmapped; no buffer is host-mapped
    Released,
    /// A device command failed; only `shutdown` is accepted
    Failed,
}

/// Host view of a result returned by the controller
///
/// Borrows the controller mutably, so it must be dropped before the next
/// call; a region handed back to the device is never reachable from here.
#[derive(Debug)]
pub struct ResultRegion<'a> {
    mapping: &'a mut MappedRegion,
    layout: UnitLayout,
    buffer_index: usize,
    unit_count: usize,
    pass: Option<u64>,
}

impl<'a> ResultRegion<'a> {
    /// False on the very first `run`, when the mapped region holds no result
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.pass.is_some()
    }

    /// Zero-based submission whose result this region holds
    #[inline]
    pub fn pass(&self) -> Option<u64> {
        self.pass
    }

    /// Units submitted in that pass (0 when invalid)
    #[inline]
    pub fn unit_count(&self) -> usize {
        self.unit_count
    }

    /// Transfer buffer (0 or 1) backing this region
    #[inline]
    pub fn buffer_index(&self) -> usize {
        self.buffer_index
    }

    /// Access mode of the underlying mapping
    #[inline]
    pub fn mode(&self) -> MapMode {
        self.mapping.mode()
    }

    /// Raw region bytes
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.mapping.as_slice()
    }

    /// Writable region bytes, for refilling before the next `run`
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        self.mapping.as_mut_slice()
    }

    fn check_unit(&self, index: usize) -> Result<()> {
        if index >= self.unit_count {
            return Err(Error::UnitOutOfRange {
                index,
                capacity: self.unit_count,
            });
        }
        Ok(())
    }

    /// Digest computed for unit `index`
    pub fn digest(&self, index: usize) -> Result<Digest> {
        self.check_unit(index)?;
        self.layout.digest(self.mapping.as_slice(), index)
    }

    /// Payload of unit `index`
    pub fn payload(&self, index: usize) -> Result<&[u8]> {
        self.check_unit(index)?;
        self.layout.payload(self.mapping.as_slice(), index)
    }

    /// All digests of this result, in unit order
    pub fn digests(&self) -> Result<Vec<Digest>> {
        (0..self.unit_count).map(|i| self.digest(i)).collect()
    }

    /// Overwrite unit slot `index` with the next batch's payload
    pub fn write_unit(&mut self, index: usize, payload: &[u8]) -> Result<()> {
        let layout = self.layout;
        layout.write_unit(self.mapping.as_mut_slice()?, index, payload)
    }
}

/// Alternating dual-buffer controller over one device session
pub struct PipelineController<D: AcceleratorDevice> {
    device: D,
    config: PipelineConfig,
    layout: UnitLayout,
    buffers: [TransferBuffer; 2],
    active: usize,
    passes: u64,
    phase: Phase,
    stats: SharedStats,
}

impl<D: AcceleratorDevice> PipelineController<D> {
    /// Take ownership of `device` and set up both transfer buffers
    ///
    /// Buffer 0 is mapped write-only for the first batch; buffer 1 stays
    /// unmapped until the first `run`.
    ///
    /// # Errors
    /// Returns `Error::Allocation` if either region cannot be allocated, or a
    /// device error if the first mapping fails. The device is dropped; use
    /// [`open`](Self::open) to get it back.
    pub fn new(device: D, config: PipelineConfig) -> Result<Self> {
        Self::open(device, config).map_err(WithDevice::into_error)
    }

    /// Like [`new`](Self::new), but a failure hands the device back
    ///
    /// Regions allocated before the failure are released first.
    pub fn open(
        mut device: D,
        config: PipelineConfig,
    ) -> std::result::Result<Self, WithDevice<D>> {
        if let Err(error) = check_device(&device, &config) {
            return Err(WithDevice { error, device });
        }

        info!(
            device = %device.info(),
            buffer_size = config.buffer_size,
            max_units = config.max_units(),
            "initializing offload pipeline"
        );

        let size = config.buffer_size;
        let first = match allocate(&mut device, size) {
            Ok(region) => region,
            Err(error) => return Err(WithDevice { error, device }),
        };
        let second = match allocate(&mut device, size) {
            Ok(region) => region,
            Err(error) => {
                release_all(&mut device, &[first]);
                return Err(WithDevice { error, device });
            }
        };

        let mut buffers = [TransferBuffer::new(0, first), TransferBuffer::new(1, second)];
        let mapping = match device.map_for_host(first, MapMode::WriteOnly) {
            Ok(mapping) => mapping,
            Err(error) => {
                release_all(&mut device, &[first, second]);
                return Err(WithDevice { error, device });
            }
        };
        let stats = Arc::new(PipelineStats::new());
        stats.record_mapped(mapping.len());
        if let Err(error) = buffers[0].attach(mapping) {
            return Err(WithDevice { error, device });
        }
        debug!(host = %first, idle = %second, "transfer buffers allocated");

        Ok(Self {
            device,
            layout: config.layout(),
            config,
            buffers,
            active: 0,
            passes: 0,
            phase: Phase::Running,
            stats,
        })
    }

    /// Submit the active buffer and retrieve the previous pass's result
    ///
    /// `unit_count` is the number of units written into the active buffer
    /// since the last call. The returned region holds the result of the
    /// previous `run` (invalid on the first call) and becomes the next active
    /// buffer.
    ///
    /// # Errors
    /// `EmptySubmission` / `CapacityExceeded` for a bad `unit_count`,
    /// `InvalidState` after the drain or a device failure, and `Device`
    /// errors from the accelerator (which leave the controller `Failed`).
    pub fn run(&mut self, unit_count: usize) -> Result<ResultRegion<'_>> {
        self.ensure_phase(Phase::Running, "run")?;
        if unit_count == 0 {
            return Err(Error::EmptySubmission);
        }
        let capacity = self.config.max_units();
        if unit_count > capacity {
            return Err(Error::CapacityExceeded {
                requested: unit_count,
                capacity,
            });
        }

        let active = self.active;
        let inactive = 1 - active;
        let pass = self.passes;
        debug!(pass, active, unit_count, "submitting pass");

        let result_units = match self.submit_and_retrieve(active, unit_count) {
            Ok(units) => units,
            Err(err) => return Err(self.fail(err)),
        };

        self.active = inactive;
        self.passes += 1;
        let result_pass = pass.checked_sub(1);
        if result_pass.is_some() {
            self.stats.record_result(result_units);
        }
        trace!(pass, active = self.active, result_units, "pass complete");
        self.check_invariants();

        self.result_region(inactive, result_units, result_pass)
    }

    fn submit_and_retrieve(&mut self, active: usize, unit_count: usize) -> Result<usize> {
        let inactive = 1 - active;

        // Host gives up the active buffer before the device sees it
        self.unmap_buffer(active)?;
        self.buffers[active].hand_to_device();
        self.buffers[active].record_units(unit_count);

        let args = TaskArgs {
            regions: [self.buffers[0].region(), self.buffers[1].region()],
            active_index: active,
            unit_count,
        };
        let task = self.device.submit_task(&self.config.kernel, args)?;
        trace!(task = task.0, source = %args.source(), "task submitted");

        // Previous destination comes back with last pass's result
        let mapping = self
            .device
            .map_for_host(self.buffers[inactive].region(), MapMode::ReadWrite)?;
        self.stats.record_mapped(mapping.len());
        self.buffers[inactive].attach(mapping)?;
        let result_units = self.buffers[inactive].take_units();

        let started = Instant::now();
        self.device.wait_for_completion()?;
        self.stats.record_pass(unit_count, started.elapsed());

        Ok(result_units)
    }

    /// Map the result of the final submission without submitting anything
    ///
    /// Unmaps the buffer holding the already-consumed previous result and
    /// maps the last submitted buffer read-only. Must be called once after
    /// the last `run`; otherwise the final batch's output is lost.
    pub fn read_last_result(&mut self) -> Result<ResultRegion<'_>> {
        self.ensure_phase(Phase::Running, "read_last_result")?;
        if self.passes == 0 {
            return Err(Error::invalid_state(
                "read_last_result called before any run",
            ));
        }

        let consumed = self.active;
        let last = 1 - consumed;
        let result_units = match self.drain(consumed, last) {
            Ok(units) => units,
            Err(err) => return Err(self.fail(err)),
        };

        self.phase = Phase::Drained;
        self.stats.record_result(result_units);
        debug!(buffer = last, result_units, "final result mapped");
        self.check_invariants();

        let pass = self.passes - 1;
        self.result_region(last, result_units, Some(pass))
    }

    fn drain(&mut self, consumed: usize, last: usize) -> Result<usize> {
        self.unmap_buffer(consumed)?;
        self.buffers[consumed].retire();

        let mapping = self
            .device
            .map_for_host(self.buffers[last].region(), MapMode::ReadOnly)?;
        self.stats.record_mapped(mapping.len());
        self.buffers[last].attach(mapping)?;
        Ok(self.buffers[last].take_units())
    }

    /// Unmap the final result mapped by `read_last_result`
    pub fn unmap_last_result(&mut self) -> Result<()> {
        self.ensure_phase(Phase::Drained, "unmap_last_result")?;
        let last = 1 - self.active;

        if let Err(err) = self.unmap_buffer(last) {
            return Err(self.fail(err));
        }
        self.buffers[last].retire();

        self.phase = Phase::Released;
        debug!(buffer = last, passes = self.passes, "final result released");
        self.check_invariants();
        Ok(())
    }

    /// Writable view of the active buffer for filling the next batch
    pub fn host_buffer_mut(&mut self) -> Result<&mut MappedRegion> {
        self.ensure_phase(Phase::Running, "host_buffer_mut")?;
        self.buffers[self.active].mapping_mut()
    }

    /// Write `units` into consecutive slots of the active buffer
    ///
    /// Returns the number of units written, to be passed to `run`.
    pub fn fill<I, P>(&mut self, units: I) -> Result<usize>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let layout = self.layout;
        let capacity = self.config.max_units();
        let bytes = self.host_buffer_mut()?.as_mut_slice()?;

        let mut count = 0;
        for unit in units {
            if count == capacity {
                return Err(Error::CapacityExceeded {
                    requested: count + 1,
                    capacity,
                });
            }
            layout.write_unit(bytes, count, unit.as_ref())?;
            count += 1;
        }
        Ok(count)
    }

    /// Unmap anything still host-mapped, free both regions and return the
    /// device session
    ///
    /// Works in every phase, `Failed` included. Teardown is best-effort: a
    /// failure on one buffer is logged and the other is still released. The
    /// first failure is returned together with the device.
    pub fn shutdown(mut self) -> std::result::Result<D, WithDevice<D>> {
        let mut first_error = None;
        for index in 0..2 {
            if let Err(err) = self.teardown_buffer(index) {
                warn!(buffer = index, "teardown failed: {err}");
                first_error.get_or_insert(err);
            }
        }
        info!(passes = self.passes, "offload pipeline shut down");

        match first_error {
            None => Ok(self.device),
            Some(error) => Err(WithDevice {
                error,
                device: self.device,
            }),
        }
    }

    fn teardown_buffer(&mut self, index: usize) -> Result<()> {
        if self.buffers[index].state().is_host_mapped() {
            self.unmap_buffer(index)?;
        }
        self.buffers[index].retire();
        self.device.release_region(self.buffers[index].region())
    }

    /// Unmap a host-mapped buffer; the view is dropped only once the device
    /// accepted the unmap
    fn unmap_buffer(&mut self, index: usize) -> Result<()> {
        let mapping = self.buffers[index].mapping_mut()?;
        self.device.unmap_from_host(mapping)?;
        self.buffers[index].detach().map(drop)
    }

    /// Index of the buffer the next `run` submits
    #[inline]
    pub fn active_index(&self) -> usize {
        self.active
    }

    /// Submissions completed so far
    #[inline]
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// True until the first submission
    #[inline]
    pub fn is_first_pass(&self) -> bool {
        self.passes == 0
    }

    /// Current lifecycle phase
    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Mapping state of buffer `index`, `None` unless `index` is 0 or 1
    pub fn buffer_state(&self, index: usize) -> Option<BufferState> {
        self.buffers.get(index).map(TransferBuffer::state)
    }

    /// Units recorded against buffer `index` and not yet retrieved
    pub fn pending_units(&self, index: usize) -> Option<usize> {
        self.buffers.get(index).map(TransferBuffer::unit_count)
    }

    /// Region backing buffer `index`
    pub fn region(&self, index: usize) -> Option<RegionHandle> {
        self.buffers.get(index).map(TransferBuffer::region)
    }

    /// Units that fit in one buffer
    #[inline]
    pub fn max_units(&self) -> usize {
        self.config.max_units()
    }

    /// Slot layout used for units
    #[inline]
    pub fn layout(&self) -> UnitLayout {
        self.layout
    }

    /// Pipeline configuration
    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Shared statistics handle
    pub fn stats(&self) -> SharedStats {
        Arc::clone(&self.stats)
    }

    /// Device session
    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    fn ensure_phase(&self, expected: Phase, op: &str) -> Result<()> {
        if self.phase != expected {
            return Err(Error::invalid_state(format!(
                "{op} requires phase {expected:?}, controller is {:?}",
                self.phase
            )));
        }
        Ok(())
    }

    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            warn!(passes = self.passes, "device failure, pipeline unusable: {err}");
            self.phase = Phase::Failed;
        }
        err
    }

    fn result_region(
        &mut self,
        index: usize,
        unit_count: usize,
        pass: Option<u64>,
    ) -> Result<ResultRegion<'_>> {
        let layout = self.layout;
        let mapping = self.buffers[index].mapping_mut()?;
        Ok(ResultRegion {
            mapping,
            layout,
            buffer_index: index,
            unit_count,
            pass,
        })
    }

    fn check_invariants(&self) {
        let states = [self.buffers[0].state(), self.buffers[1].state()];
        debug_assert!(
            !(states[0].is_device_owned() && states[1].is_device_owned()),
            "both buffers device-owned"
        );
        debug_assert!(
            !(states[0] == BufferState::HostWritable && states[1] == BufferState::HostWritable),
            "both buffers host-writable"
        );
    }
}

fn check_device<D: AcceleratorDevice>(device: &D, config: &PipelineConfig) -> Result<()> {
    config.validate()?;
    if !device.info().has_kernel(&config.kernel) {
        return Err(Error::InvalidConfig(format!(
            "device {} does not expose kernel {}",
            device.info().name,
            config.kernel
        )));
    }
    Ok(())
}

fn release_all<D: AcceleratorDevice>(device: &mut D, regions: &[RegionHandle]) {
    for &region in regions {
        if let Err(err) = device.release_region(region) {
            warn!("failed to release region {region}: {err}");
        }
    }
}

fn allocate<D: AcceleratorDevice>(device: &mut D, size: usize) -> Result<RegionHandle> {
    device.allocate_shared_region(size).map_err(|err| match err {
        Error::Allocation { .. } => err,
        other => Error::alloc_failed(size, other.to_string()),
    })
}

impl<D: AcceleratorDevice> std::fmt::Debug for PipelineController<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("device", &self.device.info().name)
            .field("buffers", &self.buffers)
            .field("active", &self.active)
            .field("passes", &self.passes)
            .field("phase", &self.phase)
            .finish()
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::backends::SimDevice;

    fn controller() -> PipelineController<SimDevice> {
        let config = PipelineConfig::new()
            .with_buffer_size(4096)
            .with_unit_payload(64);
        let device = SimDevice::new(config.layout());
        PipelineController::new(device, config).unwrap()
    }

    #[test]
    fn test_initial_state() {
        let ctl = controller();
        assert_eq!(ctl.active_index(), 0);
        assert!(ctl.is_first_pass());
        assert_eq!(ctl.phase(), Phase::Running);
        assert_eq!(ctl.buffer_state(0), Some(BufferState::HostWritable));
        assert_eq!(ctl.buffer_state(1), Some(BufferState::Unmapped));
        assert_eq!(ctl.max_units(), 4096 / 100);
    }

    #[test]
    fn test_first_run_returns_invalid_region() {
        let mut ctl = controller();
        let n = ctl.fill([b"unit".as_slice()]).unwrap();
        let result = ctl.run(n).unwrap();
        assert!(!result.is_valid());
        assert_eq!(result.pass(), None);
        assert_eq!(result.unit_count(), 0);
        assert_eq!(result.buffer_index(), 1);
        assert!(result.digest(0).is_err());
    }

    #[test]
    fn test_run_rejects_empty_batch() {
        let mut ctl = controller();
        assert!(matches!(ctl.run(0), Err(Error::EmptySubmission)));
        assert!(ctl.is_first_pass());
        assert_eq!(ctl.buffer_state(0), Some(BufferState::HostWritable));
    }

    #[test]
    fn test_run_rejects_over_capacity() {
        let mut ctl = controller();
        let capacity = ctl.max_units();
        let err = ctl.run(capacity + 1).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { requested, .. } if requested == capacity + 1));
        assert_eq!(ctl.active_index(), 0);
    }

    #[test]
    fn test_fill_rejects_too_many_units() {
        let mut ctl = controller();
        let units = vec![b"x".to_vec(); ctl.max_units() + 1];
        assert!(matches!(
            ctl.fill(&units),
            Err(Error::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_read_last_result_before_run() {
        let mut ctl = controller();
        assert!(matches!(
            ctl.read_last_result(),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_unmap_last_result_requires_drain() {
        let mut ctl = controller();
        ctl.run(1).unwrap();
        assert!(matches!(
            ctl.unmap_last_result(),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_run_after_drain_rejected() {
        let mut ctl = controller();
        ctl.run(1).unwrap();
        ctl.read_last_result().unwrap();
        assert!(matches!(ctl.run(1), Err(Error::InvalidState(_))));
        ctl.unmap_last_result().unwrap();
        assert_eq!(ctl.phase(), Phase::Released);
        assert!(ctl.host_buffer_mut().is_err());
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut ctl = controller();
        ctl.run(1).unwrap();
        let device = ctl.shutdown().unwrap();
        assert_eq!(device.region_count(), 0);
        assert!(device.mapped_regions().is_empty());
        assert!(!device.has_outstanding());
    }

    #[test]
    fn test_accessors_out_of_range() {
        let ctl = controller();
        assert_eq!(ctl.buffer_state(2), None);
        assert_eq!(ctl.pending_units(2), None);
        assert_eq!(ctl.region(usize::MAX), None);
        assert_eq!(ctl.pending_units(1), Some(0));
        assert!(ctl.region(1).is_some());
    }

    #[test]
    fn test_open_returns_device_on_failure() {
        let config = PipelineConfig::compact().with_kernel("sha256_kernel");
        let device = SimDevice::new(config.layout());
        let err = PipelineController::open(device, config).unwrap_err();
        assert!(matches!(err.error, Error::InvalidConfig(_)));
        assert_eq!(err.device.region_count(), 0);
    }

    #[test]
    fn test_missing_kernel_rejected() {
        let config = PipelineConfig::compact().with_kernel("sha256_kernel");
        let device = SimDevice::new(config.layout());
        assert!(matches!(
            PipelineController::new(device, config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_stats_track_passes() {
        let mut ctl = controller();
        let stats = ctl.stats();
        ctl.run(2).unwrap();
        ctl.run(3).unwrap();
        ctl.read_last_result().unwrap();

        assert_eq!(stats.passes(), 2);
        assert_eq!(stats.units_submitted(), 5);
        assert_eq!(stats.results_retrieved(), 2);
        assert_eq!(stats.units_retrieved(), 5);
    }
}
