//! Transfer buffers
//!
//! Each buffer pairs a device region with its residency: nowhere, on the
//! device, or mapped on the host (in which case the buffer holds the
//! [`MappedRegion`] itself). The observable [`BufferState`] is derived from
//! the residency, so it cannot drift from what is actually mapped.

use crate::device::RegionHandle;
use crate::error::{Error, Result};
use crate::region::{MapMode, MappedRegion};
use std::fmt;

/// Who may currently touch a buffer's region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Mapped by nobody
    Unmapped,
    /// Host-mapped write-only (being filled)
    HostWritable,
    /// Host-mapped read-only (final result)
    HostReadable,
    /// Host-mapped read-write (result that will be refilled)
    HostReadWrite,
    /// Handed to the device
    DeviceOwned,
}

impl BufferState {
    /// Host holds a mapping
    #[inline]
    pub fn is_host_mapped(&self) -> bool {
        matches!(
            self,
            BufferState::HostWritable | BufferState::HostReadable | BufferState::HostReadWrite
        )
    }

    /// Device holds the region
    #[inline]
    pub fn is_device_owned(&self) -> bool {
        matches!(self, BufferState::DeviceOwned)
    }
}

impl From<MapMode> for BufferState {
    fn from(mode: MapMode) -> Self {
        match mode {
            MapMode::WriteOnly => BufferState::HostWritable,
            MapMode::ReadOnly => BufferState::HostReadable,
            MapMode::ReadWrite => BufferState::HostReadWrite,
        }
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferState::Unmapped => write!(f, "unmapped"),
            BufferState::HostWritable => write!(f, "host-writable"),
            BufferState::HostReadable => write!(f, "host-readable"),
            BufferState::HostReadWrite => write!(f, "host-read-write"),
            BufferState::DeviceOwned => write!(f, "device-owned"),
        }
    }
}

enum Residency {
    Idle,
    Device,
    Host(MappedRegion),
}

/// One half of the double buffer
pub(crate) struct TransferBuffer {
    index: usize,
    region: RegionHandle,
    unit_count: usize,
    residency: Residency,
}

impl TransferBuffer {
    pub(crate) fn new(index: usize, region: RegionHandle) -> Self {
        Self {
            index,
            region,
            unit_count: 0,
            residency: Residency::Idle,
        }
    }

    pub(crate) fn region(&self) -> RegionHandle {
        self.region
    }

    pub(crate) fn state(&self) -> BufferState {
        match &self.residency {
            Residency::Idle => BufferState::Unmapped,
            Residency::Device => BufferState::DeviceOwned,
            Residency::Host(mapping) => mapping.mode().into(),
        }
    }

    pub(crate) fn unit_count(&self) -> usize {
        self.unit_count
    }

    /// Record units submitted this pass
    pub(crate) fn record_units(&mut self, unit_count: usize) {
        self.unit_count = unit_count;
    }

    /// Take the recorded count, leaving 0 behind
    pub(crate) fn take_units(&mut self) -> usize {
        std::mem::take(&mut self.unit_count)
    }

    pub(crate) fn mapping_mut(&mut self) -> Result<&mut MappedRegion> {
        let index = self.index;
        match &mut self.residency {
            Residency::Host(mapping) => Ok(mapping),
            _ => Err(Error::invalid_state(format!(
                "buffer {index} is not mapped on the host"
            ))),
        }
    }

    /// Store a fresh host mapping of this buffer's region
    pub(crate) fn attach(&mut self, mapping: MappedRegion) -> Result<()> {
        if mapping.region() != self.region {
            return Err(Error::invalid_state(format!(
                "mapping of region {} attached to buffer {} (region {})",
                mapping.region(),
                self.index,
                self.region
            )));
        }
        if let Residency::Host(_) = self.residency {
            return Err(Error::invalid_state(format!(
                "buffer {} is already mapped on the host",
                self.index
            )));
        }
        self.residency = Residency::Host(mapping);
        Ok(())
    }

    /// Remove the host mapping so it can be passed to an unmap
    pub(crate) fn detach(&mut self) -> Result<MappedRegion> {
        match std::mem::replace(&mut self.residency, Residency::Idle) {
            Residency::Host(mapping) => Ok(mapping),
            other => {
                let state = match other {
                    Residency::Device => BufferState::DeviceOwned,
                    _ => BufferState::Unmapped,
                };
                self.residency = other;
                Err(Error::invalid_state(format!(
                    "buffer {} is {state}, expected a host mapping",
                    self.index
                )))
            }
        }
    }

    pub(crate) fn hand_to_device(&mut self) {
        self.residency = Residency::Device;
    }

    /// Back to unmapped with nothing pending
    pub(crate) fn retire(&mut self) {
        self.residency = Residency::Idle;
        self.unit_count = 0;
    }
}

impl fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("index", &self.index)
            .field("region", &self.region)
            .field("unit_count", &self.unit_count)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn mapping(region: RegionHandle, mode: MapMode) -> MappedRegion {
        MappedRegion::new(region, mode, BytesMut::zeroed(region.size()))
    }

    #[test]
    fn test_state_follows_residency() {
        let region = RegionHandle::new(1, 16);
        let mut buffer = TransferBuffer::new(0, region);
        assert_eq!(buffer.state(), BufferState::Unmapped);

        buffer.attach(mapping(region, MapMode::WriteOnly)).unwrap();
        assert_eq!(buffer.state(), BufferState::HostWritable);

        let view = buffer.detach().unwrap();
        assert_eq!(view.mode(), MapMode::WriteOnly);
        buffer.hand_to_device();
        assert_eq!(buffer.state(), BufferState::DeviceOwned);

        buffer.attach(mapping(region, MapMode::ReadWrite)).unwrap();
        assert_eq!(buffer.state(), BufferState::HostReadWrite);
    }

    #[test]
    fn test_detach_without_mapping_keeps_state() {
        let mut buffer = TransferBuffer::new(1, RegionHandle::new(2, 16));
        buffer.hand_to_device();
        assert!(buffer.detach().is_err());
        assert_eq!(buffer.state(), BufferState::DeviceOwned);
    }

    #[test]
    fn test_double_attach_rejected() {
        let region = RegionHandle::new(1, 16);
        let mut buffer = TransferBuffer::new(0, region);
        buffer.attach(mapping(region, MapMode::ReadOnly)).unwrap();
        assert!(buffer.attach(mapping(region, MapMode::ReadOnly)).is_err());
    }

    #[test]
    fn test_attach_wrong_region_rejected() {
        let mut buffer = TransferBuffer::new(0, RegionHandle::new(1, 16));
        let other = RegionHandle::new(2, 16);
        assert!(buffer.attach(mapping(other, MapMode::ReadWrite)).is_err());
        assert_eq!(buffer.state(), BufferState::Unmapped);
    }

    #[test]
    fn test_take_units_resets() {
        let mut buffer = TransferBuffer::new(0, RegionHandle::new(1, 16));
        buffer.record_units(5);
        assert_eq!(buffer.take_units(), 5);
        assert_eq!(buffer.unit_count(), 0);
    }

    #[test]
    fn test_state_predicates() {
        assert!(BufferState::HostReadWrite.is_host_mapped());
        assert!(!BufferState::DeviceOwned.is_host_mapped());
        assert!(BufferState::DeviceOwned.is_device_owned());
        assert!(!BufferState::Unmapped.is_device_owned());
    }
}
