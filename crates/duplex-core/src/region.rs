//! Host views of device-shared memory
//!
//! A [`MappedRegion`] exists only between a map and the matching unmap.
//! Backends produce it from `map_for_host`; `unmap_from_host` borrows it and
//! the owner drops it once the unmap succeeds. A failed unmap leaves the view
//! with its owner, so the region is never host-mapped without one.

use crate::device::RegionHandle;
use crate::error::{Error, Result};
use bytes::BytesMut;
use std::fmt;

/// Host access requested when mapping a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapMode {
    /// Host fills the region; prior contents are undefined
    WriteOnly,
    /// Host reads a result; writes are rejected
    ReadOnly,
    /// Host reads a result and may refill the region
    ReadWrite,
}

impl MapMode {
    /// Host may read the mapped bytes
    #[inline]
    pub fn host_can_read(&self) -> bool {
        !matches!(self, MapMode::WriteOnly)
    }

    /// Host may write the mapped bytes
    #[inline]
    pub fn host_can_write(&self) -> bool {
        !matches!(self, MapMode::ReadOnly)
    }
}

impl fmt::Display for MapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapMode::WriteOnly => write!(f, "write-only"),
            MapMode::ReadOnly => write!(f, "read-only"),
            MapMode::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// A region currently mapped for host access
pub struct MappedRegion {
    region: RegionHandle,
    mode: MapMode,
    data: BytesMut,
}

impl MappedRegion {
    /// Wrap the host bytes of a freshly mapped region
    ///
    /// Called by device backends when servicing a map.
    pub fn new(region: RegionHandle, mode: MapMode, data: BytesMut) -> Self {
        Self { region, mode, data }
    }

    /// Region this view maps
    #[inline]
    pub fn region(&self) -> RegionHandle {
        self.region
    }

    /// Access mode of the mapping
    #[inline]
    pub fn mode(&self) -> MapMode {
        self.mode
    }

    /// Mapped length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the mapping is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read access to the mapped bytes
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Write access to the mapped bytes
    ///
    /// # Errors
    /// Returns error for read-only mappings
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        if !self.mode.host_can_write() {
            return Err(Error::invalid_state(format!(
                "region {} is mapped {}",
                self.region, self.mode
            )));
        }
        Ok(&mut self.data[..])
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("region", &self.region)
            .field("mode", &self.mode)
            .field("len", &self.data.len())
            .finish()
    }
}
