//! duplex-core: double-buffered offload to an accelerator
//!
//! A chunked computation (per-unit hashing) runs on an accelerator reachable
//! only through a narrow command channel. The [`PipelineController`] keeps
//! the device busy by alternating two shared transfer buffers: while the
//! device works on one, the host reads the previous result out of the other
//! and refills it.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────── PipelineController ────────────────┐
//!  caller ──▶│ buffer 0  ◀─ active ─▶  buffer 1                   │
//!            │   (host fills)            (device computes)        │
//!            └───────────────────┬────────────────────────────────┘
//!                                │ map / unmap / submit / wait
//!                         AcceleratorDevice
//! ```
//!
//! # Example
//!
//! ```
//! use duplex_core::{PipelineConfig, PipelineController, SimDevice};
//!
//! # fn main() -> duplex_core::Result<()> {
//! let config = PipelineConfig::compact();
//! let device = SimDevice::new(config.layout());
//! let mut pipeline = PipelineController::new(device, config)?;
//!
//! let n = pipeline.fill([b"first".as_slice(), b"second".as_slice()])?;
//! let first = pipeline.run(n)?;
//! assert!(!first.is_valid());
//!
//! let n = pipeline.fill([b"third".as_slice()])?;
//! let result = pipeline.run(n)?;
//! assert_eq!(result.unit_count(), 2);
//!
//! let last = pipeline.read_last_result()?;
//! assert_eq!(last.unit_count(), 1);
//! pipeline.unmap_last_result()?;
//! pipeline.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod buffer;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod layout;
pub mod policy;
pub mod region;
pub mod stats;

pub use buffer::BufferState;
pub use config::PipelineConfig;
pub use controller::{Phase, PipelineController, ResultRegion};
pub use device::{AcceleratorDevice, DeviceInfo, RegionHandle, TaskArgs, TaskHandle};
pub use error::{DeviceOp, Error, ErrorKind, Result, WithDevice};
pub use layout::{Digest, UnitLayout};
pub use policy::FailurePolicy;
pub use region::{MapMode, MappedRegion};
pub use stats::{PipelineStats, SharedStats, StatsSummary};

#[cfg(feature = "sim")]
pub use backends::{SimDevice, SimEvent};
