//! Accelerator backends
//!
//! Contains concrete implementations of the `AcceleratorDevice` trait.

#[cfg(feature = "sim")]
pub mod sim;

#[cfg(feature = "sim")]
pub use sim::{SimDevice, SimEvent};
