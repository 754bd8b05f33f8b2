//! info command - show the device and the effective pipeline configuration

use anyhow::Result;
use console::style;
use duplex_core::{AcceleratorDevice, DeviceInfo, PipelineConfig, SimDevice};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct InfoReport<'a> {
    device: &'a DeviceInfo,
    config: &'a PipelineConfig,
    slot_size: usize,
    units_per_pass: usize,
    memory_requirement: usize,
    fits_device: bool,
}

/// Execute the info command
pub fn execute(config: &PipelineConfig, json: bool) -> Result<()> {
    let device = SimDevice::new(config.layout());
    let info = device.info();
    let report = InfoReport {
        device: info,
        config,
        slot_size: config.layout().slot_size(),
        units_per_pass: config.max_units(),
        memory_requirement: config.memory_requirement(),
        fits_device: config.memory_requirement() <= info.memory_bytes,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", style("Device").bold().cyan());
    println!("{}", style("=".repeat(50)).dim());
    println!("  Name:            {}", info.name);
    println!("  Vendor:          {}", info.vendor);
    println!("  Shared Memory:   {} MB", info.memory_bytes / (1024 * 1024));
    println!("  Kernels:         {}", info.kernels.join(", "));
    println!();
    println!("{}", style("Pipeline").bold().cyan());
    println!("{}", style("=".repeat(50)).dim());
    println!("  Buffer Size:     {} KB (x2)", config.buffer_size / 1024);
    println!("  Chunk Size:      {} KB", config.unit_payload / 1024);
    println!("  Slot Size:       {} bytes", report.slot_size);
    println!("  Chunks per Pass: {}", report.units_per_pass);
    println!("  Kernel:          {}", config.kernel);
    println!("  On Device Error: {}", config.on_device_error);
    if !report.fits_device {
        println!();
        println!(
            "  {} buffers need {} bytes, device has {}",
            style("Warning:").yellow().bold(),
            report.memory_requirement,
            info.memory_bytes
        );
    }
    Ok(())
}
