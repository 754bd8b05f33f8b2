//! hash command - stream a file through the offload pipeline
//!
//! The file is cut into `unit_payload`-sized chunks. Each pass fills the
//! active buffer with as many chunks as fit, and the digests come back one
//! pass later, so the command keeps the previous batch around to match
//! results to file offsets.

use anyhow::{Context, Result};
use duplex_core::{
    AcceleratorDevice, PipelineConfig, PipelineController, ResultRegion, SimDevice, StatsSummary,
    WithDevice,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Digest of one chunk
#[derive(Debug, Clone, Serialize)]
pub struct ChunkDigest {
    pub index: usize,
    pub offset: u64,
    pub len: usize,
    pub blake3: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
}

/// Result of hashing one file
#[derive(Debug, Serialize)]
pub struct HashReport {
    pub file: String,
    pub size: u64,
    pub chunk_size: usize,
    pub device: String,
    pub chunks: Vec<ChunkDigest>,
    pub mismatches: usize,
    pub stats: StatsSummary,
}

/// Execute the hash command
///
/// # Errors
/// Returns an error if the file cannot be read, the pipeline fails under the
/// `propagate` policy, or `--verify` finds a mismatching digest.
pub fn execute(file: &Path, config: PipelineConfig, verify: bool, json: bool) -> Result<()> {
    tracing::info!(file = %file.display(), chunk_size = config.unit_payload, "hashing file");

    let progress = if json {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
            )?
            .progress_chars("=> "),
        );
        bar
    };

    let report = hash_file(file, config, verify, &progress)?;
    progress.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, verify);
    }

    if report.mismatches > 0 {
        anyhow::bail!(
            "{} of {} chunks did not match CPU hashing",
            report.mismatches,
            report.chunks.len()
        );
    }
    Ok(())
}

/// Hash `path` through a pipeline built from `config`
pub fn hash_file(
    path: &Path,
    config: PipelineConfig,
    verify: bool,
    progress: &ProgressBar,
) -> Result<HashReport> {
    let policy = config.on_device_error;
    let chunk_size = config.unit_payload;
    let capacity = config.max_units();

    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let size = file.metadata()?.len();
    progress.set_length(size);
    let mut reader = BufReader::new(file);

    let device = SimDevice::new(config.layout());
    let mut ctl = policy
        .check(PipelineController::new(device, config))
        .context("Failed to initialize offload pipeline")?;
    let device_name = ctl.device().info().to_string();
    let stats = ctl.stats();

    let mut chunks = Vec::new();
    let mut in_flight: Vec<Vec<u8>> = Vec::new();
    loop {
        let batch = read_batch(&mut reader, chunk_size, capacity)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if batch.is_empty() {
            break;
        }

        progress.inc(batch.iter().map(|c| c.len() as u64).sum());
        let n = ctl.fill(&batch)?;
        let result = policy.check(ctl.run(n)).context("Pipeline pass failed")?;
        if result.is_valid() {
            collect(&result, &in_flight, chunk_size, verify, &mut chunks)?;
        }
        in_flight = batch;
    }

    if ctl.passes() > 0 {
        let last = policy
            .check(ctl.read_last_result())
            .context("Failed to read final result")?;
        collect(&last, &in_flight, chunk_size, verify, &mut chunks)?;
        policy
            .check(ctl.unmap_last_result())
            .context("Failed to release final result")?;
    }
    policy
        .check(ctl.shutdown().map_err(WithDevice::into_error))
        .context("Failed to shut down offload pipeline")?;

    let mismatches = chunks.iter().filter(|c| c.verified == Some(false)).count();
    Ok(HashReport {
        file: path.display().to_string(),
        size,
        chunk_size,
        device: device_name,
        chunks,
        mismatches,
        stats: stats.summary(),
    })
}

/// Read up to `max` chunks; only the last chunk of the file may be short
fn read_batch<R: Read>(reader: &mut R, chunk_size: usize, max: usize) -> io::Result<Vec<Vec<u8>>> {
    let mut batch = Vec::new();
    while batch.len() < max {
        let mut chunk = Vec::with_capacity(chunk_size);
        reader.by_ref().take(chunk_size as u64).read_to_end(&mut chunk)?;
        if chunk.is_empty() {
            break;
        }
        let short = chunk.len() < chunk_size;
        batch.push(chunk);
        if short {
            break;
        }
    }
    Ok(batch)
}

fn collect(
    result: &ResultRegion<'_>,
    batch: &[Vec<u8>],
    chunk_size: usize,
    verify: bool,
    chunks: &mut Vec<ChunkDigest>,
) -> Result<()> {
    anyhow::ensure!(
        result.unit_count() == batch.len(),
        "result holds {} units, {} were submitted",
        result.unit_count(),
        batch.len()
    );

    for (i, payload) in batch.iter().enumerate() {
        let digest = result.digest(i)?;
        let index = chunks.len();
        let verified = verify.then(|| blake3::hash(payload).as_bytes() == &digest);
        if verified == Some(false) {
            tracing::warn!(index, "digest mismatch");
        }
        chunks.push(ChunkDigest {
            index,
            offset: (index * chunk_size) as u64,
            len: payload.len(),
            blake3: hex::encode(digest),
            verified,
        });
    }
    Ok(())
}

fn print_report(report: &HashReport, verify: bool) {
    for chunk in &report.chunks {
        let mark = match chunk.verified {
            Some(true) => "  ok",
            Some(false) => "  MISMATCH",
            None => "",
        };
        println!("{}  {:>12}  {:>8}{}", chunk.blake3, chunk.offset, chunk.len, mark);
    }

    println!();
    println!("File:        {}", report.file);
    println!("Size:        {} bytes", report.size);
    println!("Chunks:      {} x {} KB", report.chunks.len(), report.chunk_size / 1024);
    println!("Device:      {}", report.device);
    println!("Passes:      {}", report.stats.passes);
    println!(
        "Wait:        avg {}us, max {}us",
        report.stats.avg_wait_us, report.stats.max_wait_us
    );
    if verify {
        println!(
            "Verified:    {}/{}",
            report.chunks.len() - report.mismatches,
            report.chunks.len()
        );
    }
}
