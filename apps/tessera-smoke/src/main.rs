//! Tessera headless smoke test.
//!
//! Uploads a buffer, copies it through device-local memory, reads it back and
//! verifies the contents, then prints device and allocator statistics.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p tessera-smoke -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--size <BYTES>`: Payload size per iteration (default: 1048576)
//! - `--iterations <N>`: Number of round trips (default: 8)
//! - `--legacy-barriers`: Force legacy pipeline barriers
//! - `--no-validation`: Disable validation layers
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use anyhow::{bail, ensure, Context};
use ash::vk;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tessera_test::HeadlessDeviceBuilder;
use tessera_vk::{BufferDesc, CommandList, Device, DeviceConfig, MemoryLocation, SubmitOptions};

struct Options {
    size: u64,
    iterations: u32,
    legacy_barriers: bool,
    validation: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            size: 1024 * 1024,
            iterations: 8,
            legacy_barriers: false,
            validation: cfg!(debug_assertions),
        }
    }
}

fn parse_args() -> anyhow::Result<Option<Options>> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--size" => {
                let value = args.next().context("--size needs a value")?;
                options.size = value.parse().context("invalid --size")?;
            }
            "--iterations" => {
                let value = args.next().context("--iterations needs a value")?;
                options.iterations = value.parse().context("invalid --iterations")?;
            }
            "--legacy-barriers" => options.legacy_barriers = true,
            "--no-validation" => options.validation = false,
            "-h" | "--help" => {
                println!(
                    "Usage: tessera-smoke [--size BYTES] [--iterations N] [--legacy-barriers] [--no-validation]"
                );
                return Ok(None);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    ensure!(options.size > 0 && options.size % 4 == 0, "--size must be a non-zero multiple of 4");
    Ok(Some(options))
}

/// One upload, device-local copy and readback.
fn round_trip(device: &Device, list: &mut CommandList, size: u64, seed: u32) -> anyhow::Result<()> {
    let upload = device.create_buffer(
        &BufferDesc::new(size, vk::BufferUsageFlags::TRANSFER_SRC)
            .with_location(MemoryLocation::CpuToGpu),
    )?;
    let gpu = device.create_buffer(&BufferDesc::new(
        size,
        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
    ))?;
    let readback = device.create_buffer(
        &BufferDesc::new(size, vk::BufferUsageFlags::TRANSFER_DST)
            .with_location(MemoryLocation::GpuToCpu),
    )?;

    let payload: Vec<u8> = (0..size)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed) as u8)
        .collect();
    device.write_buffer(upload, 0, &payload)?;

    let region = vk::BufferCopy::default().size(size);
    list.begin(device)?;
    list.copy_buffer(device, upload, gpu, &[region])?;
    list.copy_buffer(device, gpu, readback, &[region])?;
    list.end(device)?;
    device.submit(list, &SubmitOptions::default())?;

    // Destruction is deferred until the copies retire.
    device.destroy_resource(upload)?;
    device.destroy_resource(gpu)?;

    let matches = {
        let mapped = device.map_for_read(readback)?;
        mapped.as_slice() == payload.as_slice()
    };
    device.destroy_resource(readback)?;
    ensure!(matches, "readback mismatch in iteration {seed}");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Some(options) = parse_args()? else {
        return Ok(());
    };

    let headless = HeadlessDeviceBuilder::new()
        .app_name("tessera-smoke")
        .validation(options.validation)
        .config(DeviceConfig::new().with_legacy_barriers(options.legacy_barriers))
        .build()?;
    let device = headless.device();
    info!(
        "Device: {} using {:?} barriers",
        device.capabilities().summary(),
        device.barrier_strategy()
    );

    let mut list = CommandList::new(device)?;
    let result = (0..options.iterations)
        .try_for_each(|i| round_trip(device, &mut list, options.size, i));

    device.wait_idle()?;
    unsafe { list.destroy(device) };
    result?;

    let stats = device.stats();
    let memory = device.allocator_stats();
    info!(
        submitted = stats.submitted,
        retired = stats.retired,
        pooled_fences = stats.pooled_fences,
        pooled_staging = stats.pooled_staging_buffers,
        "Submissions"
    );
    info!(
        chunks = memory.chunk_count,
        chunk_bytes = memory.chunk_bytes,
        free_bytes = memory.free_bytes,
        dedicated = memory.dedicated_count,
        live_blocks = memory.live_blocks,
        "Memory"
    );
    info!("{} round trips of {} bytes verified", options.iterations, options.size);
    Ok(())
}
