//! Headless or Vulkan frame loop driving the device end to end.
//!
//! Each frame writes a block of constants into dynamic memory, brackets the
//! frame with GPU timestamps and presents. Every few frames a texture is
//! uploaded and released again a few frames later.
//!
//! ```bash
//! cargo run --example frame_loop -- --frames 300
//! cargo run --example frame_loop --features vulkan-backend -- --backend vulkan --validation
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};
use clap::{Parser, ValueEnum};

use graphics_device::backend::{Completion, HeadlessBackend, HeadlessConfig};
use graphics_device::{
    CONSTANT_BUFFER_ALIGNMENT, Device, DeviceConfig, DeviceResult, GpuBackend,
    ResourceDesc, ResourceHandle, ResourceState, TextureFormat,
};

/// Textures stay alive for this many frames after their upload.
const TEXTURE_LIFETIME: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum CliBackend {
    /// CPU simulation, always available.
    #[default]
    Headless,
    /// Native Vulkan (needs the `vulkan-backend` feature).
    Vulkan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum CliCompletion {
    /// Work completes as soon as it is submitted.
    #[default]
    Immediate,
    /// Work completes in queue order when waited on.
    Deferred,
}

/// Frame loop demo for the graphics device.
#[derive(Parser, Debug)]
#[command(name = "frame_loop", about = "Drive the graphics device through a frame loop")]
struct Args {
    /// Backend to run on.
    #[arg(long, default_value = "headless", value_enum)]
    backend: CliBackend,

    /// Completion mode of the headless backend.
    #[arg(long, default_value = "immediate", value_enum)]
    completion: CliCompletion,

    /// Number of frames to render.
    #[arg(long, default_value = "120")]
    frames: u64,

    /// Back buffer width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Back buffer height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Upload a texture every N frames (0 disables uploads).
    #[arg(long, default_value = "10")]
    upload_every: u64,

    /// Disable vertical sync.
    #[arg(long)]
    no_vsync: bool,

    /// Enable the validation layer.
    #[arg(long)]
    validation: bool,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameConstants {
    frame: u32,
    back_buffer: u32,
    resolution: [f32; 2],
    time: f32,
    _pad: [f32; 3],
}

fn main() -> DeviceResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::info!("Graphics device version: {}", graphics_device::VERSION);

    let config = DeviceConfig::default()
        .with_debug_layer(args.validation)
        .with_swapchain_extent(args.width, args.height);

    match args.backend {
        CliBackend::Headless => {
            let completion = match args.completion {
                CliCompletion::Immediate => Completion::Immediate,
                CliCompletion::Deferred => Completion::Deferred,
            };
            let backend = HeadlessBackend::new(HeadlessConfig::default().with_completion(completion));
            run(Device::new(backend, config)?, &args)
        }
        CliBackend::Vulkan => run_vulkan(config, &args),
    }
}

#[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
fn run_vulkan(config: DeviceConfig, args: &Args) -> DeviceResult<()> {
    run(Device::vulkan(config)?, args)
}

#[cfg(not(all(feature = "vulkan-backend", not(target_arch = "wasm32"))))]
fn run_vulkan(_config: DeviceConfig, _args: &Args) -> DeviceResult<()> {
    Err(graphics_device::DeviceError::InvalidConfig(
        "built without the vulkan-backend feature".into(),
    ))
}

fn run<B: GpuBackend>(mut device: Device<B>, args: &Args) -> DeviceResult<()> {
    let frequency = device.timestamp_frequency()?;
    let gpu_ticks = Arc::new(AtomicU64::new(0));
    let mut textures: VecDeque<(u64, ResourceHandle)> = VecDeque::new();
    let started = std::time::Instant::now();

    for frame_number in 0..args.frames {
        if args.upload_every > 0 && frame_number % args.upload_every == 0 {
            textures.push_back((frame_number, upload_texture(&mut device, frame_number)?));
        }

        let frame = device.begin_render_command_list()?;
        let begin_tick = Arc::new(AtomicU64::new(0));
        {
            let begin_tick = Arc::clone(&begin_tick);
            device.query_timestamp(frame.command_list, move |tick| {
                begin_tick.store(tick, Ordering::Release)
            })?;
        }

        let extent = device.swapchain_extent();
        let constants = FrameConstants {
            frame: frame_number as u32,
            back_buffer: frame.back_buffer_index as u32,
            resolution: [extent.width as f32, extent.height as f32],
            time: started.elapsed().as_secs_f32(),
            _pad: [0.0; 3],
        };
        let alloc = match device.allocate_dynamic_buffer(
            std::mem::size_of::<FrameConstants>() as u64,
            CONSTANT_BUFFER_ALIGNMENT,
        ) {
            Err(e) if e.is_retryable() => {
                log::warn!("{}, waiting for the GPU", e);
                device.wait_gpu_idle()?;
                device.allocate_dynamic_buffer(
                    std::mem::size_of::<FrameConstants>() as u64,
                    CONSTANT_BUFFER_ALIGNMENT,
                )?
            }
            other => other?,
        };
        device.write_dynamic_pod(&alloc, &[constants])?;
        device.allocate_dynamic_descriptors(8)?;

        {
            let gpu_ticks = Arc::clone(&gpu_ticks);
            device.query_timestamp(frame.command_list, move |tick| {
                let begin = begin_tick.load(Ordering::Acquire);
                gpu_ticks.fetch_add(tick.saturating_sub(begin), Ordering::Relaxed);
            })?;
        }

        if let Some(&(uploaded_at, texture)) = textures.front() {
            if frame_number >= uploaded_at + TEXTURE_LIFETIME {
                device.release_gpu_resource(texture)?;
                textures.pop_front();
            }
        }

        if !device.close_submit_and_present(!args.no_vsync)? {
            let extent = device.swapchain_extent();
            device.resize_swapchain(extent.width, extent.height)?;
        }

        if (frame_number + 1) % 60 == 0 {
            log::info!("Frame {}: {:?}", frame_number + 1, device.stats());
        }
    }

    device.wait_gpu_idle()?;
    let gpu_seconds = gpu_ticks.load(Ordering::Relaxed) as f64 / frequency as f64;
    log::info!(
        "Rendered {} frames in {:.2?}, {:.3} ms GPU time",
        args.frames,
        started.elapsed(),
        gpu_seconds * 1000.0
    );

    for (_, texture) in textures {
        device.release_gpu_resource(texture)?;
    }
    device.destroy()
}

fn upload_texture<B: GpuBackend>(
    device: &mut Device<B>,
    frame_number: u64,
) -> DeviceResult<ResourceHandle> {
    const SIZE: u32 = 64;
    let shade = (frame_number % 256) as u8;
    let pixels: Vec<u8> = (0..SIZE * SIZE)
        .flat_map(|i| [shade, (i % 256) as u8, (i / SIZE) as u8, 255])
        .collect();

    device.begin_upload_command_list()?;
    let texture = device.create_gpu_resource(
        &ResourceDesc::texture_2d(SIZE, SIZE, TextureFormat::Rgba8Unorm)
            .with_label(format!("texture {}", frame_number)),
        ResourceState::ShaderResource,
        None,
        Some(&pixels),
    )?;
    device.close_upload_command_list()?;
    log::debug!("Uploaded texture for frame {}", frame_number);
    Ok(texture)
}
