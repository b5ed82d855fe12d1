//! Device integration tests.
//!
//! Scenarios are parameterized with `rstest` so each runs on the headless
//! backend in both completion modes, and on Vulkan when it is available.
//!
//! ```bash
//! cargo test --test device_tests
//! cargo test --test device_tests --features vulkan-backend
//! ```

#[macro_use]
mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use rstest::rstest;

use common::{small_config, test_pattern, Backend};
use graphics_device::backend::ResourceUsage;
use graphics_device::{
    AllocError, DeviceError, QueueKind, ResourceDesc, ResourceState, TextureFormat,
    CONSTANT_BUFFER_ALIGNMENT,
};

// ============================================================================
// Frame loop
// ============================================================================

/// Dynamic memory is reclaimed as frames complete, so a heap smaller than the
/// total allocated over many frames never runs out.
#[rstest]
#[case::headless(Backend::Headless)]
#[case::headless_deferred(Backend::HeadlessDeferred)]
#[case::vulkan(Backend::Vulkan)]
fn test_frame_loop_recycles_dynamic_memory(#[case] backend: Backend) {
    let Some(mut ctx) = backend.create(small_config()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    on_device!(ctx, |device| {
        for frame in 0..50u64 {
            device.begin_render_command_list().unwrap();
            let constants = device
                .allocate_dynamic_buffer(1024, CONSTANT_BUFFER_ALIGNMENT)
                .unwrap();
            device
                .write_dynamic(&constants, &frame.to_le_bytes().repeat(128))
                .unwrap();
            device.allocate_dynamic_descriptors(4).unwrap();
            assert!(device.close_submit_and_present(true).unwrap());
        }

        let stats = device.stats();
        assert_eq!(stats.frames_submitted, 50);
        assert!(stats.dynamic_heap_live <= 4096);
        assert_eq!(device.frame_index(), 50);
        assert_eq!(
            device.last_submitted_fence(QueueKind::Present).map(|v| v.get()),
            Some(50)
        );
    });
}

/// Back buffers are used round-robin.
#[rstest]
#[case::headless(Backend::Headless)]
#[case::vulkan(Backend::Vulkan)]
fn test_back_buffers_rotate(#[case] backend: Backend) {
    let Some(mut ctx) = backend.create(small_config().with_back_buffer_count(2)) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    on_device!(ctx, |device| {
        let mut seen = Vec::new();
        for _ in 0..4 {
            let frame = device.begin_render_command_list().unwrap();
            seen.push(frame.back_buffer_index);
            device.close_submit_and_present(false).unwrap();
        }
        assert_eq!(seen, vec![0, 1, 0, 1]);
    });
}

// ============================================================================
// Uploads and readback
// ============================================================================

/// Initial data goes through the upload queue, the transition queue moves the
/// buffer to copy-source, and a render frame copies it into readback memory.
#[rstest]
#[case::headless(Backend::Headless)]
#[case::headless_deferred(Backend::HeadlessDeferred)]
#[case::vulkan(Backend::Vulkan)]
fn test_upload_readback_round_trip(#[case] backend: Backend) {
    let Some(mut ctx) = backend.create(small_config()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    on_device!(ctx, |device| {
        let data = test_pattern(256);
        let desc = ResourceDesc::buffer(256)
            .with_usage(ResourceUsage::COPY_DST | ResourceUsage::COPY_SRC)
            .with_label("round trip");

        device.begin_upload_command_list().unwrap();
        let buffer = device
            .create_gpu_resource(&desc, ResourceState::CopySource, None, Some(&data))
            .unwrap();
        device.close_upload_command_list().unwrap();

        let frame = device.begin_render_command_list().unwrap();
        let readback = device.allocate_readback_buffer(256, 256).unwrap();
        device
            .record_readback(frame.command_list, buffer, &readback)
            .unwrap();
        device.close_submit_and_present(true).unwrap();
        device.wait_gpu_idle().unwrap();

        assert_eq!(device.readback_bytes(&readback).unwrap(), &data[..]);
        device.release_gpu_resource(buffer).unwrap();
    });
}

/// A texture upload left open is submitted by the next present.
#[rstest]
#[case::headless(Backend::Headless)]
#[case::vulkan(Backend::Vulkan)]
fn test_open_upload_is_flushed_by_present(#[case] backend: Backend) {
    let Some(mut ctx) = backend.create(small_config()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    on_device!(ctx, |device| {
        device.begin_render_command_list().unwrap();
        device.begin_upload_command_list().unwrap();
        let pixels = test_pattern(16 * 16 * 4);
        device
            .create_gpu_resource(
                &ResourceDesc::texture_2d(16, 16, TextureFormat::Rgba8Unorm),
                ResourceState::ShaderResource,
                None,
                Some(&pixels),
            )
            .unwrap();
        device.close_submit_and_present(true).unwrap();

        assert!(!device.queue(QueueKind::Upload).is_open());
        assert_eq!(device.stats().uploads_submitted, 1);
        device.wait_gpu_idle().unwrap();
        assert_eq!(device.stats().upload_heap_live, 0);
    });
}

// ============================================================================
// Timestamps
// ============================================================================

/// Each callback fires exactly once, in recording order, after its frame completes.
#[rstest]
#[case::headless(Backend::Headless)]
#[case::headless_deferred(Backend::HeadlessDeferred)]
#[case::vulkan(Backend::Vulkan)]
fn test_timestamp_callbacks_fire_once(#[case] backend: Backend) {
    let Some(mut ctx) = backend.create(small_config()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let ticks = Arc::new(Mutex::new(Vec::new()));
    on_device!(ctx, |device| {
        assert!(device.timestamp_frequency().unwrap() > 0);

        let frame = device.begin_render_command_list().unwrap();
        for label in 0..3u32 {
            let ticks = Arc::clone(&ticks);
            device
                .query_timestamp(frame.command_list, move |tick| {
                    ticks.lock().push((label, tick))
                })
                .unwrap();
        }
        device.close_submit_and_present(true).unwrap();
        device.wait_gpu_idle().unwrap();

        for _ in 0..4 {
            device.begin_render_command_list().unwrap();
            device.close_submit_and_present(true).unwrap();
        }
        device.wait_gpu_idle().unwrap();
        assert_eq!(device.stats().timestamps_waiting, 0);
    });

    let ticks = ticks.lock();
    assert_eq!(ticks.iter().map(|(label, _)| *label).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(ticks.windows(2).all(|w| w[0].1 <= w[1].1));
}

// ============================================================================
// Exhaustion and retry
// ============================================================================

/// Running out of dynamic memory is retryable once the GPU catches up.
#[rstest]
#[case::headless(Backend::Headless)]
#[case::vulkan(Backend::Vulkan)]
fn test_dynamic_exhaustion_retry_after_idle(#[case] backend: Backend) {
    let Some(mut ctx) = backend.create(small_config()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    on_device!(ctx, |device| {
        device.begin_render_command_list().unwrap();
        device.allocate_dynamic_buffer(3072, 256).unwrap();
        device.close_submit_and_present(true).unwrap();

        // The next list slot has never been used, so nothing is reclaimed yet.
        device.begin_render_command_list().unwrap();
        let err = device.allocate_dynamic_buffer(3072, 256).unwrap_err();
        assert!(
            matches!(
                err,
                DeviceError::AllocationExhausted {
                    reason: AllocError::NoRoom,
                    ..
                }
            ),
            "{err:?}"
        );
        assert!(err.is_retryable());

        device.wait_gpu_idle().unwrap();
        device.allocate_dynamic_buffer(3072, 256).unwrap();
        device.close_submit_and_present(true).unwrap();
    });
}

/// Static descriptors are a fixed budget: exhaustion is not retryable.
#[rstest]
#[case::headless(Backend::Headless)]
#[case::vulkan(Backend::Vulkan)]
fn test_static_descriptor_budget(#[case] backend: Backend) {
    let Some(mut ctx) = backend.create(small_config()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    on_device!(ctx, |device| {
        let first = device.allocate_static_descriptors(30).unwrap();
        assert_eq!(first.index, 0);
        let err = device.allocate_static_descriptors(3).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::StaticDescriptorsExhausted {
                requested: 3,
                remaining: 2,
                ..
            }
        ));
        assert!(!err.is_retryable());
        assert_eq!(device.allocate_static_descriptors(2).unwrap().index, 30);
    });
}

// ============================================================================
// Swap chain
// ============================================================================

#[rstest]
#[case::headless(Backend::Headless)]
#[case::vulkan(Backend::Vulkan)]
fn test_resize_between_frames(#[case] backend: Backend) {
    let Some(mut ctx) = backend.create(small_config()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    on_device!(ctx, |device| {
        device.begin_render_command_list().unwrap();
        device.close_submit_and_present(true).unwrap();

        assert!(!device.resize_swapchain(0, 48).unwrap());
        assert!(device.resize_swapchain(96, 48).unwrap());
        let extent = device.swapchain_extent();
        assert_eq!((extent.width, extent.height), (96, 48));

        let frame = device.begin_render_command_list().unwrap();
        assert_eq!(frame.back_buffer_index, 0);
        device.close_submit_and_present(true).unwrap();
    });
}

// ============================================================================
// Teardown
// ============================================================================

/// Released resources and pending uploads are all settled by destroy.
#[rstest]
#[case::headless(Backend::Headless)]
#[case::headless_deferred(Backend::HeadlessDeferred)]
#[case::vulkan(Backend::Vulkan)]
fn test_release_and_destroy(#[case] backend: Backend) {
    let Some(mut ctx) = backend.create(small_config()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    on_device!(ctx, |device| {
        let desc = ResourceDesc::buffer(64);
        let idle = device
            .create_gpu_resource(&desc, ResourceState::Common, None, None)
            .unwrap();

        device.begin_upload_command_list().unwrap();
        let uploaded = device
            .create_gpu_resource(&desc, ResourceState::ShaderResource, None, Some(&[1u8; 64]))
            .unwrap();
        device.close_upload_command_list().unwrap();
        device.begin_render_command_list().unwrap();
        device.release_gpu_resource(uploaded).unwrap();
        device.close_submit_and_present(true).unwrap();
        device.release_gpu_resource(idle).unwrap();

        device.wait_gpu_idle().unwrap();
        assert_eq!(device.stats().deferred_releases, 0);
    });

    match ctx {
        common::TestDevice::Headless(device) => device.destroy().unwrap(),
        #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
        common::TestDevice::Vulkan(device) => device.destroy().unwrap(),
    }
}

// ============================================================================
// Frames in flight
// ============================================================================

/// With every render list in flight, the next frame blocks until the GPU
/// retires the oldest one.
#[test]
fn test_begin_blocks_until_oldest_frame_retires() {
    use std::thread;
    use std::time::{Duration, Instant};

    use graphics_device::backend::{Completion, HeadlessBackend, HeadlessConfig};
    use graphics_device::Device;

    let _ = env_logger::builder().is_test(true).try_init();
    let backend =
        HeadlessBackend::new(HeadlessConfig::default().with_completion(Completion::Manual));
    let gpu = backend.gpu();
    let mut device =
        Device::new(backend, small_config().with_render_command_list_count(2)).unwrap();

    for _ in 0..2 {
        device.begin_render_command_list().unwrap();
        device.close_submit_and_present(true).unwrap();
    }
    assert_eq!(device.last_completed_fence(QueueKind::Present), None);

    let delay = Duration::from_millis(50);
    let retirer = {
        let gpu = gpu.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            gpu.retire_all();
        })
    };

    let started = Instant::now();
    device.begin_render_command_list().unwrap();
    assert!(started.elapsed() >= delay);
    retirer.join().unwrap();

    assert!(device.last_completed_fence(QueueKind::Present).is_some());
    device.close_submit_and_present(true).unwrap();

    gpu.retire_all();
    device.destroy().unwrap();
}

/// A fence that never completes is reported as device loss once the
/// configured timeout passes.
#[test]
fn test_fence_timeout_reports_device_loss() {
    use std::time::Duration;

    use graphics_device::backend::{Completion, HeadlessBackend, HeadlessConfig};
    use graphics_device::Device;

    let backend =
        HeadlessBackend::new(HeadlessConfig::default().with_completion(Completion::Manual));
    let gpu = backend.gpu();
    let config = small_config()
        .with_render_command_list_count(1)
        .with_fence_timeout(Duration::from_millis(10));
    let mut device = Device::new(backend, config).unwrap();

    device.begin_render_command_list().unwrap();
    device.close_submit_and_present(true).unwrap();
    let err = device.begin_render_command_list().unwrap_err();
    assert!(err.is_device_lost(), "{err:?}");

    gpu.retire_all();
}

/// After a failed submission every later call reports device loss instead
/// of waiting on a fence nothing will signal, and dropping the device returns.
#[rstest]
#[case::one_list(1)]
#[case::three_lists(3)]
fn test_failed_submit_reports_loss_and_drops(#[case] render_lists: u32) {
    use graphics_device::Device;

    let _ = env_logger::builder().is_test(true).try_init();
    let device = Device::headless(small_config().with_render_command_list_count(render_lists));
    let mut device = device.unwrap();
    let gpu = device.backend().gpu();

    device.begin_render_command_list().unwrap();
    device.close_submit_and_present(true).unwrap();

    device.begin_render_command_list().unwrap();
    gpu.fail_next_submit();
    assert!(device.close_submit_and_present(true).unwrap_err().is_device_lost());

    for _ in 0..render_lists + 1 {
        let err = device.begin_render_command_list().unwrap_err();
        assert!(err.is_device_lost(), "{err:?}");
    }
    assert!(device.wait_gpu_idle().unwrap_err().is_device_lost());
    drop(device);
}
