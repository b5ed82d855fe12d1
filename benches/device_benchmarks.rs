use criterion::{Criterion, black_box, criterion_group, criterion_main};

use graphics_device::{CONSTANT_BUFFER_ALIGNMENT, Device, DeviceConfig, FenceValue, RingAllocator};

// ---------------------------------------------------------------------------
// Ring allocator
// ---------------------------------------------------------------------------

fn bench_ring_allocate_flash(c: &mut Criterion) {
    c.bench_function("ring_allocate_64_then_flash", |b| {
        let mut ring = RingAllocator::new(1 << 20).unwrap();
        let mut fence = FenceValue::FIRST;
        b.iter(|| {
            for _ in 0..64 {
                black_box(ring.allocate(1024, 256).unwrap());
            }
            ring.add_pending_fence(fence);
            ring.flash_fence_value(fence);
            fence = fence.next();
        });
    });
}

fn bench_ring_wraparound(c: &mut Criterion) {
    c.bench_function("ring_wraparound_3_frames_in_flight", |b| {
        let mut ring = RingAllocator::new(64 * 1024).unwrap();
        let mut fence = FenceValue::FIRST;
        let mut in_flight = std::collections::VecDeque::new();
        b.iter(|| {
            if in_flight.len() == 3 {
                if let Some(done) = in_flight.pop_front() {
                    ring.flash_fence_value(done);
                }
            }
            // Odd size so allocations straddle the end of the ring.
            black_box(ring.allocate(7000, 256).unwrap());
            ring.add_pending_fence(fence);
            in_flight.push_back(fence);
            fence = fence.next();
        });
    });
}

// ---------------------------------------------------------------------------
// Headless frame loop
// ---------------------------------------------------------------------------

fn bench_headless_frame(c: &mut Criterion) {
    c.bench_function("headless_frame_16_constant_buffers", |b| {
        let mut device = Device::headless(DeviceConfig::default()).unwrap();
        b.iter(|| {
            device.begin_render_command_list().unwrap();
            for i in 0..16u32 {
                let alloc = device
                    .allocate_dynamic_buffer(256, CONSTANT_BUFFER_ALIGNMENT)
                    .unwrap();
                device.write_dynamic_pod(&alloc, &[i; 64]).unwrap();
            }
            black_box(device.allocate_dynamic_descriptors(16).unwrap());
            device.close_submit_and_present(false).unwrap();
        });
        device.destroy().unwrap();
    });
}

fn bench_headless_frame_with_timestamps(c: &mut Criterion) {
    c.bench_function("headless_frame_2_timestamps", |b| {
        let mut device = Device::headless(DeviceConfig::default()).unwrap();
        b.iter(|| {
            let frame = device.begin_render_command_list().unwrap();
            device
                .query_timestamp(frame.command_list, |tick| {
                    black_box(tick);
                })
                .unwrap();
            device
                .query_timestamp(frame.command_list, |tick| {
                    black_box(tick);
                })
                .unwrap();
            device.close_submit_and_present(false).unwrap();
        });
        device.destroy().unwrap();
    });
}

criterion_group!(
    benches,
    bench_ring_allocate_flash,
    bench_ring_wraparound,
    bench_headless_frame,
    bench_headless_frame_with_timestamps,
);
criterion_main!(benches);
