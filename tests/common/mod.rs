//! Common utilities for device integration tests.
//!
//! Every scenario runs against each backend that can be created here. The
//! Vulkan cases are skipped when the feature is off or no GPU is present.

#![allow(dead_code)]

use graphics_device::backend::{Completion, HeadlessBackend, HeadlessConfig};
use graphics_device::{Device, DeviceConfig};

#[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
use graphics_device::VulkanBackend;

/// Backends a scenario can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Headless, every signal completes at submit.
    Headless,
    /// Headless, signals complete in queue order only when waited on.
    HeadlessDeferred,
    /// Native Vulkan via ash.
    Vulkan,
}

/// A device on one of the backends.
pub enum TestDevice {
    Headless(Device<HeadlessBackend>),
    #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
    Vulkan(Device<VulkanBackend>),
}

impl Backend {
    /// Create a device, or `None` when this backend is unavailable here.
    pub fn create(self, config: DeviceConfig) -> Option<TestDevice> {
        let _ = env_logger::builder().is_test(true).try_init();
        match self {
            Backend::Headless => Some(TestDevice::Headless(
                Device::headless(config).expect("headless device"),
            )),
            Backend::HeadlessDeferred => {
                let backend = HeadlessBackend::new(
                    HeadlessConfig::default().with_completion(Completion::Deferred),
                );
                Some(TestDevice::Headless(
                    Device::new(backend, config).expect("headless device"),
                ))
            }
            Backend::Vulkan => create_vulkan(config),
        }
    }
}

#[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
fn create_vulkan(config: DeviceConfig) -> Option<TestDevice> {
    match Device::vulkan(config) {
        Ok(device) => Some(TestDevice::Vulkan(device)),
        Err(e) => {
            eprintln!("Vulkan device unavailable: {e}");
            None
        }
    }
}

#[cfg(not(all(feature = "vulkan-backend", not(target_arch = "wasm32"))))]
fn create_vulkan(_config: DeviceConfig) -> Option<TestDevice> {
    None
}

/// Small heaps so tests reach the edges quickly.
pub fn small_config() -> DeviceConfig {
    DeviceConfig::default()
        .with_render_command_list_count(3)
        .with_upload_command_list_count(2)
        .with_heap_sizes(64 * 1024, 4096, 4096)
        .with_descriptor_counts(32, 16)
        .with_query_count(16)
        .with_swapchain_extent(64, 64)
}

/// Deterministic byte pattern.
pub fn test_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Run `$body` with `$device` bound to the concrete device inside `$test_device`.
macro_rules! on_device {
    ($test_device:expr, |$device:ident| $body:block) => {
        match $test_device {
            $crate::common::TestDevice::Headless(ref mut $device) => $body,
            #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
            $crate::common::TestDevice::Vulkan(ref mut $device) => $body,
        }
    };
}
