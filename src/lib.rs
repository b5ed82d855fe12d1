//! Graphics Device - GPU command submission and transient resource recycling
//!
//! This crate is the low-level core a renderer is built on. A [`Device`]
//! multiplexes three hardware queues, tracks GPU completion through fences and
//! hands out transient GPU-visible memory and descriptors from ring allocators
//! that never reuse a region before the GPU has finished reading it.
//!
//! Two backends implement the native side:
//! - **Headless**: deterministic CPU simulation, always available
//! - **Vulkan**: ash + gpu-allocator, behind the `vulkan-backend` feature (native only)
//!
//! # Features
//! - Round-robin command lists with bounded frames in flight
//! - Fence-recycled upload, dynamic, readback, descriptor and query rings
//! - Upload queue with cross-queue waits and a barrier-only transition queue
//! - GPU timestamps delivered through completion callbacks
//! - Structured, retryable allocation errors and device-loss reporting

use std::time::Duration;

use raw_window_handle::{
    HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle,
};

pub mod backend;
pub mod command;
pub mod device;
pub mod error;
pub mod fence;
pub mod heaps;
pub mod ring;

mod deferred;
mod swapchain;

pub use backend::{
    BackendError, ClearValue, CommandListHandle, DescriptorRange, Extent2d, GpuBackend,
    HeadlessBackend, QueueKind, ResourceDesc, ResourceHandle, ResourceState, ResourceUsage,
    TextureFormat,
};
pub use command::{CommandList, CommandQueue, PreSignal, Submission};
pub use device::{
    Device, DeviceStats, RenderFrame, CONSTANT_BUFFER_ALIGNMENT, UPLOAD_ALIGNMENT,
};
pub use error::{AllocError, DeviceError, DeviceResult, HeapKind};
pub use fence::FenceValue;
pub use heaps::{DynamicAllocation, ReadbackAllocation, TimestampCallback};
pub use ring::{RingAllocation, RingAllocator};

#[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
pub use backend::vulkan::VulkanBackend;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The window a device presents to.
///
/// Holds raw platform handles; the window must outlive the device.
#[derive(Debug, Clone, Copy)]
pub struct WindowTarget {
    pub window: RawWindowHandle,
    pub display: RawDisplayHandle,
    /// Initial surface size in pixels.
    pub extent: Extent2d,
}

impl WindowTarget {
    /// Capture the raw handles of `window`.
    pub fn new<W>(window: &W, width: u32, height: u32) -> DeviceResult<Self>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let window_handle = window.window_handle().map_err(|e| DeviceError::ResourceCreationFailed {
            what: "surface",
            reason: format!("failed to get window handle: {e}"),
        })?;
        let display_handle = window.display_handle().map_err(|e| DeviceError::ResourceCreationFailed {
            what: "surface",
            reason: format!("failed to get display handle: {e}"),
        })?;
        Ok(Self {
            window: window_handle.as_raw(),
            display: display_handle.as_raw(),
            extent: Extent2d::new(width, height),
        })
    }
}

/// Configuration for creating a [`Device`]
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Enable the native API validation layer
    pub debug_layer: bool,
    /// Enable GPU-assisted shader validation (requires `debug_layer`)
    pub debug_validation_shaders: bool,
    /// Render command lists, i.e. the maximum frames in flight
    pub render_command_list_count: u32,
    /// Upload (and transition) command lists
    pub upload_command_list_count: u32,
    /// Window to present to; `None` renders into offscreen back buffers
    pub window: Option<WindowTarget>,
    /// Staging memory for initial resource data
    pub upload_heap_size_bytes: u64,
    /// Per-frame constant/vertex memory
    pub dynamic_heap_size_bytes: u64,
    /// Per-frame GPU-to-CPU memory
    pub readback_heap_size_bytes: u64,
    /// Per-frame shader-visible descriptors
    pub dynamic_descriptor_count: u32,
    /// Process-lifetime shader-visible descriptors
    pub static_descriptor_count: u32,
    /// Render-target views, back buffers included
    pub render_target_view_count: u32,
    /// Timestamp query slots
    pub query_count: u32,
    /// Swap-chain images
    pub back_buffer_count: u32,
    /// Back-buffer size when no window is given
    pub swapchain_extent: Extent2d,
    pub swapchain_format: TextureFormat,
    /// Fence waits longer than this report device loss; `None` waits forever
    pub fence_timeout: Option<Duration>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            debug_layer: false,
            debug_validation_shaders: false,
            render_command_list_count: 3,
            upload_command_list_count: 2,
            window: None,
            upload_heap_size_bytes: 64 * 1024 * 1024,
            dynamic_heap_size_bytes: 16 * 1024 * 1024,
            readback_heap_size_bytes: 4 * 1024 * 1024,
            dynamic_descriptor_count: 4096,
            static_descriptor_count: 4096,
            render_target_view_count: 64,
            query_count: 256,
            back_buffer_count: 2,
            swapchain_extent: Extent2d::new(1280, 720),
            swapchain_format: TextureFormat::Bgra8Unorm,
            fence_timeout: None,
        }
    }
}

impl DeviceConfig {
    pub fn with_debug_layer(mut self, enabled: bool) -> Self {
        self.debug_layer = enabled;
        self
    }

    pub fn with_debug_validation_shaders(mut self, enabled: bool) -> Self {
        self.debug_validation_shaders = enabled;
        self
    }

    pub fn with_render_command_list_count(mut self, count: u32) -> Self {
        self.render_command_list_count = count;
        self
    }

    pub fn with_upload_command_list_count(mut self, count: u32) -> Self {
        self.upload_command_list_count = count;
        self
    }

    pub fn with_window(mut self, window: WindowTarget) -> Self {
        self.window = Some(window);
        self
    }

    /// Set upload, dynamic and readback heap sizes in bytes.
    pub fn with_heap_sizes(mut self, upload: u64, dynamic: u64, readback: u64) -> Self {
        self.upload_heap_size_bytes = upload;
        self.dynamic_heap_size_bytes = dynamic;
        self.readback_heap_size_bytes = readback;
        self
    }

    /// Set static and dynamic shader-visible descriptor counts.
    pub fn with_descriptor_counts(mut self, static_count: u32, dynamic_count: u32) -> Self {
        self.static_descriptor_count = static_count;
        self.dynamic_descriptor_count = dynamic_count;
        self
    }

    pub fn with_render_target_view_count(mut self, count: u32) -> Self {
        self.render_target_view_count = count;
        self
    }

    pub fn with_query_count(mut self, count: u32) -> Self {
        self.query_count = count;
        self
    }

    pub fn with_back_buffer_count(mut self, count: u32) -> Self {
        self.back_buffer_count = count;
        self
    }

    pub fn with_swapchain_extent(mut self, width: u32, height: u32) -> Self {
        self.swapchain_extent = Extent2d::new(width, height);
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = Some(timeout);
        self
    }

    /// Initial back-buffer size: the window's if there is one.
    pub fn effective_extent(&self) -> Extent2d {
        self.window.map_or(self.swapchain_extent, |w| w.extent)
    }

    /// Reject configurations no device can be built from.
    pub fn validate(&self) -> DeviceResult<()> {
        let invalid = |msg: String| Err(DeviceError::InvalidConfig(msg));

        if self.render_command_list_count == 0 || self.upload_command_list_count == 0 {
            return invalid("command list counts must be at least 1".into());
        }
        for (name, size) in [
            ("upload_heap_size_bytes", self.upload_heap_size_bytes),
            ("dynamic_heap_size_bytes", self.dynamic_heap_size_bytes),
            ("readback_heap_size_bytes", self.readback_heap_size_bytes),
            ("dynamic_descriptor_count", self.dynamic_descriptor_count as u64),
            ("static_descriptor_count", self.static_descriptor_count as u64),
            ("query_count", self.query_count as u64),
        ] {
            if size == 0 {
                return invalid(format!("{name} cannot be zero"));
            }
        }
        if self
            .static_descriptor_count
            .checked_add(self.dynamic_descriptor_count)
            .is_none()
        {
            return invalid("descriptor counts overflow".into());
        }
        if self.back_buffer_count == 0 {
            return invalid("back_buffer_count cannot be zero".into());
        }
        if self.render_target_view_count < self.back_buffer_count {
            return invalid(format!(
                "{} render target views cannot cover {} back buffers",
                self.render_target_view_count, self.back_buffer_count
            ));
        }
        let extent = self.effective_extent();
        if extent.width == 0 || extent.height == 0 {
            return invalid("swap chain extent cannot be zero".into());
        }
        if self.debug_validation_shaders && !self.debug_layer {
            log::warn!("debug_validation_shaders has no effect without debug_layer");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DeviceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejections() {
        let cases = [
            DeviceConfig::default().with_upload_command_list_count(0),
            DeviceConfig::default().with_heap_sizes(0, 1024, 1024),
            DeviceConfig::default().with_query_count(0),
            DeviceConfig::default().with_back_buffer_count(0),
            DeviceConfig::default()
                .with_back_buffer_count(3)
                .with_render_target_view_count(2),
            DeviceConfig::default().with_swapchain_extent(0, 720),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(DeviceError::InvalidConfig(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn test_effective_extent_defaults_to_swapchain_extent() {
        let config = DeviceConfig::default().with_swapchain_extent(800, 600);
        assert_eq!(config.effective_extent(), Extent2d::new(800, 600));
    }
}
