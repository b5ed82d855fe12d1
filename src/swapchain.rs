//! Swap-chain back buffers and their render-target views.

use crate::backend::{
    CpuDescriptor, DescriptorHeapInfo, Extent2d, GpuBackend, QueueHandle, ResourceHandle,
    SwapchainDesc, TextureFormat,
};
use crate::error::{DeviceError, DeviceResult};

/// The rotating set of images presented to the display.
///
/// Render-target views of the back buffers occupy the first slots of the
/// RTV heap. Their number is fixed at creation; later RTV allocations start
/// right after them.
#[derive(Debug)]
pub(crate) struct Swapchain {
    back_buffers: Vec<ResourceHandle>,
    extent: Extent2d,
    format: TextureFormat,
    current: usize,
    rtv_heap: DescriptorHeapInfo,
    reserved_views: usize,
}

impl Swapchain {
    pub fn new<B: GpuBackend>(
        backend: &mut B,
        queue: QueueHandle,
        desc: SwapchainDesc,
        rtv_heap: DescriptorHeapInfo,
    ) -> DeviceResult<Self> {
        if desc.buffer_count > rtv_heap.count {
            return Err(DeviceError::InvalidConfig(format!(
                "{} back buffers need as many render target views, heap has {}",
                desc.buffer_count, rtv_heap.count
            )));
        }

        let back_buffers = backend.create_swapchain(queue, &desc)?;
        if back_buffers.len() > rtv_heap.count as usize {
            return Err(DeviceError::InvalidConfig(format!(
                "swap chain created {} back buffers, heap has {} render target views",
                back_buffers.len(),
                rtv_heap.count
            )));
        }
        let mut swapchain = Self {
            reserved_views: back_buffers.len(),
            back_buffers,
            extent: desc.extent,
            format: desc.format,
            current: 0,
            rtv_heap,
        };
        swapchain.write_views(backend)?;
        log::info!(
            "Swap chain created: {}x{}, {} buffers, {:?}",
            desc.extent.width,
            desc.extent.height,
            desc.buffer_count,
            desc.format
        );
        Ok(swapchain)
    }

    fn write_views<B: GpuBackend>(&self, backend: &mut B) -> DeviceResult<()> {
        for (index, buffer) in self.back_buffers.iter().enumerate() {
            backend.write_render_target_view(self.rtv_heap.handle, index as u32, *buffer)?;
        }
        Ok(())
    }

    /// Recreate the back buffers at `extent`. The GPU must be idle.
    pub fn resize<B: GpuBackend>(&mut self, backend: &mut B, extent: Extent2d) -> DeviceResult<()> {
        let back_buffers = backend.resize_swapchain(extent)?;
        if back_buffers.len() > self.reserved_views {
            return Err(DeviceError::InvalidConfig(format!(
                "swap chain recreated with {} back buffers, {} render target views are reserved",
                back_buffers.len(),
                self.reserved_views
            )));
        }
        self.back_buffers = back_buffers;
        self.extent = extent;
        self.current = 0;
        self.write_views(backend)?;
        log::info!("Swap chain resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Ask the backend which buffer the next frame renders into.
    pub fn acquire<B: GpuBackend>(&mut self, backend: &mut B) -> DeviceResult<usize> {
        let index = backend.acquire_back_buffer()?;
        if index >= self.back_buffers.len() {
            return Err(DeviceError::DeviceLost(format!(
                "swap chain returned back buffer {} of {}",
                index,
                self.back_buffers.len()
            )));
        }
        self.current = index;
        Ok(index)
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn back_buffer(&self, index: usize) -> ResourceHandle {
        self.back_buffers[index]
    }

    pub fn render_target(&self, index: usize) -> CpuDescriptor {
        self.rtv_heap.range(index as u32, 1).cpu
    }

    pub fn buffer_count(&self) -> u32 {
        self.back_buffers.len() as u32
    }

    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DescriptorHeapKind, HeadlessBackend, QueueKind};

    fn desc(width: u32, height: u32) -> SwapchainDesc {
        SwapchainDesc {
            extent: Extent2d::new(width, height),
            buffer_count: 3,
            format: TextureFormat::Bgra8Unorm,
        }
    }

    #[test]
    fn test_views_point_at_back_buffers() {
        let mut backend = HeadlessBackend::default();
        let queue = backend.create_queue(QueueKind::Present).unwrap();
        let rtv = backend
            .create_descriptor_heap(DescriptorHeapKind::RenderTarget, 8)
            .unwrap();
        let swapchain = Swapchain::new(&mut backend, queue, desc(64, 32), rtv).unwrap();

        for i in 0..3 {
            assert_eq!(
                backend.render_target_view(rtv.handle, i as u32),
                Some(swapchain.back_buffer(i))
            );
        }
        assert_ne!(swapchain.render_target(0), swapchain.render_target(1));
    }

    #[test]
    fn test_resize_rewrites_views() {
        let mut backend = HeadlessBackend::default();
        let queue = backend.create_queue(QueueKind::Present).unwrap();
        let rtv = backend
            .create_descriptor_heap(DescriptorHeapKind::RenderTarget, 8)
            .unwrap();
        let mut swapchain = Swapchain::new(&mut backend, queue, desc(64, 32), rtv).unwrap();
        let old = swapchain.back_buffer(0);

        swapchain.resize(&mut backend, Extent2d::new(128, 64)).unwrap();

        assert_ne!(swapchain.back_buffer(0), old);
        assert_eq!(swapchain.extent(), Extent2d::new(128, 64));
        assert_eq!(
            backend.render_target_view(rtv.handle, 0),
            Some(swapchain.back_buffer(0))
        );
        // Old buffers are released, new ones replace them.
        assert_eq!(backend.resource_count(), 3);
    }

    #[test]
    fn test_resize_never_writes_past_reserved_views() {
        let mut backend = HeadlessBackend::default();
        let gpu = backend.gpu();
        let queue = backend.create_queue(QueueKind::Present).unwrap();
        let rtv = backend
            .create_descriptor_heap(DescriptorHeapKind::RenderTarget, 8)
            .unwrap();
        let mut swapchain = Swapchain::new(&mut backend, queue, desc(64, 32), rtv).unwrap();

        gpu.set_extra_back_buffers(1);
        assert!(matches!(
            swapchain.resize(&mut backend, Extent2d::new(128, 64)),
            Err(DeviceError::InvalidConfig(_))
        ));
        // Slot 3 belongs to the first render-target view handed out after the back buffers.
        assert_eq!(backend.render_target_view(rtv.handle, 3), None);

        gpu.set_extra_back_buffers(0);
        swapchain.resize(&mut backend, Extent2d::new(128, 64)).unwrap();
        assert_eq!(swapchain.buffer_count(), 3);
    }

    #[test]
    fn test_too_few_views_rejected() {
        let mut backend = HeadlessBackend::default();
        let queue = backend.create_queue(QueueKind::Present).unwrap();
        let rtv = backend
            .create_descriptor_heap(DescriptorHeapKind::RenderTarget, 2)
            .unwrap();
        assert!(matches!(
            Swapchain::new(&mut backend, queue, desc(8, 8), rtv),
            Err(DeviceError::InvalidConfig(_))
        ));
    }
}
