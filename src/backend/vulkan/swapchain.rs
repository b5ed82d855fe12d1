//! Vulkan swapchain for windowed presentation.

use ash::vk;

use crate::backend::traits::{BackendError, BackendResult};
use crate::backend::types::{Extent2d, PresentStatus, SwapchainDesc};

use super::conversion::convert_texture_format;
use super::instance::SurfaceContext;

/// Swapchain images plus the binary semaphores that order acquire and present.
pub(super) struct SurfaceSwapchain {
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    buffer_count: u32,
    /// Signaled by acquire, one per image so reuse never races.
    acquire_semaphores: Vec<vk::Semaphore>,
    /// Signaled after the frame's work, waited by present. Indexed by image.
    present_semaphores: Vec<vk::Semaphore>,
    next_acquire: usize,
    image_index: u32,
}

impl SurfaceSwapchain {
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        surface: &SurfaceContext,
        physical_device: vk::PhysicalDevice,
        desc: &SwapchainDesc,
        vsync: bool,
    ) -> BackendResult<Self> {
        let mut swapchain = Self {
            loader: ash::khr::swapchain::Device::new(instance, device),
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            format: convert_texture_format(desc.format),
            extent: vk::Extent2D::default(),
            buffer_count: desc.buffer_count,
            acquire_semaphores: Vec::new(),
            present_semaphores: Vec::new(),
            next_acquire: 0,
            image_index: 0,
        };
        if let Err(e) = swapchain.build(device, surface, physical_device, desc.extent, vsync) {
            swapchain.destroy(device);
            return Err(e);
        }
        Ok(swapchain)
    }

    /// Recreate at `extent`. The device must be idle.
    pub fn recreate(
        &mut self,
        device: &ash::Device,
        surface: &SurfaceContext,
        physical_device: vk::PhysicalDevice,
        extent: Extent2d,
        vsync: bool,
    ) -> BackendResult<()> {
        self.destroy_semaphores(device);
        self.build(device, surface, physical_device, extent, vsync)
    }

    fn build(
        &mut self,
        device: &ash::Device,
        surface: &SurfaceContext,
        physical_device: vk::PhysicalDevice,
        extent: Extent2d,
        vsync: bool,
    ) -> BackendResult<()> {
        let error = |e: vk::Result| BackendError::creation("swap chain", format!("{e:?}"));

        let capabilities = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(physical_device, surface.surface)
        }
        .map_err(error)?;
        let formats = unsafe {
            surface
                .loader
                .get_physical_device_surface_formats(physical_device, surface.surface)
        }
        .map_err(error)?;
        let present_modes = unsafe {
            surface
                .loader
                .get_physical_device_surface_present_modes(physical_device, surface.surface)
        }
        .map_err(error)?;

        let surface_format = formats
            .iter()
            .find(|f| f.format == self.format)
            .or_else(|| formats.first())
            .copied()
            .ok_or_else(|| BackendError::creation("swap chain", "surface reports no formats"))?;

        // FIFO is always available; IMMEDIATE only when vsync is off and supported.
        let present_mode = if !vsync && present_modes.contains(&vk::PresentModeKHR::IMMEDIATE) {
            vk::PresentModeKHR::IMMEDIATE
        } else {
            vk::PresentModeKHR::FIFO
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: extent.width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: extent.height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };

        let mut image_count = self.buffer_count.max(capabilities.min_image_count);
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        self.swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }.map_err(error)?;
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old_swapchain, None) };
        }

        let images = unsafe { self.loader.get_swapchain_images(self.swapchain) }.map_err(error)?;
        if images.len() != self.buffer_count as usize {
            log::warn!(
                "Surface returned {} images for {} requested back buffers",
                images.len(),
                self.buffer_count
            );
        }
        self.images = images;
        self.format = surface_format.format;
        self.extent = extent;
        self.next_acquire = 0;
        self.image_index = 0;

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        for _ in 0..self.images.len() {
            let acquire = unsafe { device.create_semaphore(&semaphore_info, None) }.map_err(error)?;
            self.acquire_semaphores.push(acquire);
            let present = unsafe { device.create_semaphore(&semaphore_info, None) }.map_err(error)?;
            self.present_semaphores.push(present);
        }

        log::info!(
            "Vulkan swapchain: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            present_mode
        );
        Ok(())
    }

    /// Acquire the next image. Returns its index and the semaphore the first
    /// submission touching it must wait on.
    pub fn acquire(&mut self) -> BackendResult<(u32, vk::Semaphore)> {
        let semaphore = self.acquire_semaphores[self.next_acquire];
        let (index, _suboptimal) = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        }
        .map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
                BackendError::SurfaceLost
            }
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            other => BackendError::SubmitFailed(format!("acquire failed: {other:?}")),
        })?;
        self.next_acquire = (self.next_acquire + 1) % self.acquire_semaphores.len();
        self.image_index = index;
        Ok((index, semaphore))
    }

    /// Semaphore the present of the current image waits on.
    pub fn present_semaphore(&self) -> vk::Semaphore {
        self.present_semaphores[self.image_index as usize]
    }

    pub fn present(&mut self, queue: vk::Queue) -> BackendResult<PresentStatus> {
        let wait_semaphores = [self.present_semaphore()];
        let swapchains = [self.swapchain];
        let image_indices = [self.image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::Outdated),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(BackendError::SurfaceLost),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(BackendError::DeviceLost),
            Err(e) => Err(BackendError::PresentFailed(format!("{e:?}"))),
        }
    }

    fn destroy_semaphores(&mut self, device: &ash::Device) {
        for semaphore in self
            .acquire_semaphores
            .drain(..)
            .chain(self.present_semaphores.drain(..))
        {
            unsafe { device.destroy_semaphore(semaphore, None) };
        }
    }

    /// Destroy the swapchain. The device must be idle.
    pub fn destroy(&mut self, device: &ash::Device) {
        self.destroy_semaphores(device);
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
            self.swapchain = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }
}
