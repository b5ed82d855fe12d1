//! GPU memory allocator integration using gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;

use crate::backend::traits::{BackendError, BackendResult};

/// Create a memory allocator for the Vulkan device.
pub(super) fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
) -> BackendResult<Allocator> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device,
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: true,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    })
    .map_err(|e| BackendError::creation("allocator", e))
}

/// Create a buffer and bind freshly allocated memory to it.
pub(super) fn create_buffer(
    device: &ash::Device,
    allocator: &mut Allocator,
    size: u64,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    name: &str,
) -> BackendResult<(vk::Buffer, Allocation)> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.create_buffer(&buffer_info, None) }
        .map_err(|e| BackendError::creation("buffer", format!("{e:?}")))?;
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

    let bound = allocator
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| map_allocation_error("buffer", e))
        .and_then(|allocation| {
            unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
                .map(|()| allocation)
                .map_err(|e| BackendError::creation("buffer", format!("{e:?}")))
        });

    match bound {
        Ok(allocation) => Ok((buffer, allocation)),
        Err(e) => {
            unsafe { device.destroy_buffer(buffer, None) };
            Err(e)
        }
    }
}

/// Create a device-local image and bind memory to it.
pub(super) fn create_image(
    device: &ash::Device,
    allocator: &mut Allocator,
    image_info: &vk::ImageCreateInfo,
    name: &str,
) -> BackendResult<(vk::Image, Allocation)> {
    let image = unsafe { device.create_image(image_info, None) }
        .map_err(|e| BackendError::creation("image", format!("{e:?}")))?;
    let requirements = unsafe { device.get_image_memory_requirements(image) };

    let bound = allocator
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| map_allocation_error("image", e))
        .and_then(|allocation| {
            unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
                .map(|()| allocation)
                .map_err(|e| BackendError::creation("image", format!("{e:?}")))
        });

    match bound {
        Ok(allocation) => Ok((image, allocation)),
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            Err(e)
        }
    }
}

fn map_allocation_error(what: &'static str, error: gpu_allocator::AllocationError) -> BackendError {
    match error {
        gpu_allocator::AllocationError::OutOfMemory => BackendError::OutOfMemory,
        other => BackendError::creation(what, other),
    }
}
