//! Vulkan physical and logical device management.

use std::ffi::CStr;

use ash::vk;

use crate::backend::traits::{BackendError, BackendResult};

use super::instance::{SurfaceContext, REQUIRED_API_VERSION};

/// The selected GPU and the queue family all three queues come from.
pub(super) struct PhysicalDeviceInfo {
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
    /// Hardware queues available in `queue_family`, capped at three.
    pub queue_count: u32,
    /// Nanoseconds per timestamp tick.
    pub timestamp_period: f32,
}

/// Select the best physical device for rendering.
///
/// Prefers discrete GPUs over integrated GPUs. With a surface, the graphics
/// family must also be able to present to it.
pub(super) fn select_physical_device(
    instance: &ash::Instance,
    surface: Option<&SurfaceContext>,
) -> BackendResult<PhysicalDeviceInfo> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(|e| BackendError::creation("device", format!("{e:?}")))?;

    let mut best: Option<(u32, PhysicalDeviceInfo)> = None;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };

        if properties.api_version < REQUIRED_API_VERSION {
            log::info!("Skipping GPU {:?}: Vulkan 1.2 not supported", device_name);
            continue;
        }
        let Some((queue_family, queue_count)) = find_graphics_queue_family(instance, device, surface)
        else {
            log::info!("Skipping GPU {:?}: no usable graphics queue", device_name);
            continue;
        };
        if properties.limits.timestamp_compute_and_graphics == vk::FALSE {
            log::warn!("GPU {:?} does not support timestamps on all queues", device_name);
        }

        let mut score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };
        score += properties.limits.max_image_dimension2_d / 1024;

        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            device_name,
            properties.device_type,
            score
        );

        if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
            best = Some((
                score,
                PhysicalDeviceInfo {
                    physical_device: device,
                    queue_family,
                    queue_count,
                    timestamp_period: properties.limits.timestamp_period,
                },
            ));
        }
    }

    best.map(|(_, info)| info)
        .ok_or_else(|| BackendError::creation("device", "no suitable GPU found"))
}

fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: Option<&SurfaceContext>,
) -> Option<(u32, u32)> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    queue_families
        .iter()
        .enumerate()
        .find(|(index, family)| {
            let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let presents = surface.map_or(true, |s| unsafe {
                s.loader
                    .get_physical_device_surface_support(physical_device, *index as u32, s.surface)
                    .unwrap_or(false)
            });
            graphics && presents
        })
        .map(|(index, family)| (index as u32, family.queue_count.min(3)))
}

/// Create a logical device with timeline semaphores and buffer device addresses.
pub(super) fn create_logical_device(
    instance: &ash::Instance,
    info: &PhysicalDeviceInfo,
    presentable: bool,
) -> BackendResult<ash::Device> {
    let queue_priorities = vec![1.0f32; info.queue_count as usize];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(info.queue_family)
        .queue_priorities(&queue_priorities)];

    let device_extensions = if presentable {
        vec![ash::khr::swapchain::NAME.as_ptr()]
    } else {
        vec![]
    };

    let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .buffer_device_address(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .push_next(&mut vulkan_12_features);

    unsafe { instance.create_device(info.physical_device, &create_info, None) }.map_err(|e| {
        BackendError::creation("device", format!("failed to create logical device: {e:?}"))
    })
}
