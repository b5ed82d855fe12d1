//! Native Vulkan backend using ash.
//!
//! Maps the submission core onto Vulkan 1.2:
//! - fences are timeline semaphores, waits ride on the next batch of a queue
//! - every command list owns a command pool with one primary buffer
//! - heaps are persistently mapped gpu-allocator buffers
//! - descriptor heaps are host-side slot tables; render-target views are image views
//! - query heaps are timestamp pools resolved into a host-visible buffer
//!
//! Without a window the back buffers are plain offscreen images.

mod allocator;
mod barriers;
mod conversion;
mod debug;
mod device;
mod instance;
mod swapchain;

use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator};
use gpu_allocator::MemoryLocation;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::DeviceConfig;

use self::barriers::{BarrierTarget, StateAccess};
use self::conversion::{aspect_mask, convert_buffer_usage, convert_image_usage, convert_texture_format};
use self::device::PhysicalDeviceInfo;
use self::instance::InstanceContext;
use self::swapchain::SurfaceSwapchain;

const TIMESTAMP_SIZE: u64 = std::mem::size_of::<u64>() as u64;

struct VkQueue {
    queue: vk::Queue,
    /// Semaphore waits attached to the next batch submitted on this queue.
    waits: Vec<(vk::Semaphore, u64, vk::PipelineStageFlags)>,
}

struct VkCommandList {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

struct VkHeap {
    buffer: vk::Buffer,
    allocation: Allocation,
}

struct VkDescriptorHeap {
    /// Null where nothing has been written.
    views: Vec<vk::ImageView>,
}

struct VkQueryHeap {
    pool: vk::QueryPool,
    results: VkHeap,
    count: u32,
}

#[derive(Clone, Copy)]
enum VkResourceKind {
    Buffer(vk::Buffer),
    Image {
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
        aspect_mask: vk::ImageAspectFlags,
    },
}

impl VkResourceKind {
    fn barrier_target(self) -> BarrierTarget {
        match self {
            Self::Buffer(buffer) => BarrierTarget::Buffer(buffer),
            Self::Image {
                image, aspect_mask, ..
            } => BarrierTarget::Image { image, aspect_mask },
        }
    }
}

struct VkResource {
    kind: VkResourceKind,
    /// `None` for images owned by the swapchain.
    allocation: Option<Allocation>,
    /// Images start with undefined contents; the first barrier discards them.
    initialized: bool,
}

enum Presentation {
    NotCreated,
    Surface(SurfaceSwapchain),
    Offscreen { current: usize },
}

/// Vulkan implementation of [`GpuBackend`].
pub struct VulkanBackend {
    device: ash::Device,
    physical: PhysicalDeviceInfo,
    /// Dropped before the device is destroyed.
    allocator: Option<Allocator>,
    queues: HashMap<u64, VkQueue>,
    lists: HashMap<u64, VkCommandList>,
    fences: HashMap<u64, vk::Semaphore>,
    heaps: HashMap<u64, VkHeap>,
    descriptor_heaps: HashMap<u64, VkDescriptorHeap>,
    query_heaps: HashMap<u64, VkQueryHeap>,
    resources: HashMap<u64, VkResource>,
    presentation: Presentation,
    back_buffers: Vec<u64>,
    swapchain_desc: Option<SwapchainDesc>,
    present_queue: Option<u64>,
    /// Present mode the swapchain was built with.
    vsync: bool,
    /// Present mode last asked for; applied when the swapchain is rebuilt.
    requested_vsync: bool,
    next_id: u64,
    /// Declared last so the instance outlives the device.
    context: InstanceContext,
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("validation_enabled", &self.context.validation_enabled)
            .field("queue_family", &self.physical.queue_family)
            .field("resources", &self.resources.len())
            .finish()
    }
}

impl VulkanBackend {
    /// Create the instance, pick a GPU and create the logical device.
    ///
    /// Queues, heaps and the swapchain are created later by the device
    /// through [`GpuBackend`].
    pub fn new(config: &DeviceConfig) -> BackendResult<Self> {
        let context = InstanceContext::new(
            config.debug_layer,
            config.debug_validation_shaders,
            config.window.as_ref(),
        )?;
        let physical =
            device::select_physical_device(&context.instance, context.surface.as_ref())?;
        let device =
            device::create_logical_device(&context.instance, &physical, context.surface.is_some())?;

        let allocator = match allocator::create_allocator(
            &context.instance,
            physical.physical_device,
            device.clone(),
        ) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        log::info!(
            "Vulkan backend initialized (validation: {}, hardware queues: {})",
            context.validation_enabled,
            physical.queue_count
        );

        Ok(Self {
            device,
            physical,
            allocator: Some(allocator),
            queues: HashMap::new(),
            lists: HashMap::new(),
            fences: HashMap::new(),
            heaps: HashMap::new(),
            descriptor_heaps: HashMap::new(),
            query_heaps: HashMap::new(),
            resources: HashMap::new(),
            presentation: Presentation::NotCreated,
            back_buffers: Vec::new(),
            swapchain_desc: None,
            present_queue: None,
            vsync: true,
            requested_vsync: true,
            next_id: 1,
            context,
        })
    }

    /// Get the Vulkan device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance.
    pub fn instance(&self) -> &ash::Instance {
        &self.context.instance
    }

    /// Native command buffer behind `list`, for recording draw work.
    pub fn command_buffer(&self, list: CommandListHandle) -> BackendResult<vk::CommandBuffer> {
        self.lists
            .get(&list.0)
            .map(|l| l.buffer)
            .ok_or(BackendError::InvalidHandle("command list"))
    }

    /// Native image behind a texture resource.
    pub fn image(&self, resource: ResourceHandle) -> BackendResult<vk::Image> {
        match self.resources.get(&resource.0).map(|r| r.kind) {
            Some(VkResourceKind::Image { image, .. }) => Ok(image),
            _ => Err(BackendError::InvalidHandle("image")),
        }
    }

    /// Native image view written into a render-target slot.
    pub fn render_target_view(&self, heap: DescriptorHeapHandle, index: u32) -> Option<vk::ImageView> {
        self.descriptor_heaps
            .get(&heap.0)
            .and_then(|h| h.views.get(index as usize))
            .copied()
            .filter(|view| *view != vk::ImageView::null())
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocator(allocator: &mut Option<Allocator>) -> BackendResult<&mut Allocator> {
        allocator.as_mut().ok_or(BackendError::DeviceLost)
    }

    fn free(allocator: &mut Option<Allocator>, allocation: Allocation) {
        if let Some(allocator) = allocator.as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::warn!("Failed to free GPU memory: {}", e);
            }
        }
    }

    fn semaphore(&self, fence: FenceHandle) -> BackendResult<vk::Semaphore> {
        self.fences
            .get(&fence.0)
            .copied()
            .ok_or(BackendError::InvalidHandle("fence"))
    }

    fn heap_buffer(&self, heap: HeapHandle) -> BackendResult<vk::Buffer> {
        self.heaps
            .get(&heap.0)
            .map(|h| h.buffer)
            .ok_or(BackendError::InvalidHandle("heap"))
    }

    /// Submit one batch on `queue`, consuming its pending waits.
    fn submit_batch(
        &mut self,
        queue: QueueHandle,
        command_buffers: &[vk::CommandBuffer],
        signals: &[(vk::Semaphore, u64)],
    ) -> BackendResult<()> {
        let entry = self
            .queues
            .get_mut(&queue.0)
            .ok_or(BackendError::InvalidHandle("queue"))?;
        let vk_queue = entry.queue;
        let waits = std::mem::take(&mut entry.waits);

        let wait_semaphores: Vec<_> = waits.iter().map(|w| w.0).collect();
        let wait_values: Vec<_> = waits.iter().map(|w| w.1).collect();
        let wait_stages: Vec<_> = waits.iter().map(|w| w.2).collect();
        let signal_semaphores: Vec<_> = signals.iter().map(|s| s.0).collect();
        let signal_values: Vec<_> = signals.iter().map(|s| s.1).collect();

        // Values for binary semaphores in the lists are ignored.
        let mut timeline = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline);

        unsafe {
            self.device
                .queue_submit(vk_queue, &[submit_info], vk::Fence::null())
        }
        .map_err(map_submit_error)
    }

    /// Discard the contents of an image that has never been used.
    fn prepare_first_use(
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        resource: &mut VkResource,
        state: ResourceState,
    ) {
        if !resource.initialized {
            barriers::record_barrier(
                device,
                cmd,
                resource.kind.barrier_target(),
                StateAccess::UNDEFINED,
                StateAccess::of(state),
            );
            resource.initialized = true;
        }
    }

    fn register_back_buffers(&mut self, images: &[vk::Image], format: vk::Format, extent: vk::Extent2D) {
        self.back_buffers.clear();
        for &image in images {
            let id = self.next_id();
            self.resources.insert(
                id,
                VkResource {
                    kind: VkResourceKind::Image {
                        image,
                        format,
                        extent,
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                    },
                    allocation: None,
                    initialized: false,
                },
            );
            self.back_buffers.push(id);
        }
    }

    fn create_offscreen_back_buffers(&mut self, desc: &SwapchainDesc) -> BackendResult<()> {
        self.back_buffers.clear();
        for index in 0..desc.buffer_count {
            let resource_desc =
                ResourceDesc::texture_2d(desc.extent.width, desc.extent.height, desc.format)
                    .with_usage(ResourceUsage::RENDER_TARGET | ResourceUsage::COPY_SRC)
                    .with_label(format!("back buffer {index}"));
            let handle = self.create_resource(&resource_desc, ResourceState::Present, None)?;
            self.back_buffers.push(handle.0);
        }
        Ok(())
    }

    fn back_buffer_handles(&self) -> Vec<ResourceHandle> {
        self.back_buffers.iter().copied().map(ResourceHandle).collect()
    }

    fn wait_idle(&self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(map_submit_error)
    }
}

fn map_submit_error(e: vk::Result) -> BackendError {
    match e {
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            BackendError::OutOfMemory
        }
        other => BackendError::SubmitFailed(format!("{other:?}")),
    }
}

fn record_error(e: vk::Result) -> BackendError {
    match e {
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
        other => BackendError::RecordFailed(format!("{other:?}")),
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn create_queue(&mut self, kind: QueueKind) -> BackendResult<QueueHandle> {
        let preferred = match kind {
            QueueKind::Present => 0,
            QueueKind::Upload => 1,
            QueueKind::Transition => 2,
        };
        // Kinds share a hardware queue when the family has fewer than three.
        let index = preferred % self.physical.queue_count.max(1);
        let queue = unsafe { self.device.get_device_queue(self.physical.queue_family, index) };

        let id = self.next_id();
        self.queues.insert(
            id,
            VkQueue {
                queue,
                waits: Vec::new(),
            },
        );
        log::debug!("Created {} queue on hardware queue {}", kind.label(), index);
        Ok(QueueHandle(id))
    }

    fn create_command_list(&mut self, queue: QueueHandle) -> BackendResult<CommandListHandle> {
        if !self.queues.contains_key(&queue.0) {
            return Err(BackendError::InvalidHandle("queue"));
        }
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.physical.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }
            .map_err(|e| BackendError::creation("command list", format!("{e:?}")))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = match unsafe { self.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                return Err(BackendError::creation("command list", format!("{e:?}")));
            }
        };

        let id = self.next_id();
        self.lists.insert(id, VkCommandList { pool, buffer });
        Ok(CommandListHandle(id))
    }

    fn create_fence(&mut self, label: &str) -> BackendResult<FenceHandle> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { self.device.create_semaphore(&create_info, None) }
            .map_err(|e| BackendError::creation("fence", format!("{label}: {e:?}")))?;

        let id = self.next_id();
        self.fences.insert(id, semaphore);
        log::trace!("Created timeline semaphore for {}", label);
        Ok(FenceHandle(id))
    }

    fn reset_command_list(&mut self, list: CommandListHandle) -> BackendResult<()> {
        let entry = self
            .lists
            .get(&list.0)
            .ok_or(BackendError::InvalidHandle("command list"))?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .reset_command_pool(entry.pool, vk::CommandPoolResetFlags::empty())
                .map_err(record_error)?;
            self.device
                .begin_command_buffer(entry.buffer, &begin_info)
                .map_err(record_error)
        }
    }

    fn close_command_list(&mut self, list: CommandListHandle) -> BackendResult<()> {
        let cmd = self.command_buffer(list)?;
        unsafe { self.device.end_command_buffer(cmd) }.map_err(record_error)
    }

    fn execute(&mut self, queue: QueueHandle, list: CommandListHandle) -> BackendResult<()> {
        let cmd = self.command_buffer(list)?;
        self.submit_batch(queue, &[cmd], &[])
    }

    fn signal(&mut self, queue: QueueHandle, fence: FenceHandle, value: u64) -> BackendResult<()> {
        let semaphore = self.semaphore(fence)?;
        self.submit_batch(queue, &[], &[(semaphore, value)])
    }

    fn queue_wait(
        &mut self,
        queue: QueueHandle,
        fence: FenceHandle,
        value: u64,
    ) -> BackendResult<()> {
        let semaphore = self.semaphore(fence)?;
        self.queues
            .get_mut(&queue.0)
            .ok_or(BackendError::InvalidHandle("queue"))?
            .waits
            .push((semaphore, value, vk::PipelineStageFlags::ALL_COMMANDS));
        Ok(())
    }

    fn completed_value(&self, fence: FenceHandle) -> BackendResult<u64> {
        let semaphore = self.semaphore(fence)?;
        unsafe { self.device.get_semaphore_counter_value(semaphore) }.map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            other => BackendError::WaitFailed(format!("{other:?}")),
        })
    }

    fn wait_fence(
        &mut self,
        fence: FenceHandle,
        value: u64,
        timeout: Option<Duration>,
    ) -> BackendResult<bool> {
        let semaphores = [self.semaphore(fence)?];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns =
            timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX));

        match unsafe { self.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(BackendError::DeviceLost),
            Err(e) => Err(BackendError::WaitFailed(format!("{e:?}"))),
        }
    }

    fn create_heap(&mut self, kind: MemoryKind, size: u64, label: &str) -> BackendResult<HeapInfo> {
        let location = match kind {
            MemoryKind::Upload => MemoryLocation::CpuToGpu,
            MemoryKind::Readback => MemoryLocation::GpuToCpu,
        };
        let usage = vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

        let allocator = Self::allocator(&mut self.allocator)?;
        let (buffer, allocation) =
            allocator::create_buffer(&self.device, allocator, size, usage, location, label)?;
        if allocation.mapped_ptr().is_none() {
            unsafe { self.device.destroy_buffer(buffer, None) };
            Self::free(&mut self.allocator, allocation);
            return Err(BackendError::creation("heap", format!("{label} is not host visible")));
        }

        let address_info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        let gpu_address = unsafe { self.device.get_buffer_device_address(&address_info) };

        let id = self.next_id();
        self.heaps.insert(id, VkHeap { buffer, allocation });
        log::debug!("Created {:?} heap {} ({} bytes)", kind, label, size);
        Ok(HeapInfo {
            handle: HeapHandle(id),
            gpu_address,
            size,
        })
    }

    fn heap_memory(&self, heap: HeapHandle) -> BackendResult<&[u8]> {
        self.heaps
            .get(&heap.0)
            .and_then(|h| h.allocation.mapped_slice())
            .ok_or(BackendError::InvalidHandle("heap"))
    }

    fn heap_memory_mut(&mut self, heap: HeapHandle) -> BackendResult<&mut [u8]> {
        self.heaps
            .get_mut(&heap.0)
            .and_then(|h| h.allocation.mapped_slice_mut())
            .ok_or(BackendError::InvalidHandle("heap"))
    }

    fn create_descriptor_heap(
        &mut self,
        kind: DescriptorHeapKind,
        count: u32,
    ) -> BackendResult<DescriptorHeapInfo> {
        let id = self.next_id();
        self.descriptor_heaps.insert(
            id,
            VkDescriptorHeap {
                views: vec![vk::ImageView::null(); count as usize],
            },
        );
        let base = id << 32;
        Ok(DescriptorHeapInfo {
            handle: DescriptorHeapHandle(id),
            cpu_base: base,
            gpu_base: match kind {
                DescriptorHeapKind::ShaderResource => base,
                DescriptorHeapKind::RenderTarget => 0,
            },
            increment: 1,
            count,
        })
    }

    fn write_render_target_view(
        &mut self,
        heap: DescriptorHeapHandle,
        index: u32,
        resource: ResourceHandle,
    ) -> BackendResult<()> {
        let Some(VkResourceKind::Image { image, format, .. }) =
            self.resources.get(&resource.0).map(|r| r.kind)
        else {
            return Err(BackendError::InvalidHandle("image"));
        };
        let slot = self
            .descriptor_heaps
            .get_mut(&heap.0)
            .ok_or(BackendError::InvalidHandle("descriptor heap"))?
            .views
            .get_mut(index as usize)
            .ok_or(BackendError::InvalidHandle("descriptor slot"))?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { self.device.create_image_view(&view_info, None) }
            .map_err(|e| BackendError::creation("render target view", format!("{e:?}")))?;

        let old = std::mem::replace(slot, view);
        if old != vk::ImageView::null() {
            unsafe { self.device.destroy_image_view(old, None) };
        }
        Ok(())
    }

    fn create_query_heap(&mut self, count: u32) -> BackendResult<QueryHeapHandle> {
        let pool_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        let pool = unsafe { self.device.create_query_pool(&pool_info, None) }
            .map_err(|e| BackendError::creation("query heap", format!("{e:?}")))?;

        let results = Self::allocator(&mut self.allocator).and_then(|allocator| {
            allocator::create_buffer(
                &self.device,
                allocator,
                u64::from(count) * TIMESTAMP_SIZE,
                vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuToCpu,
                "timestamp results",
            )
        });
        let (buffer, allocation) = match results {
            Ok(results) => results,
            Err(e) => {
                unsafe { self.device.destroy_query_pool(pool, None) };
                return Err(e);
            }
        };

        let id = self.next_id();
        self.query_heaps.insert(
            id,
            VkQueryHeap {
                pool,
                results: VkHeap { buffer, allocation },
                count,
            },
        );
        Ok(QueryHeapHandle(id))
    }

    fn write_timestamp(
        &mut self,
        list: CommandListHandle,
        heap: QueryHeapHandle,
        slot: u32,
    ) -> BackendResult<()> {
        let cmd = self.command_buffer(list)?;
        let queries = self
            .query_heaps
            .get(&heap.0)
            .ok_or(BackendError::InvalidHandle("query heap"))?;
        if slot >= queries.count {
            return Err(BackendError::InvalidHandle("query slot"));
        }
        unsafe {
            self.device.cmd_reset_query_pool(cmd, queries.pool, slot, 1);
            self.device.cmd_write_timestamp(
                cmd,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                queries.pool,
                slot,
            );
        }
        Ok(())
    }

    fn resolve_timestamps(
        &mut self,
        list: CommandListHandle,
        heap: QueryHeapHandle,
        slots: Range<u32>,
    ) -> BackendResult<()> {
        let cmd = self.command_buffer(list)?;
        let queries = self
            .query_heaps
            .get(&heap.0)
            .ok_or(BackendError::InvalidHandle("query heap"))?;
        if slots.is_empty() {
            return Ok(());
        }
        if slots.end > queries.count {
            return Err(BackendError::InvalidHandle("query slot"));
        }
        unsafe {
            self.device.cmd_copy_query_pool_results(
                cmd,
                queries.pool,
                slots.start,
                slots.len() as u32,
                queries.results.buffer,
                u64::from(slots.start) * TIMESTAMP_SIZE,
                TIMESTAMP_SIZE,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            );
        }
        barriers::record_host_read_barrier(&self.device, cmd);
        Ok(())
    }

    fn read_timestamp(&self, heap: QueryHeapHandle, slot: u32) -> BackendResult<u64> {
        let start = slot as usize * TIMESTAMP_SIZE as usize;
        self.query_heaps
            .get(&heap.0)
            .and_then(|q| q.results.allocation.mapped_slice())
            .and_then(|bytes| bytes.get(start..start + TIMESTAMP_SIZE as usize))
            .map(bytemuck::pod_read_unaligned::<u64>)
            .ok_or(BackendError::InvalidHandle("query slot"))
    }

    fn timestamp_frequency(&self, queue: QueueHandle) -> BackendResult<u64> {
        if !self.queues.contains_key(&queue.0) {
            return Err(BackendError::InvalidHandle("queue"));
        }
        let period = self.physical.timestamp_period;
        if period <= 0.0 {
            return Err(BackendError::RecordFailed(
                "timestamps are not supported on this device".into(),
            ));
        }
        Ok((1.0e9 / f64::from(period)) as u64)
    }

    fn create_resource(
        &mut self,
        desc: &ResourceDesc,
        _initial_state: ResourceState,
        // Vulkan has no optimized clear values.
        _clear_value: Option<ClearValue>,
    ) -> BackendResult<ResourceHandle> {
        let name = desc.label.as_deref().unwrap_or("resource");
        let allocator = Self::allocator(&mut self.allocator)?;

        let (kind, allocation, initialized) = match desc.dimension {
            ResourceDimension::Buffer { size } => {
                let (buffer, allocation) = allocator::create_buffer(
                    &self.device,
                    allocator,
                    size,
                    convert_buffer_usage(desc.usage),
                    MemoryLocation::GpuOnly,
                    name,
                )?;
                (VkResourceKind::Buffer(buffer), allocation, true)
            }
            ResourceDimension::Texture2d {
                width,
                height,
                format,
                mip_levels,
            } => {
                let vk_format = convert_texture_format(format);
                let extent = vk::Extent2D { width, height };
                let image_info = vk::ImageCreateInfo::default()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(vk_format)
                    .extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    })
                    .mip_levels(mip_levels)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(convert_image_usage(desc.usage, format))
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED);
                let (image, allocation) =
                    allocator::create_image(&self.device, allocator, &image_info, name)?;
                (
                    VkResourceKind::Image {
                        image,
                        format: vk_format,
                        extent,
                        aspect_mask: aspect_mask(format),
                    },
                    allocation,
                    false,
                )
            }
        };

        let id = self.next_id();
        self.resources.insert(
            id,
            VkResource {
                kind,
                allocation: Some(allocation),
                initialized,
            },
        );
        Ok(ResourceHandle(id))
    }

    fn release_resource(&mut self, resource: ResourceHandle) -> BackendResult<()> {
        let entry = self
            .resources
            .remove(&resource.0)
            .ok_or(BackendError::InvalidHandle("resource"))?;
        // Swapchain images belong to the swapchain.
        let Some(allocation) = entry.allocation else {
            return Ok(());
        };
        unsafe {
            match entry.kind {
                VkResourceKind::Buffer(buffer) => self.device.destroy_buffer(buffer, None),
                VkResourceKind::Image { image, .. } => self.device.destroy_image(image, None),
            }
        }
        Self::free(&mut self.allocator, allocation);
        Ok(())
    }

    fn copy_to_resource(
        &mut self,
        list: CommandListHandle,
        src: HeapHandle,
        src_offset: u64,
        dst: ResourceHandle,
        size: u64,
    ) -> BackendResult<()> {
        let cmd = self.command_buffer(list)?;
        let src_buffer = self.heap_buffer(src)?;
        let resource = self
            .resources
            .get_mut(&dst.0)
            .ok_or(BackendError::InvalidHandle("resource"))?;
        Self::prepare_first_use(&self.device, cmd, resource, ResourceState::CopyDest);

        match resource.kind {
            VkResourceKind::Buffer(buffer) => {
                let region = vk::BufferCopy {
                    src_offset,
                    dst_offset: 0,
                    size,
                };
                unsafe { self.device.cmd_copy_buffer(cmd, src_buffer, buffer, &[region]) };
            }
            VkResourceKind::Image {
                image,
                extent,
                aspect_mask,
                ..
            } => {
                let region = buffer_image_region(src_offset, extent, aspect_mask);
                unsafe {
                    self.device.cmd_copy_buffer_to_image(
                        cmd,
                        src_buffer,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
            }
        }
        Ok(())
    }

    fn copy_from_resource(
        &mut self,
        list: CommandListHandle,
        src: ResourceHandle,
        dst: HeapHandle,
        dst_offset: u64,
        size: u64,
    ) -> BackendResult<()> {
        let cmd = self.command_buffer(list)?;
        let dst_buffer = self.heap_buffer(dst)?;
        let resource = self
            .resources
            .get_mut(&src.0)
            .ok_or(BackendError::InvalidHandle("resource"))?;
        Self::prepare_first_use(&self.device, cmd, resource, ResourceState::CopySource);

        match resource.kind {
            VkResourceKind::Buffer(buffer) => {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset,
                    size,
                };
                unsafe { self.device.cmd_copy_buffer(cmd, buffer, dst_buffer, &[region]) };
            }
            VkResourceKind::Image {
                image,
                extent,
                aspect_mask,
                ..
            } => {
                let region = buffer_image_region(dst_offset, extent, aspect_mask);
                unsafe {
                    self.device.cmd_copy_image_to_buffer(
                        cmd,
                        image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_buffer,
                        &[region],
                    );
                }
            }
        }
        barriers::record_host_read_barrier(&self.device, cmd);
        Ok(())
    }

    fn transition(
        &mut self,
        list: CommandListHandle,
        resource: ResourceHandle,
        before: ResourceState,
        after: ResourceState,
    ) -> BackendResult<()> {
        let cmd = self.command_buffer(list)?;
        let entry = self
            .resources
            .get_mut(&resource.0)
            .ok_or(BackendError::InvalidHandle("resource"))?;
        let from = if entry.initialized {
            StateAccess::of(before)
        } else {
            StateAccess::UNDEFINED
        };
        barriers::record_barrier(
            &self.device,
            cmd,
            entry.kind.barrier_target(),
            from,
            StateAccess::of(after),
        );
        entry.initialized = true;
        Ok(())
    }

    fn create_swapchain(
        &mut self,
        queue: QueueHandle,
        desc: &SwapchainDesc,
    ) -> BackendResult<Vec<ResourceHandle>> {
        if !self.queues.contains_key(&queue.0) {
            return Err(BackendError::InvalidHandle("queue"));
        }
        self.present_queue = Some(queue.0);
        self.swapchain_desc = Some(*desc);

        match self.context.surface.as_ref() {
            Some(surface) => {
                let swapchain = SurfaceSwapchain::new(
                    &self.context.instance,
                    &self.device,
                    surface,
                    self.physical.physical_device,
                    desc,
                    self.vsync,
                )?;
                let images = swapchain.images.clone();
                self.register_back_buffers(&images, swapchain.format, swapchain.extent);
                self.presentation = Presentation::Surface(swapchain);
            }
            None => {
                self.create_offscreen_back_buffers(desc)?;
                self.presentation = Presentation::Offscreen { current: 0 };
                log::info!(
                    "Offscreen back buffers: {}x{}, {} images",
                    desc.extent.width,
                    desc.extent.height,
                    desc.buffer_count
                );
            }
        }
        Ok(self.back_buffer_handles())
    }

    fn resize_swapchain(&mut self, extent: Extent2d) -> BackendResult<Vec<ResourceHandle>> {
        let mut desc = self
            .swapchain_desc
            .ok_or(BackendError::InvalidHandle("swap chain"))?;
        desc.extent = extent;
        self.swapchain_desc = Some(desc);
        self.wait_idle()?;

        for id in std::mem::take(&mut self.back_buffers) {
            self.release_resource(ResourceHandle(id))?;
        }

        self.vsync = self.requested_vsync;
        let vsync = self.vsync;
        match &mut self.presentation {
            Presentation::Surface(swapchain) => {
                let surface = self
                    .context
                    .surface
                    .as_ref()
                    .ok_or(BackendError::SurfaceLost)?;
                swapchain.recreate(
                    &self.device,
                    surface,
                    self.physical.physical_device,
                    extent,
                    vsync,
                )?;
                let images = swapchain.images.clone();
                let (format, vk_extent) = (swapchain.format, swapchain.extent);
                self.register_back_buffers(&images, format, vk_extent);
            }
            Presentation::Offscreen { current } => {
                *current = 0;
                self.create_offscreen_back_buffers(&desc)?;
            }
            Presentation::NotCreated => return Err(BackendError::InvalidHandle("swap chain")),
        }
        Ok(self.back_buffer_handles())
    }

    fn acquire_back_buffer(&mut self) -> BackendResult<usize> {
        match &mut self.presentation {
            Presentation::Surface(swapchain) => {
                let (index, semaphore) = swapchain.acquire()?;
                let queue = self
                    .present_queue
                    .and_then(|id| self.queues.get_mut(&id))
                    .ok_or(BackendError::InvalidHandle("queue"))?;
                queue
                    .waits
                    .push((semaphore, 0, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
                Ok(index as usize)
            }
            Presentation::Offscreen { current } => Ok(*current),
            Presentation::NotCreated => Err(BackendError::InvalidHandle("swap chain")),
        }
    }

    fn present(&mut self, queue: QueueHandle, sync_interval: u32) -> BackendResult<PresentStatus> {
        let requested = sync_interval > 0;
        if requested != self.requested_vsync {
            log::debug!("Present mode change (vsync: {}) applies on the next resize", requested);
            self.requested_vsync = requested;
        }

        let semaphore = match &mut self.presentation {
            Presentation::Surface(swapchain) => swapchain.present_semaphore(),
            Presentation::Offscreen { current } => {
                *current = (*current + 1) % self.back_buffers.len().max(1);
                return Ok(PresentStatus::Presented);
            }
            Presentation::NotCreated => return Err(BackendError::InvalidHandle("swap chain")),
        };
        // Binary signal after everything submitted so far; present waits on it.
        self.submit_batch(queue, &[], &[(semaphore, 0)])?;

        let vk_queue = self
            .queues
            .get(&queue.0)
            .map(|q| q.queue)
            .ok_or(BackendError::InvalidHandle("queue"))?;
        match &mut self.presentation {
            Presentation::Surface(swapchain) => swapchain.present(vk_queue),
            _ => Ok(PresentStatus::Presented),
        }
    }
}

fn buffer_image_region(
    buffer_offset: u64,
    extent: vk::Extent2D,
    aspect_mask: vk::ImageAspectFlags,
) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset,
        // Tightly packed rows.
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("Failed to wait for the GPU before teardown: {:?}", e);
            }

            for (_, heap) in self.descriptor_heaps.drain() {
                for view in heap.views {
                    if view != vk::ImageView::null() {
                        self.device.destroy_image_view(view, None);
                    }
                }
            }

            if let Presentation::Surface(swapchain) = &mut self.presentation {
                swapchain.destroy(&self.device);
            }

            for (_, resource) in self.resources.drain() {
                let Some(allocation) = resource.allocation else {
                    continue;
                };
                match resource.kind {
                    VkResourceKind::Buffer(buffer) => self.device.destroy_buffer(buffer, None),
                    VkResourceKind::Image { image, .. } => self.device.destroy_image(image, None),
                }
                Self::free(&mut self.allocator, allocation);
            }

            for (_, heap) in self.heaps.drain() {
                self.device.destroy_buffer(heap.buffer, None);
                Self::free(&mut self.allocator, heap.allocation);
            }

            for (_, queries) in self.query_heaps.drain() {
                self.device.destroy_query_pool(queries.pool, None);
                self.device.destroy_buffer(queries.results.buffer, None);
                Self::free(&mut self.allocator, queries.results.allocation);
            }

            for (_, list) in self.lists.drain() {
                self.device.destroy_command_pool(list.pool, None);
            }

            for (_, semaphore) in self.fences.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }

            // The allocator must go before the device.
            drop(self.allocator.take());
            self.device.destroy_device(None);
        }
        log::info!("Vulkan backend destroyed");
    }
}
