//! The device: queues, transient heaps and the swap chain behind one surface.
//!
//! [`Device`] is the only object renderer code talks to. It owns
//!
//! - a present queue (graphics work ending in a swap-chain present),
//! - an upload queue (copies that fill newly created resources),
//! - a transition queue (barriers that move uploaded resources into their
//!   final state before render work may read them),
//! - five fence-recycled rings (upload bytes, dynamic bytes, readback bytes,
//!   dynamic descriptors, timestamp queries),
//! - a bump range of static descriptors and one of render-target views,
//! - the swap chain.
//!
//! # Frame loop
//!
//! ```
//! use graphics_device::{Device, DeviceConfig};
//!
//! let mut device = Device::headless(DeviceConfig::default()).unwrap();
//! for _ in 0..4 {
//!     let frame = device.begin_render_command_list().unwrap();
//!     let constants = device.allocate_dynamic_buffer(64, 256).unwrap();
//!     device.write_dynamic(&constants, &[0u8; 64]).unwrap();
//!     // ... record work on frame.command_list ...
//!     device.close_submit_and_present(true).unwrap();
//! }
//! device.destroy().unwrap();
//! ```

use crate::backend::{
    ClearValue, CommandListHandle, CpuDescriptor, DescriptorHeapInfo, DescriptorHeapKind,
    DescriptorRange, Extent2d, FenceHandle, GpuBackend, HeadlessBackend, MemoryKind,
    PresentStatus, QueueKind, ResourceDesc, ResourceHandle, ResourceState, SwapchainDesc,
    TextureFormat,
};
use crate::command::{CommandQueue, PreSignal};
use crate::deferred::{DeferredReleases, QueueFences};
use crate::error::{AllocError, DeviceError, DeviceResult, HeapKind};
use crate::fence::FenceValue;
use crate::heaps::{
    BumpAllocator, ByteRing, DescriptorRing, DynamicAllocation, QueryRing, ReadbackAllocation,
    TimestampCallback,
};
use crate::ring::{checked_align_up, RingAllocator};
use crate::swapchain::Swapchain;
use crate::DeviceConfig;

/// Placement alignment of initial data inside the upload heap.
pub const UPLOAD_ALIGNMENT: u64 = 512;

/// Alignment constant buffers need inside the dynamic heap.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// What [`Device::begin_render_command_list`] hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderFrame {
    /// The render command list to record into.
    pub command_list: CommandListHandle,
    /// Back buffer this frame renders into, already in the render-target state.
    pub back_buffer: ResourceHandle,
    pub back_buffer_index: usize,
    /// Render-target view of the back buffer.
    pub render_target: CpuDescriptor,
}

/// Snapshot of device bookkeeping for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStats {
    pub frames_submitted: u64,
    pub uploads_submitted: u64,
    /// Live bytes (or slots) per ring, wrap padding included.
    pub upload_heap_live: u64,
    pub dynamic_heap_live: u64,
    pub readback_heap_live: u64,
    pub dynamic_descriptors_live: u64,
    pub queries_live: u64,
    pub static_descriptors_used: u32,
    pub render_target_views_used: u32,
    /// Timestamp callbacks that have not fired yet.
    pub timestamps_waiting: usize,
    /// Released resources the GPU may still be using.
    pub deferred_releases: usize,
}

/// GPU command submission and transient resource recycling.
///
/// All methods must be called from one thread.
pub struct Device<B: GpuBackend> {
    backend: B,
    present: CommandQueue,
    upload: CommandQueue,
    transition: CommandQueue,
    upload_heap: ByteRing,
    dynamic_heap: ByteRing,
    readback_heap: ByteRing,
    descriptor_heap: DescriptorHeapInfo,
    static_descriptors: BumpAllocator,
    dynamic_descriptors: DescriptorRing,
    rtv_heap: DescriptorHeapInfo,
    render_target_views: BumpAllocator,
    queries: QueryRing,
    swapchain: Swapchain,
    /// Final states of resources filled by the open upload list.
    pending_transitions: Vec<(ResourceHandle, ResourceState)>,
    /// Fences the next render submission must wait on.
    upload_dependencies: Vec<(FenceHandle, FenceValue)>,
    releases: DeferredReleases,
    frame: Option<RenderFrame>,
    frame_index: u64,
    frames_submitted: u64,
    uploads_submitted: u64,
    destroyed: bool,
}

impl Device<HeadlessBackend> {
    /// Create a device on the headless backend.
    pub fn headless(config: DeviceConfig) -> DeviceResult<Self> {
        Self::new(HeadlessBackend::default(), config)
    }
}

#[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
impl Device<crate::backend::vulkan::VulkanBackend> {
    /// Create a device on the Vulkan backend, presenting to `config.window` if set.
    pub fn vulkan(config: DeviceConfig) -> DeviceResult<Self> {
        config.validate()?;
        let backend = crate::backend::vulkan::VulkanBackend::new(&config)?;
        Self::new(backend, config)
    }
}

impl<B: GpuBackend> Device<B> {
    /// Create every queue, heap and the swap chain on `backend`.
    ///
    /// On failure everything created so far is released together with the
    /// backend.
    pub fn new(mut backend: B, config: DeviceConfig) -> DeviceResult<Self> {
        config.validate()?;
        log::info!("Creating device on {} backend", backend.name());

        let timeout = config.fence_timeout;
        let present = CommandQueue::new(
            &mut backend,
            QueueKind::Present,
            config.render_command_list_count,
            PreSignal::Present,
            timeout,
        )?;
        let upload = CommandQueue::new(
            &mut backend,
            QueueKind::Upload,
            config.upload_command_list_count,
            PreSignal::Nothing,
            timeout,
        )?;
        let transition = CommandQueue::new(
            &mut backend,
            QueueKind::Transition,
            config.upload_command_list_count,
            PreSignal::Nothing,
            timeout,
        )?;

        let upload_heap = ByteRing::new(
            &mut backend,
            MemoryKind::Upload,
            HeapKind::Upload,
            config.upload_heap_size_bytes,
        )?;
        let dynamic_heap = ByteRing::new(
            &mut backend,
            MemoryKind::Upload,
            HeapKind::Dynamic,
            config.dynamic_heap_size_bytes,
        )?;
        let readback_heap = ByteRing::new(
            &mut backend,
            MemoryKind::Readback,
            HeapKind::Readback,
            config.readback_heap_size_bytes,
        )?;

        // Static descriptors first, the dynamic ring after them.
        let descriptor_heap = backend.create_descriptor_heap(
            DescriptorHeapKind::ShaderResource,
            config.static_descriptor_count + config.dynamic_descriptor_count,
        )?;
        let static_descriptors = BumpAllocator::new(0, config.static_descriptor_count);
        let dynamic_descriptors = DescriptorRing::new(
            descriptor_heap,
            config.static_descriptor_count,
            config.dynamic_descriptor_count,
        )?;

        let rtv_heap = backend
            .create_descriptor_heap(DescriptorHeapKind::RenderTarget, config.render_target_view_count)?;
        let queries = QueryRing::new(&mut backend, config.query_count)?;

        let swapchain = Swapchain::new(
            &mut backend,
            present.handle(),
            SwapchainDesc {
                extent: config.effective_extent(),
                buffer_count: config.back_buffer_count,
                format: config.swapchain_format,
            },
            rtv_heap,
        )?;
        let render_target_views =
            BumpAllocator::new(swapchain.buffer_count(), config.render_target_view_count);

        log::info!(
            "Device ready: {} render lists, {} upload lists, {} back buffers",
            config.render_command_list_count,
            config.upload_command_list_count,
            config.back_buffer_count
        );

        Ok(Self {
            backend,
            present,
            upload,
            transition,
            upload_heap,
            dynamic_heap,
            readback_heap,
            descriptor_heap,
            static_descriptors,
            dynamic_descriptors,
            rtv_heap,
            render_target_views,
            queries,
            swapchain,
            pending_transitions: Vec::new(),
            upload_dependencies: Vec::new(),
            releases: DeferredReleases::default(),
            frame: None,
            frame_index: 0,
            frames_submitted: 0,
            uploads_submitted: 0,
            destroyed: false,
        })
    }

    /// Wait for the GPU, fire outstanding timestamp callbacks and release
    /// deferred resources. Native objects go away with the backend.
    pub fn destroy(mut self) -> DeviceResult<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> DeviceResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        if self.is_lost() {
            log::warn!("Device lost, tearing down without waiting for the GPU");
        } else {
            self.wait_gpu_idle()?;
        }
        let discarded = self.queries.discard_callbacks();
        if discarded > 0 {
            log::warn!(
                "Dropping {} timestamp callbacks recorded in an unsubmitted frame",
                discarded
            );
        }
        self.releases.flush_all(&mut self.backend)?;
        log::info!("Device destroyed after {} frames", self.frames_submitted);
        Ok(())
    }

    // Frame loop

    /// Open the next render command list and make the next back buffer renderable.
    ///
    /// Blocks while the command list it reuses is still in flight, then
    /// reclaims every per-frame allocation that submission covered.
    pub fn begin_render_command_list(&mut self) -> DeviceResult<RenderFrame> {
        self.check_lost()?;
        // Reclaim before anything is opened so a failure leaves no list open,
        // and a later call flashes the same value again.
        self.present.wait_next(&mut self.backend)?;
        if let Some(completed) = self.present.last_completed() {
            self.flash_frame_rings(completed)?;
        }
        self.collect_releases()?;

        let index = self.swapchain.acquire(&mut self.backend)?;
        let (command_list, _) = self.present.open(&mut self.backend)?;

        let back_buffer = self.swapchain.back_buffer(index);
        self.backend.transition(
            command_list,
            back_buffer,
            ResourceState::Present,
            ResourceState::RenderTarget,
        )?;

        let frame = RenderFrame {
            command_list,
            back_buffer,
            back_buffer_index: index,
            render_target: self.swapchain.render_target(index),
        };
        self.frame = Some(frame);
        self.frame_index += 1;
        log::trace!("Frame {} begins on back buffer {}", self.frame_index, index);
        Ok(frame)
    }

    /// Close and submit the render command list, then present.
    ///
    /// An upload command list that is still open is submitted first, and the
    /// render submission waits on the GPU for every upload since the last
    /// frame. Returns `false` when the surface is outdated and the swap chain
    /// should be resized.
    pub fn close_submit_and_present(&mut self, vsync: bool) -> DeviceResult<bool> {
        self.check_lost()?;
        let frame = self
            .frame
            .take()
            .ok_or_else(|| DeviceError::InvalidState("no render command list is open".into()))?;
        let list = frame.command_list;

        for slots in self.queries.take_unresolved() {
            self.backend
                .resolve_timestamps(list, self.queries.heap(), slots)?;
        }
        self.backend.transition(
            list,
            frame.back_buffer,
            ResourceState::RenderTarget,
            ResourceState::Present,
        )?;

        if self.upload.is_open() {
            log::debug!("Submitting the open upload command list before present");
            self.close_upload_command_list()?;
        }
        for (fence, value) in self.upload_dependencies.drain(..) {
            self.present.wait_on(&mut self.backend, fence, value)?;
        }

        self.present.close(&mut self.backend)?;
        let submission = self.present.submit(&mut self.backend, vsync)?;
        let value = submission.fence_value;
        self.dynamic_heap.ring_mut().add_pending_fence(value);
        self.readback_heap.ring_mut().add_pending_fence(value);
        self.dynamic_descriptors.ring_mut().add_pending_fence(value);
        self.queries.ring_mut().add_pending_fence(value);
        self.frames_submitted += 1;

        match submission.present {
            Some(PresentStatus::Outdated) => {
                log::warn!("Swap chain is outdated after frame {}", self.frame_index);
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    // Uploads

    /// Open an upload command list. Resources created with initial data
    /// until [`close_upload_command_list`](Self::close_upload_command_list)
    /// are filled by it.
    pub fn begin_upload_command_list(&mut self) -> DeviceResult<CommandListHandle> {
        self.check_lost()?;
        let (list, completed) = self.upload.open(&mut self.backend)?;
        let polled = self.upload.poll_completed(&self.backend)?;
        if let Some(completed) = completed.max(polled) {
            self.upload_heap.ring_mut().flash_fence_value(completed);
        }
        Ok(list)
    }

    /// Submit the upload command list, followed by a barrier-only submission
    /// on the transition queue when uploaded resources need a final state.
    pub fn close_upload_command_list(&mut self) -> DeviceResult<()> {
        self.check_lost()?;
        if !self.upload.is_open() {
            return Err(DeviceError::InvalidState(
                "no upload command list is open".into(),
            ));
        }

        self.upload.close(&mut self.backend)?;
        let uploaded = self.upload.submit(&mut self.backend, false)?.fence_value;
        self.upload_heap.ring_mut().add_pending_fence(uploaded);
        self.uploads_submitted += 1;

        let dependency = if self.pending_transitions.is_empty() {
            (self.upload.fence(), uploaded)
        } else {
            let (list, _) = self.transition.open(&mut self.backend)?;
            self.transition
                .wait_on(&mut self.backend, self.upload.fence(), uploaded)?;
            for (resource, state) in self.pending_transitions.drain(..) {
                self.backend
                    .transition(list, resource, ResourceState::CopyDest, state)?;
            }
            self.transition.close(&mut self.backend)?;
            let transitioned = self.transition.submit(&mut self.backend, false)?.fence_value;
            (self.transition.fence(), transitioned)
        };

        match self
            .upload_dependencies
            .iter_mut()
            .find(|(fence, _)| *fence == dependency.0)
        {
            Some(existing) => existing.1 = existing.1.max(dependency.1),
            None => self.upload_dependencies.push(dependency),
        }
        log::debug!(
            "Upload {} submitted, render work waits on {:?}",
            uploaded,
            dependency
        );
        Ok(())
    }

    // Resources

    /// Create a GPU resource.
    ///
    /// With `initial_data`, an upload command list must be open: the data is
    /// staged in the upload heap, copied by that list, and the resource is
    /// moved to `initial_state` once the upload completes.
    pub fn create_gpu_resource(
        &mut self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
        initial_data: Option<&[u8]>,
    ) -> DeviceResult<ResourceHandle> {
        let Some(data) = initial_data else {
            return Ok(self.backend.create_resource(desc, initial_state, clear_value)?);
        };

        let list = match self.upload.active_list() {
            Some(list) if list.current_fence_value().is_some() => list.handle(),
            _ => {
                return Err(DeviceError::InvalidState(
                    "initial data needs an open upload command list".into(),
                ))
            }
        };
        let size = data.len() as u64;
        if size > desc.byte_size() {
            return Err(DeviceError::InvalidParameter(format!(
                "{} bytes of initial data for a {}-byte resource",
                size,
                desc.byte_size()
            )));
        }

        let staging = self.upload_heap.allocate(size, UPLOAD_ALIGNMENT)?;
        let resource = self
            .backend
            .create_resource(desc, ResourceState::CopyDest, clear_value)?;
        let range = self.upload_heap.check_bounds(staging.start, size)?;
        self.backend.heap_memory_mut(self.upload_heap.heap())?[range].copy_from_slice(data);
        self.backend
            .copy_to_resource(list, self.upload_heap.heap(), staging.start, resource, size)?;

        if initial_state != ResourceState::CopyDest {
            self.pending_transitions.push((resource, initial_state));
        }
        log::trace!(
            "Staged {} bytes for {:?} at upload offset {}",
            size,
            desc.label,
            staging.start
        );
        Ok(resource)
    }

    /// Release a resource once no submitted or recording work can touch it.
    pub fn release_gpu_resource(&mut self, resource: ResourceHandle) -> DeviceResult<()> {
        self.pending_transitions.retain(|(r, _)| *r != resource);
        self.releases.queue(
            resource,
            QueueFences {
                render: self.present.last_assigned(),
                upload: self.upload.last_assigned(),
                transition: self.transition.last_assigned(),
            },
        );
        self.collect_releases()?;
        Ok(())
    }

    /// Record a copy of `resource` (in the copy-source state) into readback memory.
    pub fn record_readback(
        &mut self,
        list: CommandListHandle,
        resource: ResourceHandle,
        target: &ReadbackAllocation,
    ) -> DeviceResult<()> {
        self.backend
            .copy_from_resource(list, resource, target.heap, target.offset, target.size)?;
        Ok(())
    }

    // Transient allocations

    /// Allocate per-frame memory, reclaimed once the frame's fence completes.
    ///
    /// # Errors
    ///
    /// [`DeviceError::AllocationExhausted`] when the dynamic heap is full.
    /// With [`AllocError::NoRoom`](crate::AllocError::NoRoom) the call can be
    /// retried after [`wait_gpu_idle`](Self::wait_gpu_idle).
    pub fn allocate_dynamic_buffer(
        &mut self,
        size: u64,
        alignment: u64,
    ) -> DeviceResult<DynamicAllocation> {
        check_alignment(alignment)?;
        self.dynamic_heap.allocate_dynamic(size, alignment)
    }

    /// Allocate several per-frame buffers from one contiguous block.
    ///
    /// Either every buffer is allocated or none is.
    pub fn allocate_dynamic_buffers(
        &mut self,
        sizes: &[u64],
        alignment: u64,
    ) -> DeviceResult<Vec<DynamicAllocation>> {
        check_alignment(alignment)?;
        let alignment = alignment.max(1);
        let mut offsets = Vec::with_capacity(sizes.len());
        let too_large = || DeviceError::exhausted(HeapKind::Dynamic, AllocError::AllocTooLarge);
        let mut total = 0u64;
        for &size in sizes {
            let offset = checked_align_up(total, alignment).ok_or_else(too_large)?;
            offsets.push(offset);
            total = offset.checked_add(size).ok_or_else(too_large)?;
        }

        let block = self.dynamic_heap.allocate_dynamic(total, alignment)?;
        Ok(sizes
            .iter()
            .zip(offsets)
            .map(|(&size, offset)| DynamicAllocation {
                offset: block.offset + offset,
                size,
                gpu_address: block.gpu_address + offset,
            })
            .collect())
    }

    /// Copy `bytes` to the start of a dynamic allocation.
    pub fn write_dynamic(&mut self, alloc: &DynamicAllocation, bytes: &[u8]) -> DeviceResult<()> {
        let size = bytes.len() as u64;
        if size > alloc.size {
            return Err(DeviceError::InvalidParameter(format!(
                "{} bytes do not fit a {}-byte allocation",
                size, alloc.size
            )));
        }
        let range = self.dynamic_heap.check_bounds(alloc.offset, size)?;
        self.backend.heap_memory_mut(self.dynamic_heap.heap())?[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy plain-old-data values to the start of a dynamic allocation.
    pub fn write_dynamic_pod<T: bytemuck::Pod>(
        &mut self,
        alloc: &DynamicAllocation,
        data: &[T],
    ) -> DeviceResult<()> {
        self.write_dynamic(alloc, bytemuck::cast_slice(data))
    }

    /// CPU view of a dynamic allocation.
    pub fn dynamic_bytes_mut(&mut self, alloc: &DynamicAllocation) -> DeviceResult<&mut [u8]> {
        let range = self.dynamic_heap.check_bounds(alloc.offset, alloc.size)?;
        Ok(&mut self.backend.heap_memory_mut(self.dynamic_heap.heap())?[range])
    }

    /// Allocate per-frame shader-visible descriptors.
    pub fn allocate_dynamic_descriptors(&mut self, count: u32) -> DeviceResult<DescriptorRange> {
        self.dynamic_descriptors.allocate(count)
    }

    /// Allocate descriptors that live as long as the device.
    pub fn allocate_static_descriptors(&mut self, count: u32) -> DeviceResult<DescriptorRange> {
        let index = self.static_descriptors.allocate(count).ok_or_else(|| {
            let err = DeviceError::StaticDescriptorsExhausted {
                requested: count,
                remaining: self.static_descriptors.remaining(),
                capacity: self.static_descriptors.capacity(),
            };
            log::error!("{}", err);
            err
        })?;
        Ok(self.descriptor_heap.range(index, count))
    }

    /// Allocate render-target views that live as long as the device.
    pub fn allocate_render_target_views(&mut self, count: u32) -> DeviceResult<DescriptorRange> {
        let index = self.render_target_views.allocate(count).ok_or_else(|| {
            DeviceError::RenderTargetViewsExhausted {
                requested: count,
                remaining: self.render_target_views.remaining(),
                capacity: self.render_target_views.capacity(),
            }
        })?;
        Ok(self.rtv_heap.range(index, count))
    }

    /// Allocate readback memory the current frame's GPU work copies into.
    pub fn allocate_readback_buffer(
        &mut self,
        size: u64,
        alignment: u64,
    ) -> DeviceResult<ReadbackAllocation> {
        check_alignment(alignment)?;
        self.readback_heap.allocate_readback(size, alignment)
    }

    /// CPU view of readback memory. Valid once the frame that wrote it completed.
    pub fn readback_bytes(&self, alloc: &ReadbackAllocation) -> DeviceResult<&[u8]> {
        let range = self.readback_heap.check_bounds(alloc.offset, alloc.size)?;
        Ok(&self.backend.heap_memory(self.readback_heap.heap())?[range])
    }

    // Timestamps

    /// Record a GPU timestamp on the open render command list.
    ///
    /// `callback` receives the tick value exactly once, after the frame's
    /// fence completes.
    pub fn query_timestamp<F>(&mut self, command_list: CommandListHandle, callback: F) -> DeviceResult<()>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        match self.frame {
            Some(frame) if frame.command_list == command_list => {}
            _ => {
                return Err(DeviceError::InvalidParameter(
                    "timestamps are recorded on the open render command list".into(),
                ))
            }
        }
        let callback: TimestampCallback = Box::new(callback);
        let slot = self.queries.allocate(callback)?;
        self.backend
            .write_timestamp(command_list, self.queries.heap(), slot)?;
        Ok(())
    }

    /// Timestamp ticks per second.
    pub fn timestamp_frequency(&self) -> DeviceResult<u64> {
        Ok(self.backend.timestamp_frequency(self.present.handle())?)
    }

    // Synchronization

    /// Block until every queue is idle and reclaim everything.
    pub fn wait_gpu_idle(&mut self) -> DeviceResult<()> {
        self.check_lost()?;
        let render = self.present.wait_idle(&mut self.backend)?;
        let upload = self.upload.wait_idle(&mut self.backend)?;
        self.transition.wait_idle(&mut self.backend)?;

        if let Some(render) = render {
            self.flash_frame_rings(render)?;
        }
        if let Some(upload) = upload {
            self.upload_heap.ring_mut().flash_fence_value(upload);
        }
        self.collect_releases()?;
        log::debug!("GPU idle");
        Ok(())
    }

    /// Resize the swap chain. Returns `false` (and does nothing) for a zero
    /// extent, e.g. a minimized window.
    pub fn resize_swapchain(&mut self, width: u32, height: u32) -> DeviceResult<bool> {
        if width == 0 || height == 0 {
            log::debug!("Ignoring resize to {}x{}", width, height);
            return Ok(false);
        }
        if self.frame.is_some() {
            return Err(DeviceError::InvalidState(
                "cannot resize the swap chain while a frame is open".into(),
            ));
        }
        self.wait_gpu_idle()?;
        self.swapchain
            .resize(&mut self.backend, Extent2d::new(width, height))?;
        Ok(true)
    }

    // Accessors

    /// Number of frames begun so far.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Index of the back buffer the latest frame renders into.
    pub fn current_back_buffer(&self) -> usize {
        self.swapchain.current()
    }

    pub fn swapchain_extent(&self) -> Extent2d {
        self.swapchain.extent()
    }

    pub fn swapchain_format(&self) -> TextureFormat {
        self.swapchain.format()
    }

    /// Highest fence value observed complete on `queue`.
    pub fn last_completed_fence(&self, queue: QueueKind) -> Option<FenceValue> {
        self.queue(queue).last_completed()
    }

    /// Fence value of the latest submission on `queue`.
    pub fn last_submitted_fence(&self, queue: QueueKind) -> Option<FenceValue> {
        self.queue(queue).last_submitted()
    }

    pub fn queue(&self, kind: QueueKind) -> &CommandQueue {
        match kind {
            QueueKind::Present => &self.present,
            QueueKind::Upload => &self.upload,
            QueueKind::Transition => &self.transition,
        }
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            frames_submitted: self.frames_submitted,
            uploads_submitted: self.uploads_submitted,
            upload_heap_live: self.upload_heap.ring().live(),
            dynamic_heap_live: self.dynamic_heap.ring().live(),
            readback_heap_live: self.readback_heap.ring().live(),
            dynamic_descriptors_live: self.dynamic_descriptors.ring().live(),
            queries_live: self.queries.ring().live(),
            static_descriptors_used: self.static_descriptors.used(),
            render_target_views_used: self.render_target_views.used(),
            timestamps_waiting: self.queries.waiting(),
            deferred_releases: self.releases.pending_count(),
        }
    }

    /// Whether a failed submission or fence wait has lost the device.
    ///
    /// Every later submission or wait returns [`DeviceError::DeviceLost`].
    pub fn is_lost(&self) -> bool {
        self.present.is_lost() || self.upload.is_lost() || self.transition.is_lost()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Native backend, for recording commands into a command list.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn check_lost(&self) -> DeviceResult<()> {
        if self.is_lost() {
            return Err(DeviceError::DeviceLost(
                "an earlier submission or fence wait failed".into(),
            ));
        }
        Ok(())
    }

    fn flash_frame_rings(&mut self, completed: FenceValue) -> DeviceResult<()> {
        fn flash(ring: &mut RingAllocator, completed: FenceValue) {
            if let Some(reclaimed) = ring.flash_fence_value(completed) {
                log::trace!("Reclaimed {} units up to fence {}", reclaimed.end - reclaimed.start, completed);
            }
        }
        flash(self.dynamic_heap.ring_mut(), completed);
        flash(self.readback_heap.ring_mut(), completed);
        flash(self.dynamic_descriptors.ring_mut(), completed);
        self.queries.flash(&self.backend, completed)
    }

    fn collect_releases(&mut self) -> DeviceResult<usize> {
        if self.releases.pending_count() == 0 {
            return Ok(0);
        }
        let completed = QueueFences {
            render: self.present.poll_completed(&self.backend)?,
            upload: self.upload.poll_completed(&self.backend)?,
            transition: self.transition.poll_completed(&self.backend)?,
        };
        self.releases.collect(&mut self.backend, &completed)
    }
}

impl<B: GpuBackend> Drop for Device<B> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("Device teardown failed: {}", e);
        }
    }
}

impl<B: GpuBackend> std::fmt::Debug for Device<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("backend", &self.backend.name())
            .field("frame_index", &self.frame_index)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn check_alignment(alignment: u64) -> DeviceResult<()> {
    if alignment > 1 && !alignment.is_power_of_two() {
        return Err(DeviceError::InvalidParameter(format!(
            "alignment {alignment} is not a power of two"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, Completion, HeadlessConfig};
    use crate::error::AllocError;

    fn small_config() -> DeviceConfig {
        DeviceConfig::default()
            .with_render_command_list_count(2)
            .with_upload_command_list_count(2)
            .with_heap_sizes(4096, 1024, 1024)
            .with_descriptor_counts(16, 8)
            .with_query_count(8)
    }

    fn deferred_device() -> Device<HeadlessBackend> {
        let backend =
            HeadlessBackend::new(HeadlessConfig::default().with_completion(Completion::Deferred));
        Device::new(backend, small_config()).unwrap()
    }

    fn frame(device: &mut Device<HeadlessBackend>) {
        device.begin_render_command_list().unwrap();
        device.close_submit_and_present(true).unwrap();
    }

    #[test]
    fn test_dynamic_space_reclaimed_after_frames_complete() {
        let mut device = deferred_device();

        device.begin_render_command_list().unwrap();
        device.allocate_dynamic_buffer(600, 1).unwrap();
        device.close_submit_and_present(true).unwrap();

        device.begin_render_command_list().unwrap();
        let err = device.allocate_dynamic_buffer(600, 1).unwrap_err();
        assert!(err.is_retryable());
        device.close_submit_and_present(true).unwrap();

        // Third frame reuses list 0, whose fence covers the first 600 bytes.
        device.begin_render_command_list().unwrap();
        assert!(device.allocate_dynamic_buffer(600, 1).is_ok());
        device.close_submit_and_present(true).unwrap();
    }

    #[test]
    fn test_wait_gpu_idle_makes_retry_succeed() {
        let mut device = deferred_device();

        device.begin_render_command_list().unwrap();
        device.allocate_dynamic_buffer(1000, 1).unwrap();
        device.close_submit_and_present(true).unwrap();

        device.begin_render_command_list().unwrap();
        assert!(device.allocate_dynamic_buffer(100, 1).unwrap_err().is_retryable());
        device.wait_gpu_idle().unwrap();
        assert!(device.allocate_dynamic_buffer(100, 1).is_ok());
        device.close_submit_and_present(true).unwrap();
    }

    #[test]
    fn test_too_large_dynamic_allocation() {
        let mut device = Device::headless(small_config()).unwrap();
        device.begin_render_command_list().unwrap();
        let err = device.allocate_dynamic_buffer(2048, 1).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::AllocationExhausted {
                heap: HeapKind::Dynamic,
                reason: AllocError::AllocTooLarge
            }
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_dynamic_buffers_are_all_or_nothing() {
        let mut device = Device::headless(small_config()).unwrap();
        device.begin_render_command_list().unwrap();

        let group = device.allocate_dynamic_buffers(&[10, 20, 30], 256).unwrap();
        assert_eq!(
            group.iter().map(|a| a.offset).collect::<Vec<_>>(),
            vec![0, 256, 512]
        );
        assert_eq!(group[2].gpu_address - group[0].gpu_address, 512);

        let live = device.stats().dynamic_heap_live;
        assert!(device.allocate_dynamic_buffers(&[200, 200], 256).is_err());
        assert_eq!(device.stats().dynamic_heap_live, live);
    }

    #[test]
    fn test_dynamic_buffers_overflowing_sizes_are_too_large() {
        let mut device = Device::headless(small_config()).unwrap();
        device.begin_render_command_list().unwrap();

        for (sizes, alignment) in [(&[u64::MAX - 10, 100][..], 1), (&[1, u64::MAX - 100][..], 256)] {
            let err = device.allocate_dynamic_buffers(sizes, alignment).unwrap_err();
            assert!(
                matches!(
                    err,
                    DeviceError::AllocationExhausted {
                        heap: HeapKind::Dynamic,
                        reason: AllocError::AllocTooLarge
                    }
                ),
                "{err:?}"
            );
        }
        assert_eq!(device.stats().dynamic_heap_live, 0);
        assert_eq!(device.allocate_dynamic_buffers(&[64], 256).unwrap()[0].offset, 0);
    }

    #[test]
    fn test_write_dynamic_bounds() {
        let mut device = Device::headless(small_config()).unwrap();
        device.begin_render_command_list().unwrap();
        let alloc = device.allocate_dynamic_buffer(8, 256).unwrap();

        device.write_dynamic_pod(&alloc, &[1.0f32, 2.0]).unwrap();
        assert_eq!(
            device.dynamic_bytes_mut(&alloc).unwrap(),
            bytemuck::cast_slice::<f32, u8>(&[1.0, 2.0])
        );
        assert!(matches!(
            device.write_dynamic(&alloc, &[0; 9]),
            Err(DeviceError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_non_power_of_two_alignment_rejected() {
        let mut device = Device::headless(small_config()).unwrap();
        assert!(matches!(
            device.allocate_dynamic_buffer(8, 48),
            Err(DeviceError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_static_descriptors_never_reclaimed() {
        let mut device = Device::headless(small_config()).unwrap();

        let first = device.allocate_static_descriptors(10).unwrap();
        assert_eq!(first.index, 0);
        frame(&mut device);
        device.wait_gpu_idle().unwrap();

        let second = device.allocate_static_descriptors(6).unwrap();
        assert_eq!(second.index, 10);
        assert!(matches!(
            device.allocate_static_descriptors(1),
            Err(DeviceError::StaticDescriptorsExhausted {
                requested: 1,
                remaining: 0,
                capacity: 16
            })
        ));
    }

    #[test]
    fn test_dynamic_descriptors_follow_static_range() {
        let mut device = Device::headless(small_config()).unwrap();
        device.begin_render_command_list().unwrap();

        let range = device.allocate_dynamic_descriptors(4).unwrap();
        assert_eq!(range.index, 16);
        assert!(device.allocate_dynamic_descriptors(5).unwrap_err().is_retryable());
    }

    #[test]
    fn test_render_target_views_after_back_buffers() {
        let mut device = Device::headless(small_config()).unwrap();
        let views = device.allocate_render_target_views(2).unwrap();
        assert_eq!(views.index, 2);
        assert_eq!(device.stats().render_target_views_used, 4);
    }

    #[test]
    fn test_back_buffers_rotate_and_transition() {
        let mut device = Device::headless(small_config()).unwrap();

        let first = device.begin_render_command_list().unwrap();
        assert_eq!(
            device.backend().resource_state(first.back_buffer),
            Some(ResourceState::Present)
        );
        device.close_submit_and_present(false).unwrap();
        assert_eq!(
            device.backend().resource_state(first.back_buffer),
            Some(ResourceState::Present)
        );

        let second = device.begin_render_command_list().unwrap();
        assert_ne!(first.back_buffer_index, second.back_buffer_index);
        assert_ne!(first.render_target, second.render_target);
        assert_eq!(device.current_back_buffer(), second.back_buffer_index);
        device.close_submit_and_present(false).unwrap();
        assert_eq!(device.frame_index(), 2);
    }

    #[test]
    fn test_outdated_surface_reports_false() {
        let backend = HeadlessBackend::default();
        let gpu = backend.gpu();
        let mut device = Device::new(backend, small_config()).unwrap();

        gpu.set_surface_outdated(true);
        device.begin_render_command_list().unwrap();
        assert!(!device.close_submit_and_present(true).unwrap());

        gpu.set_surface_outdated(false);
        assert!(device.resize_swapchain(320, 200).unwrap());
        device.begin_render_command_list().unwrap();
        assert!(device.close_submit_and_present(true).unwrap());
        assert_eq!(device.swapchain_extent(), Extent2d::new(320, 200));
    }

    #[test]
    fn test_zero_size_resize_is_ignored() {
        let mut device = Device::headless(small_config()).unwrap();
        let extent = device.swapchain_extent();
        assert!(!device.resize_swapchain(0, 600).unwrap());
        assert_eq!(device.swapchain_extent(), extent);
    }

    #[test]
    fn test_resize_inside_frame_rejected() {
        let mut device = Device::headless(small_config()).unwrap();
        device.begin_render_command_list().unwrap();
        assert!(matches!(
            device.resize_swapchain(64, 64),
            Err(DeviceError::InvalidState(_))
        ));
    }

    #[test]
    fn test_close_without_frame_is_invalid_state() {
        let mut device = Device::headless(small_config()).unwrap();
        assert!(matches!(
            device.close_submit_and_present(true),
            Err(DeviceError::InvalidState(_))
        ));
        assert!(matches!(
            device.close_upload_command_list(),
            Err(DeviceError::InvalidState(_))
        ));
    }

    #[test]
    fn test_render_waits_on_upload_before_signal() {
        let backend = HeadlessBackend::default();
        let gpu = backend.gpu();
        let mut device = Device::new(backend, small_config()).unwrap();

        device.begin_upload_command_list().unwrap();
        device
            .create_gpu_resource(
                &ResourceDesc::buffer(4),
                ResourceState::ShaderResource,
                None,
                Some(&[1, 2, 3, 4]),
            )
            .unwrap();
        device.close_upload_command_list().unwrap();

        device.begin_render_command_list().unwrap();
        gpu.clear_events();
        device.close_submit_and_present(true).unwrap();

        let transition_fence = device.queue(QueueKind::Transition).fence();
        let events = gpu.events();
        let wait = events
            .iter()
            .position(|e| {
                matches!(e, BackendEvent::QueueWait { fence, value: 1, .. } if *fence == transition_fence)
            })
            .unwrap();
        let execute = events
            .iter()
            .position(|e| matches!(e, BackendEvent::Execute { .. }))
            .unwrap();
        assert!(wait < execute);
    }

    #[test]
    fn test_open_upload_is_drained_by_present() {
        let mut device = Device::headless(small_config()).unwrap();

        device.begin_render_command_list().unwrap();
        device.begin_upload_command_list().unwrap();
        device
            .create_gpu_resource(&ResourceDesc::buffer(4), ResourceState::CopyDest, None, Some(&[9; 4]))
            .unwrap();
        device.close_submit_and_present(true).unwrap();

        assert!(!device.queue(QueueKind::Upload).is_open());
        assert_eq!(device.stats().uploads_submitted, 1);
        assert_eq!(device.last_submitted_fence(QueueKind::Transition), None);
    }

    #[test]
    fn test_initial_data_requires_upload_list() {
        let mut device = Device::headless(small_config()).unwrap();
        let result = device.create_gpu_resource(
            &ResourceDesc::buffer(4),
            ResourceState::ShaderResource,
            None,
            Some(&[0; 4]),
        );
        assert!(matches!(result, Err(DeviceError::InvalidState(_))));
    }

    #[test]
    fn test_release_is_deferred_until_frame_completes() {
        let mut device = deferred_device();
        let resource = device
            .create_gpu_resource(&ResourceDesc::buffer(16), ResourceState::Common, None, None)
            .unwrap();
        let before = device.backend().resource_count();

        device.begin_render_command_list().unwrap();
        device.release_gpu_resource(resource).unwrap();
        device.close_submit_and_present(true).unwrap();
        assert_eq!(device.stats().deferred_releases, 1);
        assert_eq!(device.backend().resource_count(), before);

        device.wait_gpu_idle().unwrap();
        assert_eq!(device.stats().deferred_releases, 0);
        assert_eq!(device.backend().resource_count(), before - 1);
    }

    #[test]
    fn test_timestamp_requires_render_list() {
        let mut device = Device::headless(small_config()).unwrap();
        let upload = device.begin_upload_command_list().unwrap();
        assert!(matches!(
            device.query_timestamp(upload, |_| {}),
            Err(DeviceError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_failed_submit_loses_device_without_hanging() {
        let backend =
            HeadlessBackend::new(HeadlessConfig::default().with_completion(Completion::Deferred));
        let gpu = backend.gpu();
        let mut device =
            Device::new(backend, small_config().with_render_command_list_count(1)).unwrap();

        device.begin_render_command_list().unwrap();
        gpu.fail_next_submit();
        let err = device.close_submit_and_present(true).unwrap_err();
        assert!(err.is_device_lost(), "{err:?}");
        assert!(device.is_lost());
        assert!(device.queue(QueueKind::Present).lists()[0].is_idle());

        assert!(device.begin_render_command_list().unwrap_err().is_device_lost());
        assert!(device.begin_upload_command_list().unwrap_err().is_device_lost());
        assert!(device.wait_gpu_idle().unwrap_err().is_device_lost());
        assert!(device.resize_swapchain(32, 32).unwrap_err().is_device_lost());
        device.destroy().unwrap();
    }

    #[test]
    fn test_fence_timeout_latches_device_loss() {
        let backend =
            HeadlessBackend::new(HeadlessConfig::default().with_completion(Completion::Manual));
        let config = small_config()
            .with_render_command_list_count(1)
            .with_fence_timeout(std::time::Duration::from_millis(5));
        let mut device = Device::new(backend, config).unwrap();

        frame(&mut device);
        assert!(matches!(
            device.begin_render_command_list(),
            Err(DeviceError::FenceTimeout { value: 1, .. })
        ));
        assert!(device.is_lost());
        // The GPU never retires anything; teardown must not wait on it.
        drop(device);
    }

    #[test]
    fn test_timestamp_read_failure_is_retried_by_next_frame() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let backend = HeadlessBackend::default();
        let gpu = backend.gpu();
        let mut device =
            Device::new(backend, small_config().with_render_command_list_count(1)).unwrap();
        let fired = Arc::new(AtomicU64::new(0));

        let render = device.begin_render_command_list().unwrap();
        let counter = fired.clone();
        device
            .query_timestamp(render.command_list, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        device.close_submit_and_present(true).unwrap();

        gpu.fail_next_timestamp_read();
        assert!(device.begin_render_command_list().is_err());
        assert!(!device.queue(QueueKind::Present).is_open());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(device.stats().timestamps_waiting, 1);

        frame(&mut device);
        device.wait_gpu_idle().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(device.stats().timestamps_waiting, 0);
    }

    #[test]
    fn test_creation_failure_unwinds_everything() {
        for what in ["queue", "fence", "heap", "descriptor heap", "query heap", "swap chain"] {
            let backend = HeadlessBackend::new(HeadlessConfig::default().failing_creation_of(what));
            let gpu = backend.gpu();
            let err = Device::new(backend, small_config()).unwrap_err();
            assert!(
                matches!(err, DeviceError::ResourceCreationFailed { what: w, .. } if w == what),
                "{what}: {err}"
            );
            assert_eq!(gpu.live_objects(), 0, "{what} leaked objects");
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = small_config().with_render_command_list_count(0);
        assert!(matches!(
            Device::headless(config),
            Err(DeviceError::InvalidConfig(_))
        ));
    }
}
