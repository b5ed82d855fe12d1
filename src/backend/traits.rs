//! Core backend abstraction traits
//!
//! [`GpuBackend`] is the seam between the submission core and a native
//! graphics API. The core never touches native objects directly; it holds
//! opaque handles and calls back into the backend in a fixed order.

use std::ops::Range;
use std::time::Duration;

use thiserror::Error;

use crate::backend::types::*;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to create {what}: {reason}")]
    CreationFailed { what: &'static str, reason: String },
    #[error("Failed to submit: {0}")]
    SubmitFailed(String),
    #[error("Failed to wait for fence: {0}")]
    WaitFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to record command: {0}")]
    RecordFailed(String),
    #[error("Unknown {0} handle")]
    InvalidHandle(&'static str),
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

impl BackendError {
    pub(crate) fn creation(what: &'static str, reason: impl ToString) -> Self {
        Self::CreationFailed {
            what,
            reason: reason.to_string(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a hardware queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub(crate) u64);

/// Handle to a command allocator + command buffer pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandListHandle(pub(crate) u64);

/// Handle to a fence (a monotonically increasing GPU counter)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub(crate) u64);

/// Handle to a CPU-mapped heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapHandle(pub(crate) u64);

/// Handle to a descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHeapHandle(pub(crate) u64);

/// Handle to a timestamp query heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryHeapHandle(pub(crate) u64);

/// Handle to a GPU resource (buffer or texture)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub(crate) u64);

/// Native operations the submission core is built from.
///
/// All methods are called from the single submission thread.
pub trait GpuBackend {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    // Queues and synchronization

    /// Create a hardware queue.
    fn create_queue(&mut self, kind: QueueKind) -> BackendResult<QueueHandle>;

    /// Create a command allocator + command buffer pair bound to `queue`.
    fn create_command_list(&mut self, queue: QueueHandle) -> BackendResult<CommandListHandle>;

    /// Create a fence whose completed value starts at 0.
    fn create_fence(&mut self, label: &str) -> BackendResult<FenceHandle>;

    /// Reset the allocator and reopen the command buffer for recording.
    ///
    /// The caller guarantees the GPU finished the previous use.
    fn reset_command_list(&mut self, list: CommandListHandle) -> BackendResult<()>;

    /// Finish recording.
    fn close_command_list(&mut self, list: CommandListHandle) -> BackendResult<()>;

    /// Enqueue a closed command buffer.
    fn execute(&mut self, queue: QueueHandle, list: CommandListHandle) -> BackendResult<()>;

    /// Enqueue a GPU-side signal of `fence` to `value` after all prior work on `queue`.
    fn signal(&mut self, queue: QueueHandle, fence: FenceHandle, value: u64) -> BackendResult<()>;

    /// Make later work on `queue` wait on the GPU until `fence` reaches `value`.
    fn queue_wait(&mut self, queue: QueueHandle, fence: FenceHandle, value: u64)
        -> BackendResult<()>;

    /// Last value the GPU signalled on `fence`.
    fn completed_value(&self, fence: FenceHandle) -> BackendResult<u64>;

    /// Block the CPU until `fence` reaches `value`.
    ///
    /// Returns `false` if `timeout` elapsed first.
    fn wait_fence(
        &mut self,
        fence: FenceHandle,
        value: u64,
        timeout: Option<Duration>,
    ) -> BackendResult<bool>;

    // Memory

    /// Create a persistently mapped heap.
    fn create_heap(&mut self, kind: MemoryKind, size: u64, label: &str) -> BackendResult<HeapInfo>;

    /// CPU view of a mapped heap.
    fn heap_memory(&self, heap: HeapHandle) -> BackendResult<&[u8]>;

    /// Mutable CPU view of a mapped heap.
    fn heap_memory_mut(&mut self, heap: HeapHandle) -> BackendResult<&mut [u8]>;

    // Descriptors

    /// Create a descriptor heap with `count` entries.
    fn create_descriptor_heap(
        &mut self,
        kind: DescriptorHeapKind,
        count: u32,
    ) -> BackendResult<DescriptorHeapInfo>;

    /// Write a render-target view of `resource` into slot `index`.
    fn write_render_target_view(
        &mut self,
        heap: DescriptorHeapHandle,
        index: u32,
        resource: ResourceHandle,
    ) -> BackendResult<()>;

    // Timestamp queries

    /// Create a timestamp query heap with `count` slots.
    fn create_query_heap(&mut self, count: u32) -> BackendResult<QueryHeapHandle>;

    /// Record a GPU timestamp into `slot`.
    fn write_timestamp(
        &mut self,
        list: CommandListHandle,
        heap: QueryHeapHandle,
        slot: u32,
    ) -> BackendResult<()>;

    /// Record the copy of `slots` into CPU-readable memory.
    fn resolve_timestamps(
        &mut self,
        list: CommandListHandle,
        heap: QueryHeapHandle,
        slots: Range<u32>,
    ) -> BackendResult<()>;

    /// Read a resolved tick. Valid once the resolving submission completed.
    fn read_timestamp(&self, heap: QueryHeapHandle, slot: u32) -> BackendResult<u64>;

    /// Timestamp ticks per second on `queue`.
    fn timestamp_frequency(&self, queue: QueueHandle) -> BackendResult<u64>;

    // Resources

    /// Create a committed GPU resource.
    fn create_resource(
        &mut self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
    ) -> BackendResult<ResourceHandle>;

    /// Destroy a resource. The caller guarantees the GPU no longer uses it.
    fn release_resource(&mut self, resource: ResourceHandle) -> BackendResult<()>;

    /// Record a copy of `size` bytes from a mapped heap into `dst`.
    fn copy_to_resource(
        &mut self,
        list: CommandListHandle,
        src: HeapHandle,
        src_offset: u64,
        dst: ResourceHandle,
        size: u64,
    ) -> BackendResult<()>;

    /// Record a copy of `size` bytes from `src` into a mapped heap.
    fn copy_from_resource(
        &mut self,
        list: CommandListHandle,
        src: ResourceHandle,
        dst: HeapHandle,
        dst_offset: u64,
        size: u64,
    ) -> BackendResult<()>;

    /// Record a state transition barrier.
    fn transition(
        &mut self,
        list: CommandListHandle,
        resource: ResourceHandle,
        before: ResourceState,
        after: ResourceState,
    ) -> BackendResult<()>;

    // Swap chain

    /// Create the swap chain presented from `queue`; returns its back buffers.
    fn create_swapchain(
        &mut self,
        queue: QueueHandle,
        desc: &SwapchainDesc,
    ) -> BackendResult<Vec<ResourceHandle>>;

    /// Recreate the back buffers at a new size. The GPU must be idle.
    fn resize_swapchain(&mut self, extent: Extent2d) -> BackendResult<Vec<ResourceHandle>>;

    /// Index of the back buffer the next frame renders into.
    fn acquire_back_buffer(&mut self) -> BackendResult<usize>;

    /// Queue the current back buffer for display.
    fn present(&mut self, queue: QueueHandle, sync_interval: u32) -> BackendResult<PresentStatus>;
}
