//! Headless GPU backend for testing and development.
//!
//! This backend doesn't talk to a GPU. It keeps every object in host memory,
//! executes recorded commands on the CPU and simulates fence progress so the
//! submission core can be exercised deterministically:
//!
//! - [`Completion::Immediate`]: every signal completes as soon as it is queued.
//! - [`Completion::Deferred`]: signals stay queued per hardware queue and are
//!   retired in queue order when the CPU waits on them (the "GPU" catches up
//!   while the CPU blocks).
//! - [`Completion::Manual`]: signals are retired only through
//!   [`HeadlessGpu::retire_all`], typically from another thread. A CPU wait
//!   blocks until then or until its timeout elapses.
//!
//! Recorded commands take effect when executed; only fence progress is
//! simulated. Every call is appended to an event log ([`HeadlessGpu::events`])
//! so tests can check ordering.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::traits::*;
use super::types::*;

/// How the simulated GPU completes fence signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    #[default]
    Immediate,
    Deferred,
    Manual,
}

/// Headless backend settings.
#[derive(Debug, Clone, Default)]
pub struct HeadlessConfig {
    pub completion: Completion,
    /// Object kind (e.g. `"fence"`, `"swap chain"`) whose creation should fail.
    pub fail_creation_of: Option<&'static str>,
}

impl HeadlessConfig {
    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    pub fn failing_creation_of(mut self, what: &'static str) -> Self {
        self.fail_creation_of = Some(what);
        self
    }
}

/// One backend call, in program order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Reset(CommandListHandle),
    Close(CommandListHandle),
    Execute {
        queue: QueueHandle,
        list: CommandListHandle,
    },
    Signal {
        queue: QueueHandle,
        fence: FenceHandle,
        value: u64,
    },
    QueueWait {
        queue: QueueHandle,
        fence: FenceHandle,
        value: u64,
    },
    CpuWait {
        fence: FenceHandle,
        value: u64,
    },
    Present {
        queue: QueueHandle,
        sync_interval: u32,
    },
    Copy {
        list: CommandListHandle,
        dst: ResourceHandle,
        size: u64,
    },
    Readback {
        list: CommandListHandle,
        src: ResourceHandle,
        size: u64,
    },
    Transition {
        list: CommandListHandle,
        resource: ResourceHandle,
        after: ResourceState,
    },
    Timestamp {
        list: CommandListHandle,
        slot: u32,
    },
    Release(ResourceHandle),
}

#[derive(Debug, Clone, Copy)]
enum GpuOp {
    Signal { fence: u64, value: u64 },
    Wait { fence: u64, value: u64 },
}

#[derive(Debug, Default)]
struct GpuState {
    fences: HashMap<u64, u64>,
    queues: BTreeMap<u64, VecDeque<GpuOp>>,
    events: Vec<BackendEvent>,
    live_objects: usize,
    fail_next_submit: bool,
    fail_next_timestamp_read: bool,
    surface_outdated: bool,
    extra_back_buffers: u32,
}

impl GpuState {
    fn completed(&self, fence: u64) -> u64 {
        self.fences.get(&fence).copied().unwrap_or(0)
    }

    /// Run the first runnable op of any queue. Returns `false` when stuck.
    fn step(&mut self) -> bool {
        let runnable = self.queues.iter().find_map(|(&queue, ops)| match ops.front() {
            Some(GpuOp::Signal { .. }) => Some(queue),
            Some(GpuOp::Wait { fence, value }) if self.completed(*fence) >= *value => Some(queue),
            _ => None,
        });
        let Some(queue) = runnable else {
            return false;
        };
        if let Some(GpuOp::Signal { fence, value }) =
            self.queues.get_mut(&queue).and_then(VecDeque::pop_front)
        {
            let completed = self.fences.entry(fence).or_insert(0);
            *completed = (*completed).max(value);
        }
        true
    }

    fn retire_until(&mut self, fence: u64, value: u64) -> bool {
        while self.completed(fence) < value {
            if !self.step() {
                return false;
            }
        }
        true
    }

    fn retire_all(&mut self) {
        while self.step() {}
    }

    fn pending_ops(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<GpuState>,
    progress: Condvar,
}

/// Observer/driver handle onto the simulated GPU.
///
/// Cloneable and `Send`, so a test thread can retire work while the
/// submission thread is blocked in a fence wait.
#[derive(Debug, Clone, Default)]
pub struct HeadlessGpu {
    shared: Arc<Shared>,
}

impl HeadlessGpu {
    /// Complete everything that can complete.
    pub fn retire_all(&self) {
        self.shared.state.lock().retire_all();
        self.shared.progress.notify_all();
    }

    /// Current completed value of `fence`.
    pub fn completed_value(&self, fence: FenceHandle) -> u64 {
        self.shared.state.lock().completed(fence.0)
    }

    /// Signals and waits queued on the simulated GPU.
    pub fn pending_ops(&self) -> usize {
        self.shared.state.lock().pending_ops()
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<BackendEvent> {
        self.shared.state.lock().events.clone()
    }

    /// Drop all logged events.
    pub fn clear_events(&self) {
        self.shared.state.lock().events.clear();
    }

    /// Native objects currently alive.
    pub fn live_objects(&self) -> usize {
        self.shared.state.lock().live_objects
    }

    /// Make the next `execute` fail as if the device were removed.
    pub fn fail_next_submit(&self) {
        self.shared.state.lock().fail_next_submit = true;
    }

    /// Make the next `read_timestamp` fail.
    pub fn fail_next_timestamp_read(&self) {
        self.shared.state.lock().fail_next_timestamp_read = true;
    }

    /// Hand out `extra` more back buffers than requested from now on, as a
    /// driver may when it raises the minimum image count.
    pub fn set_extra_back_buffers(&self, extra: u32) {
        self.shared.state.lock().extra_back_buffers = extra;
    }

    /// Make presents report an outdated surface.
    pub fn set_surface_outdated(&self, outdated: bool) {
        self.shared.state.lock().surface_outdated = outdated;
    }
}

#[derive(Debug, Clone)]
enum Recorded {
    Copy {
        src: u64,
        src_offset: u64,
        dst: u64,
        size: u64,
    },
    Readback {
        src: u64,
        dst: u64,
        dst_offset: u64,
        size: u64,
    },
    Transition {
        resource: u64,
        before: ResourceState,
        after: ResourceState,
    },
    Timestamp {
        heap: u64,
        slot: u32,
    },
    Resolve {
        heap: u64,
        slots: Range<u32>,
    },
}

#[derive(Debug)]
struct HeadlessList {
    queue: u64,
    recording: bool,
    commands: Vec<Recorded>,
    in_flight: Option<(u64, u64)>,
}

#[derive(Debug)]
struct HeadlessHeap {
    memory: Vec<u8>,
}

#[derive(Debug)]
struct HeadlessResource {
    desc: ResourceDesc,
    state: ResourceState,
    contents: Vec<u8>,
}

#[derive(Debug)]
struct HeadlessQueryHeap {
    written: Vec<Option<u64>>,
    resolved: Vec<Option<u64>>,
}

#[derive(Debug)]
struct HeadlessSwapchain {
    desc: SwapchainDesc,
    back_buffers: Vec<ResourceHandle>,
    current: usize,
}

/// Headless GPU backend.
#[derive(Debug)]
pub struct HeadlessBackend {
    config: HeadlessConfig,
    gpu: HeadlessGpu,
    next_id: u64,
    clock: u64,
    queues: HashMap<u64, QueueKind>,
    lists: HashMap<u64, HeadlessList>,
    unsignaled: HashMap<u64, Vec<u64>>,
    heaps: HashMap<u64, HeadlessHeap>,
    descriptor_heaps: HashMap<u64, Vec<Option<ResourceHandle>>>,
    query_heaps: HashMap<u64, HeadlessQueryHeap>,
    resources: HashMap<u64, HeadlessResource>,
    swapchain: Option<HeadlessSwapchain>,
}

impl HeadlessBackend {
    /// Timestamp ticks per second reported to callers.
    pub const TIMESTAMP_FREQUENCY: u64 = 1_000_000_000;

    /// Simulated nanoseconds between two recorded timestamps.
    const TICKS_PER_TIMESTAMP: u64 = 1_000;

    /// Create a new headless backend.
    pub fn new(config: HeadlessConfig) -> Self {
        Self {
            config,
            gpu: HeadlessGpu::default(),
            next_id: 1,
            clock: 0,
            queues: HashMap::new(),
            lists: HashMap::new(),
            unsignaled: HashMap::new(),
            heaps: HashMap::new(),
            descriptor_heaps: HashMap::new(),
            query_heaps: HashMap::new(),
            resources: HashMap::new(),
            swapchain: None,
        }
    }

    /// Handle for observing and driving the simulated GPU.
    pub fn gpu(&self) -> HeadlessGpu {
        self.gpu.clone()
    }

    /// Bytes currently stored in `resource`.
    pub fn resource_contents(&self, resource: ResourceHandle) -> Option<&[u8]> {
        self.resources.get(&resource.0).map(|r| r.contents.as_slice())
    }

    /// Current state of `resource`.
    pub fn resource_state(&self, resource: ResourceHandle) -> Option<ResourceState> {
        self.resources.get(&resource.0).map(|r| r.state)
    }

    /// Number of live resources (back buffers included).
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Resource a render-target slot points at.
    pub fn render_target_view(
        &self,
        heap: DescriptorHeapHandle,
        index: u32,
    ) -> Option<ResourceHandle> {
        self.descriptor_heaps
            .get(&heap.0)
            .and_then(|views| views.get(index as usize).copied().flatten())
    }

    fn allocate_id(&mut self, what: &'static str) -> BackendResult<u64> {
        if self.config.fail_creation_of == Some(what) {
            return Err(BackendError::creation(what, "injected failure"));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.gpu.shared.state.lock().live_objects += 1;
        Ok(id)
    }

    fn record(&self, event: BackendEvent) {
        self.gpu.shared.state.lock().events.push(event);
    }

    fn recording_list(&mut self, list: CommandListHandle) -> BackendResult<&mut HeadlessList> {
        let entry = self
            .lists
            .get_mut(&list.0)
            .ok_or(BackendError::InvalidHandle("command list"))?;
        if !entry.recording {
            return Err(BackendError::RecordFailed(format!(
                "command list {} is not recording",
                list.0
            )));
        }
        Ok(entry)
    }

    fn run_commands(&mut self, commands: &[Recorded]) -> BackendResult<()> {
        for command in commands {
            match command {
                Recorded::Copy {
                    src,
                    src_offset,
                    dst,
                    size,
                } => {
                    let heap = self
                        .heaps
                        .get(src)
                        .ok_or(BackendError::InvalidHandle("heap"))?;
                    let start = *src_offset as usize;
                    let end = start + *size as usize;
                    let bytes = heap.memory.get(start..end).ok_or_else(|| {
                        BackendError::SubmitFailed(format!("copy source {start}..{end} out of range"))
                    })?;
                    let resource = self
                        .resources
                        .get_mut(dst)
                        .ok_or(BackendError::InvalidHandle("resource"))?;
                    if resource.state != ResourceState::CopyDest {
                        return Err(BackendError::SubmitFailed(format!(
                            "copy into resource in state {:?}",
                            resource.state
                        )));
                    }
                    let len = bytes.len().min(resource.contents.len());
                    resource.contents[..len].copy_from_slice(&bytes[..len]);
                }
                Recorded::Readback {
                    src,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let resource = self
                        .resources
                        .get(src)
                        .ok_or(BackendError::InvalidHandle("resource"))?;
                    if resource.state != ResourceState::CopySource {
                        return Err(BackendError::SubmitFailed(format!(
                            "readback from resource in state {:?}",
                            resource.state
                        )));
                    }
                    let len = (*size as usize).min(resource.contents.len());
                    let heap = self
                        .heaps
                        .get_mut(dst)
                        .ok_or(BackendError::InvalidHandle("heap"))?;
                    let start = *dst_offset as usize;
                    let target = heap.memory.get_mut(start..start + len).ok_or_else(|| {
                        BackendError::SubmitFailed(format!("readback target {start}+{len} out of range"))
                    })?;
                    target.copy_from_slice(&resource.contents[..len]);
                }
                Recorded::Transition {
                    resource,
                    before,
                    after,
                } => {
                    let resource = self
                        .resources
                        .get_mut(resource)
                        .ok_or(BackendError::InvalidHandle("resource"))?;
                    if resource.state != *before {
                        return Err(BackendError::SubmitFailed(format!(
                            "transition from {:?} but resource is in {:?}",
                            before, resource.state
                        )));
                    }
                    resource.state = *after;
                }
                Recorded::Timestamp { heap, slot } => {
                    self.clock += Self::TICKS_PER_TIMESTAMP;
                    let tick = self.clock;
                    let heap = self
                        .query_heaps
                        .get_mut(heap)
                        .ok_or(BackendError::InvalidHandle("query heap"))?;
                    heap.written[*slot as usize] = Some(tick);
                }
                Recorded::Resolve { heap, slots } => {
                    let heap = self
                        .query_heaps
                        .get_mut(heap)
                        .ok_or(BackendError::InvalidHandle("query heap"))?;
                    for slot in slots.clone() {
                        heap.resolved[slot as usize] = heap.written[slot as usize];
                    }
                }
            }
        }
        Ok(())
    }

    fn push_op(&mut self, queue: QueueHandle, op: GpuOp) {
        let mut state = self.gpu.shared.state.lock();
        state.queues.entry(queue.0).or_default().push_back(op);
        if self.config.completion == Completion::Immediate {
            state.retire_all();
        }
        drop(state);
        self.gpu.shared.progress.notify_all();
    }

    fn make_back_buffers(&mut self, desc: &SwapchainDesc) -> BackendResult<Vec<ResourceHandle>> {
        let buffer_desc = ResourceDesc::texture_2d(desc.extent.width, desc.extent.height, desc.format)
            .with_label("back buffer")
            .with_usage(ResourceUsage::RENDER_TARGET);
        let count = desc.buffer_count + self.gpu.shared.state.lock().extra_back_buffers;
        (0..count)
            .map(|_| self.create_resource(&buffer_desc, ResourceState::Present, None))
            .collect()
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "Headless"
    }

    fn create_queue(&mut self, kind: QueueKind) -> BackendResult<QueueHandle> {
        let id = self.allocate_id("queue")?;
        self.queues.insert(id, kind);
        log::trace!("HeadlessBackend: created {} queue {}", kind.label(), id);
        Ok(QueueHandle(id))
    }

    fn create_command_list(&mut self, queue: QueueHandle) -> BackendResult<CommandListHandle> {
        if !self.queues.contains_key(&queue.0) {
            return Err(BackendError::InvalidHandle("queue"));
        }
        let id = self.allocate_id("command list")?;
        self.lists.insert(
            id,
            HeadlessList {
                queue: queue.0,
                recording: false,
                commands: Vec::new(),
                in_flight: None,
            },
        );
        Ok(CommandListHandle(id))
    }

    fn create_fence(&mut self, label: &str) -> BackendResult<FenceHandle> {
        let id = self.allocate_id("fence")?;
        self.gpu.shared.state.lock().fences.insert(id, 0);
        log::trace!("HeadlessBackend: created fence {} ({})", id, label);
        Ok(FenceHandle(id))
    }

    fn reset_command_list(&mut self, list: CommandListHandle) -> BackendResult<()> {
        let entry = self
            .lists
            .get_mut(&list.0)
            .ok_or(BackendError::InvalidHandle("command list"))?;
        if let Some((fence, value)) = entry.in_flight {
            if self.gpu.shared.state.lock().completed(fence) < value {
                return Err(BackendError::RecordFailed(format!(
                    "command list {} reset while the GPU still uses it",
                    list.0
                )));
            }
        }
        entry.in_flight = None;
        entry.recording = true;
        entry.commands.clear();
        self.record(BackendEvent::Reset(list));
        Ok(())
    }

    fn close_command_list(&mut self, list: CommandListHandle) -> BackendResult<()> {
        self.recording_list(list)?.recording = false;
        self.record(BackendEvent::Close(list));
        Ok(())
    }

    fn execute(&mut self, queue: QueueHandle, list: CommandListHandle) -> BackendResult<()> {
        {
            let mut state = self.gpu.shared.state.lock();
            if std::mem::take(&mut state.fail_next_submit) {
                return Err(BackendError::SubmitFailed("device removed".into()));
            }
        }
        let entry = self
            .lists
            .get(&list.0)
            .ok_or(BackendError::InvalidHandle("command list"))?;
        if entry.recording {
            return Err(BackendError::SubmitFailed(format!(
                "command list {} executed while still recording",
                list.0
            )));
        }
        if entry.queue != queue.0 {
            return Err(BackendError::SubmitFailed(format!(
                "command list {} executed on a foreign queue",
                list.0
            )));
        }
        let commands = entry.commands.clone();
        self.run_commands(&commands)?;
        self.unsignaled.entry(queue.0).or_default().push(list.0);
        self.record(BackendEvent::Execute { queue, list });
        Ok(())
    }

    fn signal(&mut self, queue: QueueHandle, fence: FenceHandle, value: u64) -> BackendResult<()> {
        if let Some(executed) = self.unsignaled.remove(&queue.0) {
            for id in executed {
                if let Some(entry) = self.lists.get_mut(&id) {
                    entry.in_flight = Some((fence.0, value));
                }
            }
        }
        self.record(BackendEvent::Signal {
            queue,
            fence,
            value,
        });
        self.push_op(
            queue,
            GpuOp::Signal {
                fence: fence.0,
                value,
            },
        );
        Ok(())
    }

    fn queue_wait(
        &mut self,
        queue: QueueHandle,
        fence: FenceHandle,
        value: u64,
    ) -> BackendResult<()> {
        self.record(BackendEvent::QueueWait {
            queue,
            fence,
            value,
        });
        self.push_op(
            queue,
            GpuOp::Wait {
                fence: fence.0,
                value,
            },
        );
        Ok(())
    }

    fn completed_value(&self, fence: FenceHandle) -> BackendResult<u64> {
        let state = self.gpu.shared.state.lock();
        state
            .fences
            .get(&fence.0)
            .copied()
            .ok_or(BackendError::InvalidHandle("fence"))
    }

    fn wait_fence(
        &mut self,
        fence: FenceHandle,
        value: u64,
        timeout: Option<Duration>,
    ) -> BackendResult<bool> {
        self.record(BackendEvent::CpuWait { fence, value });
        let shared = &self.gpu.shared;
        let mut state = shared.state.lock();
        if self.config.completion != Completion::Manual && state.retire_until(fence.0, value) {
            shared.progress.notify_all();
            return Ok(true);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        while state.completed(fence.0) < value {
            match deadline {
                Some(deadline) => {
                    if shared.progress.wait_until(&mut state, deadline).timed_out() {
                        return Ok(state.completed(fence.0) >= value);
                    }
                }
                None => shared.progress.wait(&mut state),
            }
        }
        Ok(true)
    }

    fn create_heap(&mut self, kind: MemoryKind, size: u64, label: &str) -> BackendResult<HeapInfo> {
        let id = self.allocate_id("heap")?;
        self.heaps.insert(
            id,
            HeadlessHeap {
                memory: vec![0; size as usize],
            },
        );
        log::trace!("HeadlessBackend: created {:?} heap {} ({}, {} bytes)", kind, id, label, size);
        Ok(HeapInfo {
            handle: HeapHandle(id),
            gpu_address: id << 32,
            size,
        })
    }

    fn heap_memory(&self, heap: HeapHandle) -> BackendResult<&[u8]> {
        self.heaps
            .get(&heap.0)
            .map(|h| h.memory.as_slice())
            .ok_or(BackendError::InvalidHandle("heap"))
    }

    fn heap_memory_mut(&mut self, heap: HeapHandle) -> BackendResult<&mut [u8]> {
        self.heaps
            .get_mut(&heap.0)
            .map(|h| h.memory.as_mut_slice())
            .ok_or(BackendError::InvalidHandle("heap"))
    }

    fn create_descriptor_heap(
        &mut self,
        kind: DescriptorHeapKind,
        count: u32,
    ) -> BackendResult<DescriptorHeapInfo> {
        let id = self.allocate_id("descriptor heap")?;
        self.descriptor_heaps.insert(id, vec![None; count as usize]);
        let gpu_base = match kind {
            DescriptorHeapKind::ShaderResource => id << 40,
            DescriptorHeapKind::RenderTarget => 0,
        };
        Ok(DescriptorHeapInfo {
            handle: DescriptorHeapHandle(id),
            cpu_base: id << 48,
            gpu_base,
            increment: 32,
            count,
        })
    }

    fn write_render_target_view(
        &mut self,
        heap: DescriptorHeapHandle,
        index: u32,
        resource: ResourceHandle,
    ) -> BackendResult<()> {
        if !self.resources.contains_key(&resource.0) {
            return Err(BackendError::InvalidHandle("resource"));
        }
        let slot = self
            .descriptor_heaps
            .get_mut(&heap.0)
            .ok_or(BackendError::InvalidHandle("descriptor heap"))?
            .get_mut(index as usize)
            .ok_or_else(|| BackendError::RecordFailed(format!("descriptor index {index} out of range")))?;
        *slot = Some(resource);
        Ok(())
    }

    fn create_query_heap(&mut self, count: u32) -> BackendResult<QueryHeapHandle> {
        let id = self.allocate_id("query heap")?;
        self.query_heaps.insert(
            id,
            HeadlessQueryHeap {
                written: vec![None; count as usize],
                resolved: vec![None; count as usize],
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
        let count = self
            .query_heaps
            .get(&heap.0)
            .ok_or(BackendError::InvalidHandle("query heap"))?
            .written
            .len();
        if slot as usize >= count {
            return Err(BackendError::RecordFailed(format!("query slot {slot} out of range")));
        }
        self.recording_list(list)?
            .commands
            .push(Recorded::Timestamp { heap: heap.0, slot });
        self.record(BackendEvent::Timestamp { list, slot });
        Ok(())
    }

    fn resolve_timestamps(
        &mut self,
        list: CommandListHandle,
        heap: QueryHeapHandle,
        slots: Range<u32>,
    ) -> BackendResult<()> {
        self.recording_list(list)?.commands.push(Recorded::Resolve {
            heap: heap.0,
            slots,
        });
        Ok(())
    }

    fn read_timestamp(&self, heap: QueryHeapHandle, slot: u32) -> BackendResult<u64> {
        if std::mem::take(&mut self.gpu.shared.state.lock().fail_next_timestamp_read) {
            return Err(BackendError::WaitFailed(format!("query slot {slot} could not be read")));
        }
        self.query_heaps
            .get(&heap.0)
            .ok_or(BackendError::InvalidHandle("query heap"))?
            .resolved
            .get(slot as usize)
            .copied()
            .flatten()
            .ok_or_else(|| BackendError::WaitFailed(format!("query slot {slot} was never resolved")))
    }

    fn timestamp_frequency(&self, queue: QueueHandle) -> BackendResult<u64> {
        if !self.queues.contains_key(&queue.0) {
            return Err(BackendError::InvalidHandle("queue"));
        }
        Ok(Self::TIMESTAMP_FREQUENCY)
    }

    fn create_resource(
        &mut self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        _clear_value: Option<ClearValue>,
    ) -> BackendResult<ResourceHandle> {
        let id = self.allocate_id("resource")?;
        self.resources.insert(
            id,
            HeadlessResource {
                desc: desc.clone(),
                state: initial_state,
                contents: vec![0; desc.byte_size() as usize],
            },
        );
        log::trace!(
            "HeadlessBackend: created resource {} {:?} ({} bytes)",
            id,
            desc.label,
            desc.byte_size()
        );
        Ok(ResourceHandle(id))
    }

    fn release_resource(&mut self, resource: ResourceHandle) -> BackendResult<()> {
        let removed = self
            .resources
            .remove(&resource.0)
            .ok_or(BackendError::InvalidHandle("resource"))?;
        log::trace!("HeadlessBackend: released resource {} {:?}", resource.0, removed.desc.label);
        let mut state = self.gpu.shared.state.lock();
        state.live_objects -= 1;
        state.events.push(BackendEvent::Release(resource));
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
        if !self.heaps.contains_key(&src.0) {
            return Err(BackendError::InvalidHandle("heap"));
        }
        self.recording_list(list)?.commands.push(Recorded::Copy {
            src: src.0,
            src_offset,
            dst: dst.0,
            size,
        });
        self.record(BackendEvent::Copy { list, dst, size });
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
        if !self.heaps.contains_key(&dst.0) {
            return Err(BackendError::InvalidHandle("heap"));
        }
        self.recording_list(list)?.commands.push(Recorded::Readback {
            src: src.0,
            dst: dst.0,
            dst_offset,
            size,
        });
        self.record(BackendEvent::Readback { list, src, size });
        Ok(())
    }

    fn transition(
        &mut self,
        list: CommandListHandle,
        resource: ResourceHandle,
        before: ResourceState,
        after: ResourceState,
    ) -> BackendResult<()> {
        self.recording_list(list)?.commands.push(Recorded::Transition {
            resource: resource.0,
            before,
            after,
        });
        self.record(BackendEvent::Transition {
            list,
            resource,
            after,
        });
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
        self.allocate_id("swap chain")?;
        let back_buffers = self.make_back_buffers(desc)?;
        self.swapchain = Some(HeadlessSwapchain {
            desc: *desc,
            back_buffers: back_buffers.clone(),
            current: 0,
        });
        log::debug!(
            "HeadlessBackend: created swap chain {}x{} with {} buffers",
            desc.extent.width,
            desc.extent.height,
            desc.buffer_count
        );
        Ok(back_buffers)
    }

    fn resize_swapchain(&mut self, extent: Extent2d) -> BackendResult<Vec<ResourceHandle>> {
        let (mut desc, old) = match self.swapchain.as_mut() {
            Some(swapchain) => (swapchain.desc, std::mem::take(&mut swapchain.back_buffers)),
            None => return Err(BackendError::InvalidHandle("swap chain")),
        };
        for buffer in old {
            self.release_resource(buffer)?;
        }
        desc.extent = extent;
        let back_buffers = self.make_back_buffers(&desc)?;
        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.desc = desc;
            swapchain.back_buffers = back_buffers.clone();
            swapchain.current = 0;
        }
        Ok(back_buffers)
    }

    fn acquire_back_buffer(&mut self) -> BackendResult<usize> {
        self.swapchain
            .as_ref()
            .map(|s| s.current)
            .ok_or(BackendError::InvalidHandle("swap chain"))
    }

    fn present(&mut self, queue: QueueHandle, sync_interval: u32) -> BackendResult<PresentStatus> {
        let swapchain = self
            .swapchain
            .as_mut()
            .ok_or(BackendError::InvalidHandle("swap chain"))?;
        swapchain.current = (swapchain.current + 1) % swapchain.back_buffers.len().max(1);
        let outdated = {
            let mut state = self.gpu.shared.state.lock();
            state.events.push(BackendEvent::Present {
                queue,
                sync_interval,
            });
            state.surface_outdated
        };
        Ok(if outdated {
            PresentStatus::Outdated
        } else {
            PresentStatus::Presented
        })
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        let remaining = self.queues.len()
            + self.lists.len()
            + self.heaps.len()
            + self.descriptor_heaps.len()
            + self.query_heaps.len()
            + self.resources.len()
            + usize::from(self.swapchain.is_some())
            + self.gpu.shared.state.lock().fences.len();
        let mut state = self.gpu.shared.state.lock();
        state.live_objects = state.live_objects.saturating_sub(remaining);
        state.fences.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deferred() -> HeadlessBackend {
        HeadlessBackend::new(HeadlessConfig::default().with_completion(Completion::Deferred))
    }

    #[test]
    fn test_immediate_signal_completes() {
        let mut backend = HeadlessBackend::default();
        let queue = backend.create_queue(QueueKind::Present).unwrap();
        let fence = backend.create_fence("test").unwrap();

        backend.signal(queue, fence, 3).unwrap();
        assert_eq!(backend.completed_value(fence).unwrap(), 3);
    }

    #[test]
    fn test_deferred_signal_completes_on_wait() {
        let mut backend = deferred();
        let queue = backend.create_queue(QueueKind::Present).unwrap();
        let fence = backend.create_fence("test").unwrap();

        backend.signal(queue, fence, 1).unwrap();
        backend.signal(queue, fence, 2).unwrap();
        assert_eq!(backend.completed_value(fence).unwrap(), 0);

        assert!(backend.wait_fence(fence, 1, None).unwrap());
        assert_eq!(backend.completed_value(fence).unwrap(), 1);
        assert_eq!(backend.gpu().pending_ops(), 1);
    }

    #[test]
    fn test_queue_wait_orders_across_queues() {
        let mut backend = HeadlessBackend::new(
            HeadlessConfig::default().with_completion(Completion::Manual),
        );
        let upload = backend.create_queue(QueueKind::Upload).unwrap();
        let present = backend.create_queue(QueueKind::Present).unwrap();
        let upload_fence = backend.create_fence("upload").unwrap();
        let present_fence = backend.create_fence("present").unwrap();

        // The present queue is first in retire order but must wait for upload.
        backend.queue_wait(present, upload_fence, 1).unwrap();
        backend.signal(present, present_fence, 1).unwrap();
        backend.signal(upload, upload_fence, 1).unwrap();

        backend.gpu().retire_all();
        assert_eq!(backend.completed_value(upload_fence).unwrap(), 1);
        assert_eq!(backend.completed_value(present_fence).unwrap(), 1);
    }

    #[test]
    fn test_manual_wait_times_out() {
        let mut backend = HeadlessBackend::new(
            HeadlessConfig::default().with_completion(Completion::Manual),
        );
        let queue = backend.create_queue(QueueKind::Present).unwrap();
        let fence = backend.create_fence("test").unwrap();
        backend.signal(queue, fence, 1).unwrap();

        let reached = backend
            .wait_fence(fence, 1, Some(Duration::from_millis(5)))
            .unwrap();
        assert!(!reached);
    }

    #[test]
    fn test_reset_while_in_flight_is_rejected() {
        let mut backend = deferred();
        let queue = backend.create_queue(QueueKind::Present).unwrap();
        let fence = backend.create_fence("test").unwrap();
        let list = backend.create_command_list(queue).unwrap();

        backend.reset_command_list(list).unwrap();
        backend.close_command_list(list).unwrap();
        backend.execute(queue, list).unwrap();
        backend.signal(queue, fence, 1).unwrap();

        assert!(backend.reset_command_list(list).is_err());
        backend.wait_fence(fence, 1, None).unwrap();
        assert!(backend.reset_command_list(list).is_ok());
    }

    #[test]
    fn test_copy_executes_into_resource() {
        let mut backend = HeadlessBackend::default();
        let queue = backend.create_queue(QueueKind::Upload).unwrap();
        let list = backend.create_command_list(queue).unwrap();
        let heap = backend.create_heap(MemoryKind::Upload, 64, "upload").unwrap();
        let resource = backend
            .create_resource(&ResourceDesc::buffer(4), ResourceState::CopyDest, None)
            .unwrap();

        backend.heap_memory_mut(heap.handle).unwrap()[8..12].copy_from_slice(&[1, 2, 3, 4]);
        backend.reset_command_list(list).unwrap();
        backend.copy_to_resource(list, heap.handle, 8, resource, 4).unwrap();
        backend.close_command_list(list).unwrap();
        backend.execute(queue, list).unwrap();

        assert_eq!(backend.resource_contents(resource), Some(&[1, 2, 3, 4][..]));
    }

    #[test]
    fn test_transition_from_wrong_state_fails() {
        let mut backend = HeadlessBackend::default();
        let queue = backend.create_queue(QueueKind::Present).unwrap();
        let list = backend.create_command_list(queue).unwrap();
        let resource = backend
            .create_resource(&ResourceDesc::buffer(4), ResourceState::Common, None)
            .unwrap();

        backend.reset_command_list(list).unwrap();
        backend
            .transition(list, resource, ResourceState::CopyDest, ResourceState::ShaderResource)
            .unwrap();
        backend.close_command_list(list).unwrap();
        assert!(backend.execute(queue, list).is_err());
    }

    #[test]
    fn test_injected_creation_failure() {
        let mut backend =
            HeadlessBackend::new(HeadlessConfig::default().failing_creation_of("fence"));
        assert!(backend.create_queue(QueueKind::Present).is_ok());
        assert!(matches!(
            backend.create_fence("x"),
            Err(BackendError::CreationFailed { what: "fence", .. })
        ));
    }

    #[test]
    fn test_drop_releases_everything() {
        let gpu = {
            let mut backend = HeadlessBackend::default();
            backend.create_queue(QueueKind::Present).unwrap();
            backend.create_fence("x").unwrap();
            backend.create_heap(MemoryKind::Readback, 16, "rb").unwrap();
            let gpu = backend.gpu();
            assert_eq!(gpu.live_objects(), 3);
            gpu
        };
        assert_eq!(gpu.live_objects(), 0);
    }
}
