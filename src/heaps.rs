//! Device-owned transient heaps.
//!
//! Each heap couples a [`RingAllocator`] with the native object it carves up:
//!
//! - [`ByteRing`] - a persistently mapped upload/readback heap
//! - [`DescriptorRing`] - the dynamic tail of the shader-visible descriptor heap
//! - [`QueryRing`] - timestamp query slots with per-slot completion callbacks
//!
//! plus [`BumpAllocator`] for ranges that live as long as the device
//! (static descriptors and render-target views).

use std::ops::Range;

use crate::backend::{
    DescriptorHeapInfo, DescriptorRange, GpuBackend, HeapHandle, HeapInfo, MemoryKind,
    QueryHeapHandle,
};
use crate::error::{DeviceError, DeviceResult, HeapKind};
use crate::fence::FenceValue;
use crate::ring::RingAllocator;

/// A region of the dynamic heap, writable until the frame is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DynamicAllocation {
    /// Byte offset inside the mapped heap.
    pub offset: u64,
    pub size: u64,
    /// GPU virtual address of the first byte.
    pub gpu_address: u64,
}

/// A region of the readback heap the GPU copies into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadbackAllocation {
    /// Heap the GPU should copy into.
    pub heap: HeapHandle,
    pub offset: u64,
    pub size: u64,
    pub gpu_address: u64,
}

/// Called with the resolved GPU tick once the timestamp's frame completed.
pub type TimestampCallback = Box<dyn FnOnce(u64) + Send>;

/// Fence-recycled byte heap.
#[derive(Debug)]
pub(crate) struct ByteRing {
    kind: HeapKind,
    heap: HeapInfo,
    ring: RingAllocator,
}

impl ByteRing {
    pub fn new<B: GpuBackend>(
        backend: &mut B,
        memory: MemoryKind,
        kind: HeapKind,
        size: u64,
    ) -> DeviceResult<Self> {
        let ring = RingAllocator::new(size)?;
        let heap = backend.create_heap(memory, size, &kind.to_string())?;
        log::debug!("Created {} ({} bytes)", kind, size);
        Ok(Self { kind, heap, ring })
    }

    pub fn heap(&self) -> HeapHandle {
        self.heap.handle
    }

    pub fn allocate(&mut self, size: u64, alignment: u64) -> DeviceResult<Range<u64>> {
        let alloc = self
            .ring
            .allocate(size, alignment)
            .map_err(|reason| DeviceError::exhausted(self.kind, reason))?;
        Ok(alloc.offset..alloc.end())
    }

    pub fn allocate_dynamic(&mut self, size: u64, alignment: u64) -> DeviceResult<DynamicAllocation> {
        let range = self.allocate(size, alignment)?;
        Ok(DynamicAllocation {
            offset: range.start,
            size,
            gpu_address: self.heap.gpu_address + range.start,
        })
    }

    pub fn allocate_readback(&mut self, size: u64, alignment: u64) -> DeviceResult<ReadbackAllocation> {
        let range = self.allocate(size, alignment)?;
        Ok(ReadbackAllocation {
            heap: self.heap.handle,
            offset: range.start,
            size,
            gpu_address: self.heap.gpu_address + range.start,
        })
    }

    /// Check that `offset..offset + size` lies inside the heap.
    pub fn check_bounds(&self, offset: u64, size: u64) -> DeviceResult<Range<usize>> {
        match offset.checked_add(size) {
            Some(end) if end <= self.heap.size => Ok(offset as usize..end as usize),
            _ => Err(DeviceError::InvalidParameter(format!(
                "{}..{}+{} is outside the {}",
                offset, offset, size, self.kind
            ))),
        }
    }

    pub fn ring(&self) -> &RingAllocator {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut RingAllocator {
        &mut self.ring
    }
}

/// Per-frame descriptors carved out of the shader-visible heap after the
/// static range.
#[derive(Debug)]
pub(crate) struct DescriptorRing {
    heap: DescriptorHeapInfo,
    base: u32,
    ring: RingAllocator,
}

impl DescriptorRing {
    pub fn new(heap: DescriptorHeapInfo, base: u32, count: u32) -> DeviceResult<Self> {
        Ok(Self {
            heap,
            base,
            ring: RingAllocator::new(count as u64)?,
        })
    }

    pub fn allocate(&mut self, count: u32) -> DeviceResult<DescriptorRange> {
        let alloc = self
            .ring
            .allocate(count as u64, 1)
            .map_err(|reason| DeviceError::exhausted(HeapKind::DynamicDescriptors, reason))?;
        Ok(self.heap.range(self.base + alloc.offset as u32, count))
    }

    pub fn ring(&self) -> &RingAllocator {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut RingAllocator {
        &mut self.ring
    }
}

/// Timestamp query slots.
///
/// Every slot carries at most one callback. Callbacks fire exactly once, in
/// slot order, when the fence covering the slot is flashed.
pub(crate) struct QueryRing {
    heap: QueryHeapHandle,
    ring: RingAllocator,
    callbacks: Vec<Option<TimestampCallback>>,
    unresolved: Vec<u32>,
}

impl std::fmt::Debug for QueryRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRing")
            .field("heap", &self.heap)
            .field("ring", &self.ring)
            .field("waiting", &self.waiting())
            .finish()
    }
}

impl QueryRing {
    pub fn new<B: GpuBackend>(backend: &mut B, count: u32) -> DeviceResult<Self> {
        let ring = RingAllocator::new(count as u64)?;
        let heap = backend.create_query_heap(count)?;
        Ok(Self {
            heap,
            ring,
            callbacks: (0..count).map(|_| None).collect(),
            unresolved: Vec::new(),
        })
    }

    pub fn heap(&self) -> QueryHeapHandle {
        self.heap
    }

    /// Reserve a slot and attach `callback` to it.
    pub fn allocate(&mut self, callback: TimestampCallback) -> DeviceResult<u32> {
        let slot = self
            .ring
            .allocate(1, 1)
            .map_err(|reason| DeviceError::exhausted(HeapKind::Queries, reason))?
            .offset as u32;
        self.callbacks[slot as usize] = Some(callback);
        self.unresolved.push(slot);
        Ok(slot)
    }

    /// Contiguous runs of slots written since the last call.
    pub fn take_unresolved(&mut self) -> Vec<Range<u32>> {
        let mut runs: Vec<Range<u32>> = Vec::new();
        for slot in self.unresolved.drain(..) {
            match runs.last_mut() {
                Some(run) if run.end == slot => run.end += 1,
                _ => runs.push(slot..slot + 1),
            }
        }
        runs
    }

    /// Reclaim slots covered by `completed` and fire their callbacks.
    pub fn flash<B: GpuBackend>(&mut self, backend: &B, completed: FenceValue) -> DeviceResult<()> {
        let Some(reclaimable) = self.ring.reclaimable(completed) else {
            return Ok(());
        };
        // Every tick is read before any slot is reclaimed, so a failed read
        // leaves all of them for the next flash.
        let mut ticks = Vec::new();
        for position in reclaimable {
            let slot = self.ring.physical(position) as usize;
            // Wrap padding slots carry no callback.
            if self.callbacks[slot].is_some() {
                ticks.push((slot, backend.read_timestamp(self.heap, slot as u32)?));
            }
        }

        self.ring.flash_fence_value(completed);
        for (slot, tick) in ticks {
            if let Some(callback) = self.callbacks[slot].take() {
                callback(tick);
            }
        }
        Ok(())
    }

    /// Drop every callback without firing it.
    pub fn discard_callbacks(&mut self) -> usize {
        self.callbacks.iter_mut().filter_map(Option::take).count()
    }

    /// Callbacks still waiting for their frame.
    pub fn waiting(&self) -> usize {
        self.callbacks.iter().filter(|c| c.is_some()).count()
    }

    pub fn ring(&self) -> &RingAllocator {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut RingAllocator {
        &mut self.ring
    }
}

/// Bump allocator over a fixed number of slots. Never reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BumpAllocator {
    next: u32,
    capacity: u32,
}

impl BumpAllocator {
    pub fn new(first: u32, capacity: u32) -> Self {
        Self {
            next: first,
            capacity,
        }
    }

    /// First index of `count` fresh slots, or `None` when they do not fit.
    pub fn allocate(&mut self, count: u32) -> Option<u32> {
        let end = self.next.checked_add(count)?;
        if end > self.capacity {
            return None;
        }
        let first = self.next;
        self.next = end;
        Some(first)
    }

    pub fn remaining(&self) -> u32 {
        self.capacity - self.next
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::backend::{CommandListHandle, DescriptorHeapKind, HeadlessBackend, QueueKind};
    use crate::error::AllocError;

    fn fence(v: u64) -> FenceValue {
        FenceValue::new(v).unwrap()
    }

    #[test]
    fn test_bump_allocator() {
        let mut bump = BumpAllocator::new(2, 8);
        assert_eq!(bump.allocate(4), Some(2));
        assert_eq!(bump.allocate(3), None);
        assert_eq!(bump.allocate(2), Some(6));
        assert_eq!(bump.remaining(), 0);
        assert_eq!(bump.allocate(0), Some(8));
    }

    #[test]
    fn test_byte_ring_gpu_addresses() {
        let mut backend = HeadlessBackend::default();
        let mut ring =
            ByteRing::new(&mut backend, MemoryKind::Upload, HeapKind::Dynamic, 1024).unwrap();

        let a = ring.allocate_dynamic(10, 256).unwrap();
        let b = ring.allocate_dynamic(10, 256).unwrap();
        assert_eq!(b.offset, 256);
        assert_eq!(b.gpu_address - a.gpu_address, 256);
    }

    #[test]
    fn test_byte_ring_exhaustion_names_heap() {
        let mut backend = HeadlessBackend::default();
        let mut ring =
            ByteRing::new(&mut backend, MemoryKind::Readback, HeapKind::Readback, 64).unwrap();

        let err = ring.allocate_readback(65, 1).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::AllocationExhausted {
                heap: HeapKind::Readback,
                reason: AllocError::AllocTooLarge
            }
        ));
    }

    #[test]
    fn test_descriptor_ring_offsets_after_static_range() {
        let mut backend = HeadlessBackend::default();
        let heap = backend
            .create_descriptor_heap(DescriptorHeapKind::ShaderResource, 16)
            .unwrap();
        let mut ring = DescriptorRing::new(heap, 10, 6).unwrap();

        let range = ring.allocate(4).unwrap();
        assert_eq!(range.index, 10);
        assert_eq!(range, heap.range(10, 4));
        assert!(ring.allocate(3).unwrap_err().is_retryable());
    }

    #[test]
    fn test_query_callbacks_fire_once_in_slot_order() {
        let mut backend = HeadlessBackend::default();
        let queue = backend.create_queue(QueueKind::Present).unwrap();
        let list: CommandListHandle = backend.create_command_list(queue).unwrap();
        let mut queries = QueryRing::new(&mut backend, 8).unwrap();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let fired = Arc::new(AtomicU64::new(0));
        backend.reset_command_list(list).unwrap();
        for i in 0..3u32 {
            let order = order.clone();
            let fired = fired.clone();
            let slot = queries
                .allocate(Box::new(move |ticks| {
                    order.lock().push((i, ticks));
                    fired.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
            backend.write_timestamp(list, queries.heap(), slot).unwrap();
        }
        for run in queries.take_unresolved() {
            backend.resolve_timestamps(list, queries.heap(), run).unwrap();
        }
        backend.close_command_list(list).unwrap();
        backend.execute(queue, list).unwrap();
        queries.ring_mut().add_pending_fence(fence(1));

        queries.flash(&backend, fence(1)).unwrap();
        queries.flash(&backend, fence(1)).unwrap();

        let order = order.lock();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(order.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(order.windows(2).all(|w| w[0].1 < w[1].1));
    }

    #[test]
    fn test_failed_timestamp_read_keeps_every_callback() {
        let mut backend = HeadlessBackend::default();
        let gpu = backend.gpu();
        let queue = backend.create_queue(QueueKind::Present).unwrap();
        let list = backend.create_command_list(queue).unwrap();
        let mut queries = QueryRing::new(&mut backend, 4).unwrap();

        let fired = Arc::new(AtomicU64::new(0));
        backend.reset_command_list(list).unwrap();
        for _ in 0..3 {
            let fired = fired.clone();
            let slot = queries
                .allocate(Box::new(move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
            backend.write_timestamp(list, queries.heap(), slot).unwrap();
        }
        for run in queries.take_unresolved() {
            backend.resolve_timestamps(list, queries.heap(), run).unwrap();
        }
        backend.close_command_list(list).unwrap();
        backend.execute(queue, list).unwrap();
        queries.ring_mut().add_pending_fence(fence(1));

        gpu.fail_next_timestamp_read();
        assert!(queries.flash(&backend, fence(1)).is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(queries.waiting(), 3);
        assert_eq!(queries.ring().live(), 3);

        queries.flash(&backend, fence(1)).unwrap();
        queries.flash(&backend, fence(1)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(queries.waiting(), 0);
        assert!(queries.ring().is_empty());
    }

    #[test]
    fn test_unresolved_slots_merge_into_runs() {
        let mut backend = HeadlessBackend::default();
        let mut queries = QueryRing::new(&mut backend, 4).unwrap();

        for _ in 0..3 {
            queries.allocate(Box::new(|_| {})).unwrap();
        }
        assert_eq!(queries.take_unresolved(), vec![0..3]);
        assert!(queries.take_unresolved().is_empty());
        assert_eq!(queries.waiting(), 3);
        assert_eq!(queries.discard_callbacks(), 3);
    }
}
