//! Fence-tracked ring allocator.
//!
//! A [`RingAllocator`] hands out contiguous windows of a fixed-capacity linear
//! resource (bytes of a mapped heap, slots of a descriptor heap, slots of a
//! query heap). Windows are never handed out again until the GPU has finished
//! with them: every submission stamps the current high-water mark with its
//! fence value ([`RingAllocator::add_pending_fence`]), and space is reclaimed
//! only when that fence is reported complete
//! ([`RingAllocator::flash_fence_value`]).
//!
//! Positions are tracked as ever-increasing virtual offsets; the physical
//! offset is the virtual one modulo the capacity. The live window is
//! `[start, end)` in virtual space and its length never exceeds the capacity,
//! which is what guarantees that a new window cannot overlap one the GPU may
//! still be reading.
//!
//! # Example
//!
//! ```
//! use graphics_device::{AllocError, FenceValue, RingAllocator};
//!
//! let mut ring = RingAllocator::new(1024).unwrap();
//! let first = ring.allocate(600, 1).unwrap();
//! assert_eq!(first.offset, 0);
//! assert_eq!(ring.allocate(500, 1), Err(AllocError::NoRoom));
//!
//! let fence = FenceValue::FIRST;
//! ring.add_pending_fence(fence);
//! ring.flash_fence_value(fence);
//! assert_eq!(ring.allocate(500, 1).unwrap().offset, 0);
//! ```

use std::collections::VecDeque;
use std::ops::Range;

use crate::error::{AllocError, DeviceError, DeviceResult};
use crate::fence::FenceValue;

/// A window handed out by a [`RingAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingAllocation {
    /// Physical offset into the backing resource.
    pub offset: u64,
    /// Size of the window in allocator units.
    pub size: u64,
}

impl RingAllocation {
    /// Create a new ring allocation.
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Get the end offset (offset + size).
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingFence {
    fence: FenceValue,
    end: u64,
}

/// Circular allocator that reclaims space only after fences complete.
///
/// # Thread Safety
///
/// `RingAllocator` is NOT thread-safe. The device mutates it only from the
/// submission thread.
#[derive(Debug)]
pub struct RingAllocator {
    capacity: u64,
    start: u64,
    end: u64,
    pending: VecDeque<PendingFence>,
}

impl RingAllocator {
    /// Create an empty allocator over `capacity` units.
    ///
    /// # Errors
    ///
    /// A zero capacity is rejected.
    pub fn new(capacity: u64) -> DeviceResult<Self> {
        if capacity == 0 {
            return Err(DeviceError::InvalidParameter(
                "ring allocator capacity cannot be zero".to_string(),
            ));
        }

        Ok(Self {
            capacity,
            start: 0,
            end: 0,
            pending: VecDeque::new(),
        })
    }

    /// Get the total capacity.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Physical offset where the live window begins.
    pub fn start(&self) -> u64 {
        self.start % self.capacity
    }

    /// Physical offset where the next allocation would be placed before alignment.
    pub fn end(&self) -> u64 {
        self.end % self.capacity
    }

    /// Units handed out (including wrap padding) and not yet reclaimed.
    pub fn live(&self) -> u64 {
        self.end - self.start
    }

    /// Whether nothing is live.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Number of submissions still holding space.
    pub fn pending_fences(&self) -> usize {
        self.pending.len()
    }

    /// Map a virtual position to its physical offset.
    pub fn physical(&self, position: u64) -> u64 {
        position % self.capacity
    }

    /// Allocate `size` units aligned to `alignment` (a power of two).
    ///
    /// # Errors
    ///
    /// - [`AllocError::AllocTooLarge`] when `size` exceeds the capacity. State
    ///   is left untouched.
    /// - [`AllocError::NoRoom`] when the request cannot be placed without
    ///   overlapping the live window. Flashing a completed fence frees space.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<RingAllocation, AllocError> {
        let alignment = alignment.max(1);
        debug_assert!(alignment.is_power_of_two(), "alignment must be power of 2");

        if size > self.capacity {
            return Err(AllocError::AllocTooLarge);
        }

        if size == 0 {
            let offset = align_up(self.end(), alignment);
            let offset = if offset >= self.capacity { 0 } else { offset };
            return Ok(RingAllocation::new(offset, 0));
        }

        // Nothing live: restart at the physical beginning so a request of the
        // full capacity can always be served.
        if self.is_empty() {
            let phys = self.end();
            if phys != 0 {
                self.end += self.capacity - phys;
                self.start = self.end;
            }
        }

        let phys = self.end();
        let aligned = align_up(phys, alignment);
        let (offset, new_end) = if aligned + size <= self.capacity {
            (aligned, self.end + (aligned - phys) + size)
        } else {
            // Skip the tail; it is reclaimed together with this allocation.
            (0, self.end + (self.capacity - phys) + size)
        };

        if new_end - self.start > self.capacity {
            return Err(AllocError::NoRoom);
        }

        self.end = new_end;
        log::trace!(
            "RingAllocator: allocated {} at {} (live {}/{})",
            size,
            offset,
            self.live(),
            self.capacity
        );
        Ok(RingAllocation::new(offset, size))
    }

    /// Record that everything allocated so far is read by work that signals `fence`.
    ///
    /// Does nothing when nothing was allocated since the previous record.
    pub fn add_pending_fence(&mut self, fence: FenceValue) {
        let recorded = self.pending.back().map_or(self.start, |p| p.end);
        if self.end == recorded {
            return;
        }
        debug_assert!(
            self.pending.back().map_or(true, |p| p.fence <= fence),
            "fence values must not go backwards"
        );
        self.pending.push_back(PendingFence {
            fence,
            end: self.end,
        });
    }

    /// The virtual range [`flash_fence_value`](Self::flash_fence_value)
    /// would reclaim for `completed`, without reclaiming it.
    pub fn reclaimable(&self, completed: FenceValue) -> Option<Range<u64>> {
        let end = self
            .pending
            .iter()
            .take_while(|p| p.fence <= completed)
            .last()?
            .end;
        (end > self.start).then(|| self.start..end)
    }

    /// Reclaim every window whose fence is `<= completed`.
    ///
    /// Returns the reclaimed virtual range, if any. Calling again with the
    /// same or a smaller value reclaims nothing.
    pub fn flash_fence_value(&mut self, completed: FenceValue) -> Option<Range<u64>> {
        let before = self.start;
        while let Some(front) = self.pending.front() {
            if front.fence > completed {
                break;
            }
            self.start = front.end;
            self.pending.pop_front();
        }
        (self.start > before).then(|| before..self.start)
    }
}

/// Align a value up to the given alignment.
#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// [`align_up`] that reports overflow instead of wrapping.
#[inline]
pub(crate) fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}
