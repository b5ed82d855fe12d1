//! Deferred release of GPU resources.
//!
//! A resource handed to [`Device::release_gpu_resource`](crate::Device::release_gpu_resource)
//! may still be referenced by submitted (or still recording) work. The release
//! is parked here together with the last fence value assigned on every queue,
//! and performed once all queues have passed those values.

use crate::backend::{GpuBackend, ResourceHandle};
use crate::error::DeviceResult;
use crate::fence::FenceValue;

/// One fence value per queue the device drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct QueueFences {
    pub render: Option<FenceValue>,
    pub upload: Option<FenceValue>,
    pub transition: Option<FenceValue>,
}

impl QueueFences {
    /// Whether `completed` has passed every value in `self`.
    fn reached_by(&self, completed: &QueueFences) -> bool {
        fn passed(needed: Option<FenceValue>, completed: Option<FenceValue>) -> bool {
            match needed {
                None => true,
                Some(needed) => completed.is_some_and(|c| c >= needed),
            }
        }
        passed(self.render, completed.render)
            && passed(self.upload, completed.upload)
            && passed(self.transition, completed.transition)
    }
}

/// Queue of resources waiting for the GPU to let go of them.
#[derive(Debug, Default)]
pub(crate) struct DeferredReleases {
    pending: Vec<(ResourceHandle, QueueFences)>,
}

impl DeferredReleases {
    pub fn queue(&mut self, resource: ResourceHandle, after: QueueFences) {
        self.pending.push((resource, after));
    }

    /// Release everything the GPU is done with. Returns how many were released.
    pub fn collect<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        completed: &QueueFences,
    ) -> DeviceResult<usize> {
        let mut released = 0;
        let mut index = 0;
        while index < self.pending.len() {
            if self.pending[index].1.reached_by(completed) {
                let (resource, _) = self.pending.swap_remove(index);
                backend.release_resource(resource)?;
                released += 1;
            } else {
                index += 1;
            }
        }
        if released > 0 {
            log::trace!("Released {} deferred resources", released);
        }
        Ok(released)
    }

    /// Release everything. The GPU must be idle.
    pub fn flush_all<B: GpuBackend>(&mut self, backend: &mut B) -> DeviceResult<usize> {
        let count = self.pending.len();
        for (resource, _) in self.pending.drain(..) {
            backend.release_resource(resource)?;
        }
        Ok(count)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
