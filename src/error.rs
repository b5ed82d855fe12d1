//! Device error types.

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;

/// Why a ring allocator could not serve a request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocError {
    /// The request fits the allocator but not the space that is free right now.
    ///
    /// Space comes back once an outstanding fence completes and is flashed
    /// into the allocator.
    #[error("no room left until in-flight work completes")]
    NoRoom,
    /// The request is larger than the whole allocator and can never succeed.
    #[error("allocation larger than the allocator capacity")]
    AllocTooLarge,
}

/// Identifies one of the device-owned transient allocators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Staging memory for initial resource data.
    Upload,
    /// Per-frame constant/vertex data.
    Dynamic,
    /// Per-frame GPU-to-CPU copies.
    Readback,
    /// Per-frame shader-visible descriptors.
    DynamicDescriptors,
    /// Timestamp query slots.
    Queries,
}

impl std::fmt::Display for HeapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Upload => "upload heap",
            Self::Dynamic => "dynamic heap",
            Self::Readback => "readback heap",
            Self::DynamicDescriptors => "dynamic descriptor heap",
            Self::Queries => "query heap",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the [`Device`](crate::Device) and its subsystems.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A device, swap chain, queue, heap or GPU resource could not be created.
    #[error("failed to create {what}: {reason}")]
    ResourceCreationFailed { what: &'static str, reason: String },
    /// A transient allocator is out of space. Retry after GPU work completes.
    #[error("{heap} exhausted: {reason}")]
    AllocationExhausted { heap: HeapKind, reason: AllocError },
    /// The process-lifetime descriptor range is used up.
    #[error("static descriptors exhausted: requested {requested}, {remaining} of {capacity} left")]
    StaticDescriptorsExhausted {
        requested: u32,
        remaining: u32,
        capacity: u32,
    },
    /// The render-target view heap is used up.
    #[error("render target views exhausted: requested {requested}, {remaining} of {capacity} left")]
    RenderTargetViewsExhausted {
        requested: u32,
        remaining: u32,
        capacity: u32,
    },
    /// A fence wait or submission failed at the native level.
    #[error("GPU device lost: {0}")]
    DeviceLost(String),
    /// A fence did not reach its value within the configured timeout.
    #[error("fence value {value} not reached within {timeout:?}")]
    FenceTimeout { value: u64, timeout: Duration },
    /// An operation was called in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The device configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// An argument was out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// The presentation surface is gone or out of date; resize the swap chain.
    #[error("surface lost")]
    SurfaceLost,
}

impl DeviceError {
    /// `true` when retrying later (after GPU work completes) can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AllocationExhausted {
                reason: AllocError::NoRoom,
                ..
            }
        )
    }

    /// `true` for errors after which the device must be recreated.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost(_) | Self::FenceTimeout { .. })
    }

    pub(crate) fn exhausted(heap: HeapKind, reason: AllocError) -> Self {
        Self::AllocationExhausted { heap, reason }
    }
}

impl From<BackendError> for DeviceError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::CreationFailed { what, reason } => {
                Self::ResourceCreationFailed { what, reason }
            }
            BackendError::OutOfMemory => Self::ResourceCreationFailed {
                what: "memory",
                reason: "out of memory".into(),
            },
            BackendError::SurfaceLost => Self::SurfaceLost,
            BackendError::InvalidHandle(what) => {
                Self::InvalidParameter(format!("unknown {what} handle"))
            }
            other => Self::DeviceLost(other.to_string()),
        }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;
