//! Backend abstraction layer
//!
//! Provides the [`GpuBackend`] trait that the headless and Vulkan backends implement.

pub mod headless;
pub mod traits;
pub mod types;

// Vulkan backend is only available on native platforms
#[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
pub mod vulkan;

pub use headless::{BackendEvent, Completion, HeadlessBackend, HeadlessConfig, HeadlessGpu};
pub use traits::*;
pub use types::*;
