//! Common types shared between backends

/// Which hardware queue a [`CommandQueue`](crate::CommandQueue) drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics work that ends in a swap-chain present.
    Present,
    /// Copy work that fills newly created resources.
    Upload,
    /// Barrier-only work that moves uploaded resources into their final state.
    Transition,
}

impl QueueKind {
    pub fn label(&self) -> &'static str {
        match self {
            QueueKind::Present => "present",
            QueueKind::Upload => "upload",
            QueueKind::Transition => "transition",
        }
    }
}

/// CPU-visible memory flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// CPU writes, GPU reads.
    Upload,
    /// GPU writes, CPU reads.
    Readback,
}

/// Descriptor heap flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// Shader-visible buffer/texture views.
    ShaderResource,
    /// Render-target views.
    RenderTarget,
}

/// CPU-side descriptor address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptor(pub u64);

/// GPU-side descriptor address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptor(pub u64);

/// A contiguous run of descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub cpu: CpuDescriptor,
    pub gpu: GpuDescriptor,
    /// Index of the first descriptor inside its heap.
    pub index: u32,
    pub count: u32,
}

/// Where a descriptor heap lives and how its entries are spaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapInfo {
    pub handle: super::DescriptorHeapHandle,
    pub cpu_base: u64,
    pub gpu_base: u64,
    pub increment: u64,
    pub count: u32,
}

impl DescriptorHeapInfo {
    /// Addresses of `count` descriptors starting at `index`.
    pub fn range(&self, index: u32, count: u32) -> DescriptorRange {
        DescriptorRange {
            cpu: CpuDescriptor(self.cpu_base + index as u64 * self.increment),
            gpu: GpuDescriptor(self.gpu_base + index as u64 * self.increment),
            index,
            count,
        }
    }
}

/// A mapped heap and its GPU virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapInfo {
    pub handle: super::HeapHandle,
    pub gpu_address: u64,
    pub size: u64,
}

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
    R32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Depth32Float
            | TextureFormat::R32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

/// Resource usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceUsage(u32);

impl ResourceUsage {
    pub const NONE: Self = Self(0);
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const SHADER_RESOURCE: Self = Self(1 << 2);
    pub const UNORDERED_ACCESS: Self = Self(1 << 3);
    pub const RENDER_TARGET: Self = Self(1 << 4);
    pub const DEPTH_STENCIL: Self = Self(1 << 5);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for ResourceUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Shape of a GPU resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    Buffer { size: u64 },
    Texture2d {
        width: u32,
        height: u32,
        format: TextureFormat,
        mip_levels: u32,
    },
}

/// Description of a GPU resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDesc {
    pub label: Option<String>,
    pub dimension: ResourceDimension,
    pub usage: ResourceUsage,
}

impl ResourceDesc {
    pub fn buffer(size: u64) -> Self {
        Self {
            label: None,
            dimension: ResourceDimension::Buffer { size },
            usage: ResourceUsage::COPY_DST | ResourceUsage::SHADER_RESOURCE,
        }
    }

    pub fn texture_2d(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            label: None,
            dimension: ResourceDimension::Texture2d {
                width,
                height,
                format,
                mip_levels: 1,
            },
            usage: ResourceUsage::COPY_DST | ResourceUsage::SHADER_RESOURCE,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Bytes of tightly packed initial data the resource expects.
    pub fn byte_size(&self) -> u64 {
        match self.dimension {
            ResourceDimension::Buffer { size } => size,
            ResourceDimension::Texture2d {
                width,
                height,
                format,
                ..
            } => width as u64 * height as u64 * format.bytes_per_pixel() as u64,
        }
    }

    pub fn is_texture(&self) -> bool {
        matches!(self.dimension, ResourceDimension::Texture2d { .. })
    }
}

/// How the GPU is going to access a resource next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    CopyDest,
    CopySource,
    ShaderResource,
    UnorderedAccess,
    RenderTarget,
    DepthWrite,
    VertexAndConstantBuffer,
    IndexBuffer,
    Present,
}

/// Optimized clear value for render targets and depth buffers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth { depth: f32, stencil: u8 },
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Swap-chain creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub extent: Extent2d,
    pub buffer_count: u32,
    pub format: TextureFormat,
}

/// Outcome of a present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    /// The image was queued for display.
    Presented,
    /// The surface no longer matches the swap chain; resize before the next frame.
    Outdated,
}
