//! Resource state transitions expressed as Vulkan pipeline barriers.

use ash::vk;

use crate::backend::types::ResourceState;

/// Layout, access and stages a resource is used with in one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct StateAccess {
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
    /// Stages that touch the resource when leaving this state.
    pub src_stage: vk::PipelineStageFlags,
    /// Stages that must wait when entering this state.
    pub dst_stage: vk::PipelineStageFlags,
}

impl StateAccess {
    /// Contents are discarded; used for the first barrier of a fresh image.
    pub const UNDEFINED: Self = Self {
        layout: vk::ImageLayout::UNDEFINED,
        access: vk::AccessFlags::empty(),
        src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        dst_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
    };

    pub fn of(state: ResourceState) -> Self {
        use vk::AccessFlags as A;
        use vk::PipelineStageFlags as S;

        let (layout, access, stages) = match state {
            ResourceState::Common => (
                vk::ImageLayout::GENERAL,
                A::MEMORY_READ | A::MEMORY_WRITE,
                S::ALL_COMMANDS,
            ),
            ResourceState::CopyDest => (
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                A::TRANSFER_WRITE,
                S::TRANSFER,
            ),
            ResourceState::CopySource => (
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                A::TRANSFER_READ,
                S::TRANSFER,
            ),
            ResourceState::ShaderResource => (
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                A::SHADER_READ,
                S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
            ),
            ResourceState::UnorderedAccess => (
                vk::ImageLayout::GENERAL,
                A::SHADER_READ | A::SHADER_WRITE,
                S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
            ),
            ResourceState::RenderTarget => (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
                S::COLOR_ATTACHMENT_OUTPUT,
            ),
            ResourceState::DepthWrite => (
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
                S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            ),
            ResourceState::VertexAndConstantBuffer => (
                vk::ImageLayout::GENERAL,
                A::VERTEX_ATTRIBUTE_READ | A::UNIFORM_READ,
                S::VERTEX_INPUT | S::VERTEX_SHADER | S::FRAGMENT_SHADER,
            ),
            ResourceState::IndexBuffer => {
                (vk::ImageLayout::GENERAL, A::INDEX_READ, S::VERTEX_INPUT)
            }
            // The acquire semaphore is waited at color output, present happens after everything.
            ResourceState::Present => {
                return Self {
                    layout: vk::ImageLayout::PRESENT_SRC_KHR,
                    access: A::empty(),
                    src_stage: S::COLOR_ATTACHMENT_OUTPUT,
                    dst_stage: S::BOTTOM_OF_PIPE,
                }
            }
        };
        Self {
            layout,
            access,
            src_stage: stages,
            dst_stage: stages,
        }
    }
}

/// What a barrier applies to.
#[derive(Debug, Clone, Copy)]
pub(super) enum BarrierTarget {
    Buffer(vk::Buffer),
    Image {
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
    },
}

/// Record a single barrier moving `target` from `before` to `after`.
pub(super) fn record_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    target: BarrierTarget,
    before: StateAccess,
    after: StateAccess,
) {
    let src_stage = before.src_stage;
    let dst_stage = after.dst_stage;

    match target {
        BarrierTarget::Buffer(buffer) => {
            let barrier = vk::BufferMemoryBarrier::default()
                .src_access_mask(before.access)
                .dst_access_mask(after.access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(buffer)
                .offset(0)
                .size(vk::WHOLE_SIZE);
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    src_stage,
                    dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[barrier],
                    &[],
                );
            }
        }
        BarrierTarget::Image { image, aspect_mask } => {
            let barrier = vk::ImageMemoryBarrier::default()
                .old_layout(before.layout)
                .new_layout(after.layout)
                .src_access_mask(before.access)
                .dst_access_mask(after.access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask,
                    base_mip_level: 0,
                    level_count: vk::REMAINING_MIP_LEVELS,
                    base_array_layer: 0,
                    layer_count: vk::REMAINING_ARRAY_LAYERS,
                });
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    src_stage,
                    dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
        }
    }
}

/// Make transfer writes visible to host reads once the submission completes.
pub(super) fn record_host_read_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}
