//! One-shot command submission and image layout barriers.

use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;

use crate::error::{RtError, RtResult};

/// Submits single-use command buffers on one queue and blocks on a fence.
pub struct OneShotSubmitter {
    device: ash::Device,
    queue: Mutex<vk::Queue>,
    transient_pool: vk::CommandPool,
    fence: vk::Fence,
    timeout: Duration,
}

impl OneShotSubmitter {
    pub fn new(device: &ash::Device, queue_family: u32, timeout: Duration) -> RtResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        // SAFETY: `device` is a live host device and `queue_family` was resolved from it.
        unsafe {
            let transient_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|result| RtError::vulkan("create command pool", result))?;

            let fence = match device.create_fence(&vk::FenceCreateInfo::default(), None) {
                Ok(fence) => fence,
                Err(result) => {
                    device.destroy_command_pool(transient_pool, None);
                    return Err(RtError::vulkan("create fence", result));
                }
            };

            let queue = device.get_device_queue(queue_family, 0);

            Ok(Self {
                device: device.clone(),
                queue: Mutex::new(queue),
                transient_pool,
                fence,
                timeout,
            })
        }
    }

    /// Record with `record`, submit, and wait for the fence.
    pub fn submit(&self, record: impl FnOnce(vk::CommandBuffer)) -> RtResult<()> {
        let queue = self.queue.lock();

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.transient_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        // SAFETY: the pool and queue are only used under the queue lock.
        unsafe {
            let cmd = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|result| RtError::vulkan("allocate command buffer", result))?[0];
            let command_buffers = [cmd];

            let result = self.record_and_wait(*queue, cmd, record);
            self.device.free_command_buffers(self.transient_pool, &command_buffers);
            result
        }
    }

    unsafe fn record_and_wait(
        &self,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> RtResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(|result| RtError::vulkan("begin command buffer", result))?;

        record(cmd);

        self.device
            .end_command_buffer(cmd)
            .map_err(|result| RtError::vulkan("end command buffer", result))?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        self.device
            .queue_submit(queue, &[submit_info], self.fence)
            .map_err(|result| RtError::vulkan("queue submit", result))?;

        let timeout_ns = u64::try_from(self.timeout.as_nanos()).unwrap_or(u64::MAX);
        let waited = self.device.wait_for_fences(&[self.fence], true, timeout_ns);
        match waited {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => {
                // The fence stays pending; wait it out so the next submit can reuse it.
                let _ = self.device.queue_wait_idle(queue);
                let _ = self.device.reset_fences(&[self.fence]);
                return Err(RtError::FenceTimeout(self.timeout));
            }
            Err(result) => return Err(RtError::vulkan("wait for fence", result)),
        }

        self.device
            .reset_fences(&[self.fence])
            .map_err(|result| RtError::vulkan("reset fence", result))
    }
}

impl Drop for OneShotSubmitter {
    fn drop(&mut self) {
        // SAFETY: no submission is pending once `submit` has returned.
        unsafe {
            self.device.destroy_fence(self.fence, None);
            self.device.destroy_command_pool(self.transient_pool, None);
        }
    }
}

/// Access masks and stages for a layout transition:
/// `(src_access, dst_access, src_stage, dst_stage)`.
pub fn barrier_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (vk::AccessFlags, vk::AccessFlags, vk::PipelineStageFlags, vk::PipelineStageFlags) {
    match (old_layout, new_layout) {
        // Prior contents are discarded, but the last trace's writes to the
        // same image must still land before the next one starts.
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL) => (
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        (vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL) => (
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::GENERAL) => (
            vk::AccessFlags::TRANSFER_READ,
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
            vk::AccessFlags::SHADER_READ,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// Record a full-image color layout transition.
///
/// # Safety
/// `cmd` must be in the recording state.
pub unsafe fn transition_image_layout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    if old_layout == new_layout {
        return;
    }

    let (src_access, dst_access, src_stage, dst_stage) = barrier_masks(old_layout, new_layout);

    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        })
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);

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

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // barrier_masks
    // ============================================================

    #[test]
    fn test_undefined_to_general_waits_for_previous_trace() {
        // A trace whose copy-out was skipped leaves raygen writes pending.
        let (src, dst, src_stage, dst_stage) =
            barrier_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL);
        assert_eq!(src, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(src_stage, vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR);
        assert_eq!(dst_stage, vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR);
    }

    #[test]
    fn test_copy_out_transitions_are_paired() {
        let (_, to_src, _, _) =
            barrier_masks(vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let (from_src, _, _, _) =
            barrier_masks(vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::GENERAL);
        assert_eq!(to_src, from_src);

        let (_, to_dst, _, _) = barrier_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(to_dst, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn test_unknown_transition_is_conservative() {
        let (src, dst, src_stage, dst_stage) =
            barrier_masks(vk::ImageLayout::PREINITIALIZED, vk::ImageLayout::PRESENT_SRC_KHR);
        assert!(src.contains(vk::AccessFlags::MEMORY_WRITE));
        assert!(dst.contains(vk::AccessFlags::MEMORY_READ));
        assert_eq!(src_stage, vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(dst_stage, vk::PipelineStageFlags::ALL_COMMANDS);
    }
}
