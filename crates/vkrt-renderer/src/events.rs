//! Host render-thread events.

use crate::error::RtResult;
use crate::host::HostGraphics;
use crate::ray_tracer::{RayTracer, TraceOutcome};

/// Events a host can issue from its render thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderEvent {
    TraceRays,
}

impl RenderEvent {
    pub fn from_raw(id: i32) -> Option<Self> {
        match id {
            1 => Some(RenderEvent::TraceRays),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            RenderEvent::TraceRays => 1,
        }
    }
}

impl RayTracer {
    /// Run the render event `event_id` for `camera_id`. Unknown ids are
    /// ignored and return `None`.
    pub fn handle_render_event(
        &mut self,
        event_id: i32,
        camera_id: i32,
        host: &dyn HostGraphics,
    ) -> RtResult<Option<TraceOutcome>> {
        match RenderEvent::from_raw(event_id) {
            Some(RenderEvent::TraceRays) => self.trace_rays(camera_id, host).map(Some),
            None => {
                log::debug!("Ignoring unknown render event {}", event_id);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DummyDevice;
    use crate::host::{HostTexture, HostTextureHandle};
    use crate::ray_tracer::NotReady;
    use ash::vk;
    use vkrt_common::RayTracerConfig;

    struct IdleHost;

    impl HostGraphics for IdleHost {
        fn recording_command_buffer(&self) -> Option<vk::CommandBuffer> {
            None
        }

        fn access_texture(&self, _handle: HostTextureHandle) -> Option<HostTexture> {
            None
        }
    }

    #[test]
    fn test_event_ids() {
        assert_eq!(RenderEvent::from_raw(1), Some(RenderEvent::TraceRays));
        assert_eq!(RenderEvent::TraceRays.raw(), 1);
        assert_eq!(RenderEvent::from_raw(0), None);
        assert_eq!(RenderEvent::from_raw(2), None);
    }

    #[test]
    fn test_handle_render_event() {
        let mut tracer = RayTracer::new(Box::new(DummyDevice::new()), RayTracerConfig::default()).unwrap();

        assert_eq!(tracer.handle_render_event(7, 0, &IdleHost).unwrap(), None);
        assert_eq!(
            tracer.handle_render_event(1, 0, &IdleHost).unwrap(),
            Some(TraceOutcome::Skipped(NotReady::NoTarget))
        );
    }
}
