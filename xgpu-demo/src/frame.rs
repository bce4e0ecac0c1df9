use std::f32::consts::TAU;

use xgpu::backend::Backend;
use xgpu::canvas::Canvas;
use xgpu::command::CommandList;
use xgpu::device::{Device, QueueKind};
use xgpu::state::{ResourceState, SourceState};

/// Frames for one full trip around the color wheel.
const COLOR_PERIOD: u64 = 240;

/// Clear color for `frame`, cycling smoothly through hues.
pub(crate) fn clear_color(frame: u64) -> [f32; 4] {
    let phase = (frame % COLOR_PERIOD) as f32 / COLOR_PERIOD as f32 * TAU;
    let channel = |offset: f32| 0.5 + 0.5 * (phase + offset).cos();
    [channel(0.0), channel(TAU / 3.0), channel(2.0 * TAU / 3.0), 1.0]
}

/// One command list per canvas frame slot.
pub(crate) struct FrameLoop<B: Backend> {
    lists: Vec<CommandList<B>>,
}

impl<B: Backend> FrameLoop<B> {
    pub(crate) fn new(device: &Device<B>, canvas: &Canvas<B>) -> xgpu::Result<Self> {
        let pool = device.create_worker_pool(QueueKind::Graphics)?;
        let lists = (0..canvas.frames_in_flight()?)
            .map(|_| pool.create_command_list())
            .collect::<xgpu::Result<Vec<_>>>()?;
        Ok(Self { lists })
    }

    /// Clear the held canvas image and present it. Returns the swapchain
    /// index that was presented.
    pub(crate) fn render(&mut self, device: &Device<B>, canvas: &mut Canvas<B>, frame: u64) -> xgpu::Result<u32> {
        let slot = canvas.frame_index()?;
        let image_index = canvas.image_index()?.unwrap_or_default();
        let image = canvas.current_image()?.clone();

        let list = &mut self.lists[slot];
        list.begin()?;
        list.image_barrier(&image, SourceState::Current, ResourceState::TransferDst)?;
        list.clear_color(&image, clear_color(frame))?;
        list.end()?;
        device.record(list)?;

        tracing::trace!(frame, slot, image_index, "Presenting frame");
        canvas.present()?;
        Ok(image_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_color_cycles_and_stays_opaque() {
        assert_eq!(clear_color(0), clear_color(COLOR_PERIOD));
        assert_ne!(clear_color(0), clear_color(COLOR_PERIOD / 3));
        for frame in 0..COLOR_PERIOD {
            let color = clear_color(frame);
            assert!(color[..3].iter().all(|c| (0.0..=1.0).contains(c)));
            assert_eq!(color[3], 1.0);
        }
    }
}
