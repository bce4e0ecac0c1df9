//! Swapchain-backed presentation with a ring of frame slots.
//!
//! Each slot owns an acquire semaphore, a render-finished semaphore and two
//! small internal command lists: one moves the acquired image to `Common`,
//! the other moves it to `Present` and signals render-finished. A slot is
//! reused only after its previous present list completes, which bounds the
//! number of frames in flight to the slot count.

use std::sync::Arc;

use crate::backend::{AcquireOutcome, Backend, DeviceApi, PresentOutcome, SwapchainApi, SwapchainInfo};
use crate::command::CommandList;
use crate::device::{Device, QueueKind, WorkerPool};
use crate::error::{Error, Result};
use crate::format::Format;
use crate::image::{Image, ImageDesc, ImageDimension, ImageUsage};
use crate::state::{ResourceState, SourceState};

/// What a canvas presents to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CanvasSurface {
    /// The window given to the System.
    #[default]
    Window,
    /// Offscreen images only.
    Headless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresentMode {
    #[default]
    Fifo,
    Mailbox,
    Immediate,
}

#[derive(Debug, Clone)]
pub struct CanvasDesc {
    pub surface: CanvasSurface,
    pub width: u32,
    pub height: u32,
    /// Number of frame slots, and the requested swapchain image count.
    pub buffer_count: u32,
    /// `None` lets the back end pick.
    pub format: Option<Format>,
    pub present_mode: PresentMode,
    pub name: Option<String>,
}

impl Default for CanvasDesc {
    fn default() -> Self {
        Self {
            surface: CanvasSurface::Window,
            width: 1280,
            height: 720,
            buffer_count: 2,
            format: None,
            present_mode: PresentMode::Fifo,
            name: None,
        }
    }
}

struct FrameSlot<B: Backend> {
    image_acquired: Arc<B::Semaphore>,
    render_finished: Arc<B::Semaphore>,
    acquire_list: CommandList<B>,
    present_list: CommandList<B>,
}

struct Swapchain<B: Backend> {
    images: Vec<Image<B>>,
    /// Whether each image has been presented since the swapchain was built.
    presented: Vec<bool>,
    // Declared last so the wrapped images drop before the native swapchain.
    native: B::Swapchain,
}

struct CanvasInner<B: Backend> {
    device: Device<B>,
    desc: CanvasDesc,
    slots: Vec<FrameSlot<B>>,
    swapchain: Swapchain<B>,
    frame_index: usize,
    image_index: Option<u32>,
    _pool: WorkerPool<B>,
}

pub struct Canvas<B: Backend> {
    inner: Option<CanvasInner<B>>,
}

impl<B: Backend> Default for Canvas<B> {
    fn default() -> Self {
        Self { inner: None }
    }
}

impl<B: Backend> std::fmt::Debug for Canvas<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canvas")
            .field("frame_index", &self.inner.as_ref().map(|i| i.frame_index))
            .field("image_index", &self.inner.as_ref().and_then(|i| i.image_index))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Drop for Canvas<B> {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

fn build_swapchain<B: Backend>(
    device: &Device<B>,
    desc: &CanvasDesc,
    old: Option<&B::Swapchain>,
) -> Result<Swapchain<B>> {
    let shared = device.shared()?;
    let info = SwapchainInfo {
        surface: desc.surface,
        width: desc.width,
        height: desc.height,
        image_count: desc.buffer_count,
        format: desc.format,
        present_mode: desc.present_mode,
        name: desc.name.as_deref(),
    };
    let native = shared.native.create_swapchain(&info, old)?;
    let (width, height) = native.extent();
    let format = native.format();
    let images: Vec<Image<B>> = native
        .images()?
        .into_iter()
        .map(|image| {
            Image::from_native(shared, image, ImageDesc {
                dimension: ImageDimension::D2,
                width,
                height,
                format,
                usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST,
                ..ImageDesc::default()
            })
        })
        .collect();
    tracing::info!(
        "Created swapchain {}x{} {:?} with {} images",
        width,
        height,
        format,
        images.len()
    );
    Ok(Swapchain {
        presented: vec![false; images.len()],
        images,
        native,
    })
}

impl<B: Backend> Canvas<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the swapchain and frame slots, then acquire the first image.
    pub fn initialize(&mut self, device: &Device<B>, desc: &CanvasDesc) -> Result<()> {
        self.deinitialize();
        let shared = device.shared()?;
        if desc.buffer_count < 2 {
            return Err(Error::invalid(format!("Canvas needs at least 2 buffers, got {}", desc.buffer_count)));
        }
        if desc.width == 0 || desc.height == 0 {
            return Err(Error::invalid(format!("Canvas extent {}x{} is empty", desc.width, desc.height)));
        }
        if desc.surface == CanvasSurface::Window && shared.system.window.is_none() {
            return Err(Error::invalid("Window canvas needs a window on the System"));
        }

        let swapchain = build_swapchain(device, desc, None)?;
        let pool = device.create_worker_pool(QueueKind::Graphics)?;
        let slots = (0..desc.buffer_count)
            .map(|_| {
                Ok(FrameSlot {
                    image_acquired: Arc::new(shared.native.create_semaphore(Some("image acquired"))?),
                    render_finished: Arc::new(shared.native.create_semaphore(Some("render finished"))?),
                    acquire_list: pool.create_command_list()?,
                    present_list: pool.create_command_list()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut inner = CanvasInner {
            device: device.clone(),
            desc: desc.clone(),
            slots,
            swapchain,
            frame_index: 0,
            image_index: None,
            _pool: pool,
        };
        inner.acquire_next_image()?;
        self.inner = Some(inner);
        Ok(())
    }

    /// Wait for outstanding frames and release the swapchain.
    pub fn deinitialize(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        if let Err(e) = inner.device.wait_idle() {
            tracing::error!("Error waiting for device idle on canvas drop: {}", e);
        }
        tracing::debug!("Dropping canvas {:?}", inner.desc.name);
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }

    fn inner(&self) -> Result<&CanvasInner<B>> {
        self.inner.as_ref().ok_or(Error::NotInitialized("Canvas"))
    }

    fn inner_mut(&mut self) -> Result<&mut CanvasInner<B>> {
        self.inner.as_mut().ok_or(Error::NotInitialized("Canvas"))
    }

    /// Acquire the next swapchain image. A no-op while an image is held.
    pub fn acquire_next_image(&mut self) -> Result<()> {
        self.inner_mut()?.acquire_next_image()
    }

    /// Submit pending work, transition the held image to `Present`, present
    /// it and acquire the next one.
    pub fn present(&mut self) -> Result<()> {
        self.inner_mut()?.present()
    }

    /// Rebuild the swapchain at a new extent.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::invalid(format!("Canvas extent {width}x{height} is empty")));
        }
        let inner = self.inner_mut()?;
        inner.desc.width = width;
        inner.desc.height = height;
        inner.recreate()?;
        inner.acquire_next_image()
    }

    /// Slot of the frame being recorded, `0..frames_in_flight()`.
    pub fn frame_index(&self) -> Result<usize> {
        Ok(self.inner()?.frame_index)
    }

    /// Swapchain index of the held image.
    pub fn image_index(&self) -> Result<Option<u32>> {
        Ok(self.inner()?.image_index)
    }

    /// The image to render into this frame.
    pub fn current_image(&self) -> Result<&Image<B>> {
        let inner = self.inner()?;
        let index = inner
            .image_index
            .ok_or_else(|| Error::invalid("Canvas holds no acquired image"))?;
        Ok(&inner.swapchain.images[index as usize])
    }

    /// Maximum number of frames the GPU may be working on at once.
    pub fn frames_in_flight(&self) -> Result<usize> {
        Ok(self.inner()?.slots.len())
    }

    /// Number of swapchain images.
    pub fn buffer_count(&self) -> Result<usize> {
        Ok(self.inner()?.swapchain.images.len())
    }

    pub fn extent(&self) -> Result<(u32, u32)> {
        Ok(self.inner()?.swapchain.native.extent())
    }

    pub fn format(&self) -> Result<Format> {
        Ok(self.inner()?.swapchain.native.format())
    }
}

/// Acquire attempts before an out-of-date swapchain is treated as fatal.
const ACQUIRE_ATTEMPTS: usize = 3;

impl<B: Backend> CanvasInner<B> {
    fn acquire_next_image(&mut self) -> Result<()> {
        if self.image_index.is_some() {
            return Ok(());
        }
        let slot = &self.slots[self.frame_index];
        slot.present_list.wait(None)?;
        slot.acquire_list.wait(None)?;

        let mut index = None;
        for _ in 0..ACQUIRE_ATTEMPTS {
            let slot = &self.slots[self.frame_index];
            match self.swapchain.native.acquire(&slot.image_acquired, None)? {
                AcquireOutcome::Acquired { index: i, suboptimal } => {
                    if suboptimal {
                        tracing::debug!("Acquired suboptimal swapchain image {}", i);
                    }
                    index = Some(i);
                    break;
                }
                AcquireOutcome::OutOfDate => self.recreate()?,
            }
        }
        let index = index.ok_or_else(|| Error::failure("Acquiring swapchain image", "swapchain stays out of date"))?;

        let image = &self.swapchain.images[index as usize];
        let from = if self.swapchain.presented[index as usize] {
            ResourceState::Present
        } else {
            ResourceState::Undefined
        };
        let slot = &mut self.slots[self.frame_index];
        let list = &mut slot.acquire_list;
        list.begin()?;
        list.image_barrier(image, SourceState::Known(from), ResourceState::Common)?;
        list.end()?;
        list.set_semaphores(vec![Arc::clone(&slot.image_acquired)], Vec::new())?;
        self.device.record(list)?;
        self.device.submit()?;
        self.image_index = Some(index);
        Ok(())
    }

    fn present(&mut self) -> Result<()> {
        let index = self
            .image_index
            .ok_or_else(|| Error::invalid("Canvas holds no acquired image"))?;
        self.device.submit()?;

        let image = &self.swapchain.images[index as usize];
        let slot = &mut self.slots[self.frame_index];
        let list = &mut slot.present_list;
        list.begin()?;
        list.image_barrier(image, SourceState::Current, ResourceState::Present)?;
        list.end()?;
        list.set_semaphores(Vec::new(), vec![Arc::clone(&slot.render_finished)])?;
        self.device.record(list)?;
        self.device.submit()?;

        let outcome = self.swapchain.native.present(index, &slot.render_finished)?;
        self.image_index = None;
        self.frame_index = (self.frame_index + 1) % self.slots.len();
        match outcome {
            PresentOutcome::Presented => self.swapchain.presented[index as usize] = true,
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                tracing::debug!("Swapchain {:?} after present, recreating", outcome);
                self.recreate()?;
            }
        }
        self.acquire_next_image()
    }

    /// Rebuild the swapchain; every image starts over from `Undefined`.
    fn recreate(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        for slot in &self.slots {
            slot.present_list.wait(None)?;
            slot.acquire_list.wait(None)?;
        }
        let swapchain = build_swapchain(&self.device, &self.desc, Some(&self.swapchain.native))?;
        self.swapchain = swapchain;
        self.image_index = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftAdapterConfig;
    use crate::buffer::{Buffer, BufferDesc, BufferUsage, MemoryLocality};
    use crate::state::Subresource;
    use crate::test_support::{soft_device, soft_device_with};
    use crate::Soft;
    use std::time::Duration;

    fn headless(buffer_count: u32) -> CanvasDesc {
        CanvasDesc {
            surface: CanvasSurface::Headless,
            width: 4,
            height: 4,
            buffer_count,
            format: Some(Format::Rgba8Unorm),
            ..CanvasDesc::default()
        }
    }

    #[test]
    fn clear_and_present_cycles_frame_slots() {
        let (_system, device) = soft_device();
        let mut canvas = device.create_canvas(&headless(2)).unwrap();
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        let readback: Buffer<Soft> = device
            .create_buffer(&BufferDesc {
                size: 4 * 4 * 4,
                usage: BufferUsage::TRANSFER_DST,
                locality: MemoryLocality::Readback,
                name: None,
            })
            .unwrap();

        let mut frames = Vec::new();
        for _ in 0..4 {
            frames.push(canvas.frame_index().unwrap());
            let image = canvas.current_image().unwrap().clone();
            list.begin().unwrap();
            list.image_barrier(&image, SourceState::Current, ResourceState::TransferDst).unwrap();
            list.clear_color(&image, [0.0, 0.2, 0.4, 1.0]).unwrap();
            list.image_barrier(&image, SourceState::Current, ResourceState::TransferSrc).unwrap();
            list.copy_image_to_buffer(&image, Subresource::default(), &readback, 0).unwrap();
            list.end().unwrap();
            device.record(&list).unwrap();
            canvas.present().unwrap();
            list.wait(None).unwrap();

            let mut pixel = [0u8; 4];
            readback.read(0, &mut pixel).unwrap();
            assert_eq!(pixel, [0, 51, 102, 255]);
        }
        assert_eq!(frames, vec![0, 1, 0, 1]);
        device.wait_idle().unwrap();
        assert_eq!(device.stats().unwrap().validation_errors, 0);
        assert_eq!(device.stats().unwrap().presents, 4);
    }

    #[test]
    fn frames_in_flight_stay_bounded_with_a_slow_executor() {
        let (_system, device) = soft_device_with(SoftAdapterConfig {
            execution_delay: Duration::from_millis(15),
            ..SoftAdapterConfig::default()
        });
        let mut canvas = device.create_canvas(&headless(2)).unwrap();
        assert_eq!(canvas.frames_in_flight().unwrap(), 2);
        for _ in 0..6 {
            canvas.present().unwrap();
        }
        device.wait_idle().unwrap();
        let stats = device.stats().unwrap();
        assert!(stats.max_frames_in_flight >= 1);
        assert!(stats.max_frames_in_flight <= 2, "{stats:?}");
        assert_eq!(stats.validation_errors, 0);
    }

    #[test]
    fn acquire_is_a_no_op_while_holding_an_image() {
        let (_system, device) = soft_device();
        let mut canvas = device.create_canvas(&headless(3)).unwrap();
        let held = canvas.image_index().unwrap();
        assert!(held.is_some());
        canvas.acquire_next_image().unwrap();
        assert_eq!(canvas.image_index().unwrap(), held);
        assert_eq!(canvas.buffer_count().unwrap(), 3);
    }

    #[test]
    fn resize_rebuilds_the_swapchain() {
        let (_system, device) = soft_device();
        let mut canvas = device.create_canvas(&headless(2)).unwrap();
        canvas.present().unwrap();
        canvas.resize(8, 2).unwrap();
        assert_eq!(canvas.extent().unwrap(), (8, 2));
        assert_eq!(canvas.current_image().unwrap().desc().unwrap().width, 8);
        canvas.present().unwrap();
        device.wait_idle().unwrap();
        assert_eq!(device.stats().unwrap().validation_errors, 0);
    }

    #[test]
    fn window_canvas_without_a_window_is_rejected() {
        let (_system, device) = soft_device();
        let err = device.create_canvas(&CanvasDesc::default()).unwrap_err();
        assert_eq!(err.code(), crate::ResultCode::InvalidArgs);
        assert!(Canvas::<Soft>::new().present().is_err());
    }
}
