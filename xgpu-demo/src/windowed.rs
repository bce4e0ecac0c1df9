//! Windowed presentation on the Vulkan back end.

use std::sync::Arc;

use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window as WinitWindow, WindowAttributes, WindowId},
};
use xgpu::Vulkan;
use xgpu::backend::vulkan::VulkanConfig;
use xgpu::canvas::{Canvas, CanvasDesc, CanvasSurface};
use xgpu::device::{Device, DeviceDesc};
use xgpu::system::{System, SystemDesc, WindowHandleSource};

use crate::frame::FrameLoop;
use crate::{APP_NAME, CliArgs};

pub(crate) fn run(cli_args: &CliArgs, config: VulkanConfig) -> eyre::Result<()> {
    let event_loop = EventLoop::builder().build()?;
    let mut app = AppRunner(Some(App::Initializing(InitializingState {
        config,
        device_desc: cli_args.device_desc(),
        canvas_desc: cli_args.canvas_desc(CanvasSurface::Window),
        frame_limit: cli_args.frames,
    })));

    tracing::trace!("Entering main event loop");
    Ok(event_loop.run_app(&mut app)?)
}

#[derive(Debug)]
struct AppRunner(Option<App>);

#[derive(Debug)]
enum App {
    Running(RunningState),
    Initializing(InitializingState),
    Suspended(SuspendedState),
    Exiting(ExitingState),
}

#[derive(Debug)]
struct InitializingState {
    config: VulkanConfig,
    device_desc: DeviceDesc,
    canvas_desc: CanvasDesc,
    frame_limit: Option<u64>,
}

/// A canvas with the command lists that draw into it.
struct Presenter {
    frames: FrameLoop<Vulkan>,
    canvas: Canvas<Vulkan>,
}

impl std::fmt::Debug for Presenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presenter").field("canvas", &self.canvas).finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct RunningState {
    // `None` means the window is currently zero-sized. We stay in Running
    // and rebuild on the next non-zero resize.
    presenter: Option<Presenter>,
    device: Device<Vulkan>,
    system: System<Vulkan>,
    win: Arc<WinitWindow>,
    canvas_desc: CanvasDesc,
    frame_limit: Option<u64>,
    frames_presented: u64,
}

#[derive(Debug)]
struct SuspendedState {
    device: Device<Vulkan>,
    system: System<Vulkan>,
    win: Arc<WinitWindow>,
    canvas_desc: CanvasDesc,
    frame_limit: Option<u64>,
    frames_presented: u64,
}

#[derive(Debug)]
struct ExitingState {}

fn build_presenter(device: &Device<Vulkan>, desc: &CanvasDesc, win: &WinitWindow) -> xgpu::Result<Option<Presenter>> {
    let size = win.inner_size();
    if size.width == 0 || size.height == 0 {
        tracing::trace!(
            "Skipping canvas create because window extent is zero: {}x{}",
            size.width,
            size.height
        );
        return Ok(None);
    }
    let desc = CanvasDesc {
        width: size.width,
        height: size.height,
        ..desc.clone()
    };
    let _span = tracing::trace_span!("canvas_create", width = desc.width, height = desc.height).entered();
    let canvas = device.create_canvas(&desc)?;
    let frames = FrameLoop::new(device, &canvas)?;
    Ok(Some(Presenter { frames, canvas }))
}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        assert!(self.0.is_some());
        if let Some(initializing_state) = self.take_initializing() {
            event_loop.set_control_flow(ControlFlow::Poll);
            let win = Arc::new(
                match event_loop.create_window(
                    WindowAttributes::default()
                        .with_title(APP_NAME)
                        .with_inner_size(LogicalSize {
                            width: initializing_state.canvas_desc.width,
                            height: initializing_state.canvas_desc.height,
                        }),
                ) {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::error!("Error while creating window: {}", e);
                        self.transition_to_exiting("Initializing", event_loop);
                        return;
                    }
                },
            );

            let mut system = System::<Vulkan>::new();
            if let Err(e) = system.initialize(&SystemDesc {
                app_name: APP_NAME.to_owned(),
                window: Some(Arc::clone(&win) as Arc<dyn WindowHandleSource>),
                config: initializing_state.config,
            }) {
                tracing::error!("Error while creating system: {}", e);
                self.transition_to_exiting("Initializing", event_loop);
                return;
            }

            let device = match system.create_device(&initializing_state.device_desc) {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!("Error while creating device: {}", e);
                    self.transition_to_exiting("Initializing", event_loop);
                    return;
                }
            };

            let presenter = match build_presenter(&device, &initializing_state.canvas_desc, &win) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("Error while creating canvas: {}", e);
                    self.transition_to_exiting("Initializing", event_loop);
                    return;
                }
            };
            tracing::debug!("State transition: Initializing -> Running");
            self.set_running(RunningState {
                presenter,
                device,
                system,
                win,
                canvas_desc: initializing_state.canvas_desc,
                frame_limit: initializing_state.frame_limit,
                frames_presented: 0,
            });
        } else if let Some(suspended_state) = self.take_suspended() {
            event_loop.set_control_flow(ControlFlow::Poll);
            let presenter =
                match build_presenter(&suspended_state.device, &suspended_state.canvas_desc, &suspended_state.win) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!("Error while creating canvas: {}", e);
                        self.transition_to_exiting("Suspended", event_loop);
                        return;
                    }
                };
            tracing::debug!("State transition: Suspended -> Running");
            self.set_running(RunningState {
                presenter,
                device: suspended_state.device,
                system: suspended_state.system,
                win: suspended_state.win,
                canvas_desc: suspended_state.canvas_desc,
                frame_limit: suspended_state.frame_limit,
                frames_presented: suspended_state.frames_presented,
            });
        } else if self.is_exiting() {
            tracing::warn!("resumed() called while in Exiting state");
        }
    }

    fn suspended(&mut self, event_loop: &ActiveEventLoop) {
        assert!(self.0.is_some());
        if let Some(running_state) = self.take_running() {
            event_loop.set_control_flow(ControlFlow::Wait);
            let RunningState {
                presenter,
                device,
                system,
                win,
                canvas_desc,
                frame_limit,
                frames_presented,
            } = running_state;
            // Canvas teardown waits for its frames.
            drop(presenter);

            if let Err(e) = device.wait_idle() {
                tracing::error!("Error while waiting for device idle during suspend: {}", e);
                self.transition_to_exiting("Running", event_loop);
                return;
            }

            tracing::debug!("State transition: Running -> Suspended");
            self.set_suspended(SuspendedState {
                device,
                system,
                win,
                canvas_desc,
                frame_limit,
                frames_presented,
            });
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(running_state) = self.as_running() {
            running_state.win.request_redraw();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, window_event: WindowEvent) {
        assert!(self.0.is_some());
        if !self.is_running_window(window_id) {
            return;
        }

        let should_keep_running = match &window_event {
            WindowEvent::CloseRequested => {
                tracing::trace!("Close window request received for window");
                false
            }
            WindowEvent::Resized(size) => match self.as_running_mut() {
                Some(running_state) => Self::resize(running_state, size.width, size.height),
                None => return,
            },
            WindowEvent::ScaleFactorChanged { .. } => match self.as_running_mut() {
                Some(running_state) => {
                    let size = running_state.win.inner_size();
                    Self::resize(running_state, size.width, size.height)
                }
                None => return,
            },
            WindowEvent::RedrawRequested => match self.as_running_mut() {
                Some(running_state) => Self::redraw(running_state),
                None => return,
            },
            _ => true,
        };

        if !should_keep_running {
            self.exit_from_running(event_loop);
        }
    }
}

impl AppRunner {
    fn transition_to_exiting(&mut self, from_state: &'static str, event_loop: &ActiveEventLoop) {
        tracing::debug!("State transition: {} -> Exiting", from_state);
        self.set_exiting(ExitingState {});
        event_loop.exit();
    }

    fn exit_from_running(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(running_state) = self.take_running() {
            tracing::info!("Exiting after {} frames", running_state.frames_presented);
            drop(running_state);
            self.transition_to_exiting("Running", event_loop);
        } else {
            tracing::warn!("Requested Running -> Exiting transition while not in Running state");
            event_loop.exit();
        }
    }

    fn is_running_window(&self, window_id: WindowId) -> bool {
        self.as_running()
            .is_some_and(|running_state| running_state.win.id() == window_id)
    }

    /// Present one frame. Returns `false` when the app should exit.
    fn redraw(running_state: &mut RunningState) -> bool {
        let Some(presenter) = running_state.presenter.as_mut() else {
            return true;
        };
        match presenter.frames.render(
            &running_state.device,
            &mut presenter.canvas,
            running_state.frames_presented,
        ) {
            Ok(_) => running_state.frames_presented += 1,
            Err(e) => {
                tracing::error!("Error while presenting frame: {}", e);
                return false;
            }
        }
        running_state
            .frame_limit
            .is_none_or(|limit| running_state.frames_presented < limit)
    }

    /// Returns `false` when the app should exit.
    fn resize(running_state: &mut RunningState, width: u32, height: u32) -> bool {
        if width == 0 || height == 0 {
            tracing::trace!(
                "Received zero extent ({}x{}); tearing down canvas and waiting for idle",
                width,
                height
            );
            running_state.presenter = None;
            if let Err(e) = running_state.device.wait_idle() {
                tracing::error!("Error while waiting for device idle on zero extent: {}", e);
                return false;
            }
            return true;
        }

        let result = match running_state.presenter.as_mut() {
            Some(presenter) => {
                if presenter.canvas.extent().is_ok_and(|extent| extent == (width, height)) {
                    tracing::trace!("Skipping canvas resize because extent is unchanged: {}x{}", width, height);
                    return true;
                }
                tracing::trace!("Resizing canvas to {}x{}", width, height);
                presenter.canvas.resize(width, height)
            }
            None => build_presenter(&running_state.device, &running_state.canvas_desc, &running_state.win)
                .map(|presenter| running_state.presenter = presenter),
        };
        if let Err(e) = result {
            tracing::error!("Error while resizing canvas: {}", e);
            return false;
        }
        true
    }

    fn take_initializing(&mut self) -> Option<InitializingState> {
        assert!(self.0.is_some());
        if matches!(self.0, Some(App::Initializing(_))) {
            match self.0.take() {
                Some(App::Initializing(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn take_running(&mut self) -> Option<RunningState> {
        assert!(self.0.is_some());
        if matches!(self.0, Some(App::Running(_))) {
            match self.0.take() {
                Some(App::Running(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn as_running(&self) -> Option<&RunningState> {
        assert!(self.0.is_some());
        match &self.0 {
            Some(App::Running(s)) => Some(s),
            _ => None,
        }
    }

    fn as_running_mut(&mut self) -> Option<&mut RunningState> {
        assert!(self.0.is_some());
        match &mut self.0 {
            Some(App::Running(s)) => Some(s),
            _ => None,
        }
    }

    fn set_running(&mut self, state: RunningState) {
        assert!(self.0.is_none());
        self.0 = Some(App::Running(state));
    }

    fn take_suspended(&mut self) -> Option<SuspendedState> {
        assert!(self.0.is_some());
        if matches!(self.0, Some(App::Suspended(_))) {
            match self.0.take() {
                Some(App::Suspended(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn set_suspended(&mut self, state: SuspendedState) {
        assert!(self.0.is_none());
        self.0 = Some(App::Suspended(state));
    }

    fn is_exiting(&self) -> bool {
        assert!(self.0.is_some());
        matches!(self.0, Some(App::Exiting(_)))
    }

    fn set_exiting(&mut self, state: ExitingState) {
        assert!(self.0.is_none());
        self.0 = Some(App::Exiting(state));
    }
}
