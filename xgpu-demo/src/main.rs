#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod frame;
#[cfg(feature = "vulkan")]
mod windowed;

use std::fs::{self, File};

use clap::Parser;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};
use xgpu::Soft;
use xgpu::backend::Backend;
use xgpu::backend::soft::SoftConfig;
use xgpu::canvas::{CanvasDesc, CanvasSurface, PresentMode};
use xgpu::device::{DeviceDesc, QueueMode};
use xgpu::system::{System, SystemDesc};

use crate::frame::FrameLoop;

const APP_NAME: &str = "xgpu-demo";
const DEFAULT_HEADLESS_FRAMES: u64 = 8;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            // Unreachable in practice: logging is not installed when off.
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliBackend {
    Soft,
    #[cfg(feature = "vulkan")]
    Vulkan,
}

impl Default for CliBackend {
    fn default() -> Self {
        #[cfg(feature = "vulkan")]
        return CliBackend::Vulkan;
        #[cfg(not(feature = "vulkan"))]
        return CliBackend::Soft;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliQueueMode {
    #[default]
    Auto,
    Unified,
    Single,
}

impl From<CliQueueMode> for QueueMode {
    fn from(value: CliQueueMode) -> Self {
        match value {
            CliQueueMode::Auto => QueueMode::Auto,
            CliQueueMode::Unified => QueueMode::Unified,
            CliQueueMode::Single => QueueMode::Single,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliPresentMode {
    #[default]
    Fifo,
    Mailbox,
    Immediate,
}

impl From<CliPresentMode> for PresentMode {
    fn from(value: CliPresentMode) -> Self {
        match value {
            CliPresentMode::Fifo => PresentMode::Fifo,
            CliPresentMode::Mailbox => PresentMode::Mailbox,
            CliPresentMode::Immediate => PresentMode::Immediate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliValidationLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

#[cfg(feature = "vulkan")]
impl From<CliValidationLevel> for xgpu::backend::vulkan::ValidationLevel {
    fn from(value: CliValidationLevel) -> Self {
        use xgpu::backend::vulkan::ValidationLevel;
        match value {
            CliValidationLevel::Verbose => ValidationLevel::Verbose,
            CliValidationLevel::Info => ValidationLevel::Info,
            CliValidationLevel::Warning => ValidationLevel::Warning,
            CliValidationLevel::Error => ValidationLevel::Error,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, value_enum, default_value_t)]
    backend: CliBackend,
    /// Enable graphics API validation at this level.
    #[arg(short, long)]
    validation: Option<CliValidationLevel>,
    #[arg(short, long, default_value = "error")]
    log_level: TracingLogLevel,
    /// Frames to present before exiting. Windows run until closed by default.
    #[arg(short, long)]
    frames: Option<u64>,
    /// Swapchain images, and frames in flight.
    #[arg(long, default_value_t = 2)]
    buffers: u32,
    #[arg(long, value_enum, default_value_t)]
    present_mode: CliPresentMode,
    #[arg(long, value_enum, default_value_t)]
    queue_mode: CliQueueMode,
    /// Render to offscreen images instead of a window.
    #[arg(long)]
    headless: bool,
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,
}

impl CliArgs {
    fn canvas_desc(&self, surface: CanvasSurface) -> CanvasDesc {
        CanvasDesc {
            surface,
            width: self.width,
            height: self.height,
            buffer_count: self.buffers,
            present_mode: self.present_mode.into(),
            name: Some(format!("{APP_NAME} canvas")),
            ..CanvasDesc::default()
        }
    }

    fn device_desc(&self) -> DeviceDesc {
        DeviceDesc {
            name: Some(format!("{APP_NAME} device")),
            ..DeviceDesc::default()
        }
    }
}

fn main() -> eyre::Result<()> {
    let app_dirs = directories::ProjectDirs::from("", "xgpu", APP_NAME);

    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let cli_args = CliArgs::parse();

    if cli_args.log_level != TracingLogLevel::Off {
        fs::create_dir_all(&log_dir)?;

        let mut log_file_path = log_dir.clone();
        log_file_path.push("log-file");
        log_file_path.set_extension("txt");
        let log_file = File::create(&log_file_path)?;
        let file_log = tracing_subscriber::fmt::layer()
            .with_writer(log_file)
            .with_ansi(false);

        println!("log_file_path: {}", log_file_path.display());
        println!("cli_args: {:#?}", cli_args);

        let stdout_log = tracing_subscriber::fmt::layer().pretty();

        tracing_subscriber::registry()
            .with(
                stdout_log
                    .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                        cli_args.log_level.into(),
                    ))
                    .and_then(file_log),
            )
            .init();
    }

    match cli_args.backend {
        CliBackend::Soft => {
            if !cli_args.headless {
                tracing::info!("The soft back end has no window presentation; running headless");
            }
            if cli_args.validation.is_some() {
                tracing::warn!("--validation has no effect on the soft back end");
            }
            run_headless::<Soft>(&cli_args, SoftConfig::default())
        }
        #[cfg(feature = "vulkan")]
        CliBackend::Vulkan => {
            let config = xgpu::backend::vulkan::VulkanConfig {
                validation: cli_args.validation.map(Into::into),
                queue_mode: cli_args.queue_mode.into(),
                ..Default::default()
            };
            if cli_args.headless {
                run_headless::<xgpu::Vulkan>(&cli_args, config)
            } else {
                windowed::run(&cli_args, config)
            }
        }
    }
}

/// Present a fixed number of frames to an offscreen canvas.
fn run_headless<B: Backend>(cli_args: &CliArgs, config: B::Config) -> eyre::Result<()> {
    let mut system = System::<B>::new();
    system.initialize(&SystemDesc {
        app_name: APP_NAME.to_owned(),
        window: None,
        config,
    })?;
    let device = system.create_device(&cli_args.device_desc())?;
    let mut canvas = device.create_canvas(&cli_args.canvas_desc(CanvasSurface::Headless))?;
    let mut frames = FrameLoop::new(&device, &canvas)?;

    let frame_count = cli_args.frames.unwrap_or(DEFAULT_HEADLESS_FRAMES);
    tracing::info!(
        "Running {frame_count} headless frames on {} device {:?}",
        B::NAME,
        device.descriptor()?.name
    );
    for frame in 0..frame_count {
        let slot = canvas.frame_index()?;
        let image_index = frames.render(&device, &mut canvas, frame)?;
        tracing::info!("Frame {frame}: slot {slot}, image {image_index}");
    }
    device.wait_idle()?;
    println!("Presented {frame_count} frames on {}", B::NAME);
    Ok(())
}
