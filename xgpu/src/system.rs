//! Bootstrap: one back-end instance and its capability registry.

use std::sync::Arc;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::accel::AccelerationStructure;
use crate::backend::{Backend, InstanceApi};
use crate::buffer::Buffer;
use crate::canvas::Canvas;
use crate::capability::{CapabilityRegistry, PhysicalDeviceDescriptor};
use crate::descriptor::{DescriptorTable, DescriptorTableLayout};
use crate::device::{Device, DeviceDesc};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::pass::{RenderPass, RenderTarget};
use crate::pipeline::{ComputePipeline, GraphicsPipeline};
use crate::raytracing::{RayTracingPipeline, ShaderBindingTable};
use crate::sampler::Sampler;
use crate::shader::{Shader, ShaderLibrary};

/// A window the presentation layer can draw into.
pub trait WindowHandleSource: HasWindowHandle + HasDisplayHandle + Send + Sync + 'static {}

impl<T: HasWindowHandle + HasDisplayHandle + Send + Sync + 'static> WindowHandleSource for T {}

pub struct SystemDesc<B: Backend> {
    pub app_name: String,
    pub window: Option<Arc<dyn WindowHandleSource>>,
    pub config: B::Config,
}

impl<B: Backend> Default for SystemDesc<B> {
    fn default() -> Self {
        Self {
            app_name: "xgpu".to_owned(),
            window: None,
            config: B::Config::default(),
        }
    }
}

pub(crate) struct SystemShared<B: Backend> {
    pub(crate) instance: B::Instance,
    pub(crate) registry: CapabilityRegistry,
    pub(crate) window: Option<Arc<dyn WindowHandleSource>>,
}

/// Top-level factory for one back end.
pub struct System<B: Backend> {
    shared: Option<Arc<SystemShared<B>>>,
}

impl<B: Backend> Default for System<B> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<B: Backend> std::fmt::Debug for System<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("backend", &B::NAME)
            .field("initialized", &self.shared.is_some())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> System<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the back-end instance and enumerate its physical devices.
    pub fn initialize(&mut self, desc: &SystemDesc<B>) -> Result<()> {
        self.deinitialize();
        let instance = B::Instance::new(&desc.app_name, desc.window.as_ref(), &desc.config)?;
        let devices = instance.physical_devices()?;
        for device in &devices {
            tracing::debug!(
                "Found adapter {}: {} ({:?}, ray tracing: {})",
                device.index,
                device.name,
                device.kind,
                device.ray_tracing_supported
            );
        }
        self.shared = Some(Arc::new(SystemShared {
            instance,
            registry: CapabilityRegistry::new(devices),
            window: desc.window.clone(),
        }));
        Ok(())
    }

    pub fn deinitialize(&mut self) {
        self.shared = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    pub(crate) fn shared(&self) -> Result<&Arc<SystemShared<B>>> {
        self.shared.as_ref().ok_or(Error::NotInitialized("System"))
    }

    pub fn physical_devices(&self) -> Result<&[PhysicalDeviceDescriptor]> {
        Ok(self.shared()?.registry.devices())
    }

    pub fn registry(&self) -> Result<&CapabilityRegistry> {
        Ok(&self.shared()?.registry)
    }

    /// The native back-end instance.
    pub fn native(&self) -> Result<&B::Instance> {
        Ok(&self.shared()?.instance)
    }

    pub fn create_device(&self, desc: &DeviceDesc) -> Result<Device<B>> {
        let mut device = Device::new();
        device.initialize(self, desc)?;
        Ok(device)
    }

    // Uninitialized factories; callers `initialize(&device, &desc)` them.

    pub fn create_image(&self) -> Image<B> {
        Image::new()
    }

    pub fn create_buffer(&self) -> Buffer<B> {
        Buffer::new()
    }

    pub fn create_sampler(&self) -> Sampler<B> {
        Sampler::new()
    }

    pub fn create_shader(&self) -> Shader<B> {
        Shader::new()
    }

    pub fn create_shader_library(&self) -> ShaderLibrary<B> {
        ShaderLibrary::new()
    }

    pub fn create_descriptor_table_layout(&self) -> DescriptorTableLayout<B> {
        DescriptorTableLayout::new()
    }

    pub fn create_descriptor_table(&self) -> DescriptorTable<B> {
        DescriptorTable::new()
    }

    pub fn create_render_pass(&self) -> RenderPass<B> {
        RenderPass::new()
    }

    pub fn create_render_target(&self) -> RenderTarget<B> {
        RenderTarget::new()
    }

    pub fn create_graphics_pipeline(&self) -> GraphicsPipeline<B> {
        GraphicsPipeline::new()
    }

    pub fn create_compute_pipeline(&self) -> ComputePipeline<B> {
        ComputePipeline::new()
    }

    pub fn create_ray_tracing_pipeline(&self) -> RayTracingPipeline<B> {
        RayTracingPipeline::new()
    }

    pub fn create_shader_binding_table(&self) -> ShaderBindingTable<B> {
        ShaderBindingTable::new()
    }

    pub fn create_acceleration_structure(&self) -> AccelerationStructure<B> {
        AccelerationStructure::new()
    }

    pub fn create_canvas(&self) -> Canvas<B> {
        Canvas::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::{Soft, SoftAdapterConfig, SoftConfig};

    #[test]
    fn initialize_enumerates_configured_adapters() {
        let mut system = System::<Soft>::new();
        assert!(system.physical_devices().is_err());
        let desc = SystemDesc::<Soft> {
            config: SoftConfig {
                adapters: vec![SoftAdapterConfig::default(), SoftAdapterConfig {
                    name: "no rt".to_owned(),
                    ray_tracing: false,
                    ..SoftAdapterConfig::default()
                }],
            },
            ..SystemDesc::default()
        };
        system.initialize(&desc).unwrap();
        let devices = system.physical_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].index, 1);
        assert!(!devices[1].ray_tracing_supported);

        system.deinitialize();
        system.deinitialize();
        assert!(!system.is_initialized());
    }

    #[test]
    fn factories_return_uninitialized_objects() {
        let system = System::<Soft>::new();
        assert!(!system.create_image().is_initialized());
        assert!(!system.create_canvas().is_initialized());
    }
}
