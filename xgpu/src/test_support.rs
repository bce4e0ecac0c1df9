use crate::backend::soft::{Soft, SoftAdapterConfig, SoftConfig};
use crate::device::{Device, DeviceDesc};
use crate::shader::SPIRV_MAGIC;
use crate::system::{System, SystemDesc};

pub(crate) fn soft_device() -> (System<Soft>, Device<Soft>) {
    soft_device_with(SoftAdapterConfig::default())
}

pub(crate) fn soft_device_with(adapter: SoftAdapterConfig) -> (System<Soft>, Device<Soft>) {
    let mut system = System::new();
    system
        .initialize(&SystemDesc {
            app_name: "xgpu tests".to_owned(),
            window: None,
            config: SoftConfig {
                adapters: vec![adapter],
            },
        })
        .unwrap();
    let device = system.create_device(&DeviceDesc::default()).unwrap();
    (system, device)
}

/// A SPIR-V header with no instructions.
pub(crate) fn fake_spirv() -> Vec<u8> {
    [SPIRV_MAGIC, 0x0001_0600, 0, 1, 0]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}
