//! Logical-to-native descriptor binding translation.
//!
//! Shaders declare registers per class (`b`, `s`, `t`, `u`) and are compiled
//! with `-fvk-{b,s,t,u}-shift {0,1000,2000,3000}`, so every class lands in
//! its own band of native binding slots.

use crate::error::{Error, Result};

pub const BINDING_BAND_WIDTH: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    ConstantBuffer,
    Sampler,
    Texture,
    RwTexture,
    Buffer,
    RwBuffer,
    AccelerationStructure,
}

impl DescriptorType {
    pub fn band(self) -> u32 {
        match self {
            DescriptorType::ConstantBuffer => 0,
            DescriptorType::Sampler => 1,
            DescriptorType::Texture | DescriptorType::Buffer | DescriptorType::AccelerationStructure => 2,
            DescriptorType::RwTexture | DescriptorType::RwBuffer => 3,
        }
    }

    /// Whether a range of this type may be declared dynamic.
    pub fn allows_dynamic(self) -> bool {
        matches!(
            self,
            DescriptorType::Texture | DescriptorType::Buffer | DescriptorType::RwTexture | DescriptorType::RwBuffer
        )
    }
}

/// Native binding slot for logical register `index` of type `ty`.
pub fn native_binding_slot(ty: DescriptorType, index: u32) -> Result<u32> {
    if index >= BINDING_BAND_WIDTH {
        return Err(Error::invalid(format!(
            "Binding index {index} for {ty:?} exceeds band width {BINDING_BAND_WIDTH}"
        )));
    }
    Ok(ty.band() * BINDING_BAND_WIDTH + index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_are_offset_by_width() {
        assert_eq!(native_binding_slot(DescriptorType::ConstantBuffer, 3).unwrap(), 3);
        assert_eq!(native_binding_slot(DescriptorType::Sampler, 0).unwrap(), 1000);
        assert_eq!(native_binding_slot(DescriptorType::Texture, 5).unwrap(), 2005);
        assert_eq!(native_binding_slot(DescriptorType::Buffer, 5).unwrap(), 2005);
        assert_eq!(native_binding_slot(DescriptorType::AccelerationStructure, 1).unwrap(), 2001);
        assert_eq!(native_binding_slot(DescriptorType::RwTexture, 999).unwrap(), 3999);
    }

    #[test]
    fn index_at_band_width_is_invalid() {
        let err = native_binding_slot(DescriptorType::RwBuffer, BINDING_BAND_WIDTH).unwrap_err();
        assert_eq!(err.code(), crate::error::ResultCode::InvalidArgs);
    }

    #[test]
    fn only_resource_ranges_may_be_dynamic() {
        assert!(DescriptorType::Texture.allows_dynamic());
        assert!(!DescriptorType::Sampler.allows_dynamic());
        assert!(!DescriptorType::ConstantBuffer.allows_dynamic());
        assert!(!DescriptorType::AccelerationStructure.allows_dynamic());
    }
}
