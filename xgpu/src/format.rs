//! Texel and index formats.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Undefined,
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgb32Float,
    Rgba32Float,
    R32Uint,
    D16Unorm,
    D32Float,
    D24UnormS8Uint,
}

impl Format {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Format::Undefined => 0,
            Format::R8Unorm => 1,
            Format::Rg8Unorm | Format::R16Float | Format::D16Unorm => 2,
            Format::Rgba8Unorm
            | Format::Rgba8Srgb
            | Format::Bgra8Unorm
            | Format::Bgra8Srgb
            | Format::R32Float
            | Format::R32Uint
            | Format::D32Float
            | Format::D24UnormS8Uint => 4,
            Format::Rgba16Float | Format::Rg32Float => 8,
            Format::Rgb32Float => 12,
            Format::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D16Unorm | Format::D32Float | Format::D24UnormS8Uint)
    }

    pub fn has_stencil(self) -> bool {
        self == Format::D24UnormS8Uint
    }

    pub fn is_srgb(self) -> bool {
        matches!(self, Format::Rgba8Srgb | Format::Bgra8Srgb)
    }

    /// Encode a linear RGBA color as one texel of this format. Channels the
    /// format lacks are dropped.
    pub fn encode_color(self, color: [f32; 4]) -> Result<Vec<u8>> {
        let unorm8 = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        let srgb8 = |c: f32| unorm8(linear_to_srgb(c));
        let [r, g, b, a] = color;
        let bytes = match self {
            Format::R8Unorm => vec![unorm8(r)],
            Format::Rg8Unorm => vec![unorm8(r), unorm8(g)],
            Format::Rgba8Unorm => vec![unorm8(r), unorm8(g), unorm8(b), unorm8(a)],
            Format::Rgba8Srgb => vec![srgb8(r), srgb8(g), srgb8(b), unorm8(a)],
            Format::Bgra8Unorm => vec![unorm8(b), unorm8(g), unorm8(r), unorm8(a)],
            Format::Bgra8Srgb => vec![srgb8(b), srgb8(g), srgb8(r), unorm8(a)],
            Format::R16Float => f32_to_f16(r).to_le_bytes().to_vec(),
            Format::Rgba16Float => color.iter().flat_map(|&c| f32_to_f16(c).to_le_bytes()).collect(),
            Format::R32Float => r.to_le_bytes().to_vec(),
            Format::Rg32Float => [r, g].iter().flat_map(|c| c.to_le_bytes()).collect(),
            Format::Rgb32Float => [r, g, b].iter().flat_map(|c| c.to_le_bytes()).collect(),
            Format::Rgba32Float => color.iter().flat_map(|c| c.to_le_bytes()).collect(),
            Format::R32Uint => (r.max(0.0) as u32).to_le_bytes().to_vec(),
            Format::Undefined | Format::D16Unorm | Format::D32Float | Format::D24UnormS8Uint => {
                return Err(Error::invalid(format!("{self:?} is not a color format")));
            }
        };
        Ok(bytes)
    }

    /// Encode a depth value (stencil zero) as one texel of this format.
    pub fn encode_depth(self, depth: f32) -> Result<Vec<u8>> {
        let depth = depth.clamp(0.0, 1.0);
        match self {
            Format::D16Unorm => Ok(((depth * 65535.0).round() as u16).to_le_bytes().to_vec()),
            Format::D32Float => Ok(depth.to_le_bytes().to_vec()),
            Format::D24UnormS8Uint => {
                Ok((((depth * 16_777_215.0).round() as u32) & 0x00ff_ffff).to_le_bytes().to_vec())
            }
            _ => Err(Error::invalid(format!("{self:?} is not a depth format"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexFormat {
    U16,
    #[default]
    U32,
}

impl IndexFormat {
    pub fn size(self) -> u64 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    let c = c.clamp(0.0, 1.0);
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

/// Round-to-nearest-even f32 to IEEE binary16 conversion.
fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;

    if exp == 0xff {
        // Inf or NaN; keep NaN quiet.
        let nan = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | nan;
    }

    let half_exp = exp - 127 + 15;
    if half_exp >= 0x1f {
        return sign | 0x7c00;
    }
    if half_exp <= 0 {
        if half_exp < -10 {
            return sign;
        }
        let m = mantissa | 0x0080_0000;
        let shift = (14 - half_exp) as u32;
        let half_m = m >> shift;
        let round_bit = 1 << (shift - 1);
        let rounded = if (m & round_bit) != 0 && ((m & (round_bit - 1)) != 0 || (half_m & 1) != 0) {
            half_m + 1
        } else {
            half_m
        };
        return sign | rounded as u16;
    }

    let half_m = mantissa >> 13;
    let round = mantissa & 0x1fff;
    let mut out = ((half_exp as u32) << 10) | half_m;
    if round > 0x1000 || (round == 0x1000 && (half_m & 1) != 0) {
        // Carry may roll into the exponent, which is the correct result.
        out += 1;
    }
    sign | out as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba8_clear_color_encodes_to_expected_bytes() {
        let bytes = Format::Rgba8Unorm.encode_color([0.0, 0.2, 0.4, 1.0]).unwrap();
        assert_eq!(bytes, vec![0, 51, 102, 255]);
        let bgra = Format::Bgra8Unorm.encode_color([0.0, 0.2, 0.4, 1.0]).unwrap();
        assert_eq!(bgra, vec![102, 51, 0, 255]);
    }

    #[test]
    fn srgb_encodes_midpoint_brighter() {
        let bytes = Format::Rgba8Srgb.encode_color([0.5, 0.0, 1.0, 0.5]).unwrap();
        assert_eq!(bytes, vec![188, 0, 255, 128]);
    }

    #[test]
    fn half_float_conversion() {
        assert_eq!(f32_to_f16(0.0), 0x0000);
        assert_eq!(f32_to_f16(1.0), 0x3c00);
        assert_eq!(f32_to_f16(-2.0), 0xc000);
        assert_eq!(f32_to_f16(65504.0), 0x7bff);
        assert_eq!(f32_to_f16(1.0e6), 0x7c00);
        assert_eq!(f32_to_f16(0.5), 0x3800);
    }

    #[test]
    fn depth_formats_reject_color_encoding() {
        assert!(Format::D32Float.encode_color([0.0; 4]).is_err());
        assert_eq!(Format::D32Float.encode_depth(1.0).unwrap(), 1.0f32.to_le_bytes().to_vec());
        assert_eq!(Format::D16Unorm.encode_depth(1.0).unwrap(), vec![0xff, 0xff]);
        assert!(Format::Rgba8Unorm.encode_depth(1.0).is_err());
    }

    #[test]
    fn texel_sizes() {
        assert_eq!(Format::Rgba8Unorm.bytes_per_texel(), 4);
        assert_eq!(Format::Rgb32Float.bytes_per_texel(), 12);
        assert_eq!(IndexFormat::U16.size(), 2);
    }
}
