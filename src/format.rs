// Pixel and vertex formats
//
// One format enum shared by images, views, texel buffers and vertex
// attributes. Each backend maps it to its native enum and refuses formats it
// cannot express instead of substituting another one.

use serde::{Deserialize, Serialize};

use crate::resource::{Aspect, ClearValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
    R16G16B16A16Float,
    R32G32B32A32Float,
    R32Uint,
    R32Float,
    R16Uint,
    R32G32Float,
    R32G32B32Float,
    D32Float,
    D24UnormS8Uint,
    Bc1Unorm,
    Bc1Srgb,
    Bc2Unorm,
    Bc3Unorm,
    Bc4Unorm,
    Bc5Unorm,
}

impl Format {
    /// Bytes per texel, or per 4x4 block for compressed formats.
    pub fn block_size(self) -> u32 {
        match self {
            Format::R16Uint => 2,
            Format::R8G8B8A8Unorm
            | Format::R8G8B8A8Srgb
            | Format::B8G8R8A8Unorm
            | Format::B8G8R8A8Srgb
            | Format::R32Uint
            | Format::R32Float
            | Format::D32Float
            | Format::D24UnormS8Uint => 4,
            Format::R16G16B16A16Float | Format::R32G32Float => 8,
            Format::R32G32B32Float => 12,
            Format::R32G32B32A32Float => 16,
            Format::Bc1Unorm | Format::Bc1Srgb | Format::Bc4Unorm => 8,
            Format::Bc2Unorm | Format::Bc3Unorm | Format::Bc5Unorm => 16,
        }
    }

    /// Edge length of a compression block (1 for uncompressed formats).
    pub fn block_extent(self) -> u32 {
        if self.is_compressed() {
            4
        } else {
            1
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            Format::Bc1Unorm
                | Format::Bc1Srgb
                | Format::Bc2Unorm
                | Format::Bc3Unorm
                | Format::Bc4Unorm
                | Format::Bc5Unorm
        )
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D32Float | Format::D24UnormS8Uint)
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint)
    }

    pub fn is_srgb(self) -> bool {
        matches!(self, Format::R8G8B8A8Srgb | Format::B8G8R8A8Srgb | Format::Bc1Srgb)
    }

    /// The aspect a full view of this format covers.
    pub fn full_aspect(self) -> Aspect {
        match self {
            Format::D32Float => Aspect::Depth,
            Format::D24UnormS8Uint => Aspect::DepthStencil,
            _ => Aspect::Color,
        }
    }

    /// Whether `aspect` names a plane this format actually has.
    pub fn supports_aspect(self, aspect: Aspect) -> bool {
        match aspect {
            Aspect::Color => !self.is_depth(),
            Aspect::Depth => self.is_depth(),
            Aspect::Stencil | Aspect::DepthStencil => self.has_stencil(),
        }
    }

    /// Bytes occupied by a `width` x `height` region.
    pub fn region_size(self, width: u32, height: u32) -> u64 {
        let block = self.block_extent();
        let blocks_x = width.div_ceil(block) as u64;
        let blocks_y = height.div_ceil(block) as u64;
        blocks_x * blocks_y * self.block_size() as u64
    }

    /// Tightly packed row pitch for `width` texels.
    pub fn row_pitch(self, width: u32) -> u32 {
        width.div_ceil(self.block_extent()) * self.block_size()
    }

    /// Encode a clear value as one texel of this format.
    ///
    /// Returns `None` when the value kind does not fit the format (colour value
    /// for a depth format and the other way round) or the format is compressed.
    pub fn encode_clear(self, value: &ClearValue) -> Option<Vec<u8>> {
        match (value, self) {
            (ClearValue::Color(c), Format::R8G8B8A8Unorm | Format::R8G8B8A8Srgb) => {
                Some(c.iter().map(|&v| unorm8(v)).collect())
            }
            (ClearValue::Color(c), Format::B8G8R8A8Unorm | Format::B8G8R8A8Srgb) => {
                Some(vec![unorm8(c[2]), unorm8(c[1]), unorm8(c[0]), unorm8(c[3])])
            }
            (ClearValue::Color(c), Format::R16G16B16A16Float) => {
                Some(c.iter().flat_map(|&v| f32_to_f16_bits(v).to_le_bytes()).collect())
            }
            (ClearValue::Color(c), Format::R32G32B32A32Float) => {
                Some(bytemuck::cast_slice(&c[..]).to_vec())
            }
            (ClearValue::Color(c), Format::R32G32B32Float) => {
                Some(bytemuck::cast_slice(&c[..3]).to_vec())
            }
            (ClearValue::Color(c), Format::R32G32Float) => {
                Some(bytemuck::cast_slice(&c[..2]).to_vec())
            }
            (ClearValue::Color(c), Format::R32Float) => Some(c[0].to_le_bytes().to_vec()),
            (ClearValue::Color(c), Format::R32Uint) => {
                Some((c[0].max(0.0) as u32).to_le_bytes().to_vec())
            }
            (ClearValue::Color(c), Format::R16Uint) => {
                Some((c[0].clamp(0.0, u16::MAX as f32) as u16).to_le_bytes().to_vec())
            }
            (ClearValue::DepthStencil { depth, .. }, Format::D32Float) => {
                Some(depth.to_le_bytes().to_vec())
            }
            (ClearValue::DepthStencil { depth, stencil }, Format::D24UnormS8Uint) => {
                let d = (depth.clamp(0.0, 1.0) * 0x00ff_ffff as f32).round() as u32;
                Some((d | (*stencil as u32) << 24).to_le_bytes().to_vec())
            }
            _ => None,
        }
    }
}

fn unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

// Truncating f32 -> f16 conversion.
fn f32_to_f16_bits(v: f32) -> u16 {
    let bits = v.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;

    if exp == 0xff {
        let nan = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | nan;
    }
    let half_exp = exp - 127 + 15;
    if half_exp >= 0x1f {
        sign | 0x7c00
    } else if half_exp <= 0 {
        if half_exp < -10 {
            return sign;
        }
        let m = (mantissa | 0x0080_0000) >> (1 - half_exp);
        sign | (m >> 13) as u16
    } else {
        sign | ((half_exp as u16) << 10) | (mantissa >> 13) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn red_clear_encodes_per_channel_order() {
        let red = ClearValue::Color([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(Format::R8G8B8A8Unorm.encode_clear(&red), Some(vec![255, 0, 0, 255]));
        assert_eq!(Format::B8G8R8A8Unorm.encode_clear(&red), Some(vec![0, 0, 255, 255]));
    }

    #[test]
    fn depth_and_colour_values_do_not_mix() {
        let depth = ClearValue::DepthStencil { depth: 1.0, stencil: 0 };
        assert!(Format::R8G8B8A8Unorm.encode_clear(&depth).is_none());
        assert!(Format::D32Float
            .encode_clear(&ClearValue::Color([0.0; 4]))
            .is_none());
        assert_eq!(
            Format::D24UnormS8Uint.encode_clear(&ClearValue::DepthStencil { depth: 1.0, stencil: 3 }),
            Some(0x03ff_ffffu32.to_le_bytes().to_vec())
        );
    }

    #[test]
    fn half_float_encoding_of_common_values() {
        assert_eq!(f32_to_f16_bits(1.0), 0x3c00);
        assert_eq!(f32_to_f16_bits(0.0), 0x0000);
        assert_eq!(f32_to_f16_bits(-2.0), 0xc000);
        assert_eq!(f32_to_f16_bits(0.5), 0x3800);
    }

    #[test]
    fn compressed_region_sizes_round_up_to_blocks() {
        assert_eq!(Format::Bc1Unorm.region_size(6, 6), 4 * 8);
        assert_eq!(Format::Bc3Unorm.row_pitch(8), 32);
        assert_eq!(Format::R8G8B8A8Unorm.region_size(256, 256), 256 * 256 * 4);
    }
}
