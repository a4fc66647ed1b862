//! Texture fetch constants: the guest register state describing one texture/sampler binding.

use crate::format::{Endian, GuestFormat};
use crate::info::{TextureDimension, TextureInfo};
use crate::sampler::{ClampMode, FilterMode, SamplerInfo};
use crate::swizzle::Swizzle;

/// Number of texture fetch constant slots.
pub const MAX_FETCH_CONSTANTS: u32 = 32;

const FETCH_TYPE_TEXTURE: u32 = 2;

fn bits(word: u32, start: u32, len: u32) -> u32 {
    (word >> start) & ((1u32 << len) - 1)
}

/// Raw six-dword texture fetch constant.
///
/// | dword | bits   | field                               |
/// |-------|--------|-------------------------------------|
/// | 0     | 0..2   | fetch type (2 = texture)            |
/// | 1     | 0..6   | format                              |
/// | 1     | 6..8   | endianness                          |
/// | 1     | 8      | tiled                               |
/// | 1     | 12..32 | base address >> 12                  |
/// | 2     | 0..13  | width - 1                           |
/// | 2     | 13..26 | height - 1                          |
/// | 3     | 0..9   | clamp x/y/z (3 bits each)           |
/// | 3     | 9..15  | mag/min/mip filter (2 bits each)    |
/// | 3     | 16..28 | swizzle                             |
/// | 4     | 0..12  | pitch / 32 (0 = same as width)      |
/// | 5     | 0..2   | dimension (1 = 2D, 3 = cube)        |
/// | 5     | 2..6   | mip levels - 1                      |
/// | 5     | 12..32 | mip address >> 12 (0 = packed)      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureFetchConstant(pub [u32; 6]);

impl TextureFetchConstant {
    pub fn is_texture(&self) -> bool {
        bits(self.0[0], 0, 2) == FETCH_TYPE_TEXTURE
    }

    /// Decode the texture description; `None` for non-texture fetches, null addresses, and
    /// unknown formats or dimensions.
    pub fn texture_info(&self) -> Option<TextureInfo> {
        if !self.is_texture() {
            return None;
        }
        let [_, d1, d2, _, d4, d5] = self.0;
        let guest_address = u64::from(bits(d1, 12, 20)) << 12;
        if guest_address == 0 {
            return None;
        }
        let format = GuestFormat::from_raw(bits(d1, 0, 6))?;
        let dimension = match bits(d5, 0, 2) {
            1 => TextureDimension::D2,
            3 => TextureDimension::Cube,
            _ => return None,
        };
        let width = bits(d2, 0, 13) + 1;
        let height = bits(d2, 13, 13) + 1;
        let pitch = match bits(d4, 0, 12) {
            0 => width,
            p => p * 32,
        };
        Some(TextureInfo {
            guest_address,
            dimension,
            width,
            height,
            pitch,
            mip_levels: bits(d5, 2, 4) + 1,
            mip_address: u64::from(bits(d5, 12, 20)) << 12,
            format,
            endian: Endian::from_raw(bits(d1, 6, 2)),
            tiled: bits(d1, 8, 1) != 0,
        })
    }

    pub fn sampler_info(&self) -> SamplerInfo {
        let d3 = self.0[3];
        SamplerInfo {
            clamp_u: ClampMode::from_raw(bits(d3, 0, 3)),
            clamp_v: ClampMode::from_raw(bits(d3, 3, 3)),
            clamp_w: ClampMode::from_raw(bits(d3, 6, 3)),
            mag_filter: FilterMode::from_raw(bits(d3, 9, 2)),
            min_filter: FilterMode::from_raw(bits(d3, 11, 2)),
            mip_filter: FilterMode::from_raw(bits(d3, 13, 2)),
        }
    }

    pub fn swizzle(&self) -> Swizzle {
        Swizzle::from_raw(bits(self.0[3], 16, 12) as u16)
    }

    /// Encode a fetch constant the way the guest driver would.
    ///
    /// Addresses are truncated to 4 KiB granularity and a pitch that is not a multiple of 32 is
    /// encoded as "same as width". Zero width, height or mip count encode as 1.
    pub fn encode(info: &TextureInfo, sampler: &SamplerInfo, swizzle: Swizzle) -> Self {
        debug_assert_eq!(info.guest_address & 0xFFF, 0);
        debug_assert_eq!(info.mip_address & 0xFFF, 0);
        let d0 = FETCH_TYPE_TEXTURE;
        let d1 = (info.format.raw() & 0x3F)
            | (info.endian.raw() << 6)
            | (u32::from(info.tiled) << 8)
            | (((info.guest_address >> 12) as u32) << 12);
        // Zero extents have no encoding; they clamp to the smallest representable value.
        let d2 = (info.width.saturating_sub(1) & 0x1FFF)
            | ((info.height.saturating_sub(1) & 0x1FFF) << 13);
        let d3 = sampler.clamp_u.raw()
            | (sampler.clamp_v.raw() << 3)
            | (sampler.clamp_w.raw() << 6)
            | (sampler.mag_filter.raw() << 9)
            | (sampler.min_filter.raw() << 11)
            | (sampler.mip_filter.raw() << 13)
            | (u32::from(swizzle.raw()) << 16);
        let d4 = if info.pitch != info.width && info.pitch % 32 == 0 {
            (info.pitch / 32) & 0xFFF
        } else {
            0
        };
        let dimension = match info.dimension {
            TextureDimension::D2 => 1,
            TextureDimension::Cube => 3,
        };
        let d5 = dimension
            | ((info.mip_levels.saturating_sub(1) & 0xF) << 2)
            | (((info.mip_address >> 12) as u32) << 12);
        Self([d0, d1, d2, d3, d4, d5])
    }
}

/// Read-only view of the guest's fetch constant registers, polled when bindings are prepared.
pub trait FetchConstantSource {
    fn texture_fetch(&self, index: u32) -> Option<TextureFetchConstant>;
}

/// In-memory fetch constant register file.
#[derive(Debug, Clone, Default)]
pub struct FetchConstantFile {
    constants: [TextureFetchConstant; MAX_FETCH_CONSTANTS as usize],
}

impl FetchConstantFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, index: u32, constant: TextureFetchConstant) {
        if let Some(slot) = self.constants.get_mut(index as usize) {
            *slot = constant;
        }
    }
}

impl FetchConstantSource for FetchConstantFile {
    fn texture_fetch(&self, index: u32) -> Option<TextureFetchConstant> {
        self.constants.get(index as usize).copied()
    }
}
