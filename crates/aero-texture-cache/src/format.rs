//! Guest texture formats, their host equivalents, and the pure texel conversion helpers used by
//! the upload pipeline.

/// Edge length (in blocks) of a guest macro-tile.
pub const TILE_BLOCKS: u32 = 32;

/// Texture formats as encoded in the guest fetch constant.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestFormat {
    K8,
    K1_5_5_5,
    K5_6_5,
    K8_8_8_8,
    K8_8,
    Dxt1,
    Dxt2_3,
    Dxt4_5,
    K16_16_16_16Float,
    K32Float,
    Dxn,
    Ctx1,
}

impl GuestFormat {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            2 => Self::K8,
            3 => Self::K1_5_5_5,
            4 => Self::K5_6_5,
            6 => Self::K8_8_8_8,
            10 => Self::K8_8,
            18 => Self::Dxt1,
            19 => Self::Dxt2_3,
            20 => Self::Dxt4_5,
            32 => Self::K16_16_16_16Float,
            36 => Self::K32Float,
            49 => Self::Dxn,
            52 => Self::Ctx1,
            _ => return None,
        })
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::K8 => 2,
            Self::K1_5_5_5 => 3,
            Self::K5_6_5 => 4,
            Self::K8_8_8_8 => 6,
            Self::K8_8 => 10,
            Self::Dxt1 => 18,
            Self::Dxt2_3 => 19,
            Self::Dxt4_5 => 20,
            Self::K16_16_16_16Float => 32,
            Self::K32Float => 36,
            Self::Dxn => 49,
            Self::Ctx1 => 52,
        }
    }

    /// Block geometry of the format as stored in guest memory.
    pub fn info(self) -> FormatInfo {
        match self {
            Self::K8 => FormatInfo::texel(1),
            Self::K1_5_5_5 | Self::K5_6_5 | Self::K8_8 => FormatInfo::texel(2),
            Self::K8_8_8_8 | Self::K32Float => FormatInfo::texel(4),
            Self::K16_16_16_16Float => FormatInfo::texel(8),
            Self::Dxt1 | Self::Ctx1 => FormatInfo::block(8),
            Self::Dxt2_3 | Self::Dxt4_5 | Self::Dxn => FormatInfo::block(16),
        }
    }

    /// Host format used to hold this guest format, or `None` when the host path cannot
    /// represent it.
    pub fn host_format(self) -> Option<HostFormat> {
        match self {
            Self::K8 => Some(HostFormat::R8Unorm),
            Self::K8_8 => Some(HostFormat::Rg8Unorm),
            Self::K8_8_8_8 | Self::K5_6_5 | Self::K1_5_5_5 => Some(HostFormat::Rgba8Unorm),
            Self::Dxt1 => Some(HostFormat::Bc1RgbaUnorm),
            Self::Dxt2_3 => Some(HostFormat::Bc2RgbaUnorm),
            Self::Dxt4_5 => Some(HostFormat::Bc3RgbaUnorm),
            Self::K16_16_16_16Float => Some(HostFormat::Rgba16Float),
            Self::K32Float => Some(HostFormat::R32Float),
            Self::Dxn | Self::Ctx1 => None,
        }
    }

    /// Whether texels must be rewritten (not just copied) on the way to the host format.
    pub fn needs_conversion(self) -> bool {
        matches!(self, Self::K5_6_5 | Self::K1_5_5_5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba16Float,
    R32Float,
    Bc1RgbaUnorm,
    Bc2RgbaUnorm,
    Bc3RgbaUnorm,
}

impl HostFormat {
    pub fn info(self) -> FormatInfo {
        match self {
            Self::R8Unorm => FormatInfo::texel(1),
            Self::Rg8Unorm => FormatInfo::texel(2),
            Self::Rgba8Unorm | Self::R32Float => FormatInfo::texel(4),
            Self::Rgba16Float => FormatInfo::texel(8),
            Self::Bc1RgbaUnorm => FormatInfo::block(8),
            Self::Bc2RgbaUnorm | Self::Bc3RgbaUnorm => FormatInfo::block(16),
        }
    }

    pub fn is_compressed(self) -> bool {
        self.info().block_width > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub block_width: u32,
    pub block_height: u32,
    pub bytes_per_block: u32,
}

impl FormatInfo {
    const fn texel(bytes_per_block: u32) -> Self {
        Self {
            block_width: 1,
            block_height: 1,
            bytes_per_block,
        }
    }

    const fn block(bytes_per_block: u32) -> Self {
        Self {
            block_width: 4,
            block_height: 4,
            bytes_per_block,
        }
    }

    pub fn blocks_wide(&self, width: u32) -> u32 {
        width.div_ceil(self.block_width)
    }

    pub fn blocks_high(&self, height: u32) -> u32 {
        height.div_ceil(self.block_height)
    }

    /// Tightly packed size of a `width`x`height` surface.
    pub fn surface_size(&self, width: u32, height: u32) -> u64 {
        u64::from(self.blocks_wide(width))
            * u64::from(self.blocks_high(height))
            * u64::from(self.bytes_per_block)
    }
}

/// Byte-swapping mode the guest applies to texture memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endian {
    #[default]
    None,
    Swap8In16,
    Swap8In32,
    Swap16In32,
}

impl Endian {
    pub fn from_raw(raw: u32) -> Self {
        match raw & 0x3 {
            1 => Self::Swap8In16,
            2 => Self::Swap8In32,
            3 => Self::Swap16In32,
            _ => Self::None,
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Swap8In16 => 1,
            Self::Swap8In32 => 2,
            Self::Swap16In32 => 3,
        }
    }

    /// Swap `bytes` in place. Trailing bytes that do not fill a whole word are left alone.
    pub fn apply(self, bytes: &mut [u8]) {
        match self {
            Self::None => {}
            Self::Swap8In16 => {
                for word in bytes.chunks_exact_mut(2) {
                    word.swap(0, 1);
                }
            }
            Self::Swap8In32 => {
                for word in bytes.chunks_exact_mut(4) {
                    word.reverse();
                }
            }
            Self::Swap16In32 => {
                for word in bytes.chunks_exact_mut(4) {
                    word.rotate_left(2);
                }
            }
        }
    }
}

/// Byte offset of block `(x, y)` inside a tiled surface whose rows are `pitch_blocks` wide.
///
/// Tiled surfaces are made of `TILE_BLOCKS`x`TILE_BLOCKS` macro-tiles laid out row-major, each
/// stored contiguously with its own blocks row-major. `pitch_blocks` must be tile aligned.
pub fn tiled_block_offset(x: u32, y: u32, pitch_blocks: u32, bytes_per_block: u32) -> u64 {
    debug_assert_eq!(pitch_blocks % TILE_BLOCKS, 0);
    let tiles_per_row = u64::from(pitch_blocks / TILE_BLOCKS);
    let tile = u64::from(y / TILE_BLOCKS) * tiles_per_row + u64::from(x / TILE_BLOCKS);
    let within = u64::from(y % TILE_BLOCKS) * u64::from(TILE_BLOCKS) + u64::from(x % TILE_BLOCKS);
    (tile * u64::from(TILE_BLOCKS * TILE_BLOCKS) + within) * u64::from(bytes_per_block)
}

fn expand5(v: u16) -> u8 {
    let v = (v & 0x1F) as u8;
    (v << 3) | (v >> 2)
}

fn expand6(v: u16) -> u8 {
    let v = (v & 0x3F) as u8;
    (v << 2) | (v >> 4)
}

/// Convert one row of (already byte-swapped) guest blocks into host blocks.
///
/// `dst` must be exactly `blocks * host_bytes_per_block` long for the `blocks` in `src`.
pub fn convert_row(format: GuestFormat, src: &[u8], dst: &mut [u8]) {
    match format {
        GuestFormat::K5_6_5 => {
            for (texel, out) in src.chunks_exact(2).zip(dst.chunks_exact_mut(4)) {
                let v = u16::from_le_bytes([texel[0], texel[1]]);
                out[0] = expand5(v >> 11);
                out[1] = expand6(v >> 5);
                out[2] = expand5(v);
                out[3] = 0xFF;
            }
        }
        GuestFormat::K1_5_5_5 => {
            for (texel, out) in src.chunks_exact(2).zip(dst.chunks_exact_mut(4)) {
                let v = u16::from_le_bytes([texel[0], texel[1]]);
                out[0] = expand5(v >> 10);
                out[1] = expand5(v >> 5);
                out[2] = expand5(v);
                out[3] = if v & 0x8000 != 0 { 0xFF } else { 0x00 };
            }
        }
        _ => dst.copy_from_slice(src),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_format_codes_round_trip() {
        for raw in 0..64 {
            if let Some(format) = GuestFormat::from_raw(raw) {
                assert_eq!(format.raw(), raw);
            }
        }
        assert_eq!(GuestFormat::from_raw(0), None);
    }

    #[test]
    fn packed_16bit_formats_expand_to_rgba8() {
        // Pure red in 5:6:5 and opaque green in 1:5:5:5.
        let src = [0x00, 0xF8, 0xE0, 0x83];
        let mut dst = [0u8; 4];
        convert_row(GuestFormat::K5_6_5, &src[..2], &mut dst);
        assert_eq!(dst, [0xFF, 0x00, 0x00, 0xFF]);

        convert_row(GuestFormat::K1_5_5_5, &src[2..], &mut dst);
        assert_eq!(dst, [0x00, 0xFF, 0x00, 0xFF]);
    }

    #[test]
    fn endian_modes_swap_expected_lanes() {
        let mut bytes = [1u8, 2, 3, 4];
        Endian::Swap8In16.apply(&mut bytes);
        assert_eq!(bytes, [2, 1, 4, 3]);

        let mut bytes = [1u8, 2, 3, 4];
        Endian::Swap8In32.apply(&mut bytes);
        assert_eq!(bytes, [4, 3, 2, 1]);

        let mut bytes = [1u8, 2, 3, 4];
        Endian::Swap16In32.apply(&mut bytes);
        assert_eq!(bytes, [3, 4, 1, 2]);
    }

    #[test]
    fn tiled_offsets_walk_tiles_row_major() {
        assert_eq!(tiled_block_offset(0, 0, 64, 4), 0);
        assert_eq!(tiled_block_offset(1, 0, 64, 4), 4);
        assert_eq!(tiled_block_offset(0, 1, 64, 4), 32 * 4);
        // Second tile in the first tile row.
        assert_eq!(tiled_block_offset(32, 0, 64, 4), 1024 * 4);
        // First tile in the second tile row.
        assert_eq!(tiled_block_offset(0, 32, 64, 4), 2 * 1024 * 4);
    }

    #[test]
    fn compressed_surfaces_round_up_to_whole_blocks() {
        let dxt1 = GuestFormat::Dxt1.info();
        assert_eq!(dxt1.blocks_wide(5), 2);
        assert_eq!(dxt1.surface_size(1, 1), 8);
        assert!(GuestFormat::Dxt1.host_format().unwrap().is_compressed());
        assert_eq!(GuestFormat::Ctx1.host_format(), None);
    }
}
