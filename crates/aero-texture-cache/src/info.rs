//! Decoded guest texture descriptions and their guest-memory layout.

use std::ops::Range;

use xxhash_rust::xxh3::Xxh3;

use crate::error::UploadError;
use crate::format::{Endian, GuestFormat, TILE_BLOCKS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D2,
    Cube,
}

impl TextureDimension {
    pub fn array_layers(self) -> u32 {
        match self {
            TextureDimension::D2 => 1,
            TextureDimension::Cube => 6,
        }
    }
}

/// Everything the cache knows about one guest texture.
///
/// Built from a fetch constant for ordinary textures, or from an address/size/format triple for
/// resolve targets (see [`TextureInfo::resolve_target`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureInfo {
    pub guest_address: u64,
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    /// Row length of mip 0 in texels.
    pub pitch: u32,
    pub mip_levels: u32,
    /// Base of mips 1.. in guest memory; zero means they are packed after mip 0.
    pub mip_address: u64,
    pub format: GuestFormat,
    pub endian: Endian,
    pub tiled: bool,
}

/// Placement of a sub-region inside a larger texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureOffset {
    /// Guest byte delta from the texture base to the requested address.
    pub bytes: u64,
    pub x: u32,
    pub y: u32,
}

/// One mip level of one array layer as stored in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSubresource {
    pub mip_level: u32,
    pub array_layer: u32,
    pub width: u32,
    pub height: u32,
    pub address: u64,
    /// Blocks per row, including tiling padding.
    pub pitch_blocks: u32,
    /// Block rows, including tiling padding.
    pub rows: u32,
    pub size: u64,
}

impl TextureInfo {
    /// Description of a render target being read back as a texture. Only address, size and
    /// format are known; the surface is assumed tiled with a single level.
    pub fn resolve_target(address: u64, width: u32, height: u32, format: GuestFormat) -> Self {
        Self {
            guest_address: address,
            dimension: TextureDimension::D2,
            width,
            height,
            pitch: width.next_multiple_of(TILE_BLOCKS),
            mip_levels: 1,
            mip_address: 0,
            format,
            endian: Endian::None,
            tiled: true,
        }
    }

    pub fn array_layers(&self) -> u32 {
        self.dimension.array_layers()
    }

    /// 64-bit cache key over address, geometry and format.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh3::new();
        hasher.update(&self.guest_address.to_le_bytes());
        hasher.update(&self.mip_address.to_le_bytes());
        for word in [
            self.width,
            self.height,
            self.pitch,
            self.mip_levels,
            self.format.raw(),
            self.endian.raw(),
            u32::from(self.tiled),
            self.array_layers(),
        ] {
            hasher.update(&word.to_le_bytes());
        }
        hasher.digest()
    }

    pub fn validate(&self) -> Result<(), UploadError> {
        if self.width == 0 || self.height == 0 {
            return Err(UploadError::InvalidGeometry(format!(
                "zero-sized texture {}x{}",
                self.width, self.height
            )));
        }
        if self.dimension == TextureDimension::Cube && self.width != self.height {
            return Err(UploadError::InvalidGeometry(format!(
                "cube faces must be square, got {}x{}",
                self.width, self.height
            )));
        }
        let max_levels = 32 - self.width.max(self.height).leading_zeros();
        if self.mip_levels == 0 || self.mip_levels > max_levels {
            return Err(UploadError::InvalidGeometry(format!(
                "mip_levels={} outside 1..={max_levels} for {}x{}",
                self.mip_levels, self.width, self.height
            )));
        }
        if self.pitch < self.width {
            return Err(UploadError::InvalidGeometry(format!(
                "pitch {} smaller than width {}",
                self.pitch, self.width
            )));
        }
        Ok(())
    }

    fn level_extent(&self, level: u32) -> (u32, u32, u32, u32) {
        let info = self.format.info();
        let width = (self.width >> level).max(1);
        let height = (self.height >> level).max(1);
        let mut pitch_blocks = info.blocks_wide((self.pitch >> level).max(1));
        let mut rows = info.blocks_high(height);
        if self.tiled {
            pitch_blocks = pitch_blocks.next_multiple_of(TILE_BLOCKS);
            rows = rows.next_multiple_of(TILE_BLOCKS);
        }
        (width, height, pitch_blocks, rows)
    }

    /// Guest placement of every subresource, level-major with faces contiguous per level.
    pub fn guest_layout(&self) -> Result<Vec<GuestSubresource>, UploadError> {
        self.validate()?;
        let bytes_per_block = u64::from(self.format.info().bytes_per_block);
        let layers = self.array_layers();

        let mut out = Vec::with_capacity((self.mip_levels * layers) as usize);
        let mut level_base = self.guest_address;
        for level in 0..self.mip_levels {
            if level == 1 && self.mip_address != 0 {
                level_base = self.mip_address;
            }
            let (width, height, pitch_blocks, rows) = self.level_extent(level);
            let face_size = u64::from(pitch_blocks) * u64::from(rows) * bytes_per_block;
            for layer in 0..layers {
                out.push(GuestSubresource {
                    mip_level: level,
                    array_layer: layer,
                    width,
                    height,
                    address: level_base + u64::from(layer) * face_size,
                    pitch_blocks,
                    rows,
                    size: face_size,
                });
            }
            level_base += face_size * u64::from(layers);
        }
        Ok(out)
    }

    /// Guest range the texture occupies; this is what gets write-watched.
    pub fn guest_range(&self) -> Range<u64> {
        let Ok(layout) = self.guest_layout() else {
            return self.guest_address..self.guest_address;
        };
        let start = layout
            .iter()
            .map(|s| s.address)
            .min()
            .unwrap_or(self.guest_address);
        let end = layout
            .iter()
            .map(|s| s.address + s.size)
            .max()
            .unwrap_or(self.guest_address);
        start..end
    }

    pub fn guest_size(&self) -> u64 {
        let range = self.guest_range();
        range.end - range.start
    }

    /// Where a `width`x`height` region of `format` at `address` sits inside mip 0 / face 0 of
    /// this texture, if it is fully contained.
    pub fn locate(
        &self,
        address: u64,
        width: u32,
        height: u32,
        format: GuestFormat,
    ) -> Option<TextureOffset> {
        if format != self.format || address < self.guest_address {
            return None;
        }
        let delta = address - self.guest_address;
        let info = format.info();
        let bytes_per_block = u64::from(info.bytes_per_block);
        let (_, _, pitch_blocks, _) = self.level_extent(0);

        let (x_blocks, y_blocks) = if self.tiled {
            let tile_bytes = u64::from(TILE_BLOCKS * TILE_BLOCKS) * bytes_per_block;
            let tile_row_bytes = u64::from(pitch_blocks / TILE_BLOCKS) * tile_bytes;
            let rem = delta % tile_row_bytes;
            if rem % tile_bytes != 0 {
                return None;
            }
            (
                rem / tile_bytes * u64::from(TILE_BLOCKS),
                delta / tile_row_bytes * u64::from(TILE_BLOCKS),
            )
        } else {
            let row_bytes = u64::from(pitch_blocks) * bytes_per_block;
            let rem = delta % row_bytes;
            if rem % bytes_per_block != 0 {
                return None;
            }
            (rem / bytes_per_block, delta / row_bytes)
        };

        let x = u32::try_from(x_blocks * u64::from(info.block_width)).ok()?;
        let y = u32::try_from(y_blocks * u64::from(info.block_height)).ok()?;
        let fits_x = u64::from(x) + u64::from(width) <= u64::from(self.width);
        let fits_y = u64::from(y) + u64::from(height) <= u64::from(self.height);
        (fits_x && fits_y).then_some(TextureOffset {
            bytes: delta,
            x,
            y,
        })
    }
}
