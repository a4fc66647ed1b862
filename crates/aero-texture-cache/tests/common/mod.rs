//! Shared helpers for `aero-texture-cache` integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use aero_texture_cache::fetch::TextureFetchConstant;
use aero_texture_cache::hal::{CommandBuffer, Fence, HostGpu};
use aero_texture_cache::{
    Endian, GuestFormat, SamplerInfo, SoftwareGpu, Swizzle, TextureCache, TextureCacheConfig,
    TextureDimension, TextureInfo, VecGuestMemory,
};

pub type SoftwareCache = TextureCache<SoftwareGpu, VecGuestMemory>;

pub const GUEST_MEMORY_SIZE: usize = 8 * 1024 * 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

pub fn cache() -> SoftwareCache {
    cache_with(TextureCacheConfig::default())
}

pub fn cache_with(config: TextureCacheConfig) -> SoftwareCache {
    init_tracing();
    let memory = Arc::new(VecGuestMemory::new(GUEST_MEMORY_SIZE));
    TextureCache::new(SoftwareGpu::new(), memory, config).unwrap()
}

/// Untiled 32bpp texture with a tight pitch.
pub fn linear_rgba(address: u64, width: u32, height: u32) -> TextureInfo {
    TextureInfo {
        guest_address: address,
        dimension: TextureDimension::D2,
        width,
        height,
        pitch: width,
        mip_levels: 1,
        mip_address: 0,
        format: GuestFormat::K8_8_8_8,
        endian: Endian::None,
        tiled: false,
    }
}

/// Fill the whole guest range of `info` with a pattern derived from `seed` and return it.
pub fn fill_guest(memory: &VecGuestMemory, info: &TextureInfo, seed: u8) -> Vec<u8> {
    let range = info.guest_range();
    let bytes: Vec<u8> = (0..range.end - range.start)
        .map(|i| ((i * 31) ^ (i >> 7) ^ (i >> 13)) as u8 ^ seed)
        .collect();
    memory.write(range.start, &bytes).unwrap();
    bytes
}

pub fn fetch_constant(info: &TextureInfo, swizzle: Swizzle) -> TextureFetchConstant {
    TextureFetchConstant::encode(info, &SamplerInfo::default(), swizzle)
}

pub fn begin(cache: &mut SoftwareCache) -> CommandBuffer {
    cache.gpu_mut().begin_command_buffer().unwrap()
}

pub fn submit(cache: &mut SoftwareCache, cmd: CommandBuffer) -> Fence {
    cache.gpu_mut().submit(cmd.id).unwrap()
}
