//! `aero-texture-cache` keeps guest textures resident as host images for the Xenos GPU emulator.
//!
//! Currently this crate provides:
//! - A fingerprint-keyed texture cache with write-watch invalidation, deferred deletion gated on
//!   submission fences, and resolve-target textures (see [`TextureCache`]).
//! - Guest-to-host upload: detiling, endian swaps and format conversion through a fence-gated
//!   staging ring (see [`upload::UploadPipeline`]).
//! - Pooled image memory and per-draw descriptor assembly (see [`allocator`] and
//!   [`descriptors`]).
//! - A host abstraction ([`hal::HostGpu`]) with a CPU implementation ([`SoftwareGpu`]) and an
//!   optional `wgpu` one (feature `wgpu`).

pub mod allocator;
pub mod cache;
pub mod config;
pub mod descriptors;
pub mod error;
pub mod fetch;
pub mod format;
pub mod guest;
pub mod hal;
pub mod info;
pub mod invalidation;
pub mod sampler;
pub mod software;
pub mod stats;
pub mod swizzle;
pub mod texture;
pub mod upload;

#[cfg(feature = "wgpu")]
mod wgpu_backend;

pub use cache::TextureCache;
pub use config::TextureCacheConfig;
pub use descriptors::{ShaderStage, TextureBinding, UpdateSet};
pub use error::{AllocError, GpuError, TextureCacheError, UploadError};
pub use fetch::{FetchConstantFile, FetchConstantSource, TextureFetchConstant};
pub use format::{Endian, GuestFormat, HostFormat};
pub use guest::{GuestMemory, MemoryWatcher, VecGuestMemory};
pub use info::{TextureDimension, TextureInfo, TextureOffset};
pub use sampler::SamplerInfo;
pub use software::SoftwareGpu;
pub use stats::CacheStats;
pub use swizzle::{Swizzle, SwizzleSource};
pub use texture::{Residency, Texture, TextureHandle};

#[cfg(feature = "wgpu")]
pub use wgpu_backend::WgpuGpu;
