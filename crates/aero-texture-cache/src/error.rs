use crate::format::GuestFormat;
use crate::guest::GuestMemoryError;

/// Failures reported by a [`crate::hal::HostGpu`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GpuError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("invalid {kind} handle (index={index}, generation={generation})")]
    InvalidHandle {
        kind: &'static str,
        index: u32,
        generation: u32,
    },
    #[error("host out of memory")]
    OutOfMemory,
}

/// Failures from the image-memory pools and the staging ring.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("invalid allocation policy: {0}")]
    InvalidPolicy(&'static str),
    #[error("allocation of {requested} bytes exceeds the pool size of {pool_size} bytes")]
    TooLarge { requested: u64, pool_size: u64 },
    #[error("all {pools} image pools are exhausted (requested {requested} bytes)")]
    PoolExhausted { requested: u64, pools: usize },
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

/// Failures from the upload pipeline.
///
/// Everything except [`UploadError::Gpu`] is a per-texture failure: the cache keeps running and
/// the affected texture is simply not usable for sampling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("guest texture format {0:?} has no host equivalent")]
    UnsupportedFormat(GuestFormat),
    #[error("invalid texture geometry: {0}")]
    InvalidGeometry(String),
    #[error("subresource needs {required} staging bytes but the ring holds {capacity}")]
    StagingTooSmall { required: u64, capacity: u64 },
    #[error(transparent)]
    GuestMemory(#[from] GuestMemoryError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

impl UploadError {
    /// Whether the failure means the host device itself is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UploadError::Gpu(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TextureCacheError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown or freed texture handle")]
    StaleTexture,
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
}
