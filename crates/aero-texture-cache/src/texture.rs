use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::allocator::ImageAllocation;
use crate::error::GpuError;
use crate::format::HostFormat;
use crate::guest::WatchHandle;
use crate::hal::{Fence, HostGpu, ImageId, ImageLayout, ImageViewDesc, ImageViewId, ResourceId};
use crate::info::TextureInfo;
use crate::swizzle::Swizzle;

pub enum TextureTag {}

/// Generation-checked handle to a texture owned by a [`crate::TextureCache`].
pub type TextureHandle = ResourceId<TextureTag>;

/// Where a texture currently lives inside the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Reachable through the fingerprint table.
    Cached,
    /// Tracked in the resolve list.
    Resolve,
    /// Evicted; waiting for its last fence and references before being freed.
    PendingDelete,
}

/// Swizzled view of a texture's image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureView {
    pub swizzle: Swizzle,
    pub view: ImageViewId,
}

/// One resident host image and the guest description it was built from.
pub struct Texture {
    pub(crate) info: TextureInfo,
    pub(crate) fingerprint: u64,
    pub(crate) host_format: HostFormat,
    pub(crate) image: ImageId,
    pub(crate) layout: ImageLayout,
    pub(crate) allocation: ImageAllocation,
    pub(crate) is_full_texture: bool,
    pub(crate) complete: bool,
    pub(crate) residency: Residency,
    pub(crate) watch: Option<WatchHandle>,
    pub(crate) pending_invalidation: Arc<AtomicBool>,
    pub(crate) last_use: Option<Fence>,
    pub(crate) ref_count: u32,
    pub(crate) views: Vec<TextureView>,
    pub(crate) created_serial: u64,
}

impl Texture {
    pub fn info(&self) -> &TextureInfo {
        &self.info
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn host_format(&self) -> HostFormat {
        self.host_format
    }

    pub fn image(&self) -> ImageId {
        self.image
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    /// Backing memory placement.
    pub fn allocation(&self) -> &ImageAllocation {
        &self.allocation
    }

    pub fn memory_range(&self) -> Range<u64> {
        self.allocation.offset..self.allocation.offset + self.allocation.size
    }

    /// False for textures materialised from a resolve target without a fetch constant.
    pub fn is_full_texture(&self) -> bool {
        self.is_full_texture
    }

    /// Whether the image holds valid guest content. Textures whose upload failed stay
    /// incomplete until evicted.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn is_pending_invalidation(&self) -> bool {
        self.pending_invalidation.load(Ordering::Acquire)
    }

    pub fn last_use(&self) -> Option<Fence> {
        self.last_use
    }

    /// Number of in-flight descriptor sets (or open binding accumulators) referencing this
    /// texture.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn views(&self) -> &[TextureView] {
        &self.views
    }

    pub fn find_view(&self, swizzle: Swizzle) -> Option<ImageViewId> {
        self.views
            .iter()
            .find(|v| v.swizzle == swizzle)
            .map(|v| v.view)
    }

    pub(crate) fn mark_used(&mut self, fence: Fence) {
        self.last_use = Some(self.last_use.map_or(fence, |last| last.max(fence)));
    }

    /// Returns the view for `swizzle` and whether it was created by this call.
    pub(crate) fn demand_view(
        &mut self,
        gpu: &mut dyn HostGpu,
        swizzle: Swizzle,
    ) -> Result<(ImageViewId, bool), GpuError> {
        if let Some(view) = self.find_view(swizzle) {
            return Ok((view, false));
        }
        let view = gpu.create_image_view(
            self.image,
            &ImageViewDesc {
                dimension: self.info.dimension,
                swizzle,
            },
        )?;
        self.views.push(TextureView { swizzle, view });
        Ok((view, true))
    }

    /// Destroy the views and then the image. The memory placement is returned to the caller.
    pub(crate) fn destroy(self, gpu: &mut dyn HostGpu) -> Result<ImageAllocation, GpuError> {
        for view in &self.views {
            gpu.destroy_image_view(view.view)?;
        }
        gpu.destroy_image(self.image)?;
        Ok(self.allocation)
    }
}
