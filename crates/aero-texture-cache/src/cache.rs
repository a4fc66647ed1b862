//! Fingerprint-keyed texture residency.
//!
//! The cache owns every texture it creates in a generation-checked arena. A texture is reachable
//! from exactly one of:
//! - the fingerprint table (ordinary textures built from fetch constants),
//! - the resolve list (render targets read back as textures),
//! - the pending-delete list (evicted, waiting for its last fence and references).
//!
//! Eviction never frees anything. Host objects are destroyed by [`TextureCache::scavenge`] once
//! the texture's last-use fence has signalled and no pending descriptor set references it.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use crate::allocator::{ImageAllocation, ImageAllocator, StagingRing};
use crate::config::TextureCacheConfig;
use crate::descriptors::{DescriptorAllocator, PendingDescriptorSet, TextureBinding, UpdateSet};
use crate::error::{AllocError, GpuError, TextureCacheError};
use crate::fetch::FetchConstantSource;
use crate::format::GuestFormat;
use crate::guest::{GuestMemory, MemoryWatcher};
use crate::hal::{
    CommandBuffer, DescriptorImageWrite, DescriptorSetId, Fence, HostGpu, ImageDesc, ImageLayout,
    ImageUsage, ImageViewId, ResourceRegistry, SamplerId,
};
use crate::info::{TextureInfo, TextureOffset};
use crate::invalidation::{InvalidationKind, InvalidationTracker};
use crate::sampler::{SamplerCache, SamplerInfo};
use crate::stats::CacheStats;
use crate::swizzle::Swizzle;
use crate::texture::{Residency, Texture, TextureHandle, TextureTag};
use crate::upload::UploadPipeline;

pub struct TextureCache<G: HostGpu, M: GuestMemory + MemoryWatcher> {
    gpu: G,
    memory: Arc<M>,
    config: TextureCacheConfig,
    textures: ResourceRegistry<TextureTag, Texture>,
    by_fingerprint: HashMap<u64, TextureHandle>,
    resolve_textures: Vec<TextureHandle>,
    pending_delete: Vec<TextureHandle>,
    images: ImageAllocator,
    upload: UploadPipeline,
    samplers: SamplerCache,
    descriptors: DescriptorAllocator,
    invalidation: InvalidationTracker,
    next_serial: u64,
    stats: CacheStats,
}

impl<G: HostGpu, M: GuestMemory + MemoryWatcher> TextureCache<G, M> {
    pub fn new(
        mut gpu: G,
        memory: Arc<M>,
        config: TextureCacheConfig,
    ) -> Result<Self, TextureCacheError> {
        config.validate()?;
        let caps = gpu.capabilities();
        let row_alignment = u64::from(caps.copy_row_pitch_alignment).max(1);
        let staging_alignment = config.staging_alignment.max(row_alignment);
        let ring = StagingRing::new(&mut gpu, config.staging_size, staging_alignment)?;
        let images = ImageAllocator::new(config.image_pool)?;
        let descriptors = DescriptorAllocator::new(config.max_descriptor_bindings);

        debug!(
            staging_size = config.staging_size,
            staging_alignment,
            pool_size = config.image_pool.pool_size,
            max_pools = config.image_pool.max_pools,
            "created texture cache"
        );

        Ok(Self {
            gpu,
            memory,
            config,
            textures: ResourceRegistry::new("texture"),
            by_fingerprint: HashMap::new(),
            resolve_textures: Vec::new(),
            pending_delete: Vec::new(),
            images,
            upload: UploadPipeline::new(ring, row_alignment),
            samplers: SamplerCache::new(),
            descriptors,
            invalidation: InvalidationTracker::new(),
            next_serial: 0,
            stats: CacheStats::default(),
        })
    }

    pub fn config(&self) -> &TextureCacheConfig {
        &self.config
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }

    pub fn memory(&self) -> &Arc<M> {
        &self.memory
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&Texture> {
        self.textures.try_get(handle)
    }

    /// Every texture still reachable through the fingerprint table or the resolve list.
    pub fn resident_textures(&self) -> impl Iterator<Item = (TextureHandle, &Texture)> + '_ {
        self.textures
            .iter()
            .filter(|(_, tex)| tex.residency != Residency::PendingDelete)
    }

    pub fn pending_delete_count(&self) -> usize {
        self.pending_delete.len()
    }

    pub fn pending_descriptor_sets(&self) -> usize {
        self.descriptors.pending_len()
    }

    pub fn staging(&self) -> &StagingRing {
        self.upload.staging()
    }

    pub fn stats(&self) -> CacheStats {
        let upload = self.upload.stats();
        CacheStats {
            forced_submissions: upload.forced_submissions,
            upload_bytes: upload.bytes_staged,
            resident_textures: (self.by_fingerprint.len() + self.resolve_textures.len()) as u64,
            ..self.stats
        }
    }

    /// Textures that may be sampled: resident, uploaded, and not invalidated.
    fn sampleable_textures(&self) -> impl Iterator<Item = (TextureHandle, &Texture)> + '_ {
        self.resident_textures()
            .filter(|(_, tex)| tex.complete && !tex.is_pending_invalidation())
    }

    /// Find a resident texture covering `width`x`height` texels of `format` at `address`.
    ///
    /// An exact base/size/format match wins with a zero offset. Otherwise the texture containing
    /// the region is returned with the region's offset inside it. Ties go to the most recently
    /// created texture.
    pub fn lookup_address(
        &self,
        address: u64,
        width: u32,
        height: u32,
        format: GuestFormat,
    ) -> Option<(TextureHandle, TextureOffset)> {
        let exact = self
            .sampleable_textures()
            .filter(|(_, tex)| {
                tex.info.guest_address == address
                    && tex.info.width == width
                    && tex.info.height == height
                    && tex.info.format == format
            })
            .max_by_key(|(_, tex)| tex.created_serial);
        if let Some((handle, _)) = exact {
            return Some((handle, TextureOffset::default()));
        }

        self.sampleable_textures()
            .filter_map(|(handle, tex)| {
                let offset = tex.info.locate(address, width, height, format)?;
                Some((handle, offset, tex.created_serial))
            })
            .max_by_key(|&(_, _, serial)| serial)
            .map(|(handle, offset, _)| (handle, offset))
    }

    /// Return the texture for `info`, creating and uploading it on a miss.
    ///
    /// `Ok(None)` is an expected outcome: a miss without a command buffer to record the upload
    /// into, or a texture that could not be made sampleable (unsupported format, failed upload,
    /// memory still exhausted after reclaiming). The upload may force a submission, in which case
    /// `cmd` is replaced by a fresh command buffer.
    pub fn demand(
        &mut self,
        info: &TextureInfo,
        mut cmd: Option<&mut CommandBuffer>,
    ) -> Result<Option<TextureHandle>, TextureCacheError> {
        let fingerprint = info.fingerprint();
        if let Some(&handle) = self.by_fingerprint.get(&fingerprint) {
            match self.textures.try_get_mut(handle) {
                Some(tex) if !tex.is_pending_invalidation() => {
                    self.stats.texture_hits += 1;
                    if !tex.complete {
                        return Ok(None);
                    }
                    if let Some(cmd) = cmd.as_deref() {
                        tex.mark_used(cmd.fence);
                    }
                    return Ok(Some(handle));
                }
                _ => {
                    trace!(fingerprint, "cached texture invalidated since last use");
                    self.evict(handle);
                    self.by_fingerprint.remove(&fingerprint);
                }
            }
        }

        if let Some(handle) = self.promote_resolve_texture(info, fingerprint, cmd.as_deref_mut())? {
            self.stats.texture_hits += 1;
            if let (Some(cmd), Some(tex)) = (cmd.as_deref(), self.textures.try_get_mut(handle)) {
                tex.mark_used(cmd.fence);
            }
            return Ok(Some(handle));
        }

        self.stats.texture_misses += 1;
        let Some(cmd) = cmd.as_deref_mut() else {
            trace!(
                address = info.guest_address,
                "texture miss without a command buffer"
            );
            return Ok(None);
        };

        let Some(host_format) = info.format.host_format() else {
            warn!(
                address = info.guest_address,
                format = ?info.format,
                "guest texture format has no host equivalent; texture skipped"
            );
            self.stats.upload_failures += 1;
            return Ok(None);
        };
        if let Err(err) = info.validate() {
            warn!(address = info.guest_address, %err, "invalid texture description");
            self.stats.upload_failures += 1;
            return Ok(None);
        }

        let desc = ImageDesc {
            label: Some(format!("guest texture {:#x}", info.guest_address)),
            format: host_format,
            dimension: info.dimension,
            width: info.width,
            height: info.height,
            mip_levels: info.mip_levels,
            usage: ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED,
        };
        let Some(handle) =
            self.create_texture(*info, desc, Residency::Cached, true, Some(&mut *cmd))?
        else {
            return Ok(None);
        };
        let image = self.textures.get(handle)?.image;

        // The watch is already registered: guest writes racing the upload invalidate it.
        let result = self
            .upload
            .upload_texture(&mut self.gpu, &*self.memory, cmd, image, info);

        let tex = self.textures.get_mut(handle)?;
        tex.mark_used(cmd.fence);
        match result {
            Ok(()) => {
                tex.complete = true;
                tex.layout = ImageLayout::ShaderReadOnly;
                self.stats.uploads += 1;
                Ok(Some(handle))
            }
            Err(err) if err.is_fatal() => Err(err.into()),
            Err(err) => {
                warn!(
                    address = info.guest_address,
                    %err,
                    "texture upload failed; texture left incomplete"
                );
                self.stats.upload_failures += 1;
                Ok(None)
            }
        }
    }

    /// A resolve texture described exactly by `info` becomes an ordinary cached texture.
    ///
    /// An image the resolve writer has not left sampleable is transitioned on `cmd`; without a
    /// command buffer such a texture is not promoted.
    fn promote_resolve_texture(
        &mut self,
        info: &TextureInfo,
        fingerprint: u64,
        cmd: Option<&mut CommandBuffer>,
    ) -> Result<Option<TextureHandle>, TextureCacheError> {
        let Some((position, handle)) = self
            .resolve_textures
            .iter()
            .enumerate()
            .filter_map(|(position, &handle)| {
                let tex = self.textures.try_get(handle)?;
                (tex.info == *info && !tex.is_pending_invalidation()).then_some((
                    position,
                    handle,
                    tex.created_serial,
                ))
            })
            .max_by_key(|&(_, _, serial)| serial)
            .map(|(position, handle, _)| (position, handle))
        else {
            return Ok(None);
        };

        let tex = self.textures.get_mut(handle)?;
        if tex.layout != ImageLayout::ShaderReadOnly {
            let Some(cmd) = cmd else {
                trace!(
                    address = info.guest_address,
                    layout = ?tex.layout,
                    "resolve texture not yet sampleable"
                );
                return Ok(None);
            };
            self.gpu
                .cmd_transition_image(cmd.id, tex.image, tex.layout, ImageLayout::ShaderReadOnly)?;
            tex.layout = ImageLayout::ShaderReadOnly;
        }

        self.resolve_textures.remove(position);
        if let Some(watch) = tex.watch.take() {
            self.memory.unwatch(watch);
        }
        tex.residency = Residency::Cached;
        tex.is_full_texture = true;
        self.by_fingerprint.insert(fingerprint, handle);
        self.watch_texture(handle, InvalidationKind::Texture);
        debug!(
            address = info.guest_address,
            "promoted resolve texture to cached texture"
        );
        Ok(Some(handle))
    }

    /// Record the layout the resolve writer left a resolve texture's image in.
    ///
    /// Resolve textures are created in [`ImageLayout::Undefined`] and the cache never writes
    /// them; whoever resolves into the image owns its transitions and reports the result here.
    pub fn mark_resolved(
        &mut self,
        handle: TextureHandle,
        layout: ImageLayout,
    ) -> Result<(), TextureCacheError> {
        let tex = self
            .textures
            .try_get_mut(handle)
            .ok_or(TextureCacheError::StaleTexture)?;
        tex.layout = layout;
        Ok(())
    }

    /// Return a texture backing the resolve region, reusing a resolve texture that already
    /// contains it.
    ///
    /// The returned offset locates the region inside the texture and must be applied to sample
    /// coordinates. Resolve textures are never uploaded from guest memory; their content comes
    /// from the resolve itself.
    pub fn demand_resolve_texture(
        &mut self,
        address: u64,
        width: u32,
        height: u32,
        format: GuestFormat,
    ) -> Result<Option<(TextureHandle, TextureOffset)>, TextureCacheError> {
        self.process_resolve_invalidations();

        let existing = self
            .resolve_textures
            .iter()
            .filter_map(|&handle| {
                let tex = self.textures.try_get(handle)?;
                if tex.is_pending_invalidation() {
                    return None;
                }
                let offset = tex.info.locate(address, width, height, format)?;
                Some((handle, offset, tex.created_serial))
            })
            .max_by_key(|&(_, _, serial)| serial);
        if let Some((handle, offset, _)) = existing {
            trace!(address, ?offset, "reusing resolve texture");
            return Ok(Some((handle, offset)));
        }

        let info = TextureInfo::resolve_target(address, width, height, format);
        let Some(host_format) = format.host_format() else {
            warn!(address, ?format, "resolve format has no host equivalent");
            return Ok(None);
        };
        if let Err(err) = info.validate() {
            warn!(address, %err, "invalid resolve region");
            return Ok(None);
        }
        let desc = ImageDesc {
            label: Some(format!("resolve target {address:#x}")),
            format: host_format,
            dimension: info.dimension,
            width,
            height,
            mip_levels: 1,
            usage: ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED | ImageUsage::COLOR_TARGET,
        };
        let Some(handle) = self.create_texture(info, desc, Residency::Resolve, false, None)? else {
            return Ok(None);
        };
        self.textures.get_mut(handle)?.complete = true;
        Ok(Some((handle, TextureOffset::default())))
    }

    fn create_texture(
        &mut self,
        info: TextureInfo,
        desc: ImageDesc,
        residency: Residency,
        is_full_texture: bool,
        cmd: Option<&mut CommandBuffer>,
    ) -> Result<Option<TextureHandle>, TextureCacheError> {
        if !self.gpu.supports_format(desc.format) {
            warn!(
                address = info.guest_address,
                format = ?desc.format,
                "host device cannot sample format; texture skipped"
            );
            self.stats.upload_failures += 1;
            return Ok(None);
        }
        let Some(allocation) = self.allocate_image(&desc, cmd)? else {
            return Ok(None);
        };
        let image = match self
            .gpu
            .create_image(&desc, allocation.memory, allocation.offset)
        {
            Ok(image) => image,
            Err(GpuError::Unsupported(what)) => {
                self.images.free(&allocation);
                warn!(
                    address = info.guest_address,
                    what,
                    "image creation unsupported; texture skipped"
                );
                self.stats.upload_failures += 1;
                return Ok(None);
            }
            Err(err) => {
                self.images.free(&allocation);
                return Err(err.into());
            }
        };

        self.next_serial += 1;
        let fingerprint = info.fingerprint();
        let handle = self.textures.insert(Texture {
            info,
            fingerprint,
            host_format: desc.format,
            image,
            layout: ImageLayout::Undefined,
            allocation,
            is_full_texture,
            complete: false,
            residency,
            watch: None,
            pending_invalidation: Arc::new(AtomicBool::new(false)),
            last_use: None,
            ref_count: 0,
            views: Vec::new(),
            created_serial: self.next_serial,
        });
        match residency {
            Residency::Cached => {
                self.by_fingerprint.insert(fingerprint, handle);
                self.watch_texture(handle, InvalidationKind::Texture);
            }
            Residency::Resolve => {
                self.resolve_textures.push(handle);
                self.watch_texture(handle, InvalidationKind::Resolve);
            }
            Residency::PendingDelete => self.pending_delete.push(handle),
        }
        self.stats.textures_created += 1;
        debug!(
            address = info.guest_address,
            width = info.width,
            height = info.height,
            format = ?info.format,
            ?residency,
            pool = allocation.pool,
            offset = allocation.offset,
            "created texture"
        );
        Ok(Some(handle))
    }

    /// Place an image in pool memory. Exhausted pools are reclaimed once (forcing a submission
    /// when a command buffer is available) before giving up.
    fn allocate_image(
        &mut self,
        desc: &ImageDesc,
        cmd: Option<&mut CommandBuffer>,
    ) -> Result<Option<ImageAllocation>, TextureCacheError> {
        let requirements = self.gpu.image_memory_requirements(desc);
        match self.images.allocate(&mut self.gpu, requirements) {
            Ok(allocation) => return Ok(Some(allocation)),
            Err(AllocError::PoolExhausted { requested, pools }) => {
                debug!(requested, pools, "image pools exhausted; reclaiming");
            }
            Err(AllocError::Gpu(err)) => return Err(err.into()),
            Err(err) => {
                warn!(%err, "image does not fit the pool policy");
                return Ok(None);
            }
        }

        if let Some(cmd) = cmd {
            self.upload.submit_and_wait(&mut self.gpu, cmd)?;
        }
        self.scavenge()?;
        match self.images.allocate(&mut self.gpu, requirements) {
            Ok(allocation) => Ok(Some(allocation)),
            Err(AllocError::Gpu(err)) => Err(err.into()),
            Err(err) => {
                warn!(%err, "image memory still exhausted after reclaiming");
                Ok(None)
            }
        }
    }

    fn watch_texture(&mut self, handle: TextureHandle, kind: InvalidationKind) {
        let Some(tex) = self.textures.try_get_mut(handle) else {
            return;
        };
        let callback =
            self.invalidation
                .notifier(kind, handle, Arc::clone(&tex.pending_invalidation));
        tex.watch = Some(self.memory.watch(tex.info.guest_range(), callback));
    }

    /// Move a texture to the pending-delete list and drop its watch.
    fn evict(&mut self, handle: TextureHandle) -> bool {
        let Some(tex) = self.textures.try_get_mut(handle) else {
            return false;
        };
        match tex.residency {
            Residency::PendingDelete => return false,
            Residency::Cached => {
                if self.by_fingerprint.get(&tex.fingerprint) == Some(&handle) {
                    self.by_fingerprint.remove(&tex.fingerprint);
                }
            }
            Residency::Resolve => self.resolve_textures.retain(|&h| h != handle),
        }
        if let Some(watch) = tex.watch.take() {
            self.memory.unwatch(watch);
        }
        tex.residency = Residency::PendingDelete;
        self.pending_delete.push(handle);
        self.stats.evictions += 1;
        debug!(
            address = tex.info.guest_address,
            fingerprint = tex.fingerprint,
            ref_count = tex.ref_count,
            "evicted texture"
        );
        true
    }

    fn drain_invalidations(&mut self, kind: InvalidationKind) -> usize {
        let batch = self.invalidation.take(kind);
        let mut evicted = 0;
        for &handle in &batch {
            if self.evict(handle) {
                evicted += 1;
            }
        }
        self.invalidation.recycle(kind, batch);
        if evicted > 0 {
            debug!(?kind, evicted, "processed invalidations");
        }
        evicted
    }

    /// Evict every texture whose guest memory was written since the last pass.
    pub fn process_invalidations(&mut self) -> usize {
        self.drain_invalidations(InvalidationKind::Texture)
    }

    pub fn process_resolve_invalidations(&mut self) -> usize {
        self.drain_invalidations(InvalidationKind::Resolve)
    }

    /// Evict every texture in the fingerprint table.
    pub fn invalidate_all(&mut self) -> usize {
        let handles: Vec<_> = self.by_fingerprint.values().copied().collect();
        handles.into_iter().filter(|&h| self.evict(h)).count()
    }

    pub fn invalidate_resolve_textures(&mut self) -> usize {
        let handles = self.resolve_textures.clone();
        handles.into_iter().filter(|&h| self.evict(h)).count()
    }

    /// Reclaim signalled descriptor sets, then free evicted textures that are no longer
    /// referenced and whose last fence has signalled, then release finished staging space.
    ///
    /// Returns the number of textures freed.
    pub fn scavenge(&mut self) -> Result<usize, TextureCacheError> {
        let mut reclaimed_sets = 0;
        while let Some(done) = self.descriptors.pop_signaled(&mut self.gpu) {
            for &handle in &done.textures {
                if let Some(tex) = self.textures.try_get_mut(handle) {
                    tex.ref_count = tex.ref_count.saturating_sub(1);
                }
            }
            self.descriptors.recycle(done.set);
            reclaimed_sets += 1;
        }
        self.stats.descriptor_sets_reclaimed += reclaimed_sets;

        let mut freed = 0;
        let mut index = 0;
        while index < self.pending_delete.len() {
            let handle = self.pending_delete[index];
            let releasable = match self.textures.try_get(handle) {
                None => true,
                Some(tex) => {
                    tex.ref_count == 0
                        && tex
                            .last_use
                            .map_or(true, |fence| self.gpu.fence_signaled(fence))
                }
            };
            if !releasable {
                index += 1;
                continue;
            }
            self.pending_delete.swap_remove(index);
            if self.textures.contains(handle) {
                self.free_texture(handle)?;
                freed += 1;
            }
        }

        let staging = self.upload.reclaim(&mut self.gpu);
        if freed > 0 || reclaimed_sets > 0 {
            debug!(
                freed,
                reclaimed_sets,
                staging_bytes = staging,
                pending_delete = self.pending_delete.len(),
                "scavenged texture cache"
            );
        }
        Ok(freed)
    }

    fn free_texture(&mut self, handle: TextureHandle) -> Result<(), TextureCacheError> {
        let tex = self.textures.remove(handle)?;
        if let Some(watch) = tex.watch {
            self.memory.unwatch(watch);
        }
        let address = tex.info.guest_address;
        let allocation = tex.destroy(&mut self.gpu)?;
        self.images.free(&allocation);
        self.stats.textures_freed += 1;
        trace!(address, "freed texture");
        Ok(())
    }

    /// One maintenance pass: drain both invalidation buffers, then scavenge.
    pub fn maintain(&mut self) -> Result<usize, TextureCacheError> {
        self.process_invalidations();
        self.process_resolve_invalidations();
        self.scavenge()
    }

    /// Destroy every texture, sampler and descriptor set immediately.
    ///
    /// The caller must guarantee that no submitted or recording command buffer references any
    /// of them (e.g. after a device reset); fences are not consulted.
    pub fn clear_cache(&mut self) -> Result<(), TextureCacheError> {
        self.descriptors.clear(&mut self.gpu)?;
        let mut destroyed = 0;
        for handle in self.textures.ids() {
            let tex = self.textures.remove(handle)?;
            if let Some(watch) = tex.watch {
                self.memory.unwatch(watch);
            }
            tex.destroy(&mut self.gpu)?;
            destroyed += 1;
        }
        self.images.release_all(&mut self.gpu)?;
        self.samplers.clear(&mut self.gpu)?;
        self.by_fingerprint.clear();
        self.resolve_textures.clear();
        self.pending_delete.clear();
        self.invalidation.clear();
        self.upload.reset_staging();
        debug!(destroyed, "cleared texture cache");
        Ok(())
    }

    /// Destroy every host object the cache owns, including the staging buffer, and drop it.
    ///
    /// Dropping a cache only unregisters its guest memory watches: it cannot wait for the device,
    /// so host objects outlive it unless released here. The same precondition as
    /// [`Self::clear_cache`] applies.
    pub fn shutdown(mut self) -> Result<(), TextureCacheError> {
        self.clear_cache()?;
        self.upload.release(&mut self.gpu)?;
        debug!("texture cache shut down");
        Ok(())
    }

    /// View of `handle` with `swizzle`, created on first request.
    pub fn demand_view(
        &mut self,
        handle: TextureHandle,
        swizzle: Swizzle,
    ) -> Result<ImageViewId, TextureCacheError> {
        let tex = self
            .textures
            .try_get_mut(handle)
            .ok_or(TextureCacheError::StaleTexture)?;
        let (view, created) = tex.demand_view(&mut self.gpu, swizzle)?;
        if created {
            self.stats.views_created += 1;
            trace!(?handle, ?swizzle, ?view, "created texture view");
        }
        Ok(view)
    }

    pub fn demand_sampler(&mut self, info: &SamplerInfo) -> Result<SamplerId, TextureCacheError> {
        let (sampler, created) = self.samplers.demand(&mut self.gpu, info)?;
        if created {
            self.stats.samplers_created += 1;
        }
        Ok(sampler)
    }

    /// Resolve one shader stage's bindings into `update`.
    ///
    /// Fetch constants already present in `update` (e.g. written by the other stage) are
    /// skipped, as are slots that do not describe a texture. Returns `Ok(false)` when a texture
    /// cannot be made available; the draw must not be submitted and the caller should
    /// [`Self::discard_bindings`].
    pub fn setup_texture_bindings(
        &mut self,
        update: &mut UpdateSet,
        mut cmd: Option<&mut CommandBuffer>,
        bindings: &[TextureBinding],
        fetch: &dyn FetchConstantSource,
    ) -> Result<bool, TextureCacheError> {
        for binding in bindings {
            let index = binding.fetch_constant;
            if index >= self.descriptors.max_bindings() {
                debug!(
                    fetch_constant = index,
                    stage = ?binding.stage,
                    "fetch constant outside descriptor set"
                );
                continue;
            }
            if update.is_written(index) {
                continue;
            }
            let Some(constant) = fetch.texture_fetch(index) else {
                debug!(fetch_constant = index, "fetch constant unavailable");
                continue;
            };
            let Some(info) = constant.texture_info() else {
                debug!(
                    fetch_constant = index,
                    stage = ?binding.stage,
                    "fetch constant does not describe a texture; binding skipped"
                );
                continue;
            };

            let Some(handle) = self.demand(&info, cmd.as_deref_mut())? else {
                debug!(
                    fetch_constant = index,
                    stage = ?binding.stage,
                    address = info.guest_address,
                    "texture not available for binding"
                );
                return Ok(false);
            };
            let view = self.demand_view(handle, binding.swizzle.compose(constant.swizzle()))?;
            let sampler = self.demand_sampler(&constant.sampler_info())?;
            if let Some(tex) = self.textures.try_get_mut(handle) {
                tex.ref_count += 1;
            }
            update.push(
                DescriptorImageWrite {
                    binding: index,
                    view,
                    sampler,
                },
                handle,
            );
        }
        Ok(true)
    }

    /// Drop the references an unfinished `update` holds.
    pub fn discard_bindings(&mut self, update: &mut UpdateSet) {
        for handle in update.take_textures() {
            if let Some(tex) = self.textures.try_get_mut(handle) {
                tex.ref_count = tex.ref_count.saturating_sub(1);
            }
        }
    }

    /// Write `update` into a descriptor set that stays pending until `fence` signals.
    pub fn finish_bindings(
        &mut self,
        update: &mut UpdateSet,
        fence: Fence,
    ) -> Result<DescriptorSetId, TextureCacheError> {
        let set = self.descriptors.acquire(&mut self.gpu)?;
        if let Err(err) = self.gpu.update_descriptor_set(set, update.writes()) {
            self.descriptors.recycle(set);
            self.discard_bindings(update);
            return Err(err.into());
        }
        let writes = update.writes().len();
        let textures = update.take_textures();
        for &handle in &textures {
            if let Some(tex) = self.textures.try_get_mut(handle) {
                tex.mark_used(fence);
            }
        }
        self.descriptors.enqueue(PendingDescriptorSet {
            set,
            fence,
            textures,
        });
        trace!(?set, fence = fence.0, writes, "descriptor set pending");
        Ok(set)
    }

    /// Bind the textures of both shader stages of one draw recorded on `cmd`.
    ///
    /// Returns `Ok(None)` when a texture is unavailable; the draw must be skipped.
    pub fn prepare_bindings(
        &mut self,
        cmd: &mut CommandBuffer,
        fetch: &dyn FetchConstantSource,
        vertex: &[TextureBinding],
        pixel: &[TextureBinding],
    ) -> Result<Option<DescriptorSetId>, TextureCacheError> {
        let mut update = UpdateSet::new();
        for bindings in [vertex, pixel] {
            match self.setup_texture_bindings(&mut update, Some(&mut *cmd), bindings, fetch) {
                Ok(true) => {}
                Ok(false) => {
                    self.discard_bindings(&mut update);
                    return Ok(None);
                }
                Err(err) => {
                    self.discard_bindings(&mut update);
                    return Err(err);
                }
            }
        }
        self.finish_bindings(&mut update, cmd.fence).map(Some)
    }
}

/// Unregisters watches only; see [`TextureCache::shutdown`] for releasing host objects.
impl<G: HostGpu, M: GuestMemory + MemoryWatcher> Drop for TextureCache<G, M> {
    fn drop(&mut self) {
        for (_, tex) in self.textures.iter() {
            if let Some(watch) = tex.watch {
                self.memory.unwatch(watch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Endian;
    use crate::guest::VecGuestMemory;
    use crate::info::TextureDimension;
    use crate::software::SoftwareGpu;

    fn cache() -> TextureCache<SoftwareGpu, VecGuestMemory> {
        let memory = Arc::new(VecGuestMemory::new(1 << 20));
        TextureCache::new(SoftwareGpu::new(), memory, TextureCacheConfig::default()).unwrap()
    }

    fn rgba(address: u64, size: u32) -> TextureInfo {
        TextureInfo {
            guest_address: address,
            dimension: TextureDimension::D2,
            width: size,
            height: size,
            pitch: size,
            mip_levels: 1,
            mip_address: 0,
            format: GuestFormat::K8_8_8_8,
            endian: Endian::None,
            tiled: false,
        }
    }

    #[test]
    fn miss_without_command_buffer_is_not_an_error() {
        let mut cache = cache();
        assert_eq!(cache.demand(&rgba(0x1000, 8), None).unwrap(), None);
        assert_eq!(cache.stats().texture_misses, 1);
        assert_eq!(cache.gpu().image_count(), 0);
    }

    #[test]
    fn stale_hit_is_evicted_and_reuploaded() {
        let mut cache = cache();
        let info = rgba(0x1000, 8);
        let mut cmd = cache.gpu_mut().begin_command_buffer().unwrap();
        let first = cache.demand(&info, Some(&mut cmd)).unwrap().unwrap();

        cache.memory().write(0x1000, &[1, 2, 3, 4]).unwrap();
        assert!(cache.texture(first).unwrap().is_pending_invalidation());

        // No maintenance pass ran; demand notices the flag itself.
        let second = cache.demand(&info, Some(&mut cmd)).unwrap().unwrap();
        assert_ne!(first, second);
        assert_eq!(
            cache.texture(first).unwrap().residency(),
            Residency::PendingDelete
        );
        assert_eq!(cache.stats().uploads, 2);
        // The queued notification for the old texture is a no-op now.
        assert_eq!(cache.process_invalidations(), 0);
    }

    #[test]
    fn unsupported_formats_are_skipped() {
        let mut cache = cache();
        let mut info = rgba(0x1000, 8);
        info.format = GuestFormat::Ctx1;
        let mut cmd = cache.gpu_mut().begin_command_buffer().unwrap();
        assert_eq!(cache.demand(&info, Some(&mut cmd)).unwrap(), None);
        assert_eq!(cache.stats().upload_failures, 1);
    }

    #[test]
    fn resolve_texture_is_promoted_by_matching_demand() {
        let mut cache = cache();
        let (resolve, _) = cache
            .demand_resolve_texture(0x8000, 64, 64, GuestFormat::K8_8_8_8)
            .unwrap()
            .unwrap();
        assert!(!cache.texture(resolve).unwrap().is_full_texture());

        let info = TextureInfo::resolve_target(0x8000, 64, 64, GuestFormat::K8_8_8_8);
        // Not sampleable yet and no command buffer to transition it on.
        assert_eq!(cache.demand(&info, None).unwrap(), None);
        assert_eq!(
            cache.texture(resolve).unwrap().residency(),
            Residency::Resolve
        );

        cache
            .mark_resolved(resolve, ImageLayout::ShaderReadOnly)
            .unwrap();
        let promoted = cache.demand(&info, None).unwrap();
        assert_eq!(promoted, Some(resolve));
        let tex = cache.texture(resolve).unwrap();
        assert!(tex.is_full_texture());
        assert_eq!(tex.residency(), Residency::Cached);
        assert_eq!(cache.memory().watch_count(), 1);
        assert_eq!(cache.stats().uploads, 0);
    }
}
