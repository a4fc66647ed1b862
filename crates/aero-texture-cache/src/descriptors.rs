//! Per-draw descriptor assembly and fence-gated descriptor set reuse.

use std::collections::VecDeque;

use crate::error::GpuError;
use crate::hal::{DescriptorImageWrite, DescriptorSetId, Fence, HostGpu};
use crate::swizzle::Swizzle;
use crate::texture::TextureHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

/// One texture sampled by a shader, as reported by shader reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureBinding {
    pub fetch_constant: u32,
    /// Channel selection the shader applies on top of the fetch constant's own swizzle.
    pub swizzle: Swizzle,
    pub stage: ShaderStage,
}

/// Accumulates the descriptor writes of one draw across both shader stages.
///
/// Each fetch constant is written at most once no matter how many bindings (in either stage)
/// reference it. Textures recorded here hold a reference until the set is finished or
/// discarded.
#[derive(Debug, Default)]
pub struct UpdateSet {
    written_mask: u32,
    writes: Vec<DescriptorImageWrite>,
    textures: Vec<TextureHandle>,
}

impl UpdateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_written(&self, fetch_constant: u32) -> bool {
        fetch_constant < 32 && self.written_mask & (1 << fetch_constant) != 0
    }

    pub fn written_mask(&self) -> u32 {
        self.written_mask
    }

    pub fn writes(&self) -> &[DescriptorImageWrite] {
        &self.writes
    }

    pub fn textures(&self) -> &[TextureHandle] {
        &self.textures
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub(crate) fn push(&mut self, write: DescriptorImageWrite, texture: TextureHandle) {
        debug_assert!(!self.is_written(write.binding));
        self.written_mask |= 1 << write.binding;
        self.writes.push(write);
        self.textures.push(texture);
    }

    pub(crate) fn take_textures(&mut self) -> Vec<TextureHandle> {
        self.written_mask = 0;
        self.writes.clear();
        std::mem::take(&mut self.textures)
    }
}

/// A descriptor set the GPU may still be reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDescriptorSet {
    pub set: DescriptorSetId,
    pub fence: Fence,
    pub textures: Vec<TextureHandle>,
}

/// Hands out descriptor sets and takes them back once their fence has signalled.
///
/// Sets are reclaimed strictly in the order they were enqueued; fences on the single queue
/// signal in that order, so the first unsignalled set ends the walk.
pub struct DescriptorAllocator {
    max_bindings: u32,
    free: Vec<DescriptorSetId>,
    pending: VecDeque<PendingDescriptorSet>,
}

impl DescriptorAllocator {
    pub fn new(max_bindings: u32) -> Self {
        Self {
            max_bindings,
            free: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn max_bindings(&self) -> u32 {
        self.max_bindings
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingDescriptorSet> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn acquire(&mut self, gpu: &mut dyn HostGpu) -> Result<DescriptorSetId, GpuError> {
        match self.free.pop() {
            Some(set) => Ok(set),
            None => gpu.allocate_descriptor_set(self.max_bindings),
        }
    }

    pub fn enqueue(&mut self, pending: PendingDescriptorSet) {
        debug_assert!(self
            .pending
            .back()
            .map_or(true, |last| last.fence <= pending.fence));
        self.pending.push_back(pending);
    }

    /// Remove the oldest pending set if its fence has signalled.
    pub fn pop_signaled(&mut self, gpu: &mut dyn HostGpu) -> Option<PendingDescriptorSet> {
        let oldest = self.pending.front()?;
        if !gpu.fence_signaled(oldest.fence) {
            return None;
        }
        self.pending.pop_front()
    }

    /// Make a reclaimed set available to [`Self::acquire`] again.
    pub fn recycle(&mut self, set: DescriptorSetId) {
        self.free.push(set);
    }

    /// Free every set, pending or not, without looking at fences.
    pub fn clear(&mut self, gpu: &mut dyn HostGpu) -> Result<(), GpuError> {
        for pending in self.pending.drain(..) {
            gpu.free_descriptor_set(pending.set)?;
        }
        for set in self.free.drain(..) {
            gpu.free_descriptor_set(set)?;
        }
        Ok(())
    }
}
