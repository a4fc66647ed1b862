//! Boundary to the host graphics API.
//!
//! The cache talks to the host exclusively through [`HostGpu`]: explicit memory binding, explicit
//! image layout transitions, command buffer recording and fence-based completion. Backends keep
//! their objects in [`ResourceRegistry`] tables addressed by generation-checked ids.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use bitflags::bitflags;

use crate::error::GpuError;
use crate::format::HostFormat;
use crate::info::TextureDimension;
use crate::swizzle::Swizzle;

/// Index + generation handle into a [`ResourceRegistry`].
pub struct ResourceId<T> {
    index: u32,
    generation: u32,
    _tag: PhantomData<fn() -> T>,
}

impl<T> ResourceId<T> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for ResourceId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ResourceId<T> {}

impl<T> PartialEq for ResourceId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for ResourceId<T> {}

impl<T> Hash for ResourceId<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for ResourceId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

pub enum MemoryTag {}
pub enum BufferTag {}
pub enum ImageTag {}
pub enum ImageViewTag {}
pub enum SamplerTag {}
pub enum DescriptorSetTag {}
pub enum CommandBufferTag {}

pub type MemoryId = ResourceId<MemoryTag>;
pub type BufferId = ResourceId<BufferTag>;
pub type ImageId = ResourceId<ImageTag>;
pub type ImageViewId = ResourceId<ImageViewTag>;
pub type SamplerId = ResourceId<SamplerTag>;
pub type DescriptorSetId = ResourceId<DescriptorSetTag>;
pub type CommandBufferId = ResourceId<CommandBufferTag>;

struct Slot<V> {
    generation: u32,
    value: Option<V>,
}

/// Slot table handing out [`ResourceId`]s. Freed slots are reused with a bumped generation, so
/// a stale id never resolves to a newer object.
pub struct ResourceRegistry<T, V> {
    kind: &'static str,
    slots: Vec<Slot<V>>,
    free: Vec<u32>,
    len: usize,
    _tag: PhantomData<fn() -> T>,
}

impl<T, V> ResourceRegistry<T, V> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _tag: PhantomData,
        }
    }

    pub fn insert(&mut self, value: V) -> ResourceId<T> {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return ResourceId {
                index,
                generation: slot.generation,
                _tag: PhantomData,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ResourceId {
            index,
            generation: 0,
            _tag: PhantomData,
        }
    }

    fn invalid(&self, id: ResourceId<T>) -> GpuError {
        GpuError::InvalidHandle {
            kind: self.kind,
            index: id.index,
            generation: id.generation,
        }
    }

    pub fn contains(&self, id: ResourceId<T>) -> bool {
        self.try_get(id).is_some()
    }

    pub fn try_get(&self, id: ResourceId<T>) -> Option<&V> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn try_get_mut(&mut self, id: ResourceId<T>) -> Option<&mut V> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn get(&self, id: ResourceId<T>) -> Result<&V, GpuError> {
        self.try_get(id).ok_or_else(|| self.invalid(id))
    }

    pub fn get_mut(&mut self, id: ResourceId<T>) -> Result<&mut V, GpuError> {
        let err = self.invalid(id);
        self.try_get_mut(id).ok_or(err)
    }

    pub fn remove(&mut self, id: ResourceId<T>) -> Result<V, GpuError> {
        let err = self.invalid(id);
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or_else(|| err.clone())?;
        let value = slot.value.take().ok_or(err)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceId<T>, &V)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    ResourceId {
                        index: index as u32,
                        generation: slot.generation,
                        _tag: PhantomData,
                    },
                    value,
                )
            })
        })
    }

    pub fn ids(&self) -> Vec<ResourceId<T>> {
        self.iter().map(|(id, _)| id).collect()
    }
}

/// Submission serial signalled when a command buffer finishes executing.
///
/// Fences are handed out in [`HostGpu::begin_command_buffer`] order and command buffers must be
/// submitted in that same order on the single queue, so `Fence(n)` signalled implies every
/// `Fence(m)` with `m < n` is signalled too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fence(pub u64);

/// A command buffer in the recording state together with the fence its submission signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBuffer {
    pub id: CommandBufferId,
    pub fence: Fence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    #[default]
    Undefined,
    TransferDst,
    ShaderReadOnly,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const TRANSFER_DST = 1 << 0;
        const SAMPLED = 1 << 1;
        const COLOR_TARGET = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDesc {
    pub label: Option<String>,
    pub format: HostFormat,
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub usage: ImageUsage,
}

impl ImageDesc {
    pub fn array_layers(&self) -> u32 {
        self.dimension.array_layers()
    }

    /// Tightly packed size of one subresource.
    pub fn subresource_size(&self, mip_level: u32) -> u64 {
        let width = (self.width >> mip_level).max(1);
        let height = (self.height >> mip_level).max(1);
        self.format.info().surface_size(width, height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageViewDesc {
    pub dimension: TextureDimension,
    pub swizzle: Swizzle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Repeat,
    MirrorRepeat,
    ClampToEdge,
    MirrorClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mipmap_filter: Filter,
}

/// Buffer-to-image copy of one subresource. `bytes_per_row` is in block rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer: BufferId,
    pub buffer_offset: u64,
    pub bytes_per_row: u32,
    pub image: ImageId,
    pub mip_level: u32,
    pub array_layer: u32,
    pub width: u32,
    pub height: u32,
}

/// One combined image/sampler entry of a descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorImageWrite {
    pub binding: u32,
    pub view: ImageViewId,
    pub sampler: SamplerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Required alignment of `BufferImageCopy::bytes_per_row` and `buffer_offset`.
    pub copy_row_pitch_alignment: u32,
    pub max_image_dimension: u32,
}

/// Explicit host graphics API used by the texture cache.
pub trait HostGpu {
    fn capabilities(&self) -> HostCapabilities;
    /// Whether images of `format` can be created and sampled on this device.
    fn supports_format(&self, format: HostFormat) -> bool;

    fn allocate_memory(&mut self, size: u64) -> Result<MemoryId, GpuError>;
    fn free_memory(&mut self, memory: MemoryId) -> Result<(), GpuError>;

    fn image_memory_requirements(&self, desc: &ImageDesc) -> MemoryRequirements;
    /// Create an image bound to `memory` at `offset`.
    fn create_image(
        &mut self,
        desc: &ImageDesc,
        memory: MemoryId,
        offset: u64,
    ) -> Result<ImageId, GpuError>;
    fn destroy_image(&mut self, image: ImageId) -> Result<(), GpuError>;

    fn create_image_view(
        &mut self,
        image: ImageId,
        desc: &ImageViewDesc,
    ) -> Result<ImageViewId, GpuError>;
    fn destroy_image_view(&mut self, view: ImageViewId) -> Result<(), GpuError>;

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, GpuError>;
    fn destroy_sampler(&mut self, sampler: SamplerId) -> Result<(), GpuError>;

    fn create_staging_buffer(&mut self, size: u64) -> Result<BufferId, GpuError>;
    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<(), GpuError>;
    /// Host-visible write; the bytes are observed by copies submitted afterwards.
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8])
        -> Result<(), GpuError>;

    fn begin_command_buffer(&mut self) -> Result<CommandBuffer, GpuError>;
    fn cmd_transition_image(
        &mut self,
        cmd: CommandBufferId,
        image: ImageId,
        from: ImageLayout,
        to: ImageLayout,
    ) -> Result<(), GpuError>;
    fn cmd_copy_buffer_to_image(
        &mut self,
        cmd: CommandBufferId,
        copy: &BufferImageCopy,
    ) -> Result<(), GpuError>;
    /// Submit a recorded command buffer, returning the fence it will signal.
    fn submit(&mut self, cmd: CommandBufferId) -> Result<Fence, GpuError>;
    fn fence_signaled(&mut self, fence: Fence) -> bool;
    /// Block until `fence` has signalled. The fence must belong to a submitted command buffer.
    fn wait_fence(&mut self, fence: Fence) -> Result<(), GpuError>;

    fn allocate_descriptor_set(&mut self, max_bindings: u32)
        -> Result<DescriptorSetId, GpuError>;
    fn update_descriptor_set(
        &mut self,
        set: DescriptorSetId,
        writes: &[DescriptorImageWrite],
    ) -> Result<(), GpuError>;
    fn free_descriptor_set(&mut self, set: DescriptorSetId) -> Result<(), GpuError>;
}
