//! CPU implementation of [`HostGpu`].
//!
//! Images are plain byte vectors (one per subresource, tightly packed), command buffers are
//! recorded op lists that execute when submitted, and fences complete either at submission or
//! when the owner says so. This makes it possible to observe exactly what the cache asked the
//! host to do without a GPU adapter.

use std::ops::Range;

use crate::error::GpuError;
use crate::format::HostFormat;
use crate::hal::*;

/// Copy offsets and row pitches must be multiples of this, matching WebGPU's row alignment.
pub const SOFTWARE_COPY_ALIGNMENT: u32 = 256;

const IMAGE_ALIGNMENT: u64 = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareCounters {
    pub images_created: u64,
    pub images_destroyed: u64,
    pub views_created: u64,
    pub views_destroyed: u64,
    pub samplers_created: u64,
    pub copies: u64,
    pub submissions: u64,
    pub waits: u64,
    pub descriptor_sets_allocated: u64,
    pub descriptor_set_updates: u64,
}

struct SoftwareImage {
    desc: ImageDesc,
    memory: MemoryId,
    range: Range<u64>,
    layout: ImageLayout,
    subresources: Vec<Vec<u8>>,
}

impl SoftwareImage {
    fn subresource_index(&self, mip_level: u32, array_layer: u32) -> Option<usize> {
        if mip_level >= self.desc.mip_levels || array_layer >= self.desc.array_layers() {
            return None;
        }
        Some((mip_level * self.desc.array_layers() + array_layer) as usize)
    }
}

enum RecordedOp {
    Transition {
        image: ImageId,
        from: ImageLayout,
        to: ImageLayout,
    },
    Copy(BufferImageCopy),
}

struct Recording {
    fence: Fence,
    ops: Vec<RecordedOp>,
}

struct SoftwareDescriptorSet {
    max_bindings: u32,
    writes: Vec<DescriptorImageWrite>,
}

pub struct SoftwareGpu {
    caps: HostCapabilities,
    memory: ResourceRegistry<MemoryTag, u64>,
    buffers: ResourceRegistry<BufferTag, Vec<u8>>,
    images: ResourceRegistry<ImageTag, SoftwareImage>,
    views: ResourceRegistry<ImageViewTag, (ImageId, ImageViewDesc)>,
    samplers: ResourceRegistry<SamplerTag, SamplerDesc>,
    command_buffers: ResourceRegistry<CommandBufferTag, Recording>,
    descriptor_sets: ResourceRegistry<DescriptorSetTag, SoftwareDescriptorSet>,
    next_fence: u64,
    submitted: u64,
    completed: u64,
    auto_complete: bool,
    unsupported_formats: Vec<HostFormat>,
    counters: SoftwareCounters,
}

impl Default for SoftwareGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareGpu {
    pub fn new() -> Self {
        Self {
            caps: HostCapabilities {
                copy_row_pitch_alignment: SOFTWARE_COPY_ALIGNMENT,
                max_image_dimension: 8192,
            },
            memory: ResourceRegistry::new("memory"),
            buffers: ResourceRegistry::new("buffer"),
            images: ResourceRegistry::new("image"),
            views: ResourceRegistry::new("image_view"),
            samplers: ResourceRegistry::new("sampler"),
            command_buffers: ResourceRegistry::new("command_buffer"),
            descriptor_sets: ResourceRegistry::new("descriptor_set"),
            next_fence: 0,
            submitted: 0,
            completed: 0,
            auto_complete: true,
            unsupported_formats: Vec::new(),
            counters: SoftwareCounters::default(),
        }
    }

    /// When disabled, submitted work stays in flight until [`Self::complete_fence`] or a
    /// [`HostGpu::wait_fence`] on it.
    pub fn set_auto_complete(&mut self, auto_complete: bool) {
        self.auto_complete = auto_complete;
    }

    /// Toggle availability of `format`, like a device with or without the matching feature.
    pub fn set_format_supported(&mut self, format: HostFormat, supported: bool) {
        self.unsupported_formats.retain(|&f| f != format);
        if !supported {
            self.unsupported_formats.push(format);
        }
    }

    /// Mark every submission up to and including `fence` as finished.
    pub fn complete_fence(&mut self, fence: Fence) {
        self.completed = self.completed.max(fence.0.min(self.submitted));
    }

    pub fn complete_all(&mut self) {
        self.completed = self.submitted;
    }

    pub fn completed_fence(&self) -> Fence {
        Fence(self.completed)
    }

    pub fn counters(&self) -> SoftwareCounters {
        self.counters
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn sampler_count(&self) -> usize {
        self.samplers.len()
    }

    pub fn descriptor_set_count(&self) -> usize {
        self.descriptor_sets.len()
    }

    pub fn memory_allocation_count(&self) -> usize {
        self.memory.len()
    }

    pub fn image_exists(&self, image: ImageId) -> bool {
        self.images.contains(image)
    }

    pub fn image_layout(&self, image: ImageId) -> Option<ImageLayout> {
        self.images.try_get(image).map(|img| img.layout)
    }

    pub fn image_desc(&self, image: ImageId) -> Option<&ImageDesc> {
        self.images.try_get(image).map(|img| &img.desc)
    }

    /// Contents of one subresource, tightly packed in block rows.
    pub fn image_bytes(&self, image: ImageId, mip_level: u32, array_layer: u32) -> Option<&[u8]> {
        let img = self.images.try_get(image)?;
        let index = img.subresource_index(mip_level, array_layer)?;
        Some(&img.subresources[index])
    }

    pub fn view_desc(&self, view: ImageViewId) -> Option<ImageViewDesc> {
        self.views.try_get(view).map(|(_, desc)| *desc)
    }

    pub fn descriptor_writes(&self, set: DescriptorSetId) -> Option<&[DescriptorImageWrite]> {
        self.descriptor_sets
            .try_get(set)
            .map(|set| set.writes.as_slice())
    }

    fn execute(&mut self, op: RecordedOp) -> Result<(), GpuError> {
        match op {
            RecordedOp::Transition { image, from, to } => {
                let img = self.images.get_mut(image)?;
                if from != ImageLayout::Undefined && img.layout != from {
                    return Err(GpuError::Backend(format!(
                        "image {image:?} transitioned from {from:?} but is in {:?}",
                        img.layout
                    )));
                }
                img.layout = to;
            }
            RecordedOp::Copy(copy) => {
                let buffer = self.buffers.get(copy.buffer)?;
                let img = self.images.get_mut(copy.image)?;
                if img.layout != ImageLayout::TransferDst {
                    return Err(GpuError::Backend(format!(
                        "copy into image {:?} in layout {:?}",
                        copy.image, img.layout
                    )));
                }
                let index = img
                    .subresource_index(copy.mip_level, copy.array_layer)
                    .ok_or_else(|| GpuError::Backend("copy subresource out of range".into()))?;
                let expected_w = (img.desc.width >> copy.mip_level).max(1);
                let expected_h = (img.desc.height >> copy.mip_level).max(1);
                if copy.width != expected_w || copy.height != expected_h {
                    return Err(GpuError::Backend(format!(
                        "partial subresource copy {}x{} into {expected_w}x{expected_h}",
                        copy.width, copy.height
                    )));
                }

                let info = img.desc.format.info();
                let row_bytes = (info.blocks_wide(copy.width) * info.bytes_per_block) as usize;
                let rows = info.blocks_high(copy.height) as usize;
                if (copy.bytes_per_row as usize) < row_bytes {
                    return Err(GpuError::Backend(format!(
                        "bytes_per_row {} smaller than row size {row_bytes}",
                        copy.bytes_per_row
                    )));
                }
                let src_end = rows.checked_sub(1).map_or(0, |last| {
                    copy.buffer_offset as usize + last * copy.bytes_per_row as usize + row_bytes
                });
                if src_end > buffer.len() {
                    return Err(GpuError::Backend("copy source out of buffer bounds".into()));
                }
                let dst = &mut img.subresources[index];
                for row in 0..rows {
                    let src_start = copy.buffer_offset as usize + row * copy.bytes_per_row as usize;
                    let src = buffer.get(src_start..src_start + row_bytes).ok_or_else(|| {
                        GpuError::Backend("copy source out of buffer bounds".into())
                    })?;
                    dst[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(src);
                }
                self.counters.copies += 1;
            }
        }
        Ok(())
    }
}

impl HostGpu for SoftwareGpu {
    fn capabilities(&self) -> HostCapabilities {
        self.caps
    }

    fn supports_format(&self, format: HostFormat) -> bool {
        !self.unsupported_formats.contains(&format)
    }

    fn allocate_memory(&mut self, size: u64) -> Result<MemoryId, GpuError> {
        if size == 0 {
            return Err(GpuError::Backend("zero-sized memory allocation".into()));
        }
        Ok(self.memory.insert(size))
    }

    fn free_memory(&mut self, memory: MemoryId) -> Result<(), GpuError> {
        if self.images.iter().any(|(_, img)| img.memory == memory) {
            return Err(GpuError::Backend(format!(
                "memory {memory:?} freed while images are bound to it"
            )));
        }
        self.memory.remove(memory)?;
        Ok(())
    }

    fn image_memory_requirements(&self, desc: &ImageDesc) -> MemoryRequirements {
        let size = (0..desc.mip_levels)
            .map(|level| desc.subresource_size(level) * u64::from(desc.array_layers()))
            .sum();
        MemoryRequirements {
            size,
            alignment: IMAGE_ALIGNMENT,
        }
    }

    fn create_image(
        &mut self,
        desc: &ImageDesc,
        memory: MemoryId,
        offset: u64,
    ) -> Result<ImageId, GpuError> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 {
            return Err(GpuError::Backend("create_image with empty extent".into()));
        }
        if !self.supports_format(desc.format) {
            return Err(GpuError::Unsupported("image format"));
        }
        if desc.width.max(desc.height) > self.caps.max_image_dimension {
            return Err(GpuError::Backend(format!(
                "image {}x{} exceeds max dimension {}",
                desc.width, desc.height, self.caps.max_image_dimension
            )));
        }
        let reqs = self.image_memory_requirements(desc);
        let memory_size = *self.memory.get(memory)?;
        if offset % reqs.alignment != 0 || offset + reqs.size > memory_size {
            return Err(GpuError::Backend(format!(
                "image binding at offset {offset} (size {}) invalid for {memory_size}-byte memory",
                reqs.size
            )));
        }
        let range = offset..offset + reqs.size;
        if let Some((other, _)) = self
            .images
            .iter()
            .find(|(_, img)| {
                img.memory == memory && img.range.start < range.end && range.start < img.range.end
            })
        {
            return Err(GpuError::Backend(format!(
                "image memory {range:?} overlaps live image {other:?}"
            )));
        }

        let subresources = (0..desc.mip_levels)
            .flat_map(|level| {
                let size = desc.subresource_size(level) as usize;
                (0..desc.array_layers()).map(move |_| vec![0u8; size])
            })
            .collect();
        self.counters.images_created += 1;
        Ok(self.images.insert(SoftwareImage {
            desc: desc.clone(),
            memory,
            range,
            layout: ImageLayout::Undefined,
            subresources,
        }))
    }

    fn destroy_image(&mut self, image: ImageId) -> Result<(), GpuError> {
        if self.views.iter().any(|(_, (owner, _))| *owner == image) {
            return Err(GpuError::Backend(format!(
                "image {image:?} destroyed while views are alive"
            )));
        }
        self.images.remove(image)?;
        self.counters.images_destroyed += 1;
        Ok(())
    }

    fn create_image_view(
        &mut self,
        image: ImageId,
        desc: &ImageViewDesc,
    ) -> Result<ImageViewId, GpuError> {
        self.images.get(image)?;
        self.counters.views_created += 1;
        Ok(self.views.insert((image, *desc)))
    }

    fn destroy_image_view(&mut self, view: ImageViewId) -> Result<(), GpuError> {
        self.views.remove(view)?;
        self.counters.views_destroyed += 1;
        Ok(())
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, GpuError> {
        self.counters.samplers_created += 1;
        Ok(self.samplers.insert(*desc))
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) -> Result<(), GpuError> {
        self.samplers.remove(sampler)?;
        Ok(())
    }

    fn create_staging_buffer(&mut self, size: u64) -> Result<BufferId, GpuError> {
        let size = usize::try_from(size).map_err(|_| GpuError::OutOfMemory)?;
        Ok(self.buffers.insert(vec![0u8; size]))
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<(), GpuError> {
        self.buffers.remove(buffer)?;
        Ok(())
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        let buf = self.buffers.get_mut(buffer)?;
        let start = offset as usize;
        let dst = buf
            .get_mut(start..start + data.len())
            .ok_or_else(|| GpuError::Backend("write_buffer out of bounds".into()))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn begin_command_buffer(&mut self) -> Result<CommandBuffer, GpuError> {
        self.next_fence += 1;
        let fence = Fence(self.next_fence);
        let id = self.command_buffers.insert(Recording {
            fence,
            ops: Vec::new(),
        });
        Ok(CommandBuffer { id, fence })
    }

    fn cmd_transition_image(
        &mut self,
        cmd: CommandBufferId,
        image: ImageId,
        from: ImageLayout,
        to: ImageLayout,
    ) -> Result<(), GpuError> {
        self.images.get(image)?;
        let recording = self.command_buffers.get_mut(cmd)?;
        recording
            .ops
            .push(RecordedOp::Transition { image, from, to });
        Ok(())
    }

    fn cmd_copy_buffer_to_image(
        &mut self,
        cmd: CommandBufferId,
        copy: &BufferImageCopy,
    ) -> Result<(), GpuError> {
        let align = u64::from(self.caps.copy_row_pitch_alignment);
        if copy.buffer_offset % align != 0 || u64::from(copy.bytes_per_row) % align != 0 {
            return Err(GpuError::Backend(format!(
                "copy offset {} / bytes_per_row {} not {align}-byte aligned",
                copy.buffer_offset, copy.bytes_per_row
            )));
        }
        self.buffers.get(copy.buffer)?;
        self.images.get(copy.image)?;
        let recording = self.command_buffers.get_mut(cmd)?;
        recording.ops.push(RecordedOp::Copy(*copy));
        Ok(())
    }

    fn submit(&mut self, cmd: CommandBufferId) -> Result<Fence, GpuError> {
        let fence = self.command_buffers.get(cmd)?.fence;
        if fence.0 != self.submitted + 1 {
            return Err(GpuError::Backend(format!(
                "command buffer with fence {} submitted out of order (last submitted {})",
                fence.0, self.submitted
            )));
        }
        let recording = self.command_buffers.remove(cmd)?;
        // The fence is consumed even if an op is rejected, so later submissions keep their order.
        self.submitted = fence.0;
        if self.auto_complete {
            self.completed = fence.0;
        }
        self.counters.submissions += 1;
        for op in recording.ops {
            self.execute(op)?;
        }
        Ok(fence)
    }

    fn fence_signaled(&mut self, fence: Fence) -> bool {
        fence.0 <= self.completed
    }

    fn wait_fence(&mut self, fence: Fence) -> Result<(), GpuError> {
        if fence.0 > self.submitted {
            return Err(GpuError::Backend(format!(
                "wait on fence {} which has not been submitted",
                fence.0
            )));
        }
        self.completed = self.completed.max(fence.0);
        self.counters.waits += 1;
        Ok(())
    }

    fn allocate_descriptor_set(&mut self, max_bindings: u32) -> Result<DescriptorSetId, GpuError> {
        self.counters.descriptor_sets_allocated += 1;
        Ok(self.descriptor_sets.insert(SoftwareDescriptorSet {
            max_bindings,
            writes: Vec::new(),
        }))
    }

    fn update_descriptor_set(
        &mut self,
        set: DescriptorSetId,
        writes: &[DescriptorImageWrite],
    ) -> Result<(), GpuError> {
        for write in writes {
            self.views.get(write.view)?;
            self.samplers.get(write.sampler)?;
        }
        let entry = self.descriptor_sets.get_mut(set)?;
        if let Some(write) = writes.iter().find(|w| w.binding >= entry.max_bindings) {
            return Err(GpuError::Backend(format!(
                "binding {} exceeds descriptor set capacity {}",
                write.binding, entry.max_bindings
            )));
        }
        entry.writes = writes.to_vec();
        self.counters.descriptor_set_updates += 1;
        Ok(())
    }

    fn free_descriptor_set(&mut self, set: DescriptorSetId) -> Result<(), GpuError> {
        self.descriptor_sets.remove(set)?;
        Ok(())
    }
}
