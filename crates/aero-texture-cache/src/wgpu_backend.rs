use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::GpuError;
use crate::format::HostFormat;
use crate::hal::*;
use crate::info::TextureDimension;

#[derive(Debug)]
struct StoredImage {
    texture: wgpu::Texture,
    desc: ImageDesc,
    memory: MemoryId,
}

#[derive(Debug)]
struct StoredMemory {
    size: u64,
    bound_images: u32,
}

struct Recording {
    encoder: wgpu::CommandEncoder,
    fence: Fence,
}

/// `wgpu` implementation of [`HostGpu`].
///
/// WebGPU has no explicit memory binding or layout transitions. Memory objects are only tracked
/// for their size and bindings, and transitions are validated but otherwise ignored. Fences are
/// submission serials completed from `Queue::on_submitted_work_done`.
///
/// WebGPU views cannot remap channels, so every view samples its image unswizzled; the shader
/// translator applies the swizzle instead.
pub struct WgpuGpu {
    device: wgpu::Device,
    queue: wgpu::Queue,
    caps: HostCapabilities,
    supports_bc: bool,

    memory: ResourceRegistry<MemoryTag, StoredMemory>,
    buffers: ResourceRegistry<BufferTag, wgpu::Buffer>,
    images: ResourceRegistry<ImageTag, StoredImage>,
    views: ResourceRegistry<ImageViewTag, wgpu::TextureView>,
    samplers: ResourceRegistry<SamplerTag, wgpu::Sampler>,
    command_buffers: ResourceRegistry<CommandBufferTag, Recording>,
    descriptor_sets: ResourceRegistry<DescriptorSetTag, Vec<DescriptorImageWrite>>,

    next_fence: u64,
    submitted: u64,
    completed: Arc<AtomicU64>,
}

impl WgpuGpu {
    /// Creates a backend without a presentation surface.
    pub async fn new_headless() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY | wgpu::Backends::GL,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| GpuError::Backend("no suitable wgpu adapter found".into()))?;

        let supports_bc = adapter
            .features()
            .contains(wgpu::Features::TEXTURE_COMPRESSION_BC);
        let required_features = if supports_bc {
            wgpu::Features::TEXTURE_COMPRESSION_BC
        } else {
            wgpu::Features::empty()
        };
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("aero texture cache"),
                    required_features,
                    required_limits: wgpu::Limits::downlevel_defaults(),
                },
                None,
            )
            .await
            .map_err(|err| GpuError::Backend(err.to_string()))?;

        Ok(Self::from_device(device, queue))
    }

    /// Blocking wrapper around [`Self::new_headless`].
    pub fn new_headless_blocking() -> Result<Self, GpuError> {
        pollster::block_on(Self::new_headless())
    }

    /// Wrap an existing device. Block-compressed formats are available only if the device was
    /// created with `TEXTURE_COMPRESSION_BC`.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let caps = HostCapabilities {
            copy_row_pitch_alignment: wgpu::COPY_BYTES_PER_ROW_ALIGNMENT,
            max_image_dimension: device.limits().max_texture_dimension_2d,
        };
        let supports_bc = device
            .features()
            .contains(wgpu::Features::TEXTURE_COMPRESSION_BC);
        Self {
            device,
            queue,
            caps,
            supports_bc,
            memory: ResourceRegistry::new("memory"),
            buffers: ResourceRegistry::new("buffer"),
            images: ResourceRegistry::new("image"),
            views: ResourceRegistry::new("image_view"),
            samplers: ResourceRegistry::new("sampler"),
            command_buffers: ResourceRegistry::new("command_buffer"),
            descriptor_sets: ResourceRegistry::new("descriptor_set"),
            next_fence: 0,
            submitted: 0,
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn texture(&self, image: ImageId) -> Option<&wgpu::Texture> {
        self.images.try_get(image).map(|stored| &stored.texture)
    }

    pub fn texture_view(&self, view: ImageViewId) -> Option<&wgpu::TextureView> {
        self.views.try_get(view)
    }

    pub fn sampler(&self, sampler: SamplerId) -> Option<&wgpu::Sampler> {
        self.samplers.try_get(sampler)
    }

    /// Entries of a descriptor set, for building the bind group of a draw.
    pub fn descriptor_writes(
        &self,
        set: DescriptorSetId,
    ) -> Result<&[DescriptorImageWrite], GpuError> {
        self.descriptor_sets.get(set).map(Vec::as_slice)
    }

    fn map_format(&self, format: HostFormat) -> Result<wgpu::TextureFormat, GpuError> {
        let mapped = match format {
            HostFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
            HostFormat::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
            HostFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            HostFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            HostFormat::R32Float => wgpu::TextureFormat::R32Float,
            HostFormat::Bc1RgbaUnorm => wgpu::TextureFormat::Bc1RgbaUnorm,
            HostFormat::Bc2RgbaUnorm => wgpu::TextureFormat::Bc2RgbaUnorm,
            HostFormat::Bc3RgbaUnorm => wgpu::TextureFormat::Bc3RgbaUnorm,
        };
        if format.is_compressed() && !self.supports_bc {
            return Err(GpuError::Unsupported("BC texture compression"));
        }
        Ok(mapped)
    }

    fn map_usage(usage: ImageUsage) -> wgpu::TextureUsages {
        let mut out = wgpu::TextureUsages::empty();
        if usage.contains(ImageUsage::TRANSFER_DST) {
            out |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(ImageUsage::SAMPLED) {
            out |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(ImageUsage::COLOR_TARGET) {
            out |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        out
    }

    fn map_address_mode(mode: AddressMode) -> wgpu::AddressMode {
        match mode {
            AddressMode::Repeat => wgpu::AddressMode::Repeat,
            AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
            // Neither mirror-once nor border colours are core WebGPU.
            AddressMode::ClampToEdge
            | AddressMode::MirrorClampToEdge
            | AddressMode::ClampToBorder => wgpu::AddressMode::ClampToEdge,
        }
    }

    fn map_filter(filter: Filter) -> wgpu::FilterMode {
        match filter {
            Filter::Nearest => wgpu::FilterMode::Nearest,
            Filter::Linear => wgpu::FilterMode::Linear,
        }
    }

    fn check_recording(&self, cmd: CommandBufferId) -> Result<(), GpuError> {
        self.command_buffers.get(cmd).map(|_| ())
    }

    fn poll(&self, maintain: wgpu::Maintain) {
        // Completion is observed through the work-done callbacks.
        let _ = self.device.poll(maintain);
    }
}

impl HostGpu for WgpuGpu {
    fn capabilities(&self) -> HostCapabilities {
        self.caps
    }

    fn supports_format(&self, format: HostFormat) -> bool {
        self.map_format(format).is_ok()
    }

    fn allocate_memory(&mut self, size: u64) -> Result<MemoryId, GpuError> {
        Ok(self.memory.insert(StoredMemory {
            size,
            bound_images: 0,
        }))
    }

    fn free_memory(&mut self, memory: MemoryId) -> Result<(), GpuError> {
        if self.memory.get(memory)?.bound_images != 0 {
            return Err(GpuError::Backend(
                "free_memory called while images are still bound".into(),
            ));
        }
        self.memory.remove(memory).map(|_| ())
    }

    fn image_memory_requirements(&self, desc: &ImageDesc) -> MemoryRequirements {
        let size = (0..desc.mip_levels)
            .map(|level| desc.subresource_size(level) * u64::from(desc.array_layers()))
            .sum();
        MemoryRequirements {
            size,
            alignment: u64::from(wgpu::COPY_BUFFER_ALIGNMENT),
        }
    }

    fn create_image(
        &mut self,
        desc: &ImageDesc,
        memory: MemoryId,
        offset: u64,
    ) -> Result<ImageId, GpuError> {
        let required = self.image_memory_requirements(desc).size;
        let stored_memory = self.memory.get(memory)?;
        if offset
            .checked_add(required)
            .map_or(true, |end| end > stored_memory.size)
        {
            return Err(GpuError::Backend(format!(
                "image of {required} bytes at offset {offset} exceeds memory of {} bytes",
                stored_memory.size
            )));
        }
        if desc.width > self.caps.max_image_dimension || desc.height > self.caps.max_image_dimension
        {
            return Err(GpuError::Unsupported("image dimension exceeds device limit"));
        }
        let format = self.map_format(desc.format)?;
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.array_layers(),
            },
            mip_level_count: desc.mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: Self::map_usage(desc.usage),
            view_formats: &[],
        });
        self.memory.get_mut(memory)?.bound_images += 1;
        Ok(self.images.insert(StoredImage {
            texture,
            desc: desc.clone(),
            memory,
        }))
    }

    fn destroy_image(&mut self, image: ImageId) -> Result<(), GpuError> {
        let stored = self.images.remove(image)?;
        stored.texture.destroy();
        if let Some(memory) = self.memory.try_get_mut(stored.memory) {
            memory.bound_images = memory.bound_images.saturating_sub(1);
        }
        Ok(())
    }

    fn create_image_view(
        &mut self,
        image: ImageId,
        desc: &ImageViewDesc,
    ) -> Result<ImageViewId, GpuError> {
        let stored = self.images.get(image)?;
        let dimension = match desc.dimension {
            TextureDimension::D2 => wgpu::TextureViewDimension::D2,
            TextureDimension::Cube => wgpu::TextureViewDimension::Cube,
        };
        let view = stored.texture.create_view(&wgpu::TextureViewDescriptor {
            label: stored.desc.label.as_deref(),
            dimension: Some(dimension),
            ..Default::default()
        });
        Ok(self.views.insert(view))
    }

    fn destroy_image_view(&mut self, view: ImageViewId) -> Result<(), GpuError> {
        self.views.remove(view).map(|_| ())
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, GpuError> {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("aero texture cache sampler"),
            address_mode_u: Self::map_address_mode(desc.address_mode_u),
            address_mode_v: Self::map_address_mode(desc.address_mode_v),
            address_mode_w: Self::map_address_mode(desc.address_mode_w),
            mag_filter: Self::map_filter(desc.mag_filter),
            min_filter: Self::map_filter(desc.min_filter),
            mipmap_filter: Self::map_filter(desc.mipmap_filter),
            ..Default::default()
        });
        Ok(self.samplers.insert(sampler))
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) -> Result<(), GpuError> {
        self.samplers.remove(sampler).map(|_| ())
    }

    fn create_staging_buffer(&mut self, size: u64) -> Result<BufferId, GpuError> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("aero texture cache staging"),
            size,
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(self.buffers.insert(buffer))
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<(), GpuError> {
        let buffer = self.buffers.remove(buffer)?;
        buffer.destroy();
        Ok(())
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        let buffer = self.buffers.get(buffer)?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::Backend("write_buffer range overflow".into()))?;
        if end > buffer.size() {
            return Err(GpuError::Backend(format!(
                "write_buffer out of bounds: end={end} size={}",
                buffer.size()
            )));
        }
        self.queue.write_buffer(buffer, offset, data);
        Ok(())
    }

    fn begin_command_buffer(&mut self) -> Result<CommandBuffer, GpuError> {
        self.next_fence += 1;
        let fence = Fence(self.next_fence);
        let encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("aero texture cache uploads"),
            });
        let id = self.command_buffers.insert(Recording { encoder, fence });
        Ok(CommandBuffer { id, fence })
    }

    fn cmd_transition_image(
        &mut self,
        cmd: CommandBufferId,
        image: ImageId,
        _from: ImageLayout,
        _to: ImageLayout,
    ) -> Result<(), GpuError> {
        self.check_recording(cmd)?;
        self.images.get(image).map(|_| ())
    }

    fn cmd_copy_buffer_to_image(
        &mut self,
        cmd: CommandBufferId,
        copy: &BufferImageCopy,
    ) -> Result<(), GpuError> {
        let buffer = self.buffers.get(copy.buffer)?;
        let image = self.images.get(copy.image)?;
        let info = image.desc.format.info();
        let rows = info.blocks_high(copy.height);
        // Compressed copies cover whole blocks, including on mips smaller than one block.
        let extent = wgpu::Extent3d {
            width: info.blocks_wide(copy.width) * info.block_width,
            height: rows * info.block_height,
            depth_or_array_layers: 1,
        };
        let recording = self.command_buffers.get_mut(cmd)?;
        recording.encoder.copy_buffer_to_texture(
            wgpu::ImageCopyBuffer {
                buffer,
                layout: wgpu::ImageDataLayout {
                    offset: copy.buffer_offset,
                    bytes_per_row: Some(copy.bytes_per_row),
                    rows_per_image: Some(rows),
                },
            },
            wgpu::ImageCopyTexture {
                texture: &image.texture,
                mip_level: copy.mip_level,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: copy.array_layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            extent,
        );
        Ok(())
    }

    fn submit(&mut self, cmd: CommandBufferId) -> Result<Fence, GpuError> {
        let fence = self.command_buffers.get(cmd)?.fence;
        if fence.0 != self.submitted + 1 {
            return Err(GpuError::Backend(format!(
                "command buffer for {fence:?} submitted out of order (last submitted {})",
                self.submitted
            )));
        }
        let recording = self.command_buffers.remove(cmd)?;
        self.queue.submit(Some(recording.encoder.finish()));
        self.submitted = fence.0;

        let completed = Arc::clone(&self.completed);
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(fence.0, Ordering::AcqRel);
        });
        Ok(fence)
    }

    fn fence_signaled(&mut self, fence: Fence) -> bool {
        if self.completed.load(Ordering::Acquire) >= fence.0 {
            return true;
        }
        self.poll(wgpu::Maintain::Poll);
        self.completed.load(Ordering::Acquire) >= fence.0
    }

    fn wait_fence(&mut self, fence: Fence) -> Result<(), GpuError> {
        if fence.0 > self.submitted {
            return Err(GpuError::Backend(format!(
                "wait on unsubmitted {fence:?} (last submitted {})",
                self.submitted
            )));
        }
        while self.completed.load(Ordering::Acquire) < fence.0 {
            self.poll(wgpu::Maintain::Wait);
        }
        Ok(())
    }

    fn allocate_descriptor_set(&mut self, max_bindings: u32) -> Result<DescriptorSetId, GpuError> {
        Ok(self
            .descriptor_sets
            .insert(Vec::with_capacity(max_bindings as usize)))
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
        let entries = self.descriptor_sets.get_mut(set)?;
        entries.clear();
        entries.extend_from_slice(writes);
        Ok(())
    }

    fn free_descriptor_set(&mut self, set: DescriptorSetId) -> Result<(), GpuError> {
        self.descriptor_sets.remove(set).map(|_| ())
    }
}
