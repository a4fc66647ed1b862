//! Guest texel data to host image uploads.
//!
//! Every subresource is read from guest memory, byte-swapped, detiled and converted into a
//! staging allocation whose rows honour the host copy alignment, then copied into the image by
//! a `cmd_copy_buffer_to_image` recorded on the caller's command buffer.
//!
//! Staging memory is a fixed ring. When it cannot satisfy a request the pipeline submits the
//! caller's command buffer, waits for it, and continues on a fresh one, so staging use is bounded
//! by the ring size instead of growing with the amount of pending upload work.

use tracing::{debug, trace};

use crate::allocator::{align_up, StagingRing};
use crate::error::{GpuError, UploadError};
use crate::format::{convert_row, tiled_block_offset, Endian, HostFormat, TILE_BLOCKS};
use crate::guest::GuestMemory;
use crate::hal::{BufferImageCopy, CommandBuffer, HostGpu, ImageId, ImageLayout};
use crate::info::{GuestSubresource, TextureDimension, TextureInfo};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub textures: u64,
    pub subresources: u64,
    pub bytes_staged: u64,
    pub forced_submissions: u64,
}

pub struct UploadPipeline {
    ring: StagingRing,
    row_alignment: u64,
    guest_bytes: Vec<u8>,
    row: Vec<u8>,
    staged: Vec<u8>,
    stats: UploadStats,
}

impl UploadPipeline {
    pub fn new(ring: StagingRing, row_alignment: u64) -> Self {
        Self {
            ring,
            row_alignment: row_alignment.max(1),
            guest_bytes: Vec::new(),
            row: Vec::new(),
            staged: Vec::new(),
            stats: UploadStats::default(),
        }
    }

    pub fn stats(&self) -> UploadStats {
        self.stats
    }

    pub fn staging(&self) -> &StagingRing {
        &self.ring
    }

    /// Release staging space whose consuming submission has finished.
    pub fn reclaim(&mut self, gpu: &mut dyn HostGpu) -> u64 {
        self.ring.reclaim(gpu)
    }

    pub fn reset_staging(&mut self) {
        self.ring.reset();
    }

    pub fn release(&mut self, gpu: &mut dyn HostGpu) -> Result<(), GpuError> {
        self.ring.release(gpu)
    }

    /// Submit `cmd`, wait for it, and replace it with a freshly begun command buffer.
    pub fn submit_and_wait(
        &mut self,
        gpu: &mut dyn HostGpu,
        cmd: &mut CommandBuffer,
    ) -> Result<(), GpuError> {
        let fence = gpu.submit(cmd.id)?;
        gpu.wait_fence(fence)?;
        self.ring.reclaim(gpu);
        *cmd = gpu.begin_command_buffer()?;
        self.stats.forced_submissions += 1;
        debug!(
            submitted = fence.0,
            next = cmd.fence.0,
            "forced submission to make progress"
        );
        Ok(())
    }

    /// Upload every subresource of `info` into `image`, dispatching on the texture dimension.
    pub fn upload_texture(
        &mut self,
        gpu: &mut dyn HostGpu,
        guest: &dyn GuestMemory,
        cmd: &mut CommandBuffer,
        image: ImageId,
        info: &TextureInfo,
    ) -> Result<(), UploadError> {
        match info.dimension {
            TextureDimension::D2 => self.upload_texture_2d(gpu, guest, cmd, image, info),
            TextureDimension::Cube => self.upload_texture_cube(gpu, guest, cmd, image, info),
        }
    }

    pub fn upload_texture_2d(
        &mut self,
        gpu: &mut dyn HostGpu,
        guest: &dyn GuestMemory,
        cmd: &mut CommandBuffer,
        image: ImageId,
        info: &TextureInfo,
    ) -> Result<(), UploadError> {
        if info.dimension != TextureDimension::D2 {
            return Err(UploadError::InvalidGeometry(
                "2D upload of a non-2D texture".into(),
            ));
        }
        self.upload(gpu, guest, cmd, image, info)
    }

    pub fn upload_texture_cube(
        &mut self,
        gpu: &mut dyn HostGpu,
        guest: &dyn GuestMemory,
        cmd: &mut CommandBuffer,
        image: ImageId,
        info: &TextureInfo,
    ) -> Result<(), UploadError> {
        if info.dimension != TextureDimension::Cube {
            return Err(UploadError::InvalidGeometry(
                "cube upload of a non-cube texture".into(),
            ));
        }
        self.upload(gpu, guest, cmd, image, info)
    }

    fn upload(
        &mut self,
        gpu: &mut dyn HostGpu,
        guest: &dyn GuestMemory,
        cmd: &mut CommandBuffer,
        image: ImageId,
        info: &TextureInfo,
    ) -> Result<(), UploadError> {
        let host_format = info
            .format
            .host_format()
            .ok_or(UploadError::UnsupportedFormat(info.format))?;
        let layout = info.guest_layout()?;

        // Reject before recording anything so a failed texture leaves no commands behind.
        for sub in &layout {
            let (_, staged_size) = self.staged_extent(info, host_format, sub);
            if staged_size > self.ring.capacity() {
                return Err(UploadError::StagingTooSmall {
                    required: staged_size,
                    capacity: self.ring.capacity(),
                });
            }
        }

        gpu.cmd_transition_image(
            cmd.id,
            image,
            ImageLayout::Undefined,
            ImageLayout::TransferDst,
        )?;
        for sub in &layout {
            self.upload_subresource(gpu, guest, cmd, image, info, host_format, sub)?;
        }
        gpu.cmd_transition_image(
            cmd.id,
            image,
            ImageLayout::TransferDst,
            ImageLayout::ShaderReadOnly,
        )?;

        self.stats.textures += 1;
        trace!(
            address = info.guest_address,
            subresources = layout.len(),
            fence = cmd.fence.0,
            "recorded texture upload"
        );
        Ok(())
    }

    /// Aligned host row pitch and total staging bytes for one subresource.
    fn staged_extent(
        &self,
        info: &TextureInfo,
        host_format: HostFormat,
        sub: &GuestSubresource,
    ) -> (u64, u64) {
        let guest_info = info.format.info();
        let host_row = u64::from(guest_info.blocks_wide(sub.width))
            * u64::from(host_format.info().bytes_per_block);
        let pitch = align_up(host_row, self.row_alignment);
        (pitch, pitch * u64::from(guest_info.blocks_high(sub.height)))
    }

    #[allow(clippy::too_many_arguments)]
    fn upload_subresource(
        &mut self,
        gpu: &mut dyn HostGpu,
        guest: &dyn GuestMemory,
        cmd: &mut CommandBuffer,
        image: ImageId,
        info: &TextureInfo,
        host_format: HostFormat,
        sub: &GuestSubresource,
    ) -> Result<(), UploadError> {
        let (pitch, staged_size) = self.staged_extent(info, host_format, sub);
        let guest_info = info.format.info();
        let guest_bpb = guest_info.bytes_per_block as usize;
        let blocks_wide = guest_info.blocks_wide(sub.width) as usize;
        let blocks_high = guest_info.blocks_high(sub.height) as usize;
        let host_row = blocks_wide * host_format.info().bytes_per_block as usize;
        let pitch_usize = pitch as usize;

        self.staged.clear();
        self.staged.resize(staged_size as usize, 0);
        if info.tiled {
            // Only the macro-tiles covering the texture width are read from each tile row.
            let tile_blocks = TILE_BLOCKS as usize;
            let tile_bytes = (tile_blocks * tile_blocks * guest_bpb) as u64;
            let tile_row_bytes = u64::from(sub.pitch_blocks / TILE_BLOCKS) * tile_bytes;
            let tiles_wide = blocks_wide.div_ceil(tile_blocks) as u64;
            self.row.resize(blocks_wide * guest_bpb, 0);
            for tile_y in 0..blocks_high.div_ceil(tile_blocks) {
                let base = read_guest_span(
                    guest,
                    info.endian,
                    sub,
                    tile_y as u64 * tile_row_bytes,
                    tiles_wide * tile_bytes,
                    &mut self.guest_bytes,
                )?;
                let rows = tile_blocks.min(blocks_high - tile_y * tile_blocks);
                for local_y in 0..rows {
                    for x in 0..blocks_wide {
                        let offset = base
                            + tiled_block_offset(
                                x as u32,
                                local_y as u32,
                                sub.pitch_blocks,
                                guest_bpb as u32,
                            ) as usize;
                        self.row[x * guest_bpb..(x + 1) * guest_bpb]
                            .copy_from_slice(&self.guest_bytes[offset..offset + guest_bpb]);
                    }
                    let dst_start = (tile_y * tile_blocks + local_y) * pitch_usize;
                    convert_row(
                        info.format,
                        &self.row,
                        &mut self.staged[dst_start..dst_start + host_row],
                    );
                }
            }
        } else {
            let guest_row_bytes = u64::from(sub.pitch_blocks) * guest_bpb as u64;
            let used_row_bytes = blocks_wide * guest_bpb;
            for y in 0..blocks_high {
                let base = read_guest_span(
                    guest,
                    info.endian,
                    sub,
                    y as u64 * guest_row_bytes,
                    used_row_bytes as u64,
                    &mut self.guest_bytes,
                )?;
                let dst_start = y * pitch_usize;
                convert_row(
                    info.format,
                    &self.guest_bytes[base..base + used_row_bytes],
                    &mut self.staged[dst_start..dst_start + host_row],
                );
            }
        }

        let offset = self.allocate_staging(gpu, cmd, staged_size)?;
        gpu.write_buffer(self.ring.buffer(), offset, &self.staged)?;
        gpu.cmd_copy_buffer_to_image(
            cmd.id,
            &BufferImageCopy {
                buffer: self.ring.buffer(),
                buffer_offset: offset,
                bytes_per_row: pitch as u32,
                image,
                mip_level: sub.mip_level,
                array_layer: sub.array_layer,
                width: sub.width,
                height: sub.height,
            },
        )?;
        self.stats.subresources += 1;
        self.stats.bytes_staged += staged_size;
        Ok(())
    }

    fn allocate_staging(
        &mut self,
        gpu: &mut dyn HostGpu,
        cmd: &mut CommandBuffer,
        size: u64,
    ) -> Result<u64, UploadError> {
        if let Some(offset) = self.ring.allocate(size, cmd.fence) {
            return Ok(offset);
        }
        if self.ring.reclaim(gpu) > 0 {
            if let Some(offset) = self.ring.allocate(size, cmd.fence) {
                return Ok(offset);
            }
        }

        debug!(
            requested = size,
            in_flight = self.ring.bytes_in_flight(),
            capacity = self.ring.capacity(),
            "staging ring exhausted"
        );
        self.submit_and_wait(gpu, cmd)?;
        self.ring
            .allocate(size, cmd.fence)
            .ok_or(UploadError::StagingTooSmall {
                required: size,
                capacity: self.ring.capacity(),
            })
    }
}

/// Read `len` bytes at `offset` into the subresource and byte-swap them into `buf`.
///
/// Swap words stay aligned to the subresource base, so the span is widened to whole words and
/// the returned index is where the requested bytes start inside `buf`. Reads are bounded by the
/// texel data actually used, never by the guest pitch.
fn read_guest_span(
    guest: &dyn GuestMemory,
    endian: Endian,
    sub: &GuestSubresource,
    offset: u64,
    len: u64,
    buf: &mut Vec<u8>,
) -> Result<usize, UploadError> {
    let start = offset & !3;
    let end = (offset + len).next_multiple_of(4).min(sub.size);
    buf.clear();
    buf.resize((end - start) as usize, 0);
    guest.read(sub.address + start, buf)?;
    endian.apply(buf);
    Ok((offset - start) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::format::GuestFormat;
    use crate::guest::{GuestMemoryError, VecGuestMemory};
    use crate::hal::{ImageDesc, ImageUsage};
    use crate::software::SoftwareGpu;

    fn pipeline(gpu: &mut SoftwareGpu, staging: u64) -> UploadPipeline {
        let ring = StagingRing::new(gpu, staging, 256).unwrap();
        UploadPipeline::new(ring, 256)
    }

    fn create_image(gpu: &mut SoftwareGpu, info: &TextureInfo) -> ImageId {
        let desc = ImageDesc {
            label: None,
            format: info.format.host_format().unwrap(),
            dimension: info.dimension,
            width: info.width,
            height: info.height,
            mip_levels: info.mip_levels,
            usage: ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED,
        };
        let size = gpu.image_memory_requirements(&desc).size;
        let memory = gpu.allocate_memory(size).unwrap();
        gpu.create_image(&desc, memory, 0).unwrap()
    }

    fn info(format: GuestFormat, width: u32, height: u32, tiled: bool) -> TextureInfo {
        TextureInfo {
            guest_address: 0x1000,
            dimension: TextureDimension::D2,
            width,
            height,
            pitch: if tiled { width.next_multiple_of(32) } else { width },
            mip_levels: 1,
            mip_address: 0,
            format,
            endian: Endian::None,
            tiled,
        }
    }

    fn upload_and_submit(
        gpu: &mut SoftwareGpu,
        pipeline: &mut UploadPipeline,
        guest: &dyn GuestMemory,
        info: &TextureInfo,
    ) -> ImageId {
        let image = create_image(gpu, info);
        let mut cmd = gpu.begin_command_buffer().unwrap();
        pipeline
            .upload_texture(gpu, guest, &mut cmd, image, info)
            .unwrap();
        gpu.submit(cmd.id).unwrap();
        image
    }

    /// Guest memory of zeros that records the length of every read.
    #[derive(Default)]
    struct RecordingGuest {
        reads: Mutex<Vec<usize>>,
    }

    impl GuestMemory for RecordingGuest {
        fn read(&self, _gpa: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
            self.reads.lock().unwrap().push(dst.len());
            dst.fill(0);
            Ok(())
        }
    }

    #[test]
    fn guest_reads_are_bounded_by_the_texels_not_the_pitch() {
        let mut gpu = SoftwareGpu::new();
        let mut pipeline = pipeline(&mut gpu, 64 * 1024);
        let guest = RecordingGuest::default();
        // Largest pitch a fetch constant can encode, over a narrow 64-bit texture.
        let mut tex = info(GuestFormat::K16_16_16_16Float, 4, 64, false);
        tex.pitch = 0xFFF * 32;
        assert!(tex.guest_size() > 32 * 1024 * 1024);

        upload_and_submit(&mut gpu, &mut pipeline, &guest, &tex);
        let reads = guest.reads.lock().unwrap();
        assert_eq!(reads.len(), 64);
        assert!(reads.iter().all(|&len| len == 4 * 8));
    }

    #[test]
    fn tiled_reads_cover_only_the_used_tiles() {
        let mut gpu = SoftwareGpu::new();
        let mut pipeline = pipeline(&mut gpu, 64 * 1024);
        let guest = RecordingGuest::default();
        let mut tex = info(GuestFormat::K8_8_8_8, 8, 40, true);
        tex.pitch = 0xFFF * 32;

        upload_and_submit(&mut gpu, &mut pipeline, &guest, &tex);
        // Two tile rows, one 32x32 tile of 4-byte blocks each.
        assert_eq!(*guest.reads.lock().unwrap(), vec![4096, 4096]);
    }

    #[test]
    fn linear_rows_are_repacked_to_host_pitch() {
        let mut gpu = SoftwareGpu::new();
        let mut pipeline = pipeline(&mut gpu, 4096);
        let guest = VecGuestMemory::new(0x4000);
        let mut tex = info(GuestFormat::K8_8_8_8, 2, 2, false);
        tex.pitch = 4;
        // Two rows of 4 texels; only the first 2 texels of each row belong to the texture.
        let bytes: Vec<u8> = (0..32).collect();
        guest.write(0x1000, &bytes).unwrap();

        let image = upload_and_submit(&mut gpu, &mut pipeline, &guest, &tex);
        let mut expected: Vec<u8> = (0..8).collect();
        expected.extend(16..24);
        assert_eq!(gpu.image_bytes(image, 0, 0).unwrap(), expected.as_slice());
        assert_eq!(gpu.image_layout(image), Some(ImageLayout::ShaderReadOnly));
    }

    #[test]
    fn tiled_surfaces_are_detiled() {
        let mut gpu = SoftwareGpu::new();
        let mut pipeline = pipeline(&mut gpu, 64 * 1024);
        let guest = VecGuestMemory::new(0x10000);
        let tex = info(GuestFormat::K8, 64, 2, true);
        // Each block stores its own x coordinate so the detiled image is easy to predict.
        let mut bytes = vec![0u8; 64 * 32];
        for y in 0..2 {
            for x in 0..64 {
                bytes[tiled_block_offset(x, y, 64, 1) as usize] = (x + 100 * y) as u8;
            }
        }
        guest.write(0x1000, &bytes).unwrap();

        let image = upload_and_submit(&mut gpu, &mut pipeline, &guest, &tex);
        let expected: Vec<u8> = (0..2)
            .flat_map(|y| (0..64).map(move |x| (x + 100 * y) as u8))
            .collect();
        assert_eq!(gpu.image_bytes(image, 0, 0).unwrap(), expected.as_slice());
    }

    #[test]
    fn endian_swap_and_conversion_apply_before_copy() {
        let mut gpu = SoftwareGpu::new();
        let mut pipeline = pipeline(&mut gpu, 4096);
        let guest = VecGuestMemory::new(0x4000);
        let mut tex = info(GuestFormat::K5_6_5, 1, 1, false);
        tex.endian = Endian::Swap8In16;
        // Big-endian pure blue.
        guest.write(0x1000, &[0x00, 0x1F]).unwrap();

        let image = upload_and_submit(&mut gpu, &mut pipeline, &guest, &tex);
        assert_eq!(gpu.image_bytes(image, 0, 0).unwrap(), &[0, 0, 0xFF, 0xFF]);
    }

    #[test]
    fn unsupported_format_records_nothing() {
        let mut gpu = SoftwareGpu::new();
        let mut pipeline = pipeline(&mut gpu, 4096);
        let guest = VecGuestMemory::new(0x4000);
        let tex = info(GuestFormat::Dxn, 4, 4, false);
        let image = create_image(&mut gpu, &info(GuestFormat::K8_8_8_8, 4, 4, false));
        let mut cmd = gpu.begin_command_buffer().unwrap();
        let err = pipeline
            .upload_texture(&mut gpu, &guest, &mut cmd, image, &tex)
            .unwrap_err();
        assert_eq!(err, UploadError::UnsupportedFormat(GuestFormat::Dxn));
        assert!(!err.is_fatal());
        gpu.submit(cmd.id).unwrap();
        assert_eq!(gpu.counters().copies, 0);
    }

    #[test]
    fn oversized_subresource_reports_staging_too_small() {
        let mut gpu = SoftwareGpu::new();
        let mut pipeline = pipeline(&mut gpu, 1024);
        let guest = VecGuestMemory::new(0x10000);
        let tex = info(GuestFormat::K8_8_8_8, 16, 16, false);
        let image = create_image(&mut gpu, &tex);
        let mut cmd = gpu.begin_command_buffer().unwrap();
        assert_eq!(
            pipeline.upload_texture(&mut gpu, &guest, &mut cmd, image, &tex),
            Err(UploadError::StagingTooSmall {
                required: 16 * 256,
                capacity: 1024
            })
        );
    }

    #[test]
    fn release_destroys_the_staging_buffer() {
        let mut gpu = SoftwareGpu::new();
        let mut pipeline = pipeline(&mut gpu, 4096);
        let buffer = pipeline.staging().buffer();
        pipeline.release(&mut gpu).unwrap();
        assert!(gpu.write_buffer(buffer, 0, &[0]).is_err());
    }

    #[test]
    fn dimension_specific_entry_points_check_the_dimension() {
        let mut gpu = SoftwareGpu::new();
        let mut pipeline = pipeline(&mut gpu, 4096);
        let guest = VecGuestMemory::new(0x4000);
        let tex = info(GuestFormat::K8, 4, 4, false);
        let image = create_image(&mut gpu, &tex);
        let mut cmd = gpu.begin_command_buffer().unwrap();
        assert!(matches!(
            pipeline.upload_texture_cube(&mut gpu, &guest, &mut cmd, image, &tex),
            Err(UploadError::InvalidGeometry(_))
        ));
    }
}
