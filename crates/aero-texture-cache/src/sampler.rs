use hashbrown::HashMap;
use tracing::trace;

use crate::error::GpuError;
use crate::hal::{AddressMode, Filter, HostGpu, SamplerDesc, SamplerId};

/// Guest texture addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClampMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    MirrorClampToEdge,
    ClampToHalfway,
    MirrorClampToHalfway,
    ClampToBorder,
    MirrorClampToBorder,
}

impl ClampMode {
    pub fn from_raw(raw: u32) -> Self {
        match raw & 0x7 {
            0 => Self::Repeat,
            1 => Self::MirroredRepeat,
            2 => Self::ClampToEdge,
            3 => Self::MirrorClampToEdge,
            4 => Self::ClampToHalfway,
            5 => Self::MirrorClampToHalfway,
            6 => Self::ClampToBorder,
            _ => Self::MirrorClampToBorder,
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Repeat => 0,
            Self::MirroredRepeat => 1,
            Self::ClampToEdge => 2,
            Self::MirrorClampToEdge => 3,
            Self::ClampToHalfway => 4,
            Self::MirrorClampToHalfway => 5,
            Self::ClampToBorder => 6,
            Self::MirrorClampToBorder => 7,
        }
    }

    fn address_mode(self) -> AddressMode {
        match self {
            Self::Repeat => AddressMode::Repeat,
            Self::MirroredRepeat => AddressMode::MirrorRepeat,
            // Half-way clamping has no host equivalent; edge clamping is the closest match.
            Self::ClampToEdge | Self::ClampToHalfway => AddressMode::ClampToEdge,
            Self::MirrorClampToEdge | Self::MirrorClampToHalfway | Self::MirrorClampToBorder => {
                AddressMode::MirrorClampToEdge
            }
            Self::ClampToBorder => AddressMode::ClampToBorder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Point,
    Linear,
}

impl FilterMode {
    pub fn from_raw(raw: u32) -> Self {
        match raw & 0x3 {
            0 => Self::Point,
            _ => Self::Linear,
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Point => 0,
            Self::Linear => 1,
        }
    }

    fn filter(self) -> Filter {
        match self {
            Self::Point => Filter::Nearest,
            Self::Linear => Filter::Linear,
        }
    }
}

/// Sampler state decoded from a fetch constant. Doubles as the sampler cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerInfo {
    pub clamp_u: ClampMode,
    pub clamp_v: ClampMode,
    pub clamp_w: ClampMode,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mip_filter: FilterMode,
}

impl Default for SamplerInfo {
    fn default() -> Self {
        Self {
            clamp_u: ClampMode::Repeat,
            clamp_v: ClampMode::Repeat,
            clamp_w: ClampMode::Repeat,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mip_filter: FilterMode::Point,
        }
    }
}

impl SamplerInfo {
    pub fn to_desc(&self) -> SamplerDesc {
        SamplerDesc {
            address_mode_u: self.clamp_u.address_mode(),
            address_mode_v: self.clamp_v.address_mode(),
            address_mode_w: self.clamp_w.address_mode(),
            mag_filter: self.mag_filter.filter(),
            min_filter: self.min_filter.filter(),
            mipmap_filter: self.mip_filter.filter(),
        }
    }
}

/// Demand-created host samplers keyed by [`SamplerInfo`].
///
/// Samplers are never evicted individually; they live until [`SamplerCache::clear`].
#[derive(Default)]
pub struct SamplerCache {
    samplers: HashMap<SamplerInfo, SamplerId>,
}

impl SamplerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the sampler and whether it was created by this call.
    pub fn demand(
        &mut self,
        gpu: &mut dyn HostGpu,
        info: &SamplerInfo,
    ) -> Result<(SamplerId, bool), GpuError> {
        if let Some(&sampler) = self.samplers.get(info) {
            return Ok((sampler, false));
        }
        let sampler = gpu.create_sampler(&info.to_desc())?;
        trace!(?info, ?sampler, "created sampler");
        self.samplers.insert(*info, sampler);
        Ok((sampler, true))
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    pub fn clear(&mut self, gpu: &mut dyn HostGpu) -> Result<(), GpuError> {
        for (_, sampler) in self.samplers.drain() {
            gpu.destroy_sampler(sampler)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_modes_map_to_nearest_host_mode() {
        let info = SamplerInfo {
            clamp_u: ClampMode::ClampToHalfway,
            clamp_v: ClampMode::MirrorClampToBorder,
            clamp_w: ClampMode::ClampToBorder,
            ..SamplerInfo::default()
        };
        let desc = info.to_desc();
        assert_eq!(desc.address_mode_u, AddressMode::ClampToEdge);
        assert_eq!(desc.address_mode_v, AddressMode::MirrorClampToEdge);
        assert_eq!(desc.address_mode_w, AddressMode::ClampToBorder);
        assert_eq!(desc.mipmap_filter, Filter::Nearest);
    }

    #[test]
    fn raw_codes_round_trip() {
        for raw in 0..8 {
            assert_eq!(ClampMode::from_raw(raw).raw(), raw);
        }
        assert_eq!(FilterMode::from_raw(3), FilterMode::Linear);
    }
}
