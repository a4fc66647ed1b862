/// Snapshot of texture cache counters, suitable for profiling/telemetry.
///
/// Counters are cumulative since the cache was created. `resident_textures` is the current
/// number of cached and resolve textures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub texture_hits: u64,
    pub texture_misses: u64,
    pub textures_created: u64,
    pub uploads: u64,
    pub upload_failures: u64,
    pub upload_bytes: u64,
    /// Submissions forced by staging or image-pool exhaustion.
    pub forced_submissions: u64,
    pub evictions: u64,
    pub textures_freed: u64,
    pub descriptor_sets_reclaimed: u64,
    pub views_created: u64,
    pub samplers_created: u64,
    pub resident_textures: u64,
}

impl CacheStats {
    /// Fraction of `demand` calls served without creating a texture.
    pub fn hit_rate(&self) -> f64 {
        let total = self.texture_hits + self.texture_misses;
        if total == 0 {
            return 0.0;
        }
        self.texture_hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_handles_empty_and_mixed_counts() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
        let stats = CacheStats {
            texture_hits: 3,
            texture_misses: 1,
            ..CacheStats::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
    }
}
