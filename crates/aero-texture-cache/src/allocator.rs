//! Host memory sub-allocation for texture images and upload staging.
//!
//! Both allocators only track offsets; the bytes live in host objects created through
//! [`HostGpu`]. Neither has any caching policy: the cache decides what to free and when.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;

use tracing::debug;

use crate::error::{AllocError, GpuError};
use crate::hal::{BufferId, Fence, HostGpu, MemoryId, MemoryRequirements};

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// Layout rules for image memory pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationPolicy {
    /// Size of each host memory allocation images are placed in.
    pub pool_size: u64,
    /// Minimum alignment (and size granularity) of each image placement.
    pub alignment: u64,
    /// Pools are created on demand up to this many.
    pub max_pools: usize,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            pool_size: 64 * 1024 * 1024,
            alignment: 4096,
            max_pools: 16,
        }
    }
}

impl AllocationPolicy {
    pub fn validate(&self) -> Result<(), AllocError> {
        if self.pool_size == 0 {
            return Err(AllocError::InvalidPolicy("pool_size must be > 0"));
        }
        if !self.alignment.is_power_of_two() {
            return Err(AllocError::InvalidPolicy("alignment must be a power of two"));
        }
        if self.pool_size % self.alignment != 0 {
            return Err(AllocError::InvalidPolicy(
                "pool_size must be a multiple of alignment",
            ));
        }
        if self.max_pools == 0 {
            return Err(AllocError::InvalidPolicy("max_pools must be > 0"));
        }
        Ok(())
    }
}

/// First-fit allocator over `[0, capacity)` with a sorted, coalesced free list.
#[derive(Clone)]
pub struct RangeAllocator {
    capacity: u64,
    free: Vec<Range<u64>>,
}

impl RangeAllocator {
    pub fn new(capacity: u64) -> Self {
        let free = if capacity == 0 {
            Vec::new()
        } else {
            vec![0..capacity]
        };
        Self { capacity, free }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|r| r.end - r.start).sum()
    }

    /// Nothing allocated.
    pub fn is_unused(&self) -> bool {
        self.free_bytes() == self.capacity
    }

    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let alignment = alignment.max(1);
        let (index, offset) = self.free.iter().enumerate().find_map(|(i, range)| {
            let offset = align_up(range.start, alignment);
            let end = offset.checked_add(size)?;
            (end <= range.end).then_some((i, offset))
        })?;

        let range = self.free.remove(index);
        let mut insert_at = index;
        if range.start < offset {
            self.free.insert(insert_at, range.start..offset);
            insert_at += 1;
        }
        if offset + size < range.end {
            self.free.insert(insert_at, offset + size..range.end);
        }
        Some(offset)
    }

    pub fn free(&mut self, offset: u64, size: u64) {
        let range = offset..offset + size;
        let index = self.free.partition_point(|r| r.start < range.start);
        debug_assert!(
            index == 0 || self.free[index - 1].end <= range.start,
            "double free of {range:?}"
        );
        debug_assert!(
            index == self.free.len() || range.end <= self.free[index].start,
            "double free of {range:?}"
        );
        self.free.insert(index, range);

        // Merge with the following range, then the preceding one.
        if index + 1 < self.free.len() && self.free[index].end == self.free[index + 1].start {
            let next = self.free.remove(index + 1);
            self.free[index].end = next.end;
        }
        if index > 0 && self.free[index - 1].end == self.free[index].start {
            let cur = self.free.remove(index);
            self.free[index - 1].end = cur.end;
        }
    }
}

impl fmt::Debug for RangeAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeAllocator")
            .field("capacity", &self.capacity)
            .field("free", &self.free)
            .finish()
    }
}

/// Placement of one image inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageAllocation {
    pub pool: usize,
    pub memory: MemoryId,
    pub offset: u64,
    pub size: u64,
}

struct Pool {
    memory: MemoryId,
    ranges: RangeAllocator,
}

/// Places images into fixed-size host memory pools.
pub struct ImageAllocator {
    policy: AllocationPolicy,
    pools: Vec<Pool>,
}

impl ImageAllocator {
    pub fn new(policy: AllocationPolicy) -> Result<Self, AllocError> {
        policy.validate()?;
        Ok(Self {
            policy,
            pools: Vec::new(),
        })
    }

    pub fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.pools
            .iter()
            .map(|p| p.ranges.capacity() - p.ranges.free_bytes())
            .sum()
    }

    pub fn allocate(
        &mut self,
        gpu: &mut dyn HostGpu,
        requirements: MemoryRequirements,
    ) -> Result<ImageAllocation, AllocError> {
        let size = align_up(requirements.size.max(1), self.policy.alignment);
        let alignment = requirements.alignment.max(self.policy.alignment);
        if size > self.policy.pool_size {
            return Err(AllocError::TooLarge {
                requested: size,
                pool_size: self.policy.pool_size,
            });
        }

        for (pool_index, pool) in self.pools.iter_mut().enumerate() {
            if let Some(offset) = pool.ranges.allocate(size, alignment) {
                return Ok(ImageAllocation {
                    pool: pool_index,
                    memory: pool.memory,
                    offset,
                    size,
                });
            }
        }

        if self.pools.len() >= self.policy.max_pools {
            return Err(AllocError::PoolExhausted {
                requested: size,
                pools: self.pools.len(),
            });
        }

        let memory = gpu.allocate_memory(self.policy.pool_size)?;
        let mut ranges = RangeAllocator::new(self.policy.pool_size);
        let offset = ranges
            .allocate(size, alignment)
            .ok_or(AllocError::TooLarge {
                requested: size,
                pool_size: self.policy.pool_size,
            })?;
        let pool_index = self.pools.len();
        self.pools.push(Pool { memory, ranges });
        debug!(
            pool = pool_index,
            pool_size = self.policy.pool_size,
            "allocated image memory pool"
        );
        Ok(ImageAllocation {
            pool: pool_index,
            memory,
            offset,
            size,
        })
    }

    pub fn free(&mut self, allocation: &ImageAllocation) {
        if let Some(pool) = self.pools.get_mut(allocation.pool) {
            debug_assert_eq!(pool.memory, allocation.memory);
            pool.ranges.free(allocation.offset, allocation.size);
        }
    }

    /// Return every pool to the host. All images placed in them must already be destroyed.
    pub fn release_all(&mut self, gpu: &mut dyn HostGpu) -> Result<(), GpuError> {
        for pool in self.pools.drain(..) {
            gpu.free_memory(pool.memory)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StagingRegion {
    start: u64,
    end: u64,
    fence: Fence,
}

/// Ring of staging memory for uploads.
///
/// Every allocation is tagged with the fence of the command buffer whose copies read it; space
/// is only reused after that fence signals (see [`StagingRing::reclaim`]). Allocation never
/// blocks: when the ring is full it returns `None` and the caller decides how to make progress.
pub struct StagingRing {
    buffer: BufferId,
    capacity: u64,
    alignment: u64,
    head: u64,
    in_flight: VecDeque<StagingRegion>,
}

impl StagingRing {
    pub fn new(gpu: &mut dyn HostGpu, capacity: u64, alignment: u64) -> Result<Self, GpuError> {
        let buffer = gpu.create_staging_buffer(capacity)?;
        Ok(Self {
            buffer,
            capacity,
            alignment: alignment.max(1),
            head: 0,
            in_flight: VecDeque::new(),
        })
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.in_flight.iter().map(|r| r.end - r.start).sum()
    }

    /// Reserve `size` bytes that will be consumed by the submission signalling `fence`.
    pub fn allocate(&mut self, size: u64, fence: Fence) -> Option<u64> {
        if size == 0 || size > self.capacity {
            return None;
        }
        let start = match self.in_flight.front() {
            None => {
                // Nothing in flight: rewind so large requests see the whole ring.
                self.head = 0;
                0
            }
            Some(oldest) if self.head > oldest.start => {
                let start = align_up(self.head, self.alignment);
                if start.checked_add(size)? <= self.capacity {
                    start
                } else if size <= oldest.start {
                    0
                } else {
                    return None;
                }
            }
            Some(oldest) => {
                let start = align_up(self.head, self.alignment);
                if start.checked_add(size)? <= oldest.start {
                    start
                } else {
                    return None;
                }
            }
        };

        let end = start + size;
        match self.in_flight.back_mut() {
            Some(last) if last.fence == fence && last.end <= start => last.end = end,
            _ => self.in_flight.push_back(StagingRegion { start, end, fence }),
        }
        self.head = end;
        Some(start)
    }

    /// Release every region whose fence has signalled, oldest first.
    pub fn reclaim(&mut self, gpu: &mut dyn HostGpu) -> u64 {
        let mut reclaimed = 0;
        while let Some(oldest) = self.in_flight.front().copied() {
            if !gpu.fence_signaled(oldest.fence) {
                break;
            }
            self.in_flight.pop_front();
            reclaimed += oldest.end - oldest.start;
        }
        if self.in_flight.is_empty() {
            self.head = 0;
        }
        reclaimed
    }

    /// Drop all tracking without waiting for fences.
    pub fn reset(&mut self) {
        self.in_flight.clear();
        self.head = 0;
    }

    /// Destroy the backing buffer. The ring must not be used afterwards.
    pub fn release(&mut self, gpu: &mut dyn HostGpu) -> Result<(), GpuError> {
        self.in_flight.clear();
        self.head = 0;
        gpu.destroy_buffer(self.buffer)
    }
}
