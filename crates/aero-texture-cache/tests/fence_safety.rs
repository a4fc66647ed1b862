mod common;

use std::collections::{HashMap, HashSet, VecDeque};

use aero_texture_cache::hal::{DescriptorSetId, Fence, HostGpu};
use aero_texture_cache::{
    FetchConstantFile, ShaderStage, Swizzle, TextureBinding, TextureHandle, TextureInfo,
};
use proptest::prelude::*;

const TEXTURES: u32 = 4;

#[derive(Debug, Clone)]
enum Op {
    Draw(u32),
    GuestWrite(u32),
    Submit,
    CompleteOldest,
    Maintain,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..TEXTURES).prop_map(Op::Draw),
        2 => (0..TEXTURES).prop_map(Op::GuestWrite),
        2 => Just(Op::Submit),
        2 => Just(Op::CompleteOldest),
        2 => Just(Op::Maintain),
    ]
}

fn texture(index: u32) -> TextureInfo {
    common::linear_rgba(0x10000 + u64::from(index) * 0x1000, 16, 16)
}

struct Harness {
    cache: common::SoftwareCache,
    fetch: FetchConstantFile,
    cmd: aero_texture_cache::hal::CommandBuffer,
    in_flight: VecDeque<Fence>,
    seen: HashSet<TextureHandle>,
    /// Fence each descriptor set was last finished with.
    sets: HashMap<DescriptorSetId, Fence>,
}

impl Harness {
    fn new() -> Self {
        let mut cache = common::cache();
        cache.gpu_mut().set_auto_complete(false);
        let mut fetch = FetchConstantFile::new();
        for index in 0..TEXTURES {
            fetch.set(index, common::fetch_constant(&texture(index), Swizzle::IDENTITY));
        }
        let cmd = common::begin(&mut cache);
        Self {
            cache,
            fetch,
            cmd,
            in_flight: VecDeque::new(),
            seen: HashSet::new(),
            sets: HashMap::new(),
        }
    }

    fn apply(&mut self, op: &Op) {
        match *op {
            Op::Draw(index) => {
                let binding = TextureBinding {
                    fetch_constant: index,
                    swizzle: Swizzle::IDENTITY,
                    stage: ShaderStage::Pixel,
                };
                let set = self
                    .cache
                    .prepare_bindings(&mut self.cmd, &self.fetch, &[], &[binding])
                    .unwrap()
                    .expect("draw has a command buffer, so bindings succeed");
                self.sets.insert(set, self.cmd.fence);
            }
            Op::GuestWrite(index) => {
                let address = texture(index).guest_address + 64;
                self.cache.memory().write(address, &[index as u8 + 1]).unwrap();
            }
            Op::Submit => {
                let fence = self.cache.gpu_mut().submit(self.cmd.id).unwrap();
                self.in_flight.push_back(fence);
                self.cmd = common::begin(&mut self.cache);
            }
            Op::CompleteOldest => {
                if let Some(fence) = self.in_flight.pop_front() {
                    self.cache.gpu_mut().complete_fence(fence);
                }
            }
            Op::Maintain => self.maintain(),
        }
        self.seen
            .extend(self.cache.resident_textures().map(|(handle, _)| handle));
    }

    /// Run a maintenance pass and check that nothing the GPU may still read was freed.
    fn maintain(&mut self) {
        let before: Vec<(TextureHandle, Option<Fence>)> = self
            .seen
            .iter()
            .filter_map(|&h| self.cache.texture(h).map(|tex| (h, tex.last_use())))
            .collect();
        self.cache.maintain().unwrap();

        let completed = self.cache.gpu().completed_fence();
        for (handle, last_use) in before {
            if self.cache.texture(handle).is_none() {
                assert!(
                    last_use.map_or(true, |fence| fence <= completed),
                    "{handle:?} freed with last use {last_use:?} but only {completed:?} signalled"
                );
            }
        }

        for (&set, &fence) in &self.sets {
            if fence <= completed {
                continue;
            }
            let writes = self.cache.gpu().descriptor_writes(set).unwrap();
            for write in writes {
                assert!(
                    self.cache.gpu().view_desc(write.view).is_some(),
                    "in-flight set {set:?} references a destroyed view"
                );
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn textures_are_freed_only_after_their_fences(ops in prop::collection::vec(op(), 1..64)) {
        let mut harness = Harness::new();
        for op in &ops {
            harness.apply(op);
        }

        // Drain everything: once all work has finished, no evicted texture may linger.
        harness.apply(&Op::Submit);
        harness.cache.gpu_mut().complete_all();
        harness.cache.maintain().unwrap();
        prop_assert_eq!(harness.cache.pending_delete_count(), 0);
        prop_assert_eq!(harness.cache.pending_descriptor_sets(), 0);
        for (_, tex) in harness.cache.resident_textures() {
            prop_assert_eq!(tex.ref_count(), 0);
        }
    }
}
