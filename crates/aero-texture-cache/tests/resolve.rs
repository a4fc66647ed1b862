mod common;

use aero_texture_cache::hal::ImageLayout;
use aero_texture_cache::{GuestFormat, Residency, TextureInfo, TextureOffset};

const BASE: u64 = 0x100000;
/// One 32x32 tile of 32bpp blocks.
const TILE_BYTES: u64 = 32 * 32 * 4;

#[test]
fn contained_resolve_regions_reuse_the_texture_with_an_offset() {
    let mut cache = common::cache();
    let (handle, offset) = cache
        .demand_resolve_texture(BASE, 64, 64, GuestFormat::K8_8_8_8)
        .unwrap()
        .unwrap();
    assert_eq!(offset, TextureOffset::default());

    // Second tile of the first tile row.
    let (again, offset) = cache
        .demand_resolve_texture(BASE + TILE_BYTES, 32, 32, GuestFormat::K8_8_8_8)
        .unwrap()
        .unwrap();
    assert_eq!(again, handle);
    assert_eq!(
        offset,
        TextureOffset {
            bytes: TILE_BYTES,
            x: 32,
            y: 0
        }
    );

    // First tile of the second tile row.
    let (again, offset) = cache
        .demand_resolve_texture(BASE + 2 * TILE_BYTES, 32, 32, GuestFormat::K8_8_8_8)
        .unwrap()
        .unwrap();
    assert_eq!(again, handle);
    assert_eq!((offset.x, offset.y), (0, 32));

    // Does not fit inside the first texture.
    let (other, offset) = cache
        .demand_resolve_texture(BASE + TILE_BYTES, 64, 32, GuestFormat::K8_8_8_8)
        .unwrap()
        .unwrap();
    assert_ne!(other, handle);
    assert_eq!(offset, TextureOffset::default());
    assert_eq!(cache.stats().textures_created, 2);
    assert_eq!(cache.stats().uploads, 0);
}

#[test]
fn newest_resolve_texture_wins_overlapping_lookups() {
    let mut cache = common::cache();
    let (older, _) = cache
        .demand_resolve_texture(BASE, 64, 64, GuestFormat::K8_8_8_8)
        .unwrap()
        .unwrap();
    let (newer, _) = cache
        .demand_resolve_texture(BASE + TILE_BYTES, 64, 32, GuestFormat::K8_8_8_8)
        .unwrap()
        .unwrap();
    assert_ne!(older, newer);

    let (found, offset) = cache
        .lookup_address(BASE + TILE_BYTES, 32, 32, GuestFormat::K8_8_8_8)
        .unwrap();
    assert_eq!(found, newer);
    assert_eq!(offset, TextureOffset::default());
}

#[test]
fn guest_writes_retire_resolve_textures() {
    let mut cache = common::cache();
    let (first, _) = cache
        .demand_resolve_texture(BASE, 64, 64, GuestFormat::K8_8_8_8)
        .unwrap()
        .unwrap();
    assert_eq!(cache.memory().watch_count(), 1);

    cache.memory().write(BASE + 100, &[1, 2, 3]).unwrap();
    // Ordinary invalidation processing leaves resolve textures alone.
    assert_eq!(cache.process_invalidations(), 0);
    assert_eq!(cache.texture(first).unwrap().residency(), Residency::Resolve);

    let (second, _) = cache
        .demand_resolve_texture(BASE, 64, 64, GuestFormat::K8_8_8_8)
        .unwrap()
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(
        cache.texture(first).unwrap().residency(),
        Residency::PendingDelete
    );

    // Never used by a command buffer, so nothing holds it back.
    assert_eq!(cache.scavenge().unwrap(), 1);
    assert!(cache.texture(first).is_none());
}

#[test]
fn resolve_textures_can_be_dropped_wholesale() {
    let mut cache = common::cache();
    for i in 0..3 {
        cache
            .demand_resolve_texture(BASE + i * 0x10000, 32, 32, GuestFormat::K8_8_8_8)
            .unwrap()
            .unwrap();
    }
    let info = common::linear_rgba(0x10000, 16, 16);
    let mut cmd = common::begin(&mut cache);
    let cached = cache.demand(&info, Some(&mut cmd)).unwrap().unwrap();

    assert_eq!(cache.invalidate_resolve_textures(), 3);
    assert_eq!(cache.resident_textures().count(), 1);
    assert_eq!(cache.texture(cached).unwrap().residency(), Residency::Cached);
    assert_eq!(cache.scavenge().unwrap(), 3);
}

#[test]
fn demand_promotes_an_exactly_matching_resolve_texture() {
    let mut cache = common::cache();
    let (resolve, _) = cache
        .demand_resolve_texture(BASE, 64, 64, GuestFormat::K8_8_8_8)
        .unwrap()
        .unwrap();

    assert_eq!(
        cache.texture(resolve).unwrap().layout(),
        ImageLayout::Undefined
    );

    let info = TextureInfo::resolve_target(BASE, 64, 64, GuestFormat::K8_8_8_8);
    let mut cmd = common::begin(&mut cache);
    assert_eq!(cache.demand(&info, Some(&mut cmd)).unwrap(), Some(resolve));
    assert_eq!(cache.stats().uploads, 0);

    // The image is made sampleable on the demanding command buffer.
    let image = cache.texture(resolve).unwrap().image();
    assert_eq!(
        cache.texture(resolve).unwrap().layout(),
        ImageLayout::ShaderReadOnly
    );
    common::submit(&mut cache, cmd);
    assert_eq!(
        cache.gpu().image_layout(image),
        Some(ImageLayout::ShaderReadOnly)
    );

    // Promoted textures follow ordinary invalidation.
    cache.memory().write(BASE, &[0]).unwrap();
    assert_eq!(cache.process_resolve_invalidations(), 0);
    assert_eq!(cache.process_invalidations(), 1);
}
