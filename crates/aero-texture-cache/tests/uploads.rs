mod common;

use aero_texture_cache::format::tiled_block_offset;
use aero_texture_cache::{GuestFormat, TextureCacheConfig, TextureDimension, TextureInfo};

fn mipped_rgba(address: u64, size: u32) -> TextureInfo {
    TextureInfo {
        mip_levels: 32 - size.leading_zeros(),
        ..common::linear_rgba(address, size, size)
    }
}

/// Upload `info` and return each subresource's host bytes, level-major.
fn upload_and_read(cache: &mut common::SoftwareCache, info: &TextureInfo) -> Vec<Vec<u8>> {
    let mut cmd = common::begin(cache);
    let handle = cache.demand(info, Some(&mut cmd)).unwrap().unwrap();
    common::submit(cache, cmd);
    let image = cache.texture(handle).unwrap().image();
    let mut out = Vec::new();
    for level in 0..info.mip_levels {
        for layer in 0..info.array_layers() {
            out.push(cache.gpu().image_bytes(image, level, layer).unwrap().to_vec());
        }
    }
    out
}

#[test]
fn small_staging_ring_forces_submissions_without_changing_output() {
    let info = mipped_rgba(0x10000, 64);
    assert_eq!(info.mip_levels, 7);

    let mut roomy = common::cache();
    common::fill_guest(roomy.memory(), &info, 9);
    let expected = upload_and_read(&mut roomy, &info);
    assert_eq!(roomy.stats().forced_submissions, 0);

    // Mip 0 alone fills the ring.
    let config = TextureCacheConfig {
        staging_size: 64 * 256,
        ..TextureCacheConfig::default()
    };
    let mut tight = common::cache_with(config);
    common::fill_guest(tight.memory(), &info, 9);
    let actual = upload_and_read(&mut tight, &info);

    assert!(tight.stats().forced_submissions > 0);
    assert_eq!(actual.len(), expected.len());
    for (level, (a, e)) in actual.iter().zip(&expected).enumerate() {
        assert_eq!(a, e, "mip {level} differs");
    }
    assert_eq!(tight.stats().upload_bytes, roomy.stats().upload_bytes);
}

#[test]
fn subresource_larger_than_staging_ring_fails_the_texture() {
    let config = TextureCacheConfig {
        staging_size: 4096,
        ..TextureCacheConfig::default()
    };
    let mut cache = common::cache_with(config);
    let info = common::linear_rgba(0x10000, 64, 64);
    let mut cmd = common::begin(&mut cache);
    assert_eq!(cache.demand(&info, Some(&mut cmd)).unwrap(), None);
    assert_eq!(cache.stats().upload_failures, 1);

    // The incomplete texture stays cached and is not retried until invalidated.
    assert_eq!(cache.demand(&info, Some(&mut cmd)).unwrap(), None);
    assert_eq!(cache.stats().textures_created, 1);
    cache.memory().write(info.guest_address, &[0]).unwrap();
    assert_eq!(cache.process_invalidations(), 1);
}

#[test]
fn tiled_texture_is_detiled() {
    let mut cache = common::cache();
    let info = TextureInfo {
        tiled: true,
        ..common::linear_rgba(0x10000, 64, 64)
    };
    let guest = common::fill_guest(cache.memory(), &info, 5);
    let host = upload_and_read(&mut cache, &info).remove(0);

    for (x, y) in [(0, 0), (1, 0), (31, 31), (32, 0), (0, 32), (63, 63)] {
        let src = tiled_block_offset(x, y, 64, 4) as usize;
        let dst = ((y * 64 + x) * 4) as usize;
        assert_eq!(&host[dst..dst + 4], &guest[src..src + 4], "texel ({x}, {y})");
    }
}

#[test]
fn endian_swap_and_format_conversion_are_applied() {
    let mut cache = common::cache();
    let info = TextureInfo {
        format: GuestFormat::K5_6_5,
        endian: aero_texture_cache::Endian::Swap8In16,
        ..common::linear_rgba(0x10000, 4, 1)
    };
    // Big-endian pure red, then pure blue.
    cache
        .memory()
        .write(0x10000, &[0xF8, 0x00, 0x00, 0x1F, 0, 0, 0, 0])
        .unwrap();
    let host = upload_and_read(&mut cache, &info).remove(0);
    assert_eq!(&host[..4], &[0xFF, 0x00, 0x00, 0xFF]);
    assert_eq!(&host[4..8], &[0x00, 0x00, 0xFF, 0xFF]);
}

#[test]
fn cube_faces_are_uploaded_in_order() {
    let mut cache = common::cache();
    let info = TextureInfo {
        dimension: TextureDimension::Cube,
        ..common::linear_rgba(0x10000, 8, 8)
    };
    let guest = common::fill_guest(cache.memory(), &info, 11);
    let faces = upload_and_read(&mut cache, &info);
    assert_eq!(faces.len(), 6);
    let face_size = 8 * 8 * 4;
    for (face, bytes) in faces.iter().enumerate() {
        assert_eq!(
            bytes.as_slice(),
            &guest[face * face_size..(face + 1) * face_size],
            "face {face}"
        );
    }
}

#[test]
fn block_compressed_mips_keep_whole_blocks() {
    let mut cache = common::cache();
    let info = TextureInfo {
        format: GuestFormat::Dxt1,
        mip_levels: 4,
        ..common::linear_rgba(0x10000, 8, 8)
    };
    common::fill_guest(cache.memory(), &info, 2);
    let levels = upload_and_read(&mut cache, &info);
    // 2x2 blocks, then one block for every smaller level.
    let sizes: Vec<_> = levels.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![32, 8, 8, 8]);
}
