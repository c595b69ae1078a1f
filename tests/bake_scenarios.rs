// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! End-to-end allocator scenarios against the software device.

#![cfg(feature = "backend_soft")]

use std::sync::Arc;

use heaps_and_pages::memory::MemoryFeatures;
use heaps_and_pages::resources::{
    Buffer, BufferUsage, Device, Image, ImageDescriptor, ImageUsage, QueueFamilySet, SharingMode,
    TexelFormat,
};
use heaps_and_pages::{Allocator, BakeError};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

fn plain_buffer(device: &Arc<Device>, size: u64, label: &str) -> Arc<Buffer> {
    Buffer::new(
        device,
        size,
        BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
        SharingMode::Concurrent,
        QueueFamilySet::default(),
        label,
    )
    .unwrap()
}

#[test]
fn mappable_write_round_trips() {
    let device = Device::new_for_testing();
    let buffer = plain_buffer(&device, 1024, "mappable");
    let data = pattern(1024);

    let mut allocator = Allocator::new(&device, "mappable");
    allocator
        .add_buffer_with_data(&buffer, MemoryFeatures::MAPPABLE, &data, 0)
        .unwrap();
    let scratch_before = device.scratch_allocated_total();
    allocator.bake().unwrap();

    // a mappable backing never needs a staging buffer
    assert_eq!(device.scratch_allocated_total(), scratch_before);
    assert!(buffer.memory_block().unwrap().is_host_visible());

    let mut out = vec![0u8; 1024];
    buffer.read(&mut out, 0).unwrap();
    for (i, byte) in out.iter().enumerate() {
        assert_eq!(*byte, (i % 256) as u8, "byte {i}");
    }
}

#[test]
fn device_local_write_stages_exactly_once() {
    let device = Device::new_for_testing();
    let buffer = plain_buffer(&device, 1024, "device_local");
    let data = pattern(1024);

    let mut allocator = Allocator::new(&device, "device_local");
    allocator
        .add_buffer_with_data(&buffer, MemoryFeatures::DEVICE_LOCAL, &data, 0)
        .unwrap();
    let scratch_before = device.scratch_allocated_total();
    allocator.bake().unwrap();

    let block = buffer.memory_block().unwrap();
    assert!(block.features().contains(MemoryFeatures::DEVICE_LOCAL));
    assert!(!block.is_host_visible());
    // one scratch for the upload, released by the time bake returns
    assert_eq!(device.scratch_allocated_total(), scratch_before + 1);
    assert_eq!(device.scratch_live(), 0);

    let mut out = vec![0u8; 1024];
    buffer.read(&mut out, 0).unwrap();
    assert_eq!(out, data);
    assert_eq!(device.scratch_live(), 0);
}

#[test]
fn compatible_buffers_share_one_block() {
    let device = Device::new_for_testing();
    let a = plain_buffer(&device, 64, "a");
    let b = plain_buffer(&device, 100, "b");
    let c = plain_buffer(&device, 32, "c");

    let mut allocator = Allocator::new(&device, "grouping");
    for buffer in [&a, &b, &c] {
        allocator.add_buffer(buffer, MemoryFeatures::empty()).unwrap();
    }
    allocator.bake().unwrap();

    let block = a.memory_block().unwrap();
    assert!(Arc::ptr_eq(&block, &b.memory_block().unwrap()));
    assert!(Arc::ptr_eq(&block, &c.memory_block().unwrap()));

    let bindings = [
        a.binding().unwrap(),
        b.binding().unwrap(),
        c.binding().unwrap(),
    ];
    let mut laid_out_end: u64 = 0;
    for (buffer, sub) in [&a, &b, &c].iter().zip(&bindings) {
        let req = buffer.requirements();
        assert_eq!(sub.offset % req.alignment, 0);
        assert!(sub.end() <= block.size());
        laid_out_end = laid_out_end.div_ceil(req.alignment) * req.alignment + req.size;
    }
    for (i, x) in bindings.iter().enumerate() {
        for y in bindings.iter().skip(i + 1) {
            assert!(
                x.end() <= y.offset || y.end() <= x.offset,
                "{}+{} overlaps {}+{}",
                x.offset,
                x.size,
                y.offset,
                y.size
            );
        }
    }
    // the block is sized to the laid-out end, not a padded over-estimate
    assert_eq!(block.size(), laid_out_end);
}

#[test]
fn mixed_alignment_members_fit_one_block() {
    let device = Device::new_for_testing();
    // buffer alignment 256, image alignment 4096; one non-dedicated group
    let buffer = plain_buffer(&device, 100, "small");
    let image = Image::new(
        &device,
        ImageDescriptor {
            extent: [32, 32, 1],
            mip_levels: 1,
            array_layers: 1,
            format: TexelFormat::Rgba8Unorm,
            usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
            sharing: SharingMode::Concurrent,
            families: QueueFamilySet::default(),
        },
        "sampled",
    )
    .unwrap();
    assert!(!image.requirements().dedicated.forces_singleton());

    let mut allocator = Allocator::new(&device, "mixed");
    allocator.add_buffer(&buffer, MemoryFeatures::empty()).unwrap();
    allocator.add_image(&image, MemoryFeatures::empty()).unwrap();
    allocator.bake().unwrap();

    let block = buffer.memory_block().unwrap();
    assert!(Arc::ptr_eq(&block, &image.memory_block().unwrap()));
    for (offset, alignment, size) in [
        (buffer.binding().unwrap().offset, buffer.requirements().alignment, buffer.requirements().size),
        (image.binding().unwrap().offset, image.requirements().alignment, image.requirements().size),
    ] {
        assert_eq!(offset % alignment, 0);
        assert!(offset + size <= block.size());
    }
}

#[test]
fn dedicated_image_gets_its_own_block() {
    let device = Device::new_for_testing();
    let image = Image::new(
        &device,
        ImageDescriptor {
            extent: [64, 64, 1],
            mip_levels: 1,
            array_layers: 1,
            format: TexelFormat::Rgba8Unorm,
            usage: ImageUsage::RENDER_ATTACHMENT | ImageUsage::TRANSFER_SRC,
            sharing: SharingMode::Concurrent,
            families: QueueFamilySet::default(),
        },
        "attachment",
    )
    .unwrap();
    assert!(image.requirements().dedicated.forces_singleton());
    let a = plain_buffer(&device, 256, "a");
    let b = plain_buffer(&device, 512, "b");

    let mut allocator = Allocator::new(&device, "dedicated");
    allocator.add_image(&image, MemoryFeatures::empty()).unwrap();
    allocator.add_buffer(&a, MemoryFeatures::empty()).unwrap();
    allocator.add_buffer(&b, MemoryFeatures::empty()).unwrap();
    allocator.bake().unwrap();

    let image_block = image.memory_block().unwrap();
    let buffer_block = a.memory_block().unwrap();
    assert_eq!(image.binding().unwrap().offset, 0);
    assert_eq!(image_block.dedicated_to(), Some(image.id()));
    assert!(!Arc::ptr_eq(&image_block, &buffer_block));
    assert!(Arc::ptr_eq(&buffer_block, &b.memory_block().unwrap()));
    assert!(buffer_block.dedicated_to().is_none());
}

#[test]
fn image_initial_data_round_trips() {
    let device = Device::new_for_testing();
    let image = Image::new(
        &device,
        ImageDescriptor {
            extent: [32, 32, 1],
            mip_levels: 1,
            array_layers: 1,
            format: TexelFormat::Rgba8Unorm,
            usage: ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED,
            sharing: SharingMode::Concurrent,
            families: QueueFamilySet::default(),
        },
        "textured",
    )
    .unwrap();
    let data = pattern(32 * 32 * 4);

    let mut allocator = Allocator::new(&device, "image_data");
    allocator
        .add_image_with_data(&image, MemoryFeatures::empty(), &data)
        .unwrap();
    allocator.bake().unwrap();

    let mut out = vec![0u8; data.len()];
    image.read_texels(0, 0, [0, 0, 0], [32, 32, 1], &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn impossible_requirement_rolls_back_everything() {
    let device = Device::new_for_testing();
    let valid = plain_buffer(&device, 256, "valid");
    let impossible = plain_buffer(&device, 256, "impossible");

    let heap0_before = device.heap_used(0);
    let heap1_before = device.heap_used(1);

    let mut allocator = Allocator::new(&device, "doomed");
    allocator.add_buffer(&valid, MemoryFeatures::empty()).unwrap();
    allocator
        .add_buffer(&impossible, MemoryFeatures::PROTECTED)
        .unwrap();
    let err = allocator.bake().unwrap_err();
    assert!(matches!(err, BakeError::NoCompatibleMemoryType { resource, .. }
        if resource == impossible.id()));

    assert!(!valid.is_baked());
    assert!(valid.memory_block().is_none());
    assert_eq!(device.heap_used(0), heap0_before);
    assert_eq!(device.heap_used(1), heap1_before);

    // the buffer is still bakeable afterwards
    let mut retry = Allocator::new(&device, "retry");
    retry.add_buffer(&valid, MemoryFeatures::empty()).unwrap();
    retry.bake().unwrap();
    assert!(valid.is_baked());
}

#[test]
fn exhausted_heaps_fail_the_bake_after_fallback() {
    let device = Device::new_for_testing();
    // device-local lives on the 256 MiB heap (types 0 and 2); ask for more
    // than both candidates can provide
    let huge = plain_buffer(&device, 512 << 20, "huge");
    let mut allocator = Allocator::new(&device, "huge");
    allocator
        .add_buffer(&huge, MemoryFeatures::DEVICE_LOCAL)
        .unwrap();
    let err = allocator.bake().unwrap_err();
    assert!(matches!(err, BakeError::AllocationFailed { .. }));
    assert!(!huge.is_baked());
    assert_eq!(device.heap_used(0), 0);
}

#[test]
fn fallback_reaches_the_secondary_heap() {
    let device = Device::new_for_testing();
    // no required features: every type qualifies, preferred device-local.
    // 512 MiB exceeds heap 0, so placement falls through to host memory.
    let big = plain_buffer(&device, 512 << 20, "big");
    let mut allocator = Allocator::new(&device, "fallback");
    allocator.add_buffer(&big, MemoryFeatures::empty()).unwrap();
    allocator.bake().unwrap();
    let block = big.memory_block().unwrap();
    assert!(!block.features().contains(MemoryFeatures::DEVICE_LOCAL));
}

#[test]
fn buffer_views_share_the_parent_backing() {
    let device = Device::new_for_testing();
    let buffer = plain_buffer(&device, 1024, "viewed");
    let mut allocator = Allocator::new(&device, "views");
    allocator
        .add_buffer(&buffer, MemoryFeatures::MAPPABLE)
        .unwrap();
    allocator.bake().unwrap();

    let view = buffer.child_view(256, 256).unwrap();
    assert!(Arc::ptr_eq(
        &view.memory_block().unwrap(),
        &buffer.memory_block().unwrap()
    ));
    let data = pattern(256);
    view.write(&data, 0).unwrap();

    let mut direct = vec![0u8; 256];
    buffer.read(&mut direct, 256).unwrap();
    assert_eq!(direct, data);
}
