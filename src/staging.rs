// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! The staging copy engine.
//!
//! Everything here is the fallback path for resources whose backing is not
//! host-visible: fill a scratch host-visible buffer, record a barrier-copy-
//! barrier one-shot command buffer, submit to the queue the sharing rules
//! pick, and block.  Mappable targets skip all of that and go through the
//! mapping directly.
//!
//! Scratch buffers and one-shot commands are scoped: every exit path,
//! success or failure, releases them.  The device counts scratch
//! creations so tests can assert how many a bake used.

use crate::imp;
use crate::memory::MemoryFeatures;
use crate::resources::buffer::Buffer;
use crate::resources::device::{Device, DeviceError};
use crate::resources::image::Image;
use crate::resources::sparse_buffer::SparseBuffer;
use crate::resources::sparse_image::SparseImage;
use crate::resources::BufferUsage;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("resource has no backing memory; bake it first")]
    NotBaked,
    #[error("transfer of {offset}+{len} exceeds resource size {size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },
    #[error("region holds {expected} bytes but {actual} were supplied")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("no host-visible memory type for a scratch buffer")]
    NoScratchMemory,
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("backend error: {0}")]
    Backend(#[from] imp::Error),
}

/// A scratch host-visible buffer, alive for one transfer.
struct Scratch<'a> {
    device: &'a Device,
    buffer: imp::RawBuffer,
    memory: imp::DeviceMemory,
    size: u64,
}

impl<'a> Scratch<'a> {
    fn new(device: &'a Device, size: u64, usage: BufferUsage) -> Result<Scratch<'a>, TransferError> {
        let table = device.memory_type_table();
        let mask = table.mask_satisfying(
            table.full_mask(),
            MemoryFeatures::HOST_VISIBLE | MemoryFeatures::HOST_COHERENT | MemoryFeatures::MAPPABLE,
        );
        let type_index = mask.indices().next().ok_or(TransferError::NoScratchMemory)?;
        let memory = device.imp().allocate_memory(type_index, size, None)?;
        let buffer = device.imp().create_buffer(size, usage, false, "staging scratch")?;
        buffer.bind_memory(&memory, 0)?;
        device.note_scratch_created();
        Ok(Scratch {
            device,
            buffer,
            memory,
            size,
        })
    }

    fn fill(&self, data: &[u8]) -> Result<(), TransferError> {
        let map = self.memory.map(0, self.size)?;
        map.write(0, data)?;
        Ok(())
    }

    fn drain(&self, out: &mut [u8]) -> Result<(), TransferError> {
        let map = self.memory.map(0, self.size)?;
        map.read(0, out)?;
        Ok(())
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        self.device.note_scratch_released();
    }
}

fn check_range(offset: u64, len: u64, size: u64) -> Result<(), TransferError> {
    if offset.checked_add(len).is_none_or(|end| end > size) {
        return Err(TransferError::OutOfRange { offset, len, size });
    }
    Ok(())
}

fn submit(queue: &imp::Queue, commands: imp::OneShotCommands) -> Result<(), TransferError> {
    let interval = logwise::perfwarn_begin!("staging submit");
    let result = queue.submit_and_wait(commands);
    drop(interval);
    Ok(result?)
}

pub(crate) fn write_buffer(buffer: &Buffer, offset: u64, data: &[u8]) -> Result<(), TransferError> {
    check_range(offset, data.len() as u64, buffer.size())?;
    let backing = buffer.binding().ok_or(TransferError::NotBaked)?;
    if backing.block.is_host_visible() {
        let map = backing
            .block
            .memory()
            .map(backing.offset + offset, data.len() as u64)?;
        map.write(0, data)?;
        if !backing.block.is_coherent() {
            map.flush(0, data.len() as u64)?;
        }
        return Ok(());
    }
    let device = buffer.device();
    let queue = device.transfer_queue(buffer.queue_families(), buffer.sharing_mode())?;
    let scratch = Scratch::new(device, data.len() as u64, BufferUsage::TRANSFER_SRC)?;
    scratch.fill(data)?;
    let pool = device.command_pool(queue.family_index())?;
    let mut commands = pool.one_shot(buffer.debug_label());
    commands.transfer_barrier();
    commands.copy_buffer(
        &scratch.buffer,
        buffer.raw(),
        vec![imp::BufferCopy {
            src_offset: 0,
            dst_offset: offset,
            size: data.len() as u64,
        }],
    );
    commands.transfer_barrier();
    submit(&queue, commands)
}

pub(crate) fn read_buffer(buffer: &Buffer, offset: u64, out: &mut [u8]) -> Result<(), TransferError> {
    check_range(offset, out.len() as u64, buffer.size())?;
    let backing = buffer.binding().ok_or(TransferError::NotBaked)?;
    if backing.block.is_host_visible() {
        let map = backing
            .block
            .memory()
            .map(backing.offset + offset, out.len() as u64)?;
        map.read(0, out)?;
        return Ok(());
    }
    let device = buffer.device();
    let queue = device.transfer_queue(buffer.queue_families(), buffer.sharing_mode())?;
    let scratch = Scratch::new(device, out.len() as u64, BufferUsage::TRANSFER_DST)?;
    let pool = device.command_pool(queue.family_index())?;
    let mut commands = pool.one_shot(buffer.debug_label());
    commands.transfer_barrier();
    commands.copy_buffer(
        buffer.raw(),
        &scratch.buffer,
        vec![imp::BufferCopy {
            src_offset: offset,
            dst_offset: 0,
            size: out.len() as u64,
        }],
    );
    commands.transfer_barrier();
    submit(&queue, commands)?;
    scratch.drain(out)
}

fn check_image_region(
    layout: &imp::ImageLayout,
    mip: u32,
    layer: u32,
    origin: [u32; 3],
    extent: [u32; 3],
    data_len: u64,
) -> Result<(), TransferError> {
    if mip >= layout.mip_levels || layer >= layout.array_layers {
        return Err(TransferError::OutOfRange {
            offset: mip as u64,
            len: layer as u64,
            size: layout.mip_levels as u64,
        });
    }
    let mip_extent = layout.mip_extent(mip);
    for axis in 0..3 {
        if origin[axis] as u64 + extent[axis] as u64 > mip_extent[axis] as u64 {
            return Err(TransferError::OutOfRange {
                offset: origin[axis] as u64,
                len: extent[axis] as u64,
                size: mip_extent[axis] as u64,
            });
        }
    }
    let expected =
        extent[0] as u64 * extent[1] as u64 * extent[2] as u64 * layout.bytes_per_texel as u64;
    if expected != data_len {
        return Err(TransferError::SizeMismatch {
            expected,
            actual: data_len,
        });
    }
    Ok(())
}

pub(crate) fn write_image(
    image: &Image,
    mip: u32,
    layer: u32,
    origin: [u32; 3],
    extent: [u32; 3],
    data: &[u8],
) -> Result<(), TransferError> {
    let layout = *image.raw().layout();
    check_image_region(&layout, mip, layer, origin, extent, data.len() as u64)?;
    let backing = image.binding().ok_or(TransferError::NotBaked)?;
    if backing.block.is_host_visible() {
        // row-by-row through the mapping; images are linear on mappable types
        let map = backing.block.memory().map(backing.offset, layout.total_bytes())?;
        let mip_extent = layout.mip_extent(mip);
        let bpp = layout.bytes_per_texel as u64;
        let sub = layout.subresource_offset(mip, layer);
        let row_bytes = extent[0] as u64 * bpp;
        let mut data_pos = 0usize;
        for z in origin[2]..origin[2] + extent[2] {
            for y in origin[1]..origin[1] + extent[1] {
                let texel =
                    (z as u64 * mip_extent[1] as u64 + y as u64) * mip_extent[0] as u64
                        + origin[0] as u64;
                map.write(sub + texel * bpp, &data[data_pos..data_pos + row_bytes as usize])?;
                data_pos += row_bytes as usize;
            }
        }
        if !backing.block.is_coherent() {
            map.flush(0, layout.total_bytes())?;
        }
        return Ok(());
    }
    let device = image.device();
    let queue = device.transfer_queue(image.queue_families(), image.sharing_mode())?;
    let scratch = Scratch::new(device, data.len() as u64, BufferUsage::TRANSFER_SRC)?;
    scratch.fill(data)?;
    let pool = device.command_pool(queue.family_index())?;
    let mut commands = pool.one_shot(image.debug_label());
    commands.transfer_barrier();
    commands.copy_buffer_to_image(
        &scratch.buffer,
        image.raw(),
        vec![imp::BufferImageCopy {
            buffer_offset: 0,
            mip,
            layer,
            origin,
            extent,
        }],
    );
    commands.transfer_barrier();
    submit(&queue, commands)
}

pub(crate) fn read_image(
    image: &Image,
    mip: u32,
    layer: u32,
    origin: [u32; 3],
    extent: [u32; 3],
    out: &mut [u8],
) -> Result<(), TransferError> {
    let layout = *image.raw().layout();
    check_image_region(&layout, mip, layer, origin, extent, out.len() as u64)?;
    let backing = image.binding().ok_or(TransferError::NotBaked)?;
    if backing.block.is_host_visible() {
        let map = backing.block.memory().map(backing.offset, layout.total_bytes())?;
        let mip_extent = layout.mip_extent(mip);
        let bpp = layout.bytes_per_texel as u64;
        let sub = layout.subresource_offset(mip, layer);
        let row_bytes = (extent[0] as u64 * bpp) as usize;
        let mut data_pos = 0usize;
        for z in origin[2]..origin[2] + extent[2] {
            for y in origin[1]..origin[1] + extent[1] {
                let texel =
                    (z as u64 * mip_extent[1] as u64 + y as u64) * mip_extent[0] as u64
                        + origin[0] as u64;
                map.read(sub + texel * bpp, &mut out[data_pos..data_pos + row_bytes])?;
                data_pos += row_bytes;
            }
        }
        return Ok(());
    }
    let device = image.device();
    let queue = device.transfer_queue(image.queue_families(), image.sharing_mode())?;
    let scratch = Scratch::new(device, out.len() as u64, BufferUsage::TRANSFER_DST)?;
    let pool = device.command_pool(queue.family_index())?;
    let mut commands = pool.one_shot(image.debug_label());
    commands.transfer_barrier();
    commands.copy_image_to_buffer(
        image.raw(),
        &scratch.buffer,
        vec![imp::BufferImageCopy {
            buffer_offset: 0,
            mip,
            layer,
            origin,
            extent,
        }],
    );
    commands.transfer_barrier();
    submit(&queue, commands)?;
    scratch.drain(out)
}

/// Sparse pages are device-local, so sparse buffer IO is always staged.
pub(crate) fn write_sparse_buffer(
    sparse: &SparseBuffer,
    offset: u64,
    data: &[u8],
) -> Result<(), TransferError> {
    check_range(offset, data.len() as u64, sparse.size())?;
    let device = sparse.device();
    let queue = device.transfer_queue(sparse.queue_families(), sparse.sharing_mode())?;
    let scratch = Scratch::new(device, data.len() as u64, BufferUsage::TRANSFER_SRC)?;
    scratch.fill(data)?;
    let pool = device.command_pool(queue.family_index())?;
    let mut commands = pool.one_shot(sparse.debug_label());
    commands.transfer_barrier();
    commands.copy_buffer(
        &scratch.buffer,
        sparse.raw(),
        vec![imp::BufferCopy {
            src_offset: 0,
            dst_offset: offset,
            size: data.len() as u64,
        }],
    );
    commands.transfer_barrier();
    submit(&queue, commands)
}

pub(crate) fn read_sparse_buffer(
    sparse: &SparseBuffer,
    offset: u64,
    out: &mut [u8],
) -> Result<(), TransferError> {
    check_range(offset, out.len() as u64, sparse.size())?;
    let device = sparse.device();
    let queue = device.transfer_queue(sparse.queue_families(), sparse.sharing_mode())?;
    let scratch = Scratch::new(device, out.len() as u64, BufferUsage::TRANSFER_DST)?;
    let pool = device.command_pool(queue.family_index())?;
    let mut commands = pool.one_shot(sparse.debug_label());
    commands.transfer_barrier();
    commands.copy_buffer(
        sparse.raw(),
        &scratch.buffer,
        vec![imp::BufferCopy {
            src_offset: offset,
            dst_offset: 0,
            size: out.len() as u64,
        }],
    );
    commands.transfer_barrier();
    submit(&queue, commands)?;
    scratch.drain(out)
}

pub(crate) fn write_sparse_image(
    image: &SparseImage,
    mip: u32,
    layer: u32,
    origin: [u32; 3],
    extent: [u32; 3],
    data: &[u8],
) -> Result<(), TransferError> {
    let layout = *image.raw().layout();
    check_image_region(&layout, mip, layer, origin, extent, data.len() as u64)?;
    let device = image.device();
    let queue = device.transfer_queue(image.queue_families(), image.sharing_mode())?;
    let scratch = Scratch::new(device, data.len() as u64, BufferUsage::TRANSFER_SRC)?;
    scratch.fill(data)?;
    let pool = device.command_pool(queue.family_index())?;
    let mut commands = pool.one_shot(image.debug_label());
    commands.transfer_barrier();
    commands.copy_buffer_to_image(
        &scratch.buffer,
        image.raw(),
        vec![imp::BufferImageCopy {
            buffer_offset: 0,
            mip,
            layer,
            origin,
            extent,
        }],
    );
    commands.transfer_barrier();
    submit(&queue, commands)
}

pub(crate) fn read_sparse_image(
    image: &SparseImage,
    mip: u32,
    layer: u32,
    origin: [u32; 3],
    extent: [u32; 3],
    out: &mut [u8],
) -> Result<(), TransferError> {
    let layout = *image.raw().layout();
    check_image_region(&layout, mip, layer, origin, extent, out.len() as u64)?;
    let device = image.device();
    let queue = device.transfer_queue(image.queue_families(), image.sharing_mode())?;
    let scratch = Scratch::new(device, out.len() as u64, BufferUsage::TRANSFER_DST)?;
    let pool = device.command_pool(queue.family_index())?;
    let mut commands = pool.one_shot(image.debug_label());
    commands.transfer_barrier();
    commands.copy_image_to_buffer(
        image.raw(),
        &scratch.buffer,
        vec![imp::BufferImageCopy {
            buffer_offset: 0,
            mip,
            layer,
            origin,
            extent,
        }],
    );
    commands.transfer_barrier();
    submit(&queue, commands)?;
    scratch.drain(out)
}
