// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! The software device.
//!
//! Models a discrete GPU with two heaps (device-local and system memory),
//! four memory types, three queue families, and a 64 KiB sparse block.
//! Backing is plain host memory; transfer commands execute on submit;
//! sparse binds maintain a device-side page table distinct from the
//! crate-level residency tracker, which is how the real API behaves.

mod buffer;
mod command;
mod device;
mod image;
mod memory;
mod queue;

pub use buffer::RawBuffer;
pub use command::{BufferCopy, BufferImageCopy, CommandPool, OneShotCommands};
pub use device::{Device, DeviceProfile, Error};
pub use image::{ImageLayout, RawImage};
pub use memory::DeviceMemory;
pub use queue::{Queue, SparseBindBatch, SparseBufferBind, SparseImageBind, SparseTailBind};

/// Process-wide backend entry point.
///
/// The software device needs no loader, but the type exists so the public
/// [crate::entry_point::EntryPoint] has the same shape on every backend.
#[derive(Debug, Clone)]
pub struct EntryPoint;

impl EntryPoint {
    pub fn new() -> Result<Self, Error> {
        Ok(EntryPoint)
    }
}
