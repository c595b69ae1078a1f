// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Queues: command submission and sparse binding.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::memory::{QueueCapabilities, QueueFamilyInfo};

use super::buffer::RawBuffer;
use super::command::OneShotCommands;
use super::device::{DeviceShared, Error};
use super::image::RawImage;
use super::memory::DeviceMemory;

/// Rebind one range of a sparse buffer.  `memory: None` unbinds.
#[derive(Debug)]
pub struct SparseBufferBind {
    pub buffer: RawBuffer,
    pub resource_offset: u64,
    pub size: u64,
    pub memory: Option<(DeviceMemory, u64)>,
}

/// Rebind one tile of a sparse image.
#[derive(Debug)]
pub struct SparseImageBind {
    pub image: RawImage,
    pub mip: u32,
    pub layer: u32,
    pub tile: [u32; 3],
    pub memory: Option<(DeviceMemory, u64)>,
}

/// Rebind a sparse image's opaque mip tail.
#[derive(Debug)]
pub struct SparseTailBind {
    pub image: RawImage,
    pub memory: Option<(DeviceMemory, u64)>,
}

/// One sparse-binding submission.  The queue applies every bind before
/// returning; a batch is all-or-nothing only in the sense that validation
/// errors abort it, so callers build batches they know are valid.
#[derive(Debug, Default)]
pub struct SparseBindBatch {
    pub buffer_binds: Vec<SparseBufferBind>,
    pub image_binds: Vec<SparseImageBind>,
    pub tail_binds: Vec<SparseTailBind>,
}

impl SparseBindBatch {
    pub fn new() -> SparseBindBatch {
        SparseBindBatch::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer_binds.is_empty() && self.image_binds.is_empty() && self.tail_binds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer_binds.len() + self.image_binds.len() + self.tail_binds.len()
    }
}

#[derive(Debug)]
struct QueueInner {
    device: Arc<DeviceShared>,
    family: QueueFamilyInfo,
    submits: AtomicU64,
    sparse_binds: AtomicU64,
}

/// One queue of a family.  Clones share the queue.
#[derive(Debug, Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    pub(super) fn new(device: Arc<DeviceShared>, family: QueueFamilyInfo) -> Queue {
        Queue {
            inner: Arc::new(QueueInner {
                device,
                family,
                submits: AtomicU64::new(0),
                sparse_binds: AtomicU64::new(0),
            }),
        }
    }

    pub fn family_index(&self) -> u32 {
        self.inner.family.index
    }

    pub fn capabilities(&self) -> QueueCapabilities {
        self.inner.family.capabilities
    }

    /// Submits executed so far; test introspection.
    pub fn submit_count(&self) -> u64 {
        self.inner.submits.load(Ordering::Relaxed)
    }

    pub fn sparse_bind_count(&self) -> u64 {
        self.inner.sparse_binds.load(Ordering::Relaxed)
    }

    /// Submit a one-shot command buffer and block until it completes.
    /// Execution is synchronous on this device, so completion is implied.
    pub fn submit_and_wait(&self, commands: OneShotCommands) -> Result<(), Error> {
        if !self.capabilities().contains(QueueCapabilities::TRANSFER) {
            return Err(Error::UnsupportedOperation {
                family: self.family_index(),
                operation: "transfer",
            });
        }
        if commands.family_index() != self.family_index() {
            return Err(Error::BadQueueFamily(commands.family_index()));
        }
        commands.execute()?;
        self.inner.submits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Apply a sparse-binding batch and block until it is visible.
    pub fn bind_sparse_and_wait(&self, batch: &SparseBindBatch) -> Result<(), Error> {
        if !self.capabilities().contains(QueueCapabilities::SPARSE_BIND) {
            return Err(Error::UnsupportedOperation {
                family: self.family_index(),
                operation: "sparse bind",
            });
        }
        let block = self.inner.device.profile.sparse_block_size;
        for bind in &batch.buffer_binds {
            if bind.resource_offset % block != 0 || bind.size % block != 0 {
                return Err(Error::UnsupportedOperation {
                    family: self.family_index(),
                    operation: "bind at sub-block granularity",
                });
            }
            bind.buffer
                .apply_sparse_bind(bind.resource_offset, bind.size, bind.memory.clone())?;
        }
        for bind in &batch.image_binds {
            bind.image
                .apply_tile_bind(bind.mip, bind.layer, bind.tile, bind.memory.clone())?;
        }
        for bind in &batch.tail_binds {
            bind.image.apply_tail_bind(bind.memory.clone())?;
        }
        self.inner.sparse_binds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::device::Device;
    use super::*;
    use crate::resources::BufferUsage;

    #[test]
    fn transfer_only_family_rejects_sparse() {
        let device = Device::new_for_testing();
        let queue = device.queue(2).unwrap();
        let batch = SparseBindBatch::new();
        assert!(matches!(
            queue.bind_sparse_and_wait(&batch),
            Err(Error::UnsupportedOperation { family: 2, .. })
        ));
    }

    #[test]
    fn sparse_batch_applies_buffer_binds() {
        let device = Device::new_for_testing();
        let queue = device.queue(0).unwrap();
        let memory = device.allocate_memory(0, 65536, None).unwrap();
        let buffer = device
            .create_buffer(1 << 20, BufferUsage::STORAGE, true, "s")
            .unwrap();
        let mut batch = SparseBindBatch::new();
        batch.buffer_binds.push(SparseBufferBind {
            buffer: buffer.clone(),
            resource_offset: 0,
            size: 65536,
            memory: Some((memory, 0)),
        });
        queue.bind_sparse_and_wait(&batch).unwrap();
        assert_eq!(queue.sparse_bind_count(), 1);
    }

    #[test]
    fn submit_family_must_match_pool_family() {
        let device = Device::new_for_testing();
        let pool = device.create_command_pool(0).unwrap();
        let commands = pool.one_shot("wrong queue");
        let queue = device.queue(2).unwrap();
        assert!(matches!(
            queue.submit_and_wait(commands),
            Err(Error::BadQueueFamily(0))
        ));
    }
}
