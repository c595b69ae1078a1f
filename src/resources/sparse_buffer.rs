// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Sparse buffers.
//!
//! A sparse buffer's address space is populated page by page; it never
//! auto-allocates backing at creation.  Every bind goes through the device's
//! sparse-bind queue and is recorded in the resource's page tracker, in that
//! order, so tracker state always describes device state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::imp;
use crate::memory::{HeapBlock, MemoryRequirements, SubAllocation, round_up};
use crate::residency::{BufferPageTracker, BufferTrackerSnapshot, Evicted, Residency};
use crate::resources::device::{Device, DeviceError};
use crate::resources::{AllocationBroker, BufferUsage, QueueFamilySet, ResourceId, SharingMode};
use crate::staging::{self, TransferError};

#[derive(Debug, thiserror::Error)]
pub enum SparseBindError {
    #[error("range {offset}+{size} is not page-aligned (page size {page})")]
    Misaligned { offset: u64, size: u64, page: u64 },
    #[error("range {offset}+{size} exceeds the sparse space of {space} bytes")]
    OutOfRange { offset: u64, size: u64, space: u64 },
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("backend rejected the bind: {0}")]
    Backend(#[from] imp::Error),
}

/// A sparse buffer.  `size` is rounded up to the device's page size, so the
/// last page is always whole.
#[derive(Debug)]
pub struct SparseBuffer {
    id: ResourceId,
    device: Arc<Device>,
    raw: imp::RawBuffer,
    size: u64,
    page_size: u64,
    usage: BufferUsage,
    sharing: SharingMode,
    families: QueueFamilySet,
    tracker: BufferPageTracker,
    aliasing: bool,
    broker: Mutex<Option<Arc<dyn AllocationBroker>>>,
    broker_consulted: AtomicBool,
    debug_label: String,
}

impl SparseBuffer {
    pub fn new(
        device: &Arc<Device>,
        size: u64,
        usage: BufferUsage,
        aliasing: bool,
        sharing: SharingMode,
        families: QueueFamilySet,
        debug_label: &str,
    ) -> Result<Arc<SparseBuffer>, DeviceError> {
        let page_size = device.sparse_page_size();
        let size = round_up(size, page_size);
        let raw = device.imp().create_buffer(size, usage, true, debug_label)?;
        Ok(Arc::new(SparseBuffer {
            id: ResourceId::next(),
            device: device.clone(),
            raw,
            size,
            page_size,
            usage,
            sharing,
            families,
            tracker: BufferPageTracker::new(size, aliasing),
            aliasing,
            broker: Mutex::new(None),
            broker_consulted: AtomicBool::new(false),
            debug_label: debug_label.to_string(),
        }))
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn sharing_mode(&self) -> SharingMode {
        self.sharing
    }

    pub fn queue_families(&self) -> &QueueFamilySet {
        &self.families
    }

    pub fn supports_aliasing(&self) -> bool {
        self.aliasing
    }

    pub fn debug_label(&self) -> &str {
        &self.debug_label
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Requirements for backing one page range; the mask is the oracle's
    /// device-local set and the alignment is the page size.
    pub fn requirements(&self) -> MemoryRequirements {
        self.device.imp().buffer_requirements(&self.raw)
    }

    /// Install the capability consulted when memory is queried while no
    /// pages are bound.
    pub fn set_allocation_broker(&self, broker: Arc<dyn AllocationBroker>) {
        *self.broker.lock().unwrap() = Some(broker);
        self.broker_consulted.store(false, Ordering::Release);
    }

    fn consult_broker(&self) {
        if self.broker_consulted.swap(true, Ordering::AcqRel) {
            return;
        }
        let broker = self.broker.lock().unwrap().clone();
        if let Some(broker) = broker {
            if broker.is_alloc_pending(self.id) {
                broker.request_alloc(self.id);
            }
        }
    }

    pub(crate) fn raw(&self) -> &imp::RawBuffer {
        &self.raw
    }

    pub(crate) fn tracker(&self) -> &BufferPageTracker {
        &self.tracker
    }

    pub(crate) fn snapshot(&self) -> BufferTrackerSnapshot {
        self.tracker.snapshot()
    }

    pub(crate) fn restore(&self, snapshot: BufferTrackerSnapshot) {
        self.tracker.restore(snapshot)
    }

    fn check_range(&self, offset: u64, size: u64) -> Result<(), SparseBindError> {
        if offset % self.page_size != 0 || size % self.page_size != 0 || size == 0 {
            return Err(SparseBindError::Misaligned {
                offset,
                size,
                page: self.page_size,
            });
        }
        if offset.checked_add(size).is_none_or(|end| end > self.size) {
            return Err(SparseBindError::OutOfRange {
                offset,
                size,
                space: self.size,
            });
        }
        Ok(())
    }

    /// Validate the range and append its bind to `batch` without
    /// submitting.  Pair with [SparseBuffer::record_binding] once the batch
    /// lands on the queue.
    pub(crate) fn stage_binding(
        &self,
        batch: &mut imp::SparseBindBatch,
        offset: u64,
        size: u64,
        target: Option<&(Arc<HeapBlock>, u64)>,
    ) -> Result<(), SparseBindError> {
        self.check_range(offset, size)?;
        batch.buffer_binds.push(imp::SparseBufferBind {
            buffer: self.raw.clone(),
            resource_offset: offset,
            size,
            memory: target.map(|(block, block_offset)| (block.memory().clone(), *block_offset)),
        });
        Ok(())
    }

    /// Record a bind the queue already applied.
    pub(crate) fn record_binding(
        &self,
        offset: u64,
        size: u64,
        target: Option<(Arc<HeapBlock>, u64)>,
    ) -> Evicted {
        self.tracker.set_binding(offset, size, target)
    }

    /// Submit one bind to the sparse queue and record it in the tracker.
    /// The queue submission completes before the tracker changes, so a
    /// query that sees the new state is always backed by device state.
    pub(crate) fn apply_binding(
        &self,
        offset: u64,
        size: u64,
        target: Option<(Arc<HeapBlock>, u64)>,
    ) -> Result<Evicted, SparseBindError> {
        let mut batch = imp::SparseBindBatch::new();
        self.stage_binding(&mut batch, offset, size, target.as_ref())?;
        self.device.sparse_queue()?.bind_sparse_and_wait(&batch)?;
        Ok(self.record_binding(offset, size, target))
    }

    /// Bind `[offset, offset+size)` to a slice of `target`, implicitly
    /// unbinding whatever the range previously covered.  Returns the
    /// evicted `(block, offset)` pairs; dropping them releases this
    /// resource's share of the old blocks.
    pub fn bind_region(
        &self,
        offset: u64,
        size: u64,
        target: &SubAllocation,
    ) -> Result<Evicted, SparseBindError> {
        self.apply_binding(offset, size, Some((target.block.clone(), target.offset)))
    }

    /// Unbind `[offset, offset+size)`.
    pub fn unbind_region(&self, offset: u64, size: u64) -> Result<Evicted, SparseBindError> {
        self.apply_binding(offset, size, None)
    }

    /// Residency at one byte offset.
    pub fn residency_at(&self, offset: u64) -> Residency {
        self.tracker.get_binding_at(offset)
    }

    /// The nth heap block referenced by any page of this resource, in
    /// ascending key order.  Consults the allocation broker the first time.
    pub fn memory_block(&self, n: usize) -> Option<Arc<HeapBlock>> {
        self.consult_broker();
        self.tracker.get_memory_block(n)
    }

    pub fn n_bound_bytes(&self) -> u64 {
        self.tracker.n_bound_bytes()
    }

    /// Write through bound pages; writes to unbound pages are dropped, as
    /// on hardware.  Always a staging transfer, since pages are
    /// device-local.
    pub fn write(&self, data: &[u8], offset: u64) -> Result<(), TransferError> {
        staging::write_sparse_buffer(self, offset, data)
    }

    /// Read through bound pages; unbound pages read as zero.
    pub fn read(&self, out: &mut [u8], offset: u64) -> Result<(), TransferError> {
        staging::read_sparse_buffer(self, offset, out)
    }
}

#[cfg(all(test, feature = "backend_soft"))]
mod tests {
    use super::*;

    fn sparse_4mib(device: &Arc<Device>) -> Arc<SparseBuffer> {
        SparseBuffer::new(
            device,
            4 << 20,
            BufferUsage::STORAGE | BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
            false,
            SharingMode::Concurrent,
            QueueFamilySet::default(),
            "sparse_4mib",
        )
        .unwrap()
    }

    fn block(device: &Arc<Device>, size: u64) -> Arc<HeapBlock> {
        use crate::memory::MemoryFeatures;
        let memory = device.imp().allocate_memory(0, size, None).unwrap();
        HeapBlock::new(
            memory,
            0,
            MemoryFeatures::DEVICE_LOCAL,
            size,
            None,
            "test".to_string(),
        )
    }

    #[test]
    fn misaligned_bind_rejected() {
        let device = Device::new_for_testing();
        let sparse = sparse_4mib(&device);
        let backing = block(&device, 1 << 20);
        let sub = backing.suballocate(1 << 20, 65536).unwrap();
        assert!(matches!(
            sparse.bind_region(100, 65536, &sub),
            Err(SparseBindError::Misaligned { .. })
        ));
        assert!(matches!(
            sparse.bind_region(0, 8 << 20, &sub),
            Err(SparseBindError::OutOfRange { .. })
        ));
    }

    #[test]
    fn bind_query_unbind() {
        let device = Device::new_for_testing();
        let sparse = sparse_4mib(&device);
        let backing = block(&device, 1 << 20);
        let sub = backing.suballocate(1 << 20, 65536).unwrap();
        sparse.bind_region(0, 1 << 20, &sub).unwrap();
        assert!(sparse.residency_at(0).is_bound());
        assert_eq!(sparse.n_bound_bytes(), 1 << 20);
        assert!(sparse.memory_block(0).is_some());
        sparse.unbind_region(0, 4 << 20).unwrap();
        assert!(!sparse.residency_at(0).is_bound());
        assert_eq!(sparse.n_bound_bytes(), 0);
    }

    #[test]
    fn broker_is_consulted_once_on_memory_query() {
        use std::sync::atomic::AtomicUsize;

        #[derive(Debug, Default)]
        struct Counting {
            asked: AtomicUsize,
            requested: AtomicUsize,
        }
        impl AllocationBroker for Counting {
            fn is_alloc_pending(&self, _resource: ResourceId) -> bool {
                self.asked.fetch_add(1, Ordering::Relaxed);
                true
            }
            fn request_alloc(&self, _resource: ResourceId) {
                self.requested.fetch_add(1, Ordering::Relaxed);
            }
        }

        let device = Device::new_for_testing();
        let sparse = sparse_4mib(&device);
        let broker = Arc::new(Counting::default());
        sparse.set_allocation_broker(broker.clone());
        sparse.memory_block(0);
        sparse.memory_block(0);
        assert_eq!(broker.asked.load(Ordering::Relaxed), 1);
        assert_eq!(broker.requested.load(Ordering::Relaxed), 1);
    }
}
