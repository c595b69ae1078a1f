// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Non-sparse buffers and child views.

use std::sync::{Arc, Mutex};

use crate::imp;
use crate::memory::{HeapBlock, MemoryRequirements, SubAllocation};
use crate::resources::device::{Device, DeviceError};
use crate::resources::{BufferUsage, QueueFamilySet, ResourceId, SharingMode};
use crate::staging::{self, TransferError};

/// A buffer created without backing memory.
///
/// The buffer becomes usable after an [crate::allocator::Allocator] bake
/// installs its [SubAllocation]; until then read/write report
/// [TransferError::NotBaked].  The installed sub-allocation holds an
/// `Arc<HeapBlock>`, so the block outlives every buffer bound into it.
#[derive(Debug)]
pub struct Buffer {
    id: ResourceId,
    device: Arc<Device>,
    raw: imp::RawBuffer,
    size: u64,
    usage: BufferUsage,
    sharing: SharingMode,
    families: QueueFamilySet,
    backing: Mutex<Option<SubAllocation>>,
    debug_label: String,
}

impl Buffer {
    pub fn new(
        device: &Arc<Device>,
        size: u64,
        usage: BufferUsage,
        sharing: SharingMode,
        families: QueueFamilySet,
        debug_label: &str,
    ) -> Result<Arc<Buffer>, DeviceError> {
        let raw = device.imp().create_buffer(size, usage, false, debug_label)?;
        Ok(Arc::new(Buffer {
            id: ResourceId::next(),
            device: device.clone(),
            raw,
            size,
            usage,
            sharing,
            families,
            backing: Mutex::new(None),
            debug_label: debug_label.to_string(),
        }))
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
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

    pub fn debug_label(&self) -> &str {
        &self.debug_label
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Size, alignment, type mask, and dedicated hint as the oracle reports
    /// them for this buffer.
    pub fn requirements(&self) -> MemoryRequirements {
        self.device.imp().buffer_requirements(&self.raw)
    }

    pub fn is_baked(&self) -> bool {
        self.backing.lock().unwrap().is_some()
    }

    /// The installed sub-allocation, if baked.
    pub fn binding(&self) -> Option<SubAllocation> {
        self.backing.lock().unwrap().clone()
    }

    /// The heap block backing this buffer, if baked.
    pub fn memory_block(&self) -> Option<Arc<HeapBlock>> {
        self.backing.lock().unwrap().as_ref().map(|s| s.block.clone())
    }

    pub(crate) fn raw(&self) -> &imp::RawBuffer {
        &self.raw
    }

    pub(crate) fn install_backing(&self, sub: SubAllocation) {
        *self.backing.lock().unwrap() = Some(sub);
    }

    /// Rollback path only: uninstall the backing and unbind the raw object.
    pub(crate) fn clear_backing(&self) {
        self.raw.unbind_memory();
        *self.backing.lock().unwrap() = None;
    }

    /// Write `data` at `offset`, through the mapping when the backing is
    /// host-visible and through a staging copy otherwise.  Blocks until the
    /// bytes are visible to the device.
    pub fn write(&self, data: &[u8], offset: u64) -> Result<(), TransferError> {
        staging::write_buffer(self, offset, data)
    }

    /// Read into `out` from `offset`.  Blocks until the bytes are host
    /// visible.
    pub fn read(&self, out: &mut [u8], offset: u64) -> Result<(), TransferError> {
        staging::read_buffer(self, offset, out)
    }

    /// A view of `[offset, offset+size)` of this buffer.  The view borrows
    /// the parent's backing; no allocation occurs and the parent cannot be
    /// destroyed while views exist.
    pub fn child_view(
        self: &Arc<Self>,
        offset: u64,
        size: u64,
    ) -> Result<BufferView, TransferError> {
        if offset.checked_add(size).is_none_or(|end| end > self.size) {
            return Err(TransferError::OutOfRange {
                offset,
                len: size,
                size: self.size,
            });
        }
        Ok(BufferView {
            parent: self.clone(),
            offset,
            size,
        })
    }
}

/// A logical slice of a parent [Buffer].
///
/// Shares the parent's heap block and offset; reads and writes are
/// translated into the parent's range.
#[derive(Debug, Clone)]
pub struct BufferView {
    parent: Arc<Buffer>,
    offset: u64,
    size: u64,
}

impl BufferView {
    pub fn parent(&self) -> &Arc<Buffer> {
        &self.parent
    }

    /// Offset of this view within the parent.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The parent's heap block; a view never has its own.
    pub fn memory_block(&self) -> Option<Arc<HeapBlock>> {
        self.parent.memory_block()
    }

    /// The view's absolute position: the parent's binding displaced by the
    /// view offset.
    pub fn binding(&self) -> Option<SubAllocation> {
        self.parent.binding().map(|sub| SubAllocation {
            block: sub.block,
            offset: sub.offset + self.offset,
            size: self.size,
        })
    }

    fn check(&self, offset: u64, len: u64) -> Result<(), TransferError> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(TransferError::OutOfRange {
                offset,
                len,
                size: self.size,
            });
        }
        Ok(())
    }

    pub fn write(&self, data: &[u8], offset: u64) -> Result<(), TransferError> {
        self.check(offset, data.len() as u64)?;
        self.parent.write(data, self.offset + offset)
    }

    pub fn read(&self, out: &mut [u8], offset: u64) -> Result<(), TransferError> {
        self.check(offset, out.len() as u64)?;
        self.parent.read(out, self.offset + offset)
    }
}

#[cfg(all(test, feature = "backend_soft"))]
mod tests {
    use super::*;

    #[test]
    fn unbaked_buffer_rejects_io() {
        let device = Device::new_for_testing();
        let buffer = Buffer::new(
            &device,
            256,
            BufferUsage::TRANSFER_DST,
            SharingMode::Concurrent,
            QueueFamilySet::default(),
            "unbaked",
        )
        .unwrap();
        assert!(!buffer.is_baked());
        assert!(matches!(
            buffer.write(&[1, 2, 3], 0),
            Err(TransferError::NotBaked)
        ));
    }

    #[test]
    fn child_view_is_range_checked() {
        let device = Device::new_for_testing();
        let buffer = Buffer::new(
            &device,
            256,
            BufferUsage::TRANSFER_DST,
            SharingMode::Concurrent,
            QueueFamilySet::default(),
            "parent",
        )
        .unwrap();
        assert!(buffer.child_view(200, 100).is_err());
        let view = buffer.child_view(64, 64).unwrap();
        assert_eq!(view.offset(), 64);
        assert!(view.write(&[0u8; 65], 0).is_err());
    }
}
