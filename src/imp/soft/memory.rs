// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Device memory objects and host mappings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::memory::MemoryFeatures;
use crate::resources::ResourceId;

use super::device::{DeviceShared, Error};

#[derive(Debug)]
struct MemoryInner {
    /// Backing bytes; zero-initialized like freshly allocated device memory
    /// on this model.
    bytes: Mutex<Box<[u8]>>,
    type_index: u32,
    heap_index: u32,
    features: MemoryFeatures,
    size: u64,
    dedicated: Option<ResourceId>,
    /// Flushes issued against this allocation; test introspection.
    flushes: AtomicU64,
    /// Weak so a leaked allocation cannot keep the device alive; budget
    /// return is best-effort at process teardown.
    device: Weak<DeviceShared>,
}

impl Drop for MemoryInner {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            let mut used = device.heap_used.lock().unwrap();
            used[self.heap_index as usize] -= self.size;
        }
    }
}

/// One device allocation.  Clones share the allocation; the backing is
/// released when the last clone drops.
#[derive(Debug, Clone)]
pub struct DeviceMemory {
    inner: Arc<MemoryInner>,
}

impl DeviceMemory {
    pub(super) fn new(
        device: Arc<DeviceShared>,
        type_index: u32,
        heap_index: u32,
        features: MemoryFeatures,
        size: u64,
        dedicated: Option<ResourceId>,
    ) -> DeviceMemory {
        DeviceMemory {
            inner: Arc::new(MemoryInner {
                bytes: Mutex::new(vec![0u8; size as usize].into_boxed_slice()),
                type_index,
                heap_index,
                features,
                size,
                dedicated,
                flushes: AtomicU64::new(0),
                device: Arc::downgrade(&device),
            }),
        }
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn type_index(&self) -> u32 {
        self.inner.type_index
    }

    pub fn features(&self) -> MemoryFeatures {
        self.inner.features
    }

    pub fn is_host_visible(&self) -> bool {
        self.inner.features.contains(MemoryFeatures::HOST_VISIBLE)
    }

    pub fn is_coherent(&self) -> bool {
        self.inner.features.contains(MemoryFeatures::HOST_COHERENT)
    }

    pub fn dedicated_to(&self) -> Option<ResourceId> {
        self.inner.dedicated
    }

    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::Relaxed)
    }

    pub(super) fn same_allocation(&self, other: &DeviceMemory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Map `size` bytes at `offset` for host access.  The mapping is a
    /// scoped guard; dropping it is the unmap.
    pub fn map(&self, offset: u64, size: u64) -> Result<MappedRange, Error> {
        if !self.is_host_visible() {
            return Err(Error::NotHostVisible(self.inner.type_index));
        }
        self.check_range(offset, size)?;
        Ok(MappedRange {
            memory: self.clone(),
            offset,
            size,
        })
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), Error> {
        if offset.checked_add(len).is_none_or(|end| end > self.inner.size) {
            return Err(Error::OutOfBounds {
                offset,
                len,
                size: self.inner.size,
            });
        }
        Ok(())
    }

    /// Device-side byte access, used by command execution and bound
    /// resources.  Not bounds-forgiving.
    pub(super) fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<(), Error> {
        self.check_range(offset, out.len() as u64)?;
        let bytes = self.inner.bytes.lock().unwrap();
        out.copy_from_slice(&bytes[offset as usize..offset as usize + out.len()]);
        Ok(())
    }

    pub(super) fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.check_range(offset, data.len() as u64)?;
        let mut bytes = self.inner.bytes.lock().unwrap();
        bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// A live host mapping of part of a [DeviceMemory].
///
/// Byte-level access only; no raw pointers cross the backend boundary.
#[derive(Debug)]
pub struct MappedRange {
    memory: DeviceMemory,
    offset: u64,
    size: u64,
}

impl MappedRange {
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn check_local(&self, offset: u64, len: u64) -> Result<(), Error> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(Error::OutOfBounds {
                offset,
                len,
                size: self.size,
            });
        }
        Ok(())
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.check_local(offset, data.len() as u64)?;
        self.memory.write_bytes(self.offset + offset, data)
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), Error> {
        self.check_local(offset, out.len() as u64)?;
        self.memory.read_bytes(self.offset + offset, out)
    }

    /// Make host writes visible to the device.  Required on non-coherent
    /// types; a no-op with bookkeeping on this model either way.
    pub fn flush(&self, offset: u64, len: u64) -> Result<(), Error> {
        self.check_local(offset, len)?;
        self.memory.inner.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::device::Device;
    use super::*;

    #[test]
    fn map_write_read_roundtrip() {
        let device = Device::new_for_testing();
        let memory = device.allocate_memory(1, 4096, None).unwrap();
        let map = memory.map(1024, 512).unwrap();
        map.write(0, &[1, 2, 3, 4]).unwrap();
        map.flush(0, 4).unwrap();
        let mut out = [0u8; 4];
        map.read(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(memory.flush_count(), 1);
    }

    #[test]
    fn map_rejects_device_local() {
        let device = Device::new_for_testing();
        let memory = device.allocate_memory(0, 4096, None).unwrap();
        assert!(matches!(memory.map(0, 16), Err(Error::NotHostVisible(0))));
    }

    #[test]
    fn mapping_is_range_checked() {
        let device = Device::new_for_testing();
        let memory = device.allocate_memory(1, 256, None).unwrap();
        assert!(memory.map(128, 256).is_err());
        let map = memory.map(0, 256).unwrap();
        assert!(map.write(250, &[0u8; 16]).is_err());
    }
}
