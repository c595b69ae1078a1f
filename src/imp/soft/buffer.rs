// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Raw buffers and the device-side sparse page table.

use std::sync::{Arc, Mutex};

use crate::resources::BufferUsage;

use super::device::Error;
use super::memory::DeviceMemory;

/// One entry of a sparse buffer's device-side page table.
#[derive(Debug, Clone)]
pub(super) struct SoftPage {
    pub start: u64,
    pub size: u64,
    pub memory: DeviceMemory,
    pub memory_offset: u64,
}

#[derive(Debug)]
struct RawBufferInner {
    size: u64,
    usage: BufferUsage,
    sparse: bool,
    /// Non-sparse binding; write-once in normal operation, cleared only by
    /// the rollback path.
    bound: Mutex<Option<(DeviceMemory, u64)>>,
    /// Sparse device-side page table, kept sorted by start.
    pages: Mutex<Vec<SoftPage>>,
    debug_label: String,
}

/// A buffer object without implied backing.  Clones share identity.
#[derive(Debug, Clone)]
pub struct RawBuffer {
    inner: Arc<RawBufferInner>,
}

impl RawBuffer {
    pub(super) fn new(size: u64, usage: BufferUsage, sparse: bool, debug_label: &str) -> RawBuffer {
        RawBuffer {
            inner: Arc::new(RawBufferInner {
                size,
                usage,
                sparse,
                bound: Mutex::new(None),
                pages: Mutex::new(Vec::new()),
                debug_label: debug_label.to_string(),
            }),
        }
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.usage
    }

    pub fn is_sparse(&self) -> bool {
        self.inner.sparse
    }

    pub fn debug_label(&self) -> &str {
        &self.inner.debug_label
    }

    pub fn same_object(&self, other: &RawBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Bind the whole buffer to `memory` at `offset`.  Rejected for sparse
    /// buffers and for rebinds; dedicated allocations only accept their
    /// designated resource (checked by the caller, which knows the id).
    pub fn bind_memory(&self, memory: &DeviceMemory, offset: u64) -> Result<(), Error> {
        if self.inner.sparse {
            return Err(Error::Sparse);
        }
        if offset + self.inner.size > memory.size() {
            return Err(Error::OutOfBounds {
                offset,
                len: self.inner.size,
                size: memory.size(),
            });
        }
        let mut bound = self.inner.bound.lock().unwrap();
        if bound.is_some() {
            return Err(Error::AlreadyBound);
        }
        *bound = Some((memory.clone(), offset));
        Ok(())
    }

    /// Undo a bind.  The real API cannot do this; the software device
    /// offers it so a failed bake can restore the pre-bake world exactly.
    pub fn unbind_memory(&self) {
        *self.inner.bound.lock().unwrap() = None;
    }

    pub fn is_bound(&self) -> bool {
        self.inner.bound.lock().unwrap().is_some()
    }

    pub(super) fn bound(&self) -> Option<(DeviceMemory, u64)> {
        self.inner.bound.lock().unwrap().clone()
    }

    /// Apply one sparse bind: replace whatever pages `[start, start+size)`
    /// intersected.  `None` memory unbinds the range.
    pub(super) fn apply_sparse_bind(
        &self,
        start: u64,
        size: u64,
        memory: Option<(DeviceMemory, u64)>,
    ) -> Result<(), Error> {
        if !self.inner.sparse {
            return Err(Error::NotSparse);
        }
        if start + size > self.inner.size {
            return Err(Error::OutOfBounds {
                offset: start,
                len: size,
                size: self.inner.size,
            });
        }
        let end = start + size;
        let mut pages = self.inner.pages.lock().unwrap();
        let mut next: Vec<SoftPage> = Vec::with_capacity(pages.len() + 2);
        for page in pages.drain(..) {
            let page_end = page.start + page.size;
            if page_end <= start || page.start >= end {
                next.push(page);
                continue;
            }
            // leading remainder
            if page.start < start {
                next.push(SoftPage {
                    start: page.start,
                    size: start - page.start,
                    memory: page.memory.clone(),
                    memory_offset: page.memory_offset,
                });
            }
            // trailing remainder
            if page_end > end {
                next.push(SoftPage {
                    start: end,
                    size: page_end - end,
                    memory: page.memory.clone(),
                    memory_offset: page.memory_offset + (end - page.start),
                });
            }
        }
        if let Some((memory, memory_offset)) = memory {
            next.push(SoftPage {
                start,
                size,
                memory,
                memory_offset,
            });
        }
        next.sort_by_key(|p| p.start);
        *pages = next;
        Ok(())
    }

    /// Read through the binding (or page table).  Unbound sparse ranges
    /// read as zero.
    pub(super) fn read_at(&self, offset: u64, out: &mut [u8]) -> Result<(), Error> {
        if offset + out.len() as u64 > self.inner.size {
            return Err(Error::OutOfBounds {
                offset,
                len: out.len() as u64,
                size: self.inner.size,
            });
        }
        if !self.inner.sparse {
            let Some((memory, base)) = self.bound() else {
                return Err(Error::NotBound);
            };
            return memory.read_bytes(base + offset, out);
        }
        out.fill(0);
        let end = offset + out.len() as u64;
        let pages = self.inner.pages.lock().unwrap();
        for page in pages.iter() {
            let page_end = page.start + page.size;
            let lo = page.start.max(offset);
            let hi = page_end.min(end);
            if lo < hi {
                let dst = &mut out[(lo - offset) as usize..(hi - offset) as usize];
                page.memory
                    .read_bytes(page.memory_offset + (lo - page.start), dst)?;
            }
        }
        Ok(())
    }

    /// Write through the binding (or page table).  Writes to unbound
    /// sparse ranges are dropped, as on hardware.
    pub(super) fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        if offset + data.len() as u64 > self.inner.size {
            return Err(Error::OutOfBounds {
                offset,
                len: data.len() as u64,
                size: self.inner.size,
            });
        }
        if !self.inner.sparse {
            let Some((memory, base)) = self.bound() else {
                return Err(Error::NotBound);
            };
            return memory.write_bytes(base + offset, data);
        }
        let end = offset + data.len() as u64;
        let pages = self.inner.pages.lock().unwrap();
        for page in pages.iter() {
            let page_end = page.start + page.size;
            let lo = page.start.max(offset);
            let hi = page_end.min(end);
            if lo < hi {
                let src = &data[(lo - offset) as usize..(hi - offset) as usize];
                page.memory
                    .write_bytes(page.memory_offset + (lo - page.start), src)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::device::Device;
    use super::*;

    #[test]
    fn bind_once_then_io() {
        let device = Device::new_for_testing();
        let memory = device.allocate_memory(1, 4096, None).unwrap();
        let buffer = device
            .create_buffer(1024, BufferUsage::TRANSFER_DST, false, "b")
            .unwrap();
        buffer.bind_memory(&memory, 256).unwrap();
        assert!(matches!(
            buffer.bind_memory(&memory, 0),
            Err(Error::AlreadyBound)
        ));
        buffer.write_at(10, &[7, 8, 9]).unwrap();
        let mut out = [0u8; 3];
        buffer.read_at(10, &mut out).unwrap();
        assert_eq!(out, [7, 8, 9]);
        // the bytes landed at the binding offset inside the allocation
        let mut raw = [0u8; 3];
        memory.read_bytes(266, &mut raw).unwrap();
        assert_eq!(raw, [7, 8, 9]);
    }

    #[test]
    fn unbound_buffer_refuses_io() {
        let device = Device::new_for_testing();
        let buffer = device
            .create_buffer(64, BufferUsage::TRANSFER_SRC, false, "b")
            .unwrap();
        let mut out = [0u8; 4];
        assert!(matches!(buffer.read_at(0, &mut out), Err(Error::NotBound)));
    }

    #[test]
    fn sparse_pages_gather_and_scatter() {
        let device = Device::new_for_testing();
        let m1 = device.allocate_memory(1, 65536, None).unwrap();
        let m2 = device.allocate_memory(1, 65536, None).unwrap();
        let buffer = device
            .create_buffer(1 << 20, BufferUsage::STORAGE, true, "sparse")
            .unwrap();
        buffer
            .apply_sparse_bind(0, 65536, Some((m1.clone(), 0)))
            .unwrap();
        buffer
            .apply_sparse_bind(65536, 65536, Some((m2.clone(), 0)))
            .unwrap();

        // a write straddling the page boundary scatters to both allocations
        let data = vec![0xAB; 1024];
        buffer.write_at(65536 - 512, &data).unwrap();
        let mut check = [0u8; 1];
        m1.read_bytes(65536 - 512, &mut check).unwrap();
        assert_eq!(check[0], 0xAB);
        m2.read_bytes(511, &mut check).unwrap();
        assert_eq!(check[0], 0xAB);

        // reads past bound pages come back zero
        let mut out = vec![0xFFu8; 64];
        buffer.read_at(3 << 19, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));

        // rebind the middle; overlapped halves are replaced
        let m3 = device.allocate_memory(1, 65536, None).unwrap();
        buffer
            .apply_sparse_bind(32768, 65536, Some((m3.clone(), 0)))
            .unwrap();
        buffer.write_at(32768, &[1u8]).unwrap();
        m3.read_bytes(0, &mut check).unwrap();
        assert_eq!(check[0], 1);
        // front half of m1's page survives
        buffer.read_at(0, &mut check).unwrap();
    }
}
