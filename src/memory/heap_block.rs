// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Heap blocks and sub-allocations.
//!
//! A [HeapBlock] is one contiguous device allocation.  Everything that holds
//! a piece of it — a bound resource, a sparse page binding, the allocator
//! while a bake is in flight — holds an `Arc<HeapBlock>`.  The backing
//! [crate::imp::DeviceMemory] is released when the last `Arc` drops, which is
//! exactly the "reference count reaches zero" rule of the design.

use std::sync::{Arc, Mutex};

use crate::imp;
use crate::memory::features::{MemoryFeatures, round_up};
use crate::resources::ResourceId;

/// One contiguous device allocation.
///
/// The block carries a free-offset cursor used only during its initial
/// sub-allocation pass; sub-ranges are never recycled within a block.
#[derive(Debug)]
pub struct HeapBlock {
    memory: imp::DeviceMemory,
    memory_type_index: u32,
    features: MemoryFeatures,
    size: u64,
    /// Present when this block backs exactly one resource.
    dedicated_to: Option<ResourceId>,
    cursor: Mutex<u64>,
    debug_label: String,
}

impl HeapBlock {
    pub(crate) fn new(
        memory: imp::DeviceMemory,
        memory_type_index: u32,
        features: MemoryFeatures,
        size: u64,
        dedicated_to: Option<ResourceId>,
        debug_label: String,
    ) -> Arc<HeapBlock> {
        Arc::new(HeapBlock {
            memory,
            memory_type_index,
            features,
            size,
            dedicated_to,
            cursor: Mutex::new(0),
            debug_label,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn features(&self) -> MemoryFeatures {
        self.features
    }

    pub fn is_host_visible(&self) -> bool {
        self.features.contains(MemoryFeatures::HOST_VISIBLE)
    }

    pub fn is_coherent(&self) -> bool {
        self.features.contains(MemoryFeatures::HOST_COHERENT)
    }

    pub fn dedicated_to(&self) -> Option<ResourceId> {
        self.dedicated_to
    }

    pub fn debug_label(&self) -> &str {
        &self.debug_label
    }

    pub(crate) fn memory(&self) -> &imp::DeviceMemory {
        &self.memory
    }

    /// Take the next `size` bytes at `alignment` from the cursor.
    ///
    /// Returns `None` when the block cannot fit the request; the allocator
    /// sizes blocks so that this never happens for a well-formed plan, and
    /// the commit pass treats `None` as an invariant violation.  Blocks
    /// allocated directly via [crate::resources::Device::allocate_block] use
    /// this to carve out targets for sparse page binds.
    pub fn suballocate(self: &Arc<Self>, size: u64, alignment: u64) -> Option<SubAllocation> {
        let mut cursor = self.cursor.lock().unwrap();
        let offset = round_up(*cursor, alignment);
        if offset.checked_add(size)? > self.size {
            return None;
        }
        *cursor = offset + size;
        Some(SubAllocation {
            block: self.clone(),
            offset,
            size,
        })
    }
}

/// A contiguous interval inside a heap block, assigned to one resource.
#[derive(Debug, Clone)]
pub struct SubAllocation {
    pub block: Arc<HeapBlock>,
    pub offset: u64,
    pub size: u64,
}

impl SubAllocation {
    /// Offset of the byte one past the end of this sub-allocation.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}
