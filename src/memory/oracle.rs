// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! The physical-device oracle: the read-only tables a backend reports once
//! per device.
//!
//! The allocator treats everything here as immutable input.  A backend builds
//! one [MemoryTypeTable] and one queue-family list at device creation and
//! never changes them.

use crate::memory::features::{MemoryFeatures, MemoryTypeMask};

/// One entry of the device's memory-type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    /// Index into the heap table.
    pub heap_index: u32,
    /// Properties offered by this type.
    pub features: MemoryFeatures,
}

/// One device memory heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
    /// Total heap size in bytes.  The backend refuses allocations past this.
    pub size: u64,
}

/// The device's memory-type and heap tables.
#[derive(Debug, Clone)]
pub struct MemoryTypeTable {
    types: Vec<MemoryType>,
    heaps: Vec<MemoryHeap>,
}

impl MemoryTypeTable {
    pub fn new(types: Vec<MemoryType>, heaps: Vec<MemoryHeap>) -> MemoryTypeTable {
        debug_assert!(types.len() <= 32, "type mask is a u32");
        debug_assert!(types.iter().all(|t| (t.heap_index as usize) < heaps.len()));
        MemoryTypeTable { types, heaps }
    }

    pub fn types(&self) -> &[MemoryType] {
        &self.types
    }

    pub fn heaps(&self) -> &[MemoryHeap] {
        &self.heaps
    }

    pub fn type_at(&self, index: u32) -> &MemoryType {
        &self.types[index as usize]
    }

    pub fn heap_size_of_type(&self, index: u32) -> u64 {
        self.heaps[self.type_at(index).heap_index as usize].size
    }

    /// The mask covering every reported type.
    pub fn full_mask(&self) -> MemoryTypeMask {
        MemoryTypeMask::all(self.types.len() as u32)
    }

    /// The subset of `mask` whose types offer every required bit of
    /// `features`.
    pub fn mask_satisfying(&self, mask: MemoryTypeMask, features: MemoryFeatures) -> MemoryTypeMask {
        let mut out = MemoryTypeMask::NONE;
        for index in mask.indices() {
            if (index as usize) < self.types.len()
                && features.satisfied_by(self.type_at(index).features)
            {
                out = MemoryTypeMask(out.0 | 1 << index);
            }
        }
        out
    }
}

bitflags::bitflags! {
    /// Operations a queue family supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueCapabilities: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
        const SPARSE_BIND = 1 << 3;
    }
}

/// One queue family as reported by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub capabilities: QueueCapabilities,
    pub queue_count: u32,
}

/// Whether the device query asked for a dedicated allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DedicatedHint {
    #[default]
    None,
    /// The implementation would prefer its own block but binding into a
    /// shared one is legal.
    Preferred,
    /// The resource must receive its own block at offset zero.
    Required,
}

impl DedicatedHint {
    /// Dedicated-preferred and dedicated-required intents both form
    /// singleton groups.
    pub fn forces_singleton(self) -> bool {
        !matches!(self, DedicatedHint::None)
    }
}

/// Per-resource memory requirements, as reported by the device query.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRequirements {
    /// Bytes of backing the resource needs.  For dedicated-required
    /// resources this may exceed the resource's logical size by padding.
    pub size: u64,
    /// Required offset alignment within a block.
    pub alignment: u64,
    /// Types this resource may bind to.
    pub type_mask: MemoryTypeMask,
    /// Dedicated-allocation preference.
    pub dedicated: DedicatedHint,
}
