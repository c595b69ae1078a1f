// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! The memory data model: feature sets, the physical-device oracle tables,
//! heap blocks, and sub-allocations.
//!
//! Nothing in this module talks to a queue.  It is the vocabulary shared by
//! the allocator, the page tracker, and the backend.

pub mod features;
pub mod heap_block;
pub mod oracle;

pub use features::{MemoryFeatures, MemoryTypeMask, round_up};
pub use heap_block::{HeapBlock, SubAllocation};
pub use oracle::{
    DedicatedHint, MemoryHeap, MemoryRequirements, MemoryType, MemoryTypeTable, QueueCapabilities,
    QueueFamilyInfo,
};
