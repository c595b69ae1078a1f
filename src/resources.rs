// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Resource wrappers: the device, buffers, images, and their sparse flavors.
//!
//! Wrappers are deliberately thin.  A resource is created in a
//! no-backing-memory state, handed to an [crate::allocator::Allocator], and
//! becomes usable once `bake` succeeds.  Only the surface the allocator,
//! page tracker, and staging engine need is provided here.

pub mod buffer;
pub mod device;
pub mod image;
pub mod sparse_buffer;
pub mod sparse_image;

pub use buffer::{Buffer, BufferView};
pub use device::{Device, DeviceError, ThreadMode};
pub use image::{Image, ImageDescriptor, TexelFormat};
pub use sparse_buffer::SparseBuffer;
pub use sparse_image::SparseImage;

use std::sync::atomic::{AtomicU64, Ordering};

/// Capability handed to sparse resources at construction, consulted lazily
/// the first time their memory is queried.  Replaces a generic event bus:
/// the resource asks whether an allocation is pending for it and, if so,
/// requests one.
pub trait AllocationBroker: Send + Sync + std::fmt::Debug {
    fn is_alloc_pending(&self, resource: ResourceId) -> bool;
    fn request_alloc(&self, resource: ResourceId);
}

/// Opaque identity of one resource, stable for its lifetime.
///
/// Used for dedicated-allocation bookkeeping and log correlation; never
/// reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn next() -> ResourceId {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ResourceId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags::bitflags! {
    /// Declared uses of a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const VERTEX = 1 << 4;
        const INDEX = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Declared uses of an image.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        /// Color or depth attachment.  The device reports these as
        /// dedicated-allocation-required.
        const RENDER_ATTACHMENT = 1 << 4;
    }
}

/// How a resource is shared between queue families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingMode {
    /// Owned by one family at a time; staging transfers use the declared
    /// family (or the caller-specified queue).
    Exclusive,
    /// Usable from every declared family concurrently; staging transfers
    /// pick the cheapest capable queue.
    Concurrent,
}

/// The set of queue families a resource was declared against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueFamilySet(Vec<u32>);

impl QueueFamilySet {
    pub fn new(mut families: Vec<u32>) -> QueueFamilySet {
        families.sort_unstable();
        families.dedup();
        QueueFamilySet(families)
    }

    pub fn contains(&self, family: u32) -> bool {
        self.0.binary_search(&family).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The family when exactly one was declared.
    pub fn singleton(&self) -> Option<u32> {
        if self.0.len() == 1 { Some(self.0[0]) } else { None }
    }
}

impl From<Vec<u32>> for QueueFamilySet {
    fn from(families: Vec<u32>) -> QueueFamilySet {
        QueueFamilySet::new(families)
    }
}
