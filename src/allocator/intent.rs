// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Binding intents: one record per add call.

use std::sync::Arc;

use crate::memory::{DedicatedHint, MemoryFeatures, MemoryTypeMask};
use crate::residency::{ImageRegionKey, MipTailKey};
use crate::resources::{Buffer, Image, ResourceId, SparseBuffer, SparseImage};

/// Initial client bytes, delivered once the resource is bound.
#[derive(Debug)]
pub(crate) struct InitialData {
    pub bytes: Box<[u8]>,
    /// Byte offset within the resource (buffers); zero for images, whose
    /// data fills mip 0 / layer 0.
    pub offset: u64,
}

/// What kind of thing an intent binds.  A closed union: the allocator
/// switches on the tag, and no new kinds appear at runtime.
#[derive(Debug, Clone)]
pub(crate) enum IntentKind {
    Buffer(Arc<Buffer>),
    Image(Arc<Image>),
    SparseBufferRegion {
        buffer: Arc<SparseBuffer>,
        offset: u64,
        size: u64,
    },
    SparseImageRegion {
        image: Arc<SparseImage>,
        key: ImageRegionKey,
    },
    SparseMipTail {
        image: Arc<SparseImage>,
        key: MipTailKey,
    },
}

/// One recorded add call, carrying everything grouping and placement need.
#[derive(Debug)]
pub(crate) struct BindingIntent {
    pub resource: ResourceId,
    pub kind: IntentKind,
    pub size: u64,
    pub alignment: u64,
    pub type_mask: MemoryTypeMask,
    pub required: MemoryFeatures,
    pub dedicated: DedicatedHint,
    pub data: Option<InitialData>,
}

impl BindingIntent {
    pub fn is_sparse(&self) -> bool {
        !matches!(self.kind, IntentKind::Buffer(_) | IntentKind::Image(_))
    }
}
