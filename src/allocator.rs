// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! The batching allocator.
//!
//! An [Allocator] collects binding intents for many resources and commits
//! them in one `bake`: intents are partitioned into compatibility groups,
//! one heap block is allocated per group, each member receives a sub-range,
//! and every resource is bound and (optionally) filled with its initial
//! data.  `bake` is transactional: on any failure every binding it made is
//! undone, every block it allocated is released, and each touched sparse
//! tracker is restored to its pre-bake state.
//!
//! The allocator is one-shot.  Build it, add intents, bake, drop it.
//! Resources that need more memory later go through a fresh allocator.

mod commit;
mod grouping;
mod intent;
mod placement;

use std::sync::Arc;

use crate::imp;
use crate::memory::{MemoryFeatures, MemoryRequirements};
use crate::residency::{ImageAspect, ImageRegionKey};
use crate::resources::{Buffer, Device, Image, ResourceId, SparseBuffer, SparseImage};
use crate::staging::TransferError;
use intent::{BindingIntent, InitialData, IntentKind};

/// Why a `bake` failed.  The allocator has already rolled back when one of
/// these is returned.
#[derive(Debug, thiserror::Error)]
pub enum BakeError {
    /// No memory type on this device offers the features a resource
    /// requires.  Detected before anything is allocated.
    #[error("no memory type for resource {resource} offers {required:?}")]
    NoCompatibleMemoryType {
        resource: ResourceId,
        required: MemoryFeatures,
    },
    /// Every candidate heap refused the group's block.
    #[error("could not allocate a {size}-byte block: {source}")]
    AllocationFailed {
        size: u64,
        #[source]
        source: imp::Error,
    },
    /// The device rejected a bind after allocation succeeded.
    #[error("bind failed after allocation: {detail}")]
    BindFailed { detail: String },
    /// Binding succeeded but an initial-data upload did not.
    #[error("initial data upload failed")]
    InitialUploadFailed {
        #[source]
        source: TransferError,
    },
}

/// Why an intent was refused at add time.  A refused add leaves the
/// allocator unchanged; previously added intents are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum AddError {
    #[error("resource already has backing memory")]
    AlreadyBound,
    #[error("resource or region was already added to this allocator")]
    Duplicate,
    #[error("region {offset}+{size} is not aligned to the {page}-byte page")]
    Misaligned { offset: u64, size: u64, page: u64 },
    #[error("region {offset}+{size} exceeds the resource's {space} bytes")]
    OutOfRange { offset: u64, size: u64, space: u64 },
    #[error("initial data is {actual} bytes; the target holds {expected}")]
    DataSizeMismatch { expected: u64, actual: u64 },
    #[error("image has no mip tail")]
    NoMipTail,
    #[error("device rejected the region")]
    Device(#[source] crate::resources::sparse_buffer::SparseBindError),
}

impl From<crate::resources::sparse_buffer::SparseBindError> for AddError {
    fn from(err: crate::resources::sparse_buffer::SparseBindError) -> AddError {
        use crate::resources::sparse_buffer::SparseBindError;
        match err {
            SparseBindError::Misaligned { offset, size, page } => {
                AddError::Misaligned { offset, size, page }
            }
            SparseBindError::OutOfRange { offset, size, space } => {
                AddError::OutOfRange { offset, size, space }
            }
            err @ (SparseBindError::Device(_) | SparseBindError::Backend(_)) => {
                AddError::Device(err)
            }
        }
    }
}

/// A one-shot batch of binding intents.
///
/// Adds validate eagerly and record an intent; nothing touches the device
/// until [Allocator::bake].
#[derive(Debug)]
pub struct Allocator {
    device: Arc<Device>,
    intents: Vec<BindingIntent>,
    debug_label: String,
}

impl Allocator {
    pub fn new(device: &Arc<Device>, debug_label: &str) -> Allocator {
        Allocator {
            device: device.clone(),
            intents: Vec::new(),
            debug_label: debug_label.to_string(),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn debug_label(&self) -> &str {
        &self.debug_label
    }

    /// Intents recorded so far.
    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    fn has_resource(&self, resource: ResourceId) -> bool {
        self.intents.iter().any(|i| i.resource == resource)
    }

    fn push_whole_resource(
        &mut self,
        resource: ResourceId,
        kind: IntentKind,
        requirements: MemoryRequirements,
        required: MemoryFeatures,
        data: Option<InitialData>,
    ) {
        self.intents.push(BindingIntent {
            resource,
            kind,
            size: requirements.size,
            alignment: requirements.alignment,
            type_mask: requirements.type_mask,
            required,
            dedicated: requirements.dedicated,
            data,
        });
    }

    /// Record a buffer for backing.  `required` narrows the memory types
    /// the buffer may land in; pass [MemoryFeatures::MAPPABLE] for a
    /// host-writable buffer, or nothing to let placement prefer
    /// device-local memory.
    pub fn add_buffer(
        &mut self,
        buffer: &Arc<Buffer>,
        required: MemoryFeatures,
    ) -> Result<(), AddError> {
        self.add_buffer_inner(buffer, required, None)
    }

    /// Like [Allocator::add_buffer], with `data` uploaded to `offset` once
    /// the buffer is bound.
    pub fn add_buffer_with_data(
        &mut self,
        buffer: &Arc<Buffer>,
        required: MemoryFeatures,
        data: &[u8],
        offset: u64,
    ) -> Result<(), AddError> {
        if offset
            .checked_add(data.len() as u64)
            .is_none_or(|end| end > buffer.size())
        {
            return Err(AddError::OutOfRange {
                offset,
                size: data.len() as u64,
                space: buffer.size(),
            });
        }
        self.add_buffer_inner(
            buffer,
            required,
            Some(InitialData {
                bytes: data.into(),
                offset,
            }),
        )
    }

    fn add_buffer_inner(
        &mut self,
        buffer: &Arc<Buffer>,
        required: MemoryFeatures,
        data: Option<InitialData>,
    ) -> Result<(), AddError> {
        if buffer.is_baked() {
            return Err(AddError::AlreadyBound);
        }
        if self.has_resource(buffer.id()) {
            return Err(AddError::Duplicate);
        }
        let requirements = buffer.requirements();
        self.push_whole_resource(
            buffer.id(),
            IntentKind::Buffer(buffer.clone()),
            requirements,
            required,
            data,
        );
        Ok(())
    }

    /// Record an image for backing.  Dedicated-allocation hints from the
    /// device query are honored: a dedicated image always receives its own
    /// block.
    pub fn add_image(
        &mut self,
        image: &Arc<Image>,
        required: MemoryFeatures,
    ) -> Result<(), AddError> {
        self.add_image_inner(image, required, None)
    }

    /// Like [Allocator::add_image], with `data` filling mip 0, layer 0 once
    /// the image is bound.  `data` must be the tightly packed size of that
    /// subresource.
    pub fn add_image_with_data(
        &mut self,
        image: &Arc<Image>,
        required: MemoryFeatures,
        data: &[u8],
    ) -> Result<(), AddError> {
        let extent = image.descriptor().extent;
        let expected = extent[0] as u64
            * extent[1] as u64
            * extent[2] as u64
            * image.descriptor().format.bytes_per_texel() as u64;
        if data.len() as u64 != expected {
            return Err(AddError::DataSizeMismatch {
                expected,
                actual: data.len() as u64,
            });
        }
        self.add_image_inner(
            image,
            required,
            Some(InitialData {
                bytes: data.into(),
                offset: 0,
            }),
        )
    }

    fn add_image_inner(
        &mut self,
        image: &Arc<Image>,
        required: MemoryFeatures,
        data: Option<InitialData>,
    ) -> Result<(), AddError> {
        if image.is_baked() {
            return Err(AddError::AlreadyBound);
        }
        if self.has_resource(image.id()) {
            return Err(AddError::Duplicate);
        }
        let requirements = image.requirements();
        self.push_whole_resource(
            image.id(),
            IntentKind::Image(image.clone()),
            requirements,
            required,
            data,
        );
        Ok(())
    }

    /// Record backing for `[offset, offset+size)` of a sparse buffer.  The
    /// range must be page-aligned; the same resource may appear many times
    /// with disjoint ranges.
    pub fn add_sparse_buffer_region(
        &mut self,
        buffer: &Arc<SparseBuffer>,
        offset: u64,
        size: u64,
        required: MemoryFeatures,
    ) -> Result<(), AddError> {
        let page = buffer.page_size();
        if offset % page != 0 || size % page != 0 || size == 0 {
            return Err(AddError::Misaligned { offset, size, page });
        }
        if offset.checked_add(size).is_none_or(|end| end > buffer.size()) {
            return Err(AddError::OutOfRange {
                offset,
                size,
                space: buffer.size(),
            });
        }
        let overlaps = self.intents.iter().any(|i| match &i.kind {
            IntentKind::SparseBufferRegion {
                buffer: other,
                offset: other_offset,
                size: other_size,
            } => {
                other.id() == buffer.id()
                    && offset < other_offset + other_size
                    && *other_offset < offset + size
            }
            _ => false,
        });
        if overlaps {
            return Err(AddError::Duplicate);
        }
        let requirements = buffer.requirements();
        self.intents.push(BindingIntent {
            resource: buffer.id(),
            kind: IntentKind::SparseBufferRegion {
                buffer: buffer.clone(),
                offset,
                size,
            },
            size,
            alignment: page,
            type_mask: requirements.type_mask,
            required,
            dedicated: crate::memory::DedicatedHint::None,
            data: None,
        });
        Ok(())
    }

    /// Record backing for the tiles of one subresource region of a sparse
    /// image.  A `mip` inside the mip tail records the whole tail instead;
    /// `origin` and `extent` are ignored for tail mips.
    #[allow(clippy::too_many_arguments)]
    pub fn add_sparse_image_subresource(
        &mut self,
        image: &Arc<SparseImage>,
        aspect: ImageAspect,
        mip: u32,
        layer: u32,
        origin: [u32; 3],
        extent: [u32; 3],
        required: MemoryFeatures,
    ) -> Result<(), AddError> {
        if mip >= image.mip_tail_first_lod() {
            return self.add_sparse_mip_tail(image, aspect, required);
        }
        let key = ImageRegionKey {
            aspect,
            mip,
            layer,
            origin,
            extent,
        };
        let tiles = image.check_region(&key)?;
        let duplicate = self.intents.iter().any(|i| match &i.kind {
            IntentKind::SparseImageRegion {
                image: other,
                key: other_key,
            } => other.id() == image.id() && *other_key == key,
            _ => false,
        });
        if duplicate {
            return Err(AddError::Duplicate);
        }
        let tile_size = image.tile_size();
        let size = tiles[0] as u64 * tiles[1] as u64 * tiles[2] as u64 * tile_size;
        let requirements = image.requirements();
        self.intents.push(BindingIntent {
            resource: image.id(),
            kind: IntentKind::SparseImageRegion {
                image: image.clone(),
                key,
            },
            size,
            alignment: tile_size,
            type_mask: requirements.type_mask,
            required,
            dedicated: crate::memory::DedicatedHint::None,
            data: None,
        });
        Ok(())
    }

    /// Record backing for a sparse image's whole mip tail.
    pub fn add_sparse_mip_tail(
        &mut self,
        image: &Arc<SparseImage>,
        aspect: ImageAspect,
        required: MemoryFeatures,
    ) -> Result<(), AddError> {
        if image.mip_tail_size() == 0 {
            return Err(AddError::NoMipTail);
        }
        let key = image.mip_tail_key(aspect);
        let duplicate = self.intents.iter().any(|i| match &i.kind {
            IntentKind::SparseMipTail {
                image: other,
                key: other_key,
            } => other.id() == image.id() && other_key.aspect == key.aspect,
            _ => false,
        });
        if duplicate {
            return Err(AddError::Duplicate);
        }
        let requirements = image.requirements();
        self.intents.push(BindingIntent {
            resource: image.id(),
            kind: IntentKind::SparseMipTail {
                image: image.clone(),
                key,
            },
            size: image.mip_tail_size(),
            alignment: image.tile_size(),
            type_mask: requirements.type_mask,
            required,
            dedicated: crate::memory::DedicatedHint::None,
            data: None,
        });
        Ok(())
    }

    /// Commit every recorded intent: group, allocate, sub-allocate, bind,
    /// upload.  All-or-nothing; see [BakeError] for the failure contract.
    pub fn bake(self) -> Result<(), BakeError> {
        let interval = logwise::perfwarn_begin!("allocator bake");
        let count = self.intents.len();
        let result = commit::run(&self.device, self.intents, &self.debug_label);
        drop(interval);
        match &result {
            Ok(()) => {
                logwise::info_sync!(
                    "bake complete, {count} intents bound",
                    count = logwise::privacy::LogIt(&count)
                );
            }
            Err(e) => {
                logwise::warn_sync!(
                    "bake rolled back: {err}",
                    err = logwise::privacy::LogIt(&e)
                );
            }
        }
        result
    }
}

#[cfg(all(test, feature = "backend_soft"))]
mod tests {
    use super::*;
    use crate::resources::{BufferUsage, QueueFamilySet, SharingMode};

    fn buffer(device: &Arc<Device>, size: u64, label: &str) -> Arc<Buffer> {
        Buffer::new(
            device,
            size,
            BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            SharingMode::Concurrent,
            QueueFamilySet::default(),
            label,
        )
        .unwrap()
    }

    #[test]
    fn empty_bake_is_a_no_op() {
        let device = Device::new_for_testing();
        let allocator = Allocator::new(&device, "empty");
        assert!(allocator.is_empty());
        allocator.bake().unwrap();
    }

    #[test]
    fn duplicate_resource_rejected() {
        let device = Device::new_for_testing();
        let b = buffer(&device, 256, "dup");
        let mut allocator = Allocator::new(&device, "dup");
        allocator.add_buffer(&b, MemoryFeatures::empty()).unwrap();
        assert!(matches!(
            allocator.add_buffer(&b, MemoryFeatures::empty()),
            Err(AddError::Duplicate)
        ));
        assert_eq!(allocator.len(), 1);
    }

    #[test]
    fn baked_buffer_cannot_be_added_again() {
        let device = Device::new_for_testing();
        let b = buffer(&device, 256, "bound");
        let mut first = Allocator::new(&device, "first");
        first.add_buffer(&b, MemoryFeatures::empty()).unwrap();
        first.bake().unwrap();
        assert!(b.is_baked());

        let mut second = Allocator::new(&device, "second");
        assert!(matches!(
            second.add_buffer(&b, MemoryFeatures::empty()),
            Err(AddError::AlreadyBound)
        ));
    }

    #[test]
    fn image_initial_data_must_fill_mip_zero() {
        use crate::resources::{ImageDescriptor, ImageUsage, TexelFormat};
        let device = Device::new_for_testing();
        let image = Image::new(
            &device,
            ImageDescriptor {
                extent: [8, 8, 1],
                mip_levels: 1,
                array_layers: 1,
                format: TexelFormat::Rgba8Unorm,
                usage: ImageUsage::TRANSFER_DST,
                sharing: SharingMode::Concurrent,
                families: QueueFamilySet::default(),
            },
            "img",
        )
        .unwrap();
        let mut allocator = Allocator::new(&device, "img");
        let short = vec![0u8; 8 * 8 * 4 - 1];
        assert!(matches!(
            allocator.add_image_with_data(&image, MemoryFeatures::empty(), &short),
            Err(AddError::DataSizeMismatch {
                expected: 256,
                actual: 255
            })
        ));
    }

    #[test]
    fn sparse_region_validation() {
        use crate::resources::SparseBuffer;
        let device = Device::new_for_testing();
        let page = device.sparse_page_size();
        let sparse = SparseBuffer::new(
            &device,
            4 * page,
            BufferUsage::STORAGE,
            false,
            SharingMode::Concurrent,
            QueueFamilySet::default(),
            "sparse",
        )
        .unwrap();
        let mut allocator = Allocator::new(&device, "sparse");
        assert!(matches!(
            allocator.add_sparse_buffer_region(&sparse, 7, page, MemoryFeatures::empty()),
            Err(AddError::Misaligned { .. })
        ));
        assert!(matches!(
            allocator.add_sparse_buffer_region(&sparse, 0, 8 * page, MemoryFeatures::empty()),
            Err(AddError::OutOfRange { .. })
        ));
        allocator
            .add_sparse_buffer_region(&sparse, 0, 2 * page, MemoryFeatures::empty())
            .unwrap();
        // overlapping range of the same resource
        assert!(matches!(
            allocator.add_sparse_buffer_region(&sparse, page, page, MemoryFeatures::empty()),
            Err(AddError::Duplicate)
        ));
        // disjoint range is fine
        allocator
            .add_sparse_buffer_region(&sparse, 2 * page, page, MemoryFeatures::empty())
            .unwrap();
    }

    #[test]
    fn sparse_intents_share_one_bind_submission() {
        use crate::resources::SparseBuffer;
        let device = Device::new_for_testing();
        let page = device.sparse_page_size();
        let sparse = SparseBuffer::new(
            &device,
            8 * page,
            BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            false,
            SharingMode::Concurrent,
            QueueFamilySet::default(),
            "batched",
        )
        .unwrap();
        // family 0 is the device's sparse-capable pick
        let queue = device.imp().queue(0).unwrap();
        let binds_before = queue.sparse_bind_count();

        let mut allocator = Allocator::new(&device, "batched");
        allocator
            .add_sparse_buffer_region(&sparse, 0, 2 * page, MemoryFeatures::empty())
            .unwrap();
        allocator
            .add_sparse_buffer_region(&sparse, 4 * page, page, MemoryFeatures::empty())
            .unwrap();
        allocator.bake().unwrap();

        assert_eq!(queue.sparse_bind_count(), binds_before + 1);
        assert_eq!(sparse.n_bound_bytes(), 3 * page);
    }

    #[test]
    fn device_bind_errors_keep_their_source() {
        use crate::resources::device::DeviceError;
        use crate::resources::sparse_buffer::SparseBindError;
        let err: AddError =
            SparseBindError::Device(DeviceError::NoCapableQueue("sparse binding")).into();
        assert!(matches!(err, AddError::Device(_)));
    }
}
