// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Sparse images: per-tile residency plus the opaque mip tail.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::imp;
use crate::memory::{HeapBlock, MemoryRequirements, SubAllocation};
use crate::residency::{
    Evicted, ImageAspect, ImagePageTracker, ImageRegionKey, ImageTrackerSnapshot, MipTailKey,
    Residency, TileCoord,
};
use crate::resources::device::{Device, DeviceError};
use crate::resources::image::ImageDescriptor;
use crate::resources::sparse_buffer::SparseBindError;
use crate::resources::{AllocationBroker, QueueFamilySet, ResourceId, SharingMode};
use crate::staging::{self, TransferError};

/// A sparse image.  Tile-addressable mips are populated per tile; mips
/// smaller than one tile live in the mip tail and are bound in one step.
#[derive(Debug)]
pub struct SparseImage {
    id: ResourceId,
    device: Arc<Device>,
    raw: imp::RawImage,
    descriptor: ImageDescriptor,
    granularity: [u32; 3],
    tile_size: u64,
    tracker: ImagePageTracker,
    aliasing: bool,
    broker: Mutex<Option<Arc<dyn AllocationBroker>>>,
    broker_consulted: AtomicBool,
    debug_label: String,
}

impl SparseImage {
    pub fn new(
        device: &Arc<Device>,
        descriptor: ImageDescriptor,
        aliasing: bool,
        debug_label: &str,
    ) -> Result<Arc<SparseImage>, DeviceError> {
        let raw =
            device
                .imp()
                .create_image(descriptor.imp_layout(), descriptor.usage, true, debug_label)?;
        let granularity = device.imp().image_sparse_granularity(&raw);
        let tile_size = device.sparse_page_size();
        Ok(Arc::new(SparseImage {
            id: ResourceId::next(),
            device: device.clone(),
            raw,
            descriptor,
            granularity,
            tile_size,
            tracker: ImagePageTracker::new(granularity, tile_size, aliasing),
            aliasing,
            broker: Mutex::new(None),
            broker_consulted: AtomicBool::new(false),
            debug_label: debug_label.to_string(),
        }))
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    pub fn sharing_mode(&self) -> SharingMode {
        self.descriptor.sharing
    }

    pub fn queue_families(&self) -> &QueueFamilySet {
        &self.descriptor.families
    }

    /// Tile extent in texels, as the oracle reports it for this format.
    pub fn granularity(&self) -> [u32; 3] {
        self.granularity
    }

    /// Bytes per tile (one sparse page).
    pub fn tile_size(&self) -> u64 {
        self.tile_size
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

    pub fn requirements(&self) -> MemoryRequirements {
        self.device.imp().image_requirements(&self.raw)
    }

    /// First mip level covered by the mip tail; equals `mip_levels` when
    /// every mip is tile-addressable.
    pub fn mip_tail_first_lod(&self) -> u32 {
        self.raw.mip_tail_first_lod()
    }

    /// Size of the mip tail across all layers; zero when absent.
    pub fn mip_tail_size(&self) -> u64 {
        self.raw.mip_tail_size()
    }

    /// The residency key for this image's mip tail.
    pub fn mip_tail_key(&self, aspect: ImageAspect) -> MipTailKey {
        MipTailKey {
            aspect,
            offset: self
                .raw
                .layout()
                .subresource_offset(self.mip_tail_first_lod().min(self.raw.layout().mip_levels), 0),
            size: self.mip_tail_size(),
        }
    }

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

    pub(crate) fn raw(&self) -> &imp::RawImage {
        &self.raw
    }

    pub(crate) fn tracker(&self) -> &ImagePageTracker {
        &self.tracker
    }

    pub(crate) fn snapshot(&self) -> ImageTrackerSnapshot {
        self.tracker.snapshot()
    }

    pub(crate) fn restore(&self, snapshot: ImageTrackerSnapshot) {
        self.tracker.restore(snapshot)
    }

    /// Tiles covered by `key`, in the same x-major order the tracker
    /// assigns per-tile offsets.
    pub(crate) fn check_region(&self, key: &ImageRegionKey) -> Result<[u32; 3], SparseBindError> {
        let layout = self.raw.layout();
        if key.mip >= self.mip_tail_first_lod() || key.layer >= layout.array_layers {
            return Err(SparseBindError::OutOfRange {
                offset: key.mip as u64,
                size: key.layer as u64,
                space: self.mip_tail_first_lod() as u64,
            });
        }
        let mip_extent = layout.mip_extent(key.mip);
        for axis in 0..3 {
            let granule = self.granularity[axis] as u64;
            let origin = key.origin[axis] as u64;
            let end = origin + key.extent[axis] as u64;
            // a region must land on the grid; its far edge may stop at the
            // subresource edge instead of a grid line
            if origin % granule != 0
                || key.extent[axis] == 0
                || end > mip_extent[axis] as u64
                || (end % granule != 0 && end != mip_extent[axis] as u64)
            {
                return Err(SparseBindError::Misaligned {
                    offset: origin,
                    size: key.extent[axis] as u64,
                    page: granule,
                });
            }
        }
        Ok([
            key.extent[0].div_ceil(self.granularity[0]),
            key.extent[1].div_ceil(self.granularity[1]),
            key.extent[2].div_ceil(self.granularity[2]),
        ])
    }

    /// Validate `key` and append its tile binds to `batch` without
    /// submitting.  Tiles are addressed in x-major order, consuming
    /// `tile_size` bytes of target per tile, matching the tracker's offset
    /// assignment exactly.  Pair with [SparseImage::record_region].
    pub(crate) fn stage_region(
        &self,
        batch: &mut imp::SparseBindBatch,
        key: &ImageRegionKey,
        target: Option<&(Arc<HeapBlock>, u64)>,
    ) -> Result<(), SparseBindError> {
        let tiles = self.check_region(key)?;
        let base = [
            key.origin[0] / self.granularity[0],
            key.origin[1] / self.granularity[1],
            key.origin[2] / self.granularity[2],
        ];
        let mut tile_index = 0u64;
        for dz in 0..tiles[2] {
            for dy in 0..tiles[1] {
                for dx in 0..tiles[0] {
                    batch.image_binds.push(imp::SparseImageBind {
                        image: self.raw.clone(),
                        mip: key.mip,
                        layer: key.layer,
                        tile: [base[0] + dx, base[1] + dy, base[2] + dz],
                        memory: target.map(|(block, offset)| {
                            (block.memory().clone(), offset + tile_index * self.tile_size)
                        }),
                    });
                    tile_index += 1;
                }
            }
        }
        Ok(())
    }

    /// Record region binds the queue already applied.
    pub(crate) fn record_region(
        &self,
        key: &ImageRegionKey,
        target: Option<(Arc<HeapBlock>, u64)>,
    ) -> Evicted {
        self.tracker.set_region(key, target)
    }

    /// Validate and append the mip tail bind to `batch` without submitting.
    pub(crate) fn stage_mip_tail(
        &self,
        batch: &mut imp::SparseBindBatch,
        key: &MipTailKey,
        target: Option<&(Arc<HeapBlock>, u64)>,
    ) -> Result<(), SparseBindError> {
        if self.mip_tail_size() == 0 {
            return Err(SparseBindError::OutOfRange {
                offset: key.offset,
                size: key.size,
                space: 0,
            });
        }
        batch.tail_binds.push(imp::SparseTailBind {
            image: self.raw.clone(),
            memory: target.map(|(block, offset)| (block.memory().clone(), *offset)),
        });
        Ok(())
    }

    /// Record a tail bind the queue already applied.
    pub(crate) fn record_mip_tail(
        &self,
        key: &MipTailKey,
        target: Option<(Arc<HeapBlock>, u64)>,
    ) -> Evicted {
        self.tracker.set_mip_tail(key, target)
    }

    /// Submit tile binds for `key` and record them.  The queue submission
    /// completes before the tracker changes, so a query that sees the new
    /// state is always backed by device state.
    pub(crate) fn apply_region(
        &self,
        key: &ImageRegionKey,
        target: Option<(Arc<HeapBlock>, u64)>,
    ) -> Result<Evicted, SparseBindError> {
        let mut batch = imp::SparseBindBatch::new();
        self.stage_region(&mut batch, key, target.as_ref())?;
        self.device.sparse_queue()?.bind_sparse_and_wait(&batch)?;
        Ok(self.record_region(key, target))
    }

    pub(crate) fn apply_mip_tail(
        &self,
        key: &MipTailKey,
        target: Option<(Arc<HeapBlock>, u64)>,
    ) -> Result<Evicted, SparseBindError> {
        let mut batch = imp::SparseBindBatch::new();
        self.stage_mip_tail(&mut batch, key, target.as_ref())?;
        self.device.sparse_queue()?.bind_sparse_and_wait(&batch)?;
        Ok(self.record_mip_tail(key, target))
    }

    /// Bind the tiles of a subresource region to a slice of `target`.
    pub fn bind_region(
        &self,
        key: &ImageRegionKey,
        target: &SubAllocation,
    ) -> Result<Evicted, SparseBindError> {
        self.apply_region(key, Some((target.block.clone(), target.offset)))
    }

    pub fn unbind_region(&self, key: &ImageRegionKey) -> Result<Evicted, SparseBindError> {
        self.apply_region(key, None)
    }

    /// Bind the whole mip tail to a slice of `target`.
    pub fn bind_mip_tail(
        &self,
        aspect: ImageAspect,
        target: &SubAllocation,
    ) -> Result<Evicted, SparseBindError> {
        let key = self.mip_tail_key(aspect);
        self.apply_mip_tail(&key, Some((target.block.clone(), target.offset)))
    }

    pub fn unbind_mip_tail(&self, aspect: ImageAspect) -> Result<Evicted, SparseBindError> {
        let key = self.mip_tail_key(aspect);
        self.apply_mip_tail(&key, None)
    }

    /// Residency of one tile.
    pub fn tile_residency(&self, coord: TileCoord) -> Residency {
        self.tracker.get_tile(coord)
    }

    pub fn mip_tail_residency(&self, aspect: ImageAspect) -> Residency {
        self.tracker.get_mip_tail(aspect)
    }

    /// The nth heap block referenced by any binding of this image.
    /// Consults the allocation broker the first time.
    pub fn memory_block(&self, n: usize) -> Option<Arc<HeapBlock>> {
        self.consult_broker();
        self.tracker.get_memory_block(n)
    }

    pub fn n_bound_bytes(&self) -> u64 {
        self.tracker.n_bound_bytes()
    }

    /// Write a texel region of one subresource through bound tiles; writes
    /// to unbound tiles are dropped.
    pub fn write_texels(
        &self,
        mip: u32,
        layer: u32,
        origin: [u32; 3],
        extent: [u32; 3],
        data: &[u8],
    ) -> Result<(), TransferError> {
        staging::write_sparse_image(self, mip, layer, origin, extent, data)
    }

    /// Read a texel region; unbound tiles read as zero.
    pub fn read_texels(
        &self,
        mip: u32,
        layer: u32,
        origin: [u32; 3],
        extent: [u32; 3],
        out: &mut [u8],
    ) -> Result<(), TransferError> {
        staging::read_sparse_image(self, mip, layer, origin, extent, out)
    }
}

#[cfg(all(test, feature = "backend_soft"))]
mod tests {
    use super::*;
    use crate::memory::MemoryFeatures;
    use crate::resources::image::TexelFormat;
    use crate::resources::ImageUsage;

    fn sparse_image(device: &Arc<Device>) -> Arc<SparseImage> {
        SparseImage::new(
            device,
            ImageDescriptor {
                extent: [512, 512, 1],
                mip_levels: 10,
                array_layers: 1,
                format: TexelFormat::Rgba8Unorm,
                usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC,
                sharing: SharingMode::Concurrent,
                families: QueueFamilySet::default(),
            },
            false,
            "sparse_image",
        )
        .unwrap()
    }

    fn block(device: &Arc<Device>, size: u64) -> Arc<HeapBlock> {
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
    fn granularity_matches_format() {
        let device = Device::new_for_testing();
        let image = sparse_image(&device);
        // rgba8: 128x128 tiles in a 64 KiB page
        assert_eq!(image.granularity(), [128, 128, 1]);
        assert_eq!(image.mip_tail_first_lod(), 3);
    }

    #[test]
    fn region_bind_and_residency() {
        let device = Device::new_for_testing();
        let image = sparse_image(&device);
        let backing = block(&device, 1 << 20);
        let sub = backing.suballocate(4 * 65536, 65536).unwrap();
        let key = ImageRegionKey {
            aspect: ImageAspect::Color,
            mip: 0,
            layer: 0,
            origin: [0, 0, 0],
            extent: [256, 256, 1],
        };
        image.bind_region(&key, &sub).unwrap();
        assert_eq!(image.n_bound_bytes(), 4 * 65536);
        let coord = TileCoord {
            aspect: ImageAspect::Color,
            mip: 0,
            layer: 0,
            x: 1,
            y: 1,
            z: 0,
        };
        assert!(image.tile_residency(coord).is_bound());
        image.unbind_region(&key).unwrap();
        assert_eq!(image.n_bound_bytes(), 0);
    }

    #[test]
    fn off_grid_region_rejected() {
        let device = Device::new_for_testing();
        let image = sparse_image(&device);
        let backing = block(&device, 1 << 20);
        let sub = backing.suballocate(65536, 65536).unwrap();
        let key = ImageRegionKey {
            aspect: ImageAspect::Color,
            mip: 0,
            layer: 0,
            origin: [64, 0, 0],
            extent: [128, 128, 1],
        };
        assert!(matches!(
            image.bind_region(&key, &sub),
            Err(SparseBindError::Misaligned { .. })
        ));
    }

    #[test]
    fn tail_bind_round_trips_texels() {
        let device = Device::new_for_testing();
        let image = sparse_image(&device);
        let backing = block(&device, 1 << 20);
        let sub = backing.suballocate(image.mip_tail_size(), 65536).unwrap();
        image.bind_mip_tail(ImageAspect::Color, &sub).unwrap();
        assert!(image.mip_tail_residency(ImageAspect::Color).is_bound());

        // mip 4 is 32x32, inside the tail
        let data = vec![7u8; 32 * 32 * 4];
        image.write_texels(4, 0, [0, 0, 0], [32, 32, 1], &data).unwrap();
        let mut out = vec![0u8; 32 * 32 * 4];
        image.read_texels(4, 0, [0, 0, 0], [32, 32, 1], &mut out).unwrap();
        assert_eq!(out, data);

        image.unbind_mip_tail(ImageAspect::Color).unwrap();
        assert_eq!(image.n_bound_bytes(), 0);
    }
}
