// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Sparse-resource page tracking.
//!
//! Each sparse resource owns exactly one tracker, and the tracker is the
//! single source of truth for which residency keys are bound to which heap
//! blocks.  The binding executor updates it after a sparse submission
//! completes; resource read/write consults it; nothing else writes to it.
//!
//! Trackers serialize every operation behind a mutex, so concurrent
//! `set_binding` calls are linearizable.  A binding batch that fails leaves
//! tracker state untouched: the commit pass snapshots trackers before
//! touching them and restores the snapshot on rollback.

pub mod interval_set;
pub mod tile_map;

use std::sync::{Arc, Mutex};

use crate::memory::HeapBlock;
use interval_set::{IntervalMap, PageSlot};
pub use tile_map::{ImageAspect, ImageRegionKey, MipTailKey, TileCoord};
use tile_map::TileMap;

/// Answer to a residency query.
#[derive(Debug, Clone)]
pub enum Residency {
    Bound { block: Arc<HeapBlock>, offset: u64 },
    Unbound,
}

impl Residency {
    pub fn is_bound(&self) -> bool {
        matches!(self, Residency::Bound { .. })
    }

    fn from_slot(slot: Option<PageSlot>) -> Residency {
        match slot {
            Some(s) => Residency::Bound {
                block: s.block,
                offset: s.offset,
            },
            None => Residency::Unbound,
        }
    }
}

/// A `(heap block, offset)` pair that lost residency during a rebind.
/// Returned so callers can account for block lifetimes; dropping the vec
/// releases the tracker's share of each block.
pub type Evicted = Vec<(Arc<HeapBlock>, u64)>;

fn evicted_from(slots: Vec<PageSlot>) -> Evicted {
    slots.into_iter().map(|s| (s.block, s.offset)).collect()
}

/// Residency map for a sparse buffer: disjoint byte intervals.
#[derive(Debug)]
pub struct BufferPageTracker {
    map: Mutex<IntervalMap>,
    resource_size: u64,
    aliasing: bool,
}

/// Saved tracker state, for bake rollback.
#[derive(Debug)]
pub struct BufferTrackerSnapshot(IntervalMap);

impl BufferPageTracker {
    pub fn new(resource_size: u64, aliasing: bool) -> BufferPageTracker {
        BufferPageTracker {
            map: Mutex::new(IntervalMap::new()),
            resource_size,
            aliasing,
        }
    }

    pub fn resource_size(&self) -> u64 {
        self.resource_size
    }

    /// Bind `[offset, offset+size)` to `target` (or unbind on `None`),
    /// implicitly unbinding whatever it intersected.
    pub fn set_binding(
        &self,
        offset: u64,
        size: u64,
        target: Option<(Arc<HeapBlock>, u64)>,
    ) -> Evicted {
        debug_assert!(
            offset + size <= self.resource_size,
            "binding outside the resource's sparse region"
        );
        let slot = target.map(|(block, block_offset)| PageSlot {
            block,
            offset: block_offset,
        });
        let evicted = self
            .map
            .lock()
            .unwrap()
            .set(offset, size, slot, self.aliasing);
        evicted_from(evicted)
    }

    /// O(log n) point query.
    pub fn get_binding_at(&self, point: u64) -> Residency {
        Residency::from_slot(self.map.lock().unwrap().get(point))
    }

    /// The nth memory block referenced by any binding, in ascending key
    /// order.  Used when the resource is asked for "its" memory in the
    /// single-block-bound case.
    pub fn get_memory_block(&self, n: usize) -> Option<Arc<HeapBlock>> {
        self.map.lock().unwrap().blocks_in_order().into_iter().nth(n)
    }

    /// Sum of sizes of bound ranges.
    pub fn n_bound_bytes(&self) -> u64 {
        self.map.lock().unwrap().bound_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }

    pub fn snapshot(&self) -> BufferTrackerSnapshot {
        BufferTrackerSnapshot(self.map.lock().unwrap().clone())
    }

    pub fn restore(&self, snapshot: BufferTrackerSnapshot) {
        *self.map.lock().unwrap() = snapshot.0;
    }
}

/// Residency map for a sparse image: a tile grid plus the mip tail.
#[derive(Debug)]
pub struct ImagePageTracker {
    map: Mutex<TileMap>,
    granularity: [u32; 3],
    tile_size: u64,
    aliasing: bool,
}

#[derive(Debug)]
pub struct ImageTrackerSnapshot(TileMap);

impl ImagePageTracker {
    pub fn new(granularity: [u32; 3], tile_size: u64, aliasing: bool) -> ImagePageTracker {
        ImagePageTracker {
            map: Mutex::new(TileMap::new()),
            granularity,
            tile_size,
            aliasing,
        }
    }

    pub fn granularity(&self) -> [u32; 3] {
        self.granularity
    }

    pub fn tile_size(&self) -> u64 {
        self.tile_size
    }

    pub fn set_region(
        &self,
        key: &ImageRegionKey,
        target: Option<(Arc<HeapBlock>, u64)>,
    ) -> Evicted {
        let slot = target.map(|(block, offset)| PageSlot { block, offset });
        let evicted = self.map.lock().unwrap().set_region(
            key,
            self.granularity,
            self.tile_size,
            slot,
            self.aliasing,
        );
        evicted_from(evicted)
    }

    pub fn set_mip_tail(&self, key: &MipTailKey, target: Option<(Arc<HeapBlock>, u64)>) -> Evicted {
        let slot = target.map(|(block, offset)| PageSlot { block, offset });
        let evicted = self
            .map
            .lock()
            .unwrap()
            .set_mip_tail(key, slot, self.aliasing);
        evicted_from(evicted)
    }

    pub fn get_tile(&self, coord: TileCoord) -> Residency {
        Residency::from_slot(self.map.lock().unwrap().get_tile(coord))
    }

    pub fn get_mip_tail(&self, aspect: ImageAspect) -> Residency {
        Residency::from_slot(self.map.lock().unwrap().get_mip_tail(aspect))
    }

    pub fn get_memory_block(&self, n: usize) -> Option<Arc<HeapBlock>> {
        self.map.lock().unwrap().blocks_in_order().into_iter().nth(n)
    }

    pub fn n_bound_bytes(&self) -> u64 {
        self.map.lock().unwrap().bound_bytes(self.tile_size)
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }

    pub fn snapshot(&self) -> ImageTrackerSnapshot {
        ImageTrackerSnapshot(self.map.lock().unwrap().clone())
    }

    pub fn restore(&self, snapshot: ImageTrackerSnapshot) {
        *self.map.lock().unwrap() = snapshot.0;
    }
}
