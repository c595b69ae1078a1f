// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Tile-grid residency for sparse images.
//!
//! Sparse image bindings are addressed by tile coordinate inside a fixed
//! granularity grid per `(aspect, mip, layer)`, plus one slot per aspect for
//! the mip tail.  Unlike the byte-interval case there is nothing to split;
//! a region bind touches a rectangular box of whole tiles.

use std::collections::HashMap;
use std::sync::Arc;

use crate::memory::HeapBlock;
use crate::residency::interval_set::PageSlot;

/// Image aspects we track residency for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImageAspect {
    Color,
    Depth,
    Stencil,
}

/// Address of one tile in the granularity grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub aspect: ImageAspect,
    pub mip: u32,
    pub layer: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// A rectangular box of tiles inside one subresource; the residency key for
/// sparse image binds.  `origin` and `extent` are in texels and must land on
/// the granularity grid (or cover the mip tail, which uses [MipTailKey]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageRegionKey {
    pub aspect: ImageAspect,
    pub mip: u32,
    pub layer: u32,
    pub origin: [u32; 3],
    pub extent: [u32; 3],
}

/// Residency key for an image's mip tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MipTailKey {
    pub aspect: ImageAspect,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
struct TailBinding {
    layers: Vec<PageSlot>,
    size: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct TileMap {
    tiles: HashMap<TileCoord, Vec<PageSlot>>,
    tails: HashMap<ImageAspect, TailBinding>,
}

impl TileMap {
    pub fn new() -> TileMap {
        TileMap::default()
    }

    /// Bind every tile in `key`'s box, consuming `tile_size` bytes of the
    /// target per tile in x-major order.  Returns evicted slots.
    pub fn set_region(
        &mut self,
        key: &ImageRegionKey,
        granularity: [u32; 3],
        tile_size: u64,
        target: Option<PageSlot>,
        aliasing: bool,
    ) -> Vec<PageSlot> {
        let mut evicted = Vec::new();
        let tiles_w = key.extent[0].div_ceil(granularity[0]);
        let tiles_h = key.extent[1].div_ceil(granularity[1]);
        let tiles_d = key.extent[2].div_ceil(granularity[2]);
        let base = [
            key.origin[0] / granularity[0],
            key.origin[1] / granularity[1],
            key.origin[2] / granularity[2],
        ];
        let mut tile_index = 0u64;
        for dz in 0..tiles_d {
            for dy in 0..tiles_h {
                for dx in 0..tiles_w {
                    let coord = TileCoord {
                        aspect: key.aspect,
                        mip: key.mip,
                        layer: key.layer,
                        x: base[0] + dx,
                        y: base[1] + dy,
                        z: base[2] + dz,
                    };
                    let slot = target.as_ref().map(|t| PageSlot {
                        block: t.block.clone(),
                        offset: t.offset + tile_index * tile_size,
                    });
                    evicted.extend(self.set_tile(coord, slot, aliasing));
                    tile_index += 1;
                }
            }
        }
        evicted
    }

    fn set_tile(
        &mut self,
        coord: TileCoord,
        target: Option<PageSlot>,
        aliasing: bool,
    ) -> Vec<PageSlot> {
        match target {
            Some(slot) => {
                let layers = self.tiles.entry(coord).or_default();
                if aliasing {
                    layers.push(slot);
                    Vec::new()
                } else {
                    let evicted = std::mem::replace(layers, vec![slot]);
                    evicted
                }
            }
            None => self.tiles.remove(&coord).unwrap_or_default(),
        }
    }

    /// Bind or unbind the mip tail for one aspect.
    pub fn set_mip_tail(
        &mut self,
        key: &MipTailKey,
        target: Option<PageSlot>,
        aliasing: bool,
    ) -> Vec<PageSlot> {
        match target {
            Some(slot) => {
                let entry = self.tails.entry(key.aspect).or_insert(TailBinding {
                    layers: Vec::new(),
                    size: key.size,
                });
                entry.size = key.size;
                if aliasing {
                    entry.layers.push(slot);
                    Vec::new()
                } else {
                    std::mem::replace(&mut entry.layers, vec![slot])
                }
            }
            None => self
                .tails
                .remove(&key.aspect)
                .map(|t| t.layers)
                .unwrap_or_default(),
        }
    }

    /// The active binding of one tile.
    pub fn get_tile(&self, coord: TileCoord) -> Option<PageSlot> {
        self.tiles.get(&coord).and_then(|l| l.last().cloned())
    }

    pub fn get_mip_tail(&self, aspect: ImageAspect) -> Option<PageSlot> {
        self.tails
            .get(&aspect)
            .and_then(|t| t.layers.last().cloned())
    }

    /// Bytes currently bound: tiles times tile size, plus tail sizes.
    pub fn bound_bytes(&self, tile_size: u64) -> u64 {
        self.tiles.len() as u64 * tile_size + self.tails.values().map(|t| t.size).sum::<u64>()
    }

    /// Blocks referenced by any binding, tiles in coordinate order then mip
    /// tails in aspect order, first appearance wins.
    pub fn blocks_in_order(&self) -> Vec<Arc<HeapBlock>> {
        let mut coords: Vec<&TileCoord> = self.tiles.keys().collect();
        coords.sort();
        let mut out: Vec<Arc<HeapBlock>> = Vec::new();
        let push = |block: &Arc<HeapBlock>, out: &mut Vec<Arc<HeapBlock>>| {
            if !out.iter().any(|b| Arc::ptr_eq(b, block)) {
                out.push(block.clone());
            }
        };
        for coord in coords {
            for layer in &self.tiles[coord] {
                push(&layer.block, &mut out);
            }
        }
        let mut aspects: Vec<&ImageAspect> = self.tails.keys().collect();
        aspects.sort();
        for aspect in aspects {
            for layer in &self.tails[aspect].layers {
                push(&layer.block, &mut out);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty() && self.tails.is_empty()
    }
}
