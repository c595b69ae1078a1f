// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Raw images: linear subresource layout, sparse tile table, mip tail.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::resources::ImageUsage;

use super::device::Error;
use super::memory::DeviceMemory;

/// Shape of an image as handed to the device.  Single-plane; depth and
/// stencil images use their combined texel size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub extent: [u32; 3],
    pub mip_levels: u32,
    pub array_layers: u32,
    pub bytes_per_texel: u32,
}

impl ImageLayout {
    pub fn mip_extent(&self, mip: u32) -> [u32; 3] {
        [
            (self.extent[0] >> mip).max(1),
            (self.extent[1] >> mip).max(1),
            (self.extent[2] >> mip).max(1),
        ]
    }

    /// Bytes of one array layer of one mip, stored row-major.
    pub fn mip_bytes(&self, mip: u32) -> u64 {
        let e = self.mip_extent(mip);
        e[0] as u64 * e[1] as u64 * e[2] as u64 * self.bytes_per_texel as u64
    }

    /// Bytes of one full array layer (all mips).
    pub fn layer_bytes(&self) -> u64 {
        (0..self.mip_levels).map(|m| self.mip_bytes(m)).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.layer_bytes() * self.array_layers as u64
    }

    /// Linear offset of `(mip, layer)` within the image, layers outermost.
    pub fn subresource_offset(&self, mip: u32, layer: u32) -> u64 {
        layer as u64 * self.layer_bytes() + (0..mip).map(|m| self.mip_bytes(m)).sum::<u64>()
    }
}

/// Identity of one sparse tile within an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TileKey {
    mip: u32,
    layer: u32,
    tile: [u32; 3],
}

#[derive(Debug)]
struct SparseState {
    /// Bound tiles; each tile occupies one sparse block in its allocation.
    tiles: HashMap<TileKey, (DeviceMemory, u64)>,
    /// Single opaque mip tail shared by all layers.
    tail: Option<(DeviceMemory, u64)>,
}

#[derive(Debug)]
struct RawImageInner {
    layout: ImageLayout,
    usage: ImageUsage,
    sparse: bool,
    /// Sparse block size captured at creation; fixes the tile shape.
    block_size: u64,
    bound: Mutex<Option<(DeviceMemory, u64)>>,
    sparse_state: Mutex<SparseState>,
    debug_label: String,
}

/// An image object without implied backing.  Clones share identity.
#[derive(Debug, Clone)]
pub struct RawImage {
    inner: Arc<RawImageInner>,
}

impl RawImage {
    pub(super) fn new(
        layout: ImageLayout,
        usage: ImageUsage,
        sparse: bool,
        block_size: u64,
        debug_label: &str,
    ) -> RawImage {
        RawImage {
            inner: Arc::new(RawImageInner {
                layout,
                usage,
                sparse,
                block_size,
                bound: Mutex::new(None),
                sparse_state: Mutex::new(SparseState {
                    tiles: HashMap::new(),
                    tail: None,
                }),
                debug_label: debug_label.to_string(),
            }),
        }
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.inner.layout
    }

    pub fn usage(&self) -> ImageUsage {
        self.inner.usage
    }

    pub fn is_sparse(&self) -> bool {
        self.inner.sparse
    }

    pub fn debug_label(&self) -> &str {
        &self.inner.debug_label
    }

    pub fn same_object(&self, other: &RawImage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.layout.total_bytes()
    }

    /// Tile extent such that one tile fills exactly one sparse block.
    /// Width and height are powers of two with width >= height; depth 1.
    pub fn granularity_for_block(&self, block_size: u64) -> [u32; 3] {
        let texels = (block_size / self.inner.layout.bytes_per_texel as u64).max(1);
        let log2 = 63 - texels.leading_zeros();
        let height = 1u64 << (log2 / 2);
        let width = texels / height;
        [width as u32, height as u32, 1]
    }

    pub fn granularity(&self) -> [u32; 3] {
        self.granularity_for_block(self.inner.block_size)
    }

    /// First mip level that lives in the opaque mip tail: the first whose
    /// extent is smaller than one tile in every dimension.
    pub fn mip_tail_first_lod(&self) -> u32 {
        let tile = self.granularity();
        (0..self.inner.layout.mip_levels)
            .find(|&mip| {
                let e = self.inner.layout.mip_extent(mip);
                e[0] < tile[0] && e[1] < tile[1] && e[2] <= tile[2]
            })
            .unwrap_or(self.inner.layout.mip_levels)
    }

    /// Bytes of the mip tail across all layers, block-granular.  Zero when
    /// every mip is tile-addressable.
    pub fn mip_tail_size(&self) -> u64 {
        let first = self.mip_tail_first_lod();
        let per_layer: u64 = (first..self.inner.layout.mip_levels)
            .map(|m| self.inner.layout.mip_bytes(m))
            .sum();
        let raw = per_layer * self.inner.layout.array_layers as u64;
        crate::memory::round_up(raw, self.inner.block_size)
    }

    /// Tile counts per axis for `mip`; zero for tail mips.
    pub fn tile_counts(&self, mip: u32) -> [u32; 3] {
        if mip >= self.mip_tail_first_lod() {
            return [0, 0, 0];
        }
        let tile = self.granularity();
        let e = self.inner.layout.mip_extent(mip);
        [
            e[0].div_ceil(tile[0]),
            e[1].div_ceil(tile[1]),
            e[2].div_ceil(tile[2]),
        ]
    }

    pub fn bind_memory(&self, memory: &DeviceMemory, offset: u64) -> Result<(), Error> {
        if self.inner.sparse {
            return Err(Error::Sparse);
        }
        let size = self.total_bytes();
        if offset + size > memory.size() {
            return Err(Error::OutOfBounds {
                offset,
                len: size,
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

    pub fn unbind_memory(&self) {
        *self.inner.bound.lock().unwrap() = None;
    }

    pub fn is_bound(&self) -> bool {
        self.inner.bound.lock().unwrap().is_some()
    }

    pub(super) fn apply_tile_bind(
        &self,
        mip: u32,
        layer: u32,
        tile: [u32; 3],
        memory: Option<(DeviceMemory, u64)>,
    ) -> Result<(), Error> {
        if !self.inner.sparse {
            return Err(Error::NotSparse);
        }
        let counts = self.tile_counts(mip);
        if layer >= self.inner.layout.array_layers
            || tile[0] >= counts[0]
            || tile[1] >= counts[1]
            || tile[2] >= counts[2]
        {
            return Err(Error::OutOfBounds {
                offset: tile[0] as u64,
                len: 1,
                size: counts[0] as u64,
            });
        }
        let key = TileKey { mip, layer, tile };
        let mut state = self.inner.sparse_state.lock().unwrap();
        match memory {
            Some(binding) => {
                state.tiles.insert(key, binding);
            }
            None => {
                state.tiles.remove(&key);
            }
        }
        Ok(())
    }

    pub(super) fn apply_tail_bind(&self, memory: Option<(DeviceMemory, u64)>) -> Result<(), Error> {
        if !self.inner.sparse {
            return Err(Error::NotSparse);
        }
        self.inner.sparse_state.lock().unwrap().tail = memory;
        Ok(())
    }

    /// Offset of `(mip, layer)` inside the mip-tail allocation, layers
    /// outermost over the tail mips only.
    fn tail_offset(&self, mip: u32, layer: u32) -> u64 {
        let first = self.mip_tail_first_lod();
        let per_layer: u64 = (first..self.inner.layout.mip_levels)
            .map(|m| self.inner.layout.mip_bytes(m))
            .sum();
        layer as u64 * per_layer + (first..mip).map(|m| self.inner.layout.mip_bytes(m)).sum::<u64>()
    }

    /// Write a texel region of one subresource.  Non-sparse images write
    /// through the binding; sparse images scatter to bound tiles (or the
    /// tail) and drop writes to unbound tiles.  `data` is tightly packed
    /// row-major.
    pub(super) fn write_texels(
        &self,
        mip: u32,
        layer: u32,
        origin: [u32; 3],
        extent: [u32; 3],
        data: &[u8],
    ) -> Result<(), Error> {
        self.texel_io(mip, layer, origin, extent, &mut |memory, offset, range| {
            if let Some((memory, base)) = memory {
                memory.write_bytes(base + offset, &data[range])?;
            }
            Ok(())
        })
    }

    /// Read a texel region of one subresource.  Unbound sparse tiles read
    /// as zero.
    pub(super) fn read_texels(
        &self,
        mip: u32,
        layer: u32,
        origin: [u32; 3],
        extent: [u32; 3],
        out: &mut [u8],
    ) -> Result<(), Error> {
        out.fill(0);
        let cell = std::cell::RefCell::new(out);
        self.texel_io(mip, layer, origin, extent, &mut |memory, offset, range| {
            if let Some((memory, base)) = memory {
                memory.read_bytes(base + offset, &mut cell.borrow_mut()[range])?;
            }
            Ok(())
        })
    }

    /// Walk a region row by row, resolving each contiguous run to a backing
    /// allocation.  `op` receives the backing (None when unbound), the byte
    /// offset within it, and the matching range of the packed region data.
    fn texel_io(
        &self,
        mip: u32,
        layer: u32,
        origin: [u32; 3],
        extent: [u32; 3],
        op: &mut dyn FnMut(
            Option<(DeviceMemory, u64)>,
            u64,
            std::ops::Range<usize>,
        ) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let layout = &self.inner.layout;
        if mip >= layout.mip_levels || layer >= layout.array_layers {
            return Err(Error::OutOfBounds {
                offset: mip as u64,
                len: layer as u64,
                size: layout.mip_levels as u64,
            });
        }
        let mip_e = layout.mip_extent(mip);
        if origin[0] + extent[0] > mip_e[0]
            || origin[1] + extent[1] > mip_e[1]
            || origin[2] + extent[2] > mip_e[2]
        {
            return Err(Error::OutOfBounds {
                offset: origin[0] as u64,
                len: extent[0] as u64,
                size: mip_e[0] as u64,
            });
        }
        let bpp = layout.bytes_per_texel as u64;
        let row_bytes = extent[0] as u64 * bpp;
        let mut data_pos = 0u64;

        if !self.inner.sparse {
            let Some((memory, base)) = self.inner.bound.lock().unwrap().clone() else {
                return Err(Error::NotBound);
            };
            let sub = layout.subresource_offset(mip, layer);
            for z in origin[2]..origin[2] + extent[2] {
                for y in origin[1]..origin[1] + extent[1] {
                    let texel = (z as u64 * mip_e[1] as u64 + y as u64) * mip_e[0] as u64
                        + origin[0] as u64;
                    op(
                        Some((memory.clone(), base)),
                        sub + texel * bpp,
                        data_pos as usize..(data_pos + row_bytes) as usize,
                    )?;
                    data_pos += row_bytes;
                }
            }
            return Ok(());
        }

        let state = self.inner.sparse_state.lock().unwrap();
        if mip >= self.mip_tail_first_lod() {
            // tail mips are linear inside the tail allocation
            let tail = state.tail.clone();
            let tail_base = self.tail_offset(mip, layer);
            for z in origin[2]..origin[2] + extent[2] {
                for y in origin[1]..origin[1] + extent[1] {
                    let texel = (z as u64 * mip_e[1] as u64 + y as u64) * mip_e[0] as u64
                        + origin[0] as u64;
                    op(
                        tail.clone(),
                        tail_base + texel * bpp,
                        data_pos as usize..(data_pos + row_bytes) as usize,
                    )?;
                    data_pos += row_bytes;
                }
            }
            return Ok(());
        }

        // tile-addressable mips: split each row at tile boundaries
        let tile = self.granularity();
        for z in origin[2]..origin[2] + extent[2] {
            for y in origin[1]..origin[1] + extent[1] {
                let mut x = origin[0];
                let row_end = origin[0] + extent[0];
                while x < row_end {
                    let tile_x = x / tile[0];
                    let run = ((tile_x + 1) * tile[0]).min(row_end) - x;
                    let key = TileKey {
                        mip,
                        layer,
                        tile: [tile_x, y / tile[1], z / tile[2]],
                    };
                    // x-major texel order within a tile
                    let in_tile = ((z % tile[2]) as u64 * tile[1] as u64 + (y % tile[1]) as u64)
                        * tile[0] as u64
                        + (x % tile[0]) as u64;
                    op(
                        state.tiles.get(&key).cloned(),
                        in_tile * bpp,
                        data_pos as usize..(data_pos + run as u64 * bpp) as usize,
                    )?;
                    data_pos += run as u64 * bpp;
                    x += run;
                }
            }
        }
        Ok(())
    }
}
