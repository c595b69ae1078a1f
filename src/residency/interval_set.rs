// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Disjoint interval map over a sparse buffer's byte space.
//!
//! Keys are half-open `[start, end)` byte ranges; values are page slots
//! pointing into heap blocks.  The map supports split, merge, and point/range
//! queries in O(log n).  Segments never overlap; a rebind splits whatever it
//! intersects and evicts the middle.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::memory::HeapBlock;

/// Where one page of a sparse resource currently lives.
#[derive(Debug, Clone)]
pub struct PageSlot {
    pub block: Arc<HeapBlock>,
    pub offset: u64,
}

impl PageSlot {
    fn advanced(&self, delta: u64) -> PageSlot {
        PageSlot {
            block: self.block.clone(),
            offset: self.offset + delta,
        }
    }
}

/// One maximal run of identically-bound bytes.
///
/// `layers` is non-empty; the last entry is the active binding.  Stacks
/// deeper than one only occur on aliasing-capable resources.
#[derive(Debug, Clone)]
struct Segment {
    end: u64,
    layers: Vec<PageSlot>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct IntervalMap {
    segments: BTreeMap<u64, Segment>,
}

impl IntervalMap {
    pub fn new() -> IntervalMap {
        IntervalMap {
            segments: BTreeMap::new(),
        }
    }

    /// Bind `[start, start+size)` to `target`, or unbind it when `target` is
    /// `None`.  Returns every page slot that lost residency.
    ///
    /// With `aliasing`, a bind that exactly matches an existing segment
    /// layers on top of it instead of evicting; partial overlaps always
    /// evict the overlapped portion.
    pub fn set(
        &mut self,
        start: u64,
        size: u64,
        target: Option<PageSlot>,
        aliasing: bool,
    ) -> Vec<PageSlot> {
        let end = start + size;
        if size == 0 {
            return Vec::new();
        }

        // Exact-match aliasing: layer instead of evicting.
        if aliasing && target.is_some() {
            if let Some(seg) = self.segments.get_mut(&start) {
                if seg.end == end {
                    seg.layers.push(target.unwrap());
                    self.check();
                    return Vec::new();
                }
            }
        }

        let mut evicted = Vec::new();

        // Split the segment straddling `start`, if any.
        let straddler = self
            .segments
            .range(..start)
            .next_back()
            .filter(|(_, seg)| seg.end > start)
            .map(|(&s, _)| s);
        if let Some(seg_start) = straddler {
            let seg = self.segments.get_mut(&seg_start).unwrap();
            let delta = start - seg_start;
            let tail = Segment {
                end: seg.end,
                layers: seg.layers.iter().map(|l| l.advanced(delta)).collect(),
            };
            seg.end = start;
            self.segments.insert(start, tail);
        }

        // Split the segment straddling `end`, if any.
        let straddler = self
            .segments
            .range(..end)
            .next_back()
            .filter(|(_, seg)| seg.end > end)
            .map(|(&s, _)| s);
        if let Some(seg_start) = straddler {
            let seg = self.segments.get_mut(&seg_start).unwrap();
            let delta = end - seg_start;
            let tail = Segment {
                end: seg.end,
                layers: seg.layers.iter().map(|l| l.advanced(delta)).collect(),
            };
            seg.end = end;
            self.segments.insert(end, tail);
        }

        // Everything now inside [start, end) is fully covered; remove it.
        let covered: Vec<u64> = self
            .segments
            .range(start..end)
            .map(|(&s, _)| s)
            .collect();
        for s in covered {
            let seg = self.segments.remove(&s).unwrap();
            evicted.extend(seg.layers);
        }

        if let Some(slot) = target {
            self.segments.insert(
                start,
                Segment {
                    end,
                    layers: vec![slot],
                },
            );
            self.merge_around(start);
        }
        self.check();
        evicted
    }

    /// Merge the segment starting at `start` with contiguous neighbors that
    /// continue the same block at the continuing offset.  Only single-layer
    /// segments merge; aliased stacks stay split.
    fn merge_around(&mut self, start: u64) {
        let mut start = start;
        // merge left
        let merge_left = self
            .segments
            .range(..start)
            .next_back()
            .filter(|&(&left_start, left)| {
                Self::mergeable(left_start, left, start, &self.segments[&start])
            })
            .map(|(&left_start, _)| left_start);
        if let Some(left_start) = merge_left {
            let right = self.segments.remove(&start).unwrap();
            self.segments.get_mut(&left_start).unwrap().end = right.end;
            start = left_start;
        }
        // merge right
        let end = self.segments[&start].end;
        let merge_right = self
            .segments
            .get(&end)
            .is_some_and(|right| Self::mergeable(start, &self.segments[&start], end, right));
        if merge_right {
            let right = self.segments.remove(&end).unwrap();
            self.segments.get_mut(&start).unwrap().end = right.end;
        }
    }

    fn mergeable(left_start: u64, left: &Segment, right_start: u64, right: &Segment) -> bool {
        if left.end != right_start || left.layers.len() != 1 || right.layers.len() != 1 {
            return false;
        }
        let (l, r) = (&left.layers[0], &right.layers[0]);
        Arc::ptr_eq(&l.block, &r.block) && r.offset == l.offset + (left.end - left_start)
    }

    /// The active binding covering `point`, if any.  The returned slot's
    /// offset is translated to correspond to `point` itself.
    pub fn get(&self, point: u64) -> Option<PageSlot> {
        let (&start, seg) = self.segments.range(..=point).next_back()?;
        if seg.end > point {
            let slot = seg.layers.last().expect("segment layers empty");
            Some(slot.advanced(point - start))
        } else {
            None
        }
    }

    /// Sum of sizes of bound ranges.  Aliased layers do not multiply-count.
    pub fn bound_bytes(&self) -> u64 {
        self.segments
            .iter()
            .map(|(&start, seg)| seg.end - start)
            .sum()
    }

    /// Blocks referenced by any binding, in ascending key order, first
    /// appearance wins.
    pub fn blocks_in_order(&self) -> Vec<Arc<HeapBlock>> {
        let mut out: Vec<Arc<HeapBlock>> = Vec::new();
        for seg in self.segments.values() {
            for layer in &seg.layers {
                if !out.iter().any(|b| Arc::ptr_eq(b, &layer.block)) {
                    out.push(layer.block.clone());
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[cfg(any(test, feature = "validate"))]
    fn check(&self) {
        let mut prev_end = 0u64;
        for (&start, seg) in &self.segments {
            assert!(start >= prev_end, "segments overlap");
            assert!(seg.end > start, "empty segment");
            assert!(!seg.layers.is_empty(), "segment with no layers");
            prev_end = seg.end;
        }
    }

    #[cfg(not(any(test, feature = "validate")))]
    fn check(&self) {}
}

#[cfg(all(test, feature = "backend_soft"))]
mod tests {
    use super::*;
    use crate::imp;
    use crate::memory::MemoryFeatures;

    fn block(label: &str) -> Arc<HeapBlock> {
        let device = imp::Device::new_for_testing();
        let memory = device.allocate_memory(0, 1 << 20, None).unwrap();
        HeapBlock::new(
            memory,
            0,
            MemoryFeatures::DEVICE_LOCAL,
            1 << 20,
            None,
            label.to_string(),
        )
    }

    fn slot(block: &Arc<HeapBlock>, offset: u64) -> PageSlot {
        PageSlot {
            block: block.clone(),
            offset,
        }
    }

    const KIB: u64 = 1024;

    #[test]
    fn bind_query_unbind() {
        let m1 = block("m1");
        let mut map = IntervalMap::new();
        let evicted = map.set(0, 1024 * KIB, Some(slot(&m1, 0)), false);
        assert!(evicted.is_empty());
        assert_eq!(map.bound_bytes(), 1024 * KIB);

        let hit = map.get(512 * KIB).unwrap();
        assert!(Arc::ptr_eq(&hit.block, &m1));
        assert_eq!(hit.offset, 512 * KIB);
        assert!(map.get(1024 * KIB).is_none());

        let evicted = map.set(0, 1024 * KIB, None, false);
        assert_eq!(evicted.len(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn overlapping_rebind_splits_and_evicts() {
        let m1 = block("m1");
        let m2 = block("m2");
        let mut map = IntervalMap::new();
        map.set(0, 1024 * KIB, Some(slot(&m1, 0)), false);
        let evicted = map.set(512 * KIB, 1024 * KIB, Some(slot(&m2, 0)), false);
        // the back half of the m1 binding lost residency
        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0].block, &m1));
        assert_eq!(evicted[0].offset, 512 * KIB);

        let front = map.get(0).unwrap();
        assert!(Arc::ptr_eq(&front.block, &m1));
        let back = map.get(512 * KIB).unwrap();
        assert!(Arc::ptr_eq(&back.block, &m2));
        assert_eq!(back.offset, 0);
        let far = map.get(1024 * KIB).unwrap();
        assert!(Arc::ptr_eq(&far.block, &m2));
        assert_eq!(far.offset, 512 * KIB);
        assert!(map.get(1536 * KIB).is_none());
        assert_eq!(map.bound_bytes(), 1536 * KIB);
    }

    #[test]
    fn interior_unbind_leaves_flanks() {
        let m1 = block("m1");
        let mut map = IntervalMap::new();
        map.set(0, 300, Some(slot(&m1, 0)), false);
        let evicted = map.set(100, 100, None, false);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].offset, 100);
        assert!(map.get(0).is_some());
        assert!(map.get(150).is_none());
        let tail = map.get(200).unwrap();
        assert_eq!(tail.offset, 200);
        assert_eq!(map.bound_bytes(), 200);
    }

    #[test]
    fn contiguous_binds_merge() {
        let m1 = block("m1");
        let mut map = IntervalMap::new();
        map.set(0, 100, Some(slot(&m1, 0)), false);
        map.set(100, 100, Some(slot(&m1, 100)), false);
        assert_eq!(map.segments.len(), 1);
        assert_eq!(map.bound_bytes(), 200);
        // different block offset does not merge
        map.set(200, 100, Some(slot(&m1, 500)), false);
        assert_eq!(map.segments.len(), 2);
    }

    #[test]
    fn aliasing_layers_instead_of_evicting() {
        let m1 = block("m1");
        let m2 = block("m2");
        let mut map = IntervalMap::new();
        map.set(0, 100, Some(slot(&m1, 0)), true);
        let evicted = map.set(0, 100, Some(slot(&m2, 0)), true);
        assert!(evicted.is_empty(), "aliased rebind must not evict");
        // the most recent layer answers queries
        let hit = map.get(50).unwrap();
        assert!(Arc::ptr_eq(&hit.block, &m2));
        assert_eq!(map.bound_bytes(), 100);
        assert_eq!(map.blocks_in_order().len(), 2);
        // unbind drops the whole stack
        let evicted = map.set(0, 100, None, true);
        assert_eq!(evicted.len(), 2);
    }

    #[test]
    fn non_aliasing_same_key_evicts() {
        let m1 = block("m1");
        let m2 = block("m2");
        let mut map = IntervalMap::new();
        map.set(0, 100, Some(slot(&m1, 0)), false);
        let evicted = map.set(0, 100, Some(slot(&m2, 0)), false);
        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0].block, &m1));
    }
}
