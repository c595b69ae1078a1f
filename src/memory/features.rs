// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Memory feature sets and memory-type masks.
//!
//! These are the two currencies of the allocator: a resource asks for a
//! [MemoryFeatures] set it requires, and the device reports a
//! [MemoryTypeMask] of the types the resource may legally bind to.  The
//! allocator only ever narrows masks by intersection.

bitflags::bitflags! {
    /// Properties of a device memory type.
    ///
    /// Two feature sets are *compatible* when the required bits of one are a
    /// subset of the bits of the other; see [MemoryFeatures::satisfied_by].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryFeatures: u32 {
        /// Memory lives in device-local storage; fastest for GPU access.
        const DEVICE_LOCAL = 1 << 0;
        /// Memory can be mapped into the host address space.
        const HOST_VISIBLE = 1 << 1;
        /// Host writes are visible to the device without explicit flushes.
        const HOST_COHERENT = 1 << 2;
        /// Host reads go through the CPU cache.
        const HOST_CACHED = 1 << 3;
        /// Backing may be committed lazily by the device.
        const LAZILY_ALLOCATED = 1 << 4;
        /// Protected-content memory; not host accessible.
        const PROTECTED = 1 << 5;
        /// The resource wants a persistent host mapping.  On every device we
        /// model, this implies `HOST_VISIBLE`.
        const MAPPABLE = 1 << 6;
        /// Opt in to a dedicated allocation for this resource.
        const DEDICATED_ONLY = 1 << 7;
        /// Opt in to external-handle sharing for the backing allocation.
        const EXTERNAL_SHARED = 1 << 8;
    }
}

impl MemoryFeatures {
    /// The bits that must be offered by a memory type for this requirement
    /// set to be satisfiable.  `DEDICATED_ONLY` and `EXTERNAL_SHARED` select
    /// allocation mechanisms, not type properties, so they are excluded.
    pub fn type_bits(self) -> MemoryFeatures {
        let mut bits = self & !(MemoryFeatures::DEDICATED_ONLY | MemoryFeatures::EXTERNAL_SHARED);
        // MAPPABLE is a request for host visibility under another name.
        if bits.contains(MemoryFeatures::MAPPABLE) {
            bits |= MemoryFeatures::HOST_VISIBLE;
        }
        bits
    }

    /// True when every required type bit of `self` appears in `offered`.
    pub fn satisfied_by(self, offered: MemoryFeatures) -> bool {
        let required = self.type_bits() & !MemoryFeatures::MAPPABLE;
        offered.contains(required)
    }
}

/// A bitset over the device's reported memory types.
///
/// Bit `i` set means memory type index `i` is a legal binding target.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryTypeMask(pub u32);

impl MemoryTypeMask {
    pub const NONE: MemoryTypeMask = MemoryTypeMask(0);

    /// A mask with the low `n` bits set; the "any type" mask for a device
    /// with `n` memory types.
    pub fn all(n: u32) -> MemoryTypeMask {
        debug_assert!(n <= 32);
        if n >= 32 {
            MemoryTypeMask(u32::MAX)
        } else {
            MemoryTypeMask((1u32 << n) - 1)
        }
    }

    pub fn single(index: u32) -> MemoryTypeMask {
        MemoryTypeMask(1u32 << index)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, index: u32) -> bool {
        self.0 & (1u32 << index) != 0
    }

    pub fn intersect(self, other: MemoryTypeMask) -> MemoryTypeMask {
        MemoryTypeMask(self.0 & other.0)
    }

    /// Iterate set type indices, lowest first.
    pub fn indices(self) -> impl Iterator<Item = u32> {
        (0..32u32).filter(move |i| self.0 & (1u32 << i) != 0)
    }

    pub fn len(self) -> u32 {
        self.0.count_ones()
    }
}

impl std::fmt::Debug for MemoryTypeMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryTypeMask({:#06b})", self.0)
    }
}

impl std::ops::BitAnd for MemoryTypeMask {
    type Output = MemoryTypeMask;
    fn bitand(self, rhs: MemoryTypeMask) -> MemoryTypeMask {
        self.intersect(rhs)
    }
}

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` of zero is treated as one; alignments are not required to be
/// powers of two, matching the underlying API's contract for buffer
/// requirements.
pub fn round_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfied_by_is_subset() {
        let required = MemoryFeatures::HOST_VISIBLE | MemoryFeatures::HOST_COHERENT;
        let offered = MemoryFeatures::HOST_VISIBLE
            | MemoryFeatures::HOST_COHERENT
            | MemoryFeatures::HOST_CACHED;
        assert!(required.satisfied_by(offered));
        assert!(!offered.contains(MemoryFeatures::DEVICE_LOCAL));
        assert!(!(required | MemoryFeatures::DEVICE_LOCAL).satisfied_by(offered));
    }

    #[test]
    fn mappable_implies_host_visible() {
        let required = MemoryFeatures::MAPPABLE;
        assert!(required.satisfied_by(MemoryFeatures::HOST_VISIBLE));
        assert!(!required.satisfied_by(MemoryFeatures::DEVICE_LOCAL));
    }

    #[test]
    fn dedicated_bits_do_not_constrain_type() {
        let required = MemoryFeatures::DEVICE_LOCAL | MemoryFeatures::DEDICATED_ONLY;
        assert!(required.satisfied_by(MemoryFeatures::DEVICE_LOCAL));
    }

    #[test]
    fn mask_ops() {
        let a = MemoryTypeMask(0b1011);
        let b = MemoryTypeMask(0b0110);
        assert_eq!((a & b).0, 0b0010);
        assert!(a.contains(0));
        assert!(!a.contains(2));
        assert_eq!(a.indices().collect::<Vec<_>>(), vec![0, 1, 3]);
        assert_eq!(MemoryTypeMask::all(4).0, 0b1111);
        assert!(MemoryTypeMask::NONE.is_empty());
    }

    #[test]
    fn round_up_arithmetic() {
        assert_eq!(round_up(0, 16), 0);
        assert_eq!(round_up(1, 16), 16);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(100, 16), 112);
        assert_eq!(round_up(32, 64), 64);
        assert_eq!(round_up(7, 0), 7);
    }
}
