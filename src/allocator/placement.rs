// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Heap selection and block sizing for one group.

use std::cmp::Reverse;

use crate::allocator::grouping::Group;
use crate::allocator::intent::BindingIntent;
use crate::memory::{MemoryFeatures, MemoryTypeTable, round_up};

/// Eligible memory types for `group`, best first.
///
/// Scoring favors types carrying the group's *preferred* features on top of
/// its required ones: host-coherent and host-cached for host-visible groups,
/// device-local otherwise.  Ties break toward the larger heap, then the
/// lower index.  The commit pass walks this list, falling back to the next
/// candidate when a heap is exhausted.
pub(crate) fn candidate_types(table: &MemoryTypeTable, group: &Group) -> Vec<u32> {
    let preferred = if group
        .required
        .type_bits()
        .contains(MemoryFeatures::HOST_VISIBLE)
    {
        MemoryFeatures::HOST_COHERENT | MemoryFeatures::HOST_CACHED
    } else {
        MemoryFeatures::DEVICE_LOCAL
    };
    let mut candidates: Vec<u32> = group.mask.indices().collect();
    candidates.sort_by_key(|&index| {
        let offered = table.type_at(index).features;
        let score = (offered & preferred).bits().count_ones();
        (Reverse(score), Reverse(table.heap_size_of_type(index)), index)
    });
    candidates
}

/// Bytes the group's block must hold.  Replays the bump cursor of
/// [crate::memory::HeapBlock] over the members in insertion order: align
/// the cursor to the member's alignment, then advance by its raw size.
/// The planned size is exactly the laid-out end, so every member fits.
pub(crate) fn block_size(intents: &[BindingIntent], group: &Group) -> u64 {
    let mut end = 0;
    for &index in &group.intents {
        let intent = &intents[index];
        end = round_up(end, intent.alignment) + intent.size;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryHeap, MemoryType, MemoryTypeMask};

    fn table() -> MemoryTypeTable {
        MemoryTypeTable::new(
            vec![
                MemoryType {
                    heap_index: 0,
                    features: MemoryFeatures::DEVICE_LOCAL,
                },
                MemoryType {
                    heap_index: 1,
                    features: MemoryFeatures::HOST_VISIBLE | MemoryFeatures::HOST_COHERENT,
                },
                MemoryType {
                    heap_index: 0,
                    features: MemoryFeatures::DEVICE_LOCAL
                        | MemoryFeatures::HOST_VISIBLE
                        | MemoryFeatures::HOST_COHERENT,
                },
                MemoryType {
                    heap_index: 1,
                    features: MemoryFeatures::HOST_VISIBLE | MemoryFeatures::HOST_CACHED,
                },
            ],
            vec![MemoryHeap { size: 256 << 20 }, MemoryHeap { size: 1024 << 20 }],
        )
    }

    fn group(mask: MemoryTypeMask, required: MemoryFeatures) -> Group {
        Group {
            intents: Vec::new(),
            mask,
            required,
            dedicated: None,
        }
    }

    #[test]
    fn device_local_group_prefers_device_local_types() {
        let order = candidate_types(
            &table(),
            &group(MemoryTypeMask::all(4), MemoryFeatures::empty()),
        );
        // 0 and 2 both score on DEVICE_LOCAL and share a heap; lower index
        // first, then the host types by heap size.
        assert_eq!(order, vec![0, 2, 1, 3]);
    }

    #[test]
    fn host_visible_group_prefers_coherent_and_cached() {
        let order = candidate_types(
            &table(),
            &group(
                MemoryTypeMask(0b1010),
                MemoryFeatures::HOST_VISIBLE,
            ),
        );
        // equal single-feature scores; both on heap 1, index breaks the tie
        assert_eq!(order, vec![1, 3]);
    }

    #[test]
    fn bar_type_ranks_behind_plain_host_memory_for_uploads() {
        let order = candidate_types(
            &table(),
            &group(MemoryTypeMask(0b0110), MemoryFeatures::MAPPABLE),
        );
        // type 1 and the BAR type 2 both offer coherence; heap 1 is larger
        assert_eq!(order, vec![1, 2]);
    }

    #[cfg(feature = "backend_soft")]
    #[test]
    fn block_size_replays_the_cursor_across_mixed_alignments() {
        use crate::allocator::intent::{BindingIntent, IntentKind};
        use crate::memory::DedicatedHint;
        use crate::resources::{Buffer, BufferUsage, Device, QueueFamilySet, SharingMode};

        let device = Device::new_for_testing();
        let buffer = Buffer::new(
            &device,
            64,
            BufferUsage::TRANSFER_DST,
            SharingMode::Concurrent,
            QueueFamilySet::default(),
            "sizing",
        )
        .unwrap();
        let intent = |size, alignment| BindingIntent {
            resource: buffer.id(),
            kind: IntentKind::Buffer(buffer.clone()),
            size,
            alignment,
            type_mask: MemoryTypeMask::all(4),
            required: MemoryFeatures::empty(),
            dedicated: DedicatedHint::None,
            data: None,
        };
        let intents = vec![intent(100, 256), intent(4096, 4096), intent(32, 256)];
        let g = Group {
            intents: vec![0, 1, 2],
            mask: MemoryTypeMask::all(4),
            required: MemoryFeatures::empty(),
            dedicated: None,
        };
        // 100 at 0, 4096 at 4096, 32 at 8192; a sum of independently
        // padded sizes would plan 4608 and the layout would not fit
        assert_eq!(block_size(&intents, &g), 8224);
    }
}
