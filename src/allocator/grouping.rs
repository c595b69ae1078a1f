// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Greedy grouping of intents by memory compatibility.
//!
//! Each new intent joins the first existing group whose type mask still has
//! an eligible member under the combined feature requirements; otherwise it
//! opens a new group.  Dedicated intents never share.

use crate::allocator::BakeError;
use crate::allocator::intent::BindingIntent;
use crate::memory::{MemoryFeatures, MemoryTypeMask, MemoryTypeTable};
use crate::resources::ResourceId;

/// One partition of the intent list, destined for a single heap block.
#[derive(Debug)]
pub(crate) struct Group {
    /// Indices into the intent list, in insertion order.
    pub intents: Vec<usize>,
    /// Types eligible for the whole group: the mask intersection already
    /// narrowed to types offering the union of required features.
    pub mask: MemoryTypeMask,
    /// Union of the members' required features.
    pub required: MemoryFeatures,
    /// The singleton member's id when this group is a dedicated allocation.
    pub dedicated: Option<ResourceId>,
}

pub(crate) fn group_intents(
    table: &MemoryTypeTable,
    intents: &[BindingIntent],
) -> Result<Vec<Group>, BakeError> {
    let mut groups: Vec<Group> = Vec::new();
    for (index, intent) in intents.iter().enumerate() {
        let own = table.mask_satisfying(intent.type_mask, intent.required);
        if own.is_empty() {
            return Err(BakeError::NoCompatibleMemoryType {
                resource: intent.resource,
                required: intent.required,
            });
        }
        let singleton = intent.dedicated.forces_singleton()
            || intent.required.contains(MemoryFeatures::DEDICATED_ONLY);
        if singleton {
            groups.push(Group {
                intents: vec![index],
                mask: own,
                required: intent.required,
                dedicated: Some(intent.resource),
            });
            continue;
        }
        let joined = groups.iter_mut().filter(|g| g.dedicated.is_none()).find_map(|group| {
            let union = group.required | intent.required;
            let joint = table.mask_satisfying(group.mask & intent.type_mask, union);
            if joint.is_empty() {
                None
            } else {
                Some((group, union, joint))
            }
        });
        match joined {
            Some((group, union, joint)) => {
                group.intents.push(index);
                group.required = union;
                group.mask = joint;
            }
            None => groups.push(Group {
                intents: vec![index],
                mask: own,
                required: intent.required,
                dedicated: None,
            }),
        }
    }
    Ok(groups)
}

#[cfg(all(test, feature = "backend_soft"))]
mod tests {
    use super::*;
    use crate::allocator::intent::IntentKind;
    use crate::memory::{DedicatedHint, MemoryHeap, MemoryType};
    use std::sync::Arc;

    fn table() -> MemoryTypeTable {
        MemoryTypeTable::new(
            vec![
                MemoryType {
                    heap_index: 0,
                    features: MemoryFeatures::DEVICE_LOCAL,
                },
                MemoryType {
                    heap_index: 1,
                    features: MemoryFeatures::HOST_VISIBLE
                        | MemoryFeatures::HOST_COHERENT
                        | MemoryFeatures::MAPPABLE,
                },
            ],
            vec![MemoryHeap { size: 1 << 28 }, MemoryHeap { size: 1 << 30 }],
        )
    }

    fn intent(required: MemoryFeatures, dedicated: DedicatedHint) -> BindingIntent {
        // grouping never follows the kind pointer, so any resource works
        let device = crate::resources::Device::new_for_testing();
        let buffer = crate::resources::Buffer::new(
            &device,
            64,
            crate::resources::BufferUsage::TRANSFER_DST,
            crate::resources::SharingMode::Concurrent,
            crate::resources::QueueFamilySet::default(),
            "g",
        )
        .unwrap();
        BindingIntent {
            resource: buffer.id(),
            kind: IntentKind::Buffer(Arc::clone(&buffer)),
            size: 64,
            alignment: 16,
            type_mask: MemoryTypeMask::all(2),
            required,
            dedicated,
            data: None,
        }
    }

    #[test]
    fn compatible_intents_share_a_group() {
        let intents = vec![
            intent(MemoryFeatures::DEVICE_LOCAL, DedicatedHint::None),
            intent(MemoryFeatures::empty(), DedicatedHint::None),
            intent(MemoryFeatures::DEVICE_LOCAL, DedicatedHint::None),
        ];
        let groups = group_intents(&table(), &intents).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].intents, vec![0, 1, 2]);
        assert_eq!(groups[0].mask, MemoryTypeMask::single(0));
    }

    #[test]
    fn conflicting_features_split_groups() {
        let intents = vec![
            intent(MemoryFeatures::DEVICE_LOCAL, DedicatedHint::None),
            intent(MemoryFeatures::MAPPABLE, DedicatedHint::None),
        ];
        let groups = group_intents(&table(), &intents).unwrap();
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn dedicated_intents_are_singletons() {
        let intents = vec![
            intent(MemoryFeatures::DEVICE_LOCAL, DedicatedHint::None),
            intent(MemoryFeatures::DEVICE_LOCAL, DedicatedHint::Required),
            intent(MemoryFeatures::DEVICE_LOCAL, DedicatedHint::None),
        ];
        let groups = group_intents(&table(), &intents).unwrap();
        assert_eq!(groups.len(), 2);
        let dedicated: Vec<_> = groups.iter().filter(|g| g.dedicated.is_some()).collect();
        assert_eq!(dedicated.len(), 1);
        assert_eq!(dedicated[0].intents, vec![1]);
    }

    #[test]
    fn impossible_requirement_is_detected_before_any_allocation() {
        let intents = vec![intent(MemoryFeatures::PROTECTED, DedicatedHint::None)];
        let err = group_intents(&table(), &intents).unwrap_err();
        assert!(matches!(err, BakeError::NoCompatibleMemoryType { .. }));
    }
}
