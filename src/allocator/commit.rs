// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! The commit pass: allocate, sub-allocate, bind, upload, or roll all of
//! it back.
//!
//! Ordering matters here.  Blocks are allocated first so a heap failure
//! costs nothing to undo (dropping the `Arc<HeapBlock>`s releases the
//! memory).  Non-sparse binds land before sparse ones because they are
//! undone by a local unbind, while sparse rollback must also restore
//! tracker snapshots.  Uploads run last, against fully bound resources.

use std::collections::HashSet;
use std::sync::Arc;

use crate::allocator::BakeError;
use crate::allocator::grouping;
use crate::allocator::intent::{BindingIntent, IntentKind};
use crate::allocator::placement;
use crate::imp;
use crate::memory::{HeapBlock, SubAllocation};
use crate::residency::{BufferTrackerSnapshot, ImageTrackerSnapshot};
use crate::resources::{Device, ResourceId, SparseBuffer, SparseImage};

enum TrackerSnapshot {
    Buffer(Arc<SparseBuffer>, BufferTrackerSnapshot),
    Image(Arc<SparseImage>, ImageTrackerSnapshot),
}

/// Undo everything the bind phase did: unbind applied sparse regions on
/// the device, restore the trackers, then clear non-sparse backings.
/// Unbind errors are swallowed; rollback is best-effort on the device side
/// and exact on the tracker side.
fn roll_back(
    intents: &[BindingIntent],
    bound_nonsparse: &[usize],
    applied_sparse: &[usize],
    snapshots: Vec<TrackerSnapshot>,
) {
    for &index in applied_sparse.iter().rev() {
        match &intents[index].kind {
            IntentKind::SparseBufferRegion { buffer, offset, size } => {
                let _ = buffer.apply_binding(*offset, *size, None);
            }
            IntentKind::SparseImageRegion { image, key } => {
                let _ = image.apply_region(key, None);
            }
            IntentKind::SparseMipTail { image, key } => {
                let _ = image.apply_mip_tail(key, None);
            }
            IntentKind::Buffer(_) | IntentKind::Image(_) => {}
        }
    }
    for snapshot in snapshots {
        match snapshot {
            TrackerSnapshot::Buffer(buffer, state) => buffer.restore(state),
            TrackerSnapshot::Image(image, state) => image.restore(state),
        }
    }
    for &index in bound_nonsparse.iter().rev() {
        match &intents[index].kind {
            IntentKind::Buffer(buffer) => buffer.clear_backing(),
            IntentKind::Image(image) => image.clear_backing(),
            _ => {}
        }
    }
}

pub(crate) fn run(
    device: &Arc<Device>,
    intents: Vec<BindingIntent>,
    debug_label: &str,
) -> Result<(), BakeError> {
    let table = device.memory_type_table();
    let groups = grouping::group_intents(table, &intents)?;

    // Phase 1: one block per group.  Walk the candidate types, falling
    // back on heap exhaustion.  A failure here needs no cleanup beyond
    // dropping what was already allocated.
    let mut blocks: Vec<Arc<HeapBlock>> = Vec::with_capacity(groups.len());
    for (group_index, group) in groups.iter().enumerate() {
        let size = placement::block_size(&intents, group);
        let block = 'alloc: {
            let mut last = None;
            for type_index in placement::candidate_types(table, group) {
                match device.imp().allocate_memory(type_index, size, group.dedicated) {
                    Ok(memory) => {
                        break 'alloc HeapBlock::new(
                            memory,
                            type_index,
                            table.type_at(type_index).features,
                            size,
                            group.dedicated,
                            format!("{debug_label} block {group_index}"),
                        );
                    }
                    Err(e) if e.is_out_of_memory() => last = Some(e),
                    Err(e) => return Err(BakeError::AllocationFailed { size, source: e }),
                }
            }
            match last {
                Some(source) => return Err(BakeError::AllocationFailed { size, source }),
                // grouping guarantees a non-empty candidate list
                None => {
                    return Err(BakeError::BindFailed {
                        detail: format!("group {group_index} had no candidate memory type"),
                    });
                }
            }
        };
        blocks.push(block);
    }

    // Phase 2: carve each block up in intent order.
    let mut subs: Vec<Option<SubAllocation>> = (0..intents.len()).map(|_| None).collect();
    for (group, block) in groups.iter().zip(&blocks) {
        for &index in &group.intents {
            let intent = &intents[index];
            let Some(sub) = block.suballocate(intent.size, intent.alignment) else {
                debug_assert!(false, "block sized by the plan cannot overflow");
                return Err(BakeError::BindFailed {
                    detail: format!(
                        "sub-allocation of {}+{} overflowed a {}-byte block",
                        intent.size,
                        intent.alignment,
                        block.size()
                    ),
                });
            };
            subs[index] = Some(sub);
        }
    }

    let mut bound_nonsparse: Vec<usize> = Vec::new();
    let mut applied_sparse: Vec<usize> = Vec::new();

    // Phase 3: snapshot each sparse tracker we are about to touch, once.
    let mut snapshots: Vec<TrackerSnapshot> = Vec::new();
    let mut snapshotted: HashSet<ResourceId> = HashSet::new();
    for intent in &intents {
        if !intent.is_sparse() || !snapshotted.insert(intent.resource) {
            continue;
        }
        match &intent.kind {
            IntentKind::SparseBufferRegion { buffer, .. } => {
                snapshots.push(TrackerSnapshot::Buffer(buffer.clone(), buffer.snapshot()));
            }
            IntentKind::SparseImageRegion { image, .. }
            | IntentKind::SparseMipTail { image, .. } => {
                snapshots.push(TrackerSnapshot::Image(image.clone(), image.snapshot()));
            }
            IntentKind::Buffer(_) | IntentKind::Image(_) => {}
        }
    }

    // Phase 4: bind.  Non-sparse binds are issued one by one; sparse binds
    // are staged into a single batch, submitted to the sparse queue once,
    // then recorded tracker by tracker.
    let mut sparse_batch = imp::SparseBindBatch::new();
    let mut staged_sparse: Vec<usize> = Vec::new();
    for (index, intent) in intents.iter().enumerate() {
        // every intent received a sub-allocation in phase 2
        let Some(sub) = subs[index].clone() else {
            roll_back(&intents, &bound_nonsparse, &applied_sparse, snapshots);
            return Err(BakeError::BindFailed {
                detail: format!("intent {index} missed sub-allocation"),
            });
        };
        let target = (sub.block.clone(), sub.offset);
        let result = match &intent.kind {
            IntentKind::Buffer(buffer) => {
                buffer
                    .raw()
                    .bind_memory(sub.block.memory(), sub.offset)
                    .map(|()| {
                        buffer.install_backing(sub.clone());
                        bound_nonsparse.push(index);
                    })
                    .map_err(|e| e.to_string())
            }
            IntentKind::Image(image) => {
                image
                    .raw()
                    .bind_memory(sub.block.memory(), sub.offset)
                    .map(|()| {
                        image.install_backing(sub.clone());
                        bound_nonsparse.push(index);
                    })
                    .map_err(|e| e.to_string())
            }
            IntentKind::SparseBufferRegion { buffer, offset, size } => buffer
                .stage_binding(&mut sparse_batch, *offset, *size, Some(&target))
                .map(|()| staged_sparse.push(index))
                .map_err(|e| e.to_string()),
            IntentKind::SparseImageRegion { image, key } => image
                .stage_region(&mut sparse_batch, key, Some(&target))
                .map(|()| staged_sparse.push(index))
                .map_err(|e| e.to_string()),
            IntentKind::SparseMipTail { image, key } => image
                .stage_mip_tail(&mut sparse_batch, key, Some(&target))
                .map(|()| staged_sparse.push(index))
                .map_err(|e| e.to_string()),
        };
        if let Err(detail) = result {
            roll_back(&intents, &bound_nonsparse, &applied_sparse, snapshots);
            return Err(BakeError::BindFailed { detail });
        }
    }
    if !sparse_batch.is_empty() {
        let submitted = device
            .sparse_queue()
            .map_err(|e| e.to_string())
            .and_then(|queue| {
                queue
                    .bind_sparse_and_wait(&sparse_batch)
                    .map_err(|e| e.to_string())
            });
        // on failure no tracker recorded anything; the snapshots undo the
        // rest
        if let Err(detail) = submitted {
            roll_back(&intents, &bound_nonsparse, &applied_sparse, snapshots);
            return Err(BakeError::BindFailed { detail });
        }
        for &index in &staged_sparse {
            let Some(sub) = subs[index].clone() else { continue };
            let target = Some((sub.block.clone(), sub.offset));
            match &intents[index].kind {
                IntentKind::SparseBufferRegion { buffer, offset, size } => {
                    let _ = buffer.record_binding(*offset, *size, target);
                }
                IntentKind::SparseImageRegion { image, key } => {
                    let _ = image.record_region(key, target);
                }
                IntentKind::SparseMipTail { image, key } => {
                    let _ = image.record_mip_tail(key, target);
                }
                IntentKind::Buffer(_) | IntentKind::Image(_) => {}
            }
            applied_sparse.push(index);
        }
    }

    // Phase 5: initial data, now that everything is bound.
    for intent in &intents {
        let Some(data) = &intent.data else { continue };
        let upload = match &intent.kind {
            IntentKind::Buffer(buffer) => buffer.write(&data.bytes, data.offset),
            IntentKind::Image(image) => {
                let extent = image.descriptor().extent;
                image.write_texels(0, 0, [0, 0, 0], extent, &data.bytes)
            }
            // sparse intents never carry initial data
            _ => Ok(()),
        };
        if let Err(source) = upload {
            roll_back(&intents, &bound_nonsparse, &applied_sparse, snapshots);
            return Err(BakeError::InitialUploadFailed { source });
        }
    }
    Ok(())
}
