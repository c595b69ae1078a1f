// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! The public device wrapper.
//!
//! One [Device] per underlying device.  It owns the command-pool partition
//! and the scratch-buffer counters; everything else lives on the resources
//! and the allocator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use crate::imp;
use crate::memory::{MemoryTypeTable, QueueCapabilities, QueueFamilyInfo};
use crate::resources::{QueueFamilySet, SharingMode};

/// Threading configuration, fixed at device construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadMode {
    /// Command pools are partitioned per `(queue family, thread)`, so any
    /// thread may issue staging transfers.  Shared state is mutex-guarded.
    MultiThreaded,
    /// The caller promises single-threaded use; one command pool per queue
    /// family.
    Exclusive,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("backend error: {0}")]
    Backend(#[from] imp::Error),
    #[error("no queue family supports {0}")]
    NoCapableQueue(&'static str),
    #[error("no memory type offers {0:?}")]
    NoMemoryType(crate::memory::MemoryFeatures),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PoolKey {
    PerThread(u32, ThreadId),
    PerFamily(u32),
}

/// The device: oracle tables, queues, command pools, scratch accounting.
#[derive(Debug)]
pub struct Device {
    imp: imp::Device,
    thread_mode: ThreadMode,
    pools: Mutex<HashMap<PoolKey, Arc<imp::CommandPool>>>,
    scratch_live: AtomicU64,
    scratch_total: AtomicU64,
}

impl Device {
    pub fn new(
        entry_point: &crate::entry_point::EntryPoint,
        thread_mode: ThreadMode,
    ) -> Result<Arc<Device>, DeviceError> {
        let imp = imp::Device::new(entry_point.imp())?;
        logwise::info_sync!(
            "device ready, thread_mode {mode}",
            mode = logwise::privacy::LogIt(&thread_mode)
        );
        Ok(Arc::new(Device {
            imp,
            thread_mode,
            pools: Mutex::new(HashMap::new()),
            scratch_live: AtomicU64::new(0),
            scratch_total: AtomicU64::new(0),
        }))
    }

    #[cfg(feature = "backend_soft")]
    pub fn new_for_testing() -> Arc<Device> {
        Device::for_profile(imp::DeviceProfile::default(), ThreadMode::MultiThreaded)
    }

    /// A device over an explicit profile; tests shrink the heaps with this.
    #[cfg(feature = "backend_soft")]
    pub fn for_profile(profile: imp::DeviceProfile, thread_mode: ThreadMode) -> Arc<Device> {
        Arc::new(Device {
            imp: imp::Device::with_profile(profile),
            thread_mode,
            pools: Mutex::new(HashMap::new()),
            scratch_live: AtomicU64::new(0),
            scratch_total: AtomicU64::new(0),
        })
    }

    pub(crate) fn imp(&self) -> &imp::Device {
        &self.imp
    }

    pub fn thread_mode(&self) -> ThreadMode {
        self.thread_mode
    }

    pub fn memory_type_table(&self) -> &MemoryTypeTable {
        self.imp.memory_type_table()
    }

    pub fn queue_families(&self) -> &[QueueFamilyInfo] {
        self.imp.queue_families()
    }

    /// Page size for sparse resources on this device.
    pub fn sparse_page_size(&self) -> u64 {
        self.imp.sparse_block_size()
    }

    /// Bytes currently allocated from heap `heap`.
    pub fn heap_used(&self, heap: u32) -> u64 {
        self.imp.heap_used(heap)
    }

    /// One standalone heap block, for callers managing sparse page binds by
    /// hand.  Placement picks the first memory type offering `required`;
    /// blocks allocated for a batch go through [crate::allocator::Allocator]
    /// instead, which also scores candidates.
    pub fn allocate_block(
        &self,
        size: u64,
        required: crate::memory::MemoryFeatures,
        debug_label: &str,
    ) -> Result<Arc<crate::memory::HeapBlock>, DeviceError> {
        let table = self.memory_type_table();
        let mask = table.mask_satisfying(table.full_mask(), required);
        let type_index = mask
            .indices()
            .next()
            .ok_or(DeviceError::NoMemoryType(required))?;
        let features = table.type_at(type_index).features;
        let memory = self.imp.allocate_memory(type_index, size, None)?;
        Ok(crate::memory::HeapBlock::new(
            memory,
            type_index,
            features,
            size,
            None,
            debug_label.to_string(),
        ))
    }

    /// The command pool for `family` on the calling thread (per-thread
    /// partition under [ThreadMode::MultiThreaded]).
    pub(crate) fn command_pool(&self, family: u32) -> Result<Arc<imp::CommandPool>, DeviceError> {
        let key = match self.thread_mode {
            ThreadMode::MultiThreaded => PoolKey::PerThread(family, std::thread::current().id()),
            ThreadMode::Exclusive => PoolKey::PerFamily(family),
        };
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(self.imp.create_command_pool(family)?);
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    pub(crate) fn queue(&self, family: u32) -> Result<imp::Queue, DeviceError> {
        Ok(self.imp.queue(family)?)
    }

    /// A queue that can receive sparse-bind submissions.
    pub(crate) fn sparse_queue(&self) -> Result<imp::Queue, DeviceError> {
        let family = self
            .queue_families()
            .iter()
            .find(|f| f.capabilities.contains(QueueCapabilities::SPARSE_BIND))
            .ok_or(DeviceError::NoCapableQueue("sparse binding"))?;
        self.queue(family.index)
    }

    /// The queue for a staging transfer against a resource declared with
    /// `families` and `sharing`.  Exclusive sharing pins the transfer to the
    /// declared family; concurrent sharing picks the cheapest transfer-capable
    /// family: transfer-only, then compute, then universal.
    pub(crate) fn transfer_queue(
        &self,
        families: &QueueFamilySet,
        sharing: SharingMode,
    ) -> Result<imp::Queue, DeviceError> {
        let all = self.queue_families();
        let declared: Vec<&QueueFamilyInfo> = if families.is_empty() {
            all.iter().collect()
        } else {
            all.iter().filter(|f| families.contains(f.index)).collect()
        };
        if sharing == SharingMode::Exclusive {
            let family = declared
                .first()
                .ok_or(DeviceError::NoCapableQueue("transfer"))?;
            return self.queue(family.index);
        }
        let rank = |f: &QueueFamilyInfo| {
            let caps = f.capabilities;
            if !caps.contains(QueueCapabilities::TRANSFER) {
                3
            } else if !caps.contains(QueueCapabilities::GRAPHICS)
                && !caps.contains(QueueCapabilities::COMPUTE)
            {
                0
            } else if !caps.contains(QueueCapabilities::GRAPHICS) {
                1
            } else {
                2
            }
        };
        let family = declared
            .into_iter()
            .filter(|f| f.capabilities.contains(QueueCapabilities::TRANSFER))
            .min_by_key(|f| rank(f))
            .ok_or(DeviceError::NoCapableQueue("transfer"))?;
        self.queue(family.index)
    }

    pub(crate) fn note_scratch_created(&self) {
        self.scratch_live.fetch_add(1, Ordering::Relaxed);
        self.scratch_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_scratch_released(&self) {
        self.scratch_live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Scratch staging buffers currently alive.
    pub fn scratch_live(&self) -> u64 {
        self.scratch_live.load(Ordering::Relaxed)
    }

    /// Scratch staging buffers ever created on this device.
    pub fn scratch_allocated_total(&self) -> u64 {
        self.scratch_total.load(Ordering::Relaxed)
    }
}

#[cfg(all(test, feature = "backend_soft"))]
mod tests {
    use super::*;

    #[test]
    fn transfer_queue_prefers_dedicated_transfer() {
        let device = Device::new_for_testing();
        let queue = device
            .transfer_queue(&QueueFamilySet::default(), SharingMode::Concurrent)
            .unwrap();
        assert_eq!(queue.family_index(), 2);
    }

    #[test]
    fn exclusive_sharing_uses_declared_family() {
        let device = Device::new_for_testing();
        let queue = device
            .transfer_queue(&QueueFamilySet::new(vec![1]), SharingMode::Exclusive)
            .unwrap();
        assert_eq!(queue.family_index(), 1);
    }

    #[test]
    fn command_pools_partition_per_thread() {
        let device = Device::new_for_testing();
        let here = device.command_pool(0).unwrap();
        let here_again = device.command_pool(0).unwrap();
        assert!(Arc::ptr_eq(&here, &here_again));
        let elsewhere = std::thread::scope(|scope| {
            scope.spawn(|| device.command_pool(0).unwrap()).join().unwrap()
        });
        assert!(!Arc::ptr_eq(&here, &elsewhere));
    }
}
