// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Device: the oracle tables plus allocation entry points.

use std::sync::{Arc, Mutex};

use crate::memory::{
    DedicatedHint, MemoryFeatures, MemoryHeap, MemoryRequirements, MemoryType, MemoryTypeMask,
    MemoryTypeTable, QueueCapabilities, QueueFamilyInfo,
};
use crate::resources::{BufferUsage, ImageUsage, ResourceId};

use super::buffer::RawBuffer;
use super::command::CommandPool;
use super::image::{ImageLayout, RawImage};
use super::memory::DeviceMemory;
use super::queue::Queue;

/// Backend failures.  Wrapped by the public error enums; never surfaced
/// raw.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("heap {heap} exhausted: requested {requested} bytes, {available} available")]
    OutOfDeviceMemory {
        heap: u32,
        requested: u64,
        available: u64,
    },
    #[error("memory type {0} is not host-visible")]
    NotHostVisible(u32),
    #[error("resource is already bound to memory")]
    AlreadyBound,
    #[error("resource has no bound memory")]
    NotBound,
    #[error("access of {offset}+{len} exceeds size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("memory type index {0} out of range")]
    BadMemoryType(u32),
    #[error("queue family {0} does not exist")]
    BadQueueFamily(u32),
    #[error("queue family {family} cannot {operation}")]
    UnsupportedOperation { family: u32, operation: &'static str },
    #[error("operation requires a sparse resource")]
    NotSparse,
    #[error("operation requires a non-sparse resource")]
    Sparse,
    #[error("dedicated allocation bound to the wrong resource")]
    DedicatedMismatch,
}

impl Error {
    /// True when the failure is heap exhaustion, which the allocator treats
    /// as "try the next candidate type".
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfDeviceMemory { .. })
    }
}

/// Static description of the modeled device.  The default models a discrete
/// card; tests shrink the heaps to provoke exhaustion.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub table: MemoryTypeTable,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub sparse_block_size: u64,
    pub buffer_alignment: u64,
    pub image_alignment: u64,
    pub supports_dedicated: bool,
}

impl Default for DeviceProfile {
    fn default() -> DeviceProfile {
        const MIB: u64 = 1 << 20;
        let table = MemoryTypeTable::new(
            vec![
                // 0: plain VRAM
                MemoryType {
                    heap_index: 0,
                    features: MemoryFeatures::DEVICE_LOCAL,
                },
                // 1: system memory, coherent
                MemoryType {
                    heap_index: 1,
                    features: MemoryFeatures::HOST_VISIBLE
                        | MemoryFeatures::HOST_COHERENT
                        | MemoryFeatures::MAPPABLE,
                },
                // 2: BAR aperture
                MemoryType {
                    heap_index: 0,
                    features: MemoryFeatures::DEVICE_LOCAL
                        | MemoryFeatures::HOST_VISIBLE
                        | MemoryFeatures::HOST_COHERENT
                        | MemoryFeatures::MAPPABLE,
                },
                // 3: system memory, cached, needs flushes
                MemoryType {
                    heap_index: 1,
                    features: MemoryFeatures::HOST_VISIBLE
                        | MemoryFeatures::HOST_CACHED
                        | MemoryFeatures::MAPPABLE,
                },
            ],
            vec![MemoryHeap { size: 256 * MIB }, MemoryHeap { size: 1024 * MIB }],
        );
        let queue_families = vec![
            QueueFamilyInfo {
                index: 0,
                capabilities: QueueCapabilities::GRAPHICS
                    | QueueCapabilities::COMPUTE
                    | QueueCapabilities::TRANSFER
                    | QueueCapabilities::SPARSE_BIND,
                queue_count: 1,
            },
            QueueFamilyInfo {
                index: 1,
                capabilities: QueueCapabilities::COMPUTE
                    | QueueCapabilities::TRANSFER
                    | QueueCapabilities::SPARSE_BIND,
                queue_count: 2,
            },
            QueueFamilyInfo {
                index: 2,
                capabilities: QueueCapabilities::TRANSFER,
                queue_count: 1,
            },
        ];
        DeviceProfile {
            table,
            queue_families,
            sparse_block_size: 65536,
            buffer_alignment: 256,
            image_alignment: 4096,
            supports_dedicated: true,
        }
    }
}

#[derive(Debug)]
pub(super) struct DeviceShared {
    pub(super) profile: DeviceProfile,
    /// Bytes currently allocated per heap; grows on allocate, shrinks when
    /// a [DeviceMemory] drops.
    pub(super) heap_used: Mutex<Vec<u64>>,
}

/// The software device.  Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct Device {
    pub(super) shared: Arc<DeviceShared>,
    queues: Arc<Vec<Queue>>,
}

impl Device {
    pub fn new(_entry_point: &super::EntryPoint) -> Result<Device, Error> {
        Ok(Device::with_profile(DeviceProfile::default()))
    }

    pub fn with_profile(profile: DeviceProfile) -> Device {
        let heap_count = profile.table.heaps().len();
        let shared = Arc::new(DeviceShared {
            profile,
            heap_used: Mutex::new(vec![0; heap_count]),
        });
        let queues = shared
            .profile
            .queue_families
            .iter()
            .map(|family| Queue::new(shared.clone(), *family))
            .collect();
        Device {
            shared,
            queues: Arc::new(queues),
        }
    }

    /// A device with the default profile, no entry point required.
    pub fn new_for_testing() -> Device {
        Device::with_profile(DeviceProfile::default())
    }

    pub fn memory_type_table(&self) -> &MemoryTypeTable {
        &self.shared.profile.table
    }

    pub fn queue_families(&self) -> &[QueueFamilyInfo] {
        &self.shared.profile.queue_families
    }

    pub fn supports_dedicated_allocation(&self) -> bool {
        self.shared.profile.supports_dedicated
    }

    pub fn sparse_block_size(&self) -> u64 {
        self.shared.profile.sparse_block_size
    }

    /// Bytes currently allocated from `heap`.
    pub fn heap_used(&self, heap: u32) -> u64 {
        self.shared.heap_used.lock().unwrap()[heap as usize]
    }

    /// One device allocation.  `dedicated` ties the allocation to a single
    /// resource; binding any other resource to it is rejected.
    pub fn allocate_memory(
        &self,
        type_index: u32,
        size: u64,
        dedicated: Option<ResourceId>,
    ) -> Result<DeviceMemory, Error> {
        let types = self.shared.profile.table.types();
        let Some(memory_type) = types.get(type_index as usize) else {
            return Err(Error::BadMemoryType(type_index));
        };
        let heap = memory_type.heap_index;
        let heap_size = self.shared.profile.table.heaps()[heap as usize].size;
        {
            let mut used = self.shared.heap_used.lock().unwrap();
            let available = heap_size.saturating_sub(used[heap as usize]);
            if size > available {
                return Err(Error::OutOfDeviceMemory {
                    heap,
                    requested: size,
                    available,
                });
            }
            used[heap as usize] += size;
        }
        Ok(DeviceMemory::new(
            self.shared.clone(),
            type_index,
            heap,
            memory_type.features,
            size,
            dedicated,
        ))
    }

    pub fn queue(&self, family: u32) -> Result<Queue, Error> {
        self.queues
            .iter()
            .find(|q| q.family_index() == family)
            .cloned()
            .ok_or(Error::BadQueueFamily(family))
    }

    pub fn create_command_pool(&self, family: u32) -> Result<CommandPool, Error> {
        if (family as usize) >= self.shared.profile.queue_families.len() {
            return Err(Error::BadQueueFamily(family));
        }
        Ok(CommandPool::new(family))
    }

    pub fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        sparse: bool,
        debug_label: &str,
    ) -> Result<RawBuffer, Error> {
        Ok(RawBuffer::new(size, usage, sparse, debug_label))
    }

    pub fn create_image(
        &self,
        layout: ImageLayout,
        usage: ImageUsage,
        sparse: bool,
        debug_label: &str,
    ) -> Result<RawImage, Error> {
        Ok(RawImage::new(
            layout,
            usage,
            sparse,
            self.shared.profile.sparse_block_size,
            debug_label,
        ))
    }

    /// Memory requirements for a buffer, as the oracle reports them.
    pub fn buffer_requirements(&self, buffer: &RawBuffer) -> MemoryRequirements {
        let profile = &self.shared.profile;
        if buffer.is_sparse() {
            // sparse backing must be device-local, block-granular
            MemoryRequirements {
                size: crate::memory::round_up(buffer.size(), profile.sparse_block_size),
                alignment: profile.sparse_block_size,
                type_mask: self.mask_with(MemoryFeatures::DEVICE_LOCAL),
                dedicated: DedicatedHint::None,
            }
        } else {
            MemoryRequirements {
                size: buffer.size(),
                alignment: profile.buffer_alignment,
                type_mask: profile.table.full_mask(),
                dedicated: DedicatedHint::None,
            }
        }
    }

    /// Memory requirements for an image.  Render attachments require a
    /// dedicated allocation on this device; large images prefer one.
    pub fn image_requirements(&self, image: &RawImage) -> MemoryRequirements {
        const DEDICATED_PREFERRED_FLOOR: u64 = 16 << 20;
        let profile = &self.shared.profile;
        let size = crate::memory::round_up(image.total_bytes(), profile.image_alignment);
        let dedicated = if image.usage().contains(ImageUsage::RENDER_ATTACHMENT) {
            DedicatedHint::Required
        } else if size >= DEDICATED_PREFERRED_FLOOR {
            DedicatedHint::Preferred
        } else {
            DedicatedHint::None
        };
        MemoryRequirements {
            size,
            alignment: profile.image_alignment,
            type_mask: self.mask_with(MemoryFeatures::DEVICE_LOCAL),
            dedicated: if self.supports_dedicated_allocation() {
                dedicated
            } else {
                DedicatedHint::None
            },
        }
    }

    /// Tile extent for a sparse image of the given format, chosen so one
    /// tile occupies exactly one sparse block.
    pub fn image_sparse_granularity(&self, image: &RawImage) -> [u32; 3] {
        image.granularity_for_block(self.shared.profile.sparse_block_size)
    }

    fn mask_with(&self, features: MemoryFeatures) -> MemoryTypeMask {
        let table = &self.shared.profile.table;
        table.mask_satisfying(table.full_mask(), features)
    }
}
