#![allow(dead_code)]
#![allow(unused_variables)]

// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Stub backend.  Compiles everywhere, does nothing; useful for checking
//! that the core stays backend-agnostic.

use crate::memory::{
    MemoryFeatures, MemoryRequirements, MemoryTypeTable, QueueCapabilities, QueueFamilyInfo,
};
use crate::resources::{BufferUsage, ImageUsage, ResourceId};
use std::fmt::Display;

#[derive(Debug)]
pub struct Error;
impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error")
    }
}
impl std::error::Error for Error {}

impl Error {
    pub fn is_out_of_memory(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct EntryPoint;
impl EntryPoint {
    pub fn new() -> Result<Self, Error> {
        todo!()
    }
}

#[derive(Debug, Clone)]
pub struct DeviceProfile;
impl Default for DeviceProfile {
    fn default() -> Self {
        DeviceProfile
    }
}

#[derive(Debug, Clone)]
pub struct Device;

impl Device {
    pub fn new(_entry_point: &EntryPoint) -> Result<Device, Error> {
        todo!()
    }

    pub fn with_profile(_profile: DeviceProfile) -> Device {
        todo!()
    }

    pub fn memory_type_table(&self) -> &MemoryTypeTable {
        todo!()
    }

    pub fn queue_families(&self) -> &[QueueFamilyInfo] {
        todo!()
    }

    pub fn supports_dedicated_allocation(&self) -> bool {
        todo!()
    }

    pub fn sparse_block_size(&self) -> u64 {
        todo!()
    }

    pub fn heap_used(&self, heap: u32) -> u64 {
        todo!()
    }

    pub fn allocate_memory(
        &self,
        type_index: u32,
        size: u64,
        dedicated: Option<ResourceId>,
    ) -> Result<DeviceMemory, Error> {
        todo!()
    }

    pub fn queue(&self, family: u32) -> Result<Queue, Error> {
        todo!()
    }

    pub fn create_command_pool(&self, family: u32) -> Result<CommandPool, Error> {
        todo!()
    }

    pub fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        sparse: bool,
        debug_label: &str,
    ) -> Result<RawBuffer, Error> {
        todo!()
    }

    pub fn create_image(
        &self,
        layout: ImageLayout,
        usage: ImageUsage,
        sparse: bool,
        debug_label: &str,
    ) -> Result<RawImage, Error> {
        todo!()
    }

    pub fn buffer_requirements(&self, buffer: &RawBuffer) -> MemoryRequirements {
        todo!()
    }

    pub fn image_requirements(&self, image: &RawImage) -> MemoryRequirements {
        todo!()
    }

    pub fn image_sparse_granularity(&self, image: &RawImage) -> [u32; 3] {
        todo!()
    }
}

#[derive(Debug, Clone)]
pub struct DeviceMemory;

impl DeviceMemory {
    pub fn size(&self) -> u64 {
        todo!()
    }
    pub fn type_index(&self) -> u32 {
        todo!()
    }
    pub fn features(&self) -> MemoryFeatures {
        todo!()
    }
    pub fn is_host_visible(&self) -> bool {
        todo!()
    }
    pub fn is_coherent(&self) -> bool {
        todo!()
    }
    pub fn dedicated_to(&self) -> Option<ResourceId> {
        todo!()
    }
    pub fn map(&self, offset: u64, size: u64) -> Result<MappedRange, Error> {
        todo!()
    }
}

#[derive(Debug)]
pub struct MappedRange;

impl MappedRange {
    pub fn len(&self) -> u64 {
        todo!()
    }
    pub fn is_empty(&self) -> bool {
        todo!()
    }
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        todo!()
    }
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), Error> {
        todo!()
    }
    pub fn flush(&self, offset: u64, len: u64) -> Result<(), Error> {
        todo!()
    }
}

#[derive(Debug, Clone)]
pub struct RawBuffer;

impl RawBuffer {
    pub fn size(&self) -> u64 {
        todo!()
    }
    pub fn usage(&self) -> BufferUsage {
        todo!()
    }
    pub fn is_sparse(&self) -> bool {
        todo!()
    }
    pub fn debug_label(&self) -> &str {
        todo!()
    }
    pub fn same_object(&self, other: &RawBuffer) -> bool {
        todo!()
    }
    pub fn bind_memory(&self, memory: &DeviceMemory, offset: u64) -> Result<(), Error> {
        todo!()
    }
    pub fn unbind_memory(&self) {
        todo!()
    }
    pub fn is_bound(&self) -> bool {
        todo!()
    }
}

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
    pub fn mip_bytes(&self, mip: u32) -> u64 {
        let e = self.mip_extent(mip);
        e[0] as u64 * e[1] as u64 * e[2] as u64 * self.bytes_per_texel as u64
    }
    pub fn layer_bytes(&self) -> u64 {
        (0..self.mip_levels).map(|m| self.mip_bytes(m)).sum()
    }
    pub fn total_bytes(&self) -> u64 {
        self.layer_bytes() * self.array_layers as u64
    }
    pub fn subresource_offset(&self, mip: u32, layer: u32) -> u64 {
        layer as u64 * self.layer_bytes() + (0..mip).map(|m| self.mip_bytes(m)).sum::<u64>()
    }
}

#[derive(Debug, Clone)]
pub struct RawImage;

impl RawImage {
    pub fn layout(&self) -> &ImageLayout {
        todo!()
    }
    pub fn usage(&self) -> ImageUsage {
        todo!()
    }
    pub fn is_sparse(&self) -> bool {
        todo!()
    }
    pub fn debug_label(&self) -> &str {
        todo!()
    }
    pub fn same_object(&self, other: &RawImage) -> bool {
        todo!()
    }
    pub fn total_bytes(&self) -> u64 {
        todo!()
    }
    pub fn granularity(&self) -> [u32; 3] {
        todo!()
    }
    pub fn mip_tail_first_lod(&self) -> u32 {
        todo!()
    }
    pub fn mip_tail_size(&self) -> u64 {
        todo!()
    }
    pub fn tile_counts(&self, mip: u32) -> [u32; 3] {
        todo!()
    }
    pub fn bind_memory(&self, memory: &DeviceMemory, offset: u64) -> Result<(), Error> {
        todo!()
    }
    pub fn unbind_memory(&self) {
        todo!()
    }
    pub fn is_bound(&self) -> bool {
        todo!()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub mip: u32,
    pub layer: u32,
    pub origin: [u32; 3],
    pub extent: [u32; 3],
}

#[derive(Debug)]
pub struct CommandPool;

impl CommandPool {
    pub fn family_index(&self) -> u32 {
        todo!()
    }
    pub fn one_shot(&self, debug_label: &str) -> OneShotCommands {
        todo!()
    }
}

#[derive(Debug)]
pub struct OneShotCommands;

impl OneShotCommands {
    pub fn family_index(&self) -> u32 {
        todo!()
    }
    pub fn debug_label(&self) -> &str {
        todo!()
    }
    pub fn is_empty(&self) -> bool {
        todo!()
    }
    pub fn copy_buffer(&mut self, src: &RawBuffer, dst: &RawBuffer, regions: Vec<BufferCopy>) {
        todo!()
    }
    pub fn copy_buffer_to_image(
        &mut self,
        src: &RawBuffer,
        dst: &RawImage,
        regions: Vec<BufferImageCopy>,
    ) {
        todo!()
    }
    pub fn copy_image_to_buffer(
        &mut self,
        src: &RawImage,
        dst: &RawBuffer,
        regions: Vec<BufferImageCopy>,
    ) {
        todo!()
    }
    pub fn transfer_barrier(&mut self) {
        todo!()
    }
}

#[derive(Debug)]
pub struct SparseBufferBind {
    pub buffer: RawBuffer,
    pub resource_offset: u64,
    pub size: u64,
    pub memory: Option<(DeviceMemory, u64)>,
}

#[derive(Debug)]
pub struct SparseImageBind {
    pub image: RawImage,
    pub mip: u32,
    pub layer: u32,
    pub tile: [u32; 3],
    pub memory: Option<(DeviceMemory, u64)>,
}

#[derive(Debug)]
pub struct SparseTailBind {
    pub image: RawImage,
    pub memory: Option<(DeviceMemory, u64)>,
}

#[derive(Debug, Default)]
pub struct SparseBindBatch {
    pub buffer_binds: Vec<SparseBufferBind>,
    pub image_binds: Vec<SparseImageBind>,
    pub tail_binds: Vec<SparseTailBind>,
}

impl SparseBindBatch {
    pub fn new() -> SparseBindBatch {
        SparseBindBatch::default()
    }
    pub fn is_empty(&self) -> bool {
        self.buffer_binds.is_empty() && self.image_binds.is_empty() && self.tail_binds.is_empty()
    }
    pub fn len(&self) -> usize {
        self.buffer_binds.len() + self.image_binds.len() + self.tail_binds.len()
    }
}

#[derive(Debug, Clone)]
pub struct Queue;

impl Queue {
    pub fn family_index(&self) -> u32 {
        todo!()
    }
    pub fn capabilities(&self) -> QueueCapabilities {
        todo!()
    }
    pub fn submit_and_wait(&self, commands: OneShotCommands) -> Result<(), Error> {
        todo!()
    }
    pub fn bind_sparse_and_wait(&self, batch: &SparseBindBatch) -> Result<(), Error> {
        todo!()
    }
}
