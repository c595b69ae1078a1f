// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Non-sparse images.

use std::sync::{Arc, Mutex};

use crate::imp;
use crate::memory::{HeapBlock, MemoryRequirements, SubAllocation};
use crate::resources::device::{Device, DeviceError};
use crate::resources::{ImageUsage, QueueFamilySet, ResourceId, SharingMode};
use crate::staging::{self, TransferError};

/// Texel formats the core understands.  Enough to exercise every tile
/// shape; anything exotic belongs to the layer above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexelFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
}

impl TexelFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TexelFormat::R8Unorm => 1,
            TexelFormat::Rg8Unorm => 2,
            TexelFormat::Rgba8Unorm => 4,
            TexelFormat::Rgba16Float => 8,
            TexelFormat::Rgba32Float => 16,
            TexelFormat::Depth32Float => 4,
        }
    }
}

/// Everything needed to create an image.
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    pub extent: [u32; 3],
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: TexelFormat,
    pub usage: ImageUsage,
    pub sharing: SharingMode,
    pub families: QueueFamilySet,
}

impl ImageDescriptor {
    pub(crate) fn imp_layout(&self) -> imp::ImageLayout {
        imp::ImageLayout {
            extent: self.extent,
            mip_levels: self.mip_levels,
            array_layers: self.array_layers,
            bytes_per_texel: self.format.bytes_per_texel(),
        }
    }
}

/// An image created without backing memory; same lifecycle as
/// [crate::resources::Buffer].
#[derive(Debug)]
pub struct Image {
    id: ResourceId,
    device: Arc<Device>,
    raw: imp::RawImage,
    descriptor: ImageDescriptor,
    backing: Mutex<Option<SubAllocation>>,
    debug_label: String,
}

impl Image {
    pub fn new(
        device: &Arc<Device>,
        descriptor: ImageDescriptor,
        debug_label: &str,
    ) -> Result<Arc<Image>, DeviceError> {
        let raw =
            device
                .imp()
                .create_image(descriptor.imp_layout(), descriptor.usage, false, debug_label)?;
        Ok(Arc::new(Image {
            id: ResourceId::next(),
            device: device.clone(),
            raw,
            descriptor,
            backing: Mutex::new(None),
            debug_label: debug_label.to_string(),
        }))
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    pub fn sharing_mode(&self) -> SharingMode {
        self.descriptor.sharing
    }

    pub fn queue_families(&self) -> &QueueFamilySet {
        &self.descriptor.families
    }

    pub fn debug_label(&self) -> &str {
        &self.debug_label
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn requirements(&self) -> MemoryRequirements {
        self.device.imp().image_requirements(&self.raw)
    }

    pub fn is_baked(&self) -> bool {
        self.backing.lock().unwrap().is_some()
    }

    pub fn binding(&self) -> Option<SubAllocation> {
        self.backing.lock().unwrap().clone()
    }

    pub fn memory_block(&self) -> Option<Arc<HeapBlock>> {
        self.backing.lock().unwrap().as_ref().map(|s| s.block.clone())
    }

    pub(crate) fn raw(&self) -> &imp::RawImage {
        &self.raw
    }

    pub(crate) fn install_backing(&self, sub: SubAllocation) {
        *self.backing.lock().unwrap() = Some(sub);
    }

    pub(crate) fn clear_backing(&self) {
        self.raw.unbind_memory();
        *self.backing.lock().unwrap() = None;
    }

    /// Write a tightly packed row-major texel region of one subresource.
    /// Blocks until the bytes are visible to the device.
    pub fn write_texels(
        &self,
        mip: u32,
        layer: u32,
        origin: [u32; 3],
        extent: [u32; 3],
        data: &[u8],
    ) -> Result<(), TransferError> {
        staging::write_image(self, mip, layer, origin, extent, data)
    }

    /// Read a texel region of one subresource into `out`.
    pub fn read_texels(
        &self,
        mip: u32,
        layer: u32,
        origin: [u32; 3],
        extent: [u32; 3],
        out: &mut [u8],
    ) -> Result<(), TransferError> {
        staging::read_image(self, mip, layer, origin, extent, out)
    }
}

#[cfg(all(test, feature = "backend_soft"))]
mod tests {
    use super::*;

    fn small_descriptor() -> ImageDescriptor {
        ImageDescriptor {
            extent: [16, 16, 1],
            mip_levels: 1,
            array_layers: 1,
            format: TexelFormat::Rgba8Unorm,
            usage: ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED,
            sharing: SharingMode::Concurrent,
            families: QueueFamilySet::default(),
        }
    }

    #[test]
    fn requirements_are_image_aligned() {
        let device = Device::new_for_testing();
        let image = Image::new(&device, small_descriptor(), "img").unwrap();
        let req = image.requirements();
        assert_eq!(req.alignment, 4096);
        assert_eq!(req.size % req.alignment, 0);
    }

    #[test]
    fn render_attachments_require_dedicated() {
        let device = Device::new_for_testing();
        let mut descriptor = small_descriptor();
        descriptor.usage |= ImageUsage::RENDER_ATTACHMENT;
        let image = Image::new(&device, descriptor, "attachment").unwrap();
        assert!(image.requirements().dedicated.forces_singleton());
    }
}
