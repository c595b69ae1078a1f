// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

//! Command pools and one-shot command buffers.
//!
//! Recording collects commands into a vec; the queue replays them on
//! submit.  There is no deferred execution and no fences, so
//! `submit_and_wait` is literally both.

use super::buffer::RawBuffer;
use super::device::Error;
use super::image::RawImage;

/// One region of a buffer-to-buffer copy.
#[derive(Debug, Clone, Copy)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// One region of a buffer-to-image or image-to-buffer copy.  The buffer
/// side is tightly packed row-major.
#[derive(Debug, Clone, Copy)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub mip: u32,
    pub layer: u32,
    pub origin: [u32; 3],
    pub extent: [u32; 3],
}

#[derive(Debug)]
pub(super) enum Command {
    CopyBuffer {
        src: RawBuffer,
        dst: RawBuffer,
        regions: Vec<BufferCopy>,
    },
    CopyBufferToImage {
        src: RawBuffer,
        dst: RawImage,
        regions: Vec<BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: RawImage,
        dst: RawBuffer,
        regions: Vec<BufferImageCopy>,
    },
    /// Execution is synchronous, so barriers only mark intent.
    Barrier,
}

/// Allocates one-shot command buffers for a single queue family.
#[derive(Debug)]
pub struct CommandPool {
    family: u32,
}

impl CommandPool {
    pub(super) fn new(family: u32) -> CommandPool {
        CommandPool { family }
    }

    pub fn family_index(&self) -> u32 {
        self.family
    }

    /// Begin recording a one-shot command buffer.
    pub fn one_shot(&self, debug_label: &str) -> OneShotCommands {
        OneShotCommands {
            family: self.family,
            commands: Vec::new(),
            debug_label: debug_label.to_string(),
        }
    }
}

/// A command buffer recorded once and consumed by a single submit.
#[derive(Debug)]
pub struct OneShotCommands {
    family: u32,
    commands: Vec<Command>,
    debug_label: String,
}

impl OneShotCommands {
    pub fn family_index(&self) -> u32 {
        self.family
    }

    pub fn debug_label(&self) -> &str {
        &self.debug_label
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn copy_buffer(&mut self, src: &RawBuffer, dst: &RawBuffer, regions: Vec<BufferCopy>) {
        self.commands.push(Command::CopyBuffer {
            src: src.clone(),
            dst: dst.clone(),
            regions,
        });
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: &RawBuffer,
        dst: &RawImage,
        regions: Vec<BufferImageCopy>,
    ) {
        self.commands.push(Command::CopyBufferToImage {
            src: src.clone(),
            dst: dst.clone(),
            regions,
        });
    }

    pub fn copy_image_to_buffer(
        &mut self,
        src: &RawImage,
        dst: &RawBuffer,
        regions: Vec<BufferImageCopy>,
    ) {
        self.commands.push(Command::CopyImageToBuffer {
            src: src.clone(),
            dst: dst.clone(),
            regions,
        });
    }

    pub fn transfer_barrier(&mut self) {
        self.commands.push(Command::Barrier);
    }

    /// Replay every command in order.  Called by the queue on submit.
    pub(super) fn execute(self) -> Result<(), Error> {
        for command in self.commands {
            match command {
                Command::CopyBuffer { src, dst, regions } => {
                    for region in regions {
                        let mut scratch = vec![0u8; region.size as usize];
                        src.read_at(region.src_offset, &mut scratch)?;
                        dst.write_at(region.dst_offset, &scratch)?;
                    }
                }
                Command::CopyBufferToImage { src, dst, regions } => {
                    for region in regions {
                        let bytes = region_bytes(&dst, &region);
                        let mut scratch = vec![0u8; bytes as usize];
                        src.read_at(region.buffer_offset, &mut scratch)?;
                        dst.write_texels(
                            region.mip,
                            region.layer,
                            region.origin,
                            region.extent,
                            &scratch,
                        )?;
                    }
                }
                Command::CopyImageToBuffer { src, dst, regions } => {
                    for region in regions {
                        let bytes = region_bytes(&src, &region);
                        let mut scratch = vec![0u8; bytes as usize];
                        src.read_texels(
                            region.mip,
                            region.layer,
                            region.origin,
                            region.extent,
                            &mut scratch,
                        )?;
                        dst.write_at(region.buffer_offset, &scratch)?;
                    }
                }
                Command::Barrier => {}
            }
        }
        Ok(())
    }
}

fn region_bytes(image: &RawImage, region: &BufferImageCopy) -> u64 {
    region.extent[0] as u64
        * region.extent[1] as u64
        * region.extent[2] as u64
        * image.layout().bytes_per_texel as u64
}
