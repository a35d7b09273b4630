// Host memory standing in for device memory
//
// Buffers are one byte vector. Images keep one tightly packed byte vector per
// subresource, indexed mip-major the same way `Subresource::index` numbers
// them.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use parking_lot::Mutex;

use crate::error::{exhausted, violation};
use crate::resource::{BufferDesc, ImageDesc};

/// Largest single allocation the software device accepts.
pub(super) const MAX_ALLOCATION: u64 = 1 << 32;

#[derive(Debug)]
pub(crate) struct BufferMemory {
    pub desc: BufferDesc,
    pub bytes: Mutex<Vec<u8>>,
    mapped: AtomicBool,
}

impl BufferMemory {
    pub(super) fn new(desc: BufferDesc) -> Result<Self> {
        if desc.size > MAX_ALLOCATION {
            exhausted!("buffer of {} bytes exceeds the software device limit", desc.size);
        }
        Ok(Self { desc, bytes: Mutex::new(vec![0; desc.size as usize]), mapped: AtomicBool::new(false) })
    }

    pub(super) fn begin_map(&self) -> Result<Vec<u8>> {
        if self.mapped.swap(true, Ordering::AcqRel) {
            violation!("buffer is already mapped");
        }
        Ok(self.bytes.lock().clone())
    }

    /// End a mapping. Upload heaps take the host's bytes; read-back heaps
    /// keep what the device wrote.
    pub(super) fn end_map(&self, host: &[u8], write_back: bool) {
        if write_back {
            let mut bytes = self.bytes.lock();
            let len = bytes.len().min(host.len());
            bytes[..len].copy_from_slice(&host[..len]);
        }
        self.mapped.store(false, Ordering::Release);
    }

    pub(super) fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let bytes = self.bytes.lock();
        let range = byte_range(offset, size, bytes.len())?;
        Ok(bytes[range].to_vec())
    }

    pub(super) fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let range = byte_range(offset, data.len() as u64, bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct ImageMemory {
    pub desc: ImageDesc,
    pub subresources: Mutex<Vec<Vec<u8>>>,
}

impl ImageMemory {
    pub(super) fn new(desc: ImageDesc) -> Result<Self> {
        let mut total = 0u64;
        let mut subresources = Vec::with_capacity(desc.subresource_count() as usize);
        for sub in desc.subresources() {
            let (w, h) = desc.mip_extent(sub.mip);
            let size = desc.format.region_size(w, h);
            total += size;
            if total > MAX_ALLOCATION {
                exhausted!("image of {}x{} exceeds the software device limit", desc.width, desc.height);
            }
            subresources.push(vec![0; size as usize]);
        }
        Ok(Self { desc, subresources: Mutex::new(subresources) })
    }

    pub(super) fn read(&self, index: usize) -> Result<Vec<u8>> {
        match self.subresources.lock().get(index) {
            Some(data) => Ok(data.clone()),
            None => violation!("subresource {} does not exist", index),
        }
    }

    pub(super) fn write(&self, index: usize, data: &[u8]) -> Result<()> {
        let mut subresources = self.subresources.lock();
        let Some(target) = subresources.get_mut(index) else {
            violation!("subresource {} does not exist", index);
        };
        if target.len() != data.len() {
            violation!("subresource {} holds {} bytes, got {}", index, target.len(), data.len());
        }
        target.copy_from_slice(data);
        Ok(())
    }

    /// Repeat `texel` over the listed subresources. With an `area` only the
    /// texels of its top-left `width x height` corner change.
    pub(super) fn fill(&self, indices: &[usize], texel: &[u8], area: Option<(u32, u32)>) -> Result<()> {
        if texel.is_empty() {
            violation!("empty clear texel");
        }
        let mip_count = self.desc.mip_count.max(1) as usize;
        let mut subresources = self.subresources.lock();
        for &index in indices {
            let Some(target) = subresources.get_mut(index) else {
                violation!("subresource {} does not exist", index);
            };
            let (width, height) = self.desc.mip_extent((index % mip_count) as u32);
            let (columns, rows) = match area {
                Some((w, h)) => (w.min(width) as usize, h.min(height) as usize),
                None => (width as usize, height as usize),
            };
            let stride = width as usize * texel.len();
            for row in target.chunks_exact_mut(stride).take(rows) {
                for chunk in row.chunks_exact_mut(texel.len()).take(columns) {
                    chunk.copy_from_slice(texel);
                }
            }
        }
        Ok(())
    }
}

pub(super) fn byte_range(offset: u64, size: u64, len: usize) -> Result<std::ops::Range<usize>> {
    match offset.checked_add(size) {
        Some(end) if end <= len as u64 => Ok(offset as usize..end as usize),
        _ => violation!("range {}+{} outside {} bytes", offset, size, len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::resource::{BufferUsage, ImageUsage, MemoryPool};

    #[test]
    fn map_is_exclusive_and_writes_back_uploads() {
        let memory = BufferMemory::new(BufferDesc {
            size: 8,
            memory_pool: MemoryPool::HostWritable,
            usage: BufferUsage::TRANSFER_SRC,
        })
        .unwrap();
        let mut host = memory.begin_map().unwrap();
        assert!(memory.begin_map().is_err());
        host[..4].copy_from_slice(&[1, 2, 3, 4]);
        memory.end_map(&host, true);
        assert_eq!(memory.read(0, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(memory.read(6, 4).is_err());
    }

    #[test]
    fn image_subresources_are_sized_per_mip() {
        let image = ImageMemory::new(ImageDesc {
            format: Format::R8G8B8A8Unorm,
            width: 8,
            height: 4,
            mip_count: 3,
            layer_count: 2,
            usage: ImageUsage::SAMPLED,
            clear_value: None,
        })
        .unwrap();
        let sizes: Vec<_> = image.subresources.lock().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![128, 32, 8, 128, 32, 8]);
        image.fill(&[2], &[9, 8, 7, 6], None).unwrap();
        assert_eq!(image.read(2).unwrap(), vec![9, 8, 7, 6, 9, 8, 7, 6]);
    }

    #[test]
    fn area_fill_leaves_the_rest_untouched() {
        let image = ImageMemory::new(ImageDesc {
            format: Format::R8G8B8A8Unorm,
            width: 4,
            height: 2,
            mip_count: 1,
            layer_count: 1,
            usage: ImageUsage::RENDER_TARGET,
            clear_value: None,
        })
        .unwrap();
        image.fill(&[0], &[1, 1, 1, 1], Some((2, 1))).unwrap();
        let texels: Vec<u8> = image.read(0).unwrap().chunks_exact(4).map(|t| t[0]).collect();
        assert_eq!(texels, vec![1, 1, 0, 0, 0, 0, 0, 0]);
    }
}
