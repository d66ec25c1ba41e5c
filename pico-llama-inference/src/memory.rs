#[cfg(test)]
#[path = "../tests/unit/memory_test.rs"]
mod memory_test;

use crate::error::{InferenceError, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::info;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::time::Instant;

// Weight views are reinterpreted in place, so the host must share the blob's byte order.
#[cfg(target_endian = "big")]
compile_error!("pico-llama reads little-endian blobs in place and requires a little-endian target");

/// Size of the external RAM window the model is copied into.
pub const PSRAM_WINDOW_SIZE: usize = 16 << 20;

/// Read-only memory mapping of a blob on disk (the flash-resident image on the device).
#[derive(Debug)]
pub struct MappedBlob {
    mmap: Mmap,
}

impl MappedBlob {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };
        Ok(Self { mmap })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }
}

/// Fixed-capacity linear region standing in for the external QSPI RAM.
///
/// Allocated once at its full capacity. The model blob is copied in exactly once by
/// [`ExternalMemory::load`]; afterwards the region is only read through borrowed views,
/// which cannot outlive it. Storage is word-backed so `f32` views are always aligned.
pub struct ExternalMemory {
    words: Box<[u32]>,
    loaded: usize,
}

impl ExternalMemory {
    pub fn new(capacity: usize) -> Self {
        let words = capacity.div_ceil(size_of::<u32>());
        Self { words: vec![0u32; words].into_boxed_slice(), loaded: 0 }
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.words.len() * size_of::<u32>()
    }

    /// Number of bytes copied in by the last load (zero before any load).
    pub fn loaded_len(&self) -> usize {
        self.loaded
    }

    /// Copies `blob` to the start of the region and returns its size.
    pub fn load(&mut self, blob: &[u8]) -> Result<usize> {
        let capacity = self.capacity();
        if blob.len() > capacity {
            return Err(InferenceError::RegionTooSmall { needed: blob.len(), capacity });
        }

        let started = Instant::now();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.words[..]);
        bytes[..blob.len()].copy_from_slice(blob);
        self.loaded = blob.len();

        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            info!(
                "Copied {} bytes into external memory in {:.2} ms ({:.1} MB/s)",
                blob.len(),
                elapsed * 1e3,
                blob.len() as f64 / elapsed / 1e6
            );
        }

        Ok(self.loaded)
    }

    /// The loaded bytes.
    pub fn bytes(&self) -> &[u8] {
        let bytes: &[u8] = bytemuck::cast_slice(&self.words[..]);
        &bytes[..self.loaded]
    }

    /// The loaded bytes as whole little-endian `f32` words; a trailing partial word is dropped.
    pub fn floats(&self) -> &[f32] {
        let floats: &[f32] = bytemuck::cast_slice(&self.words[..]);
        &floats[..self.loaded / size_of::<f32>()]
    }
}

impl std::fmt::Debug for ExternalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalMemory")
            .field("capacity", &self.capacity())
            .field("loaded", &self.loaded)
            .finish()
    }
}

/// Forward-only reader over a little-endian byte blob.
///
/// Every read is bounds-checked and reports what it was reading when the blob runs out.
#[derive(Debug)]
pub(crate) struct BlobCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BlobCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn get_bytes(&mut self, count: usize, what: impl FnOnce() -> String) -> Result<&'a [u8]> {
        if count > self.remaining() {
            return Err(InferenceError::Truncated { what: what(), needed: count, available: self.remaining() });
        }

        let result = &self.data[self.offset..self.offset + count];
        self.offset += count;
        Ok(result)
    }

    pub fn read_i32(&mut self, what: impl FnOnce() -> String) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.get_bytes(size_of::<i32>(), what)?))
    }

    pub fn read_f32(&mut self, what: impl FnOnce() -> String) -> Result<f32> {
        Ok(LittleEndian::read_f32(self.get_bytes(size_of::<f32>(), what)?))
    }
}
