// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! DMA-coherent memory shared with the card
//!
//! A [`DmaBuffer`] is a refcounted block of 32-bit words that both the host
//! and the device may access concurrently. Word accessors are atomic; the
//! big-endian helpers interpret each word in device byte order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Allocation granularity of [`HostDma`]
pub const DMA_ALIGN: u64 = 4096;

struct DmaInner {
    words: Box<[AtomicU32]>,
    bus_addr: u64,
    len: usize,
}

/// DMA-coherent buffer
#[derive(Clone)]
pub struct DmaBuffer {
    inner: Arc<DmaInner>,
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("bus_addr", &format_args!("{:#x}", self.inner.bus_addr))
            .field("len", &self.inner.len)
            .finish()
    }
}

impl DmaBuffer {
    /// Zeroed buffer at the given bus address. `len` is rounded up to a word.
    pub fn new(bus_addr: u64, len: usize) -> Self {
        let words = (len + 3) / 4;
        Self {
            inner: Arc::new(DmaInner {
                words: (0..words).map(|_| AtomicU32::new(0)).collect(),
                bus_addr,
                len: words * 4,
            }),
        }
    }

    pub fn bus_addr(&self) -> u64 {
        self.inner.bus_addr
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Whether both handles refer to the same memory
    pub fn same_as(&self, other: &DmaBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        debug_assert_eq!(offset % 4, 0, "unaligned dma word access");
        &self.inner.words[offset / 4]
    }

    /// Read a 32-bit word stored in device (big-endian) byte order
    pub fn read_be32(&self, offset: usize) -> u32 {
        u32::from_be_bytes(self.word(offset).load(Ordering::Acquire).to_ne_bytes())
    }

    /// Write a 32-bit word in device (big-endian) byte order
    pub fn write_be32(&self, offset: usize, value: u32) {
        self.word(offset)
            .store(u32::from_ne_bytes(value.to_be_bytes()), Ordering::Release);
    }

    /// High word first
    pub fn read_be64(&self, offset: usize) -> u64 {
        ((self.read_be32(offset) as u64) << 32) | self.read_be32(offset + 4) as u64
    }

    pub fn write_be64(&self, offset: usize, value: u64) {
        self.write_be32(offset, (value >> 32) as u32);
        self.write_be32(offset + 4, value as u32);
    }

    /// Copy out `dst.len()` bytes starting at `offset`
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        for (i, byte) in dst.iter_mut().enumerate() {
            let pos = offset + i;
            let word = self.inner.words[pos / 4].load(Ordering::Acquire).to_ne_bytes();
            *byte = word[pos % 4];
        }
    }

    /// Copy `src` into the buffer starting at `offset`
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        let mut pos = offset;
        let end = offset + src.len();
        while pos < end {
            let idx = pos / 4;
            let word = &self.inner.words[idx];
            let mut bytes = word.load(Ordering::Relaxed).to_ne_bytes();
            let first = pos % 4;
            let n = (4 - first).min(end - pos);
            bytes[first..first + n].copy_from_slice(&src[pos - offset..pos - offset + n]);
            word.store(u32::from_ne_bytes(bytes), Ordering::Release);
            pos += n;
        }
    }
}

/// Source of DMA-coherent memory
pub trait DmaAllocator: Send + Sync {
    /// Allocate a zeroed buffer of at least `len` bytes
    fn alloc_coherent(&self, len: usize) -> Result<DmaBuffer>;
}

/// Host-memory allocator with a bus address registry.
///
/// Bus addresses are synthetic and page aligned. [`HostDma::resolve`] lets a
/// software device model translate a bus address written into a descriptor
/// back to the buffer it names, the way an IOMMU would.
pub struct HostDma {
    next_addr: AtomicU64,
    limit: usize,
    registry: Mutex<BTreeMap<u64, Weak<DmaInner>>>,
}

impl HostDma {
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Allocator that refuses single allocations above `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            next_addr: AtomicU64::new(0x1_0000_0000),
            limit,
            registry: Mutex::new(BTreeMap::new()),
        }
    }

    /// Find the live buffer containing `addr`, with the offset inside it
    pub fn resolve(&self, addr: u64) -> Option<(DmaBuffer, usize)> {
        let registry = self.registry.lock();
        let (&base, weak) = registry.range(..=addr).next_back()?;
        let inner = weak.upgrade()?;
        let offset = (addr - base) as usize;
        if offset >= inner.len {
            return None;
        }
        Some((DmaBuffer { inner }, offset))
    }

    /// Number of live allocations
    pub fn live(&self) -> usize {
        self.registry
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl Default for HostDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for HostDma {
    fn alloc_coherent(&self, len: usize) -> Result<DmaBuffer> {
        if len == 0 || len > self.limit {
            return Err(Error::NoMemory);
        }
        let span = (len as u64 + DMA_ALIGN - 1) & !(DMA_ALIGN - 1);
        let bus_addr = self.next_addr.fetch_add(span, Ordering::Relaxed);
        let buf = DmaBuffer::new(bus_addr, len);

        let mut registry = self.registry.lock();
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.insert(bus_addr, Arc::downgrade(&buf.inner));
        Ok(buf)
    }
}
