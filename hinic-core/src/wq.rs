// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Work queue ring
//!
//! Fixed-size slots (WQEBBs) laid out over DMA pages. Indices are free-running
//! counters; the slot index is the counter masked by `depth - 1`. The wrap
//! flag toggles every time the producer crosses the top of the ring and is
//! stamped into each WQE so the hardware can tell fresh entries from stale
//! ones.
//!
//! The ring is not internally locked; its owner serializes `acquire` and
//! `release` (the command queue does so under its ring lock).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::dma::{DmaAllocator, DmaBuffer};
use crate::error::{Error, Result};

/// Location of one WQEBB
#[derive(Debug, Clone)]
pub struct Slot {
    /// Masked ring index
    pub index: u16,
    /// Wrap flag in effect when the slot was produced
    pub wrapped: bool,
    pub page: DmaBuffer,
    pub offset: usize,
}

impl Slot {
    pub fn bus_addr(&self) -> u64 {
        self.page.bus_addr() + self.offset as u64
    }
}

/// Ring of WQEBBs
pub struct RingBuffer {
    pages: Vec<DmaBuffer>,
    /// Big-endian table of page bus addresses
    block: DmaBuffer,
    depth: u32,
    wqebb_size: usize,
    wqebbs_per_page: usize,
    reserve: u32,
    prod_idx: u32,
    cons_idx: u32,
    wrapped: bool,
    free: AtomicU32,
}

impl RingBuffer {
    pub fn new(
        dma: &dyn DmaAllocator,
        depth: u16,
        wqebb_size: usize,
        page_size: usize,
        reserve: u16,
    ) -> Result<Self> {
        if depth == 0
            || !depth.is_power_of_two()
            || !wqebb_size.is_power_of_two()
            || page_size < wqebb_size
            || page_size % wqebb_size != 0
            || reserve >= depth
        {
            return Err(Error::InvalidParameter);
        }

        let wqebbs_per_page = page_size / wqebb_size;
        let num_pages = (depth as usize + wqebbs_per_page - 1) / wqebbs_per_page;

        let mut pages = Vec::with_capacity(num_pages);
        for _ in 0..num_pages {
            pages.push(dma.alloc_coherent(page_size)?);
        }

        let block = dma.alloc_coherent(num_pages * 8)?;
        for (i, page) in pages.iter().enumerate() {
            block.write_be64(i * 8, page.bus_addr());
        }

        Ok(Self {
            pages,
            block,
            depth: depth as u32,
            wqebb_size,
            wqebbs_per_page,
            reserve: reserve as u32,
            prod_idx: 0,
            cons_idx: 0,
            wrapped: true,
            free: AtomicU32::new(depth as u32),
        })
    }

    fn mask(&self) -> u32 {
        self.depth - 1
    }

    /// Claim `n` contiguous slots.
    ///
    /// Fails with `QueueFull` unless `n` slots remain after honouring the
    /// reserve, and with `WouldWrap` if the run would cross the top of the
    /// ring.
    pub fn acquire(&mut self, n: u16) -> Result<Slot> {
        self.acquire_inner(n, self.reserve)
    }

    /// Claim one slot, allowed to dip into the reserve
    pub fn acquire_reserved(&mut self) -> Result<Slot> {
        self.acquire_inner(1, 0)
    }

    fn acquire_inner(&mut self, n: u16, reserve: u32) -> Result<Slot> {
        let n = n as u32;
        if n == 0 || n > self.depth {
            return Err(Error::InvalidParameter);
        }
        if self.free.load(Ordering::Acquire) < n + reserve {
            return Err(Error::QueueFull);
        }

        let start = self.prod_idx & self.mask();
        if start + n > self.depth {
            return Err(Error::WouldWrap);
        }

        let slot = self.slot(start as u16, self.wrapped);
        self.prod_idx = self.prod_idx.wrapping_add(n);
        self.free.fetch_sub(n, Ordering::AcqRel);
        if start + n == self.depth {
            self.wrapped = !self.wrapped;
        }
        Ok(slot)
    }

    /// Return the `n` oldest slots
    pub fn release(&mut self, n: u16) -> Result<()> {
        let n = n as u32;
        if n > self.in_use() {
            log::error!(
                "hinic: wq release of {} with only {} in use",
                n,
                self.in_use()
            );
            return Err(Error::InvalidParameter);
        }
        self.cons_idx = self.cons_idx.wrapping_add(n);
        self.free.fetch_add(n, Ordering::AcqRel);
        Ok(())
    }

    /// View of slot `index`, wrap flag as currently produced
    pub fn peek(&self, index: u16) -> Slot {
        self.slot(index, self.wrapped)
    }

    fn slot(&self, index: u16, wrapped: bool) -> Slot {
        let index = (index as u32 & self.mask()) as usize;
        let page = &self.pages[index / self.wqebbs_per_page];
        Slot {
            index: index as u16,
            wrapped,
            page: page.clone(),
            offset: (index % self.wqebbs_per_page) * self.wqebb_size,
        }
    }

    pub fn depth(&self) -> u16 {
        self.depth as u16
    }

    pub fn wqebb_size(&self) -> usize {
        self.wqebb_size
    }

    pub fn wrapped(&self) -> bool {
        self.wrapped
    }

    /// Masked index of the next slot to produce
    pub fn producer_index(&self) -> u16 {
        (self.prod_idx & self.mask()) as u16
    }

    /// Masked index of the oldest unreleased slot
    pub fn consumer_index(&self) -> u16 {
        (self.cons_idx & self.mask()) as u16
    }

    pub fn free_slots(&self) -> u16 {
        self.free.load(Ordering::Acquire) as u16
    }

    pub fn in_use(&self) -> u32 {
        self.prod_idx.wrapping_sub(self.cons_idx)
    }

    /// Bus addresses of the backing pages
    pub fn page_table(&self) -> Vec<u64> {
        self.pages.iter().map(DmaBuffer::bus_addr).collect()
    }

    /// Bus address of the page address block handed to the hardware
    pub fn block_addr(&self) -> u64 {
        self.block.bus_addr()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::dma::HostDma;

    fn ring(depth: u16, reserve: u16) -> RingBuffer {
        RingBuffer::new(&HostDma::new(), depth, 64, 4096, reserve).unwrap()
    }

    #[test]
    fn test_slots_never_alias() {
        let mut wq = RingBuffer::new(&HostDma::new(), 256, 64, 4096, 0).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let slot = wq.acquire(1).unwrap();
            assert!(seen.insert(slot.bus_addr()));
        }
        assert_eq!(wq.page_table().len(), 4);
        assert_eq!(wq.acquire(1).unwrap_err(), Error::QueueFull);
    }

    #[test]
    fn test_busy_with_one_free_and_reserve_one() {
        let mut wq = ring(8, 1);
        for _ in 0..7 {
            wq.acquire(1).unwrap();
        }
        assert_eq!(wq.free_slots(), 1);
        assert_eq!(wq.acquire(1).unwrap_err(), Error::QueueFull);
        assert_eq!(wq.producer_index(), 7);

        let slot = wq.acquire_reserved().unwrap();
        assert_eq!(slot.index, 7);
        assert_eq!(wq.free_slots(), 0);
    }

    #[test]
    fn test_free_count_invariant() {
        let mut wq = ring(16, 0);
        for _ in 0..5 {
            wq.acquire(1).unwrap();
        }
        wq.release(3).unwrap();
        assert_eq!(wq.free_slots() as u32, 16 - wq.in_use());
        assert_eq!(wq.consumer_index(), 3);
        assert_eq!(wq.release(3).unwrap_err(), Error::InvalidParameter);
    }

    #[test]
    fn test_wrap_flag_toggles_on_top_crossing() {
        let mut wq = ring(4, 0);
        assert!(wq.wrapped());
        for _ in 0..4 {
            let slot = wq.acquire(1).unwrap();
            assert!(slot.wrapped);
            wq.release(1).unwrap();
        }
        assert!(!wq.wrapped());
        let slot = wq.acquire(1).unwrap();
        assert_eq!(slot.index, 0);
        assert!(!slot.wrapped);
    }

    #[test]
    fn test_run_crossing_top_is_rejected() {
        let mut wq = ring(8, 0);
        for _ in 0..6 {
            wq.acquire(1).unwrap();
        }
        wq.release(6).unwrap();
        assert_eq!(wq.acquire(3).unwrap_err(), Error::WouldWrap);
        assert_eq!(wq.producer_index(), 6);

        let slot = wq.acquire(2).unwrap();
        assert_eq!(slot.index, 6);
        assert_eq!(wq.producer_index(), 0);
        assert!(!wq.wrapped());
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let dma = HostDma::new();
        assert!(RingBuffer::new(&dma, 100, 64, 4096, 0).is_err());
        assert!(RingBuffer::new(&dma, 8, 64, 4096, 8).is_err());
    }
}
