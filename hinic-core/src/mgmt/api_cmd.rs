// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! API command chain
//!
//! Ring of 32-byte cells, each pointing at its own 2 KiB data buffer, through
//! which the host writes to the management CPU. The hardware reports progress
//! in a write-back status block; a send is complete once the consumer index
//! there catches up with the producer index.
//!
//! Cell (big-endian u64 words):
//!
//! ```text
//! 0x00 ctrl   DATA_SZ[0..11] RD_DMA_ATTR[16..22] WR_DMA_ATTR[24..30] XOR_CHKSUM[56..64]
//! 0x08 desc   API_TYPE[0] RD_WR[1] MGMT_BYPASS[2] DEST[32..37] SIZE[40..51] XOR_CHKSUM[56..64]
//! 0x10 data bus address
//! 0x18 reserved
//! ```

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::dma::DmaBuffer;
use crate::error::{ApiChainError, Error, Result};
use crate::hwif::{Hwif, csr};

pub const CELL_SIZE: usize = 32;
pub const CELL_DATA_SIZE: usize = 2048;
/// Write-back status block: header u32, status u32, echoed desc u64
pub const WB_STATUS_LEN: usize = 16;

/// Node id of the management CPU
pub const DEST_MGMT_CPU: u8 = 0x1F;

/// Write-back header: VALID[0..8] CHAIN_ID[16..24]
pub const WB_VALID: u32 = 0xFF;
/// Write-back status: CONS_IDX[0..24] CHKSUM_ERR[28..30]
pub const WB_CONS_IDX_MASK: u32 = 0xFF_FFFF;
pub const WB_CHKSUM_ERR_SHIFT: u32 = 28;
pub const WB_CHKSUM_ERR_MASK: u32 = 0x3;

const CHKSUM_SHIFT: u32 = 56;
const POLL_INTERVAL: Duration = Duration::from_micros(10);

/// XOR of the low seven bytes
pub fn xor_chksum(value: u64) -> u8 {
    (0..7).fold(0u8, |sum, i| sum ^ (value >> (8 * i)) as u8)
}

/// Decoded cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiCell {
    pub data_size: u16,
    pub dest: u8,
    pub data_addr: u64,
    pub ctrl_chksum_ok: bool,
    pub desc_chksum_ok: bool,
}

impl ApiCell {
    pub fn ctrl_word(data_size: u16) -> u64 {
        let ctrl = (data_size as u64 & 0x7FF) | (1 << 16) | (1 << 24);
        ctrl | (xor_chksum(ctrl) as u64) << CHKSUM_SHIFT
    }

    pub fn desc_word(dest: u8, size: u16) -> u64 {
        // write, no bypass
        let desc = ((dest as u64 & 0x1F) << 32) | ((size as u64 & 0x7FF) << 40);
        desc | (xor_chksum(desc) as u64) << CHKSUM_SHIFT
    }

    /// Read a cell back from chain memory
    pub fn read(cells: &DmaBuffer, index: usize) -> Self {
        let base = index * CELL_SIZE;
        let ctrl = cells.read_be64(base);
        let desc = cells.read_be64(base + 8);
        Self {
            data_size: (ctrl & 0x7FF) as u16,
            dest: ((desc >> 32) & 0x1F) as u8,
            data_addr: cells.read_be64(base + 16),
            ctrl_chksum_ok: xor_chksum(ctrl) == (ctrl >> CHKSUM_SHIFT) as u8,
            desc_chksum_ok: xor_chksum(desc) == (desc >> CHKSUM_SHIFT) as u8,
        }
    }
}

struct ChainState {
    prod_idx: u32,
}

/// Command-write chain to the management CPU
pub struct ApiCmdChain {
    hwif: Arc<Hwif>,
    cells: DmaBuffer,
    data: Vec<DmaBuffer>,
    wb_status: DmaBuffer,
    num_cells: u32,
    timeout: Duration,
    state: Mutex<ChainState>,
}

impl ApiCmdChain {
    /// Allocate the chain and program it into the card
    pub fn new(hwif: Arc<Hwif>, num_cells: u32, timeout: Duration) -> Result<Self> {
        if num_cells == 0 || !num_cells.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }
        let dma = &hwif.platform().dma;
        let cells = dma.alloc_coherent(num_cells as usize * CELL_SIZE)?;
        let wb_status = dma.alloc_coherent(WB_STATUS_LEN)?;
        let mut data = Vec::with_capacity(num_cells as usize);
        for i in 0..num_cells as usize {
            let buf = dma.alloc_coherent(CELL_DATA_SIZE)?;
            cells.write_be64(i * CELL_SIZE + 16, buf.bus_addr());
            data.push(buf);
        }

        let split = |addr: u64| ((addr >> 32) as u32, addr as u32);
        let (hi, lo) = split(wb_status.bus_addr());
        hwif.write_reg(csr::API_CHAIN_STATUS_HI, hi);
        hwif.write_reg(csr::API_CHAIN_STATUS_LO, lo);
        let (hi, lo) = split(cells.bus_addr());
        hwif.write_reg(csr::API_CHAIN_CELL_HI, hi);
        hwif.write_reg(csr::API_CHAIN_CELL_LO, lo);
        hwif.write_reg(
            csr::API_CHAIN_GEOMETRY,
            num_cells | (CELL_SIZE as u32) << 16,
        );
        hwif.write_reg(csr::API_CHAIN_PI, 0);
        hwif.write_reg(csr::API_CHAIN_CTRL, 1);
        log::debug!("hinic: api chain with {} cells at {:#x}", num_cells, cells.bus_addr());

        Ok(Self {
            hwif,
            cells,
            data,
            wb_status,
            num_cells,
            timeout,
            state: Mutex::new(ChainState { prod_idx: 0 }),
        })
    }

    fn mask(&self) -> u32 {
        self.num_cells - 1
    }

    /// Consumer index from the write-back block. An all-ones block means
    /// the device is gone.
    fn read_wb(&self) -> Result<u32> {
        let header = self.wb_status.read_be32(0);
        let status = self.wb_status.read_be32(4);
        if header == u32::MAX && status == u32::MAX {
            log::error!("hinic: api chain write-back reads all ones");
            self.hwif.mark_absent();
            return Err(Error::DeviceAbsent);
        }
        if (status >> WB_CHKSUM_ERR_SHIFT) & WB_CHKSUM_ERR_MASK != 0 {
            return Err(ApiChainError::Checksum.into());
        }
        Ok(status & WB_CONS_IDX_MASK)
    }

    /// Write `data` to node `dest` and wait for the hardware to consume it
    pub fn write(&self, dest: u8, data: &[u8]) -> Result<()> {
        if data.len() > CELL_DATA_SIZE {
            return Err(Error::MessageTooLarge);
        }
        if !self.hwif.is_present() {
            return Err(Error::DeviceAbsent);
        }

        let mut state = self.state.lock();
        let ci = self.read_wb()?;
        let pi = state.prod_idx & self.mask();
        if (pi + 1) & self.mask() == ci && self.num_cells > 1 {
            return Err(ApiChainError::Full.into());
        }

        let index = pi as usize;
        self.data[index].write_bytes(0, data);
        let base = index * CELL_SIZE;
        let size = data.len() as u16;
        self.cells.write_be64(base + 8, ApiCell::desc_word(dest, size));
        self.cells.write_be64(base, ApiCell::ctrl_word(size));

        state.prod_idx = state.prod_idx.wrapping_add(1);
        let next = state.prod_idx & self.mask();
        self.hwif.write_reg(csr::API_CHAIN_PI, next);

        let start = Instant::now();
        loop {
            if !self.hwif.is_present() {
                return Err(Error::DeviceAbsent);
            }
            if self.read_wb()? == next {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                if !self.hwif.check_present() {
                    return Err(Error::DeviceAbsent);
                }
                log::error!(
                    "hinic: api chain stuck, pi {} ci {:?}",
                    next,
                    self.read_wb()
                );
                return Err(ApiChainError::Timeout.into());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
