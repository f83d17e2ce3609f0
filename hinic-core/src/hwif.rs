// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware interface
//!
//! The environment the channel runs in is reached through four seams bundled
//! in a [`Platform`]: CSR space, doorbell space, interrupt registration and
//! DMA allocation. [`Hwif`] layers function attributes and presence tracking
//! on top of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::dma::DmaAllocator;
use crate::error::{Error, Result};

/// Value read back from CSR space when the link is down
pub const LINK_DOWN: u32 = 0xFFFF_FFFF;

/// Size of one doorbell page
pub const DB_PAGE_SIZE: usize = 4096;

/// Longest a blocked caller sleeps before checking that the device answers
pub const PRESENCE_POLL: Duration = Duration::from_millis(20);

/// CSR space of one PCIe function
pub trait RegisterSpace: Send + Sync {
    fn read32(&self, addr: u32) -> u32;
    fn write32(&self, addr: u32, value: u32);
}

/// Doorbell BAR
pub trait DoorbellSpace: Send + Sync {
    fn write32(&self, offset: usize, value: u32);
}

/// Interrupt handler, called from interrupt context
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// MSI-X vector registration
pub trait InterruptController: Send + Sync {
    fn request_irq(&self, vector: u16, name: &str, handler: IrqHandler) -> Result<()>;
    fn free_irq(&self, vector: u16);
}

/// Everything the channel needs from its environment
#[derive(Clone)]
pub struct Platform {
    pub regs: Arc<dyn RegisterSpace>,
    pub doorbells: Arc<dyn DoorbellSpace>,
    pub irq: Arc<dyn InterruptController>,
    pub dma: Arc<dyn DmaAllocator>,
}

/// CSR map
pub mod csr {
    /// Function attributes: FUNC_IDX[0..10] PCI_INTF[11..14]
    pub const FUNC_ATTR0: u32 = 0x0000;

    pub const ATTR0_FUNC_IDX_MASK: u32 = 0x3FF;
    pub const ATTR0_PCI_INTF_SHIFT: u32 = 11;
    pub const ATTR0_PCI_INTF_MASK: u32 = 0x7;

    const AEQ_BASE: u32 = 0x0E00;
    const CEQ_BASE: u32 = 0x1000;
    const EQ_STRIDE: u32 = 0x80;

    /// Per-queue EQ registers, relative to the queue's block
    pub const EQ_CTRL0: u32 = 0x00;
    pub const EQ_CTRL1: u32 = 0x04;
    pub const EQ_CONS_IDX: u32 = 0x08;
    pub const EQ_PAGE_HI: u32 = 0x10;
    pub const EQ_PAGE_LO: u32 = 0x14;

    /// CTRL0: MSI-X vector[0..10] ENABLE[31]
    pub const EQ_CTRL0_ENABLE: u32 = 1 << 31;
    /// CTRL1: LEN[0..21] ELEM_SIZE[24..26]
    pub const EQ_CTRL1_ELEM_SIZE_SHIFT: u32 = 24;
    pub const EQ_CTRL1_ELEM_SIZE_MASK: u32 = 0x3;
    /// CONS_IDX: CI[0..21] INT_ARMED[31]
    pub const EQ_CI_MASK: u32 = 0x1F_FFFF;
    pub const EQ_CI_ARMED: u32 = 1 << 31;

    pub const fn aeq(id: u16) -> u32 {
        AEQ_BASE + id as u32 * EQ_STRIDE
    }

    pub const fn ceq(id: u16) -> u32 {
        CEQ_BASE + id as u32 * EQ_STRIDE
    }

    /// API command chain to the management CPU
    pub const API_CHAIN_BASE: u32 = 0x2000;
    pub const API_CHAIN_STATUS_HI: u32 = API_CHAIN_BASE;
    pub const API_CHAIN_STATUS_LO: u32 = API_CHAIN_BASE + 0x04;
    pub const API_CHAIN_CELL_HI: u32 = API_CHAIN_BASE + 0x08;
    pub const API_CHAIN_CELL_LO: u32 = API_CHAIN_BASE + 0x0C;
    /// CELLS[0..16] CELL_SIZE[16..32]
    pub const API_CHAIN_GEOMETRY: u32 = API_CHAIN_BASE + 0x10;
    pub const API_CHAIN_PI: u32 = API_CHAIN_BASE + 0x14;
    /// ENABLE[0]
    pub const API_CHAIN_CTRL: u32 = API_CHAIN_BASE + 0x18;
}

bitflags! {
    /// Device and channel state
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        const PRESENT    = 1 << 0;
        const CMDQ_READY = 1 << 1;
        const MGMT_READY = 1 << 2;
        /// Firmware activation in progress
        const MGMT_BUSY  = 1 << 3;
    }
}

/// Run once when the device is found to be gone
pub type RemovalHook = Box<dyn Fn() + Send + Sync>;

/// Function-level view of the hardware
pub struct Hwif {
    platform: Platform,
    func_idx: u16,
    pci_intf: u8,
    state: AtomicU32,
    removal_hooks: Mutex<Vec<RemovalHook>>,
}

impl Hwif {
    /// Read the function attributes. Fails if the device does not answer.
    pub fn new(platform: Platform) -> Result<Self> {
        let attr0 = platform.regs.read32(csr::FUNC_ATTR0);
        if attr0 == LINK_DOWN {
            log::error!("hinic: function attributes read all ones, device absent");
            return Err(Error::DeviceAbsent);
        }

        let func_idx = (attr0 & csr::ATTR0_FUNC_IDX_MASK) as u16;
        let pci_intf = ((attr0 >> csr::ATTR0_PCI_INTF_SHIFT) & csr::ATTR0_PCI_INTF_MASK) as u8;
        log::debug!("hinic: func_idx {} pci_intf {}", func_idx, pci_intf);

        Ok(Self {
            platform,
            func_idx,
            pci_intf,
            state: AtomicU32::new(StateFlags::PRESENT.bits()),
            removal_hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn func_idx(&self) -> u16 {
        self.func_idx
    }

    pub fn pci_intf(&self) -> u8 {
        self.pci_intf
    }

    pub fn state(&self) -> StateFlags {
        StateFlags::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, flags: StateFlags) {
        self.state.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_state(&self, flags: StateFlags) {
        self.state.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn is_present(&self) -> bool {
        self.state().contains(StateFlags::PRESENT)
    }

    /// Register work to run when the device disappears
    pub fn on_removal(&self, hook: RemovalHook) {
        self.removal_hooks.lock().push(hook);
    }

    /// Mark the device gone and run the removal hooks. Only the first call
    /// does anything; returns whether this was it.
    pub fn mark_absent(&self) -> bool {
        let prev = self.state.fetch_and(!StateFlags::PRESENT.bits(), Ordering::AcqRel);
        if prev & StateFlags::PRESENT.bits() == 0 {
            return false;
        }
        for hook in self.removal_hooks.lock().iter() {
            hook();
        }
        true
    }

    /// Read a CSR. An all-ones value means the link is gone and marks the
    /// device absent.
    pub fn read_reg(&self, addr: u32) -> Result<u32> {
        if !self.is_present() {
            return Err(Error::DeviceAbsent);
        }
        let value = self.platform.regs.read32(addr);
        if value == LINK_DOWN {
            log::error!("hinic: csr {:#x} read all ones, marking device absent", addr);
            self.mark_absent();
            return Err(Error::DeviceAbsent);
        }
        Ok(value)
    }

    /// Whether the function still answers on the bus
    pub fn check_present(&self) -> bool {
        self.read_reg(csr::FUNC_ATTR0).is_ok()
    }

    pub fn write_reg(&self, addr: u32, value: u32) {
        if self.is_present() {
            self.platform.regs.write32(addr, value);
        }
    }

    /// Write a doorbell. Dropped once the device is gone.
    pub fn ring_doorbell(&self, offset: usize, value: u32) -> Result<()> {
        if !self.is_present() {
            return Err(Error::DeviceAbsent);
        }
        self.platform.doorbells.write32(offset, value);
        Ok(())
    }
}
