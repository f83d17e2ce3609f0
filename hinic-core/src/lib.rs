// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Control-plane channel of HiNIC-family PCIe NICs
//!
//! Two engines carry every configuration request to the card:
//!
//! - the command queue ([`cmdq`]), fixed-format WQEs rung through a doorbell
//!   and completed through a CEQ interrupt;
//! - the management channel ([`mgmt`]), segmented messages to the management
//!   CPU over the API command chain, answered through the AEQ.
//!
//! [`HwDev`] wires both to the event queues and exposes the request API.

pub mod cmdq;
pub mod completion;
pub mod config;
pub mod dma;
pub mod eqs;
pub mod error;
pub mod hwdev;
pub mod hwif;
pub mod mgmt;
#[cfg(feature = "sim")]
pub mod sim;
pub mod stats;
pub mod wq;

pub use cmdq::{CmdCompletion, CmdqType};
pub use config::HwConfig;
pub use error::{ApiChainError, DeviceStatus, Error, Result};
pub use hwdev::HwDev;
pub use hwif::Platform;
pub use stats::StatsReport;

/// Destination module of a command or message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Module {
    Comm = 0,
    L2nic = 1,
    Roce = 2,
    Iwarp = 3,
    Toe = 4,
    Flr = 5,
    Fcoe = 6,
    Cfgm = 7,
    Cqm = 8,
    Vswitch = 9,
    Fc = 10,
    Ovs = 11,
    Dsw = 12,
    Migrate = 13,
    Hilink = 14,
    Hot = 15,
}

impl Module {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Module::Comm,
            1 => Module::L2nic,
            2 => Module::Roce,
            3 => Module::Iwarp,
            4 => Module::Toe,
            5 => Module::Flr,
            6 => Module::Fcoe,
            7 => Module::Cfgm,
            8 => Module::Cqm,
            9 => Module::Vswitch,
            10 => Module::Fc,
            11 => Module::Ovs,
            12 => Module::Dsw,
            13 => Module::Migrate,
            14 => Module::Hilink,
            15 => Module::Hot,
            _ => return None,
        })
    }
}

/// Commands of [`Module::Comm`]
pub mod comm_cmd {
    pub const START_FLR: u8 = 0x01;
    /// Re-arm the completion event of a command queue
    pub const SET_ARM: u8 = 0x02;
    pub const CMDQ_CTXT_SET: u8 = 0x10;
    pub const CMDQ_CTXT_GET: u8 = 0x11;
    pub const HWCTXT_SET: u8 = 0x12;
    pub const FW_VERSION_GET: u8 = 0x22;
    pub const ACTIVATE_FW: u8 = 0x45;
    pub const FW_ACTIVATE_STATUS: u8 = 0x46;
    pub const GET_BOARD_INFO: u8 = 0x52;
    pub const SET_VF_RANDOM_ID: u8 = 0x61;
    pub const WATCHDOG_INFO: u8 = 0x56;
    pub const FAULT_REPORT: u8 = 0x5A;
}
