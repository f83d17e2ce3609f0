// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Static message policies

use crate::Module;
use crate::comm_cmd;

/// Requests from the management CPU that are acknowledged before the handler
/// runs; the handler's output is then discarded.
const ACK_FIRST: &[(Module, u8)] = &[
    (Module::Comm, comm_cmd::START_FLR),
    (Module::Comm, comm_cmd::SET_VF_RANDOM_ID),
    (Module::Comm, comm_cmd::WATCHDOG_INFO),
    (Module::Comm, comm_cmd::FAULT_REPORT),
];

/// Messages still allowed while firmware activation keeps the channel busy
const BUSY_ALLOWED: &[(Module, u8)] = &[
    (Module::Comm, comm_cmd::FW_ACTIVATE_STATUS),
    (Module::Comm, comm_cmd::FW_VERSION_GET),
    (Module::Comm, comm_cmd::GET_BOARD_INFO),
];

pub fn ack_first(module: Module, cmd: u8) -> bool {
    ACK_FIRST.contains(&(module, cmd))
}

pub fn allowed_while_busy(module: Module, cmd: u8) -> bool {
    BUSY_ALLOWED.contains(&(module, cmd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables() {
        assert!(ack_first(Module::Comm, comm_cmd::START_FLR));
        assert!(!ack_first(Module::L2nic, comm_cmd::START_FLR));
        assert!(allowed_while_busy(Module::Comm, comm_cmd::FW_ACTIVATE_STATUS));
        assert!(!allowed_while_busy(Module::Comm, comm_cmd::CMDQ_CTXT_SET));
    }
}
