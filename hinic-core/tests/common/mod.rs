// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hinic::sim::SimCard;
use hinic::{HwConfig, HwDev};

/// Upper bound for anything the simulated card does asynchronously
pub const WAIT: Duration = Duration::from_secs(2);
/// Timeout for requests that are expected to time out
pub const SHORT: Duration = Duration::from_millis(50);

pub fn test_config() -> HwConfig {
    HwConfig {
        cmdq_depth: 64,
        cmdq_timeout_ms: 2000,
        mgmt_timeout_ms: 2000,
        aeq_len: 64,
        ceq_len: 64,
        ..HwConfig::default()
    }
}

pub fn bring_up() -> (Arc<SimCard>, HwDev) {
    bring_up_with(test_config())
}

pub fn bring_up_with(config: HwConfig) -> (Arc<SimCard>, HwDev) {
    let card = SimCard::new();
    let dev = HwDev::init(card.platform(), config).expect("bring-up failed");
    (card, dev)
}
