// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware channel configuration
//!
//! Defaults match the card firmware's expectations. Values can be loaded from
//! a TOML file and overridden by `HINIC_*` environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Maximum number of cells in the API command chain
pub const MAX_API_CHAIN_CELLS: u32 = 64;

/// Channel configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HwConfig {
    /// Command queue depth in WQEBBs (power of two)
    pub cmdq_depth: u16,
    /// Slots kept free for the SET_ARM command
    pub cmdq_reserve: u16,
    /// Default sync command timeout in milliseconds
    pub cmdq_timeout_ms: u64,
    /// Default sync management message timeout in milliseconds
    pub mgmt_timeout_ms: u64,
    /// Cells in the API command chain
    pub api_chain_cells: u32,
    /// API chain completion poll timeout in milliseconds
    pub api_chain_timeout_ms: u64,
    /// Elements per AEQ
    pub aeq_len: u32,
    /// Elements per CEQ
    pub ceq_len: u32,
    /// MSI-X vector of the AEQ
    pub aeq_vector: u16,
    /// MSI-X vector of the CEQ
    pub ceq_vector: u16,
    /// DMA page size for queue memory
    pub page_size: u32,
}

impl Default for HwConfig {
    fn default() -> Self {
        Self {
            cmdq_depth: 4096,
            cmdq_reserve: 1,
            cmdq_timeout_ms: 5000,
            mgmt_timeout_ms: 5000,
            api_chain_cells: 32,
            api_chain_timeout_ms: 1000,
            aeq_len: 1024,
            ceq_len: 1024,
            aeq_vector: 0,
            ceq_vector: 1,
            page_size: 4096,
        }
    }
}

impl HwConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: HwConfig = toml::from_str(text).map_err(|err| {
            log::error!("hinic: bad config: {}", err);
            Error::InvalidParameter
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `HINIC_*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = HwConfig::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `HINIC_*` environment overrides. Unparsable values are ignored.
    pub fn apply_env(&mut self) {
        fn var<T: std::str::FromStr>(name: &str, field: &mut T) {
            if let Ok(val) = std::env::var(name) {
                match val.parse() {
                    Ok(n) => *field = n,
                    Err(_) => log::warn!("hinic: ignoring {}={:?}", name, val),
                }
            }
        }

        var("HINIC_CMDQ_DEPTH", &mut self.cmdq_depth);
        var("HINIC_CMDQ_RESERVE", &mut self.cmdq_reserve);
        var("HINIC_CMDQ_TIMEOUT_MS", &mut self.cmdq_timeout_ms);
        var("HINIC_MGMT_TIMEOUT_MS", &mut self.mgmt_timeout_ms);
        var("HINIC_API_CHAIN_CELLS", &mut self.api_chain_cells);
        var("HINIC_API_CHAIN_TIMEOUT_MS", &mut self.api_chain_timeout_ms);
        var("HINIC_AEQ_LEN", &mut self.aeq_len);
        var("HINIC_CEQ_LEN", &mut self.ceq_len);
        var("HINIC_AEQ_VECTOR", &mut self.aeq_vector);
        var("HINIC_CEQ_VECTOR", &mut self.ceq_vector);
        var("HINIC_PAGE_SIZE", &mut self.page_size);
    }

    pub fn validate(&self) -> Result<()> {
        let pow2 = |n: u64| n != 0 && n.is_power_of_two();

        if !pow2(self.cmdq_depth as u64) || self.cmdq_reserve >= self.cmdq_depth {
            return Err(Error::InvalidParameter);
        }
        if self.cmdq_timeout_ms == 0 || self.mgmt_timeout_ms == 0 || self.api_chain_timeout_ms == 0 {
            return Err(Error::InvalidParameter);
        }
        if !pow2(self.api_chain_cells as u64) || self.api_chain_cells > MAX_API_CHAIN_CELLS {
            return Err(Error::InvalidParameter);
        }
        if !pow2(self.aeq_len as u64) || !pow2(self.ceq_len as u64) {
            return Err(Error::InvalidParameter);
        }
        if !pow2(self.page_size as u64) || self.page_size < 4096 {
            return Err(Error::InvalidParameter);
        }
        if self.aeq_vector == self.ceq_vector {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    pub fn cmdq_timeout(&self) -> Duration {
        Duration::from_millis(self.cmdq_timeout_ms)
    }

    pub fn mgmt_timeout(&self) -> Duration {
        Duration::from_millis(self.mgmt_timeout_ms)
    }

    pub fn api_chain_timeout(&self) -> Duration {
        Duration::from_millis(self.api_chain_timeout_ms)
    }
}
