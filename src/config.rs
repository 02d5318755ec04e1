// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Crate configuration.
//!
//! Defaults are coded here and overlaid by `LOCKSTEP_*` environment
//! variables, e.g. `LOCKSTEP_COLLECTIVE_RADIX=8`. Every node of a cluster
//! must run with the same values; the collectives derive their tree shapes
//! from the radix without communicating them.

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("collective_radix must be at least 2, got {0}")]
    RadixTooSmall(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockstepConfig {
    /// Fan-out of collective trees and of each all-gather stage. Rounded
    /// down to a power of two internally.
    pub collective_radix: u32,

    /// Seal every collective stage with its payload kind and an xxh3
    /// checksum, and verify both on receipt. Catches shards whose collective
    /// call order has diverged. Must be set uniformly across the cluster.
    pub verify_collectives: bool,

    /// Validate after an inline-mapping exchange that no two shards claim
    /// overlapping fields of the same instance.
    pub check_mappings: bool,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            collective_radix: 4,
            verify_collectives: cfg!(debug_assertions),
            check_mappings: false,
        }
    }
}

impl LockstepConfig {
    /// Configuration sources in priority order (lowest to highest):
    /// 1. Code defaults
    /// 2. Environment variables (`LOCKSTEP_*` prefixed)
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(LockstepConfig::default()))
            .merge(Env::prefixed("LOCKSTEP_"))
    }

    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: LockstepConfig = Self::figment().extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collective_radix < 2 {
            return Err(ConfigError::RadixTooSmall(self.collective_radix));
        }
        Ok(())
    }
}
