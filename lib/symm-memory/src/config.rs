// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Allocator configuration.
//!
//! Values can be overridden through environment variables:
//! - `DYN_SYMM_MEM_SIGNAL_PAD_SIZE`: bytes reserved at the tail of every block (default 2048)
//! - `DYN_SYMM_MEM_STORE_PREFIX`: key prefix used for store exchanges (default `SymmetricMemory`)
//! - `DYN_SYMM_MEM_MAX_BARRIER_LANES`: largest world size a barrier covers (default 8)

use anyhow::{Result, bail};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Default signal pad size in bytes.
pub const DEFAULT_SIGNAL_PAD_SIZE: usize = 2048;

/// Default prefix for coordination store keys.
pub const DEFAULT_STORE_PREFIX: &str = "SymmetricMemory";

/// Default number of barrier lanes, which bounds the supported world size.
pub const DEFAULT_MAX_BARRIER_LANES: usize = 8;

/// Alignment of the signal pad offset within a block.
pub const SIGNAL_PAD_ALIGNMENT: usize = 16;

/// Lanes are launched as a single warp on CUDA devices.
const MAX_LANES_PER_LAUNCH: usize = 32;

const ENV_SIGNAL_PAD_SIZE: &str = "DYN_SYMM_MEM_SIGNAL_PAD_SIZE";
const ENV_STORE_PREFIX: &str = "DYN_SYMM_MEM_STORE_PREFIX";
const ENV_MAX_BARRIER_LANES: &str = "DYN_SYMM_MEM_MAX_BARRIER_LANES";

/// Configuration for a [`SymmetricAllocator`](crate::SymmetricAllocator).
///
/// # Example
///
/// ```ignore
/// let config = SymmMemConfig::builder()
///     .signal_pad_size(4096)
///     .store_prefix("tp-group")
///     .build()?;
/// ```
#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[builder(
    pattern = "owned",
    build_fn(error = "anyhow::Error", validate = "Self::validate")
)]
pub struct SymmMemConfig {
    /// Size of the signal pad reserved at the tail of every block.
    ///
    /// Default: 2048
    #[builder(default = "DEFAULT_SIGNAL_PAD_SIZE")]
    pub signal_pad_size: usize,

    /// Prefix for every key the rendezvous protocol writes to the store.
    ///
    /// Default: `SymmetricMemory`
    #[builder(default = "DEFAULT_STORE_PREFIX.to_string()", setter(into))]
    pub store_prefix: String,

    /// Maximum number of ranks a barrier can synchronize.
    ///
    /// Default: 8
    #[builder(default = "DEFAULT_MAX_BARRIER_LANES")]
    pub max_barrier_lanes: usize,
}

impl Default for SymmMemConfig {
    fn default() -> Self {
        Self {
            signal_pad_size: DEFAULT_SIGNAL_PAD_SIZE,
            store_prefix: DEFAULT_STORE_PREFIX.to_string(),
            max_barrier_lanes: DEFAULT_MAX_BARRIER_LANES,
        }
    }
}

impl SymmMemConfig {
    /// Creates a new builder starting from the defaults.
    pub fn builder() -> SymmMemConfigBuilder {
        SymmMemConfigBuilder::default()
    }

    /// Create configuration from environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    /// Returns an error if a variable cannot be parsed or the resulting
    /// configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(ENV_SIGNAL_PAD_SIZE) {
            config.signal_pad_size = match value.trim().parse() {
                Ok(size) => size,
                Err(e) => bail!("Invalid value for {}: {} ({})", ENV_SIGNAL_PAD_SIZE, value, e),
            };
        }

        if let Ok(value) = std::env::var(ENV_STORE_PREFIX) {
            config.store_prefix = value;
        }

        if let Ok(value) = std::env::var(ENV_MAX_BARRIER_LANES) {
            config.max_barrier_lanes = match value.trim().parse() {
                Ok(lanes) => lanes,
                Err(e) => bail!(
                    "Invalid value for {}: {} ({})",
                    ENV_MAX_BARRIER_LANES,
                    value,
                    e
                ),
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration describes a usable signal pad layout.
    pub fn validate(&self) -> Result<()> {
        check_signal_pad_size(self.signal_pad_size)?;
        check_max_barrier_lanes(self.max_barrier_lanes)?;
        check_store_prefix(&self.store_prefix)
    }
}

impl SymmMemConfigBuilder {
    // Unset fields take their defaults, which are valid.
    fn validate(&self) -> Result<()> {
        if let Some(size) = self.signal_pad_size {
            check_signal_pad_size(size)?;
        }
        if let Some(lanes) = self.max_barrier_lanes {
            check_max_barrier_lanes(lanes)?;
        }
        if let Some(prefix) = &self.store_prefix {
            check_store_prefix(prefix)?;
        }
        Ok(())
    }
}

fn check_signal_pad_size(size: usize) -> Result<()> {
    if size == 0 {
        bail!("signal_pad_size must be greater than 0");
    }
    if !size.is_multiple_of(SIGNAL_PAD_ALIGNMENT) {
        bail!(
            "signal_pad_size ({}) must be a multiple of {}",
            size,
            SIGNAL_PAD_ALIGNMENT
        );
    }
    Ok(())
}

fn check_max_barrier_lanes(lanes: usize) -> Result<()> {
    if lanes == 0 || lanes > MAX_LANES_PER_LAUNCH {
        bail!(
            "max_barrier_lanes ({}) must be in [1, {}]",
            lanes,
            MAX_LANES_PER_LAUNCH
        );
    }
    Ok(())
}

fn check_store_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || prefix.contains('/') {
        bail!("store_prefix must be non-empty and must not contain '/'");
    }
    Ok(())
}
