// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! One-shot platform capability check.
//!
//! Each device is probed once; the outcome is final for the allocator's
//! lifetime.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::driver::DeviceDriver;
use crate::{Result, SymmMemError};

/// Outcome of probing a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PlatformSupport {
    Supported,
    Unsupported(String),
}

#[derive(Debug, Default)]
pub(crate) struct CapabilityCache {
    devices: Mutex<HashMap<usize, PlatformSupport>>,
}

impl CapabilityCache {
    /// Probes `device` on first call and returns the cached state afterwards.
    pub(crate) fn check(&self, driver: &dyn DeviceDriver, device: usize) -> PlatformSupport {
        let mut devices = self.devices.lock();
        devices
            .entry(device)
            .or_insert_with(|| match driver.check_support(device) {
                Ok(()) => {
                    tracing::debug!(device, kind = %driver.kind(), "symmetric memory supported");
                    PlatformSupport::Supported
                }
                Err(reason) => {
                    tracing::warn!(device, kind = %driver.kind(), %reason, "symmetric memory unavailable");
                    PlatformSupport::Unsupported(reason)
                }
            })
            .clone()
    }

    /// Like [`check`](Self::check), as an error on unsupported devices.
    pub(crate) fn require(&self, driver: &dyn DeviceDriver, device: usize) -> Result<()> {
        match self.check(driver, device) {
            PlatformSupport::Supported => Ok(()),
            PlatformSupport::Unsupported(reason) => Err(SymmMemError::Unsupported(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::HostDriver;

    #[test]
    fn test_host_is_supported() {
        let cache = CapabilityCache::default();
        let driver = HostDriver::new();
        assert_eq!(cache.check(&driver, 0), PlatformSupport::Supported);
        assert!(cache.require(&driver, 3).is_ok());
    }
}
