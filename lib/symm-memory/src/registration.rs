// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide allocator registration.
//!
//! At most one allocator is registered per [`DeviceKind`]. The table is
//! created on first use and lives for the rest of the process; callers that
//! need teardown call [`SymmetricMemoryAllocator::shutdown`] explicitly.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::allocator::SymmetricMemoryAllocator;
use crate::{DeviceKind, Result, SymmMemError};

type AllocatorTable = RwLock<HashMap<DeviceKind, Arc<dyn SymmetricMemoryAllocator>>>;

fn table() -> &'static AllocatorTable {
    static ALLOCATORS: OnceLock<AllocatorTable> = OnceLock::new();
    ALLOCATORS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registers `allocator` as the singleton for `kind`.
///
/// Fails if an allocator is already registered for `kind`.
pub fn register_allocator(
    kind: DeviceKind,
    allocator: Arc<dyn SymmetricMemoryAllocator>,
) -> Result<()> {
    let mut allocators = table().write();
    if allocators.contains_key(&kind) {
        return Err(SymmMemError::OperationFailed(format!(
            "an allocator is already registered for {}",
            kind
        )));
    }
    tracing::debug!(%kind, "registered symmetric memory allocator");
    allocators.insert(kind, allocator);
    Ok(())
}

/// Returns the allocator registered for `kind`.
pub fn get_allocator(kind: DeviceKind) -> Result<Arc<dyn SymmetricMemoryAllocator>> {
    table()
        .read()
        .get(&kind)
        .cloned()
        .ok_or_else(|| SymmMemError::Unsupported(format!("no allocator registered for {}", kind)))
}

/// Whether an allocator is registered for `kind`.
pub fn has_allocator(kind: DeviceKind) -> bool {
    table().read().contains_key(&kind)
}
