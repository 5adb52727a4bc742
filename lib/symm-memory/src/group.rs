// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Group membership: resolves a group name to the store, rank and world size
//! used by the rendezvous protocol.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::store::CoordinationStore;
use crate::{Result, SymmMemError};

/// Membership of this process in a rendezvous group.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    /// Rank of this process within the group.
    pub rank: usize,
    /// Number of processes in the group.
    pub world_size: usize,
    /// Store shared by every member.
    pub store: Arc<dyn CoordinationStore>,
}

/// Table of groups known to an allocator.
#[derive(Debug, Default)]
pub(crate) struct GroupTable {
    groups: RwLock<HashMap<String, GroupInfo>>,
}

impl GroupTable {
    /// Registers `name`. Re-registering with the same rank and world size
    /// replaces the store; conflicting membership is rejected.
    pub(crate) fn set(
        &self,
        name: &str,
        rank: usize,
        world_size: usize,
        store: Arc<dyn CoordinationStore>,
    ) -> Result<()> {
        if world_size == 0 || rank >= world_size {
            return Err(SymmMemError::Group(format!(
                "invalid membership for group {}: rank {} of world size {}",
                name, rank, world_size
            )));
        }

        let mut groups = self.groups.write();
        if let Some(existing) = groups.get(name)
            && (existing.rank != rank || existing.world_size != world_size)
        {
            return Err(SymmMemError::Group(format!(
                "group {} already registered as rank {} of {}",
                name, existing.rank, existing.world_size
            )));
        }

        groups.insert(
            name.to_string(),
            GroupInfo {
                rank,
                world_size,
                store,
            },
        );
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Result<GroupInfo> {
        self.groups
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SymmMemError::Group(format!("group {} is not registered", name)))
    }
}
