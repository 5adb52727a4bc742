// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Local allocation records and the pointer-keyed registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::driver::MemHandle;
use crate::symmetric::SymmetricMemory;
use crate::{MemoryDescriptor, StorageKind};

/// A block allocated by this process.
///
/// `block_size >= signal_pad_offset + signal_pad_size` and
/// `signal_pad_offset == round_up(buffer_size, 16)`.
#[derive(Debug, Clone)]
pub(crate) struct Block {
    pub ptr: u64,
    pub handle: MemHandle,
    pub device: usize,
    pub storage: StorageKind,
    pub block_size: usize,
    pub buffer_size: usize,
    pub signal_pad_offset: usize,
    pub group_name: String,
    /// Set once rendezvous completes; the mapping and handle are then owned by it.
    pub symm_mem: Option<Arc<SymmetricMemory>>,
}

impl Block {
    pub fn is_rendezvoused(&self) -> bool {
        self.symm_mem.is_some()
    }
}

impl MemoryDescriptor for Block {
    fn addr(&self) -> usize {
        self.ptr as usize
    }

    fn size(&self) -> usize {
        self.buffer_size
    }

    fn storage_kind(&self) -> StorageKind {
        self.storage
    }
}

/// Blocks keyed by their local base pointer.
///
/// Lookups take the shared lock; insert and remove take it exclusively.
#[derive(Debug, Default)]
pub(crate) struct BlockRegistry {
    blocks: RwLock<HashMap<u64, Block>>,
}

impl BlockRegistry {
    pub fn find(&self, ptr: u64) -> Option<Block> {
        self.blocks.read().get(&ptr).cloned()
    }

    pub fn insert(&self, block: Block) {
        self.blocks.write().insert(block.ptr, block);
    }

    pub fn remove(&self, ptr: u64) -> Option<Block> {
        self.blocks.write().remove(&ptr)
    }

    /// Attaches `symm_mem` to the block at `ptr` and returns the attached
    /// object.
    ///
    /// Callers must not rendezvous the same block from two threads at once:
    /// both objects map the local block, and dropping either one unmaps it.
    pub fn set_symmetric_memory(
        &self,
        ptr: u64,
        symm_mem: Arc<SymmetricMemory>,
    ) -> Option<Arc<SymmetricMemory>> {
        let mut blocks = self.blocks.write();
        let block = blocks.get_mut(&ptr)?;
        Some(block.symm_mem.get_or_insert(symm_mem).clone())
    }

    /// Removes every block, for teardown.
    pub fn drain(&self) -> Vec<Block> {
        self.blocks.write().drain().map(|(_, block)| block).collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(ptr: u64) -> Block {
        Block {
            ptr,
            handle: MemHandle(ptr),
            device: 0,
            storage: StorageKind::System,
            block_size: 8192,
            buffer_size: 4096,
            signal_pad_offset: 4096,
            group_name: "g".into(),
            symm_mem: None,
        }
    }

    #[test]
    fn test_insert_find_remove() {
        let registry = BlockRegistry::default();
        registry.insert(block(0x1000));
        registry.insert(block(0x3000));

        assert_eq!(registry.len(), 2);
        assert!(registry.find(0x1000).is_some());
        assert_eq!(registry.find(0x3000).unwrap().buffer_size, 4096);
        assert!(registry.find(0x2000).is_none());

        assert!(registry.remove(0x1000).is_some());
        assert!(registry.remove(0x1000).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_block_descriptor() {
        let block = block(0x1000);
        assert_eq!(block.addr(), 0x1000);
        assert_eq!(block.size(), 4096);
        assert!(block.storage_kind().is_system());
        assert!(!block.is_rendezvoused());
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = BlockRegistry::default();
        registry.insert(block(0x1000));
        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(registry.len(), 0);
    }
}
