// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Symmetric memory allocator.
//!
//! [`SymmetricAllocator`] hands out handle-backed blocks, tracks them by base
//! pointer and turns them into [`SymmetricMemory`] objects through the
//! rendezvous protocol. Each allocator owns its block registry, its group
//! table and its store sequence, so several allocators (for example one per
//! rank thread in tests) can coexist in one process.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::block::{Block, BlockRegistry};
use crate::capability::CapabilityCache;
use crate::config::{SIGNAL_PAD_ALIGNMENT, SymmMemConfig};
use crate::driver::{CudaDriver, DeviceDriver, HostDriver};
use crate::group::{GroupInfo, GroupTable};
use crate::rendezvous::Rendezvous;
use crate::store::{CoordinationStore, StoreExchange};
use crate::symmetric::SymmetricMemory;
use crate::{DeviceKind, Result, SymmMemError, round_up};

/// Operations every symmetric memory allocator provides.
pub trait SymmetricMemoryAllocator: Send + Sync + fmt::Debug {
    /// Device family this allocator serves.
    fn device_kind(&self) -> DeviceKind;

    /// Allocates a zero-filled block with `size` usable bytes on `device`,
    /// to be rendezvoused within `group_name`. Returns the local base pointer.
    fn alloc(&self, size: usize, device: usize, group_name: &str) -> Result<u64>;

    /// Frees the block at `ptr`.
    ///
    /// Unknown pointers and calls after [`shutdown`](Self::shutdown) are
    /// no-ops. A rendezvoused block stays mapped until its
    /// [`SymmetricMemory`] is dropped.
    fn free(&self, ptr: u64) -> Result<()>;

    /// Usable size of the block at `ptr`.
    fn get_alloc_size(&self, ptr: u64) -> Result<usize>;

    /// Exchanges the block at `ptr` with every member of its group.
    ///
    /// Collective: every rank must call it for its own block. Repeated calls
    /// return the same object. Concurrent calls for the same block are not
    /// supported.
    fn rendezvous(&self, ptr: u64) -> Result<Arc<SymmetricMemory>>;

    /// Whether the block at `ptr` has been rendezvoused.
    fn is_rendezvous_completed(&self, ptr: u64) -> Result<bool>;

    /// Whether multicast objects can be created on `device`.
    fn has_multicast_support(&self, device: usize) -> bool;

    /// Stops tracking every block without releasing it. Idempotent.
    fn shutdown(&self);
}

/// Symmetric memory allocator over a [`DeviceDriver`].
pub struct SymmetricAllocator {
    driver: Arc<dyn DeviceDriver>,
    config: SymmMemConfig,
    blocks: BlockRegistry,
    groups: GroupTable,
    exchange: StoreExchange,
    capability: CapabilityCache,
    finalizing: Arc<AtomicBool>,
}

impl fmt::Debug for SymmetricAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricAllocator")
            .field("kind", &self.driver.kind())
            .field("config", &self.config)
            .field("blocks", &self.blocks.len())
            .field("finalizing", &self.finalizing.load(Ordering::Relaxed))
            .finish()
    }
}

impl SymmetricAllocator {
    /// Creates an allocator over `driver`.
    pub fn new(driver: Arc<dyn DeviceDriver>, config: SymmMemConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SymmMemError::OperationFailed(format!("invalid configuration: {:#}", e)))?;
        Ok(Self {
            exchange: StoreExchange::new(config.store_prefix.clone()),
            driver,
            config,
            blocks: BlockRegistry::default(),
            groups: GroupTable::default(),
            capability: CapabilityCache::default(),
            finalizing: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Creates an allocator for CUDA devices.
    pub fn cuda(config: SymmMemConfig) -> Result<Self> {
        Self::new(Arc::new(CudaDriver::new()), config)
    }

    /// Creates an allocator for host shared memory.
    pub fn host(config: SymmMemConfig) -> Result<Self> {
        Self::new(Arc::new(HostDriver::new()), config)
    }

    /// Configuration in effect.
    pub fn config(&self) -> &SymmMemConfig {
        &self.config
    }

    /// Driver used for every allocation.
    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    /// Records this process's membership in `name`.
    pub fn set_group_info(
        &self,
        name: &str,
        rank: usize,
        world_size: usize,
        store: Arc<dyn CoordinationStore>,
    ) -> Result<()> {
        self.groups.set(name, rank, world_size, store)
    }

    /// Membership previously recorded for `name`.
    pub fn get_group_info(&self, name: &str) -> Result<GroupInfo> {
        self.groups.get(name)
    }

    /// Whether [`shutdown`](SymmetricMemoryAllocator::shutdown) has run.
    pub fn is_finalizing(&self) -> bool {
        self.finalizing.load(Ordering::Acquire)
    }

    /// Number of live blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn find_block(&self, ptr: u64) -> Option<Block> {
        self.blocks.find(ptr)
    }

    fn block(&self, ptr: u64) -> Result<Block> {
        self.find_block(ptr)
            .ok_or(SymmMemError::UnknownPointer(ptr))
    }

    fn release_block(&self, block: &Block) -> Result<()> {
        self.driver
            .unmap(block.device, block.ptr, block.block_size)?;
        self.driver.release(block.handle)
    }
}

/// Returns `(signal_pad_offset, block_size)` for a payload of `size` bytes.
fn block_layout(size: usize, signal_pad_size: usize, granularity: usize) -> Option<(usize, usize)> {
    let signal_pad_offset = round_up(size, SIGNAL_PAD_ALIGNMENT)?;
    let block_size = round_up(signal_pad_offset.checked_add(signal_pad_size)?, granularity)?;
    Some((signal_pad_offset, block_size))
}

impl SymmetricMemoryAllocator for SymmetricAllocator {
    fn device_kind(&self) -> DeviceKind {
        self.driver.kind()
    }

    fn alloc(&self, size: usize, device: usize, group_name: &str) -> Result<u64> {
        if self.is_finalizing() {
            return Err(SymmMemError::OperationFailed(
                "allocator has been shut down".into(),
            ));
        }
        self.capability.require(self.driver.as_ref(), device)?;

        let granularity = self.driver.granularity(device)?;
        let (signal_pad_offset, block_size) =
            block_layout(size, self.config.signal_pad_size, granularity).ok_or_else(|| {
                SymmMemError::AllocationFailed(format!(
                    "size {} plus a {} byte signal pad overflows the address space",
                    size, self.config.signal_pad_size
                ))
            })?;

        let handle = self.driver.create(device, block_size)?;
        let ptr = match self.driver.map(device, handle, block_size) {
            Ok(ptr) => ptr,
            Err(e) => {
                let _ = self.driver.release(handle);
                return Err(e);
            }
        };

        let block = Block {
            ptr,
            handle,
            device,
            storage: self.driver.storage_kind(device),
            block_size,
            buffer_size: size,
            signal_pad_offset,
            group_name: group_name.to_string(),
            symm_mem: None,
        };

        if let Err(e) = self.driver.memset_zero(device, ptr, block_size) {
            let _ = self.release_block(&block);
            return Err(e);
        }

        tracing::debug!(
            kind = %self.driver.kind(),
            device,
            size,
            block_size,
            group = group_name,
            ptr = format_args!("{:#x}", ptr),
            "allocated symmetric block"
        );
        self.blocks.insert(block);
        Ok(ptr)
    }

    fn free(&self, ptr: u64) -> Result<()> {
        if self.is_finalizing() {
            return Ok(());
        }
        let Some(block) = self.blocks.remove(ptr) else {
            return Ok(());
        };

        if block.is_rendezvoused() {
            // The SymmetricMemory owns the mapping now.
            tracing::debug!(ptr = format_args!("{:#x}", ptr), "freed rendezvoused block");
            return Ok(());
        }

        tracing::debug!(ptr = format_args!("{:#x}", ptr), "freed symmetric block");
        self.release_block(&block)
    }

    fn get_alloc_size(&self, ptr: u64) -> Result<usize> {
        Ok(self.block(ptr)?.buffer_size)
    }

    fn rendezvous(&self, ptr: u64) -> Result<Arc<SymmetricMemory>> {
        let block = self.block(ptr)?;
        if let Some(symm_mem) = block.symm_mem {
            return Ok(symm_mem);
        }

        let group = self.groups.get(&block.group_name)?;
        let symm_mem = Rendezvous {
            driver: &self.driver,
            exchange: &self.exchange,
            group: &group,
            signal_pad_size: self.config.signal_pad_size,
            max_barrier_lanes: self.config.max_barrier_lanes,
            finalizing: &self.finalizing,
        }
        .run(&block)?;

        self.blocks
            .set_symmetric_memory(ptr, Arc::new(symm_mem))
            .ok_or(SymmMemError::UnknownPointer(ptr))
    }

    fn is_rendezvous_completed(&self, ptr: u64) -> Result<bool> {
        Ok(self.block(ptr)?.is_rendezvoused())
    }

    fn has_multicast_support(&self, _device: usize) -> bool {
        false
    }

    fn shutdown(&self) {
        if self.finalizing.swap(true, Ordering::AcqRel) {
            return;
        }
        let leaked = self.blocks.drain();
        tracing::info!(
            kind = %self.driver.kind(),
            blocks = leaked.len(),
            "symmetric memory allocator shut down; outstanding blocks are leaked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use rstest::rstest;

    fn allocator() -> SymmetricAllocator {
        SymmetricAllocator::host(SymmMemConfig::default()).unwrap()
    }

    #[test]
    fn test_alloc_rounds_to_granularity() {
        let allocator = allocator();
        let granularity = allocator.driver().granularity(0).unwrap();

        let ptr = allocator.alloc(100, 0, "g").unwrap();
        let block = allocator.find_block(ptr).unwrap();

        assert_eq!(block.buffer_size, 100);
        assert_eq!(block.signal_pad_offset, 112);
        assert!(block.block_size >= 112 + 2048);
        assert_eq!(block.block_size % granularity, 0);
        assert_eq!(allocator.get_alloc_size(ptr).unwrap(), 100);
        assert!(!allocator.is_rendezvous_completed(ptr).unwrap());

        allocator.free(ptr).unwrap();
    }

    #[test]
    fn test_alloc_is_zeroed() {
        let allocator = allocator();
        let ptr = allocator.alloc(4096, 0, "g").unwrap();
        let block = allocator.find_block(ptr).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, block.block_size) };
        assert!(bytes.iter().all(|&b| b == 0));
        allocator.free(ptr).unwrap();
    }

    #[rstest]
    #[case(usize::MAX)]
    #[case(usize::MAX - 5)]
    #[case(usize::MAX - 2047)]
    #[case(usize::MAX - 4096)]
    fn test_alloc_rejects_overflowing_size(#[case] size: usize) {
        let driver = Arc::new(HostDriver::new());
        let allocator =
            SymmetricAllocator::new(driver.clone(), SymmMemConfig::default()).unwrap();

        assert!(matches!(
            allocator.alloc(size, 0, "g"),
            Err(SymmMemError::AllocationFailed(_))
        ));
        assert_eq!(allocator.num_blocks(), 0);
        assert_eq!(driver.live_handles(), 0);
    }

    #[test]
    fn test_block_layout_covers_payload_and_pad() {
        let (offset, block_size) = block_layout(100, 2048, 4096).unwrap();
        assert_eq!(offset, 112);
        assert_eq!(block_size, 4096);
        assert!(block_layout(usize::MAX - 15, 16, 1).is_none());
    }

    #[test]
    fn test_free_unknown_pointer_is_noop() {
        let allocator = allocator();
        allocator.free(0xdead_0000).unwrap();
        assert!(matches!(
            allocator.get_alloc_size(0xdead_0000),
            Err(SymmMemError::UnknownPointer(0xdead_0000))
        ));
        assert!(allocator.is_rendezvous_completed(0xdead_0000).is_err());
        assert!(allocator.rendezvous(0xdead_0000).is_err());
    }

    #[test]
    fn test_free_before_rendezvous_releases_block() {
        let driver = Arc::new(HostDriver::new());
        let allocator =
            SymmetricAllocator::new(driver.clone(), SymmMemConfig::default()).unwrap();

        let ptr = allocator.alloc(4096, 0, "g").unwrap();
        assert_eq!(driver.live_handles(), 1);
        allocator.free(ptr).unwrap();

        assert_eq!(driver.live_handles(), 0);
        assert_eq!(allocator.num_blocks(), 0);
        assert!(allocator.get_alloc_size(ptr).is_err());
    }

    #[test]
    fn test_rendezvous_requires_group() {
        let allocator = allocator();
        let ptr = allocator.alloc(64, 0, "missing").unwrap();
        assert!(matches!(
            allocator.rendezvous(ptr),
            Err(SymmMemError::Group(_))
        ));
        allocator.free(ptr).unwrap();
    }

    #[test]
    fn test_group_info_roundtrip() {
        let allocator = allocator();
        allocator
            .set_group_info("tp", 0, 2, Arc::new(InMemoryStore::new()))
            .unwrap();
        let info = allocator.get_group_info("tp").unwrap();
        assert_eq!((info.rank, info.world_size), (0, 2));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let driver = Arc::new(HostDriver::new());
        let allocator =
            SymmetricAllocator::new(driver.clone(), SymmMemConfig::default()).unwrap();
        let ptr = allocator.alloc(64, 0, "g").unwrap();

        allocator.shutdown();
        allocator.shutdown();

        assert!(allocator.is_finalizing());
        assert_eq!(allocator.num_blocks(), 0);
        // Outstanding blocks are leaked, not released.
        assert_eq!(driver.live_handles(), 1);
        allocator.free(ptr).unwrap();
        assert!(allocator.alloc(64, 0, "g").is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SymmMemConfig {
            signal_pad_size: 3,
            ..Default::default()
        };
        assert!(SymmetricAllocator::host(config).is_err());
    }

    #[test]
    fn test_no_multicast() {
        assert!(!allocator().has_multicast_support(0));
        assert_eq!(allocator().device_kind(), DeviceKind::Host);
    }
}
