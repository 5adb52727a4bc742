// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous: exchange block handles with every peer and map them locally.
//!
//! 1. export the local block as a descriptor and publish a [`RendezvousRequest`]
//! 2. all-gather requests through the coordination store
//! 3. validate that every rank agrees on the block geometry and that device
//!    indices are distinct, before anything is imported
//! 4. import and map every peer's block
//! 5. store barrier, so no rank closes its exported descriptor while a peer
//!    may still be importing it
//! 6. hand every mapping to a [`SymmetricMemory`]

use std::collections::HashSet;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::driver::{DeviceDriver, MemHandle};
use crate::group::GroupInfo;
use crate::os::{current_pid, import_remote_fd};
use crate::store::StoreExchange;
use crate::symmetric::{SymmetricMemory, SymmetricParts};
use crate::{Result, SymmMemError};

/// Metadata one rank publishes during rendezvous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousRequest {
    /// Device the block lives on.
    pub device_idx: usize,
    /// Process that holds `block_fd`.
    pub pid: i32,
    /// Exported descriptor, valid in process `pid`.
    pub block_fd: i32,
    /// Mapped size of the block.
    pub block_size: usize,
    /// Usable payload size.
    pub buffer_size: usize,
    /// Offset of the signal pad within the block.
    pub signal_pad_offset: usize,
}

/// Checks that every rank published a consistent request.
pub(crate) fn validate_requests(requests: &[RendezvousRequest], world_size: usize) -> Result<()> {
    if requests.len() != world_size {
        return Err(SymmMemError::RendezvousMismatch(format!(
            "expected {} requests, got {}",
            world_size,
            requests.len()
        )));
    }

    let mut devices = HashSet::with_capacity(world_size);
    for (rank, request) in requests.iter().enumerate() {
        if !devices.insert(request.device_idx) {
            return Err(SymmMemError::RendezvousMismatch(format!(
                "rank {} maps device {} which another rank already uses",
                rank, request.device_idx
            )));
        }
    }

    let first = &requests[0];
    for (rank, request) in requests.iter().enumerate().skip(1) {
        if request.block_size != first.block_size
            || request.buffer_size != first.buffer_size
            || request.signal_pad_offset != first.signal_pad_offset
        {
            return Err(SymmMemError::RendezvousMismatch(format!(
                "rank {} has block_size={} buffer_size={} signal_pad_offset={}, \
                 rank 0 has block_size={} buffer_size={} signal_pad_offset={}",
                rank,
                request.block_size,
                request.buffer_size,
                request.signal_pad_offset,
                first.block_size,
                first.buffer_size,
                first.signal_pad_offset
            )));
        }
    }
    Ok(())
}

/// Peer mappings created during rendezvous.
///
/// Until [`disarm`](Self::disarm) is called, dropping unmaps and releases
/// every peer block. The local slot is never touched.
struct PeerMappings<'a> {
    driver: &'a dyn DeviceDriver,
    device: usize,
    block_size: usize,
    local_rank: usize,
    handles: Vec<Option<MemHandle>>,
    ptrs: Vec<Option<u64>>,
    armed: bool,
}

impl<'a> PeerMappings<'a> {
    fn new(driver: &'a dyn DeviceDriver, block: &Block, local_rank: usize, world_size: usize) -> Self {
        let mut handles = vec![None; world_size];
        let mut ptrs = vec![None; world_size];
        handles[local_rank] = Some(block.handle);
        ptrs[local_rank] = Some(block.ptr);
        Self {
            driver,
            device: block.device,
            block_size: block.block_size,
            local_rank,
            handles,
            ptrs,
            armed: true,
        }
    }

    fn map_peer(&mut self, peer: usize, request: &RendezvousRequest) -> Result<()> {
        let fd = import_remote_fd(request.pid, request.block_fd)?;
        let handle = self.driver.import_handle(self.device, fd.as_fd())?;
        self.handles[peer] = Some(handle);
        drop(fd);

        self.ptrs[peer] = Some(self.driver.map(self.device, handle, self.block_size)?);
        Ok(())
    }

    /// Handles and pointers in rank order. Every slot must be filled.
    fn collect(&self) -> Result<(Vec<MemHandle>, Vec<u64>)> {
        let handles = self.handles.iter().copied().collect::<Option<Vec<_>>>();
        let ptrs = self.ptrs.iter().copied().collect::<Option<Vec<_>>>();
        handles.zip(ptrs).ok_or_else(|| {
            SymmMemError::OperationFailed("rendezvous left a peer unmapped".into())
        })
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PeerMappings<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for peer in (0..self.handles.len()).filter(|&peer| peer != self.local_rank) {
            if let Some(ptr) = self.ptrs[peer]
                && let Err(e) = self.driver.unmap(self.device, ptr, self.block_size)
            {
                tracing::error!(peer, error = %e, "failed to unmap peer block after rendezvous failure");
            }
            if let Some(handle) = self.handles[peer]
                && let Err(e) = self.driver.release(handle)
            {
                tracing::error!(peer, error = %e, "failed to release peer handle after rendezvous failure");
            }
        }
    }
}

/// Inputs of one rendezvous.
pub(crate) struct Rendezvous<'a> {
    pub driver: &'a Arc<dyn DeviceDriver>,
    pub exchange: &'a StoreExchange,
    pub group: &'a GroupInfo,
    pub signal_pad_size: usize,
    pub max_barrier_lanes: usize,
    pub finalizing: &'a Arc<AtomicBool>,
}

impl Rendezvous<'_> {
    /// Runs the protocol for `block`. Every rank of the group must call this
    /// for its own block in the same order.
    pub(crate) fn run(&self, block: &Block) -> Result<SymmetricMemory> {
        let (rank, world_size, store) = (self.group.rank, self.group.world_size, &self.group.store);
        let driver = self.driver.as_ref();

        let exported = driver.export_handle(block.handle)?;
        let local = RendezvousRequest {
            device_idx: block.device,
            pid: current_pid(),
            block_fd: exported.as_raw_fd(),
            block_size: block.block_size,
            buffer_size: block.buffer_size,
            signal_pad_offset: block.signal_pad_offset,
        };

        let requests = self
            .exchange
            .all_gather(store.as_ref(), rank, world_size, &local)?;
        validate_requests(&requests, world_size)?;
        tracing::debug!(
            group = %block.group_name,
            rank,
            world_size,
            block_size = block.block_size,
            "rendezvous requests validated"
        );

        let mut mappings = PeerMappings::new(driver, block, rank, world_size);
        for (peer, request) in requests.iter().enumerate() {
            if peer != rank {
                mappings.map_peer(peer, request)?;
            }
        }

        self.exchange.barrier(store.as_ref(), rank, world_size)?;
        drop(exported);

        let (handles, buffer_ptrs) = mappings.collect()?;
        let symm_mem = SymmetricMemory::new(SymmetricParts {
            driver: self.driver.clone(),
            finalizing: self.finalizing.clone(),
            handles,
            buffer_ptrs,
            block_size: block.block_size,
            buffer_size: block.buffer_size,
            signal_pad_offset: block.signal_pad_offset,
            signal_pad_size: self.signal_pad_size,
            local_device: block.device,
            storage: block.storage,
            rank,
            world_size,
            max_barrier_lanes: self.max_barrier_lanes,
        })?;
        mappings.disarm();

        tracing::info!(
            group = %block.group_name,
            rank,
            world_size,
            buffer_size = block.buffer_size,
            "symmetric memory rendezvous complete"
        );
        Ok(symm_mem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn request(device_idx: usize, buffer_size: usize) -> RendezvousRequest {
        RendezvousRequest {
            device_idx,
            pid: 1,
            block_fd: 3,
            block_size: 8192,
            buffer_size,
            signal_pad_offset: buffer_size,
        }
    }

    #[test]
    fn test_consistent_requests_pass() {
        let requests = vec![request(0, 4096), request(1, 4096), request(2, 4096)];
        assert!(validate_requests(&requests, 3).is_ok());
    }

    #[rstest]
    #[case::wrong_count(vec![request(0, 4096)], 2)]
    #[case::duplicate_device(vec![request(0, 4096), request(0, 4096)], 2)]
    #[case::buffer_size(vec![request(0, 4096), request(1, 2048)], 2)]
    fn test_inconsistent_requests_fail(
        #[case] requests: Vec<RendezvousRequest>,
        #[case] world_size: usize,
    ) {
        assert!(matches!(
            validate_requests(&requests, world_size),
            Err(SymmMemError::RendezvousMismatch(_))
        ));
    }

    #[test]
    fn test_request_json_shape() {
        let json = serde_json::to_value(request(2, 4096)).unwrap();
        assert_eq!(json["device_idx"], 2);
        assert_eq!(json["signal_pad_offset"], 4096);
    }
}
