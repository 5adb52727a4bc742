// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The rendezvoused view of a group's blocks.
//!
//! A [`SymmetricMemory`] owns every mapping and handle this process created
//! or imported during rendezvous, including its own block. Dropping it
//! unmaps and releases all of them after the device has drained.

use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::driver::{DeviceDriver, MemHandle, SignalPads};
use crate::signal::{SIGNAL_SLOT_SIZE, SignalPadLayout};
use crate::tensor::{DType, SymmetricTensor, check_view};
use crate::{Result, StorageKind, SymmMemError};

/// Read-only array of pointers copied to device-visible memory once.
#[derive(Debug)]
pub struct DeviceTable {
    driver: Arc<dyn DeviceDriver>,
    device: usize,
    ptr: u64,
    len: usize,
}

impl DeviceTable {
    pub(crate) fn upload(driver: Arc<dyn DeviceDriver>, device: usize, values: &[u64]) -> Result<Self> {
        let ptr = driver.upload_table(device, values)?;
        Ok(Self {
            driver,
            device,
            ptr,
            len: values.len(),
        })
    }

    /// Device-visible address of the first entry.
    pub fn as_ptr(&self) -> u64 {
        self.ptr
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for DeviceTable {
    fn drop(&mut self) {
        if let Err(e) = self.driver.free_table(self.device, self.ptr, self.len) {
            tracing::error!(device = self.device, error = %e, "failed to free device pointer table");
        }
    }
}

/// Everything rendezvous hands over to a [`SymmetricMemory`].
pub(crate) struct SymmetricParts {
    pub driver: Arc<dyn DeviceDriver>,
    pub finalizing: Arc<AtomicBool>,
    pub handles: Vec<MemHandle>,
    pub buffer_ptrs: Vec<u64>,
    pub block_size: usize,
    pub buffer_size: usize,
    pub signal_pad_offset: usize,
    pub signal_pad_size: usize,
    pub local_device: usize,
    pub storage: StorageKind,
    pub rank: usize,
    pub world_size: usize,
    pub max_barrier_lanes: usize,
}

/// Per-rank mappings of one symmetric allocation.
///
/// Rank `r`'s buffer and signal pad are addressable from this process at
/// `get_buffer_ptrs()[r]` and `get_signal_pad_ptrs()[r]`. The device-visible
/// copies of both arrays are uploaded once and never mutated.
#[derive(Debug)]
pub struct SymmetricMemory {
    driver: Arc<dyn DeviceDriver>,
    finalizing: Arc<AtomicBool>,
    handles: Vec<MemHandle>,
    buffer_ptrs: Vec<u64>,
    signal_pad_ptrs: Vec<u64>,
    buffer_ptrs_dev: ManuallyDrop<DeviceTable>,
    signal_pad_ptrs_dev: ManuallyDrop<DeviceTable>,
    block_size: usize,
    buffer_size: usize,
    signal_pad_size: usize,
    layout: SignalPadLayout,
    local_device: usize,
    storage: StorageKind,
    rank: usize,
    world_size: usize,
    max_barrier_lanes: usize,
}

impl SymmetricMemory {
    /// Uploads the pointer tables and takes ownership of every mapping.
    ///
    /// On error nothing has been taken over; the caller still owns the mappings.
    pub(crate) fn new(parts: SymmetricParts) -> Result<Self> {
        let signal_pad_ptrs: Vec<u64> = parts
            .buffer_ptrs
            .iter()
            .map(|ptr| ptr + parts.signal_pad_offset as u64)
            .collect();

        let buffer_ptrs_dev =
            DeviceTable::upload(parts.driver.clone(), parts.local_device, &parts.buffer_ptrs)?;
        let signal_pad_ptrs_dev =
            DeviceTable::upload(parts.driver.clone(), parts.local_device, &signal_pad_ptrs)?;

        Ok(Self {
            layout: SignalPadLayout::new(parts.signal_pad_size, parts.world_size),
            driver: parts.driver,
            finalizing: parts.finalizing,
            handles: parts.handles,
            buffer_ptrs: parts.buffer_ptrs,
            signal_pad_ptrs,
            buffer_ptrs_dev: ManuallyDrop::new(buffer_ptrs_dev),
            signal_pad_ptrs_dev: ManuallyDrop::new(signal_pad_ptrs_dev),
            block_size: parts.block_size,
            buffer_size: parts.buffer_size,
            signal_pad_size: parts.signal_pad_size,
            local_device: parts.local_device,
            storage: parts.storage,
            rank: parts.rank,
            world_size: parts.world_size,
            max_barrier_lanes: parts.max_barrier_lanes,
        })
    }

    /// Returns a `shape`-shaped view of `dtype` into rank `rank`'s buffer,
    /// starting `storage_offset` elements in.
    ///
    /// Fails unless `(numel + storage_offset) * element_size <= buffer_size`.
    pub fn get_buffer(
        &self,
        rank: usize,
        shape: &[usize],
        dtype: DType,
        storage_offset: usize,
    ) -> Result<SymmetricTensor<'_>> {
        self.layout.check_rank(rank)?;
        let offset = check_view(shape, dtype, storage_offset, self.buffer_size)?;
        Ok(SymmetricTensor::new(
            self.buffer_ptrs[rank] + offset as u64,
            shape,
            dtype,
            self.storage,
        ))
    }

    /// Returns a view into rank `rank`'s signal pad.
    ///
    /// With no `shape`, the view covers the whole pad (minus `storage_offset`)
    /// as a flat array.
    pub fn get_signal_pad(
        &self,
        rank: usize,
        shape: Option<&[usize]>,
        dtype: DType,
        storage_offset: usize,
    ) -> Result<SymmetricTensor<'_>> {
        self.layout.check_rank(rank)?;
        let whole;
        let shape = match shape {
            Some(shape) => shape,
            None => {
                let elems = (self.signal_pad_size / dtype.element_size()).saturating_sub(storage_offset);
                whole = [elems];
                &whole[..]
            }
        };
        let offset = check_view(shape, dtype, storage_offset, self.signal_pad_size)?;
        Ok(SymmetricTensor::new(
            self.signal_pad_ptrs[rank] + offset as u64,
            shape,
            dtype,
            self.storage,
        ))
    }

    /// Host-visible buffer pointer of every rank.
    pub fn get_buffer_ptrs(&self) -> &[u64] {
        &self.buffer_ptrs
    }

    /// Host-visible signal pad pointer of every rank.
    pub fn get_signal_pad_ptrs(&self) -> &[u64] {
        &self.signal_pad_ptrs
    }

    /// Device-visible array mirroring [`get_buffer_ptrs`](Self::get_buffer_ptrs).
    pub fn get_buffer_ptrs_dev(&self) -> u64 {
        self.buffer_ptrs_dev.as_ptr()
    }

    /// Device-visible array mirroring [`get_signal_pad_ptrs`](Self::get_signal_pad_ptrs).
    pub fn get_signal_pad_ptrs_dev(&self) -> u64 {
        self.signal_pad_ptrs_dev.as_ptr()
    }

    /// Usable payload size of every rank's buffer.
    pub fn get_buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Size of every rank's signal pad.
    pub fn get_signal_pad_size(&self) -> usize {
        self.signal_pad_size
    }

    /// Device this process maps the group on.
    pub fn get_local_device(&self) -> usize {
        self.local_device
    }

    /// Rank of this process.
    pub fn get_rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks in the group.
    pub fn get_world_size(&self) -> usize {
        self.world_size
    }

    /// Geometry of the signal pads.
    pub fn signal_pad_layout(&self) -> SignalPadLayout {
        self.layout
    }

    /// Multicast objects are not provided.
    pub fn has_multicast_support(&self) -> bool {
        false
    }

    fn pads(&self) -> SignalPads<'_> {
        SignalPads {
            host: &self.signal_pad_ptrs,
            device_table: self.signal_pad_ptrs_dev.as_ptr(),
            device: self.local_device,
            rank: self.rank,
            world_size: self.world_size,
        }
    }

    /// Posts a signal on `channel` to `dst_rank`.
    pub fn put_signal(&self, dst_rank: usize, channel: i32) -> Result<()> {
        let channel = self.layout.check_channel(channel)?;
        self.layout.check_rank(dst_rank)?;
        self.driver.put_signal(&self.pads(), dst_rank, channel)
    }

    /// Waits for a signal on `channel` from `src_rank`.
    pub fn wait_signal(&self, src_rank: usize, channel: i32) -> Result<()> {
        let channel = self.layout.check_channel(channel)?;
        self.layout.check_rank(src_rank)?;
        self.driver.wait_signal(&self.pads(), src_rank, channel)
    }

    /// Blocks until every rank has entered a barrier on `channel`.
    pub fn barrier(&self, channel: i32) -> Result<()> {
        let channel = self.layout.check_channel(channel)?;
        if self.world_size > self.max_barrier_lanes {
            return Err(SymmMemError::Unsupported(format!(
                "barrier covers at most {} ranks, group has {}",
                self.max_barrier_lanes, self.world_size
            )));
        }
        self.driver.barrier(&self.pads(), channel)
    }

    /// Writes `value` to `addr`, which must lie in one of the mapped blocks.
    pub fn stream_write_value32(&self, addr: u64, value: u32) -> Result<()> {
        self.check_mapped(addr, SIGNAL_SLOT_SIZE)?;
        self.driver.write_value32(self.local_device, addr, value)
    }

    /// Fills `count` words starting at `addr` with `value`.
    pub fn memset32(&self, addr: u64, value: u32, count: usize) -> Result<()> {
        let len = count
            .checked_mul(SIGNAL_SLOT_SIZE)
            .ok_or_else(|| SymmMemError::OperationFailed("memset32: count overflows".into()))?;
        self.check_mapped(addr, len)?;
        self.driver.memset32(self.local_device, addr, value, count)
    }

    fn check_mapped(&self, addr: u64, len: usize) -> Result<()> {
        let inside = self.buffer_ptrs.iter().any(|&base| {
            addr >= base
                && (addr - base)
                    .checked_add(len as u64)
                    .is_some_and(|end| end <= self.block_size as u64)
        });
        if inside {
            Ok(())
        } else {
            Err(SymmMemError::UnknownPointer(addr))
        }
    }
}

impl Drop for SymmetricMemory {
    fn drop(&mut self) {
        if self.finalizing.load(Ordering::Acquire) {
            // The driver may already be torn down; leak the mappings.
            tracing::debug!(rank = self.rank, "skipping symmetric memory teardown during shutdown");
            return;
        }

        if let Err(e) = self.driver.synchronize(self.local_device) {
            tracing::error!(device = self.local_device, error = %e, "synchronize before unmap failed");
        }

        // SAFETY: the tables are not used again after this point.
        unsafe {
            ManuallyDrop::drop(&mut self.buffer_ptrs_dev);
            ManuallyDrop::drop(&mut self.signal_pad_ptrs_dev);
        }

        for (peer, (&ptr, &handle)) in self.buffer_ptrs.iter().zip(&self.handles).enumerate() {
            if let Err(e) = self.driver.unmap(self.local_device, ptr, self.block_size) {
                tracing::error!(peer, error = %e, "failed to unmap symmetric block");
            }
            if let Err(e) = self.driver.release(handle) {
                tracing::error!(peer, error = %e, "failed to release symmetric block handle");
            }
        }
        tracing::debug!(
            rank = self.rank,
            world_size = self.world_size,
            "released symmetric memory"
        );
    }
}
