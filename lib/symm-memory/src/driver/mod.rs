// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device driver seam.
//!
//! A [`DeviceDriver`] provides the handle-backed memory operations the
//! allocator and the rendezvous protocol need (create, map, export, import,
//! release) and executes the signal primitives for its device family.
//!
//! - [`CudaDriver`]: CUDA virtual memory management with POSIX file descriptor
//!   handles; signals run as NVRTC-compiled kernels.
//! - [`HostDriver`]: memfd-backed shared host memory; signals run on the
//!   calling thread.

mod cuda;
mod host;
mod kernels;

pub use cuda::CudaDriver;
pub use host::HostDriver;

use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd};

use crate::{DeviceKind, Result, StorageKind};

/// Opaque driver-level reference to a physical allocation.
///
/// A handle is distinct from any virtual address it is mapped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(pub u64);

/// Signal pad pointers of a rendezvoused group, as seen from one rank.
#[derive(Debug, Clone, Copy)]
pub struct SignalPads<'a> {
    /// Host-visible pointer to every rank's signal pad.
    pub host: &'a [u64],
    /// Device-visible copy of `host`.
    pub device_table: u64,
    /// Local device index.
    pub device: usize,
    /// Local rank.
    pub rank: usize,
    /// Group size.
    pub world_size: usize,
}

impl SignalPads<'_> {
    /// Address of slot `slot_index` inside `peer`'s pad.
    #[inline]
    pub fn slot_addr(&self, peer: usize, slot_index: usize) -> u64 {
        self.host[peer] + (slot_index * crate::signal::SIGNAL_SLOT_SIZE) as u64
    }
}

/// Driver operations for one device family.
///
/// Pointers are virtual addresses in the calling process, expressed as `u64`
/// so host and device addresses share a representation.
pub trait DeviceDriver: Send + Sync + fmt::Debug {
    /// Device family served by this driver.
    fn kind(&self) -> DeviceKind;

    /// Where memory mapped for `device` resides.
    fn storage_kind(&self, device: usize) -> StorageKind;

    /// Checks whether handle-backed allocation, shareable handles and
    /// cross-device atomics are usable on `device`.
    ///
    /// Returns the reason on failure.
    fn check_support(&self, device: usize) -> std::result::Result<(), String>;

    /// Recommended allocation granularity for `device`.
    fn granularity(&self, device: usize) -> Result<usize>;

    /// Creates a physical allocation of `size` bytes that can be exported.
    fn create(&self, device: usize, size: usize) -> Result<MemHandle>;

    /// Reserves address space, maps `handle` into it and grants read-write
    /// access to `device`.
    fn map(&self, device: usize, handle: MemHandle, size: usize) -> Result<u64>;

    /// Unmaps and frees the address range returned by [`map`](Self::map).
    fn unmap(&self, device: usize, ptr: u64, size: usize) -> Result<()>;

    /// Releases a physical allocation.
    fn release(&self, handle: MemHandle) -> Result<()>;

    /// Zero-fills `size` bytes at `ptr`.
    fn memset_zero(&self, device: usize, ptr: u64, size: usize) -> Result<()>;

    /// Exports `handle` as a descriptor other processes can import.
    fn export_handle(&self, handle: MemHandle) -> Result<OwnedFd>;

    /// Imports a descriptor exported by [`export_handle`](Self::export_handle)
    /// in any process. The descriptor may be closed afterwards.
    fn import_handle(&self, device: usize, fd: BorrowedFd<'_>) -> Result<MemHandle>;

    /// Copies `values` into freshly allocated device-visible memory.
    fn upload_table(&self, device: usize, values: &[u64]) -> Result<u64>;

    /// Frees memory returned by [`upload_table`](Self::upload_table).
    fn free_table(&self, device: usize, ptr: u64, len: usize) -> Result<()>;

    /// Waits for all outstanding work on `device`.
    fn synchronize(&self, device: usize) -> Result<()>;

    /// Releases slot `[channel][rank]` in `dst_rank`'s pad.
    fn put_signal(&self, pads: &SignalPads<'_>, dst_rank: usize, channel: usize) -> Result<()>;

    /// Acquires slot `[channel][src_rank]` in the local pad, then fences.
    fn wait_signal(&self, pads: &SignalPads<'_>, src_rank: usize, channel: usize) -> Result<()>;

    /// All-to-all barrier over one channel.
    fn barrier(&self, pads: &SignalPads<'_>, channel: usize) -> Result<()>;

    /// Writes a single `u32` at `addr`, ordered with previously queued work.
    fn write_value32(&self, device: usize, addr: u64, value: u32) -> Result<()>;

    /// Fills `count` `u32` words starting at `addr` with `value`.
    fn memset32(&self, device: usize, addr: u64, value: u32, count: usize) -> Result<()>;
}
