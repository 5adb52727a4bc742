// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cross-process symmetric memory.
//!
//! Cooperating processes, each driving one device of a group, allocate
//! same-sized blocks, exchange shareable memory handles through a
//! coordination store and map every peer's block into their own address
//! space. The result is a [`SymmetricMemory`] that can address rank `r`'s
//! block uniformly from any rank, plus signal/barrier primitives operating on
//! a reserved signal pad at the tail of every block.
//!
//! - [`SymmetricAllocator`]: block registry, allocation and rendezvous entry point
//! - [`DeviceDriver`]: driver seam with a CUDA ([`CudaDriver`]) and a host ([`HostDriver`]) family
//! - [`CoordinationStore`]: key-value store used for the out-of-band exchange
//! - [`registration`]: one allocator singleton per [`DeviceKind`]

#![deny(missing_docs)]

pub mod allocator;
pub mod config;
pub mod driver;
pub mod registration;
pub mod signal;
pub mod store;

/// Common imports for working with symmetric memory.
pub mod prelude;

mod block;
mod capability;
mod group;
mod os;
mod rendezvous;
mod symmetric;
mod tensor;

#[cfg(test)]
mod tests;

pub use allocator::{SymmetricAllocator, SymmetricMemoryAllocator};
pub use config::{SymmMemConfig, SymmMemConfigBuilder};
pub use driver::{CudaDriver, DeviceDriver, HostDriver, MemHandle, SignalPads};
pub use group::GroupInfo;
pub use registration::{get_allocator, has_allocator, register_allocator};
pub use rendezvous::RendezvousRequest;
pub use signal::SignalPadLayout;
pub use store::{CoordinationStore, FileStore, InMemoryStore};
pub use symmetric::{DeviceTable, SymmetricMemory};
pub use tensor::{DType, SymmetricTensor, TensorDescriptor, TensorDescriptorExt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for symmetric memory operations.
pub type Result<T> = std::result::Result<T, SymmMemError>;

/// Errors that can occur during symmetric memory operations.
///
/// Every variant is reported synchronously at the call site and none of them
/// is retried internally.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum SymmMemError {
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("pointer {0:#x} was not allocated by the symmetric memory allocator")]
    UnknownPointer(u64),

    #[error("rendezvous validation failed: {0}")]
    RendezvousMismatch(String),

    #[error("channel {channel} out of range: must be in [0, {channel_count}) for world size {world_size}")]
    ChannelOutOfRange {
        channel: i32,
        channel_count: usize,
        world_size: usize,
    },

    #[error("rank {rank} out of range for world size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },

    #[error("requested view of {requested} bytes exceeds the {available}-byte region")]
    BufferTooLarge { requested: usize, available: usize },

    #[error("coordination store error: {0}")]
    Store(String),

    #[error("group error: {0}")]
    Group(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),

    #[error("NVRTC error: {0}")]
    Nvrtc(#[from] cudarc::nvrtc::CompileError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Family of devices an allocator serves.
///
/// Each family has at most one registered allocator singleton, see
/// [`registration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// NVIDIA GPUs driven through the CUDA virtual memory management API.
    Cuda,

    /// Host shared memory; every "device" is a host process.
    Host,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cuda => write!(f, "cuda"),
            DeviceKind::Host => write!(f, "host"),
        }
    }
}

/// Where a memory region resides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// Host memory.
    System,

    /// Device memory with device ID.
    Device(u32),
}

impl StorageKind {
    /// Returns the device index if this is device memory.
    pub fn cuda_device_index(&self) -> Option<u32> {
        match self {
            StorageKind::Device(idx) => Some(*idx),
            _ => None,
        }
    }

    /// Returns true if this is host memory.
    pub fn is_system(&self) -> bool {
        matches!(self, StorageKind::System)
    }
}

/// A contiguous memory region addressable by the process.
pub trait MemoryDescriptor: Send + Sync + std::fmt::Debug {
    /// Base address of the memory region.
    fn addr(&self) -> usize;

    /// Size of the memory region in bytes.
    fn size(&self) -> usize;

    /// Type of storage backing this region.
    fn storage_kind(&self) -> StorageKind;
}

/// Rounds `value` up to the next multiple of `multiple`.
///
/// Returns `None` if the result does not fit in a `usize`.
#[inline]
pub(crate) fn round_up(value: usize, multiple: usize) -> Option<usize> {
    debug_assert!(multiple > 0);
    value.div_ceil(multiple).checked_mul(multiple)
}
