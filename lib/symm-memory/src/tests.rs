// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multi-rank tests.
//!
//! Every rank runs on its own thread with its own allocator and host driver,
//! sharing only an in-memory coordination store, the way separate processes
//! would share a store and nothing else.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use proptest::prelude::*;

use crate::driver::{DeviceDriver, HostDriver, MemHandle, SignalPads};
use crate::prelude::*;
use crate::{DeviceKind, InMemoryStore, Result, StorageKind, SymmMemConfig, SymmMemError};

const GROUP: &str = "world";

/// Host driver that counts imported handles.
#[derive(Debug, Default)]
struct CountingDriver {
    inner: HostDriver,
    imports: AtomicUsize,
}

impl DeviceDriver for CountingDriver {
    fn kind(&self) -> DeviceKind {
        self.inner.kind()
    }
    fn storage_kind(&self, device: usize) -> StorageKind {
        self.inner.storage_kind(device)
    }
    fn check_support(&self, device: usize) -> std::result::Result<(), String> {
        self.inner.check_support(device)
    }
    fn granularity(&self, device: usize) -> Result<usize> {
        self.inner.granularity(device)
    }
    fn create(&self, device: usize, size: usize) -> Result<MemHandle> {
        self.inner.create(device, size)
    }
    fn map(&self, device: usize, handle: MemHandle, size: usize) -> Result<u64> {
        self.inner.map(device, handle, size)
    }
    fn unmap(&self, device: usize, ptr: u64, size: usize) -> Result<()> {
        self.inner.unmap(device, ptr, size)
    }
    fn release(&self, handle: MemHandle) -> Result<()> {
        self.inner.release(handle)
    }
    fn memset_zero(&self, device: usize, ptr: u64, size: usize) -> Result<()> {
        self.inner.memset_zero(device, ptr, size)
    }
    fn export_handle(&self, handle: MemHandle) -> Result<OwnedFd> {
        self.inner.export_handle(handle)
    }
    fn import_handle(&self, device: usize, fd: BorrowedFd<'_>) -> Result<MemHandle> {
        self.imports.fetch_add(1, Ordering::SeqCst);
        self.inner.import_handle(device, fd)
    }
    fn upload_table(&self, device: usize, values: &[u64]) -> Result<u64> {
        self.inner.upload_table(device, values)
    }
    fn free_table(&self, device: usize, ptr: u64, len: usize) -> Result<()> {
        self.inner.free_table(device, ptr, len)
    }
    fn synchronize(&self, device: usize) -> Result<()> {
        self.inner.synchronize(device)
    }
    fn put_signal(&self, pads: &SignalPads<'_>, dst_rank: usize, channel: usize) -> Result<()> {
        self.inner.put_signal(pads, dst_rank, channel)
    }
    fn wait_signal(&self, pads: &SignalPads<'_>, src_rank: usize, channel: usize) -> Result<()> {
        self.inner.wait_signal(pads, src_rank, channel)
    }
    fn barrier(&self, pads: &SignalPads<'_>, channel: usize) -> Result<()> {
        self.inner.barrier(pads, channel)
    }
    fn write_value32(&self, device: usize, addr: u64, value: u32) -> Result<()> {
        self.inner.write_value32(device, addr, value)
    }
    fn memset32(&self, device: usize, addr: u64, value: u32, count: usize) -> Result<()> {
        self.inner.memset32(device, addr, value, count)
    }
}

/// Runs `f(rank, allocator)` on `world_size` threads, each with an allocator
/// already joined to [`GROUP`].
fn run_ranks<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize, &SymmetricAllocator) -> T + Sync,
{
    run_ranks_with(
        world_size,
        |_| Arc::new(HostDriver::new()) as Arc<dyn DeviceDriver>,
        f,
    )
}

fn run_ranks_with<T, D, F>(world_size: usize, make_driver: D, f: F) -> Vec<T>
where
    T: Send,
    D: Fn(usize) -> Arc<dyn DeviceDriver> + Sync,
    F: Fn(usize, &SymmetricAllocator) -> T + Sync,
{
    let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
    thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let store = store.clone();
                let make_driver = &make_driver;
                let f = &f;
                scope.spawn(move || {
                    let allocator =
                        SymmetricAllocator::new(make_driver(rank), SymmMemConfig::default())
                            .unwrap();
                    allocator
                        .set_group_info(GROUP, rank, world_size, store)
                        .unwrap();
                    f(rank, &allocator)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_rendezvous_exposes_every_peer() {
    let world_size = 4;
    let results = run_ranks(world_size, |rank, allocator| {
        let ptr = allocator.alloc(4096, rank, GROUP).unwrap();
        let symm = allocator.rendezvous(ptr).unwrap();

        assert!(allocator.is_rendezvous_completed(ptr).unwrap());
        assert_eq!(symm.get_rank(), rank);
        assert_eq!(symm.get_local_device(), rank);
        assert_eq!(symm.get_buffer_ptrs()[rank], ptr);
        assert_eq!(symm.get_signal_pad_ptrs().len(), world_size);
        assert!(!symm.has_multicast_support());

        (
            symm.get_buffer_size(),
            symm.get_world_size(),
            symm.get_buffer_ptrs().to_vec(),
        )
    });

    for (buffer_size, world, ptrs) in results {
        assert_eq!(buffer_size, 4096);
        assert_eq!(world, world_size);
        assert!(ptrs.iter().all(|&p| p != 0));
        let mut distinct = ptrs.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), world_size);
    }
}

#[test]
fn test_device_tables_mirror_host_pointers() {
    let world_size = 3;
    run_ranks(world_size, |rank, allocator| {
        let ptr = allocator.alloc(2048, rank, GROUP).unwrap();
        let symm = allocator.rendezvous(ptr).unwrap();

        // The host driver's device tables live in host memory.
        let buffers = unsafe {
            std::slice::from_raw_parts(symm.get_buffer_ptrs_dev() as *const u64, world_size)
        };
        let pads = unsafe {
            std::slice::from_raw_parts(symm.get_signal_pad_ptrs_dev() as *const u64, world_size)
        };
        assert_eq!(buffers, symm.get_buffer_ptrs());
        assert_eq!(pads, symm.get_signal_pad_ptrs());
    });
}

#[test]
fn test_peer_writes_are_visible() {
    run_ranks(2, |rank, allocator| {
        let ptr = allocator.alloc(4096, rank, GROUP).unwrap();
        let symm = allocator.rendezvous(ptr).unwrap();

        // Each rank stamps its rank into the peer's buffer.
        let peer = 1 - rank;
        let view = symm.get_buffer(peer, &[1024], DType::U32, 0).unwrap();
        unsafe { *(view.data_ptr() as *mut u32).add(rank) = 100 + rank as u32 };

        symm.put_signal(peer, 0).unwrap();
        symm.wait_signal(peer, 0).unwrap();

        let local = unsafe { std::slice::from_raw_parts(ptr as *const u32, 2) };
        assert_eq!(local[peer], 100 + peer as u32);
    });
}

#[test]
fn test_get_buffer_bounds() {
    run_ranks(2, |rank, allocator| {
        let ptr = allocator.alloc(4096, rank, GROUP).unwrap();
        let symm = allocator.rendezvous(ptr).unwrap();

        for r in 0..2 {
            let view = symm.get_buffer(r, &[1024], DType::F32, 0).unwrap();
            assert_eq!(view.size(), 4096);
            assert_eq!(view.addr() as u64, symm.get_buffer_ptrs()[r]);
            assert!(matches!(
                symm.get_buffer(r, &[1025], DType::F32, 0),
                Err(SymmMemError::BufferTooLarge { .. })
            ));
        }
        assert!(symm.get_buffer(2, &[1], DType::F32, 0).is_err());

        let offset_view = symm.get_buffer(rank, &[512], DType::F32, 512).unwrap();
        assert_eq!(offset_view.data_ptr(), ptr + 2048);
    });
}

#[test]
fn test_signal_pad_view() {
    run_ranks(2, |rank, allocator| {
        let ptr = allocator.alloc(100, rank, GROUP).unwrap();
        let symm = allocator.rendezvous(ptr).unwrap();

        let pad = symm.get_signal_pad(rank, None, DType::U32, 0).unwrap();
        assert_eq!(pad.numel(), 512);
        assert_eq!(pad.data_ptr(), ptr + 112);
        assert_eq!(pad.data_ptr(), symm.get_signal_pad_ptrs()[rank]);

        assert!(symm.get_signal_pad(rank, Some(&[513]), DType::U32, 0).is_err());
        assert!(symm.get_signal_pad(rank, Some(&[16]), DType::U32, 496).is_ok());
    });
}

#[test]
fn test_rendezvous_is_idempotent() {
    run_ranks(2, |rank, allocator| {
        let ptr = allocator.alloc(1024, rank, GROUP).unwrap();
        let first = allocator.rendezvous(ptr).unwrap();
        let second = allocator.rendezvous(ptr).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    });
}

#[test]
fn test_mismatched_sizes_fail_before_import() {
    let drivers: Vec<Arc<CountingDriver>> = (0..2).map(|_| Arc::default()).collect();
    let results = run_ranks_with(
        2,
        |rank| drivers[rank].clone() as Arc<dyn DeviceDriver>,
        |rank, allocator| {
            let ptr = allocator.alloc(4096 * (rank + 1), rank, GROUP).unwrap();
            let result = allocator.rendezvous(ptr).map(|_| ());
            assert!(!allocator.is_rendezvous_completed(ptr).unwrap());
            allocator.free(ptr).unwrap();
            result
        },
    );

    for result in results {
        assert!(matches!(result, Err(SymmMemError::RendezvousMismatch(_))));
    }
    for driver in &drivers {
        assert_eq!(driver.imports.load(Ordering::SeqCst), 0);
        assert_eq!(driver.inner.live_handles(), 0);
    }
}

#[test]
fn test_duplicate_devices_fail() {
    let results = run_ranks(2, |_rank, allocator| {
        let ptr = allocator.alloc(4096, 0, GROUP).unwrap();
        allocator.rendezvous(ptr).map(|_| ())
    });
    for result in results {
        assert!(matches!(result, Err(SymmMemError::RendezvousMismatch(_))));
    }
}

#[test]
fn test_barrier_waits_for_every_rank() {
    let world_size = 4;
    let arrived = AtomicUsize::new(0);
    run_ranks(world_size, |rank, allocator| {
        let ptr = allocator.alloc(256, rank, GROUP).unwrap();
        let symm = allocator.rendezvous(ptr).unwrap();

        for round in 1..=3 {
            if rank == world_size - 1 {
                thread::sleep(std::time::Duration::from_millis(5));
            }
            arrived.fetch_add(1, Ordering::SeqCst);
            symm.barrier(0).unwrap();
            assert!(arrived.load(Ordering::SeqCst) >= round * world_size);
            symm.barrier(1).unwrap();
        }
    });
}

#[test]
fn test_signal_channels_are_independent() {
    run_ranks(2, |rank, allocator| {
        let ptr = allocator.alloc(256, rank, GROUP).unwrap();
        let symm = allocator.rendezvous(ptr).unwrap();
        let peer = 1 - rank;

        if rank == 0 {
            symm.put_signal(peer, 3).unwrap();
            symm.put_signal(peer, 7).unwrap();
        } else {
            symm.wait_signal(peer, 7).unwrap();
            symm.wait_signal(peer, 3).unwrap();
        }

        let pad = symm.get_signal_pad(rank, None, DType::U32, 0).unwrap();
        let slots = unsafe { std::slice::from_raw_parts(pad.data_ptr() as *const u32, pad.numel()) };
        symm.barrier(0).unwrap();
        assert!(slots[2..].iter().all(|&s| s == 0));
    });
}

#[test]
fn test_channel_out_of_range() {
    run_ranks(2, |rank, allocator| {
        let ptr = allocator.alloc(256, rank, GROUP).unwrap();
        let symm = allocator.rendezvous(ptr).unwrap();
        let channel_count = symm.signal_pad_layout().channel_count() as i32;
        assert_eq!(channel_count, 256);

        for channel in [-1, channel_count, i32::MAX] {
            assert!(matches!(
                symm.put_signal(1 - rank, channel),
                Err(SymmMemError::ChannelOutOfRange { .. })
            ));
            assert!(symm.wait_signal(1 - rank, channel).is_err());
            assert!(symm.barrier(channel).is_err());
        }
        assert!(matches!(
            symm.put_signal(2, 0),
            Err(SymmMemError::RankOutOfRange { .. })
        ));
    });
}

#[test]
fn test_barrier_rejects_groups_wider_than_lanes() {
    let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
    let world_size = 3;
    let config = SymmMemConfig::builder().max_barrier_lanes(2).build().unwrap();
    thread::scope(|scope| {
        for rank in 0..world_size {
            let store = store.clone();
            let config = config.clone();
            scope.spawn(move || {
                let allocator = SymmetricAllocator::host(config).unwrap();
                allocator.set_group_info(GROUP, rank, world_size, store).unwrap();
                let ptr = allocator.alloc(64, rank, GROUP).unwrap();
                let symm = allocator.rendezvous(ptr).unwrap();
                assert!(matches!(symm.barrier(0), Err(SymmMemError::Unsupported(_))));
            });
        }
    });
}

#[test]
fn test_free_after_rendezvous_keeps_mapping() {
    let drivers: Vec<Arc<HostDriver>> = (0..2).map(|_| Arc::default()).collect();
    run_ranks_with(
        2,
        |rank| drivers[rank].clone() as Arc<dyn DeviceDriver>,
        |rank, allocator| {
            let ptr = allocator.alloc(4096, rank, GROUP).unwrap();
            let symm = allocator.rendezvous(ptr).unwrap();

            allocator.free(ptr).unwrap();
            assert!(allocator.get_alloc_size(ptr).is_err());
            assert_eq!(drivers[rank].live_handles(), 2);

            // Still mapped through the SymmetricMemory.
            symm.memset32(ptr, 0xabcd, 4).unwrap();
            assert_eq!(unsafe { *(ptr as *const u32).add(3) }, 0xabcd);

            symm.barrier(0).unwrap();
            drop(symm);
            assert_eq!(drivers[rank].live_handles(), 0);
        },
    );
}

#[test]
fn test_write_value32_to_peer() {
    run_ranks(2, |rank, allocator| {
        let ptr = allocator.alloc(4096, rank, GROUP).unwrap();
        let symm = allocator.rendezvous(ptr).unwrap();
        let peer = 1 - rank;

        let target = symm.get_buffer_ptrs()[peer] + 4 * rank as u64;
        symm.stream_write_value32(target, 42 + rank as u32).unwrap();
        symm.barrier(0).unwrap();

        assert_eq!(unsafe { *(ptr as *const u32).add(peer) }, 42 + peer as u32);

        assert!(symm.stream_write_value32(0x8, 1).is_err());
        assert!(matches!(
            symm.memset32(0x10, 0, 1),
            Err(SymmMemError::UnknownPointer(0x10))
        ));
    });
}

#[test]
fn test_sequential_rendezvous_rounds() {
    run_ranks(3, |rank, allocator| {
        let a = allocator.alloc(128, rank, GROUP).unwrap();
        let b = allocator.alloc(512, rank, GROUP).unwrap();
        let symm_a = allocator.rendezvous(a).unwrap();
        let symm_b = allocator.rendezvous(b).unwrap();

        assert_eq!(symm_a.get_buffer_size(), 128);
        assert_eq!(symm_b.get_buffer_size(), 512);
        assert_ne!(symm_a.get_buffer_ptrs(), symm_b.get_buffer_ptrs());
        symm_a.barrier(0).unwrap();
        symm_b.barrier(0).unwrap();
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_get_buffer_limit(numel in 0usize..2048, offset in 0usize..64) {
        let allocator = SymmetricAllocator::host(SymmMemConfig::default()).unwrap();
        allocator
            .set_group_info(GROUP, 0, 1, Arc::new(InMemoryStore::new()))
            .unwrap();
        let ptr = allocator.alloc(4096, 0, GROUP).unwrap();
        let symm = allocator.rendezvous(ptr).unwrap();

        let fits = (numel + offset) * 4 <= 4096;
        prop_assert_eq!(symm.get_buffer(0, &[numel], DType::F32, offset).is_ok(), fits);
    }
}

#[cfg(feature = "testing-cuda")]
mod cuda {
    use super::*;
    use crate::CudaDriver;

    #[test]
    fn test_single_rank_cuda_rendezvous() {
        let driver = CudaDriver::new();
        if driver.check_support(0).is_err() {
            return;
        }

        let allocator = SymmetricAllocator::cuda(SymmMemConfig::default()).unwrap();
        allocator
            .set_group_info(GROUP, 0, 1, Arc::new(InMemoryStore::new()))
            .unwrap();
        let ptr = allocator.alloc(4096, 0, GROUP).unwrap();
        let symm = allocator.rendezvous(ptr).unwrap();

        assert_eq!(symm.get_world_size(), 1);
        assert_ne!(symm.get_buffer_ptrs_dev(), 0);
        symm.put_signal(0, 0).unwrap();
        symm.wait_signal(0, 0).unwrap();
        symm.barrier(1).unwrap();
        allocator.driver().synchronize(0).unwrap();
    }
}
