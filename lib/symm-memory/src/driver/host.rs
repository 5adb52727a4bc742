// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host shared memory driver backed by memfd.
//!
//! Each physical allocation is an anonymous memfd. Mapping uses
//! `mmap(MAP_SHARED)`, so two mappings of the same memfd (even in different
//! processes) observe each other's writes. Signal primitives execute
//! synchronously on the calling thread with host atomics.

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{DeviceDriver, MemHandle, SignalPads};
use crate::signal::{SIGNAL_SLOT_SIZE, acquire_signal, release_signal, system_fence};
use crate::{DeviceKind, Result, StorageKind, SymmMemError};

const MEMFD_NAME: &CStr = c"dynamo-symm-mem";

/// Driver for host shared memory.
#[derive(Debug)]
pub struct HostDriver {
    handles: Mutex<HashMap<MemHandle, OwnedFd>>,
    next_handle: AtomicU64,
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDriver {
    /// Creates a driver with an empty handle table.
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Number of physical allocations currently held.
    pub fn live_handles(&self) -> usize {
        self.handles.lock().len()
    }

    fn insert(&self, fd: OwnedFd) -> MemHandle {
        let handle = MemHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.handles.lock().insert(handle, fd);
        handle
    }

    fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }
}

impl DeviceDriver for HostDriver {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Host
    }

    fn storage_kind(&self, _device: usize) -> StorageKind {
        StorageKind::System
    }

    fn check_support(&self, _device: usize) -> std::result::Result<(), String> {
        Ok(())
    }

    fn granularity(&self, _device: usize) -> Result<usize> {
        Ok(Self::page_size())
    }

    fn create(&self, _device: usize, size: usize) -> Result<MemHandle> {
        if size == 0 {
            return Err(SymmMemError::AllocationFailed(
                "zero-sized allocations are not supported".into(),
            ));
        }

        // SAFETY: MEMFD_NAME is a valid NUL-terminated string.
        let fd = unsafe { libc::memfd_create(MEMFD_NAME.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(SymmMemError::AllocationFailed(format!(
                "memfd_create failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: memfd_create returned a fresh descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: fd is a valid memfd.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(SymmMemError::AllocationFailed(format!(
                "ftruncate to {} bytes failed: {}",
                size,
                std::io::Error::last_os_error()
            )));
        }

        Ok(self.insert(fd))
    }

    fn map(&self, _device: usize, handle: MemHandle, size: usize) -> Result<u64> {
        let handles = self.handles.lock();
        let fd = handles
            .get(&handle)
            .ok_or_else(|| SymmMemError::OperationFailed(format!("unknown handle {:?}", handle)))?;

        // SAFETY: mapping a valid memfd with a non-zero length; the kernel picks the address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(SymmMemError::AllocationFailed(format!(
                "mmap of {} bytes failed: {}",
                size,
                std::io::Error::last_os_error()
            )));
        }
        Ok(ptr as u64)
    }

    fn unmap(&self, _device: usize, ptr: u64, size: usize) -> Result<()> {
        // SAFETY: ptr/size describe a mapping created by `map`.
        if unsafe { libc::munmap(ptr as *mut libc::c_void, size) } != 0 {
            return Err(SymmMemError::OperationFailed(format!(
                "munmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn release(&self, handle: MemHandle) -> Result<()> {
        self.handles
            .lock()
            .remove(&handle)
            .map(drop)
            .ok_or_else(|| SymmMemError::OperationFailed(format!("unknown handle {:?}", handle)))
    }

    fn memset_zero(&self, _device: usize, ptr: u64, size: usize) -> Result<()> {
        // SAFETY: ptr/size describe a live writable mapping.
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, size) };
        Ok(())
    }

    fn export_handle(&self, handle: MemHandle) -> Result<OwnedFd> {
        let handles = self.handles.lock();
        let fd = handles
            .get(&handle)
            .ok_or_else(|| SymmMemError::OperationFailed(format!("unknown handle {:?}", handle)))?;
        Ok(fd.try_clone()?)
    }

    fn import_handle(&self, _device: usize, fd: BorrowedFd<'_>) -> Result<MemHandle> {
        Ok(self.insert(fd.try_clone_to_owned()?))
    }

    fn upload_table(&self, _device: usize, values: &[u64]) -> Result<u64> {
        let table: Box<[u64]> = values.into();
        Ok(Box::into_raw(table) as *mut u64 as u64)
    }

    fn free_table(&self, _device: usize, ptr: u64, len: usize) -> Result<()> {
        // SAFETY: ptr/len came from `upload_table`, which leaked a Box<[u64]> of that length.
        drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr as *mut u64, len)) });
        Ok(())
    }

    fn synchronize(&self, _device: usize) -> Result<()> {
        system_fence();
        Ok(())
    }

    fn put_signal(&self, pads: &SignalPads<'_>, dst_rank: usize, channel: usize) -> Result<()> {
        let slot = channel * pads.world_size + pads.rank;
        // SAFETY: the pad belongs to a live rendezvoused mapping and the slot is in range.
        unsafe { release_signal(pads.slot_addr(dst_rank, slot) as *mut u32) };
        Ok(())
    }

    fn wait_signal(&self, pads: &SignalPads<'_>, src_rank: usize, channel: usize) -> Result<()> {
        let slot = channel * pads.world_size + src_rank;
        // SAFETY: as above.
        unsafe { acquire_signal(pads.slot_addr(pads.rank, slot) as *mut u32) };
        system_fence();
        Ok(())
    }

    fn barrier(&self, pads: &SignalPads<'_>, channel: usize) -> Result<()> {
        // The lanes of the device kernel run here one after another: post to
        // every peer first, then consume every peer's post.
        for target in 0..pads.world_size {
            let slot = channel * pads.world_size + pads.rank;
            // SAFETY: as above.
            unsafe { release_signal(pads.slot_addr(target, slot) as *mut u32) };
        }
        for target in 0..pads.world_size {
            let slot = channel * pads.world_size + target;
            // SAFETY: as above.
            unsafe { acquire_signal(pads.slot_addr(pads.rank, slot) as *mut u32) };
        }
        Ok(())
    }

    fn write_value32(&self, _device: usize, addr: u64, value: u32) -> Result<()> {
        if !(addr as usize).is_multiple_of(SIGNAL_SLOT_SIZE) {
            return Err(SymmMemError::OperationFailed(format!(
                "write_value32: address {:#x} is not 4-byte aligned",
                addr
            )));
        }
        // SAFETY: addr is aligned and points into a live mapping.
        unsafe { AtomicU32::from_ptr(addr as *mut u32) }.store(value, Ordering::Release);
        Ok(())
    }

    fn memset32(&self, _device: usize, addr: u64, value: u32, count: usize) -> Result<()> {
        if !(addr as usize).is_multiple_of(SIGNAL_SLOT_SIZE) {
            return Err(SymmMemError::OperationFailed(format!(
                "memset32: address {:#x} is not 4-byte aligned",
                addr
            )));
        }
        // SAFETY: addr is aligned and `count` words lie within a live mapping.
        let words = unsafe { std::slice::from_raw_parts_mut(addr as *mut u32, count) };
        words.fill(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn test_create_map_zeroed() {
        let driver = HostDriver::new();
        let size = driver.granularity(0).unwrap();
        let handle = driver.create(0, size).unwrap();
        let ptr = driver.map(0, handle, size).unwrap();
        assert_ne!(ptr, 0);

        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, size) };
        assert!(bytes.iter().all(|&b| b == 0));

        driver.unmap(0, ptr, size).unwrap();
        driver.release(handle).unwrap();
        assert_eq!(driver.live_handles(), 0);
    }

    #[test]
    fn test_zero_size_fails() {
        let driver = HostDriver::new();
        assert!(driver.create(0, 0).is_err());
    }

    #[test]
    fn test_exported_handle_shares_memory() {
        let driver = HostDriver::new();
        let size = driver.granularity(0).unwrap();
        let handle = driver.create(0, size).unwrap();
        let local = driver.map(0, handle, size).unwrap();

        let exported = driver.export_handle(handle).unwrap();
        let imported = driver.import_handle(1, exported.as_fd()).unwrap();
        drop(exported);
        let remote = driver.map(1, imported, size).unwrap();
        assert_ne!(local, remote);

        unsafe { *(local as *mut u32) = 0xdead_beef };
        assert_eq!(unsafe { *(remote as *const u32) }, 0xdead_beef);

        driver.unmap(1, remote, size).unwrap();
        driver.unmap(0, local, size).unwrap();
        driver.release(imported).unwrap();
        driver.release(handle).unwrap();
    }

    #[test]
    fn test_release_unknown_handle_fails() {
        let driver = HostDriver::new();
        assert!(driver.release(MemHandle(42)).is_err());
    }

    #[test]
    fn test_upload_table_roundtrip() {
        let driver = HostDriver::new();
        let values = [1u64, 2, 3];
        let ptr = driver.upload_table(0, &values).unwrap();
        let table = unsafe { std::slice::from_raw_parts(ptr as *const u64, 3) };
        assert_eq!(table, &values);
        driver.free_table(0, ptr, 3).unwrap();
    }

    #[test]
    fn test_memset32_and_write_value32() {
        let driver = HostDriver::new();
        let mut words = vec![0u32; 8];
        let addr = words.as_mut_ptr() as u64;

        driver.memset32(0, addr, 7, 8).unwrap();
        driver.write_value32(0, addr + 4, 9).unwrap();
        assert_eq!(words, vec![7, 9, 7, 7, 7, 7, 7, 7]);

        assert!(driver.write_value32(0, addr + 1, 1).is_err());
    }
}
