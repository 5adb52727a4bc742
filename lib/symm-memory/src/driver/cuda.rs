// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! CUDA driver built on the virtual memory management API.
//!
//! Physical allocations are created with `cuMemCreate` and are exportable as
//! POSIX file descriptors. Each mapping reserves its own virtual range, so the
//! local block and every imported peer block live at distinct addresses.

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use cudarc::driver::result::{free_sync, malloc_sync, memcpy_htod_sync};
use cudarc::driver::sys::{self, CUdevice_attribute_enum};
use cudarc::driver::{CudaContext, CudaStream};
use parking_lot::Mutex;

use super::kernels::SignalKernels;
use super::{DeviceDriver, MemHandle, SignalPads};
use crate::{DeviceKind, Result, StorageKind, SymmMemError};

const MIN_COMPUTE_MAJOR: i32 = 6;

/// Driver for CUDA devices.
#[derive(Debug, Default)]
pub struct CudaDriver {
    contexts: Mutex<HashMap<usize, Arc<CudaContext>>>,
}

impl CudaDriver {
    /// Creates a driver. Contexts are created lazily per device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of CUDA devices visible to this process.
    pub fn device_count() -> Result<usize> {
        Ok(CudaContext::device_count()? as usize)
    }

    /// Returns the primary context of `device`, bound to the calling thread.
    pub fn context(&self, device: usize) -> Result<Arc<CudaContext>> {
        let ctx = {
            let mut contexts = self.contexts.lock();
            match contexts.get(&device) {
                Some(ctx) => ctx.clone(),
                None => {
                    let ctx = CudaContext::new(device)?;
                    contexts.insert(device, ctx.clone());
                    ctx
                }
            }
        };
        ctx.bind_to_thread()?;
        Ok(ctx)
    }

    fn stream(&self, device: usize) -> Result<Arc<CudaStream>> {
        Ok(self.context(device)?.default_stream())
    }

    fn kernels(&self, device: usize) -> Result<(Arc<CudaStream>, Arc<SignalKernels>)> {
        let ctx = self.context(device)?;
        let kernels = SignalKernels::for_context(&ctx)?;
        Ok((ctx.default_stream(), kernels))
    }

    fn allocation_prop(device: usize) -> sys::CUmemAllocationProp {
        // SAFETY: CUmemAllocationProp is a plain C struct; all-zero is a valid starting point.
        let mut prop: sys::CUmemAllocationProp = unsafe { std::mem::zeroed() };
        prop.type_ = sys::CUmemAllocationType::CU_MEM_ALLOCATION_TYPE_PINNED;
        prop.requestedHandleTypes =
            sys::CUmemAllocationHandleType::CU_MEM_HANDLE_TYPE_POSIX_FILE_DESCRIPTOR;
        prop.location.type_ = sys::CUmemLocationType::CU_MEM_LOCATION_TYPE_DEVICE;
        prop.location.id = device as i32;
        prop
    }
}

impl DeviceDriver for CudaDriver {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cuda
    }

    fn storage_kind(&self, device: usize) -> StorageKind {
        StorageKind::Device(device as u32)
    }

    fn check_support(&self, device: usize) -> std::result::Result<(), String> {
        let ctx = self
            .context(device)
            .map_err(|e| format!("failed to create CUDA context on device {}: {}", device, e))?;

        let attribute = |attr: CUdevice_attribute_enum| {
            ctx.attribute(attr)
                .map_err(|e| format!("failed to query {:?}: {}", attr, e))
        };

        if attribute(CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_VIRTUAL_MEMORY_MANAGEMENT_SUPPORTED)?
            == 0
        {
            return Err(format!(
                "device {} does not support virtual memory management",
                device
            ));
        }
        if attribute(
            CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_HANDLE_TYPE_POSIX_FILE_DESCRIPTOR_SUPPORTED,
        )? == 0
        {
            return Err(format!(
                "device {} cannot export POSIX file descriptor handles",
                device
            ));
        }
        let major = attribute(CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        if major < MIN_COMPUTE_MAJOR {
            return Err(format!(
                "device {} has compute capability {}.x; system-scope atomics need {}.0+",
                device, major, MIN_COMPUTE_MAJOR
            ));
        }
        Ok(())
    }

    fn granularity(&self, device: usize) -> Result<usize> {
        self.context(device)?;
        let prop = Self::allocation_prop(device);
        let mut granularity = 0usize;
        // SAFETY: both pointers reference live stack values.
        unsafe {
            sys::cuMemGetAllocationGranularity(
                &mut granularity,
                &prop,
                sys::CUmemAllocationGranularity_flags::CU_MEM_ALLOC_GRANULARITY_RECOMMENDED,
            )
            .result()?;
        }
        Ok(granularity)
    }

    fn create(&self, device: usize, size: usize) -> Result<MemHandle> {
        self.context(device)?;
        let prop = Self::allocation_prop(device);
        let mut handle: sys::CUmemGenericAllocationHandle = 0;
        // SAFETY: `handle` and `prop` are live; `size` is a granularity multiple.
        unsafe {
            sys::cuMemCreate(&mut handle, size, &prop, 0)
                .result()
                .map_err(|e| {
                    SymmMemError::AllocationFailed(format!(
                        "cuMemCreate of {} bytes on device {} failed: {}",
                        size, device, e
                    ))
                })?;
        }
        Ok(MemHandle(handle))
    }

    fn map(&self, device: usize, handle: MemHandle, size: usize) -> Result<u64> {
        self.context(device)?;
        let mut ptr: sys::CUdeviceptr = 0;
        // SAFETY: reserving fresh address space; no existing mapping is touched.
        unsafe { sys::cuMemAddressReserve(&mut ptr, size, 0, 0, 0).result()? };

        // SAFETY: `ptr` is a reservation of `size` bytes owned by this call.
        let mapped = unsafe { sys::cuMemMap(ptr, size, 0, handle.0, 0).result() };
        if let Err(e) = mapped {
            // SAFETY: undo the reservation made above.
            let _ = unsafe { sys::cuMemAddressFree(ptr, size).result() };
            return Err(e.into());
        }

        let access = sys::CUmemAccessDesc {
            location: sys::CUmemLocation {
                type_: sys::CUmemLocationType::CU_MEM_LOCATION_TYPE_DEVICE,
                id: device as i32,
            },
            flags: sys::CUmemAccess_flags::CU_MEM_ACCESS_FLAGS_PROT_READWRITE,
        };
        // SAFETY: `ptr` is mapped for `size` bytes.
        let granted = unsafe { sys::cuMemSetAccess(ptr, size, &access, 1).result() };
        if let Err(e) = granted {
            // SAFETY: undo the mapping and reservation made above.
            unsafe {
                let _ = sys::cuMemUnmap(ptr, size).result();
                let _ = sys::cuMemAddressFree(ptr, size).result();
            }
            return Err(e.into());
        }

        Ok(ptr)
    }

    fn unmap(&self, device: usize, ptr: u64, size: usize) -> Result<()> {
        self.context(device)?;
        // SAFETY: `ptr`/`size` describe a range returned by `map`.
        unsafe {
            sys::cuMemUnmap(ptr, size).result()?;
            sys::cuMemAddressFree(ptr, size).result()?;
        }
        Ok(())
    }

    fn release(&self, handle: MemHandle) -> Result<()> {
        // SAFETY: the handle came from `create` or `import_handle` and is released once.
        unsafe { sys::cuMemRelease(handle.0).result()? };
        Ok(())
    }

    fn memset_zero(&self, device: usize, ptr: u64, size: usize) -> Result<()> {
        self.context(device)?;
        // SAFETY: `ptr` is mapped read-write for `size` bytes on this device.
        unsafe { sys::cuMemsetD8_v2(ptr, 0, size).result()? };
        Ok(())
    }

    fn export_handle(&self, handle: MemHandle) -> Result<OwnedFd> {
        let mut fd: libc::c_int = -1;
        // SAFETY: for POSIX descriptors the shareable handle is written to an int.
        unsafe {
            sys::cuMemExportToShareableHandle(
                &mut fd as *mut libc::c_int as *mut c_void,
                handle.0,
                sys::CUmemAllocationHandleType::CU_MEM_HANDLE_TYPE_POSIX_FILE_DESCRIPTOR,
                0,
            )
            .result()?;
        }
        // SAFETY: the driver returned a fresh descriptor that we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn import_handle(&self, device: usize, fd: BorrowedFd<'_>) -> Result<MemHandle> {
        self.context(device)?;
        let mut handle: sys::CUmemGenericAllocationHandle = 0;
        // SAFETY: for POSIX descriptors the OS handle is the descriptor value itself.
        unsafe {
            sys::cuMemImportFromShareableHandle(
                &mut handle,
                fd.as_raw_fd() as usize as *mut c_void,
                sys::CUmemAllocationHandleType::CU_MEM_HANDLE_TYPE_POSIX_FILE_DESCRIPTOR,
            )
            .result()?;
        }
        Ok(MemHandle(handle))
    }

    fn upload_table(&self, device: usize, values: &[u64]) -> Result<u64> {
        self.context(device)?;
        // SAFETY: the allocation is sized for `values` and freed by `free_table`.
        unsafe {
            let ptr = malloc_sync(std::mem::size_of_val(values))?;
            if let Err(e) = memcpy_htod_sync(ptr, values) {
                let _ = free_sync(ptr);
                return Err(e.into());
            }
            Ok(ptr)
        }
    }

    fn free_table(&self, device: usize, ptr: u64, _len: usize) -> Result<()> {
        self.context(device)?;
        // SAFETY: `ptr` came from `upload_table`.
        unsafe { free_sync(ptr)? };
        Ok(())
    }

    fn synchronize(&self, device: usize) -> Result<()> {
        self.context(device)?.synchronize()?;
        Ok(())
    }

    fn put_signal(&self, pads: &SignalPads<'_>, dst_rank: usize, channel: usize) -> Result<()> {
        let (stream, kernels) = self.kernels(pads.device)?;
        kernels.put_signal(
            &stream,
            pads.device_table,
            pads.rank as i32,
            pads.world_size as i32,
            channel as i32,
            dst_rank as i32,
        )
    }

    fn wait_signal(&self, pads: &SignalPads<'_>, src_rank: usize, channel: usize) -> Result<()> {
        let (stream, kernels) = self.kernels(pads.device)?;
        kernels.wait_signal(
            &stream,
            pads.device_table,
            pads.rank as i32,
            pads.world_size as i32,
            channel as i32,
            src_rank as i32,
        )
    }

    fn barrier(&self, pads: &SignalPads<'_>, channel: usize) -> Result<()> {
        let (stream, kernels) = self.kernels(pads.device)?;
        kernels.barrier(
            &stream,
            pads.device_table,
            pads.rank as i32,
            pads.world_size as i32,
            channel as i32,
        )
    }

    fn write_value32(&self, device: usize, addr: u64, value: u32) -> Result<()> {
        if !addr.is_multiple_of(4) {
            return Err(SymmMemError::OperationFailed(format!(
                "write_value32: address {:#x} is not 4-byte aligned",
                addr
            )));
        }
        let (stream, kernels) = self.kernels(device)?;
        kernels.write_value32(&stream, addr, value)
    }

    fn memset32(&self, device: usize, addr: u64, value: u32, count: usize) -> Result<()> {
        if !addr.is_multiple_of(4) {
            return Err(SymmMemError::OperationFailed(format!(
                "memset32: address {:#x} is not 4-byte aligned",
                addr
            )));
        }
        let stream = self.stream(device)?;
        // SAFETY: `count` words at `addr` lie within a mapping on this device.
        unsafe { sys::cuMemsetD32Async(addr, value, count, stream.cu_stream()).result()? };
        Ok(())
    }
}
