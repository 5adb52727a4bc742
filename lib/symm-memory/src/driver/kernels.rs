// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Signal kernels for CUDA devices.
//!
//! Compiled with NVRTC for the device's compute capability on first use and
//! cached per device ordinal.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use cudarc::driver::sys::CUdevice_attribute_enum;
use cudarc::driver::{CudaContext, CudaFunction, CudaStream, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::{CompileOptions, compile_ptx_with_opts};
use parking_lot::Mutex;

use crate::Result;

/// One warp; the barrier uses lane `t` for peer `t`.
pub(crate) const LANES: u32 = 32;

const SIGNAL_KERNEL_SRC: &str = r#"
__device__ __forceinline__ unsigned int cas_sys(unsigned int* addr, unsigned int compare, unsigned int val) {
#if defined(__CUDA_ARCH__) && (__CUDA_ARCH__ >= 600)
    return atomicCAS_system(addr, compare, val);
#else
    return atomicCAS(addr, compare, val);
#endif
}

__device__ __forceinline__ void release_signal(unsigned int* addr) {
    while (cas_sys(addr, 0u, 1u) != 0u) {
    }
}

__device__ __forceinline__ void acquire_signal(unsigned int* addr) {
    while (cas_sys(addr, 1u, 0u) != 1u) {
    }
}

extern "C" __global__ void put_signal_kernel(
    const unsigned long long* pads, int rank, int world_size, int channel, int dst_rank) {
    if (threadIdx.x == 0) {
        __threadfence_system();
        unsigned int* pad = reinterpret_cast<unsigned int*>(pads[dst_rank]);
        release_signal(pad + channel * world_size + rank);
    }
}

extern "C" __global__ void wait_signal_kernel(
    const unsigned long long* pads, int rank, int world_size, int channel, int src_rank) {
    if (threadIdx.x == 0) {
        unsigned int* pad = reinterpret_cast<unsigned int*>(pads[rank]);
        acquire_signal(pad + channel * world_size + src_rank);
    }
    __threadfence_system();
}

extern "C" __global__ void barrier_kernel(
    const unsigned long long* pads, int rank, int world_size, int channel) {
    int target = threadIdx.x;
    if (target < world_size) {
        __threadfence_system();
        unsigned int* remote = reinterpret_cast<unsigned int*>(pads[target]);
        release_signal(remote + channel * world_size + rank);
        unsigned int* local = reinterpret_cast<unsigned int*>(pads[rank]);
        acquire_signal(local + channel * world_size + target);
    }
    __threadfence_system();
}

extern "C" __global__ void write_value32_kernel(unsigned int* addr, unsigned int value) {
    if (threadIdx.x == 0) {
        __threadfence_system();
        *reinterpret_cast<volatile unsigned int*>(addr) = value;
        __threadfence_system();
    }
}
"#;

/// Loaded signal kernels for one device.
#[derive(Debug)]
pub(crate) struct SignalKernels {
    put_signal: CudaFunction,
    wait_signal: CudaFunction,
    barrier: CudaFunction,
    write_value32: CudaFunction,
}

impl SignalKernels {
    /// Returns the kernels for `ctx`'s device, compiling them on first use.
    pub(crate) fn for_context(ctx: &Arc<CudaContext>) -> Result<Arc<Self>> {
        static INSTANCES: OnceLock<Mutex<HashMap<usize, Arc<SignalKernels>>>> = OnceLock::new();
        let instances = INSTANCES.get_or_init(|| Mutex::new(HashMap::new()));

        let ordinal = ctx.ordinal();
        if let Some(kernels) = instances.lock().get(&ordinal) {
            return Ok(Arc::clone(kernels));
        }

        let kernels = Arc::new(Self::compile(ctx)?);
        Ok(Arc::clone(
            instances.lock().entry(ordinal).or_insert(kernels),
        ))
    }

    fn compile(ctx: &Arc<CudaContext>) -> Result<Self> {
        let major =
            ctx.attribute(CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        let minor =
            ctx.attribute(CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;

        let mut compile_opts = CompileOptions {
            name: Some("symm_mem_signal.cu".into()),
            ..Default::default()
        };
        compile_opts
            .options
            .push(format!("--gpu-architecture=compute_{}{}", major, minor));

        let ptx = compile_ptx_with_opts(SIGNAL_KERNEL_SRC, compile_opts)?;
        let module = ctx.load_module(ptx)?;
        tracing::debug!(
            device = ctx.ordinal(),
            arch = %format_args!("compute_{}{}", major, minor),
            "compiled signal kernels"
        );

        Ok(Self {
            put_signal: module.load_function("put_signal_kernel")?,
            wait_signal: module.load_function("wait_signal_kernel")?,
            barrier: module.load_function("barrier_kernel")?,
            write_value32: module.load_function("write_value32_kernel")?,
        })
    }

    fn launch_config() -> LaunchConfig {
        LaunchConfig {
            grid_dim: (1, 1, 1),
            block_dim: (LANES, 1, 1),
            shared_mem_bytes: 0,
        }
    }

    pub(crate) fn put_signal(
        &self,
        stream: &Arc<CudaStream>,
        table: u64,
        rank: i32,
        world_size: i32,
        channel: i32,
        dst_rank: i32,
    ) -> Result<()> {
        let mut launch = stream.launch_builder(&self.put_signal);
        launch
            .arg(&table)
            .arg(&rank)
            .arg(&world_size)
            .arg(&channel)
            .arg(&dst_rank);
        // SAFETY: argument types match the kernel signature and `table` points
        // to a live device table of `world_size` pad pointers.
        unsafe { launch.launch(Self::launch_config()) }?;
        Ok(())
    }

    pub(crate) fn wait_signal(
        &self,
        stream: &Arc<CudaStream>,
        table: u64,
        rank: i32,
        world_size: i32,
        channel: i32,
        src_rank: i32,
    ) -> Result<()> {
        let mut launch = stream.launch_builder(&self.wait_signal);
        launch
            .arg(&table)
            .arg(&rank)
            .arg(&world_size)
            .arg(&channel)
            .arg(&src_rank);
        // SAFETY: as in `put_signal`.
        unsafe { launch.launch(Self::launch_config()) }?;
        Ok(())
    }

    pub(crate) fn barrier(
        &self,
        stream: &Arc<CudaStream>,
        table: u64,
        rank: i32,
        world_size: i32,
        channel: i32,
    ) -> Result<()> {
        let mut launch = stream.launch_builder(&self.barrier);
        launch
            .arg(&table)
            .arg(&rank)
            .arg(&world_size)
            .arg(&channel);
        // SAFETY: as in `put_signal`.
        unsafe { launch.launch(Self::launch_config()) }?;
        Ok(())
    }

    pub(crate) fn write_value32(&self, stream: &Arc<CudaStream>, addr: u64, value: u32) -> Result<()> {
        let mut launch = stream.launch_builder(&self.write_value32);
        launch.arg(&addr).arg(&value);
        // SAFETY: `addr` is a 4-byte aligned address mapped on this device.
        unsafe { launch.launch(Self::launch_config()) }?;
        Ok(())
    }
}
