// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Typed, shaped views into symmetric memory.
//!
//! A tensor is memory with shape, stride, and element size metadata.
//! [`SymmetricTensor`] borrows the [`SymmetricMemory`](crate::SymmetricMemory)
//! it was carved from and never owns the underlying mapping.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::symmetric::SymmetricMemory;
use crate::{MemoryDescriptor, Result, StorageKind, SymmMemError};

/// Element type of a tensor view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum DType {
    U8,
    I8,
    U16,
    I16,
    F16,
    BF16,
    U32,
    I32,
    F32,
    U64,
    I64,
    F64,
}

impl DType {
    /// Number of bytes per element.
    pub const fn element_size(self) -> usize {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 | DType::F16 | DType::BF16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }
}

/// A tensor is memory with shape, stride, and element size metadata.
///
/// - `shape()` returns the number of elements in each dimension
/// - `stride()` returns the number of elements to skip when incrementing each dimension
/// - `element_size()` returns the number of bytes per element
pub trait TensorDescriptor: MemoryDescriptor {
    /// Shape of the tensor (number of elements per dimension).
    fn shape(&self) -> &[usize];

    /// Stride of the tensor (elements to skip per dimension).
    fn stride(&self) -> &[usize];

    /// Number of bytes per element.
    fn element_size(&self) -> usize;
}

/// Extension trait providing helper methods for tensor descriptors.
pub trait TensorDescriptorExt: TensorDescriptor {
    /// Total number of elements in the tensor (product of shape).
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Number of dimensions.
    fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Check if tensor is contiguous in memory (row-major/C order).
    fn is_contiguous(&self) -> bool {
        self.stride() == contiguous_stride(self.shape()).as_slice()
    }

    /// Returns the CUDA device ID if the tensor is on a CUDA device.
    fn cuda_device_id(&self) -> Option<usize> {
        self.storage_kind().cuda_device_index().map(|idx| idx as usize)
    }
}

impl<T: TensorDescriptor + ?Sized> TensorDescriptorExt for T {}

/// Row-major stride for `shape`.
pub(crate) fn contiguous_stride(shape: &[usize]) -> Vec<usize> {
    let mut stride = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        stride[i] = stride[i + 1] * shape[i + 1];
    }
    stride
}

/// Checks that `shape` of `dtype`, starting `storage_offset` elements in,
/// fits in `available` bytes. Returns the byte offset of the view.
pub(crate) fn check_view(
    shape: &[usize],
    dtype: DType,
    storage_offset: usize,
    available: usize,
) -> Result<usize> {
    let overflow = || SymmMemError::BufferTooLarge {
        requested: usize::MAX,
        available,
    };
    let numel = shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(overflow)?;
    let requested = numel
        .checked_add(storage_offset)
        .and_then(|elems| elems.checked_mul(dtype.element_size()))
        .ok_or_else(overflow)?;

    if requested > available {
        return Err(SymmMemError::BufferTooLarge {
            requested,
            available,
        });
    }
    Ok(storage_offset * dtype.element_size())
}

/// Non-owning view of one rank's region in a [`SymmetricMemory`].
#[derive(Debug, Clone)]
pub struct SymmetricTensor<'a> {
    addr: u64,
    shape: Vec<usize>,
    stride: Vec<usize>,
    dtype: DType,
    storage: StorageKind,
    _owner: PhantomData<&'a SymmetricMemory>,
}

impl SymmetricTensor<'_> {
    pub(crate) fn new(addr: u64, shape: &[usize], dtype: DType, storage: StorageKind) -> Self {
        Self {
            addr,
            shape: shape.to_vec(),
            stride: contiguous_stride(shape),
            dtype,
            storage,
            _owner: PhantomData,
        }
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Address of the first element, valid in this process.
    pub fn data_ptr(&self) -> u64 {
        self.addr
    }
}

impl MemoryDescriptor for SymmetricTensor<'_> {
    fn addr(&self) -> usize {
        self.addr as usize
    }

    fn size(&self) -> usize {
        self.numel() * self.dtype.element_size()
    }

    fn storage_kind(&self) -> StorageKind {
        self.storage
    }
}

impl TensorDescriptor for SymmetricTensor<'_> {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn stride(&self) -> &[usize] {
        &self.stride
    }

    fn element_size(&self) -> usize {
        self.dtype.element_size()
    }
}
