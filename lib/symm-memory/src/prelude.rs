// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

pub use super::MemoryDescriptor;
pub use super::allocator::{SymmetricAllocator, SymmetricMemoryAllocator};
pub use super::store::CoordinationStore;
pub use super::symmetric::SymmetricMemory;
pub use super::tensor::{DType, TensorDescriptor, TensorDescriptorExt};
