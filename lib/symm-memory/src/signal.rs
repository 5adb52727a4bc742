// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Signal pad layout and the host-side signal primitives.
//!
//! Every mapped block ends with a fixed-size signal pad. The pad is viewed as
//! `channel_count` channels, each holding one `u32` slot per peer rank:
//!
//! ```text
//! pad[r]: | ch 0: peer 0 | peer 1 | ... | peer N-1 | ch 1: peer 0 | ... |
//!         byte offset of (channel, peer) = (channel * N + peer) * 4
//! ```
//!
//! Slot `(channel, peer)` in rank `r`'s pad is written by `peer` and consumed
//! by `r`. A slot only ever moves 0 -> 1 (release) and 1 -> 0 (acquire).

use std::sync::atomic::{AtomicU32, Ordering, fence};

use crate::{Result, SymmMemError};

/// Size of one signal slot in bytes.
pub const SIGNAL_SLOT_SIZE: usize = std::mem::size_of::<u32>();

/// Geometry of a signal pad for a given world size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalPadLayout {
    pad_size: usize,
    world_size: usize,
}

impl SignalPadLayout {
    /// Creates the layout of a `pad_size`-byte pad shared by `world_size` ranks.
    pub fn new(pad_size: usize, world_size: usize) -> Self {
        debug_assert!(world_size > 0);
        Self {
            pad_size,
            world_size,
        }
    }

    /// Size of the pad in bytes.
    pub fn pad_size(&self) -> usize {
        self.pad_size
    }

    /// Number of ranks sharing the pad.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Number of independent channels available.
    pub fn channel_count(&self) -> usize {
        self.pad_size / SIGNAL_SLOT_SIZE / self.world_size
    }

    /// Validates `channel`, returning it as an index.
    pub fn check_channel(&self, channel: i32) -> Result<usize> {
        let channel_count = self.channel_count();
        match usize::try_from(channel) {
            Ok(idx) if idx < channel_count => Ok(idx),
            _ => Err(SymmMemError::ChannelOutOfRange {
                channel,
                channel_count,
                world_size: self.world_size,
            }),
        }
    }

    /// Validates that `rank` names a member of the group.
    pub fn check_rank(&self, rank: usize) -> Result<()> {
        if rank < self.world_size {
            Ok(())
        } else {
            Err(SymmMemError::RankOutOfRange {
                rank,
                world_size: self.world_size,
            })
        }
    }

    /// Byte offset of slot `(channel, peer)` from the start of a pad.
    #[inline]
    pub fn slot_offset(&self, channel: usize, peer: usize) -> usize {
        (channel * self.world_size + peer) * SIGNAL_SLOT_SIZE
    }

    /// Index of slot `(channel, peer)` when the pad is viewed as `[u32]`.
    #[inline]
    pub fn slot_index(&self, channel: usize, peer: usize) -> usize {
        channel * self.world_size + peer
    }
}

/// Posts a signal: spins until the slot reads 0, then moves it to 1.
///
/// # Safety
/// `slot` must point to a live, 4-byte aligned signal slot that is only
/// accessed through [`release_signal`] and [`acquire_signal`].
pub unsafe fn release_signal(slot: *mut u32) {
    // SAFETY: caller guarantees the slot is valid and aligned for AtomicU32.
    let slot = unsafe { AtomicU32::from_ptr(slot) };
    while slot
        .compare_exchange_weak(0, 1, Ordering::Release, Ordering::Relaxed)
        .is_err()
    {
        std::hint::spin_loop();
    }
}

/// Consumes a signal: spins until the slot reads 1, then resets it to 0.
///
/// # Safety
/// Same contract as [`release_signal`].
pub unsafe fn acquire_signal(slot: *mut u32) {
    // SAFETY: caller guarantees the slot is valid and aligned for AtomicU32.
    let slot = unsafe { AtomicU32::from_ptr(slot) };
    while slot
        .compare_exchange_weak(1, 0, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        std::hint::spin_loop();
    }
}

/// System-wide fence issued after a wait completes.
#[inline]
pub fn system_fence() {
    fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;

    #[rstest]
    #[case(1, 512)]
    #[case(2, 256)]
    #[case(4, 128)]
    #[case(8, 64)]
    #[case(3, 170)]
    fn test_channel_count(#[case] world_size: usize, #[case] expected: usize) {
        let layout = SignalPadLayout::new(2048, world_size);
        assert_eq!(layout.channel_count(), expected);
    }

    #[test]
    fn test_slot_offset_is_channel_major() {
        let layout = SignalPadLayout::new(2048, 4);
        assert_eq!(layout.slot_offset(0, 0), 0);
        assert_eq!(layout.slot_offset(0, 3), 12);
        assert_eq!(layout.slot_offset(1, 0), 16);
        assert_eq!(layout.slot_offset(2, 1), 2 * 4 * 4 + 4);
        assert_eq!(layout.slot_index(2, 1) * SIGNAL_SLOT_SIZE, layout.slot_offset(2, 1));
    }

    #[test]
    fn test_check_channel_boundaries() {
        let layout = SignalPadLayout::new(2048, 8);
        assert_eq!(layout.check_channel(0).unwrap(), 0);
        assert_eq!(layout.check_channel(63).unwrap(), 63);
        assert!(matches!(
            layout.check_channel(64),
            Err(SymmMemError::ChannelOutOfRange {
                channel: 64,
                channel_count: 64,
                world_size: 8
            })
        ));
        assert!(layout.check_channel(-1).is_err());
    }

    #[test]
    fn test_check_rank() {
        let layout = SignalPadLayout::new(2048, 2);
        assert!(layout.check_rank(1).is_ok());
        assert!(matches!(
            layout.check_rank(2),
            Err(SymmMemError::RankOutOfRange { rank: 2, world_size: 2 })
        ));
    }

    proptest! {
        /// Property: check_channel accepts exactly the half-open range [0, channel_count).
        #[test]
        fn prop_check_channel_half_open_range(
            world_size in 1usize..=32,
            pad_words in 1usize..=1024,
            channel in -64i32..2048,
        ) {
            let layout = SignalPadLayout::new(pad_words * SIGNAL_SLOT_SIZE, world_size);
            let count = layout.channel_count();
            let accepted = layout.check_channel(channel).is_ok();
            prop_assert_eq!(accepted, channel >= 0 && (channel as usize) < count);
        }
    }

    #[test]
    fn test_release_then_acquire_resets_slot() {
        let mut slot: u32 = 0;
        unsafe {
            release_signal(&mut slot);
        }
        assert_eq!(slot, 1);
        unsafe {
            acquire_signal(&mut slot);
        }
        assert_eq!(slot, 0);
    }

    #[test]
    fn test_release_blocks_until_consumed() {
        let slot = Arc::new(AtomicU32::new(1));
        let released = Arc::new(AtomicU32::new(0));

        let handle = {
            let slot = slot.clone();
            let released = released.clone();
            std::thread::spawn(move || {
                unsafe { release_signal(slot.as_ptr()) };
                released.store(1, Ordering::SeqCst);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(released.load(Ordering::SeqCst), 0);

        unsafe { acquire_signal(slot.as_ptr()) };
        handle.join().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(slot.load(Ordering::SeqCst), 1);
    }
}
