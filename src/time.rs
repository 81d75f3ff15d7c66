// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// A Unix timestamp with second granularity, as stored in on-disk records.
#[repr(C)]
#[derive(
    Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, FromZeroes, FromBytes, AsBytes,
)]
pub struct UnixTime {
    pub sec: u32,
}

impl UnixTime {
    pub const ZERO: UnixTime = UnixTime { sec: 0 };

    pub const fn new(sec: u32) -> Self {
        Self { sec }
    }
}

/// A source of wall-clock time.
///
/// The driver stamps inode timestamps on creation and modification but has
/// no clock of its own; the mounting layer injects one.
pub trait RealTimeClock: Send + Sync {
    /// Returns the current wall-clock time.
    fn now(&self) -> UnixTime;
}
