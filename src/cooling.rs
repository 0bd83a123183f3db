// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::Result;

/// The contract a thermal governor drives.
///
/// States run from 0 (no throttling) to `max_state()`.
pub trait CoolingDevice: Send + Sync {
    fn name(&self) -> String;

    fn max_state(&self) -> u32;

    /// Current state, or `None` when the device cannot tell right now.
    fn cur_state(&self) -> Option<u32>;

    /// Request a new state. States above `max_state()` are clamped.
    fn set_cur_state(&self, state: u32) -> Result<()>;
}
