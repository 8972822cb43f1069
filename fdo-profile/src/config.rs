// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{ProfileError, ProfileResult};

/// How 64-bit counters behave when an addition would overflow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Clamp at `u64::MAX`.
    #[default]
    Saturate,
    /// Surface [`ProfileError::CounterOverflow`].
    Fail,
}

impl OverflowPolicy {
    pub(crate) fn add(self, counter: &mut u64, data: u64) -> ProfileResult<()> {
        match self {
            OverflowPolicy::Saturate => {
                *counter = counter.saturating_add(data);
                Ok(())
            }
            OverflowPolicy::Fail => {
                *counter = counter
                    .checked_add(data)
                    .ok_or(ProfileError::CounterOverflow)?;
                Ok(())
            }
        }
    }
}

/// Pipeline-wide knobs. Passed explicitly through constructors; there is no
/// process-global state.
#[derive(Clone, Debug, Default)]
pub struct DecoderConfig {
    /// Emit per-stage statistics at `debug` level.
    pub verbose: bool,
    pub overflow: OverflowPolicy,
    /// Local (non-unique) symbols can legitimately appear more than once in
    /// a binary. With this set, re-observing such a name with different
    /// bounds coalesces the extra copy into stub locations instead of
    /// failing with [`ProfileError::FunctionBoundaryDrift`].
    pub ignore_local_dup: bool,
    /// Allow merging profiles whose build ids differ.
    pub ignore_buildid: bool,
}
