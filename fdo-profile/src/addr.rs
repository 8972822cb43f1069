// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{ProfileError, ProfileResult};
use std::collections::BTreeMap;

/// A raw program-counter address in the profiled binary.
pub type Address = u64;

/// Borrowed view of one interval in an [`IntervalMap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntervalRef<'a, V> {
    pub start: Address,
    /// Exclusive upper bound.
    pub end: Address,
    pub value: &'a V,
}

/// Pairwise-disjoint half-open address intervals `[start, end)`, queryable
/// by containing address.
#[derive(Clone, Debug)]
pub struct IntervalMap<V> {
    inner: BTreeMap<Address, (Address, V)>,
}

impl<V> Default for IntervalMap<V> {
    fn default() -> Self {
        Self {
            inner: BTreeMap::new(),
        }
    }
}

impl<V> IntervalMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `[start, end) → value`. Empty and overlapping intervals are
    /// rejected; the disjointness of the map is what makes
    /// [`IntervalMap::containing`] unambiguous.
    pub fn insert(&mut self, start: Address, end: Address, value: V) -> ProfileResult<()> {
        if start >= end {
            return Err(ProfileError::internal(format!(
                "empty interval {start:#x}..{end:#x}"
            )));
        }
        if let Some((&prev_start, &(prev_end, _))) = self.inner.range(..=start).next_back() {
            if prev_end > start {
                return Err(ProfileError::internal(format!(
                    "interval {start:#x}..{end:#x} overlaps {prev_start:#x}..{prev_end:#x}"
                )));
            }
        }
        if let Some((&next_start, _)) = self.inner.range(start..).next() {
            if next_start < end {
                return Err(ProfileError::internal(format!(
                    "interval {start:#x}..{end:#x} overlaps one starting at {next_start:#x}"
                )));
            }
        }
        self.inner.insert(start, (end, value));
        Ok(())
    }

    /// The unique interval enclosing `addr`, if any.
    pub fn containing(&self, addr: Address) -> Option<IntervalRef<'_, V>> {
        let (&start, &(end, ref value)) = self.inner.range(..=addr).next_back()?;
        (addr < end).then_some(IntervalRef { start, end, value })
    }

    pub fn iter(&self) -> impl Iterator<Item = IntervalRef<'_, V>> {
        self.inner
            .iter()
            .map(|(&start, &(end, ref value))| IntervalRef { start, end, value })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
