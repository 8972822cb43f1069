// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::addr::Address;
use crate::collections::{FxIndexMap, FxIndexSet};
use crate::config::OverflowPolicy;
use crate::error::{ProfileError, ProfileResult};
use crate::raw::parser::{BranchRecord, Mispredict, PidFilter, Sample, SampleReader};
use log::{debug, warn};
use std::hash::Hash;
use std::io::BufRead;

/// Dense counters over one or more runs of the profiled binary.
///
/// Aggregation across samples is commutative (counter additions keyed by
/// address tuples), so the result is independent of sample presentation
/// order. Within a single sample the branch stack is walked chronologically.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatedRawProfile {
    /// Sampled instruction pointer → occurrence count.
    pub instructions: FxIndexMap<Address, u64>,
    /// Taken branch (from, to) → occurrence count.
    pub branches: FxIndexMap<(Address, Address), u64>,
    /// Mispredicted subset of `branches`.
    pub mispredicts: FxIndexMap<(Address, Address), u64>,
    /// Inferred straight-line execution between consecutive branch records:
    /// (previous target, next source) → occurrence count.
    pub traces: FxIndexMap<(Address, Address), u64>,
    /// Backwards fall-throughs (`prev.to >= cur.from`). Kept out of
    /// `traces`; the partition step charges them to the enclosing
    /// function's malformed-trace counter.
    pub malformed_traces: FxIndexMap<(Address, Address), u64>,
    /// Opaque identifier of the binary these samples were taken from.
    pub buildid: Option<String>,
    overflow: OverflowPolicy,
}

impl AggregatedRawProfile {
    pub fn new(overflow: OverflowPolicy) -> Self {
        Self {
            instructions: FxIndexMap::default(),
            branches: FxIndexMap::default(),
            mispredicts: FxIndexMap::default(),
            traces: FxIndexMap::default(),
            malformed_traces: FxIndexMap::default(),
            buildid: None,
            overflow,
        }
    }

    pub fn with_buildid(overflow: OverflowPolicy, buildid: Option<String>) -> Self {
        Self {
            buildid,
            ..Self::new(overflow)
        }
    }

    /// Drain a sample stream into a fresh profile. The reader's handle is
    /// scoped to this call; returns the profile together with the number of
    /// ignored (malformed) lines.
    pub fn read_and_aggregate<R: BufRead>(
        input: R,
        filter: PidFilter,
        overflow: OverflowPolicy,
        buildid: Option<String>,
    ) -> ProfileResult<(Self, u64)> {
        let mut profile = Self::with_buildid(overflow, buildid);
        let mut reader = SampleReader::new(input, filter);
        for sample in reader.by_ref() {
            profile.aggregate(&sample?)?;
        }
        let ignored = reader.ignored();
        if ignored > 0 {
            debug!("ignored {ignored} malformed sample lines");
        }
        Ok((profile, ignored))
    }

    /// Fold one sample into the counters.
    pub fn aggregate(&mut self, sample: &Sample) -> ProfileResult<()> {
        let overflow = self.overflow;
        bump(&mut self.instructions, overflow, sample.ip, 1)?;

        let last = sample.brstack.len().wrapping_sub(1);
        let mut prev: Option<&BranchRecord> = None;
        for (pos, cur) in sample.brstack.iter().enumerate() {
            if let Some(p) = prev {
                debug_assert_eq!(p.stack_index, cur.stack_index + 1);
                if p.from == cur.from && p.to == cur.to {
                    if pos == last {
                        // The hardware occasionally repeats the freshest
                        // ring-buffer entry; drop the repeat.
                        continue;
                    }
                    warn!(
                        "duplicate LBR entry {:#x}->{:#x} at stack index {}",
                        cur.from, cur.to, cur.stack_index
                    );
                }
            }

            bump(&mut self.branches, overflow, (cur.from, cur.to), 1)?;
            if cur.mispredict == Mispredict::Mispredicted {
                bump(&mut self.mispredicts, overflow, (cur.from, cur.to), 1)?;
            }
            if let Some(p) = prev {
                if p.to >= cur.from {
                    bump(&mut self.malformed_traces, overflow, (p.to, cur.from), 1)?;
                } else {
                    bump(&mut self.traces, overflow, (p.to, cur.from), 1)?;
                }
            }
            prev = Some(cur);
        }
        Ok(())
    }

    /// Sum another profile into this one, pointwise. Build ids must agree
    /// unless `ignore_buildid` is set; a missing build id adopts the
    /// other's.
    pub fn merge(&mut self, other: &Self, ignore_buildid: bool) -> ProfileResult<()> {
        match (&self.buildid, &other.buildid) {
            (Some(left), Some(right)) if left != right => {
                if !ignore_buildid {
                    return Err(ProfileError::BuildidMismatch {
                        left: left.clone(),
                        right: right.clone(),
                    });
                }
            }
            (None, Some(right)) => self.buildid = Some(right.clone()),
            _ => {}
        }

        let overflow = self.overflow;
        merge_counters(&mut self.instructions, &other.instructions, overflow)?;
        merge_counters(&mut self.branches, &other.branches, overflow)?;
        merge_counters(&mut self.mispredicts, &other.mispredicts, overflow)?;
        merge_counters(&mut self.traces, &other.traces, overflow)?;
        merge_counters(&mut self.malformed_traces, &other.malformed_traces, overflow)?;
        Ok(())
    }

    /// Every distinct address mentioned by any counter table, sorted. This
    /// is the address set the location decoder resolves in one batch.
    pub fn unique_addresses(&self) -> Vec<Address> {
        let mut set = FxIndexSet::default();
        set.reserve(self.instructions.len() + 2 * self.branches.len());
        set.extend(self.instructions.keys().copied());
        for &(from, to) in self
            .branches
            .keys()
            .chain(self.traces.keys())
            .chain(self.malformed_traces.keys())
        {
            set.insert(from);
            set.insert(to);
        }
        let mut addrs: Vec<_> = set.into_iter().collect();
        addrs.sort_unstable();
        addrs
    }

    /// Total number of distinct counter keys, for verbose reporting.
    pub fn key_count(&self) -> usize {
        self.instructions.len() + self.branches.len() + self.traces.len()
    }
}

pub(crate) fn bump<K: Hash + Eq>(
    map: &mut FxIndexMap<K, u64>,
    overflow: OverflowPolicy,
    key: K,
    data: u64,
) -> ProfileResult<()> {
    overflow.add(map.entry(key).or_insert(0), data)
}

fn merge_counters<K: Hash + Eq + Copy>(
    into: &mut FxIndexMap<K, u64>,
    from: &FxIndexMap<K, u64>,
    overflow: OverflowPolicy,
) -> ProfileResult<()> {
    for (&key, &data) in from {
        bump(into, overflow, key, data)?;
    }
    Ok(())
}
