// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cutoff filters over a decoded profile. A trim spec is an ordered list of
//! predicates; each one narrows the set of surviving functions before the
//! next applies, so `[MinSamples 100, Top 10]` and `[Top 10, MinSamples
//! 100]` generally differ.

use crate::collections::FxIndexSet;
use crate::profile::{DecodedProfile, FunctionId};
use log::debug;
use std::fmt;

/// One cutoff predicate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Cutoff {
    /// Keep the top `n` functions by count.
    Top(usize),
    /// Keep the top `p` percent of functions by count-rank.
    TopPercent(f64),
    /// Keep the smallest count-descending prefix covering at least `p`
    /// percent of all samples.
    TopPercentSamples(f64),
    /// Drop functions with fewer than `k` samples.
    MinSamples(u64),
}

/// Apply the cutoffs in order, removing dropped functions from
/// `functions`, `name2id` and `addr2loc`, and trimming the digest registry
/// to the survivors (function names and their owning units).
pub fn trim(profile: &mut DecodedProfile, cutoffs: &[Cutoff]) {
    // Count-descending survivor list; ids break ties so the order is total.
    let mut survivors: Vec<(FunctionId, u64)> = profile
        .functions
        .values()
        .map(|func| (func.id, func.count))
        .collect();
    survivors.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    for cutoff in cutoffs {
        match *cutoff {
            Cutoff::Top(n) => survivors.truncate(n),
            Cutoff::TopPercent(p) => {
                let keep = ((p / 100.0) * survivors.len() as f64).ceil() as usize;
                survivors.truncate(keep.min(survivors.len()));
            }
            Cutoff::TopPercentSamples(p) => {
                let total: u64 = survivors.iter().map(|&(_, count)| count).sum();
                let threshold = (p / 100.0) * total as f64;
                let mut cumulative = 0u64;
                let mut keep = 0;
                for &(_, count) in survivors.iter() {
                    if cumulative as f64 >= threshold {
                        break;
                    }
                    cumulative = cumulative.saturating_add(count);
                    keep += 1;
                }
                survivors.truncate(keep);
            }
            Cutoff::MinSamples(k) => survivors.retain(|&(_, count)| count >= k),
        }
    }

    let kept: FxIndexSet<FunctionId> = survivors.into_iter().map(|(id, _)| id).collect();
    let dropped = profile.functions.len() - kept.len();
    if dropped > 0 {
        debug!("trim dropped {dropped} functions");
    }

    profile.functions.retain(|id, _| kept.contains(id));
    profile.name2id.retain(|_, id| kept.contains(id));
    profile
        .addr2loc
        .retain(|_, loc| match &loc.rel {
            Some(rel) => kept.contains(&rel.id),
            None => true,
        });

    let mut keep_names: FxIndexSet<String> = FxIndexSet::default();
    for func in profile.functions.values() {
        keep_names.insert(func.name.clone());
        keep_names.insert(func.unit().to_string());
    }
    profile.crcs.trim(&keep_names);
}

/// Headline numbers of a decoded profile, for reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProfileStats {
    pub functions: usize,
    pub with_linearids: usize,
    pub total_samples: u64,
    pub malformed_traces: u64,
}

impl ProfileStats {
    pub fn of(profile: &DecodedProfile) -> Self {
        let mut stats = ProfileStats {
            functions: profile.functions.len(),
            ..Default::default()
        };
        for func in profile.functions.values() {
            if func.has_linearids {
                stats.with_linearids += 1;
            }
            stats.total_samples = stats.total_samples.saturating_add(func.count);
            stats.malformed_traces = stats.malformed_traces.saturating_add(func.malformed_traces);
        }
        stats
    }
}

impl fmt::Display for ProfileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} functions ({} with linear ids), {} samples, {} malformed traces",
            self.functions, self.with_linearids, self.total_samples, self.malformed_traces
        )
    }
}
