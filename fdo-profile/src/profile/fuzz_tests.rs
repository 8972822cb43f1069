// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::config::OverflowPolicy;
use crate::crcs::{CrcKind, Crcs, CrcsConfig, Md5Digest};
use crate::raw::{AggregatedRawProfile, BranchRecord, Mispredict, Sample};
use crate::store;
use crate::trim::{trim, Cutoff};
use bolero::generator::TypeGenerator;
use std::io::Cursor;

/// Compact generator shape for one sample; addresses are kept small so that
/// branches frequently collide and exercise the counter paths.
#[derive(Clone, Debug, TypeGenerator)]
struct FuzzBranch {
    from: u16,
    to: u16,
    mispredicted: bool,
}

#[derive(Clone, Debug, TypeGenerator)]
struct FuzzSample {
    ip: u16,
    brstack: Vec<FuzzBranch>,
}

impl From<&FuzzSample> for Sample {
    fn from(spec: &FuzzSample) -> Self {
        let depth = spec.brstack.len();
        Sample {
            ip: spec.ip as u64,
            // Chronological order with hardware stack indexes counting
            // down to the most recent entry.
            brstack: spec
                .brstack
                .iter()
                .enumerate()
                .map(|(pos, branch)| BranchRecord {
                    from: branch.from as u64,
                    to: branch.to as u64,
                    mispredict: if branch.mispredicted {
                        Mispredict::Mispredicted
                    } else {
                        Mispredict::Predicted
                    },
                    stack_index: (depth - 1 - pos) as u32,
                })
                .collect(),
        }
    }
}

fn aggregate(samples: &[Sample]) -> AggregatedRawProfile {
    let mut agg = AggregatedRawProfile::new(OverflowPolicy::Saturate);
    for sample in samples {
        agg.aggregate(sample).unwrap();
    }
    agg
}

#[test]
fn fuzz_aggregation_is_order_independent() {
    bolero::check!()
        .with_type::<(Vec<FuzzSample>, usize)>()
        .for_each(|(specs, rotation)| {
            let samples: Vec<Sample> = specs.iter().map(Sample::from).collect();
            let mut permuted = samples.clone();
            permuted.reverse();
            if !permuted.is_empty() {
                let split = rotation % permuted.len();
                permuted.rotate_left(split);
            }
            assert_eq!(aggregate(&samples), aggregate(&permuted));
        });
}

#[test]
fn fuzz_raw_merge_is_commutative() {
    bolero::check!()
        .with_type::<(Vec<FuzzSample>, Vec<FuzzSample>)>()
        .for_each(|(left_specs, right_specs)| {
            let left = aggregate(&left_specs.iter().map(Sample::from).collect::<Vec<_>>());
            let right = aggregate(&right_specs.iter().map(Sample::from).collect::<Vec<_>>());

            let mut ab = left.clone();
            ab.merge(&right, false).unwrap();
            let mut ba = right.clone();
            ba.merge(&left, false).unwrap();
            assert_eq!(ab, ba);
        });
}

#[test]
fn fuzz_raw_merge_is_associative() {
    bolero::check!()
        .with_type::<(Vec<FuzzSample>, Vec<FuzzSample>, Vec<FuzzSample>)>()
        .for_each(|(a_specs, b_specs, c_specs)| {
            let a = aggregate(&a_specs.iter().map(Sample::from).collect::<Vec<_>>());
            let b = aggregate(&b_specs.iter().map(Sample::from).collect::<Vec<_>>());
            let c = aggregate(&c_specs.iter().map(Sample::from).collect::<Vec<_>>());

            let mut left = a.clone();
            left.merge(&b, false).unwrap();
            left.merge(&c, false).unwrap();

            let mut bc = b.clone();
            bc.merge(&c, false).unwrap();
            let mut right = a.clone();
            right.merge(&bc, false).unwrap();

            assert_eq!(left, right);
        });
}

/// Generator shape for a decoded profile. Functions are laid out back to
/// back so intervals stay disjoint by construction.
#[derive(Clone, Debug, TypeGenerator)]
struct FuzzFunc {
    name: String,
    count: u64,
    has_linearids: bool,
    instructions: Vec<(u8, u64)>,
    malformed_traces: u64,
}

fn build_profile(buildid: &Option<String>, funcs: &[FuzzFunc]) -> DecodedProfile {
    let config = CrcsConfig::default();
    let mut profile = DecodedProfile::new(Crcs::new(config), buildid.clone());
    for spec in funcs {
        if profile.name2id.contains_key(&spec.name) {
            continue;
        }
        let id = profile.alloc_id();
        let start = 0x1000 * (id.to_offset() as u64 + 1);
        let mut func = Func::new(id, spec.name.clone(), start, start + 0x100);
        func.count = spec.count;
        func.has_linearids = spec.has_linearids;
        func.malformed_traces = spec.malformed_traces;
        for &(off, data) in &spec.instructions {
            let addr = start + off as u64;
            func.agg.instructions.insert(addr, data);
            profile.addr2loc.insert(
                addr,
                Loc {
                    addr,
                    rel: Some(RelLoc {
                        id,
                        offset: off as u32,
                        label: spec.has_linearids.then_some(off as u32),
                    }),
                    dbg: None,
                },
            );
        }
        profile
            .crcs
            .add(
                &spec.name,
                CrcKind::Func,
                Md5Digest::of_parts(&[spec.name.as_bytes()]),
            )
            .unwrap();
        profile.functions.insert(id, func);
        profile.name2id.insert(spec.name.clone(), id);
    }
    profile
}

#[test]
fn fuzz_store_roundtrips() {
    bolero::check!()
        .with_type::<(Option<String>, Vec<FuzzFunc>)>()
        .for_each(|(buildid, funcs)| {
            let profile = build_profile(buildid, funcs);

            let mut textual = Vec::new();
            store::write_textual(&profile, &mut textual).unwrap();
            assert_eq!(
                store::read_textual(&mut Cursor::new(&textual)).unwrap(),
                profile
            );

            let mut binary = Vec::new();
            store::write_binary(&profile, &mut binary).unwrap();
            assert_eq!(
                store::read_binary(&mut Cursor::new(&binary)).unwrap(),
                profile
            );
        });
}

#[test]
fn fuzz_trim_top_bounds_the_function_count() {
    bolero::check!()
        .with_type::<(Vec<FuzzFunc>, u8)>()
        .for_each(|(funcs, n)| {
            let mut profile = build_profile(&None, funcs);
            trim(&mut profile, &[Cutoff::Top(*n as usize)]);
            assert!(profile.functions.len() <= *n as usize);
            // Dangling references must not survive.
            for loc in profile.addr2loc.values() {
                if let Some(rel) = &loc.rel {
                    assert!(profile.functions.contains_key(&rel.id));
                }
            }
            assert_eq!(profile.name2id.len(), profile.functions.len());
        });
}
