// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns an aggregated raw profile into a decoded one: resolves every
//! sampled address through the binary's symbols and debug lines, interns
//! functions under dense ids, and partitions the counters to per-function
//! sub-tables.

use crate::addr::Address;
use crate::cfg::LINEAR_EXT;
use crate::collections::FxIndexMap;
use crate::config::DecoderConfig;
use crate::crcs::Crcs;
use crate::elf::{DbgLine, ElfView};
use crate::error::{ProfileError, ProfileResult};
use crate::profile::{unit_of, DbgLoc, DecodedProfile, Func, FunctionId, Loc, RelLoc};
use crate::raw::AggregatedRawProfile;
use indexmap::map::Entry;
use log::debug;
use std::hash::Hash;
use std::path::Path;

/// Decode an aggregated profile against the binary it was sampled from.
/// The digest registry is adopted as-is; digests are recorded separately by
/// whoever holds the IR.
pub fn decode(
    agg: &AggregatedRawProfile,
    elf: &impl ElfView,
    crcs: Crcs,
    config: &DecoderConfig,
) -> ProfileResult<DecodedProfile> {
    let buildid = agg
        .buildid
        .clone()
        .or_else(|| elf.buildid().map(str::to_string));
    let mut profile = DecodedProfile::new(crcs, buildid);

    let addrs = agg.unique_addresses();
    let lines = elf.resolve_all(&addrs);
    for &addr in &addrs {
        let loc = decode_addr(&mut profile, elf, &lines, addr, config)?;
        profile.addr2loc.insert(addr, loc);
    }

    partition(&mut profile, agg, config)?;

    if config.verbose {
        debug!(
            "decoded {} addresses into {} functions ({} counter keys)",
            profile.addr2loc.len(),
            profile.functions.len(),
            agg.key_count(),
        );
    }
    Ok(profile)
}

fn decode_addr(
    profile: &mut DecodedProfile,
    elf: &impl ElfView,
    lines: &FxIndexMap<Address, DbgLine>,
    addr: Address,
    config: &DecoderConfig,
) -> ProfileResult<Loc> {
    let Some(interval) = elf.function_containing(addr) else {
        return Ok(Loc::stub(addr));
    };
    let name = interval.value.as_str();
    // `containing` guarantees addr >= start.
    let offset: u32 = (addr - interval.start).try_into().map_err(|_| {
        ProfileError::OffsetTooLarge {
            addr,
            name: name.to_string(),
            start: interval.start,
        }
    })?;

    let id = match profile.name2id.get(name).copied() {
        Some(id) => {
            let func = profile
                .functions
                .get(&id)
                .ok_or_else(|| ProfileError::internal(format!("dangling id for {name}")))?;
            if func.start != interval.start || func.finish != interval.end {
                if config.ignore_local_dup {
                    debug!(
                        "coalescing duplicate local symbol {name} at {:#x}..{:#x}",
                        interval.start, interval.end
                    );
                    return Ok(Loc::stub(addr));
                }
                return Err(ProfileError::FunctionBoundaryDrift {
                    name: name.to_string(),
                    had_start: func.start,
                    had_finish: func.finish,
                    saw_start: interval.start,
                    saw_finish: interval.end,
                });
            }
            id
        }
        None => {
            let id = profile.alloc_id();
            profile.functions.insert(
                id,
                Func::new(id, name.to_string(), interval.start, interval.end),
            );
            profile.name2id.insert(name.to_string(), id);
            id
        }
    };

    let mut dbg = None;
    let mut label = None;
    if let Some(record) = lines.get(&addr) {
        if accepts_dbg(record, name) {
            dbg = Some(DbgLoc {
                file: record.file.clone(),
                line: record.line,
            });
            label = Some(record.line);
            let func = profile
                .functions
                .get_mut(&id)
                .ok_or_else(|| ProfileError::internal(format!("dangling id for {name}")))?;
            func.has_linearids = true;
        }
    }

    Ok(Loc {
        addr,
        rel: Some(RelLoc { id, offset, label }),
        dbg,
    })
}

/// A debug-line record is trusted only when it points at the linear-IR file
/// of the function's own unit; anything else (inlined runtime code, other
/// units) would mislead CFG attribution.
fn accepts_dbg(record: &DbgLine, func_name: &str) -> bool {
    let path = Path::new(&record.file);
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    ext == LINEAR_EXT && stem == unit_of(func_name)
}

fn partition(
    profile: &mut DecodedProfile,
    agg: &AggregatedRawProfile,
    config: &DecoderConfig,
) -> ProfileResult<()> {
    let overflow = config.overflow;

    for (&addr, &data) in &agg.instructions {
        if let Some(id) = profile.function_of(addr) {
            let func = func_mut(profile, id)?;
            overflow.add(&mut func.count, data)?;
            insert_unique(&mut func.agg.instructions, addr, data)?;
        }
    }

    for (&(from, to), &data) in &agg.branches {
        let mispredicts = agg.mispredicts.get(&(from, to)).copied();
        let targets = charged_functions(profile.function_of(from), profile.function_of(to));
        for id in targets.into_iter().flatten() {
            let func = func_mut(profile, id)?;
            overflow.add(&mut func.count, data)?;
            insert_unique(&mut func.agg.branches, (from, to), data)?;
            if let Some(m) = mispredicts {
                insert_unique(&mut func.agg.mispredicts, (from, to), m)?;
            }
        }
    }

    // Only instructions and branches feed `count`; the branches delimiting
    // a trace already carry its endpoints.
    for (&(from, to), &data) in &agg.traces {
        let targets = charged_functions(profile.function_of(from), profile.function_of(to));
        for id in targets.into_iter().flatten() {
            let func = func_mut(profile, id)?;
            insert_unique(&mut func.agg.traces, (from, to), data)?;
        }
    }

    for (&(from, to), &data) in &agg.malformed_traces {
        let target = profile.function_of(from).or_else(|| profile.function_of(to));
        if let Some(id) = target {
            let func = func_mut(profile, id)?;
            overflow.add(&mut func.malformed_traces, data)?;
        }
    }

    Ok(())
}

/// Which functions a cross-address counter is charged to: none, one, or
/// (for interprocedural pairs) both sides.
fn charged_functions(
    from: Option<FunctionId>,
    to: Option<FunctionId>,
) -> [Option<FunctionId>; 2] {
    match (from, to) {
        (Some(a), Some(b)) if a == b => [Some(a), None],
        pair => [pair.0, pair.1],
    }
}

fn func_mut(profile: &mut DecodedProfile, id: FunctionId) -> ProfileResult<&mut Func> {
    profile
        .functions
        .get_mut(&id)
        .ok_or_else(|| ProfileError::internal(format!("dangling function id {id:?}")))
}

/// Per-function sub-tables are filled from globally-unique keys; seeing a
/// key twice means the partition itself is broken.
fn insert_unique<K: Eq + Hash + std::fmt::Debug>(
    map: &mut FxIndexMap<K, u64>,
    key: K,
    data: u64,
) -> ProfileResult<()> {
    match map.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(data);
            Ok(())
        }
        Entry::Occupied(slot) => Err(ProfileError::internal(format!(
            "duplicate key {:?} in per-function table",
            slot.key()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::crcs::CrcsConfig;
    use crate::elf::StaticElfView;
    use crate::raw::PidFilter;
    use std::io::Cursor;

    fn crcs() -> Crcs {
        Crcs::new(CrcsConfig::default())
    }

    fn aggregate(input: &str) -> AggregatedRawProfile {
        let (agg, _) = AggregatedRawProfile::read_and_aggregate(
            Cursor::new(input),
            PidFilter::Any,
            OverflowPolicy::Saturate,
            None,
        )
        .unwrap();
        agg
    }

    fn two_function_elf() -> StaticElfView {
        let mut elf = StaticElfView::new(Some("bid-1".into()));
        elf.add_function("crunch::f", 0x400000, 0x400800).unwrap();
        elf.add_function("crunch::g", 0x400800, 0x401000).unwrap();
        elf
    }

    #[test]
    fn every_address_gets_exactly_one_location() {
        let agg = aggregate("7 0x400500 0x400480/0x400500/P/X/A/12\n");
        let profile = decode(&agg, &two_function_elf(), crcs(), &DecoderConfig::default())
            .unwrap();
        assert_eq!(profile.addr2loc.len(), 2);
        let loc = &profile.addr2loc[&0x400500];
        let rel = loc.rel.as_ref().unwrap();
        assert_eq!(rel.offset, 0x500);
        assert_eq!(
            profile.functions[&rel.id].start + rel.offset as u64,
            0x400500
        );
    }

    #[test]
    fn unresolved_address_yields_stub() {
        let agg = aggregate("7 0x900000\n");
        let profile = decode(&agg, &two_function_elf(), crcs(), &DecoderConfig::default())
            .unwrap();
        assert_eq!(profile.addr2loc[&0x900000], Loc::stub(0x900000));
        assert!(profile.functions.is_empty());
        assert!(profile.name2id.is_empty());
    }

    #[test]
    fn interprocedural_branch_charges_both_sides() {
        // Branch from f (0x400500) into g (0x400900).
        let agg = aggregate("7 0x400900 0x400500/0x400900/P/X/A/3\n");
        let profile = decode(&agg, &two_function_elf(), crcs(), &DecoderConfig::default())
            .unwrap();

        let f = &profile.functions[&profile.name2id["crunch::f"]];
        let g = &profile.functions[&profile.name2id["crunch::g"]];
        assert_eq!(f.count, 1);
        assert_eq!(g.count, 2); // the sampled ip plus the branch target
        assert_eq!(f.agg.branches[&(0x400500, 0x400900)], 1);
        assert_eq!(g.agg.branches[&(0x400500, 0x400900)], 1);
    }

    #[test]
    fn intraprocedural_branch_charges_once() {
        let agg = aggregate("7 0x400500 0x400480/0x400500/M/X/A/1\n");
        let profile = decode(&agg, &two_function_elf(), crcs(), &DecoderConfig::default())
            .unwrap();
        let f = &profile.functions[&profile.name2id["crunch::f"]];
        // One instruction sample plus one branch charge.
        assert_eq!(f.count, 2);
        assert_eq!(f.agg.mispredicts[&(0x400480, 0x400500)], 1);
        assert_eq!(profile.functions.len(), 1);
    }

    #[test]
    fn dbg_lines_set_linear_labels() {
        let mut elf = two_function_elf();
        elf.add_line(0x400500, "crunch.linear", 17);
        elf.add_line(0x400480, "other.linear", 4); // wrong unit: rejected
        let agg = aggregate("7 0x400500 0x400480/0x400500/P/X/A/1\n");
        let profile = decode(&agg, &elf, crcs(), &DecoderConfig::default()).unwrap();

        let loc = &profile.addr2loc[&0x400500];
        assert_eq!(loc.dbg.as_ref().unwrap().line, 17);
        assert_eq!(loc.rel.as_ref().unwrap().label, Some(17));
        assert!(profile.addr2loc[&0x400480].dbg.is_none());
        let f = &profile.functions[&profile.name2id["crunch::f"]];
        assert!(f.has_linearids);
    }

    #[test]
    fn boundary_drift_is_fatal_unless_ignored() {
        // Two intervals with the same symbol name but different bounds.
        let mut elf = StaticElfView::new(None);
        elf.add_function("dup", 0x1000, 0x2000).unwrap();
        elf.add_function("dup", 0x3000, 0x4000).unwrap();
        let agg = aggregate("7 0x1010\n7 0x3010\n");

        let err = decode(&agg, &elf, crcs(), &DecoderConfig::default()).unwrap_err();
        assert!(matches!(err, ProfileError::FunctionBoundaryDrift { .. }));

        let config = DecoderConfig {
            ignore_local_dup: true,
            ..Default::default()
        };
        let profile = decode(&agg, &elf, crcs(), &config).unwrap();
        assert_eq!(profile.functions.len(), 1);
        assert!(profile.addr2loc[&0x3010].rel.is_none());
    }

    #[test]
    fn function_counts_are_bounded_by_raw_totals() {
        // Interprocedural edges are double-charged, so the bound is
        // 2 * branches + instructions.
        let agg = aggregate(
            "7 0x400500 0x400500/0x400900/M/X/A/1 0x400480/0x400500/P/X/A/2\n7 0x400900\n",
        );
        let profile = decode(&agg, &two_function_elf(), crcs(), &DecoderConfig::default())
            .unwrap();
        let total: u64 = profile.functions.values().map(|f| f.count).sum();
        let branches: u64 = agg.branches.values().sum();
        let instructions: u64 = agg.instructions.values().sum();
        assert!(total <= 2 * branches + instructions);
    }

    #[test]
    fn buildid_prefers_the_raw_profile() {
        let agg = aggregate("7 0x400500\n");
        let profile = decode(&agg, &two_function_elf(), crcs(), &DecoderConfig::default())
            .unwrap();
        assert_eq!(profile.buildid.as_deref(), Some("bid-1"));
    }

    #[test]
    fn malformed_fallthrough_charges_the_enclosing_function() {
        // Zero-length fall-through inside f.
        let agg =
            aggregate("7 0x400700 0x400500/0x400480/M/X/A/10 0x400490/0x400500/P/X/A/20\n");
        assert_eq!(agg.malformed_traces.len(), 1);
        let profile = decode(&agg, &two_function_elf(), crcs(), &DecoderConfig::default())
            .unwrap();
        let f = &profile.functions[&profile.name2id["crunch::f"]];
        assert_eq!(f.malformed_traces, 1);
    }
}
