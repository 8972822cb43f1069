// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The decoded profile: sample counts attributed to source-level functions,
//! addressable by program-counter address. Created once per decode
//! invocation and immutable afterwards except through trim and merge.

mod decode;
#[cfg(test)]
mod fuzz_tests;

pub use decode::decode;

use crate::addr::Address;
use crate::collections::FxIndexMap;
use crate::config::DecoderConfig;
use crate::crcs::Crcs;
use crate::error::{ProfileError, ProfileResult};

/// Dense index of a function within one decoded profile. Locations refer to
/// functions by id rather than by reference, which keeps the profile's
/// tables free of cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FunctionId(u32);

impl FunctionId {
    pub fn from_offset(offset: usize) -> Self {
        let index: u32 = offset.try_into().expect("FunctionId to fit into a u32");
        Self(index)
    }

    pub fn to_offset(self) -> usize {
        self.0 as usize
    }

    pub fn to_raw_id(self) -> u32 {
        self.0
    }
}

/// Where an address lands inside its enclosing function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelLoc {
    pub id: FunctionId,
    /// `addr - function.start`; always fits the function's extent.
    pub offset: u32,
    /// The linear-IR label for this address, present iff the debug-line
    /// record was accepted.
    pub label: Option<u32>,
}

/// An accepted debug-line record: the linear-IR file of the owning unit and
/// the linear-IR instruction id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbgLoc {
    pub file: String,
    pub line: u32,
}

/// Everything the decoder learned about one sampled address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Loc {
    pub addr: Address,
    /// Present iff the address falls inside a resolved function.
    pub rel: Option<RelLoc>,
    pub dbg: Option<DbgLoc>,
}

impl Loc {
    /// A location for an address outside every known function.
    pub fn stub(addr: Address) -> Self {
        Self {
            addr,
            rel: None,
            dbg: None,
        }
    }
}

/// The aggregated counters restricted to one function's address range.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FuncAgg {
    pub instructions: FxIndexMap<Address, u64>,
    pub branches: FxIndexMap<(Address, Address), u64>,
    pub mispredicts: FxIndexMap<(Address, Address), u64>,
    pub traces: FxIndexMap<(Address, Address), u64>,
}

impl FuncAgg {
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
            && self.branches.is_empty()
            && self.mispredicts.is_empty()
            && self.traces.is_empty()
    }
}

/// One profiled function.
#[derive(Clone, Debug, PartialEq)]
pub struct Func {
    pub id: FunctionId,
    /// Linker symbol name.
    pub name: String,
    pub start: Address,
    /// Exclusive upper bound of the function's extent.
    pub finish: Address,
    /// Whether any address in this function carried an accepted linear-IR
    /// debug record; CFG attribution requires it.
    pub has_linearids: bool,
    /// Total samples charged to this function (instructions plus branch
    /// endpoints; interprocedural branches charge both sides).
    pub count: u64,
    /// Fall-through traces that could not be laid onto the CFG.
    pub malformed_traces: u64,
    pub agg: FuncAgg,
}

impl Func {
    pub fn new(id: FunctionId, name: String, start: Address, finish: Address) -> Self {
        Self {
            id,
            name,
            start,
            finish,
            has_linearids: false,
            count: 0,
            malformed_traces: 0,
            agg: FuncAgg::default(),
        }
    }

    /// The compilation unit owning this function: the symbol prefix before
    /// the first `::`, or the whole name for unscoped symbols.
    pub fn unit(&self) -> &str {
        unit_of(&self.name)
    }
}

pub(crate) fn unit_of(name: &str) -> &str {
    match name.split_once("::") {
        Some((unit, _)) => unit,
        None => name,
    }
}

/// The decoded, symbolic profile.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedProfile {
    /// Every address observed by any counter, exactly once.
    pub addr2loc: FxIndexMap<Address, Loc>,
    pub name2id: FxIndexMap<String, FunctionId>,
    /// Sparse after trim; ids are never reused.
    pub functions: FxIndexMap<FunctionId, Func>,
    pub crcs: Crcs,
    pub buildid: Option<String>,
}

impl DecodedProfile {
    pub fn new(crcs: Crcs, buildid: Option<String>) -> Self {
        Self {
            addr2loc: FxIndexMap::default(),
            name2id: FxIndexMap::default(),
            functions: FxIndexMap::default(),
            crcs,
            buildid,
        }
    }

    /// The function enclosing `addr`, if the address resolved to one.
    pub fn function_of(&self, addr: Address) -> Option<FunctionId> {
        self.addr2loc
            .get(&addr)
            .and_then(|loc| loc.rel.as_ref())
            .map(|rel| rel.id)
    }

    pub fn function(&self, id: FunctionId) -> Option<&Func> {
        self.functions.get(&id)
    }

    pub(crate) fn alloc_id(&self) -> FunctionId {
        let next = self
            .functions
            .keys()
            .map(|id| id.to_offset() + 1)
            .max()
            .unwrap_or(0);
        FunctionId::from_offset(next)
    }

    /// Sum another decoded profile into this one. Function ids of `other`
    /// are remapped through symbol names; bounds must agree. Counters sum
    /// pointwise, `addr2loc` entries must agree on their `rel` part, and
    /// the digest registries union under the mismatch policy.
    pub fn merge(&mut self, other: &DecodedProfile, config: &DecoderConfig) -> ProfileResult<()> {
        match (&self.buildid, &other.buildid) {
            (Some(left), Some(right)) if left != right => {
                if !config.ignore_buildid {
                    return Err(ProfileError::BuildidMismatch {
                        left: left.clone(),
                        right: right.clone(),
                    });
                }
            }
            (None, Some(right)) => self.buildid = Some(right.clone()),
            _ => {}
        }
        let overflow = config.overflow;

        let mut remap: FxIndexMap<FunctionId, FunctionId> = FxIndexMap::default();
        for (name, &other_id) in &other.name2id {
            let theirs = other
                .functions
                .get(&other_id)
                .ok_or_else(|| ProfileError::internal(format!("dangling id for {name}")))?;
            let id = match self.name2id.get(name).copied() {
                Some(id) => {
                    let ours = self
                        .functions
                        .get_mut(&id)
                        .ok_or_else(|| ProfileError::internal(format!("dangling id for {name}")))?;
                    if ours.start != theirs.start || ours.finish != theirs.finish {
                        return Err(ProfileError::FunctionBoundaryDrift {
                            name: name.clone(),
                            had_start: ours.start,
                            had_finish: ours.finish,
                            saw_start: theirs.start,
                            saw_finish: theirs.finish,
                        });
                    }
                    ours.has_linearids |= theirs.has_linearids;
                    overflow.add(&mut ours.count, theirs.count)?;
                    overflow.add(&mut ours.malformed_traces, theirs.malformed_traces)?;
                    merge_agg(&mut ours.agg, &theirs.agg, overflow)?;
                    id
                }
                None => {
                    let id = self.alloc_id();
                    let mut adopted = theirs.clone();
                    adopted.id = id;
                    self.functions.insert(id, adopted);
                    self.name2id.insert(name.clone(), id);
                    id
                }
            };
            remap.insert(other_id, id);
        }

        for (&addr, theirs) in &other.addr2loc {
            let rel = match &theirs.rel {
                Some(rel) => Some(RelLoc {
                    id: *remap.get(&rel.id).ok_or_else(|| {
                        ProfileError::internal(format!("unmapped function id for {addr:#x}"))
                    })?,
                    offset: rel.offset,
                    label: rel.label,
                }),
                None => None,
            };
            match self.addr2loc.get_mut(&addr) {
                None => {
                    self.addr2loc.insert(
                        addr,
                        Loc {
                            addr,
                            rel,
                            dbg: theirs.dbg.clone(),
                        },
                    );
                }
                Some(ours) => {
                    if let (Some(a), Some(b)) = (&ours.rel, &rel) {
                        if a != b {
                            return Err(ProfileError::malformed(format!(
                                "profiles disagree on the location of {addr:#x}"
                            )));
                        }
                    }
                    if ours.rel.is_none() {
                        ours.rel = rel;
                    }
                    if ours.dbg.is_none() {
                        ours.dbg = theirs.dbg.clone();
                    }
                }
            }
        }

        self.crcs.merge(&other.crcs)
    }
}

fn merge_agg(into: &mut FuncAgg, from: &FuncAgg, overflow: crate::OverflowPolicy) -> ProfileResult<()> {
    for (&addr, &data) in &from.instructions {
        overflow.add(into.instructions.entry(addr).or_insert(0), data)?;
    }
    for (&key, &data) in &from.branches {
        overflow.add(into.branches.entry(key).or_insert(0), data)?;
    }
    for (&key, &data) in &from.mispredicts {
        overflow.add(into.mispredicts.entry(key).or_insert(0), data)?;
    }
    for (&key, &data) in &from.traces {
        overflow.add(into.traces.entry(key).or_insert(0), data)?;
    }
    Ok(())
}
