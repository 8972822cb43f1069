// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Block-level attribution: given the linear IR of a function (its CFG and
//! block layout) and the per-function counters of a decoded profile,
//! reconstruct how often each basic block ran and which outgoing edges were
//! taken. Attribution is deferred until the IR is available, so the decoded
//! profile never stores CFG data for functions that lack it.

use crate::addr::Address;
use crate::collections::FxIndexMap;
use crate::crcs::Md5Digest;
use crate::error::{ProfileError, ProfileResult};
use crate::profile::DecodedProfile;
use log::debug;

/// File extension of compiler-emitted linear-IR debug files. A debug-line
/// record pointing at `<unit>.linear` carries a linear-IR instruction id in
/// its line field.
pub const LINEAR_EXT: &str = "linear";

/// A basic-block label in the linear IR.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Label(pub u32);

/// How a basic block ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminatorKind {
    Return,
    /// Unconditional jump.
    Jump,
    /// Conditional branch.
    Branch,
    Switch,
    TailCall,
    Raise,
}

/// One basic block of the linear IR.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    pub label: Label,
    /// Linear-IR instruction ids in layout order; the last id is the
    /// terminator's position.
    pub linear_ids: Vec<u32>,
    pub terminator: TerminatorKind,
    /// Branch-target successors in the IR's edge order.
    pub successors: Vec<Label>,
    /// The successor reached without taking any branch, if the terminator
    /// has one.
    pub fallthrough: Option<Label>,
}

impl BasicBlock {
    fn terminator_id(&self) -> Option<u32> {
        self.linear_ids.last().copied()
    }
}

/// A function's CFG together with its block layout and the linear-id →
/// block mapping, as produced by the compiler after linearization.
#[derive(Clone, Debug)]
pub struct CfgWithLayout {
    name: String,
    blocks: FxIndexMap<Label, BasicBlock>,
    layout: Vec<Label>,
    line2block: FxIndexMap<u32, Label>,
    /// Linear ids that appeared in more than one block; the first block
    /// keeps them.
    ambiguous_lines: u64,
}

impl CfgWithLayout {
    pub fn new(name: impl Into<String>, blocks: Vec<BasicBlock>, layout: Vec<Label>) -> ProfileResult<Self> {
        let name = name.into();
        let mut by_label: FxIndexMap<Label, BasicBlock> = FxIndexMap::default();
        let mut line2block: FxIndexMap<u32, Label> = FxIndexMap::default();
        let mut ambiguous_lines = 0;
        for block in blocks {
            for &line in &block.linear_ids {
                if line2block.contains_key(&line) {
                    ambiguous_lines += 1;
                } else {
                    line2block.insert(line, block.label);
                }
            }
            if by_label.insert(block.label, block).is_some() {
                return Err(ProfileError::malformed(format!(
                    "duplicate block label in the linear IR of {name}"
                )));
            }
        }
        for label in &layout {
            if !by_label.contains_key(label) {
                return Err(ProfileError::malformed(format!(
                    "layout of {name} names unknown block {label:?}"
                )));
            }
        }
        if ambiguous_lines > 0 {
            debug!("{ambiguous_lines} ambiguous linear ids in {name}");
        }
        Ok(Self {
            name,
            blocks: by_label,
            layout,
            line2block,
            ambiguous_lines,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &[Label] {
        &self.layout
    }

    pub fn block(&self, label: Label) -> Option<&BasicBlock> {
        self.blocks.get(&label)
    }

    pub fn block_of_line(&self, line: u32) -> Option<Label> {
        self.line2block.get(&line).copied()
    }

    fn is_terminator_line(&self, label: Label, line: u32) -> bool {
        self.blocks
            .get(&label)
            .and_then(BasicBlock::terminator_id)
            .is_some_and(|id| id == line)
    }

    /// Content fingerprint of this function's IR, for the digest registry.
    /// With `ignore_dbg` the linear-id tables are left out, so rebuilding
    /// with different debug flags keeps the digest stable.
    pub fn digest(&self, ignore_dbg: bool) -> Md5Digest {
        let mut ctx = md5::Context::new();
        ctx.consume(self.name.as_bytes());
        for label in &self.layout {
            ctx.consume(label.0.to_le_bytes());
        }
        for (label, block) in &self.blocks {
            ctx.consume(label.0.to_le_bytes());
            ctx.consume([terminator_tag(block.terminator)]);
            for succ in &block.successors {
                ctx.consume(succ.0.to_le_bytes());
            }
            if let Some(fallthrough) = block.fallthrough {
                ctx.consume(fallthrough.0.to_le_bytes());
            }
            if !ignore_dbg {
                for &line in &block.linear_ids {
                    ctx.consume(line.to_le_bytes());
                }
            }
        }
        Md5Digest::new(ctx.compute().0)
    }
}

fn terminator_tag(kind: TerminatorKind) -> u8 {
    match kind {
        TerminatorKind::Return => 0,
        TerminatorKind::Jump => 1,
        TerminatorKind::Branch => 2,
        TerminatorKind::Switch => 3,
        TerminatorKind::TailCall => 4,
        TerminatorKind::Raise => 5,
    }
}

/// One outgoing CFG edge with its observed weights.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuccessorInfo {
    pub target: Label,
    pub taken: u64,
    pub mispredicts: u64,
    /// False only for edges that leave the function.
    pub intra: bool,
}

/// A call instruction observed inside a block, with per-callee counts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSite {
    /// Linear id of the call instruction.
    pub at: u32,
    pub callees: FxIndexMap<String, u64>,
}

/// Reconstructed execution counts for one basic block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub label: Label,
    pub terminator: TerminatorKind,
    /// How often execution entered this block.
    pub count: u64,
    /// Outgoing edges in IR order, fall-through last.
    pub successors: Vec<SuccessorInfo>,
    /// Call sites ordered by linear id.
    pub calls: Vec<CallSite>,
}

/// Everything attribution could not place.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttributionStats {
    /// Instruction samples with no usable linear id.
    pub unmapped_instructions: u64,
    /// Branches whose endpoints matched no CFG edge.
    pub dropped_branches: u64,
    /// Traces that were not a single natural fall-through.
    pub malformed_traces: u64,
    /// Linear ids claimed by more than one block.
    pub ambiguous_lines: u64,
}

/// Block-level view of one function's profile.
#[derive(Clone, Debug, PartialEq)]
pub struct FuncAttribution {
    pub blocks: FxIndexMap<Label, BlockInfo>,
    pub stats: AttributionStats,
}

/// Attribute a function's aggregated counters onto its CFG. Returns `None`
/// without error when the profile has nothing usable for this function:
/// unknown name, zero samples, or no linear-id debug info.
pub fn attribute(
    profile: &mut DecodedProfile,
    cfg: &CfgWithLayout,
) -> ProfileResult<Option<FuncAttribution>> {
    let Some(&id) = profile.name2id.get(cfg.name()) else {
        return Ok(None);
    };
    let func = profile
        .functions
        .get(&id)
        .ok_or_else(|| ProfileError::internal(format!("dangling id for {}", cfg.name())))?;
    if func.count == 0 || !func.has_linearids {
        return Ok(None);
    }

    let mut blocks: FxIndexMap<Label, BlockInfo> = FxIndexMap::default();
    for &label in cfg.layout() {
        let block = cfg
            .block(label)
            .ok_or_else(|| ProfileError::internal(format!("layout names unknown {label:?}")))?;
        let mut successors: Vec<SuccessorInfo> = block
            .successors
            .iter()
            .map(|&target| SuccessorInfo {
                target,
                taken: 0,
                mispredicts: 0,
                intra: true,
            })
            .collect();
        if let Some(fallthrough) = block.fallthrough {
            successors.push(SuccessorInfo {
                target: fallthrough,
                taken: 0,
                mispredicts: 0,
                intra: true,
            });
        }
        blocks.insert(
            label,
            BlockInfo {
                label,
                terminator: block.terminator,
                count: 0,
                successors,
                calls: Vec::new(),
            },
        );
    }

    let mut stats = AttributionStats {
        ambiguous_lines: cfg.ambiguous_lines,
        ..Default::default()
    };
    let mut malformed = 0u64;

    let label_of_addr = |addr: Address| -> Option<Label> {
        profile
            .addr2loc
            .get(&addr)
            .and_then(|loc| loc.rel.as_ref())
            .and_then(|rel| rel.label)
            .and_then(|line| cfg.block_of_line(line))
    };
    let line_of_addr = |addr: Address| -> Option<u32> {
        profile
            .addr2loc
            .get(&addr)
            .and_then(|loc| loc.rel.as_ref())
            .and_then(|rel| rel.label)
    };

    // Instruction samples: charge the enclosing block; a sample on the
    // terminator also rides its only outgoing edge when that edge is
    // unambiguous.
    for (&addr, &count) in &func.agg.instructions {
        let Some(line) = line_of_addr(addr) else {
            stats.unmapped_instructions += count;
            continue;
        };
        let Some(label) = cfg.block_of_line(line) else {
            stats.unmapped_instructions += count;
            continue;
        };
        let info = block_info_mut(&mut blocks, label)?;
        info.count = info.count.saturating_add(count);
        if cfg.is_terminator_line(label, line) && info.successors.len() == 1 {
            let edge = &mut info.successors[0];
            edge.taken = edge.taken.saturating_add(count);
        }
    }

    // Fall-through traces: both endpoints must lie in this function (a
    // foreign address carries a linear id that is meaningless against this
    // CFG); they are valid when they share a block, or when the destination
    // block is the source block's natural fall-through.
    for (&(from, to), &count) in &func.agg.traces {
        if profile.function_of(from) != Some(id) || profile.function_of(to) != Some(id) {
            stats.malformed_traces += count;
            malformed = malformed.saturating_add(count);
            continue;
        }
        match (label_of_addr(from), label_of_addr(to)) {
            (Some(a), Some(b)) if a == b => {}
            (Some(a), Some(b)) if cfg.block(a).and_then(|blk| blk.fallthrough) == Some(b) => {
                let info = block_info_mut(&mut blocks, a)?;
                if let Some(edge) = info.successors.iter_mut().find(|s| s.target == b) {
                    edge.taken = edge.taken.saturating_add(count);
                }
                let dest = block_info_mut(&mut blocks, b)?;
                dest.count = dest.count.saturating_add(count);
            }
            _ => {
                stats.malformed_traces += count;
                malformed = malformed.saturating_add(count);
            }
        }
    }

    // Taken branches: intra-function edges credit the matching successor;
    // edges that leave the function become call sites on the source block.
    for (&(from, to), &count) in &func.agg.branches {
        let mispredicts = func.agg.mispredicts.get(&(from, to)).copied().unwrap_or(0);
        let from_here = profile.function_of(from) == Some(id);
        let to_here = profile.function_of(to) == Some(id);

        if from_here && to_here {
            let (Some(a), Some(b)) = (label_of_addr(from), label_of_addr(to)) else {
                stats.dropped_branches += count;
                continue;
            };
            let info = block_info_mut(&mut blocks, a)?;
            match info.successors.iter_mut().find(|s| s.target == b) {
                Some(edge) => {
                    edge.taken = edge.taken.saturating_add(count);
                    edge.mispredicts = edge.mispredicts.saturating_add(mispredicts);
                }
                None => stats.dropped_branches += count,
            }
        } else if from_here {
            let (Some(a), Some(at)) = (label_of_addr(from), line_of_addr(from)) else {
                stats.dropped_branches += count;
                continue;
            };
            let Some(callee) = profile
                .function_of(to)
                .and_then(|cid| profile.functions.get(&cid))
                .map(|f| f.name.clone())
            else {
                stats.dropped_branches += count;
                continue;
            };
            let info = block_info_mut(&mut blocks, a)?;
            let call = match info.calls.iter_mut().find(|c| c.at == at) {
                Some(call) => call,
                None => {
                    info.calls.push(CallSite {
                        at,
                        callees: FxIndexMap::default(),
                    });
                    info.calls.last_mut().ok_or_else(|| {
                        ProfileError::internal("call site vanished after push")
                    })?
                }
            };
            let counter = call.callees.entry(callee).or_insert(0);
            *counter = counter.saturating_add(count);
        }
        // Branches entering from another function belong to the caller's
        // attribution; the entry weight is already carried by instruction
        // samples and traces.
    }

    for info in blocks.values_mut() {
        info.calls.sort_by_key(|c| c.at);
    }

    if malformed > 0 {
        let func = profile
            .functions
            .get_mut(&id)
            .ok_or_else(|| ProfileError::internal(format!("dangling id for {}", cfg.name())))?;
        func.malformed_traces = func.malformed_traces.saturating_add(malformed);
    }

    Ok(Some(FuncAttribution { blocks, stats }))
}

fn block_info_mut(
    blocks: &mut FxIndexMap<Label, BlockInfo>,
    label: Label,
) -> ProfileResult<&mut BlockInfo> {
    blocks
        .get_mut(&label)
        .ok_or_else(|| ProfileError::internal(format!("no block info for {label:?}")))
}
