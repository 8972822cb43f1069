// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Façade over the profiled binary. Symbol-table and debug-line parsing are
//! external services; the decoder only needs name/start/end intervals and
//! per-address line records, loaded once and queried read-only.

use crate::addr::{Address, IntervalMap, IntervalRef};
use crate::collections::FxIndexMap;
use crate::error::ProfileResult;
use log::warn;

/// One debug-line record. For code compiled with linear-IR debug info, the
/// file is `<unit>.linear` and the line number is the linear-IR instruction
/// id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbgLine {
    pub file: String,
    pub line: u32,
}

/// Read-only view of the profiled binary.
pub trait ElfView {
    fn buildid(&self) -> Option<&str>;

    /// The function symbol interval enclosing `addr`, if any. Intervals are
    /// pairwise disjoint; the value is the linker symbol name.
    fn function_containing(&self, addr: Address) -> Option<IntervalRef<'_, String>>;

    /// Batch debug-line lookup for every address the profile mentions.
    /// Addresses without a line record are absent from the result.
    fn resolve_all(&self, addrs: &[Address]) -> FxIndexMap<Address, DbgLine>;
}

/// [`ElfView`] over pre-extracted symbols and line records, for callers that
/// parse the binary up front (and for tests).
#[derive(Debug, Default)]
pub struct StaticElfView {
    buildid: Option<String>,
    functions: IntervalMap<String>,
    lines: FxIndexMap<Address, DbgLine>,
    ambiguous_lines: u64,
}

impl StaticElfView {
    pub fn new(buildid: Option<String>) -> Self {
        Self {
            buildid,
            ..Default::default()
        }
    }

    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        start: Address,
        end: Address,
    ) -> ProfileResult<()> {
        self.functions.insert(start, end, name.into())
    }

    /// Record a debug line for `addr`. When several records map the same
    /// address the first one wins.
    pub fn add_line(&mut self, addr: Address, file: impl Into<String>, line: u32) {
        let file = file.into();
        if self.lines.contains_key(&addr) {
            self.ambiguous_lines += 1;
            warn!("multiple debug-line records for {addr:#x}; keeping the first");
            return;
        }
        self.lines.insert(addr, DbgLine { file, line });
    }

    /// How many addresses had more than one debug-line record.
    pub fn ambiguous_lines(&self) -> u64 {
        self.ambiguous_lines
    }
}

impl ElfView for StaticElfView {
    fn buildid(&self) -> Option<&str> {
        self.buildid.as_deref()
    }

    fn function_containing(&self, addr: Address) -> Option<IntervalRef<'_, String>> {
        self.functions.containing(addr)
    }

    fn resolve_all(&self, addrs: &[Address]) -> FxIndexMap<Address, DbgLine> {
        addrs
            .iter()
            .filter_map(|addr| self.lines.get(addr).map(|line| (*addr, line.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_all_skips_unknown_addresses() {
        let mut elf = StaticElfView::new(Some("abcd".into()));
        elf.add_function("crunch::main", 0x1000, 0x2000).unwrap();
        elf.add_line(0x1010, "crunch.linear", 4);
        elf.add_line(0x1010, "crunch.linear", 9);

        let lines = elf.resolve_all(&[0x1010, 0x1020]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[&0x1010].line, 4);
        assert_eq!(elf.ambiguous_lines(), 1);

        let hit = elf.function_containing(0x1fff).unwrap();
        assert_eq!(hit.value, "crunch::main");
        assert!(elf.function_containing(0x2000).is_none());
    }
}
