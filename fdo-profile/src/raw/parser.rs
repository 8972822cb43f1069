// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parser for the sampler's textual stream, one sample per line:
//!
//! ```text
//! <pid> <ip> [<from>/<to>/<M|P|->/<X|->/<A|->/<cycles>]*
//! ```
//!
//! Addresses are hex with or without a `0x` prefix. The branch stack is
//! emitted most-recent-first by the hardware; it is reversed on ingest so
//! that iteration proceeds chronologically.

use crate::addr::Address;
use crate::error::{ProfileError, ProfileResult};
use log::warn;
use std::collections::HashSet;
use std::io::BufRead;

/// The hardware's branch-prediction verdict for one LBR entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mispredict {
    Mispredicted,
    Predicted,
    /// The hardware does not report prediction outcomes.
    Unsupported,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BranchRecord {
    pub from: Address,
    pub to: Address,
    pub mispredict: Mispredict,
    /// Position in the hardware ring buffer; 0 is the most recent entry.
    pub stack_index: u32,
}

/// One observation from the sampler: the sampled instruction pointer and the
/// branch stack leading up to it, in chronological order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub ip: Address,
    pub brstack: Vec<BranchRecord>,
}

/// Restricts which processes' samples are ingested.
#[derive(Clone, Debug, Default)]
pub enum PidFilter {
    #[default]
    Any,
    Allow(HashSet<u32>),
}

impl PidFilter {
    fn accepts(&self, pid: u32) -> bool {
        match self {
            PidFilter::Any => true,
            PidFilter::Allow(pids) => pids.contains(&pid),
        }
    }
}

/// Lazy, one-pass reader over the sampler's output. Malformed lines are
/// logged with their line number, counted in [`SampleReader::ignored`] and
/// skipped; only I/O errors terminate iteration early.
pub struct SampleReader<R> {
    input: R,
    filter: PidFilter,
    buf: String,
    line: u64,
    ignored: u64,
}

impl<R: BufRead> SampleReader<R> {
    pub fn new(input: R, filter: PidFilter) -> Self {
        Self {
            input,
            filter,
            buf: String::new(),
            line: 0,
            ignored: 0,
        }
    }

    /// Lines skipped because they failed to parse.
    pub fn ignored(&self) -> u64 {
        self.ignored
    }
}

impl<R: BufRead> Iterator for SampleReader<R> {
    type Item = ProfileResult<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.input.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            self.line += 1;
            let text = self.buf.trim();
            if text.is_empty() {
                continue;
            }
            match parse_line(text, self.line) {
                Ok((pid, sample)) => {
                    if self.filter.accepts(pid) {
                        return Some(Ok(sample));
                    }
                }
                Err(e) => {
                    warn!("{e}");
                    self.ignored += 1;
                }
            }
        }
    }
}

fn parse_line(text: &str, line: u64) -> ProfileResult<(u32, Sample)> {
    let mut tokens = text.split_whitespace();
    let pid_token = tokens
        .next()
        .ok_or_else(|| ProfileError::bad_sample(line, "missing pid"))?;
    let ip_token = tokens
        .next()
        .ok_or_else(|| ProfileError::bad_sample(line, "missing ip"))?;

    let pid = pid_token
        .parse::<u32>()
        .map_err(|_| ProfileError::bad_sample(line, format!("bad pid {pid_token:?}")))?;
    let ip = parse_address(ip_token, line)?;

    let mut brstack = Vec::new();
    for (index, token) in tokens.enumerate() {
        brstack.push(parse_branch(token, index as u32, line)?);
    }
    // Hardware order is most-recent-first; flip to chronological.
    brstack.reverse();

    Ok((pid, Sample { ip, brstack }))
}

pub(crate) fn parse_address(token: &str, line: u64) -> ProfileResult<Address> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    Address::from_str_radix(digits, 16)
        .map_err(|_| ProfileError::bad_sample(line, format!("bad address {token:?}")))
}

fn parse_branch(token: &str, stack_index: u32, line: u64) -> ProfileResult<BranchRecord> {
    let mut fields = token.split('/');
    let mut next = |what: &'static str| {
        fields
            .next()
            .ok_or_else(|| ProfileError::bad_sample(line, format!("branch token missing {what}")))
    };

    let from = parse_address(next("source")?, line)?;
    let to = parse_address(next("target")?, line)?;
    let mispredict = match next("mispredict flag")? {
        "M" => Mispredict::Mispredicted,
        "P" => Mispredict::Predicted,
        "-" => Mispredict::Unsupported,
        other => {
            return Err(ProfileError::bad_sample(
                line,
                format!("bad mispredict flag {other:?}"),
            ))
        }
    };
    match next("tx flag")? {
        "X" | "-" => {}
        other => {
            return Err(ProfileError::bad_sample(
                line,
                format!("bad in-transaction flag {other:?}"),
            ))
        }
    }
    match next("abort flag")? {
        "A" | "-" => {}
        other => {
            return Err(ProfileError::bad_sample(
                line,
                format!("bad abort flag {other:?}"),
            ))
        }
    }
    // Cycle counts are validated but unused.
    let cycles = next("cycles")?;
    cycles
        .parse::<u64>()
        .map_err(|_| ProfileError::bad_sample(line, format!("bad cycle count {cycles:?}")))?;
    if fields.next().is_some() {
        return Err(ProfileError::bad_sample(
            line,
            format!("trailing fields in branch token {token:?}"),
        ));
    }

    Ok(BranchRecord {
        from,
        to,
        mispredict,
        stack_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(input: &str) -> (Vec<Sample>, u64) {
        let mut reader = SampleReader::new(Cursor::new(input), PidFilter::Any);
        let samples: Vec<_> = reader.by_ref().map(|s| s.unwrap()).collect();
        (samples, reader.ignored())
    }

    #[test]
    fn parses_sample_without_branch_stack() {
        let (samples, ignored) = read_all("7 0x400500\n");
        assert_eq!(ignored, 0);
        assert_eq!(samples, vec![Sample { ip: 0x400500, brstack: vec![] }]);
    }

    #[test]
    fn reverses_branch_stack_to_chronological_order() {
        let (samples, _) =
            read_all("7 400500 0x400600/0x400480/M/X/A/10 0x400490/0x400600/P/-/-/20\n");
        let brstack = &samples[0].brstack;
        assert_eq!(samples[0].ip, 0x400500);
        assert_eq!(brstack.len(), 2);
        // Chronologically first entry is the one the hardware reported last.
        assert_eq!(brstack[0].from, 0x400490);
        assert_eq!(brstack[0].stack_index, 1);
        assert_eq!(brstack[0].mispredict, Mispredict::Predicted);
        assert_eq!(brstack[1].to, 0x400480);
        assert_eq!(brstack[1].stack_index, 0);
        assert_eq!(brstack[1].mispredict, Mispredict::Mispredicted);
    }

    #[test]
    fn malformed_lines_are_counted_and_skipped() {
        let input = "7\n\
                     7 0x400500 zz/0x1/P/X/A/1\n\
                     7 0x400500 0x1/0x2/Q/X/A/1\n\
                     7 0x400500 0x1/0x2/P/X/A/abc\n\
                     7 0x400500 0x1/0x2/P/X/A/1/9\n\
                     8 0x400600\n";
        let (samples, ignored) = read_all(input);
        assert_eq!(ignored, 5);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].ip, 0x400600);
    }

    #[test]
    fn pid_filter_drops_other_processes() {
        let mut reader = SampleReader::new(
            Cursor::new("7 0x10\n9 0x20\n7 0x30\n"),
            PidFilter::Allow(HashSet::from([7])),
        );
        let ips: Vec<_> = reader.by_ref().map(|s| s.unwrap().ip).collect();
        assert_eq!(ips, vec![0x10, 0x30]);
        assert_eq!(reader.ignored(), 0);
    }

    #[test]
    fn blank_lines_are_not_errors() {
        let (samples, ignored) = read_all("\n  \n7 0x10\n\n");
        assert_eq!(samples.len(), 1);
        assert_eq!(ignored, 0);
    }
}
