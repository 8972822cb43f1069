// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crcs::CrcKind;
use std::borrow::Cow;
use std::io;

/// Errors surfaced by the profile pipeline.
///
/// `BadSampleFormat` is recoverable: the sample reader logs it, bumps its
/// `ignored` counter and moves on to the next line. Every other kind aborts
/// the operation that produced it. `Internal` indicates a decoder bug rather
/// than bad input.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// A raw sample line that does not match the sampler's output format.
    #[error("bad sample format at line {line}: {reason}")]
    BadSampleFormat { line: u64, reason: Cow<'static, str> },

    /// Address arithmetic produced a function offset that does not fit in
    /// 32 bits.
    #[error("offset of {addr:#x} in {name} (starting at {start:#x}) is too large")]
    OffsetTooLarge {
        addr: u64,
        name: String,
        start: u64,
    },

    /// A function symbol was re-observed with different bounds.
    #[error(
        "function {name} moved: had {had_start:#x}..{had_finish:#x}, \
         saw {saw_start:#x}..{saw_finish:#x}"
    )]
    FunctionBoundaryDrift {
        name: String,
        had_start: u64,
        had_finish: u64,
        saw_start: u64,
        saw_finish: u64,
    },

    /// A 64-bit counter overflowed under [`crate::OverflowPolicy::Fail`].
    #[error("counter overflow")]
    CounterOverflow,

    /// The header of a binary profile did not match this library's format
    /// version.
    #[error("incompatible profile format: expected version {expected}, found {found}")]
    IncompatibleVersion { expected: u16, found: u16 },

    /// Profiles being merged come from different binaries.
    #[error("build id mismatch: {left} vs {right}")]
    BuildidMismatch { left: String, right: String },

    /// A required digest is absent, under [`crate::crcs::DigestPolicy::Fail`].
    #[error("no {kind} digest for {name}")]
    DigestMissing { name: String, kind: CrcKind },

    /// Two digests for the same key disagree, under
    /// [`crate::crcs::DigestPolicy::Fail`].
    #[error("{kind} digest mismatch for {name}")]
    DigestMismatch { name: String, kind: CrcKind },

    /// A stored profile that cannot be decoded.
    #[error("malformed profile: {0}")]
    MalformedProfile(Cow<'static, str>),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Invariant violation inside the decoder.
    #[error("internal: {0}")]
    Internal(Cow<'static, str>),
}

pub type ProfileResult<T> = Result<T, ProfileError>;

impl ProfileError {
    pub(crate) fn malformed(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::MalformedProfile(reason.into())
    }

    pub(crate) fn internal(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(reason.into())
    }

    pub(crate) fn bad_sample(line: u64, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::BadSampleFormat {
            line,
            reason: reason.into(),
        }
    }
}
