// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Content digests of IR units and functions, stored alongside a decoded
//! profile and checked when the profile is consumed. They protect a later
//! recompilation from silently applying weights to code that has drifted
//! since the profile was taken.

use crate::collections::{FxIndexMap, FxIndexSet};
use crate::error::{ProfileError, ProfileResult};
use log::{debug, warn};
use std::fmt;
use std::str::FromStr;

/// A 16-byte MD5 digest, displayed and parsed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Md5Digest([u8; 16]);

impl Md5Digest {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Streaming digest over byte chunks.
    pub fn of_parts(parts: &[impl AsRef<[u8]>]) -> Self {
        let mut ctx = md5::Context::new();
        for part in parts {
            ctx.consume(part);
        }
        Self(ctx.compute().0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Md5Digest({self})")
    }
}

impl FromStr for Md5Digest {
    type Err = ProfileError;

    fn from_str(s: &str) -> ProfileResult<Self> {
        if s.len() != 32 || !s.is_ascii() {
            return Err(ProfileError::malformed(format!("bad digest {s:?}")));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let text = std::str::from_utf8(chunk)
                .map_err(|_| ProfileError::malformed(format!("bad digest {s:?}")))?;
            bytes[i] = u8::from_str_radix(text, 16)
                .map_err(|_| ProfileError::malformed(format!("bad digest {s:?}")))?;
        }
        Ok(Self(bytes))
    }
}

/// What a digest fingerprints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CrcKind {
    /// A whole compilation unit.
    Unit,
    /// A single IR function.
    Func,
}

impl fmt::Display for CrcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CrcKind::Unit => "unit",
            CrcKind::Func => "func",
        })
    }
}

impl FromStr for CrcKind {
    type Err = ProfileError;

    fn from_str(s: &str) -> ProfileResult<Self> {
        match s {
            "unit" => Ok(CrcKind::Unit),
            "func" => Ok(CrcKind::Func),
            other => Err(ProfileError::malformed(format!("bad digest kind {other:?}"))),
        }
    }
}

/// What to do when a digest is missing or disagrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DigestPolicy {
    /// Abort the operation.
    #[default]
    Fail,
    /// Drop the entry and continue without it.
    Skip,
    /// Keep going with the stored value, logging a diagnostic.
    UseAnyway,
}

impl fmt::Display for DigestPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DigestPolicy::Fail => "fail",
            DigestPolicy::Skip => "skip",
            DigestPolicy::UseAnyway => "use_anyway",
        })
    }
}

impl FromStr for DigestPolicy {
    type Err = ProfileError;

    fn from_str(s: &str) -> ProfileResult<Self> {
        match s {
            "fail" => Ok(DigestPolicy::Fail),
            "skip" => Ok(DigestPolicy::Skip),
            "use_anyway" => Ok(DigestPolicy::UseAnyway),
            other => Err(ProfileError::malformed(format!(
                "bad digest policy {other:?}"
            ))),
        }
    }
}

/// Which digest kinds a profile carries and how disagreements resolve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrcsConfig {
    pub unit: bool,
    pub func: bool,
    /// Strip debug annotations (linear-id tables) before hashing, so that
    /// rebuilding with different debug flags does not invalidate profiles.
    pub ignore_dbg: bool,
    pub on_missing: DigestPolicy,
    pub on_mismatch: DigestPolicy,
}

impl CrcsConfig {
    /// At least one digest kind must be enabled.
    pub fn new(
        unit: bool,
        func: bool,
        ignore_dbg: bool,
        on_missing: DigestPolicy,
        on_mismatch: DigestPolicy,
    ) -> ProfileResult<Self> {
        if !unit && !func {
            return Err(ProfileError::internal(
                "digest config must enable unit digests, function digests, or both",
            ));
        }
        Ok(Self {
            unit,
            func,
            ignore_dbg,
            on_missing,
            on_mismatch,
        })
    }

    pub fn tracks(&self, kind: CrcKind) -> bool {
        match kind {
            CrcKind::Unit => self.unit,
            CrcKind::Func => self.func,
        }
    }
}

impl Default for CrcsConfig {
    fn default() -> Self {
        Self {
            unit: true,
            func: true,
            ignore_dbg: false,
            on_missing: DigestPolicy::default(),
            on_mismatch: DigestPolicy::default(),
        }
    }
}

/// Outcome of checking an expected digest against the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrcCheck {
    Match,
    Missing,
    Mismatch,
}

/// The digest registry of one profile: unit-or-function name → digest.
#[derive(Clone, Debug, PartialEq)]
pub struct Crcs {
    entries: FxIndexMap<String, (CrcKind, Md5Digest)>,
    config: CrcsConfig,
}

impl Crcs {
    pub fn new(config: CrcsConfig) -> Self {
        Self {
            entries: FxIndexMap::default(),
            config,
        }
    }

    pub fn config(&self) -> &CrcsConfig {
        &self.config
    }

    /// Record a digest. Re-adding an identical entry is a no-op; a
    /// conflicting entry resolves per the mismatch policy. Kinds the config
    /// does not track are ignored.
    pub fn add(&mut self, name: &str, kind: CrcKind, digest: Md5Digest) -> ProfileResult<()> {
        if !self.config.tracks(kind) {
            return Ok(());
        }
        match self.entries.get(name).copied() {
            None => {
                self.entries.insert(name.to_string(), (kind, digest));
                Ok(())
            }
            Some((stored_kind, stored)) if stored_kind == kind && stored == digest => Ok(()),
            Some(_) => self.resolve_mismatch(name, kind).map(|_| ()),
        }
    }

    /// Compare an expected digest against the registry. The caller applies
    /// its policy to `Missing`/`Mismatch`; [`Crcs::verify`] does both steps.
    pub fn check(&self, name: &str, kind: CrcKind, expected: Md5Digest) -> CrcCheck {
        match self.entries.get(name).copied() {
            None => CrcCheck::Missing,
            Some((stored_kind, stored)) if stored_kind == kind && stored == expected => {
                CrcCheck::Match
            }
            Some(_) => CrcCheck::Mismatch,
        }
    }

    /// [`Crcs::check`] plus policy application. `Ok(true)` means the entry
    /// is usable, `Ok(false)` that it was skipped.
    pub fn verify(&mut self, name: &str, kind: CrcKind, expected: Md5Digest) -> ProfileResult<bool> {
        if !self.config.tracks(kind) {
            return Ok(true);
        }
        match self.check(name, kind, expected) {
            CrcCheck::Match => Ok(true),
            CrcCheck::Missing => match self.config.on_missing {
                DigestPolicy::Fail => Err(ProfileError::DigestMissing {
                    name: name.to_string(),
                    kind,
                }),
                DigestPolicy::Skip => {
                    debug!("no {kind} digest for {name}; skipping");
                    Ok(false)
                }
                DigestPolicy::UseAnyway => {
                    warn!("no {kind} digest for {name}; using the profile anyway");
                    Ok(true)
                }
            },
            CrcCheck::Mismatch => {
                let usable = self.resolve_mismatch(name, kind)?;
                Ok(matches!(usable, MismatchResolution::Use))
            }
        }
    }

    /// Remove every entry whose name is not in the keep set.
    pub fn trim(&mut self, keep: &FxIndexSet<String>) {
        self.entries.retain(|name, _| keep.contains(name));
    }

    /// Union another registry into this one; conflicts resolve per the
    /// mismatch policy.
    pub fn merge(&mut self, other: &Crcs) -> ProfileResult<()> {
        for (name, &(kind, digest)) in &other.entries {
            self.add(name, kind, digest)?;
        }
        Ok(())
    }

    /// Insertion that bypasses policies, for deserialization of an
    /// already-validated registry.
    pub(crate) fn insert_unchecked(&mut self, name: String, kind: CrcKind, digest: Md5Digest) {
        self.entries.insert(name, (kind, digest));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, CrcKind, &Md5Digest)> {
        self.entries
            .iter()
            .map(|(name, (kind, digest))| (name.as_str(), *kind, digest))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn resolve_mismatch(&mut self, name: &str, kind: CrcKind) -> ProfileResult<MismatchResolution> {
        match self.config.on_mismatch {
            DigestPolicy::Fail => Err(ProfileError::DigestMismatch {
                name: name.to_string(),
                kind,
            }),
            DigestPolicy::Skip => {
                debug!("{kind} digest mismatch for {name}; dropping the entry");
                self.entries.shift_remove(name);
                Ok(MismatchResolution::Dropped)
            }
            DigestPolicy::UseAnyway => {
                warn!("{kind} digest mismatch for {name}; keeping the stored digest");
                Ok(MismatchResolution::Use)
            }
        }
    }
}

enum MismatchResolution {
    Use,
    Dropped,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(seed: u8) -> Md5Digest {
        Md5Digest::of_parts(&[[seed]])
    }

    fn config(on_mismatch: DigestPolicy) -> CrcsConfig {
        CrcsConfig::new(true, true, false, DigestPolicy::Fail, on_mismatch).unwrap()
    }

    #[test]
    fn config_requires_a_kind() {
        assert!(CrcsConfig::new(false, false, false, DigestPolicy::Fail, DigestPolicy::Fail)
            .is_err());
    }

    #[test]
    fn digest_hex_roundtrip() {
        let d = digest(42);
        let text = d.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<Md5Digest>().unwrap(), d);
        assert!("not-hex".parse::<Md5Digest>().is_err());
    }

    #[test]
    fn duplicate_add_with_same_digest_is_noop() {
        let mut crcs = Crcs::new(config(DigestPolicy::Fail));
        crcs.add("unit_a", CrcKind::Unit, digest(1)).unwrap();
        crcs.add("unit_a", CrcKind::Unit, digest(1)).unwrap();
        assert_eq!(crcs.len(), 1);
    }

    #[test]
    fn conflicting_add_follows_policy() {
        let mut crcs = Crcs::new(config(DigestPolicy::Fail));
        crcs.add("f", CrcKind::Func, digest(1)).unwrap();
        assert!(matches!(
            crcs.add("f", CrcKind::Func, digest(2)),
            Err(ProfileError::DigestMismatch { .. })
        ));

        let mut crcs = Crcs::new(config(DigestPolicy::Skip));
        crcs.add("f", CrcKind::Func, digest(1)).unwrap();
        crcs.add("f", CrcKind::Func, digest(2)).unwrap();
        assert!(crcs.is_empty());

        let mut crcs = Crcs::new(config(DigestPolicy::UseAnyway));
        crcs.add("f", CrcKind::Func, digest(1)).unwrap();
        crcs.add("f", CrcKind::Func, digest(2)).unwrap();
        assert_eq!(crcs.check("f", CrcKind::Func, digest(1)), CrcCheck::Match);
    }

    #[test]
    fn untracked_kinds_are_ignored() {
        let cfg = CrcsConfig::new(true, false, false, DigestPolicy::Fail, DigestPolicy::Fail)
            .unwrap();
        let mut crcs = Crcs::new(cfg);
        crcs.add("f", CrcKind::Func, digest(1)).unwrap();
        assert!(crcs.is_empty());
        assert!(crcs.verify("f", CrcKind::Func, digest(2)).unwrap());
    }

    #[test]
    fn verify_applies_missing_policy() {
        let mut crcs = Crcs::new(config(DigestPolicy::Fail));
        assert!(matches!(
            crcs.verify("ghost", CrcKind::Unit, digest(1)),
            Err(ProfileError::DigestMissing { .. })
        ));

        let cfg =
            CrcsConfig::new(true, true, false, DigestPolicy::Skip, DigestPolicy::Fail).unwrap();
        let mut crcs = Crcs::new(cfg);
        assert!(!crcs.verify("ghost", CrcKind::Unit, digest(1)).unwrap());
    }

    #[test]
    fn trim_retains_only_kept_names() {
        let mut crcs = Crcs::new(config(DigestPolicy::Fail));
        crcs.add("keep", CrcKind::Func, digest(1)).unwrap();
        crcs.add("drop", CrcKind::Func, digest(2)).unwrap();
        let keep: FxIndexSet<String> = ["keep".to_string()].into_iter().collect();
        crcs.trim(&keep);
        assert_eq!(crcs.len(), 1);
        assert_eq!(crcs.check("keep", CrcKind::Func, digest(1)), CrcCheck::Match);
    }
}
