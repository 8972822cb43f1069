// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Feedback-directed optimization support: turns hardware-sampled
//! Last-Branch-Record profiles of a compiled binary into per-function
//! block-level and edge-level execution weights, plus the hot-function
//! ordering consumed by the linker script.
//!
//! The pipeline is a strict sequence of single-threaded stages:
//! raw sample stream → [`raw::AggregatedRawProfile`] → (symbol and
//! debug-line lookups through [`elf::ElfView`]) → [`profile::DecodedProfile`]
//! → per-block counters via [`cfg::attribute`] once the linear IR of a
//! function is available.

pub mod addr;
pub mod cfg;
pub mod collections;
pub mod config;
pub mod crcs;
pub mod elf;
pub mod error;
pub mod layout;
pub mod profile;
pub mod raw;
pub mod store;
pub mod trim;

pub use config::{DecoderConfig, OverflowPolicy};
pub use error::{ProfileError, ProfileResult};
