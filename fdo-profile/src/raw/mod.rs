// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw side of the pipeline: parsing the sampler's textual output and
//! aggregating samples into dense counters keyed by address tuples.

mod aggregate;
mod parser;

pub use aggregate::AggregatedRawProfile;
pub use parser::{BranchRecord, Mispredict, PidFilter, Sample, SampleReader};
