// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Emission of the hot-function ordering. The output is one symbol per
//! line, spliced by an external template into the linker script in place of
//! its `INCLUDE linker-script-hot` sentinel, pinning hot code into a
//! contiguous text segment.

use crate::error::ProfileResult;
use crate::profile::DecodedProfile;
use md5::Context;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::io::Write;

/// How the emitted function list is ordered. Every strategy is
/// deterministic for a fixed profile and inputs, so repeated builds produce
/// bit-identical layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReorderStrategy {
    /// Execution count descending, ties broken by ascending function id.
    ExecCountDesc,
    /// A deterministic shuffle; useful for measuring layout sensitivity.
    /// The effective seed mixes `seed` with the sorted input file names, so
    /// the order is insensitive to argv order.
    Random { seed: u64 },
    /// The order functions appear in the binary.
    InSrcOrder,
    /// Functions with samples by count descending, then the cold remainder
    /// in source order.
    HotColdJump,
}

/// The function symbols of `profile` in emission order.
///
/// `inputs` names the profile files feeding this layout; only
/// [`ReorderStrategy::Random`] looks at them.
pub fn hot_function_order(
    profile: &DecodedProfile,
    strategy: ReorderStrategy,
    inputs: &[String],
) -> Vec<String> {
    let mut funcs: Vec<_> = profile.functions.values().collect();
    match strategy {
        ReorderStrategy::ExecCountDesc => {
            funcs.sort_by(|a, b| b.count.cmp(&a.count).then(a.id.cmp(&b.id)));
        }
        ReorderStrategy::InSrcOrder => {
            funcs.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
        }
        ReorderStrategy::HotColdJump => {
            funcs.sort_by(|a, b| {
                let hot_a = a.count > 0;
                let hot_b = b.count > 0;
                hot_b
                    .cmp(&hot_a)
                    .then_with(|| {
                        if hot_a && hot_b {
                            b.count.cmp(&a.count)
                        } else {
                            a.start.cmp(&b.start)
                        }
                    })
                    .then(a.id.cmp(&b.id))
            });
        }
        ReorderStrategy::Random { seed } => {
            // Fix a base order first; map iteration order is not part of
            // the contract.
            funcs.sort_by(|a, b| a.id.cmp(&b.id));
            let mut rng = SmallRng::seed_from_u64(mix_seed(seed, inputs));
            funcs.shuffle(&mut rng);
        }
    }
    funcs.into_iter().map(|f| f.name.clone()).collect()
}

/// One symbol per line, in emission order.
pub fn write_layout_fragment<W: Write>(writer: &mut W, symbols: &[String]) -> ProfileResult<()> {
    for symbol in symbols {
        writeln!(writer, "{symbol}")?;
    }
    Ok(())
}

fn mix_seed(seed: u64, inputs: &[String]) -> u64 {
    let mut names: Vec<&str> = inputs.iter().map(String::as_str).collect();
    names.sort_unstable();
    let mut ctx = Context::new();
    for name in names {
        ctx.consume(name.as_bytes());
        ctx.consume([0]);
    }
    let digest = ctx.compute();
    let folded = u64::from_le_bytes(digest.0[..8].try_into().unwrap_or([0; 8]));
    seed ^ folded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crcs::{Crcs, CrcsConfig};
    use crate::profile::{Func, FunctionId};

    fn profile(counts: &[(&str, u64, u64)]) -> DecodedProfile {
        let mut p = DecodedProfile::new(Crcs::new(CrcsConfig::default()), None);
        for (index, &(name, start, count)) in counts.iter().enumerate() {
            let id = FunctionId::from_offset(index);
            let mut func = Func::new(id, name.to_string(), start, start + 0x100);
            func.count = count;
            p.functions.insert(id, func);
            p.name2id.insert(name.to_string(), id);
        }
        p
    }

    #[test]
    fn exec_count_desc_breaks_ties_by_id() {
        let p = profile(&[("a", 0x3000, 5), ("b", 0x1000, 9), ("c", 0x2000, 5)]);
        let order = hot_function_order(&p, ReorderStrategy::ExecCountDesc, &[]);
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn src_order_follows_addresses() {
        let p = profile(&[("a", 0x3000, 5), ("b", 0x1000, 9), ("c", 0x2000, 5)]);
        let order = hot_function_order(&p, ReorderStrategy::InSrcOrder, &[]);
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn hot_cold_puts_sampled_functions_first() {
        let p = profile(&[
            ("cold_hi", 0x1000, 0),
            ("hot_lo", 0x2000, 3),
            ("hot_hi", 0x3000, 8),
            ("cold_lo", 0x4000, 0),
        ]);
        let order = hot_function_order(&p, ReorderStrategy::HotColdJump, &[]);
        assert_eq!(order, vec!["hot_hi", "hot_lo", "cold_hi", "cold_lo"]);
    }

    #[test]
    fn random_is_deterministic_and_argv_insensitive() {
        let p = profile(&[("a", 0x1000, 1), ("b", 0x2000, 2), ("c", 0x3000, 3)]);
        let strategy = ReorderStrategy::Random { seed: 42 };
        let inputs_one = vec!["x.profile".to_string(), "y.profile".to_string()];
        let inputs_two = vec!["y.profile".to_string(), "x.profile".to_string()];

        let first = hot_function_order(&p, strategy, &inputs_one);
        let second = hot_function_order(&p, strategy, &inputs_two);
        assert_eq!(first, second);

        let reseeded = hot_function_order(&p, ReorderStrategy::Random { seed: 43 }, &inputs_one);
        // A different seed is allowed to coincide for tiny inputs, but the
        // sorted contents never change.
        let mut sorted = reseeded.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn fragment_is_one_symbol_per_line() {
        let mut buffer = Vec::new();
        write_layout_fragment(&mut buffer, &["f".to_string(), "g".to_string()]).unwrap();
        assert_eq!(buffer, b"f\ng\n");
    }
}
