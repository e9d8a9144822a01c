//! Common strategies for property-based testing
//!
//! Every proptest [`Strategy`] which is used by more than one module is
//! centralized here.

use crate::provider::synthetic::SyntheticDescription;
use proptest::prelude::*;
use std::fmt::Write;

/// Generate a valid synthetic description of a symmetric machine
///
/// Generated machines have at most 4 NUMA nodes and 2 packages, in either
/// order, followed by any subset of the L3, L2 and L1 cache levels, an
/// optional core level and a PU level.
pub(crate) fn synthetic_description() -> impl Strategy<Value = SyntheticDescription> {
    let outer = (
        prop::option::of(1usize..=4),
        prop::option::of(1usize..=2),
        any::<bool>(),
    );
    let caches = prop::collection::vec(
        prop::option::of((1usize..=2, prop::option::of(1u64..=64))),
        3,
    );
    let inner = (prop::option::of(1usize..=4), 1usize..=2);
    (outer, caches, inner).prop_map(|((nodes, packages, packages_first), caches, (cores, pus))| {
        let nodes = nodes.map(|arity| format!("NUMANode:{arity}"));
        let packages = packages.map(|arity| format!("Package:{arity}"));
        let mut levels = Vec::new();
        if packages_first {
            levels.extend(packages);
            levels.extend(nodes);
        } else {
            levels.extend(nodes);
            levels.extend(packages);
        }
        for (level, cache) in (1..=3).rev().zip(caches) {
            if let Some((arity, size_kib)) = cache {
                let mut desc = format!("L{level}Cache:{arity}");
                if let Some(size_kib) = size_kib {
                    write!(desc, "(size={size_kib}KB)").expect("writing to a String can't fail");
                }
                levels.push(desc);
            }
        }
        levels.extend(cores.map(|arity| format!("Core:{arity}")));
        levels.push(format!("PU:{pus}"));
        levels
            .join(" ")
            .parse()
            .expect("generated descriptions should be valid")
    })
}
