//! Cores that share a cache

use super::discovery::unit_id;
use crate::object::{ObjectTree, TopologyObject};

/// IDs of up to `capacity` cores that share a cache with the
/// `core_index`-th enumeration unit
///
/// Candidates are examined in increasing index order, and accepted if their
/// deepest common ancestor with the target is a cache.
pub(super) fn compute_siblings(
    tree: &ObjectTree,
    units: &[&TopologyObject],
    core_index: usize,
    capacity: usize,
) -> Vec<usize> {
    let Some(&target) = units.get(core_index) else {
        return Vec::new();
    };
    units
        .iter()
        .enumerate()
        .filter(|&(idx, candidate)| {
            idx != core_index
                && tree
                    .common_ancestor(target, candidate)
                    .object_type()
                    .is_cache()
        })
        .map(|(_, candidate)| unit_id(candidate))
        .take(capacity)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        object::types::ObjectType, provider::synthetic::SyntheticDescription,
        strategies::synthetic_description,
    };
    use proptest::prelude::*;
    #[allow(unused)]
    use similar_asserts::assert_eq;

    fn siblings_of_all(description: &str, capacity: usize) -> Vec<Vec<usize>> {
        let tree = description
            .parse::<SyntheticDescription>()
            .unwrap()
            .build_tree()
            .unwrap();
        let units = tree.objects_with_type(ObjectType::PU).collect::<Vec<_>>();
        (0..units.len())
            .map(|idx| compute_siblings(&tree, &units, idx, capacity))
            .collect()
    }

    #[test]
    fn pairs_sharing_l2() {
        assert_eq!(
            siblings_of_all("Package:1 L2Cache:4 Core:2 PU:1", 1),
            vec![
                vec![1],
                vec![0],
                vec![3],
                vec![2],
                vec![5],
                vec![4],
                vec![7],
                vec![6]
            ]
        );
    }

    #[test]
    fn first_candidates_win() {
        let siblings = siblings_of_all("L3Cache:1 Core:4 PU:1", 2);
        assert_eq!(siblings[0], vec![1, 2]);
        assert_eq!(siblings[2], vec![0, 1]);
        assert_eq!(siblings[3], vec![0, 1]);
    }

    #[test]
    fn packages_and_nodes_are_not_caches() {
        let siblings = siblings_of_all("NUMANode:2 Package:1 Core:2 PU:1", 4);
        assert!(siblings.iter().all(Vec::is_empty));
    }

    #[test]
    fn out_of_range_target() {
        let tree = "Core:2 PU:1"
            .parse::<SyntheticDescription>()
            .unwrap()
            .build_tree()
            .unwrap();
        let units = tree.objects_with_type(ObjectType::PU).collect::<Vec<_>>();
        assert!(compute_siblings(&tree, &units, 2, 1).is_empty());
    }

    proptest! {
        #[test]
        fn siblings_are_symmetric(desc in synthetic_description()) {
            let tree = desc.build_tree().unwrap();
            let units = tree.objects_with_type(ObjectType::PU).collect::<Vec<_>>();
            let capacity = units.len();
            let all = (0..units.len())
                .map(|idx| compute_siblings(&tree, &units, idx, capacity))
                .collect::<Vec<_>>();
            for (idx, siblings) in all.iter().enumerate() {
                prop_assert!(!siblings.contains(&idx));
                prop_assert!(siblings.windows(2).all(|pair| pair[0] < pair[1]));
                for &sibling in siblings {
                    prop_assert!(all[sibling].contains(&idx));
                }
            }
        }
    }
}
