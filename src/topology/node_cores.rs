//! Ownership of cores by NUMA nodes

use super::discovery::unit_id;
use crate::object::{types::ObjectType, ObjectTree, TopologyObject};

/// IDs of the enumeration units below a NUMA node, from left to right
///
/// Fails with the number of units that were actually found if it is not
/// `cores_per_node`.
pub(super) fn assign_cores(
    tree: &ObjectTree,
    node_root: &TopologyObject,
    unit_type: ObjectType,
    cores_per_node: usize,
) -> Result<Vec<usize>, usize> {
    let mut owned = Vec::with_capacity(cores_per_node);
    collect_units(tree, node_root, unit_type, &mut owned);
    if owned.len() == cores_per_node {
        Ok(owned)
    } else {
        Err(owned.len())
    }
}

/// Depth-first search for enumeration units, which stops at the first unit
/// of each branch
fn collect_units(
    tree: &ObjectTree,
    object: &TopologyObject,
    unit_type: ObjectType,
    owned: &mut Vec<usize>,
) {
    if object.object_type() == unit_type {
        owned.push(unit_id(object));
        return;
    }
    for child in tree.children(object) {
        collect_units(tree, child, unit_type, owned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::synthetic::SyntheticDescription;
    #[allow(unused)]
    use similar_asserts::assert_eq;

    fn tree(description: &str) -> ObjectTree {
        description
            .parse::<SyntheticDescription>()
            .unwrap()
            .build_tree()
            .unwrap()
    }

    #[test]
    fn pu_units() {
        let tree = tree("NUMANode:2 Package:1 L2Cache:2 Core:2 PU:1");
        let node1 = tree.object_by_type(ObjectType::NUMANode, 1).unwrap();
        assert_eq!(
            assign_cores(&tree, node1, ObjectType::PU, 4),
            Ok(vec![4, 5, 6, 7])
        );
    }

    #[test]
    fn core_units_stop_descent() {
        let tree = tree("NUMANode:2 Core:2 PU:2");
        let node0 = tree.object_by_type(ObjectType::NUMANode, 0).unwrap();
        assert_eq!(
            assign_cores(&tree, node0, ObjectType::Core, 2),
            Ok(vec![0, 2])
        );
    }

    #[test]
    fn count_mismatch() {
        let tree = tree("NUMANode:2 Core:3 PU:1");
        let node0 = tree.object_by_type(ObjectType::NUMANode, 0).unwrap();
        assert_eq!(assign_cores(&tree, node0, ObjectType::PU, 2), Err(3));
    }
}
