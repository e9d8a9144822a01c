//! NUMA node sets

use crate::{
    bitmap::{impl_bitmap_newtype, Bitmap},
    cpu::cpuset::CpuSet,
    object::{types::ObjectType, ObjectTree},
};
use derive_more::{AsRef, Deref, DerefMut, Display, From, Into};

/// A [`Bitmap`] whose bits are set according to NUMA node OS indices
#[derive(AsRef, Clone, Default, Deref, DerefMut, Display, Eq, From, Hash, Into, PartialEq)]
pub struct NodeSet(Bitmap);

/// # NodeSet-specific API
impl NodeSet {
    /// Convert a CPU set into a NUMA node set
    ///
    /// For each PU included in the input `cpuset`, set the corresponding local
    /// NUMA node in the output nodeset. On a machine without NUMA nodes, the
    /// result is always empty.
    #[doc(alias = "hwloc_cpuset_to_nodeset")]
    pub fn from_cpuset(tree: &ObjectTree, cpuset: &CpuSet) -> Self {
        tree.objects_with_type(ObjectType::NUMANode)
            .filter(|node| node.cpuset().intersects(cpuset))
            .filter_map(|node| node.os_index())
            .collect()
    }
}

impl_bitmap_newtype!(NodeSet);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::synthetic::SyntheticDescription;
    #[allow(unused)]
    use similar_asserts::assert_eq;

    #[test]
    fn from_cpuset() {
        let tree = "NUMANode:2 Core:4 PU:1"
            .parse::<SyntheticDescription>()
            .unwrap()
            .build_tree()
            .unwrap();
        let first_node = "0-3".parse::<CpuSet>().unwrap();
        assert_eq!(NodeSet::from_cpuset(&tree, &first_node), NodeSet::from_index(0));
        let straddling = "3-4".parse::<CpuSet>().unwrap();
        assert_eq!(NodeSet::from_cpuset(&tree, &straddling), (0..2).collect());
        assert_eq!(NodeSet::from_cpuset(&tree, &CpuSet::new()), NodeSet::new());
    }

    #[test]
    fn from_cpuset_uniform_memory() {
        let tree = "Package:1 Core:4 PU:1"
            .parse::<SyntheticDescription>()
            .unwrap()
            .build_tree()
            .unwrap();
        assert!(NodeSet::from_cpuset(&tree, tree.root().cpuset()).is_empty());
    }
}
