//! Summary of an object tree into counts and per-core/per-node tables

use super::{node_cores, siblings, Core, Counts, Node};
use crate::{
    errors::InitError,
    object::{types::ObjectType, ObjectTree, TopologyObject},
};
use arrayvec::ArrayVec;
use std::sync::OnceLock;
use tracing::debug;

/// Result of topology discovery
#[derive(Debug)]
pub(super) struct Discovery {
    /// Summary counts, except for `ngpus`
    pub(super) counts: Counts,

    /// One entry per enumeration unit
    pub(super) cores: Vec<Core>,

    /// One entry per NUMA node
    pub(super) nodes: Vec<Node>,
}

/// Summarize an object tree
///
/// `sibling_capacity` overrides the number of siblings that are looked up
/// for each core.
pub(super) fn discover(
    tree: &ObjectTree,
    sibling_capacity: Option<usize>,
) -> Result<Discovery, InitError> {
    let nnodes = tree.num_objects_with_type(ObjectType::NUMANode);
    let nsockets = tree.num_objects_with_type(ObjectType::Package);
    let npus = tree.num_objects_with_type(ObjectType::PU);
    if npus == 0 {
        return Err(InitError::NoProcessingUnits);
    }
    let mut ncores = tree.num_objects_with_type(ObjectType::Core);
    if ncores == 0 {
        debug!("no core level, using processing units as cores");
        ncores = npus;
    }
    let nmemcontroller = memory_controllers(nnodes, nsockets);
    if nnodes > 0 && ncores % nnodes != 0 {
        return Err(InitError::UnevenNodes { ncores, nnodes });
    }

    // Enumerate the machine with a single granularity
    let unit_type = if ncores == npus {
        ObjectType::PU
    } else {
        ObjectType::Core
    };
    let units = tree.objects_with_type(unit_type).collect::<Vec<_>>();
    let Some(&first_unit) = units.first() else {
        return Err(InitError::NoProcessingUnits);
    };
    debug!("enumerating {} {unit_type} objects as cores", units.len());

    // Cache levels are deduced from the first unit
    let ncaches = cache_chain(tree, first_unit).count();
    let nshared_caches = cache_chain(tree, first_unit)
        .filter(|cache| cache.arity() > 1)
        .count();
    let nsiblings = sibling_capacity.unwrap_or_else(|| match units.as_slice() {
        [first, second, ..] => tree.common_ancestor(first, second).arity().saturating_sub(1),
        _ => 0,
    });
    debug!("{ncaches} cache levels, {nshared_caches} shared, up to {nsiblings} siblings per core");

    let mut cores = Vec::with_capacity(units.len());
    for (idx, &unit) in units.iter().enumerate() {
        let caches = cache_chain(tree, unit)
            .map(|cache| cache.cache_size().unwrap_or(0) / 1024)
            .collect::<ArrayVec<_, { ObjectType::MAX_CACHE_LEVELS }>>();
        if caches.len() != ncaches {
            return Err(InitError::IrregularCaches {
                core: idx,
                expected: ncaches,
                found: caches.len(),
            });
        }
        cores.push(Core {
            id: unit_id(unit),
            numa_node: tree
                .ancestor_with_type(unit, ObjectType::NUMANode)
                .map(TopologyObject::logical_index),
            caches,
            shared_caches: (0..ncaches)
                .map(|level| level >= ncaches - nshared_caches)
                .collect(),
            siblings: siblings::compute_siblings(tree, &units, idx, nsiblings),
        });
    }

    let mut nodes = Vec::with_capacity(nnodes);
    if nnodes > 0 {
        let cores_per_node = ncores / nnodes;
        for (idx, node) in tree.objects_with_type(ObjectType::NUMANode).enumerate() {
            let owned_cores = node_cores::assign_cores(tree, node, unit_type, cores_per_node)
                .map_err(|found| InitError::NodePartition {
                    node: idx,
                    expected: cores_per_node,
                    found,
                })?;
            nodes.push(Node {
                id: node.os_index().unwrap_or(idx),
                total_memory: node.total_memory().unwrap_or(0),
                cores_per_node,
                owned_cores,
                gpus: OnceLock::new(),
            });
        }
    }

    Ok(Discovery {
        counts: Counts {
            nnodes,
            nsockets,
            ncores,
            npus,
            nmemcontroller,
            ncaches,
            nshared_caches,
            nsiblings,
            ngpus: 0,
        },
        cores,
        nodes,
    })
}

/// Number of memory controllers per socket
///
/// Machines without a package level count as having one socket.
fn memory_controllers(nnodes: usize, nsockets: usize) -> usize {
    let nsockets = nsockets.max(1);
    if nnodes > nsockets {
        nnodes / nsockets
    } else {
        1
    }
}

/// Caches above an enumeration unit, innermost first
fn cache_chain<'tree>(
    tree: &'tree ObjectTree,
    unit: &'tree TopologyObject,
) -> impl Iterator<Item = &'tree TopologyObject> {
    tree.ancestors(unit)
        .filter(|ancestor| ancestor.object_type().is_cache())
        .take(ObjectType::MAX_CACHE_LEVELS)
}

/// Core ID of an enumeration unit, i.e. the OS index of its first PU
pub(super) fn unit_id(unit: &TopologyObject) -> usize {
    unit.cpuset()
        .first()
        .or(unit.os_index())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu::cpuset::CpuSet,
        object::{ObjectSpec, ObjectTree},
        provider::synthetic::SyntheticDescription,
        strategies::synthetic_description,
    };
    use proptest::prelude::*;
    #[allow(unused)]
    use similar_asserts::assert_eq;

    fn synthetic(description: &str) -> ObjectTree {
        description
            .parse::<SyntheticDescription>()
            .unwrap()
            .build_tree()
            .unwrap()
    }

    fn pus_and_nodes(npus: usize, nodes: &[&str]) -> ObjectTree {
        let mut specs = (0..npus).map(ObjectSpec::pu).collect::<Vec<_>>();
        for (os_index, cpus) in nodes.iter().enumerate() {
            specs.push(ObjectSpec::numa_node(os_index, cpus.parse().unwrap(), 1 << 30));
        }
        ObjectTree::from_objects(specs).unwrap()
    }

    #[test]
    fn memory_controllers_per_socket() {
        assert_eq!(memory_controllers(0, 1), 1);
        assert_eq!(memory_controllers(2, 2), 1);
        assert_eq!(memory_controllers(4, 2), 2);
        assert_eq!(memory_controllers(2, 0), 2);
        assert_eq!(memory_controllers(1, 2), 1);
    }

    #[test]
    fn smt_machine_enumerates_cores() {
        let tree = synthetic("Package:2 L3Cache:1 Core:4 PU:2");
        let discovery = discover(&tree, None).unwrap();
        assert_eq!(discovery.counts.ncores, 8);
        assert_eq!(discovery.counts.npus, 16);
        assert_eq!(discovery.counts.nsockets, 2);
        let ids = discovery.cores.iter().map(Core::id).collect::<Vec<_>>();
        assert_eq!(ids, (0..16).step_by(2).collect::<Vec<_>>());
        assert!(discovery.nodes.is_empty());
        assert!(discovery.cores.iter().all(|core| core.numa_node().is_none()));
    }

    #[test]
    fn no_core_level() {
        let tree = synthetic("NUMANode:2 L2Cache:2 PU:1");
        let discovery = discover(&tree, None).unwrap();
        assert_eq!(discovery.counts.ncores, 4);
        assert_eq!(discovery.counts.nmemcontroller, 2);
        assert_eq!(discovery.nodes[1].owned_cores(), &[2, 3]);
        assert_eq!(discovery.cores[3].numa_node(), Some(1));
    }

    #[test]
    fn sibling_capacity_override() {
        let tree = synthetic("Package:1 L2Cache:1 Core:4 PU:1");
        let default = discover(&tree, None).unwrap();
        assert_eq!(default.counts.nsiblings, 3);
        assert_eq!(default.cores[1].siblings(), &[0, 2, 3]);
        let limited = discover(&tree, Some(1)).unwrap();
        assert_eq!(limited.counts.nsiblings, 1);
        assert_eq!(limited.cores[1].siblings(), &[0]);
    }

    #[test]
    fn uneven_nodes() {
        let tree = pus_and_nodes(3, &["0-1", "2"]);
        assert!(matches!(
            discover(&tree, None),
            Err(InitError::UnevenNodes {
                ncores: 3,
                nnodes: 2
            })
        ));
    }

    #[test]
    fn unbalanced_nodes() {
        let tree = pus_and_nodes(4, &["0-2", "3"]);
        assert!(matches!(
            discover(&tree, None),
            Err(InitError::NodePartition {
                node: 0,
                expected: 2,
                found: 3
            })
        ));
    }

    #[test]
    fn irregular_caches() {
        let mut specs = (0..4).map(ObjectSpec::pu).collect::<Vec<_>>();
        specs.push(ObjectSpec::cache(
            ObjectType::L2Cache,
            "0-1".parse::<CpuSet>().unwrap(),
            1 << 20,
        ));
        let tree = ObjectTree::from_objects(specs).unwrap();
        assert!(matches!(
            discover(&tree, None),
            Err(InitError::IrregularCaches {
                core: 2,
                expected: 1,
                found: 0
            })
        ));
    }

    proptest! {
        #[test]
        fn generated_topologies(desc in synthetic_description()) {
            let tree = desc.build_tree().unwrap();
            let Discovery { counts, cores, nodes } = discover(&tree, None).unwrap();
            prop_assert_eq!(cores.len(), counts.ncores);
            prop_assert_eq!(nodes.len(), counts.nnodes);
            prop_assert!(counts.nshared_caches <= counts.ncaches);
            for core in &cores {
                prop_assert_eq!(core.caches().len(), counts.ncaches);
                prop_assert!(core.siblings().len() <= counts.nsiblings);
                prop_assert!(!core.siblings().contains(&core.id()));
                let shared = core.shared_caches().iter().filter(|&&shared| shared).count();
                prop_assert_eq!(shared, counts.nshared_caches);
            }
            let owned = nodes.iter().map(|node| node.owned_cores().len()).sum::<usize>();
            if counts.nnodes > 0 {
                prop_assert_eq!(owned, counts.ncores);
                for node in &nodes {
                    prop_assert_eq!(node.cores_per_node() * counts.nnodes, counts.ncores);
                }
            }
        }
    }
}
