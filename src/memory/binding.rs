//! Memory binding

use crate::{
    cpu::binding::BindingTarget, errors::BindError, memory::nodeset::NodeSet,
    topology::ArchTopology,
};
use derive_more::Display;
use strum::EnumIter;
use tracing::{debug, trace};

/// Memory binding policy, as understood by hardware providers
#[derive(Copy, Clone, Debug, Display, EnumIter, Eq, Hash, PartialEq)]
#[doc(alias = "hwloc_membind_policy_t")]
pub enum MemoryBindingPolicy {
    /// Allocate each memory page individually on the local NUMA node of the
    /// thread that touches it
    ///
    /// The associated node set should usually be the machine's full node set,
    /// so that the touching thread may run and allocate on any node.
    #[doc(alias = "HWLOC_MEMBIND_FIRSTTOUCH")]
    FirstTouch,

    /// Allocate memory on the specified nodes
    #[doc(alias = "HWLOC_MEMBIND_BIND")]
    Bind,

    /// Allocate memory on the given nodes in an interleaved round-robin manner
    #[doc(alias = "HWLOC_MEMBIND_INTERLEAVE")]
    Interleave,

    /// Allocate memory on the given nodes in a weighted interleaved manner
    #[doc(alias = "HWLOC_MEMBIND_WEIGHTED_INTERLEAVE")]
    WeightedInterleave,

    /// Migrate pages to the local NUMA node on next touch
    #[doc(alias = "HWLOC_MEMBIND_NEXTTOUCH")]
    NextTouch,

    /// A policy that has no equivalent in this enumeration
    #[doc(alias = "HWLOC_MEMBIND_MIXED")]
    Other,
}

/// Memory placement policy, as exposed to applications
#[derive(Copy, Clone, Debug, Default, Display, EnumIter, Eq, Hash, PartialEq)]
pub enum MemoryPolicy {
    /// Let the OS place pages on the node of the first thread touching them
    Os,

    /// Place pages on the NUMA node that the process currently runs on
    Local,

    /// Spread pages across the NUMA nodes of the current socket or machine
    Interleave,

    /// Policy that cannot be expressed here, or machine without NUMA nodes
    #[default]
    Unknown,
}

/// Memory binding of the caller, as reported by
/// [`ArchTopology::get_memory_policy()`]
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct MemoryBinding {
    /// Logical index of the NUMA node that memory is bound to
    ///
    /// This is `None` when the binding spans several nodes in a way that
    /// cannot be summarized by a single node.
    pub node: Option<usize>,

    /// Placement policy
    pub policy: MemoryPolicy,
}

/// # Memory binding
///
/// On Linux, memory policies are a property of the calling thread: a policy
/// set by one thread does not affect allocations made by other threads of the
/// process, except for threads spawned by it afterwards.
impl ArchTopology {
    /// Query the caller's memory placement policy
    ///
    /// On machines without NUMA nodes, this always reports an
    /// [`Unknown`](MemoryPolicy::Unknown) policy with no node.
    ///
    /// # Errors
    ///
    /// - [`Destroyed`] if the topology was destroyed.
    /// - [`Rejected`] if the provider could not report the binding.
    ///
    /// [`Destroyed`]: BindError::Destroyed
    /// [`Rejected`]: BindError::Rejected
    #[doc(alias = "hwloc_get_membind")]
    pub fn get_memory_policy(&self) -> Result<MemoryBinding, BindError> {
        let state = self.state()?;
        if self.counts().nnodes == 0 {
            return Ok(MemoryBinding::default());
        }
        let (nodeset, native) = state.provider.memory_binding()?;
        trace!("memory is bound to nodes {nodeset} with policy {native}");
        let first_node = || {
            nodeset
                .first()
                .and_then(|os_index| state.tree.node_with_os_index(os_index))
                .map(|node| node.logical_index())
        };
        Ok(match native {
            MemoryBindingPolicy::FirstTouch => MemoryBinding {
                node: first_node(),
                policy: MemoryPolicy::Os,
            },
            MemoryBindingPolicy::Bind => MemoryBinding {
                node: first_node(),
                policy: MemoryPolicy::Local,
            },
            MemoryBindingPolicy::Interleave => MemoryBinding {
                node: None,
                policy: MemoryPolicy::Interleave,
            },
            MemoryBindingPolicy::WeightedInterleave
            | MemoryBindingPolicy::NextTouch
            | MemoryBindingPolicy::Other => MemoryBinding::default(),
        })
    }

    /// Set the caller's memory placement policy
    ///
    /// - [`Os`] lets the OS place pages on first touch, across all nodes.
    /// - [`Local`] binds memory to the NUMA node that the process currently
    ///   runs on.
    /// - [`Interleave`] spreads memory across the nodes of the smallest
    ///   object above the current node that spans several nodes, usually
    ///   its socket or the whole machine.
    ///
    /// On machines without NUMA nodes, this does nothing.
    ///
    /// # Errors
    ///
    /// - [`Destroyed`] if the topology was destroyed.
    /// - [`NoCurrentNode`] if the process' CPU binding covers no NUMA node.
    /// - [`Rejected`] if the provider refused the binding.
    /// - [`UnsupportedPolicy`] if `policy` is [`Unknown`].
    ///
    /// [`Destroyed`]: BindError::Destroyed
    /// [`Interleave`]: MemoryPolicy::Interleave
    /// [`Local`]: MemoryPolicy::Local
    /// [`NoCurrentNode`]: BindError::NoCurrentNode
    /// [`Os`]: MemoryPolicy::Os
    /// [`Rejected`]: BindError::Rejected
    /// [`Unknown`]: MemoryPolicy::Unknown
    /// [`UnsupportedPolicy`]: BindError::UnsupportedPolicy
    #[doc(alias = "hwloc_set_membind")]
    pub fn set_memory_policy(&self, policy: MemoryPolicy) -> Result<(), BindError> {
        let state = self.state()?;
        if self.counts().nnodes == 0 {
            debug!("ignoring {policy} memory policy on a machine without NUMA nodes");
            return Ok(());
        }
        let (nodeset, native): (&NodeSet, _) = match policy {
            MemoryPolicy::Os => (state.tree.nodeset(), MemoryBindingPolicy::FirstTouch),
            MemoryPolicy::Local => {
                let node = self
                    .current_node(BindingTarget::Process)?
                    .ok_or(BindError::NoCurrentNode)?;
                (node.nodeset(), MemoryBindingPolicy::Bind)
            }
            MemoryPolicy::Interleave => {
                let node = self
                    .current_node(BindingTarget::Process)?
                    .ok_or(BindError::NoCurrentNode)?;
                let aggregate = state
                    .tree
                    .ancestors(node)
                    .find(|ancestor| ancestor.nodeset().weight() > 1)
                    .unwrap_or(node);
                (aggregate.nodeset(), MemoryBindingPolicy::Interleave)
            }
            MemoryPolicy::Unknown => return Err(BindError::UnsupportedPolicy(policy)),
        };
        trace!("binding memory to nodes {nodeset} with policy {native}");
        state.provider.bind_memory(nodeset, native)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyBuilder;
    #[allow(unused)]
    use similar_asserts::assert_eq;
    use strum::IntoEnumIterator;

    #[test]
    fn local_policy_round_trip() {
        let topology = TopologyBuilder::new()
            .from_synthetic("NUMANode:2 Core:2 PU:1")
            .unwrap()
            .build()
            .unwrap();
        for core in [0, 3] {
            topology
                .set_core_affinity(BindingTarget::Process, core)
                .unwrap();
            topology.set_memory_policy(MemoryPolicy::Local).unwrap();
            let current = topology.get_node(BindingTarget::Process).unwrap();
            assert_eq!(
                topology.get_memory_policy(),
                Ok(MemoryBinding {
                    node: current,
                    policy: MemoryPolicy::Local
                })
            );
        }
    }

    #[test]
    fn os_and_interleave_policies() {
        let topology = TopologyBuilder::new()
            .from_synthetic("NUMANode:2 Core:2 PU:1")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            topology.get_memory_policy(),
            Ok(MemoryBinding {
                node: Some(0),
                policy: MemoryPolicy::Os
            })
        );
        topology.set_memory_policy(MemoryPolicy::Interleave).unwrap();
        assert_eq!(
            topology.get_memory_policy(),
            Ok(MemoryBinding {
                node: None,
                policy: MemoryPolicy::Interleave
            })
        );
        topology.set_memory_policy(MemoryPolicy::Os).unwrap();
        assert_eq!(
            topology.get_memory_policy().map(|binding| binding.policy),
            Ok(MemoryPolicy::Os)
        );
        assert_eq!(
            topology.set_memory_policy(MemoryPolicy::Unknown),
            Err(BindError::UnsupportedPolicy(MemoryPolicy::Unknown))
        );
    }

    /// Nodes that the provider's memory binding currently covers
    fn bound_nodes(topology: &ArchTopology) -> NodeSet {
        let state = topology.state().unwrap();
        state.provider.memory_binding().unwrap().0
    }

    #[test]
    fn interleave_spans_several_nodes() {
        // One node per package: the node sits below its package, which only
        // covers that node, so interleaving must reach the whole machine
        for description in [
            "Package:2 NUMANode:1 Core:2 PU:1",
            "NUMANode:2 Package:1 Core:2 PU:1",
        ] {
            let topology = TopologyBuilder::new()
                .from_synthetic(description)
                .unwrap()
                .build()
                .unwrap();
            topology
                .set_core_affinity(BindingTarget::Process, 0)
                .unwrap();
            topology.set_memory_policy(MemoryPolicy::Interleave).unwrap();
            assert_eq!(bound_nodes(&topology), "0-1".parse().unwrap());
        }

        // Two nodes per package: interleaving stays within the package
        let topology = TopologyBuilder::new()
            .from_synthetic("Package:2 NUMANode:2 Core:1 PU:1")
            .unwrap()
            .build()
            .unwrap();
        topology
            .set_core_affinity(BindingTarget::Process, 3)
            .unwrap();
        topology.set_memory_policy(MemoryPolicy::Interleave).unwrap();
        assert_eq!(bound_nodes(&topology), "2-3".parse().unwrap());
    }

    #[test]
    fn uniform_memory_is_a_no_op() {
        let topology = TopologyBuilder::new()
            .from_synthetic("Package:1 Core:4 PU:1")
            .unwrap()
            .build()
            .unwrap();
        for policy in MemoryPolicy::iter() {
            assert_eq!(topology.set_memory_policy(policy), Ok(()));
            assert_eq!(topology.get_memory_policy(), Ok(MemoryBinding::default()));
        }
    }

    #[test]
    fn destroyed_topology() {
        let mut topology = TopologyBuilder::new()
            .from_synthetic("NUMANode:2 Core:2 PU:1")
            .unwrap()
            .build()
            .unwrap();
        topology.destroy().unwrap();
        assert_eq!(topology.get_memory_policy(), Err(BindError::Destroyed));
        assert_eq!(
            topology.set_memory_policy(MemoryPolicy::Os),
            Err(BindError::Destroyed)
        );
    }
}
