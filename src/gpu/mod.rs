//! Accelerator placement
//!
//! Parallel numerical codes that offload work to accelerators (GPUs and
//! similar devices) usually run one compute rank per CPU core, and need to
//! decide which device each rank should drive. This module assigns devices
//! to ranks based on which NUMA node the rank's core and the devices are
//! attached to.
//!
//! Devices are enumerated by an [`AcceleratorProvider`]. Accelerator support
//! is disabled by default, which is modeled by the [`NoAccelerators`]
//! provider: every assignment then yields no device.

#[cfg(target_os = "linux")]
pub mod pci;

use crate::topology::ArchTopology;
use std::fmt::Debug;
use tracing::trace;

/// Source of accelerator devices and of their locality
///
/// Devices are identified by an index from 0 to `device_count() - 1`.
pub trait AcceleratorProvider: Debug + Send + Sync {
    /// Number of devices
    fn device_count(&self) -> usize;

    /// Devices attached to the NUMA node with OS index `node_os_index`
    fn devices_on_node(&self, node_os_index: usize) -> Vec<usize>;

    /// Devices in order of preference for machines without NUMA nodes
    fn closest_devices(&self) -> Vec<usize>;
}

/// Accelerator provider for machines without accelerator support
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct NoAccelerators;
//
impl AcceleratorProvider for NoAccelerators {
    fn device_count(&self) -> usize {
        0
    }

    fn devices_on_node(&self, _node_os_index: usize) -> Vec<usize> {
        Vec::new()
    }

    fn closest_devices(&self) -> Vec<usize> {
        Vec::new()
    }
}

/// Accelerator provider for a known set of devices
///
/// Each device is described by the OS index of the NUMA node it is attached
/// to, if any.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct StaticAccelerators(Vec<Option<usize>>);
//
impl StaticAccelerators {
    /// Set up devices `0..localities.len()` with the given NUMA localities
    pub fn new(localities: Vec<Option<usize>>) -> Self {
        Self(localities)
    }
}
//
impl AcceleratorProvider for StaticAccelerators {
    fn device_count(&self) -> usize {
        self.0.len()
    }

    fn devices_on_node(&self, node_os_index: usize) -> Vec<usize> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, node)| **node == Some(node_os_index))
            .map(|(device, _)| device)
            .collect()
    }

    fn closest_devices(&self) -> Vec<usize> {
        (0..self.0.len()).collect()
    }
}

/// # Accelerator placement
impl ArchTopology {
    /// Accelerator devices attached to the `node_index`-th NUMA node
    ///
    /// The lookup is performed on first use, then cached. Returns `None` if
    /// accelerator support is disabled, if there is no such node, or if the
    /// topology was destroyed.
    pub fn node_gpus(&self, node_index: usize) -> Option<&[usize]> {
        let state = self.state().ok()?;
        if self.counts().ngpus == 0 {
            return None;
        }
        let node = state.nodes.get(node_index)?;
        Some(node.gpus_or_init(|| state.accelerators.devices_on_node(node.id())))
    }

    /// Pick the accelerator that compute rank `rank` out of `total_ranks`,
    /// running on the `core_index`-th core, should use
    ///
    /// - On machines without NUMA nodes, ranks are spread round-robin over
    ///   the provider's [closest devices](AcceleratorProvider::closest_devices).
    /// - On NUMA machines, ranks are spread round-robin over the devices
    ///   attached to the core's NUMA node. If there are as many ranks as
    ///   devices, or if the node has no device, ranks are instead spread
    ///   round-robin over all devices, so that each device gets used.
    ///
    /// Returns `None` if accelerator support is disabled, if there is no
    /// device, or if the topology was destroyed.
    ///
    /// # Examples
    ///
    /// ```
    /// # use archtopo::{gpu::StaticAccelerators, topology::ArchTopology};
    /// let topology = ArchTopology::builder()
    ///     .from_synthetic("NUMANode:2 Core:4 PU:1")?
    ///     .with_accelerators(Box::new(StaticAccelerators::new(vec![Some(0), Some(1)])))
    ///     .build()?;
    /// // Ranks running on the second node get the second device
    /// assert_eq!(topology.assign_gpu(5, 1, 8), Some(1));
    /// # Ok::<(), eyre::Report>(())
    /// ```
    #[doc(alias = "assign")]
    pub fn assign_gpu(&self, core_index: usize, rank: usize, total_ranks: usize) -> Option<usize> {
        let state = self.state().ok()?;
        let ngpus = self.counts().ngpus;
        if ngpus == 0 {
            return None;
        }

        let global = rank % ngpus;
        let device = if self.counts().nnodes == 0 {
            let closest = state.accelerators.closest_devices();
            closest.get(global).copied().unwrap_or(global)
        } else {
            let local = self
                .core_node(core_index)
                .and_then(|node| self.node_gpus(node))
                .unwrap_or(&[]);
            if total_ranks == ngpus || local.is_empty() {
                global
            } else {
                local[rank % local.len()]
            }
        };
        trace!("rank {rank}/{total_ranks} on core #{core_index} uses accelerator {device}");
        Some(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyBuilder;
    use proptest::prelude::*;
    #[allow(unused)]
    use similar_asserts::assert_eq;
    use static_assertions::assert_impl_all;
    use std::collections::HashSet;

    assert_impl_all!(NoAccelerators: AcceleratorProvider, Copy, Default);
    assert_impl_all!(StaticAccelerators: AcceleratorProvider, Clone, Default);

    fn topology(description: &str, localities: Vec<Option<usize>>) -> ArchTopology {
        TopologyBuilder::new()
            .from_synthetic(description)
            .unwrap()
            .with_accelerators(Box::new(StaticAccelerators::new(localities)))
            .build()
            .unwrap()
    }

    #[test]
    fn static_accelerators() {
        let devices = StaticAccelerators::new(vec![Some(1), None, Some(1), Some(0)]);
        assert_eq!(devices.device_count(), 4);
        assert_eq!(devices.devices_on_node(1), vec![0, 2]);
        assert_eq!(devices.devices_on_node(2), Vec::<usize>::new());
        assert_eq!(devices.closest_devices(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn disabled() {
        let topology = TopologyBuilder::new()
            .from_synthetic("NUMANode:2 Core:2 PU:1")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(topology.counts().ngpus, 0);
        assert_eq!(topology.assign_gpu(0, 0, 1), None);
        assert_eq!(topology.node_gpus(0), None);
    }

    #[test]
    fn lazy_node_devices() {
        let topology = topology("NUMANode:2 Core:2 PU:1", vec![Some(1), Some(1), Some(0)]);
        assert_eq!(topology.nodes()[1].gpus(), None);
        assert_eq!(topology.node_gpus(1), Some(&[0, 1][..]));
        assert_eq!(topology.nodes()[1].gpus(), Some(&[0, 1][..]));
        assert_eq!(topology.node_gpus(2), None);
    }

    #[test]
    fn local_round_robin() {
        let topology = topology("NUMANode:2 Core:4 PU:1", vec![Some(0), Some(0), Some(1)]);
        let node0 = (0..4)
            .map(|rank| topology.assign_gpu(rank, rank, 8))
            .collect::<Vec<_>>();
        assert_eq!(node0, vec![Some(0), Some(1), Some(0), Some(1)]);
        assert_eq!(topology.assign_gpu(6, 6, 8), Some(2));
    }

    #[test]
    fn nodes_without_devices_use_all_devices() {
        let topology = topology("NUMANode:2 Core:2 PU:1", vec![Some(0), Some(0)]);
        assert_eq!(topology.assign_gpu(2, 2, 4), Some(0));
        assert_eq!(topology.assign_gpu(3, 3, 4), Some(1));
    }

    #[test]
    fn destroyed() {
        let mut topology = topology("Core:2 PU:1", vec![None]);
        assert_eq!(topology.assign_gpu(0, 0, 1), Some(0));
        topology.destroy().unwrap();
        assert_eq!(topology.assign_gpu(0, 0, 1), None);
    }

    proptest! {
        #[test]
        fn one_rank_per_device_is_a_bijection(
            localities in prop::collection::vec(prop::option::of(0usize..2), 1..8),
        ) {
            let ngpus = localities.len();
            let topology = topology("NUMANode:2 Core:4 PU:1", localities);
            let assigned = (0..ngpus)
                .map(|rank| topology.assign_gpu(rank % 8, rank, ngpus).unwrap())
                .collect::<HashSet<_>>();
            prop_assert_eq!(assigned, (0..ngpus).collect::<HashSet<_>>());
        }
    }
}
