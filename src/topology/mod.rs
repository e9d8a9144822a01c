//! Hardware topology
//!
//! An [`ArchTopology`] is built once, by [`ArchTopology::new()`] or a
//! [`TopologyBuilder`], and then shared read-only by the threads of the
//! application. It summarizes the machine into a few counts ([`Counts`]), a
//! table of cores ([`Core`]) and a table of NUMA nodes ([`Node`]), and gives
//! access to the hardware provider that CPU and memory binding operations go
//! through.

pub mod builder;
mod discovery;
mod node_cores;
mod siblings;

pub use self::builder::{BuildFlags, TopologyBuilder};
use crate::{
    errors::{BindError, DestroyError, InitError},
    gpu::AcceleratorProvider,
    object::{types::ObjectType, ObjectTree},
    provider::HardwareProvider,
};
use arrayvec::ArrayVec;
use std::sync::OnceLock;

/// Summary counts of a hardware topology
///
/// All counts are zero once the topology has been destroyed.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Counts {
    /// Number of NUMA nodes, 0 on uniform-memory machines
    pub nnodes: usize,

    /// Number of packages (sockets)
    pub nsockets: usize,

    /// Number of cores
    ///
    /// On machines whose description has no core level, processing units
    /// stand in for cores.
    pub ncores: usize,

    /// Number of processing units (hardware threads)
    pub npus: usize,

    /// Number of memory controllers per socket
    pub nmemcontroller: usize,

    /// Number of cache levels above each core
    pub ncaches: usize,

    /// Number of cache levels that are shared between several cores
    pub nshared_caches: usize,

    /// Maximal number of siblings of each core
    pub nsiblings: usize,

    /// Number of accelerator devices, 0 if accelerator support is disabled
    pub ngpus: usize,
}

/// A computation unit of the topology
///
/// Depending on the machine, this is either a hardware core or, on machines
/// without SMT, a processing unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Core {
    id: usize,
    numa_node: Option<usize>,
    caches: ArrayVec<u64, { ObjectType::MAX_CACHE_LEVELS }>,
    shared_caches: ArrayVec<bool, { ObjectType::MAX_CACHE_LEVELS }>,
    siblings: Vec<usize>,
}
//
impl Core {
    /// OS index of the first processing unit of this core
    ///
    /// This is a valid target for [`ArchTopology::set_core_affinity()`].
    pub fn id(&self) -> usize {
        self.id
    }

    /// Logical index of the NUMA node that owns this core, if any
    pub fn numa_node(&self) -> Option<usize> {
        self.numa_node
    }

    /// Sizes of the caches above this core in KiB, innermost first
    pub fn caches(&self) -> &[u64] {
        &self.caches
    }

    /// Truth that each cache of [`caches()`](Self::caches) is shared with
    /// other cores
    ///
    /// The outermost [`Counts::nshared_caches`] levels are marked as shared on
    /// every core, which does not account for machines where cores of the
    /// same level share caches differently.
    pub fn shared_caches(&self) -> &[bool] {
        &self.shared_caches
    }

    /// IDs of the cores that share a cache with this core
    ///
    /// There are at most [`Counts::nsiblings`] of them, in increasing core
    /// index order.
    pub fn siblings(&self) -> &[usize] {
        &self.siblings
    }

    /// ID of the `idx`-th sibling, `None` if there is no such sibling
    pub fn sibling(&self, idx: usize) -> Option<usize> {
        self.siblings.get(idx).copied()
    }
}

/// A NUMA node of the topology
#[derive(Debug)]
pub struct Node {
    id: usize,
    total_memory: u64,
    cores_per_node: usize,
    owned_cores: Vec<usize>,
    gpus: OnceLock<Vec<usize>>,
}
//
impl Node {
    /// OS index of this node
    pub fn id(&self) -> usize {
        self.id
    }

    /// Local memory of this node in bytes
    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    /// Number of cores of each NUMA node
    pub fn cores_per_node(&self) -> usize {
        self.cores_per_node
    }

    /// IDs of the cores of this node, from left to right
    pub fn owned_cores(&self) -> &[usize] {
        &self.owned_cores
    }

    /// Accelerator devices attached to this node, if they were already looked
    /// up
    ///
    /// Use [`ArchTopology::node_gpus()`] to look them up.
    pub fn gpus(&self) -> Option<&[usize]> {
        self.gpus.get().map(Vec::as_slice)
    }

    /// Accelerator devices attached to this node, looked up on first use
    pub(crate) fn gpus_or_init(&self, lookup: impl FnOnce() -> Vec<usize>) -> &[usize] {
        self.gpus.get_or_init(lookup)
    }
}

/// Everything that [`ArchTopology::destroy()`] releases
#[derive(Debug)]
pub(crate) struct TopologyState {
    pub(crate) provider: Box<dyn HardwareProvider>,
    pub(crate) accelerators: Box<dyn AcceleratorProvider>,
    pub(crate) tree: ObjectTree,
    pub(crate) cores: Vec<Core>,
    pub(crate) nodes: Vec<Node>,
}

/// Hardware topology context
///
/// This is the main entry point of the crate. It holds a summary of the
/// machine's hardware, and is used to bind threads and memory and to assign
/// accelerators to compute ranks.
///
/// The topology is immutable once built, and can be shared across threads.
/// Several topologies may coexist, e.g. one for the host and some synthetic
/// ones for testing.
#[derive(Debug)]
pub struct ArchTopology {
    state: Option<TopologyState>,
    counts: Counts,
}

/// # Topology building
impl ArchTopology {
    /// Discover the host's hardware topology
    ///
    /// This is a shortcut for `ArchTopology::builder().build()`.
    ///
    /// # Errors
    ///
    /// [`InitError`] if the topology could not be built.
    #[doc(alias = "init")]
    pub fn new() -> Result<Self, InitError> {
        TopologyBuilder::new().build()
    }

    /// Prepare to build a topology with custom configuration
    ///
    /// # Examples
    ///
    /// ```
    /// # use archtopo::topology::ArchTopology;
    /// let topology = ArchTopology::builder()
    ///     .from_synthetic("NUMANode:2 Core:4 PU:1")?
    ///     .build()?;
    /// assert_eq!(topology.counts().nnodes, 2);
    /// assert_eq!(topology.counts().ncores, 8);
    /// # Ok::<(), eyre::Report>(())
    /// ```
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::new()
    }

    /// Assemble a topology from discovery results
    pub(crate) fn from_parts(state: TopologyState, counts: Counts) -> Self {
        Self {
            state: Some(state),
            counts,
        }
    }

    /// Release the hardware provider and the topology tables
    ///
    /// Afterwards, all counts are zero, binding operations fail with
    /// [`BindError::Destroyed`] and accelerator assignment yields no device.
    /// Dropping the topology has the same effect.
    ///
    /// # Errors
    ///
    /// [`DestroyError`] if the topology was already destroyed.
    #[doc(alias = "finalize")]
    pub fn destroy(&mut self) -> Result<(), DestroyError> {
        self.state.take().ok_or(DestroyError)?;
        self.counts = Counts::default();
        Ok(())
    }

    /// Truth that [`destroy()`](Self::destroy) was called
    pub fn is_destroyed(&self) -> bool {
        self.state.is_none()
    }

    /// Access the live topology state
    pub(crate) fn state(&self) -> Result<&TopologyState, BindError> {
        self.state.as_ref().ok_or(BindError::Destroyed)
    }
}

/// # Topology queries
///
/// After [`destroy()`](Self::destroy), these queries behave as if the machine
/// had no hardware.
impl ArchTopology {
    /// Summary counts
    pub fn counts(&self) -> Counts {
        self.counts
    }

    /// Cores, in logical order
    pub fn cores(&self) -> &[Core] {
        self.state.as_ref().map_or(&[], |state| &state.cores)
    }

    /// NUMA nodes, in logical order
    pub fn nodes(&self) -> &[Node] {
        self.state.as_ref().map_or(&[], |state| &state.nodes)
    }

    /// Full hardware hierarchy
    pub fn tree(&self) -> Option<&ObjectTree> {
        self.state.as_ref().map(|state| &state.tree)
    }

    /// Name of the hardware provider
    pub fn provider_name(&self) -> Option<&'static str> {
        self.state.as_ref().map(|state| state.provider.name())
    }

    /// Logical index of the NUMA node owning the `core_index`-th core
    ///
    /// Returns `None` on machines without NUMA nodes, and if there is no such
    /// core.
    pub fn core_node(&self, core_index: usize) -> Option<usize> {
        self.cores().get(core_index)?.numa_node()
    }
}

#[cfg(test)]
impl ArchTopology {
    /// Shared read-only topology with 2 NUMA nodes of 2 dual-threaded cores
    pub(crate) fn test_instance() -> &'static Self {
        static INSTANCE: OnceLock<ArchTopology> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            TopologyBuilder::new()
                .from_synthetic(
                    "NUMANode:2(memory=2GB) Package:1 L3Cache:1(size=16MB) L2Cache:2 L1Cache:1 Core:1 PU:2",
                )
                .expect("Failed to parse test topology")
                .build()
                .expect("Failed to initialize test topology")
        })
    }
}
