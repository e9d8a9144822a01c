//! Hardware topology, affinity control and accelerator placement
//!
//! This crate describes the hardware a parallel numerical program runs on,
//! and helps each of its threads settle on the right part of the machine:
//!
//! - An [`ArchTopology`] summarizes the machine into counts, a table of cores
//!   with their caches and cache-sharing siblings, and a table of NUMA nodes
//!   with the cores they own.
//! - CPU binding operations pin the calling thread or process to a core.
//! - Memory binding operations select the NUMA placement policy of new
//!   allocations.
//! - Accelerator placement decides which GPU each compute rank should drive.
//!
//! Hardware information comes from a [`HardwareProvider`]. On Linux, the
//! default provider reads sysfs and binds through system calls. Synthetic
//! topologies, described by strings such as `"NUMANode:2 Core:4 PU:2"`, model
//! imaginary machines for testing.
//!
//! # Example
//!
//! ```
//! use archtopo::{ArchTopology, BindingTarget, MemoryPolicy};
//!
//! let topology = ArchTopology::builder()
//!     .from_synthetic("NUMANode:2 Package:1 L3Cache:1 L2Cache:2 Core:1 PU:2")?
//!     .build()?;
//! let counts = topology.counts();
//! assert_eq!((counts.nnodes, counts.ncores, counts.npus), (2, 4, 8));
//!
//! // Pin the process to the third core, then allocate from its node
//! let core = topology.cores()[2].id();
//! topology.set_core_affinity(BindingTarget::Process, core)?;
//! assert_eq!(topology.get_node(BindingTarget::Thread)?, Some(1));
//! topology.set_memory_policy(MemoryPolicy::Local)?;
//! assert_eq!(topology.get_memory_policy()?.node, Some(1));
//! # Ok::<(), eyre::Report>(())
//! ```
//!
//! # Configuration
//!
//! [`ArchTopology::new()`] honors two environment variables, unless the
//! [`BuildFlags::IGNORE_ENV`] flag is set:
//!
//! - `ARCHTOPO_SYNTHETIC` replaces the host with a synthetic topology.
//! - `ARCHTOPO_FSROOT` reads the host description from another sysfs root.
//!
//! Diagnostics are emitted through [`tracing`], and are silent unless the
//! application installs a subscriber.

pub mod bitmap;
pub mod cpu;
pub mod errors;
pub mod gpu;
pub mod memory;
pub mod object;
pub mod provider;
#[cfg(test)]
pub(crate) mod strategies;
pub mod topology;

pub use self::{
    cpu::{
        binding::{current_thread_id, BindingTarget},
        cpuset::CpuSet,
    },
    errors::{BindError, DestroyError, InitError},
    memory::{
        binding::{MemoryBinding, MemoryPolicy},
        nodeset::NodeSet,
    },
    provider::HardwareProvider,
    topology::{ArchTopology, BuildFlags, Core, Counts, Node, TopologyBuilder},
};
