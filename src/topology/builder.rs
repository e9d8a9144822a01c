//! Building a topology with a custom configuration
//!
//! By default, a topology describes the host machine and has no accelerator
//! support. A [`TopologyBuilder`] can change the hardware provider (e.g. to
//! model an imaginary machine), enable accelerator support and tune the
//! discovery process.
//!
//! When the host machine is described, the `ARCHTOPO_SYNTHETIC` and
//! `ARCHTOPO_FSROOT` environment variables are honored unless
//! [`BuildFlags::IGNORE_ENV`] is set. The former replaces the host with a
//! synthetic machine, the latter relocates the sysfs hierarchy that the host
//! is probed from.

use super::{discovery, ArchTopology, TopologyState};
#[cfg(target_os = "linux")]
use crate::{gpu::pci::PciAccelerators, provider::linux::SysfsProvider};
use crate::{
    errors::InitError,
    gpu::{AcceleratorProvider, NoAccelerators},
    provider::{
        synthetic::{SyntheticDescription, SyntheticError, SyntheticProvider},
        HardwareProvider, LoadError,
    },
};
use bitflags::bitflags;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
#[cfg(target_os = "linux")]
use tracing::warn;

/// Environment variable that replaces the host with a synthetic machine
pub const SYNTHETIC_ENV: &str = "ARCHTOPO_SYNTHETIC";

/// Environment variable that relocates the host's sysfs hierarchy
pub const FSROOT_ENV: &str = "ARCHTOPO_FSROOT";

/// Default location of the sysfs hierarchy
const DEFAULT_FSROOT: &str = "/sys";

/// Where the hardware description comes from
#[derive(Debug)]
enum Source {
    /// The host machine, subject to environment overrides
    Host,

    /// A synthetic machine
    Synthetic(SyntheticDescription),

    /// A relocated sysfs hierarchy
    FsRoot(PathBuf),

    /// A user-provided provider
    Provider(Box<dyn HardwareProvider>),
}

/// Mechanism to build an [`ArchTopology`] with custom configuration
#[derive(Debug)]
pub struct TopologyBuilder {
    source: Source,
    flags: BuildFlags,
    accelerators: Option<Box<dyn AcceleratorProvider>>,
    sibling_capacity: Option<usize>,
}

/// # Topology building
impl TopologyBuilder {
    /// Start building an [`ArchTopology`] of the host machine
    pub fn new() -> Self {
        Self {
            source: Source::Host,
            flags: BuildFlags::empty(),
            accelerators: None,
            sibling_capacity: None,
        }
    }

    /// Build the topology
    ///
    /// # Errors
    ///
    /// [`InitError`] if the hardware could not be probed, or if its
    /// description does not satisfy the preconditions of this crate (regular
    /// cache hierarchy, cores evenly split across NUMA nodes).
    ///
    /// # Examples
    ///
    /// ```
    /// # use archtopo::topology::{ArchTopology, BuildFlags};
    /// let topology = ArchTopology::builder()
    ///     .from_synthetic("Package:2 L3Cache:1 Core:8 PU:2")?
    ///     .with_flags(BuildFlags::IGNORE_ENV)
    ///     .build()?;
    /// assert_eq!(topology.counts().nsockets, 2);
    /// assert_eq!(topology.counts().npus, 32);
    /// # Ok::<(), eyre::Report>(())
    /// ```
    #[doc(alias = "hwloc_topology_load")]
    pub fn build(self) -> Result<ArchTopology, InitError> {
        let Self {
            source,
            flags,
            accelerators,
            sibling_capacity,
        } = self;

        let (provider, fsroot) = match source {
            Source::Host if flags.contains(BuildFlags::IGNORE_ENV) => {
                let fsroot = PathBuf::from(DEFAULT_FSROOT);
                (host_provider(&fsroot)?, fsroot)
            }
            Source::Host => {
                let fsroot = std::env::var_os(FSROOT_ENV)
                    .map_or_else(|| PathBuf::from(DEFAULT_FSROOT), PathBuf::from);
                match std::env::var(SYNTHETIC_ENV) {
                    Ok(description) => {
                        debug!("{SYNTHETIC_ENV} replaces the host with {description:?}");
                        let description = description
                            .parse::<SyntheticDescription>()
                            .map_err(LoadError::from)?;
                        (synthetic_provider(&description)?, fsroot)
                    }
                    Err(_) => (host_provider(&fsroot)?, fsroot),
                }
            }
            Source::Synthetic(description) => (
                synthetic_provider(&description)?,
                PathBuf::from(DEFAULT_FSROOT),
            ),
            Source::FsRoot(fsroot) => (host_provider(&fsroot)?, fsroot),
            Source::Provider(provider) => (provider, PathBuf::from(DEFAULT_FSROOT)),
        };
        debug!("probing hardware with the {} provider", provider.name());
        let tree = provider.load()?;

        let accelerators = match accelerators {
            _ if flags.contains(BuildFlags::NO_ACCELERATORS) => {
                Box::new(NoAccelerators) as Box<dyn AcceleratorProvider>
            }
            Some(accelerators) => accelerators,
            None if flags.contains(BuildFlags::DETECT_ACCELERATORS) => {
                detect_accelerators(&fsroot)
            }
            None => Box::new(NoAccelerators),
        };

        let discovery::Discovery {
            mut counts,
            cores,
            nodes,
        } = discovery::discover(&tree, sibling_capacity)?;
        counts.ngpus = accelerators.device_count();
        info!(
            "built topology with {} NUMA nodes, {} sockets, {} cores, {} PUs, {} cache levels and {} accelerators",
            counts.nnodes, counts.nsockets, counts.ncores, counts.npus, counts.ncaches, counts.ngpus
        );
        Ok(ArchTopology::from_parts(
            TopologyState {
                provider,
                accelerators,
                tree,
                cores,
                nodes,
            },
            counts,
        ))
    }
}

/// # Hardware source selection
impl TopologyBuilder {
    /// Describe an imaginary machine instead of the host
    ///
    /// See the [`synthetic`](crate::provider::synthetic) module for the
    /// description syntax. CPU and memory bindings are simulated.
    ///
    /// # Errors
    ///
    /// [`SyntheticError`] if `description` is not a valid synthetic
    /// description.
    #[doc(alias = "hwloc_topology_set_synthetic")]
    pub fn from_synthetic(mut self, description: &str) -> Result<Self, SyntheticError> {
        self.source = Source::Synthetic(description.parse()?);
        Ok(self)
    }

    /// Probe the hardware from a sysfs hierarchy rooted at `path`
    ///
    /// This is the programmatic equivalent of the `ARCHTOPO_FSROOT`
    /// environment variable. It is only supported on Linux, other operating
    /// systems will fail to build the topology.
    pub fn from_fsroot(mut self, path: impl AsRef<Path>) -> Self {
        self.source = Source::FsRoot(path.as_ref().to_path_buf());
        self
    }

    /// Use a custom hardware provider
    pub fn from_provider(mut self, provider: Box<dyn HardwareProvider>) -> Self {
        self.source = Source::Provider(provider);
        self
    }
}

/// # Discovery configuration
impl TopologyBuilder {
    /// Set topology building flags
    ///
    /// If this function is called multiple times, the last invocation will
    /// erase and replace the set of flags that was previously set.
    #[doc(alias = "hwloc_topology_set_flags")]
    pub fn with_flags(mut self, flags: BuildFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Check current topology building flags (empty by default)
    pub fn flags(&self) -> BuildFlags {
        self.flags
    }

    /// Enable accelerator support with a custom accelerator provider
    pub fn with_accelerators(mut self, accelerators: Box<dyn AcceleratorProvider>) -> Self {
        self.accelerators = Some(accelerators);
        self
    }

    /// Look up at most `capacity` siblings per core
    ///
    /// By default, this is one less than the number of children of the
    /// deepest object shared by the first two cores.
    pub fn with_sibling_capacity(mut self, capacity: usize) -> Self {
        self.sibling_capacity = Some(capacity);
        self
    }
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// Topology building configuration flags
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct BuildFlags: u32 {
        /// Ignore the `ARCHTOPO_SYNTHETIC` and `ARCHTOPO_FSROOT` environment
        /// variables
        const IGNORE_ENV = 1 << 0;

        /// Disable accelerator support, even if an accelerator provider was
        /// specified
        const NO_ACCELERATORS = 1 << 1;

        /// Look for PCI accelerators in sysfs if no accelerator provider was
        /// specified
        ///
        /// This is only supported on Linux. Elsewhere, and when sysfs cannot
        /// be scanned, accelerator support stays disabled.
        const DETECT_ACCELERATORS = 1 << 2;
    }
}

/// Hardware provider for a synthetic machine
fn synthetic_provider(
    description: &SyntheticDescription,
) -> Result<Box<dyn HardwareProvider>, LoadError> {
    Ok(Box::new(SyntheticProvider::from_tree(
        description.build_tree()?,
    )))
}

/// Hardware provider for the host machine
#[cfg(target_os = "linux")]
fn host_provider(fsroot: &Path) -> Result<Box<dyn HardwareProvider>, LoadError> {
    Ok(Box::new(SysfsProvider::with_root(fsroot)))
}
//
#[cfg(not(target_os = "linux"))]
fn host_provider(_fsroot: &Path) -> Result<Box<dyn HardwareProvider>, LoadError> {
    Err(LoadError::Unsupported)
}

/// Accelerators of the host machine
#[cfg(target_os = "linux")]
fn detect_accelerators(fsroot: &Path) -> Box<dyn AcceleratorProvider> {
    match PciAccelerators::from_sysfs(fsroot) {
        Ok(accelerators) => Box::new(accelerators),
        Err(e) => {
            warn!("accelerator detection failed, disabling accelerator support: {e}");
            Box::new(NoAccelerators)
        }
    }
}
//
#[cfg(not(target_os = "linux"))]
fn detect_accelerators(_fsroot: &Path) -> Box<dyn AcceleratorProvider> {
    debug!("accelerator detection is only supported on Linux");
    Box::new(NoAccelerators)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::StaticAccelerators;
    #[allow(unused)]
    use similar_asserts::assert_eq;
    use static_assertions::assert_impl_all;

    assert_impl_all!(BuildFlags: Copy, Default, Send, Sync);
    assert_impl_all!(TopologyBuilder: Default, Send, Sync);

    #[test]
    fn flags() {
        let builder = TopologyBuilder::new();
        assert_eq!(builder.flags(), BuildFlags::empty());
        let flags = BuildFlags::IGNORE_ENV | BuildFlags::DETECT_ACCELERATORS;
        assert_eq!(builder.with_flags(flags).flags(), flags);
    }

    #[test]
    fn invalid_synthetic_description() {
        assert_eq!(
            TopologyBuilder::new().from_synthetic("Core:4").err(),
            Some(SyntheticError::MissingPU)
        );
    }

    #[test]
    fn custom_provider() {
        let provider = SyntheticProvider::new("Package:2 Core:2 PU:1").unwrap();
        let topology = TopologyBuilder::new()
            .from_provider(Box::new(provider))
            .build()
            .unwrap();
        assert_eq!(topology.counts().nsockets, 2);
        assert_eq!(topology.provider_name(), Some("synthetic"));
    }

    #[test]
    fn accelerators() {
        let devices = || Box::new(StaticAccelerators::new(vec![Some(0), Some(1)]));
        let with_gpus = TopologyBuilder::new()
            .from_synthetic("NUMANode:2 Core:2 PU:1")
            .unwrap()
            .with_accelerators(devices())
            .build()
            .unwrap();
        assert_eq!(with_gpus.counts().ngpus, 2);

        let disabled = TopologyBuilder::new()
            .from_synthetic("NUMANode:2 Core:2 PU:1")
            .unwrap()
            .with_accelerators(devices())
            .with_flags(BuildFlags::NO_ACCELERATORS)
            .build()
            .unwrap();
        assert_eq!(disabled.counts().ngpus, 0);
    }

    #[test]
    fn sibling_capacity() {
        let topology = TopologyBuilder::new()
            .from_synthetic("L2Cache:1 Core:4 PU:1")
            .unwrap()
            .with_sibling_capacity(2)
            .build()
            .unwrap();
        assert_eq!(topology.counts().nsiblings, 2);
        assert!(topology
            .cores()
            .iter()
            .all(|core| core.siblings().len() == 2));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn relocated_sysfs() {
        let sysfs = crate::provider::linux::tests::fake_sysfs();
        let topology = TopologyBuilder::new()
            .from_fsroot(sysfs.path())
            .with_flags(BuildFlags::DETECT_ACCELERATORS)
            .build()
            .unwrap();
        assert_eq!(topology.provider_name(), Some("sysfs"));
        let counts = topology.counts();
        assert_eq!((counts.nnodes, counts.ncores, counts.npus), (2, 2, 4));
        assert_eq!((counts.ncaches, counts.nshared_caches), (3, 1));
        assert_eq!(counts.ngpus, 0);
        assert_eq!(topology.cores()[1].id(), 2);
        assert_eq!(topology.cores()[0].caches(), &[32, 1024, 8192]);
        assert_eq!(topology.cores()[0].siblings(), &[2]);
        assert_eq!(topology.nodes()[1].owned_cores(), &[2]);
        assert_eq!(topology.nodes()[1].total_memory(), 16 << 20);
    }

    #[test]
    fn synthetic_environment_override() {
        std::env::set_var(SYNTHETIC_ENV, "NUMANode:3 Core:2 PU:1");
        let result = TopologyBuilder::new().build();
        std::env::remove_var(SYNTHETIC_ENV);
        let topology = result.unwrap();
        assert_eq!(topology.counts().nnodes, 3);
        assert_eq!(topology.provider_name(), Some("synthetic"));

        std::env::set_var(SYNTHETIC_ENV, "not a machine");
        let result = TopologyBuilder::new().build();
        std::env::remove_var(SYNTHETIC_ENV);
        assert!(matches!(
            result,
            Err(InitError::Provider(LoadError::Synthetic(_)))
        ));
    }
}
