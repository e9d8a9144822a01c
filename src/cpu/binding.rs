//! CPU binding

use crate::{
    cpu::cpuset::CpuSet,
    errors::{BindError, RawOsError},
    memory::nodeset::NodeSet,
    object::TopologyObject,
    topology::ArchTopology,
};
use derive_more::Display;
use strum::EnumIter;
use tracing::trace;

/// Entity whose CPU binding is queried or modified
#[derive(Copy, Clone, Debug, Display, EnumIter, Eq, Hash, PartialEq)]
pub enum BindingTarget {
    /// Every thread of the current process
    ///
    /// Binding the process binds all of its threads, discarding any binding
    /// that was set for an individual thread.
    #[doc(alias = "HWLOC_CPUBIND_PROCESS")]
    Process,

    /// The calling thread only
    #[doc(alias = "HWLOC_CPUBIND_THREAD")]
    Thread,
}

/// # CPU binding
///
/// These operations are backed by the topology's hardware provider, and
/// change the OS scheduling state of the process, never the topology model.
///
/// Thread-scoped calls that each thread makes for itself do not interfere
/// with one another. Process-scoped calls made concurrently from several
/// threads race with each other: callers that need a consistent outcome
/// must serialize them.
impl ArchTopology {
    /// Bind the target to a single processing unit
    ///
    /// `core_id` is the OS index of the processing unit, as found in
    /// [`Core::id()`].
    ///
    /// # Errors
    ///
    /// - [`Destroyed`] if the topology was destroyed.
    /// - [`Rejected`] with `EINVAL` if `core_id` is not a processing unit of
    ///   this machine, or with the provider's error if it refused the
    ///   binding, e.g. because privileges are insufficient.
    ///
    /// [`Core::id()`]: crate::topology::Core::id()
    /// [`Destroyed`]: BindError::Destroyed
    /// [`Rejected`]: BindError::Rejected
    #[doc(alias = "hwloc_set_cpubind")]
    pub fn set_core_affinity(&self, target: BindingTarget, core_id: usize) -> Result<(), BindError> {
        let state = self.state()?;
        if !state.tree.cpuset().is_set(core_id) {
            return Err(RawOsError::with_errno("bind_cpu", libc::EINVAL).into());
        }
        trace!("binding {target} to CPU {core_id}");
        state
            .provider
            .bind_cpu(&CpuSet::from_index(core_id), target)?;
        Ok(())
    }

    /// Lowest processing unit that the target is bound to
    ///
    /// Returns `None` if the target's CPU binding is empty.
    ///
    /// # Errors
    ///
    /// - [`Destroyed`] if the topology was destroyed.
    /// - [`Rejected`] if the provider could not report the binding.
    ///
    /// [`Destroyed`]: BindError::Destroyed
    /// [`Rejected`]: BindError::Rejected
    #[doc(alias = "hwloc_get_cpubind")]
    pub fn get_core_affinity(&self, target: BindingTarget) -> Result<Option<usize>, BindError> {
        let cpuset = self.state()?.provider.cpu_binding(target)?;
        trace!("{target} is bound to CPUs {cpuset}");
        Ok(cpuset.first())
    }

    /// Logical index of the lowest NUMA node that the target's CPU binding
    /// covers
    ///
    /// Returns `None` on machines without NUMA nodes, and when the CPU binding
    /// covers no NUMA node.
    ///
    /// # Errors
    ///
    /// - [`Destroyed`] if the topology was destroyed.
    /// - [`Rejected`] if the provider could not report the binding.
    ///
    /// [`Destroyed`]: BindError::Destroyed
    /// [`Rejected`]: BindError::Rejected
    pub fn get_node(&self, target: BindingTarget) -> Result<Option<usize>, BindError> {
        Ok(self.current_node(target)?.map(TopologyObject::logical_index))
    }

    /// NUMA node object that the target's CPU binding starts on
    pub(crate) fn current_node(
        &self,
        target: BindingTarget,
    ) -> Result<Option<&TopologyObject>, BindError> {
        let state = self.state()?;
        if self.counts().nnodes == 0 {
            return Ok(None);
        }
        let cpuset = state.provider.cpu_binding(target)?;
        let nodeset = NodeSet::from_cpuset(&state.tree, &cpuset);
        Ok(nodeset
            .first()
            .and_then(|os_index| state.tree.node_with_os_index(os_index)))
    }
}

/// OS identifier of the calling thread
///
/// This is the kernel thread ID on Linux, as reported by `gettid()`, and
/// `None` on other operating systems.
pub fn current_thread_id() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: gettid takes no argument and cannot fail
        let tid = unsafe { libc::syscall(libc::SYS_gettid) };
        u64::try_from(tid).ok()
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
