//! Error handling
//!
//! Three failure domains are distinguished:
//!
//! - [`InitError`] is returned when a topology cannot be built. It is fatal to
//!   the topology context: no affinity or accelerator query may be made.
//! - [`BindError`] is returned by individual CPU and memory binding
//!   operations. It is recoverable: the caller may retry with another target
//!   or leave scheduling to the OS.
//! - [`DestroyError`] is returned when a topology is torn down twice.
//!
//! Queries that make no sense on the current machine (NUMA queries on a
//! uniform-memory machine, accelerator assignment without accelerators) are
//! not errors. They are reported through `None` or [`MemoryPolicy::Unknown`].
//!
//! [`MemoryPolicy::Unknown`]: crate::memory::binding::MemoryPolicy::Unknown
//
// At the implementation level, this is also the place where the low-level
// handling of OS errors is implemented.

use crate::{memory::binding::MemoryPolicy, provider::LoadError};
use errno::Errno;
use std::ffi::c_int;
use thiserror::Error;

/// Do something with errno checking
///
/// Call a user-provided callback, which tells if symptoms of an OS-side error
/// were observed. If so, check for appearance of nonzero errno values and
/// report them.
///
/// When this function returns, errno is back to the state where it was before
/// the user callback was invoked.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn check_errno<R>(callback: impl FnOnce() -> (R, bool)) -> (R, Option<Errno>) {
    let old_errno = errno::errno();
    errno::set_errno(Errno(0));

    let (result, should_check_errno) = callback();

    let mut new_errno = None;
    if should_check_errno {
        let errno = errno::errno();
        if errno != Errno(0) {
            new_errno = Some(errno);
        }
    }
    errno::set_errno(old_errno);

    (result, new_errno)
}

/// Raw error emitted by a hardware provider entry point
///
/// Providers backed by system calls follow the usual convention of returning
/// -1 and setting errno. In-memory providers use the same type so that
/// callers only ever deal with one kind of low-level failure.
#[derive(Copy, Clone, Debug, Error, Eq, Hash, PartialEq)]
#[error("provider API {api} failed with errno {errno:?}")]
pub struct RawOsError {
    /// Provider entry point that failed
    pub api: &'static str,

    /// Observed errno value, if errno was set
    pub errno: Option<Errno>,
}
//
impl RawOsError {
    /// Error with a known errno value, for providers that do not go through
    /// the OS to detect failures
    pub(crate) fn with_errno(api: &'static str, errno: c_int) -> Self {
        Self {
            api,
            errno: Some(Errno(errno)),
        }
    }
}

/// Call an OS entry point that returns an `int` where -1 signals failure
#[cfg(target_os = "linux")]
pub(crate) fn call_os_int(
    api: &'static str,
    call: impl FnOnce() -> libc::c_long,
) -> Result<libc::c_long, RawOsError> {
    let (result, errno) = check_errno(|| {
        let result = call();
        (result, result == -1)
    });
    if result == -1 {
        Err(RawOsError { api, errno })
    } else {
        Ok(result)
    }
}

/// Failure to build a topology
///
/// This is fatal to the topology context.
#[derive(Debug, Error)]
pub enum InitError {
    /// The hardware provider could not describe the machine
    #[error("hardware topology provider could not be initialized")]
    Provider(#[from] LoadError),

    /// The hardware description contains no processing unit
    #[error("hardware description contains no processing unit")]
    NoProcessingUnits,

    /// A core does not see the same number of cache levels as core 0
    #[error("core {core} has {found} cache levels, but core 0 has {expected}")]
    IrregularCaches {
        /// Logical index of the faulty core
        core: usize,
        /// Number of cache levels of core 0
        expected: usize,
        /// Number of cache levels of the faulty core
        found: usize,
    },

    /// Cores cannot be split evenly across NUMA nodes
    #[error("{ncores} cores cannot be split evenly across {nnodes} NUMA nodes")]
    UnevenNodes {
        /// Number of cores
        ncores: usize,
        /// Number of NUMA nodes
        nnodes: usize,
    },

    /// A NUMA node does not own the expected number of cores
    #[error("NUMA node #{node} owns {found} cores, expected {expected}")]
    NodePartition {
        /// Logical index of the faulty NUMA node
        node: usize,
        /// Expected number of cores per node
        expected: usize,
        /// Number of cores found below this node
        found: usize,
    },
}

/// Failure of a CPU or memory binding operation
///
/// Each binding operation fails independently: the topology remains usable
/// after this error is reported.
#[derive(Copy, Clone, Debug, Error, Eq, Hash, PartialEq)]
pub enum BindError {
    /// The topology was destroyed, so its provider is gone
    #[error("topology has already been destroyed")]
    Destroyed,

    /// The provider rejected the request
    ///
    /// Typical causes are an invalid CPU or node index and insufficient
    /// privileges.
    #[error(transparent)]
    Rejected(#[from] RawOsError),

    /// The current CPU binding does not intersect any NUMA node
    #[error("current CPU binding is not covered by any NUMA node")]
    NoCurrentNode,

    /// This memory policy cannot be requested
    #[error("memory policy {0} cannot be applied")]
    UnsupportedPolicy(MemoryPolicy),
}

/// Attempted to destroy a topology that was already destroyed
#[derive(Copy, Clone, Debug, Default, Eq, Error, Hash, PartialEq)]
#[error("topology has already been destroyed")]
pub struct DestroyError;
