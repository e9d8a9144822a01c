//! Hardware topology providers
//!
//! A [`HardwareProvider`] is the source of truth about the machine. It
//! describes the hardware hierarchy as an [`ObjectTree`], and applies or
//! reports CPU and memory bindings.
//!
//! Two providers are built in:
//!
//! - [`SyntheticProvider`], which models an imaginary machine from a textual
//!   description and simulates binding state in memory.
//! - `SysfsProvider` (Linux only), which reads the host's `/sys` hierarchy
//!   and binds through the scheduler and memory policy system calls.
//!
//! [`SyntheticProvider`]: synthetic::SyntheticProvider

#[cfg(target_os = "linux")]
pub mod linux;
pub mod synthetic;

use self::synthetic::SyntheticError;
use crate::{
    cpu::{binding::BindingTarget, cpuset::CpuSet},
    errors::RawOsError,
    memory::{binding::MemoryBindingPolicy, nodeset::NodeSet},
    object::{ObjectTree, TreeError},
};
use std::{fmt::Debug, io, path::PathBuf};
use thiserror::Error;

/// Source of hardware topology information and binding control
///
/// Implementations must be usable from several threads at once. Binding
/// requests that race with each other are resolved by the provider, in
/// whatever order it sees them.
pub trait HardwareProvider: Debug + Send + Sync {
    /// Short name of the provider, used in logs
    fn name(&self) -> &'static str;

    /// Describe the hardware hierarchy
    ///
    /// This is called once per topology build.
    ///
    /// # Errors
    ///
    /// [`LoadError`] if the hardware could not be probed.
    fn load(&self) -> Result<ObjectTree, LoadError>;

    /// Query the current CPU binding of the target
    ///
    /// For [`BindingTarget::Process`], this is the union of the bindings of
    /// all threads of the process.
    ///
    /// # Errors
    ///
    /// [`RawOsError`] if the binding cannot be queried.
    fn cpu_binding(&self, target: BindingTarget) -> Result<CpuSet, RawOsError>;

    /// Bind the target to a set of CPUs
    ///
    /// # Errors
    ///
    /// [`RawOsError`] if the binding was rejected, e.g. because `set` is not
    /// a subset of the machine's CPUs.
    fn bind_cpu(&self, set: &CpuSet, target: BindingTarget) -> Result<(), RawOsError>;

    /// Query the memory binding of the caller
    ///
    /// # Errors
    ///
    /// [`RawOsError`] if the binding cannot be queried.
    fn memory_binding(&self) -> Result<(NodeSet, MemoryBindingPolicy), RawOsError>;

    /// Set the memory binding of the caller
    ///
    /// # Errors
    ///
    /// [`RawOsError`] if the binding was rejected.
    fn bind_memory(&self, set: &NodeSet, policy: MemoryBindingPolicy) -> Result<(), RawOsError>;
}

/// Failure to describe the hardware hierarchy
#[derive(Debug, Error)]
pub enum LoadError {
    /// A provider input could not be read
    #[error("failed to read {}", path.display())]
    Io {
        /// File or directory that could not be read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// A provider input did not have the expected format
    #[error("unexpected content {content:?} in {}", path.display())]
    Malformed {
        /// File with unexpected content
        path: PathBuf,
        /// Offending content
        content: String,
    },

    /// A synthetic description could not be parsed
    #[error(transparent)]
    Synthetic(#[from] SyntheticError),

    /// The hardware objects do not form a hierarchy
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// No hardware provider is available for the host platform
    #[error("host hardware discovery is not supported on this platform")]
    Unsupported,
}
//
impl LoadError {
    /// Attach a path to an I/O error
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
