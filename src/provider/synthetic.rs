//! Synthetic topologies
//!
//! A synthetic topology models an imaginary machine, described by a string
//! such as `"NUMANode:2 Package:1 L3Cache:1(size=8MB) Core:4 PU:2"`. Each
//! space-separated level gives an object type and the number of such objects
//! below each object of the previous level. The first level hangs below the
//! implicit Machine root and the last level must be PUs.
//!
//! Caches accept a `size=` attribute and NUMA nodes accept a `memory=`
//! attribute. Sizes are given in bytes, optionally with a `KB`, `MB`, `GB` or
//! `TB` suffix, all of which are understood as powers of 1024.

use super::{HardwareProvider, LoadError};
use crate::{
    cpu::{binding::BindingTarget, cpuset::CpuSet},
    errors::RawOsError,
    memory::{binding::MemoryBindingPolicy, nodeset::NodeSet},
    object::{types::ObjectType, ObjectSpec, ObjectTree, TreeError},
};
use std::{
    collections::HashMap,
    fmt::{self, Display},
    str::FromStr,
    sync::{Mutex, PoisonError},
    thread::{self, ThreadId},
};
use thiserror::Error;

/// Upper bound on the number of PUs of a synthetic machine
const MAX_SYNTHETIC_PUS: usize = 1 << 16;

/// Local memory of NUMA nodes when no `memory=` attribute is given
const DEFAULT_NODE_MEMORY: u64 = 1 << 30;

/// Size of caches of a given level when no `size=` attribute is given
fn default_cache_size(level: usize) -> u64 {
    match level {
        1 => 32 << 10,
        2 => 1 << 20,
        3 => 8 << 20,
        4 => 64 << 20,
        _ => 256 << 20,
    }
}

/// One level of a [`SyntheticDescription`]
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct SyntheticLevel {
    /// Type of objects at this level
    pub object_type: ObjectType,

    /// Number of objects of this level below each object of the previous one
    pub arity: usize,

    /// Size of each cache in bytes, or local memory of each NUMA node
    pub size: Option<u64>,
}

/// Parsed description of a synthetic machine
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SyntheticDescription(Vec<SyntheticLevel>);
//
impl SyntheticDescription {
    /// Levels of the description, from outermost to innermost
    pub fn levels(&self) -> &[SyntheticLevel] {
        &self.0
    }

    /// Number of PUs of the machine
    pub fn num_pus(&self) -> usize {
        self.0.iter().map(|level| level.arity).product()
    }

    /// Build the object tree of this machine
    ///
    /// PUs are numbered from left to right, and so are the packages, NUMA
    /// nodes and cores. Caches have no OS index.
    ///
    /// # Errors
    ///
    /// [`TreeError`] if the objects do not form a hierarchy, which cannot
    /// happen for a description that was successfully parsed.
    pub fn build_tree(&self) -> Result<ObjectTree, TreeError> {
        let num_pus = self.num_pus();
        let mut specs = Vec::new();
        let mut num_objects = 1;
        for level in &self.0 {
            num_objects *= level.arity;
            let span = num_pus / num_objects;
            for idx in 0..num_objects {
                let cpuset = (idx * span..(idx + 1) * span).collect::<CpuSet>();
                let os_index = (!level.object_type.is_cache()).then_some(idx);
                let mut spec = ObjectSpec::new(level.object_type, os_index, cpuset);
                if let Some(cache_level) = level.object_type.cache_level() {
                    spec.cache_size = Some(level.size.unwrap_or(default_cache_size(cache_level)));
                } else if level.object_type == ObjectType::NUMANode {
                    spec.total_memory = Some(level.size.unwrap_or(DEFAULT_NODE_MEMORY));
                }
                specs.push(spec);
            }
        }
        ObjectTree::from_objects(specs)
    }

    /// Parse one level, e.g. `L2Cache:4(size=1MB)`
    fn parse_level(token: &str) -> Result<SyntheticLevel, SyntheticError> {
        let bad_token = || SyntheticError::BadLevel(token.to_owned());
        let (level, attributes) = match token.split_once('(') {
            Some((level, rest)) => (level, Some(rest.strip_suffix(')').ok_or_else(bad_token)?)),
            None => (token, None),
        };
        let (type_name, arity) = level.split_once(':').ok_or_else(bad_token)?;
        let object_type = type_name
            .parse::<ObjectType>()
            .map_err(|_| SyntheticError::UnknownType(type_name.to_owned()))?;
        if object_type == ObjectType::Machine {
            return Err(SyntheticError::ExplicitMachine);
        }
        let arity = arity
            .parse::<usize>()
            .ok()
            .filter(|&arity| arity > 0)
            .ok_or_else(bad_token)?;

        let mut size = None;
        for attribute in attributes.into_iter().flat_map(|attrs| attrs.split(',')) {
            let bad_attribute = || SyntheticError::BadAttribute {
                object_type,
                attribute: attribute.to_owned(),
            };
            let (key, value) = attribute.split_once('=').ok_or_else(bad_attribute)?;
            let allowed = match key.trim() {
                "size" => object_type.is_cache(),
                "memory" => object_type == ObjectType::NUMANode,
                _ => false,
            };
            if !allowed || size.is_some() {
                return Err(bad_attribute());
            }
            size = Some(parse_size(value.trim()).ok_or_else(bad_attribute)?);
        }

        Ok(SyntheticLevel {
            object_type,
            arity,
            size,
        })
    }
}
//
impl Display for SyntheticDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, level) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}", level.object_type, level.arity)?;
            if let Some(size) = level.size {
                let key = if level.object_type.is_cache() {
                    "size"
                } else {
                    "memory"
                };
                write!(f, "({key}={size})")?;
            }
        }
        Ok(())
    }
}
//
impl FromStr for SyntheticDescription {
    type Err = SyntheticError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let levels = s
            .split_whitespace()
            .map(Self::parse_level)
            .collect::<Result<Vec<_>, _>>()?;
        match levels.last() {
            None => return Err(SyntheticError::Empty),
            Some(last) if last.object_type != ObjectType::PU => {
                return Err(SyntheticError::MissingPU)
            }
            Some(_) => {}
        }

        // Outer levels must have a lower containment rank than inner levels,
        // except that NUMA nodes and packages may come in either order
        for pair in levels.windows(2) {
            let (outer, inner) = (pair[0].object_type, pair[1].object_type);
            if levels
                .iter()
                .filter(|level| level.object_type == inner)
                .count()
                > 1
            {
                return Err(SyntheticError::DuplicateType(inner));
            }
            let (outer_rank, inner_rank) = (outer.containment_rank(), inner.containment_rank());
            if outer_rank > inner_rank || (outer_rank == inner_rank && outer == inner) {
                return Err(SyntheticError::OutOfOrder { outer, inner });
            }
        }

        let num_pus = levels
            .iter()
            .try_fold(1usize, |acc, level| acc.checked_mul(level.arity))
            .filter(|&num_pus| num_pus <= MAX_SYNTHETIC_PUS);
        if num_pus.is_none() {
            return Err(SyntheticError::TooManyPUs);
        }
        Ok(Self(levels))
    }
}

/// Parse a size with an optional binary unit suffix
fn parse_size(s: &str) -> Option<u64> {
    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(digits_end);
    let shift = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        _ => return None,
    };
    digits.parse::<u64>().ok()?.checked_mul(1 << shift)
}

/// Error while parsing a synthetic description
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum SyntheticError {
    /// The description has no level
    #[error("synthetic description is empty")]
    Empty,

    /// A level is not of the form `Type:count` or `Type:count(attributes)`
    #[error("synthetic level {0:?} is not of the form Type:count(attributes)")]
    BadLevel(String),

    /// An object type name was not recognized
    #[error("unknown object type {0:?}")]
    UnknownType(String),

    /// The Machine level is implicit
    #[error("the Machine level is implicit and cannot be described")]
    ExplicitMachine,

    /// An attribute is not valid for this object type
    #[error("invalid attribute {attribute:?} for {object_type} objects")]
    BadAttribute {
        /// Type of the object that carries the attribute
        object_type: ObjectType,
        /// Offending attribute
        attribute: String,
    },

    /// The innermost level must be PUs
    #[error("the innermost synthetic level must be PUs")]
    MissingPU,

    /// An object type appears at several levels
    #[error("{0} objects appear at several levels")]
    DuplicateType(ObjectType),

    /// A level cannot contain the following one
    #[error("{outer} objects cannot contain {inner} objects")]
    OutOfOrder {
        /// Outer level type
        outer: ObjectType,
        /// Inner level type
        inner: ObjectType,
    },

    /// The described machine is unreasonably large
    #[error("synthetic machine has more than {MAX_SYNTHETIC_PUS} PUs")]
    TooManyPUs,
}

/// Simulated binding state of a [`SyntheticProvider`]
#[derive(Debug)]
struct BindingState {
    /// Binding inherited by threads that were not bound individually
    process: CpuSet,

    /// Per-thread binding overrides
    ///
    /// Entries of exited threads are only dropped when the process is bound,
    /// when a thread is rebound to the process binding, or when the provider
    /// is dropped.
    threads: HashMap<ThreadId, CpuSet>,

    /// Memory binding
    memory: (NodeSet, MemoryBindingPolicy),
}

/// Hardware provider for an imaginary machine
///
/// CPU and memory bindings are simulated in memory. Binding the process
/// discards the bindings of individual threads, as on Linux where a process
/// binding is applied to every thread.
///
/// Thread bindings are remembered per [`ThreadId`] until the process is
/// bound again, since threads do not report their exit. Programs that keep
/// spawning short-lived threads that bind themselves should bind the process
/// from time to time, or rebind each thread to the process binding before it
/// exits.
#[derive(Debug)]
pub struct SyntheticProvider {
    tree: ObjectTree,
    state: Mutex<BindingState>,
}
//
impl SyntheticProvider {
    /// Model the machine of a synthetic description
    ///
    /// # Errors
    ///
    /// [`LoadError`] if the description is invalid.
    pub fn new(description: &str) -> Result<Self, LoadError> {
        let tree = description.parse::<SyntheticDescription>()?.build_tree()?;
        Ok(Self::from_tree(tree))
    }

    /// Model a machine from a hand-built object tree
    pub fn from_tree(tree: ObjectTree) -> Self {
        let state = BindingState {
            process: tree.cpuset().clone(),
            threads: HashMap::new(),
            memory: (tree.nodeset().clone(), MemoryBindingPolicy::FirstTouch),
        };
        Self {
            tree,
            state: Mutex::new(state),
        }
    }

    /// Access the binding state
    ///
    /// Binding updates are single assignments, so a panic while holding the
    /// lock cannot leave the state inconsistent.
    fn state(&self) -> std::sync::MutexGuard<'_, BindingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
//
impl HardwareProvider for SyntheticProvider {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn load(&self) -> Result<ObjectTree, LoadError> {
        Ok(self.tree.clone())
    }

    fn cpu_binding(&self, target: BindingTarget) -> Result<CpuSet, RawOsError> {
        let state = self.state();
        Ok(match target {
            BindingTarget::Thread => state
                .threads
                .get(&thread::current().id())
                .unwrap_or(&state.process)
                .clone(),
            BindingTarget::Process => {
                let mut union = state.process.clone();
                for set in state.threads.values() {
                    union |= set;
                }
                union
            }
        })
    }

    fn bind_cpu(&self, set: &CpuSet, target: BindingTarget) -> Result<(), RawOsError> {
        if set.is_empty() || !self.tree.cpuset().includes(set) {
            return Err(RawOsError::with_errno("bind_cpu", libc::EINVAL));
        }
        let mut state = self.state();
        match target {
            BindingTarget::Thread => {
                let thread = thread::current().id();
                if *set == state.process {
                    state.threads.remove(&thread);
                } else {
                    state.threads.insert(thread, set.clone());
                }
            }
            BindingTarget::Process => {
                state.process = set.clone();
                state.threads.clear();
            }
        }
        Ok(())
    }

    fn memory_binding(&self) -> Result<(NodeSet, MemoryBindingPolicy), RawOsError> {
        Ok(self.state().memory.clone())
    }

    fn bind_memory(&self, set: &NodeSet, policy: MemoryBindingPolicy) -> Result<(), RawOsError> {
        let first_touch = policy == MemoryBindingPolicy::FirstTouch;
        if (set.is_empty() && !first_touch) || !self.tree.nodeset().includes(set) {
            return Err(RawOsError::with_errno("bind_memory", libc::EINVAL));
        }
        self.state().memory = (set.clone(), policy);
        Ok(())
    }
}
