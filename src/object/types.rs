//! Object types

#[cfg(doc)]
use crate::object::TopologyObject;
use derive_more::Display;
use strum::{EnumIter, EnumString};

/// Represents the type of a [`TopologyObject`]
///
/// Types are listed from the outermost to the innermost. The only exception
/// is [`NUMANode`] and [`Package`], which may appear in either order: on most
/// machines NUMA nodes contain packages, but sub-NUMA clustering splits a
/// package into several nodes.
///
/// Type names are parsed case-insensitively, and the usual hwloc aliases are
/// accepted (`Node` and `numa` for [`NUMANode`], `Socket` and `pack` for
/// [`Package`], `L3` for [`L3Cache`]...).
///
/// [`L3Cache`]: ObjectType::L3Cache
/// [`NUMANode`]: ObjectType::NUMANode
/// [`Package`]: ObjectType::Package
#[derive(Copy, Clone, Debug, Display, EnumIter, EnumString, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[strum(ascii_case_insensitive)]
#[doc(alias = "hwloc_obj_type_t")]
pub enum ObjectType {
    /// The root object, a set of processors and memory with cache coherency
    ///
    /// This type is always used for the root object of a topology, and never
    /// used anywhere else. Hence it never has a parent.
    #[doc(alias = "HWLOC_OBJ_MACHINE")]
    Machine,

    /// A set of processors around memory which the processors can directly
    /// access
    #[doc(alias = "HWLOC_OBJ_NUMANODE")]
    #[strum(serialize = "NUMANode", serialize = "Node", serialize = "numa")]
    NUMANode,

    /// Physical package, what goes into a physical motherboard socket
    #[doc(alias = "HWLOC_OBJ_PACKAGE")]
    #[strum(serialize = "Package", serialize = "Socket", serialize = "pack")]
    Package,

    /// Level 5 data (or unified) cache
    #[strum(serialize = "L5Cache", serialize = "L5")]
    L5Cache,

    /// Level 4 data (or unified) cache
    #[strum(serialize = "L4Cache", serialize = "L4")]
    L4Cache,

    /// Level 3 data (or unified) cache
    #[strum(serialize = "L3Cache", serialize = "L3")]
    L3Cache,

    /// Level 2 data (or unified) cache
    #[strum(serialize = "L2Cache", serialize = "L2")]
    L2Cache,

    /// Level 1 data (or unified) cache
    #[strum(serialize = "L1Cache", serialize = "L1")]
    L1Cache,

    /// A computation unit (may be shared by several PUs aka logical processors)
    #[doc(alias = "HWLOC_OBJ_CORE")]
    Core,

    /// Processing Unit, or (Logical) Processor
    ///
    /// An execution unit, which may share a core with some other logical
    /// processors in the case of an SMT core. This is the leaf of the
    /// hierarchy.
    #[doc(alias = "HWLOC_OBJ_PU")]
    #[strum(serialize = "PU", serialize = "thread")]
    PU,
}

impl ObjectType {
    /// Number of cache levels that can be modeled
    pub const MAX_CACHE_LEVELS: usize = 5;

    /// Truth that this is a CPU cache
    pub fn is_cache(self) -> bool {
        self.cache_level().is_some()
    }

    /// Level of this cache type, if this is a cache
    pub fn cache_level(self) -> Option<usize> {
        match self {
            Self::L1Cache => Some(1),
            Self::L2Cache => Some(2),
            Self::L3Cache => Some(3),
            Self::L4Cache => Some(4),
            Self::L5Cache => Some(5),
            _ => None,
        }
    }

    /// Cache type of a given level, if supported
    pub fn from_cache_level(level: usize) -> Option<Self> {
        match level {
            1 => Some(Self::L1Cache),
            2 => Some(Self::L2Cache),
            3 => Some(Self::L3Cache),
            4 => Some(Self::L4Cache),
            5 => Some(Self::L5Cache),
            _ => None,
        }
    }

    /// Position in the containment order of object types
    ///
    /// An object may only be the parent of an object whose type has a
    /// strictly higher rank, or the same rank in the case of NUMA nodes and
    /// packages.
    pub(crate) fn containment_rank(self) -> u8 {
        match self {
            Self::Machine => 0,
            Self::NUMANode | Self::Package => 1,
            Self::L5Cache => 2,
            Self::L4Cache => 3,
            Self::L3Cache => 4,
            Self::L2Cache => 5,
            Self::L1Cache => 6,
            Self::Core => 7,
            Self::PU => 8,
        }
    }
}
