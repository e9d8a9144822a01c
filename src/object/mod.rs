//! Hardware topology (objects)
//!
//! An [`ObjectTree`] is the provider-neutral description of a machine's
//! hardware hierarchy. Each [`TopologyObject`] of the tree has a type (NUMA
//! node, package, cache, core, processing unit...), an optional OS index,
//! and the set of processing units and NUMA nodes that it covers.
//!
//! Providers describe a machine by listing its objects along with their CPU
//! sets. The tree structure is then deduced from CPU set inclusion: an
//! object's parent is the smallest object whose CPU set includes its own, and
//! objects with identical CPU sets are nested according to their type.

pub mod types;

use self::types::ObjectType;
use crate::{cpu::cpuset::CpuSet, memory::nodeset::NodeSet};
use std::{cmp::Ordering, collections::HashMap, iter::FusedIterator};
use thiserror::Error;

/// Identifier of an object within an [`ObjectTree`]
///
/// Identifiers are only meaningful for the tree that emitted them.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectId(usize);

/// Description of a hardware object, used to build an [`ObjectTree`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectSpec {
    /// Type of the object
    pub object_type: ObjectType,

    /// OS index of the object, if known
    pub os_index: Option<usize>,

    /// Processing units covered by this object
    pub cpuset: CpuSet,

    /// Cache size in bytes, for caches
    pub cache_size: Option<u64>,

    /// Local memory in bytes, for NUMA nodes
    pub total_memory: Option<u64>,
}
//
impl ObjectSpec {
    /// Describe an object with no cache or memory attribute
    pub fn new(object_type: ObjectType, os_index: Option<usize>, cpuset: CpuSet) -> Self {
        Self {
            object_type,
            os_index,
            cpuset,
            cache_size: None,
            total_memory: None,
        }
    }

    /// Describe a processing unit
    pub fn pu(os_index: usize) -> Self {
        Self::new(ObjectType::PU, Some(os_index), CpuSet::from_index(os_index))
    }

    /// Describe a cache of a given size
    pub fn cache(object_type: ObjectType, cpuset: CpuSet, size: u64) -> Self {
        debug_assert!(object_type.is_cache(), "{object_type} is not a cache");
        Self {
            cache_size: Some(size),
            ..Self::new(object_type, None, cpuset)
        }
    }

    /// Describe a NUMA node with some local memory
    pub fn numa_node(os_index: usize, cpuset: CpuSet, total_memory: u64) -> Self {
        Self {
            total_memory: Some(total_memory),
            ..Self::new(ObjectType::NUMANode, Some(os_index), cpuset)
        }
    }
}

/// A hardware object within an [`ObjectTree`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TopologyObject {
    id: ObjectId,
    object_type: ObjectType,
    os_index: Option<usize>,
    logical_index: usize,
    depth: usize,
    cpuset: CpuSet,
    nodeset: NodeSet,
    cache_size: Option<u64>,
    total_memory: Option<u64>,
    parent: Option<ObjectId>,
    children: Vec<ObjectId>,
}
//
impl TopologyObject {
    /// Identifier of this object within its tree
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Type of object
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    /// The OS-provided physical index number
    ///
    /// This is `None` for objects that the OS does not number, such as
    /// caches.
    pub fn os_index(&self) -> Option<usize> {
        self.os_index
    }

    /// Horizontal index in the whole list of similar objects
    ///
    /// Objects of a given type are numbered from 0 in left-to-right order.
    pub fn logical_index(&self) -> usize {
        self.logical_index
    }

    /// Vertical index in the hierarchy, the root being at depth 0
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Processing units covered by this object
    pub fn cpuset(&self) -> &CpuSet {
        &self.cpuset
    }

    /// NUMA nodes near this object
    ///
    /// This is the set of NUMA nodes below this object or, if there are none,
    /// the NUMA node above it. It is empty on uniform-memory machines.
    pub fn nodeset(&self) -> &NodeSet {
        &self.nodeset
    }

    /// Cache size in bytes, for caches
    pub fn cache_size(&self) -> Option<u64> {
        self.cache_size
    }

    /// Local memory in bytes, for NUMA nodes
    pub fn total_memory(&self) -> Option<u64> {
        self.total_memory
    }

    /// Number of children
    pub fn arity(&self) -> usize {
        self.children.len()
    }

    /// Parent object, `None` for the root
    pub fn parent_id(&self) -> Option<ObjectId> {
        self.parent
    }

    /// Children objects, from left to right
    pub fn children_ids(&self) -> &[ObjectId] {
        &self.children
    }
}

/// A hardware hierarchy
///
/// The root of the tree is always a [`ObjectType::Machine`] object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectTree {
    /// Objects, parents always stored before their children
    objects: Vec<TopologyObject>,

    /// Objects of each type, in logical index order
    by_type: HashMap<ObjectType, Vec<ObjectId>>,
}

impl ObjectTree {
    /// Build a tree from a flat list of objects
    ///
    /// The Machine root is created automatically and covers the processing
    /// units of the list. Every non-PU object must cover at least one of
    /// these processing units. When several objects have the same CPU set,
    /// they are nested by type, and objects of the same rank (NUMA nodes and
    /// packages) are nested in list order.
    ///
    /// # Errors
    ///
    /// [`TreeError`] if the objects cannot be arranged into a hierarchy.
    pub fn from_objects(specs: Vec<ObjectSpec>) -> Result<Self, TreeError> {
        // Check the objects and compute the machine's CPU set
        let mut machine_cpuset = CpuSet::new();
        for spec in specs.iter().filter(|spec| spec.object_type == ObjectType::PU) {
            let os_index = match (spec.cpuset.weight(), spec.cpuset.first()) {
                (1, Some(os_index)) => os_index,
                _ => return Err(TreeError::BadProcessingUnit(spec.cpuset.clone())),
            };
            if machine_cpuset.is_set(os_index) {
                return Err(TreeError::DuplicateProcessingUnit(os_index));
            }
            machine_cpuset.set(os_index);
        }
        if machine_cpuset.is_empty() {
            return Err(TreeError::NoProcessingUnit);
        }
        for spec in &specs {
            if spec.object_type == ObjectType::Machine {
                return Err(TreeError::ExtraMachine);
            }
            if spec.cpuset.is_empty() || !machine_cpuset.includes(&spec.cpuset) {
                return Err(TreeError::OutsideMachine(
                    spec.object_type,
                    spec.cpuset.clone(),
                ));
            }
        }

        // Insert the largest objects first so that parents precede children
        let mut order = (0..specs.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| {
            let (a, b) = (&specs[a], &specs[b]);
            b.cpuset
                .weight()
                .cmp(&a.cpuset.weight())
                .then(
                    a.object_type
                        .containment_rank()
                        .cmp(&b.object_type.containment_rank()),
                )
                .then(a.cpuset.first().cmp(&b.cpuset.first()))
        });
        let mut objects = vec![TopologyObject {
            id: ObjectId(0),
            object_type: ObjectType::Machine,
            os_index: Some(0),
            logical_index: 0,
            depth: 0,
            cpuset: machine_cpuset,
            nodeset: NodeSet::new(),
            cache_size: None,
            total_memory: None,
            parent: None,
            children: Vec::new(),
        }];
        for spec in order.into_iter().map(|idx| &specs[idx]) {
            let parent = Self::insertion_point(&objects, &spec.cpuset);
            if let Some(&overlap) = objects[parent].children.iter().find(|&&child| {
                let child = &objects[child.0];
                child.cpuset.intersects(&spec.cpuset) && !child.cpuset.includes(&spec.cpuset)
            }) {
                let other = &objects[overlap.0];
                return Err(TreeError::Overlap {
                    object_type: spec.object_type,
                    cpuset: spec.cpuset.clone(),
                    other_type: other.object_type,
                    other_cpuset: other.cpuset.clone(),
                });
            }
            let id = ObjectId(objects.len());
            objects[parent].children.push(id);
            objects.push(TopologyObject {
                id,
                object_type: spec.object_type,
                os_index: spec.os_index,
                logical_index: 0,
                depth: 0,
                cpuset: spec.cpuset.clone(),
                nodeset: NodeSet::new(),
                cache_size: spec.cache_size,
                total_memory: spec.total_memory,
                parent: Some(ObjectId(parent)),
                children: Vec::new(),
            });
        }

        // Order children from left to right
        for idx in 0..objects.len() {
            let mut children = std::mem::take(&mut objects[idx].children);
            children.sort_by(|a, b| Self::left_to_right(&objects[a.0], &objects[b.0]));
            objects[idx].children = children;
        }

        // NUMA nodes cover themselves, objects above them cover their union
        for idx in (0..objects.len()).rev() {
            if objects[idx].object_type == ObjectType::NUMANode {
                if let Some(os_index) = objects[idx].os_index {
                    objects[idx].nodeset.set(os_index);
                }
            }
            if let Some(parent) = objects[idx].parent {
                let nodeset = objects[idx].nodeset.clone();
                objects[parent.0].nodeset |= &nodeset;
            }
        }
        // ...and objects below a NUMA node inherit it
        for idx in 1..objects.len() {
            if objects[idx].nodeset.is_empty() {
                if let Some(parent) = objects[idx].parent {
                    objects[idx].nodeset = objects[parent.0].nodeset.clone();
                }
            }
        }

        // Number objects depth-first, from left to right
        let mut by_type = HashMap::<ObjectType, Vec<ObjectId>>::new();
        let mut stack = vec![(ObjectId(0), 0)];
        while let Some((id, depth)) = stack.pop() {
            let same_type = by_type.entry(objects[id.0].object_type).or_default();
            objects[id.0].logical_index = same_type.len();
            objects[id.0].depth = depth;
            same_type.push(id);
            stack.extend(
                objects[id.0]
                    .children
                    .iter()
                    .rev()
                    .map(|&child| (child, depth + 1)),
            );
        }

        Ok(Self { objects, by_type })
    }

    /// Deepest object whose CPU set includes `cpuset`
    fn insertion_point(objects: &[TopologyObject], cpuset: &CpuSet) -> usize {
        let mut current = 0;
        while let Some(child) = objects[current]
            .children
            .iter()
            .find(|child| objects[child.0].cpuset.includes(cpuset))
        {
            current = child.0;
        }
        current
    }

    /// Left-to-right ordering of sibling objects
    fn left_to_right(a: &TopologyObject, b: &TopologyObject) -> Ordering {
        a.cpuset
            .first()
            .cmp(&b.cpuset.first())
            .then(
                a.object_type
                    .containment_rank()
                    .cmp(&b.object_type.containment_rank()),
            )
    }

    /// Root object of the tree
    #[doc(alias = "hwloc_get_root_obj")]
    pub fn root(&self) -> &TopologyObject {
        &self.objects[0]
    }

    /// Object with a given identifier
    ///
    /// # Panics
    ///
    /// If `id` was not emitted by this tree.
    pub fn object(&self, id: ObjectId) -> &TopologyObject {
        &self.objects[id.0]
    }

    /// Number of objects of a given type
    #[doc(alias = "hwloc_get_nbobjs_by_type")]
    pub fn num_objects_with_type(&self, object_type: ObjectType) -> usize {
        self.by_type.get(&object_type).map_or(0, Vec::len)
    }

    /// Objects of a given type, in logical index order
    pub fn objects_with_type(
        &self,
        object_type: ObjectType,
    ) -> impl DoubleEndedIterator<Item = &TopologyObject> + ExactSizeIterator + FusedIterator + Clone
    {
        self.by_type
            .get(&object_type)
            .map_or(&[][..], Vec::as_slice)
            .iter()
            .map(|&id| self.object(id))
    }

    /// Object of a given type and logical index, if it exists
    #[doc(alias = "hwloc_get_obj_by_type")]
    pub fn object_by_type(&self, object_type: ObjectType, logical_index: usize) -> Option<&TopologyObject> {
        let id = *self.by_type.get(&object_type)?.get(logical_index)?;
        Some(self.object(id))
    }

    /// Parent of an object, `None` for the root
    pub fn parent(&self, object: &TopologyObject) -> Option<&TopologyObject> {
        object.parent.map(|id| self.object(id))
    }

    /// Children of an object, from left to right
    pub fn children<'tree>(
        &'tree self,
        object: &'tree TopologyObject,
    ) -> impl DoubleEndedIterator<Item = &'tree TopologyObject> + ExactSizeIterator + FusedIterator + Clone
    {
        object.children.iter().map(|&id| self.object(id))
    }

    /// Ancestors of an object, from its parent up to the root
    pub fn ancestors<'tree>(
        &'tree self,
        object: &'tree TopologyObject,
    ) -> impl FusedIterator<Item = &'tree TopologyObject> + Clone {
        Ancestors {
            tree: self,
            current: object,
        }
    }

    /// First ancestor of an object with a given type
    pub fn ancestor_with_type<'tree>(
        &'tree self,
        object: &'tree TopologyObject,
        object_type: ObjectType,
    ) -> Option<&'tree TopologyObject> {
        self.ancestors(object)
            .find(|ancestor| ancestor.object_type == object_type)
    }

    /// Deepest object that is an ancestor of (or equal to) both `a` and `b`
    #[doc(alias = "hwloc_get_common_ancestor_obj")]
    pub fn common_ancestor<'tree>(
        &'tree self,
        mut a: &'tree TopologyObject,
        mut b: &'tree TopologyObject,
    ) -> &'tree TopologyObject {
        while a.id != b.id {
            match a.depth.cmp(&b.depth) {
                Ordering::Greater => a = self.parent(a).unwrap_or(a),
                Ordering::Less => b = self.parent(b).unwrap_or(b),
                Ordering::Equal => {
                    // Two distinct objects at depth 0 cannot exist, as there is
                    // a single root
                    match (self.parent(a), self.parent(b)) {
                        (Some(pa), Some(pb)) => {
                            a = pa;
                            b = pb;
                        }
                        _ => return self.root(),
                    }
                }
            }
        }
        a
    }

    /// Processing units of the machine
    pub fn cpuset(&self) -> &CpuSet {
        self.root().cpuset()
    }

    /// NUMA nodes of the machine, empty on uniform-memory machines
    pub fn nodeset(&self) -> &NodeSet {
        self.root().nodeset()
    }

    /// NUMA node object with a given OS index
    pub fn node_with_os_index(&self, os_index: usize) -> Option<&TopologyObject> {
        self.objects_with_type(ObjectType::NUMANode)
            .find(|node| node.os_index == Some(os_index))
    }
}

/// Iterator over ancestors of a topology object
#[derive(Copy, Clone, Debug)]
struct Ancestors<'tree> {
    tree: &'tree ObjectTree,
    current: &'tree TopologyObject,
}
//
impl<'tree> Iterator for Ancestors<'tree> {
    type Item = &'tree TopologyObject;

    fn next(&mut self) -> Option<Self::Item> {
        self.current = self.tree.parent(self.current)?;
        Some(self.current)
    }
}
//
impl FusedIterator for Ancestors<'_> {}

/// Failure to arrange a list of objects into a hierarchy
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum TreeError {
    /// No processing unit was listed
    #[error("hardware description contains no processing unit")]
    NoProcessingUnit,

    /// A processing unit does not cover exactly one CPU
    #[error("processing unit covers CPUs {0} instead of exactly one CPU")]
    BadProcessingUnit(CpuSet),

    /// Two processing units share the same OS index
    #[error("processing unit #{0} is listed twice")]
    DuplicateProcessingUnit(usize),

    /// The Machine root object is implicit and cannot be listed
    #[error("the Machine object is implicit and cannot be listed")]
    ExtraMachine,

    /// An object covers no processing unit, or an unknown one
    #[error("{0} object covers CPUs {1} which are not processing units of the machine")]
    OutsideMachine(ObjectType, CpuSet),

    /// Two objects partially overlap
    #[error("{object_type} object with CPUs {cpuset} partially overlaps {other_type} object with CPUs {other_cpuset}")]
    Overlap {
        /// Type of the object that could not be inserted
        object_type: ObjectType,
        /// CPU set of the object that could not be inserted
        cpuset: CpuSet,
        /// Type of the object that it overlaps
        other_type: ObjectType,
        /// CPU set of the object that it overlaps
        other_cpuset: CpuSet,
    },
}
