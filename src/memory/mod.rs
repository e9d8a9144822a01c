//! Memory-specific functionality
//!
//! Most of this module's functionality is exposed via methods of the
//! [`ArchTopology`] struct. The module itself only hosts type definitions that
//! are related to this functionality.
//!
//! [`ArchTopology`]: crate::topology::ArchTopology

pub mod binding;
pub mod nodeset;
