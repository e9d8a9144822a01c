//! CPU-specific functionality

pub mod binding;
pub mod cpuset;
