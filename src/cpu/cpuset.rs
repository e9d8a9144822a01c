//! CPU sets
//!
//! These specialized bitmaps represent sets of processing units, identified by
//! the OS index the operating system exposes for them. Depending on the
//! hardware and OS configuration, a processing unit is either a full-blown
//! hardware core or an SMT thread thereof.

use crate::bitmap::{impl_bitmap_newtype, Bitmap};
use derive_more::{AsRef, Deref, DerefMut, Display, From, Into};

/// A [`Bitmap`] whose bits are set according to processing unit OS indices
#[derive(AsRef, Clone, Default, Deref, DerefMut, Display, Eq, From, Hash, Into, PartialEq)]
pub struct CpuSet(Bitmap);

impl_bitmap_newtype!(CpuSet);
