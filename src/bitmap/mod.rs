//! Index sets of CPUs and NUMA nodes
//!
//! A [`Bitmap`] is a finite set of unsigned integers. It is used through the
//! [`CpuSet`] and [`NodeSet`] newtypes, which respectively hold OS indices of
//! processing units and NUMA nodes.
//!
//! Bitmaps are displayed and parsed using the Linux "cpulist" syntax, which
//! is a comma-separated list of indices and inclusive index ranges such as
//! `0-3,8,10-11`. This is the format used by the `cpulist` and
//! `shared_cpu_list` files of sysfs.
//!
//! [`CpuSet`]: crate::cpu::cpuset::CpuSet
//! [`NodeSet`]: crate::memory::nodeset::NodeSet

use std::{
    fmt::{self, Debug, Display, Formatter},
    iter::FusedIterator,
    ops::{BitAnd, BitOr, BitOrAssign},
    str::FromStr,
};
use thiserror::Error;

/// Number of bits in a storage word
const WORD_BITS: usize = u64::BITS as usize;

/// A set of unsigned integer indices
///
/// Storage is proportional to the largest index in the set, so this type is
/// meant for CPU and NUMA node indices, not arbitrary integers.
//
// --- Implementation details ---
//
// As a type invariant, the last storage word is never zero. This makes the
// derived equality and hashing correct.
#[derive(Clone, Default, Eq, Hash, PartialEq)]
pub struct Bitmap(Vec<u64>);

impl Bitmap {
    /// Largest index accepted when parsing a bitmap list
    ///
    /// This is far above the CPU and NUMA node counts that Linux supports,
    /// and bounds the storage of bitmaps read from untrusted text.
    pub const MAX_PARSED_INDEX: usize = (1 << 20) - 1;

    /// Create an empty bitmap
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bitmap containing a single index
    pub fn from_index(index: usize) -> Self {
        let mut result = Self::new();
        result.set(index);
        result
    }

    /// Add an index to the set
    pub fn set(&mut self, index: usize) {
        let word = index / WORD_BITS;
        if word >= self.0.len() {
            self.0.resize(word + 1, 0);
        }
        self.0[word] |= 1 << (index % WORD_BITS);
    }

    /// Remove an index from the set
    pub fn unset(&mut self, index: usize) {
        let word = index / WORD_BITS;
        if let Some(bits) = self.0.get_mut(word) {
            *bits &= !(1 << (index % WORD_BITS));
            self.trim();
        }
    }

    /// Truth that an index is in the set
    pub fn is_set(&self, index: usize) -> bool {
        self.0
            .get(index / WORD_BITS)
            .is_some_and(|bits| bits & (1 << (index % WORD_BITS)) != 0)
    }

    /// Truth that the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of indices in the set
    pub fn weight(&self) -> usize {
        self.0.iter().map(|bits| bits.count_ones() as usize).sum()
    }

    /// Smallest index in the set, if any
    pub fn first(&self) -> Option<usize> {
        self.iter_set().next()
    }

    /// Largest index in the set, if any
    pub fn last(&self) -> Option<usize> {
        let (word, bits) = self.0.iter().enumerate().next_back()?;
        Some(word * WORD_BITS + (WORD_BITS - 1 - bits.leading_zeros() as usize))
    }

    /// Iterate over the indices of the set, in increasing order
    pub fn iter_set(&self) -> Iter<'_> {
        Iter {
            words: &self.0,
            word: 0,
            remaining: self.0.first().copied().unwrap_or(0),
        }
    }

    /// Truth that all indices of `other` are also in `self`
    pub fn includes(&self, other: &Self) -> bool {
        other.0.len() <= self.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(ours, theirs)| theirs & !ours == 0)
    }

    /// Truth that `self` and `other` have at least one index in common
    pub fn intersects(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(&other.0)
            .any(|(ours, theirs)| ours & theirs != 0)
    }

    /// Restore the "no trailing zero word" invariant
    fn trim(&mut self) {
        while self.0.last() == Some(&0) {
            self.0.pop();
        }
    }
}

impl BitAnd<&Bitmap> for &Bitmap {
    type Output = Bitmap;

    fn bitand(self, rhs: &Bitmap) -> Bitmap {
        let mut result = Bitmap(
            self.0
                .iter()
                .zip(&rhs.0)
                .map(|(ours, theirs)| ours & theirs)
                .collect(),
        );
        result.trim();
        result
    }
}

impl BitOr<&Bitmap> for &Bitmap {
    type Output = Bitmap;

    fn bitor(self, rhs: &Bitmap) -> Bitmap {
        let mut result = self.clone();
        result |= rhs;
        result
    }
}

impl BitOrAssign<&Bitmap> for Bitmap {
    fn bitor_assign(&mut self, rhs: &Bitmap) {
        if rhs.0.len() > self.0.len() {
            self.0.resize(rhs.0.len(), 0);
        }
        for (ours, theirs) in self.0.iter_mut().zip(&rhs.0) {
            *ours |= theirs;
        }
    }
}

impl Debug for Bitmap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap({self})")
    }
}

impl Display for Bitmap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut indices = self.iter_set().peekable();
        let mut first_range = true;
        while let Some(start) = indices.next() {
            let mut end = start;
            while indices.peek() == Some(&(end + 1)) {
                end += 1;
                indices.next();
            }
            if !first_range {
                f.write_str(",")?;
            }
            first_range = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

impl FromIterator<usize> for Bitmap {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut result = Self::new();
        for index in iter {
            result.set(index);
        }
        result
    }
}

impl FromStr for Bitmap {
    type Err = BitmapParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut result = Self::new();
        if s.is_empty() {
            return Ok(result);
        }
        let error = || BitmapParseError(s.to_owned());
        let index = |text: &str| {
            text.trim()
                .parse::<usize>()
                .ok()
                .filter(|&index| index <= Self::MAX_PARSED_INDEX)
                .ok_or_else(error)
        };
        for part in s.split(',') {
            let part = part.trim();
            if let Some((start, end)) = part.split_once('-') {
                let (start, end) = (index(start)?, index(end)?);
                if start > end {
                    return Err(error());
                }
                for index in start..=end {
                    result.set(index);
                }
            } else {
                result.set(index(part)?);
            }
        }
        Ok(result)
    }
}

/// A string could not be parsed as a bitmap list
#[derive(Clone, Debug, Default, Eq, Error, Hash, PartialEq)]
#[error("{0:?} is not a valid index list")]
pub struct BitmapParseError(pub String);

/// Iterator over the indices of a [`Bitmap`]
#[derive(Clone, Debug)]
pub struct Iter<'bitmap> {
    /// Storage of the bitmap that is being iterated over
    words: &'bitmap [u64],
    /// Index of the storage word that is being iterated over
    word: usize,
    /// Bits of the current word that have not been yielded yet
    remaining: u64,
}
//
impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.remaining == 0 {
            self.word += 1;
            self.remaining = *self.words.get(self.word)?;
        }
        let bit = self.remaining.trailing_zeros() as usize;
        self.remaining &= self.remaining - 1;
        Some(self.word * WORD_BITS + bit)
    }
}
//
impl FusedIterator for Iter<'_> {}

/// Implement the common interface of bitmap newtypes
///
/// Bitmap newtypes deref to [`Bitmap`] for queries and mutation, and share its
/// textual representation.
macro_rules! impl_bitmap_newtype {
    ($newtype:ident) => {
        impl $newtype {
            /// Create an empty set
            pub fn new() -> Self {
                Self::default()
            }

            /// Create a set containing a single index
            pub fn from_index(index: usize) -> Self {
                Self($crate::bitmap::Bitmap::from_index(index))
            }
        }

        impl std::fmt::Debug for $newtype {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($newtype), "({})"), self.0)
            }
        }

        impl FromIterator<usize> for $newtype {
            fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
                Self(iter.into_iter().collect())
            }
        }

        impl std::str::FromStr for $newtype {
            type Err = $crate::bitmap::BitmapParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }

        impl std::ops::BitAnd<&$newtype> for &$newtype {
            type Output = $newtype;

            fn bitand(self, rhs: &$newtype) -> $newtype {
                $newtype(&self.0 & &rhs.0)
            }
        }

        impl std::ops::BitOr<&$newtype> for &$newtype {
            type Output = $newtype;

            fn bitor(self, rhs: &$newtype) -> $newtype {
                $newtype(&self.0 | &rhs.0)
            }
        }

        impl std::ops::BitOrAssign<&$newtype> for $newtype {
            fn bitor_assign(&mut self, rhs: &$newtype) {
                self.0 |= &rhs.0;
            }
        }
    };
}
pub(crate) use impl_bitmap_newtype;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    #[allow(unused)]
    use similar_asserts::assert_eq;
    use static_assertions::assert_impl_all;
    use std::collections::BTreeSet;

    assert_impl_all!(Bitmap: Clone, Debug, Default, Display, Eq, FromStr, Send, Sync);

    #[test]
    fn empty() {
        let empty = Bitmap::new();
        assert!(empty.is_empty());
        assert_eq!(empty.weight(), 0);
        assert_eq!(empty.first(), None);
        assert_eq!(empty.last(), None);
        assert_eq!(empty.to_string(), "");
        assert_eq!("".parse::<Bitmap>().unwrap(), empty);
    }

    #[test]
    fn set_and_unset() {
        let mut bitmap = Bitmap::new();
        bitmap.set(3);
        bitmap.set(130);
        assert!(bitmap.is_set(3));
        assert!(bitmap.is_set(130));
        assert!(!bitmap.is_set(4));
        assert_eq!(bitmap.weight(), 2);
        assert_eq!(bitmap.first(), Some(3));
        assert_eq!(bitmap.last(), Some(130));

        bitmap.unset(130);
        assert_eq!(bitmap, Bitmap::from_index(3));
        bitmap.unset(3);
        assert_eq!(bitmap, Bitmap::new());
    }

    #[test]
    fn cpulist_syntax() {
        let bitmap = "0-3,8,10-11".parse::<Bitmap>().unwrap();
        assert_eq!(
            bitmap.iter_set().collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 8, 10, 11]
        );
        assert_eq!(bitmap.to_string(), "0-3,8,10-11");

        let hyperthreaded = "0-15,128-143\n".parse::<Bitmap>().unwrap();
        assert_eq!(hyperthreaded.weight(), 32);
        assert_eq!(hyperthreaded.last(), Some(143));
    }

    #[test]
    fn invalid_cpulist() {
        for invalid in ["a", "1-", "3-1", "0,,1", "-2"] {
            assert_eq!(
                invalid.parse::<Bitmap>(),
                Err(BitmapParseError(invalid.to_owned()))
            );
        }
    }

    #[test]
    fn oversized_cpulist() {
        let max = Bitmap::MAX_PARSED_INDEX;
        assert_eq!(max.to_string().parse::<Bitmap>(), Ok(Bitmap::from_index(max)));
        for invalid in [
            format!("{}", max + 1),
            "0-99999999999".to_owned(),
            format!("0,{}", usize::MAX),
        ] {
            assert_eq!(
                invalid.parse::<Bitmap>(),
                Err(BitmapParseError(invalid.clone()))
            );
        }
    }

    #[test]
    fn inclusion_and_intersection() {
        let big = "0-7".parse::<Bitmap>().unwrap();
        let small = "2-3".parse::<Bitmap>().unwrap();
        let other = "6-9".parse::<Bitmap>().unwrap();
        assert!(big.includes(&small));
        assert!(!small.includes(&big));
        assert!(big.includes(&Bitmap::new()));
        assert!(big.intersects(&other));
        assert!(!small.intersects(&other));
        assert_eq!(&big & &other, "6-7".parse().unwrap());
        assert_eq!(&small | &other, "2-3,6-9".parse().unwrap());
    }

    proptest! {
        #[test]
        fn matches_btreeset(indices in prop::collection::btree_set(0usize..300, 0..20)) {
            let bitmap = indices.iter().copied().collect::<Bitmap>();
            prop_assert_eq!(bitmap.weight(), indices.len());
            prop_assert_eq!(bitmap.first(), indices.first().copied());
            prop_assert_eq!(bitmap.last(), indices.last().copied());
            prop_assert_eq!(
                bitmap.iter_set().collect::<BTreeSet<_>>(),
                indices.clone()
            );
            prop_assert_eq!(bitmap.to_string().parse::<Bitmap>().unwrap(), bitmap);
        }
    }
}
