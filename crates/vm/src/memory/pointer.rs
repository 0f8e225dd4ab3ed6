//! Defines the [`Pointer`] type.

use num_traits::ToPrimitive;
use starknet_types_core::felt::Felt;

use crate::error::Error;

/// A pointer within a [`Memory`](super::Memory) segment.
///
/// # Segment provenance
///
/// The sign of [`segment`](Self::segment) distinguishes *real* segments, allocated up front
/// by the runner (program, execution, builtins), from *temporary* segments, allocated on
/// demand by builtins while the program runs and resolved to a real address only once the run
/// has finished. A non-negative segment index is real; a negative one is temporary, with
/// temporary segment `0` encoded as `-1`, temporary segment `1` as `-2`, and so on. This
/// asymmetric encoding (rather than, say, a separate enum) is what lets every other part of
/// the crate treat `Pointer` as a single flat, copyable, hashable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pointer {
    /// The index of the segment in the memory.
    ///
    /// Non-negative for a real segment, negative for a temporary one.
    pub segment: isize,
    /// The offset within the segment.
    pub offset: usize,
}

impl Pointer {
    /// Creates a pointer into a real segment.
    #[inline(always)]
    pub const fn real(segment: usize, offset: usize) -> Self {
        Self {
            segment: segment as isize,
            offset,
        }
    }

    /// Creates a pointer into temporary segment `index`.
    #[inline(always)]
    pub const fn temporary(index: usize, offset: usize) -> Self {
        Self {
            segment: -(index as isize) - 1,
            offset,
        }
    }

    /// Returns whether this pointer references a temporary segment.
    #[inline(always)]
    pub const fn is_temporary(&self) -> bool {
        self.segment < 0
    }

    /// Returns the index of the temporary segment this pointer references, if any.
    #[inline(always)]
    pub const fn temporary_index(&self) -> Option<usize> {
        if self.segment < 0 {
            Some((-self.segment - 1) as usize)
        } else {
            None
        }
    }

    /// Returns the signed distance between `self` and `other`, given that they refer to the
    /// same segment.
    pub fn subtract(&self, other: &Self) -> Result<isize, Error> {
        if self.segment != other.segment {
            return Err(Error::IncoherentProvenance(*self, *other));
        }

        let dist = self.offset as i128 - other.offset as i128;
        isize::try_from(dist).map_err(|_| Error::PointerTooLarge(*self))
    }

    /// Adds `offset` to `self.offset` using wrapping arithmetic.
    #[inline(always)]
    pub fn wrapping_add(self, offset: usize) -> Self {
        Self {
            segment: self.segment,
            offset: self.offset.wrapping_add(offset),
        }
    }

    /// Subtracts `offset` from `self.offset` using wrapping arithmetic.
    #[inline(always)]
    pub fn wrapping_sub(self, offset: usize) -> Self {
        Self {
            segment: self.segment,
            offset: self.offset.wrapping_sub(offset),
        }
    }

    /// Adds a signed [`Felt`] offset to this pointer, failing if the resulting offset would
    /// not fit in a `usize` or would underflow below zero.
    pub fn checked_add_felt(self, offset: &Felt) -> Result<Self, Error> {
        if let Some(positive) = offset.to_usize() {
            self.offset
                .checked_add(positive)
                .map(|offset| Self {
                    segment: self.segment,
                    offset,
                })
                .ok_or(Error::PointerTooLarge(self))
        } else {
            // `Felt` has no notion of sign; a "negative" offset is represented as `p - value`
            // for the field's prime `p`. We recover the intended signed magnitude by negating.
            let negated = -offset;
            let magnitude = negated.to_usize().ok_or(Error::PointerTooLarge(self))?;
            self.offset
                .checked_sub(magnitude)
                .map(|offset| Self {
                    segment: self.segment,
                    offset,
                })
                .ok_or(Error::PointerTooLarge(self))
        }
    }
}
