//! Bit-range arithmetic over 64-bit addresses.
//!
//! Every address that crosses a component boundary is either a full
//! [`Address`] or a slice of one with an explicit extent. Mixing extents is a
//! programming bug and panics immediately; there is no recovery path.
//! Widening a slice zero-fills the new bits, narrowing masks.

use std::fmt;

use crate::constants::{LOG2_BLOCK_SIZE, LOG2_PAGE_SIZE};

pub const ADDRESS_BITS: u32 = 64;

/// A half-open bit range `[lower, upper)` on a 64-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub upper: u32,
    pub lower: u32,
}

impl Extent {
    pub fn new(upper: u32, lower: u32) -> Self {
        assert!(upper <= ADDRESS_BITS, "extent upper bound {upper} exceeds {ADDRESS_BITS}");
        assert!(lower <= upper, "extent [{lower}, {upper}) is inverted");
        Extent { upper, lower }
    }

    pub fn width(&self) -> u32 {
        self.upper - self.lower
    }

    /// Smallest extent covering both operands.
    pub fn union(&self, other: Extent) -> Extent {
        Extent::new(self.upper.max(other.upper), self.lower.min(other.lower))
    }
}

/// Mask with `width` low bits set. Total for widths up to 64.
pub fn bitmask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

fn shl64(value: u64, amount: u32) -> u64 {
    if amount >= 64 {
        0
    } else {
        value << amount
    }
}

fn shr64(value: u64, amount: u32) -> u64 {
    if amount >= 64 {
        0
    } else {
        value >> amount
    }
}

pub fn lg2(value: u64) -> u32 {
    debug_assert!(value.is_power_of_two(), "lg2 of non-power-of-two {value}");
    value.trailing_zeros()
}

/// A value confined to an [`Extent`]. The stored value is shifted down by
/// `extent.lower`, so the in-domain invariant is `value < 1 << width`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slice {
    extent: Extent,
    value: u64,
}

impl Slice {
    /// Wrap a raw in-domain value. Bits outside the extent width are masked.
    pub fn new(extent: Extent, value: u64) -> Self {
        Slice {
            extent,
            value: value & bitmask(extent.width()),
        }
    }

    /// Re-slice `other` into `extent`, shifting and masking as needed.
    /// Widened bits are zero.
    pub fn from_slice(extent: Extent, other: Slice) -> Self {
        let masked = other.absolute() & bitmask(extent.upper) & !bitmask(extent.lower);
        Slice {
            extent,
            value: shr64(masked, extent.lower),
        }
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// The raw in-domain value.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// The value positioned at its absolute bit location.
    pub fn absolute(&self) -> u64 {
        shl64(self.value, self.extent.lower)
    }

    fn check_same_extent(&self, other: &Slice, what: &str) {
        assert!(
            self.extent == other.extent,
            "{what} on mismatched extents [{},{}) vs [{},{})",
            self.extent.lower,
            self.extent.upper,
            other.extent.lower,
            other.extent.upper,
        );
    }

    /// Equality that insists on matching extents.
    pub fn same(&self, other: Slice) -> bool {
        self.check_same_extent(&other, "compare");
        self.value == other.value
    }

    /// Take a sub-slice; `sub` is relative to this slice's lower bound.
    pub fn slice(&self, sub: Extent) -> Slice {
        let new_ext = Extent::new(
            (sub.upper + self.extent.lower).min(ADDRESS_BITS),
            (sub.lower + self.extent.lower).min(ADDRESS_BITS),
        );
        Slice::new(new_ext, shr64(self.value, sub.lower))
    }

    pub fn slice_upper(&self, new_lower: u32) -> Slice {
        self.slice(Extent::new(ADDRESS_BITS - self.extent.lower, new_lower))
    }

    pub fn slice_lower(&self, new_upper: u32) -> Slice {
        self.slice(Extent::new(new_upper, 0))
    }

    /// In-domain addition; wraps within the extent width.
    pub fn offset_by(&self, delta: i64) -> Slice {
        let raw = self.value.wrapping_add(delta as u64);
        Slice::new(self.extent, raw)
    }
}

/// Signed distance from `base` to `other`. Panics if the magnitude does not
/// fit in `i64`; callers that know the ordering should use [`uoffset`].
pub fn offset(base: Slice, other: Slice) -> i64 {
    base.check_same_extent(&other, "offset");
    let (abs, neg) = if base.value > other.value {
        (base.value - other.value, true)
    } else {
        (other.value - base.value, false)
    };
    assert!(abs <= i64::MAX as u64, "offset magnitude {abs:#x} overflows the difference type");
    if neg {
        -(abs as i64)
    } else {
        abs as i64
    }
}

/// Unsigned distance from `base` to `other`; requires `base <= other`.
pub fn uoffset(base: Slice, other: Slice) -> u64 {
    base.check_same_extent(&other, "uoffset");
    assert!(base.value <= other.value, "uoffset base {:#x} succeeds other {:#x}", base.value, other.value);
    other.value - base.value
}

/// Join slices; later slices overwrite overlapping bits of earlier ones, and
/// the result extent is the union of all extents.
pub fn splice(slices: &[Slice]) -> Slice {
    assert!(!slices.is_empty(), "splice of no slices");
    let extent = slices.iter().fold(slices[0].extent, |acc, s| acc.union(s.extent));
    let mut value = 0u64;
    for s in slices {
        let mask = shr64(bitmask(s.extent.upper) & !bitmask(s.extent.lower), extent.lower);
        value = (value & !mask) | (shr64(s.absolute(), extent.lower) & mask);
    }
    Slice { extent, value }
}

impl fmt::Debug for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}):{:#x}", self.extent.lower, self.extent.upper, self.value)
    }
}

macro_rules! address_kind {
    ($(#[$doc:meta])* $name:ident, $lower:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw in-domain value (no shifting is performed).
            pub fn new(value: u64) -> Self {
                $name(value & bitmask(ADDRESS_BITS - $lower))
            }

            pub fn extent() -> Extent {
                Extent::new(ADDRESS_BITS, $lower)
            }

            pub fn value(&self) -> u64 {
                self.0
            }

            pub fn to_slice(&self) -> Slice {
                Slice::new(Self::extent(), self.0)
            }

            pub fn offset_by(&self, delta: i64) -> Self {
                $name::new(self.0.wrapping_add(delta as u64))
            }
        }

        impl From<Address> for $name {
            fn from(addr: Address) -> Self {
                $name(addr.value() >> $lower)
            }
        }

        impl From<$name> for Address {
            fn from(part: $name) -> Address {
                Address::new(part.0 << $lower)
            }
        }
    };
}

/// A full 64-bit address, virtual or physical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address {
    pub fn new(value: u64) -> Self {
        Address(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn to_slice(&self) -> Slice {
        Slice::new(Extent::new(ADDRESS_BITS, 0), self.0)
    }

    pub fn block_offset(&self) -> u64 {
        self.0 & bitmask(LOG2_BLOCK_SIZE)
    }

    pub fn page_offset(&self) -> u64 {
        self.0 & bitmask(LOG2_PAGE_SIZE)
    }

    pub fn offset_by(&self, delta: i64) -> Self {
        Address(self.0.wrapping_add(delta as u64))
    }

    /// Rebuild an address from a page number and a page offset.
    pub fn from_page_parts(page: PageNumber, offset: u64) -> Self {
        Address((page.value() << LOG2_PAGE_SIZE) | (offset & bitmask(LOG2_PAGE_SIZE)))
    }
}

address_kind!(
    /// The bits of an address above the block offset.
    BlockNumber,
    LOG2_BLOCK_SIZE
);
address_kind!(
    /// The bits of an address above the page offset.
    PageNumber,
    LOG2_PAGE_SIZE
);

/// Signed block-granularity distance between two addresses.
pub fn block_distance(base: Address, other: Address) -> i64 {
    offset(BlockNumber::from(base).to_slice(), BlockNumber::from(other).to_slice())
}
