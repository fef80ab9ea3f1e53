//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses passed between the boot
//! loader's memory-map bookkeeping and the paging engine.
//!
//! ## Overview
//!
//! Mixing up a physical frame number and a virtual address is the classic
//! early-boot bug; these zero-cost `u64` newtypes make the mix-up a type
//! error instead:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | Host RAM or MMIO, as the hardware sees it. |
//! | [`VirtualAddress`] | A page-table translated address. |
//!
//! ## Page Sizes
//!
//! Page granularities are marker types implementing [`PageSize`]:
//!
//! - [`Size4K`] — 4 KiB pages (base granularity)
//! - [`Size2M`] — 2 MiB large pages (used for hardware-region maps)
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
//! assert_eq!(pa.align_down::<Size4K>().as_u64(), 0x0000_0010_2000_0000);
//! assert_eq!(pa.page_offset::<Size4K>(), 0x42);
//!
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1042);
//! // Mapping requires matching in-page offsets on both sides.
//! assert_eq!(va.page_offset::<Size4K>(), pa.page_offset::<Size4K>());
//! ```
//!
//! ## Design Notes
//!
//! - `#[repr(transparent)]`, `Copy`, `Eq`, `Ord`, `Hash`: usable as map keys
//!   and across FFI-ish boundaries such as the kernel init block.
//! - All alignment math is `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

use core::fmt;
use core::hash::Hash;
use core::ops::{Add, AddAssign, Sub};

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e. number of low bits used for the offset.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

/// 4 KiB page (4096 bytes).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;

    fn as_str() -> &'static str {
        "4K"
    }
}

/// 2 MiB page (`2_097_152` bytes).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;
impl sealed::Sealed for Size2M {}
impl PageSize for Size2M {
    const SIZE: u64 = 2 * 1024 * 1024;
    const SHIFT: u32 = 21;

    fn as_str() -> &'static str {
        "2M"
    }
}

impl fmt::Debug for Size4K {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Debug for Size2M {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

/// Base page size used by both memory maps.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = Size4K::SHIFT;

/// Align `value` down to the next multiple of `align` (a power of two).
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1234, 0x1000), 0x1000);
/// assert_eq!(align_down(0x1000, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Align `value` up to the next multiple of `align` (a power of two).
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0x1234, 0x1000), 0x2000);
/// assert_eq!(align_up(0x1000, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Number of whole pages needed to cover `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Physical memory address.
///
/// Denotes host RAM or MMIO. Page-table entries store a page-aligned
/// physical base; use [`align_down`](Self::align_down) and
/// [`page_offset`](Self::page_offset) to reason about base vs. offset
/// explicitly.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

/// Virtual memory address.
///
/// An address subject to page-table translation. On x86-64 the upper bits
/// must be a sign extension of bit 47; [`is_canonical`](Self::is_canonical)
/// checks that.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

macro_rules! address_common {
    ($name:ident) => {
        impl $name {
            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            #[inline]
            #[must_use]
            pub const fn is_zero(self) -> bool {
                self.0 == 0
            }

            /// Align down to the page boundary of size `S`.
            #[inline]
            #[must_use]
            pub const fn align_down<S: PageSize>(self) -> Self {
                Self(self.0 & !(S::SIZE - 1))
            }

            /// Align up to the page boundary of size `S`.
            #[inline]
            #[must_use]
            pub const fn align_up<S: PageSize>(self) -> Self {
                Self((self.0 + S::SIZE - 1) & !(S::SIZE - 1))
            }

            /// The offset within the containing page of size `S`.
            #[inline]
            #[must_use]
            pub const fn page_offset<S: PageSize>(self) -> u64 {
                self.0 & (S::SIZE - 1)
            }

            /// Whether this address lies on a boundary of size `S`.
            #[inline]
            #[must_use]
            pub const fn is_aligned<S: PageSize>(self) -> bool {
                self.page_offset::<S>() == 0
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(v: u64) -> Self {
                Self::new(v)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(v: $name) -> Self {
                v.as_u64()
            }
        }

        impl Add<u64> for $name {
            type Output = Self;
            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl Sub<$name> for $name {
            type Output = u64;
            #[inline]
            fn sub(self, rhs: $name) -> u64 {
                self.0 - rhs.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}", self.0)
            }
        }
    };
}

address_common!(PhysicalAddress);
address_common!(VirtualAddress);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }
}

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// True when the upper 16 bits sign-extend bit 47.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let upper = self.0 >> 47;
        upper == 0 || upper == 0x1_FFFF
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}
