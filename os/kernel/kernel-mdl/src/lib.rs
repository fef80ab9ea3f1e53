//! # Memory Descriptor Lists
//!
//! The boot path keeps two maps of address space: one for physical memory
//! (seeded from the firmware memory map) and one for the kernel virtual
//! range. Both are a [`MemoryDescriptorList`]: an ordered set of
//! non-overlapping `[base, base + size)` ranges, each tagged with a
//! [`MemoryType`].
//!
//! Firmware memory maps overlap and contradict themselves, so insertion uses
//! *override* semantics: a newly inserted descriptor clips, splits, or
//! removes whatever previously described its range. Adjacent ranges of the
//! same type coalesce.
//!
//! ```rust
//! # use kernel_mdl::*;
//! let mut mdl = MemoryDescriptorList::new();
//! mdl.insert(MemoryDescriptor::new(0x0, 0x10000, MemoryType::Free));
//! // Firmware later claims a hole in the middle; the free run splits.
//! mdl.insert(MemoryDescriptor::new(0x4000, 0x1000, MemoryType::Reserved));
//! assert_eq!(mdl.descriptor_count(), 3);
//! assert_eq!(mdl.free_space(), 0xF000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod descriptor;
mod list;

pub use descriptor::{MemoryDescriptor, MemoryType};
pub use list::{AllocationStrategy, MemoryDescriptorList};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MdlError {
    /// No free range can satisfy the requested size and alignment.
    #[error("insufficient memory for an allocation of {size:#x} bytes (alignment {alignment:#x})")]
    InsufficientResources { size: u64, alignment: u64 },

    /// Zero-sized or otherwise ill-formed request.
    #[error("invalid allocation parameter")]
    InvalidParameter,
}
