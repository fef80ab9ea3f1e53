//! # Initial Virtual Address Space Construction
//!
//! Builds the four-level x86-64 page-table tree the kernel starts with and
//! tracks the kernel virtual address range in a descriptor list, so the
//! hand-off can tell the kernel exactly which virtual memory is spoken for.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address divides into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The upper four fields index four levels of tables of 512 entries each;
//! a PD entry with `PS=1` terminates the walk early with a 2 MiB page.
//!
//! ## Self-map
//!
//! One root-table slot ([`SELF_MAP_INDEX`]) points back at the root table
//! itself. Walking an address under the resulting window
//! ([`SELF_MAP_BASE`]) resolves to the page *tables* instead of the mapped
//! pages, which lets the kernel edit any live table through a fixed virtual
//! address without further setup.
//!
//! ## Collaborators
//!
//! Physical frames for tables come from a [`FrameSource`] and are reached
//! through a [`PhysMapper`]; the boot environment implements both (firmware
//! page allocations, identity-mapped access). Hosted tests substitute
//! array-backed fakes.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod attributes;
mod entry;
mod space;
mod table;

pub use attributes::{AttributeUpdate, MapAttributes};
pub use entry::PageEntry;
pub use space::AddressSpace;
pub use table::{PageTable, TABLE_ENTRIES, split_indices};

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use thiserror::Error;

/// First virtual address belonging to the kernel (root-table index 0x100).
pub const KERNEL_VA_START: u64 = 0xFFFF_8000_0000_0000;

/// Exclusive end of the kernel virtual range; the self-map window starts
/// here.
pub const KERNEL_VA_END: u64 = 0xFFFF_FF00_0000_0000;

/// Root-table slot reserved for the self-map.
pub const SELF_MAP_INDEX: usize = 0x1FE;

/// Base of the virtual window through which page tables are visible.
pub const SELF_MAP_BASE: u64 = 0xFFFF_0000_0000_0000 | ((SELF_MAP_INDEX as u64) << 39);

const _: () = assert!(SELF_MAP_BASE == KERNEL_VA_END, "self-map window follows kernel range");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmemError {
    /// The paging structures have not been created yet.
    #[error("paging structures are not initialized")]
    NotInitialized,

    /// No physical frame or virtual range available.
    #[error("insufficient resources for paging structures")]
    InsufficientResources,

    /// Mismatched page offsets, zero size, or an unmapped page where a
    /// mapping is required.
    #[error("invalid mapping parameter")]
    InvalidParameter,

    /// The requested virtual range overlaps an existing reservation.
    #[error("virtual address range conflicts with an existing mapping")]
    MemoryConflict,
}

impl From<kernel_mdl::MdlError> for VmemError {
    fn from(err: kernel_mdl::MdlError) -> Self {
        match err {
            kernel_mdl::MdlError::InsufficientResources { .. } => Self::InsufficientResources,
            kernel_mdl::MdlError::InvalidParameter => Self::InvalidParameter,
        }
    }
}

/// Which half of the address space a new page table serves.
///
/// Kernel-range tables survive into the running system; boot tables back
/// identity and temporary mappings and are reclaimed later. The frame
/// source tags its physical-map records accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableUse {
    /// Table reachable from a kernel virtual address.
    Kernel,
    /// Table for identity/temporary mappings only.
    Boot,
}

/// Supplies 4 KiB physical frames for page tables.
///
/// Frame contents are not assumed to be zero; the paging code clears every
/// fresh table itself.
pub trait FrameSource {
    /// Allocates one page-aligned frame, tagged with its use. `None` on
    /// exhaustion.
    fn allocate_table_frame(&mut self, usage: TableUse) -> Option<PhysicalAddress>;
}

/// Converts physical addresses into usable pointers in the *current*
/// (pre-switch) address space.
///
/// The boot environment runs identity-mapped, so this is a cast there; the
/// hosted tests translate into an owned frame array.
pub trait PhysMapper {
    /// # Safety
    /// `pa` must be mapped writable in the current address space for the
    /// lifetime `'a`, and the bytes there must be valid for `T`.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Virtual address at which the leaf page *table* covering `va` appears
/// inside the self-map window.
///
/// Shifting the address right by one level reuses the walk hardware: the
/// window address's four indices become (self-map, original PML4, PDPT,
/// PD), so the walk lands on the page table instead of the mapped page.
#[inline]
#[must_use]
pub const fn self_map_table_of(va: VirtualAddress) -> VirtualAddress {
    let table_index = (va.as_u64() >> 12) & 0xF_FFFF_FFFF;
    VirtualAddress::new(SELF_MAP_BASE | ((table_index >> 9) << 12))
}
