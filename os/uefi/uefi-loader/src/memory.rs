#![allow(unsafe_code)]

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::ptr::NonNull;
use core::ptr::null_mut;
use kernel_mdl::{MemoryDescriptor, MemoryDescriptorList, MemoryType};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, pages_for};
use kernel_vmem::{FrameSource, PhysMapper, TableUse};
use log::trace;
use uefi::Status;
use uefi::boot;
use uefi::boot::{AllocateType, MemoryType as EfiMemoryType};

/// A UEFI boot-services pool allocation backing Rust's global allocator.
///
/// Valid only while boot services are active; every heap object must be
/// dropped or leaked into loader-owned pages before exit-boot-services.
/// The pool guarantees 8-byte alignment only, so allocations over-allocate
/// and stash the original pointer just before the aligned block.
pub struct UefiBootAllocator;

#[global_allocator]
static GLOBAL_ALLOC: UefiBootAllocator = UefiBootAllocator;

unsafe impl GlobalAlloc for UefiBootAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let align = layout.align().max(size_of::<usize>());
        let size = layout.size().max(1);
        let Some(total) = size
            .checked_add(align)
            .and_then(|v| v.checked_add(size_of::<usize>()))
        else {
            return null_mut();
        };

        let Ok(raw) = boot::allocate_pool(EfiMemoryType::LOADER_DATA, total) else {
            return null_mut();
        };

        let raw_ptr = raw.as_ptr();
        let addr = raw_ptr as usize + size_of::<usize>();
        let aligned = (addr + (align - 1)) & !(align - 1);
        let header_ptr = (aligned - size_of::<usize>()) as *mut usize;

        // Remember the pool pointer for dealloc.
        unsafe {
            ptr::write(header_ptr, raw_ptr as usize);
        }
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if ptr.is_null() {
            return;
        }

        let header_ptr = (ptr as usize - size_of::<usize>()) as *mut usize;
        let orig_ptr = unsafe { ptr::read(header_ptr) as *mut u8 };

        // SAFETY: `orig_ptr` was returned by `allocate_pool` and stored by us.
        let _ = unsafe { boot::free_pool(NonNull::new_unchecked(orig_ptr)) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }

        p
    }
}

/// Pointer to physical memory through the firmware's flat mapping.
///
/// Valid until the loader switches to its own root table.
#[must_use]
pub const fn identity_ptr<T>(pa: PhysicalAddress) -> *mut T {
    VirtualAddress::new(pa.as_u64()).as_mut_ptr()
}

/// Byte view of physical memory through the firmware's flat mapping.
///
/// # Safety
/// `pa..pa + len` must be plain memory the firmware maps readable, and
/// nothing may write it for `'a`.
#[must_use]
pub unsafe fn identity_slice<'a>(pa: PhysicalAddress, len: usize) -> &'a [u8] {
    unsafe { core::slice::from_raw_parts(identity_ptr(pa), len) }
}

/// Mutable byte view of physical memory through the firmware's flat mapping.
///
/// # Safety
/// `pa..pa + len` must be memory this loader owns exclusively.
#[must_use]
pub unsafe fn identity_slice_mut<'a>(pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(identity_ptr(pa), len) }
}

/// Physical access for the paging engine and the table parsers while the
/// firmware's flat mapping is live.
pub struct IdentityMapper;

impl PhysMapper for IdentityMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *identity_ptr(pa) }
    }
}

impl kernel_acpi_tables::PhysMapRo for IdentityMapper {
    unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> &'a [u8] {
        unsafe { identity_slice(PhysicalAddress::new(paddr), len) }
    }
}

/// Page-granular memory service over the firmware allocator.
///
/// Every allocation is recorded in the physical descriptor list under its
/// kernel-facing type, so the final hand-off map can tell the kernel which
/// firmware `LoaderData` ranges it must keep and which it may reclaim.
pub struct LoaderMemory {
    physical: MemoryDescriptorList,
}

impl LoaderMemory {
    #[must_use]
    pub const fn new(physical: MemoryDescriptorList) -> Self {
        Self { physical }
    }

    /// The tracked physical map.
    #[must_use]
    pub const fn physical_map(&self) -> &MemoryDescriptorList {
        &self.physical
    }

    /// Allocates whole pages covering `bytes` and tags them as `kind`.
    ///
    /// # Errors
    /// The firmware status when it is out of pages, or
    /// [`Status::INVALID_PARAMETER`] for a size no allocation can carry.
    pub fn allocate_region(
        &mut self,
        bytes: u64,
        kind: MemoryType,
    ) -> Result<PhysicalAddress, Status> {
        let pages = pages_for(bytes);
        let count = usize::try_from(pages).map_err(|_| Status::INVALID_PARAMETER)?;
        if count == 0 {
            return Err(Status::INVALID_PARAMETER);
        }
        let raw = boot::allocate_pages(AllocateType::AnyPages, EfiMemoryType::LOADER_DATA, count)
            .map_err(|err| err.status())?;
        let base = PhysicalAddress::from_ptr(raw.as_ptr().cast_const());
        self.physical
            .insert(MemoryDescriptor::new(base.as_u64(), pages * PAGE_SIZE, kind));
        trace!("allocated {pages} pages at {base} ({kind:?})");
        Ok(base)
    }

    /// Returns a region from [`Self::allocate_region`] to the firmware.
    pub fn free_region(&mut self, base: PhysicalAddress, bytes: u64) {
        let pages = pages_for(bytes);
        let Ok(count) = usize::try_from(pages) else {
            return;
        };
        let Some(ptr) = NonNull::new(identity_ptr::<u8>(base)) else {
            return;
        };
        // SAFETY: the region came from allocate_pages with this page count.
        let _ = unsafe { boot::free_pages(ptr, count) };
        self.physical.insert(MemoryDescriptor::new(
            base.as_u64(),
            pages * PAGE_SIZE,
            MemoryType::Free,
        ));
    }
}

impl FrameSource for LoaderMemory {
    fn allocate_table_frame(&mut self, usage: TableUse) -> Option<PhysicalAddress> {
        let kind = match usage {
            TableUse::Kernel => MemoryType::PageTables,
            TableUse::Boot => MemoryType::BootPageTables,
        };
        self.allocate_region(PAGE_SIZE, kind).ok()
    }
}
