use kernel_mdl::{AllocationStrategy, MemoryDescriptor, MemoryDescriptorList, MemoryType};
use kernel_memory_addresses::{
    PAGE_SHIFT, PageSize, PhysicalAddress, Size2M, Size4K, VirtualAddress, align_up, pages_for,
};
use log::{debug, trace};

use crate::{
    AttributeUpdate, FrameSource, KERNEL_VA_END, KERNEL_VA_START, MapAttributes, PageEntry,
    PageTable, PhysMapper, SELF_MAP_INDEX, TableUse, VmemError, split_indices,
};

/// The root of the four-level page-table tree plus the bookkeeping for the
/// kernel virtual range.
///
/// All table memory lives in physical frames reached through a
/// [`PhysMapper`]; the struct itself only holds the root pointer and the
/// virtual-range descriptor list. Mappings are built into the *future*
/// address space, so no TLB maintenance happens here.
pub struct AddressSpace {
    root: PhysicalAddress,
    virtual_space: MemoryDescriptorList,
}

impl AddressSpace {
    /// Allocates the root table, installs the self-map entry, and opens the
    /// kernel virtual range `[KERNEL_VA_START, KERNEL_VA_END)` as one free
    /// descriptor.
    ///
    /// Entries default to write-back caching; nothing in the layout assumes
    /// a single processor.
    ///
    /// # Errors
    ///
    /// [`VmemError::InsufficientResources`] when no frame is available for
    /// the root table.
    pub fn initialize_paging_structures<F, M>(frames: &mut F, phys: &M) -> Result<Self, VmemError>
    where
        F: FrameSource + ?Sized,
        M: PhysMapper + ?Sized,
    {
        let root = frames
            .allocate_table_frame(TableUse::Kernel)
            .ok_or(VmemError::InsufficientResources)?;
        let table = unsafe { phys.phys_to_mut::<PageTable>(root) };
        table.zero();

        // The self-map window must not leak to user mode or host code.
        table[SELF_MAP_INDEX] = PageEntry::table(root)
            .with_user(false)
            .with_no_execute(true);

        let mut virtual_space = MemoryDescriptorList::new();
        virtual_space.insert(MemoryDescriptor::new(
            KERNEL_VA_START,
            KERNEL_VA_END - KERNEL_VA_START,
            MemoryType::Free,
        ));

        debug!("paging root allocated at {root}");
        Ok(Self {
            root,
            virtual_space,
        })
    }

    /// Physical address of the root table, ready to be loaded into CR3.
    #[inline]
    #[must_use]
    pub const fn root_table(&self) -> PhysicalAddress {
        self.root
    }

    /// The kernel virtual range bookkeeping.
    #[inline]
    #[must_use]
    pub const fn virtual_space(&self) -> &MemoryDescriptorList {
        &self.virtual_space
    }

    /// Maps `size` bytes of physical memory starting at `pa`.
    ///
    /// With `va = None` a free virtual range is chosen from the kernel
    /// window: highest fit for [`MemoryType::LoaderTemporary`] so
    /// short-lived mappings cluster away from permanent ones, first fit
    /// otherwise. An explicit `va` may also lie below the kernel window
    /// (identity mappings); such ranges are not tracked in the virtual
    /// descriptor list.
    ///
    /// Missing tables are allocated along the way and tagged
    /// [`TableUse::Boot`] when they serve identity or loader-temporary
    /// ranges, [`TableUse::Kernel`] otherwise. The virtual range is
    /// published only if every page maps; a partial failure clears what was
    /// written and releases the reservation.
    ///
    /// Returns the virtual address corresponding to `pa` (same page
    /// offset).
    ///
    /// # Errors
    ///
    /// [`VmemError::InvalidParameter`] for a zero size, mismatched page
    /// offsets, a non-canonical address, a range touching the self-map
    /// slot, or a range straddling the kernel window boundary.
    /// [`VmemError::MemoryConflict`] when the range overlaps an existing
    /// reservation or a present mapping.
    /// [`VmemError::InsufficientResources`] when table frames or virtual
    /// space run out.
    #[allow(clippy::too_many_arguments)]
    pub fn map_physical_address<F, M>(
        &mut self,
        frames: &mut F,
        phys: &M,
        va: Option<VirtualAddress>,
        pa: PhysicalAddress,
        size: u64,
        attributes: MapAttributes,
        kind: MemoryType,
    ) -> Result<VirtualAddress, VmemError>
    where
        F: FrameSource + ?Sized,
        M: PhysMapper + ?Sized,
    {
        if size == 0 {
            return Err(VmemError::InvalidParameter);
        }
        let step = if attributes.large() {
            Size2M::SIZE
        } else {
            Size4K::SIZE
        };
        let offset = pa.as_u64() & (step - 1);
        let base_pa = PhysicalAddress::new(pa.as_u64() - offset);
        let span = align_up(offset + size, step);

        let base_va = match va {
            Some(requested) => {
                if !requested.is_canonical() || requested.as_u64() & (step - 1) != offset {
                    return Err(VmemError::InvalidParameter);
                }
                let base = VirtualAddress::new(requested.as_u64() - offset);
                self.reserve_exact(base, span, kind)?;
                base
            }
            None => {
                let strategy = if kind == MemoryType::LoaderTemporary {
                    AllocationStrategy::HighestFit
                } else {
                    AllocationStrategy::Any
                };
                let base = self.virtual_space.allocate(span, step, kind, strategy)?;
                VirtualAddress::new(base)
            }
        };

        let usage = table_use(base_va, kind);
        match map_pages(self.root, frames, phys, base_va, base_pa, span, attributes, usage) {
            Ok(()) => {
                trace!("mapped {base_va} -> {base_pa} ({span:#x} bytes, {kind:?})");
                Ok(VirtualAddress::new(base_va.as_u64() + offset))
            }
            Err(err) => {
                if covered_by_window(base_va.as_u64(), span) {
                    self.virtual_space.insert(MemoryDescriptor::new(
                        base_va.as_u64(),
                        span,
                        MemoryType::Free,
                    ));
                }
                Err(err)
            }
        }
    }

    /// Clears `page_count` 4 KiB pages of mappings starting at `va` and
    /// returns the range to the free pool. Pages without a mapping are left
    /// untouched.
    ///
    /// # Errors
    ///
    /// [`VmemError::InvalidParameter`] for a zero count, an unaligned `va`,
    /// or a range that ends inside a 2 MiB mapping.
    pub fn unmap_physical_address<M>(
        &mut self,
        phys: &M,
        va: VirtualAddress,
        page_count: u64,
    ) -> Result<(), VmemError>
    where
        M: PhysMapper + ?Sized,
    {
        if page_count == 0 || !va.is_aligned::<Size4K>() {
            return Err(VmemError::InvalidParameter);
        }
        let span = page_count
            .checked_mul(Size4K::SIZE)
            .filter(|span| va.as_u64().checked_add(*span).is_some())
            .ok_or(VmemError::InvalidParameter)?;
        let large_pages = Size2M::SIZE >> PAGE_SHIFT;
        let mut index = 0;
        while index < page_count {
            let current = VirtualAddress::new(va.as_u64() + (index << PAGE_SHIFT));
            match leaf_slot(self.root, phys, current) {
                Slot::Entry4K(slot) => {
                    *slot = PageEntry::new();
                    index += 1;
                }
                Slot::Entry2M(slot) => {
                    if !current.is_aligned::<Size2M>() || page_count - index < large_pages {
                        return Err(VmemError::InvalidParameter);
                    }
                    *slot = PageEntry::new();
                    index += large_pages;
                }
                Slot::Missing => index += 1,
            }
        }

        if covered_by_window(va.as_u64(), span) {
            self.virtual_space
                .insert(MemoryDescriptor::new(va.as_u64(), span, MemoryType::Free));
        }
        trace!("unmapped {page_count} pages at {va}");
        Ok(())
    }

    /// Rewrites the attributes of every mapped page in `[va, va + size)`.
    ///
    /// `packed` carries new attribute values in its low half and a mask of
    /// attributes to modify in its high half; unmasked attributes keep
    /// their old value. Unmapped pages are skipped.
    ///
    /// # Errors
    ///
    /// [`VmemError::InvalidParameter`] for a zero size, an unaligned `va`,
    /// an update that would flip a page size, or a range that ends inside a
    /// 2 MiB mapping.
    pub fn change_mapping_attributes<M>(
        &mut self,
        phys: &M,
        va: VirtualAddress,
        size: u64,
        packed: u32,
    ) -> Result<(), VmemError>
    where
        M: PhysMapper + ?Sized,
    {
        if size == 0 || !va.is_aligned::<Size4K>() {
            return Err(VmemError::InvalidParameter);
        }
        let update = AttributeUpdate::from_packed(packed);
        let page_count = pages_for(size);
        let large_pages = Size2M::SIZE >> PAGE_SHIFT;
        let mut index = 0;
        while index < page_count {
            let current = VirtualAddress::new(va.as_u64() + (index << PAGE_SHIFT));
            match leaf_slot(self.root, phys, current) {
                Slot::Entry4K(slot) => {
                    if slot.present() {
                        apply_update(slot, update)?;
                    }
                    index += 1;
                }
                Slot::Entry2M(slot) => {
                    if !current.is_aligned::<Size2M>() || page_count - index < large_pages {
                        return Err(VmemError::InvalidParameter);
                    }
                    apply_update(slot, update)?;
                    index += large_pages;
                }
                Slot::Missing => index += 1,
            }
        }
        Ok(())
    }

    /// Maps the root table into kernel virtual space so the tree stays
    /// editable after the switch away from identity mapping. Returns the
    /// root's kernel virtual address.
    ///
    /// The self-map window needs no extra work here; it is reachable the
    /// moment the root is active.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::map_physical_address`] failures.
    pub fn map_paging_structures<F, M>(
        &mut self,
        frames: &mut F,
        phys: &M,
    ) -> Result<VirtualAddress, VmemError>
    where
        F: FrameSource + ?Sized,
        M: PhysMapper + ?Sized,
    {
        let root = self.root;
        let va = self.map_physical_address(
            frames,
            phys,
            None,
            root,
            Size4K::SIZE,
            MapAttributes::new().with_global(true),
            MemoryType::PageTables,
        )?;
        debug!("paging structures visible at {va}");
        Ok(va)
    }

    /// Reserves one virtual page whose leaf table is guaranteed to exist,
    /// without mapping anything there.
    ///
    /// Mapping a page at the returned address can then never require a new
    /// leaf table, which is what makes it usable as a staging slot for
    /// wiring *new* tables into the tree later.
    ///
    /// # Errors
    ///
    /// [`VmemError::InsufficientResources`] when virtual space or table
    /// frames run out.
    pub fn create_page_table_stage<F, M>(
        &mut self,
        frames: &mut F,
        phys: &M,
    ) -> Result<VirtualAddress, VmemError>
    where
        F: FrameSource + ?Sized,
        M: PhysMapper + ?Sized,
    {
        let base = self.virtual_space.allocate(
            Size4K::SIZE,
            Size4K::SIZE,
            MemoryType::PageTables,
            AllocationStrategy::Any,
        )?;
        let va = VirtualAddress::new(base);
        match leaf_slot_create(self.root, frames, phys, va, false, TableUse::Kernel) {
            Ok(_) => {
                debug!("page table stage at {va}");
                Ok(va)
            }
            Err(err) => {
                self.virtual_space.insert(MemoryDescriptor::new(
                    base,
                    Size4K::SIZE,
                    MemoryType::Free,
                ));
                Err(err)
            }
        }
    }

    /// Resolves `va` through the tree. Returns the physical address and the
    /// leaf attributes, or `None` when the walk hits a non-present entry.
    #[must_use]
    pub fn translate<M>(
        &self,
        phys: &M,
        va: VirtualAddress,
    ) -> Option<(PhysicalAddress, MapAttributes)>
    where
        M: PhysMapper + ?Sized,
    {
        let (i4, i3, i2, i1) = split_indices(va);
        let pml4: &PageTable = unsafe { phys.phys_to_mut(self.root) };
        let l4 = pml4[i4];
        if !l4.present() {
            return None;
        }
        let pdpt: &PageTable = unsafe { phys.phys_to_mut(l4.address()) };
        let l3 = pdpt[i3];
        if !l3.present() || l3.large() {
            return None;
        }
        let pd: &PageTable = unsafe { phys.phys_to_mut(l3.address()) };
        let l2 = pd[i2];
        if !l2.present() {
            return None;
        }
        if l2.large() {
            let offset = va.as_u64() & (Size2M::SIZE - 1);
            return Some((
                PhysicalAddress::new(l2.address().as_u64() + offset),
                l2.attributes(),
            ));
        }
        let pt: &PageTable = unsafe { phys.phys_to_mut(l2.address()) };
        let l1 = pt[i1];
        if !l1.present() {
            return None;
        }
        Some((
            PhysicalAddress::new(l1.address().as_u64() + va.page_offset::<Size4K>()),
            l1.attributes(),
        ))
    }

    /// Reserves an explicit range, enforcing the window rules: fully inside
    /// the kernel window it must be free; fully outside it is untracked;
    /// straddling or touching the self-map slot is rejected.
    fn reserve_exact(
        &mut self,
        base: VirtualAddress,
        span: u64,
        kind: MemoryType,
    ) -> Result<(), VmemError> {
        let start = base.as_u64();
        let end = start.checked_add(span).ok_or(VmemError::InvalidParameter)?;
        if split_indices(base).0 == SELF_MAP_INDEX {
            return Err(VmemError::InvalidParameter);
        }
        if covered_by_window(start, span) {
            if !self.virtual_space.range_is_free(start, span) {
                return Err(VmemError::MemoryConflict);
            }
            self.virtual_space
                .insert(MemoryDescriptor::new(start, span, kind));
            return Ok(());
        }
        let outside = end <= KERNEL_VA_START || start >= KERNEL_VA_END;
        if outside { Ok(()) } else { Err(VmemError::InvalidParameter) }
    }
}

/// Whether `[base, base + span)` lies fully inside the kernel window.
const fn covered_by_window(base: u64, span: u64) -> bool {
    match base.checked_add(span) {
        Some(end) => base >= KERNEL_VA_START && end <= KERNEL_VA_END,
        None => false,
    }
}

/// Which tag new tables for `base_va` get in the physical map.
const fn table_use(base_va: VirtualAddress, kind: MemoryType) -> TableUse {
    if base_va.as_u64() < KERNEL_VA_START || matches!(kind, MemoryType::LoaderTemporary) {
        TableUse::Boot
    } else {
        TableUse::Kernel
    }
}

/// Writes leaf entries for the whole span, cleaning up on failure.
#[allow(clippy::too_many_arguments)]
fn map_pages<F, M>(
    root: PhysicalAddress,
    frames: &mut F,
    phys: &M,
    base_va: VirtualAddress,
    base_pa: PhysicalAddress,
    span: u64,
    attributes: MapAttributes,
    usage: TableUse,
) -> Result<(), VmemError>
where
    F: FrameSource + ?Sized,
    M: PhysMapper + ?Sized,
{
    let step = if attributes.large() {
        Size2M::SIZE
    } else {
        Size4K::SIZE
    };
    let count = span / step;
    for index in 0..count {
        let va = VirtualAddress::new(base_va.as_u64() + index * step);
        let pa = PhysicalAddress::new(base_pa.as_u64() + index * step);
        let written =
            leaf_slot_create(root, frames, phys, va, attributes.large(), usage).and_then(|slot| {
                if slot.present() {
                    return Err(VmemError::MemoryConflict);
                }
                *slot = PageEntry::leaf(pa, attributes);
                Ok(())
            });
        if let Err(err) = written {
            clear_pages(root, phys, base_va, index, step);
            return Err(err);
        }
    }
    Ok(())
}

/// Reverts the first `mapped` entries of a failed [`map_pages`] run.
fn clear_pages<M>(root: PhysicalAddress, phys: &M, base_va: VirtualAddress, mapped: u64, step: u64)
where
    M: PhysMapper + ?Sized,
{
    for index in 0..mapped {
        let va = VirtualAddress::new(base_va.as_u64() + index * step);
        match leaf_slot(root, phys, va) {
            Slot::Entry4K(slot) | Slot::Entry2M(slot) => *slot = PageEntry::new(),
            Slot::Missing => {}
        }
    }
}

/// Walks down to the entry that maps `va`, allocating missing tables.
///
/// Stops one level early (at the PD slot) when `large` is requested.
fn leaf_slot_create<'a, F, M>(
    root: PhysicalAddress,
    frames: &mut F,
    phys: &M,
    va: VirtualAddress,
    large: bool,
    usage: TableUse,
) -> Result<&'a mut PageEntry, VmemError>
where
    F: FrameSource + ?Sized,
    M: PhysMapper + ?Sized,
{
    let (i4, i3, i2, i1) = split_indices(va);
    let pml4: &mut PageTable = unsafe { phys.phys_to_mut(root) };
    let pdpt_base = link_create(&mut pml4[i4], frames, phys, usage)?;
    let pdpt: &mut PageTable = unsafe { phys.phys_to_mut(pdpt_base) };
    let pd_base = link_create(&mut pdpt[i3], frames, phys, usage)?;
    let pd: &mut PageTable = unsafe { phys.phys_to_mut(pd_base) };
    if large {
        return Ok(&mut pd[i2]);
    }
    let pt_base = link_create(&mut pd[i2], frames, phys, usage)?;
    let pt: &mut PageTable = unsafe { phys.phys_to_mut(pt_base) };
    Ok(&mut pt[i1])
}

/// Follows an intermediate slot, allocating and zeroing a fresh table when
/// the slot is empty.
fn link_create<F, M>(
    slot: &mut PageEntry,
    frames: &mut F,
    phys: &M,
    usage: TableUse,
) -> Result<PhysicalAddress, VmemError>
where
    F: FrameSource + ?Sized,
    M: PhysMapper + ?Sized,
{
    if slot.present() {
        if slot.large() {
            return Err(VmemError::MemoryConflict);
        }
        return Ok(slot.address());
    }
    let frame = frames
        .allocate_table_frame(usage)
        .ok_or(VmemError::InsufficientResources)?;
    unsafe { phys.phys_to_mut::<PageTable>(frame) }.zero();
    *slot = PageEntry::table(frame);
    Ok(frame)
}

/// The mapping slot a walk without allocation ends at.
enum Slot<'a> {
    /// PT-level slot; may or may not be present.
    Entry4K(&'a mut PageEntry),
    /// Present 2 MiB leaf at the PD level.
    Entry2M(&'a mut PageEntry),
    /// An intermediate table on the way down does not exist.
    Missing,
}

fn leaf_slot<'a, M>(root: PhysicalAddress, phys: &M, va: VirtualAddress) -> Slot<'a>
where
    M: PhysMapper + ?Sized,
{
    let (i4, i3, i2, i1) = split_indices(va);
    let pml4: &mut PageTable = unsafe { phys.phys_to_mut(root) };
    let l4 = pml4[i4];
    if !l4.present() {
        return Slot::Missing;
    }
    let pdpt: &mut PageTable = unsafe { phys.phys_to_mut(l4.address()) };
    let l3 = pdpt[i3];
    if !l3.present() || l3.large() {
        return Slot::Missing;
    }
    let pd: &mut PageTable = unsafe { phys.phys_to_mut(l3.address()) };
    if pd[i2].large() {
        return Slot::Entry2M(&mut pd[i2]);
    }
    let l2 = pd[i2];
    if !l2.present() {
        return Slot::Missing;
    }
    let pt: &mut PageTable = unsafe { phys.phys_to_mut(l2.address()) };
    Slot::Entry4K(&mut pt[i1])
}

fn apply_update(slot: &mut PageEntry, update: AttributeUpdate) -> Result<(), VmemError> {
    let next = update.apply(slot.attributes());
    if next.large() != slot.large() {
        return Err(VmemError::InvalidParameter);
    }
    *slot = PageEntry::leaf(slot.address(), next)
        .with_accessed(slot.accessed())
        .with_dirty(slot.dirty());
    Ok(())
}
