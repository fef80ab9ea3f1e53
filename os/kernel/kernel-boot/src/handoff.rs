/// Kernel entry function pointer.
///
/// # ABI
///
/// Pinned to `win64` because the loader is a UEFI (PE/COFF) application;
/// the kernel entry stub must expect the same convention regardless of what
/// the rest of the kernel uses.
pub type KernelEntryFn = extern "win64" fn(*const InitBlock) -> !;

/// Layout version carried in [`InitBlock::version`].
pub const INIT_BLOCK_VERSION: u32 = 1;

/// Bytes reserved for a loaded-image name, including NUL padding.
pub const IMAGE_NAME_CAPACITY: usize = 32;

/// A kernel-virtual buffer the loader allocated for the kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    /// Kernel virtual base address; 0 when absent.
    pub base: u64,
    /// Length in bytes.
    pub size: u64,
}

impl BufferRegion {
    /// An absent buffer.
    pub const EMPTY: Self = Self { base: 0, size: 0 };

    /// Whether the region describes no memory.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.base == 0 || self.size == 0
    }
}

/// A kernel-virtual array of `kernel_mdl::MemoryDescriptor` records.
///
/// Both memory maps cross the hand-off in this serialized form; the kernel
/// rebuilds its lists from the arrays.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    /// Kernel virtual address of the first record; 0 when absent.
    pub base: u64,
    /// Number of records.
    pub count: u64,
}

impl DescriptorTable {
    /// An absent table.
    pub const EMPTY: Self = Self { base: 0, count: 0 };
}

/// Wall-clock calendar time captured just before exit-boot-services.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    _reserved: u8,
    pub nanosecond: u32,
}

impl BootTime {
    /// The unset time (all zeros; year 0 never occurs in real firmware).
    pub const UNSET: Self = Self {
        year: 0,
        month: 0,
        day: 0,
        hour: 0,
        minute: 0,
        second: 0,
        _reserved: 0,
        nanosecond: 0,
    };

    /// Builds a timestamp from calendar fields.
    #[inline]
    #[must_use]
    pub const fn new(
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        nanosecond: u32,
    ) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
            _reserved: 0,
            nanosecond,
        }
    }
}

/// One record in the loaded-image list: kernel, loader, and every boot
/// driver. Published on the debug transport at load time and handed to the
/// kernel so stack traces can name modules.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    /// UTF-8 image name, NUL padded.
    pub name: [u8; IMAGE_NAME_CAPACITY],
    /// Lowest mapped kernel virtual address.
    pub base: u64,
    /// Mapped size in bytes.
    pub size: u64,
    /// Entry point kernel virtual address; 0 for none.
    pub entry_point: u64,
    /// Cycle-counter timestamp taken when the image finished loading.
    pub loaded_at: u64,
}

impl LoadedImage {
    /// Builds a record, truncating the name to the field capacity on a
    /// character boundary.
    #[must_use]
    pub fn new(name: &str, base: u64, size: u64, entry_point: u64, loaded_at: u64) -> Self {
        let mut stored = [0_u8; IMAGE_NAME_CAPACITY];
        let mut len = name.len().min(IMAGE_NAME_CAPACITY);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        stored[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self {
            name: stored,
            base,
            size,
            entry_point,
            loaded_at,
        }
    }

    /// The stored name without NUL padding.
    #[must_use]
    pub fn name(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(IMAGE_NAME_CAPACITY);
        core::str::from_utf8(&self.name[..end]).unwrap_or_default()
    }
}

/// Everything the kernel needs from the loader, laid out for the ABI
/// boundary: `#[repr(C)]`, fixed-size integers, addresses as `u64`.
///
/// The loader allocates this in kernel-visible memory, fills it in as the
/// boot steps complete, and passes its address to the kernel entry point.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct InitBlock {
    /// Layout version, [`INIT_BLOCK_VERSION`].
    pub version: u32,
    /// `size_of` this structure as the producer compiled it.
    pub size: u32,

    /// Physical memory map.
    pub physical_map: DescriptorTable,
    /// Kernel virtual address range map.
    pub virtual_map: DescriptorTable,

    /// Kernel virtual address of the root page table.
    pub page_directory: u64,
    /// Physical address of the root page table (the CR3 value).
    pub page_directory_physical: u64,
    /// Base of the self-map window.
    pub self_map_base: u64,
    /// Virtual page whose leaf table is pre-wired for mapping new tables.
    pub page_table_stage: u64,

    /// Kernel virtual address of the firmware table directory block.
    pub firmware_tables: u64,

    /// The kernel stack mapping; the entry trampoline switches to its top.
    pub kernel_stack: BufferRegion,
    /// Memory-manager bootstrap reservation (`mm_bootstrap_size` bytes).
    pub mm_init_memory: BufferRegion,

    /// Raw `bootdrv.set` contents.
    pub boot_driver_file: BufferRegion,
    /// Raw `dev2drv.set` contents.
    pub device_to_driver_file: BufferRegion,
    /// Raw `devmap.set` contents.
    pub device_map_file: BufferRegion,

    /// Kernel virtual address of the [`LoadedImage`] array.
    pub image_list: u64,
    /// Number of records in the image list.
    pub image_count: u32,
    /// Index of the kernel image in the list.
    pub kernel_image_index: u32,
    /// Index of the loader's own (identity-mapped) record.
    pub loader_image_index: u32,
    _reserved: u32,

    /// Measured cycle-counter ticks per second.
    pub cycle_counter_frequency: u64,
    /// Wall-clock time captured before exit-boot-services.
    pub boot_time: BootTime,
}

impl InitBlock {
    /// An empty block with only `version` and `size` filled in.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new() -> Self {
        Self {
            version: INIT_BLOCK_VERSION,
            size: size_of::<Self>() as u32,
            physical_map: DescriptorTable::EMPTY,
            virtual_map: DescriptorTable::EMPTY,
            page_directory: 0,
            page_directory_physical: 0,
            self_map_base: 0,
            page_table_stage: 0,
            firmware_tables: 0,
            kernel_stack: BufferRegion::EMPTY,
            mm_init_memory: BufferRegion::EMPTY,
            boot_driver_file: BufferRegion::EMPTY,
            device_to_driver_file: BufferRegion::EMPTY,
            device_map_file: BufferRegion::EMPTY,
            image_list: 0,
            image_count: 0,
            kernel_image_index: 0,
            loader_image_index: 0,
            _reserved: 0,
            cycle_counter_frequency: 0,
            boot_time: BootTime::UNSET,
        }
    }
}

impl Default for InitBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_block_self_describes_its_layout() {
        let block = InitBlock::new();
        assert_eq!(block.version, INIT_BLOCK_VERSION);
        assert_eq!(block.size as usize, size_of::<InitBlock>());
        assert!(block.kernel_stack.is_empty());
    }

    #[test]
    fn image_names_round_trip() {
        let image = LoadedImage::new("acpi", 0xFFFF_8000_0010_0000, 0x8000, 0, 42);
        assert_eq!(image.name(), "acpi");
        assert_eq!(image.loaded_at, 42);
    }

    #[test]
    fn long_names_truncate_on_a_character_boundary() {
        // 31 ASCII bytes, then a two-byte ü straddling the capacity cut.
        let long = "driver-with-a-very-long-name-xxü-and-more";
        let image = LoadedImage::new(long, 0, 0, 0, 0);
        assert_eq!(image.name().len(), IMAGE_NAME_CAPACITY - 1);
        assert!(long.starts_with(image.name()));
    }

    #[test]
    fn buffer_region_emptiness() {
        assert!(BufferRegion::EMPTY.is_empty());
        assert!(!BufferRegion { base: 0x1000, size: 1 }.is_empty());
    }
}
