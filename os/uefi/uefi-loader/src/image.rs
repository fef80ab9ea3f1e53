//! # Boot Image Loading
//!
//! Places the kernel and the boot drivers into the kernel half of the new
//! address space.
//!
//! The format backend ([`ElfFormat`]) only understands bytes: headers,
//! segments, protections. Everything environmental — files, scratch memory,
//! physical pages, mappings, the debug transport — reaches it through the
//! [`ImageHost`] trait, so the placement logic stays free of firmware
//! details and testable against fakes.
//!
//! Loaded images accumulate in an [`ImageSystem`] as hand-off records; the
//! array ends up behind `InitBlock::image_list`.

mod elf;

pub use elf::ElfFormat;

use crate::file_system::{self, BootVolume, OpenError, OpenFile};
use crate::memory::{IdentityMapper, LoaderMemory, identity_slice_mut};
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use core::ptr::NonNull;
use kernel_boot::{BootEntry, LoadedImage};
use kernel_mdl::MemoryType;
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up, pages_for,
};
use kernel_qemu::qemu_trace;
use kernel_vmem::{
    AddressSpace, AttributeUpdate, KERNEL_VA_END, KERNEL_VA_START, MapAttributes, VmemError,
};
use log::{info, warn};
use thiserror::Error;
use uefi::Status;
use uefi::boot::{self, MemoryType as EfiMemoryType};

/// Image loading failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ImageError {
    /// No file of that name on the boot volume.
    #[error("image file not found")]
    PathNotFound,

    /// The name resolved to a directory.
    #[error("image path names a directory")]
    FileIsDirectory,

    /// A firmware call failed underneath.
    #[error("firmware I/O failed with {0:?}")]
    Io(Status),

    /// The file is not an image this loader can place.
    #[error("not a loadable image")]
    BadFormat,

    /// A segment reaches outside the image's allocation.
    #[error("image segment out of range")]
    SegmentOutOfRange,

    /// The address space rejected a mapping.
    #[error(transparent)]
    Memory(#[from] VmemError),
}

impl From<OpenError> for ImageError {
    fn from(err: OpenError) -> Self {
        match err {
            OpenError::NotFound => Self::PathNotFound,
            OpenError::IsDirectory => Self::FileIsDirectory,
            OpenError::BadPath => Self::Io(Status::INVALID_PARAMETER),
            OpenError::Io(status) => Self::Io(status),
        }
    }
}

/// How an image takes part in linking and startup.
#[bitfield(u32, order = Lsb)]
#[derive(PartialEq, Eq)]
pub struct LoadFlags {
    /// Ignore any interpreter the image asks for.
    pub ignore_interpreter: bool,
    /// The image is the primary executable of the address space.
    pub primary_executable: bool,
    /// Do not run static constructors on load.
    pub no_static_constructors: bool,
    /// Resolve all references at load time.
    pub bind_now: bool,
    /// The image's exports are visible to everything loaded after it.
    pub global: bool,

    #[bits(27, default = 0)]
    _reserved: u32,
}

impl LoadFlags {
    /// The baseline every boot image is loaded with: fully bound up front,
    /// no interpreter, no constructors until the kernel runs them.
    #[must_use]
    pub const fn boot_image() -> Self {
        Self::new()
            .with_ignore_interpreter(true)
            .with_no_static_constructors(true)
            .with_bind_now(true)
    }
}

/// A whole file read into host scratch memory.
///
/// Owned by the host; hand it back through [`ImageHost::unload_buffer`].
pub struct FileBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl FileBuffer {
    /// The file contents.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `ptr` covers `len` readable bytes for as long as the
        // buffer exists; the host frees it only on unload_buffer.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

/// One contiguous physical allocation, mapped at a kernel virtual base.
#[derive(Debug, Clone, Copy)]
pub struct ImageAllocation {
    /// Base of the backing pages.
    pub physical_base: PhysicalAddress,
    /// Kernel virtual base the image runs at.
    pub virtual_base: VirtualAddress,
    /// Requested size in bytes; the mapping covers whole pages.
    pub size: u64,
}

/// Final protection for one placed segment, relative to its allocation.
#[derive(Debug, Clone, Copy)]
pub struct SegmentProtection {
    /// Byte offset of the segment inside the allocation.
    pub offset: u64,
    /// Segment size in bytes.
    pub size: u64,
    /// Whether the segment stays writable.
    pub writable: bool,
}

/// Host services a format backend drives while placing an image.
///
/// The backend decides *what* to do with the bytes; the host owns files,
/// scratch memory, physical pages, and the address space. Failed loads
/// unwind through the matching release callbacks.
pub trait ImageHost {
    /// Handle for an open image file.
    type File;

    /// Allocates `size` bytes of scratch memory.
    ///
    /// # Errors
    /// [`ImageError::Io`] when the firmware pool is exhausted.
    fn allocate_memory(&mut self, size: usize) -> Result<NonNull<u8>, ImageError>;

    /// Returns memory from [`Self::allocate_memory`].
    fn free_memory(&mut self, buffer: NonNull<u8>);

    /// Opens an image file by name.
    ///
    /// # Errors
    /// [`ImageError::PathNotFound`] when no candidate location has the
    /// file, [`ImageError::FileIsDirectory`] when the name resolves to a
    /// directory.
    fn open_file(&mut self, name: &str) -> Result<Self::File, ImageError>;

    /// Closes a file from [`Self::open_file`].
    fn close_file(&mut self, file: Self::File);

    /// Reads the whole file into scratch memory.
    ///
    /// # Errors
    /// [`ImageError::Io`] on a firmware read failure.
    fn load_file(&mut self, file: &mut Self::File) -> Result<FileBuffer, ImageError>;

    /// Reads exactly `out.len()` bytes at `offset`.
    ///
    /// # Errors
    /// [`ImageError::Io`] on a firmware read failure or a short file.
    fn read_file(
        &mut self,
        file: &mut Self::File,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), ImageError>;

    /// Releases a buffer from [`Self::load_file`].
    fn unload_buffer(&mut self, buffer: FileBuffer);

    /// Reserves backing pages for a whole image and maps them executable
    /// in the kernel window.
    ///
    /// `preferred_base` is the image's linked base; the host honors it
    /// when it can and places the image elsewhere when it cannot. The
    /// backend reads the final position from the returned allocation.
    ///
    /// # Errors
    /// [`ImageError::Io`] when physical pages run out,
    /// [`ImageError::Memory`] when no virtual range fits.
    fn allocate_address_space(
        &mut self,
        preferred_base: u64,
        size: u64,
    ) -> Result<ImageAllocation, ImageError>;

    /// Releases an allocation after a failed load.
    fn free_address_space(&mut self, allocation: ImageAllocation);

    /// Copies `data` into the allocation at `offset` and zero-fills up to
    /// `memory_size`.
    ///
    /// # Errors
    /// [`ImageError::SegmentOutOfRange`] when the segment does not fit the
    /// allocation or `data` is longer than `memory_size`.
    fn map_image_segment(
        &mut self,
        allocation: &ImageAllocation,
        offset: u64,
        data: &[u8],
        memory_size: u64,
    ) -> Result<(), ImageError>;

    /// Scrubs a segment placed by [`Self::map_image_segment`].
    fn unmap_image_segment(&mut self, allocation: &ImageAllocation, offset: u64, memory_size: u64);

    /// Announces a finished load on the debug transport.
    fn notify_image_load(&mut self, record: &LoadedImage);

    /// Announces an image being abandoned again.
    fn notify_image_unload(&mut self, record: &LoadedImage);

    /// Makes freshly copied code visible to instruction fetch.
    fn invalidate_instruction_cache(&mut self, base: VirtualAddress, size: u64);

    /// Environment lookup for search paths.
    fn environment_variable(&self, name: &str) -> Option<&str>;

    /// Applies final protections; segments not marked writable become
    /// read-only.
    ///
    /// # Errors
    /// [`ImageError::Memory`] when an attribute change fails.
    fn finalize_segments(
        &mut self,
        allocation: &ImageAllocation,
        segments: &[SegmentProtection],
    ) -> Result<(), ImageError>;
}

/// A binary format able to place images through an [`ImageHost`].
pub trait ImageFormat {
    /// Loads `name` and returns its hand-off record.
    ///
    /// # Errors
    /// Everything [`ImageHost`] can raise, plus [`ImageError::BadFormat`]
    /// for files the backend does not recognize.
    fn load<H: ImageHost>(
        &self,
        host: &mut H,
        name: &str,
        flags: LoadFlags,
    ) -> Result<LoadedImage, ImageError>;
}

/// The loader's [`ImageHost`]: boot volume for files, firmware pool for
/// scratch, [`LoaderMemory`] for pages, the kernel [`AddressSpace`] for
/// placement.
pub struct LoaderImageHost<'a> {
    volume: &'a mut BootVolume,
    memory: &'a mut LoaderMemory,
    space: &'a mut AddressSpace,
    entry: &'a BootEntry,
}

impl ImageHost for LoaderImageHost<'_> {
    type File = OpenFile;

    fn allocate_memory(&mut self, size: usize) -> Result<NonNull<u8>, ImageError> {
        boot::allocate_pool(EfiMemoryType::LOADER_DATA, size.max(1))
            .map_err(|err| ImageError::Io(err.status()))
    }

    fn free_memory(&mut self, buffer: NonNull<u8>) {
        // SAFETY: only pointers from allocate_memory come back here.
        let _ = unsafe { boot::free_pool(buffer) };
    }

    fn open_file(&mut self, name: &str) -> Result<Self::File, ImageError> {
        self.volume.open_image_file(name).map_err(Into::into)
    }

    fn close_file(&mut self, file: Self::File) {
        drop(file);
    }

    fn load_file(&mut self, file: &mut Self::File) -> Result<FileBuffer, ImageError> {
        let len = usize::try_from(file.size).map_err(|_| ImageError::BadFormat)?;
        let ptr = self.allocate_memory(len)?;
        // SAFETY: fresh allocation of at least `len` bytes.
        let out = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), len) };
        if let Err(err) = file_system::read_at(&mut file.file, 0, out) {
            self.free_memory(ptr);
            return Err(err.into());
        }
        Ok(FileBuffer { ptr, len })
    }

    fn read_file(
        &mut self,
        file: &mut Self::File,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), ImageError> {
        file_system::read_at(&mut file.file, offset, out).map_err(Into::into)
    }

    fn unload_buffer(&mut self, buffer: FileBuffer) {
        self.free_memory(buffer.ptr);
    }

    fn allocate_address_space(
        &mut self,
        preferred_base: u64,
        size: u64,
    ) -> Result<ImageAllocation, ImageError> {
        let physical_base = self
            .memory
            .allocate_region(size, MemoryType::LoaderPermanent)
            .map_err(ImageError::Io)?;
        let attributes = MapAttributes::new().with_execute(true).with_global(true);
        let span = align_up(size, PAGE_SIZE);

        // Honor the linked base when it already lies inside the kernel
        // window; anything else gets allocator placement and a nonzero
        // base difference.
        let preferred = (preferred_base >= KERNEL_VA_START
            && preferred_base
                .checked_add(span)
                .is_some_and(|end| end <= KERNEL_VA_END))
        .then(|| VirtualAddress::new(preferred_base));

        let mut request = preferred;
        loop {
            match self.space.map_physical_address(
                &mut *self.memory,
                &IdentityMapper,
                request,
                physical_base,
                size,
                attributes,
                MemoryType::LoaderPermanent,
            ) {
                Ok(virtual_base) => {
                    return Ok(ImageAllocation {
                        physical_base,
                        virtual_base,
                        size,
                    });
                }
                Err(VmemError::MemoryConflict) if request.is_some() => {
                    // Linked base taken; retry with allocator placement.
                    request = None;
                }
                Err(err) => {
                    self.memory.free_region(physical_base, size);
                    return Err(err.into());
                }
            }
        }
    }

    fn free_address_space(&mut self, allocation: ImageAllocation) {
        let pages = pages_for(allocation.size);
        if let Err(err) =
            self.space
                .unmap_physical_address(&IdentityMapper, allocation.virtual_base, pages)
        {
            warn!(
                "abandoned image mapping at {} stuck: {err}",
                allocation.virtual_base
            );
        }
        self.memory
            .free_region(allocation.physical_base, allocation.size);
    }

    fn map_image_segment(
        &mut self,
        allocation: &ImageAllocation,
        offset: u64,
        data: &[u8],
        memory_size: u64,
    ) -> Result<(), ImageError> {
        let end = offset
            .checked_add(memory_size)
            .ok_or(ImageError::SegmentOutOfRange)?;
        let file_len = u64::try_from(data.len()).map_err(|_| ImageError::SegmentOutOfRange)?;
        if end > allocation.size || file_len > memory_size {
            return Err(ImageError::SegmentOutOfRange);
        }
        let len = usize::try_from(memory_size).map_err(|_| ImageError::SegmentOutOfRange)?;
        let base = PhysicalAddress::new(allocation.physical_base.as_u64() + offset);
        // SAFETY: bounds-checked range inside pages this host allocated.
        let target = unsafe { identity_slice_mut(base, len) };
        target[..data.len()].copy_from_slice(data);
        target[data.len()..].fill(0);
        Ok(())
    }

    fn unmap_image_segment(&mut self, allocation: &ImageAllocation, offset: u64, memory_size: u64) {
        let Some(end) = offset.checked_add(memory_size) else {
            return;
        };
        let Ok(len) = usize::try_from(memory_size) else {
            return;
        };
        if end > allocation.size {
            return;
        }
        let base = PhysicalAddress::new(allocation.physical_base.as_u64() + offset);
        // SAFETY: bounds-checked range inside pages this host allocated.
        unsafe { identity_slice_mut(base, len) }.fill(0);
    }

    fn notify_image_load(&mut self, record: &LoadedImage) {
        qemu_trace!(
            "image load: {} base={:#018x} size={:#x} entry={:#018x} at={}\n",
            record.name(),
            record.base,
            record.size,
            record.entry_point,
            record.loaded_at
        );
    }

    fn notify_image_unload(&mut self, record: &LoadedImage) {
        qemu_trace!(
            "image unload: {} base={:#018x}\n",
            record.name(),
            record.base
        );
    }

    fn invalidate_instruction_cache(&mut self, base: VirtualAddress, size: u64) {
        // Instruction fetch is coherent with stores on x86-64.
        let _ = (base, size);
    }

    fn environment_variable(&self, name: &str) -> Option<&str> {
        match name {
            "SystemRoot" => Some(self.entry.system_root),
            "DriversDirectory" => Some(self.entry.drivers_directory),
            _ => None,
        }
    }

    fn finalize_segments(
        &mut self,
        allocation: &ImageAllocation,
        segments: &[SegmentProtection],
    ) -> Result<(), ImageError> {
        let update = AttributeUpdate::new(
            MapAttributes::new().with_read_only(true),
            MapAttributes::new().with_read_only(true),
        );
        for segment in segments {
            if segment.writable || segment.size == 0 {
                continue;
            }
            let start = align_down(segment.offset, PAGE_SIZE);
            let end = align_up(segment.offset + segment.size, PAGE_SIZE);
            let va = VirtualAddress::new(allocation.virtual_base.as_u64() + start);
            self.space.change_mapping_attributes(
                &IdentityMapper,
                va,
                end - start,
                update.into_packed(),
            )?;
        }
        Ok(())
    }
}

/// Every image placed into the kernel address space, in hand-off record
/// order.
pub struct ImageSystem<F> {
    format: F,
    records: Vec<LoadedImage>,
}

impl<F: ImageFormat> ImageSystem<F> {
    #[must_use]
    pub const fn new(format: F) -> Self {
        Self {
            format,
            records: Vec::new(),
        }
    }

    /// Loads `name` from the boot volume into the kernel address space and
    /// returns its index in the record list.
    ///
    /// # Errors
    /// Propagates [`ImageError`] from the format backend and the host.
    pub fn load(
        &mut self,
        volume: &mut BootVolume,
        memory: &mut LoaderMemory,
        space: &mut AddressSpace,
        entry: &BootEntry,
        name: &str,
        flags: LoadFlags,
    ) -> Result<usize, ImageError> {
        let mut host = LoaderImageHost {
            volume,
            memory,
            space,
            entry,
        };
        let record = self.format.load(&mut host, name, flags)?;
        info!(
            "loaded image '{}' at {:#x} ({:#x} bytes, entry {:#x})",
            record.name(),
            record.base,
            record.size,
            record.entry_point
        );
        self.records.push(record);
        Ok(self.records.len() - 1)
    }

    /// Appends a record for an image placed by other means (the loader
    /// itself) and returns its index.
    pub fn push_record(&mut self, record: LoadedImage) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    /// The accumulated records.
    #[must_use]
    pub fn records(&self) -> &[LoadedImage] {
        &self.records
    }
}
