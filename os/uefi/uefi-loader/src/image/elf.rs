//! # ELF64 Placement Backend
//!
//! Just enough ELF to place statically linked boot images: header checks,
//! `PT_LOAD` collection, extent computation, copy, protection. Boot images
//! are linked for the kernel window and loaded bind-now, so there is no
//! relocation or symbol work here; an image that lands away from its
//! linked base carries the difference in its entry point.

use super::{
    FileBuffer, ImageAllocation, ImageError, ImageFormat, ImageHost, LoadFlags, SegmentProtection,
};
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_boot::LoadedImage;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_down, align_up};

const EI_MAGIC_BYTES: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const EI_CLASS_64: u8 = 2;
const EI_DATA_LITTLE_ENDIAN: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

/// Program header `p_flags`.
#[bitfield(u32, order = Lsb)]
struct PFlags {
    execute: bool,
    write: bool,
    read: bool,

    #[bits(29)]
    __: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: PFlags,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

struct LoadSegment {
    vaddr: u64,
    offset: u64,
    file_size: u64,
    memory_size: u64,
    flags: PFlags,
}

struct ParsedImage {
    entry: u64,
    segments: Vec<LoadSegment>,
    wants_interpreter: bool,
}

fn parse(bytes: &[u8]) -> Result<ParsedImage, ImageError> {
    if bytes.len() < size_of::<Elf64Ehdr>() {
        return Err(ImageError::BadFormat);
    }
    // SAFETY: length checked; the unaligned read copes with any buffer.
    let ehdr = unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<Elf64Ehdr>()) };

    if ehdr.e_ident[..4] != EI_MAGIC_BYTES
        || ehdr.e_ident[4] != EI_CLASS_64
        || ehdr.e_ident[5] != EI_DATA_LITTLE_ENDIAN
        || ehdr.e_ident[6] != EV_CURRENT
    {
        return Err(ImageError::BadFormat);
    }
    if ehdr.e_machine != EM_X86_64 || (ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN) {
        return Err(ImageError::BadFormat);
    }
    if usize::from(ehdr.e_phentsize) != size_of::<Elf64Phdr>() || ehdr.e_phnum == 0 {
        return Err(ImageError::BadFormat);
    }

    let phoff = usize::try_from(ehdr.e_phoff).map_err(|_| ImageError::BadFormat)?;
    let count = usize::from(ehdr.e_phnum);
    let table_len = count
        .checked_mul(size_of::<Elf64Phdr>())
        .ok_or(ImageError::BadFormat)?;
    let table_end = phoff.checked_add(table_len).ok_or(ImageError::BadFormat)?;
    if table_end > bytes.len() {
        return Err(ImageError::BadFormat);
    }

    let mut segments = Vec::with_capacity(count);
    let mut wants_interpreter = false;
    for index in 0..count {
        let at = phoff + index * size_of::<Elf64Phdr>();
        // SAFETY: `at` stays below the checked table end.
        let phdr = unsafe { core::ptr::read_unaligned(bytes.as_ptr().add(at).cast::<Elf64Phdr>()) };
        match phdr.p_type {
            PT_LOAD if phdr.p_memsz > 0 => {
                if phdr.p_filesz > phdr.p_memsz {
                    return Err(ImageError::BadFormat);
                }
                segments.push(LoadSegment {
                    vaddr: phdr.p_vaddr,
                    offset: phdr.p_offset,
                    file_size: phdr.p_filesz,
                    memory_size: phdr.p_memsz,
                    flags: phdr.p_flags,
                });
            }
            PT_INTERP => wants_interpreter = true,
            _ => {}
        }
    }
    if segments.is_empty() {
        return Err(ImageError::BadFormat);
    }
    Ok(ParsedImage {
        entry: ehdr.e_entry,
        segments,
        wants_interpreter,
    })
}

fn segment_data<'a>(bytes: &'a [u8], segment: &LoadSegment) -> Result<&'a [u8], ImageError> {
    let start = usize::try_from(segment.offset).map_err(|_| ImageError::BadFormat)?;
    let len = usize::try_from(segment.file_size).map_err(|_| ImageError::BadFormat)?;
    let end = start.checked_add(len).ok_or(ImageError::BadFormat)?;
    bytes.get(start..end).ok_or(ImageError::BadFormat)
}

fn unwind<H: ImageHost>(
    host: &mut H,
    allocation: &ImageAllocation,
    placed: &[LoadSegment],
    link_base: u64,
) {
    for segment in placed {
        host.unmap_image_segment(allocation, segment.vaddr - link_base, segment.memory_size);
    }
}

fn place<H: ImageHost>(
    host: &mut H,
    name: &str,
    flags: LoadFlags,
    buffer: &FileBuffer,
) -> Result<LoadedImage, ImageError> {
    let image = parse(buffer.bytes())?;
    if image.wants_interpreter && !flags.ignore_interpreter() {
        // Boot images are fully bound; a required interpreter cannot run
        // this early.
        return Err(ImageError::BadFormat);
    }

    let mut link_base = u64::MAX;
    let mut link_end = 0u64;
    for segment in &image.segments {
        let end = segment
            .vaddr
            .checked_add(segment.memory_size)
            .ok_or(ImageError::BadFormat)?;
        link_base = link_base.min(align_down(segment.vaddr, PAGE_SIZE));
        link_end = link_end.max(end);
    }
    let link_end = align_up(link_end, PAGE_SIZE);
    if link_end <= link_base {
        return Err(ImageError::BadFormat);
    }
    let size = link_end - link_base;

    let allocation = host.allocate_address_space(link_base, size)?;
    let base_difference = allocation.virtual_base.as_u64().wrapping_sub(link_base);

    let bytes = buffer.bytes();
    let mut protections = Vec::with_capacity(image.segments.len());
    for (index, segment) in image.segments.iter().enumerate() {
        let offset = segment.vaddr - link_base;
        let copied = segment_data(bytes, segment).and_then(|data| {
            host.map_image_segment(&allocation, offset, data, segment.memory_size)
        });
        if let Err(err) = copied {
            unwind(host, &allocation, &image.segments[..index], link_base);
            host.free_address_space(allocation);
            return Err(err);
        }
        if segment.flags.execute() {
            host.invalidate_instruction_cache(
                VirtualAddress::new(allocation.virtual_base.as_u64() + offset),
                segment.memory_size,
            );
        }
        protections.push(SegmentProtection {
            offset,
            size: segment.memory_size,
            writable: segment.flags.write(),
        });
    }

    if let Err(err) = host.finalize_segments(&allocation, &protections) {
        unwind(host, &allocation, &image.segments, link_base);
        host.free_address_space(allocation);
        return Err(err);
    }

    let record = LoadedImage::new(
        name,
        allocation.virtual_base.as_u64(),
        size,
        image.entry.wrapping_add(base_difference),
        crate::cycle_timestamp(),
    );
    host.notify_image_load(&record);
    Ok(record)
}

/// Minimal ELF64 backend for statically linked kernel-window images.
pub struct ElfFormat;

impl ImageFormat for ElfFormat {
    fn load<H: ImageHost>(
        &self,
        host: &mut H,
        name: &str,
        flags: LoadFlags,
    ) -> Result<LoadedImage, ImageError> {
        let mut file = host.open_file(name)?;
        let buffer = match host.load_file(&mut file) {
            Ok(buffer) => buffer,
            Err(err) => {
                host.close_file(file);
                return Err(err);
            }
        };
        let result = place(host, name, flags, &buffer);
        host.unload_buffer(buffer);
        host.close_file(file);
        result
    }
}
