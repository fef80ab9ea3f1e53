//! # Boot Volume Access
//!
//! Directory handles over the volume the loader image came from. Paths are
//! slash-separated and resolved component by component, because the kernel,
//! drivers, and configuration files all live in nested directories under
//! one system root.

use alloc::vec;
use alloc::vec::Vec;
use kernel_boot::BootEntry;
use log::info;
use thiserror::Error;
use uefi::boot::{self, ScopedProtocol};
use uefi::proto::media::file::{
    Directory, File, FileAttribute, FileMode, FileType, RegularFile,
};
use uefi::proto::media::fs::SimpleFileSystem;
use uefi::{CString16, Status};

/// Name of the configuration directory under the system root.
pub const CONFIG_DIRECTORY: &str = "config";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OpenError {
    /// No entry with the requested name exists.
    #[error("no such path")]
    NotFound,
    /// The path resolved to a directory where a file was required, or the
    /// other way around.
    #[error("path names a directory")]
    IsDirectory,
    /// A path component cannot be expressed to the firmware.
    #[error("invalid path encoding")]
    BadPath,
    /// Anything else the firmware reported.
    #[error("firmware I/O failed with {0:?}")]
    Io(Status),
}

impl From<uefi::Error> for OpenError {
    fn from(err: uefi::Error) -> Self {
        match err.status() {
            Status::NOT_FOUND => Self::NotFound,
            status => Self::Io(status),
        }
    }
}

/// An opened regular file and its size in bytes.
pub struct OpenFile {
    pub file: RegularFile,
    pub size: u64,
}

/// The volume the loader was started from, with the directories the boot
/// sequence works out of.
pub struct BootVolume {
    // Keeps the file-system protocol alive for as long as any directory
    // handle below is in use.
    _filesystem: ScopedProtocol<SimpleFileSystem>,
    system: Directory,
    config: Option<Directory>,
    drivers: Option<Directory>,
}

impl BootVolume {
    /// Opens the volume and the system root directory named by `entry`.
    ///
    /// # Errors
    /// [`OpenError::NotFound`] when the system root does not exist, or the
    /// firmware error that stopped the volume from opening.
    pub fn open(entry: &BootEntry) -> Result<Self, OpenError> {
        let image_handle = boot::image_handle();
        let mut filesystem = boot::get_image_file_system(image_handle)?;
        let mut root = filesystem.open_volume()?;
        let system = open_directory_path(&mut root, entry.system_root)?;
        info!("boot volume open, system root '{}'", entry.system_root);
        Ok(Self {
            _filesystem: filesystem,
            system,
            config: None,
            drivers: None,
        })
    }

    /// Opens the configuration directory under the system root.
    ///
    /// # Errors
    /// [`OpenError::NotFound`] when the directory is missing.
    pub fn open_config_directory(&mut self) -> Result<(), OpenError> {
        let config = open_directory_path(&mut self.system, CONFIG_DIRECTORY)?;
        info!("configuration directory '{CONFIG_DIRECTORY}' open");
        self.config = Some(config);
        Ok(())
    }

    /// Opens the drivers directory under the system root.
    ///
    /// # Errors
    /// [`OpenError::NotFound`] when the directory is missing.
    pub fn open_drivers_directory(&mut self, name: &str) -> Result<(), OpenError> {
        let drivers = open_directory_path(&mut self.system, name)?;
        info!("drivers directory '{name}' open");
        self.drivers = Some(drivers);
        Ok(())
    }

    /// Loads a file from the configuration directory.
    ///
    /// # Errors
    /// [`OpenError::NotFound`] for a missing file and the I/O errors of the
    /// read itself.
    pub fn load_config_file(&mut self, name: &str) -> Result<Vec<u8>, OpenError> {
        let config = self.config.as_mut().ok_or(OpenError::NotFound)?;
        let mut open = open_file_path(config, name)?;
        read_whole_file(&mut open)
    }

    /// Opens an image by name: system directory first, then the drivers
    /// directory.
    ///
    /// A name that hits a directory is reported as such instead of falling
    /// through to the next search location.
    ///
    /// # Errors
    /// [`OpenError::NotFound`] when neither directory has the file.
    pub fn open_image_file(&mut self, name: &str) -> Result<OpenFile, OpenError> {
        match open_file_path(&mut self.system, name) {
            Err(OpenError::NotFound) => {}
            other => return other,
        }
        let drivers = self.drivers.as_mut().ok_or(OpenError::NotFound)?;
        open_file_path(drivers, name)
    }

    /// Drops every directory handle and the file-system protocol.
    pub fn close(self) {
        info!("boot volume closed");
        drop(self);
    }
}

fn to_cstr16(component: &str) -> Result<CString16, OpenError> {
    CString16::try_from(component).map_err(|_| OpenError::BadPath)
}

/// Walks `path` (slash-separated) below `dir`, requiring every component to
/// be a directory.
fn open_directory_path(dir: &mut Directory, path: &str) -> Result<Directory, OpenError> {
    let mut components = path.split('/').filter(|c| !c.is_empty());
    let first = components.next().ok_or(OpenError::NotFound)?;
    let mut current = open_subdirectory(dir, first)?;
    for component in components {
        current = open_subdirectory(&mut current, component)?;
    }
    Ok(current)
}

fn open_subdirectory(dir: &mut Directory, component: &str) -> Result<Directory, OpenError> {
    let name = to_cstr16(component)?;
    let handle = dir.open(&name, FileMode::Read, FileAttribute::empty())?;
    match handle.into_type()? {
        FileType::Dir(next) => Ok(next),
        // A file where a directory was expected is the same shape of error
        // as the reverse.
        FileType::Regular(_) => Err(OpenError::IsDirectory),
    }
}

/// Walks `path` below `dir`; the final component must be a regular file.
pub fn open_file_path(dir: &mut Directory, path: &str) -> Result<OpenFile, OpenError> {
    let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
    let first = components.next().ok_or(OpenError::NotFound)?;
    if components.peek().is_none() {
        return open_regular(dir, first);
    }
    let mut current = open_subdirectory(dir, first)?;
    loop {
        let component = components.next().ok_or(OpenError::NotFound)?;
        if components.peek().is_none() {
            return open_regular(&mut current, component);
        }
        current = open_subdirectory(&mut current, component)?;
    }
}

fn open_regular(dir: &mut Directory, component: &str) -> Result<OpenFile, OpenError> {
    let name = to_cstr16(component)?;
    let handle = dir.open(&name, FileMode::Read, FileAttribute::empty())?;
    let mut file = match handle.into_type()? {
        FileType::Regular(file) => file,
        FileType::Dir(_) => return Err(OpenError::IsDirectory),
    };
    let size = file_size(&mut file)?;
    Ok(OpenFile { file, size })
}

/// File length via the end-of-file seek, leaving the position at zero.
fn file_size(file: &mut RegularFile) -> Result<u64, OpenError> {
    file.set_position(RegularFile::END_OF_FILE)?;
    let size = file.get_position()?;
    file.set_position(0)?;
    Ok(size)
}

/// Reads `out.len()` bytes at `offset`.
///
/// # Errors
/// [`OpenError::Io`] with `END_OF_FILE` when the file is shorter than the
/// requested window.
pub fn read_at(file: &mut RegularFile, offset: u64, out: &mut [u8]) -> Result<(), OpenError> {
    file.set_position(offset)?;
    let read = file.read(out).map_err(|err| OpenError::Io(err.status()))?;
    if read != out.len() {
        return Err(OpenError::Io(Status::END_OF_FILE));
    }
    Ok(())
}

/// Reads a whole opened file into memory.
///
/// # Errors
/// [`OpenError::Io`] when the read comes up short.
pub fn read_whole_file(open: &mut OpenFile) -> Result<Vec<u8>, OpenError> {
    let size = usize::try_from(open.size).map_err(|_| OpenError::BadPath)?;
    let mut buf = vec![0_u8; size];
    open.file.set_position(0)?;
    let read = open
        .file
        .read(&mut buf)
        .map_err(|err| OpenError::Io(err.status()))?;
    if read != size {
        return Err(OpenError::Io(Status::END_OF_FILE));
    }
    Ok(buf)
}
