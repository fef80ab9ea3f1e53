use log::warn;

/// The selected boot entry: where the system lives and what to load.
///
/// Boot configuration is optional; an absent or empty configuration selects
/// these defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    /// Directory on the boot volume holding the OS installation.
    pub system_root: &'static str,
    /// Kernel binary path relative to the system root.
    pub kernel_path: &'static str,
    /// Driver directory relative to the system root.
    pub drivers_directory: &'static str,
    /// Attach the kernel debugger during boot.
    pub debug: bool,
}

impl Default for BootEntry {
    fn default() -> Self {
        Self {
            system_root: "ferrite",
            kernel_path: "system/kernel",
            drivers_directory: "drivers",
            debug: false,
        }
    }
}

/// Iterates the driver names in a boot-driver list file.
///
/// The file is newline-delimited. Tolerated irregularities: CR+LF line
/// endings, blank lines, missing final newline, and trailing NUL bytes
/// (editors and file-size rounding produce all of these). Lines that are
/// not UTF-8 are skipped with a warning.
///
/// ```rust
/// let data = b"acpi\r\n\nehci\n\0";
/// let names: Vec<&str> = kernel_boot::driver_names(data).collect();
/// assert_eq!(names, ["acpi", "ehci"]);
/// ```
pub fn driver_names(data: &[u8]) -> impl Iterator<Item = &str> {
    data.split(|&byte| byte == b'\n').filter_map(|line| {
        let line = trim_line(line);
        if line.is_empty() {
            return None;
        }
        match core::str::from_utf8(line) {
            Ok(name) => Some(name),
            Err(_) => {
                warn!("skipping non-UTF-8 driver list line");
                None
            }
        }
    })
}

/// Strips trailing CR and NUL bytes from one line.
fn trim_line(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., last] = line {
        if *last == b'\r' || *last == b'\0' {
            line = rest;
        } else {
            break;
        }
    }
    line
}
