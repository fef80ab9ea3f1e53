use kernel_qemu::qemu_trace;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Boot-time logger feeding two sinks: the QEMU debug port (always) and the
/// firmware console (until boot services end).
pub struct BootLogger {
    max_level: LevelFilter,
    boot_services_available: bool,
}

impl BootLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self {
            max_level,
            boot_services_available: true,
        }
    }

    /// Installs the logger. Call once during early init.
    #[allow(
        static_mut_refs,
        clippy::missing_errors_doc,
        clippy::missing_panics_doc
    )]
    pub fn init(self) -> Result<&'static mut Self, SetLoggerError> {
        // log::set_logger wants a &'static dyn Log; park the instance in a
        // static and hand out references to it.
        static mut LOGGER: Option<BootLogger> = None;

        unsafe {
            LOGGER = Some(self);
            log::set_logger(LOGGER.as_ref().unwrap() as &'static dyn Log)?;
        }
        log::set_max_level(LevelFilter::Trace);
        unsafe { Ok(LOGGER.as_mut().expect("initialized")) }
    }

    /// Stops mirroring to the firmware console. After exit-boot-services
    /// the debug port is the only channel left.
    pub const fn exit_boot_services(&mut self) {
        self.boot_services_available = false;
    }

    /// Whether the firmware console still accepts output.
    #[must_use]
    pub const fn console_available(&self) -> bool {
        self.boot_services_available
    }
}

impl Log for BootLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // "[LEVEL] target: message" on both sinks; the QEMU path must not
        // allocate because it also runs after exit-boot-services.
        qemu_trace!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );

        if self.boot_services_available {
            uefi::println!(
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}
