use crate::qemu_trace;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// A [`log::Log`] sink writing `[LEVEL] target: message` lines to the QEMU
/// debug port.
///
/// Either install it as the global logger from a static, or embed it in a
/// composite logger and forward records to [`Log::log`].
///
/// ```rust,no_run
/// use kernel_qemu::QemuLogger;
/// use log::LevelFilter;
///
/// static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
///
/// fn early_init() {
///     LOGGER.init().expect("no logger installed yet");
///     log::info!("debug port online");
/// }
/// ```
pub struct QemuLogger {
    max_level: LevelFilter,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Installs this instance as the global logger.
    ///
    /// # Errors
    /// Fails if a global logger is already installed.
    pub fn init(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        // Filtering happens in `enabled`, not in the facade.
        log::set_max_level(LevelFilter::Trace);
        Ok(())
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        qemu_trace!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        // no-op for qemu debug port
    }
}
