//! # QEMU Debug-Port Output
//!
//! Best-effort diagnostic output through QEMU's debug console, I/O port
//! `0x402`. The port works from the first loader instruction to the final
//! jump into the kernel, which makes it the only channel that survives
//! exit-boot-services: the firmware console goes away, the debug port does
//! not.
//!
//! Two layers are provided:
//!
//! * [`qemu_trace!`] — direct formatted writes, no allocation, usable before
//!   any logger exists.
//! * [`QemuLogger`] — a [`log::Log`] implementation over the same sink, used
//!   standalone or composed into a richer logger that also mirrors to the
//!   firmware console.
//!
//! Capture on the host with `qemu-system-x86_64 -debugcon stdio` (or
//! `-debugcon file:debug.log`). On real hardware writes to the port are
//! harmless no-ops on common chipsets.
//!
//! Disabling the `enabled` feature compiles everything down to nothing for
//! builds that must not touch I/O ports.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// The port number for QEMU's debug port.
    const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Write a single byte to QEMU's debug port.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        unsafe { kernel_registers::port::outb(QEMU_DEBUG_PORT, c) }
    }

    /// `core::fmt::Write` over the debug port, byte by byte.
    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                dbg_putc(b);
            }
            Ok(())
        }

        #[inline]
        fn write_char(&mut self, c: char) -> fmt::Result {
            // UTF-8 encode without allocation.
            let mut buf = [0u8; 4];
            let s = c.encode_utf8(&mut buf);
            self.write_str(s)
        }
    }

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn qemu_write(args: fmt::Arguments) {
        // Ignore errors; this is best-effort debug output.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn qemu_write(_: fmt::Arguments) {
        // no-op when feature disabled
    }
}

#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        // No allocation: `format_args!` builds a lightweight `Arguments`.
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
