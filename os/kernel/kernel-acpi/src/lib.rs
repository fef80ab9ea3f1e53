//! # ACPI Platform Driver
//!
//! Namespace-driven device enumeration and fixed-hardware platform
//! services on top of the firmware tables: device start-up and resource
//! assignment, resource template parsing, PCI interrupt routing,
//! processor idle states, ACPI hardware mode, the firmware global lock,
//! and system sleep state preparation.
//!
//! ## Architecture
//!
//! The driver sits between three parties:
//!
//! ```text
//! AML interpreter ──── namespace::Namespace ────┐
//!                                               │
//! kernel services ──── SystemOps ────── platform::Platform
//!                                               │
//! firmware tables ──── kernel-acpi-tables ──────┘
//! ```
//!
//! * [`namespace::Namespace`] gives read access to the AML namespace the
//!   interpreter owns: objects, children, and method evaluation. The
//!   driver never interprets AML itself.
//! * [`SystemOps`] is the small set of kernel services the driver needs:
//!   port I/O, uncached physical mappings, time, delays, and processor
//!   control.
//! * The firmware tables (FADT, FACS, MADT) arrive pre-validated from
//!   [`kernel_acpi_tables`].
//!
//! ## Locking
//!
//! Spin locks guard the device store, the routing tables, and the
//! processor table. Method evaluation can allocate and take arbitrarily
//! long, so none of them is ever held across
//! [`namespace::Namespace::evaluate`]; cached state is re-checked after
//! the lock is re-acquired. The one exception is the PCI lock, which
//! stays held across a bus's `_PRT` evaluation to fence early
//! config-space access until the routing table is installed.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod cstates;
pub mod device;
pub mod fixedreg;
pub mod global_lock;
pub mod mode;
pub mod namespace;
pub mod platform;
pub mod requirements;
pub mod resdesc;
pub mod routing;
pub mod sleep;

#[cfg(test)]
pub(crate) mod testing;

use core::ptr::NonNull;

use kernel_acpi_tables::TableError;
use thiserror::Error;

use crate::cstates::IdleState;

/// Errors raised by the platform driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcpiError {
    /// The platform has not been brought up far enough for the request.
    #[error("platform driver not initialized")]
    NotInitialized,
    /// The hardware or firmware does not implement the requested feature.
    #[error("not supported by this platform")]
    NotSupported,
    /// A required provider has not started; retry after it does.
    #[error("resource provider not ready")]
    NotReady,
    /// The provider had already started when a dependency was requested.
    #[error("dependency requested after the provider started")]
    TooLate,
    /// A mapping or allocation could not be satisfied.
    #[error("insufficient resources")]
    InsufficientResources,
    /// Memory allocation failed.
    #[error("out of memory")]
    NoMemory,
    /// An argument is out of range for the operation.
    #[error("invalid parameter")]
    InvalidParameter,
    /// A firmware-provided byte stream does not parse.
    #[error("malformed data stream")]
    MalformedDataStream,
    /// An evaluated object has a type the caller cannot use.
    #[error("unexpected object type")]
    UnexpectedType,
    /// Firmware describes a configuration the driver cannot honor.
    #[error("invalid configuration")]
    InvalidConfiguration,
    /// An allocation cannot be expressed in the descriptor it must fill.
    #[error("resource conversion failed")]
    ConversionFailed,
    /// No device qualifies for the request.
    #[error("no eligible devices")]
    NoEligibleDevices,
    /// The namespace object required for the request does not exist.
    #[error("device not connected")]
    DeviceNotConnected,
    /// The referenced device is not known to the driver.
    #[error("no such device")]
    NoSuchDevice,
    /// A named object or table entry was not found.
    #[error("not found")]
    NotFound,
    /// A hardware handshake did not complete in time.
    #[error("timed out")]
    Timeout,
    /// A firmware table failed validation.
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Kernel services the driver calls out to.
///
/// One implementation backs the whole platform and is shared across
/// processors.
pub trait SystemOps: Sync {
    /// Current value of the monotonic time counter.
    fn time_ticks(&self) -> u64;

    /// Frequency of the time counter in ticks per second.
    fn ticks_per_second(&self) -> u64;

    /// Blocks the calling processor for at least the given time.
    fn delay_ms(&self, milliseconds: u64);

    /// Runs `work` on the boot processor before returning.
    fn run_on_boot_processor(&self, work: &mut dyn FnMut());

    /// Halts the system with a diagnostic; does not return.
    fn fatal(&self, message: &'static str, detail: u64) -> !;

    /// Reads from an I/O port with the given access width in bytes.
    fn io_read(&self, port: u16, width: usize) -> u32;

    /// Writes to an I/O port with the given access width in bytes.
    fn io_write(&self, port: u16, width: usize, value: u32);

    /// Maps physical memory uncached and returns its virtual address.
    /// Mappings are permanent; nothing ever unmaps them.
    fn map_physical(&self, address: u64, length: usize) -> Option<NonNull<u8>>;

    /// Hands the discovered processor idle states to the scheduler.
    fn register_idle_states(&self, states: &[IdleState]);
}
