//! # ACPI Mode Transition
//!
//! Legacy firmware boots the machine in SMI mode, where power events are
//! handled behind the kernel's back. Writing the FADT's enable value to
//! the SMI command port asks the firmware to hand the fixed hardware
//! over; completion is visible as `SCI_EN` in PM1 control.

use kernel_acpi_tables::fadt::Fadt;
use log::{debug, info};

use crate::fixedreg::{FixedRegister, FixedRegisters, Pm1Control};
use crate::{AcpiError, SystemOps};

/// How long the firmware gets to acknowledge the enable command.
const ENABLE_TIMEOUT_SECONDS: u64 = 2;

fn sci_enabled(system: &dyn SystemOps, registers: &FixedRegisters) -> Result<bool, AcpiError> {
    let mask = u32::from(Pm1Control::new().with_sci_enabled(true).into_bits());
    Ok(registers.read(system, FixedRegister::Pm1Control)? & mask != 0)
}

/// Switches the platform from SMI to ACPI mode.
///
/// Completes immediately when the platform is hardware-reduced, the FADT
/// names no SMI command port, or `SCI_EN` is already set. The command
/// write runs on the boot processor; some chipsets only latch it there.
///
/// # Errors
/// [`AcpiError::Timeout`] when the firmware never raises `SCI_EN`,
/// [`AcpiError::InvalidParameter`] for an out-of-range command port, or
/// any error from the PM1 control block.
pub fn enable_acpi_mode(
    system: &dyn SystemOps,
    registers: &FixedRegisters,
    fadt: &Fadt,
) -> Result<(), AcpiError> {
    if fadt.hardware_reduced() {
        debug!("hardware-reduced platform, no mode transition");
        return Ok(());
    }
    if fadt.smi_command_port == 0 {
        debug!("no SMI command port, platform is always in ACPI mode");
        return Ok(());
    }
    if sci_enabled(system, registers)? {
        debug!("ACPI mode already enabled");
        return Ok(());
    }

    let port = u16::try_from(fadt.smi_command_port).map_err(|_| AcpiError::InvalidParameter)?;
    let command = u32::from(fadt.acpi_enable);
    system.run_on_boot_processor(&mut || system.io_write(port, 1, command));

    let deadline = system.time_ticks() + ENABLE_TIMEOUT_SECONDS * system.ticks_per_second();
    while !sci_enabled(system, registers)? {
        if system.time_ticks() >= deadline {
            return Err(AcpiError::Timeout);
        }
        system.delay_ms(1);
    }
    info!("ACPI mode enabled");
    Ok(())
}
