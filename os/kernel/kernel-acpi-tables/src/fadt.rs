//! # FADT (Fixed ACPI Description Table)
//!
//! The FADT carries the fixed-hardware programming model: PM register
//! blocks, the SMI command port, the reset register, and the pointers to
//! the FACS and DSDT. ACPI 1.0 firmware ships a 116-byte table without
//! the `X`-prefixed extended fields; parsing zero-fills whatever the
//! declared length does not cover, so extended fields read as absent.

use crate::header::{DescriptionHeader, GenericAddress};
use crate::{TableError, table_signature};

/// Signature of the FADT ("FACP").
pub const FADT_SIGNATURE: u32 = table_signature(b"FACP");

/// The reset register block is implemented and supported.
pub const FADT_FLAG_RESET_REGISTER_SUPPORTED: u32 = 0x0000_0400;

/// The platform is hardware-reduced ACPI: no SMI, no legacy PM blocks.
pub const FADT_FLAG_HARDWARE_REDUCED_ACPI: u32 = 0x0010_0000;

/// The fixed ACPI description table.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Fadt {
    pub header: DescriptionHeader,
    pub firmware_control: u32,
    pub dsdt: u32,
    pub reserved1: u8,
    pub preferred_power_profile: u8,
    pub sci_vector: u16,
    pub smi_command_port: u32,
    pub acpi_enable: u8,
    pub acpi_disable: u8,
    pub s4_bios_request: u8,
    pub pstate_control: u8,
    pub pm1a_event_block: u32,
    pub pm1b_event_block: u32,
    pub pm1a_control_block: u32,
    pub pm1b_control_block: u32,
    pub pm2_control_block: u32,
    pub pm_timer_block: u32,
    pub gpe0_block: u32,
    pub gpe1_block: u32,
    pub pm1_event_length: u8,
    pub pm1_control_length: u8,
    pub pm2_control_length: u8,
    pub pm_timer_length: u8,
    pub gpe0_block_length: u8,
    pub gpe1_block_length: u8,
    pub gpe1_base: u8,
    pub cst_control: u8,
    pub c2_latency: u16,
    pub c3_latency: u16,
    pub flush_size: u16,
    pub flush_stride: u16,
    pub duty_offset: u8,
    pub duty_width: u8,
    pub day_alarm: u8,
    pub month_alarm: u8,
    pub century: u8,
    pub ia_boot_flags: u16,
    pub reserved2: u8,
    pub flags: u32,
    pub reset_register: GenericAddress,
    pub reset_value: u8,
    pub reserved3: [u8; 3],
    pub x_firmware_control: u64,
    pub x_dsdt: u64,
    pub x_pm1a_event_block: GenericAddress,
    pub x_pm1b_event_block: GenericAddress,
    pub x_pm1a_control_block: GenericAddress,
    pub x_pm1b_control_block: GenericAddress,
    pub x_pm2_control_block: GenericAddress,
    pub x_pm_timer_block: GenericAddress,
    pub x_gpe0_block: GenericAddress,
    pub x_gpe1_block: GenericAddress,
}

impl Fadt {
    /// Validates signature, length, and checksum, then copies the table
    /// out. Fields past the declared length read as zero.
    ///
    /// # Errors
    /// [`TableError::BadSignature`] when the table is not a FADT; length
    /// and checksum failures as reported by
    /// [`DescriptionHeader::validate`].
    pub fn parse(bytes: &[u8]) -> Result<Self, TableError> {
        let header = DescriptionHeader::validate(bytes)?;
        if header.signature != FADT_SIGNATURE {
            return Err(TableError::BadSignature);
        }
        let mut raw = [0_u8; size_of::<Self>()];
        let present = bytes.len().min(header.length as usize).min(raw.len());
        raw[..present].copy_from_slice(&bytes[..present]);
        // Zero-padded copy, so the unaligned read stays in bounds even for
        // an ACPI 1.0 length.
        Ok(unsafe { core::ptr::read_unaligned(raw.as_ptr().cast::<Self>()) })
    }

    /// Physical address of the FACS: the extended pointer when non-zero,
    /// else the legacy 32-bit pointer. Zero when no FACS exists.
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn facs_address(&self) -> u64 {
        if self.x_firmware_control != 0 {
            self.x_firmware_control
        } else {
            self.firmware_control as u64
        }
    }

    /// Physical address of the DSDT, preferring the extended pointer.
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn dsdt_address(&self) -> u64 {
        if self.x_dsdt != 0 { self.x_dsdt } else { self.dsdt as u64 }
    }

    /// Whether the reset register may be used: revision 3+ declares the
    /// flag, or the register carries a non-zero address outright.
    #[must_use]
    pub const fn reset_register_usable(&self) -> bool {
        (self.header.revision >= 3 && self.flags & FADT_FLAG_RESET_REGISTER_SUPPORTED != 0)
            || self.reset_register.address != 0
    }

    /// Whether the platform declares hardware-reduced ACPI.
    #[must_use]
    pub const fn hardware_reduced(&self) -> bool {
        self.flags & FADT_FLAG_HARDWARE_REDUCED_ACPI != 0
    }
}
