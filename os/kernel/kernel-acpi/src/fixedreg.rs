//! # Fixed Hardware Register Access
//!
//! The FADT names the PM1 event, PM1 control, and PM2 control register
//! blocks twice: legacy port/length pairs and extended generic address
//! structures. The extended form wins whenever its address is non-zero.
//! An optional `B` block shadows its `A` partner: reads OR both halves
//! together and writes go to both, as the hardware specification
//! requires.
//!
//! The PM1 event block is really two registers back to back: status in
//! the first half, enable in the second. The split happens here so
//! callers address them independently.
//!
//! Memory-space registers are mapped uncached one page at a time on
//! first use and the mapping is kept for the lifetime of the system.

use core::ptr::NonNull;

use bitfield_struct::bitfield;
use kernel_acpi_tables::fadt::Fadt;
use kernel_acpi_tables::header::{ADDRESS_SPACE_IO, ADDRESS_SPACE_MEMORY, GenericAddress};
use kernel_sync::SyncOnceCell;

use crate::{AcpiError, SystemOps};

/// Registers are mapped in page units.
const PAGE_SIZE: usize = 4096;
const PAGE_OFFSET_MASK: u64 = 0xFFF;

/// PM1 control register layout.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct Pm1Control {
    /// SCI_EN (bit 0): the chipset routes power events to the SCI
    /// rather than SMI; set means ACPI mode is active.
    pub sci_enabled: bool,

    /// BM_RLD (bit 1): bus-master requests wake the processor from C3.
    pub bus_master_wake: bool,

    /// GBL_RLS (bit 2): write-only handshake telling firmware the
    /// global lock was released with its bit pending.
    pub global_lock_released: bool,

    /// Bits 3-9, reserved.
    #[bits(7, default = 0)]
    _reserved_low: u8,

    /// SLP_TYP (bits 10-12): sleep type from the `_Sx` package.
    #[bits(3)]
    pub sleep_type: u8,

    /// SLP_EN (bit 13): writing one starts the sleep transition.
    pub sleep_enable: bool,

    /// Bits 14-15, reserved.
    #[bits(2, default = 0)]
    _reserved_high: u8,
}

/// PM1 event register layout, shared by the status and enable halves of
/// the event block. On the status side bit 14 reports a PCI Express
/// wake; on the enable side it disables that wake source.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct Pm1Event {
    /// TMR (bit 0): PM timer carry.
    pub timer: bool,

    /// Bits 1-3, reserved.
    #[bits(3, default = 0)]
    _reserved_low: u8,

    /// BM_STS (bit 4): a bus master requested the system bus.
    pub bus_master: bool,

    /// GBL (bit 5): firmware released the global lock.
    pub global: bool,

    /// Bits 6-7, reserved.
    #[bits(2, default = 0)]
    _reserved_mid: u8,

    /// PWRBTN (bit 8): power button press.
    pub power_button: bool,

    /// SLPBTN (bit 9): sleep button press.
    pub sleep_button: bool,

    /// RTC (bit 10): real-time clock alarm.
    pub rtc: bool,

    /// Bits 11-13, reserved.
    #[bits(3, default = 0)]
    _reserved_high: u8,

    /// PCIEXP_WAKE (bit 14).
    pub pcie_wake: bool,

    /// WAK (bit 15): the hardware woke from a sleep state.
    pub wake: bool,
}

/// PM2 control: bus arbiter disable (bit 0).
pub const PM2_ARBITER_DISABLE: u32 = 0x1;

/// A mapped register page shared between processors. The mapping is
/// permanent and every access through it is volatile.
struct MappedPage(NonNull<u8>);

unsafe impl Send for MappedPage {}
unsafe impl Sync for MappedPage {}

/// Volatile read of 1, 2, or 4 bytes, zero-extended.
unsafe fn read_width(pointer: *const u8, width: usize) -> u32 {
    match width {
        1 => u32::from(unsafe { pointer.read_volatile() }),
        2 => u32::from(unsafe { pointer.cast::<u16>().read_volatile() }),
        _ => unsafe { pointer.cast::<u32>().read_volatile() },
    }
}

/// Volatile write of 1, 2, or 4 bytes.
#[allow(clippy::cast_possible_truncation)]
unsafe fn write_width(pointer: *mut u8, width: usize, value: u32) {
    match width {
        1 => unsafe { pointer.write_volatile(value as u8) },
        2 => unsafe { pointer.cast::<u16>().write_volatile(value as u16) },
        _ => unsafe { pointer.cast::<u32>().write_volatile(value) },
    }
}

/// One hardware register behind a generic address.
struct Register {
    address: GenericAddress,
    mapping: SyncOnceCell<MappedPage>,
}

impl Register {
    fn new(address: GenericAddress) -> Option<Self> {
        if address.is_implemented() {
            Some(Self {
                address,
                mapping: SyncOnceCell::new(),
            })
        } else {
            None
        }
    }

    /// Pointer to the register inside its lazily created page mapping.
    #[allow(clippy::cast_possible_truncation)]
    fn mapped(&self, system: &dyn SystemOps) -> Result<*mut u8, AcpiError> {
        let offset = (self.address.address & PAGE_OFFSET_MASK) as usize;
        if let Some(page) = self.mapping.get() {
            return Ok(unsafe { page.0.as_ptr().add(offset) });
        }
        let base = system
            .map_physical(self.address.address & !PAGE_OFFSET_MASK, PAGE_SIZE)
            .ok_or(AcpiError::InsufficientResources)?;

        // A lost race leaks the duplicate mapping; both stay valid.
        let page = self.mapping.get_or_init(|| MappedPage(base));
        Ok(unsafe { page.0.as_ptr().add(offset) })
    }

    fn read(&self, system: &dyn SystemOps) -> Result<u32, AcpiError> {
        let width = self.address.access_bytes().min(4);
        match self.address.address_space_id {
            ADDRESS_SPACE_IO => {
                let port = u16::try_from(self.address.address)
                    .map_err(|_| AcpiError::InvalidParameter)?;
                Ok(system.io_read(port, width))
            }
            ADDRESS_SPACE_MEMORY => {
                let pointer = self.mapped(system)?;
                Ok(unsafe { read_width(pointer, width) })
            }
            _ => Err(AcpiError::NotSupported),
        }
    }

    fn write(&self, system: &dyn SystemOps, value: u32) -> Result<(), AcpiError> {
        let width = self.address.access_bytes().min(4);
        match self.address.address_space_id {
            ADDRESS_SPACE_IO => {
                let port = u16::try_from(self.address.address)
                    .map_err(|_| AcpiError::InvalidParameter)?;
                system.io_write(port, width, value);
                Ok(())
            }
            ADDRESS_SPACE_MEMORY => {
                let pointer = self.mapped(system)?;
                unsafe { write_width(pointer, width, value) };
                Ok(())
            }
            _ => Err(AcpiError::NotSupported),
        }
    }
}

/// The generic address of a register block: the extended structure when
/// implemented, else one built from the legacy port and length fields.
fn block_address(extended: GenericAddress, port: u32, length: u8) -> Option<GenericAddress> {
    if extended.is_implemented() {
        return Some(extended);
    }
    if port == 0 || length == 0 {
        return None;
    }
    let port = u16::try_from(port).ok()?;
    Some(GenericAddress::io(port, length))
}

/// Splits an event block into its status and enable halves.
fn event_halves(block: Option<GenericAddress>) -> (Option<Register>, Option<Register>) {
    let Some(block) = block else {
        return (None, None);
    };
    let half_bits = block.register_bit_width / 2;
    let status = GenericAddress {
        register_bit_width: half_bits,
        ..block
    };
    let enable = GenericAddress {
        register_bit_width: half_bits,
        address: block.address + u64::from(half_bits / 8),
        ..block
    };
    (Register::new(status), Register::new(enable))
}

/// The fixed registers a caller can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixedRegister {
    /// PM1 event status half.
    Pm1Status,
    /// PM1 event enable half.
    Pm1Enable,
    /// PM1 control.
    Pm1Control,
    /// PM2 control.
    Pm2Control,
}

/// Access to the fixed hardware register blocks the FADT declares.
pub struct FixedRegisters {
    pm1a_status: Option<Register>,
    pm1b_status: Option<Register>,
    pm1a_enable: Option<Register>,
    pm1b_enable: Option<Register>,
    pm1a_control: Option<Register>,
    pm1b_control: Option<Register>,
    pm2_control: Option<Register>,
}

impl FixedRegisters {
    /// Chooses the register blocks from the FADT.
    #[must_use]
    pub fn from_fadt(fadt: &Fadt) -> Self {
        let (pm1a_status, pm1a_enable) = event_halves(block_address(
            fadt.x_pm1a_event_block,
            fadt.pm1a_event_block,
            fadt.pm1_event_length,
        ));
        let (pm1b_status, pm1b_enable) = event_halves(block_address(
            fadt.x_pm1b_event_block,
            fadt.pm1b_event_block,
            fadt.pm1_event_length,
        ));
        Self {
            pm1a_status,
            pm1b_status,
            pm1a_enable,
            pm1b_enable,
            pm1a_control: block_address(
                fadt.x_pm1a_control_block,
                fadt.pm1a_control_block,
                fadt.pm1_control_length,
            )
            .and_then(Register::new),
            pm1b_control: block_address(
                fadt.x_pm1b_control_block,
                fadt.pm1b_control_block,
                fadt.pm1_control_length,
            )
            .and_then(Register::new),
            pm2_control: block_address(
                fadt.x_pm2_control_block,
                fadt.pm2_control_block,
                fadt.pm2_control_length,
            )
            .and_then(Register::new),
        }
    }

    fn pair(&self, register: FixedRegister) -> (Option<&Register>, Option<&Register>) {
        match register {
            FixedRegister::Pm1Status => (self.pm1a_status.as_ref(), self.pm1b_status.as_ref()),
            FixedRegister::Pm1Enable => (self.pm1a_enable.as_ref(), self.pm1b_enable.as_ref()),
            FixedRegister::Pm1Control => (self.pm1a_control.as_ref(), self.pm1b_control.as_ref()),
            FixedRegister::Pm2Control => (self.pm2_control.as_ref(), None),
        }
    }

    /// Reads a fixed register, combining the `A` and `B` blocks.
    ///
    /// # Errors
    /// [`AcpiError::NotSupported`] when the FADT declares neither block.
    pub fn read(&self, system: &dyn SystemOps, register: FixedRegister) -> Result<u32, AcpiError> {
        let (a, b) = self.pair(register);
        if a.is_none() && b.is_none() {
            return Err(AcpiError::NotSupported);
        }
        let mut value = 0;
        if let Some(register) = a {
            value |= register.read(system)?;
        }
        if let Some(register) = b {
            value |= register.read(system)?;
        }
        Ok(value)
    }

    /// Writes a fixed register, mirroring the value to both blocks.
    ///
    /// # Errors
    /// [`AcpiError::NotSupported`] when the FADT declares neither block.
    pub fn write(
        &self,
        system: &dyn SystemOps,
        register: FixedRegister,
        value: u32,
    ) -> Result<(), AcpiError> {
        let (a, b) = self.pair(register);
        if a.is_none() && b.is_none() {
            return Err(AcpiError::NotSupported);
        }
        if let Some(register) = a {
            register.write(system, value)?;
        }
        if let Some(register) = b {
            register.write(system, value)?;
        }
        Ok(())
    }
}

/// Writes a register outside the fixed blocks, such as the FADT reset
/// register. Memory space is mapped for the single access.
///
/// # Errors
/// [`AcpiError::InvalidParameter`] for an out-of-range port,
/// [`AcpiError::InsufficientResources`] when the mapping fails,
/// [`AcpiError::NotSupported`] for other address spaces.
#[allow(clippy::cast_possible_truncation)]
pub fn write_register(
    system: &dyn SystemOps,
    address: GenericAddress,
    value: u32,
) -> Result<(), AcpiError> {
    let width = address.access_bytes().min(4);
    match address.address_space_id {
        ADDRESS_SPACE_IO => {
            let port = u16::try_from(address.address).map_err(|_| AcpiError::InvalidParameter)?;
            system.io_write(port, width, value);
            Ok(())
        }
        ADDRESS_SPACE_MEMORY => {
            let base = system
                .map_physical(address.address & !PAGE_OFFSET_MASK, PAGE_SIZE)
                .ok_or(AcpiError::InsufficientResources)?;
            let offset = (address.address & PAGE_OFFSET_MASK) as usize;
            unsafe { write_width(base.as_ptr().add(offset), width, value) };
            Ok(())
        }
        _ => Err(AcpiError::NotSupported),
    }
}
