//! # Boot Debug Transport Discovery (x86)
//!
//! Firmware rarely describes a usable debug port, so the loader probes for
//! one itself: the BIOS data area for legacy COM ports, PCI configuration
//! space for memory-mapped 16550s and USB debug controllers. The findings
//! become a generated DBG2 table for the kernel, plus a record of every
//! controller whose firmware SMI hooks must be cut once boot services are
//! gone.
//!
//! The 8259 pair is also parked here: vectors moved away from CPU
//! exceptions, every line masked, so a stray legacy interrupt cannot
//! masquerade as a fault later on.

use crate::capture;
use crate::memory::identity_ptr;
use crate::mmap;
use alloc::vec::Vec;
use kernel_acpi_tables::dbg2::{
    Dbg2Builder, DebugDevice, OEM_DATA_16550_SIGNATURE, OEM_FLAG_64_BYTE_FIFO,
    PORT_SUBTYPE_16550, PORT_SUBTYPE_16550_COMPATIBLE, PORT_SUBTYPE_EHCI, PORT_TYPE_SERIAL,
    PORT_TYPE_USB, Uart16550OemData,
};
use kernel_acpi_tables::directory::TableDirectory;
use kernel_acpi_tables::fadt::{FADT_SIGNATURE, Fadt};
use kernel_acpi_tables::header::{ADDRESS_SPACE_IO, GenericAddress};
use kernel_mdl::MemoryType;
use kernel_memory_addresses::PhysicalAddress;
use kernel_registers::port::{inl, inw, outb, outl, outw};
use log::{debug, info, warn};

/// Bytes of register window a discovered device claims.
pub const DEVICE_WINDOW: u64 = 0x400;

/// Highest PCI bus the boot-time scan walks.
const MAX_SCAN_BUS: u8 = 16;

const PCI_ADDRESS_PORT: u16 = 0xCF8;
const PCI_DATA_PORT: u16 = 0xCFC;
const PCI_ENABLE: u32 = 0x8000_0000;
const PCI_ID_OFFSET: u8 = 0x00;
const PCI_CONTROL_OFFSET: u8 = 0x04;
const PCI_CLASS_CODE_OFFSET: u8 = 0x08;
const PCI_BAR_OFFSET: u8 = 0x10;
const PCI_BAR_COUNT: u8 = 6;
const PCI_CONTROL_MEMORY_DECODE: u16 = 0x0002;
const PCI_BAR_IO_SPACE: u32 = 0x1;
const PCI_BAR_MEMORY_64_BIT: u32 = 0x4;
const PCI_BAR_MEMORY_MASK: u32 = !0xF;
const PCI_INVALID_VENDOR: u16 = 0xFFFF;

const CLASS_SERIAL_BUS: u8 = 0x0C;
const SUBCLASS_EHCI: u16 = 0x0320;
const SUBCLASS_OHCI: u16 = 0x0310;
const SUBCLASS_UHCI: u16 = 0x0300;
const CLASS_SIMPLE_COMM: u8 = 0x07;
const SUBCLASS_16550: u16 = 0x0002;
const SUBCLASS_OTHER_COMM: u16 = 0x8000;
const INTEL_VENDOR: u16 = 0x8086;
const QUARK_UART_DEVICE: u16 = 0x0936;
const QUARK_BASE_BAUD: u32 = 2_764_800;

/// BIOS data area slots holding the COM port bases.
const BDA_COM_SLOTS: u64 = 0x400;
const BDA_COM_PORTS: [u16; 4] = [0x3F8, 0x2F8, 0x3E8, 0x2E8];

const PIC_MASTER_COMMAND: u16 = 0x20;
const PIC_MASTER_DATA: u16 = 0x21;
const PIC_SLAVE_COMMAND: u16 = 0xA0;
const PIC_SLAVE_DATA: u16 = 0xA1;
const ICW1_INIT_FOUR_WORDS: u8 = 0x11;
const SPURIOUS_VECTOR: u8 = 0xFF;
const ICW3_SLAVE_ON_LINE_2: u8 = 0x04;
const ICW3_SLAVE_IDENTITY: u8 = 0x02;
const ICW4_8086_MODE: u8 = 0x01;
const MASK_ALL_LINES: u8 = 0xFF;

const EHCI_HCCPARAMS: u64 = 0x08;
const EHCI_LEGACY_BIOS_OWNED: u32 = 1 << 16;
const EHCI_LEGACY_OS_OWNED: u32 = 1 << 24;
const UHCI_LEGACY_REGISTER: u8 = 0xC0;
const UHCI_ENABLE_USB_INTERRUPTS: u16 = 0x2000;
const OHCI_CONTROL: u64 = 0x04;
const OHCI_COMMAND_STATUS: u64 = 0x08;
const OHCI_INTERRUPT_ENABLE: u64 = 0x10;
const OHCI_INTERRUPT_DISABLE: u64 = 0x14;
const OHCI_FRAME_INTERVAL: u64 = 0x34;
const OHCI_CONTROL_INTERRUPT_ROUTING: u32 = 1 << 8;
const OHCI_CONTROL_FUNCTIONAL_STATE: u32 = 3 << 6;
const OHCI_CONTROL_REMOTE_WAKE: u32 = 1 << 9;
const OHCI_STATUS_RESET: u32 = 1 << 0;
const OHCI_STATUS_OWNERSHIP_REQUEST: u32 = 1 << 3;
const OHCI_INTERRUPT_OWNERSHIP_CHANGE: u32 = 1 << 30;
const HANDOFF_SPIN_LIMIT: u32 = 10_000;

/// Controller classes that keep firmware SMI hooks alive past boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegacyController {
    /// EHCI with its legacy-support capability at the stored config
    /// offset.
    Ehci { control_register: u8 },
    Ohci,
    Uhci,
}

/// One controller recorded during the scan for post-exit attention.
#[derive(Debug, Clone, Copy)]
struct LegacyDevice {
    bus: u8,
    device: u8,
    function: u8,
    controller: LegacyController,
    /// Register window base for memory-mapped controllers, zero for UHCI.
    mmio_base: u64,
}

/// Everything discovery learned, carried to the post-exit-boot-services
/// fix-up.
pub struct DebugPlatform {
    devices: Vec<LegacyDevice>,
    dbg2: Option<Vec<u8>>,
}

impl DebugPlatform {
    /// The generated debug port table, when any transport was found.
    #[must_use]
    pub fn dbg2_bytes(&self) -> Option<&[u8]> {
        self.dbg2.as_deref()
    }

    /// Whether firmware currently owns a recorded debug controller.
    #[must_use]
    pub fn firmware_owned(&self) -> bool {
        self.devices
            .iter()
            .any(|device| matches!(device.controller, LegacyController::Ehci { .. }))
    }

    /// Register windows the kernel debug transport may touch, as
    /// physical base/length pairs.
    pub fn mmio_regions(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.devices
            .iter()
            .filter(|device| device.mmio_base != 0)
            .map(|device| (device.mmio_base, DEVICE_WINDOW))
    }

    /// Cuts every firmware hook the scan recorded. Runs after
    /// exit-boot-services, while the firmware's flat mapping is still the
    /// live address space.
    pub fn disable_legacy_interrupts(&self, directory: &TableDirectory) {
        // ACPI mode first, so SMM stops caring about the controllers
        // below.
        enable_acpi_mode(directory);

        for device in &self.devices {
            debug!(
                "releasing {:?} at {:02x}:{:02x}.{:x}",
                device.controller, device.bus, device.device, device.function
            );
            match device.controller {
                LegacyController::Ehci { control_register } => {
                    ehci_handoff(device, control_register);
                }
                LegacyController::Uhci => {
                    // SAFETY: config-space write to a device the scan saw.
                    unsafe {
                        pci_write16(
                            device.bus,
                            device.device,
                            device.function,
                            UHCI_LEGACY_REGISTER,
                            UHCI_ENABLE_USB_INTERRUPTS,
                        );
                    }
                }
                LegacyController::Ohci => ohci_takeover(device),
            }
        }
    }
}

/// Probes the platform for kernel debug transports and legacy controllers.
#[must_use]
pub fn discover() -> DebugPlatform {
    match capture::early_has_dual_8259() {
        Some(false) => debug!("MADT declares no 8259 pair"),
        _ => initialize_8259(),
    }

    let mut builder = Dbg2Builder::new();
    let mut devices = Vec::new();

    let hardware_reduced = capture::early_fadt().is_some_and(|fadt| fadt.hardware_reduced());
    if hardware_reduced {
        debug!("hardware-reduced ACPI; skipping BIOS data area");
    } else if let Some(port) = bios_data_area_com_port() {
        info!("legacy COM port at {port:#x}");
        builder.push(DebugDevice {
            port_type: PORT_TYPE_SERIAL,
            port_subtype: PORT_SUBTYPE_16550,
            address: GenericAddress {
                address_space_id: ADDRESS_SPACE_IO,
                register_bit_width: 8,
                register_bit_offset: 0,
                access_size: 1,
                address: u64::from(port),
            },
            address_size: 8,
            oem_data: None,
        });
    }

    explore_pci(&mut builder, &mut devices);

    let dbg2 = if builder.is_empty() {
        info!("no boot debug transport found");
        None
    } else {
        Some(builder.build())
    };
    DebugPlatform { devices, dbg2 }
}

fn initialize_8259() {
    // Full ICW sequence on both controllers, parked on the spurious
    // vector with every line masked.
    unsafe {
        outb(PIC_MASTER_COMMAND, ICW1_INIT_FOUR_WORDS);
        outb(PIC_MASTER_DATA, SPURIOUS_VECTOR);
        outb(PIC_MASTER_DATA, ICW3_SLAVE_ON_LINE_2);
        outb(PIC_MASTER_DATA, ICW4_8086_MODE);
        outb(PIC_MASTER_DATA, MASK_ALL_LINES);

        outb(PIC_SLAVE_COMMAND, ICW1_INIT_FOUR_WORDS);
        outb(PIC_SLAVE_DATA, SPURIOUS_VECTOR);
        outb(PIC_SLAVE_DATA, ICW3_SLAVE_IDENTITY);
        outb(PIC_SLAVE_DATA, ICW4_8086_MODE);
        outb(PIC_SLAVE_DATA, MASK_ALL_LINES);
    }
    debug!("8259 pair masked");
}

/// First whitelisted COM base in the BIOS data area, if the low page is
/// firmware-described memory at all.
fn bios_data_area_com_port() -> Option<u16> {
    let kind = mmap::firmware_region_type(BDA_COM_SLOTS)?;
    if !matches!(
        kind,
        MemoryType::FirmwareTemporary | MemoryType::FirmwarePermanent | MemoryType::Reserved
    ) {
        return None;
    }
    let slots_ptr = identity_ptr::<[u16; 4]>(PhysicalAddress::new(BDA_COM_SLOTS));
    // SAFETY: the firmware map describes the low page; the read covers the
    // four u16 slots at 0x400.
    let slots = unsafe { core::ptr::read_volatile(slots_ptr) };
    slots.into_iter().find(|port| BDA_COM_PORTS.contains(port))
}

#[allow(clippy::cast_possible_truncation)]
const fn low_word(value: u32) -> u16 {
    (value & 0xFFFF) as u16
}

#[allow(clippy::cast_possible_truncation)]
const fn high_word(value: u32) -> u16 {
    (value >> 16) as u16
}

#[allow(clippy::cast_possible_truncation)]
const fn class_of(class_code: u32) -> u8 {
    (class_code >> 24) as u8
}

#[allow(clippy::cast_possible_truncation)]
const fn subclass_interface(class_code: u32) -> u16 {
    ((class_code >> 8) & 0xFFFF) as u16
}

#[allow(clippy::cast_possible_truncation)]
const fn eecp_of(hccparams: u32) -> u8 {
    ((hccparams & 0xFF00) >> 8) as u8
}

fn pci_address(bus: u8, device: u8, function: u8, register: u8) -> u32 {
    PCI_ENABLE
        | (u32::from(bus) << 16)
        | (u32::from(device) << 11)
        | (u32::from(function) << 8)
        | u32::from(register)
}

unsafe fn pci_read32(bus: u8, device: u8, function: u8, register: u8) -> u32 {
    // SAFETY: caller holds the platform's config-space convention.
    unsafe {
        outl(PCI_ADDRESS_PORT, pci_address(bus, device, function, register));
        inl(PCI_DATA_PORT)
    }
}

unsafe fn pci_write32(bus: u8, device: u8, function: u8, register: u8, value: u32) {
    // SAFETY: caller holds the platform's config-space convention.
    unsafe {
        outl(PCI_ADDRESS_PORT, pci_address(bus, device, function, register));
        outl(PCI_DATA_PORT, value);
    }
}

unsafe fn pci_read16(bus: u8, device: u8, function: u8, register: u8) -> u16 {
    // SAFETY: caller holds the platform's config-space convention.
    unsafe {
        outl(PCI_ADDRESS_PORT, pci_address(bus, device, function, register));
        inw(PCI_DATA_PORT + u16::from(register & 3))
    }
}

unsafe fn pci_write16(bus: u8, device: u8, function: u8, register: u8, value: u16) {
    // SAFETY: caller holds the platform's config-space convention.
    unsafe {
        outl(PCI_ADDRESS_PORT, pci_address(bus, device, function, register));
        outw(PCI_DATA_PORT + u16::from(register & 3), value);
    }
}

unsafe fn mmio_read(base: u64, offset: u64) -> u32 {
    // SAFETY: caller names a register inside a decoded window.
    unsafe { core::ptr::read_volatile(identity_ptr::<u32>(PhysicalAddress::new(base + offset))) }
}

unsafe fn mmio_write(base: u64, offset: u64, value: u32) {
    // SAFETY: caller names a register inside a decoded window.
    unsafe {
        core::ptr::write_volatile(identity_ptr::<u32>(PhysicalAddress::new(base + offset)), value);
    }
}

/// First 32-bit memory BAR the device decodes, masked to its base.
fn first_memory_bar(bus: u8, device: u8, function: u8) -> Option<u64> {
    // SAFETY: scan coordinates.
    let control = unsafe { pci_read16(bus, device, function, PCI_CONTROL_OFFSET) };
    if control & PCI_CONTROL_MEMORY_DECODE == 0 {
        return None;
    }
    for index in 0..PCI_BAR_COUNT {
        // SAFETY: scan coordinates.
        let bar = unsafe { pci_read32(bus, device, function, PCI_BAR_OFFSET + index * 4) };
        if bar != 0 && bar & (PCI_BAR_IO_SPACE | PCI_BAR_MEMORY_64_BIT) == 0 {
            return Some(u64::from(bar & PCI_BAR_MEMORY_MASK));
        }
    }
    None
}

fn explore_pci(builder: &mut Dbg2Builder, devices: &mut Vec<LegacyDevice>) {
    for bus in 0..MAX_SCAN_BUS {
        for device in 0..32 {
            for function in 0..8 {
                probe_function(builder, devices, bus, device, function);
            }
        }
    }
    debug!("PCI scan recorded {} legacy controllers", devices.len());
}

fn probe_function(
    builder: &mut Dbg2Builder,
    devices: &mut Vec<LegacyDevice>,
    bus: u8,
    device: u8,
    function: u8,
) {
    // SAFETY: scan coordinates stay inside the config convention.
    let id = unsafe { pci_read32(bus, device, function, PCI_ID_OFFSET) };
    let vendor = low_word(id);
    if vendor == 0 || vendor == PCI_INVALID_VENDOR {
        return;
    }
    // SAFETY: as above.
    let class_code = unsafe { pci_read32(bus, device, function, PCI_CLASS_CODE_OFFSET) };
    let class = class_of(class_code);
    let sub_interface = subclass_interface(class_code);

    if class == CLASS_SERIAL_BUS {
        match sub_interface {
            SUBCLASS_EHCI => explore_ehci(builder, devices, bus, device, function),
            SUBCLASS_OHCI => {
                if let Some(base) = first_memory_bar(bus, device, function) {
                    devices.push(LegacyDevice {
                        bus,
                        device,
                        function,
                        controller: LegacyController::Ohci,
                        mmio_base: base,
                    });
                }
            }
            SUBCLASS_UHCI => {
                devices.push(LegacyDevice {
                    bus,
                    device,
                    function,
                    controller: LegacyController::Uhci,
                    mmio_base: 0,
                });
            }
            _ => {}
        }
    } else if class == CLASS_SIMPLE_COMM {
        let quark = vendor == INTEL_VENDOR && high_word(id) == QUARK_UART_DEVICE;
        if sub_interface == SUBCLASS_16550 || (sub_interface == SUBCLASS_OTHER_COMM && quark) {
            if let Some(base) = first_memory_bar(bus, device, function) {
                info!(
                    "PCI 16550 at {bus:02x}:{device:02x}.{function:x}, registers {base:#x}"
                );
                builder.push(uart_device(base, quark));
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn uart_device(base: u64, quark: bool) -> DebugDevice {
    let oem_data = quark.then_some(Uart16550OemData {
        signature: OEM_DATA_16550_SIGNATURE,
        base_baud: QUARK_BASE_BAUD,
        register_offset: 0,
        register_shift: 2,
        flags: OEM_FLAG_64_BYTE_FIFO,
    });
    DebugDevice {
        port_type: PORT_TYPE_SERIAL,
        port_subtype: PORT_SUBTYPE_16550_COMPATIBLE,
        address: GenericAddress::memory(base, 8),
        address_size: DEVICE_WINDOW as u32,
        oem_data,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn explore_ehci(
    builder: &mut Dbg2Builder,
    devices: &mut Vec<LegacyDevice>,
    bus: u8,
    device: u8,
    function: u8,
) {
    let Some(base) = first_memory_bar(bus, device, function) else {
        return;
    };
    info!("EHCI controller at {bus:02x}:{device:02x}.{function:x}, registers {base:#x}");
    builder.push(DebugDevice {
        port_type: PORT_TYPE_USB,
        port_subtype: PORT_SUBTYPE_EHCI,
        address: GenericAddress::memory(base, 32),
        address_size: DEVICE_WINDOW as u32,
        oem_data: None,
    });

    // The extended-capability chain starts where HCCPARAMS points; no
    // chain means no firmware ownership to take over later.
    // SAFETY: BAR decoded and memory space enabled.
    let hccparams = unsafe { mmio_read(base, EHCI_HCCPARAMS) };
    let eecp = eecp_of(hccparams);
    if eecp != 0 {
        devices.push(LegacyDevice {
            bus,
            device,
            function,
            controller: LegacyController::Ehci {
                control_register: eecp,
            },
            mmio_base: base,
        });
    }
}

fn enable_acpi_mode(directory: &TableDirectory) {
    let Some(fadt_address) = directory.get_acpi_table(FADT_SIGNATURE, None) else {
        return;
    };
    // SAFETY: the directory's boot address was probed during capture.
    let Some(bytes) = (unsafe { capture::table_bytes(fadt_address) }) else {
        return;
    };
    let Ok(fadt) = Fadt::parse(bytes) else {
        return;
    };
    let smi_command_port = fadt.smi_command_port;
    let Ok(port) = u16::try_from(smi_command_port) else {
        warn!("SMI command port {smi_command_port:#x} out of range");
        return;
    };
    if port == 0 {
        return;
    }
    debug!("enabling ACPI mode via SMI port {port:#x}");
    // SAFETY: the FADT names this port as the SMI command register.
    unsafe { outb(port, fadt.acpi_enable) };
}

fn ehci_handoff(device: &LegacyDevice, control_register: u8) {
    // SAFETY: recorded scan coordinates.
    unsafe {
        let legacy = pci_read32(device.bus, device.device, device.function, control_register);
        if legacy & EHCI_LEGACY_BIOS_OWNED == 0 {
            return;
        }
        pci_write32(
            device.bus,
            device.device,
            device.function,
            control_register,
            legacy | EHCI_LEGACY_OS_OWNED,
        );
        for _ in 0..HANDOFF_SPIN_LIMIT {
            let state = pci_read32(device.bus, device.device, device.function, control_register);
            if state & EHCI_LEGACY_BIOS_OWNED == 0 {
                return;
            }
        }
        // Some firmware never lets go; the kernel copes.
        warn!("EHCI BIOS-owned bit stuck");
    }
}

fn ohci_takeover(device: &LegacyDevice) {
    let base = device.mmio_base;
    // SAFETY: the BAR was decoded during the scan and stays identity
    // reachable until the address-space switch.
    unsafe {
        let control = mmio_read(base, OHCI_CONTROL);
        if control & OHCI_CONTROL_INTERRUPT_ROUTING != 0 {
            // Firmware drives the controller over SMI; request the
            // ownership change and wait for it to drop the routing bit.
            mmio_write(base, OHCI_INTERRUPT_ENABLE, OHCI_INTERRUPT_OWNERSHIP_CHANGE);
            mmio_write(base, OHCI_COMMAND_STATUS, OHCI_STATUS_OWNERSHIP_REQUEST);
            for _ in 0..HANDOFF_SPIN_LIMIT {
                if mmio_read(base, OHCI_CONTROL) & OHCI_CONTROL_INTERRUPT_ROUTING == 0 {
                    break;
                }
            }
        }
        mmio_write(base, OHCI_INTERRUPT_DISABLE, 0xFFFF_FFFF);

        let control = mmio_read(base, OHCI_CONTROL);
        if control & OHCI_CONTROL_FUNCTIONAL_STATE != 0 {
            // Deactivate, keeping only the remote-wake wiring and the
            // frame interval the firmware calibrated.
            mmio_write(base, OHCI_CONTROL, control & OHCI_CONTROL_REMOTE_WAKE);
            let frame_interval = mmio_read(base, OHCI_FRAME_INTERVAL);
            mmio_write(base, OHCI_COMMAND_STATUS, OHCI_STATUS_RESET);
            for _ in 0..HANDOFF_SPIN_LIMIT {
                if mmio_read(base, OHCI_COMMAND_STATUS) & OHCI_STATUS_RESET == 0 {
                    break;
                }
            }
            mmio_write(base, OHCI_FRAME_INTERVAL, frame_interval);
        }
    }
}
