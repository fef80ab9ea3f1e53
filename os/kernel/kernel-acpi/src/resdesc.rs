//! # Resource Descriptor Codec
//!
//! Converts between ACPI resource templates (the byte streams `_CRS` and
//! `_PRS` return) and the requirement lists of [`crate::requirements`],
//! and back again for `_SRS`.
//!
//! A template is a run of descriptors. Small descriptors pack type and
//! length into the tag byte; large descriptors follow the tag with a
//! 16-bit length. An end-tag closes each configuration and carries an
//! optional checksum over everything before it.
//!
//! The reverse direction never rebuilds a template from scratch: `_SRS`
//! expects the `_CRS` byte layout with the variable fields filled in, so
//! [`emit_allocations`] walks a copy of the saved template and rewrites
//! exactly the bytes that name the assigned resource.

use alloc::vec::Vec;

use kernel_acpi_tables::header::GenericAddress;
use kernel_acpi_tables::sum;
use log::{debug, warn};

use crate::AcpiError;
use crate::device::OsDevice;
use crate::requirements::{
    Allocation, Configuration, DmaData, GpioData, I2cData, Requirement, ResourceData,
    ResourceType, SpbBus, SpbData, SpiData, UartData, UartFlowControl, UartParity, UartStopBits,
    DMA_BUS_MASTER, DMA_TRANSFER_SIZE_128, DMA_TRANSFER_SIZE_16, DMA_TRANSFER_SIZE_256,
    DMA_TRANSFER_SIZE_32, DMA_TRANSFER_SIZE_64, DMA_TRANSFER_SIZE_8, DMA_TYPE_EISA_A,
    DMA_TYPE_EISA_B, DMA_TYPE_EISA_F, DMA_TYPE_ISA, GPIO_ACTIVE_HIGH, GPIO_ACTIVE_LOW,
    GPIO_EDGE_TRIGGERED, GPIO_INPUT, GPIO_INTERRUPT, GPIO_OUTPUT, GPIO_PULL_DOWN, GPIO_PULL_NONE,
    GPIO_PULL_UP, GPIO_SETTING_DEFAULT, GPIO_WAKE, INTERRUPT_LINE_ACTIVE_HIGH,
    INTERRUPT_LINE_ACTIVE_LOW, INTERRUPT_LINE_EDGE_TRIGGERED, INTERRUPT_LINE_SECONDARY,
    INTERRUPT_LINE_WAKE, RESOURCE_FLAG_NOT_SHAREABLE,
};

/// Bit distinguishing large descriptors from small ones.
const DESCRIPTOR_LARGE: u8 = 0x80;

/// Length bits of a small descriptor tag.
const SMALL_LENGTH_MASK: u8 = 0x07;

/// Type bits of a small descriptor tag.
const SMALL_TYPE_MASK: u8 = 0x78;

const SMALL_TYPE_IRQ: u8 = 0x20;
const SMALL_TYPE_DMA: u8 = 0x28;
const SMALL_TYPE_START_DEPENDENT: u8 = 0x30;
const SMALL_TYPE_END_DEPENDENT: u8 = 0x38;
const SMALL_TYPE_IO: u8 = 0x40;
const SMALL_TYPE_FIXED_IO: u8 = 0x48;
const SMALL_TYPE_FIXED_DMA: u8 = 0x50;
const SMALL_TYPE_VENDOR: u8 = 0x70;
const SMALL_TYPE_END_TAG: u8 = 0x78;

/// Type bits of a large descriptor tag.
const LARGE_TYPE_MASK: u8 = 0x7F;

const LARGE_TYPE_MEMORY24: u8 = 0x01;
const LARGE_TYPE_GENERIC_REGISTER: u8 = 0x02;
const LARGE_TYPE_VENDOR: u8 = 0x04;
const LARGE_TYPE_MEMORY32: u8 = 0x05;
const LARGE_TYPE_FIXED_MEMORY32: u8 = 0x06;
const LARGE_TYPE_ADDRESS32: u8 = 0x07;
const LARGE_TYPE_ADDRESS16: u8 = 0x08;
const LARGE_TYPE_IRQ: u8 = 0x09;
const LARGE_TYPE_ADDRESS64: u8 = 0x0A;
const LARGE_TYPE_ADDRESS_EXTENDED: u8 = 0x0B;
const LARGE_TYPE_GPIO: u8 = 0x0C;
const LARGE_TYPE_SPB: u8 = 0x0E;

/// Small IRQ option bits.
const SMALL_IRQ_EDGE_TRIGGERED: u8 = 0x01;
const SMALL_IRQ_ACTIVE_LOW: u8 = 0x08;
const SMALL_IRQ_SHAREABLE: u8 = 0x10;

/// Small DMA flag fields.
const SMALL_DMA_SPEED_MASK: u8 = 0x60;
const SMALL_DMA_SPEED_ISA: u8 = 0x00;
const SMALL_DMA_SPEED_EISA_A: u8 = 0x20;
const SMALL_DMA_SPEED_EISA_B: u8 = 0x40;
const SMALL_DMA_BUS_MASTER: u8 = 0x04;
const SMALL_DMA_SIZE_MASK: u8 = 0x03;
const SMALL_DMA_SIZE_8_BIT: u8 = 0x00;
const SMALL_DMA_SIZE_8_AND_16_BIT: u8 = 0x01;
const SMALL_DMA_SIZE_16_BIT: u8 = 0x02;

/// Large IRQ flag bits.
const LARGE_IRQ_EDGE_TRIGGERED: u8 = 0x02;
const LARGE_IRQ_ACTIVE_LOW: u8 = 0x04;
const LARGE_IRQ_SHAREABLE: u8 = 0x08;

/// Memory descriptor information byte.
const MEMORY_WRITEABLE: u8 = 0x01;

/// Generic address descriptor space codes.
const GENERIC_ADDRESS_TYPE_MEMORY: u8 = 0;
const GENERIC_ADDRESS_TYPE_IO: u8 = 1;
const GENERIC_ADDRESS_TYPE_BUS_NUMBER: u8 = 2;

/// Generic address descriptor general flag bits.
const GENERIC_ADDRESS_MINIMUM_FIXED: u8 = 0x04;
const GENERIC_ADDRESS_MAXIMUM_FIXED: u8 = 0x08;

/// GPIO connection kinds.
const GPIO_CONNECTION_INTERRUPT: u8 = 0;
const GPIO_CONNECTION_IO: u8 = 1;

/// GPIO interrupt and I/O flag fields.
const GPIO_FLAG_EDGE_TRIGGERED: u16 = 0x0001;
const GPIO_POLARITY_MASK: u16 = 0x0006;
const GPIO_POLARITY_ACTIVE_HIGH: u16 = 0x0000;
const GPIO_POLARITY_ACTIVE_LOW: u16 = 0x0002;
const GPIO_POLARITY_ACTIVE_BOTH: u16 = 0x0004;
const GPIO_FLAG_SHARED: u16 = 0x0008;
const GPIO_FLAG_WAKE: u16 = 0x0010;
const GPIO_IO_RESTRICTION_MASK: u16 = 0x0003;
const GPIO_IO_RESTRICTION_INPUT: u16 = 0x0001;
const GPIO_IO_RESTRICTION_OUTPUT: u16 = 0x0002;

/// GPIO pin configuration codes.
const GPIO_PIN_PULL_UP: u8 = 1;
const GPIO_PIN_PULL_DOWN: u8 = 2;
const GPIO_PIN_PULL_NONE: u8 = 3;

/// Drive strength and debounce value meaning "hardware default".
const GPIO_WIRE_SETTING_DEFAULT: u16 = 0xFFFF;

/// Simple peripheral bus kinds.
const SPB_BUS_I2C: u8 = 1;
const SPB_BUS_SPI: u8 = 2;
const SPB_BUS_UART: u8 = 3;

/// SPB general flag bits.
const SPB_FLAG_SLAVE: u8 = 0x01;

/// Defined type-specific data lengths per bus.
const SPB_I2C_TYPE_DATA_LENGTH: usize = 6;
const SPB_SPI_TYPE_DATA_LENGTH: usize = 9;
const SPB_UART_TYPE_DATA_LENGTH: usize = 10;

/// SPB type-specific flag bits.
const SPB_I2C_10_BIT_ADDRESSING: u16 = 0x0001;
const SPB_SPI_3_WIRES: u16 = 0x0001;
const SPB_SPI_SELECT_ACTIVE_HIGH: u16 = 0x0002;
const SPB_UART_FLOW_CONTROL_MASK: u16 = 0x0003;
const SPB_UART_STOP_BITS_MASK: u16 = 0x0003 << 2;
const SPB_UART_DATA_BITS_MASK: u16 = 0x0007 << 4;
const SPB_UART_BIG_ENDIAN: u16 = 0x0080;

/// Resolves resource source references while a template is parsed.
///
/// GPIO and simple-bus descriptors name the device that provides the
/// connection. The implementation resolves the path, checks the provider
/// has started, and records a dependency when it has not; in that case
/// [`ProviderLookup::resolve`] fails with [`AcpiError::NotReady`] and the
/// whole query is retried once the provider starts.
pub trait ProviderLookup {
    /// The OS device providing the named resource source.
    ///
    /// # Errors
    /// [`AcpiError::InvalidConfiguration`] when the path does not name a
    /// started ACPI device, [`AcpiError::NotReady`] when the provider
    /// exists but has not started yet.
    fn resolve(&self, source: &str) -> Result<OsDevice, AcpiError>;

    /// Base global system interrupt of the interrupt controller the
    /// provider exposes, when one is registered.
    fn interrupt_controller_base(&self, provider: OsDevice) -> Option<u64>;
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Reads an address field of 2, 4, or 8 bytes, zero-extended.
fn read_field(bytes: &[u8], offset: usize, width: usize) -> u64 {
    let mut raw = [0_u8; 8];
    raw[..width].copy_from_slice(&bytes[offset..offset + width]);
    u64::from_le_bytes(raw)
}

fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Parses a resource template into its configurations.
///
/// Each end-tag closes one configuration; a trailing run of descriptors
/// with no end-tag is discarded. Dependent-function markers are not
/// supported and are skipped with a warning.
///
/// # Errors
/// [`AcpiError::MalformedDataStream`] for truncated or unrecognized
/// descriptors and failed template checksums; provider resolution errors
/// from GPIO and simple-bus descriptors pass through.
pub fn parse_template(
    bytes: &[u8],
    providers: &dyn ProviderLookup,
) -> Result<Vec<Configuration>, AcpiError> {
    let mut configurations = Vec::new();
    let mut current = Configuration::default();
    let mut offset = 0_usize;
    while offset < bytes.len() {
        let tag = bytes[offset];
        offset += 1;
        if tag & DESCRIPTOR_LARGE == 0 {
            let length = usize::from(tag & SMALL_LENGTH_MASK);
            if bytes.len() - offset < length {
                return Err(AcpiError::MalformedDataStream);
            }
            let body = &bytes[offset..offset + length];
            match tag & SMALL_TYPE_MASK {
                SMALL_TYPE_IRQ => parse_small_irq(body, &mut current)?,
                SMALL_TYPE_DMA => current.requirements.push(parse_small_dma(body)?),
                SMALL_TYPE_START_DEPENDENT | SMALL_TYPE_END_DEPENDENT => {
                    warn!("skipping unsupported dependent-function descriptor");
                }
                SMALL_TYPE_IO => current.requirements.push(parse_small_io(body)?),
                SMALL_TYPE_FIXED_IO => current.requirements.push(parse_fixed_io(body)?),
                SMALL_TYPE_FIXED_DMA => current.requirements.push(parse_fixed_dma(body)?),
                SMALL_TYPE_VENDOR => current.requirements.push(vendor_requirement(body)),
                SMALL_TYPE_END_TAG => {
                    if length < 1 {
                        return Err(AcpiError::MalformedDataStream);
                    }

                    // The checksum covers the template from the start of
                    // the buffer through the checksum byte itself. Zero
                    // means the field is unused.
                    if body[0] != 0 && sum(&bytes[..offset + 1]) != 0 {
                        warn!("resource template checksum failed");
                        return Err(AcpiError::MalformedDataStream);
                    }
                    configurations.push(core::mem::take(&mut current));
                }
                kind => {
                    warn!("invalid small resource descriptor type {kind:#04x}");
                    return Err(AcpiError::MalformedDataStream);
                }
            }
            offset += length;
        } else {
            if bytes.len() - offset < 2 {
                return Err(AcpiError::MalformedDataStream);
            }
            let length = usize::from(read_u16(bytes, offset));
            offset += 2;
            if bytes.len() - offset < length {
                return Err(AcpiError::MalformedDataStream);
            }
            let body = &bytes[offset..offset + length];
            match tag & LARGE_TYPE_MASK {
                LARGE_TYPE_MEMORY24 => current.requirements.push(parse_memory24(body)?),
                LARGE_TYPE_GENERIC_REGISTER => {
                    current.requirements.push(parse_register_requirement(body)?);
                }
                LARGE_TYPE_VENDOR => current.requirements.push(vendor_requirement(body)),
                LARGE_TYPE_MEMORY32 => current.requirements.push(parse_memory32(body)?),
                LARGE_TYPE_FIXED_MEMORY32 => {
                    current.requirements.push(parse_fixed_memory32(body)?);
                }
                LARGE_TYPE_ADDRESS16 => {
                    current.requirements.push(parse_address_space(body, 2, false)?);
                }
                LARGE_TYPE_ADDRESS32 => {
                    current.requirements.push(parse_address_space(body, 4, false)?);
                }
                LARGE_TYPE_ADDRESS64 => {
                    current.requirements.push(parse_address_space(body, 8, false)?);
                }
                LARGE_TYPE_ADDRESS_EXTENDED => {
                    current.requirements.push(parse_address_space(body, 8, true)?);
                }
                LARGE_TYPE_IRQ => parse_large_irq(body, &mut current)?,
                LARGE_TYPE_GPIO => parse_gpio(body, providers, &mut current)?,
                LARGE_TYPE_SPB => current.requirements.push(parse_spb(body, providers)?),
                kind => {
                    warn!("invalid large resource descriptor type {kind:#04x}");
                    return Err(AcpiError::MalformedDataStream);
                }
            }
            offset += length;
        }
    }
    Ok(configurations)
}

/// Splits an interrupt mask into runs of consecutive lines: the first run
/// becomes the requirement, later runs its alternatives.
fn push_line_runs(
    config: &mut Configuration,
    runs: impl Iterator<Item = (u64, u64)>,
    characteristics: u64,
    flags: u32,
) {
    let mut requirement: Option<Requirement> = None;
    for (minimum, maximum) in runs {
        let run = Requirement {
            minimum,
            maximum,
            length: 1,
            characteristics,
            flags,
            ..Requirement::new(ResourceType::InterruptLine)
        };
        match requirement.as_mut() {
            None => requirement = Some(run),
            Some(base) => base.alternatives.push(run),
        }
    }
    if let Some(requirement) = requirement {
        config.requirements.push(requirement);
    }
}

fn parse_small_irq(body: &[u8], config: &mut Configuration) -> Result<(), AcpiError> {
    if body.len() < 2 {
        return Err(AcpiError::MalformedDataStream);
    }
    let mask = read_u16(body, 0);

    // The options byte is optional; without it the line is level
    // triggered, active high, and exclusive.
    let options = if body.len() >= 3 { body[2] } else { 0 };
    let mut characteristics = 0;
    if options & SMALL_IRQ_EDGE_TRIGGERED != 0 {
        characteristics |= INTERRUPT_LINE_EDGE_TRIGGERED;
    }
    if options & SMALL_IRQ_ACTIVE_LOW != 0 {
        characteristics |= INTERRUPT_LINE_ACTIVE_LOW;
    } else {
        characteristics |= INTERRUPT_LINE_ACTIVE_HIGH;
    }
    let mut flags = 0;
    if options & SMALL_IRQ_SHAREABLE == 0 {
        flags = RESOURCE_FLAG_NOT_SHAREABLE;
    }

    let mut runs = Vec::new();
    let mut line = 0_u64;
    loop {
        while line < 16 && mask & (1 << line) == 0 {
            line += 1;
        }
        if line == 16 {
            break;
        }
        let first = line;
        while line < 16 && mask & (1 << line) != 0 {
            line += 1;
        }
        runs.push((first, line));
    }
    push_line_runs(config, runs.into_iter(), characteristics, flags);
    Ok(())
}

fn parse_small_dma(body: &[u8]) -> Result<Requirement, AcpiError> {
    if body.len() < 2 {
        return Err(AcpiError::MalformedDataStream);
    }
    let mut mask = body[0];
    let flags = body[1];

    // A DMA descriptor offers no alternatives: the mask must be a single
    // run of set bits (or empty).
    let mut minimum = 0_u64;
    while mask != 0 && mask & 1 == 0 {
        minimum += 1;
        mask >>= 1;
    }
    let mut maximum = minimum;
    while mask & 1 != 0 {
        maximum += 1;
        mask >>= 1;
    }
    if mask != 0 {
        return Err(AcpiError::MalformedDataStream);
    }

    let mut characteristics = match flags & SMALL_DMA_SPEED_MASK {
        SMALL_DMA_SPEED_ISA => DMA_TYPE_ISA,
        SMALL_DMA_SPEED_EISA_A => DMA_TYPE_EISA_A,
        SMALL_DMA_SPEED_EISA_B => DMA_TYPE_EISA_B,
        _ => DMA_TYPE_EISA_F,
    };
    characteristics |= match flags & SMALL_DMA_SIZE_MASK {
        SMALL_DMA_SIZE_8_BIT => DMA_TRANSFER_SIZE_8,
        SMALL_DMA_SIZE_8_AND_16_BIT => DMA_TRANSFER_SIZE_8 | DMA_TRANSFER_SIZE_16,
        _ => DMA_TRANSFER_SIZE_16,
    };
    if flags & SMALL_DMA_BUS_MASTER != 0 {
        characteristics |= DMA_BUS_MASTER;
    }

    Ok(Requirement {
        minimum,
        maximum,
        length: 1,
        characteristics,
        flags: RESOURCE_FLAG_NOT_SHAREABLE,
        ..Requirement::new(ResourceType::DmaChannel)
    })
}

fn parse_small_io(body: &[u8]) -> Result<Requirement, AcpiError> {
    if body.len() < 7 {
        return Err(AcpiError::MalformedDataStream);
    }
    let minimum = u64::from(read_u16(body, 1));
    let mut maximum = u64::from(read_u16(body, 3)) + 1;
    let alignment = u64::from(body[5]);
    let length = u64::from(body[6]);
    if maximum < minimum + length {
        maximum = minimum + length;
    }
    Ok(Requirement {
        minimum,
        maximum,
        length,
        alignment,
        ..Requirement::new(ResourceType::IoPort)
    })
}

fn parse_fixed_io(body: &[u8]) -> Result<Requirement, AcpiError> {
    if body.len() < 3 {
        return Err(AcpiError::MalformedDataStream);
    }
    let minimum = u64::from(read_u16(body, 0));
    let length = u64::from(body[2]);
    Ok(Requirement {
        minimum,
        maximum: minimum + length,
        length,
        ..Requirement::new(ResourceType::IoPort)
    })
}

fn parse_fixed_dma(body: &[u8]) -> Result<Requirement, AcpiError> {
    if body.len() < 5 {
        return Err(AcpiError::MalformedDataStream);
    }
    let request_line = read_u16(body, 0);
    let channel = u64::from(read_u16(body, 2));
    let (characteristics, width) = match body[4] {
        0 => (DMA_TRANSFER_SIZE_8, 8),
        1 => (DMA_TRANSFER_SIZE_16, 16),
        2 => (DMA_TRANSFER_SIZE_32, 32),
        3 => (DMA_TRANSFER_SIZE_64, 64),
        4 => (DMA_TRANSFER_SIZE_128, 128),
        5 => (DMA_TRANSFER_SIZE_256, 256),
        _ => return Err(AcpiError::MalformedDataStream),
    };
    Ok(Requirement {
        minimum: channel,
        maximum: channel + 1,
        length: 1,
        characteristics,
        flags: RESOURCE_FLAG_NOT_SHAREABLE,
        data: Some(ResourceData::Dma(DmaData {
            request_line,
            width,
        })),
        ..Requirement::new(ResourceType::DmaChannel)
    })
}

fn vendor_requirement(body: &[u8]) -> Requirement {
    Requirement {
        data: Some(ResourceData::Vendor(body.to_vec())),
        ..Requirement::new(ResourceType::Vendor)
    }
}

fn parse_memory24(body: &[u8]) -> Result<Requirement, AcpiError> {
    if body.len() < 9 {
        return Err(AcpiError::MalformedDataStream);
    }

    // Base, bound, and length are in 256-byte blocks; alignment is in
    // bytes already. The information byte only reports writeability.
    let minimum = u64::from(read_u16(body, 1)) << 8;
    let mut maximum = (u64::from(read_u16(body, 3)) << 8) + 1;
    let alignment = u64::from(read_u16(body, 5));
    let length = u64::from(read_u16(body, 7)) << 8;
    if maximum < minimum + length {
        maximum = minimum + length;
    }
    let _writeable = body[0] & MEMORY_WRITEABLE != 0;
    Ok(Requirement {
        minimum,
        maximum,
        length,
        alignment,
        ..Requirement::new(ResourceType::PhysicalAddressSpace)
    })
}

fn parse_memory32(body: &[u8]) -> Result<Requirement, AcpiError> {
    if body.len() < 17 {
        return Err(AcpiError::MalformedDataStream);
    }
    let minimum = u64::from(read_u32(body, 1));
    let mut maximum = u64::from(read_u32(body, 5)) + 1;
    let alignment = u64::from(read_u32(body, 9));
    let length = u64::from(read_u32(body, 13));
    if maximum < minimum + length {
        maximum = minimum + length;
    }
    let _writeable = body[0] & MEMORY_WRITEABLE != 0;
    Ok(Requirement {
        minimum,
        maximum,
        length,
        alignment,
        ..Requirement::new(ResourceType::PhysicalAddressSpace)
    })
}

fn parse_fixed_memory32(body: &[u8]) -> Result<Requirement, AcpiError> {
    if body.len() < 9 {
        return Err(AcpiError::MalformedDataStream);
    }
    let minimum = u64::from(read_u32(body, 1));
    let length = u64::from(read_u32(body, 5));
    Ok(Requirement {
        minimum,
        maximum: minimum + length,
        length,
        ..Requirement::new(ResourceType::PhysicalAddressSpace)
    })
}

/// Parses one of the word, dword, qword, or extended address space
/// descriptors. All four share a layout; only the field width and the
/// trailing attributes of the extended form differ.
fn parse_address_space(
    body: &[u8],
    width: usize,
    extended: bool,
) -> Result<Requirement, AcpiError> {
    let fields = if extended { 6 } else { 5 };
    if body.len() < 3 + fields * width {
        return Err(AcpiError::MalformedDataStream);
    }
    let resource_type = match body[0] {
        GENERIC_ADDRESS_TYPE_MEMORY => ResourceType::PhysicalAddressSpace,
        GENERIC_ADDRESS_TYPE_IO => ResourceType::IoPort,
        GENERIC_ADDRESS_TYPE_BUS_NUMBER => ResourceType::BusNumber,
        _ => ResourceType::Vendor,
    };
    let general_flags = body[1];

    // The granularity field has the decoded bits set, so adding one
    // recovers the power-of-two alignment.
    let alignment = read_field(body, 3, width) + 1;
    let mut minimum = read_field(body, 3 + width, width);
    let mut maximum = read_field(body, 3 + 2 * width, width) + 1;
    let _translation = read_field(body, 3 + 3 * width, width);
    let length = read_field(body, 3 + 4 * width, width);
    if general_flags & GENERIC_ADDRESS_MINIMUM_FIXED != 0 {
        maximum = minimum + length;
    } else if general_flags & GENERIC_ADDRESS_MAXIMUM_FIXED != 0 {
        minimum = maximum.saturating_sub(length);
    }
    let characteristics = if extended {
        read_field(body, 3 + 5 * width, width)
    } else {
        0
    };
    Ok(Requirement {
        minimum,
        maximum,
        length,
        alignment,
        characteristics,
        flags: RESOURCE_FLAG_NOT_SHAREABLE,
        ..Requirement::new(resource_type)
    })
}

/// Decodes a generic register descriptor body into its address.
fn register_address(body: &[u8]) -> GenericAddress {
    GenericAddress {
        address_space_id: body[0],
        register_bit_width: body[1],
        register_bit_offset: body[2],
        access_size: body[3],
        address: read_u64(body, 4),
    }
}

fn parse_register_requirement(body: &[u8]) -> Result<Requirement, AcpiError> {
    if body.len() < 12 {
        return Err(AcpiError::MalformedDataStream);
    }
    let register = register_address(body);
    let resource_type = match register.address_space_id {
        GENERIC_ADDRESS_TYPE_MEMORY => ResourceType::PhysicalAddressSpace,
        GENERIC_ADDRESS_TYPE_IO => ResourceType::IoPort,
        _ => ResourceType::Vendor,
    };
    let alignment = if register.access_size == 0 {
        1
    } else {
        1_u64 << u32::from(register.access_size - 1).min(63)
    };
    let mut length =
        (u64::from(register.register_bit_width) + u64::from(register.register_bit_offset)) / 8;
    if length < alignment {
        length = alignment;
    }
    Ok(Requirement {
        minimum: register.address,
        maximum: register.address + length,
        length,
        alignment,
        flags: RESOURCE_FLAG_NOT_SHAREABLE,
        ..Requirement::new(resource_type)
    })
}

/// Parses a complete generic register descriptor, as found in `_CST`
/// register buffers.
///
/// # Errors
/// [`AcpiError::UnexpectedType`] when the buffer does not hold a generic
/// register descriptor, [`AcpiError::MalformedDataStream`] when it is
/// truncated.
pub fn parse_generic_register(descriptor: &[u8]) -> Result<GenericAddress, AcpiError> {
    if descriptor.len() < 3 {
        return Err(AcpiError::MalformedDataStream);
    }
    let tag = descriptor[0];
    if tag & DESCRIPTOR_LARGE == 0 || tag & LARGE_TYPE_MASK != LARGE_TYPE_GENERIC_REGISTER {
        return Err(AcpiError::UnexpectedType);
    }
    let length = usize::from(read_u16(descriptor, 1));
    if length < 12 || descriptor.len() - 3 < length {
        return Err(AcpiError::MalformedDataStream);
    }
    Ok(register_address(&descriptor[3..3 + length]))
}

fn parse_large_irq(body: &[u8], config: &mut Configuration) -> Result<(), AcpiError> {
    if body.len() < 2 {
        return Err(AcpiError::MalformedDataStream);
    }
    let options = body[0];
    let count = usize::from(body[1]);
    if body.len() < 2 + 4 * count {
        return Err(AcpiError::MalformedDataStream);
    }
    let mut characteristics = 0;
    if options & LARGE_IRQ_EDGE_TRIGGERED != 0 {
        characteristics |= INTERRUPT_LINE_EDGE_TRIGGERED;
    }
    if options & LARGE_IRQ_ACTIVE_LOW != 0 {
        characteristics |= INTERRUPT_LINE_ACTIVE_LOW;
    } else {
        characteristics |= INTERRUPT_LINE_ACTIVE_HIGH;
    }
    let mut flags = 0;
    if options & LARGE_IRQ_SHAREABLE == 0 {
        flags = RESOURCE_FLAG_NOT_SHAREABLE;
    }

    // Pack consecutively listed interrupt numbers into ranges.
    let mut runs = Vec::new();
    let mut index = 0;
    while index < count {
        let first = u64::from(read_u32(body, 2 + 4 * index));
        index += 1;
        let mut maximum = first + 1;
        while index < count && u64::from(read_u32(body, 2 + 4 * index)) == maximum {
            index += 1;
            maximum += 1;
        }
        runs.push((first, maximum));
    }
    push_line_runs(config, runs.into_iter(), characteristics, flags);
    Ok(())
}

/// Reads the NUL-terminated resource source name starting at `offset`.
fn source_name(body: &[u8], offset: usize) -> Result<&str, AcpiError> {
    if offset >= body.len() {
        return Err(AcpiError::MalformedDataStream);
    }
    let tail = &body[offset..];
    let end = tail
        .iter()
        .position(|&byte| byte == 0)
        .ok_or(AcpiError::MalformedDataStream)?;
    core::str::from_utf8(&tail[..end]).map_err(|_| AcpiError::MalformedDataStream)
}

/// Decodes the connection kind, interrupt or I/O flags, and pin pull
/// configuration into GPIO flag bits and, for interrupt connections, the
/// characteristics of the surfaced interrupt line.
fn gpio_connection_flags(
    connection: u8,
    io_flags: u16,
    pin_configuration: u8,
) -> Result<(u32, u64), AcpiError> {
    let mut flags = 0_u32;
    let mut line_characteristics = INTERRUPT_LINE_SECONDARY;
    match connection {
        GPIO_CONNECTION_INTERRUPT => {
            flags |= GPIO_INTERRUPT;
            if io_flags & GPIO_FLAG_WAKE != 0 {
                flags |= GPIO_WAKE;
                line_characteristics |= INTERRUPT_LINE_WAKE;
            }
            match io_flags & GPIO_POLARITY_MASK {
                GPIO_POLARITY_ACTIVE_HIGH => {
                    flags |= GPIO_ACTIVE_HIGH;
                    line_characteristics |= INTERRUPT_LINE_ACTIVE_HIGH;
                }
                GPIO_POLARITY_ACTIVE_LOW => {
                    flags |= GPIO_ACTIVE_LOW;
                    line_characteristics |= INTERRUPT_LINE_ACTIVE_LOW;
                }
                GPIO_POLARITY_ACTIVE_BOTH => {
                    flags |= GPIO_ACTIVE_HIGH | GPIO_ACTIVE_LOW;
                    line_characteristics |=
                        INTERRUPT_LINE_ACTIVE_HIGH | INTERRUPT_LINE_ACTIVE_LOW;
                }
                _ => {}
            }
            if io_flags & GPIO_FLAG_EDGE_TRIGGERED != 0 {
                flags |= GPIO_EDGE_TRIGGERED;
                line_characteristics |= INTERRUPT_LINE_EDGE_TRIGGERED;
            }
        }
        GPIO_CONNECTION_IO => match io_flags & GPIO_IO_RESTRICTION_MASK {
            GPIO_IO_RESTRICTION_INPUT => flags |= GPIO_INPUT,
            GPIO_IO_RESTRICTION_OUTPUT => flags |= GPIO_OUTPUT,
            _ => flags |= GPIO_INPUT | GPIO_OUTPUT,
        },
        _ => return Err(AcpiError::MalformedDataStream),
    }
    match pin_configuration {
        GPIO_PIN_PULL_UP => flags |= GPIO_PULL_UP,
        GPIO_PIN_PULL_DOWN => flags |= GPIO_PULL_DOWN,
        GPIO_PIN_PULL_NONE => flags |= GPIO_PULL_NONE,
        _ => {}
    }
    Ok((flags, line_characteristics))
}

fn parse_gpio(
    body: &[u8],
    providers: &dyn ProviderLookup,
    config: &mut Configuration,
) -> Result<(), AcpiError> {
    if body.len() < 0x14 || body[0] < 1 {
        return Err(AcpiError::MalformedDataStream);
    }
    let io_flags = read_u16(body, 4);
    let output_drive = read_u16(body, 7);
    let debounce = read_u16(body, 9);

    // Table offsets count from the descriptor tag, three bytes before
    // the body.
    let pin_table_offset = usize::from(read_u16(body, 11));
    let name_offset = usize::from(read_u16(body, 14));
    let vendor_offset = usize::from(read_u16(body, 16));
    let vendor_length = usize::from(read_u16(body, 18));
    if pin_table_offset < 3
        || name_offset < pin_table_offset
        || name_offset - 3 > body.len()
    {
        return Err(AcpiError::MalformedDataStream);
    }
    let pin_count = (name_offset - pin_table_offset) / 2;
    let pin_table = pin_table_offset - 3;

    let (flag_bits, line_characteristics) = gpio_connection_flags(body[1], io_flags, body[6])?;
    let mut data = GpioData {
        flags: flag_bits,
        ..GpioData::default()
    };
    let mut flags = 0;
    if io_flags & GPIO_FLAG_SHARED == 0 {
        flags = RESOURCE_FLAG_NOT_SHAREABLE;
    }

    // Drive strength and debounce are in hundredths of milliamps and
    // milliseconds on the wire.
    data.output_drive = if output_drive == GPIO_WIRE_SETTING_DEFAULT {
        GPIO_SETTING_DEFAULT
    } else {
        u32::from(output_drive) * 10
    };
    data.debounce_timeout = if debounce == GPIO_WIRE_SETTING_DEFAULT {
        GPIO_SETTING_DEFAULT
    } else {
        u32::from(debounce) * 10
    };
    if vendor_length != 0 {
        if vendor_offset < 3 || vendor_offset - 3 + vendor_length > body.len() {
            return Err(AcpiError::MalformedDataStream);
        }
        data.vendor
            .extend_from_slice(&body[vendor_offset - 3..vendor_offset - 3 + vendor_length]);
    }

    let name = source_name(body, name_offset - 3)?;
    let provider = providers.resolve(name)?;

    // Pack sequential pins into one requirement per streak. Interrupt
    // connections additionally surface a plain interrupt line so the
    // consumer does not have to know about GPIO.
    let mut index = 0;
    while index < pin_count {
        let first = u64::from(read_u16(body, pin_table + 2 * index));
        index += 1;
        let mut maximum = first + 1;
        while index < pin_count && u64::from(read_u16(body, pin_table + 2 * index)) == maximum {
            index += 1;
            maximum += 1;
        }
        config.requirements.push(Requirement {
            minimum: first,
            maximum,
            length: maximum - first,
            flags,
            data: Some(ResourceData::Gpio(data.clone())),
            provider: Some(provider),
            ..Requirement::new(ResourceType::Gpio)
        });
        if data.flags & GPIO_INTERRUPT != 0 {
            let Some(base) = providers.interrupt_controller_base(provider) else {
                warn!("no interrupt controller registered for GPIO provider");
                return Err(AcpiError::NotReady);
            };
            config.requirements.push(Requirement {
                minimum: base + first,
                maximum: base + maximum,
                length: maximum - first,
                characteristics: line_characteristics,
                flags,
                data: Some(ResourceData::Gpio(data.clone())),
                ..Requirement::new(ResourceType::InterruptLine)
            });
        }
    }
    Ok(())
}

fn parse_spb_i2c(
    type_flags: u16,
    revision: u8,
    data: &[u8],
) -> Result<(SpbBus, Option<u64>), AcpiError> {
    if revision < 1 || data.len() < SPB_I2C_TYPE_DATA_LENGTH {
        return Err(AcpiError::MalformedDataStream);
    }
    let slave_address = read_u16(data, 4);
    let bus = SpbBus::I2c(I2cData {
        speed_hz: read_u32(data, 0),
        slave_address,
        ten_bit_addressing: type_flags & SPB_I2C_10_BIT_ADDRESSING != 0,
    });
    Ok((bus, Some(u64::from(slave_address))))
}

fn parse_spb_spi(
    type_flags: u16,
    revision: u8,
    data: &[u8],
) -> Result<(SpbBus, Option<u64>), AcpiError> {
    if revision < 1 || data.len() < SPB_SPI_TYPE_DATA_LENGTH {
        return Err(AcpiError::MalformedDataStream);
    }

    // The select line is a mask on the wire; the line number is its bit
    // position. All zeroes means no select line is routed.
    let device_select = read_u16(data, 7);
    let address = if device_select == 0 {
        None
    } else {
        Some(u64::from(device_select.trailing_zeros()))
    };
    let bus = SpbBus::Spi(SpiData {
        speed_hz: read_u32(data, 0),
        word_size: data[4],
        phase_second: data[5] == 1,
        polarity_start_high: data[6] == 1,
        device_select,
        three_wires: type_flags & SPB_SPI_3_WIRES != 0,
        select_active_high: type_flags & SPB_SPI_SELECT_ACTIVE_HIGH != 0,
    });
    Ok((bus, address))
}

fn parse_spb_uart(type_flags: u16, revision: u8, data: &[u8]) -> Result<SpbBus, AcpiError> {
    if revision < 1 || data.len() < SPB_UART_TYPE_DATA_LENGTH {
        return Err(AcpiError::MalformedDataStream);
    }
    let flow_control = match type_flags & SPB_UART_FLOW_CONTROL_MASK {
        1 => UartFlowControl::Hardware,
        2 => UartFlowControl::Software,
        _ => UartFlowControl::None,
    };
    let stop_bits = match (type_flags & SPB_UART_STOP_BITS_MASK) >> 2 {
        0 => UartStopBits::None,
        2 => UartStopBits::OneAndHalf,
        3 => UartStopBits::Two,
        _ => UartStopBits::One,
    };
    let parity = match data[8] {
        1 => UartParity::Even,
        2 => UartParity::Odd,
        3 => UartParity::Mark,
        4 => UartParity::Space,
        _ => UartParity::None,
    };
    #[allow(clippy::cast_possible_truncation)]
    let data_bits = ((type_flags & SPB_UART_DATA_BITS_MASK) >> 4) as u8 + 5;
    Ok(SpbBus::Uart(UartData {
        baud_rate: read_u32(data, 0),
        receive_fifo: read_u16(data, 4),
        transmit_fifo: read_u16(data, 6),
        parity,
        stop_bits,
        flow_control,
        data_bits,
        big_endian: type_flags & SPB_UART_BIG_ENDIAN != 0,
        control_lines: data[9],
    }))
}

fn parse_spb(body: &[u8], providers: &dyn ProviderLookup) -> Result<Requirement, AcpiError> {
    if body.len() < 0x0F || body[0] < 1 {
        return Err(AcpiError::MalformedDataStream);
    }
    let bus_type = body[2];
    let general_flags = body[3];
    let type_flags = read_u16(body, 4);
    let type_revision = body[6];
    let type_data_length = usize::from(read_u16(body, 7));
    if body.len() < 9 + type_data_length {
        return Err(AcpiError::MalformedDataStream);
    }
    let type_data = &body[9..9 + type_data_length];

    let (bus, address, defined_length) = match bus_type {
        SPB_BUS_I2C => {
            let (bus, address) = parse_spb_i2c(type_flags, type_revision, type_data)?;
            (bus, address, SPB_I2C_TYPE_DATA_LENGTH)
        }
        SPB_BUS_SPI => {
            let (bus, address) = parse_spb_spi(type_flags, type_revision, type_data)?;
            (bus, address, SPB_SPI_TYPE_DATA_LENGTH)
        }
        SPB_BUS_UART => {
            let bus = parse_spb_uart(type_flags, type_revision, type_data)?;
            (bus, None, SPB_UART_TYPE_DATA_LENGTH)
        }
        _ => return Err(AcpiError::MalformedDataStream),
    };

    let name = source_name(body, 9 + type_data_length)?;
    let provider = providers.resolve(name)?;

    let data = SpbData {
        slave: general_flags & SPB_FLAG_SLAVE != 0,
        bus,
        vendor: type_data[defined_length..].to_vec(),
    };
    let (minimum, maximum, length) = match address {
        Some(address) => (address, address + 1, 1),
        None => (0, 0, 0),
    };
    Ok(Requirement {
        minimum,
        maximum,
        length,
        data: Some(ResourceData::SimpleBus(data)),
        provider: Some(provider),
        ..Requirement::new(ResourceType::SimpleBus)
    })
}

/// Rebuilds the wire flag byte of a small DMA descriptor from the
/// allocation's characteristics.
fn dma_wire_flags(characteristics: u64) -> u8 {
    let mut wire = if characteristics & DMA_TYPE_EISA_A != 0 {
        SMALL_DMA_SPEED_EISA_A
    } else if characteristics & DMA_TYPE_EISA_B != 0 {
        SMALL_DMA_SPEED_EISA_B
    } else if characteristics & DMA_TYPE_EISA_F != 0 {
        SMALL_DMA_SPEED_MASK
    } else {
        SMALL_DMA_SPEED_ISA
    };
    if characteristics & DMA_BUS_MASTER != 0 {
        wire |= SMALL_DMA_BUS_MASTER;
    }
    if characteristics & DMA_TRANSFER_SIZE_8 != 0 {
        if characteristics & DMA_TRANSFER_SIZE_16 != 0 {
            wire |= SMALL_DMA_SIZE_8_AND_16_BIT;
        } else {
            wire |= SMALL_DMA_SIZE_8_BIT;
        }
    } else if characteristics & DMA_TRANSFER_SIZE_16 != 0 {
        wire |= SMALL_DMA_SIZE_16_BIT;
    }
    wire
}

/// Rewrites one small descriptor in place. Returns `true` when the
/// descriptor consumed no allocation and the current one carries over to
/// the next descriptor.
fn emit_small(
    buffer: &mut [u8],
    offset: usize,
    tag: u8,
    length: usize,
    current: Option<&Allocation>,
) -> Result<bool, AcpiError> {
    match tag & SMALL_TYPE_MASK {
        SMALL_TYPE_IRQ => {
            if length < 2 {
                return Err(AcpiError::MalformedDataStream);
            }
            let allocation = current.ok_or(AcpiError::ConversionFailed)?;
            if allocation.resource_type != ResourceType::InterruptLine {
                return Err(AcpiError::UnexpectedType);
            }
            let line = u16::try_from(allocation.base).map_err(|_| AcpiError::ConversionFailed)?;
            if line >= 16 {
                return Err(AcpiError::ConversionFailed);
            }
            write_u16(buffer, offset, 1 << line);
        }
        SMALL_TYPE_DMA => {
            if length < 2 {
                return Err(AcpiError::MalformedDataStream);
            }
            let allocation = current.ok_or(AcpiError::ConversionFailed)?;
            let channel = u8::try_from(allocation.base).map_err(|_| AcpiError::ConversionFailed)?;
            if channel >= 8 {
                return Err(AcpiError::ConversionFailed);
            }
            buffer[offset] = 1 << channel;
            buffer[offset + 1] = dma_wire_flags(allocation.characteristics);
        }
        SMALL_TYPE_IO => {
            if length < 7 {
                return Err(AcpiError::MalformedDataStream);
            }
            match current {
                Some(allocation) if allocation.resource_type == ResourceType::IoPort => {
                    let base =
                        u16::try_from(allocation.base).map_err(|_| AcpiError::ConversionFailed)?;
                    write_u16(buffer, offset + 1, base);
                }
                // A zero-length port descriptor consumes nothing.
                _ if buffer[offset + 6] == 0 => return Ok(true),
                _ => return Err(AcpiError::UnexpectedType),
            }
        }
        SMALL_TYPE_FIXED_IO => {
            if length < 3 {
                return Err(AcpiError::MalformedDataStream);
            }
            match current {
                Some(allocation) if allocation.resource_type == ResourceType::IoPort => {}
                _ if buffer[offset + 2] == 0 => return Ok(true),
                _ => return Err(AcpiError::UnexpectedType),
            }
        }
        SMALL_TYPE_END_TAG => {
            if length < 1 {
                return Err(AcpiError::MalformedDataStream);
            }
            buffer[offset] = 0;
        }
        // Nothing to rewrite; the matching allocation slot still
        // passes by.
        SMALL_TYPE_START_DEPENDENT
        | SMALL_TYPE_END_DEPENDENT
        | SMALL_TYPE_FIXED_DMA
        | SMALL_TYPE_VENDOR => {}
        kind => {
            warn!("invalid small resource descriptor type {kind:#04x}");
            return Err(AcpiError::MalformedDataStream);
        }
    }
    Ok(false)
}

/// Rewrites one large descriptor in place.
fn emit_large(
    buffer: &mut [u8],
    offset: usize,
    tag: u8,
    length: usize,
    current: Option<&Allocation>,
) -> Result<(), AcpiError> {
    match tag & LARGE_TYPE_MASK {
        LARGE_TYPE_IRQ => {
            if length < 6 {
                return Err(AcpiError::MalformedDataStream);
            }
            let allocation = current.ok_or(AcpiError::ConversionFailed)?;
            if allocation.resource_type != ResourceType::InterruptLine {
                return Err(AcpiError::UnexpectedType);
            }
            let line = u32::try_from(allocation.base).map_err(|_| AcpiError::ConversionFailed)?;
            write_u32(buffer, offset + 2, line);
        }
        LARGE_TYPE_MEMORY24
        | LARGE_TYPE_GENERIC_REGISTER
        | LARGE_TYPE_VENDOR
        | LARGE_TYPE_MEMORY32
        | LARGE_TYPE_FIXED_MEMORY32
        | LARGE_TYPE_ADDRESS16
        | LARGE_TYPE_ADDRESS32
        | LARGE_TYPE_ADDRESS64
        | LARGE_TYPE_ADDRESS_EXTENDED => {}
        // Connection descriptors name a fixed provider pin; there is no
        // field an allocation could move.
        LARGE_TYPE_GPIO | LARGE_TYPE_SPB => {
            warn!("cannot rewrite a connection descriptor");
            return Err(AcpiError::ConversionFailed);
        }
        kind => {
            warn!("invalid large resource descriptor type {kind:#04x}");
            return Err(AcpiError::MalformedDataStream);
        }
    }
    Ok(())
}

/// Rewrites a `_CRS` template so it describes the given allocations,
/// producing the buffer to pass to `_SRS`.
///
/// Descriptors and allocations walk in lock step. Only the bytes naming
/// the assigned resource change: interrupt masks, DMA masks and flags,
/// I/O port bases, and the first interrupt number of an extended
/// interrupt descriptor. The end-tag checksum is zeroed. An I/O
/// descriptor with a zero length may soak up no allocation, letting the
/// walk stay aligned on templates that pad with empty descriptors.
///
/// # Errors
/// [`AcpiError::UnexpectedType`] when an allocation's type does not match
/// its descriptor, [`AcpiError::ConversionFailed`] when an allocation is
/// missing, out of range for the descriptor field, or aimed at a
/// connection descriptor, [`AcpiError::MalformedDataStream`] for
/// unrecognized descriptors.
pub fn emit_allocations(
    template: &[u8],
    allocations: &[Allocation],
) -> Result<Vec<u8>, AcpiError> {
    let mut buffer = template.to_vec();
    let mut cursor = allocations.iter();
    let mut current: Option<&Allocation> = None;
    let mut stay = false;
    let mut offset = 0_usize;
    while offset < buffer.len() {
        if !stay {
            current = cursor.next();
        }
        let tag = buffer[offset];
        offset += 1;
        if tag & DESCRIPTOR_LARGE == 0 {
            let length = usize::from(tag & SMALL_LENGTH_MASK);
            if buffer.len() - offset < length {
                return Err(AcpiError::MalformedDataStream);
            }
            stay = emit_small(&mut buffer, offset, tag, length, current)?;
            offset += length;
        } else {
            if buffer.len() - offset < 2 {
                return Err(AcpiError::MalformedDataStream);
            }
            let length = usize::from(read_u16(&buffer, offset));
            offset += 2;
            if buffer.len() - offset < length {
                return Err(AcpiError::MalformedDataStream);
            }
            emit_large(&mut buffer, offset, tag, length, current)?;
            stay = false;
            offset += length;
        }
    }
    debug!("emitted {} byte resource buffer", buffer.len());
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::boot_allocations;
    use alloc::collections::BTreeMap;
    use alloc::string::String;
    use alloc::vec;

    /// Scripted provider lookup keyed by source name.
    #[derive(Default)]
    struct Providers {
        devices: BTreeMap<String, OsDevice>,
        controllers: BTreeMap<u64, u64>,
        not_ready: bool,
    }

    impl ProviderLookup for Providers {
        fn resolve(&self, source: &str) -> Result<OsDevice, AcpiError> {
            if self.not_ready {
                return Err(AcpiError::NotReady);
            }
            self.devices
                .get(source)
                .copied()
                .ok_or(AcpiError::InvalidConfiguration)
        }

        fn interrupt_controller_base(&self, provider: OsDevice) -> Option<u64> {
            self.controllers.get(&provider.0).copied()
        }
    }

    fn no_providers() -> Providers {
        Providers::default()
    }

    fn end_tag() -> [u8; 2] {
        [SMALL_TYPE_END_TAG | 1, 0]
    }

    fn large_header(kind: u8, length: u16) -> [u8; 3] {
        let length = length.to_le_bytes();
        [DESCRIPTOR_LARGE | kind, length[0], length[1]]
    }

    fn single_config(bytes: &[u8]) -> Configuration {
        let mut configurations = parse_template(bytes, &no_providers()).expect("parse");
        assert_eq!(configurations.len(), 1);
        configurations.remove(0)
    }

    #[test]
    fn small_irq_runs_become_alternatives() {
        // Lines 5, 10, and 11; edge triggered, active low, shareable.
        let mask: u16 = (1 << 5) | (1 << 10) | (1 << 11);
        let mut template = vec![SMALL_TYPE_IRQ | 3];
        template.extend_from_slice(&mask.to_le_bytes());
        template.push(SMALL_IRQ_EDGE_TRIGGERED | SMALL_IRQ_ACTIVE_LOW | SMALL_IRQ_SHAREABLE);
        template.extend_from_slice(&end_tag());

        let config = single_config(&template);
        assert_eq!(config.requirements.len(), 1);
        let requirement = &config.requirements[0];
        assert_eq!(requirement.minimum, 5);
        assert_eq!(requirement.maximum, 6);
        assert_eq!(requirement.length, 1);
        assert_eq!(
            requirement.characteristics,
            INTERRUPT_LINE_EDGE_TRIGGERED | INTERRUPT_LINE_ACTIVE_LOW
        );
        assert_eq!(requirement.flags, 0);
        assert_eq!(requirement.alternatives.len(), 1);
        assert_eq!(requirement.alternatives[0].minimum, 10);
        assert_eq!(requirement.alternatives[0].maximum, 12);
    }

    #[test]
    fn small_irq_without_options_is_level_high_exclusive() {
        let mask: u16 = 1 << 4;
        let mut template = vec![SMALL_TYPE_IRQ | 2];
        template.extend_from_slice(&mask.to_le_bytes());
        template.extend_from_slice(&end_tag());

        let config = single_config(&template);
        let requirement = &config.requirements[0];
        assert_eq!(requirement.characteristics, INTERRUPT_LINE_ACTIVE_HIGH);
        assert_eq!(requirement.flags, RESOURCE_FLAG_NOT_SHAREABLE);
    }

    #[test]
    fn small_dma_rejects_split_mask() {
        let template = [SMALL_TYPE_DMA | 2, 0b0000_0101, 0, end_tag()[0], 0];
        assert_eq!(
            parse_template(&template, &no_providers()),
            Err(AcpiError::MalformedDataStream)
        );
    }

    #[test]
    fn small_dma_decodes_flags() {
        let flags = SMALL_DMA_SPEED_EISA_B | SMALL_DMA_BUS_MASTER | SMALL_DMA_SIZE_8_AND_16_BIT;
        let mut template = vec![SMALL_TYPE_DMA | 2, 0b0001_1000, flags];
        template.extend_from_slice(&end_tag());

        let config = single_config(&template);
        let requirement = &config.requirements[0];
        assert_eq!(requirement.resource_type, ResourceType::DmaChannel);
        assert_eq!(requirement.minimum, 3);
        assert_eq!(requirement.maximum, 5);
        assert_eq!(
            requirement.characteristics,
            DMA_TYPE_EISA_B | DMA_BUS_MASTER | DMA_TRANSFER_SIZE_8 | DMA_TRANSFER_SIZE_16
        );
    }

    #[test]
    fn small_io_clamps_maximum() {
        // Base range 0x3F8..=0x3F8 with 8 ports forces the bound up.
        let mut template = vec![SMALL_TYPE_IO | 7, 0x01];
        template.extend_from_slice(&0x03F8_u16.to_le_bytes());
        template.extend_from_slice(&0x03F8_u16.to_le_bytes());
        template.push(1);
        template.push(8);
        template.extend_from_slice(&end_tag());

        let config = single_config(&template);
        let requirement = &config.requirements[0];
        assert_eq!(requirement.resource_type, ResourceType::IoPort);
        assert_eq!(requirement.minimum, 0x3F8);
        assert_eq!(requirement.maximum, 0x400);
        assert_eq!(requirement.length, 8);
        assert_eq!(requirement.alignment, 1);
    }

    #[test]
    fn fixed_dma_carries_request_line() {
        let mut template = vec![SMALL_TYPE_FIXED_DMA | 5];
        template.extend_from_slice(&7_u16.to_le_bytes());
        template.extend_from_slice(&3_u16.to_le_bytes());
        template.push(2);
        template.extend_from_slice(&end_tag());

        let config = single_config(&template);
        let requirement = &config.requirements[0];
        assert_eq!(requirement.minimum, 3);
        assert_eq!(requirement.maximum, 4);
        assert_eq!(requirement.characteristics, DMA_TRANSFER_SIZE_32);
        assert_eq!(
            requirement.data,
            Some(ResourceData::Dma(DmaData {
                request_line: 7,
                width: 32,
            }))
        );
    }

    #[test]
    fn memory32_and_fixed_memory32() {
        let mut template = large_header(LARGE_TYPE_MEMORY32, 17).to_vec();
        template.push(MEMORY_WRITEABLE);
        template.extend_from_slice(&0x8000_0000_u32.to_le_bytes());
        template.extend_from_slice(&0x8000_0000_u32.to_le_bytes());
        template.extend_from_slice(&0x1000_u32.to_le_bytes());
        template.extend_from_slice(&0x2000_u32.to_le_bytes());
        template.extend_from_slice(&large_header(LARGE_TYPE_FIXED_MEMORY32, 9));
        template.push(0);
        template.extend_from_slice(&0xFED0_0000_u32.to_le_bytes());
        template.extend_from_slice(&0x400_u32.to_le_bytes());
        template.extend_from_slice(&end_tag());

        let config = single_config(&template);
        assert_eq!(config.requirements.len(), 2);
        assert_eq!(config.requirements[0].minimum, 0x8000_0000);
        assert_eq!(config.requirements[0].maximum, 0x8000_2000);
        assert_eq!(config.requirements[0].alignment, 0x1000);
        assert_eq!(config.requirements[1].minimum, 0xFED0_0000);
        assert_eq!(config.requirements[1].maximum, 0xFED0_0400);
        assert_eq!(config.requirements[1].alignment, 1);
    }

    #[test]
    fn address_space_minimum_fixed() {
        // Dword address space: granularity 0xFFF, fixed minimum.
        let mut template = large_header(LARGE_TYPE_ADDRESS32, 23).to_vec();
        template.push(GENERIC_ADDRESS_TYPE_MEMORY);
        template.push(GENERIC_ADDRESS_MINIMUM_FIXED);
        template.push(0);
        template.extend_from_slice(&0xFFF_u32.to_le_bytes());
        template.extend_from_slice(&0xA000_0000_u32.to_le_bytes());
        template.extend_from_slice(&0xBFFF_FFFF_u32.to_le_bytes());
        template.extend_from_slice(&0_u32.to_le_bytes());
        template.extend_from_slice(&0x1000_u32.to_le_bytes());
        template.extend_from_slice(&end_tag());

        let config = single_config(&template);
        let requirement = &config.requirements[0];
        assert_eq!(requirement.resource_type, ResourceType::PhysicalAddressSpace);
        assert_eq!(requirement.alignment, 0x1000);
        assert_eq!(requirement.minimum, 0xA000_0000);
        assert_eq!(requirement.maximum, 0xA000_1000);
        assert_eq!(requirement.flags, RESOURCE_FLAG_NOT_SHAREABLE);
    }

    #[test]
    fn bus_number_address_space() {
        let mut template = large_header(LARGE_TYPE_ADDRESS16, 13).to_vec();
        template.push(GENERIC_ADDRESS_TYPE_BUS_NUMBER);
        template.push(0);
        template.push(0);
        template.extend_from_slice(&0_u16.to_le_bytes());
        template.extend_from_slice(&0_u16.to_le_bytes());
        template.extend_from_slice(&0xFF_u16.to_le_bytes());
        template.extend_from_slice(&0_u16.to_le_bytes());
        template.extend_from_slice(&0x100_u16.to_le_bytes());
        template.extend_from_slice(&end_tag());

        let config = single_config(&template);
        assert_eq!(config.requirements[0].resource_type, ResourceType::BusNumber);
        assert_eq!(config.requirements[0].minimum, 0);
        assert_eq!(config.requirements[0].maximum, 0x100);
    }

    #[test]
    fn large_irq_packs_consecutive_lines() {
        let mut template = large_header(LARGE_TYPE_IRQ, 2 + 4 * 3).to_vec();
        template.push(LARGE_IRQ_SHAREABLE);
        template.push(3);
        template.extend_from_slice(&16_u32.to_le_bytes());
        template.extend_from_slice(&17_u32.to_le_bytes());
        template.extend_from_slice(&40_u32.to_le_bytes());
        template.extend_from_slice(&end_tag());

        let config = single_config(&template);
        assert_eq!(config.requirements.len(), 1);
        let requirement = &config.requirements[0];
        assert_eq!(requirement.minimum, 16);
        assert_eq!(requirement.maximum, 18);
        assert_eq!(requirement.characteristics, INTERRUPT_LINE_ACTIVE_HIGH);
        assert_eq!(requirement.flags, 0);
        assert_eq!(requirement.alternatives.len(), 1);
        assert_eq!(requirement.alternatives[0].minimum, 40);
    }

    #[test]
    fn end_tag_checksum_verified_when_present() {
        // A bad non-zero checksum byte must fail the parse.
        let mut template = vec![SMALL_TYPE_FIXED_IO | 3];
        template.extend_from_slice(&0x60_u16.to_le_bytes());
        template.push(1);
        template.push(SMALL_TYPE_END_TAG | 1);
        template.push(0xAA);
        assert_eq!(
            parse_template(&template, &no_providers()),
            Err(AcpiError::MalformedDataStream)
        );

        // Fix the checksum so the whole template sums to zero.
        let fixed_len = template.len();
        let partial = sum(&template[..fixed_len - 1]);
        template[fixed_len - 1] = partial.wrapping_neg();
        assert!(parse_template(&template, &no_providers()).is_ok());
    }

    #[test]
    fn unterminated_trailing_configuration_is_dropped() {
        let mut template = vec![SMALL_TYPE_FIXED_IO | 3];
        template.extend_from_slice(&0x60_u16.to_le_bytes());
        template.push(1);
        template.extend_from_slice(&end_tag());

        // A second descriptor with no end tag behind it.
        template.push(SMALL_TYPE_FIXED_IO | 3);
        template.extend_from_slice(&0x64_u16.to_le_bytes());
        template.push(1);

        let configurations = parse_template(&template, &no_providers()).expect("parse");
        assert_eq!(configurations.len(), 1);
        assert_eq!(configurations[0].requirements.len(), 1);
    }

    #[test]
    fn truncated_descriptor_is_malformed() {
        let template = [SMALL_TYPE_IO | 7, 0x01, 0xF8];
        assert_eq!(
            parse_template(&template, &no_providers()),
            Err(AcpiError::MalformedDataStream)
        );
    }

    fn gpio_interrupt_template(pins: &[u16], io_flags: u16) -> Vec<u8> {
        let pin_table_offset = 23_u16;
        let name_offset = pin_table_offset + 2 * u16::try_from(pins.len()).unwrap();
        let body_len = name_offset - 3 + 5;
        let mut template = large_header(LARGE_TYPE_GPIO, body_len).to_vec();
        template.push(1);
        template.push(GPIO_CONNECTION_INTERRUPT);
        template.extend_from_slice(&0_u16.to_le_bytes());
        template.extend_from_slice(&io_flags.to_le_bytes());
        template.push(0);
        template.extend_from_slice(&GPIO_WIRE_SETTING_DEFAULT.to_le_bytes());
        template.extend_from_slice(&GPIO_WIRE_SETTING_DEFAULT.to_le_bytes());
        template.extend_from_slice(&pin_table_offset.to_le_bytes());
        template.push(0);
        template.extend_from_slice(&name_offset.to_le_bytes());
        template.extend_from_slice(&0_u16.to_le_bytes());
        template.extend_from_slice(&0_u16.to_le_bytes());
        for pin in pins {
            template.extend_from_slice(&pin.to_le_bytes());
        }
        template.extend_from_slice(b"GPI0\0");
        template.extend_from_slice(&end_tag());
        template
    }

    #[test]
    fn gpio_interrupt_surfaces_secondary_line() {
        let template = gpio_interrupt_template(
            &[4],
            GPIO_POLARITY_ACTIVE_LOW | GPIO_FLAG_EDGE_TRIGGERED | GPIO_FLAG_SHARED,
        );
        let mut providers = no_providers();
        providers.devices.insert(String::from("GPI0"), OsDevice(9));
        providers.controllers.insert(9, 100);

        let configurations = parse_template(&template, &providers).expect("parse");
        let config = &configurations[0];
        assert_eq!(config.requirements.len(), 2);

        let gpio = &config.requirements[0];
        assert_eq!(gpio.resource_type, ResourceType::Gpio);
        assert_eq!(gpio.minimum, 4);
        assert_eq!(gpio.maximum, 5);
        assert_eq!(gpio.length, 1);
        assert_eq!(gpio.provider, Some(OsDevice(9)));
        let Some(ResourceData::Gpio(data)) = &gpio.data else {
            panic!("missing GPIO data");
        };
        assert_eq!(
            data.flags,
            GPIO_INTERRUPT | GPIO_ACTIVE_LOW | GPIO_EDGE_TRIGGERED
        );
        assert_eq!(data.output_drive, GPIO_SETTING_DEFAULT);

        let line = &config.requirements[1];
        assert_eq!(line.resource_type, ResourceType::InterruptLine);
        assert_eq!(line.minimum, 104);
        assert_eq!(line.maximum, 105);
        assert_eq!(
            line.characteristics,
            INTERRUPT_LINE_SECONDARY
                | INTERRUPT_LINE_ACTIVE_LOW
                | INTERRUPT_LINE_EDGE_TRIGGERED
        );
        assert_eq!(line.provider, None);
    }

    #[test]
    fn gpio_without_interrupt_controller_is_not_ready() {
        let template = gpio_interrupt_template(&[2], GPIO_FLAG_SHARED);
        let mut providers = no_providers();
        providers.devices.insert(String::from("GPI0"), OsDevice(9));

        assert_eq!(
            parse_template(&template, &providers),
            Err(AcpiError::NotReady)
        );
    }

    #[test]
    fn gpio_unknown_provider_is_invalid_configuration() {
        let template = gpio_interrupt_template(&[2], GPIO_FLAG_SHARED);
        assert_eq!(
            parse_template(&template, &no_providers()),
            Err(AcpiError::InvalidConfiguration)
        );
    }

    #[test]
    fn gpio_streaks_split_into_requirement_pairs() {
        let template = gpio_interrupt_template(&[3, 4, 5, 9], GPIO_FLAG_SHARED);
        let mut providers = no_providers();
        providers.devices.insert(String::from("GPI0"), OsDevice(2));
        providers.controllers.insert(2, 32);

        let configurations = parse_template(&template, &providers).expect("parse");
        let requirements = &configurations[0].requirements;
        assert_eq!(requirements.len(), 4);
        assert_eq!(requirements[0].minimum, 3);
        assert_eq!(requirements[0].maximum, 6);
        assert_eq!(requirements[0].length, 3);
        assert_eq!(requirements[1].minimum, 35);
        assert_eq!(requirements[1].maximum, 38);
        assert_eq!(requirements[2].minimum, 9);
        assert_eq!(requirements[3].minimum, 41);
    }

    fn i2c_template(slave: u16, vendor: &[u8]) -> Vec<u8> {
        let type_data_length = u16::try_from(SPB_I2C_TYPE_DATA_LENGTH + vendor.len()).unwrap();
        let body_len = 9 + type_data_length + 5;
        let mut template = large_header(LARGE_TYPE_SPB, body_len).to_vec();
        template.push(1);
        template.push(0);
        template.push(SPB_BUS_I2C);
        template.push(SPB_FLAG_SLAVE);
        template.extend_from_slice(&SPB_I2C_10_BIT_ADDRESSING.to_le_bytes());
        template.push(1);
        template.extend_from_slice(&type_data_length.to_le_bytes());
        template.extend_from_slice(&400_000_u32.to_le_bytes());
        template.extend_from_slice(&slave.to_le_bytes());
        template.extend_from_slice(vendor);
        template.extend_from_slice(b"I2C0\0");
        template.extend_from_slice(&end_tag());
        template
    }

    #[test]
    fn spb_i2c_requirement() {
        let template = i2c_template(0x5A, &[0xDE, 0xAD]);
        let mut providers = no_providers();
        providers.devices.insert(String::from("I2C0"), OsDevice(4));

        let configurations = parse_template(&template, &providers).expect("parse");
        let requirement = &configurations[0].requirements[0];
        assert_eq!(requirement.resource_type, ResourceType::SimpleBus);
        assert_eq!(requirement.minimum, 0x5A);
        assert_eq!(requirement.maximum, 0x5B);
        assert_eq!(requirement.length, 1);
        assert_eq!(requirement.provider, Some(OsDevice(4)));
        let Some(ResourceData::SimpleBus(data)) = &requirement.data else {
            panic!("missing SPB data");
        };
        assert!(data.slave);
        assert_eq!(data.vendor, vec![0xDE, 0xAD]);
        let SpbBus::I2c(i2c) = data.bus else {
            panic!("wrong bus type");
        };
        assert_eq!(i2c.speed_hz, 400_000);
        assert_eq!(i2c.slave_address, 0x5A);
        assert!(i2c.ten_bit_addressing);
    }

    #[test]
    fn spb_provider_not_started_is_not_ready() {
        let template = i2c_template(0x10, &[]);
        let mut providers = no_providers();
        providers.not_ready = true;
        assert_eq!(
            parse_template(&template, &providers),
            Err(AcpiError::NotReady)
        );
    }

    #[test]
    fn generic_register_descriptor_round_trip() {
        let mut descriptor = large_header(LARGE_TYPE_GENERIC_REGISTER, 12).to_vec();
        descriptor.push(1);
        descriptor.push(8);
        descriptor.push(0);
        descriptor.push(1);
        descriptor.extend_from_slice(&0x414_u64.to_le_bytes());

        let register = parse_generic_register(&descriptor).expect("parse");
        assert_eq!(register.address_space_id, 1);
        assert_eq!(register.register_bit_width, 8);
        assert_eq!(register.access_size, 1);
        let address = register.address;
        assert_eq!(address, 0x414);

        descriptor[0] = DESCRIPTOR_LARGE | LARGE_TYPE_MEMORY32;
        assert_eq!(
            parse_generic_register(&descriptor),
            Err(AcpiError::UnexpectedType)
        );
    }

    /// Builds the serial-port style template used by the emit tests:
    /// IRQ 4, DMA 1, port 0x3F8, end tag.
    fn serial_template() -> Vec<u8> {
        let mut template = vec![SMALL_TYPE_IRQ | 3];
        template.extend_from_slice(&(1_u16 << 4).to_le_bytes());
        template.push(SMALL_IRQ_EDGE_TRIGGERED);
        template.push(SMALL_TYPE_DMA | 2);
        template.push(1 << 1);
        template.push(SMALL_DMA_BUS_MASTER);
        template.push(SMALL_TYPE_IO | 7);
        template.push(0x01);
        template.extend_from_slice(&0x03F8_u16.to_le_bytes());
        template.extend_from_slice(&0x03F8_u16.to_le_bytes());
        template.push(1);
        template.push(8);
        template.extend_from_slice(&end_tag());
        template
    }

    #[test]
    fn emit_round_trip_rewrites_only_assigned_fields() {
        let template = serial_template();
        let configurations = parse_template(&template, &no_providers()).expect("parse");
        let allocations = boot_allocations(&configurations);
        let emitted = emit_allocations(&template, &allocations).expect("emit");

        // Allocations equal the template's own settings, so the buffer
        // must come back byte-identical.
        assert_eq!(emitted, template);
    }

    #[test]
    fn emit_moves_interrupt_line() {
        let template = serial_template();
        let configurations = parse_template(&template, &no_providers()).expect("parse");
        let mut allocations = boot_allocations(&configurations);
        allocations[0].base = 7;

        let emitted = emit_allocations(&template, &allocations).expect("emit");
        assert_eq!(read_u16(&emitted, 1), 1 << 7);
        assert_eq!(&emitted[3..], &template[3..]);
    }

    #[test]
    fn emit_type_mismatch_is_unexpected_type() {
        let template = serial_template();
        let configurations = parse_template(&template, &no_providers()).expect("parse");
        let mut allocations = boot_allocations(&configurations);
        allocations[0].resource_type = ResourceType::DmaChannel;

        assert_eq!(
            emit_allocations(&template, &allocations),
            Err(AcpiError::UnexpectedType)
        );
    }

    #[test]
    fn emit_zero_length_port_descriptor_soaks_no_allocation() {
        // Template: empty IO descriptor, then an IRQ descriptor. The
        // only allocation is the interrupt line.
        let mut template = vec![SMALL_TYPE_IO | 7, 0x01];
        template.extend_from_slice(&0_u16.to_le_bytes());
        template.extend_from_slice(&0_u16.to_le_bytes());
        template.push(0);
        template.push(0);
        template.push(SMALL_TYPE_IRQ | 2);
        template.extend_from_slice(&(1_u16 << 3).to_le_bytes());
        template.extend_from_slice(&end_tag());

        let allocations = [Allocation {
            resource_type: ResourceType::InterruptLine,
            base: 5,
            length: 1,
            characteristics: 0,
            flags: 0,
            data: None,
            provider: None,
        }];
        let emitted = emit_allocations(&template, &allocations).expect("emit");
        assert_eq!(read_u16(&emitted, 9), 1 << 5);
    }

    #[test]
    fn emit_rewrites_extended_interrupt() {
        let mut template = large_header(LARGE_TYPE_IRQ, 6).to_vec();
        template.push(LARGE_IRQ_SHAREABLE);
        template.push(1);
        template.extend_from_slice(&16_u32.to_le_bytes());
        template.extend_from_slice(&end_tag());

        let allocations = [Allocation {
            resource_type: ResourceType::InterruptLine,
            base: 42,
            length: 1,
            characteristics: 0,
            flags: 0,
            data: None,
            provider: None,
        }];
        let emitted = emit_allocations(&template, &allocations).expect("emit");
        assert_eq!(read_u32(&emitted, 5), 42);
    }

    #[test]
    fn emit_missing_allocation_fails_conversion() {
        let template = serial_template();
        assert_eq!(
            emit_allocations(&template, &[]),
            Err(AcpiError::ConversionFailed)
        );
    }
}
