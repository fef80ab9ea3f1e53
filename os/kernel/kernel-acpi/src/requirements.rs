//! # Resource Requirements and Allocations
//!
//! The OS-facing half of resource description: bus-relative requirement
//! lists handed up during resource queries, and the allocations the OS
//! hands back when it starts a device. The wire format lives in
//! [`crate::resdesc`]; this module is the data model it parses into.
//!
//! A requirement describes a half-open range `[minimum, maximum)` of some
//! resource type together with length, alignment, and type-specific
//! characteristics. Alternatives chain equivalent choices (a device that
//! accepts IRQ 5 or IRQ 7 reports one requirement with one alternative).

use alloc::vec::Vec;

use crate::device::OsDevice;

/// The requirement cannot be shared with another device.
pub const RESOURCE_FLAG_NOT_SHAREABLE: u32 = 0x0000_0001;

/// The allocation was assigned by firmware before the OS took over.
pub const RESOURCE_FLAG_BOOT: u32 = 0x0000_0002;

/// Interrupt line characteristic: edge triggered rather than level.
pub const INTERRUPT_LINE_EDGE_TRIGGERED: u64 = 0x0000_0001;
/// Interrupt line characteristic: active low.
pub const INTERRUPT_LINE_ACTIVE_LOW: u64 = 0x0000_0002;
/// Interrupt line characteristic: active high.
pub const INTERRUPT_LINE_ACTIVE_HIGH: u64 = 0x0000_0004;
/// Interrupt line characteristic: wake capable.
pub const INTERRUPT_LINE_WAKE: u64 = 0x0000_0008;
/// Interrupt line characteristic: debounced by the controller.
pub const INTERRUPT_LINE_DEBOUNCE: u64 = 0x0000_0010;
/// Interrupt line characteristic: secondary line derived from another
/// resource (a GPIO interrupt pin, for example).
pub const INTERRUPT_LINE_SECONDARY: u64 = 0x0000_0020;

/// DMA characteristic: ISA-compatible transfers.
pub const DMA_TYPE_ISA: u64 = 0x0000_0001;
/// DMA characteristic: EISA type A transfers.
pub const DMA_TYPE_EISA_A: u64 = 0x0000_0002;
/// DMA characteristic: EISA type B transfers.
pub const DMA_TYPE_EISA_B: u64 = 0x0000_0004;
/// DMA characteristic: EISA type F transfers.
pub const DMA_TYPE_EISA_F: u64 = 0x0000_0008;
/// DMA characteristic: the device can master the bus.
pub const DMA_BUS_MASTER: u64 = 0x0000_0010;
/// DMA characteristic: 8-bit transfers supported.
pub const DMA_TRANSFER_SIZE_8: u64 = 0x0000_0020;
/// DMA characteristic: 16-bit transfers supported.
pub const DMA_TRANSFER_SIZE_16: u64 = 0x0000_0040;
/// DMA characteristic: 32-bit transfers supported.
pub const DMA_TRANSFER_SIZE_32: u64 = 0x0000_0080;
/// DMA characteristic: 64-bit transfers supported.
pub const DMA_TRANSFER_SIZE_64: u64 = 0x0000_0100;
/// DMA characteristic: 128-bit transfers supported.
pub const DMA_TRANSFER_SIZE_128: u64 = 0x0000_0200;
/// DMA characteristic: 256-bit transfers supported.
pub const DMA_TRANSFER_SIZE_256: u64 = 0x0000_0400;

/// GPIO flag: the pins signal an interrupt.
pub const GPIO_INTERRUPT: u32 = 0x0000_0001;
/// GPIO flag: the pins are inputs.
pub const GPIO_INPUT: u32 = 0x0000_0002;
/// GPIO flag: the pins are outputs.
pub const GPIO_OUTPUT: u32 = 0x0000_0004;
/// GPIO flag: the pins can wake the system.
pub const GPIO_WAKE: u32 = 0x0000_0008;
/// GPIO flag: active high polarity.
pub const GPIO_ACTIVE_HIGH: u32 = 0x0000_0010;
/// GPIO flag: active low polarity.
pub const GPIO_ACTIVE_LOW: u32 = 0x0000_0020;
/// GPIO flag: edge triggered.
pub const GPIO_EDGE_TRIGGERED: u32 = 0x0000_0040;
/// GPIO flag: pull-up resistor enabled.
pub const GPIO_PULL_UP: u32 = 0x0000_0080;
/// GPIO flag: pull-down resistor enabled.
pub const GPIO_PULL_DOWN: u32 = 0x0000_0100;
/// GPIO flag: no pull resistor. Both pull bits set is the encoding.
pub const GPIO_PULL_NONE: u32 = GPIO_PULL_UP | GPIO_PULL_DOWN;

/// Sentinel for GPIO drive strength and debounce timeout fields whose
/// descriptor left the setting at the hardware default.
pub const GPIO_SETTING_DEFAULT: u32 = u32::MAX;

/// Kind of resource a requirement or allocation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    PhysicalAddressSpace,
    IoPort,
    InterruptLine,
    DmaChannel,
    BusNumber,
    Gpio,
    SimpleBus,
    Vendor,
}

/// UART parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UartParity {
    #[default]
    None,
    Even,
    Odd,
    Mark,
    Space,
}

/// UART stop bit setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UartStopBits {
    None,
    #[default]
    One,
    OneAndHalf,
    Two,
}

/// UART flow control setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UartFlowControl {
    #[default]
    None,
    Hardware,
    Software,
}

/// GPIO connection details carried alongside a GPIO requirement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GpioData {
    /// `GPIO_*` flags.
    pub flags: u32,
    /// Output drive strength in microamps, or [`GPIO_SETTING_DEFAULT`].
    pub output_drive: u32,
    /// Debounce timeout in microseconds, or [`GPIO_SETTING_DEFAULT`].
    pub debounce_timeout: u32,
    /// Vendor-defined bytes from the descriptor, possibly empty.
    pub vendor: Vec<u8>,
}

/// Details of an I2C connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I2cData {
    /// Bus clock in Hertz.
    pub speed_hz: u32,
    /// Address of the peripheral on the bus.
    pub slave_address: u16,
    /// Ten-bit rather than seven-bit addressing.
    pub ten_bit_addressing: bool,
}

/// Details of a SPI connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiData {
    /// Bus clock in Hertz.
    pub speed_hz: u32,
    /// Bits per word.
    pub word_size: u8,
    /// Data is latched on the second clock phase.
    pub phase_second: bool,
    /// The clock idles high.
    pub polarity_start_high: bool,
    /// Device select line mask.
    pub device_select: u16,
    /// Three-wire rather than four-wire signalling.
    pub three_wires: bool,
    /// The select line is active high.
    pub select_active_high: bool,
}

/// Details of a UART connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartData {
    /// Default baud rate.
    pub baud_rate: u32,
    /// Receive FIFO depth in bytes.
    pub receive_fifo: u16,
    /// Transmit FIFO depth in bytes.
    pub transmit_fifo: u16,
    pub parity: UartParity,
    pub stop_bits: UartStopBits,
    pub flow_control: UartFlowControl,
    /// Data bits per character, 5 through 9.
    pub data_bits: u8,
    /// Big-endian bit order on the wire.
    pub big_endian: bool,
    /// Raw control line mask from the descriptor.
    pub control_lines: u8,
}

/// Bus-specific payload of a simple peripheral bus connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpbBus {
    I2c(I2cData),
    Spi(SpiData),
    Uart(UartData),
}

/// Simple peripheral bus connection details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpbData {
    /// The device acts as the bus target rather than the controller.
    pub slave: bool,
    pub bus: SpbBus,
    /// Vendor-defined bytes from the descriptor, possibly empty.
    pub vendor: Vec<u8>,
}

/// Fixed DMA request details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaData {
    /// DMA request line the device asserts.
    pub request_line: u16,
    /// Transfer width in bits.
    pub width: u16,
}

/// Type-specific payload attached to a requirement or allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceData {
    Gpio(GpioData),
    SimpleBus(SpbData),
    Dma(DmaData),
    Vendor(Vec<u8>),
}

/// One resource the device needs, with any equally acceptable
/// alternatives chained on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub resource_type: ResourceType,
    /// Lowest acceptable base value.
    pub minimum: u64,
    /// One past the highest acceptable value.
    pub maximum: u64,
    /// Number of units required.
    pub length: u64,
    /// Required alignment of the assigned base.
    pub alignment: u64,
    /// Type-specific characteristic bits.
    pub characteristics: u64,
    /// `RESOURCE_FLAG_*` bits.
    pub flags: u32,
    /// Type-specific payload, when the descriptor carries one.
    pub data: Option<ResourceData>,
    /// Device that provides the resource, when it is not the parent bus.
    pub provider: Option<OsDevice>,
    /// Equally acceptable substitutes for this requirement.
    pub alternatives: Vec<Requirement>,
}

impl Requirement {
    /// An empty requirement of the given type with alignment 1.
    #[must_use]
    pub const fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            minimum: 0,
            maximum: 0,
            length: 0,
            alignment: 1,
            characteristics: 0,
            flags: 0,
            data: None,
            provider: None,
            alternatives: Vec::new(),
        }
    }
}

/// One complete set of requirements a device can run with. A device with
/// dependent-function descriptors reports several configurations; the OS
/// picks one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Configuration {
    pub requirements: Vec<Requirement>,
}

/// A resource actually assigned to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub resource_type: ResourceType,
    /// Assigned base value.
    pub base: u64,
    /// Number of units assigned.
    pub length: u64,
    /// Type-specific characteristic bits.
    pub characteristics: u64,
    /// `RESOURCE_FLAG_*` bits.
    pub flags: u32,
    /// Type-specific payload carried over from the requirement.
    pub data: Option<ResourceData>,
    /// Device that provides the resource, when it is not the parent bus.
    pub provider: Option<OsDevice>,
}

impl Allocation {
    /// The allocation a requirement pins down when its range leaves no
    /// choice: base at the minimum.
    #[must_use]
    pub fn from_requirement(requirement: &Requirement) -> Self {
        Self {
            resource_type: requirement.resource_type,
            base: requirement.minimum,
            length: requirement.length,
            characteristics: requirement.characteristics,
            flags: requirement.flags,
            data: requirement.data.clone(),
            provider: requirement.provider,
        }
    }
}

/// Converts a current-resources template into the allocation list it
/// describes. Only the first configuration applies; `_CRS` never reports
/// dependent functions.
#[must_use]
pub fn boot_allocations(configurations: &[Configuration]) -> Vec<Allocation> {
    let Some(current) = configurations.first() else {
        return Vec::new();
    };
    current
        .requirements
        .iter()
        .map(Allocation::from_requirement)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn allocation_takes_requirement_minimum() {
        let requirement = Requirement {
            minimum: 0x3F8,
            maximum: 0x400,
            length: 8,
            characteristics: INTERRUPT_LINE_ACTIVE_HIGH,
            flags: RESOURCE_FLAG_NOT_SHAREABLE,
            ..Requirement::new(ResourceType::IoPort)
        };
        let allocation = Allocation::from_requirement(&requirement);
        assert_eq!(allocation.base, 0x3F8);
        assert_eq!(allocation.length, 8);
        assert_eq!(allocation.flags, RESOURCE_FLAG_NOT_SHAREABLE);
    }

    #[test]
    fn boot_allocations_use_first_configuration_only() {
        let first = Configuration {
            requirements: vec![Requirement {
                minimum: 4,
                maximum: 5,
                length: 1,
                ..Requirement::new(ResourceType::InterruptLine)
            }],
        };
        let second = Configuration {
            requirements: vec![Requirement::new(ResourceType::DmaChannel)],
        };
        let allocations = boot_allocations(&[first, second]);
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].resource_type, ResourceType::InterruptLine);
        assert_eq!(allocations[0].base, 4);
    }

    #[test]
    fn boot_allocations_of_nothing() {
        assert!(boot_allocations(&[]).is_empty());
    }
}
