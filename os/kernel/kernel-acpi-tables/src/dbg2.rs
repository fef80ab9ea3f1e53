//! # DBG2 (Debug Port Table 2) Writer
//!
//! Firmware rarely ships a DBG2, so the loader synthesizes one from the
//! debug transports it probes. The generated table uses fixed-size device
//! blocks: every block reserves an OEM data slot whether or not the device
//! carries OEM data, which keeps the block offsets constant.

use crate::header::{DescriptionHeader, GenericAddress, HEADER_CHECKSUM_OFFSET};
use crate::{apply_checksum, struct_bytes, table_signature};
use alloc::vec::Vec;

/// Signature of the debug port table.
pub const DBG2_SIGNATURE: u32 = table_signature(b"DBG2");

/// Most device entries a generated table carries.
pub const DBG2_MAX_DEVICES: usize = 8;

/// Port type: serial transport.
pub const PORT_TYPE_SERIAL: u16 = 0x8000;

/// Port type: USB transport.
pub const PORT_TYPE_USB: u16 = 0x8002;

/// Serial subtype: fully 16550-compatible UART.
pub const PORT_SUBTYPE_16550: u16 = 0x0000;

/// Serial subtype: 16550 with quirks described by OEM data.
pub const PORT_SUBTYPE_16550_COMPATIBLE: u16 = 0x0001;

/// USB subtype: EHCI debug port.
pub const PORT_SUBTYPE_EHCI: u16 = 0x0001;

/// OEM data signature "165U" marking 16550 quirk data.
pub const OEM_DATA_16550_SIGNATURE: u32 = 0x5535_3631;

/// 16550 quirk: the FIFO is 64 bytes deep.
pub const OEM_FLAG_64_BYTE_FIFO: u32 = 0x0000_0001;

/// 16550 quirk: transmit interrupt fires at a two-character trigger.
pub const OEM_FLAG_TRANSMIT_TRIGGER_2: u32 = 0x0000_0002;

/// Fixed length of one generated device block.
pub const DEVICE_BLOCK_LENGTH: u16 = 56;

const DEVICE_OEM_OFFSET: u16 = 22;
const DEVICE_ADDRESS_OFFSET: u16 = 38;
const DEVICE_SIZE_OFFSET: u16 = 50;
const DEVICE_NAMESPACE_OFFSET: u16 = 54;

const _: () = {
    assert!(size_of::<DeviceInformation>() == DEVICE_OEM_OFFSET as usize);
    assert!(DEVICE_OEM_OFFSET as usize + size_of::<Uart16550OemData>() == DEVICE_ADDRESS_OFFSET as usize);
    assert!(DEVICE_ADDRESS_OFFSET as usize + size_of::<GenericAddress>() == DEVICE_SIZE_OFFSET as usize);
    assert!(DEVICE_SIZE_OFFSET as usize + size_of::<u32>() == DEVICE_NAMESPACE_OFFSET as usize);
    assert!(DEVICE_NAMESPACE_OFFSET as usize + 2 == DEVICE_BLOCK_LENGTH as usize);
};

/// Table-level fields preceding the device array.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Dbg2Header {
    pub header: DescriptionHeader,
    pub device_information_offset: u32,
    pub device_information_count: u32,
}

/// Per-device header. All offsets are relative to the start of this
/// structure within the table.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct DeviceInformation {
    pub revision: u8,
    pub length: u16,
    pub generic_address_count: u8,
    pub namespace_string_length: u16,
    pub namespace_string_offset: u16,
    pub oem_data_length: u16,
    pub oem_data_offset: u16,
    pub port_type: u16,
    pub port_subtype: u16,
    pub reserved: u16,
    pub base_address_register_offset: u16,
    pub address_size_offset: u16,
}

/// Quirk data for a 16550 that is not a textbook part.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uart16550OemData {
    pub signature: u32,
    /// Baud rate at a divisor of one.
    pub base_baud: u32,
    /// Offset from the region base to the first 16550 register.
    pub register_offset: u16,
    /// Left-shift applied to standard 16550 register numbers.
    pub register_shift: u16,
    pub flags: u32,
}

impl Uart16550OemData {
    const EMPTY: Self = Self {
        signature: 0,
        base_baud: 0,
        register_offset: 0,
        register_shift: 0,
        flags: 0,
    };
}

/// One debug transport destined for the generated table.
#[derive(Debug, Clone, Copy)]
pub struct DebugDevice {
    pub port_type: u16,
    pub port_subtype: u16,
    pub address: GenericAddress,
    /// Size in bytes of the register region.
    pub address_size: u32,
    pub oem_data: Option<Uart16550OemData>,
}

/// Accumulates probed debug devices and emits the checksummed table.
#[derive(Debug, Default)]
pub struct Dbg2Builder {
    devices: Vec<DebugDevice>,
}

impl Dbg2Builder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    /// Number of devices queued so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no transport has been found yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Queues a device. Returns `false` once the table is full; callers
    /// keep probing for side effects but stop recording.
    pub fn push(&mut self, device: DebugDevice) -> bool {
        if self.devices.len() >= DBG2_MAX_DEVICES {
            return false;
        }
        self.devices.push(device);
        true
    }

    /// Emits the complete table. The result sums to zero over its
    /// declared length.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        let device_offset = size_of::<Dbg2Header>();
        let total = device_offset + self.devices.len() * DEVICE_BLOCK_LENGTH as usize;
        let header = Dbg2Header {
            header: DescriptionHeader {
                signature: DBG2_SIGNATURE,
                length: total as u32,
                revision: 0,
                checksum: 0,
                oem_id: *b"FERRIT",
                oem_table_id: 0,
                oem_revision: 0,
                creator_id: 0,
                creator_revision: 0,
            },
            device_information_offset: device_offset as u32,
            device_information_count: self.devices.len() as u32,
        };

        let mut table = Vec::with_capacity(total);
        table.extend_from_slice(struct_bytes(&header));
        for device in &self.devices {
            let information = DeviceInformation {
                revision: 0,
                length: DEVICE_BLOCK_LENGTH,
                generic_address_count: 1,
                namespace_string_length: 2,
                namespace_string_offset: DEVICE_NAMESPACE_OFFSET,
                oem_data_length: device
                    .oem_data
                    .map_or(0, |_| size_of::<Uart16550OemData>() as u16),
                oem_data_offset: device.oem_data.map_or(0, |_| DEVICE_OEM_OFFSET),
                port_type: device.port_type,
                port_subtype: device.port_subtype,
                reserved: 0,
                base_address_register_offset: DEVICE_ADDRESS_OFFSET,
                address_size_offset: DEVICE_SIZE_OFFSET,
            };
            table.extend_from_slice(struct_bytes(&information));
            let oem = device.oem_data.unwrap_or(Uart16550OemData::EMPTY);
            table.extend_from_slice(struct_bytes(&oem));
            table.extend_from_slice(struct_bytes(&device.address));
            table.extend_from_slice(&device.address_size.to_le_bytes());
            table.extend_from_slice(b".\0");
        }

        apply_checksum(&mut table, HEADER_CHECKSUM_OFFSET);
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sum, take_struct};

    fn com1() -> DebugDevice {
        DebugDevice {
            port_type: PORT_TYPE_SERIAL,
            port_subtype: PORT_SUBTYPE_16550,
            address: GenericAddress::io(0x3F8, 1),
            address_size: 8,
            oem_data: None,
        }
    }

    fn quark_uart() -> DebugDevice {
        DebugDevice {
            port_type: PORT_TYPE_SERIAL,
            port_subtype: PORT_SUBTYPE_16550_COMPATIBLE,
            address: GenericAddress::memory(0x9000_0000, 32),
            address_size: 0x80,
            oem_data: Some(Uart16550OemData {
                signature: OEM_DATA_16550_SIGNATURE,
                base_baud: 2_764_800,
                register_offset: 0,
                register_shift: 2,
                flags: OEM_FLAG_64_BYTE_FIFO,
            }),
        }
    }

    #[test]
    fn generated_tables_sum_to_zero() {
        let mut builder = Dbg2Builder::new();
        assert!(builder.push(com1()));
        assert!(builder.push(quark_uart()));
        let table = builder.build();

        assert_eq!(sum(&table), 0);
        assert_eq!(
            table.len(),
            size_of::<Dbg2Header>() + 2 * DEVICE_BLOCK_LENGTH as usize
        );
        let header = DescriptionHeader::validate(&table).unwrap();
        assert_eq!({ header.signature }, DBG2_SIGNATURE);
    }

    #[test]
    fn declared_offsets_locate_every_field() {
        let mut builder = Dbg2Builder::new();
        builder.push(quark_uart());
        let table = builder.build();

        let dbg2: Dbg2Header = take_struct(&table).unwrap();
        let device_start = { dbg2.device_information_offset } as usize;
        assert_eq!({ dbg2.device_information_count }, 1);

        let info: DeviceInformation = take_struct(&table[device_start..]).unwrap();
        assert_eq!({ info.port_subtype }, PORT_SUBTYPE_16550_COMPATIBLE);

        let address_at = device_start + { info.base_address_register_offset } as usize;
        let address: GenericAddress = take_struct(&table[address_at..]).unwrap();
        assert_eq!(address, GenericAddress::memory(0x9000_0000, 32));

        let oem_at = device_start + { info.oem_data_offset } as usize;
        let oem: Uart16550OemData = take_struct(&table[oem_at..]).unwrap();
        assert_eq!({ oem.base_baud }, 2_764_800);
        assert_eq!({ oem.register_shift }, 2);

        let namespace_at = device_start + { info.namespace_string_offset } as usize;
        assert_eq!(&table[namespace_at..namespace_at + 2], b".\0");
    }

    #[test]
    fn devices_without_oem_data_leave_the_slot_zeroed() {
        let mut builder = Dbg2Builder::new();
        builder.push(com1());
        let table = builder.build();

        let info: DeviceInformation =
            take_struct(&table[size_of::<Dbg2Header>()..]).unwrap();
        assert_eq!({ info.oem_data_length }, 0);
        assert_eq!({ info.oem_data_offset }, 0);
    }

    #[test]
    fn capacity_stops_at_eight_devices() {
        let mut builder = Dbg2Builder::new();
        for _ in 0..DBG2_MAX_DEVICES {
            assert!(builder.push(com1()));
        }
        assert!(!builder.push(com1()));
        assert_eq!(builder.len(), DBG2_MAX_DEVICES);
        assert_eq!(sum(&builder.build()), 0);
    }

    #[test]
    fn empty_builder_emits_a_bare_header() {
        let table = Dbg2Builder::new().build();
        assert_eq!(table.len(), size_of::<Dbg2Header>());
        assert_eq!(sum(&table), 0);
        assert!(DescriptionHeader::validate(&table).is_ok());
    }
}
