//! # System Description Table Header and Generic Addresses

use crate::{TableError, sum, take_struct};

/// Address space: system memory.
pub const ADDRESS_SPACE_MEMORY: u8 = 0;

/// Address space: I/O port.
pub const ADDRESS_SPACE_IO: u8 = 1;

/// Address space: PCI configuration.
pub const ADDRESS_SPACE_PCI_CONFIG: u8 = 2;

/// Address space: functional fixed hardware (processor-defined).
pub const ADDRESS_SPACE_FIXED_HARDWARE: u8 = 0x7F;

/// The header every system description table starts with. The signature
/// names the table; the length covers the entire table including this
/// header; the checksum byte makes the whole table sum to zero.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct DescriptionHeader {
    pub signature: u32,
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: u64,
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

/// Byte offset of the checksum field within [`DescriptionHeader`].
pub const HEADER_CHECKSUM_OFFSET: usize = core::mem::offset_of!(DescriptionHeader, checksum);

impl DescriptionHeader {
    /// Reads the header without interpreting the table body.
    ///
    /// # Errors
    /// [`TableError::Truncated`] when fewer than 36 bytes are mapped.
    pub fn parse(bytes: &[u8]) -> Result<Self, TableError> {
        take_struct::<Self>(bytes)
    }

    /// Reads the header and verifies the declared length fits the buffer
    /// and the table sums to zero.
    ///
    /// # Errors
    /// [`TableError::Truncated`] when the declared length exceeds the
    /// mapped bytes, [`TableError::BadChecksum`] when the sum is non-zero.
    pub fn validate(bytes: &[u8]) -> Result<Self, TableError> {
        let header = Self::parse(bytes)?;
        let length = header.length as usize;
        if length < size_of::<Self>() || length > bytes.len() {
            return Err(TableError::Truncated {
                needed: length,
                available: bytes.len(),
            });
        }
        if sum(&bytes[..length]) != 0 {
            return Err(TableError::BadChecksum);
        }
        Ok(header)
    }
}

/// A register location in one of the ACPI-defined address spaces.
///
/// `access_size` is 0 for undefined, else `1 << (access_size - 1)` bytes
/// per access. A zero `address` conventionally means the register is not
/// implemented.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericAddress {
    pub address_space_id: u8,
    pub register_bit_width: u8,
    pub register_bit_offset: u8,
    pub access_size: u8,
    pub address: u64,
}

impl GenericAddress {
    /// The not-implemented register.
    pub const EMPTY: Self = Self {
        address_space_id: 0,
        register_bit_width: 0,
        register_bit_offset: 0,
        access_size: 0,
        address: 0,
    };

    /// An I/O port register of the given byte width.
    #[must_use]
    pub const fn io(port: u16, byte_width: u8) -> Self {
        Self {
            address_space_id: ADDRESS_SPACE_IO,
            register_bit_width: byte_width * 8,
            register_bit_offset: 0,
            access_size: 0,
            address: port as u64,
        }
    }

    /// A memory-mapped register of the given bit width.
    #[must_use]
    pub const fn memory(address: u64, bit_width: u8) -> Self {
        Self {
            address_space_id: ADDRESS_SPACE_MEMORY,
            register_bit_width: bit_width,
            register_bit_offset: 0,
            access_size: 0,
            address,
        }
    }

    /// Whether the register is implemented at all.
    #[inline]
    #[must_use]
    pub const fn is_implemented(self) -> bool {
        self.address != 0
    }

    /// Access width in bytes: `access_size` when set, else derived from
    /// the register bit width, clamped to a supported power of two.
    #[must_use]
    pub fn access_bytes(self) -> usize {
        let bytes = match self.access_size {
            1..=4 => 1_usize << (self.access_size - 1),
            _ => usize::from(self.register_bit_width.max(8)) / 8,
        };
        bytes.next_power_of_two().min(8)
    }
}

/// Builds a checksummed table from a signature and body, for unit tests
/// across the crate.
#[cfg(test)]
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn make_table(signature: &[u8; 4], body: &[u8]) -> Vec<u8> {
    use crate::{apply_checksum, struct_bytes, table_signature};

    let header = DescriptionHeader {
        signature: table_signature(signature),
        length: (size_of::<DescriptionHeader>() + body.len()) as u32,
        revision: 1,
        checksum: 0,
        oem_id: *b"FERRIT",
        oem_table_id: 0,
        oem_revision: 0,
        creator_id: 0,
        creator_revision: 0,
    };
    let mut table = struct_bytes(&header).to_vec();
    table.extend_from_slice(body);
    apply_checksum(&mut table, HEADER_CHECKSUM_OFFSET);
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_thirty_six_bytes() {
        assert_eq!(size_of::<DescriptionHeader>(), 36);
        assert_eq!(HEADER_CHECKSUM_OFFSET, 9);
    }

    #[test]
    fn validate_accepts_a_checksummed_table() {
        let table = make_table(b"TEST", &[1, 2, 3]);
        let header = DescriptionHeader::validate(&table).unwrap();
        assert_eq!({ header.length } as usize, table.len());
    }

    #[test]
    fn validate_rejects_a_flipped_byte() {
        let mut table = make_table(b"TEST", &[1, 2, 3]);
        *table.last_mut().unwrap() ^= 0xFF;
        assert!(matches!(
            DescriptionHeader::validate(&table),
            Err(TableError::BadChecksum)
        ));
    }

    #[test]
    fn validate_rejects_a_length_past_the_buffer() {
        let mut table = make_table(b"TEST", &[]);
        table[4] = 0xFF;
        assert!(matches!(
            DescriptionHeader::validate(&table),
            Err(TableError::Truncated { .. })
        ));
    }

    #[test]
    fn short_buffers_do_not_parse() {
        assert!(matches!(
            DescriptionHeader::parse(&[0_u8; 10]),
            Err(TableError::Truncated {
                needed: 36,
                available: 10
            })
        ));
    }

    #[test]
    fn access_width_prefers_the_access_size_field() {
        let mut register = GenericAddress::io(0x3F8, 1);
        assert_eq!(register.access_bytes(), 1);
        register.access_size = 3;
        assert_eq!(register.access_bytes(), 4);
        let wide = GenericAddress::memory(0xFED0_0000, 32);
        assert_eq!(wide.access_bytes(), 4);
    }
}
