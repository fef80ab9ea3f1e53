//! # EISA Identifier Codec
//!
//! `_HID` and `_CID` objects may carry a compressed EISA identifier: three
//! letters packed into ten bits plus a sixteen-bit product code, rendered
//! as a seven-character string such as `PNP0A03`.

use core::fmt;

/// Identifier of a PCI host bridge.
pub const EISA_ID_PCI_BUS: u32 = match encode_eisa_id(b"PNP0A03") {
    Some(id) => id,
    None => panic!("well-formed identifier"),
};

/// Identifier of a PCI Express host bridge.
pub const EISA_ID_PCI_EXPRESS_BUS: u32 = match encode_eisa_id(b"PNP0A08") {
    Some(id) => id,
    None => panic!("well-formed identifier"),
};

/// Decoded seven-character identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EisaId(pub [u8; 7]);

impl EisaId {
    /// Expands a compressed identifier into its string form.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode(id: u32) -> Self {
        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        Self([
            (((id >> 2) & 0x1F) + 0x40) as u8,
            ((((id >> 13) & 0x07) | ((id << 3) & 0x18)) + 0x40) as u8,
            (((id >> 8) & 0x1F) + 0x40) as u8,
            HEX[((id >> 20) & 0xF) as usize],
            HEX[((id >> 16) & 0xF) as usize],
            HEX[((id >> 28) & 0xF) as usize],
            HEX[((id >> 24) & 0xF) as usize],
        ])
    }

    /// String view of the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.0).unwrap_or("")
    }
}

impl fmt::Display for EisaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compresses a seven-character identifier, or `None` when the name is
/// not three uppercase letters followed by four hex digits.
#[must_use]
pub const fn encode_eisa_id(name: &[u8; 7]) -> Option<u32> {
    let (v1, v2, v3) = match (
        letter_value(name[0]),
        letter_value(name[1]),
        letter_value(name[2]),
    ) {
        (Some(a), Some(b), Some(c)) => (a, b, c),
        _ => return None,
    };
    let (h1, h2, h3, h4) = match (
        hex_value(name[3]),
        hex_value(name[4]),
        hex_value(name[5]),
        hex_value(name[6]),
    ) {
        (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
        _ => return None,
    };

    let byte0 = (v1 << 2) | (v2 >> 3);
    let byte1 = ((v2 & 0x7) << 5) | v3;
    let byte2 = (h1 << 4) | h2;
    let byte3 = (h3 << 4) | h4;
    Some(byte0 | (byte1 << 8) | (byte2 << 16) | (byte3 << 24))
}

const fn letter_value(c: u8) -> Option<u32> {
    match c {
        b'A'..=b'Z' => Some((c - 0x40) as u32),
        _ => None,
    }
}

const fn hex_value(c: u8) -> Option<u32> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as u32),
        b'A'..=b'F' => Some((c - b'A' + 10) as u32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_identifiers_decode() {
        assert_eq!(EisaId::decode(0x030A_D041).as_str(), "PNP0A03");
        assert_eq!(EisaId::decode(EISA_ID_PCI_EXPRESS_BUS).as_str(), "PNP0A08");
    }

    #[test]
    fn encoding_inverts_decoding() {
        for name in [b"PNP0A03", b"PNP0C0F", b"PNP0501", b"QRK0936"] {
            let id = encode_eisa_id(name).unwrap();
            assert_eq!(&EisaId::decode(id).0, name);
        }
        assert_eq!(EISA_ID_PCI_BUS, 0x030A_D041);
    }

    #[test]
    fn malformed_names_do_not_encode() {
        assert_eq!(encode_eisa_id(b"pnp0a03"), None);
        assert_eq!(encode_eisa_id(b"PN_0A03"), None);
        assert_eq!(encode_eisa_id(b"PNP0G03"), None);
    }

    #[test]
    fn identifiers_display_as_text() {
        assert_eq!(
            format!("{}", EisaId::decode(EISA_ID_PCI_BUS)),
            "PNP0A03"
        );
    }
}
