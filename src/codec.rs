//! Big-endian word codec and coil bit packing.
//!
//! Register values travel as big-endian 16-bit words; coil and discrete
//! input values are packed one per bit, LSB first within each byte, with the
//! last byte zero padded.

/// Encode a register value big-endian.
pub fn u16_to_bytes(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// Decode a big-endian register value from the first two bytes of `bytes`.
///
/// Callers validate the slice length as part of PDU validation.
pub fn bytes_to_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Encode registers as concatenated big-endian words.
pub fn u16s_to_bytes(values: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 2);
    for &value in values {
        out.extend_from_slice(&value.to_be_bytes());
    }
    out
}

/// Decode concatenated big-endian words. A trailing odd byte is ignored;
/// byte counts are validated upstream.
pub fn bytes_to_u16s(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Number of bytes needed to carry `quantity` packed coil bits.
pub fn packed_len(quantity: u16) -> usize {
    (usize::from(quantity) + 7) / 8
}

/// Pack coil values one per bit, LSB first within each byte.
pub fn pack_bools(values: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; (values.len() + 7) / 8];
    for (i, &value) in values.iter().enumerate() {
        if value {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Unpack `quantity` coil values, ignoring high-order padding bits.
///
/// Callers validate that `bytes` holds at least [`packed_len`] bytes.
pub fn unpack_bools(quantity: u16, bytes: &[u8]) -> Vec<bool> {
    (0..usize::from(quantity))
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u16_round_trip() {
        for value in [0x0000, 0x0001, 0x1234, 0xFF00, 0xFFFF] {
            assert_eq!(bytes_to_u16(&u16_to_bytes(value)), value);
        }
        assert_eq!(u16_to_bytes(0x1234), [0x12, 0x34]);
    }

    #[test]
    fn test_u16s_concatenation() {
        let bytes = u16s_to_bytes(&[0x1234, 0x5678]);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(bytes_to_u16s(&bytes), vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_pack_bools_lsb_first() {
        // bit 0 is the first coil
        assert_eq!(pack_bools(&[true, false, true, true]), vec![0b0000_1101]);
        assert_eq!(
            pack_bools(&[true, false, false, false, false, false, false, false, true]),
            vec![0x01, 0x01]
        );
        assert!(pack_bools(&[]).is_empty());
    }

    #[test]
    fn test_unpack_bools_ignores_padding() {
        // padding bits set on purpose
        let bits = unpack_bools(4, &[0b1111_1101]);
        assert_eq!(bits, vec![true, false, true, true]);
    }

    #[test]
    fn test_bool_round_trip() {
        let coils = vec![true, false, true, true, false, false, true, false, true, true];
        let packed = pack_bools(&coils);
        assert_eq!(packed.len(), packed_len(coils.len() as u16));
        assert_eq!(unpack_bools(coils.len() as u16, &packed), coils);
    }

    #[test]
    fn test_packed_len() {
        assert_eq!(packed_len(1), 1);
        assert_eq!(packed_len(8), 1);
        assert_eq!(packed_len(9), 2);
        assert_eq!(packed_len(2000), 250);
    }
}
