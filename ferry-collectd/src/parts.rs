//! Part type codes and framing of the collectd network protocol.
//!
//! Every packet is a sequence of parts. Each part starts with a four byte header made of a
//! big-endian type code and a big-endian length that includes the header itself.

/// Host name, NUL-terminated string.
pub const HOST: u16 = 0x0000;
/// Time in seconds since the epoch.
pub const TIME: u16 = 0x0001;
/// Plugin name, NUL-terminated string.
pub const PLUGIN: u16 = 0x0002;
/// Plugin instance, NUL-terminated string.
pub const PLUGIN_INSTANCE: u16 = 0x0003;
/// Type name, NUL-terminated string.
pub const TYPE: u16 = 0x0004;
/// Type instance, NUL-terminated string.
pub const TYPE_INSTANCE: u16 = 0x0005;
/// Array of values.
pub const VALUES: u16 = 0x0006;
/// Collection interval in seconds.
pub const INTERVAL: u16 = 0x0007;
/// Time in units of 2^-30 seconds.
pub const TIME_HR: u16 = 0x0008;
/// Collection interval in units of 2^-30 seconds.
pub const INTERVAL_HR: u16 = 0x0009;
/// HMAC-SHA256 signature over the rest of the packet.
pub const SIGNATURE: u16 = 0x0200;
/// AES-256-OFB encrypted packet.
pub const ENCRYPTION: u16 = 0x0210;

/// Size of a part header in bytes.
pub const HEADER_SIZE: usize = 4;

/// The number of high resolution time units per second.
pub const HR_UNITS_PER_SECOND: f64 = (1u64 << 30) as f64;

/// The header at the start of every part.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PartHeader {
    /// The part type code.
    pub part_type: u16,
    /// Total length of the part including this header.
    pub length: u16,
}

impl PartHeader {
    /// Reads the header at the start of `data` without consuming anything.
    ///
    /// Returns `None` if fewer than four bytes are available.
    pub fn peek(data: &[u8]) -> Option<Self> {
        match *data {
            [t0, t1, l0, l1, ..] => Some(Self {
                part_type: u16::from_be_bytes([t0, t1]),
                length: u16::from_be_bytes([l0, l1]),
            }),
            _ => None,
        }
    }

    /// The length of the payload following this header.
    ///
    /// Returns `None` if the declared length does not even cover the header.
    pub fn payload_len(&self) -> Option<usize> {
        usize::from(self.length).checked_sub(HEADER_SIZE)
    }

    /// Appends the encoded header to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.part_type.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_header() {
        let header = PartHeader::peek(&[0x02, 0x00, 0x00, 0x2a, 0xff]).unwrap();
        assert_eq!(header.part_type, SIGNATURE);
        assert_eq!(header.length, 42);
        assert_eq!(header.payload_len(), Some(38));

        assert_eq!(PartHeader::peek(&[0x00, 0x01, 0x00]), None);
    }

    #[test]
    fn test_length_below_header() {
        let header = PartHeader::peek(&[0x00, 0x00, 0x00, 0x03]).unwrap();
        assert_eq!(header.payload_len(), None);
    }
}
