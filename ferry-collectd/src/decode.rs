use std::collections::VecDeque;

use crate::parts::{self, PartHeader};
use crate::{RawValue, Sample, TypeRegistry, ValueKind};

/// An error that aborts decoding of a single packet.
///
/// Decode errors never affect other packets. Samples yielded before the error was encountered
/// remain valid.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// The part type code is not known.
    #[error("unknown part type {0:#06x}")]
    UnknownPart(u16),
    /// A signature or encryption part appeared where only plain parts are allowed.
    #[error("unexpected security part {0:#06x}")]
    UnexpectedSecurityPart(u16),
    /// Fewer than four bytes remained for a part header.
    #[error("truncated part header at offset {offset}")]
    TruncatedHeader {
        /// Byte offset of the header within the packet.
        offset: usize,
    },
    /// The declared part length exceeds the remaining packet.
    #[error("truncated part {part_type:#06x}: declared {declared} bytes, {available} available")]
    TruncatedPayload {
        /// The part type.
        part_type: u16,
        /// The declared total length.
        declared: usize,
        /// The number of bytes remaining in the packet.
        available: usize,
    },
    /// The declared part length is smaller than the part header.
    #[error("invalid length {length} for part {part_type:#06x}")]
    InvalidPartLength {
        /// The part type.
        part_type: u16,
        /// The declared total length.
        length: u16,
    },
    /// A string part is not terminated by a NUL byte.
    #[error("string part {0:#06x} is not NUL-terminated")]
    MissingTerminator(u16),
    /// A string part is not valid UTF-8.
    #[error("string part {0:#06x} is not valid UTF-8")]
    InvalidString(u16),
    /// A numeric part does not carry exactly eight bytes.
    #[error("numeric part {part_type:#06x} has {size} bytes")]
    NumericPartSize {
        /// The part type.
        part_type: u16,
        /// The actual payload size.
        size: usize,
    },
    /// The values part size does not match its value count.
    #[error("values part of {size} bytes cannot hold {count} values")]
    ValuesSize {
        /// The declared number of values.
        count: usize,
        /// The actual payload size.
        size: usize,
    },
    /// A kind tag in a values part is not known.
    #[error("unknown value kind {0}")]
    UnknownValueKind(u8),
    /// The current type is not declared in the types database.
    #[error("unknown type {0:?}")]
    UnknownType(String),
    /// The number of values does not match the type definition.
    #[error("type {type_name:?} declares {expected} values, got {actual}")]
    ValueCountMismatch {
        /// The type name.
        type_name: String,
        /// Number of values in the type definition.
        expected: usize,
        /// Number of values in the packet.
        actual: usize,
    },
    /// A kind tag does not match the type definition.
    #[error("type {type_name:?} declares {expected} for {value_name:?}, got {actual}")]
    ValueKindMismatch {
        /// The type name.
        type_name: String,
        /// The value name.
        value_name: String,
        /// The declared kind.
        expected: ValueKind,
        /// The kind on the wire.
        actual: ValueKind,
    },
}

impl DecodeError {
    /// A short, stable identifier of the error for metric tags.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnknownPart(_) => "unknown_part",
            Self::UnexpectedSecurityPart(_) => "unexpected_security_part",
            Self::TruncatedHeader { .. } => "truncated_header",
            Self::TruncatedPayload { .. } => "truncated_payload",
            Self::InvalidPartLength { .. } => "invalid_part_length",
            Self::MissingTerminator(_) => "missing_terminator",
            Self::InvalidString(_) => "invalid_string",
            Self::NumericPartSize { .. } => "numeric_part_size",
            Self::ValuesSize { .. } => "values_size",
            Self::UnknownValueKind(_) => "unknown_value_kind",
            Self::UnknownType(_) => "unknown_type",
            Self::ValueCountMismatch { .. } => "value_count_mismatch",
            Self::ValueKindMismatch { .. } => "value_kind_mismatch",
        }
    }
}

/// Fields carried over from previous parts into every sample of the packet.
#[derive(Clone, Debug, Default)]
struct Context {
    host: String,
    plugin: String,
    plugin_instance: String,
    type_name: String,
    type_instance: String,
    time: f64,
    interval: f64,
}

impl Context {
    fn sample(&self, value_name: &str, value: RawValue) -> Sample {
        Sample {
            host: self.host.clone(),
            plugin: self.plugin.clone(),
            plugin_instance: self.plugin_instance.clone(),
            type_name: self.type_name.clone(),
            type_instance: self.type_instance.clone(),
            value_name: value_name.to_owned(),
            value,
            time: self.time,
            interval: self.interval,
        }
    }
}

/// Lazily decodes the parts of a single packet into [`Sample`]s.
///
/// Created by [`decode`]. The iterator yields samples in wire order. On the first error it
/// yields that error once and then terminates, so the remainder of the packet is never
/// interpreted.
#[derive(Debug)]
pub struct PacketDecoder<'a> {
    types: &'a TypeRegistry,
    data: &'a [u8],
    offset: usize,
    context: Context,
    pending: VecDeque<Sample>,
    done: bool,
}

/// Decodes a plain collectd packet.
///
/// Security wrappers must have been removed before, see `ferry_auth::CryptoGate`.
///
/// ```
/// use ferry_collectd::{TypeRegistry, decode};
///
/// let types = TypeRegistry::new();
/// assert_eq!(decode(&types, &[]).count(), 0);
/// ```
pub fn decode<'a>(types: &'a TypeRegistry, data: &'a [u8]) -> PacketDecoder<'a> {
    PacketDecoder {
        types,
        data,
        offset: 0,
        context: Context::default(),
        pending: VecDeque::new(),
        done: false,
    }
}

impl PacketDecoder<'_> {
    /// Reads the next part and applies it to the context.
    ///
    /// Returns `Ok(false)` when the end of the packet is reached.
    fn next_part(&mut self) -> Result<bool, DecodeError> {
        let data = self.data;
        let remaining = &data[self.offset..];
        if remaining.is_empty() {
            return Ok(false);
        }

        let header = PartHeader::peek(remaining).ok_or(DecodeError::TruncatedHeader {
            offset: self.offset,
        })?;

        let payload_len = header
            .payload_len()
            .ok_or(DecodeError::InvalidPartLength {
                part_type: header.part_type,
                length: header.length,
            })?;

        let length = usize::from(header.length);
        if length > remaining.len() {
            return Err(DecodeError::TruncatedPayload {
                part_type: header.part_type,
                declared: length,
                available: remaining.len(),
            });
        }

        let payload = &remaining[parts::HEADER_SIZE..parts::HEADER_SIZE + payload_len];
        self.offset += length;

        let part_type = header.part_type;
        match part_type {
            parts::HOST => self.context.host = read_string(part_type, payload)?,
            parts::PLUGIN => self.context.plugin = read_string(part_type, payload)?,
            parts::PLUGIN_INSTANCE => {
                self.context.plugin_instance = read_string(part_type, payload)?;
            }
            parts::TYPE => self.context.type_name = read_string(part_type, payload)?,
            parts::TYPE_INSTANCE => self.context.type_instance = read_string(part_type, payload)?,
            parts::TIME => self.context.time = read_number(part_type, payload)? as f64,
            parts::TIME_HR => {
                let units = read_number(part_type, payload)?;
                self.context.time = units as f64 / parts::HR_UNITS_PER_SECOND;
            }
            parts::INTERVAL => self.context.interval = read_number(part_type, payload)? as f64,
            parts::INTERVAL_HR => {
                let units = read_number(part_type, payload)?;
                self.context.interval = units as f64 / parts::HR_UNITS_PER_SECOND;
            }
            parts::VALUES => self.read_values(payload)?,
            parts::SIGNATURE | parts::ENCRYPTION => {
                return Err(DecodeError::UnexpectedSecurityPart(part_type));
            }
            other => return Err(DecodeError::UnknownPart(other)),
        }

        Ok(true)
    }

    /// Decodes a values part and queues one sample per value.
    fn read_values(&mut self, payload: &[u8]) -> Result<(), DecodeError> {
        let count = match *payload {
            [c0, c1, ..] => usize::from(u16::from_be_bytes([c0, c1])),
            _ => return Err(DecodeError::ValuesSize { count: 0, size: 0 }),
        };

        if payload.len() != 2 + count * 9 {
            return Err(DecodeError::ValuesSize {
                count,
                size: payload.len(),
            });
        }

        let definition = self
            .types
            .get(&self.context.type_name)
            .ok_or_else(|| DecodeError::UnknownType(self.context.type_name.clone()))?;

        if definition.sources().len() != count {
            return Err(DecodeError::ValueCountMismatch {
                type_name: self.context.type_name.clone(),
                expected: definition.sources().len(),
                actual: count,
            });
        }

        let (tags, values) = payload[2..].split_at(count);
        for ((source, &tag), bytes) in definition
            .sources()
            .iter()
            .zip(tags)
            .zip(values.chunks_exact(8))
        {
            let kind = ValueKind::from_code(tag).ok_or(DecodeError::UnknownValueKind(tag))?;
            if kind != source.kind {
                return Err(DecodeError::ValueKindMismatch {
                    type_name: self.context.type_name.clone(),
                    value_name: source.name.clone(),
                    expected: source.kind,
                    actual: kind,
                });
            }

            let mut raw = [0; 8];
            raw.copy_from_slice(bytes);
            let value = RawValue::from_wire(kind, raw);
            self.pending.push_back(self.context.sample(&source.name, value));
        }

        Ok(())
    }
}

impl Iterator for PacketDecoder<'_> {
    type Item = Result<Sample, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(sample) = self.pending.pop_front() {
                return Some(Ok(sample));
            }

            if self.done {
                return None;
            }

            match self.next_part() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(error) => {
                    self.done = true;
                    self.pending.clear();
                    return Some(Err(error));
                }
            }
        }
    }
}

fn read_string(part_type: u16, payload: &[u8]) -> Result<String, DecodeError> {
    let Some((&0, bytes)) = payload.split_last() else {
        return Err(DecodeError::MissingTerminator(part_type));
    };

    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| DecodeError::InvalidString(part_type))
}

fn read_number(part_type: u16, payload: &[u8]) -> Result<u64, DecodeError> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| DecodeError::NumericPartSize {
            part_type,
            size: payload.len(),
        })?;

    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testutils::PacketBuilder;

    fn registry() -> TypeRegistry {
        let mut types = TypeRegistry::new();
        types.extend_from_str(
            "if_octets rx:DERIVE:0:U, tx:DERIVE:0:U\n\
             gauge value:GAUGE:U:U\n\
             counter value:COUNTER:U:U\n",
        );
        types
    }

    fn decode_all(packet: &[u8]) -> Vec<Result<Sample, DecodeError>> {
        decode(&registry(), packet).collect()
    }

    #[test]
    fn test_decode_single_value() {
        let packet = PacketBuilder::new()
            .host("web01")
            .time(1_700_000_000)
            .interval(10)
            .plugin("load")
            .type_name("gauge")
            .values(&[RawValue::Gauge(0.25)])
            .build();

        let samples = decode_all(&packet);
        assert_eq!(
            samples,
            vec![Ok(Sample {
                host: "web01".to_owned(),
                plugin: "load".to_owned(),
                plugin_instance: String::new(),
                type_name: "gauge".to_owned(),
                type_instance: String::new(),
                value_name: "value".to_owned(),
                value: RawValue::Gauge(0.25),
                time: 1_700_000_000.0,
                interval: 10.0,
            })]
        );
    }

    #[test]
    fn test_values_share_context() {
        let packet = PacketBuilder::new()
            .host("web01")
            .plugin("interface")
            .plugin_instance("eth0")
            .type_name("if_octets")
            .values(&[RawValue::Derive(100), RawValue::Derive(-5)])
            .build();

        let samples: Vec<_> = decode_all(&packet).into_iter().map(Result::unwrap).collect();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].value_name, "rx");
        assert_eq!(samples[0].value, RawValue::Derive(100));
        assert_eq!(samples[1].value_name, "tx");
        assert_eq!(samples[1].value, RawValue::Derive(-5));
        assert_eq!(samples[1].plugin_instance, "eth0");
    }

    #[test]
    fn test_context_carries_over() {
        let packet = PacketBuilder::new()
            .host("web01")
            .plugin("a")
            .type_name("gauge")
            .values(&[RawValue::Gauge(1.0)])
            .plugin("b")
            .values(&[RawValue::Gauge(2.0)])
            .build();

        let samples: Vec<_> = decode_all(&packet).into_iter().map(Result::unwrap).collect();
        assert_eq!(samples[0].plugin, "a");
        assert_eq!(samples[1].plugin, "b");
        assert_eq!(samples[1].host, "web01");
    }

    #[test]
    fn test_high_resolution_time() {
        let packet = PacketBuilder::new()
            .time_hr(1_700_000_000.5)
            .interval_hr(2.5)
            .type_name("gauge")
            .values(&[RawValue::Gauge(1.0)])
            .build();

        let sample = decode_all(&packet).remove(0).unwrap();
        assert_eq!(sample.time, 1_700_000_000.5);
        assert_eq!(sample.interval, 2.5);
    }

    #[test]
    fn test_error_aborts_packet() {
        let packet = PacketBuilder::new()
            .type_name("gauge")
            .values(&[RawValue::Gauge(1.0)])
            .raw_part(0x0100, b"junk")
            .values(&[RawValue::Gauge(2.0)])
            .build();

        let results = decode_all(&packet);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert_eq!(results[1], Err(DecodeError::UnknownPart(0x0100)));
    }

    #[test]
    fn test_unknown_type() {
        let packet = PacketBuilder::new()
            .type_name("nope")
            .values(&[RawValue::Gauge(1.0)])
            .build();

        assert_eq!(
            decode_all(&packet),
            vec![Err(DecodeError::UnknownType("nope".to_owned()))]
        );
    }

    #[test]
    fn test_value_count_mismatch() {
        let packet = PacketBuilder::new()
            .type_name("if_octets")
            .values(&[RawValue::Derive(1)])
            .build();

        assert_eq!(
            decode_all(&packet),
            vec![Err(DecodeError::ValueCountMismatch {
                type_name: "if_octets".to_owned(),
                expected: 2,
                actual: 1,
            })]
        );
    }

    #[test]
    fn test_value_kind_mismatch() {
        let packet = PacketBuilder::new()
            .type_name("counter")
            .values(&[RawValue::Gauge(1.0)])
            .build();

        assert_eq!(
            decode_all(&packet),
            vec![Err(DecodeError::ValueKindMismatch {
                type_name: "counter".to_owned(),
                value_name: "value".to_owned(),
                expected: ValueKind::Counter,
                actual: ValueKind::Gauge,
            })]
        );
    }

    #[test]
    fn test_missing_terminator() {
        let packet = PacketBuilder::new().raw_part(parts::HOST, b"web01").build();
        assert_eq!(
            decode_all(&packet),
            vec![Err(DecodeError::MissingTerminator(parts::HOST))]
        );
    }

    #[test]
    fn test_truncated_header() {
        let mut packet = PacketBuilder::new().host("web01").build();
        packet.extend_from_slice(&[0x00, 0x02]);

        assert_eq!(
            decode_all(&packet),
            vec![Err(DecodeError::TruncatedHeader { offset: 10 })]
        );
    }

    #[test]
    fn test_truncated_payload() {
        let mut packet = PacketBuilder::new().host("web01").build();
        packet.truncate(8);

        assert_eq!(
            decode_all(&packet),
            vec![Err(DecodeError::TruncatedPayload {
                part_type: parts::HOST,
                declared: 10,
                available: 8,
            })]
        );
    }

    #[test]
    fn test_zero_length_part() {
        let packet = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(
            decode_all(&packet),
            vec![Err(DecodeError::InvalidPartLength {
                part_type: parts::HOST,
                length: 0,
            })]
        );
    }

    #[test]
    fn test_numeric_part_size() {
        let packet = PacketBuilder::new()
            .raw_part(parts::TIME, &[0, 0, 0, 1])
            .build();

        assert_eq!(
            decode_all(&packet),
            vec![Err(DecodeError::NumericPartSize {
                part_type: parts::TIME,
                size: 4,
            })]
        );
    }

    #[test]
    fn test_values_size() {
        // count of two, but only one value follows
        let mut payload = vec![0x00, 0x02, 0x02, 0x02];
        payload.extend_from_slice(&[0; 8]);

        let packet = PacketBuilder::new()
            .type_name("if_octets")
            .raw_part(parts::VALUES, &payload)
            .build();

        assert_eq!(
            decode_all(&packet),
            vec![Err(DecodeError::ValuesSize { count: 2, size: 12 })]
        );
    }

    #[test]
    fn test_unknown_value_kind() {
        let mut payload = vec![0x00, 0x01, 0x07];
        payload.extend_from_slice(&[0; 8]);

        let packet = PacketBuilder::new()
            .type_name("gauge")
            .raw_part(parts::VALUES, &payload)
            .build();

        assert_eq!(
            decode_all(&packet),
            vec![Err(DecodeError::UnknownValueKind(7))]
        );
    }

    #[test]
    fn test_security_part_rejected() {
        let packet = PacketBuilder::new()
            .raw_part(parts::SIGNATURE, &[0; 33])
            .build();

        assert_eq!(
            decode_all(&packet),
            vec![Err(DecodeError::UnexpectedSecurityPart(parts::SIGNATURE))]
        );
    }

    #[test]
    fn test_lazy_decoding() {
        let packet = PacketBuilder::new()
            .type_name("gauge")
            .values(&[RawValue::Gauge(1.0)])
            .raw_part(0x0100, b"")
            .build();

        let types = registry();
        let mut decoder = decode(&types, &packet);
        assert!(decoder.next().unwrap().is_ok());
        assert!(decoder.next().unwrap().is_err());
        assert!(decoder.next().is_none());
    }
}
