use std::fmt;
use std::str::FromStr;

/// The kind of a single collectd value, which determines both its wire encoding and how rates
/// are derived from it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ValueKind {
    /// A monotonically increasing unsigned counter that may wrap around.
    Counter,
    /// An instantaneous reading.
    Gauge,
    /// A signed counter that may decrease, for instance after a reset.
    Derive,
    /// A per-interval total that is reset by the sender after every read.
    Absolute,
}

impl ValueKind {
    /// Returns the kind for the one-byte tag used in a values part.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Counter,
            1 => Self::Gauge,
            2 => Self::Derive,
            3 => Self::Absolute,
            _ => return None,
        })
    }

    /// Returns the one-byte tag of this kind in a values part.
    pub fn code(self) -> u8 {
        match self {
            Self::Counter => 0,
            Self::Gauge => 1,
            Self::Derive => 2,
            Self::Absolute => 3,
        }
    }

    /// Returns the upper case name of this kind as used in types.db.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "COUNTER",
            Self::Gauge => "GAUGE",
            Self::Derive => "DERIVE",
            Self::Absolute => "ABSOLUTE",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error returned when parsing an invalid [`ValueKind`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("invalid value kind")]
pub struct ParseValueKindError;

impl FromStr for ValueKind {
    type Err = ParseValueKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "COUNTER" => Self::Counter,
            "GAUGE" => Self::Gauge,
            "DERIVE" => Self::Derive,
            "ABSOLUTE" => Self::Absolute,
            _ => return Err(ParseValueKindError),
        })
    }
}

/// A single decoded value, retaining the binary interpretation given by its kind tag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RawValue {
    /// Unsigned 64-bit counter reading.
    Counter(u64),
    /// IEEE-754 double.
    Gauge(f64),
    /// Signed 64-bit counter reading.
    Derive(i64),
    /// Unsigned 64-bit per-interval total.
    Absolute(u64),
}

impl RawValue {
    /// Returns the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Counter(_) => ValueKind::Counter,
            Self::Gauge(_) => ValueKind::Gauge,
            Self::Derive(_) => ValueKind::Derive,
            Self::Absolute(_) => ValueKind::Absolute,
        }
    }

    /// Returns the value as a lossy floating point number.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Counter(v) | Self::Absolute(v) => v as f64,
            Self::Gauge(v) => v,
            Self::Derive(v) => v as f64,
        }
    }

    /// Decodes an 8-byte value of the given kind from the wire.
    ///
    /// Integer kinds are big-endian. Gauges are sent in the host byte order of the collectd
    /// daemon, which is little-endian on every platform collectd supports in practice.
    pub(crate) fn from_wire(kind: ValueKind, bytes: [u8; 8]) -> Self {
        match kind {
            ValueKind::Counter => Self::Counter(u64::from_be_bytes(bytes)),
            ValueKind::Gauge => Self::Gauge(f64::from_le_bytes(bytes)),
            ValueKind::Derive => Self::Derive(i64::from_be_bytes(bytes)),
            ValueKind::Absolute => Self::Absolute(u64::from_be_bytes(bytes)),
        }
    }

    /// Encodes this value into its 8-byte wire representation.
    pub fn to_wire(&self) -> [u8; 8] {
        match *self {
            Self::Counter(v) | Self::Absolute(v) => v.to_be_bytes(),
            Self::Gauge(v) => v.to_le_bytes(),
            Self::Derive(v) => v.to_be_bytes(),
        }
    }
}

/// A decoded value together with the identifying context it was sent with.
///
/// Empty strings denote fields that were never set in the packet. `time` and `interval` are in
/// seconds, with sub-second precision when the sender uses high resolution parts.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// The host that collected the value.
    pub host: String,
    /// The collectd plugin, for example `cpu`.
    pub plugin: String,
    /// The plugin instance, for example `0` for the first CPU.
    pub plugin_instance: String,
    /// The type name, which is looked up in the types database.
    pub type_name: String,
    /// The type instance, for example `idle`.
    pub type_instance: String,
    /// The name of this value within its type definition.
    pub value_name: String,
    /// The value itself.
    pub value: RawValue,
    /// Unix timestamp of the reading in seconds.
    pub time: f64,
    /// The collection interval in seconds.
    pub interval: f64,
}

impl Sample {
    /// Returns the kind of the contained value.
    pub fn kind(&self) -> ValueKind {
        self.value.kind()
    }
}
