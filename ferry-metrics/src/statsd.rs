use std::iter::FusedIterator;

/// Separates the name from its values, and multiple values from each other.
const VALUE_SEPARATOR: char = ':';

/// An error returned when a statsd line cannot be parsed.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseStatsdError {
    /// The line is not valid UTF-8.
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    /// The metric name is empty after sanitization.
    #[error("empty metric name")]
    EmptyName,
    /// The line has no value after the name.
    #[error("missing value for {0}")]
    MissingValue(String),
    /// A value is not followed by a type.
    #[error("missing type for {0}")]
    MissingType(String),
    /// The metric type is not supported.
    #[error("unknown metric type {0:?}")]
    UnknownType(String),
    /// A value cannot be parsed as a number.
    #[error("invalid value {0:?}")]
    InvalidValue(String),
    /// The sample rate is not a number in `(0, 1]`.
    #[error("invalid sample rate {0:?}")]
    InvalidSampleRate(String),
}

/// The value of a single statsd measurement.
#[derive(Clone, Debug, PartialEq)]
pub enum StatsdValue {
    /// Counter increment, sent with `|c`.
    Counter {
        /// The increment.
        value: f64,
        /// The client side sample rate, `1.0` if not sampled.
        sample_rate: f64,
    },
    /// Gauge reading, sent with `|g`.
    Gauge {
        /// The reading, or the change if `delta` is set.
        value: f64,
        /// The value was sent with an explicit sign and changes the current gauge.
        delta: bool,
    },
    /// Timing in milliseconds, sent with `|ms` or `|h`.
    Timer(f64),
    /// Unique occurrence, sent with `|s`.
    Set(String),
}

/// A single parsed statsd measurement.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsdMetric {
    /// The sanitized metric name.
    pub name: String,
    /// The measurement.
    pub value: StatsdValue,
}

impl StatsdMetric {
    /// Parses all measurements in a single line.
    ///
    /// ```text
    /// <name>:<value>|<type>[|@<rate>][:<value>|<type>[|@<rate>] ...]
    /// ```
    pub fn parse_line(line: &str) -> Result<Vec<Self>, ParseStatsdError> {
        let (name, values) = line
            .split_once(VALUE_SEPARATOR)
            .ok_or_else(|| ParseStatsdError::MissingValue(line.to_owned()))?;

        let name = sanitize_name(name);
        if name.is_empty() {
            return Err(ParseStatsdError::EmptyName);
        }

        values
            .split(VALUE_SEPARATOR)
            .map(|component| {
                Ok(Self {
                    name: name.clone(),
                    value: parse_value(&name, component)?,
                })
            })
            .collect()
    }

    /// Parses all lines of a datagram.
    ///
    /// Empty lines are skipped and both `\n` and `\r\n` line endings are supported. Every line
    /// yields its own result, so a malformed line does not affect the others.
    pub fn parse_all(slice: &[u8]) -> ParseStatsd<'_> {
        ParseStatsd { slice }
    }
}

fn parse_value(name: &str, component: &str) -> Result<StatsdValue, ParseStatsdError> {
    let mut fields = component.split('|');
    let value = fields.next().unwrap_or_default().trim();
    if value.is_empty() {
        return Err(ParseStatsdError::MissingValue(name.to_owned()));
    }

    let ty = fields
        .next()
        .ok_or_else(|| ParseStatsdError::MissingType(name.to_owned()))?
        .trim();

    let mut sample_rate = 1.0;
    for field in fields {
        if let Some(rate) = field.strip_prefix('@') {
            sample_rate = rate
                .parse()
                .ok()
                .filter(|r: &f64| *r > 0.0 && *r <= 1.0)
                .ok_or_else(|| ParseStatsdError::InvalidSampleRate(rate.to_owned()))?;
        }
    }

    let number = || {
        value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ParseStatsdError::InvalidValue(value.to_owned()))
    };

    Ok(match ty {
        "c" => StatsdValue::Counter {
            value: number()?,
            sample_rate,
        },
        "g" => StatsdValue::Gauge {
            value: number()?,
            delta: value.starts_with(['+', '-']),
        },
        "ms" | "h" => StatsdValue::Timer(number()?),
        "s" => StatsdValue::Set(value.to_owned()),
        other => return Err(ParseStatsdError::UnknownType(other.to_owned())),
    })
}

/// Normalizes a metric name to characters that are safe in dotted names.
///
/// Whitespace runs become `_`, slashes become `-`, and everything except ASCII alphanumerics,
/// `_`, `-` and `.` is removed.
fn sanitize_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    let mut in_whitespace = false;

    for c in name.trim().chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                sanitized.push('_');
            }
            in_whitespace = true;
            continue;
        }

        in_whitespace = false;
        match c {
            '/' => sanitized.push('-'),
            c if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') => sanitized.push(c),
            _ => (),
        }
    }

    sanitized
}

/// Iterator over parsed lines returned from [`StatsdMetric::parse_all`].
#[derive(Clone, Debug, Default)]
pub struct ParseStatsd<'a> {
    slice: &'a [u8],
}

impl Iterator for ParseStatsd<'_> {
    type Item = Result<Vec<StatsdMetric>, ParseStatsdError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.slice.is_empty() {
                return None;
            }

            let mut split = self.slice.splitn(2, |&b| b == b'\n');
            let current = split.next()?;
            self.slice = split.next().unwrap_or_default();

            let string = match std::str::from_utf8(current) {
                Ok(string) => string.strip_suffix('\r').unwrap_or(string),
                Err(_) => return Some(Err(ParseStatsdError::InvalidUtf8)),
            };

            if !string.trim().is_empty() {
                return Some(StatsdMetric::parse_line(string));
            }
        }
    }
}

impl FusedIterator for ParseStatsd<'_> {}
