use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::MetricPoint;

/// A pure function applied to every point before delivery.
///
/// Returning `None` drops the point.
pub trait Transform: Send + Sync {
    /// Transforms a single point.
    fn apply(&self, point: MetricPoint) -> Option<MetricPoint>;
}

impl<F> Transform for F
where
    F: Fn(MetricPoint) -> Option<MetricPoint> + Send + Sync,
{
    fn apply(&self, point: MetricPoint) -> Option<MetricPoint> {
        self(point)
    }
}

/// A regex substitution applied to metric names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenameRule {
    /// The pattern to search for.
    pub pattern: String,
    /// The replacement, which may reference capture groups as `$1` or `${name}`.
    pub replacement: String,
}

/// Drops and renames points by their name.
///
/// A point is dropped if its name matches any of the drop patterns. Otherwise, all rename rules
/// are applied in order, each to the result of the previous one. Points that end up with an
/// empty name are dropped.
#[derive(Clone, Debug, Default)]
pub struct RegexTransform {
    drop: Vec<Regex>,
    rename: Vec<(Regex, String)>,
}

impl RegexTransform {
    /// Compiles the given drop patterns and rename rules.
    pub fn new<S: AsRef<str>>(drop: &[S], rename: &[RenameRule]) -> Result<Self, regex::Error> {
        let drop = drop
            .iter()
            .map(|pattern| Regex::new(pattern.as_ref()))
            .collect::<Result<_, _>>()?;

        let rename = rename
            .iter()
            .map(|rule| Ok((Regex::new(&rule.pattern)?, rule.replacement.clone())))
            .collect::<Result<_, regex::Error>>()?;

        Ok(Self { drop, rename })
    }
}

impl Transform for RegexTransform {
    fn apply(&self, mut point: MetricPoint) -> Option<MetricPoint> {
        if self.drop.iter().any(|regex| regex.is_match(&point.name)) {
            return None;
        }

        for (regex, replacement) in &self.rename {
            if let std::borrow::Cow::Owned(name) = regex.replace_all(&point.name, replacement) {
                point.name = name;
            }
        }

        if point.name.is_empty() {
            return None;
        }

        Some(point)
    }
}
