use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::ValueKind;

/// An error returned when loading a types database fails.
#[derive(Debug, thiserror::Error)]
pub enum TypesDbError {
    /// None of the given files exists.
    #[error("no types.db could be loaded from {}", display_paths(.0))]
    NoTypesDb(Vec<PathBuf>),
    /// A file exists but could not be read.
    #[error("could not read types.db at {}", .path.display())]
    Io {
        /// The path of the unreadable file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    let paths: Vec<_> = paths.iter().map(|p| p.display().to_string()).collect();
    paths.join(", ")
}

/// A single value declared by a type definition.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSource {
    /// The name of the value, for example `rx` or `value`.
    pub name: String,
    /// The declared kind.
    pub kind: ValueKind,
    /// Lower bound of valid computed values, `None` if unbounded.
    pub min: Option<f64>,
    /// Upper bound of valid computed values, `None` if unbounded.
    pub max: Option<f64>,
}

impl DataSource {
    /// Returns `true` if the value lies within the declared bounds.
    pub fn contains(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

/// The ordered list of values a collectd type is made of.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeDefinition {
    name: String,
    sources: Vec<DataSource>,
}

impl TypeDefinition {
    /// The name of this type.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared values in wire order.
    pub fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    /// Looks up a declared value by name.
    pub fn source(&self, value_name: &str) -> Option<&DataSource> {
        self.sources.iter().find(|s| s.name == value_name)
    }

    /// Parses one line of a types.db file.
    ///
    /// Returns `None` for blank lines, comments and lines that are malformed.
    fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (name, rest) = line.split_once(char::is_whitespace)?;
        let sources = rest
            .split(',')
            .map(|spec| DataSource::parse(spec.trim()))
            .collect::<Option<Vec<_>>>()?;

        if sources.is_empty() {
            return None;
        }

        Some(Self {
            name: name.to_owned(),
            sources,
        })
    }
}

impl DataSource {
    fn parse(spec: &str) -> Option<Self> {
        let mut parts = spec.split(':');
        let name = parts.next().filter(|n| !n.is_empty())?;
        let kind = parts.next()?.parse().ok()?;
        let min = parse_bound(parts.next()?)?;
        let max = parse_bound(parts.next()?)?;

        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            name: name.to_owned(),
            kind,
            min,
            max,
        })
    }
}

/// Parses a bound, where `U` means unbounded.
fn parse_bound(s: &str) -> Option<Option<f64>> {
    match s {
        "U" => Some(None),
        _ => s.parse().ok().map(Some),
    }
}

/// The collection of type definitions loaded from one or more types.db files.
///
/// The registry is immutable once loaded and shared between listeners.
#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, TypeDefinition>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads all given files that exist, in order.
    ///
    /// Files that do not exist are skipped with a warning, but at least one of them must exist.
    /// A type declared in more than one file takes the definition of the last file, replacing
    /// the earlier one entirely.
    pub fn load<I, P>(paths: I) -> Result<Self, TypesDbError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut registry = Self::new();
        let mut attempted = Vec::new();
        let mut loaded = 0;

        for path in paths {
            let path = path.as_ref();
            attempted.push(path.to_owned());

            let content = match fs::read_to_string(path) {
                Ok(content) => content,
                Err(error) if error.kind() == io::ErrorKind::NotFound => {
                    ferry_log::warn!("types.db not found at {}", path.display());
                    continue;
                }
                Err(source) => {
                    return Err(TypesDbError::Io {
                        path: path.to_owned(),
                        source,
                    });
                }
            };

            let count = registry.extend_from_str(&content);
            ferry_log::debug!("loaded {count} types from {}", path.display());
            loaded += 1;
        }

        if loaded == 0 {
            return Err(TypesDbError::NoTypesDb(attempted));
        }

        Ok(registry)
    }

    /// Adds all definitions in the given types.db content and returns how many were parsed.
    pub fn extend_from_str(&mut self, content: &str) -> usize {
        let mut count = 0;

        for (index, line) in content.lines().enumerate() {
            match TypeDefinition::parse_line(line) {
                Some(definition) => {
                    self.insert(definition);
                    count += 1;
                }
                None => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() && !trimmed.starts_with('#') {
                        ferry_log::warn!(line = index + 1, "skipping malformed types.db entry");
                    }
                }
            }
        }

        count
    }

    /// Inserts a definition, replacing any existing definition of the same name.
    pub fn insert(&mut self, definition: TypeDefinition) {
        self.types.insert(definition.name.clone(), definition);
    }

    /// Returns the definition of the given type.
    pub fn get(&self, type_name: &str) -> Option<&TypeDefinition> {
        self.types.get(type_name)
    }

    /// The number of known types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns `true` if no types are known.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl TypeDefinition {
    /// Creates a definition from its parts.
    pub fn new(name: impl Into<String>, sources: Vec<DataSource>) -> Self {
        Self {
            name: name.into(),
            sources,
        }
    }
}
