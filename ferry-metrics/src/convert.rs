use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ferry_collectd::Sample;
use serde::{Deserialize, Serialize};

/// Priority of the compiled-in extension converters.
pub const EXTENSION_PRIORITY: i32 = -1;

/// The placeholder value and type name that is left out of metric names.
const PLACEHOLDER: &str = "value";

/// An error returned when a sample cannot be converted into name parts.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConvertError {
    /// A template references a field that does not exist.
    #[error("unknown placeholder {{{0}}} in converter template")]
    UnknownPlaceholder(String),
    /// A template contains an opening brace without a matching closing brace.
    #[error("unclosed placeholder in converter template part {0:?}")]
    UnclosedPlaceholder(String),
    /// A field required by the converter is empty in the sample.
    #[error("{plugin} sample is missing {field}")]
    MissingField {
        /// The plugin of the sample.
        plugin: String,
        /// The name of the missing field.
        field: &'static str,
    },
}

/// Maps a decoded sample to the parts of its metric name.
///
/// Returning `Ok(None)` drops the sample silently. Errors drop the sample and are logged.
pub trait Converter: Send + Sync {
    /// Returns the name parts for the given sample.
    fn convert(&self, sample: &Sample) -> Result<Option<Vec<String>>, ConvertError>;
}

impl<F> Converter for F
where
    F: Fn(&Sample) -> Result<Option<Vec<String>>, ConvertError> + Send + Sync,
{
    fn convert(&self, sample: &Sample) -> Result<Option<Vec<String>>, ConvertError> {
        self(sample)
    }
}

/// The converter used for plugins without a registered converter.
///
/// Builds `plugin[.plugin_instance][.type][.type_instance][.value_name]`, omitting empty fields
/// and the placeholder name `value` for the type and value name.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultConverter;

impl Converter for DefaultConverter {
    fn convert(&self, sample: &Sample) -> Result<Option<Vec<String>>, ConvertError> {
        let mut parts = vec![sample.plugin.clone()];
        push_set(&mut parts, &sample.plugin_instance);
        if sample.type_name != PLACEHOLDER {
            push_set(&mut parts, &sample.type_name);
        }
        push_set(&mut parts, &sample.type_instance);
        if sample.value_name != PLACEHOLDER {
            push_set(&mut parts, &sample.value_name);
        }

        Ok(Some(parts))
    }
}

fn push_set(parts: &mut Vec<String>, field: &str) {
    if !field.is_empty() {
        parts.push(field.to_owned());
    }
}

fn require(sample: &Sample, field: Field) -> Result<String, ConvertError> {
    let value = field.get(sample);
    if value.is_empty() {
        return Err(ConvertError::MissingField {
            plugin: sample.plugin.clone(),
            field: field.name(),
        });
    }

    Ok(value.to_owned())
}

fn cpu(sample: &Sample) -> Result<Option<Vec<String>>, ConvertError> {
    Ok(Some(vec![
        "cpu".to_owned(),
        require(sample, Field::PluginInstance)?,
        require(sample, Field::TypeInstance)?,
    ]))
}

fn memory(sample: &Sample) -> Result<Option<Vec<String>>, ConvertError> {
    Ok(Some(vec![
        "memory".to_owned(),
        require(sample, Field::TypeInstance)?,
    ]))
}

fn interface(sample: &Sample) -> Result<Option<Vec<String>>, ConvertError> {
    let mut parts = vec!["interface".to_owned()];
    push_set(&mut parts, &sample.plugin_instance);
    push_set(&mut parts, &sample.type_instance);
    parts.push(sample.type_name.clone());
    parts.push(sample.value_name.clone());
    Ok(Some(parts))
}

fn df(sample: &Sample) -> Result<Option<Vec<String>>, ConvertError> {
    let mut parts = vec!["df".to_owned()];
    push_set(&mut parts, &sample.plugin_instance);
    push_set(&mut parts, &sample.type_instance);
    if sample.value_name != PLACEHOLDER {
        parts.push(sample.value_name.clone());
    }
    Ok(Some(parts))
}

/// A field of a [`Sample`] that can be referenced from a template.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Field {
    Host,
    Plugin,
    PluginInstance,
    Type,
    TypeInstance,
    ValueName,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "host" => Self::Host,
            "plugin" => Self::Plugin,
            "plugin_instance" => Self::PluginInstance,
            "type" => Self::Type,
            "type_instance" => Self::TypeInstance,
            "value_name" => Self::ValueName,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Plugin => "plugin",
            Self::PluginInstance => "plugin_instance",
            Self::Type => "type",
            Self::TypeInstance => "type_instance",
            Self::ValueName => "value_name",
        }
    }

    fn get(self, sample: &Sample) -> &str {
        match self {
            Self::Host => &sample.host,
            Self::Plugin => &sample.plugin,
            Self::PluginInstance => &sample.plugin_instance,
            Self::Type => &sample.type_name,
            Self::TypeInstance => &sample.type_instance,
            Self::ValueName => &sample.value_name,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Token {
    Literal(String),
    Field(Field),
}

/// Configuration of a converter built from a list of name part templates.
///
/// ```yaml
/// df:
///   parts: [disk, "{plugin_instance}", "{type_instance}"]
///   priority: 0
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConverterTemplate {
    /// Name part templates. Each part may mix literal text with `{field}` placeholders.
    pub parts: Vec<String>,
    /// Registration priority, higher wins over extension converters for the same plugin.
    #[serde(default)]
    pub priority: i32,
}

/// A converter that fills sample fields into name part templates.
///
/// Parts that expand to an empty string are skipped.
#[derive(Clone, Debug)]
pub struct TemplateConverter {
    parts: Vec<Vec<Token>>,
}

impl TemplateConverter {
    /// Parses the given part templates.
    pub fn parse<S: AsRef<str>>(parts: &[S]) -> Result<Self, ConvertError> {
        let parts = parts
            .iter()
            .map(|part| parse_template(part.as_ref()))
            .collect::<Result<_, _>>()?;

        Ok(Self { parts })
    }
}

fn parse_template(template: &str) -> Result<Vec<Token>, ConvertError> {
    let mut tokens = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        if start > 0 {
            tokens.push(Token::Literal(rest[..start].to_owned()));
        }

        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| ConvertError::UnclosedPlaceholder(template.to_owned()))?;

        let name = &after[..end];
        let field =
            Field::parse(name).ok_or_else(|| ConvertError::UnknownPlaceholder(name.to_owned()))?;
        tokens.push(Token::Field(field));
        rest = &after[end + 1..];
    }

    if !rest.is_empty() {
        tokens.push(Token::Literal(rest.to_owned()));
    }

    Ok(tokens)
}

impl Converter for TemplateConverter {
    fn convert(&self, sample: &Sample) -> Result<Option<Vec<String>>, ConvertError> {
        let mut parts = Vec::with_capacity(self.parts.len());

        for tokens in &self.parts {
            let mut part = String::new();
            for token in tokens {
                match token {
                    Token::Literal(literal) => part.push_str(literal),
                    Token::Field(field) => part.push_str(field.get(sample)),
                }
            }

            if !part.is_empty() {
                parts.push(part);
            }
        }

        Ok(Some(parts))
    }
}

/// Where a converter registration came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConverterSource {
    /// Static configuration.
    Config,
    /// Discovered extensions, including the compiled-in catalog.
    Extension,
}

impl fmt::Display for ConverterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => f.write_str("config"),
            Self::Extension => f.write_str("extension"),
        }
    }
}

/// A converter offered for discovery.
#[derive(Clone)]
pub struct Extension {
    /// The plugin this converter handles.
    pub plugin: String,
    /// The registration priority.
    pub priority: i32,
    /// The converter.
    pub converter: Arc<dyn Converter>,
}

impl Extension {
    /// Creates an extension with the default extension priority.
    pub fn new(plugin: impl Into<String>, converter: Arc<dyn Converter>) -> Self {
        Self {
            plugin: plugin.into(),
            priority: EXTENSION_PRIORITY,
            converter,
        }
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("plugin", &self.plugin)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Returns the compiled-in catalog of extension converters.
pub fn builtin_extensions() -> Vec<Extension> {
    vec![
        Extension::new("cpu", Arc::new(cpu)),
        Extension::new("memory", Arc::new(memory)),
        Extension::new("interface", Arc::new(interface)),
        Extension::new("df", Arc::new(df)),
    ]
}

#[derive(Clone)]
struct Registration {
    priority: i32,
    source: ConverterSource,
    converter: Arc<dyn Converter>,
}

/// Converters by plugin name, with a fallback to the [`DefaultConverter`].
///
/// When two registrations target the same plugin, the higher priority wins. On equal priority
/// the first registration is kept, which is why static configuration has to be registered before
/// discovery runs.
#[derive(Clone, Default)]
pub struct ConverterRegistry {
    converters: HashMap<String, Registration>,
}

impl ConverterRegistry {
    /// Creates a registry without any plugin specific converters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry from configured templates followed by the built-in extensions.
    pub fn from_config<'a, I>(templates: I) -> Result<Self, ConvertError>
    where
        I: IntoIterator<Item = (&'a String, &'a ConverterTemplate)>,
    {
        let mut registry = Self::new();

        for (plugin, template) in templates {
            let converter = TemplateConverter::parse(&template.parts)?;
            registry.register(
                plugin.clone(),
                template.priority,
                ConverterSource::Config,
                Arc::new(converter),
            );
        }

        registry.discover(builtin_extensions());
        Ok(registry)
    }

    /// Registers a converter for the given plugin.
    pub fn register(
        &mut self,
        plugin: String,
        priority: i32,
        source: ConverterSource,
        converter: Arc<dyn Converter>,
    ) {
        if let Some(existing) = self.converters.get(&plugin) {
            if existing.priority > priority {
                ferry_log::debug!(%plugin, %source, "ignoring converter with lower priority");
                return;
            }

            if existing.priority == priority {
                ferry_log::warn!(
                    %plugin,
                    priority,
                    kept = %existing.source,
                    ignored = %source,
                    "duplicate converter with equal priority, keeping the first one"
                );
                return;
            }
        }

        let registration = Registration {
            priority,
            source,
            converter,
        };
        self.converters.insert(plugin, registration);
    }

    /// Registers discovered extension converters.
    pub fn discover(&mut self, extensions: impl IntoIterator<Item = Extension>) {
        for extension in extensions {
            self.register(
                extension.plugin,
                extension.priority,
                ConverterSource::Extension,
                extension.converter,
            );
        }
    }

    /// Returns the source of the converter registered for a plugin.
    pub fn source(&self, plugin: &str) -> Option<ConverterSource> {
        self.converters.get(plugin).map(|r| r.source)
    }

    /// Converts a sample with the converter registered for its plugin.
    pub fn convert(&self, sample: &Sample) -> Result<Option<Vec<String>>, ConvertError> {
        match self.converters.get(&sample.plugin) {
            Some(registration) => registration.converter.convert(sample),
            None => DefaultConverter.convert(sample),
        }
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (plugin, registration) in &self.converters {
            map.entry(plugin, &(registration.source, registration.priority));
        }
        map.finish()
    }
}
