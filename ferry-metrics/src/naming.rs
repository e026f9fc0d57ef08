use serde::{Deserialize, Serialize};

/// Options for assembling dotted metric names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Dotted prefix prepended to every name, for example `servers`.
    pub prefix: Option<String>,
    /// Dotted postfix appended to every name.
    pub postfix: Option<String>,
    /// Replacement for whitespace, dots and slashes within a single name segment.
    pub replace_char: char,
    /// Collapse consecutive identical segments into one.
    pub strip_duplicates: bool,
    /// Domain suffixes removed from host names, for example `example.com`.
    pub host_trim: Vec<String>,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            postfix: None,
            replace_char: '_',
            strip_duplicates: true,
            host_trim: Vec::new(),
        }
    }
}

/// Assembles dotted metric names from a host and converter parts.
///
/// Names are built as `[prefix].[host].[parts].[postfix]`, where the host always forms a single
/// segment and the prefix and postfix may span several.
///
/// ```
/// use ferry_metrics::{MetricNamer, NamingConfig};
///
/// let namer = MetricNamer::new(NamingConfig {
///     prefix: Some("servers".to_owned()),
///     host_trim: vec!["example.com".to_owned()],
///     ..Default::default()
/// });
///
/// let name = namer.name("web01.dc1.example.com", &["cpu", "0", "idle"]);
/// assert_eq!(name.as_deref(), Some("servers.web01_dc1.cpu.0.idle"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct MetricNamer {
    config: NamingConfig,
}

impl MetricNamer {
    /// Creates a namer with the given options.
    pub fn new(config: NamingConfig) -> Self {
        Self { config }
    }

    /// Builds the dotted name, or `None` if no segments remain.
    pub fn name<S: AsRef<str>>(&self, host: &str, parts: &[S]) -> Option<String> {
        let mut segments: Vec<String> = Vec::with_capacity(parts.len() + 3);

        if let Some(prefix) = &self.config.prefix {
            segments.extend(split_dotted(prefix));
        }

        let host = self.sanitize(self.trim_host(host));
        if !host.is_empty() {
            segments.push(host);
        }

        for part in parts {
            let part = self.sanitize(part.as_ref());
            if !part.is_empty() {
                segments.push(part);
            }
        }

        if let Some(postfix) = &self.config.postfix {
            segments.extend(split_dotted(postfix));
        }

        if self.config.strip_duplicates {
            segments.dedup();
        }

        if segments.is_empty() {
            return None;
        }

        Some(segments.join("."))
    }

    fn trim_host<'a>(&self, host: &'a str) -> &'a str {
        let mut host = host.trim();

        for suffix in &self.config.host_trim {
            let suffix = suffix.trim_start_matches('.');
            let stripped = host.strip_suffix(suffix).and_then(|h| h.strip_suffix('.'));
            if let Some(stripped) = stripped {
                host = stripped;
            }
        }

        host
    }

    /// Turns an arbitrary string into a single name segment.
    fn sanitize(&self, part: &str) -> String {
        part.trim()
            .chars()
            .map(|c| match c {
                '.' | '/' => self.config.replace_char,
                c if c.is_whitespace() => self.config.replace_char,
                c => c,
            })
            .collect()
    }
}

fn split_dotted(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split('.').filter(|s| !s.is_empty()).map(str::to_owned)
}
