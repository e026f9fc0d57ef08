use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ferry_auth::SecurityLevel;
use ferry_log::{LogConfig, LogLevel};
use ferry_metrics::{
    AggregatorConfig, ConverterRegistry, ConverterTemplate, NamingConfig, RegexTransform,
    RenameRule,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

type BoxedError = Box<dyn Error + Send + Sync + 'static>;

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field, either in the file or from a CLI override.
    Field(&'static str),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<BoxedError>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    #[inline]
    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Into<BoxedError>,
    {
        Self {
            cause: Some(cause.into()),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn for_field<E>(cause: E, field: &'static str) -> Self
    where
        E: Into<BoxedError>,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(path.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::Field(name);
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConfigErrorSource::None => self.kind.fmt(f),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
            ConfigErrorSource::Field(name) => write!(f, "{} (field {})", self.kind, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to serialize the configuration.
    #[error("could not write config")]
    CouldNotWrite,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
    /// A security level above `none` is required, but no auth file is configured.
    #[error("collectd security level requires an auth file")]
    MissingAuthFile,
    /// No sink is configured.
    #[error("no sinks configured")]
    NoSinks,
    /// All listeners are disabled.
    #[error("no listeners enabled")]
    NoListeners,
    /// Two sinks share the same name.
    #[error("duplicate sink name")]
    DuplicateSink,
}

trait ConfigObject: DeserializeOwned + Serialize {
    /// The basename of the config file.
    fn name() -> &'static str;

    /// The full filename of the config file, including the file extension.
    fn path(base: &Path) -> PathBuf {
        base.join(format!("{}.yml", Self::name()))
    }

    /// Loads the config file from a file within the given directory location.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        serde_yaml::from_reader(io::BufReader::new(f))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path))
    }
}

/// Overrides of configuration values from CLI parameters.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The log level.
    pub log_level: Option<String>,
    /// The UDP port of the collectd listener.
    pub collectd_port: Option<String>,
    /// The UDP port of the statsd listener.
    pub statsd_port: Option<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

/// Controls internal reporting of Ferry's own metrics to a statsd server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// Address of the statsd server, for example `127.0.0.1:8125`.
    ///
    /// Internal metrics are disabled if this is not set.
    pub statsd: Option<String>,
    /// Prefix of all emitted metric names.
    pub prefix: String,
    /// Tags added to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Name of a tag that carries the local hostname on every metric.
    pub hostname_tag: Option<String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "ferry".to_owned(),
            default_tags: BTreeMap::new(),
            hostname_tag: None,
        }
    }
}

/// The collectd binary protocol listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Collectd {
    /// Whether the listener is started.
    pub enabled: bool,
    /// The address to bind to.
    pub host: IpAddr,
    /// The UDP port to bind to.
    pub port: u16,
    /// Paths of types.db files, loaded in order. At least one must exist.
    pub types_db: Vec<PathBuf>,
    /// Minimum accepted security level of packets.
    pub security_level: SecurityLevel,
    /// Flat file with `username: secret` pairs for signed and encrypted packets.
    pub auth_file: Option<PathBuf>,
    /// Seconds between checks of the auth file for changes.
    pub auth_reload_interval: u64,
    /// Converters for specific plugins, by plugin name.
    pub converters: BTreeMap<String, ConverterTemplate>,
    /// Size of the receive buffer. Larger datagrams are truncated.
    pub max_packet_size: usize,
}

impl Default for Collectd {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: 25826,
            types_db: vec![PathBuf::from("/usr/share/collectd/types.db")],
            security_level: SecurityLevel::None,
            auth_file: None,
            auth_reload_interval: 5,
            converters: BTreeMap::new(),
            max_packet_size: 65535,
        }
    }
}

/// The statsd text protocol listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Statsd {
    /// Whether the listener is started.
    pub enabled: bool,
    /// The address to bind to.
    pub host: IpAddr,
    /// The UDP port to bind to.
    pub port: u16,
    /// Seconds between flushes of aggregated values.
    pub flush_interval: u64,
    /// Aggregation options.
    #[serde(flatten)]
    pub aggregator: AggregatorConfig,
}

impl Default for Statsd {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: 8125,
            flush_interval: 10,
            aggregator: AggregatorConfig::default(),
        }
    }
}

/// The optional transformer between listeners and sinks.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Processor {
    /// Whether the transformer is started.
    pub enabled: bool,
    /// Regular expressions, points with matching names are dropped.
    pub drop: Vec<String>,
    /// Substitutions applied to names in order.
    pub rename: Vec<RenameRule>,
}

/// The wire format used to deliver points to a sink.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkProtocol {
    /// One `name value timestamp` line per point.
    #[default]
    Plaintext,
    /// Length-prefixed pickled batches.
    Pickle,
}

/// A downstream Carbon server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Sink {
    /// Unique name of this sink, used in logs and metrics.
    pub name: String,
    /// Host name or address of the server.
    pub host: String,
    /// TCP port of the server.
    pub port: u16,
    /// The wire format.
    pub protocol: SinkProtocol,
    /// Seconds to wait before reconnecting.
    pub reconnect_delay: u64,
    /// Consecutive failed attempts after which the sink gives up.
    pub max_reconnects: u32,
    /// Maximum number of points per write.
    pub batch_size: usize,
    /// Capacity of the channel from the supervisor to this sink.
    pub channel_capacity: usize,
    /// Seconds after which a partial batch is written.
    pub flush_interval: u64,
    /// Seconds a single write may block before it counts as a failed attempt.
    pub write_timeout: u64,
}

impl Default for Sink {
    fn default() -> Self {
        Self {
            name: "carbon".to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 2003,
            protocol: SinkProtocol::Plaintext,
            reconnect_delay: 5,
            max_reconnects: 3,
            batch_size: 300,
            channel_capacity: 1024,
            flush_interval: 1,
            write_timeout: 10,
        }
    }
}

impl Sink {
    /// The address to connect to.
    pub fn addr(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    /// Delay between reconnection attempts.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }

    /// Interval after which partial batches are written.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }

    /// Upper bound for writing a single batch, at least one second.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout.max(1))
    }
}

fn default_sinks() -> Vec<Sink> {
    vec![Sink::default()]
}

/// Controls the supervisor of all pipeline tasks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Supervisor {
    /// Milliseconds between liveness checks of all tasks.
    pub poll_interval_ms: u64,
    /// Seconds every task is given to stop after a shutdown before it is aborted.
    pub shutdown_grace_period: u64,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            shutdown_grace_period: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
struct ConfigValues {
    logging: LogConfig,
    metrics: Metrics,
    collectd: Collectd,
    statsd: Statsd,
    naming: NamingConfig,
    processor: Processor,
    #[serde(default = "default_sinks")]
    sinks: Vec<Sink>,
    supervisor: Supervisor,
}

impl Default for ConfigValues {
    fn default() -> Self {
        Self {
            logging: LogConfig::default(),
            metrics: Metrics::default(),
            collectd: Collectd::default(),
            statsd: Statsd::default(),
            naming: NamingConfig::default(),
            processor: Processor::default(),
            sinks: default_sinks(),
            supervisor: Supervisor::default(),
        }
    }
}

impl ConfigObject for ConfigValues {
    fn name() -> &'static str {
        "config"
    }
}

/// Config struct.
#[derive(Clone, Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// The folder must contain a `config.yml` file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = std::env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        Ok(Self {
            values: ConfigValues::load(&path)?,
            path,
        })
    }

    /// Creates a config from a YAML string.
    ///
    /// This is mostly useful for tests.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            values: serde_yaml::from_str(yaml)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))?,
            path: PathBuf::new(),
        })
    }

    /// Serializes the effective configuration to YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWrite))
    }

    /// Overrides configuration with values coming from CLI parameters.
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(level) = overrides.log_level {
            self.values.logging.level = level
                .parse::<LogLevel>()
                .map_err(|e| ConfigError::for_field(e, "log_level"))?;
        }

        if let Some(port) = overrides.collectd_port {
            self.values.collectd.port = port
                .parse()
                .map_err(|e| ConfigError::for_field(e, "collectd_port"))?;
        }

        if let Some(port) = overrides.statsd_port {
            self.values.statsd.port = port
                .parse()
                .map_err(|e| ConfigError::for_field(e, "statsd_port"))?;
        }

        Ok(self)
    }

    /// Checks the configuration for values that prevent a startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let collectd = &self.values.collectd;
        if collectd.enabled
            && collectd.security_level > SecurityLevel::None
            && collectd.auth_file.is_none()
        {
            return Err(ConfigError::new(ConfigErrorKind::MissingAuthFile).field("collectd"));
        }

        if !collectd.enabled && !self.values.statsd.enabled {
            return Err(ConfigError::new(ConfigErrorKind::NoListeners));
        }

        if self.values.sinks.is_empty() {
            return Err(ConfigError::new(ConfigErrorKind::NoSinks).field("sinks"));
        }

        let mut names = BTreeSet::new();
        for sink in &self.values.sinks {
            if !names.insert(sink.name.as_str()) {
                return Err(ConfigError::new(ConfigErrorKind::DuplicateSink).field("sinks"));
            }

            if sink.batch_size == 0 || sink.channel_capacity == 0 {
                return Err(ConfigError::new(ConfigErrorKind::InvalidValue).field("sinks"));
            }
        }

        ConverterRegistry::from_config(&collectd.converters)
            .map_err(|e| ConfigError::for_field(e, "collectd.converters"))?;

        if self.values.processor.enabled {
            self.regex_transform()?;
        }

        Ok(())
    }

    /// Returns the path of the config folder.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the internal metrics configuration.
    pub fn metrics(&self) -> &Metrics {
        &self.values.metrics
    }

    /// Returns the collectd listener configuration.
    pub fn collectd(&self) -> &Collectd {
        &self.values.collectd
    }

    /// Returns the socket address of the collectd listener.
    pub fn collectd_addr(&self) -> SocketAddr {
        SocketAddr::new(self.values.collectd.host, self.values.collectd.port)
    }

    /// Returns the interval between checks of the auth file.
    pub fn auth_reload_interval(&self) -> Duration {
        Duration::from_secs(self.values.collectd.auth_reload_interval.max(1))
    }

    /// Builds the converter registry from the configured templates and built-in extensions.
    pub fn converter_registry(&self) -> Result<ConverterRegistry, ConfigError> {
        ConverterRegistry::from_config(&self.values.collectd.converters)
            .map_err(|e| ConfigError::for_field(e, "collectd.converters"))
    }

    /// Returns the statsd listener configuration.
    pub fn statsd(&self) -> &Statsd {
        &self.values.statsd
    }

    /// Returns the socket address of the statsd listener.
    pub fn statsd_addr(&self) -> SocketAddr {
        SocketAddr::new(self.values.statsd.host, self.values.statsd.port)
    }

    /// Returns the interval between statsd flushes.
    pub fn statsd_flush_interval(&self) -> Duration {
        Duration::from_secs(self.values.statsd.flush_interval.max(1))
    }

    /// Returns the naming options.
    pub fn naming(&self) -> &NamingConfig {
        &self.values.naming
    }

    /// Returns the transformer configuration.
    pub fn processor(&self) -> &Processor {
        &self.values.processor
    }

    /// Compiles the configured drop and rename rules.
    pub fn regex_transform(&self) -> Result<RegexTransform, ConfigError> {
        let processor = &self.values.processor;
        RegexTransform::new(&processor.drop, &processor.rename)
            .map_err(|e| ConfigError::for_field(e, "processor"))
    }

    /// Returns all configured sinks.
    pub fn sinks(&self) -> &[Sink] {
        &self.values.sinks
    }

    /// Returns the interval between liveness checks.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.values.supervisor.poll_interval_ms.max(1))
    }

    /// Returns the grace period given to every task on shutdown.
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.values.supervisor.shutdown_grace_period)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml_str("{}").unwrap();

        assert_eq!(config.collectd_addr(), "0.0.0.0:25826".parse::<SocketAddr>().unwrap());
        assert!(!config.statsd().enabled);
        assert_eq!(config.sinks().len(), 1);
        assert_eq!(config.sinks()[0].addr(), ("127.0.0.1", 2003));
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.naming().replace_char, '_');
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full() {
        let yaml = r#"
logging:
  level: debug
  format: json
collectd:
  port: 25827
  types_db: [/etc/types.db, /etc/custom.db]
  security_level: sign
  auth_file: /etc/collectd/passwd
  converters:
    df:
      parts: [disk, "{plugin_instance}"]
      priority: 2
statsd:
  enabled: true
  flush_interval: 60
  legacy_namespace: false
processor:
  enabled: true
  drop: ['\.idle$']
  rename:
    - pattern: '^web'
      replacement: 'frontend'
sinks:
  - name: primary
    host: carbon.local
    protocol: pickle
    batch_size: 500
  - name: secondary
    port: 2103
"#;

        let config = Config::from_yaml_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.logging().level, "debug".parse::<LogLevel>().unwrap());
        assert_eq!(config.collectd().security_level, SecurityLevel::Sign);
        assert_eq!(config.collectd().types_db.len(), 2);
        assert_eq!(config.collectd().converters["df"].priority, 2);
        assert_eq!(config.statsd_flush_interval(), Duration::from_secs(60));
        assert!(!config.statsd().aggregator.legacy_namespace);

        let sinks = config.sinks();
        assert_eq!(sinks[0].protocol, SinkProtocol::Pickle);
        assert_eq!(sinks[0].port, 2003);
        assert_eq!(sinks[0].batch_size, 500);
        assert_eq!(sinks[1].name, "secondary");
        assert_eq!(sinks[1].host, "127.0.0.1");
    }

    #[test]
    fn test_missing_auth_file() {
        let config = Config::from_yaml_str("collectd: {security_level: encrypt}").unwrap();
        let error = config.validate().unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::MissingAuthFile);
        assert_eq!(
            error.to_string(),
            "collectd security level requires an auth file (field collectd)"
        );
    }

    #[test]
    fn test_no_sinks() {
        let config = Config::from_yaml_str("sinks: []").unwrap();
        assert_eq!(config.validate().unwrap_err().kind(), ConfigErrorKind::NoSinks);
    }

    #[test]
    fn test_no_listeners() {
        let config = Config::from_yaml_str("collectd: {enabled: false}").unwrap();
        assert_eq!(
            config.validate().unwrap_err().kind(),
            ConfigErrorKind::NoListeners
        );
    }

    #[test]
    fn test_duplicate_sink() {
        let config = Config::from_yaml_str("sinks: [{name: a}, {name: a, port: 2004}]").unwrap();
        assert_eq!(
            config.validate().unwrap_err().kind(),
            ConfigErrorKind::DuplicateSink
        );
    }

    #[test]
    fn test_invalid_regex() {
        let config = Config::from_yaml_str("processor: {enabled: true, drop: ['(']}").unwrap();
        let error = config.validate().unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
        assert!(error.source().is_some());
    }

    #[test]
    fn test_invalid_converter_template() {
        let yaml = "collectd: {converters: {cpu: {parts: ['{bogus}']}}}";
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(
            config.validate().unwrap_err().kind(),
            ConfigErrorKind::InvalidValue
        );
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config
            .apply_override(OverridableConfig {
                log_level: Some("trace".to_owned()),
                collectd_port: Some("1234".to_owned()),
                statsd_port: Some("4321".to_owned()),
            })
            .unwrap();

        assert_eq!(config.logging().level, "trace".parse::<LogLevel>().unwrap());
        assert_eq!(config.collectd().port, 1234);
        assert_eq!(config.statsd().port, 4321);

        let error = config
            .apply_override(OverridableConfig {
                collectd_port: Some("not-a-port".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(error.to_string(), "invalid config value (field collectd_port)");
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yml"), "statsd: {enabled: true}\n").unwrap();

        let config = Config::from_path(dir.path()).unwrap();
        assert!(config.statsd().enabled);
        assert_eq!(config.path(), dir.path());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::CouldNotOpenFile);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = Config::default();
        let yaml = config.to_yaml_string().unwrap();
        let parsed = Config::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.to_yaml_string().unwrap(), yaml);
    }
}
