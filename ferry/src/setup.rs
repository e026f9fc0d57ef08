use anyhow::{Context, Result};
use ferry_auth::AuthStore;
use ferry_collectd::TypeRegistry;
use ferry_config::Config;
use ferry_statsd::MetricsConfig;

/// Validates the config and loads all files it refers to.
pub fn check_config(config: &Config) -> Result<()> {
    config.validate()?;

    let collectd = config.collectd();
    if !collectd.enabled {
        return Ok(());
    }

    let types = TypeRegistry::load(&collectd.types_db).context("could not load types.db")?;
    ferry_log::info!("  collectd types: {}", types.len());

    if let Some(path) = &collectd.auth_file {
        let store = AuthStore::open(path.clone())
            .with_context(|| format!("could not load auth file {}", path.display()))?;
        ferry_log::info!("  collectd users: {}", store.credentials().len());
    }

    Ok(())
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        ferry_log::info!("launching ferry without config folder");
    } else {
        ferry_log::info!(
            "launching ferry from config folder {}",
            config.path().display()
        );
    }

    let collectd = config.collectd();
    if collectd.enabled {
        ferry_log::info!(
            "  collectd: {} (security level {})",
            config.collectd_addr(),
            collectd.security_level
        );
    } else {
        ferry_log::info!("  collectd: -");
    }

    if config.statsd().enabled {
        ferry_log::info!("  statsd: {}", config.statsd_addr());
    } else {
        ferry_log::info!("  statsd: -");
    }

    for sink in config.sinks() {
        ferry_log::info!(
            "  sink {}: {}:{} ({:?})",
            sink.name,
            sink.host,
            sink.port,
            sink.protocol
        );
    }

    ferry_log::info!("  log level: {}", config.logging().level);
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let metrics = config.metrics();
    let Some(host) = &metrics.statsd else {
        return Ok(());
    };

    let mut default_tags = metrics.default_tags.clone();
    if let Some(hostname_tag) = &metrics.hostname_tag {
        if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
            default_tags.insert(hostname_tag.clone(), hostname);
        }
    }

    ferry_statsd::init(MetricsConfig {
        prefix: metrics.prefix.clone(),
        host: host.clone(),
        default_tags,
    })?;

    Ok(())
}
