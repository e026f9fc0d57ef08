use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::ArgMatches;
use ferry_config::{Config, OverridableConfig};

use crate::cliapp::make_app;
use crate::setup;

/// Folder that holds `config.yml` when `--config` is not passed.
const DEFAULT_CONFIG_PATH: &str = ".ferry";

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();
    let config_path = matches
        .get_one::<PathBuf>("config")
        .map_or(Path::new(DEFAULT_CONFIG_PATH), PathBuf::as_path);

    let mut config = Config::from_path(config_path)?;

    if let Some(("run", run_matches)) = matches.subcommand() {
        config.apply_override(extract_config_args(run_matches))?;
    }

    ferry_log::init(config.logging());

    match matches.subcommand() {
        Some(("run", _)) => run(config),
        Some(("config", config_matches)) => manage_config(&config, config_matches),
        Some(("check", _)) => check(&config),
        _ => unreachable!(),
    }
}

/// Extracts the overridable config values from the arguments of `run`.
///
/// Values are either passed on the command line or through `FERRY_*` environment variables.
fn extract_config_args(matches: &ArgMatches) -> OverridableConfig {
    OverridableConfig {
        log_level: matches.get_one("log_level").cloned(),
        collectd_port: matches.get_one("collectd_port").cloned(),
        statsd_port: matches.get_one("statsd_port").cloned(),
    }
}

pub fn manage_config(config: &Config, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("show", _)) => show_config(config),
        _ => unreachable!(),
    }
}

#[allow(clippy::print_stdout)]
fn show_config(config: &Config) -> Result<()> {
    print!("{}", config.to_yaml_string()?);
    Ok(())
}

pub fn check(config: &Config) -> Result<()> {
    setup::check_config(config)?;
    ferry_log::info!("config is valid");
    Ok(())
}

pub fn run(config: Config) -> Result<()> {
    setup::dump_spawn_infos(&config);
    setup::check_config(&config)?;
    setup::init_metrics(&config)?;

    ferry_server::run(config)?;
    Ok(())
}
