//! This module implements the definition of the command line app.

use std::path::PathBuf;

use clap::{Arg, Command, value_parser};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Forwards collectd and statsd metrics to Carbon.";

pub fn make_app() -> Command {
    Command::new("ferry")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("The path to the config folder."),
        )
        .subcommand(
            Command::new("run")
                .about("Run the pipeline")
                .after_help(
                    "This runs ferry in the foreground until it's shut down. It binds the \
                     listeners configured in the config file and connects to all sinks.",
                )
                .arg(
                    Arg::new("log_level")
                        .long("log-level")
                        .value_name("LEVEL")
                        .env("FERRY_LOG_LEVEL")
                        .help("The log level to use, overriding the config."),
                )
                .arg(
                    Arg::new("collectd_port")
                        .long("collectd-port")
                        .value_name("PORT")
                        .env("FERRY_COLLECTD_PORT")
                        .help("The UDP port of the collectd listener."),
                )
                .arg(
                    Arg::new("statsd_port")
                        .long("statsd-port")
                        .value_name("PORT")
                        .env("FERRY_STATSD_PORT")
                        .help("The UDP port of the statsd listener."),
                ),
        )
        .subcommand(
            Command::new("config")
                .subcommand_required(true)
                .arg_required_else_help(true)
                .about("Manage the ferry config")
                .subcommand(
                    Command::new("show")
                        .about("Show the entire config out for debugging purposes")
                        .after_help(
                            "This dumps out the effective config as YAML, including all \
                             default values.",
                        ),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Check the config and exit")
                .after_help(
                    "This validates the config file and loads the types.db files and the \
                     collectd auth file without starting any listener.",
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app() {
        make_app().debug_assert();
    }

    #[test]
    fn test_run_overrides() {
        let matches = make_app()
            .try_get_matches_from([
                "ferry",
                "--config",
                "/etc/ferry",
                "run",
                "--collectd-port",
                "25827",
            ])
            .unwrap();

        let config = matches.get_one::<PathBuf>("config").unwrap();
        assert_eq!(config, &PathBuf::from("/etc/ferry"));

        let (name, run) = matches.subcommand().unwrap();
        assert_eq!(name, "run");
        assert_eq!(
            run.get_one::<String>("collectd_port").map(String::as_str),
            Some("25827")
        );
    }

    #[test]
    fn test_config_requires_subcommand() {
        assert!(make_app().try_get_matches_from(["ferry", "config"]).is_err());
    }
}
