use clap::{arg, parser::ValueSource, value_parser, Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use monitors::config::{defaults, Config, FileConfig};
use std::path::PathBuf;

pub struct RunnerConfig {
    pub verbosity: LevelFilter,
    pub config_file: PathBuf,
    pub monitors: Config,
}

impl RunnerConfig {
    pub fn from_cli() -> anyhow::Result<Self> {
        let matches = Command::new("pmwatch")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Follows power management services on D-Bus and reports idle alarms")
            .args([
                arg!(-c --config <FILE> "Custom config file").value_parser(value_parser!(PathBuf)),
                arg!(--"suppress-timeout-ms" <MILLISECONDS> "How long idle alarms are suppressed after activity")
                    .value_parser(value_parser!(u32))
                    .default_value(defaults::suppress_timeout_ms().to_string()),
                Arg::new("verbosity")
                    .short('v')
                    .help("Verbosity level: -v for warnings, -vv for info, -vvv for debug, -vvvv for trace")
                    .action(ArgAction::Count),
            ])
            .get_matches();

        let mut config = FileConfig::new(matches.get_one::<PathBuf>("config").cloned())?;
        merge_cli(&mut config, &matches);

        Ok(Self {
            verbosity: verbosity(matches.get_count("verbosity")),
            config_file: config.config_file.clone(),
            monitors: config.into(),
        })
    }
}

fn verbosity(count: u8) -> LevelFilter {
    match count {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn merge_cli(config: &mut FileConfig, matches: &ArgMatches) {
    get_arg_value(
        "suppress-timeout-ms",
        matches,
        &mut config.idle.suppress_timeout_ms,
    );
}

fn get_arg_value<T>(id: &str, matches: &ArgMatches, config_value: &mut T)
where
    T: Clone + Send + Sync + 'static,
{
    if let Some(ValueSource::CommandLine) = matches.value_source(id) {
        if let Some(value) = matches.get_one::<T>(id) {
            *config_value = value.clone();
        }
    }
}
