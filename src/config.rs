//! Functions and structures related to configuring a swarm.
//!
//! A swarm can be configured at run time by passing in the options and flags defined
//! by the [`SwarmConfiguration`] structure, or programmatically through the setters on
//! [`Swarm`](../struct.Swarm.html). Command line options always win.
//!
//! The API key sent in the `x-api-key` header is read from `--api-key`, falling back
//! to the `API_SWARM_KEY` environment variable. The swarm refuses to start without one.

use gumdrop::Options;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::user::ThinkTime;
use crate::util;
use crate::SwarmError;

/// Environment variable the API key is read from when `--api-key` isn't passed.
pub const API_KEY_ENV: &str = "API_SWARM_KEY";

/// Header the API key is sent in.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Default minimum think-time, in seconds.
pub const DEFAULT_MIN_WAIT: f64 = 0.5;

/// Default maximum think-time, in seconds.
pub const DEFAULT_MAX_WAIT: f64 = 3.0;

/// Runtime options available when launching a swarm.
///
/// Leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive help from the below
/// structure.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"apiswarm simulates many concurrent clients of a JSON:API backend.

The following runtime options are available:"#
)]
pub struct SwarmConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Lists all scenarios and exits
    // Add a blank line after this option
    #[options(short = "l", help = "Lists all scenarios and exits\n")]
    pub list: bool,

    /// Defines host to load test (ie https://api.example.com)
    #[options(short = "H")]
    pub host: String,
    /// Sets the API key (default: $API_SWARM_KEY)
    #[options(short = "k", meta = "KEY")]
    pub api_key: String,
    /// Sets concurrent users (default: number of CPUs)
    #[options(short = "u")]
    pub users: Option<usize>,
    /// Sets per-second user hatch rate (default: 1)
    #[options(short = "r", meta = "RATE")]
    pub hatch_rate: Option<String>,
    /// Stops swarm after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Sets minimum think-time in seconds (default: 0.5)
    #[options(no_short, meta = "SECONDS")]
    pub min_wait: Option<f64>,
    /// Sets maximum think-time in seconds (default: 3.0)
    #[options(no_short, meta = "SECONDS")]
    pub max_wait: Option<f64>,
    /// Limits swarm to only specified scenarios
    #[options(no_short, meta = "\"SCENARIO\"")]
    pub scenarios: ScenarioFilter,

    /// Enables log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases verbosity (-q, -qq, etc)
    #[options(count, short = "q", help = "Decreases verbosity (-q, -qq, etc)")]
    pub quiet: u8,
    /// Increases verbosity (-v, -vv, etc)
    #[options(
        count,
        short = "v",
        // Add a blank line and then a 'Metrics:' header after this option
        help = "Increases verbosity (-v, -vv, etc)\n\nMetrics:"
    )]
    pub verbose: u8,

    /// Sets request log file name
    #[options(short = "R", meta = "NAME")]
    pub request_log: String,
    /// Doesn't display metrics at end of swarm
    #[options(no_short)]
    pub no_print_metrics: bool,
}

/// Optionally restricts a swarm to scenarios whose name contains one of these
/// (lowercase) strings.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioFilter {
    pub active: Vec<String>,
}
/// Implement [`FromStr`] to convert `"foo,bar"` comma separated string to a vector of strings.
impl FromStr for ScenarioFilter {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut active: Vec<String> = Vec::new();
        for line in s.split(',') {
            // Ignore white space and case.
            let scenario = line.trim().to_lowercase();
            if scenario.is_empty() {
                // Logger isn't initialized yet, provide helpful debug output.
                eprintln!("ERROR: invalid `--scenarios` value: '{}'", s);
                eprintln!("  Expected format: --scenarios \"{{one}},{{two}},{{three}}\"");
                eprintln!("    To view valid scenario names invoke `--list`");
                return Err(SwarmError::InvalidOption {
                    option: "--scenarios".to_string(),
                    value: s.to_string(),
                    detail: "empty scenario name in --scenarios".to_string(),
                });
            }
            active.push(scenario);
        }
        Ok(ScenarioFilter { active })
    }
}

/// Defaults set programmatically on a [`Swarm`](../struct.Swarm.html), used for any
/// option not passed on the command line.
#[derive(Debug, Clone, Default)]
pub(crate) struct SwarmDefaults {
    pub host: Option<String>,
    pub users: Option<usize>,
    pub hatch_rate: Option<f64>,
    pub run_time: Option<u64>,
    pub min_wait: Option<f64>,
    pub max_wait: Option<f64>,
}

/// Fully validated settings a swarm runs with.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub host: Url,
    /// Request headers every user gets its own copy of, including the API key.
    pub headers: HeaderMap,
    pub users: usize,
    /// Users launched per second.
    pub hatch_rate: f64,
    /// Time between two user launches, `1 / hatch_rate` seconds.
    pub hatch_interval: Duration,
    /// Seconds to run once all users are hatched, 0 runs until canceled.
    pub run_time: u64,
    pub think_time: ThinkTime,
    pub active_scenarios: Vec<String>,
    pub request_log: Option<PathBuf>,
}

impl SwarmConfiguration {
    /// Merge the command line with `defaults` and validate the result.
    ///
    /// Fails before anything is launched if the host or API key is missing, or any
    /// value is out of range.
    pub(crate) fn resolve(&self, defaults: &SwarmDefaults) -> Result<RunSettings, SwarmError> {
        let host = self.resolve_host(defaults)?;
        let headers = self.resolve_headers()?;

        let users = match self.users.or(defaults.users) {
            Some(users) => users,
            None => match std::thread::available_parallelism() {
                Ok(ap) => ap.get(),
                Err(e) => {
                    // Default to 1 user if unable to detect number of CPUs.
                    info!("failed to detect available_parallelism: {}", e);
                    1
                }
            },
        };
        if users == 0 {
            return Err(SwarmError::InvalidOption {
                option: "--users".to_string(),
                value: users.to_string(),
                detail: "at least 1 user is required".to_string(),
            });
        }

        let hatch_rate = match &self.hatch_rate {
            Some(hatch_rate) => {
                f64::from_str(hatch_rate).map_err(|_| SwarmError::InvalidOption {
                    option: "--hatch-rate".to_string(),
                    value: hatch_rate.to_string(),
                    detail: "hatch rate must be a number".to_string(),
                })?
            }
            None => defaults.hatch_rate.unwrap_or(1.0),
        };
        if !(hatch_rate.is_finite() && hatch_rate > 0.0) {
            return Err(SwarmError::InvalidOption {
                option: "--hatch-rate".to_string(),
                value: hatch_rate.to_string(),
                detail: "hatch rate must be greater than 0".to_string(),
            });
        }
        let hatch_interval =
            Duration::try_from_secs_f64(1.0 / hatch_rate).map_err(|_| SwarmError::InvalidOption {
                option: "--hatch-rate".to_string(),
                value: hatch_rate.to_string(),
                detail: "hatch rate is too small".to_string(),
            })?;

        let run_time = if !self.run_time.is_empty() {
            util::parse_timespan(&self.run_time)
        } else {
            defaults.run_time.unwrap_or(0)
        };

        let think_time = ThinkTime::new(
            self.min_wait
                .or(defaults.min_wait)
                .unwrap_or(DEFAULT_MIN_WAIT),
            self.max_wait
                .or(defaults.max_wait)
                .unwrap_or(DEFAULT_MAX_WAIT),
        )?;

        let request_log = if self.request_log.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.request_log))
        };

        Ok(RunSettings {
            host,
            headers,
            users,
            hatch_rate,
            hatch_interval,
            run_time,
            think_time,
            active_scenarios: self.scenarios.active.clone(),
            request_log,
        })
    }

    fn resolve_host(&self, defaults: &SwarmDefaults) -> Result<Url, SwarmError> {
        let host = if !self.host.is_empty() {
            self.host.clone()
        } else {
            defaults.host.clone().unwrap_or_default()
        };
        if host.is_empty() {
            return Err(SwarmError::InvalidOption {
                option: "--host".to_string(),
                value: "".to_string(),
                detail: "a host must be defined via the --host option".to_string(),
            });
        }
        Url::parse(&host).map_err(|parse_error| SwarmError::InvalidHost {
            host: host.clone(),
            detail: "invalid host, expected format: https://api.example.com".to_string(),
            parse_error,
        })
    }

    fn resolve_headers(&self) -> Result<HeaderMap, SwarmError> {
        let api_key = if !self.api_key.is_empty() {
            self.api_key.clone()
        } else {
            std::env::var(API_KEY_ENV).unwrap_or_default()
        };
        if api_key.is_empty() {
            return Err(SwarmError::MissingApiKey {
                detail: format!("pass --api-key or set {}", API_KEY_ENV),
            });
        }

        let value = HeaderValue::from_str(&api_key).map_err(|_| SwarmError::InvalidOption {
            option: "--api-key".to_string(),
            value: "(redacted)".to_string(),
            detail: "api key contains characters not allowed in a header".to_string(),
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, value);
        Ok(headers)
    }

    /// Initialize the logger which writes to standard out and optionally to a log file.
    pub(crate) fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];
        if !self.log_file.is_empty() {
            match std::fs::File::create(&self.log_file) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => eprintln!("failed to create log file {}: {}", self.log_file, e),
            }
        }

        // Fails if a logger is already set, for example when running several swarms in
        // one process.
        if let Err(e) = CombinedLogger::init(loggers) {
            debug!("failed to initialize CombinedLogger: {}", e);
            return;
        }
        if !self.log_file.is_empty() {
            info!("Writing to log file: {}", self.log_file);
        }
        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> SwarmConfiguration {
        SwarmConfiguration::parse_args_default(args).unwrap()
    }

    #[test]
    fn command_line_wins_over_defaults() {
        let config = parse(&[
            "--host",
            "http://cli.example.com/",
            "--api-key",
            "secret",
            "--users",
            "3",
            "--hatch-rate",
            "1.5",
            "--run-time",
            "1m30s",
            "--min-wait",
            "0.1",
            "--max-wait",
            "0.2",
        ]);
        let defaults = SwarmDefaults {
            host: Some("http://default.example.com/".to_string()),
            users: Some(10),
            hatch_rate: Some(4.0),
            run_time: Some(5),
            min_wait: Some(1.0),
            max_wait: Some(2.0),
        };
        let settings = config.resolve(&defaults).unwrap();
        assert_eq!(settings.host.as_str(), "http://cli.example.com/");
        assert_eq!(settings.users, 3);
        assert_eq!(settings.hatch_rate, 1.5);
        assert_eq!(settings.run_time, 90);
        assert_eq!(settings.think_time, ThinkTime::new(0.1, 0.2).unwrap());
        assert_eq!(settings.headers[API_KEY_HEADER], "secret");
    }

    #[test]
    fn defaults_fill_gaps() {
        let config = parse(&["--api-key", "secret"]);
        let defaults = SwarmDefaults {
            host: Some("http://default.example.com/".to_string()),
            users: Some(10),
            hatch_rate: Some(4.0),
            run_time: Some(5),
            ..Default::default()
        };
        let settings = config.resolve(&defaults).unwrap();
        assert_eq!(settings.host.as_str(), "http://default.example.com/");
        assert_eq!(settings.users, 10);
        assert_eq!(settings.hatch_rate, 4.0);
        assert_eq!(settings.run_time, 5);
        assert_eq!(
            settings.think_time,
            ThinkTime::new(DEFAULT_MIN_WAIT, DEFAULT_MAX_WAIT).unwrap()
        );
        assert!(settings.request_log.is_none());
    }

    #[test]
    fn host_required() {
        let config = parse(&["--api-key", "secret"]);
        assert!(matches!(
            config.resolve(&SwarmDefaults::default()),
            Err(SwarmError::InvalidOption { .. })
        ));

        let config = parse(&["--api-key", "secret", "--host", "not a url"]);
        assert!(matches!(
            config.resolve(&SwarmDefaults::default()),
            Err(SwarmError::InvalidHost { .. })
        ));
    }

    #[test]
    fn invalid_values_rejected() {
        let base = ["--api-key", "secret", "--host", "http://localhost/"];
        for extra in [
            vec!["--users", "0"],
            vec!["--hatch-rate", "0"],
            vec!["--hatch-rate", "fast"],
            vec!["--hatch-rate", "1e-20"],
            vec!["--max-wait", "1e20"],
            vec!["--min-wait", "3", "--max-wait", "1"],
        ] {
            let mut args = base.to_vec();
            args.extend(extra.iter());
            let config = parse(&args);
            assert!(
                config.resolve(&SwarmDefaults::default()).is_err(),
                "{:?} should be rejected",
                extra
            );
        }
    }

    #[test]
    fn scenario_filter() {
        let config = parse(&["--scenarios", "Heavy Rail, alerts"]);
        assert_eq!(config.scenarios.active, vec!["heavy rail", "alerts"]);
        assert!(ScenarioFilter::from_str("alerts,,vehicles").is_err());
    }
}
