//! # apiswarm
//!
//! A load generator that simulates many concurrent API clients ("virtual users")
//! against a JSON:API-style backend.
//!
//! Each [`VirtualUser`](./user/struct.VirtualUser.html) repeatedly picks one of a
//! weighted set of [`Scenario`](./scenario/struct.Scenario.html)s, runs it, then pauses
//! for a randomized think-time before picking again. Scenarios describe their requests
//! with a [`RequestSpec`](./query/struct.RequestSpec.html), which the query builder
//! turns into `filter[...]`, `fields[...]`, `include` and `sort` query parameters.
//!
//! ## Writing a load test
//!
//! ```rust
//! use apiswarm::prelude::*;
//!
//! async fn get_alerts(user: &mut VirtualUser) -> ScenarioResult {
//!     user.api_request(
//!         &RequestSpec::new("/alerts")
//!             .set_name("/alerts")
//!             .set_include("facilities"),
//!     )
//!     .await
//! }
//!
//! async fn get_vehicles(user: &mut VirtualUser) -> ScenarioResult {
//!     user.api_request(&RequestSpec::new("/vehicles")).await
//! }
//!
//! fn build() -> Result<Swarm, SwarmError> {
//!     Ok(Swarm::initialize()?
//!         .register_scenario(scenario!(get_alerts).set_name("alerts").set_weight(10)?)
//!         .register_scenario(scenario!(get_vehicles).set_name("vehicles").set_weight(5)?))
//! }
//! ```
//!
//! [`Swarm::execute`] validates the configuration, hatches the configured number of
//! users, holds them for the configured run time and returns the aggregated
//! [`SwarmMetrics`](./metrics/struct.SwarmMetrics.html).

#[macro_use]
extern crate log;

pub mod catalog;
pub mod client;
pub mod config;
mod logger;
pub mod metrics;
pub mod prelude;
pub mod query;
pub mod scenario;
pub mod user;
pub mod util;

use chrono::prelude::*;
use gumdrop::Options;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::{fmt, io, time};

use crate::client::{ReqwestTransport, Transport};
use crate::config::{RunSettings, SwarmConfiguration, SwarmDefaults};
use crate::logger::RequestLogTx;
use crate::metrics::{SwarmMetric, SwarmMetrics};
use crate::scenario::{Scenario, ScenarioRegistry};
use crate::user::{ThinkTime, UserCommand, VirtualUser};

/// Set by the ctrl-c handler, checked by the controller while the swarm is running.
static CANCELED: AtomicBool = AtomicBool::new(false);
static CTRLC_HANDLER: Once = Once::new();

/// How long the controller sleeps between checks while the swarm is running.
const CONTROLLER_TICK: time::Duration = time::Duration::from_millis(100);

/// Next launch time used when the hatch interval overflows the clock.
const FAR_FUTURE: time::Duration = time::Duration::from_secs(86_400 * 365 * 30);

/// An enumeration of all errors a [`Swarm`] can return.
#[derive(Debug)]
pub enum SwarmError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a [`tokio::task::JoinError`](https://docs.rs/tokio/*/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Failed to parse a hostname.
    InvalidHost {
        /// The invalid hostname that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid think-time range specified.
    InvalidWaitTime {
        /// The specified minimum wait time, in seconds.
        min_wait: f64,
        /// The specified maximum wait time, in seconds.
        max_wait: f64,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid weight specified.
    InvalidWeight {
        /// The specified weight.
        weight: usize,
        /// An optional explanation of the error.
        detail: String,
    },
    /// No API key was configured, neither with `--api-key` nor in the environment.
    MissingApiKey {
        /// An optional explanation of the error.
        detail: String,
    },
    /// [`Swarm`] has no [`Scenario`] defined.
    NoScenarios {
        /// An optional explanation of the error.
        detail: String,
    },
    /// A [`RequestSpec`](./query/struct.RequestSpec.html) could not be turned into a request.
    InvalidRequest {
        /// The endpoint of the malformed request.
        endpoint: String,
        /// An optional explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl SwarmError {
    fn describe(&self) -> &str {
        match *self {
            SwarmError::Io(_) => "io::Error",
            SwarmError::Reqwest(_) => "reqwest::Error",
            SwarmError::TokioJoin(_) => "tokio::task::JoinError",
            SwarmError::InvalidHost { .. } => "failed to parse hostname",
            SwarmError::InvalidOption { .. } => "invalid option or value specified",
            SwarmError::InvalidWaitTime { .. } => "invalid wait time specified",
            SwarmError::InvalidWeight { .. } => "invalid weight specified",
            SwarmError::MissingApiKey { .. } => "no api key configured",
            SwarmError::NoScenarios { .. } => "no scenarios defined",
            SwarmError::InvalidRequest { .. } => "invalid request specification",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for SwarmError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SwarmError::Io(ref source) => write!(f, "SwarmError: {} ({})", self.describe(), source),
            SwarmError::Reqwest(ref source) => {
                write!(f, "SwarmError: {} ({})", self.describe(), source)
            }
            SwarmError::TokioJoin(ref source) => {
                write!(f, "SwarmError: {} ({})", self.describe(), source)
            }
            SwarmError::InvalidHost {
                ref parse_error, ..
            } => write!(f, "SwarmError: {} ({})", self.describe(), parse_error),
            SwarmError::InvalidOption { ref detail, .. }
            | SwarmError::InvalidWaitTime { ref detail, .. }
            | SwarmError::InvalidWeight { ref detail, .. }
            | SwarmError::MissingApiKey { ref detail }
            | SwarmError::NoScenarios { ref detail }
            | SwarmError::InvalidRequest { ref detail, .. } => {
                write!(f, "SwarmError: {} ({})", self.describe(), detail)
            }
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for SwarmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            SwarmError::Io(ref source) => Some(source),
            SwarmError::Reqwest(ref source) => Some(source),
            SwarmError::TokioJoin(ref source) => Some(source),
            SwarmError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for SwarmError {
    fn from(err: reqwest::Error) -> SwarmError {
        SwarmError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for SwarmError {
    fn from(err: io::Error) -> SwarmError {
        SwarmError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for SwarmError {
    fn from(err: tokio::task::JoinError) -> SwarmError {
        SwarmError::TokioJoin(err)
    }
}

/// Single-process swarm controller: hatches virtual users, holds them for the
/// configured run time, then stops them and returns the aggregated metrics.
pub struct Swarm {
    /// Every registered scenario, in registration order.
    scenarios: Vec<Scenario>,
    /// Programmatic defaults, overridden by command line options.
    defaults: SwarmDefaults,
    /// Options parsed from the command line.
    configuration: SwarmConfiguration,
    /// Optional transport shared by every user instead of one HTTP client per user.
    transport: Option<Arc<dyn Transport>>,
    /// All metrics merged together.
    metrics: SwarmMetrics,
}
impl Swarm {
    /// Load configuration from the command line and initialize a [`Swarm`].
    ///
    /// Exits the process after printing help if `-h` is passed.
    pub fn initialize() -> Result<Swarm, SwarmError> {
        Ok(Swarm::initialize_with_config(
            SwarmConfiguration::parse_args_default_or_exit(),
        ))
    }

    /// Initialize a [`Swarm`] with an already parsed configuration.
    pub fn initialize_with_config(configuration: SwarmConfiguration) -> Swarm {
        Swarm {
            scenarios: Vec::new(),
            defaults: SwarmDefaults::default(),
            configuration,
            transport: None,
            metrics: SwarmMetrics::default(),
        }
    }

    /// Register a scenario; users pick among all registered scenarios by weight.
    pub fn register_scenario(mut self, scenario: Scenario) -> Self {
        self.scenarios.push(scenario);
        self
    }

    /// Register several scenarios at once, preserving their order.
    pub fn register_scenarios(mut self, scenarios: Vec<Scenario>) -> Self {
        self.scenarios.extend(scenarios);
        self
    }

    /// Set the host used when `--host` isn't passed.
    pub fn set_host(mut self, host: &str) -> Self {
        self.defaults.host = Some(host.to_string());
        self
    }

    /// Set the number of users launched when `--users` isn't passed.
    pub fn set_users(mut self, users: usize) -> Self {
        self.defaults.users = Some(users);
        self
    }

    /// Set the per-second hatch rate used when `--hatch-rate` isn't passed.
    pub fn set_hatch_rate(mut self, hatch_rate: f64) -> Self {
        self.defaults.hatch_rate = Some(hatch_rate);
        self
    }

    /// Set the run time, in seconds, used when `--run-time` isn't passed.
    pub fn set_run_time(mut self, run_time: u64) -> Self {
        self.defaults.run_time = Some(run_time);
        self
    }

    /// Set the think-time range, in seconds, used when `--min-wait`/`--max-wait` aren't passed.
    pub fn set_wait_time(mut self, min_wait: f64, max_wait: f64) -> Result<Self, SwarmError> {
        ThinkTime::new(min_wait, max_wait)?;
        self.defaults.min_wait = Some(min_wait);
        self.defaults.max_wait = Some(max_wait);
        Ok(self)
    }

    /// Replace the default per-user HTTP client with a shared [`Transport`].
    pub fn set_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Run the swarm until the run time expires or ctrl-c is pressed.
    ///
    /// Configuration errors (missing API key, host, invalid weights) are returned
    /// before any user is launched.
    pub async fn execute(mut self) -> Result<SwarmMetrics, SwarmError> {
        self.configuration.initialize_logger();

        if self.configuration.list {
            self.print_scenarios();
            return Ok(self.metrics);
        }

        let settings = self.configuration.resolve(&self.defaults)?;
        let scenarios = self.active_scenarios(&settings)?;
        let registry = Arc::new(ScenarioRegistry::new(scenarios)?);
        info!(
            "{} scenarios registered with a total weight of {}",
            registry.len(),
            registry.total_weight()
        );

        self.start(settings, registry).await?;

        if !self.configuration.no_print_metrics {
            self.metrics.print();
        }

        Ok(self.metrics)
    }

    /// Apply the `--scenarios` filter, if any.
    fn active_scenarios(&self, settings: &RunSettings) -> Result<Vec<Scenario>, SwarmError> {
        if settings.active_scenarios.is_empty() {
            return Ok(self.scenarios.clone());
        }
        let active: Vec<Scenario> = self
            .scenarios
            .iter()
            .filter(|scenario| {
                let name = scenario.name.to_lowercase();
                settings
                    .active_scenarios
                    .iter()
                    .any(|filter| name.contains(filter.as_str()))
            })
            .cloned()
            .collect();
        if active.is_empty() {
            return Err(SwarmError::NoScenarios {
                detail: format!(
                    "no scenario matches --scenarios {}",
                    settings.active_scenarios.join(",")
                ),
            });
        }
        Ok(active)
    }

    fn print_scenarios(&self) {
        println!("Available scenarios:");
        for scenario in &self.scenarios {
            println!(" - {} (weight {})", scenario.name, scenario.weight);
        }
    }

    async fn start(
        &mut self,
        settings: RunSettings,
        registry: Arc<ScenarioRegistry>,
    ) -> Result<(), SwarmError> {
        CANCELED.store(false, Ordering::SeqCst);
        CTRLC_HANDLER.call_once(|| {
            if let Err(e) = ctrlc::set_handler(|| {
                warn!("caught ctrl-c, stopping...");
                CANCELED.store(true, Ordering::SeqCst);
            }) {
                info!("failed to set ctrl-c handler: {}", e);
            }
        });

        let (logger_handle, logger_tx) = logger::setup_request_log(&settings.request_log).await?;
        let (metrics_tx, metrics_rx) = flume::unbounded::<SwarmMetric>();

        let swarm_started = time::Instant::now();
        self.metrics.started = Some(Local::now());

        let mut next_hatch = tokio::time::Instant::now();
        let mut users = Vec::with_capacity(settings.users);
        let mut user_channels = Vec::with_capacity(settings.users);
        // Run time is measured from the moment the last user has been hatched.
        let mut run_timer: Option<time::Instant> = None;

        info!(
            "hatching {} users at {} per second against {}",
            settings.users, settings.hatch_rate, settings.host
        );

        loop {
            if CANCELED.load(Ordering::SeqCst) {
                break;
            }

            // Launch every user that is due, then sleep until the next one is.
            while users.len() < settings.users && tokio::time::Instant::now() >= next_hatch {
                let index = users.len();
                let transport: Arc<dyn Transport> = match &self.transport {
                    Some(transport) => transport.clone(),
                    None => Arc::new(ReqwestTransport::new()?),
                };
                let user = VirtualUser::new(
                    index,
                    settings.host.clone(),
                    settings.headers.clone(),
                    settings.think_time,
                    transport,
                    swarm_started,
                )
                .set_metrics_channel(metrics_tx.clone());
                let (user_tx, user_rx) = flume::unbounded();
                users.push(tokio::spawn(user::user_main(
                    user,
                    registry.clone(),
                    user_rx,
                )));
                user_channels.push(user_tx);
                next_hatch = next_hatch
                    .checked_add(settings.hatch_interval)
                    .unwrap_or_else(|| tokio::time::Instant::now() + FAR_FUTURE);

                if users.len() == settings.users {
                    info!("all {} users hatched", settings.users);
                    run_timer = Some(time::Instant::now());
                }
            }

            if let Some(timer) = run_timer {
                if util::timer_expired(timer, settings.run_time) {
                    info!("run time of {} seconds expired", settings.run_time);
                    break;
                }
            }

            while let Ok(metric) = metrics_rx.try_recv() {
                self.record_metric(metric, &logger_tx);
            }

            let pause = if users.len() < settings.users {
                CONTROLLER_TICK.min(next_hatch.saturating_duration_since(tokio::time::Instant::now()))
            } else {
                CONTROLLER_TICK
            };
            tokio::time::sleep(pause).await;
        }

        info!("stopping {} users...", users.len());
        for user_tx in &user_channels {
            // A closed channel means the user already exited.
            let _ = user_tx.send(UserCommand::Exit);
        }
        let mut iterations = 0;
        for result in futures::future::join_all(users).await {
            iterations += result?;
        }
        debug!("users completed {} scenario iterations", iterations);

        drop(metrics_tx);
        while let Ok(metric) = metrics_rx.try_recv() {
            self.record_metric(metric, &logger_tx);
        }

        if let Some(tx) = logger_tx {
            let _ = tx.send(None);
        }
        if let Some(handle) = logger_handle {
            handle.await??;
        }

        self.metrics.users = user_channels.len();
        self.metrics.duration = match run_timer {
            Some(timer) => timer.elapsed().as_secs(),
            None => swarm_started.elapsed().as_secs(),
        };

        Ok(())
    }

    fn record_metric(&mut self, metric: SwarmMetric, logger_tx: &RequestLogTx) {
        if let (SwarmMetric::Request(request), Some(tx)) = (&metric, logger_tx) {
            if let Err(e) = tx.send(Some(request.clone())) {
                warn!("failed to send request to logger: {}", e);
            }
        }
        self.metrics.record(&metric);
    }
}
