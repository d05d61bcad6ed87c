//! Metrics collected and aggregated while the swarm runs.
//!
//! Every request a [`VirtualUser`](../user/struct.VirtualUser.html) makes is sent to the
//! controller as a [`RequestMetric`], and every scenario invocation as a
//! [`ScenarioMetric`], over an
//! [`unbounded Flume channel`](https://docs.rs/flume/*/flume/fn.unbounded.html).
//! The controller aggregates them into [`SwarmMetrics`], keyed by reporting name, so
//! requests for many different routes can share one line such as
//! `/schedules (subway routes)`.
//!
//! When viewed with [`std::fmt::Display`], [`SwarmMetrics`] are rendered as tables:
//! ```text
//!  === PER REQUEST METRICS ===
//!  ------------------------------------------------------------------------------
//!  Name                       |   # reqs |        # fails |    req/s |  fail/s
//!  ------------------------------------------------------------------------------
//!  /                          |      412 |         0 (0%) |    41.20 |    0.00
//!  /alerts                    |      398 |        2 (0%) |    39.80 |    0.20
//! ```

use chrono::prelude::*;
use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Everything a virtual user reports to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SwarmMetric {
    Request(RequestMetric),
    Scenario(ScenarioMetric),
}

/// One request, as seen by the virtual user that made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetric {
    /// How many milliseconds the swarm had been running when the request was made.
    pub elapsed: u64,
    /// The reporting name the request is aggregated under.
    pub name: String,
    /// The full URL that was requested, including the query string.
    pub url: String,
    /// How many milliseconds the request took.
    pub response_time: u64,
    /// The HTTP status code, 0 if no response was received.
    pub status_code: u16,
    pub success: bool,
    /// Why the request failed, empty on success.
    pub error: String,
    /// Which virtual user made the request.
    pub user: usize,
}
impl RequestMetric {
    pub(crate) fn new(elapsed: u64, name: &str, url: &str, user: usize) -> Self {
        RequestMetric {
            elapsed,
            name: name.to_string(),
            url: url.to_string(),
            response_time: 0,
            status_code: 0,
            success: true,
            error: "".to_string(),
            user,
        }
    }
}

/// One scenario invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMetric {
    /// How many milliseconds the swarm had been running when the scenario started.
    pub elapsed: u64,
    pub name: String,
    /// How many milliseconds the scenario took, including all of its requests.
    pub run_time: u64,
    pub success: bool,
    pub user: usize,
}

/// Response times collected for one name, bucketed by millisecond.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseTimes {
    /// Milliseconds to number of occurrences.
    pub times: BTreeMap<u64, usize>,
    pub min_time: u64,
    pub max_time: u64,
    pub total_time: u64,
    pub counter: usize,
}
impl ResponseTimes {
    pub fn record(&mut self, time: u64) {
        if self.counter == 0 || time < self.min_time {
            self.min_time = time;
        }
        if time > self.max_time {
            self.max_time = time;
        }
        self.total_time += time;
        self.counter += 1;

        // Round the time so similar times share a bucket.
        let rounded_time = match time {
            // No rounding for times 0-100 ms.
            0..=100 => time,
            // Round to nearest 10 for times 100-500 ms.
            101..=500 => ((time as f64 / 10.0).round() * 10.0) as u64,
            // Round to nearest 100 for times 500-1000 ms.
            501..=1000 => ((time as f64 / 100.0).round() * 100.0) as u64,
            // Round to nearest 1000 for larger times.
            _ => ((time as f64 / 1000.0).round() * 1000.0) as u64,
        };
        *self.times.entry(rounded_time).or_insert(0) += 1;
    }

    pub fn average(&self) -> f32 {
        if self.counter == 0 {
            0.0
        } else {
            self.total_time as f32 / self.counter as f32
        }
    }

    /// The slowest time within the given share of requests, `percent` in `0.0..=1.0`.
    pub fn percentile(&self, percent: f32) -> u64 {
        let required = (self.counter as f32 * percent).ceil() as usize;
        let mut seen = 0;
        for (time, count) in &self.times {
            seen += count;
            if seen >= required {
                return *time;
            }
        }
        self.max_time
    }

    pub fn median(&self) -> u64 {
        self.percentile(0.5)
    }

    fn merge(&mut self, other: &ResponseTimes) {
        for (time, count) in &other.times {
            *self.times.entry(*time).or_insert(0) += count;
        }
        if self.counter == 0 || (other.counter > 0 && other.min_time < self.min_time) {
            self.min_time = other.min_time;
        }
        self.max_time = self.max_time.max(other.max_time);
        self.total_time += other.total_time;
        self.counter += other.counter;
    }
}

/// All requests sharing one reporting name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetricAggregate {
    pub name: String,
    pub response_times: ResponseTimes,
    pub success_count: usize,
    pub fail_count: usize,
    /// Status code to number of occurrences, 0 counts requests without a response.
    pub status_code_counts: HashMap<u16, usize>,
}
impl RequestMetricAggregate {
    pub fn new(name: &str) -> Self {
        RequestMetricAggregate {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, metric: &RequestMetric) {
        self.response_times.record(metric.response_time);
        if metric.success {
            self.success_count += 1;
        } else {
            self.fail_count += 1;
        }
        *self.status_code_counts.entry(metric.status_code).or_insert(0) += 1;
    }

    pub fn total(&self) -> usize {
        self.success_count + self.fail_count
    }
}

/// All invocations of one scenario.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioMetricAggregate {
    pub name: String,
    pub run_times: ResponseTimes,
    pub success_count: usize,
    pub fail_count: usize,
}
impl ScenarioMetricAggregate {
    pub fn new(name: &str) -> Self {
        ScenarioMetricAggregate {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, metric: &ScenarioMetric) {
        self.run_times.record(metric.run_time);
        if metric.success {
            self.success_count += 1;
        } else {
            self.fail_count += 1;
        }
    }
}

/// A distinct error and how often it happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetric {
    /// The reporting name of the failed request.
    pub name: String,
    pub error: String,
    pub occurrences: usize,
}

/// Everything the swarm measured, returned by
/// [`Swarm::execute`](../struct.Swarm.html#method.execute).
#[derive(Debug, Clone, Default)]
pub struct SwarmMetrics {
    /// When the swarm started.
    pub started: Option<DateTime<Local>>,
    /// How many seconds users ran after all were hatched.
    pub duration: u64,
    /// How many users were launched.
    pub users: usize,
    /// Requests keyed by reporting name.
    pub requests: BTreeMap<String, RequestMetricAggregate>,
    /// Scenario invocations keyed by scenario name.
    pub scenarios: BTreeMap<String, ScenarioMetricAggregate>,
    /// Errors keyed by `"<name>: <error>"`.
    pub errors: BTreeMap<String, ErrorMetric>,
}
impl SwarmMetrics {
    /// Merge one metric into the aggregates.
    pub fn record(&mut self, metric: &SwarmMetric) {
        match metric {
            SwarmMetric::Request(request) => {
                self.requests
                    .entry(request.name.clone())
                    .or_insert_with(|| RequestMetricAggregate::new(&request.name))
                    .record(request);
                if !request.success {
                    let key = format!("{}: {}", request.name, request.error);
                    self.errors
                        .entry(key)
                        .or_insert_with(|| ErrorMetric {
                            name: request.name.clone(),
                            error: request.error.clone(),
                            occurrences: 0,
                        })
                        .occurrences += 1;
                }
            }
            SwarmMetric::Scenario(scenario) => {
                self.scenarios
                    .entry(scenario.name.clone())
                    .or_insert_with(|| ScenarioMetricAggregate::new(&scenario.name))
                    .record(scenario);
            }
        }
    }

    /// Total requests across every reporting name.
    pub fn total_requests(&self) -> usize {
        self.requests.values().map(|r| r.total()).sum()
    }

    /// Total failed requests across every reporting name.
    pub fn total_failures(&self) -> usize {
        self.requests.values().map(|r| r.fail_count).sum()
    }

    pub fn print(&self) {
        if !self.requests.is_empty() {
            info!("printing metrics after {} seconds...", self.duration);
            print!("{}", self);
        }
    }

    fn per_second(&self, count: usize) -> f32 {
        if self.duration == 0 {
            count as f32
        } else {
            count as f32 / self.duration as f32
        }
    }

    fn fmt_requests(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "\n === PER REQUEST METRICS ===")?;
        fmt_line(f)?;
        writeln!(
            f,
            " {:<30} | {:>10} | {:>14} | {:>8} | {:>7}",
            "Name", "# reqs", "# fails", "req/s", "fail/s"
        )?;
        fmt_line(f)?;
        for request in self.requests.values() {
            self.fmt_request_row(f, &request.name, request.total(), request.fail_count)?;
        }
        if self.requests.len() > 1 {
            fmt_divider(f)?;
            self.fmt_request_row(
                f,
                "Aggregated",
                self.total_requests(),
                self.total_failures(),
            )?;
        }
        Ok(())
    }

    fn fmt_request_row(
        &self,
        f: &mut fmt::Formatter,
        name: &str,
        total: usize,
        fails: usize,
    ) -> fmt::Result {
        let fail_percent = if total > 0 {
            fails * 100 / total
        } else {
            0
        };
        writeln!(
            f,
            " {:<30} | {:>10} | {:>14} | {:>8.2} | {:>7.2}",
            truncate(name, 30),
            total.to_formatted_string(&Locale::en),
            format!(
                "{} ({}%)",
                fails.to_formatted_string(&Locale::en),
                fail_percent
            ),
            self.per_second(total),
            self.per_second(fails),
        )
    }

    fn fmt_response_times(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_line(f)?;
        writeln!(
            f,
            " {:<30} | {:>10} | {:>8} | {:>8} | {:>8}",
            "Name", "Avg (ms)", "Min", "Max", "Median"
        )?;
        fmt_line(f)?;
        let mut aggregate = ResponseTimes::default();
        for request in self.requests.values() {
            fmt_times_row(f, &request.name, &request.response_times)?;
            aggregate.merge(&request.response_times);
        }
        if self.requests.len() > 1 {
            fmt_divider(f)?;
            fmt_times_row(f, "Aggregated", &aggregate)?;
        }
        Ok(())
    }

    fn fmt_percentiles(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const PERCENTILES: [f32; 5] = [0.5, 0.75, 0.98, 0.99, 0.999];
        fmt_line(f)?;
        writeln!(f, " Slowest response within specified percentile of requests (in ms):")?;
        fmt_line(f)?;
        writeln!(
            f,
            " {:<30} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6}",
            "Name", "50%", "75%", "98%", "99%", "99.9%"
        )?;
        fmt_line(f)?;
        for request in self.requests.values() {
            let values = PERCENTILES
                .iter()
                .map(|p| format!("{:>6}", request.response_times.percentile(*p)))
                .join(" | ");
            writeln!(f, " {:<30} | {}", truncate(&request.name, 30), values)?;
        }
        Ok(())
    }

    fn fmt_status_codes(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_line(f)?;
        writeln!(f, " {:<30} | Status codes", "Name")?;
        fmt_line(f)?;
        for request in self.requests.values() {
            let codes = request
                .status_code_counts
                .iter()
                .sorted()
                .map(|(code, count)| {
                    format!("{} [{}]", count.to_formatted_string(&Locale::en), code)
                })
                .join(", ");
            writeln!(f, " {:<30} | {}", truncate(&request.name, 30), codes)?;
        }
        Ok(())
    }

    fn fmt_scenarios(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.scenarios.is_empty() {
            return Ok(());
        }
        writeln!(f, "\n === PER SCENARIO METRICS ===")?;
        fmt_line(f)?;
        writeln!(
            f,
            " {:<30} | {:>10} | {:>14} | {:>10} | {:>8}",
            "Name", "# runs", "# fails", "Avg (ms)", "Max"
        )?;
        fmt_line(f)?;
        for scenario in self.scenarios.values() {
            writeln!(
                f,
                " {:<30} | {:>10} | {:>14} | {:>10.2} | {:>8}",
                truncate(&scenario.name, 30),
                (scenario.success_count + scenario.fail_count).to_formatted_string(&Locale::en),
                scenario.fail_count.to_formatted_string(&Locale::en),
                scenario.run_times.average(),
                scenario.run_times.max_time,
            )?;
        }
        Ok(())
    }

    fn fmt_errors(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.errors.is_empty() {
            return Ok(());
        }
        writeln!(f, "\n === ERRORS ===")?;
        fmt_line(f)?;
        writeln!(f, " {:<11} | Error", "Count")?;
        fmt_line(f)?;
        for error in self
            .errors
            .values()
            .sorted_by(|a, b| b.occurrences.cmp(&a.occurrences))
        {
            writeln!(
                f,
                " {:<11}   {}: {}",
                error.occurrences.to_formatted_string(&Locale::en),
                error.name,
                error.error
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for SwarmMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(started) = self.started {
            writeln!(
                f,
                "\n {} users ran for {} seconds, starting {}",
                self.users,
                self.duration,
                started.format("%Y-%m-%d %H:%M:%S")
            )?;
        }
        if !self.requests.is_empty() {
            self.fmt_requests(f)?;
            self.fmt_response_times(f)?;
            self.fmt_percentiles(f)?;
            self.fmt_status_codes(f)?;
        }
        self.fmt_scenarios(f)?;
        self.fmt_errors(f)?;
        Ok(())
    }
}

fn fmt_line(f: &mut fmt::Formatter) -> fmt::Result {
    writeln!(f, " {}", "-".repeat(78))
}

fn fmt_divider(f: &mut fmt::Formatter) -> fmt::Result {
    writeln!(f, " {}+{}", "-".repeat(31), "-".repeat(46))
}

fn fmt_times_row(f: &mut fmt::Formatter, name: &str, times: &ResponseTimes) -> fmt::Result {
    writeln!(
        f,
        " {:<30} | {:>10.2} | {:>8} | {:>8} | {:>8}",
        truncate(name, 30),
        times.average(),
        times.min_time,
        times.max_time,
        times.median(),
    )
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        name.to_string()
    } else {
        let mut truncated: String = name.chars().take(width - 2).collect();
        truncated.push_str("..");
        truncated
    }
}
