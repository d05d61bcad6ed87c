//! Utility functions used by the swarm controller and configuration.

use regex::Regex;
use std::str::FromStr;
use std::time;

/// Parse a string representing a time span and return the number of seconds.
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", and "s", in that order, indicating
/// "hours", "minutes", and "seconds".
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, etc.
///
/// # Example
/// ```rust
/// use apiswarm::util;
///
/// // 1 hour 2 minutes and 3 seconds is 3,723 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), 3_723);
///
/// // 45 seconds is 45 seconds.
/// assert_eq!(util::parse_timespan("45"), 45);
///
/// // Invalid value is 0 seconds.
/// assert_eq!(util::parse_timespan("foo"), 0);
/// ```
pub fn parse_timespan(time_str: &str) -> u64 {
    // If an integer is passed in, assume it's seconds.
    if let Ok(t) = u64::from_str(time_str) {
        trace!("{} is integer: {} seconds", time_str, t);
        return t;
    }

    // Otherwise use a regex to extract hours, minutes and seconds from string.
    let re = match Regex::new(r"((?P<hours>\d+?)h)?((?P<minutes>\d+?)m)?((?P<seconds>\d+?)s)?")
    {
        Ok(re) => re,
        Err(e) => {
            warn!("failed to compile timespan regex: {}", e);
            return 0;
        }
    };
    let captures = match re.captures(time_str) {
        Some(captures) => captures,
        None => return 0,
    };
    let value = |name: &str| -> u64 {
        captures
            .name(name)
            .and_then(|m| u64::from_str(m.as_str()).ok())
            .unwrap_or(0)
    };
    let (hours, minutes, seconds) = (value("hours"), value("minutes"), value("seconds"));
    let total = hours * 60 * 60 + minutes * 60 + seconds;
    trace!(
        "{} hours {} minutes {} seconds: {} seconds",
        hours,
        minutes,
        seconds,
        total
    );
    total
}

/// Determine if a timer expired, with second granularity.
///
/// If the timer was started more than `run_time` seconds ago return `true`,
/// otherwise return `false`. A `run_time` of 0 never expires.
///
/// # Example
/// ```rust
/// use apiswarm::util;
///
/// let started = std::time::Instant::now();
/// let mut counter = 0;
/// loop {
///     // Track how many times this loop runs.
///     counter += 1;
///
///     // Sleep for a quarter of a second.
///     std::thread::sleep(std::time::Duration::from_millis(250));
///
///     // Do stuff ...
///
///     // Loop until the timer expires, then break.
///     if util::timer_expired(started, 1) {
///         break;
///     }
/// }
///
/// // It takes 4 quarter seconds to equal 1 second.
/// assert_eq!(counter, 4);
/// ```
pub fn timer_expired(started: time::Instant, run_time: u64) -> bool {
    run_time > 0 && started.elapsed().as_secs() >= run_time
}
