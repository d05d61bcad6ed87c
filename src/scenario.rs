//! Scenarios and weighted scenario selection.
//!
//! A [`Scenario`] is a named, weighted async function that issues one or more
//! requests through a [`VirtualUser`]. Scenarios are registered once at startup and
//! collected into a read-only [`ScenarioRegistry`] shared by every user.
//!
//! ```rust
//! use apiswarm::prelude::*;
//!
//! async fn get_portal(user: &mut VirtualUser) -> ScenarioResult {
//!     user.api_request(&RequestSpec::new("/")).await
//! }
//!
//! let portal = scenario!(get_portal).set_name("portal").set_weight(10).unwrap();
//! assert_eq!(portal.weight, 10);
//! ```
//!
//! ## Weighted selection
//!
//! Each loop iteration a user draws a number uniformly from `[0, total_weight)` and
//! runs the scenario whose cumulative weight range contains it, so over many
//! iterations scenario `i` runs `weight_i / total_weight` of the time.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::metrics::RequestMetric;
use crate::user::VirtualUser;
use crate::SwarmError;

/// The result of running a scenario.
pub type ScenarioResult = Result<(), Box<ScenarioError>>;

/// The function run each time a scenario is selected.
pub type ScenarioFunction = Arc<
    dyn for<'r> Fn(&'r mut VirtualUser) -> Pin<Box<dyn Future<Output = ScenarioResult> + Send + 'r>>
        + Send
        + Sync,
>;

/// `scenario!(foo)` expands to `Scenario::new(foo)` with the boxing the function
/// pointer needs.
#[macro_export]
macro_rules! scenario {
    ($scenario_func:ident) => {
        $crate::scenario::Scenario::new(std::sync::Arc::new(move |s| {
            std::boxed::Box::pin($scenario_func(s))
        }))
    };
}

/// Why a scenario invocation didn't complete successfully.
#[derive(Debug)]
pub enum ScenarioError {
    /// The scenario built a malformed request. This is a bug in the scenario.
    Query(SwarmError),
    /// The request never got a response: connection refused, timeout, DNS failure.
    Transport {
        /// The transport's description of the failure.
        error: String,
        /// The failed request as it was recorded.
        metric: RequestMetric,
    },
    /// The server answered with a non-2xx status code.
    Status {
        status_code: u16,
        /// The failed request as it was recorded.
        metric: RequestMetric,
    },
}
impl ScenarioError {
    /// Request-level failures are recorded and the user keeps going.
    pub fn is_request_failure(&self) -> bool {
        !matches!(self, ScenarioError::Query(_))
    }
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScenarioError::Query(source) => write!(f, "malformed request: {}", source),
            ScenarioError::Transport { error, metric } => {
                write!(f, "{}: {}", metric.name, error)
            }
            ScenarioError::Status {
                status_code,
                metric,
            } => write!(f, "{}: status {}", metric.name, status_code),
        }
    }
}

impl std::error::Error for ScenarioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScenarioError::Query(source) => Some(source),
            _ => None,
        }
    }
}

/// Auto-convert request building errors.
impl From<SwarmError> for Box<ScenarioError> {
    fn from(err: SwarmError) -> Box<ScenarioError> {
        Box::new(ScenarioError::Query(err))
    }
}

/// A named, weighted unit of simulated work.
#[derive(Clone)]
pub struct Scenario {
    /// Shown in scenario metrics and matched by `--scenarios`.
    pub name: String,
    /// How often this scenario runs relative to the others.
    pub weight: usize,
    pub function: ScenarioFunction,
}
impl Scenario {
    pub fn new(function: ScenarioFunction) -> Self {
        trace!("new scenario");
        Scenario {
            name: "".to_string(),
            weight: 1,
            function,
        }
    }

    pub fn set_name(mut self, name: &str) -> Self {
        trace!("set_name: {}", name);
        self.name = name.to_string();
        self
    }

    /// Set how often the scenario runs compared to others. Must be at least 1.
    pub fn set_weight(mut self, weight: usize) -> Result<Self, SwarmError> {
        trace!("[{}] set_weight: {}", self.name, weight);
        if weight == 0 {
            return Err(SwarmError::InvalidWeight {
                weight,
                detail: "weight of 0 not allowed".to_string(),
            });
        }
        self.weight = weight;
        Ok(self)
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

/// The fixed, read-only set of scenarios users choose from.
#[derive(Debug)]
pub struct ScenarioRegistry {
    scenarios: Vec<Scenario>,
    /// Running total of weights, `cumulative_weights[i]` is the exclusive upper
    /// bound of scenario `i`'s draw range.
    cumulative_weights: Vec<usize>,
    total_weight: usize,
}
impl ScenarioRegistry {
    pub fn new(scenarios: Vec<Scenario>) -> Result<Self, SwarmError> {
        if scenarios.is_empty() {
            return Err(SwarmError::NoScenarios {
                detail: "at least one scenario must be registered".to_string(),
            });
        }

        let mut cumulative_weights = Vec::with_capacity(scenarios.len());
        let mut total_weight: usize = 0;
        for scenario in &scenarios {
            if scenario.weight == 0 {
                return Err(SwarmError::InvalidWeight {
                    weight: scenario.weight,
                    detail: format!("scenario {} has a weight of 0", scenario.name),
                });
            }
            total_weight = total_weight.checked_add(scenario.weight).ok_or_else(|| {
                SwarmError::InvalidWeight {
                    weight: scenario.weight,
                    detail: "total scenario weight overflows".to_string(),
                }
            })?;
            cumulative_weights.push(total_weight);
        }

        Ok(ScenarioRegistry {
            scenarios,
            cumulative_weights,
            total_weight,
        })
    }

    pub fn total_weight(&self) -> usize {
        self.total_weight
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    /// Index of the scenario whose cumulative range contains `draw`.
    ///
    /// `draw` must be less than [`total_weight`](Self::total_weight).
    pub fn index_for(&self, draw: usize) -> usize {
        self.cumulative_weights.partition_point(|&bound| bound <= draw)
    }

    /// Pick a scenario by weight.
    pub fn select<R: Rng>(&self, rng: &mut R) -> &Scenario {
        let draw = rng.random_range(0..self.total_weight);
        &self.scenarios[self.index_for(draw)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    async fn noop(_user: &mut VirtualUser) -> ScenarioResult {
        Ok(())
    }

    fn weighted(weights: &[usize]) -> ScenarioRegistry {
        let scenarios = weights
            .iter()
            .enumerate()
            .map(|(i, weight)| {
                crate::scenario!(noop)
                    .set_name(&format!("scenario {}", i))
                    .set_weight(*weight)
                    .unwrap()
            })
            .collect();
        ScenarioRegistry::new(scenarios).unwrap()
    }

    #[test]
    fn zero_weight_rejected() {
        let result = crate::scenario!(noop).set_weight(0);
        assert!(matches!(result, Err(SwarmError::InvalidWeight { weight: 0, .. })));
    }

    #[test]
    fn empty_registry_rejected() {
        let result = ScenarioRegistry::new(Vec::new());
        assert!(matches!(result, Err(SwarmError::NoScenarios { .. })));
    }

    #[test]
    fn cumulative_ranges() {
        let registry = weighted(&[10, 5, 1]);
        assert_eq!(registry.total_weight(), 16);
        assert_eq!(registry.index_for(0), 0);
        assert_eq!(registry.index_for(9), 0);
        assert_eq!(registry.index_for(10), 1);
        assert_eq!(registry.index_for(14), 1);
        assert_eq!(registry.index_for(15), 2);
    }

    #[test]
    fn selection_converges_to_weights() {
        let weights = [10, 5, 1];
        let registry = weighted(&weights);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let draws = 100_000;
        let mut counts = [0usize; 3];
        for _ in 0..draws {
            let scenario = registry.select(&mut rng);
            let index = registry
                .scenarios()
                .iter()
                .position(|s| s.name == scenario.name)
                .unwrap();
            counts[index] += 1;
        }
        let total: usize = weights.iter().sum();
        for (count, weight) in counts.iter().zip(weights.iter()) {
            let observed = *count as f64 / draws as f64;
            let expected = *weight as f64 / total as f64;
            assert!(
                (observed - expected).abs() < 0.02,
                "observed {} expected {}",
                observed,
                expected
            );
        }
    }

    #[test]
    fn single_scenario_always_selected() {
        let registry = weighted(&[3]);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(registry.select(&mut rng).name, "scenario 0");
        }
    }
}
