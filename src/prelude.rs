pub use crate::client::{Transport, TransportError, TransportResponse};
pub use crate::metrics::{RequestMetric, SwarmMetrics};
pub use crate::query::{ApiRequest, Include, ParamValue, RequestSpec, ScalarValue};
pub use crate::scenario::{Scenario, ScenarioError, ScenarioFunction, ScenarioResult};
pub use crate::user::{ThinkTime, VirtualUser};
pub use crate::{scenario, Swarm, SwarmError};
