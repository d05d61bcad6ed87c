//! Virtual users and the scheduling loop they run.
//!
//! Each virtual user runs [`user_main`] as its own Tokio task: pick a scenario by
//! weight, run it, pause for a random think-time, repeat. The loop only stops when
//! the controller sends [`UserCommand::Exit`] (or drops its end of the channel),
//! which is honored between scenarios and interrupts a think-time pause, but never
//! aborts a request in flight.

use rand::Rng;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use crate::client::Transport;
use crate::metrics::{RequestMetric, ScenarioMetric, SwarmMetric};
use crate::query::{ApiRequest, RequestSpec};
use crate::scenario::{ScenarioError, ScenarioRegistry, ScenarioResult};
use crate::SwarmError;

/// Commands the controller can send to a running user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// Stop after the current scenario completes.
    Exit,
}

/// Randomized pause between scenarios, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThinkTime {
    min: f64,
    max: f64,
}
impl ThinkTime {
    pub fn new(min: f64, max: f64) -> Result<Self, SwarmError> {
        if !(min.is_finite() && max.is_finite()) || min < 0.0 || min > max {
            return Err(SwarmError::InvalidWaitTime {
                min_wait: min,
                max_wait: max,
                detail: "min_wait must be a non-negative number no larger than max_wait".to_string(),
            });
        }
        if Duration::try_from_secs_f64(max).is_err() {
            return Err(SwarmError::InvalidWaitTime {
                min_wait: min,
                max_wait: max,
                detail: "max_wait is too large".to_string(),
            });
        }
        Ok(ThinkTime { min, max })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Draw a pause uniformly from `[min, max]`.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.min == self.max {
            Duration::from_secs_f64(self.min)
        } else {
            Duration::from_secs_f64(rng.random_range(self.min..=self.max))
        }
    }
}

/// One simulated API client.
///
/// Holds its own copy of the request headers (including the API key) and its
/// think-time range; nothing is shared with other users except the read-only
/// scenario registry.
pub struct VirtualUser {
    /// Which user this is, in hatch order.
    pub index: usize,
    /// Endpoints are joined onto this URL.
    pub base_url: Url,
    /// Sent with every request.
    pub headers: HeaderMap,
    pub think_time: ThinkTime,
    /// When the swarm started, request timestamps are relative to this.
    pub started: Instant,
    transport: Arc<dyn Transport>,
    metrics_channel: Option<flume::Sender<SwarmMetric>>,
}
impl VirtualUser {
    pub fn new(
        index: usize,
        base_url: Url,
        headers: HeaderMap,
        think_time: ThinkTime,
        transport: Arc<dyn Transport>,
        started: Instant,
    ) -> Self {
        trace!("new user {}", index);
        VirtualUser {
            index,
            base_url,
            headers,
            think_time,
            started,
            transport,
            metrics_channel: None,
        }
    }

    /// Send request and scenario metrics to the controller.
    pub fn set_metrics_channel(mut self, metrics_channel: flume::Sender<SwarmMetric>) -> Self {
        self.metrics_channel = Some(metrics_channel);
        self
    }

    /// Build a request from `spec` and send it, grouping its metrics under its
    /// reporting name.
    pub async fn api_request(&self, spec: &RequestSpec) -> ScenarioResult {
        let request = spec.build()?;
        self.get(&request).await?;
        Ok(())
    }

    /// Send a GET request, recording it as a [`RequestMetric`].
    ///
    /// Transport errors and non-2xx responses are recorded as failures and returned
    /// as errors; neither is retried.
    pub async fn get(&self, request: &ApiRequest) -> Result<RequestMetric, Box<ScenarioError>> {
        let url = self
            .base_url
            .join(&request.endpoint)
            .map_err(|e| SwarmError::InvalidRequest {
                endpoint: request.endpoint.clone(),
                detail: format!("failed to join endpoint onto {}: {}", self.base_url, e),
            })?;

        let mut metric = RequestMetric::new(
            self.started.elapsed().as_millis() as u64,
            &request.name,
            url.as_str(),
            self.index,
        );

        let started = Instant::now();
        let response = self
            .transport
            .get(&url, &request.params, &self.headers)
            .await;
        metric.response_time = started.elapsed().as_millis() as u64;

        let result = match response {
            Ok(response) => {
                metric.status_code = response.status.as_u16();
                metric.url = response.final_url;
                if response.status.is_success() {
                    Ok(())
                } else {
                    metric.success = false;
                    metric.error = response.status.to_string();
                    Err(ScenarioError::Status {
                        status_code: metric.status_code,
                        metric: metric.clone(),
                    })
                }
            }
            Err(e) => {
                metric.success = false;
                metric.error = e.to_string();
                Err(ScenarioError::Transport {
                    error: e.to_string(),
                    metric: metric.clone(),
                })
            }
        };
        debug!(
            "[user {}] {} {}: {} in {} ms",
            self.index, request.name, metric.url, metric.status_code, metric.response_time
        );
        self.send_metric(SwarmMetric::Request(metric.clone()));

        match result {
            Ok(()) => Ok(metric),
            Err(e) => Err(Box::new(e)),
        }
    }

    fn send_metric(&self, metric: SwarmMetric) {
        if let Some(channel) = &self.metrics_channel {
            // The controller only drops its receiver once every user has exited.
            if let Err(e) = channel.send(metric) {
                debug!("[user {}] failed to send metric: {}", self.index, e);
            }
        }
    }
}

/// Run a virtual user until told to stop, returning how many scenarios it ran.
pub async fn user_main(
    mut user: VirtualUser,
    registry: Arc<ScenarioRegistry>,
    receiver: flume::Receiver<UserCommand>,
) -> u64 {
    info!("launching user {}...", user.index);
    let mut iterations: u64 = 0;

    loop {
        if received_exit(&receiver) {
            break;
        }

        let scenario = registry.select(&mut rand::rng());
        debug!("[user {}] launching scenario {}", user.index, scenario.name);

        let elapsed = user.started.elapsed().as_millis() as u64;
        let started = Instant::now();
        let result = (scenario.function)(&mut user).await;
        iterations += 1;
        user.send_metric(SwarmMetric::Scenario(ScenarioMetric {
            elapsed,
            name: scenario.name.clone(),
            run_time: started.elapsed().as_millis() as u64,
            success: result.is_ok(),
            user: user.index,
        }));

        if let Err(e) = result {
            if e.is_request_failure() {
                debug!("[user {}] {} failed: {}", user.index, scenario.name, e);
            } else {
                error!(
                    "[user {}] stopping, scenario {} is broken: {}",
                    user.index, scenario.name, e
                );
                break;
            }
        }

        if received_exit(&receiver) {
            break;
        }

        let pause = user.think_time.sample(&mut rand::rng());
        trace!("[user {}] thinking for {:?}", user.index, pause);
        if !think(&receiver, pause).await {
            break;
        }
    }

    info!(
        "exiting user {} after {} scenarios...",
        user.index, iterations
    );
    iterations
}

/// Determine if the controller has asked this user to exit. A disconnected channel
/// means the controller is gone, which also ends the user.
fn received_exit(receiver: &flume::Receiver<UserCommand>) -> bool {
    match receiver.try_recv() {
        Ok(UserCommand::Exit) => true,
        Err(flume::TryRecvError::Empty) => false,
        Err(flume::TryRecvError::Disconnected) => true,
    }
}

/// Pause for `pause`, returning early with `false` if told to exit.
async fn think(receiver: &flume::Receiver<UserCommand>, pause: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => true,
        command = receiver.recv_async() => match command {
            Ok(UserCommand::Exit) | Err(_) => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{TransportError, TransportResponse};
    use crate::scenario::Scenario;
    use async_trait::async_trait;
    use http::StatusCode;
    use reqwest::header::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts requests, answering each with `status` or failing outright if `None`.
    struct CountingTransport {
        calls: AtomicUsize,
        status: Option<StatusCode>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn get(
            &self,
            url: &Url,
            _params: &[(String, String)],
            _headers: &HeaderMap,
        ) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.status {
                Some(status) => Ok(TransportResponse {
                    status,
                    final_url: url.to_string(),
                }),
                None => Err(TransportError {
                    message: "connection refused".to_string(),
                }),
            }
        }
    }

    async fn get_index(user: &mut VirtualUser) -> ScenarioResult {
        user.api_request(&RequestSpec::new("/")).await
    }

    async fn get_broken(user: &mut VirtualUser) -> ScenarioResult {
        user.api_request(&RequestSpec::new("/x").set_filter("", "y")).await
    }

    fn build_user(
        transport: Arc<CountingTransport>,
        min: f64,
        max: f64,
    ) -> (VirtualUser, flume::Receiver<SwarmMetric>) {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("test-key"));
        let (metrics_tx, metrics_rx) = flume::unbounded();
        let user = VirtualUser::new(
            0,
            Url::parse("http://127.0.0.1/").unwrap(),
            headers,
            ThinkTime::new(min, max).unwrap(),
            transport,
            Instant::now(),
        )
        .set_metrics_channel(metrics_tx);
        (user, metrics_rx)
    }

    fn registry(scenario: Scenario) -> Arc<ScenarioRegistry> {
        Arc::new(ScenarioRegistry::new(vec![scenario.set_name("test")]).unwrap())
    }

    #[test]
    fn think_time_validation() {
        assert!(ThinkTime::new(0.5, 3.0).is_ok());
        assert!(ThinkTime::new(1.0, 1.0).is_ok());
        assert!(matches!(
            ThinkTime::new(3.0, 0.5),
            Err(SwarmError::InvalidWaitTime { .. })
        ));
        assert!(ThinkTime::new(-1.0, 0.5).is_err());
        assert!(ThinkTime::new(0.0, f64::INFINITY).is_err());
        assert!(matches!(
            ThinkTime::new(0.0, 1e20),
            Err(SwarmError::InvalidWaitTime { .. })
        ));
    }

    #[test]
    fn think_time_within_range() {
        let think_time = ThinkTime::new(0.5, 3.0).unwrap();
        let mut rng = rand::rng();
        for _ in 0..1_000 {
            let pause = think_time.sample(&mut rng);
            assert!(pause >= Duration::from_millis(500));
            assert!(pause <= Duration::from_secs(3));
        }
        let fixed = ThinkTime::new(1.5, 1.5).unwrap();
        assert_eq!(fixed.sample(&mut rng), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn failures_are_recorded() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            status: Some(StatusCode::SERVICE_UNAVAILABLE),
        });
        let (user, metrics_rx) = build_user(transport, 0.0, 0.0);
        let result = user.api_request(&RequestSpec::new("/alerts")).await;
        match result {
            Err(e) => match *e {
                ScenarioError::Status { status_code, .. } => assert_eq!(status_code, 503),
                other => panic!("unexpected error: {}", other),
            },
            Ok(_) => panic!("503 must be a failure"),
        }
        match metrics_rx.try_recv().unwrap() {
            SwarmMetric::Request(metric) => {
                assert!(!metric.success);
                assert_eq!(metric.status_code, 503);
                assert_eq!(metric.name, "/alerts");
            }
            other => panic!("unexpected metric: {:?}", other),
        }
    }

    #[tokio::test]
    async fn loop_continues_past_failure() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            status: None,
        });
        let (user, metrics_rx) = build_user(transport.clone(), 0.0, 0.005);
        let (user_tx, user_rx) = flume::unbounded();
        let handle = tokio::spawn(user_main(user, registry(crate::scenario!(get_index)), user_rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        user_tx.send(UserCommand::Exit).unwrap();
        let iterations = handle.await.unwrap();

        assert!(iterations >= 10, "only {} iterations", iterations);
        assert_eq!(transport.calls.load(Ordering::SeqCst) as u64, iterations);
        let failed_requests = metrics_rx
            .drain()
            .filter(|m| matches!(m, SwarmMetric::Request(r) if !r.success))
            .count();
        assert_eq!(failed_requests as u64, iterations);
    }

    #[tokio::test]
    async fn stop_interrupts_think_time() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            status: Some(StatusCode::OK),
        });
        let (user, _metrics_rx) = build_user(transport.clone(), 10.0, 10.0);
        let (user_tx, user_rx) = flume::unbounded();
        let handle = tokio::spawn(user_main(user, registry(crate::scenario!(get_index)), user_rx));

        // Wait for the first scenario to complete, the user is now thinking for 10s.
        while transport.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        user_tx.send(UserCommand::Exit).unwrap();

        let iterations = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("user didn't stop during think time")
            .unwrap();
        assert_eq!(iterations, 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_controller_stops_user() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            status: Some(StatusCode::OK),
        });
        let (user, _metrics_rx) = build_user(transport, 10.0, 10.0);
        let (user_tx, user_rx) = flume::unbounded::<UserCommand>();
        drop(user_tx);
        let iterations = user_main(user, registry(crate::scenario!(get_index)), user_rx).await;
        assert_eq!(iterations, 0);
    }

    #[tokio::test]
    async fn malformed_request_stops_user() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            status: Some(StatusCode::OK),
        });
        let (user, _metrics_rx) = build_user(transport.clone(), 0.0, 0.0);
        let (_user_tx, user_rx) = flume::unbounded();
        let iterations = tokio::time::timeout(
            Duration::from_secs(1),
            user_main(user, registry(crate::scenario!(get_broken)), user_rx),
        )
        .await
        .unwrap();
        assert_eq!(iterations, 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }
}
