use gumdrop::Options;
use httpmock::MockServer;
use std::io::{self, BufRead};

use apiswarm::config::SwarmConfiguration;
use apiswarm::metrics::SwarmMetrics;
use apiswarm::scenario::Scenario;
use apiswarm::Swarm;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The following options are configured by default, if not set to a custom value:
///  --host <mock-server>
///  --users 1
///  --hatch-rate 1
///  --run-time 1
///  --api-key test-key
///  --min-wait 0
///  --max-wait 0.1
///  --no-print-metrics
pub fn build_configuration(server: &MockServer, custom: Vec<&str>) -> SwarmConfiguration {
    // Start with an empty configuration.
    let mut configuration: Vec<&str> = vec![];
    // Declare server_url here no matter what, so its lifetime is sufficient when needed.
    let server_url = server.base_url();

    // Merge in all custom options first.
    configuration.extend_from_slice(&custom);

    // Default to using mock server if not otherwise configured.
    if !configuration.contains(&"--host") {
        configuration.extend_from_slice(&["--host", &server_url]);
    }

    // Default to testing with 1 user if not otherwise configured.
    if !configuration.contains(&"--users") {
        configuration.extend_from_slice(&["--users", "1"]);
    }

    // Default to hatch 1 user per second if not otherwise configured.
    if !configuration.contains(&"--hatch-rate") {
        configuration.extend_from_slice(&["--hatch-rate", "1"]);
    }

    // Default to running for 1 second if not otherwise configured.
    if !configuration.contains(&"--run-time") {
        configuration.extend_from_slice(&["--run-time", "1"]);
    }

    // Default to a fixed API key if not otherwise configured.
    if !configuration.contains(&"--api-key") {
        configuration.extend_from_slice(&["--api-key", "test-key"]);
    }

    // Keep think time short so a one second test performs several requests.
    if !configuration.contains(&"--min-wait") {
        configuration.extend_from_slice(&["--min-wait", "0"]);
    }
    if !configuration.contains(&"--max-wait") {
        configuration.extend_from_slice(&["--max-wait", "0.1"]);
    }

    if !configuration.contains(&"--no-print-metrics") {
        configuration.push("--no-print-metrics");
    }

    // Parse these options to generate a SwarmConfiguration.
    SwarmConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Create a Swarm object from the configuration and scenarios.
pub fn build_swarm(configuration: SwarmConfiguration, scenarios: Vec<Scenario>) -> Swarm {
    Swarm::initialize_with_config(configuration).register_scenarios(scenarios)
}

/// Run the swarm, returning the SwarmMetrics.
pub async fn run_swarm(swarm: Swarm) -> SwarmMetrics {
    swarm.execute().await.unwrap()
}

/// Helper to count the number of lines in a test artifact.
#[allow(dead_code)]
pub fn file_length(file_name: &str) -> usize {
    if let Ok(file) = std::fs::File::open(std::path::Path::new(file_name)) {
        io::BufReader::new(file).lines().count()
    } else {
        0
    }
}

/// Helper to delete test artifacts, if existing.
#[allow(dead_code)]
pub fn cleanup_files(files: Vec<&str>) {
    for file in files {
        if std::path::Path::new(file).exists() {
            std::fs::remove_file(file).expect("failed to remove file");
        }
    }
}
