use apiswarm::catalog;
use apiswarm::{Swarm, SwarmError};

#[tokio::main]
async fn main() -> Result<(), SwarmError> {
    Swarm::initialize()?
        .register_scenarios(catalog::api_scenarios()?)
        .execute()
        .await?;

    Ok(())
}
