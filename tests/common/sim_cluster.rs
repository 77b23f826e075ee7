use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::distr::Alphanumeric;
use rand::distr::SampleString;
use walletcheck::cluster::Cluster;
use walletcheck::cluster::SyncPolicy;
use walletcheck::config_models::cli_args::Args;
use walletcheck::config_models::data_directory::DataDirectory;
use walletcheck::config_models::network::Network;
use walletcheck::regtest::SimNetwork;
use walletcheck::scenario::Scenario;
use walletcheck::scenario::ScenarioConfig;

/// Create a randomly named directory so tests can run in parallel.
pub fn integration_test_data_dir() -> PathBuf {
    let mut rng = rand::rng();
    let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
    std::env::temp_dir()
        .join(format!("walletcheck-integration-tests-{}", user))
        .join(Alphanumeric.sample_string(&mut rng, 16))
}

/// provides walletcheck arguments for a fast in-process run.
pub fn default_args(seed: u64) -> Args {
    let mut args = Args::default();
    args.data_dir = Some(integration_test_data_dir());
    args.seed = Some(seed);
    args.relay_interval = Duration::from_millis(1);
    args.poll_interval = Duration::from_millis(5);
    args.keypool = 30;
    args
}

/// A scenario over simulated nodes, nothing started yet.
pub fn sim_scenario(args: &Args) -> anyhow::Result<Scenario> {
    let data_dir = DataDirectory::get(args.data_dir.clone(), Network::RegTest)?;
    let cluster = Cluster::with_nodes(
        usize::from(args.spenders),
        &data_dir,
        &args.node_start_args(),
        Arc::new(SimNetwork::new(args.relay_interval)),
        SyncPolicy::from(args),
    );
    Ok(Scenario::new(
        cluster,
        data_dir,
        ScenarioConfig::from_args(args),
    )?)
}
