use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::distr::Alphanumeric;
use rand::distr::SampleString;

use crate::cluster::Cluster;
use crate::cluster::SyncPolicy;
use crate::config_models::data_directory::DataDirectory;
use crate::config_models::network::Network;
use crate::regtest::SimNetwork;

/// Create a randomly named `DataDirectory` so filesystem-bound tests can run
/// in parallel.
pub fn unit_test_data_directory(network: Network) -> Result<DataDirectory> {
    let mut rng = rand::rng();
    let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
    let tmp_root: PathBuf = std::env::temp_dir()
        .join(format!("walletcheck-unit-tests-{}", user))
        .join(Alphanumeric.sample_string(&mut rng, 16));

    DataDirectory::get(Some(tmp_root), network)
}

/// Barriers that give up quickly, for tests that expect them to fail.
pub fn impatient_sync_policy() -> SyncPolicy {
    SyncPolicy {
        timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(5),
    }
}

/// A stopped cluster of `num_spenders` simulated spenders plus a miner.
pub fn sim_cluster(
    num_spenders: usize,
    keypool: usize,
    sync: SyncPolicy,
) -> Result<(Cluster, DataDirectory)> {
    let data_dir = unit_test_data_directory(Network::RegTest)?;
    let network = Arc::new(SimNetwork::new(Duration::from_millis(1)));
    let cluster = Cluster::with_nodes(
        num_spenders,
        &data_dir,
        &[format!("-keypool={keypool}")],
        network,
        sync,
    );
    Ok((cluster, data_dir))
}

/// A running cluster, linked in a chain and agreeing on genesis.
pub async fn running_sim_cluster(num_spenders: usize) -> Result<(Cluster, DataDirectory)> {
    let (mut cluster, data_dir) = sim_cluster(num_spenders, 20, SyncPolicy::default())?;
    cluster.start_all().await?;
    cluster.connect_chain().await?;
    cluster.barrier_chain().await?;
    Ok((cluster, data_dir))
}
