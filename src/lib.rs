// If code coverage tool `cargo-llvm-cov` is running with the nightly toolchain,
// enable the unstable “coverage” attribute. This allows using the annotation
// `#[coverage(off)]` to explicitly exclude certain parts of the code from
// being considered as “code under test.” Most prominently, the annotation
// should be added to every `#[cfg(test)]` module. Since the “coverage”
// feature is enable only conditionally, the annotation to use is:
// `#[cfg_attr(coverage_nightly, coverage(off))]`.
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod cluster;
pub mod config_models;
pub mod daemon;
pub mod error;
pub mod models;
pub mod node;
pub mod reconciliation;
pub mod recovery;
pub mod regtest;
pub mod round;
pub mod scenario;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
pub mod tests;

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use anyhow::Result;
use tracing::info;
use tracing::warn;

use crate::cluster::Cluster;
use crate::cluster::SyncPolicy;
use crate::config_models::cli_args;
use crate::config_models::cli_args::Backend;
use crate::config_models::data_directory::DataDirectory;
use crate::daemon::DaemonLauncher;
use crate::node::NodeLauncher;
use crate::regtest::SimNetwork;
use crate::scenario::Scenario;
use crate::scenario::ScenarioConfig;
use crate::scenario::ScenarioReport;

pub const SUCCESS_EXIT_CODE: i32 = 0;
pub const SCENARIO_FAILED_EXIT_CODE: i32 = 1;

/// Run the wallet backup scenario once, as configured by `cli_args`.
pub async fn initialize(cli_args: cli_args::Args) -> Result<ScenarioReport> {
    let config = ScenarioConfig::from_args(&cli_args);

    let started = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .context("system clock is before the unix epoch")?;
    let data_directory = DataDirectory::get(cli_args.data_dir.clone(), cli_args.network)?
        .run_dir(&format!("run-{}-{}", started.as_secs(), config.seed));
    DataDirectory::create_dir_if_not_exists(&data_directory.root_dir_path()).await?;
    info!(
        "Running wallet backup scenario on {} against {} backend",
        cli_args.network, cli_args.backend
    );
    info!("Data directory is {}", data_directory);

    let launcher: Arc<dyn NodeLauncher> = match cli_args.backend {
        Backend::Regtest => Arc::new(SimNetwork::new(cli_args.relay_interval)),
        Backend::Daemon => Arc::new(DaemonLauncher::from(&cli_args)),
    };
    let cluster = Cluster::with_nodes(
        usize::from(cli_args.spenders),
        &data_directory,
        &cli_args.node_start_args(),
        launcher,
        SyncPolicy::from(&cli_args),
    );

    let mut scenario = Scenario::new(cluster, data_directory, config)?;
    let result = scenario.run().await;
    if result.is_err() {
        // leave no daemon running behind a failed run
        if let Err(e) = scenario.cluster_mut().stop_all().await {
            warn!("could not stop every node: {e}");
        }
    }
    Ok(result?)
}
