//! External bitcoind-compatible daemons, one process per node, driven
//! through the daemon's command-line RPC client.

pub mod cli;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;

use self::cli::CliRpc;
use crate::config_models::cli_args::Args;
use crate::config_models::data_directory::NodeDirectory;
use crate::config_models::network::Network;
use crate::models::node::NodeIndex;
use crate::node::error::RpcError;
use crate::node::NodeLauncher;
use crate::node::NodeRpc;
use crate::node::RpcResult;

const LOCALHOST: &str = "127.0.0.1";

/// Spawns daemons and waits until they answer RPC calls.
#[derive(Debug, Clone)]
pub struct DaemonLauncher {
    pub daemon_bin: PathBuf,
    pub cli_bin: PathBuf,
    pub network: Network,
    pub base_port: u16,
    pub rpc_user: String,
    pub rpc_password: String,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
}

impl From<&Args> for DaemonLauncher {
    fn from(args: &Args) -> Self {
        Self {
            daemon_bin: args.daemon_bin.clone(),
            cli_bin: args.cli_bin.clone(),
            network: args.network,
            base_port: args.base_port,
            rpc_user: args.rpc_user.clone(),
            rpc_password: args.rpc_password.clone(),
            startup_timeout: args.startup_timeout,
            poll_interval: args.poll_interval,
        }
    }
}

impl DaemonLauncher {
    /// Peer port of node `index`. Its RPC port is the next one.
    pub fn p2p_port(&self, index: NodeIndex) -> RpcResult<u16> {
        u16::try_from(index.0)
            .ok()
            .and_then(|i| i.checked_mul(2))
            .and_then(|offset| self.base_port.checked_add(offset))
            .filter(|port| *port < u16::MAX)
            .ok_or_else(|| RpcError::Failed(format!("no free port for {index}")))
    }

    pub fn rpc_port(&self, index: NodeIndex) -> RpcResult<u16> {
        Ok(self.p2p_port(index)? + 1)
    }

    /// Arguments identifying node `index` to both the daemon and its client.
    fn connection_args(&self, index: NodeIndex, data_dir: &NodeDirectory) -> RpcResult<Vec<String>> {
        Ok(vec![
            self.network.daemon_flag().to_string(),
            format!("-datadir={}", data_dir.root_dir_path().display()),
            format!("-rpcport={}", self.rpc_port(index)?),
            format!("-rpcuser={}", self.rpc_user),
            format!("-rpcpassword={}", self.rpc_password),
        ])
    }
}

#[async_trait]
impl NodeLauncher for DaemonLauncher {
    async fn start(
        &self,
        index: NodeIndex,
        data_dir: &NodeDirectory,
        args: &[String],
    ) -> RpcResult<Box<dyn NodeRpc>> {
        let connection_args = self.connection_args(index, data_dir)?;
        let p2p_port = self.p2p_port(index)?;

        let mut command = Command::new(&self.daemon_bin);
        command
            .args(&connection_args)
            .arg(format!("-port={p2p_port}"))
            .arg("-server")
            .arg("-listen=1")
            .arg("-discover=0")
            .arg("-printtoconsole=0")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        debug!("spawning {command:?}");
        let child = command.spawn().map_err(|e| {
            RpcError::Failed(format!(
                "failed to spawn {}: {e}",
                self.daemon_bin.display()
            ))
        })?;

        let mut rpc = CliRpc::new(
            self.cli_bin.clone(),
            connection_args,
            format!("{LOCALHOST}:{p2p_port}"),
            child,
            self.startup_timeout,
        );

        let start = Instant::now();
        loop {
            match rpc.block_count().await {
                Ok(height) => {
                    info!("{index} ready at height {height} after {:?}", start.elapsed());
                    return Ok(Box::new(rpc));
                }
                Err(e) => debug!("{index} not ready yet: {e}"),
            }
            rpc.ensure_alive()?;
            if start.elapsed() >= self.startup_timeout {
                return Err(RpcError::StartupTimeout(self.startup_timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn ports_are_assigned_pairwise() {
        let launcher = DaemonLauncher::from(&Args::default());
        assert_eq!(18600, launcher.p2p_port(NodeIndex(0)).unwrap());
        assert_eq!(18601, launcher.rpc_port(NodeIndex(0)).unwrap());
        assert_eq!(18606, launcher.p2p_port(NodeIndex(3)).unwrap());
        assert_eq!(18607, launcher.rpc_port(NodeIndex(3)).unwrap());
        assert!(launcher.p2p_port(NodeIndex(40_000)).is_err());
    }

    #[tokio::test]
    async fn missing_daemon_binary_fails_to_start() {
        let mut args = Args::default();
        args.daemon_bin = PathBuf::from("/nonexistent/walletcheck-daemon");
        let launcher = DaemonLauncher::from(&args);
        let dir = NodeDirectory::new(std::env::temp_dir().join("walletcheck-missing"), Network::RegTest);

        let result = launcher.start(NodeIndex(0), &dir, &[]).await;
        assert!(matches!(result, Err(RpcError::Failed(_))));
    }
}
