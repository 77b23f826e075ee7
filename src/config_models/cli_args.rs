use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use super::network::Network;

/// Node implementation the harness drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Backend {
    /// In-process simulated ledger nodes.
    #[default]
    Regtest,

    /// External bitcoind-compatible daemons driven through their RPC client.
    Daemon,
}

/// The `walletcheck` command-line program runs the wallet backup and
/// restore consistency scenario against a cluster of ledger nodes.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// Node implementation to drive.
    #[clap(long, value_enum, default_value = "regtest")]
    pub backend: Backend,

    /// Specify network, `regtest` or `testnet`
    #[clap(long, default_value = "regtest")]
    pub network: Network,

    /// The directory that holds every node's data directory and the
    /// checkpoint artifacts.
    ///
    /// The default varies by operating system, and includes the network, e.g.
    ///
    /// Linux:   /home/alice/.local/share/walletcheck/regtest
    #[clap(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Number of spender nodes. One additional node is the miner.
    #[clap(
        long,
        default_value = "3",
        value_parser = clap::value_parser!(u8).range(2..=16),
    )]
    pub spenders: u8,

    /// Rounds of transactions before the checkpoint is captured.
    #[clap(long, default_value = "5")]
    pub rounds_before_checkpoint: u32,

    /// Rounds of transactions after the checkpoint is captured.
    #[clap(long, default_value = "5")]
    pub rounds_after_checkpoint: u32,

    /// Seed for the round generator. A random seed is drawn (and logged)
    /// when absent.
    #[clap(long)]
    pub seed: Option<u64>,

    /// Probability that any single send of a round is attempted.
    #[clap(long, default_value = "0.5", value_parser = fraction_validator)]
    pub send_probability: f64,

    /// Spender whose chain store is removed before each recovery pass, so it
    /// must resync the chain from its peers.
    #[clap(long, default_value = "2")]
    pub resync_node: usize,

    /// Leave every chain store in place during recovery passes.
    #[clap(long)]
    pub keep_chains: bool,

    /// Number of pre-generated wallet keys. Must cover every address a
    /// spender mints after the checkpoint.
    #[clap(long, default_value = "100")]
    pub keypool: u32,

    /// Upper bound on any synchronization barrier, e.g. `90s`.
    #[clap(long, default_value = "60s", value_parser = humantime::parse_duration)]
    pub sync_timeout: Duration,

    /// Delay between two polls of a barrier.
    #[clap(long, default_value = "20ms", value_parser = humantime::parse_duration)]
    pub poll_interval: Duration,

    /// Upper bound on a node becoming ready after start.
    #[clap(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub startup_timeout: Duration,

    /// Delay between two relay hops of the simulated network.
    #[clap(long, default_value = "2ms", value_parser = humantime::parse_duration)]
    pub relay_interval: Duration,

    /// Node daemon executable (daemon backend).
    #[clap(long, default_value = "bitcoind", value_name = "PATH")]
    pub daemon_bin: PathBuf,

    /// RPC client executable (daemon backend).
    #[clap(long, default_value = "bitcoin-cli", value_name = "PATH")]
    pub cli_bin: PathBuf,

    /// First port handed out to daemons. Node `i` listens for peers on
    /// `base_port + 2i` and for RPC on `base_port + 2i + 1`.
    #[clap(long, default_value = "18600")]
    pub base_port: u16,

    /// RPC user for the daemons.
    #[clap(long, default_value = "walletcheck")]
    pub rpc_user: String,

    /// RPC password for the daemons.
    #[clap(long, default_value = "walletcheck")]
    pub rpc_password: String,

    /// Send trace events to tokio-console.
    #[clap(long)]
    pub tokio_console: bool,
}

impl Args {
    /// Start arguments given to every node.
    pub fn node_start_args(&self) -> Vec<String> {
        vec![format!("-keypool={}", self.keypool)]
    }

    /// The spender whose chain store is removed before recovery, if any.
    pub fn chain_resync_node(&self) -> Option<usize> {
        (!self.keep_chains).then_some(self.resync_node)
    }
}

impl Default for Args {
    fn default() -> Self {
        let empty: Vec<String> = vec![];
        Self::parse_from(empty)
    }
}

fn fraction_validator(s: &str) -> Result<f64, String> {
    let value = s
        .parse::<f64>()
        .map_err(|_| format!("`{s}` isn't a valid float"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("Fraction must be between 0 and 1, got {value}"))
    }
}
