use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use directories::ProjectDirs;

use crate::config_models::network::Network;
use crate::models::node::NodeIndex;

pub const WALLET_FILE_NAME: &str = "wallet.dat";
pub const DIR_NAME_FOR_BLOCKS: &str = "blocks";
pub const DIR_NAME_FOR_CHAINSTATE: &str = "chainstate";
pub const BACKUP_FILE_NAME: &str = "wallet.bak";
pub const DUMP_FILE_NAME: &str = "wallet.dump";
const ARTIFACTS_DIR_NAME: &str = "artifacts";

/// Root directory of one harness run. Every node gets its own
/// sub-directory; checkpoint artifacts live next to them, never inside a
/// node's own directory.
#[derive(Debug, Clone)]
pub struct DataDirectory {
    data_dir: PathBuf,
    network: Network,
}

impl DataDirectory {
    ///////////////////////////////////////////////////////////////////////////
    ///
    /// The data directory that contains every node's wallet and chain state
    ///
    /// The default varies by operating system, and includes the network, e.g.
    ///
    /// - Linux:   /home/alice/.local/share/walletcheck/regtest
    /// - Windows: C:\Users\Alice\AppData\Roaming\walletcheck\data\regtest
    /// - macOS:   /Users/Alice/Library/Application Support/org.walletcheck.walletcheck/regtest
    pub fn get(root_dir: Option<PathBuf>, network: Network) -> Result<Self> {
        let project_dirs = root_dir
            .map(ProjectDirs::from_path)
            .unwrap_or_else(|| ProjectDirs::from("org", "walletcheck", "walletcheck"))
            .context("Could not determine data directory")?;

        let network_dir = network.to_string();
        let data_dir = project_dirs.data_dir().join(Path::new(&network_dir));

        Ok(DataDirectory { data_dir, network })
    }

    /// Create directory if it does not exist
    pub async fn create_dir_if_not_exists(dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", dir.to_string_lossy()))
    }

    ///////////////////////////////////////////////////////////////////////////
    ///
    /// The root data directory path
    pub fn root_dir_path(&self) -> PathBuf {
        self.data_dir.clone()
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// A fresh sub-directory for one run, so runs never share node stores.
    pub fn run_dir(&self, run_name: &str) -> Self {
        Self {
            data_dir: self.data_dir.join(run_name),
            network: self.network,
        }
    }

    /// The data directory handed to node `index`.
    pub fn node(&self, index: NodeIndex) -> NodeDirectory {
        NodeDirectory {
            root: self.data_dir.join(index.to_string()),
            network: self.network,
        }
    }

    /// Directory holding the artifacts captured for `node` at `checkpoint`.
    pub fn artifact_dir_path(&self, checkpoint: &str, node: NodeIndex) -> PathBuf {
        self.data_dir
            .join(ARTIFACTS_DIR_NAME)
            .join(checkpoint)
            .join(node.to_string())
    }
}

impl std::fmt::Display for DataDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.data_dir.display())
    }
}

/// One node's data directory. The wallet store and the chain store are
/// separate removable units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDirectory {
    root: PathBuf,
    network: Network,
}

impl NodeDirectory {
    pub fn new(root: PathBuf, network: Network) -> Self {
        Self { root, network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// The directory passed to the node as its `-datadir`.
    pub fn root_dir_path(&self) -> PathBuf {
        self.root.clone()
    }

    /// The per-network directory the node creates inside its root.
    pub fn network_dir_path(&self) -> PathBuf {
        self.root.join(self.network.dir_name())
    }

    /// The wallet store.
    pub fn wallet_file_path(&self) -> PathBuf {
        self.network_dir_path().join(WALLET_FILE_NAME)
    }

    /// The block directory. Part of the chain store.
    pub fn block_dir_path(&self) -> PathBuf {
        self.network_dir_path().join(DIR_NAME_FOR_BLOCKS)
    }

    /// The chain state directory. Part of the chain store.
    pub fn chainstate_dir_path(&self) -> PathBuf {
        self.network_dir_path().join(DIR_NAME_FOR_CHAINSTATE)
    }

    pub fn has_wallet_store(&self) -> bool {
        self.wallet_file_path().is_file()
    }

    pub fn has_chain_store(&self) -> bool {
        self.block_dir_path().is_dir() && self.chainstate_dir_path().is_dir()
    }

    /// Remove the wallet store. A missing store is not an error.
    pub async fn remove_wallet_store(&self) -> Result<()> {
        let path = self.wallet_file_path();
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(e).with_context(|| format!("Failed to remove wallet {}", path.display()))
            }
            _ => Ok(()),
        }
    }

    /// Remove the chain store (blocks and chain state), leaving the wallet
    /// store untouched.
    pub async fn remove_chain_store(&self) -> Result<()> {
        for dir in [self.block_dir_path(), self.chainstate_dir_path()] {
            match tokio::fs::remove_dir_all(&dir).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    return Err(e)
                        .with_context(|| format!("Failed to remove {}", dir.display()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for NodeDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.root.display())
    }
}
