use std::collections::BTreeMap;

use num_traits::Zero;
use tracing::info;

use super::checkpoint::ArtifactKind;
use super::checkpoint::Checkpoint;
use super::checkpoint::NodeRecoveryState;
use super::checkpoint::RecoveryPath;
use crate::cluster::Cluster;
use crate::config_models::data_directory::DataDirectory;
use crate::config_models::data_directory::BACKUP_FILE_NAME;
use crate::config_models::data_directory::DUMP_FILE_NAME;
use crate::error::HarnessError;
use crate::models::coin_amount::CoinAmount;
use crate::models::node::NodeIndex;

/// What [`BackupController::destroy`] removes besides the wallet stores of
/// the checkpointed nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DestructionPlan {
    /// node whose chain store is removed too, so it must resync from its
    /// peers.
    pub chain_resync: Option<NodeIndex>,
}

/// Drives the per-node cycle `Live -> Checkpointed -> Destroyed ->
/// Recovered`.
///
/// Artifacts are kept outside the nodes' data directories, so destroying a
/// node never touches them.
#[derive(Debug)]
pub struct BackupController {
    data_dir: DataDirectory,
    checkpoints: BTreeMap<NodeIndex, Checkpoint>,
    states: BTreeMap<NodeIndex, NodeRecoveryState>,
}

impl BackupController {
    pub fn new(data_dir: DataDirectory) -> Self {
        Self {
            data_dir,
            checkpoints: BTreeMap::new(),
            states: BTreeMap::new(),
        }
    }

    pub fn state(&self, node: NodeIndex) -> NodeRecoveryState {
        self.states.get(&node).copied().unwrap_or_default()
    }

    pub fn checkpoint(&self, node: NodeIndex) -> Option<&Checkpoint> {
        self.checkpoints.get(&node)
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.values()
    }

    /// Move every checkpointed node to `next`, or none of them.
    fn transition_all(&mut self, next: NodeRecoveryState) -> Result<(), HarnessError> {
        let updated = self
            .checkpoints
            .keys()
            .map(|&node| Ok((node, self.state(node).transition(node, next)?)))
            .collect::<Result<Vec<_>, HarnessError>>()?;
        self.states.extend(updated);
        Ok(())
    }

    async fn ensure_artifact(
        checkpoint: &Checkpoint,
        kind: ArtifactKind,
    ) -> Result<(), HarnessError> {
        let path = checkpoint.artifact_path(kind);
        if tokio::fs::try_exists(path).await? {
            Ok(())
        } else {
            Err(HarnessError::ArtifactMissing {
                checkpoint: checkpoint.name.clone(),
                node: checkpoint.node,
                kind,
                path: path.to_path_buf(),
            })
        }
    }

    /// Take a backup and an export of every node in `nodes`.
    ///
    /// Capturing must not change what a node holds: the balance is read
    /// before and after, and has to agree.
    pub async fn capture(
        &mut self,
        cluster: &Cluster,
        name: &str,
        nodes: &[NodeIndex],
    ) -> Result<(), HarnessError> {
        for &node in nodes {
            self.state(node)
                .transition(node, NodeRecoveryState::Checkpointed)?;
        }

        for &index in nodes {
            let node = cluster.node(index)?;
            let artifact_dir = self.data_dir.artifact_dir_path(name, index);
            DataDirectory::create_dir_if_not_exists(&artifact_dir).await?;

            let balance_at_capture = node.balance().await?;
            let tip = node.best_block().await?;
            let checkpoint = Checkpoint {
                name: name.to_string(),
                node: index,
                backup_path: artifact_dir.join(BACKUP_FILE_NAME),
                export_path: artifact_dir.join(DUMP_FILE_NAME),
                balance_at_capture,
                height_at_capture: tip.height,
                expected_balance: None,
            };

            node.backup(&checkpoint.backup_path).await?;
            node.export(&checkpoint.export_path).await?;
            Self::ensure_artifact(&checkpoint, ArtifactKind::Backup).await?;
            Self::ensure_artifact(&checkpoint, ArtifactKind::Export).await?;

            let after = node.balance().await?;
            if after != balance_at_capture {
                return Err(HarnessError::BalanceMismatch {
                    context: format!("capture of checkpoint `{name}`"),
                    node: index,
                    expected: balance_at_capture,
                    actual: after,
                });
            }

            info!(
                "checkpoint `{name}` captured for {index} at height {}, balance {balance_at_capture}",
                tip.height
            );
            self.checkpoints.insert(index, checkpoint);
            self.states.insert(index, NodeRecoveryState::Checkpointed);
        }
        Ok(())
    }

    /// Record the balance every checkpointed node held right before it is
    /// destroyed. Recovery must reproduce exactly that.
    pub fn settle(
        &mut self,
        expected: &BTreeMap<NodeIndex, CoinAmount>,
    ) -> Result<(), HarnessError> {
        for checkpoint in self.checkpoints.values_mut() {
            let balance = expected
                .get(&checkpoint.node)
                .copied()
                .ok_or(HarnessError::UnknownNode(checkpoint.node))?;
            checkpoint.expected_balance = Some(balance);
            info!(
                "checkpoint `{}` of {} settled at {balance}",
                checkpoint.name, checkpoint.node
            );
        }
        Ok(())
    }

    /// Stop every node, remove the wallet store of each checkpointed node
    /// and the chain store of the resync node.
    pub async fn destroy(
        &mut self,
        cluster: &mut Cluster,
        plan: DestructionPlan,
    ) -> Result<(), HarnessError> {
        if let Some(unsettled) = self.checkpoints.values().find(|c| !c.is_settled()) {
            return Err(HarnessError::Failed(format!(
                "checkpoint `{}` of {} must be settled before destruction",
                unsettled.name, unsettled.node
            )));
        }
        self.transition_all(NodeRecoveryState::Destroyed)?;

        cluster.stop_all().await?;
        for &node in self.checkpoints.keys() {
            cluster.node(node)?.wipe_wallet().await?;
        }
        if let Some(node) = plan.chain_resync {
            cluster.node(node)?.wipe_chain().await?;
        }
        info!(
            "destroyed wallets of {} node(s), chain resync: {:?}",
            self.checkpoints.len(),
            plan.chain_resync
        );
        Ok(())
    }

    /// Bring every destroyed wallet back through `path` and check it holds
    /// the settled balance. Returns the recovered balances.
    pub async fn recover(
        &mut self,
        cluster: &mut Cluster,
        path: RecoveryPath,
    ) -> Result<BTreeMap<NodeIndex, CoinAmount>, HarnessError> {
        for &node in self.checkpoints.keys() {
            self.state(node)
                .transition(node, NodeRecoveryState::Recovered)?;
        }

        match path {
            RecoveryPath::FromBinaryBackup => self.restore_backups(cluster).await?,
            RecoveryPath::FromExport => self.import_exports(cluster).await?,
        }

        let recovered = self.verify_recovered(cluster, path).await?;
        self.transition_all(NodeRecoveryState::Recovered)?;
        info!("{} wallet(s) recovered via {path}", recovered.len());
        Ok(recovered)
    }

    async fn restore_backups(&self, cluster: &mut Cluster) -> Result<(), HarnessError> {
        for checkpoint in self.checkpoints.values() {
            Self::ensure_artifact(checkpoint, ArtifactKind::Backup).await?;
            cluster
                .node(checkpoint.node)?
                .install_wallet(&checkpoint.backup_path)
                .await?;
        }

        cluster.start_all().await?;
        cluster.reconnect().await?;
        cluster.barrier_chain().await?;
        Ok(())
    }

    async fn import_exports(&self, cluster: &mut Cluster) -> Result<(), HarnessError> {
        for checkpoint in self.checkpoints.values() {
            Self::ensure_artifact(checkpoint, ArtifactKind::Export).await?;
        }

        cluster.start_all().await?;
        cluster.reconnect().await?;
        for checkpoint in self.checkpoints.values() {
            let balance = cluster.node(checkpoint.node)?.balance().await?;
            if !balance.is_zero() {
                return Err(HarnessError::BalanceMismatch {
                    context: format!("empty wallet before import of `{}`", checkpoint.name),
                    node: checkpoint.node,
                    expected: CoinAmount::zero(),
                    actual: balance,
                });
            }
        }

        cluster.barrier_chain().await?;
        for checkpoint in self.checkpoints.values() {
            cluster
                .node(checkpoint.node)?
                .import(&checkpoint.export_path)
                .await?;
        }
        cluster.barrier_chain().await?;
        Ok(())
    }

    /// The one check both recovery paths end in.
    async fn verify_recovered(
        &self,
        cluster: &Cluster,
        path: RecoveryPath,
    ) -> Result<BTreeMap<NodeIndex, CoinAmount>, HarnessError> {
        let mut recovered = BTreeMap::new();
        for checkpoint in self.checkpoints.values() {
            let actual = cluster.node(checkpoint.node)?.balance().await?;
            let expected = checkpoint.expected_balance.ok_or_else(|| {
                HarnessError::Failed(format!(
                    "checkpoint `{}` of {} was never settled",
                    checkpoint.name, checkpoint.node
                ))
            })?;
            if actual != expected {
                return Err(HarnessError::BalanceMismatch {
                    context: format!("checkpoint `{}` recovered {path}", checkpoint.name),
                    node: checkpoint.node,
                    expected,
                    actual,
                });
            }
            recovered.insert(checkpoint.node, actual);
        }
        Ok(recovered)
    }
}
