use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::HarnessError;
use crate::models::coin_amount::CoinAmount;
use crate::models::node::BlockHeight;
use crate::models::node::NodeIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ArtifactKind {
    /// byte-exact copy of the wallet store.
    Backup,

    /// text dump of the wallet's secrets.
    Export,
}

/// How a destroyed wallet is brought back.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    strum::Display,
    strum::EnumIter,
)]
pub enum RecoveryPath {
    /// put the backup in place of the wallet store before the node starts.
    FromBinaryBackup,

    /// start with an empty wallet and import the export.
    FromExport,
}

/// Where a node stands in the backup and restore cycle.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumIs, strum::IntoStaticStr,
)]
pub enum NodeRecoveryState {
    #[default]
    Live,
    Checkpointed,
    Destroyed,
    Recovered,
}

impl NodeRecoveryState {
    /// `Recovered -> Destroyed` allows a second recovery of the same
    /// checkpoint, by the other path.
    pub fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Live, Self::Checkpointed)
                | (Self::Checkpointed, Self::Destroyed)
                | (Self::Destroyed, Self::Recovered)
                | (Self::Recovered, Self::Destroyed)
        )
    }

    pub fn transition(self, node: NodeIndex, next: Self) -> Result<Self, HarnessError> {
        if self.can_become(next) {
            Ok(next)
        } else {
            Err(HarnessError::InvalidTransition {
                node,
                from: self.into(),
                to: next.into(),
            })
        }
    }
}

/// The artifacts of one node captured at a named point of a run, and the
/// balance any recovery from them has to reproduce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub name: String,
    pub node: NodeIndex,
    pub backup_path: PathBuf,
    pub export_path: PathBuf,
    pub balance_at_capture: CoinAmount,
    pub height_at_capture: BlockHeight,

    /// the balance right before destruction, once known.
    pub expected_balance: Option<CoinAmount>,
}

impl Checkpoint {
    pub fn artifact_path(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Backup => &self.backup_path,
            ArtifactKind::Export => &self.export_path,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.expected_balance.is_some()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn recovery_cycle_transitions() {
        let node = NodeIndex(0);
        let state = NodeRecoveryState::Live
            .transition(node, NodeRecoveryState::Checkpointed)
            .and_then(|s| s.transition(node, NodeRecoveryState::Destroyed))
            .and_then(|s| s.transition(node, NodeRecoveryState::Recovered))
            .and_then(|s| s.transition(node, NodeRecoveryState::Destroyed))
            .and_then(|s| s.transition(node, NodeRecoveryState::Recovered))
            .unwrap();
        assert!(state.is_recovered());
    }

    #[test]
    fn skipping_a_state_is_refused() {
        let node = NodeIndex(1);
        let err = NodeRecoveryState::Live
            .transition(node, NodeRecoveryState::Destroyed)
            .unwrap_err();
        assert_eq!("node1 cannot go from Live to Destroyed", err.to_string());

        assert!(NodeRecoveryState::Checkpointed
            .transition(node, NodeRecoveryState::Recovered)
            .is_err());
        assert!(NodeRecoveryState::Recovered
            .transition(node, NodeRecoveryState::Checkpointed)
            .is_err());
    }
}
