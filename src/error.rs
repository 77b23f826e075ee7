//! provides the error type every harness operation returns.
//!
//! Every variant ends a scenario run. Nothing here is retried.

use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::Barrier;
use crate::models::coin_amount::CoinAmount;
use crate::models::node::NodeIndex;
use crate::node::error::RpcError;
use crate::recovery::checkpoint::ArtifactKind;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HarnessError {
    #[error("{barrier} barrier did not converge within {waited:?}. last observed: {detail}")]
    SyncTimeout {
        barrier: Barrier,
        waited: Duration,
        detail: String,
    },

    #[error("insufficient funds on {node}. requested: {requested}")]
    InsufficientFunds {
        node: NodeIndex,
        requested: CoinAmount,
    },

    #[error("balance mismatch for {node} at {context}. expected: {expected}, actual: {actual}")]
    BalanceMismatch {
        context: String,
        node: NodeIndex,
        expected: CoinAmount,
        actual: CoinAmount,
    },

    #[error("{kind} artifact of {node} for checkpoint `{checkpoint}` is missing: {}", .path.display())]
    ArtifactMissing {
        checkpoint: String,
        node: NodeIndex,
        kind: ArtifactKind,
        path: PathBuf,
    },

    #[error("invariant `{invariant}` violated. expected: {expected}, actual: {actual}")]
    InvariantViolated {
        invariant: &'static str,
        expected: CoinAmount,
        actual: CoinAmount,
    },

    #[error("{node} cannot go from {from} to {to}")]
    InvalidTransition {
        node: NodeIndex,
        from: &'static str,
        to: &'static str,
    },

    #[error("{0} is not running")]
    NodeStopped(NodeIndex),

    #[error("{0} must be stopped before its stores are touched")]
    StoreInUse(NodeIndex),

    #[error("{0} is not part of the cluster")]
    UnknownNode(NodeIndex),

    #[error("rpc to {node} failed: {source}")]
    Rpc {
        node: NodeIndex,
        #[source]
        source: RpcError,
    },

    // catch-all error, eg for anyhow errors
    #[error("harness operation failed. reason: {0}")]
    Failed(String),
}

// convert anyhow::Error to a HarnessError::Failed.
impl From<anyhow::Error> for HarnessError {
    fn from(e: anyhow::Error) -> Self {
        Self::Failed(format!("{e:#}"))
    }
}

impl From<std::io::Error> for HarnessError {
    fn from(e: std::io::Error) -> Self {
        Self::Failed(e.to_string())
    }
}
