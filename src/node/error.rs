//! provides error types reported by a node's command interface.

use std::time::Duration;

use crate::models::coin_amount::CoinAmount;

/// enumerates possible failures of a single node command
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum RpcError {
    #[error("insufficient funds. requested: {requested}")]
    InsufficientFunds { requested: CoinAmount },

    #[error("node is not running")]
    NotRunning,

    #[error("`{method}` failed with code {code}: {message}")]
    Call {
        method: String,
        code: i64,
        message: String,
    },

    #[error("unexpected response to `{method}`: {response}")]
    Malformed { method: String, response: String },

    #[error("node did not become ready within {0:?}")]
    StartupTimeout(Duration),

    // catch-all error, eg for anyhow errors
    #[error("node command could not be completed. reason: {0}")]
    Failed(String),
}

impl RpcError {
    /// error code the reference daemon uses for `sendtoaddress` when the
    /// wallet cannot cover amount plus fee.
    pub const WALLET_INSUFFICIENT_FUNDS: i64 = -6;

    /// error code for a command the wallet rejects, e.g. importing a
    /// malformed dump.
    pub const WALLET_ERROR: i64 = -4;

    /// error code for a file the node could not read or write.
    pub const INVALID_PARAMETER: i64 = -8;
}

// convert anyhow::Error to a RpcError::Failed.
// note that anyhow Error is not Clone.
impl From<anyhow::Error> for RpcError {
    fn from(e: anyhow::Error) -> Self {
        Self::Failed(format!("{e:#}"))
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        Self::Failed(e.to_string())
    }
}
