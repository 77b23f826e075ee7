//! [`NodeRpc`] over the daemon's command-line client.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::models::coin_amount::CoinAmount;
use crate::models::node::Address;
use crate::models::node::BlockHeight;
use crate::models::node::TxId;
use crate::node::error::RpcError;
use crate::node::NodeRpc;
use crate::node::RpcResult;
use crate::node::WalletTransaction;

/// Command interface of one daemon process.
#[derive(Debug)]
pub struct CliRpc {
    cli_bin: PathBuf,
    connection_args: Vec<String>,
    p2p_address: String,
    child: Mutex<Child>,
    shutdown_timeout: Duration,
}

impl CliRpc {
    pub(super) fn new(
        cli_bin: PathBuf,
        connection_args: Vec<String>,
        p2p_address: String,
        child: Child,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            cli_bin,
            connection_args,
            p2p_address,
            child: Mutex::new(child),
            shutdown_timeout,
        }
    }

    /// Fails if the daemon process has already exited.
    pub(super) fn ensure_alive(&mut self) -> RpcResult<()> {
        match self.child.get_mut().try_wait()? {
            Some(status) => Err(RpcError::Failed(format!(
                "daemon exited during startup with {status}"
            ))),
            None => Ok(()),
        }
    }

    pub(super) async fn block_count(&self) -> RpcResult<BlockHeight> {
        let response = self.call("getblockcount", &[]).await?;
        parse_plain("getblockcount", &response)
    }

    /// Run one client command and return its trimmed standard output.
    async fn call(&self, method: &str, params: &[String]) -> RpcResult<String> {
        trace!("{} {method} {params:?}", self.p2p_address);
        let output = Command::new(&self.cli_bin)
            .args(&self.connection_args)
            .arg(method)
            .args(params)
            .output()
            .await
            .map_err(|e| {
                RpcError::Failed(format!("failed to run {}: {e}", self.cli_bin.display()))
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(parse_call_error(method, &stderr))
    }

    async fn call_json(&self, method: &str, params: &[String]) -> RpcResult<Value> {
        let response = self.call(method, params).await?;
        serde_json::from_str(&response).map_err(|_| RpcError::Malformed {
            method: method.to_string(),
            response,
        })
    }
}

/// Turn the client's error output into an [`RpcError`].
///
/// The client reports daemon-side failures as
///
/// ```text
/// error code: -6
/// error message:
/// Insufficient funds
/// ```
///
/// Anything else, e.g. a refused connection, is not a daemon response.
fn parse_call_error(method: &str, stderr: &str) -> RpcError {
    let Ok(re) = Regex::new(r"(?s)error code:\s*(-?[0-9]+)\s*error message:\s*(.*)") else {
        return RpcError::Failed(stderr.trim().to_string());
    };
    let Some((_full, [code, message])) = re.captures(stderr).map(|c| c.extract::<2>()) else {
        return RpcError::Failed(format!("`{method}`: {}", stderr.trim()));
    };
    match code.parse::<i64>() {
        Ok(code) => RpcError::Call {
            method: method.to_string(),
            code,
            message: message.trim().to_string(),
        },
        Err(_) => RpcError::Failed(stderr.trim().to_string()),
    }
}

fn parse_plain<T: FromStr>(method: &str, response: &str) -> RpcResult<T> {
    response.trim().parse().map_err(|_| RpcError::Malformed {
        method: method.to_string(),
        response: response.to_string(),
    })
}

/// Read a decimal field without a detour through `f64`.
fn amount_field(method: &str, value: &Value, field: &str) -> RpcResult<CoinAmount> {
    let malformed = || RpcError::Malformed {
        method: method.to_string(),
        response: value.to_string(),
    };
    match value.get(field) {
        None => Ok(CoinAmount::default()),
        Some(Value::Number(number)) => {
            CoinAmount::from_str(&number.to_string()).map_err(|_| malformed())
        }
        Some(_) => Err(malformed()),
    }
}

fn path_param(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl NodeRpc for CliRpc {
    async fn get_new_address(&self) -> RpcResult<Address> {
        let response = self.call("getnewaddress", &[]).await?;
        if response.is_empty() {
            return Err(RpcError::Malformed {
                method: "getnewaddress".to_string(),
                response,
            });
        }
        Ok(Address(response))
    }

    async fn send_to_address(&self, address: &Address, amount: CoinAmount) -> RpcResult<TxId> {
        let params = [address.0.clone(), amount.to_string()];
        match self.call("sendtoaddress", &params).await {
            Ok(txid) => Ok(TxId(txid)),
            Err(RpcError::Call { code, .. }) if code == RpcError::WALLET_INSUFFICIENT_FUNDS => {
                Err(RpcError::InsufficientFunds { requested: amount })
            }
            Err(e) => Err(e),
        }
    }

    async fn get_transaction(&self, txid: &TxId) -> RpcResult<WalletTransaction> {
        const METHOD: &str = "gettransaction";
        let value = self.call_json(METHOD, &[txid.0.clone()]).await?;
        let confirmations = value
            .get("confirmations")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        Ok(WalletTransaction {
            txid: txid.clone(),
            amount: amount_field(METHOD, &value, "amount")?,
            fee: amount_field(METHOD, &value, "fee")?,
            confirmations: u64::try_from(confirmations).unwrap_or_default(),
        })
    }

    async fn get_balance(&self) -> RpcResult<CoinAmount> {
        let response = self.call("getbalance", &[]).await?;
        CoinAmount::from_str(&response).map_err(|_| RpcError::Malformed {
            method: "getbalance".to_string(),
            response,
        })
    }

    async fn generate(&self, num_blocks: u32) -> RpcResult<()> {
        self.call("setgenerate", &["true".to_string(), num_blocks.to_string()])
            .await?;
        Ok(())
    }

    async fn get_block_count(&self) -> RpcResult<BlockHeight> {
        self.block_count().await
    }

    async fn get_best_block_hash(&self) -> RpcResult<String> {
        self.call("getbestblockhash", &[]).await
    }

    async fn get_raw_mempool(&self) -> RpcResult<BTreeSet<TxId>> {
        const METHOD: &str = "getrawmempool";
        let value = self.call_json(METHOD, &[]).await?;
        let Some(entries) = value.as_array() else {
            return Err(RpcError::Malformed {
                method: METHOD.to_string(),
                response: value.to_string(),
            });
        };
        entries
            .iter()
            .map(|entry| {
                entry
                    .as_str()
                    .map(|txid| TxId(txid.to_string()))
                    .ok_or_else(|| RpcError::Malformed {
                        method: METHOD.to_string(),
                        response: entry.to_string(),
                    })
            })
            .collect()
    }

    async fn backup_wallet(&self, path: &Path) -> RpcResult<()> {
        self.call("backupwallet", &[path_param(path)]).await?;
        Ok(())
    }

    async fn dump_wallet(&self, path: &Path) -> RpcResult<()> {
        self.call("dumpwallet", &[path_param(path)]).await?;
        Ok(())
    }

    async fn import_wallet(&self, path: &Path) -> RpcResult<()> {
        self.call("importwallet", &[path_param(path)]).await?;
        Ok(())
    }

    async fn add_node(&self, peer: &str) -> RpcResult<()> {
        self.call("addnode", &[peer.to_string(), "onetry".to_string()])
            .await?;
        Ok(())
    }

    fn p2p_address(&self) -> String {
        self.p2p_address.clone()
    }

    async fn stop(&mut self) -> RpcResult<()> {
        if let Err(e) = self.call("stop", &[]).await {
            warn!("{}: stop command failed: {e}", self.p2p_address);
        }

        let child = self.child.get_mut();
        match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!("{} exited with {status}", self.p2p_address);
                Ok(())
            }
            Err(_) => {
                warn!("{} did not exit within {:?}; killing it", self.p2p_address, self.shutdown_timeout);
                child.kill().await?;
                Ok(())
            }
        }
    }
}
