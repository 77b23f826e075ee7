//! A simulated regtest network that runs inside the harness process.
//!
//! Each node keeps a separately removable wallet store and chain store in
//! its data directory, mines on demand, and relays blocks and transactions
//! to its peers asynchronously. The rules are minimal: unspent outputs,
//! coinbase maturity, subsidy halving and a size-based relay fee.

pub mod block;
pub mod chain;
pub mod mempool;
pub mod network;
pub mod node;
pub mod wallet;

pub use network::SimNetwork;
