//! Wallet checkpoints and the two ways of getting a wallet back.

pub mod checkpoint;
pub mod controller;

pub use checkpoint::Checkpoint;
pub use checkpoint::NodeRecoveryState;
pub use checkpoint::RecoveryPath;
pub use controller::BackupController;
pub use controller::DestructionPlan;
