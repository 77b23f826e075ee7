//! The end-to-end wallet backup scenario.
//!
//! Bring up the cluster, give every spender coins, play rounds, capture a
//! checkpoint, play more rounds, let everything mature, then destroy and
//! recover the spenders' wallets once per recovery path. Every balance on
//! the way is checked against the [`Ledger`].

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use serde::Serialize;
use strum::IntoEnumIterator;
use tracing::info;

use crate::cluster::Cluster;
use crate::config_models::cli_args::Args;
use crate::config_models::data_directory::DataDirectory;
use crate::error::HarnessError;
use crate::models::coin_amount::CoinAmount;
use crate::models::node::BestBlock;
use crate::models::node::NodeIndex;
use crate::reconciliation::Ledger;
use crate::recovery::BackupController;
use crate::recovery::DestructionPlan;
use crate::recovery::RecoveryPath;
use crate::round::RoundGenerator;

pub const CHECKPOINT_NAME: &str = "mid-run";

#[derive(Clone, Debug, PartialEq)]
pub struct ScenarioConfig {
    pub rounds_before_checkpoint: u32,
    pub rounds_after_checkpoint: u32,
    pub seed: u64,
    pub send_probability: f64,

    /// node whose chain store is removed before each recovery pass.
    pub chain_resync: Option<NodeIndex>,
}

impl ScenarioConfig {
    /// Scenario settings from the command line. Draws a seed when none was
    /// given.
    pub fn from_args(args: &Args) -> Self {
        Self {
            rounds_before_checkpoint: args.rounds_before_checkpoint,
            rounds_after_checkpoint: args.rounds_after_checkpoint,
            seed: args.seed.unwrap_or_else(|| rand::rng().random()),
            send_probability: args.send_probability,
            chain_resync: args.chain_resync_node().map(NodeIndex),
        }
    }
}

/// What a passing run observed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScenarioReport {
    pub seed: u64,
    pub tip: BestBlock,
    pub balances: BTreeMap<NodeIndex, CoinAmount>,
    pub spender_sum: CoinAmount,
    pub fee_total: CoinAmount,
    pub transactions_sent: usize,
    pub matured_blocks: usize,
    pub recovered: BTreeMap<RecoveryPath, BTreeMap<NodeIndex, CoinAmount>>,
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "seed:              {}", self.seed)?;
        writeln!(f, "tip:               {}", self.tip)?;
        writeln!(f, "matured blocks:    {}", self.matured_blocks)?;
        writeln!(f, "transactions sent: {}", self.transactions_sent)?;
        writeln!(f, "fee total:         {}", self.fee_total)?;
        writeln!(f, "spender sum:       {}", self.spender_sum)?;
        for (node, balance) in &self.balances {
            writeln!(f, "  {node}: {balance}")?;
        }
        for (path, balances) in &self.recovered {
            let balances = balances
                .iter()
                .map(|(node, balance)| format!("{node}={balance}"))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "recovered {path}: {balances}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Scenario {
    config: ScenarioConfig,
    cluster: Cluster,
    ledger: Ledger,
    rounds: RoundGenerator,
    backups: BackupController,
    spenders: Vec<NodeIndex>,
    miner: NodeIndex,
}

impl Scenario {
    pub fn new(
        cluster: Cluster,
        data_dir: DataDirectory,
        config: ScenarioConfig,
    ) -> Result<Self, HarnessError> {
        let spenders = cluster.spenders();
        let miner = cluster.miner()?;
        if let Some(node) = config.chain_resync {
            cluster.node(node)?;
        }

        Ok(Self {
            ledger: Ledger::new(data_dir.network()),
            rounds: RoundGenerator::new(config.seed, config.send_probability),
            backups: BackupController::new(data_dir),
            config,
            cluster,
            spenders,
            miner,
        })
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn cluster_mut(&mut self) -> &mut Cluster {
        &mut self.cluster
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn backups(&self) -> &BackupController {
        &self.backups
    }

    pub fn spenders(&self) -> &[NodeIndex] {
        &self.spenders
    }

    pub fn miner(&self) -> NodeIndex {
        self.miner
    }

    /// Play the whole scenario. Any error ends it.
    pub async fn run(&mut self) -> Result<ScenarioReport, HarnessError> {
        info!(
            "starting scenario with {} spenders, seed {}",
            self.spenders.len(),
            self.config.seed
        );
        self.bring_up().await?;
        self.generate_initial_coins().await?;
        self.play_rounds(self.config.rounds_before_checkpoint).await?;
        self.capture_checkpoint().await?;
        self.play_rounds(self.config.rounds_after_checkpoint).await?;
        let tip = self.mature_and_reconcile().await?;

        let mut recovered = BTreeMap::new();
        for path in RecoveryPath::iter() {
            recovered.insert(path, self.destroy_and_recover(path).await?);
        }

        let balances = self.cluster.balances().await?;
        let report = ScenarioReport {
            seed: self.config.seed,
            spender_sum: self.spenders.iter().filter_map(|n| balances.get(n)).sum(),
            balances,
            fee_total: self.ledger.fee_total(),
            transactions_sent: self
                .ledger
                .records()
                .iter()
                .filter(|r| !r.is_skipped())
                .count(),
            matured_blocks: self.ledger.matured_block_count(tip.height),
            tip,
            recovered,
        };
        self.cluster.stop_all().await?;
        info!("scenario passed");
        Ok(report)
    }

    /// Start every node and link them in a chain.
    pub async fn bring_up(&mut self) -> Result<(), HarnessError> {
        self.cluster.start_all().await?;
        self.cluster.connect_chain().await?;
        let tip = self.cluster.barrier_chain().await?;
        info!("{} node(s) up at {tip}", self.cluster.indices().len());
        Ok(())
    }

    /// Each spender mines one block, then the miner mines enough blocks for
    /// those to mature.
    pub async fn generate_initial_coins(&mut self) -> Result<BestBlock, HarnessError> {
        for &spender in &self.spenders {
            let tip = self.cluster.node(spender)?.mine_blocks(1).await?;
            self.ledger.record_coinbase(spender, tip.height)?;
            self.cluster.barrier_chain().await?;
        }

        let maturity = self.ledger.network().coinbase_maturity();
        let miner = self.cluster.node(self.miner)?;
        let first = miner.best_block().await?.height + 1;
        let tip = miner
            .mine_blocks(u32::try_from(maturity).unwrap_or(u32::MAX))
            .await?;
        self.ledger.record_coinbases(self.miner, first, tip.height)?;
        let tip = self.cluster.barrier_chain().await?;

        let balances = self.cluster.balances().await?;
        self.ledger.reconcile(&balances, tip.height, "initial coins")?;
        info!("initial coins mature at {tip}");
        Ok(tip)
    }

    pub async fn play_rounds(&mut self, num_rounds: u32) -> Result<(), HarnessError> {
        for _ in 0..num_rounds {
            let round = self
                .rounds
                .play(&self.cluster, &self.spenders, self.miner)
                .await?;
            for record in round.records {
                self.ledger.record(record);
            }
            self.ledger.record_coinbase(round.miner, round.block.height)?;
        }
        Ok(())
    }

    /// Back up and export every spender's wallet once the cluster agrees on
    /// the tip.
    pub async fn capture_checkpoint(&mut self) -> Result<(), HarnessError> {
        let tip = self.cluster.barrier_chain().await?;
        let balances = self.cluster.balances().await?;
        self.ledger
            .reconcile(&balances, tip.height, "checkpoint capture")?;

        self.backups
            .capture(&self.cluster, CHECKPOINT_NAME, &self.spenders)
            .await
    }

    /// Mine `maturity + 1` blocks on a synchronized mempool, then check every
    /// balance, both ledger invariants, and settle the checkpoints.
    pub async fn mature_and_reconcile(&mut self) -> Result<BestBlock, HarnessError> {
        let synced = self.cluster.barrier_mempool().await?;
        let num_blocks = self.ledger.network().coinbase_maturity() + 1;
        let miner = self.cluster.node(self.miner)?;
        let first = miner.best_block().await?.height + 1;
        let tip = self
            .cluster
            .mine_after_barrier(
                self.miner,
                synced,
                u32::try_from(num_blocks).unwrap_or(u32::MAX),
            )
            .await?;
        self.ledger.record_coinbases(self.miner, first, tip.height)?;

        let tip = self.cluster.barrier_chain().await?;
        let balances = self.cluster.balances().await?;
        self.ledger.reconcile(&balances, tip.height, "after maturity")?;
        self.ledger.check_fee_zero_sum(tip.height)?;
        self.ledger.check_total_supply(&balances, tip.height)?;

        let settled: BTreeMap<_, _> = balances
            .into_iter()
            .filter(|(node, _)| self.spenders.contains(node))
            .collect();
        self.backups.settle(&settled)?;
        info!(
            "all balances reconciled at {tip}, fee total {}",
            self.ledger.fee_total()
        );
        Ok(tip)
    }

    /// Destroy the spenders' wallets (and the resync node's chain), recover
    /// them through `path`, and reconcile the whole cluster again.
    pub async fn destroy_and_recover(
        &mut self,
        path: RecoveryPath,
    ) -> Result<BTreeMap<NodeIndex, CoinAmount>, HarnessError> {
        self.destroy().await?;
        self.recover(path).await
    }

    /// Stop the cluster and remove what the configured destruction plan
    /// names.
    pub async fn destroy(&mut self) -> Result<(), HarnessError> {
        let plan = DestructionPlan {
            chain_resync: self.config.chain_resync,
        };
        self.backups.destroy(&mut self.cluster, plan).await
    }

    /// Recover every destroyed wallet through `path` and reconcile.
    pub async fn recover(
        &mut self,
        path: RecoveryPath,
    ) -> Result<BTreeMap<NodeIndex, CoinAmount>, HarnessError> {
        let recovered = self.backups.recover(&mut self.cluster, path).await?;

        let tip = self.cluster.barrier_chain().await?;
        let balances = self.cluster.balances().await?;
        self.ledger
            .reconcile(&balances, tip.height, &format!("after recovery {path}"))?;
        Ok(recovered)
    }
}
