use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use tracing::debug;
use tracing::info;

use crate::cluster::Cluster;
use crate::error::HarnessError;
use crate::models::coin_amount::CoinAmount;
use crate::models::node::BestBlock;
use crate::models::node::NodeIndex;
use crate::models::transaction_record::TransactionRecord;

/// Smallest and largest send, in tenths of a coin.
pub const MIN_SEND_TENTHS: u32 = 1;
pub const MAX_SEND_TENTHS: u32 = 10;

/// The result of one round: a record per ordered spender pair, and the
/// block that confirmed them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Round {
    pub number: u32,
    pub records: Vec<TransactionRecord>,
    pub block: BestBlock,
    pub miner: NodeIndex,
}

impl Round {
    pub fn sent(&self) -> impl Iterator<Item = &TransactionRecord> {
        self.records.iter().filter(|r| !r.is_skipped())
    }
}

/// Plays rounds of random payments between spenders.
///
/// Which pairs send and how much is drawn from a seeded generator, so the
/// shape of a run can be replayed. What the nodes make of it (fees, coin
/// selection) is up to them.
#[derive(Debug)]
pub struct RoundGenerator {
    rng: StdRng,
    seed: u64,
    send_probability: f64,
    rounds_played: u32,
}

impl RoundGenerator {
    pub fn new(seed: u64, send_probability: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
            send_probability: send_probability.clamp(0.0, 1.0),
            rounds_played: 0,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rounds_played(&self) -> u32 {
        self.rounds_played
    }

    /// Decide whether the next pair sends, and how much.
    pub fn draw_send(&mut self) -> Option<CoinAmount> {
        if !self.rng.random_bool(self.send_probability) {
            return None;
        }
        let tenths = self.rng.random_range(MIN_SEND_TENTHS..=MAX_SEND_TENTHS);
        Some(CoinAmount::tenths(tenths))
    }

    /// Play one round: a fresh address per spender, a coin flip per ordered
    /// pair, a mempool barrier, and one block by `miner`.
    pub async fn play(
        &mut self,
        cluster: &Cluster,
        spenders: &[NodeIndex],
        miner: NodeIndex,
    ) -> Result<Round, HarnessError> {
        let number = self.rounds_played + 1;

        let mut addresses = BTreeMap::new();
        for &spender in spenders {
            addresses.insert(spender, cluster.node(spender)?.new_address().await?);
        }

        let mut records = Vec::with_capacity(spenders.len() * spenders.len().saturating_sub(1));
        for &from in spenders {
            for (&to, address) in addresses.iter().filter(|(to, _)| **to != from) {
                let record = match self.draw_send() {
                    Some(amount) => {
                        let payment = cluster.node(from)?.pay(address, amount).await?;
                        TransactionRecord::sent(from, to, amount, payment.fee, payment.txid)
                    }
                    None => TransactionRecord::skipped(from, to),
                };
                records.push(record);
            }
        }

        let synced = cluster.barrier_mempool().await?;
        if let Some(missing) = records
            .iter()
            .filter_map(|r| r.txid.as_ref())
            .find(|txid| !synced.txids().contains(*txid))
        {
            return Err(HarnessError::Failed(format!(
                "round {number}: {missing} did not reach the mempools"
            )));
        }
        let block = cluster.mine_after_barrier(miner, synced, 1).await?;

        let records: Vec<_> = records
            .into_iter()
            .map(|r| r.confirmed_in(block.height))
            .collect();
        let sent = records.iter().filter(|r| !r.is_skipped()).count();
        debug!("round {number} records: {records:?}");
        info!(
            "round {number}: {sent} of {} sends confirmed at {block}",
            records.len()
        );

        self.rounds_played = number;
        Ok(Round {
            number,
            records,
            block,
            miner,
        })
    }
}
