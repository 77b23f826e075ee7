//! The balance oracle.
//!
//! Folds every transaction record and every mined block of a run and
//! predicts, for any tip height, what each node's balance must be:
//!
//! ```text
//! expected_balance(n, tip) =   matured coinbase rewards of n
//!                            + amounts received by n in blocks at or below tip
//!                            - amounts sent by n
//!                            - fees paid by n
//! ```
//!
//! where the reward of a block is its subsidy plus the fees of the records
//! it confirmed, and a block at height `h` is matured once
//! `h + coinbase_maturity <= tip`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::debug;

use crate::config_models::network::Network;
use crate::error::HarnessError;
use crate::models::coin_amount::CoinAmount;
use crate::models::node::BlockHeight;
use crate::models::node::NodeIndex;
use crate::models::transaction_record::CoinbaseEvent;
use crate::models::transaction_record::TransactionRecord;

#[derive(Debug, Clone)]
pub struct Ledger {
    network: Network,
    records: Vec<TransactionRecord>,
    coinbases: BTreeMap<BlockHeight, CoinbaseEvent>,
    sent: BTreeMap<NodeIndex, CoinAmount>,
    fees_paid: BTreeMap<NodeIndex, CoinAmount>,
    fees_by_height: BTreeMap<BlockHeight, CoinAmount>,
}

impl Ledger {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            records: vec![],
            coinbases: BTreeMap::new(),
            sent: BTreeMap::new(),
            fees_paid: BTreeMap::new(),
            fees_by_height: BTreeMap::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    pub fn coinbases(&self) -> impl Iterator<Item = &CoinbaseEvent> {
        self.coinbases.values()
    }

    /// Fold one transaction record. Skipped sends change nothing but are
    /// kept so every round has the same shape.
    pub fn record(&mut self, record: TransactionRecord) {
        if !record.is_skipped() {
            *self.sent.entry(record.from).or_default() += record.amount;
            *self.fees_paid.entry(record.from).or_default() += record.fee;
            if let Some(height) = record.block_height {
                *self.fees_by_height.entry(height).or_default() += record.fee;
            }
        }
        self.records.push(record);
    }

    /// Note that `miner` mined the block at `height`.
    pub fn record_coinbase(
        &mut self,
        miner: NodeIndex,
        height: BlockHeight,
    ) -> Result<CoinbaseEvent, HarnessError> {
        if let Some(existing) = self.coinbases.get(&height) {
            return Err(HarnessError::Failed(format!(
                "block at height {height} already recorded as mined by {}",
                existing.miner
            )));
        }
        let event = CoinbaseEvent {
            miner,
            height,
            subsidy: self.network.block_subsidy(height),
        };
        self.coinbases.insert(height, event);
        Ok(event)
    }

    /// Note that `miner` mined every block from `first` to `last`.
    pub fn record_coinbases(
        &mut self,
        miner: NodeIndex,
        first: BlockHeight,
        last: BlockHeight,
    ) -> Result<(), HarnessError> {
        for height in first..=last {
            self.record_coinbase(miner, height)?;
        }
        Ok(())
    }

    fn is_matured(&self, height: BlockHeight, tip: BlockHeight) -> bool {
        height + self.network.coinbase_maturity() <= tip
    }

    fn matured_coinbases(&self, tip: BlockHeight) -> impl Iterator<Item = &CoinbaseEvent> {
        self.coinbases
            .values()
            .take_while(move |c| self.is_matured(c.height, tip))
    }

    fn fees_in_block(&self, height: BlockHeight) -> CoinAmount {
        self.fees_by_height
            .get(&height)
            .copied()
            .unwrap_or_default()
    }

    /// Everything `node` sent, fees excluded.
    pub fn sent(&self, node: NodeIndex) -> CoinAmount {
        self.sent.get(&node).copied().unwrap_or_default()
    }

    /// Everything `node` paid in fees.
    pub fn fees_paid(&self, node: NodeIndex) -> CoinAmount {
        self.fees_paid.get(&node).copied().unwrap_or_default()
    }

    /// Everything `node` received in blocks at or below `tip`.
    pub fn received(&self, node: NodeIndex, tip: BlockHeight) -> CoinAmount {
        self.records
            .iter()
            .filter(|r| r.to == node && r.block_height.is_some_and(|h| h <= tip))
            .map(|r| r.amount)
            .sum()
    }

    /// Fees `node` collected through its matured blocks.
    pub fn matured_fee_income(&self, node: NodeIndex, tip: BlockHeight) -> CoinAmount {
        self.matured_coinbases(tip)
            .filter(|c| c.miner == node)
            .map(|c| self.fees_in_block(c.height))
            .sum()
    }

    /// Subsidy plus fees of the matured blocks of `node`.
    pub fn matured_rewards(&self, node: NodeIndex, tip: BlockHeight) -> CoinAmount {
        self.matured_coinbases(tip)
            .filter(|c| c.miner == node)
            .map(|c| c.subsidy + self.fees_in_block(c.height))
            .sum()
    }

    pub fn expected_balance(&self, node: NodeIndex, tip: BlockHeight) -> CoinAmount {
        self.matured_rewards(node, tip) + self.received(node, tip)
            + -(self.sent(node) + self.fees_paid(node))
    }

    pub fn expected_total(&self, nodes: &[NodeIndex], tip: BlockHeight) -> CoinAmount {
        nodes
            .iter()
            .map(|&node| self.expected_balance(node, tip))
            .sum()
    }

    pub fn matured_block_count(&self, tip: BlockHeight) -> usize {
        self.matured_coinbases(tip).count()
    }

    pub fn matured_subsidy(&self, tip: BlockHeight) -> CoinAmount {
        self.matured_coinbases(tip).map(|c| c.subsidy).sum()
    }

    /// All fees paid by all nodes.
    pub fn fee_total(&self) -> CoinAmount {
        self.fees_paid.values().sum()
    }

    /// Compare every observed balance against its prediction. Fails on the
    /// first node, in index order, that differs.
    pub fn reconcile(
        &self,
        observed: &BTreeMap<NodeIndex, CoinAmount>,
        tip: BlockHeight,
        context: &str,
    ) -> Result<(), HarnessError> {
        for (&node, &actual) in observed {
            let expected = self.expected_balance(node, tip);
            if expected != actual {
                return Err(HarnessError::BalanceMismatch {
                    context: context.to_string(),
                    node,
                    expected,
                    actual,
                });
            }
        }
        debug!("{context}: {} balance(s) reconciled at height {tip}", observed.len());
        Ok(())
    }

    /// Fees paid must reappear as fee income of matured blocks.
    pub fn check_fee_zero_sum(&self, tip: BlockHeight) -> Result<(), HarnessError> {
        let expected = self.fee_total();
        let actual: CoinAmount = self
            .coinbases
            .values()
            .map(|c| c.miner)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|miner| self.matured_fee_income(miner, tip))
            .sum();
        if expected != actual {
            return Err(HarnessError::InvariantViolated {
                invariant: "fee zero-sum",
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// The observed balances must add up to the subsidy of the matured
    /// blocks: payments and fees only move coins around.
    pub fn check_total_supply(
        &self,
        observed: &BTreeMap<NodeIndex, CoinAmount>,
        tip: BlockHeight,
    ) -> Result<(), HarnessError> {
        let expected = self.matured_subsidy(tip);
        let actual: CoinAmount = observed.values().sum();
        if expected != actual {
            return Err(HarnessError::InvariantViolated {
                invariant: "total supply",
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Expected balance of every node the ledger knows about.
    pub fn expected_balances(&self, tip: BlockHeight) -> BTreeMap<NodeIndex, CoinAmount> {
        let mut nodes: Vec<NodeIndex> = self.coinbases.values().map(|c| c.miner).collect();
        nodes.extend(self.records.iter().flat_map(|r| [r.from, r.to]));
        nodes.sort();
        nodes.dedup();
        nodes
            .into_iter()
            .map(|node| (node, self.expected_balance(node, tip)))
            .collect()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use num_traits::Zero;
    use proptest::collection::vec;
    use proptest::prop_assert_eq;
    use test_strategy::proptest;
    use test_strategy::Arbitrary;

    use super::*;
    use crate::models::node::TxId;

    const SPENDERS: usize = 3;
    const MINER: NodeIndex = NodeIndex(3);

    /// A send between two distinct spenders.
    #[derive(Debug, Clone, Arbitrary)]
    struct RandomSend {
        #[strategy(0..SPENDERS)]
        from: usize,
        #[strategy(1..SPENDERS)]
        offset: usize,
        #[strategy(1u32..=10)]
        tenths: u32,
        #[strategy(1i64..=30_000)]
        fee_units: i64,
    }

    /// Mines the initial coins the way the scenario does: one block per
    /// spender, then `maturity` blocks by the miner.
    fn initial_ledger() -> (Ledger, BlockHeight) {
        let mut ledger = Ledger::new(Network::RegTest);
        for i in 0..SPENDERS {
            ledger.record_coinbase(NodeIndex(i), i as u64 + 1).unwrap();
        }
        let first = SPENDERS as u64 + 1;
        let last = first + ledger.network().coinbase_maturity() - 1;
        ledger.record_coinbases(MINER, first, last).unwrap();
        (ledger, last)
    }

    /// Plays `rounds` and then the maturity blocks. Returns the final tip.
    fn play(ledger: &mut Ledger, mut tip: BlockHeight, rounds: &[Vec<RandomSend>]) -> BlockHeight {
        for (round, sends) in rounds.iter().enumerate() {
            tip += 1;
            for (n, send) in sends.iter().enumerate() {
                let from = NodeIndex(send.from);
                let to = NodeIndex((send.from + send.offset) % SPENDERS);
                let record = TransactionRecord::sent(
                    from,
                    to,
                    CoinAmount::tenths(send.tenths),
                    CoinAmount::from_atomic_units(send.fee_units),
                    TxId(format!("{round}-{n}")),
                );
                ledger.record(record.confirmed_in(tip));
            }
            ledger.record_coinbase(MINER, tip).unwrap();
        }
        let first = tip + 1;
        tip += ledger.network().coinbase_maturity() + 1;
        ledger.record_coinbases(MINER, first, tip).unwrap();
        tip
    }

    fn all_nodes() -> Vec<NodeIndex> {
        (0..=SPENDERS).map(NodeIndex).collect()
    }

    #[test]
    fn initial_coins_mature_for_spenders_only() {
        let (ledger, tip) = initial_ledger();
        for i in 0..SPENDERS {
            assert_eq!(CoinAmount::coins(50), ledger.expected_balance(NodeIndex(i), tip));
        }
        assert_eq!(CoinAmount::zero(), ledger.expected_balance(MINER, tip));
        assert_eq!(SPENDERS, ledger.matured_block_count(tip));
    }

    #[test]
    fn received_amounts_count_only_once_confirmed() {
        let (mut ledger, tip) = initial_ledger();
        let record = TransactionRecord::sent(
            NodeIndex(0),
            NodeIndex(1),
            CoinAmount::tenths(5),
            CoinAmount::from_atomic_units(10_000),
            TxId("a".to_string()),
        );
        ledger.record(record.confirmed_in(tip + 1));

        assert_eq!(CoinAmount::coins(50), ledger.expected_balance(NodeIndex(1), tip));
        assert_eq!(
            CoinAmount::from_atomic_units(5_050_000_000),
            ledger.expected_balance(NodeIndex(1), tip + 1)
        );
        assert_eq!(
            CoinAmount::from_atomic_units(4_949_990_000),
            ledger.expected_balance(NodeIndex(0), tip + 1)
        );
    }

    #[test]
    fn fee_income_waits_for_maturity() {
        let (mut ledger, tip) = initial_ledger();
        let fee = CoinAmount::from_atomic_units(10_000);
        let record = TransactionRecord::sent(
            NodeIndex(0),
            NodeIndex(1),
            CoinAmount::tenths(1),
            fee,
            TxId("a".to_string()),
        );
        ledger.record(record.confirmed_in(tip + 1));
        ledger.record_coinbase(MINER, tip + 1).unwrap();

        let mature_at = tip + 1 + ledger.network().coinbase_maturity();
        assert_eq!(CoinAmount::zero(), ledger.matured_fee_income(MINER, mature_at - 1));
        assert!(ledger.check_fee_zero_sum(mature_at - 1).is_err());
        assert_eq!(fee, ledger.matured_fee_income(MINER, mature_at));
        ledger.check_fee_zero_sum(mature_at).unwrap();
    }

    #[test]
    fn skipped_sends_change_nothing() {
        let (mut ledger, tip) = initial_ledger();
        let before = ledger.expected_balances(tip);
        ledger.record(TransactionRecord::skipped(NodeIndex(0), NodeIndex(1)));
        assert_eq!(before, ledger.expected_balances(tip));
        assert_eq!(CoinAmount::zero(), ledger.fee_total());
    }

    #[test]
    fn reconcile_names_first_differing_node() {
        let (ledger, tip) = initial_ledger();
        let mut observed = ledger.expected_balances(tip);
        observed.insert(NodeIndex(2), CoinAmount::coins(49));
        observed.insert(MINER, CoinAmount::coins(1));

        let Err(HarnessError::BalanceMismatch { node, expected, actual, .. }) =
            ledger.reconcile(&observed, tip, "test")
        else {
            panic!("expected a balance mismatch");
        };
        assert_eq!(NodeIndex(2), node);
        assert_eq!(CoinAmount::coins(50), expected);
        assert_eq!(CoinAmount::coins(49), actual);
    }

    #[test]
    fn duplicate_coinbase_height_is_refused() {
        let (mut ledger, tip) = initial_ledger();
        assert!(ledger.record_coinbase(NodeIndex(0), tip).is_err());

        let heights: Vec<_> = ledger.coinbases().map(|c| c.height).collect();
        assert_eq!((1..=tip).collect::<Vec<_>>(), heights);
        let spender_blocks = ledger
            .coinbases()
            .filter(|c| c.miner != MINER)
            .count();
        assert_eq!(SPENDERS, spender_blocks);
    }

    #[proptest]
    fn expected_balances_match_exact_integer_arithmetic(
        #[strategy(vec(vec(proptest::arbitrary::any::<RandomSend>(), 0..=6), 0..12))] rounds: Vec<Vec<RandomSend>>,
    ) {
        let (mut ledger, tip) = initial_ledger();
        let tip = play(&mut ledger, tip, &rounds);

        let mut units = [5_000_000_000i64; SPENDERS];
        let mut fee_units = 0i64;
        for send in rounds.iter().flatten() {
            let to = (send.from + send.offset) % SPENDERS;
            let amount = i64::from(send.tenths) * 10_000_000;
            units[send.from] -= amount + send.fee_units;
            units[to] += amount;
            fee_units += send.fee_units;
        }
        for (i, expected) in units.iter().enumerate() {
            prop_assert_eq!(
                CoinAmount::from_atomic_units(*expected),
                ledger.expected_balance(NodeIndex(i), tip)
            );
        }
        prop_assert_eq!(CoinAmount::from_atomic_units(fee_units), ledger.fee_total());
    }

    #[proptest]
    fn fees_sum_to_zero_for_any_run_length(
        #[strategy(vec(vec(proptest::arbitrary::any::<RandomSend>(), 0..=6), 0..12))] rounds: Vec<Vec<RandomSend>>,
    ) {
        let (mut ledger, tip) = initial_ledger();
        let tip = play(&mut ledger, tip, &rounds);
        prop_assert_eq!(Ok(()), ledger.check_fee_zero_sum(tip).map_err(|e| e.to_string()));
    }

    #[proptest]
    fn total_supply_is_independent_of_transactions(
        #[strategy(vec(vec(proptest::arbitrary::any::<RandomSend>(), 0..=6), 0..12))] rounds: Vec<Vec<RandomSend>>,
    ) {
        let (mut ledger, tip) = initial_ledger();
        let tip = play(&mut ledger, tip, &rounds);

        let observed: BTreeMap<_, _> = all_nodes()
            .into_iter()
            .map(|node| (node, ledger.expected_balance(node, tip)))
            .collect();
        prop_assert_eq!(
            Ok(()),
            ledger.check_total_supply(&observed, tip).map_err(|e| e.to_string())
        );

        let matured = ledger.matured_block_count(tip);
        prop_assert_eq!(SPENDERS + 100 + rounds.len() + 1, matured);
        prop_assert_eq!(
            CoinAmount::coins(50).scalar_mul(u32::try_from(matured).unwrap()),
            ledger.expected_total(&all_nodes(), tip)
        );
    }
}
