mod common;

use common::logging;
use common::sim_cluster::default_args;
use common::sim_cluster::sim_scenario;
use num_traits::CheckedSub;
use num_traits::Zero;
use walletcheck::error::HarnessError;
use walletcheck::models::coin_amount::CoinAmount;
use walletcheck::models::node::NodeIndex;
use walletcheck::recovery::checkpoint::ArtifactKind;
use walletcheck::recovery::NodeRecoveryState;
use walletcheck::recovery::RecoveryPath;

/// test: the whole scenario with three spenders and ten rounds.
///
/// scenario:
/// 1. spenders mine one block each, the miner mines 100 more.
/// 2. five rounds, checkpoint, five more rounds.
/// 3. the miner mines 101 blocks so every round block matures.
/// 4. wallets are destroyed and recovered from backups, then from exports.
///
/// 114 coinbases of 50 coins are mature at the end, and the fees the
/// spenders paid all went to the miner.
#[tokio::test(flavor = "multi_thread")]
pub async fn full_scenario_reconciles_every_balance() -> anyhow::Result<()> {
    logging::tracing_logger();

    let report = walletcheck::initialize(default_args(7)).await?;

    assert_eq!(7, report.seed);
    assert_eq!(214, report.tip.height);
    assert_eq!(114, report.matured_blocks);

    let total: CoinAmount = report.balances.values().sum();
    assert_eq!(CoinAmount::coins(5700), total);
    assert_eq!(
        CoinAmount::coins(150).checked_sub(&report.fee_total),
        Some(report.spender_sum)
    );
    assert_eq!(
        CoinAmount::coins(5550) + report.fee_total,
        report.balances[&NodeIndex(3)]
    );

    let from_backup = &report.recovered[&RecoveryPath::FromBinaryBackup];
    let from_export = &report.recovered[&RecoveryPath::FromExport];
    assert_eq!(from_backup, from_export);
    for (node, balance) in from_backup {
        assert_eq!(report.balances[node], *balance);
    }

    Ok(())
}

/// test: the totals hold whatever sends the rounds draw.
#[tokio::test(flavor = "multi_thread")]
pub async fn totals_hold_across_seeds() -> anyhow::Result<()> {
    logging::tracing_logger();

    for seed in [1, 2, 3] {
        let mut args = default_args(seed);
        args.spenders = 2;
        args.rounds_before_checkpoint = 2;
        args.rounds_after_checkpoint = 3;
        args.resync_node = 1;
        args.send_probability = 0.9;

        let report = walletcheck::initialize(args).await?;
        let matured = u32::try_from(report.matured_blocks)?;
        let total: CoinAmount = report.balances.values().sum();
        assert_eq!(CoinAmount::coins(50).scalar_mul(matured), total, "seed {seed}");
        assert_eq!(
            CoinAmount::coins(100).checked_sub(&report.fee_total),
            Some(report.spender_sum),
            "seed {seed}"
        );
    }

    Ok(())
}

/// test: each stage of the recovery cycle leaves the states and balances
/// it should.
#[tokio::test(flavor = "multi_thread")]
pub async fn destroyed_wallets_are_empty_until_recovered() -> anyhow::Result<()> {
    logging::tracing_logger();

    let mut args = default_args(11);
    args.resync_node = 1;
    let mut scenario = sim_scenario(&args)?;
    let spenders = scenario.spenders().to_vec();

    scenario.bring_up().await?;
    scenario.generate_initial_coins().await?;
    scenario.play_rounds(2).await?;
    scenario.capture_checkpoint().await?;
    for &spender in &spenders {
        assert_eq!(NodeRecoveryState::Checkpointed, scenario.backups().state(spender));
    }

    scenario.play_rounds(2).await?;
    scenario.mature_and_reconcile().await?;
    let settled = scenario.cluster().balances().await?;

    scenario.destroy().await?;
    for &spender in &spenders {
        assert!(!scenario.cluster().node(spender)?.has_wallet_store());
        assert_eq!(NodeRecoveryState::Destroyed, scenario.backups().state(spender));
    }
    assert!(!scenario.cluster().node(NodeIndex(1))?.has_chain_store());
    assert!(scenario.cluster().node(NodeIndex(0))?.has_chain_store());

    // a fresh wallet knows none of the old keys
    let cluster = scenario.cluster_mut();
    cluster.start_all().await?;
    cluster.reconnect().await?;
    cluster.barrier_chain().await?;
    for &spender in &spenders {
        assert!(cluster.node(spender)?.balance().await?.is_zero());
    }
    cluster.stop_all().await?;
    for &spender in &spenders {
        cluster.node(spender)?.wipe_wallet().await?;
    }

    let recovered = scenario.recover(RecoveryPath::FromExport).await?;
    for &spender in &spenders {
        assert_eq!(settled[&spender], recovered[&spender]);
        assert_eq!(NodeRecoveryState::Recovered, scenario.backups().state(spender));
    }

    let again = scenario.destroy_and_recover(RecoveryPath::FromBinaryBackup).await?;
    assert_eq!(recovered, again);

    scenario.cluster_mut().stop_all().await?;
    Ok(())
}

/// test: a checkpoint cannot be captured twice for the same wallets.
#[tokio::test(flavor = "multi_thread")]
pub async fn second_capture_is_rejected() -> anyhow::Result<()> {
    logging::tracing_logger();

    let mut scenario = sim_scenario(&default_args(5))?;
    scenario.bring_up().await?;
    scenario.generate_initial_coins().await?;
    scenario.capture_checkpoint().await?;

    let result = scenario.capture_checkpoint().await;
    assert!(matches!(
        result,
        Err(HarnessError::InvalidTransition { .. })
    ));

    scenario.cluster_mut().stop_all().await?;
    Ok(())
}

/// test: destruction is refused before the checkpoint is settled, and a
/// missing artifact stops recovery before any node is touched.
#[tokio::test(flavor = "multi_thread")]
pub async fn recovery_requires_settled_checkpoints_and_artifacts() -> anyhow::Result<()> {
    logging::tracing_logger();

    let mut scenario = sim_scenario(&default_args(9))?;
    scenario.bring_up().await?;
    scenario.generate_initial_coins().await?;
    scenario.play_rounds(1).await?;
    scenario.capture_checkpoint().await?;

    let result = scenario.destroy().await;
    assert!(matches!(result, Err(HarnessError::Failed(_))));

    scenario.mature_and_reconcile().await?;
    scenario.destroy().await?;

    let backup = scenario
        .backups()
        .checkpoint(NodeIndex(0))
        .map(|c| c.artifact_path(ArtifactKind::Backup).to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("node0 has no checkpoint"))?;
    tokio::fs::remove_file(&backup).await?;

    let result = scenario.recover(RecoveryPath::FromBinaryBackup).await;
    let Err(HarnessError::ArtifactMissing { node, kind, .. }) = result else {
        panic!("expected a missing artifact, got {result:?}");
    };
    assert_eq!(NodeIndex(0), node);
    assert_eq!(ArtifactKind::Backup, kind);
    assert!(scenario.cluster().nodes().all(|n| !n.is_running()));

    Ok(())
}
