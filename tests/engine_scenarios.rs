//! Control-loop scenarios driven against the simulated chain and workers

use maya::config::{EngineConfig, SupervisorConfig, TreasuryConfig};
use maya::coordination::{GracefulShutdown, ShutdownPhase, ShutdownSignal};
use maya::coordinator::OrchestrationEngine;
use maya::domain::{BalanceSource, Proposal, ProposalStatus, WorkerState};
use maya::ledger::{seeded_ledger, LedgerStore, ProposalLedger};
use maya::oracle::{BalanceOracle, SimulatedChain};
use maya::supervisor::{SimulatedRuntime, WorkerSupervisor};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

struct World {
    chain: Arc<SimulatedChain>,
    runtime: Arc<SimulatedRuntime>,
    engine: Arc<OrchestrationEngine>,
}

fn world(balance: Decimal, ledger: ProposalLedger) -> World {
    world_with_store(balance, ledger, None)
}

fn world_with_store(balance: Decimal, ledger: ProposalLedger, store: Option<LedgerStore>) -> World {
    let chain = Arc::new(SimulatedChain::new(balance));
    let runtime = Arc::new(SimulatedRuntime::new());

    let oracle = Arc::new(BalanceOracle::new(
        chain.clone(),
        TreasuryConfig {
            fetch_timeout_ms: 100,
            ..TreasuryConfig::default()
        },
    ));
    let supervisor = Arc::new(WorkerSupervisor::new(
        runtime.clone(),
        SupervisorConfig {
            startup_timeout_ms: 200,
            health_poll_interval_ms: 10,
            probe_timeout_ms: 50,
            stop_grace_ms: 20,
        },
    ));

    let mut engine = OrchestrationEngine::new(
        EngineConfig {
            tick_interval_ms: 25,
            min_reserve: dec!(0.01),
            max_unreachable_ticks: 3,
            require_live_balance: false,
        },
        ledger,
        oracle,
        supervisor,
    );
    if let Some(store) = store {
        engine = engine.with_store(store);
    }

    World {
        chain,
        runtime,
        engine: Arc::new(engine),
    }
}

fn ledger_of(proposals: Vec<Proposal>) -> ProposalLedger {
    let mut ledger = ProposalLedger::new();
    for proposal in proposals {
        ledger.submit(proposal).unwrap();
    }
    ledger
}

#[tokio::test]
async fn free_proposal_is_funded_with_running_worker_after_one_tick() {
    let w = world(dec!(0), ProposalLedger::new());
    w.engine
        .submit(Proposal::new("p1", "A-01", "faucet claims", dec!(0), dec!(0.1)))
        .await
        .unwrap();

    w.engine.tick().await;

    assert_eq!(
        w.engine.proposal("p1").await.unwrap().status,
        ProposalStatus::Funded
    );
    let handle = w.engine.supervisor().handle("A-01").await.unwrap();
    assert_eq!(handle.state, WorkerState::Running);
    assert!(handle.last_heartbeat_at.is_some());
}

#[tokio::test]
async fn paid_proposal_waits_for_reserve_then_funds_within_one_tick() {
    let w = world(
        dec!(0.0012),
        ledger_of(vec![Proposal::new("p2", "A-13", "dex liquidity", dec!(0.05), dec!(0.5))]),
    );

    for _ in 0..4 {
        let report = w.engine.tick().await;
        assert_eq!(report.treasury.source, BalanceSource::Live);
        assert_eq!(report.balance_locked, vec!["p2".to_string()]);
        assert!(report.started.is_empty());
    }
    let proposal = w.engine.proposal("p2").await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Pending);
    assert!(proposal.balance_locked);
    assert!(w.engine.supervisor().handle("A-13").await.is_none());
    assert_eq!(w.runtime.spawn_count("A-13"), 0);

    w.chain.set_balance(dec!(0.2)).await;
    let report = w.engine.tick().await;

    assert_eq!(report.funded, vec!["p2".to_string()]);
    let proposal = w.engine.proposal("p2").await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Funded);
    assert!(!proposal.balance_locked);
}

#[tokio::test]
async fn reserve_boundary_is_exclusive() {
    let w = world(
        dec!(0.01),
        ledger_of(vec![Proposal::new("p2", "A-13", "dex liquidity", dec!(0.05), dec!(0.5))]),
    );

    let report = w.engine.tick().await;
    assert_eq!(report.balance_locked, vec!["p2".to_string()]);
}

#[tokio::test]
async fn unreachable_funded_worker_is_stopped_after_three_ticks() {
    let w = world(
        dec!(0),
        ledger_of(vec![Proposal::new("p1", "A-01", "faucet claims", dec!(0), dec!(0.1))]),
    );
    w.engine.tick().await;
    assert_eq!(w.runtime.live_workers("A-01"), 1);

    w.runtime.set_healthy("A-01", false);

    for expected in 1..=2u32 {
        let report = w.engine.tick().await;
        assert_eq!(report.unreachable, vec!["A-01".to_string()]);
        assert!(report.escalated.is_empty());
        let snapshot = w.engine.snapshot().await;
        let agent = snapshot.agent("A-01").unwrap();
        assert_eq!(agent.consecutive_unreachable, expected);
        assert_eq!(agent.worker_state, WorkerState::Unreachable);
        assert!(!agent.failed);
    }

    let report = w.engine.tick().await;
    assert_eq!(report.escalated, vec!["A-01".to_string()]);

    // Funding is not rolled back
    assert_eq!(
        w.engine.proposal("p1").await.unwrap().status,
        ProposalStatus::Funded
    );
    let snapshot = w.engine.snapshot().await;
    let agent = snapshot.agent("A-01").unwrap();
    assert!(agent.failed);
    assert!(agent.failure_reason.is_some());
    assert_eq!(agent.worker_state, WorkerState::Stopped);
    assert_eq!(snapshot.failed_agents(), vec!["A-01"]);
    assert_eq!(w.runtime.live_workers("A-01"), 0);

    // A failed agent is not restarted
    w.runtime.set_healthy("A-01", true);
    w.engine.tick().await;
    assert_eq!(w.runtime.spawn_count("A-01"), 1);
}

#[tokio::test]
async fn recovery_resets_unreachable_count() {
    let w = world(
        dec!(0),
        ledger_of(vec![Proposal::new("p1", "A-01", "faucet claims", dec!(0), dec!(0.1))]),
    );
    w.engine.tick().await;

    w.runtime.set_healthy("A-01", false);
    w.engine.tick().await;
    w.engine.tick().await;

    w.runtime.set_healthy("A-01", true);
    let report = w.engine.tick().await;
    assert!(report.unreachable.is_empty());

    w.runtime.set_healthy("A-01", false);
    w.engine.tick().await;
    w.engine.tick().await;

    let snapshot = w.engine.snapshot().await;
    let agent = snapshot.agent("A-01").unwrap();
    assert_eq!(agent.consecutive_unreachable, 2);
    assert!(!agent.failed);
    assert_eq!(w.runtime.live_workers("A-01"), 1);
}

#[tokio::test]
async fn chain_outage_serves_cached_balance() {
    let w = world(dec!(0.5), seeded_ledger());

    let first = w.engine.tick().await;
    assert_eq!(first.treasury.source, BalanceSource::Live);

    w.chain.set_reachable(false);
    let second = w.engine.tick().await;
    assert_eq!(second.treasury.source, BalanceSource::Cached);
    assert_eq!(second.treasury.balance, dec!(0.5));
    assert_eq!(second.treasury.observed_at, first.treasury.observed_at);
}

#[tokio::test]
async fn slow_chain_does_not_stall_the_tick() {
    let w = world(
        dec!(0.5),
        ledger_of(vec![Proposal::new("p1", "A-01", "faucet claims", dec!(0), dec!(0.1))]),
    );
    w.chain.set_latency(Duration::from_secs(10)).await;

    let report = tokio::time::timeout(Duration::from_secs(2), w.engine.tick())
        .await
        .expect("tick bounded by the fetch timeout");

    assert_eq!(report.treasury.source, BalanceSource::Simulated);
    assert_eq!(report.funded, vec!["p1".to_string()]);
}

#[tokio::test]
async fn seeded_ledger_funds_free_agent_and_locks_paid_one() {
    let w = world(dec!(0.0012), seeded_ledger());

    w.engine.tick().await;

    assert_eq!(
        w.engine.proposal("prop_001").await.unwrap().status,
        ProposalStatus::Funded
    );
    assert_eq!(
        w.engine.proposal("prop_002").await.unwrap().status,
        ProposalStatus::Pending
    );
    let snapshot = w.engine.snapshot().await;
    assert_eq!(snapshot.balance_locked, vec!["prop_002".to_string()]);
}

#[tokio::test]
async fn shutdown_stops_every_worker_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let store = LedgerStore::new(dir.path().join("ledger.json"));
    let w = world_with_store(
        dec!(1),
        ledger_of(vec![
            Proposal::new("p1", "A-01", "faucet claims", dec!(0), dec!(0.1)),
            Proposal::new("p2", "A-13", "dex liquidity", dec!(0.05), dec!(0.5)),
        ]),
        Some(store.clone()),
    );

    let shutdown = Arc::new(GracefulShutdown::new());
    let runner = {
        let engine = w.engine.clone();
        let token = shutdown.token();
        tokio::spawn(async move { engine.run(token).await })
    };

    // Wait for both workers to be funded by the loop
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let funded = w.engine.snapshot().await.proposals.funded;
            if funded == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown.request_shutdown(ShutdownSignal::Graceful);
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    for handle in w.engine.supervisor().handles().await {
        assert_eq!(handle.state, WorkerState::Stopped, "{}", handle.agent_id);
    }
    assert_eq!(w.runtime.live_workers("A-01"), 0);
    assert_eq!(w.runtime.live_workers("A-13"), 0);

    let reloaded = store.load().await.unwrap().unwrap();
    assert_eq!(reloaded.get("p1").unwrap().status, ProposalStatus::Funded);
    assert_eq!(reloaded.get("p2").unwrap().status, ProposalStatus::Funded);
}

#[tokio::test]
async fn reloaded_ledger_keeps_terminal_decisions() {
    let dir = tempfile::tempdir().unwrap();
    let store = LedgerStore::new(dir.path().join("ledger.json"));

    let w = world_with_store(dec!(0), seeded_ledger(), Some(store.clone()));
    w.engine.reject("prop_002").await.unwrap();
    w.engine.tick().await;

    let reloaded = store.load().await.unwrap().unwrap();
    let w2 = world(dec!(1), reloaded);
    w2.engine.tick().await;

    assert_eq!(
        w2.engine.proposal("prop_002").await.unwrap().status,
        ProposalStatus::Rejected
    );
    assert_eq!(
        w2.engine.proposal("prop_001").await.unwrap().status,
        ProposalStatus::Funded
    );
    // Funds are available now, but a rejection is final
    assert_eq!(w2.runtime.spawn_count("A-13"), 0);
}
